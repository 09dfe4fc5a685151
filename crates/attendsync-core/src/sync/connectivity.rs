use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::events::{EventBus, SyncEvent};

/// Something that can tell whether the server of record is reachable.
pub trait ConnectivityProbe: Send + Sync + 'static {
    fn probe(&self) -> impl Future<Output = bool> + Send;
}

/// Last known reachability of the server of record.
///
/// Clone is cheap; every clone observes the same state.
#[derive(Clone)]
pub struct Connectivity {
    tx: watch::Sender<bool>,
    events: EventBus,
}

impl Connectivity {
    pub fn new(online: bool, events: EventBus) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx, events }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Record a reachability observation. Only transitions are published.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(online, "Connectivity changed");
            self.events.emit(SyncEvent::ConnectivityChanged { online });
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Probe every `interval` until `shutdown` flips to true.
    pub fn spawn_probe<P: ConnectivityProbe>(
        &self,
        probe: P,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let connectivity = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let online = probe.probe().await;
                        debug!(online, "Connectivity probe");
                        connectivity.set_online(online);
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
