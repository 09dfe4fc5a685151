//! Single owner of "when to sync".
//!
//! One task receives every trigger: connectivity transitions, the periodic
//! timer, operator requests and shutdown. Coming back online is debounced
//! and re-checked before a pass starts.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::cache::CacheManager;
use crate::config::SyncConfig;

use super::engine::{Reconciler, SyncEngine, SyncSummary};

const COMMAND_BUFFER: usize = 16;

/// How long an idle debounce timer sleeps before it is armed.
const IDLE_SLEEP: Duration = Duration::from_secs(24 * 60 * 60);

enum Command {
    Sync { reply: oneshot::Sender<SyncSummary> },
    Tick,
    Shutdown { reply: oneshot::Sender<()> },
}

/// Sends triggers to a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Command>,
}

impl CoordinatorHandle {
    /// Operator-requested pass. `None` once the coordinator has stopped.
    pub async fn request_sync(&self) -> Option<SyncSummary> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Sync { reply }).await.ok()?;
        rx.await.ok()
    }

    /// Run the periodic check now.
    pub async fn tick(&self) {
        let _ = self.tx.send(Command::Tick).await;
    }

    /// Stop the coordinator after its quick cleanup has finished.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

pub struct SyncCoordinator<R> {
    engine: SyncEngine<R>,
    cache: Option<CacheManager>,
    debounce: Duration,
    periodic: Duration,
}

impl<R: Reconciler> SyncCoordinator<R> {
    pub fn new(engine: SyncEngine<R>, config: &SyncConfig) -> Self {
        Self {
            engine,
            cache: None,
            debounce: config.debounce(),
            periodic: config.periodic_interval(),
        }
    }

    /// Run the cache manager's quick cleanup on shutdown.
    pub fn with_cache_manager(mut self, cache: CacheManager) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn spawn(self) -> (CoordinatorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let online_rx = self.engine.connectivity().subscribe();
        let task = tokio::spawn(self.run(rx, online_rx));
        (CoordinatorHandle { tx }, task)
    }

    async fn run(self, mut rx: mpsc::Receiver<Command>, mut online_rx: watch::Receiver<bool>) {
        let mut periodic = tokio::time::interval_at(Instant::now() + self.periodic, self.periodic);
        periodic.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let debounce = tokio::time::sleep(IDLE_SLEEP);
        tokio::pin!(debounce);
        let mut armed = false;

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Sync { reply }) => {
                        let summary = self.engine.sync_now().await;
                        let _ = reply.send(summary);
                    }
                    Some(Command::Tick) => self.on_tick().await,
                    Some(Command::Shutdown { reply }) => {
                        self.on_shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.on_shutdown().await;
                        break;
                    }
                },
                Ok(()) = online_rx.changed() => {
                    let online = *online_rx.borrow_and_update();
                    if online {
                        debug!(debounce_ms = self.debounce.as_millis() as u64, "Back online, waiting before sync");
                        debounce.as_mut().reset(Instant::now() + self.debounce);
                        armed = true;
                    } else {
                        armed = false;
                    }
                }
                () = &mut debounce, if armed => {
                    armed = false;
                    if self.engine.connectivity().is_online() {
                        info!("Connection restored, syncing offline data");
                        self.engine.sync_pending().await;
                    }
                }
                _ = periodic.tick() => self.on_tick().await,
            }
        }
        debug!("Sync coordinator stopped");
    }

    async fn on_tick(&self) {
        if !self.engine.connectivity().is_online() {
            return;
        }
        let counts = self.engine.pending_counts().await;
        if counts.attendance + counts.forms > 0 {
            debug!(pending = counts.total(), "Periodic sync");
            self.engine.sync_pending().await;
        }
    }

    async fn on_shutdown(&self) {
        if let Some(cache) = &self.cache {
            if let Some(report) = cache.quick_cleanup().await {
                debug!(cleaned = report.total_cleaned(), "Shutdown cleanup finished");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::models::{now_millis, NewRecord, ScanData, ScanType};
    use crate::store::{StoreHandle, StoreOptions};
    use crate::sync::mock::MockServer;
    use crate::sync::Connectivity;

    fn scan() -> NewRecord {
        NewRecord::Attendance {
            scan_type: ScanType::Lrn,
            scan_data: ScanData {
                lrn: Some("123456789012".to_string()),
                subject_id: Some("5".to_string()),
                ..ScanData::default()
            },
            timestamp: now_millis(),
        }
    }

    fn setup(online: bool) -> (StoreHandle, Connectivity, MockServer, CoordinatorHandle) {
        let store = StoreHandle::in_memory(StoreOptions::default(), "test");
        let events = EventBus::default();
        let connectivity = Connectivity::new(online, events.clone());
        let server = MockServer::default();
        let config = SyncConfig::default();
        let engine = SyncEngine::new(store.clone(), server.clone(), events, connectivity.clone(), &config);
        let (handle, _task) = SyncCoordinator::new(engine, &config).spawn();
        (store, connectivity, server, handle)
    }

    async fn settle() {
        for _ in 0..100 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_going_online_is_debounced() {
        let (store, connectivity, server, _handle) = setup(false);
        store.add_record(scan()).await.expect("add");

        connectivity.set_online(true);
        settle().await;
        tokio::time::advance(Duration::from_millis(1500)).await;
        settle().await;
        assert_eq!(server.calls(), 0);

        tokio::time::advance(Duration::from_millis(600)).await;
        settle().await;
        assert_eq!(server.calls(), 1);
        assert_eq!(store.pending_counts().await.total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flapping_connection_does_not_sync() {
        let (store, connectivity, server, _handle) = setup(false);
        store.add_record(scan()).await.expect("add");

        connectivity.set_online(true);
        settle().await;
        tokio::time::advance(Duration::from_millis(500)).await;
        connectivity.set_online(false);
        settle().await;
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(server.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_tick_only_syncs_pending_work() {
        let (store, _connectivity, server, handle) = setup(true);
        handle.tick().await;
        settle().await;
        assert_eq!(server.calls(), 0);

        store.add_record(scan()).await.expect("add");
        tokio::time::advance(Duration::from_secs(5 * 60)).await;
        settle().await;
        assert_eq!(server.calls(), 1);
    }

    #[tokio::test]
    async fn test_user_request_replies_with_summary() {
        let (store, _connectivity, _server, handle) = setup(true);
        store.add_record(scan()).await.expect("add");

        let summary = handle.request_sync().await.expect("summary");
        assert_eq!(summary.success, 1);

        handle.shutdown().await;
        assert!(handle.request_sync().await.is_none());
    }
}
