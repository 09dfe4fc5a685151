//! Wiring for a client process.
//!
//! `Runtime::start` opens the store (falling back as far as memory), the
//! response cache, the session and the API client, and connects the cache
//! manager, sync engine and scan recorder to one event bus. `run_daemon`
//! adds the long-lived tasks: coordinator, connectivity probe, storage
//! monitor and sync monitor.

use std::future::Future;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::ApiClient;
use crate::auth::Session;
use crate::cache::{CacheManager, ResponseCache};
use crate::capture::{ScanContext, ScanRecorder};
use crate::config::Config;
use crate::events::EventBus;
use crate::monitor::SyncMonitor;
use crate::store::{StoreHandle, StoreMode};
use crate::sync::{Connectivity, ConnectivityProbe, SyncCoordinator, SyncEngine};

pub struct Runtime {
    pub config: Config,
    pub session: Session,
    pub store: StoreHandle,
    pub store_mode: StoreMode,
    pub responses: ResponseCache,
    pub cache: CacheManager,
    pub events: EventBus,
    pub api: ApiClient,
    pub connectivity: Connectivity,
    pub engine: SyncEngine<ApiClient>,
    pub recorder: ScanRecorder,
}

impl Runtime {
    pub async fn start(config: Config) -> Result<Self> {
        let data_dir = config.data_dir()?;
        debug!(?data_dir, "Data directory configured");

        // Load session from disk if it exists
        let mut session = Session::new(data_dir.clone());
        match session.load() {
            Ok(true) => debug!("Session loaded"),
            Ok(false) => debug!("No valid session found"),
            Err(e) => warn!(error = %e, "Failed to load session"),
        }

        let store_dir = config.store_dir()?;
        let outcome = StoreHandle::open_with_fallback(&store_dir, config.store_options()).await;
        if let Some(notice) = outcome.mode.notice() {
            warn!(mode = ?outcome.mode, "{}", notice);
        }

        let responses = ResponseCache::new(config.response_cache_dir()?)
            .context("Failed to open response cache")?;

        let mut api = ApiClient::new(&config.server_url)?
            .with_max_batch_size(config.sync.max_batch_size)
            .with_response_cache(responses.clone(), config.cache.api_bucket.clone());
        if let Some(token) = session.token() {
            api.set_token(token.to_string());
            debug!("Token set on API client");
        }

        let events = EventBus::new(config.sync.event_buffer);
        let cache = CacheManager::new(
            config.cache.clone(),
            outcome.handle.clone(),
            responses.clone(),
            events.clone(),
        );
        let connectivity = Connectivity::new(false, events.clone());
        let engine = SyncEngine::new(
            outcome.handle.clone(),
            api.clone(),
            events.clone(),
            connectivity.clone(),
            &config.sync,
        );
        let recorder = ScanRecorder::new(outcome.handle.clone(), events.clone()).with_cache_manager(cache.clone());

        Ok(Self {
            config,
            session,
            store: outcome.handle,
            store_mode: outcome.mode,
            responses,
            cache,
            events,
            api,
            connectivity,
            engine,
            recorder,
        })
    }

    /// Operator defaults applied to every scan.
    pub fn scan_context(&self, subject_id: Option<String>) -> ScanContext {
        ScanContext {
            subject_id,
            location: Some(self.config.default_location.clone()),
            teacher_id: self.config.teacher_id.clone(),
            teacher_name: self.config.teacher_name.clone(),
            ..ScanContext::default()
        }
    }

    /// Probe the server once and publish the result.
    pub async fn probe_connectivity(&self) -> bool {
        let online = self.api.probe().await;
        self.connectivity.set_online(online);
        online
    }

    /// Run every background task until `shutdown` resolves.
    pub async fn run_daemon<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(server = %self.config.server_url, "Starting sync daemon");
        let (stop_tx, stop_rx) = watch::channel(false);

        let monitor = tokio::spawn(SyncMonitor::new().run(self.events.subscribe()));
        let storage_monitor = self.cache.spawn_monitor(stop_rx.clone());
        let probe = self.connectivity.spawn_probe(
            self.api.clone(),
            self.config.sync.probe_interval(),
            stop_rx.clone(),
        );
        let upgrade = match self.store_mode {
            StoreMode::Full => None,
            _ => Some(self.store.spawn_upgrade_retry(
                self.config.store.upgrade_retry_interval(),
                self.config.store.upgrade_retry_window(),
            )),
        };

        let (coordinator, coordinator_task) = SyncCoordinator::new(self.engine.clone(), &self.config.sync)
            .with_cache_manager(self.cache.clone())
            .spawn();

        shutdown.await;
        info!("Shutting down sync daemon");

        coordinator.shutdown().await;
        let _ = stop_tx.send(true);
        for (name, task) in [("storage monitor", storage_monitor), ("connectivity probe", probe)] {
            if let Err(e) = task.await {
                warn!(task = name, error = %e, "Background task failed");
            }
        }
        if let Err(e) = coordinator_task.await {
            warn!(error = %e, "Sync coordinator failed");
        }
        if let Some(upgrade) = upgrade {
            upgrade.abort();
        }
        monitor.abort();

        self.store.close().await;
        Ok(())
    }
}
