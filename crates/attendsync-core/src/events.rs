//! Events published by the sync engine and the cache manager.
//!
//! Events fan out over a `tokio::sync::broadcast` channel; any number of
//! observers (the sync monitor, the CLI, tests) may subscribe.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::cache::CleanupTier;
use crate::models::PendingCounts;

/// Default broadcast buffer. Slow observers skip ahead rather than block publishers.
pub const DEFAULT_EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    Attendance,
    Forms,
}

impl SyncStage {
    pub fn label(&self) -> &'static str {
        match self {
            SyncStage::Attendance => "attendance",
            SyncStage::Forms => "forms",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageResult {
    pub success: usize,
    pub failed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncResults {
    pub attendance: StageResult,
    pub forms: StageResult,
}

impl SyncResults {
    pub fn stage_mut(&mut self, stage: SyncStage) -> &mut StageResult {
        match stage {
            SyncStage::Attendance => &mut self.attendance,
            SyncStage::Forms => &mut self.forms,
        }
    }

    pub fn success(&self) -> usize {
        self.attendance.success + self.forms.success
    }

    pub fn failed(&self) -> usize {
        self.attendance.failed + self.forms.failed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "detail", rename_all = "kebab-case")]
pub enum SyncEvent {
    SyncStarted,
    SyncProgress {
        stage: SyncStage,
        completed: usize,
        total: usize,
    },
    SyncCompleted {
        results: SyncResults,
    },
    SyncFailed {
        reason: String,
    },
    PendingCountUpdated {
        counts: PendingCounts,
        total: usize,
    },
    CleanupCompleted {
        tier: CleanupTier,
        cleaned: usize,
        errors: usize,
    },
    ConnectivityChanged {
        online: bool,
    },
}

impl SyncEvent {
    pub fn pending(counts: PendingCounts) -> Self {
        SyncEvent::PendingCountUpdated {
            total: counts.total(),
            counts,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::SyncStarted => "sync-started",
            SyncEvent::SyncProgress { .. } => "sync-progress",
            SyncEvent::SyncCompleted { .. } => "sync-completed",
            SyncEvent::SyncFailed { .. } => "sync-failed",
            SyncEvent::PendingCountUpdated { .. } => "pending-count-updated",
            SyncEvent::CleanupCompleted { .. } => "cleanup-completed",
            SyncEvent::ConnectivityChanged { .. } => "connectivity-changed",
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: SyncEvent) {
        trace!(event = event.name(), "Publishing event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}
