//! Operator-facing view of sync activity.
//!
//! `SyncMonitor` folds the event stream into last-known display state and
//! turns the interesting events into toasts. It holds no records and never
//! talks to the store.

use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::events::{SyncEvent, SyncResults, SyncStage};
use crate::models::PendingCounts;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToastLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl ToastLevel {
    pub fn default_title(&self) -> &'static str {
        match self {
            ToastLevel::Info => "Sync Info",
            ToastLevel::Success => "Sync Complete",
            ToastLevel::Warning => "Sync Warning",
            ToastLevel::Error => "Sync Error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Toast {
    pub level: ToastLevel,
    pub title: String,
    pub message: String,
}

impl Toast {
    fn new(level: ToastLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            title: level.default_title().to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub stage: SyncStage,
    pub completed: usize,
    pub total: usize,
}

impl Progress {
    pub fn percentage(&self) -> usize {
        if self.total == 0 {
            0
        } else {
            self.completed * 100 / self.total
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitorState {
    pub pending: PendingCounts,
    pub syncing: bool,
    pub progress: Option<Progress>,
    pub last_results: Option<SyncResults>,
    pub last_failure: Option<String>,
    pub online: Option<bool>,
}

#[derive(Debug, Default)]
pub struct SyncMonitor {
    state: MonitorState,
}

impl SyncMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &MonitorState {
        &self.state
    }

    /// Update display state from one event; returns the toast to show, if any.
    pub fn apply(&mut self, event: &SyncEvent) -> Option<Toast> {
        match event {
            SyncEvent::PendingCountUpdated { counts, .. } => {
                self.state.pending = *counts;
                None
            }
            SyncEvent::SyncStarted => {
                self.state.syncing = true;
                self.state.progress = None;
                Some(Toast::new(ToastLevel::Info, "Starting offline data sync..."))
            }
            SyncEvent::SyncProgress { stage, completed, total } => {
                self.state.progress = (*total > 0).then_some(Progress {
                    stage: *stage,
                    completed: *completed,
                    total: *total,
                });
                None
            }
            SyncEvent::SyncCompleted { results } => {
                self.state.syncing = false;
                self.state.progress = None;
                self.state.last_results = Some(*results);
                let (synced, failed) = (results.success(), results.failed());
                if synced == 0 {
                    return None;
                }
                let mut message = format!("Successfully synced {} items", synced);
                if failed > 0 {
                    message.push_str(&format!(", {} failed", failed));
                }
                let level = if failed > 0 {
                    ToastLevel::Warning
                } else {
                    ToastLevel::Success
                };
                Some(Toast::new(level, message))
            }
            SyncEvent::SyncFailed { reason } => {
                self.state.syncing = false;
                self.state.progress = None;
                self.state.last_failure = Some(reason.clone());
                Some(Toast::new(ToastLevel::Error, format!("Sync failed: {}", reason)))
            }
            SyncEvent::ConnectivityChanged { online } => {
                let previous = self.state.online.replace(*online);
                if previous == Some(*online) {
                    return None;
                }
                if *online {
                    Some(Toast::new(ToastLevel::Success, "Back online! Syncing data..."))
                } else {
                    Some(Toast::new(
                        ToastLevel::Warning,
                        "You are offline. Data will sync when connection is restored.",
                    ))
                }
            }
            SyncEvent::CleanupCompleted { .. } => None,
        }
    }

    /// One-line summary for status bars and the CLI.
    pub fn status_line(&self) -> String {
        let state = &self.state;
        let connection = match state.online {
            Some(true) => "online",
            Some(false) => "offline",
            None => "unknown",
        };
        let activity = match (&state.progress, state.syncing) {
            (Some(p), _) => format!(
                "syncing {} {}/{} ({}%)",
                p.stage.label(),
                p.completed,
                p.total,
                p.percentage()
            ),
            (None, true) => "syncing".to_string(),
            (None, false) => "idle".to_string(),
        };
        format!(
            "{} | {} | {} pending ({} attendance, {} forms)",
            connection,
            activity,
            state.pending.total(),
            state.pending.attendance,
            state.pending.forms
        )
    }

    /// Consume events until the channel closes, logging each toast.
    pub async fn run(mut self, mut rx: broadcast::Receiver<SyncEvent>) -> MonitorState {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(toast) = self.apply(&event) {
                        match toast.level {
                            ToastLevel::Error | ToastLevel::Warning => warn!(title = %toast.title, "{}", toast.message),
                            _ => info!(title = %toast.title, "{}", toast.message),
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Sync monitor fell behind, skipping events");
                }
                Err(RecvError::Closed) => break,
            }
        }
        self.state
    }
}
