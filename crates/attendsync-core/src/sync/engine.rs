//! Replays unsynced records against the server of record.
//!
//! A pass walks attendance records, then form submissions, in insertion
//! order. Attendance goes out in batches; each record's outcome is taken
//! from the response entry at the same position. Accepted records are
//! marked synced; rejected ones get a failure stamp and a backoff window.
//! Nothing is retried inside a pass.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::api::{ApiError, AttendancePayload, BatchResponse, FormPayload, FormResponse};
use crate::config::SyncConfig;
use crate::events::{EventBus, SyncEvent, SyncResults, SyncStage};
use crate::models::{now_millis, AttendanceRecord, FormSubmission, PendingCounts, Record, RecordId, StoreKind, SyncState};
use crate::store::{StoreError, StoreHandle};

use super::backoff::RetryPolicy;
use super::connectivity::Connectivity;

/// The server side of reconciliation.
pub trait Reconciler: Send + Sync + 'static {
    /// Largest attendance batch the endpoint accepts.
    fn max_batch_size(&self) -> usize;

    fn submit_attendance(
        &self,
        batch: Vec<AttendancePayload>,
    ) -> impl Future<Output = anyhow::Result<BatchResponse>> + Send;

    fn submit_form(&self, form: FormPayload) -> impl Future<Output = anyhow::Result<FormResponse>> + Send;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncErrorEntry {
    pub store: StoreKind,
    pub record_id: RecordId,
    pub error: String,
}

/// Outcome of one pass. `success + failed` is the number of records attempted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncSummary {
    pub success: usize,
    pub failed: usize,
    /// Pending records skipped because their backoff window is still open.
    pub deferred: usize,
    pub errors: Vec<SyncErrorEntry>,
    pub results: SyncResults,
}

impl SyncSummary {
    pub fn attempted(&self) -> usize {
        self.success + self.failed
    }
}

type PassFuture = Shared<BoxFuture<'static, SyncSummary>>;

struct EngineInner<R> {
    store: StoreHandle,
    reconciler: R,
    events: EventBus,
    connectivity: Connectivity,
    retry: RetryPolicy,
    batch_size: usize,
    in_flight: Mutex<Option<PassFuture>>,
}

pub struct SyncEngine<R> {
    inner: Arc<EngineInner<R>>,
}

impl<R> Clone for SyncEngine<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Reconciler> SyncEngine<R> {
    pub fn new(
        store: StoreHandle,
        reconciler: R,
        events: EventBus,
        connectivity: Connectivity,
        config: &SyncConfig,
    ) -> Self {
        let batch_size = config
            .effective_batch_size()
            .min(reconciler.max_batch_size().max(1));
        Self {
            inner: Arc::new(EngineInner {
                store,
                reconciler,
                events,
                connectivity,
                retry: RetryPolicy::from_config(config),
                batch_size,
                in_flight: Mutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> &StoreHandle {
        &self.inner.store
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.inner.connectivity
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn batch_size(&self) -> usize {
        self.inner.batch_size
    }

    pub async fn pending_counts(&self) -> PendingCounts {
        self.inner.store.pending_counts().await
    }

    /// Automatic pass: records inside their backoff window are skipped.
    pub async fn sync_pending(&self) -> SyncSummary {
        self.run(false).await
    }

    /// Operator-requested pass: every unsynced record is attempted.
    pub async fn sync_now(&self) -> SyncSummary {
        self.run(true).await
    }

    /// Join the in-flight pass, or start one.
    async fn run(&self, force: bool) -> SyncSummary {
        let pass = {
            let mut slot = self.inner.slot();
            match slot.as_ref() {
                Some(pass) => {
                    debug!("Sync already in progress, joining");
                    pass.clone()
                }
                None => {
                    let pass = self.start(force);
                    *slot = Some(pass.clone());
                    pass
                }
            }
        };
        pass.await
    }

    fn start(&self, force: bool) -> PassFuture {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let summary = inner.pass(force).await;
            *inner.slot() = None;
            summary
        });

        async move {
            task.await.unwrap_or_else(|e| {
                warn!(error = %e, "Sync task failed");
                SyncSummary::default()
            })
        }
        .boxed()
        .shared()
    }
}

impl<R: Reconciler> EngineInner<R> {
    fn slot(&self) -> MutexGuard<'_, Option<PassFuture>> {
        self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn pass(&self, force: bool) -> SyncSummary {
        if !self.connectivity.is_online() {
            debug!("Offline, skipping sync");
            self.events.emit(SyncEvent::SyncFailed {
                reason: "offline".to_string(),
            });
            return SyncSummary::default();
        }

        self.events.emit(SyncEvent::SyncStarted);
        let mut summary = SyncSummary::default();
        let now = now_millis();

        let attendance: Vec<AttendanceRecord> = self
            .store
            .query_unsynced(StoreKind::AttendanceRecords)
            .await
            .into_iter()
            .filter_map(|r| match r {
                Record::Attendance(a) => Some(a),
                _ => None,
            })
            .collect();
        let attendance = self.due(attendance, |r| &r.sync, force, now, &mut summary);
        self.sync_attendance(&attendance, &mut summary).await;

        if self.connectivity.is_online() {
            let forms: Vec<FormSubmission> = self
                .store
                .query_unsynced(StoreKind::FormSubmissions)
                .await
                .into_iter()
                .filter_map(|r| match r {
                    Record::Form(f) => Some(f),
                    _ => None,
                })
                .collect();
            let forms = self.due(forms, |r| &r.sync, force, now, &mut summary);
            self.sync_forms(&forms, &mut summary).await;
        }

        info!(
            success = summary.success,
            failed = summary.failed,
            deferred = summary.deferred,
            "Sync completed"
        );
        self.events.emit(SyncEvent::SyncCompleted {
            results: summary.results,
        });
        let counts = self.store.pending_counts().await;
        self.events.emit(SyncEvent::pending(counts));
        summary
    }

    fn due<T>(
        &self,
        records: Vec<T>,
        sync: impl Fn(&T) -> &SyncState,
        force: bool,
        now: i64,
        summary: &mut SyncSummary,
    ) -> Vec<T> {
        if force {
            return records;
        }
        let total = records.len();
        let due: Vec<T> = records
            .into_iter()
            .filter(|r| RetryPolicy::is_due(sync(r), now))
            .collect();
        summary.deferred += total - due.len();
        due
    }

    async fn sync_attendance(&self, records: &[AttendanceRecord], summary: &mut SyncSummary) {
        let stage = SyncStage::Attendance;
        let total = records.len();
        summary.results.stage_mut(stage).total = total;
        let mut completed = 0;

        for chunk in records.chunks(self.batch_size) {
            let payloads: Vec<AttendancePayload> = chunk.iter().map(AttendancePayload::from_record).collect();

            match self.reconciler.submit_attendance(payloads).await {
                Ok(response) if response.results.len() == chunk.len() => {
                    for (record, ack) in chunk.iter().zip(&response.results) {
                        if ack.success {
                            if ack.duplicate {
                                debug!(record_id = %record.id, "Server already had this record");
                            }
                            self.resolve(stage, StoreKind::AttendanceRecords, record.id, summary).await;
                        } else {
                            self.fail(stage, StoreKind::AttendanceRecords, record.id, &record.sync, ack.error_message(), summary)
                                .await;
                        }
                    }
                }
                Ok(response) => {
                    let reason = mismatch_reason(&response, chunk.len());
                    warn!(records = chunk.len(), results = response.results.len(), "Unusable batch response");
                    for record in chunk {
                        self.fail(stage, StoreKind::AttendanceRecords, record.id, &record.sync, reason.clone(), summary)
                            .await;
                    }
                }
                Err(e) => {
                    let unreachable = is_unreachable(&e);
                    warn!(records = chunk.len(), error = %e, "Attendance batch failed");
                    for record in chunk {
                        self.fail(stage, StoreKind::AttendanceRecords, record.id, &record.sync, e.to_string(), summary)
                            .await;
                    }
                    if unreachable {
                        completed += chunk.len();
                        self.progress(stage, completed, total);
                        self.connectivity.set_online(false);
                        return;
                    }
                }
            }

            completed += chunk.len();
            self.progress(stage, completed, total);
        }
    }

    async fn sync_forms(&self, forms: &[FormSubmission], summary: &mut SyncSummary) {
        let stage = SyncStage::Forms;
        let total = forms.len();
        summary.results.stage_mut(stage).total = total;

        for (i, form) in forms.iter().enumerate() {
            let outcome = match FormPayload::from_record(form) {
                Ok(payload) => self.reconciler.submit_form(payload).await,
                Err(e) => Err(e.into()),
            };

            match outcome {
                Ok(response) if response.success => {
                    self.resolve(stage, StoreKind::FormSubmissions, form.id, summary).await;
                }
                Ok(response) => {
                    let message = response.message.unwrap_or_else(|| "Sync failed".to_string());
                    self.fail(stage, StoreKind::FormSubmissions, form.id, &form.sync, message, summary).await;
                }
                Err(e) => {
                    let unreachable = is_unreachable(&e);
                    self.fail(stage, StoreKind::FormSubmissions, form.id, &form.sync, e.to_string(), summary).await;
                    if unreachable {
                        self.progress(stage, i + 1, total);
                        self.connectivity.set_online(false);
                        return;
                    }
                }
            }
            self.progress(stage, i + 1, total);
        }
    }

    fn progress(&self, stage: SyncStage, completed: usize, total: usize) {
        self.events.emit(SyncEvent::SyncProgress { stage, completed, total });
    }

    /// The server accepted the record.
    async fn resolve(&self, stage: SyncStage, kind: StoreKind, id: RecordId, summary: &mut SyncSummary) {
        match self.store.mark_synced(kind, id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(store = %kind, record_id = %id, "Synced record was removed locally");
            }
            Err(e) => {
                warn!(store = %kind, record_id = %id, error = %e, "Failed to mark record synced");
                self.count_failure(stage, kind, id, format!("accepted but not marked synced: {}", e), summary);
                return;
            }
        }
        summary.success += 1;
        summary.results.stage_mut(stage).success += 1;
    }

    async fn fail(
        &self,
        stage: SyncStage,
        kind: StoreKind,
        id: RecordId,
        sync: &SyncState,
        error: String,
        summary: &mut SyncSummary,
    ) {
        let attempts = sync.sync_attempts.saturating_add(1);
        let next_retry_at = self.retry.next_retry_at(now_millis(), attempts);
        match self.store.record_failure(kind, id, &error, Some(next_retry_at)).await {
            Ok(()) => {}
            Err(StoreError::NotFound { .. }) => {
                debug!(store = %kind, record_id = %id, "Failed record was removed locally");
            }
            Err(e) => warn!(store = %kind, record_id = %id, error = %e, "Failed to record sync failure"),
        }
        debug!(store = %kind, record_id = %id, error = %error, attempts, "Record not synced");
        self.count_failure(stage, kind, id, error, summary);
    }

    fn count_failure(&self, stage: SyncStage, kind: StoreKind, id: RecordId, error: String, summary: &mut SyncSummary) {
        summary.failed += 1;
        summary.results.stage_mut(stage).failed += 1;
        summary.errors.push(SyncErrorEntry {
            store: kind,
            record_id: id,
            error,
        });
    }
}

fn mismatch_reason(response: &BatchResponse, sent: usize) -> String {
    if response.results.is_empty() && !response.success {
        response
            .message
            .clone()
            .unwrap_or_else(|| "Rejected by server".to_string())
    } else {
        format!("Server returned {} results for {} records", response.results.len(), sent)
    }
}

fn is_unreachable(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<ApiError>()
        .map(ApiError::is_offline)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewRecord, ScanData, ScanType};
    use crate::store::StoreOptions;
    use crate::sync::mock::{MockServer, MockState};
    use std::sync::atomic::Ordering;

    fn scan(student: &str) -> NewRecord {
        NewRecord::Attendance {
            scan_type: ScanType::Manual,
            scan_data: ScanData {
                student_id: Some(student.to_string()),
                subject_id: Some("5".to_string()),
                ..ScanData::default()
            },
            timestamp: now_millis(),
        }
    }

    fn engine(server: MockServer, online: bool) -> (StoreHandle, EventBus, SyncEngine<MockServer>) {
        let store = StoreHandle::in_memory(StoreOptions::default(), "test");
        let events = EventBus::default();
        let connectivity = Connectivity::new(online, events.clone());
        let engine = SyncEngine::new(store.clone(), server, events.clone(), connectivity, &SyncConfig::default());
        (store, events, engine)
    }

    #[tokio::test]
    async fn test_offline_pass_fails_fast() {
        let server = MockServer::default();
        let (store, events, engine) = engine(server.clone(), false);
        store.add_record(scan("1")).await.expect("add");
        let mut rx = events.subscribe();

        let summary = engine.sync_pending().await;
        assert_eq!(summary, SyncSummary::default());
        assert_eq!(
            rx.recv().await.expect("event"),
            SyncEvent::SyncFailed {
                reason: "offline".to_string()
            }
        );
        assert_eq!(server.0.calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.pending_counts().await.attendance, 1);
    }

    #[tokio::test]
    async fn test_records_go_out_in_batches() {
        let server = MockServer::default();
        let (store, _events, engine) = engine(server.clone(), true);
        for i in 0..25 {
            store.add_record(scan(&i.to_string())).await.expect("add");
        }

        let summary = engine.sync_pending().await;
        assert_eq!(summary.success, 25);
        assert_eq!(summary.failed, 0);
        assert_eq!(server.batch_sizes(), vec![10, 10, 5]);
        assert_eq!(store.pending_counts().await.total(), 0);
    }

    #[tokio::test]
    async fn test_rejected_records_back_off_until_forced() {
        let server = MockServer::with(MockState {
            reject_students: vec!["bad".to_string()],
            ..MockState::default()
        });
        let (store, _events, engine) = engine(server.clone(), true);
        store.add_record(scan("good")).await.expect("add");
        let bad = store.add_record(scan("bad")).await.expect("add");

        let first = engine.sync_pending().await;
        assert_eq!((first.success, first.failed), (1, 1));
        assert_eq!(first.errors[0].record_id, bad);
        assert_eq!(first.errors[0].error, "Student not found: bad");

        let record = store.get(StoreKind::AttendanceRecords, bad).await.expect("get").expect("exists");
        assert_eq!(record.sync().retry_count, 1);
        assert!(record.sync().next_retry_at.is_some());

        let second = engine.sync_pending().await;
        assert_eq!(second.attempted(), 0);
        assert_eq!(second.deferred, 1);

        let forced = engine.sync_now().await;
        assert_eq!((forced.success, forced.failed), (0, 1));
        assert_eq!(server.batch_sizes(), vec![2, 1]);
    }

    #[tokio::test]
    async fn test_result_count_mismatch_fails_whole_batch() {
        let server = MockServer::with(MockState {
            drop_last_result: true,
            ..MockState::default()
        });
        let (store, _events, engine) = engine(server, true);
        store.add_record(scan("1")).await.expect("add");
        store.add_record(scan("2")).await.expect("add");

        let summary = engine.sync_pending().await;
        assert_eq!((summary.success, summary.failed), (0, 2));
        assert_eq!(summary.errors[0].error, "Server returned 1 results for 2 records");
        assert_eq!(store.pending_counts().await.attendance, 2);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_pass() {
        let server = MockServer::default();
        let (store, _events, engine) = engine(server.clone(), true);
        store.add_record(scan("1")).await.expect("add");

        let (a, b) = tokio::join!(engine.sync_pending(), engine.sync_pending());
        assert_eq!(a, b);
        assert_eq!(a.success, 1);
        assert_eq!(server.0.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_forms_sync_after_attendance() {
        let server = MockServer::default();
        let (store, events, engine) = engine(server.clone(), true);
        store
            .add_record(NewRecord::Form {
                form_type: "excuse-letter".to_string(),
                data: serde_json::json!({"reason": "fever"}),
                timestamp: now_millis(),
            })
            .await
            .expect("add");
        store
            .add_record(NewRecord::Form {
                form_type: "../admin".to_string(),
                data: serde_json::json!({}),
                timestamp: now_millis(),
            })
            .await
            .expect("add");
        let mut rx = events.subscribe();

        let summary = engine.sync_pending().await;
        assert_eq!(summary.results.forms.success, 1);
        assert_eq!(summary.results.forms.failed, 1);

        let forms = server.0.forms.lock().expect("lock").clone();
        assert_eq!(forms.len(), 1);
        assert_eq!(forms[0].endpoint(), "api/sync-excuse-letter.php");

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        assert_eq!(
            names,
            vec![
                "sync-started",
                "sync-progress",
                "sync-progress",
                "sync-completed",
                "pending-count-updated"
            ]
        );
    }
}
