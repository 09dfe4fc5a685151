//! End-to-end flows across capture, store, sync and cleanup.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use attendsync_core::api::{AttendancePayload, BatchResponse, FormPayload, FormResponse, RecordAck};
use attendsync_core::cache::{CacheManager, RequestKey, ResponseCache};
use attendsync_core::capture::{ScanContext, ScanRecorder};
use attendsync_core::config::{CacheConfig, SyncConfig};
use attendsync_core::events::EventBus;
use attendsync_core::models::{now_millis, NewRecord, Record, ScanData, ScanType, StoreKind};
use attendsync_core::store::{StoreHandle, StoreOptions};
use attendsync_core::sync::{Connectivity, Reconciler, SyncCoordinator, SyncEngine};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Default)]
struct ServerState {
    batches: Mutex<Vec<Vec<AttendancePayload>>>,
    seen: Mutex<Vec<String>>,
    reject_students: Vec<String>,
    calls: AtomicUsize,
}

/// Accepts everything, reporting repeats of a dedup key as duplicates.
#[derive(Clone, Default)]
struct Server(Arc<ServerState>);

impl Server {
    fn rejecting(students: &[&str]) -> Self {
        Self(Arc::new(ServerState {
            reject_students: students.iter().map(|s| s.to_string()).collect(),
            ..ServerState::default()
        }))
    }

    fn calls(&self) -> usize {
        self.0.calls.load(Ordering::SeqCst)
    }

    fn submitted(&self) -> usize {
        self.0.batches.lock().expect("lock").iter().map(Vec::len).sum()
    }
}

impl Reconciler for Server {
    fn max_batch_size(&self) -> usize {
        50
    }

    async fn submit_attendance(&self, batch: Vec<AttendancePayload>) -> anyhow::Result<BatchResponse> {
        self.0.calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;

        let results: Vec<RecordAck> = {
            let mut seen = self.0.seen.lock().expect("lock");
            batch
                .iter()
                .map(|p| {
                    let student = p.student_id.clone().unwrap_or_default();
                    if self.0.reject_students.contains(&student) {
                        return RecordAck::rejected(format!("Student not found: {}", student));
                    }
                    let duplicate = seen.contains(&p.dedup_key);
                    if !duplicate {
                        seen.push(p.dedup_key.clone());
                    }
                    RecordAck {
                        duplicate,
                        ..RecordAck::ok()
                    }
                })
                .collect()
        };

        self.0.batches.lock().expect("lock").push(batch);
        Ok(BatchResponse {
            success: true,
            results,
            ..BatchResponse::default()
        })
    }

    async fn submit_form(&self, _form: FormPayload) -> anyhow::Result<FormResponse> {
        Ok(FormResponse {
            success: true,
            message: None,
        })
    }
}

fn context() -> ScanContext {
    ScanContext {
        subject_id: Some("5".to_string()),
        teacher_id: Some("3".to_string()),
        ..ScanContext::default()
    }
}

fn scan(student: &str, timestamp: i64) -> NewRecord {
    NewRecord::Attendance {
        scan_type: ScanType::Manual,
        scan_data: ScanData {
            student_id: Some(student.to_string()),
            subject_id: Some("5".to_string()),
            ..ScanData::default()
        },
        timestamp,
    }
}

fn engine(store: &StoreHandle, server: &Server, online: bool) -> SyncEngine<Server> {
    let events = EventBus::default();
    let connectivity = Connectivity::new(online, events.clone());
    SyncEngine::new(store.clone(), server.clone(), events, connectivity, &SyncConfig::default())
}

async fn settle() {
    for _ in 0..100 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_offline_capture_syncs_after_reconnect() {
    let store = StoreHandle::in_memory(StoreOptions::default(), "test");
    let server = Server::default();
    let engine = engine(&store, &server, false);
    let recorder = ScanRecorder::new(store.clone(), engine.events().clone());

    for student in ["41", "42", "43"] {
        recorder.record_manual(student, None, &context()).await.expect("record");
    }
    assert_eq!(store.pending_counts().await.attendance, 3);

    let (handle, _task) = SyncCoordinator::new(engine.clone(), &SyncConfig::default()).spawn();
    engine.connectivity().set_online(true);
    settle().await;
    assert_eq!(server.calls(), 0);

    tokio::time::advance(Duration::from_millis(2100)).await;
    settle().await;

    assert_eq!(server.calls(), 1);
    assert_eq!(server.submitted(), 3);
    assert_eq!(store.pending_counts().await.total(), 0);
    handle.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_is_marked_synced() {
    let store = StoreHandle::in_memory(StoreOptions::default(), "test");
    let server = Server::default();
    let engine = engine(&store, &server, true);
    let now = now_millis();

    // Same student, subject and day: the second one is a server-side duplicate.
    store.add_record(scan("42", now)).await.expect("add");
    store.add_record(scan("42", now + 1000)).await.expect("add");

    let summary = engine.sync_now().await;
    assert_eq!(summary.success, 2);
    assert_eq!(summary.failed, 0);
    assert!(store.query_unsynced(StoreKind::AttendanceRecords).await.is_empty());
}

#[tokio::test]
async fn test_outcomes_never_double_count() {
    let store = StoreHandle::in_memory(StoreOptions::default(), "test");
    let server = Server::rejecting(&["13"]);
    let engine = engine(&store, &server, true);
    let now = now_millis();
    for (i, student) in ["11", "12", "13", "14"].iter().enumerate() {
        store.add_record(scan(student, now + i as i64)).await.expect("add");
    }
    let pending_before = store.pending_counts().await.total();

    let (a, b) = tokio::join!(engine.sync_now(), engine.sync_now());
    assert_eq!(a, b);
    assert_eq!(server.calls(), 1);
    assert_eq!(a.success, 3);
    assert_eq!(a.failed, 1);
    assert_eq!(a.attempted(), a.success + a.failed);
    assert!(a.attempted() <= pending_before);

    let remaining = store.query_unsynced(StoreKind::AttendanceRecords).await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].sync().retry_count, 1);
    assert!(remaining[0].sync().last_error.as_deref().unwrap_or("").contains("13"));
}

#[tokio::test]
async fn test_legacy_rows_are_pending_and_repairable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_dir = dir.path().join("db");
    let store = StoreHandle::open(&db_dir, StoreOptions::default()).expect("open");
    store.close().await;

    let ts = now_millis() - DAY_MS;
    let legacy = serde_json::json!({
        "next_id": 3,
        "rows": {
            "1": {
                "id": 1,
                "scan_type": "lrn",
                "scan_data": { "lrn": "123456789012", "subject_id": "5" },
                "timestamp": ts,
                "synced": null
            },
            "2": {
                "id": 2,
                "scan_type": "manual",
                "scan_data": { "student_id": "7", "subject_id": "5" },
                "timestamp": ts.to_string()
            }
        }
    });
    std::fs::write(
        db_dir.join("attendance_records.json"),
        serde_json::to_string(&legacy).expect("encode"),
    )
    .expect("write");

    let store = StoreHandle::open(&db_dir, StoreOptions::default()).expect("reopen");
    let pending = store.query_unsynced(StoreKind::AttendanceRecords).await;
    assert_eq!(pending.len(), 2);

    let report = store.repair(StoreKind::AttendanceRecords).await.expect("repair");
    assert_eq!(report.repaired, 2);
    assert_eq!(report.total, 2);

    let records = store.records(StoreKind::AttendanceRecords).await.expect("records");
    for record in &records {
        let Record::Attendance(record) = record else {
            panic!("expected attendance record");
        };
        assert!(!record.sync.synced);
        assert!(!record.date.is_empty());
        assert!(record.student_id.is_some());
    }

    // Reads are restartable: nothing is consumed by querying.
    assert_eq!(store.query_unsynced(StoreKind::AttendanceRecords).await.len(), 2);
    store.close().await;
    let store = StoreHandle::open(&db_dir, StoreOptions::default()).expect("reopen");
    assert_eq!(store.pending_counts().await.attendance, 2);
}

struct CacheFixture {
    _dir: tempfile::TempDir,
    store: StoreHandle,
    responses: ResponseCache,
    config: CacheConfig,
}

async fn cache_fixture() -> CacheFixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = StoreHandle::open(
        &dir.path().join("db"),
        StoreOptions {
            quota_bytes: None,
            ..StoreOptions::default()
        },
    )
    .expect("store");
    let responses = ResponseCache::new(dir.path().join("responses")).expect("responses");
    let config = CacheConfig::default();

    let now = now_millis();
    for i in 0..5 {
        store.add_record(scan(&format!("{}", 100 + i), now + i)).await.expect("add");
    }
    for bucket in ["static", "dynamic", "api"] {
        let bucket = format!("kes-smart-{}-v1", bucket);
        let key = RequestKey::get(format!("http://localhost/kes-smart/{}.json", bucket));
        responses.put(&bucket, &key, 200, Some("application/json"), b"{}").expect("put");
    }

    CacheFixture {
        _dir: dir,
        store,
        responses,
        config,
    }
}

#[tokio::test]
async fn test_critical_usage_runs_aggressive_pass() {
    let mut fixture = cache_fixture().await;
    let used = fixture.store.bytes_used().await;
    // Unsynced records cannot be trimmed, so local usage stays around 96%.
    fixture.config.local_store_quota_bytes = used * 100 / 96;

    let manager = CacheManager::new(
        fixture.config.clone(),
        fixture.store.clone(),
        fixture.responses.clone(),
        EventBus::default(),
    );
    let report = manager.handle_quota_exceeded().await;

    let aggressive = report.aggressive.expect("aggressive pass ran");
    assert_eq!(aggressive.cleaned, 2);
    let buckets = fixture.responses.bucket_names().expect("buckets");
    assert_eq!(buckets, vec!["kes-smart-static-v1".to_string()]);
    assert_eq!(fixture.store.pending_counts().await.attendance, 5);
}

#[tokio::test]
async fn test_overlapping_cleanups_share_one_pass() {
    let fixture = cache_fixture().await;
    let manager = CacheManager::new(
        fixture.config.clone(),
        fixture.store.clone(),
        fixture.responses.clone(),
        EventBus::default(),
    );

    let (emergency, routine) = tokio::join!(
        manager.perform_emergency_cleanup(),
        manager.perform_routine_cleanup()
    );
    assert_eq!(emergency.pass_id, routine.pass_id);
    assert_eq!(manager.cleanup_stats().await.cleanup_count, 1);
    assert_eq!(fixture.store.pending_counts().await.attendance, 5);
}
