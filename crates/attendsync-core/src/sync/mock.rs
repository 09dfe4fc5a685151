//! In-process reconciliation endpoint for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::api::{AttendancePayload, BatchResponse, FormPayload, FormResponse, RecordAck};

use super::Reconciler;

#[derive(Default)]
pub struct MockState {
    pub batches: Mutex<Vec<Vec<AttendancePayload>>>,
    pub forms: Mutex<Vec<FormPayload>>,
    pub reject_students: Vec<String>,
    pub drop_last_result: bool,
    pub calls: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct MockServer(pub Arc<MockState>);

impl MockServer {
    pub fn with(state: MockState) -> Self {
        Self(Arc::new(state))
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.0.batches.lock().expect("lock").iter().map(Vec::len).collect()
    }

    pub fn calls(&self) -> usize {
        self.0.calls.load(Ordering::SeqCst)
    }
}

impl Reconciler for MockServer {
    fn max_batch_size(&self) -> usize {
        50
    }

    async fn submit_attendance(&self, batch: Vec<AttendancePayload>) -> anyhow::Result<BatchResponse> {
        self.0.calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        let mut results: Vec<RecordAck> = batch
            .iter()
            .map(|p| {
                let student = p.student_id.clone().unwrap_or_default();
                if self.0.reject_students.contains(&student) {
                    RecordAck::rejected(format!("Student not found: {}", student))
                } else {
                    RecordAck::ok()
                }
            })
            .collect();
        if self.0.drop_last_result {
            results.pop();
        }
        self.0.batches.lock().expect("lock").push(batch);
        Ok(BatchResponse {
            success: true,
            results,
            ..BatchResponse::default()
        })
    }

    async fn submit_form(&self, form: FormPayload) -> anyhow::Result<FormResponse> {
        self.0.forms.lock().expect("lock").push(form);
        Ok(FormResponse {
            success: true,
            message: None,
        })
    }
}
