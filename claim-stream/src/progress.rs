use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::record::StreamRecord;

/// Lifecycle of one streamed request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPhase {
    #[default]
    Idle,
    Dispatching,
    Streaming,
    Completed,
    Failed,
}

impl RequestPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestPhase::Completed | RequestPhase::Failed)
    }
}

/// Observable view of a claim run: what each stage reported so far
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressState {
    pub request_id: Option<Uuid>,
    pub records: Vec<StreamRecord>,
    /// Distinct stages in first-arrival order
    pub seen_stages: Vec<String>,
    pub is_active: bool,
    pub phase: RequestPhase,
    pub error: Option<String>,
}

impl ProgressState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard the previous run and mark a new one as dispatching
    pub fn begin(&mut self, request_id: Uuid) {
        *self = Self {
            request_id: Some(request_id),
            is_active: true,
            phase: RequestPhase::Dispatching,
            ..Self::default()
        };
    }

    /// Append a record. Returns true when its stage had not been seen before.
    pub fn apply(&mut self, record: StreamRecord) -> bool {
        let is_new_stage = !self.has_seen(&record.stage);
        if is_new_stage {
            self.seen_stages.push(record.stage.clone());
        }
        self.records.push(record);
        is_new_stage
    }

    pub fn has_seen(&self, stage: &str) -> bool {
        self.seen_stages.iter().any(|s| s == stage)
    }

    /// All records reported by `stage`, in arrival order
    pub fn records_for<'a>(&'a self, stage: &'a str) -> impl Iterator<Item = &'a StreamRecord> {
        self.records.iter().filter(move |r| r.stage == stage)
    }

    /// True when the backend reported an in-band `Error` stage
    pub fn has_error_stage(&self) -> bool {
        self.records.iter().any(StreamRecord::is_error)
    }

    /// Most recent record reported by `stage`
    pub fn latest(&self, stage: &str) -> Option<&StreamRecord> {
        self.records.iter().rev().find(|r| r.stage == stage)
    }
}

/// Receives claim progress notifications as the stream is decoded.
///
/// Callbacks run inline on the request future, between chunk reads, so
/// implementations should return quickly.
pub trait ProgressObserver: Send + Sync {
    /// Prior results were discarded for a new run
    fn on_reset(&self, _request_id: Uuid) {}

    /// The response headers arrived and the body is being read
    fn on_streaming(&self, _request_id: Uuid) {}

    /// A record was decoded and appended
    fn on_record(&self, _record: &StreamRecord, _state: &ProgressState) {}

    /// The run reached a terminal phase; called exactly once per run
    fn on_finished(&self, _state: &ProgressState) {}
}
