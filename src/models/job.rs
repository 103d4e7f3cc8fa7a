use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::manifest::Manifest;

/// Status of a manifest job. `Succeeded` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// `Running -> Running` is allowed so a redelivered message can re-stamp
    /// a job whose first attempt crashed mid-flight.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Queued, JobStatus::Running) => true,
            (JobStatus::Running, JobStatus::Running) => true,
            (JobStatus::Running, JobStatus::Succeeded | JobStatus::Failed) => true,
            _ => false,
        }
    }
}

/// One image + pattern extraction request tracked through its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub user_id: String,
    pub pattern_id: Uuid,
    pub image_url: String,
    pub extras: serde_json::Map<String, serde_json::Value>,
    pub idempotency_key: Option<String>,
    pub status: JobStatus,
    pub manifest: Option<Manifest>,
    pub error: Option<String>,
    pub latency_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Validated intake tuple handed to the pipeline by the request layer.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub user_id: String,
    pub pattern_id: Uuid,
    pub image_url: String,
    pub extras: serde_json::Map<String, serde_json::Value>,
    pub idempotency_key: Option<String>,
}

/// Result of a conditional terminal write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalWrite {
    Applied,
    /// The job was already terminal; nothing changed.
    AlreadyTerminal,
}

/// Polling body returned to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub id: Uuid,
    pub status: JobStatus,
    pub manifest: Option<serde_json::Value>,
    pub error: Option<String>,
    pub latency_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: Uuid, new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id,
            user_id: new.user_id,
            pattern_id: new.pattern_id,
            image_url: new.image_url,
            extras: new.extras,
            idempotency_key: new.idempotency_key,
            status: JobStatus::Queued,
            manifest: None,
            error: None,
            latency_ms: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Polling view with the manifest in its stored shape.
    pub fn polling_view(&self) -> JobView {
        self.view_with_manifest(self.manifest.as_ref().map(Manifest::to_stored))
    }

    pub fn view_with_manifest(&self, manifest: Option<serde_json::Value>) -> JobView {
        JobView {
            id: self.id,
            status: self.status,
            manifest,
            error: self.error.clone(),
            latency_ms: self.latency_ms,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }

    /// Checks the output/status invariants of a persisted job.
    pub fn is_consistent(&self) -> bool {
        let outputs_match = (self.manifest.is_some() == (self.status == JobStatus::Succeeded))
            && (self.error.is_some() == (self.status == JobStatus::Failed));
        let times_ordered = match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => started <= completed,
            _ => true,
        };
        outputs_match && times_ordered
    }
}
