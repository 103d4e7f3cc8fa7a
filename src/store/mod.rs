//! Persistence seams for the pipeline.
//!
//! Every write is scoped to a single row, so implementations need no
//! cross-row transactions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::job::{Job, NewJob, TerminalWrite};
use crate::models::manifest::Manifest;
use crate::models::pattern::Pattern;
use crate::models::webhook::{Webhook, WebhookEvent};

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryStore;
pub use self::postgres::PgStore;

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, new: NewJob) -> Result<Job, StoreError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Transition to running and stamp `started_at`. Best effort for callers.
    async fn mark_running(&self, job_id: Uuid) -> Result<(), StoreError>;

    /// Conditional terminal write for the worker attempt begun at
    /// `attempt_started`; a job that is already terminal is left alone.
    ///
    /// A job still `queued` here is one whose running write was lost. It is
    /// moved through `running`, stamped with `attempt_started`, before the
    /// terminal state is applied.
    async fn complete_succeeded(
        &self,
        job_id: Uuid,
        attempt_started: DateTime<Utc>,
        manifest: &Manifest,
        latency_ms: i64,
    ) -> Result<TerminalWrite, StoreError>;

    /// See [`JobStore::complete_succeeded`].
    async fn complete_failed(
        &self,
        job_id: Uuid,
        attempt_started: DateTime<Utc>,
        error: &str,
        latency_ms: i64,
    ) -> Result<TerminalWrite, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait PatternStore: Send + Sync {
    async fn get_pattern(&self, pattern_id: Uuid) -> Result<Option<Pattern>, StoreError>;
}

#[async_trait]
pub trait WebhookStore: Send + Sync {
    /// Active webhooks of `user_id` subscribed to `event`.
    async fn active_webhooks(
        &self,
        user_id: &str,
        event: WebhookEvent,
    ) -> Result<Vec<Webhook>, StoreError>;

    async fn touch_last_triggered(
        &self,
        webhook_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job {0} not found")]
    JobNotFound(Uuid),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}
