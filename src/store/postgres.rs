use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{JobStore, PatternStore, StoreError, WebhookStore};
use crate::db::{pattern_queries, queries, webhook_queries};
use crate::models::job::{Job, NewJob, TerminalWrite};
use crate::models::manifest::Manifest;
use crate::models::pattern::Pattern;
use crate::models::webhook::{Webhook, WebhookEvent};

/// PostgreSQL-backed implementation of every store trait.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn not_found_as(job_id: Uuid) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |e| match e {
        sqlx::Error::RowNotFound => StoreError::JobNotFound(job_id),
        other => StoreError::Database(other),
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn create_job(&self, new: NewJob) -> Result<Job, StoreError> {
        Ok(queries::create_job(&self.pool, Uuid::new_v4(), &new).await?)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(queries::get_job(&self.pool, job_id).await?)
    }

    async fn mark_running(&self, job_id: Uuid) -> Result<(), StoreError> {
        if !queries::mark_running(&self.pool, job_id).await? {
            tracing::debug!(job_id = %job_id, "Running transition skipped");
        }
        Ok(())
    }

    async fn complete_succeeded(
        &self,
        job_id: Uuid,
        attempt_started: DateTime<Utc>,
        manifest: &Manifest,
        latency_ms: i64,
    ) -> Result<TerminalWrite, StoreError> {
        queries::complete_succeeded(&self.pool, job_id, attempt_started, manifest, latency_ms)
            .await
            .map_err(not_found_as(job_id))
    }

    async fn complete_failed(
        &self,
        job_id: Uuid,
        attempt_started: DateTime<Utc>,
        error: &str,
        latency_ms: i64,
    ) -> Result<TerminalWrite, StoreError> {
        queries::complete_failed(&self.pool, job_id, attempt_started, error, latency_ms)
            .await
            .map_err(not_found_as(job_id))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl PatternStore for PgStore {
    async fn get_pattern(&self, pattern_id: Uuid) -> Result<Option<Pattern>, StoreError> {
        Ok(pattern_queries::get_pattern(&self.pool, pattern_id).await?)
    }
}

#[async_trait]
impl WebhookStore for PgStore {
    async fn active_webhooks(
        &self,
        user_id: &str,
        event: WebhookEvent,
    ) -> Result<Vec<Webhook>, StoreError> {
        Ok(webhook_queries::active_webhooks_for_event(&self.pool, user_id, event).await?)
    }

    async fn touch_last_triggered(
        &self,
        webhook_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        Ok(webhook_queries::touch_last_triggered(&self.pool, webhook_id, at).await?)
    }
}
