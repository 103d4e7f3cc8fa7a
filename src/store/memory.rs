use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{JobStore, PatternStore, StoreError, WebhookStore};
use crate::models::job::{Job, JobStatus, NewJob, TerminalWrite};
use crate::models::manifest::Manifest;
use crate::models::pattern::Pattern;
use crate::models::webhook::{Webhook, WebhookEvent};

/// In-process store for local runs and tests.
///
/// `fail_running_writes` and `fail_terminal_writes` make the matching writes
/// return [`StoreError::Unavailable`], standing in for a database outage.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_running: AtomicBool,
    fail_terminal: AtomicBool,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    patterns: HashMap<Uuid, Pattern>,
    webhooks: Vec<Webhook>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_pattern(&self, pattern: Pattern) {
        self.lock().patterns.insert(pattern.id, pattern);
    }

    pub fn insert_webhook(&self, webhook: Webhook) {
        self.lock().webhooks.push(webhook);
    }

    pub fn webhook(&self, webhook_id: Uuid) -> Option<Webhook> {
        self.lock().webhooks.iter().find(|w| w.id == webhook_id).cloned()
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.lock().jobs.values().cloned().collect()
    }

    pub fn fail_running_writes(&self, fail: bool) {
        self.fail_running.store(fail, Ordering::SeqCst);
    }

    pub fn fail_terminal_writes(&self, fail: bool) {
        self.fail_terminal.store(fail, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn complete(
        &self,
        job_id: Uuid,
        attempt_started: DateTime<Utc>,
        next: JobStatus,
        apply: impl FnOnce(&mut Job),
    ) -> Result<TerminalWrite, StoreError> {
        if self.fail_terminal.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("terminal write rejected".to_string()));
        }

        let mut inner = self.lock();
        let job = inner.jobs.get_mut(&job_id).ok_or(StoreError::JobNotFound(job_id))?;
        if job.status.is_terminal() {
            return Ok(TerminalWrite::AlreadyTerminal);
        }

        // The attempt's running write was lost.
        if job.status == JobStatus::Queued {
            job.status = JobStatus::Running;
            job.started_at = Some(attempt_started);
        }
        if !job.status.can_transition_to(next) {
            return Ok(TerminalWrite::AlreadyTerminal);
        }

        let now = Utc::now();
        apply(job);
        job.status = next;
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(TerminalWrite::Applied)
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(&self, new: NewJob) -> Result<Job, StoreError> {
        let job = Job::new(Uuid::new_v4(), new, Utc::now());
        self.lock().jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.lock().jobs.get(&job_id).cloned())
    }

    async fn mark_running(&self, job_id: Uuid) -> Result<(), StoreError> {
        if self.fail_running.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("running write rejected".to_string()));
        }

        let mut inner = self.lock();
        let job = inner.jobs.get_mut(&job_id).ok_or(StoreError::JobNotFound(job_id))?;
        if job.status.can_transition_to(JobStatus::Running) {
            let now = Utc::now();
            job.status = JobStatus::Running;
            job.started_at = Some(now);
            job.updated_at = now;
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
        self.complete(job_id, attempt_started, JobStatus::Succeeded, |job| {
            job.manifest = Some(manifest.clone());
            job.error = None;
            job.latency_ms = Some(latency_ms);
        })
    }

    async fn complete_failed(
        &self,
        job_id: Uuid,
        attempt_started: DateTime<Utc>,
        error: &str,
        latency_ms: i64,
    ) -> Result<TerminalWrite, StoreError> {
        self.complete(job_id, attempt_started, JobStatus::Failed, |job| {
            job.manifest = None;
            job.error = Some(error.to_string());
            job.latency_ms = Some(latency_ms);
        })
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl PatternStore for MemoryStore {
    async fn get_pattern(&self, pattern_id: Uuid) -> Result<Option<Pattern>, StoreError> {
        Ok(self.lock().patterns.get(&pattern_id).cloned())
    }
}

#[async_trait]
impl WebhookStore for MemoryStore {
    async fn active_webhooks(
        &self,
        user_id: &str,
        event: WebhookEvent,
    ) -> Result<Vec<Webhook>, StoreError> {
        Ok(self
            .lock()
            .webhooks
            .iter()
            .filter(|w| w.user_id == user_id && w.wants(event))
            .cloned()
            .collect())
    }

    async fn touch_last_triggered(
        &self,
        webhook_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(webhook) = self.lock().webhooks.iter_mut().find(|w| w.id == webhook_id) {
            webhook.last_triggered_at = Some(at);
        }
        Ok(())
    }
}
