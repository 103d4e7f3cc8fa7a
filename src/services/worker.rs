//! Worker Loop: drains the queue and drives each job to a terminal state.
//!
//! Per message: mark the job running (best effort), load its pattern, run
//! inference under the strict schema, then write exactly one terminal state.
//! Success acknowledges the message; failure archives it. Nothing is retried
//! in-process; a lease that expires before either call simply redelivers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::WorkerSettings;
use crate::models::job::TerminalWrite;
use crate::models::manifest::Manifest;
use crate::models::submission::JobMessage;
use crate::models::webhook::WebhookEvent;
use crate::services::converter;
use crate::services::inference::{InferenceError, InferenceProvider, InferenceRequest};
use crate::services::queue::{QueueError, QueueMessage, QueueTransport};
use crate::services::schema;
use crate::services::webhook::{JobNotification, WebhookDispatcher};
use crate::store::{JobStore, PatternStore, StoreError};

/// How one message ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
    /// Another attempt already finished the job; the message was acknowledged.
    Duplicate,
    /// The terminal write itself failed; the message was archived.
    Unrecorded,
}

#[derive(Clone)]
pub struct Worker {
    queue: Arc<dyn QueueTransport>,
    jobs: Arc<dyn JobStore>,
    patterns: Arc<dyn PatternStore>,
    inference: Arc<dyn InferenceProvider>,
    webhooks: WebhookDispatcher,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn QueueTransport>,
        jobs: Arc<dyn JobStore>,
        patterns: Arc<dyn PatternStore>,
        inference: Arc<dyn InferenceProvider>,
        webhooks: WebhookDispatcher,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            jobs,
            patterns,
            inference,
            webhooks,
            settings,
        }
    }

    /// Poll until `shutdown` turns true (or its sender goes away).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            batch_size = self.settings.batch_size,
            visibility_secs = self.settings.visibility_timeout.as_secs(),
            "Worker loop started"
        );

        loop {
            let stopping = *shutdown.borrow();
            if stopping {
                break;
            }

            let idle = match self.run_once().await {
                Ok(0) => true,
                Ok(processed) => {
                    tracing::debug!(processed, "Batch finished");
                    false
                }
                Err(e) => {
                    tracing::error!(error = %e, "Queue lease failed, backing off");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        tracing::info!("Worker loop stopped");
    }

    /// Lease one batch and process it concurrently.
    /// Returns the number of messages handled.
    pub async fn run_once(&self) -> Result<usize, QueueError> {
        let batch = self
            .queue
            .lease(self.settings.visibility_timeout, self.settings.batch_size)
            .await?;

        if let Ok(depth) = self.queue.depth().await {
            metrics::gauge!("manifest_queue_depth").set(depth as f64);
        }

        let count = batch.len();
        let mut tasks = JoinSet::new();
        for message in batch {
            let worker = self.clone();
            tasks.spawn(async move { worker.process_message(message).await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Message task panicked");
            }
        }
        Ok(count)
    }

    pub async fn process_message(&self, message: QueueMessage) -> Outcome {
        let job_id = message.payload.job_id;
        if message.read_ct > 1 {
            tracing::warn!(
                job_id = %job_id,
                msg_id = message.msg_id,
                read_ct = message.read_ct,
                "Processing redelivered message"
            );
        }

        let attempt_started = Utc::now();
        if let Err(e) = self.jobs.mark_running(job_id).await {
            tracing::warn!(job_id = %job_id, error = %e, "Could not mark job running, continuing");
        }

        let started = Instant::now();
        let result = self.produce_manifest(&message.payload).await;
        let latency_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

        match result {
            Ok(value) => {
                self.finish_succeeded(&message, attempt_started, value, latency_ms)
                    .await
            }
            Err(e) => {
                self.finish_failed(&message, attempt_started, e, latency_ms)
                    .await
            }
        }
    }

    async fn produce_manifest(&self, message: &JobMessage) -> Result<Value, ProcessError> {
        let pattern = self
            .patterns
            .get_pattern(message.pattern_id)
            .await
            .map_err(ProcessError::PatternLookup)?
            .ok_or(ProcessError::PatternNotFound(message.pattern_id))?;

        let strict = schema::strict_output_schema(&pattern.json_schema);
        let request = InferenceRequest {
            image_url: message.image_url.clone(),
            instructions: pattern.instructions.clone(),
            schema: strict.clone(),
            model_profile: pattern.model_profile.clone(),
            extras: message.extras.clone(),
        };

        let timeout = self.settings.inference_timeout;
        let started = Instant::now();
        let output = tokio::time::timeout(timeout, self.inference.extract(&request))
            .await
            .map_err(|_| InferenceError::Timeout(timeout))??;
        metrics::histogram!("inference_latency_seconds").record(started.elapsed().as_secs_f64());

        schema::check_conformance(&output, &strict).map_err(InferenceError::NonConforming)?;
        Ok(converter::restore_order(&output, &pattern))
    }

    async fn finish_succeeded(
        &self,
        message: &QueueMessage,
        attempt_started: DateTime<Utc>,
        value: Value,
        latency_ms: i64,
    ) -> Outcome {
        let job_id = message.payload.job_id;
        let manifest = Manifest::Structured(value.clone());

        match self
            .jobs
            .complete_succeeded(job_id, attempt_started, &manifest, latency_ms).await {
            Ok(TerminalWrite::Applied) => {
                metrics::counter!("manifest_jobs_succeeded_total").increment(1);
                tracing::info!(job_id = %job_id, latency_ms, "Job succeeded");
                self.acknowledge(message).await;
                self.announce(&message.payload, WebhookEvent::JobSucceeded, Some(value), None)
                    .await;
                Outcome::Succeeded
            }
            Ok(TerminalWrite::AlreadyTerminal) => {
                tracing::info!(job_id = %job_id, "Job already terminal, dropping duplicate");
                self.acknowledge(message).await;
                Outcome::Duplicate
            }
            Err(e) => self.unrecorded(message, e).await,
        }
    }

    async fn finish_failed(
        &self,
        message: &QueueMessage,
        attempt_started: DateTime<Utc>,
        error: ProcessError,
        latency_ms: i64,
    ) -> Outcome {
        let job_id = message.payload.job_id;
        let reason = error.to_string();

        match self
            .jobs
            .complete_failed(job_id, attempt_started, &reason, latency_ms).await {
            Ok(TerminalWrite::Applied) => {
                metrics::counter!("manifest_jobs_failed_total").increment(1);
                tracing::warn!(job_id = %job_id, latency_ms, error = %reason, "Job failed");
                self.archive(message).await;
                self.announce(&message.payload, WebhookEvent::JobFailed, None, Some(reason))
                    .await;
                Outcome::Failed
            }
            Ok(TerminalWrite::AlreadyTerminal) => {
                tracing::info!(job_id = %job_id, error = %reason, "Job already terminal, dropping duplicate");
                self.acknowledge(message).await;
                Outcome::Duplicate
            }
            Err(e) => self.unrecorded(message, e).await,
        }
    }

    async fn unrecorded(&self, message: &QueueMessage, error: StoreError) -> Outcome {
        tracing::error!(
            job_id = %message.payload.job_id,
            msg_id = message.msg_id,
            error = %error,
            "Terminal write failed, archiving message"
        );
        self.archive(message).await;
        Outcome::Unrecorded
    }

    async fn acknowledge(&self, message: &QueueMessage) {
        if let Err(e) = self.queue.acknowledge(message.msg_id).await {
            tracing::error!(msg_id = message.msg_id, error = %e, "Failed to acknowledge message");
        }
    }

    async fn archive(&self, message: &QueueMessage) {
        if let Err(e) = self.queue.dead_letter(message.msg_id).await {
            tracing::error!(msg_id = message.msg_id, error = %e, "Failed to archive message");
        }
    }

    async fn announce(
        &self,
        message: &JobMessage,
        event: WebhookEvent,
        manifest: Option<Value>,
        error: Option<String>,
    ) {
        // The message carries no owner, so it is read back from the job row.
        let user_id = match self.jobs.get_job(message.job_id).await {
            Ok(Some(job)) => job.user_id,
            Ok(None) => {
                tracing::warn!(job_id = %message.job_id, "Job vanished before notification");
                return;
            }
            Err(e) => {
                tracing::error!(job_id = %message.job_id, error = %e, "Job lookup for notification failed");
                return;
            }
        };

        self.webhooks
            .notify(JobNotification {
                user_id,
                event,
                job_id: message.job_id,
                pattern_id: message.pattern_id,
                manifest,
                error,
                extras: message.extras.clone(),
            })
            .await;
    }
}

/// Everything that decides a job's fate. The `Display` text becomes `Job.error`.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Pattern {0} not found")]
    PatternNotFound(Uuid),

    #[error("Pattern lookup failed: {0}")]
    PatternLookup(StoreError),

    #[error(transparent)]
    Inference(#[from] InferenceError),
}
