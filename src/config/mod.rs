use serde::Deserialize;
use std::time::Duration;

/// Upper bound on messages leased per worker iteration.
pub const MAX_BATCH_SIZE: usize = 10;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the job queue
    pub redis_url: String,

    /// Queue name; prefixes every Redis key the queue uses
    #[serde(default = "default_queue_name")]
    pub queue_name: String,

    /// Cloudflare account ID
    pub cf_account_id: String,

    /// Cloudflare Workers AI API token
    pub cf_api_token: String,

    /// Vision model used for the `default` model profile
    #[serde(default = "default_inference_model")]
    pub inference_model: String,

    #[serde(default = "default_inference_timeout_secs")]
    pub inference_timeout_secs: u64,

    /// Messages leased per worker iteration (clamped to 1..=10)
    #[serde(default = "default_worker_batch_size")]
    pub worker_batch_size: usize,

    /// Lease length; must cover the slowest expected inference call
    #[serde(default = "default_worker_visibility_timeout_secs")]
    pub worker_visibility_timeout_secs: u64,

    /// Idle sleep between polls of an empty queue
    #[serde(default = "default_worker_poll_interval_ms")]
    pub worker_poll_interval_ms: u64,

    #[serde(default = "default_webhook_timeout_secs")]
    pub webhook_timeout_secs: u64,
}

/// Worker loop tuning derived from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub batch_size: usize,
    pub visibility_timeout: Duration,
    pub poll_interval: Duration,
    pub inference_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            batch_size: default_worker_batch_size(),
            visibility_timeout: Duration::from_secs(default_worker_visibility_timeout_secs()),
            poll_interval: Duration::from_millis(default_worker_poll_interval_ms()),
            inference_timeout: Duration::from_secs(default_inference_timeout_secs()),
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_queue_name() -> String {
    "manifest_jobs".to_string()
}

fn default_inference_model() -> String {
    "@cf/meta/llama-3.2-11b-vision-instruct".to_string()
}

fn default_inference_timeout_secs() -> u64 {
    120
}

fn default_worker_batch_size() -> usize {
    5
}

fn default_worker_visibility_timeout_secs() -> u64 {
    300
}

fn default_worker_poll_interval_ms() -> u64 {
    1000
}

fn default_webhook_timeout_secs() -> u64 {
    30
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            batch_size: self.worker_batch_size.clamp(1, MAX_BATCH_SIZE),
            visibility_timeout: Duration::from_secs(self.worker_visibility_timeout_secs),
            poll_interval: Duration::from_millis(self.worker_poll_interval_ms),
            inference_timeout: Duration::from_secs(self.inference_timeout_secs),
        }
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference_timeout_secs)
    }
}
