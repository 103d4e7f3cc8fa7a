use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Job outcome events a webhook can subscribe to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
pub enum WebhookEvent {
    #[serde(rename = "job.succeeded")]
    #[strum(serialize = "job.succeeded")]
    JobSucceeded,
    #[serde(rename = "job.failed")]
    #[strum(serialize = "job.failed")]
    JobFailed,
}

/// A subscriber endpoint registered by a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub id: Uuid,
    pub user_id: String,
    pub url: String,
    /// HMAC-SHA256 signing key.
    pub secret: String,
    pub events: Vec<WebhookEvent>,
    pub is_active: bool,
    pub last_triggered_at: Option<DateTime<Utc>>,
}

impl Webhook {
    pub fn wants(&self, event: WebhookEvent) -> bool {
        self.is_active && self.events.contains(&event)
    }
}

/// JSON body POSTed to subscriber endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookPayload {
    pub event: WebhookEvent,
    pub job_id: Uuid,
    pub pattern_id: Uuid,
    pub manifest: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extras: serde_json::Map<String, serde_json::Value>,
}
