//! Signed, best-effort webhook delivery of job outcomes.
//!
//! Every matching endpoint gets its own task. A failed delivery is logged and
//! dropped: there is no retry, and one endpoint never holds up another.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::Rng;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use sha2::Sha256;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::models::webhook::{Webhook, WebhookEvent, WebhookPayload};
use crate::store::WebhookStore;

/// Header carrying `sha256=<hex>` over the exact body bytes.
pub const SIGNATURE_HEADER: &str = "X-ImgGo-Signature";

/// Timeout for a single delivery attempt.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

const SIGNATURE_PREFIX: &str = "sha256=";

/// HMAC-SHA256 digest length in bytes.
const SIGNATURE_LEN: usize = 32;

/// Length of generated signing secrets, excluding the prefix.
const SECRET_LENGTH: usize = 32;

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

/// Sign a payload, returning the `sha256=<hex>` header value.
pub fn sign(payload: &[u8], secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload);
    format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}

/// Receiver-side check of a `sha256=<hex>` signature.
///
/// Signatures of the wrong length are rejected before any comparison; the
/// digest comparison itself is constant-time.
pub fn verify(payload: &[u8], signature: &str, secret: &str) -> bool {
    let Some(encoded) = signature.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    if encoded.len() != SIGNATURE_LEN * 2 {
        return false;
    }
    let Ok(provided) = hex::decode(encoded) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&provided).is_ok()
}

/// Generate a signing secret for a webhook registered without one.
pub fn generate_secret() -> String {
    let random: String = rand::rng()
        .sample_iter(&rand::distr::Alphanumeric)
        .take(SECRET_LENGTH)
        .map(char::from)
        .collect();
    format!("whsec_{random}")
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// A job outcome to announce.
#[derive(Debug, Clone)]
pub struct JobNotification {
    pub user_id: String,
    pub event: WebhookEvent,
    pub job_id: Uuid,
    pub pattern_id: Uuid,
    pub manifest: Option<serde_json::Value>,
    pub error: Option<String>,
    pub extras: serde_json::Map<String, serde_json::Value>,
}

/// What happened to one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub attempted: usize,
    pub delivered: usize,
}

/// Delivers job outcome events to subscriber endpoints.
#[derive(Clone)]
pub struct WebhookDispatcher {
    http: Client,
    webhooks: Arc<dyn WebhookStore>,
}

impl WebhookDispatcher {
    pub fn new(webhooks: Arc<dyn WebhookStore>, timeout: Duration) -> Result<Self, WebhookError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http, webhooks })
    }

    /// Deliver `notification` to every active webhook of the user that
    /// subscribes to its event. Never fails; outcomes are logged.
    pub async fn notify(&self, notification: JobNotification) -> DispatchSummary {
        let hooks = match self
            .webhooks
            .active_webhooks(&notification.user_id, notification.event)
            .await
        {
            Ok(hooks) => hooks,
            Err(e) => {
                tracing::error!(
                    job_id = %notification.job_id,
                    error = %e,
                    "Webhook lookup failed, skipping notification"
                );
                return DispatchSummary::default();
            }
        };

        if hooks.is_empty() {
            return DispatchSummary::default();
        }

        let payload = WebhookPayload {
            event: notification.event,
            job_id: notification.job_id,
            pattern_id: notification.pattern_id,
            manifest: notification.manifest,
            error: notification.error,
            timestamp: Utc::now(),
            extras: notification.extras,
        };
        let body = match serde_json::to_vec(&payload) {
            Ok(body) => Arc::new(body),
            Err(e) => {
                tracing::error!(job_id = %payload.job_id, error = %e, "Webhook payload serialization failed");
                return DispatchSummary::default();
            }
        };

        let mut tasks = JoinSet::new();
        for hook in hooks {
            let http = self.http.clone();
            let store = Arc::clone(&self.webhooks);
            let body = Arc::clone(&body);
            let job_id = payload.job_id;
            tasks.spawn(async move { deliver_and_record(http, store, hook, body, job_id).await });
        }

        let mut summary = DispatchSummary::default();
        while let Some(joined) = tasks.join_next().await {
            summary.attempted += 1;
            match joined {
                Ok(true) => summary.delivered += 1,
                Ok(false) => {}
                Err(e) => tracing::error!(error = %e, "Webhook delivery task panicked"),
            }
        }

        tracing::info!(
            job_id = %payload.job_id,
            event = %payload.event,
            attempted = summary.attempted,
            delivered = summary.delivered,
            "Webhook fan-out finished"
        );
        summary
    }
}

async fn deliver_and_record(
    http: Client,
    store: Arc<dyn WebhookStore>,
    hook: Webhook,
    body: Arc<Vec<u8>>,
    job_id: Uuid,
) -> bool {
    match deliver(&http, &hook, &body).await {
        Ok(()) => {
            metrics::counter!("webhook_deliveries_total", "outcome" => "delivered").increment(1);
            if let Err(e) = store.touch_last_triggered(hook.id, Utc::now()).await {
                tracing::warn!(webhook_id = %hook.id, error = %e, "Failed to record webhook trigger time");
            }
            true
        }
        Err(e) => {
            metrics::counter!("webhook_deliveries_total", "outcome" => "failed").increment(1);
            tracing::warn!(
                webhook_id = %hook.id,
                job_id = %job_id,
                url = %hook.url,
                error = %e,
                "Webhook delivery failed"
            );
            false
        }
    }
}

/// Execute a single signed POST and check the response status.
async fn deliver(http: &Client, hook: &Webhook, body: &[u8]) -> Result<(), WebhookError> {
    let response = http
        .post(&hook.url)
        .header(CONTENT_TYPE, "application/json")
        .header(SIGNATURE_HEADER, sign(body, &hook.secret))
        .body(body.to_vec())
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(WebhookError::HttpStatus(response.status().as_u16()));
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// Network, DNS, timeout or client construction failure.
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Webhook returned HTTP {0}")]
    HttpStatus(u16),
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";

    #[test]
    fn test_signature_format() {
        let signature = sign(b"{}", SECRET);
        assert!(signature.starts_with("sha256="));
        assert_eq!(signature.len(), "sha256=".len() + 64);
        assert!(signature["sha256=".len()..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_known_vector() {
        // RFC 4231 test case 2.
        let signature = sign(b"what do ya want for nothing?", "Jefe");
        assert_eq!(
            signature,
            "sha256=5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_verify_accepts_own_signature() {
        let payloads: [&[u8]; 3] = [b"", b"{\"event\":\"job.succeeded\"}", &[0xff, 0x00, 0x10]];
        for payload in payloads {
            let signature = sign(payload, SECRET);
            assert!(verify(payload, &signature, SECRET));
        }
    }

    #[test]
    fn test_verify_rejects_any_flipped_byte() {
        let payload = b"{\"job_id\":\"1\"}";
        let signature = sign(payload, SECRET);
        let hex_part = &signature["sha256=".len()..];
        let mut raw = hex::decode(hex_part).unwrap();
        for i in 0..raw.len() {
            raw[i] ^= 0x01;
            let tampered = format!("sha256={}", hex::encode(&raw));
            assert!(!verify(payload, &tampered, SECRET), "byte {i} flip accepted");
            raw[i] ^= 0x01;
        }
    }

    #[test]
    fn test_verify_rejects_wrong_length_prefix_and_secret() {
        let payload = b"body";
        let signature = sign(payload, SECRET);
        assert!(!verify(payload, &signature[..signature.len() - 2], SECRET));
        assert!(!verify(payload, &format!("{signature}00"), SECRET));
        assert!(!verify(payload, &signature["sha256=".len()..], SECRET));
        assert!(!verify(payload, &signature, "other-secret"));
        assert!(!verify(b"body!", &signature, SECRET));
        assert!(!verify(payload, "sha256=zz", SECRET));
    }

    #[test]
    fn test_generated_secrets() {
        let a = generate_secret();
        let b = generate_secret();
        assert!(a.starts_with("whsec_"));
        assert_eq!(a.len(), "whsec_".len() + SECRET_LENGTH);
        assert_ne!(a, b);
    }

    #[test]
    fn test_webhook_error_display_http_status() {
        assert_eq!(WebhookError::HttpStatus(502).to_string(), "Webhook returned HTTP 502");
    }
}
