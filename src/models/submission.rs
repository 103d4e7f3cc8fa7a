use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::JobStatus;
use crate::models::manifest::ManifestFormat;

/// Request to run a pattern against an image.
#[derive(Debug, Deserialize, Validate)]
pub struct SubmitJobRequest {
    #[garde(skip)]
    pub pattern_id: Uuid,

    #[garde(url, length(max = 2048))]
    pub image_url: String,

    #[garde(skip)]
    #[serde(default)]
    pub extras: serde_json::Map<String, serde_json::Value>,

    #[garde(length(min = 1, max = 255))]
    pub idempotency_key: Option<String>,
}

/// Response after a job has been queued.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
}

/// Query string of the polling endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct JobQuery {
    pub format: Option<ManifestFormat>,
}

/// Wire shape of a queued message body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMessage {
    pub job_id: Uuid,
    pub pattern_id: Uuid,
    pub image_url: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extras: serde_json::Map<String, serde_json::Value>,
}
