use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};

/// Profile name that maps to the client's configured model.
pub const DEFAULT_PROFILE: &str = "default";

const SYSTEM_PROMPT: &str = concat!(
    "You extract structured data from images. ",
    "Answer with a single JSON object that matches the provided schema exactly. ",
    "Do not add fields that the schema does not declare."
);

/// Everything the provider needs for one extraction.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub image_url: String,
    pub instructions: String,
    /// Strict output schema (see [`crate::services::schema::strict_output_schema`]).
    pub schema: Value,
    pub model_profile: String,
    pub extras: Map<String, Value>,
}

/// An image-understanding model that answers with schema-shaped JSON.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    /// Run one extraction and return the model's JSON object.
    async fn extract(&self, request: &InferenceRequest) -> Result<Value, InferenceError>;
}

/// Client for Cloudflare Workers AI vision models.
pub struct WorkersAiClient {
    http: Client,
    account_id: String,
    api_token: String,
    default_model: String,
}

#[derive(Deserialize)]
struct WorkersAiResponse {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    result: Option<WorkersAiResult>,
    #[serde(default)]
    errors: Vec<Value>,
}

#[derive(Deserialize)]
struct WorkersAiResult {
    response: Value,
}

impl WorkersAiClient {
    pub fn new(
        account_id: &str,
        api_token: &str,
        default_model: &str,
        timeout: Duration,
    ) -> Result<Self, InferenceError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            account_id: account_id.to_string(),
            api_token: api_token.to_string(),
            default_model: default_model.to_string(),
        })
    }

    fn model_for(&self, profile: &str) -> String {
        if profile.starts_with("@cf/") {
            profile.to_string()
        } else {
            self.default_model.clone()
        }
    }

    /// Download the image and encode it as a data URL the model accepts.
    async fn image_data_url(&self, image_url: &str) -> Result<String, InferenceError> {
        let response = self.http.get(image_url).send().await?;
        if !response.status().is_success() {
            return Err(InferenceError::ImageFetch(response.status().as_u16()));
        }
        let bytes = response.bytes().await?;

        let format = image::guess_format(&bytes).map_err(|_| InferenceError::UnsupportedImage)?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
        Ok(format!("data:{};base64,{}", format.to_mime_type(), encoded))
    }
}

#[async_trait]
impl InferenceProvider for WorkersAiClient {
    async fn extract(&self, request: &InferenceRequest) -> Result<Value, InferenceError> {
        let model = self.model_for(&request.model_profile);
        let url = format!(
            "https://api.cloudflare.com/client/v4/accounts/{}/ai/run/{}",
            self.account_id, model
        );

        let image = self.image_data_url(&request.image_url).await?;
        let request_body = json!({
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {
                    "role": "user",
                    "content": [
                        {"type": "text", "text": build_prompt(request)},
                        {"type": "image_url", "image_url": {"url": image}}
                    ]
                }
            ],
            "response_format": {"type": "json_schema", "json_schema": request.schema},
            "max_tokens": 2048
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&request_body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: WorkersAiResponse = response.json().await?;
        match parsed.result {
            Some(result) if parsed.success != Some(false) => parse_model_output(result.response),
            _ => Err(InferenceError::Malformed(format!(
                "provider reported failure: {}",
                Value::Array(parsed.errors)
            ))),
        }
    }
}

fn build_prompt(request: &InferenceRequest) -> String {
    let mut prompt = request.instructions.trim().to_string();
    if !request.extras.is_empty() {
        prompt.push_str("\n\nAdditional context: ");
        prompt.push_str(&Value::Object(request.extras.clone()).to_string());
    }
    prompt
}

/// Turn the model's `response` field into a JSON object.
///
/// Models answer either with the object itself or with a string holding it,
/// sometimes wrapped in a Markdown code fence.
pub fn parse_model_output(response: Value) -> Result<Value, InferenceError> {
    let value = match response {
        Value::String(text) => serde_json::from_str(strip_code_fence(&text))
            .map_err(|e| InferenceError::Malformed(format!("response is not JSON: {e}")))?,
        other => other,
    };

    if value.is_object() {
        Ok(value)
    } else {
        Err(InferenceError::Malformed(
            "response is not a JSON object".to_string(),
        ))
    }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(body) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = body.strip_prefix("json").unwrap_or(body);
    body.strip_suffix("```").unwrap_or(body).trim()
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Inference request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Inference provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Image download returned HTTP {0}")]
    ImageFetch(u16),

    #[error("Image reference does not point to a supported image")]
    UnsupportedImage,

    #[error("Malformed inference response: {0}")]
    Malformed(String),

    #[error("Inference response does not match the schema: {0}")]
    NonConforming(String),

    #[error("Inference timed out after {0:?}")]
    Timeout(Duration),
}
