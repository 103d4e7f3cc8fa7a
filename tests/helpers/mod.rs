//! Shared fixtures for the in-memory pipeline tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use serde_json::{json, Value};
use uuid::Uuid;

use imggo_pipeline::config::WorkerSettings;
use imggo_pipeline::models::job::{Job, NewJob};
use imggo_pipeline::models::manifest::ManifestFormat;
use imggo_pipeline::models::pattern::{CsvDelimiter, Pattern};
use imggo_pipeline::models::submission::JobMessage;
use imggo_pipeline::models::webhook::{Webhook, WebhookEvent};
use imggo_pipeline::services::inference::{
    InferenceError, InferenceProvider, InferenceRequest, DEFAULT_PROFILE,
};
use imggo_pipeline::services::queue::{MemoryQueue, MessageId, QueueTransport};
use imggo_pipeline::services::webhook::{WebhookDispatcher, SIGNATURE_HEADER};
use imggo_pipeline::services::worker::Worker;
use imggo_pipeline::store::{JobStore, MemoryStore};

pub const USER: &str = "user-1";
pub const SECRET: &str = "whsec_integration";

/// Pattern whose schema requires `a` then `b` but declares `b` first.
pub fn ab_pattern() -> Pattern {
    pattern(
        ManifestFormat::Json,
        json!({
            "type": "object",
            "required": ["a", "b"],
            "properties": {
                "b": {"type": "string"},
                "a": {"type": "string"}
            }
        }),
    )
}

pub fn pattern(format: ManifestFormat, json_schema: Value) -> Pattern {
    Pattern {
        id: Uuid::new_v4(),
        user_id: USER.to_string(),
        name: "receipt".to_string(),
        version: 1,
        format,
        instructions: "Extract the fields.".to_string(),
        json_schema,
        yaml_schema: None,
        xml_schema: None,
        csv_schema: None,
        plain_text_schema: None,
        csv_delimiter: CsvDelimiter::Comma,
        model_profile: DEFAULT_PROFILE.to_string(),
    }
}

pub fn webhook(url: &str, events: Vec<WebhookEvent>) -> Webhook {
    Webhook {
        id: Uuid::new_v4(),
        user_id: USER.to_string(),
        url: url.to_string(),
        secret: SECRET.to_string(),
        events,
        is_active: true,
        last_triggered_at: None,
    }
}

// ---------------------------------------------------------------------------
// Inference
// ---------------------------------------------------------------------------

/// One scripted provider answer.
pub enum Step {
    Reply(Value),
    Status(u16),
    /// Never answers; only the worker's timeout ends the call.
    Hang,
}

/// Provider that plays back a fixed list of answers and records requests.
#[derive(Default)]
pub struct ScriptedProvider {
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<InferenceRequest>>,
}

impl ScriptedProvider {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            ..Self::default()
        }
    }

    pub fn replying(value: Value) -> Self {
        Self::new(vec![Step::Reply(value)])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<InferenceRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl InferenceProvider for ScriptedProvider {
    async fn extract(&self, request: &InferenceRequest) -> Result<Value, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Reply(value)) => Ok(value),
            Some(Step::Status(status)) => Err(InferenceError::Status {
                status,
                body: "scripted failure".to_string(),
            }),
            Some(Step::Hang) => std::future::pending().await,
            None => Err(InferenceError::Malformed("script exhausted".to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Worker harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub queue: Arc<MemoryQueue>,
    pub store: Arc<MemoryStore>,
    pub provider: Arc<ScriptedProvider>,
    pub worker: Worker,
}

pub fn settings() -> WorkerSettings {
    WorkerSettings {
        batch_size: 5,
        visibility_timeout: Duration::from_secs(300),
        poll_interval: Duration::from_millis(50),
        inference_timeout: Duration::from_secs(2),
    }
}

pub fn harness(provider: ScriptedProvider) -> Harness {
    harness_with(provider, settings())
}

pub fn harness_with(provider: ScriptedProvider, settings: WorkerSettings) -> Harness {
    let queue = Arc::new(MemoryQueue::new());
    let store = Arc::new(MemoryStore::new());
    let provider = Arc::new(provider);
    let dispatcher = WebhookDispatcher::new(store.clone(), Duration::from_secs(5))
        .expect("webhook client");
    let worker = Worker::new(
        queue.clone(),
        store.clone(),
        store.clone(),
        provider.clone(),
        dispatcher,
        settings,
    );
    Harness {
        queue,
        store,
        provider,
        worker,
    }
}

impl Harness {
    /// Create a queued job and enqueue its message, as the API does.
    pub async fn submit(&self, pattern_id: Uuid) -> (Uuid, MessageId) {
        self.submit_with_extras(pattern_id, serde_json::Map::new()).await
    }

    pub async fn submit_with_extras(
        &self,
        pattern_id: Uuid,
        extras: serde_json::Map<String, Value>,
    ) -> (Uuid, MessageId) {
        let job = self
            .store
            .create_job(NewJob {
                user_id: USER.to_string(),
                pattern_id,
                image_url: "https://img.example.com/receipt.png".to_string(),
                extras: extras.clone(),
                idempotency_key: None,
            })
            .await
            .unwrap();
        let msg_id = self
            .queue
            .enqueue(&JobMessage {
                job_id: job.id,
                pattern_id,
                image_url: job.image_url.clone(),
                extras,
            })
            .await
            .unwrap();
        (job.id, msg_id)
    }

    pub async fn job(&self, job_id: Uuid) -> Job {
        self.store.get_job(job_id).await.unwrap().unwrap()
    }
}

// ---------------------------------------------------------------------------
// Webhook receiver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Delivery {
    pub signature: Option<String>,
    pub body: Vec<u8>,
}

impl Delivery {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

#[derive(Clone)]
struct ReceiverState {
    status: StatusCode,
    deliveries: Arc<Mutex<Vec<Delivery>>>,
}

/// A throwaway HTTP endpoint that records every POST it receives.
pub struct Receiver {
    pub url: String,
    deliveries: Arc<Mutex<Vec<Delivery>>>,
}

impl Receiver {
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }
}

async fn receive(
    State(state): State<ReceiverState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.deliveries.lock().unwrap().push(Delivery {
        signature,
        body: body.to_vec(),
    });
    state.status
}

/// Start a receiver on an ephemeral port that answers every POST with `status`.
pub async fn spawn_receiver(status: StatusCode) -> Receiver {
    let deliveries = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new().route("/hook", post(receive)).with_state(ReceiverState {
        status,
        deliveries: deliveries.clone(),
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Receiver {
        url: format!("http://{addr}/hook"),
        deliveries,
    }
}

/// A URL on which nothing listens.
pub async fn closed_endpoint() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}/hook")
}
