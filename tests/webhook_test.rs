//! Webhook fan-out against live local receivers.

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use serde_json::json;
use uuid::Uuid;

use helpers::*;
use imggo_pipeline::models::webhook::{WebhookEvent, WebhookPayload};
use imggo_pipeline::services::webhook::{
    verify, DispatchSummary, JobNotification, WebhookDispatcher,
};
use imggo_pipeline::store::MemoryStore;

fn notification(event: WebhookEvent) -> JobNotification {
    let (manifest, error) = match event {
        WebhookEvent::JobSucceeded => (Some(json!({"a": "1"})), None),
        WebhookEvent::JobFailed => (None, Some("Pattern gone".to_string())),
    };
    JobNotification {
        user_id: USER.to_string(),
        event,
        job_id: Uuid::new_v4(),
        pattern_id: Uuid::new_v4(),
        manifest,
        error,
        extras: Default::default(),
    }
}

fn dispatcher(store: &Arc<MemoryStore>) -> WebhookDispatcher {
    WebhookDispatcher::new(store.clone(), Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_delivery_is_signed_over_exact_body() {
    let receiver = spawn_receiver(StatusCode::OK).await;
    let store = Arc::new(MemoryStore::new());
    store.insert_webhook(webhook(&receiver.url, vec![WebhookEvent::JobSucceeded]));

    let sent = notification(WebhookEvent::JobSucceeded);
    let summary = dispatcher(&store).notify(sent.clone()).await;
    assert_eq!(summary, DispatchSummary { attempted: 1, delivered: 1 });

    let deliveries = receiver.deliveries();
    assert_eq!(deliveries.len(), 1);
    let delivery = &deliveries[0];
    let signature = delivery.signature.as_deref().unwrap();
    assert!(verify(&delivery.body, signature, SECRET));
    assert!(!verify(&delivery.body, signature, "whsec_other"));

    let payload: WebhookPayload = serde_json::from_slice(&delivery.body).unwrap();
    assert_eq!(payload.event, WebhookEvent::JobSucceeded);
    assert_eq!(payload.job_id, sent.job_id);
    assert_eq!(payload.pattern_id, sent.pattern_id);
    assert_eq!(payload.manifest, Some(json!({"a": "1"})));
    assert_eq!(payload.error, None);

    let body = delivery.json();
    assert_eq!(body["event"], "job.succeeded");
    assert!(body["error"].is_null());
}

#[tokio::test]
async fn test_failed_only_webhook_through_the_worker() {
    let receiver = spawn_receiver(StatusCode::OK).await;
    let h = harness(ScriptedProvider::new(vec![
        Step::Reply(json!({"a": "1", "b": "2"})),
        Step::Status(500),
    ]));
    let pattern = ab_pattern();
    h.store.insert_pattern(pattern.clone());
    h.store.insert_webhook(webhook(&receiver.url, vec![WebhookEvent::JobFailed]));

    let (succeeded_job, _) = h.submit(pattern.id).await;
    h.worker.run_once().await.unwrap();
    assert!(receiver.deliveries().is_empty());

    let (failed_job, _) = h.submit(pattern.id).await;
    h.worker.run_once().await.unwrap();

    let deliveries = receiver.deliveries();
    assert_eq!(deliveries.len(), 1);
    let body = deliveries[0].json();
    assert_eq!(body["event"], "job.failed");
    assert_eq!(body["job_id"], json!(failed_job));
    assert_ne!(body["job_id"], json!(succeeded_job));
    assert!(body["manifest"].is_null());
    assert!(body["error"].as_str().unwrap().contains("HTTP 500"));
}

#[tokio::test]
async fn test_success_payload_carries_ordered_manifest_and_extras() {
    let receiver = spawn_receiver(StatusCode::OK).await;
    let h = harness(ScriptedProvider::replying(json!({"b": "x", "a": "y"})));
    let pattern = ab_pattern();
    h.store.insert_pattern(pattern.clone());
    h.store.insert_webhook(webhook(&receiver.url, vec![WebhookEvent::JobSucceeded]));
    let mut extras = serde_json::Map::new();
    extras.insert("order_ref".to_string(), json!("PO-7"));
    h.submit_with_extras(pattern.id, extras).await;

    h.worker.run_once().await.unwrap();

    let deliveries = receiver.deliveries();
    assert_eq!(deliveries.len(), 1);
    let body = String::from_utf8(deliveries[0].body.clone()).unwrap();
    assert!(body.contains(r#""manifest":{"a":"y","b":"x"}"#), "{body}");
    assert_eq!(deliveries[0].json()["extras"]["order_ref"], "PO-7");
}

#[tokio::test]
async fn test_failing_endpoint_does_not_block_others() {
    let healthy = spawn_receiver(StatusCode::OK).await;
    let broken = spawn_receiver(StatusCode::INTERNAL_SERVER_ERROR).await;
    let unreachable = closed_endpoint().await;

    let store = Arc::new(MemoryStore::new());
    let healthy_hook = webhook(&healthy.url, vec![WebhookEvent::JobFailed]);
    let broken_hook = webhook(&broken.url, vec![WebhookEvent::JobFailed]);
    let unreachable_hook = webhook(&unreachable, vec![WebhookEvent::JobFailed]);
    store.insert_webhook(broken_hook.clone());
    store.insert_webhook(unreachable_hook.clone());
    store.insert_webhook(healthy_hook.clone());

    let summary = dispatcher(&store).notify(notification(WebhookEvent::JobFailed)).await;
    assert_eq!(summary, DispatchSummary { attempted: 3, delivered: 1 });

    assert_eq!(healthy.deliveries().len(), 1);
    assert_eq!(broken.deliveries().len(), 1);

    assert!(store.webhook(healthy_hook.id).unwrap().last_triggered_at.is_some());
    assert!(store.webhook(broken_hook.id).unwrap().last_triggered_at.is_none());
    assert!(store.webhook(unreachable_hook.id).unwrap().last_triggered_at.is_none());
}

#[tokio::test]
async fn test_inactive_and_foreign_webhooks_are_skipped() {
    let receiver = spawn_receiver(StatusCode::OK).await;
    let store = Arc::new(MemoryStore::new());

    let mut inactive = webhook(&receiver.url, vec![WebhookEvent::JobSucceeded]);
    inactive.is_active = false;
    store.insert_webhook(inactive);

    let mut foreign = webhook(&receiver.url, vec![WebhookEvent::JobSucceeded]);
    foreign.user_id = "someone-else".to_string();
    store.insert_webhook(foreign);

    let summary = dispatcher(&store).notify(notification(WebhookEvent::JobSucceeded)).await;
    assert_eq!(summary, DispatchSummary::default());
    assert!(receiver.deliveries().is_empty());
}

#[tokio::test]
async fn test_slow_endpoint_times_out() {
    use axum::routing::post;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = axum::Router::new().route(
        "/hook",
        post(|| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            StatusCode::OK
        }),
    );
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let store = Arc::new(MemoryStore::new());
    let hook = webhook(&format!("http://{addr}/hook"), vec![WebhookEvent::JobFailed]);
    store.insert_webhook(hook.clone());

    let dispatcher = WebhookDispatcher::new(store.clone(), Duration::from_millis(200)).unwrap();
    let summary = dispatcher.notify(notification(WebhookEvent::JobFailed)).await;
    assert_eq!(summary, DispatchSummary { attempted: 1, delivered: 0 });
    assert!(store.webhook(hook.id).unwrap().last_triggered_at.is_none());
}
