use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

use crate::models::webhook::{Webhook, WebhookEvent};

/// Active webhooks of a user subscribed to `event`
pub async fn active_webhooks_for_event(
    pool: &PgPool,
    user_id: &str,
    event: WebhookEvent,
) -> Result<Vec<Webhook>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT id, user_id, url, secret, events, is_active, last_triggered_at
        FROM webhooks
        WHERE user_id = $1
          AND is_active
          AND $2 = ANY(events)
        "#,
    )
    .bind(user_id)
    .bind(event.to_string())
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|r| {
            let events: Vec<String> = r.try_get("events")?;
            Ok(Webhook {
                id: r.try_get("id")?,
                user_id: r.try_get("user_id")?,
                url: r.try_get("url")?,
                secret: r.try_get("secret")?,
                // Unknown event names are ignored rather than failing the lookup.
                events: events
                    .iter()
                    .filter_map(|e| WebhookEvent::from_str(e).ok())
                    .collect(),
                is_active: r.try_get("is_active")?,
                last_triggered_at: r.try_get("last_triggered_at")?,
            })
        })
        .collect()
}

/// Record a successful delivery
pub async fn touch_last_triggered(
    pool: &PgPool,
    webhook_id: Uuid,
    at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE webhooks SET last_triggered_at = $1 WHERE id = $2")
        .bind(at)
        .bind(webhook_id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Insert a webhook subscription
pub async fn insert_webhook(pool: &PgPool, webhook: &Webhook) -> Result<(), sqlx::Error> {
    let events: Vec<String> = webhook.events.iter().map(ToString::to_string).collect();
    sqlx::query(
        r#"
        INSERT INTO webhooks (id, user_id, url, secret, events, is_active, last_triggered_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(webhook.id)
    .bind(&webhook.user_id)
    .bind(&webhook.url)
    .bind(&webhook.secret)
    .bind(&events)
    .bind(webhook.is_active)
    .bind(webhook.last_triggered_at)
    .execute(pool)
    .await?;

    Ok(())
}
