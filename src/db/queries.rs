use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

use crate::models::job::{Job, JobStatus, NewJob, TerminalWrite};
use crate::models::manifest::Manifest;

const JOB_COLUMNS: &str = "id, user_id, pattern_id, image_url, extras, idempotency_key, status, \
     manifest, error, latency_ms, created_at, started_at, completed_at, updated_at";

fn job_from_row(row: &PgRow) -> Result<Job, sqlx::Error> {
    let status_str: String = row.try_get("status")?;
    let status = JobStatus::from_str(&status_str).map_err(|e| sqlx::Error::ColumnDecode {
        index: "status".to_string(),
        source: Box::new(e),
    })?;

    let extras = match row.try_get::<serde_json::Value, _>("extras")? {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };

    let manifest: Option<serde_json::Value> = row.try_get("manifest")?;

    Ok(Job {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        pattern_id: row.try_get("pattern_id")?,
        image_url: row.try_get("image_url")?,
        extras,
        idempotency_key: row.try_get("idempotency_key")?,
        status,
        manifest: manifest.map(Manifest::from_stored),
        error: row.try_get("error")?,
        latency_ms: row.try_get("latency_ms")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Insert a new queued job
pub async fn create_job(pool: &PgPool, id: Uuid, new: &NewJob) -> Result<Job, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO jobs (id, user_id, pattern_id, image_url, extras, idempotency_key, status)
        VALUES ($1, $2, $3, $4, $5, $6, 'queued')
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(id)
    .bind(&new.user_id)
    .bind(new.pattern_id)
    .bind(&new.image_url)
    .bind(serde_json::Value::Object(new.extras.clone()))
    .bind(&new.idempotency_key)
    .fetch_one(pool)
    .await?;

    job_from_row(&row)
}

/// Get a job by ID
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<Job>, sqlx::Error> {
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
        .bind(job_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Move a job to running and stamp `started_at`.
///
/// Allowed from `queued`, and from `running` when a message is redelivered.
/// Returns whether a row changed.
pub async fn mark_running(pool: &PgPool, job_id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'running',
            started_at = NOW(),
            updated_at = NOW()
        WHERE id = $1
          AND status IN ('queued', 'running')
        "#,
    )
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Write the succeeded outcome unless the job is already terminal.
///
/// A `queued` row means the attempt's running write was lost, so
/// `started_at` falls back to `attempt_started`.
pub async fn complete_succeeded(
    pool: &PgPool,
    job_id: Uuid,
    attempt_started: DateTime<Utc>,
    manifest: &Manifest,
    latency_ms: i64,
) -> Result<TerminalWrite, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'succeeded',
            manifest = $2,
            error = NULL,
            latency_ms = $3,
            started_at = COALESCE(started_at, $4),
            completed_at = NOW(),
            updated_at = NOW()
        WHERE id = $1
          AND status IN ('queued', 'running')
        "#,
    )
    .bind(job_id)
    .bind(manifest.to_stored())
    .bind(latency_ms)
    .bind(attempt_started)
    .execute(pool)
    .await?;

    terminal_outcome(pool, job_id, result.rows_affected()).await
}

/// Write the failed outcome unless the job is already terminal.
pub async fn complete_failed(
    pool: &PgPool,
    job_id: Uuid,
    attempt_started: DateTime<Utc>,
    error: &str,
    latency_ms: i64,
) -> Result<TerminalWrite, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'failed',
            manifest = NULL,
            error = $2,
            latency_ms = $3,
            started_at = COALESCE(started_at, $4),
            completed_at = NOW(),
            updated_at = NOW()
        WHERE id = $1
          AND status IN ('queued', 'running')
        "#,
    )
    .bind(job_id)
    .bind(error)
    .bind(latency_ms)
    .bind(attempt_started)
    .execute(pool)
    .await?;

    terminal_outcome(pool, job_id, result.rows_affected()).await
}

async fn terminal_outcome(
    pool: &PgPool,
    job_id: Uuid,
    rows_affected: u64,
) -> Result<TerminalWrite, sqlx::Error> {
    if rows_affected > 0 {
        return Ok(TerminalWrite::Applied);
    }

    let exists = sqlx::query("SELECT 1 FROM jobs WHERE id = $1")
        .bind(job_id)
        .fetch_optional(pool)
        .await?
        .is_some();

    if exists {
        Ok(TerminalWrite::AlreadyTerminal)
    } else {
        Err(sqlx::Error::RowNotFound)
    }
}
