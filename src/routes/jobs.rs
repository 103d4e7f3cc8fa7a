use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use garde::Validate;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::job::{JobStatus, NewJob};
use crate::models::manifest::ManifestFormat;
use crate::models::submission::{JobMessage, JobQuery, SubmitJobRequest, SubmitJobResponse};
use crate::routes::error::{ApiError, ApiResult};
use crate::services::converter::{self, RenderedBody};

/// Header carrying the authenticated requester, set by the upstream gateway.
pub const USER_ID_HEADER: &str = "x-user-id";

fn requester(headers: &HeaderMap) -> ApiResult<String> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or(ApiError::MissingUser)
}

/// POST /api/v1/jobs: queue a pattern run against an image.
pub async fn submit_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SubmitJobRequest>,
) -> ApiResult<(StatusCode, Json<SubmitJobResponse>)> {
    let user_id = requester(&headers)?;
    request
        .validate()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    if state.patterns.get_pattern(request.pattern_id).await?.is_none() {
        return Err(ApiError::NotFound(format!(
            "Pattern {} not found",
            request.pattern_id
        )));
    }

    let job = state
        .jobs
        .create_job(NewJob {
            user_id,
            pattern_id: request.pattern_id,
            image_url: request.image_url,
            extras: request.extras,
            idempotency_key: request.idempotency_key,
        })
        .await?;

    let message = JobMessage {
        job_id: job.id,
        pattern_id: job.pattern_id,
        image_url: job.image_url.clone(),
        extras: job.extras.clone(),
    };

    match state.queue.enqueue(&message).await {
        Ok(msg_id) => {
            metrics::counter!("manifest_jobs_submitted_total").increment(1);
            tracing::info!(
                job_id = %job.id,
                pattern_id = %job.pattern_id,
                msg_id,
                "Job queued"
            );
            Ok((
                StatusCode::ACCEPTED,
                Json(SubmitJobResponse {
                    job_id: job.id,
                    status: JobStatus::Queued,
                }),
            ))
        }
        Err(e) => {
            // Left queued; the log and counter surface it to operators.
            metrics::counter!("manifest_jobs_enqueue_failed_total").increment(1);
            tracing::error!(
                job_id = %job.id,
                pattern_id = %job.pattern_id,
                error = %e,
                "Enqueue failed, job left queued"
            );
            Err(ApiError::QueueUnavailable(e))
        }
    }
}

/// GET /api/v1/jobs/{job_id}: poll a job, optionally re-rendering its manifest.
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Query(query): Query<JobQuery>,
) -> ApiResult<Response> {
    let job = state
        .jobs
        .get_job(job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Job {job_id} not found")))?;

    let Some(manifest) = job.manifest.as_ref() else {
        return Ok(Json(job.polling_view()).into_response());
    };

    let Some(pattern) = state.patterns.get_pattern(job.pattern_id).await? else {
        tracing::warn!(job_id = %job.id, pattern_id = %job.pattern_id, "Pattern gone, returning stored manifest");
        return Ok(Json(job.polling_view()).into_response());
    };

    let requested = query.format.unwrap_or(ManifestFormat::Json);
    let rendered = converter::render_manifest(manifest, &pattern, Some(requested))?;
    match rendered.body {
        RenderedBody::Json(value) => Ok(Json(job.view_with_manifest(Some(value))).into_response()),
        RenderedBody::Text(text) => {
            Ok(([(header::CONTENT_TYPE, rendered.content_type)], text).into_response())
        }
    }
}
