// Recording HTTP endpoints.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use axum::Json;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};

use crate::error::{ApiError, ApiResult};
use crate::recording::RecordingParams;
use crate::AppContext;

/// Used whenever the caller doesn't specify an explicit recorder id.
const DEFAULT_RECORDER_ID: &str = "main";

/// A running recording below this size is "not ready yet" rather than an
/// error; the encoder simply hasn't flushed its first fragment.
const MIN_RECORDING_SIZE_BYTES: u64 = 100;

static RECORDER_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9-]{1,64}$").expect("valid regex"));

fn recorder_id(explicit: Option<&str>) -> Result<String, ApiError> {
    match explicit {
        None | Some("") => Ok(DEFAULT_RECORDER_ID.to_string()),
        Some(id) if RECORDER_ID_RE.is_match(id) => Ok(id.to_string()),
        Some(id) => Err(ApiError::BadRequest(format!("invalid recorder id '{id}'"))),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StartRecordingRequest {
    pub id: Option<String>,
    pub framerate: Option<u32>,
    #[serde(rename = "maxFileSizeInMB")]
    pub max_file_size_in_mb: Option<u32>,
    #[serde(rename = "maxDurationInSeconds")]
    pub max_duration_in_seconds: Option<u32>,
}

pub async fn start_recording(
    State(ctx): State<Arc<AppContext>>,
    body: Option<Json<StartRecordingRequest>>,
) -> ApiResult<StatusCode> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let id = recorder_id(body.id.as_deref())?;

    let overrides = RecordingParams {
        frame_rate: body.framerate,
        max_size_mb: body.max_file_size_in_mb,
        max_duration_secs: body.max_duration_in_seconds,
        ..Default::default()
    };

    let recorder = ctx.factory.create(&id, overrides)?;
    if let Err(err) = ctx.registry.register(recorder.clone()).await {
        if let Some(existing) = ctx.registry.get(&id).await {
            if existing.is_recording().await {
                warn!(id, "attempted to start recording while one is already active");
                return Err(ApiError::AlreadyRunning);
            }
        }
        return Err(err);
    }

    if let Err(err) = recorder.start().await {
        error!(id, err = %err, "failed to start recording");
        ctx.registry.deregister(&id).await;
        return Err(err);
    }

    Ok(StatusCode::CREATED)
}

#[derive(Debug, Default, Deserialize)]
pub struct StopRecordingRequest {
    pub id: Option<String>,
    #[serde(rename = "forceStop")]
    pub force_stop: Option<bool>,
}

pub async fn stop_recording(
    State(ctx): State<Arc<AppContext>>,
    body: Option<Json<StopRecordingRequest>>,
) -> ApiResult<StatusCode> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let id = recorder_id(body.id.as_deref())?;

    let Some(recorder) = ctx.registry.get(&id).await else {
        warn!(id, "attempted to stop recording when none is active");
        return Err(ApiError::BadRequest("no active recording to stop".to_string()));
    };
    if !recorder.is_recording().await {
        info!(id, "recording already stopped");
        return Ok(StatusCode::OK);
    }

    let force = body.force_stop.unwrap_or(false);
    let result = if force {
        info!(id, "force stopping recording");
        recorder.force_stop().await
    } else {
        info!(id, "gracefully stopping recording");
        recorder.stop().await
    };

    // The final state is authoritative: the process is gone after the kill
    // phase regardless of what any intermediate phase reported.
    if let Err(err) = result {
        error!(id, force, err = %err, "error occurred while stopping recording");
    }

    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub id: Option<String>,
}

pub async fn download_recording(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<Response> {
    let id = recorder_id(query.id.as_deref())?;

    let Some(recorder) = ctx.registry.get(&id).await else {
        return Err(ApiError::NotFound("no recording found".to_string()));
    };

    if recorder.is_recording().await {
        let size = tokio::fs::metadata(recorder.output_path())
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);
        if size <= MIN_RECORDING_SIZE_BYTES {
            return Err(ApiError::TryAgainLater { retry_after_secs: 1 });
        }
        return Err(ApiError::InProgress);
    }

    let (file, meta) = recorder.artifact().await?;
    info!(id, size = meta.size, "serving recording file for download");

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp4")
        .header(header::CONTENT_LENGTH, meta.size);
    if let Some(started_at) = meta.started_at {
        builder = builder.header("X-Recording-Started-At", started_at.to_rfc3339());
    }
    if let Some(finished_at) = meta.finished_at {
        builder = builder.header("X-Recording-Finished-At", finished_at.to_rfc3339());
    }

    builder
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|err| ApiError::Internal(err.into()))
}

#[derive(Debug, Serialize)]
pub struct RecordingSummary {
    pub id: String,
    #[serde(rename = "isRecording")]
    pub is_recording: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

pub async fn list_recordings(
    State(ctx): State<Arc<AppContext>>,
) -> Json<Vec<RecordingSummary>> {
    let mut summaries = Vec::new();
    for recorder in ctx.registry.snapshot().await {
        let snapshot = recorder.snapshot().await;
        summaries.push(RecordingSummary {
            id: snapshot.id,
            is_recording: snapshot.is_recording,
            started_at: snapshot.started_at,
            finished_at: snapshot.finished_at,
        });
    }
    summaries.sort_by(|a, b| a.id.cmp(&b.id));
    Json(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorder_id_defaults_to_main() {
        assert_eq!(recorder_id(None).unwrap(), "main");
        assert_eq!(recorder_id(Some("")).unwrap(), "main");
    }

    #[test]
    fn recorder_id_validation() {
        assert_eq!(recorder_id(Some("abc-123")).unwrap(), "abc-123");
        assert!(recorder_id(Some("bad/../id")).is_err());
        assert!(recorder_id(Some("spaces no")).is_err());
        assert!(recorder_id(Some(&"x".repeat(65))).is_err());
    }

    #[test]
    fn start_request_field_names() {
        let body: StartRecordingRequest = serde_json::from_str(
            r#"{"id":"a","framerate":30,"maxFileSizeInMB":100,"maxDurationInSeconds":60}"#,
        )
        .unwrap();
        assert_eq!(body.id.as_deref(), Some("a"));
        assert_eq!(body.framerate, Some(30));
        assert_eq!(body.max_file_size_in_mb, Some(100));
        assert_eq!(body.max_duration_in_seconds, Some(60));
    }

    #[test]
    fn stop_request_field_names() {
        let body: StopRecordingRequest =
            serde_json::from_str(r#"{"id":"a","forceStop":true}"#).unwrap();
        assert_eq!(body.force_stop, Some(true));
    }
}
