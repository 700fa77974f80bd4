use std::sync::Arc;

use axum::Json;
use axum::extract::Path;
use axum::extract::Query;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use chrono::Utc;
use pubdatahub_core::CoreError;
use pubdatahub_core::jobs::DownloadJob;
use pubdatahub_protocol::JobId;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::AppContext;

/// Error body plus the status the core error maps to.
pub(crate) struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let status = match &err {
            CoreError::SourceNotFound(_) | CoreError::JobNotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Validation(_) | CoreError::NotInitialized | CoreError::InvalidRange { .. } => {
                StatusCode::BAD_REQUEST
            }
            CoreError::InvalidTransition { .. } | CoreError::Unsupported(_) => StatusCode::CONFLICT,
            CoreError::Backpressure | CoreError::PoolStopped => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

pub(crate) async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now(),
    }))
}

pub(crate) async fn list_sources(State(context): State<Arc<AppContext>>) -> impl IntoResponse {
    Json(context.registry.list())
}

#[derive(Debug, Deserialize)]
pub(crate) struct PageParams {
    page: Option<u64>,
    limit: Option<u64>,
}

pub(crate) async fn source_data(
    State(context): State<Arc<AppContext>>,
    Path(name): Path<String>,
    Query(params): Query<PageParams>,
) -> Result<Response, ApiError> {
    let page = params.page.unwrap_or(1);
    let limit = params.limit.unwrap_or(20);
    if page < 1 || limit < 1 {
        return Err(ApiError::bad_request("page and limit must be >= 1"));
    }
    let source = context.registry.get(&name)?;
    let offset = (page - 1) * limit;
    let output = source
        .query(&format!(
            "SELECT * FROM items ORDER BY id LIMIT {limit} OFFSET {offset}"
        ))
        .await?;
    Ok(Json(json!({
        "source": name,
        "page": page,
        "limit": limit,
        "columns": output.columns,
        "rows": output.rows,
        "count": output.count,
    }))
    .into_response())
}

pub(crate) async fn list_jobs(State(context): State<Arc<AppContext>>) -> impl IntoResponse {
    Json(context.manager.list(None))
}

#[derive(Debug, Deserialize)]
pub(crate) struct DownloadRequest {
    source: Option<String>,
}

pub(crate) async fn create_download_job(
    State(context): State<Arc<AppContext>>,
    Json(body): Json<DownloadRequest>,
) -> Result<Response, ApiError> {
    let Some(name) = body.source.filter(|name| !name.is_empty()) else {
        return Err(ApiError::bad_request("missing source"));
    };
    let source = context
        .registry
        .get(&name)
        .map_err(|_| ApiError::bad_request(format!("unknown source: {name}")))?;
    source.init_storage(&context.storage_root).await?;
    let job = Arc::new(DownloadJob::new(source, 0));
    let id = context.manager.submit(job)?;
    let info = context.manager.get(id)?;
    debug!(%id, source = name, "download job created");
    Ok((StatusCode::CREATED, Json(info)).into_response())
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    JobId::from_string(raw).map_err(|_| ApiError::bad_request(format!("invalid job id: {raw}")))
}

pub(crate) async fn pause_job(
    State(context): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_job_id(&id)?;
    context.manager.pause(id).await?;
    Ok(Json(json!({ "message": "job paused", "job_id": id })).into_response())
}

pub(crate) async fn resume_job(
    State(context): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_job_id(&id)?;
    context.manager.resume(id).await?;
    Ok(Json(json!({ "message": "job resumed", "job_id": id })).into_response())
}

pub(crate) async fn cancel_job(
    State(context): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_job_id(&id)?;
    context.manager.cancel(id).await?;
    Ok(Json(json!({ "message": "job cancelled", "job_id": id })).into_response())
}
