use std::collections::BTreeMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use modelops::{CancelOutcome, DownloadTask, StartOutcome};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::routes_models::{api_err, parse_backend, ApiError};
use crate::state::SharedState;

#[derive(Deserialize)]
pub struct DownloadReq {
    pub model_id: String,
    pub backend: String,
    #[serde(default)]
    pub settings: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
pub struct ProgressQuery {
    pub model_id: String,
}

#[derive(Serialize)]
pub struct CancelResp {
    pub task_id: String,
    pub status: CancelOutcome,
}

type Rejection = (StatusCode, Json<ApiError>);

fn not_found(what: String) -> Rejection {
    (StatusCode::NOT_FOUND, Json(ApiError { error: what }))
}

pub async fn post_download(
    State(st): State<SharedState>,
    Json(req): Json<DownloadReq>,
) -> Result<(StatusCode, Json<StartOutcome>), Rejection> {
    let backend = parse_backend(&req.backend)?;
    let out = st
        .downloads
        .start_download(&req.model_id, backend, req.settings)
        .await
        .map_err(api_err)?;
    let code = match out {
        StartOutcome::Started { .. } => StatusCode::ACCEPTED,
        StartOutcome::AlreadyDownloading { .. } => StatusCode::OK,
    };
    Ok((code, Json(out)))
}

pub async fn get_downloads(State(st): State<SharedState>) -> Json<BTreeMap<String, DownloadTask>> {
    Json(st.downloads.list_all().await)
}

pub async fn get_download(
    State(st): State<SharedState>,
    Path(task_id): Path<String>,
) -> Result<Json<DownloadTask>, Rejection> {
    st.downloads
        .get_status(&task_id)
        .await
        .map(Json)
        .ok_or_else(|| not_found(format!("Download task not found: {task_id}")))
}

pub async fn post_cancel(
    State(st): State<SharedState>,
    Path(task_id): Path<String>,
) -> Result<Json<CancelResp>, Rejection> {
    match st.downloads.cancel(&task_id).await {
        CancelOutcome::NotFound => Err(not_found(format!("Download task not found: {task_id}"))),
        CancelOutcome::AlreadyFinished => Err((
            StatusCode::CONFLICT,
            Json(ApiError {
                error: format!("Download task already finished: {task_id}"),
            }),
        )),
        status => Ok(Json(CancelResp { task_id, status })),
    }
}

pub async fn get_download_progress(
    State(st): State<SharedState>,
    Query(q): Query<ProgressQuery>,
) -> Result<Json<DownloadTask>, Rejection> {
    st.downloads
        .status_for_model(&q.model_id)
        .await
        .map(Json)
        .ok_or_else(|| not_found(format!("No download for model: {}", q.model_id)))
}
