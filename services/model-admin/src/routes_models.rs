use std::collections::BTreeMap;

use axum::{
    extract::{multipart::MultipartError, Multipart, Path, Query, State},
    http::StatusCode,
    Json,
};
use modelops::{
    estimate_memory, Activation, ActivationState, Backend, Deletion, GpuMemory, MemoryEstimate, ModelConfig,
    ModelOpsError, ModelRecord, ModelSummary, RegistrySettings, RegistrySettingsPatch, SearchResult, Uploaded,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::state::SharedState;

#[derive(Serialize)]
pub struct ApiError {
    pub error: String,
}

pub type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

pub fn api_err(e: ModelOpsError) -> (StatusCode, Json<ApiError>) {
    let status = match &e {
        ModelOpsError::InvalidBackend(_) | ModelOpsError::InvalidModelId(_) | ModelOpsError::Upload(_) => {
            StatusCode::BAD_REQUEST
        }
        ModelOpsError::ModelNotFound(_) => StatusCode::NOT_FOUND,
        ModelOpsError::InvalidSettings(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ModelOpsError::ExternalTool(_) => StatusCode::BAD_GATEWAY,
        ModelOpsError::Io(_) | ModelOpsError::Persistence(_) | ModelOpsError::Serialization(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    if status.is_server_error() {
        warn!(status=%status, "request failed: {e}");
    }
    (status, Json(ApiError { error: e.to_string() }))
}

pub fn parse_backend(s: &str) -> Result<Backend, (StatusCode, Json<ApiError>)> {
    s.parse::<Backend>().map_err(api_err)
}

fn default_backend() -> String {
    Backend::Vllm.to_string()
}

#[derive(Serialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelRecord>,
    pub active_model: Option<String>,
}

#[derive(Serialize)]
pub struct ScanResponse {
    pub added: Vec<String>,
}

#[derive(Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: Option<String>,
}

#[derive(Deserialize)]
pub struct ActivateReq {
    pub model_id: String,
    #[serde(default = "default_backend")]
    pub backend: String,
}

#[derive(Deserialize)]
pub struct DeleteReq {
    pub model_id: String,
    pub backend: String,
}

#[derive(Deserialize)]
pub struct ConfigReq {
    pub model_id: String,
    #[serde(flatten)]
    pub config: ModelConfig,
}

#[derive(Deserialize)]
pub struct EstimateReq {
    pub model_size: String,
    #[serde(default)]
    pub quantization: Option<String>,
    #[serde(default)]
    pub context_size: Option<u32>,
    #[serde(default)]
    pub gpu: Option<GpuMemory>,
}

pub async fn get_models(State(st): State<SharedState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: st.registry.list().await,
        active_model: st.registry.active_model().await,
    })
}

pub async fn post_scan(State(st): State<SharedState>) -> Json<ScanResponse> {
    let added = st.scanner.discover(&st.registry).await;
    Json(ScanResponse { added })
}

pub async fn get_installed(State(st): State<SharedState>) -> Json<BTreeMap<String, Vec<ModelSummary>>> {
    Json(st.scanner.scan().await)
}

pub async fn get_search(State(st): State<SharedState>, Query(q): Query<SearchQuery>) -> Json<Vec<SearchResult>> {
    Json(st.search.search(q.q.as_deref()).await)
}

fn multipart_err(e: MultipartError) -> (StatusCode, Json<ApiError>) {
    api_err(ModelOpsError::Upload(e.to_string()))
}

/// Multipart upload; the file travels in the `model` field.
pub async fn post_upload(State(st): State<SharedState>, mut mp: Multipart) -> ApiResult<Uploaded> {
    while let Some(field) = mp.next_field().await.map_err(multipart_err)? {
        if field.name() != Some("model") {
            continue;
        }
        let filename = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| api_err(ModelOpsError::Upload("field 'model' has no file name".into())))?;
        let out = st.uploader.import(&filename, Box::pin(field)).await.map_err(api_err)?;
        return Ok(Json(out));
    }
    Err(api_err(ModelOpsError::Upload("missing multipart field 'model'".into())))
}

pub async fn post_activate(State(st): State<SharedState>, Json(req): Json<ActivateReq>) -> ApiResult<Activation> {
    let backend = parse_backend(&req.backend)?;
    let act = st.activation.activate(&req.model_id, backend).await.map_err(api_err)?;
    Ok(Json(act))
}

pub async fn get_activation(State(st): State<SharedState>, Path(backend): Path<String>) -> ApiResult<ActivationState> {
    let backend = parse_backend(&backend)?;
    Ok(Json(st.activation.state(backend).await))
}

pub async fn post_delete(State(st): State<SharedState>, Json(req): Json<DeleteReq>) -> ApiResult<Deletion> {
    let backend = parse_backend(&req.backend)?;
    let del = st.remover.delete(&req.model_id, backend).await.map_err(api_err)?;
    Ok(Json(del))
}

pub async fn put_config(State(st): State<SharedState>, Json(req): Json<ConfigReq>) -> ApiResult<ModelRecord> {
    let rec = st.registry.update_config(&req.model_id, &req.config).await.map_err(api_err)?;
    Ok(Json(rec))
}

pub async fn get_registry_settings(State(st): State<SharedState>) -> Json<RegistrySettings> {
    Json(st.registry.global_settings().await)
}

pub async fn put_registry_settings(
    State(st): State<SharedState>,
    Json(patch): Json<RegistrySettingsPatch>,
) -> Json<RegistrySettings> {
    Json(st.registry.update_global_settings(&patch).await)
}

pub async fn post_estimate_memory(State(st): State<SharedState>, Json(req): Json<EstimateReq>) -> ApiResult<MemoryEstimate> {
    let context_size = match req.context_size {
        Some(c) => c,
        None => st.registry.global_settings().await.default_context_size,
    };
    let quantization = req.quantization.as_deref().unwrap_or("Q4_K_M");
    let est = estimate_memory(&req.model_size, quantization, context_size, req.gpu.unwrap_or_default())
        .map_err(api_err)?;
    Ok(Json(est))
}
