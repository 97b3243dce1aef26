use axum::{
    extract::{Path, Query, State},
    Json,
};
use modelops::{BackendSettings, EffectiveSettings};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::routes_models::{api_err, parse_backend, ApiResult};
use crate::state::SharedState;

#[derive(Deserialize)]
pub struct OverrideQuery {
    pub model_id: String,
    pub backend: String,
}

#[derive(Deserialize)]
pub struct OverrideReq {
    pub model_id: String,
    pub backend: String,
    #[serde(default)]
    pub settings: Map<String, Value>,
}

pub async fn get_settings(State(st): State<SharedState>, Path(backend): Path<String>) -> ApiResult<BackendSettings> {
    let backend = parse_backend(&backend)?;
    Ok(Json(st.settings.get_global(backend).await))
}

pub async fn put_settings(
    State(st): State<SharedState>,
    Path(backend): Path<String>,
    Json(patch): Json<Map<String, Value>>,
) -> ApiResult<BackendSettings> {
    let backend = parse_backend(&backend)?;
    let merged = st.settings.update_global(backend, &patch).await.map_err(api_err)?;
    Ok(Json(merged))
}

pub async fn get_overrides(State(st): State<SharedState>, Query(q): Query<OverrideQuery>) -> ApiResult<EffectiveSettings> {
    let backend = parse_backend(&q.backend)?;
    Ok(Json(st.settings.get_effective(&q.model_id, backend).await))
}

pub async fn post_overrides(State(st): State<SharedState>, Json(req): Json<OverrideReq>) -> ApiResult<EffectiveSettings> {
    let backend = parse_backend(&req.backend)?;
    let eff = st
        .settings
        .set_override(&req.model_id, backend, &req.settings)
        .await
        .map_err(api_err)?;
    Ok(Json(eff))
}
