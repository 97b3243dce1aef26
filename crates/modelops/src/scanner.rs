use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::hub::AUX_TIMEOUT;
use crate::{
    detect_quantization, dir_size, format_size, model_dir_name, unescape_model_dir, Backend, HubClient, ModelRecord,
    ModelRegistry, Result, SettingsStore,
};

const MARKER_FILES: [&str; 4] = ["config.json", "model.safetensors", "model.bin", "pytorch_model.bin"];

fn shard_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^model-00001-of-\d{5}\.safetensors$").expect("valid regex"))
}

#[derive(Clone, Debug)]
pub struct ScannerConfig {
    pub models_dir: PathBuf,
    pub embeddings_url: String,
    pub reranker_url: String,
    /// Model marked active when discovered.
    pub default_model: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ModelSummary {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_overrides: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
}

/// A model directory found under the models root.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalModel {
    pub id: String,
    pub dir_name: String,
    pub path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct CachedModels {
    #[serde(default)]
    cached_models: Vec<CachedModel>,
}

#[derive(Debug, Deserialize)]
struct CachedModel {
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    path: String,
    #[serde(default)]
    active: bool,
}

/// Read-only view over the models directory and the auxiliary services.
pub struct ModelScanner {
    cfg: ScannerConfig,
    hub: HubClient,
    client: reqwest::Client,
    settings: Arc<SettingsStore>,
}

impl ModelScanner {
    pub fn new(cfg: ScannerConfig, hub: HubClient, settings: Arc<SettingsStore>) -> Self {
        Self {
            cfg,
            hub,
            client: reqwest::Client::new(),
            settings,
        }
    }

    /// Inventory keyed by `vllm`, `ollama`, `embeddings` and `reranker`.
    /// Unreachable services contribute empty lists.
    pub async fn scan(&self) -> BTreeMap<String, Vec<ModelSummary>> {
        let mut out = BTreeMap::new();
        out.insert(Backend::Vllm.to_string(), self.scan_local().await);
        out.insert(Backend::Ollama.to_string(), self.scan_hub().await);
        out.insert("embeddings".to_string(), self.scan_cached("embeddings", &self.cfg.embeddings_url).await);
        out.insert("reranker".to_string(), self.scan_cached("reranker", &self.cfg.reranker_url).await);
        out
    }

    async fn scan_local(&self) -> Vec<ModelSummary> {
        let root = self.cfg.models_dir.clone();
        let found = match tokio::task::spawn_blocking(move || {
            find_local_models(&root)
                .into_iter()
                .map(|m| {
                    let size = dir_size(&m.path);
                    let modified = last_modified(&m.path);
                    (m, size, modified)
                })
                .collect::<Vec<_>>()
        })
        .await
        {
            Ok(v) => v,
            Err(e) => {
                warn!("scanner: local walk panicked: {e}");
                return Vec::new();
            }
        };

        let overrides = self.settings.override_keys().await;
        found
            .into_iter()
            .map(|(m, size, modified)| ModelSummary {
                has_overrides: Some(overrides.contains(&crate::override_key(&m.id, Backend::Vllm))),
                name: m.id.clone(),
                id: m.id,
                path: Some(m.path.display().to_string()),
                size,
                last_modified: modified,
                active: None,
            })
            .collect()
    }

    async fn scan_hub(&self) -> Vec<ModelSummary> {
        let models = match self.hub.tags().await {
            Ok(m) => m,
            Err(e) => {
                info!(url=%self.hub.base_url(), "scanner: hub not available: {e}");
                return Vec::new();
            }
        };
        let overrides = self.settings.override_keys().await;
        models
            .into_iter()
            .map(|m| ModelSummary {
                has_overrides: Some(overrides.contains(&crate::override_key(&m.name, Backend::Ollama))),
                id: m.name.clone(),
                name: m.name,
                path: None,
                size: m.size,
                last_modified: m.modified_at,
                active: None,
            })
            .collect()
    }

    async fn scan_cached(&self, service: &str, base_url: &str) -> Vec<ModelSummary> {
        match self.fetch_cached(base_url).await {
            Ok(models) => models
                .into_iter()
                .map(|m| ModelSummary {
                    id: m.name.clone(),
                    name: m.name,
                    path: Some(m.path),
                    size: m.size,
                    last_modified: None,
                    has_overrides: None,
                    active: Some(m.active),
                })
                .collect(),
            Err(e) => {
                info!(service, url=%base_url, "scanner: service not available: {e}");
                Vec::new()
            }
        }
    }

    async fn fetch_cached(&self, base_url: &str) -> Result<Vec<CachedModel>> {
        let url = format!("{}/model/cached", base_url.trim_end_matches('/'));
        let resp = self
            .client
            .get(url)
            .timeout(AUX_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        let body: CachedModels = resp.json().await?;
        Ok(body.cached_models)
    }

    /// Register local models the registry does not know yet. Returns the ids added.
    pub async fn discover(&self, registry: &ModelRegistry) -> Vec<String> {
        let root = self.cfg.models_dir.clone();
        let found = match tokio::task::spawn_blocking(move || {
            find_local_models(&root)
                .into_iter()
                .map(|m| {
                    let size = dir_size(&m.path);
                    (m, size)
                })
                .collect::<Vec<_>>()
        })
        .await
        {
            Ok(v) => v,
            Err(e) => {
                warn!("scanner: discovery walk panicked: {e}");
                return Vec::new();
            }
        };

        let mut added = Vec::new();
        for (m, size) in found {
            if registry.contains(&m.id).await {
                continue;
            }
            let is_default = self
                .cfg
                .default_model
                .as_deref()
                .is_some_and(|d| is_default_model(d, &m));

            let rec = ModelRecord {
                id: m.id.clone(),
                backend: Backend::Vllm,
                path: Some(m.path.display().to_string()),
                size_bytes: size,
                size: format_size(size),
                quantization: detect_quantization(&m.dir_name).to_string(),
                discovered_at: Some(Utc::now()),
                downloaded_at: None,
                active: false,
                files: Vec::new(),
                manifest_hash: None,
                retention: None,
                context_size: None,
            };
            if !registry.insert_if_absent(rec).await {
                continue;
            }
            info!(model_id=%m.id, "scanner: discovered model");
            if is_default {
                if let Err(e) = registry.set_active(Backend::Vllm, &m.id).await {
                    warn!(model_id=%m.id, "scanner: could not mark default model active: {e}");
                }
            }
            added.push(m.id);
        }
        added
    }
}

/// Exact id, or the directory the id would be downloaded or cached under.
/// A bare name never matches a model from another org.
fn is_default_model(default: &str, m: &LocalModel) -> bool {
    let dir = model_dir_name(default);
    default == m.id || m.dir_name == dir || m.dir_name == format!("models--{dir}")
}

fn last_modified(path: &Path) -> Option<String> {
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
    Some(DateTime::<Utc>::from(modified).to_rfc3339())
}

/// True when `dir` directly contains a weights or config marker file.
pub fn is_model_dir(dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    entries.filter_map(|e| e.ok()).any(|e| {
        let name = e.file_name();
        let name = name.to_string_lossy();
        MARKER_FILES.contains(&name.as_ref()) || name.ends_with(".gguf") || shard_marker().is_match(&name)
    })
}

/// Walk `root` for model directories. Hidden directories are skipped; a
/// directory without markers is descended into and its name becomes part of
/// the id of what is found below it.
pub fn find_local_models(root: &Path) -> Vec<LocalModel> {
    let mut out = Vec::new();
    walk(root, "", &mut out);
    out.sort_by(|a, b| a.id.cmp(&b.id));
    out
}

fn walk(dir: &Path, prefix: &str, out: &mut Vec<LocalModel>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            if prefix.is_empty() {
                warn!(dir=%dir.display(), "scanner: models directory not readable: {e}");
            }
            return;
        }
    };

    for entry in entries.filter_map(|e| e.ok()) {
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir {
            continue;
        }
        let dir_name = entry.file_name().to_string_lossy().to_string();
        if dir_name.starts_with('.') {
            continue;
        }
        let segment = unescape_model_dir(&dir_name);
        let id = if prefix.is_empty() { segment } else { format!("{prefix}/{segment}") };
        let path = entry.path();
        if is_model_dir(&path) {
            out.push(LocalModel { id, dir_name, path });
        } else {
            walk(&path, &id, out);
        }
    }
}
