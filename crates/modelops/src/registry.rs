use std::collections::BTreeMap;

use docstore::{Document, Storage};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{Backend, ModelOpsError, ModelRecord, Result};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegistrySettings {
    pub default_retention: String,
    pub default_context_size: u32,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            default_retention: "keep".to_string(),
            default_context_size: 16384,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RegistrySettingsPatch {
    pub default_retention: Option<String>,
    pub default_context_size: Option<u32>,
}

/// Per-model configuration kept on the registry record.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ModelConfig {
    pub retention: Option<String>,
    pub context_size: Option<u32>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RegistryDocument {
    #[serde(default)]
    pub models: BTreeMap<String, ModelRecord>,
    /// Last model activated on the filesystem backend.
    #[serde(default)]
    pub active_model: Option<String>,
    #[serde(default)]
    pub global_settings: RegistrySettings,
}

/// Persisted inventory of known models.
///
/// The registry stores the `active` flags but does not decide them; see
/// [`crate::ActivationController`].
pub struct ModelRegistry {
    doc: Document<RegistryDocument, Box<dyn Storage>>,
}

impl ModelRegistry {
    pub fn open(storage: impl Storage + 'static) -> Self {
        let storage: Box<dyn Storage> = Box::new(storage);
        Self {
            doc: Document::open("model_registry", storage),
        }
    }

    /// All records, ordered by id.
    pub async fn list(&self) -> Vec<ModelRecord> {
        self.doc.read(|d| d.models.values().cloned().collect()).await
    }

    pub async fn get(&self, model_id: &str) -> Option<ModelRecord> {
        self.doc.read(|d| d.models.get(model_id).cloned()).await
    }

    pub async fn contains(&self, model_id: &str) -> bool {
        self.doc.read(|d| d.models.contains_key(model_id)).await
    }

    /// Insert or replace a record. Replacing keeps the existing activation
    /// flag and per-model config.
    pub async fn upsert(&self, mut rec: ModelRecord) {
        let id = rec.id.clone();
        self.doc
            .update(|d| {
                if let Some(prev) = d.models.get(&rec.id) {
                    rec.active = prev.active;
                    rec.retention = rec.retention.take().or_else(|| prev.retention.clone());
                    rec.context_size = rec.context_size.or(prev.context_size);
                    if rec.discovered_at.is_none() {
                        rec.discovered_at = prev.discovered_at;
                    }
                }
                d.models.insert(rec.id.clone(), rec);
            })
            .await;
        info!(model_id=%id, "registry: model recorded");
    }

    /// Insert only when the id is unknown. Returns whether it was inserted.
    pub async fn insert_if_absent(&self, rec: ModelRecord) -> bool {
        self.doc
            .update(|d| {
                if d.models.contains_key(&rec.id) {
                    false
                } else {
                    d.models.insert(rec.id.clone(), rec);
                    true
                }
            })
            .await
    }

    /// Mark `model_id` active and every other model of `backend` inactive.
    pub async fn set_active(&self, backend: Backend, model_id: &str) -> Result<ModelRecord> {
        self.doc
            .try_update(|d| {
                match d.models.get(model_id) {
                    Some(rec) if rec.backend == backend => {}
                    _ => return Err(ModelOpsError::ModelNotFound(model_id.to_string())),
                }
                for rec in d.models.values_mut().filter(|r| r.backend == backend) {
                    rec.active = rec.id == model_id;
                }
                if backend == Backend::Vllm {
                    d.active_model = Some(model_id.to_string());
                }
                d.models
                    .get(model_id)
                    .cloned()
                    .ok_or_else(|| ModelOpsError::ModelNotFound(model_id.to_string()))
            })
            .await
    }

    pub async fn active(&self, backend: Backend) -> Vec<ModelRecord> {
        self.doc
            .read(|d| {
                d.models
                    .values()
                    .filter(|r| r.backend == backend && r.active)
                    .cloned()
                    .collect()
            })
            .await
    }

    pub async fn remove(&self, model_id: &str) -> Option<ModelRecord> {
        self.doc
            .update(|d| {
                let removed = d.models.remove(model_id);
                if d.active_model.as_deref() == Some(model_id) {
                    d.active_model = None;
                }
                removed
            })
            .await
    }

    pub async fn update_config(&self, model_id: &str, cfg: &ModelConfig) -> Result<ModelRecord> {
        self.doc
            .try_update(|d| {
                let rec = d
                    .models
                    .get_mut(model_id)
                    .ok_or_else(|| ModelOpsError::ModelNotFound(model_id.to_string()))?;
                if let Some(r) = &cfg.retention {
                    rec.retention = Some(r.clone());
                }
                if let Some(c) = cfg.context_size {
                    rec.context_size = Some(c);
                }
                Ok(rec.clone())
            })
            .await
    }

    pub async fn global_settings(&self) -> RegistrySettings {
        self.doc.read(|d| d.global_settings.clone()).await
    }

    pub async fn update_global_settings(&self, patch: &RegistrySettingsPatch) -> RegistrySettings {
        self.doc
            .update(|d| {
                if let Some(r) = &patch.default_retention {
                    d.global_settings.default_retention = r.clone();
                }
                if let Some(c) = patch.default_context_size {
                    d.global_settings.default_context_size = c;
                }
                d.global_settings.clone()
            })
            .await
    }

    pub async fn active_model(&self) -> Option<String> {
        self.doc.read(|d| d.active_model.clone()).await
    }
}
