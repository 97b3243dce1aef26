//! Global and per-model tunables for both backends.
//!
//! Settings are typed per backend and every field is optional: `None` means
//! "inherit". Keys the types do not know about are kept verbatim in `extra`.

use std::collections::{BTreeMap, HashSet};

use docstore::{Document, Storage};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::{override_key, Backend, ModelOpsError, Result};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VllmSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_memory_utilization: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_model_len: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tensor_parallel_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_remote_code: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_offload_gb: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enforce_eager: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_num_batched_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_num_seqs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_log_stats: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_log_requests: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl VllmSettings {
    pub fn defaults(models_dir: &str) -> Self {
        Self {
            gpu_memory_utilization: Some(0.95),
            max_model_len: Some(16384),
            tensor_parallel_size: Some(1),
            quantization: Some("auto".into()),
            dtype: Some("auto".into()),
            trust_remote_code: Some(false),
            download_dir: Some(models_dir.to_string()),
            cpu_offload_gb: Some(0),
            enforce_eager: Some(false),
            max_num_batched_tokens: None,
            max_num_seqs: Some(256),
            disable_log_stats: Some(false),
            disable_log_requests: Some(false),
            extra: Map::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OllamaSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_layers: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_thread: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_mmap: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_mlock: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OllamaSettings {
    pub fn defaults(models_path: &str) -> Self {
        Self {
            models_path: Some(models_path.to_string()),
            gpu_layers: Some(-1),
            context_size: Some(2048),
            num_thread: Some(0),
            use_mmap: Some(true),
            use_mlock: Some(false),
            repeat_penalty: Some(1.1),
            temperature: Some(0.8),
            top_k: Some(40),
            top_p: Some(0.9),
            seed: Some(-1),
            extra: Map::new(),
        }
    }
}

/// Settings of one backend, serialized as the bare object.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BackendSettings {
    Vllm(VllmSettings),
    Ollama(OllamaSettings),
}

impl BackendSettings {
    /// Parse and type-check a settings object for `backend`.
    pub fn parse(backend: Backend, map: &Map<String, Value>) -> Result<Self> {
        let value = Value::Object(map.clone());
        let parsed = match backend {
            Backend::Vllm => serde_json::from_value(value).map(BackendSettings::Vllm),
            Backend::Ollama => serde_json::from_value(value).map(BackendSettings::Ollama),
        };
        parsed.map_err(|e| ModelOpsError::InvalidSettings(format!("{backend}: {e}")))
    }

    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(m)) => m,
            _ => Map::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DefaultSettings {
    pub vllm: VllmSettings,
    pub ollama: OllamaSettings,
}

impl DefaultSettings {
    pub fn new(vllm_models_dir: &str, ollama_models_dir: &str) -> Self {
        Self {
            vllm: VllmSettings::defaults(vllm_models_dir),
            ollama: OllamaSettings::defaults(ollama_models_dir),
        }
    }

    fn for_backend(&self, backend: Backend) -> BackendSettings {
        match backend {
            Backend::Vllm => BackendSettings::Vllm(self.vllm.clone()),
            Backend::Ollama => BackendSettings::Ollama(self.ollama.clone()),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GlobalSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vllm: Option<VllmSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ollama: Option<OllamaSettings>,
}

/// On-disk layout: `{"global": {...}, "model_overrides": {"backend:id": {...}}}`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SettingsDocument {
    #[serde(default)]
    pub global: GlobalSettings,
    #[serde(default)]
    pub model_overrides: BTreeMap<String, Map<String, Value>>,
}

impl SettingsDocument {
    fn global_for(&self, backend: Backend) -> Option<BackendSettings> {
        match backend {
            Backend::Vllm => self.global.vllm.clone().map(BackendSettings::Vllm),
            Backend::Ollama => self.global.ollama.clone().map(BackendSettings::Ollama),
        }
    }

    fn set_global(&mut self, settings: BackendSettings) {
        match settings {
            BackendSettings::Vllm(s) => self.global.vllm = Some(s),
            BackendSettings::Ollama(s) => self.global.ollama = Some(s),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EffectiveSettings {
    pub global: Map<String, Value>,
    pub overrides: Map<String, Value>,
    pub effective: Map<String, Value>,
}

pub struct SettingsStore {
    doc: Document<SettingsDocument, Box<dyn Storage>>,
    defaults: DefaultSettings,
}

impl SettingsStore {
    pub fn open(storage: impl Storage + 'static, defaults: DefaultSettings) -> Self {
        let storage: Box<dyn Storage> = Box::new(storage);
        Self {
            doc: Document::open("model_settings", storage),
            defaults,
        }
    }

    pub async fn get_global(&self, backend: Backend) -> BackendSettings {
        self.doc
            .read(|d| d.global_for(backend))
            .await
            .unwrap_or_else(|| self.defaults.for_backend(backend))
    }

    /// Merge the non-null fields of `patch` into the backend's global settings.
    pub async fn update_global(&self, backend: Backend, patch: &Map<String, Value>) -> Result<BackendSettings> {
        let defaults = self.defaults.for_backend(backend);
        let merged = self
            .doc
            .try_update(|d| {
                let mut map = d.global_for(backend).unwrap_or(defaults).to_map();
                for (k, v) in patch {
                    if !v.is_null() {
                        map.insert(k.clone(), v.clone());
                    }
                }
                let typed = BackendSettings::parse(backend, &map)?;
                d.set_global(typed.clone());
                Ok::<_, ModelOpsError>(typed)
            })
            .await?;

        info!(backend=%backend, keys=patch.len(), "global settings updated");
        Ok(merged)
    }

    /// Global settings with the model's override applied on top.
    pub async fn get_effective(&self, model_id: &str, backend: Backend) -> EffectiveSettings {
        let global = self.get_global(backend).await.to_map();
        let key = override_key(model_id, backend);
        let overrides = self
            .doc
            .read(|d| d.model_overrides.get(&key).cloned())
            .await
            .unwrap_or_default();

        let mut effective = global.clone();
        for (k, v) in &overrides {
            effective.insert(k.clone(), v.clone());
        }

        EffectiveSettings { global, overrides, effective }
    }

    /// Store the non-null fields of `patch` as the model's override. An empty
    /// result deletes the override instead.
    pub async fn set_override(&self, model_id: &str, backend: Backend, patch: &Map<String, Value>) -> Result<EffectiveSettings> {
        let filtered: Map<String, Value> = patch
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        BackendSettings::parse(backend, &filtered)?;

        let key = override_key(model_id, backend);
        self.doc
            .update(|d| {
                if filtered.is_empty() {
                    d.model_overrides.remove(&key);
                } else {
                    d.model_overrides.insert(key.clone(), filtered);
                }
            })
            .await;

        Ok(self.get_effective(model_id, backend).await)
    }

    pub async fn has_override(&self, model_id: &str, backend: Backend) -> bool {
        let key = override_key(model_id, backend);
        self.doc.read(|d| d.model_overrides.contains_key(&key)).await
    }

    pub async fn override_keys(&self) -> HashSet<String> {
        self.doc.read(|d| d.model_overrides.keys().cloned().collect()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docstore::InMemoryStorage;
    use serde_json::json;

    fn store() -> (SettingsStore, InMemoryStorage) {
        let storage = InMemoryStorage::new();
        let s = SettingsStore::open(storage.clone(), DefaultSettings::new("/volumes/vllm_models", "/volumes/ollama_models"));
        (s, storage)
    }

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_get_global_defaults_when_nothing_persisted() {
        let (s, _) = store();
        match s.get_global(Backend::Vllm).await {
            BackendSettings::Vllm(v) => {
                assert_eq!(v.gpu_memory_utilization, Some(0.95));
                assert_eq!(v.max_model_len, Some(16384));
                assert_eq!(v.download_dir.as_deref(), Some("/volumes/vllm_models"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_update_global_keeps_other_defaults() {
        let (s, storage) = store();
        s.update_global(Backend::Ollama, &obj(json!({"context_size": 4096, "top_k": null})))
            .await
            .unwrap();

        let after = s.get_global(Backend::Ollama).await.to_map();
        let mut expected = BackendSettings::Ollama(OllamaSettings::defaults("/volumes/ollama_models")).to_map();
        expected.insert("context_size".into(), json!(4096));
        assert_eq!(after, expected);

        let raw: Value = serde_json::from_slice(&storage.bytes().unwrap()).unwrap();
        assert_eq!(raw["global"]["ollama"]["context_size"], json!(4096));
    }

    #[tokio::test]
    async fn test_update_global_rejects_wrong_type_and_keeps_state() {
        let (s, storage) = store();
        let err = s
            .update_global(Backend::Vllm, &obj(json!({"max_model_len": "lots"})))
            .await
            .unwrap_err();
        assert!(matches!(err, ModelOpsError::InvalidSettings(_)));
        assert!(storage.bytes().is_none());
    }

    #[tokio::test]
    async fn test_unknown_keys_are_preserved() {
        let (s, _) = store();
        let merged = s
            .update_global(Backend::Vllm, &obj(json!({"speculative_model": "tiny", "swap_space": 4})))
            .await
            .unwrap()
            .to_map();
        assert_eq!(merged["speculative_model"], json!("tiny"));
        assert_eq!(merged["swap_space"], json!(4));
    }

    #[tokio::test]
    async fn test_effective_is_global_with_overrides_on_top() {
        let (s, _) = store();
        s.set_override("Qwen/Qwen2.5-7B", Backend::Vllm, &obj(json!({"max_model_len": 8192, "enforce_eager": true})))
            .await
            .unwrap();

        let eff = s.get_effective("Qwen/Qwen2.5-7B", Backend::Vllm).await;
        for (k, v) in &eff.global {
            let expected = eff.overrides.get(k).unwrap_or(v);
            assert_eq!(eff.effective.get(k), Some(expected), "key {k}");
        }
        assert_eq!(eff.effective["max_model_len"], json!(8192));
        assert_eq!(eff.global["max_model_len"], json!(16384));
    }

    #[tokio::test]
    async fn test_all_null_override_removes_it() {
        let (s, storage) = store();
        s.set_override("m", Backend::Ollama, &obj(json!({"temperature": 0.2})))
            .await
            .unwrap();
        assert!(s.has_override("m", Backend::Ollama).await);

        let eff = s
            .set_override("m", Backend::Ollama, &obj(json!({"temperature": null})))
            .await
            .unwrap();

        assert!(eff.overrides.is_empty());
        assert!(!s.has_override("m", Backend::Ollama).await);
        let raw: Value = serde_json::from_slice(&storage.bytes().unwrap()).unwrap();
        assert!(raw["model_overrides"].as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overrides_are_per_backend() {
        let (s, _) = store();
        s.set_override("llama3", Backend::Ollama, &obj(json!({"seed": 7})))
            .await
            .unwrap();
        assert!(!s.has_override("llama3", Backend::Vllm).await);
        assert!(s.override_keys().await.contains("ollama:llama3"));
    }
}
