use std::path::PathBuf;

use anyhow::{bail, Context, Result};

/// 64 GiB, enough for a large single-file model.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 64 << 30;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub models_dir: PathBuf,
    pub ollama_models_dir: PathBuf,
    pub settings_path: PathBuf,
    pub registry_path: PathBuf,

    pub ollama_url: String,
    pub hf_api_url: String,
    pub embeddings_url: String,
    pub reranker_url: String,

    pub hf_cli: String,
    pub hf_token: Option<String>,
    pub default_llm_model: Option<String>,

    pub vllm_env_file: Option<PathBuf>,
    pub vllm_restart_cmd: Option<String>,

    pub max_finished_tasks: usize,
    pub max_upload_bytes: usize,
    pub bind_addr: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let or = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_string());

        let ollama_url = or("OLLAMA_URL", "http://unicorn-ollama:11434");
        let hf_api_url = or("HF_API_URL", modelops::HF_API_URL);
        let embeddings_url = or("EMBEDDINGS_URL", "http://unicorn-embeddings:8082");
        let reranker_url = or("RERANKER_URL", "http://unicorn-reranker:8083");

        let max_finished_tasks = match var("MAX_FINISHED_TASKS") {
            Some(v) => v
                .parse::<usize>()
                .with_context(|| format!("MAX_FINISHED_TASKS must be a non-negative integer, got {v:?}"))?,
            None => modelops::DEFAULT_MAX_FINISHED_TASKS,
        };
        let max_upload_bytes = match var("MAX_UPLOAD_BYTES") {
            Some(v) => v
                .parse::<usize>()
                .with_context(|| format!("MAX_UPLOAD_BYTES must be a byte count, got {v:?}"))?,
            None => DEFAULT_MAX_UPLOAD_BYTES,
        };

        // Tiny sanity checks (fail fast, fail loud)
        for (key, url) in [
            ("OLLAMA_URL", &ollama_url),
            ("HF_API_URL", &hf_api_url),
            ("EMBEDDINGS_URL", &embeddings_url),
            ("RERANKER_URL", &reranker_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                bail!("{key} must start with http:// or https://");
            }
        }

        Ok(Self {
            models_dir: or("MODELS_DIR", "/volumes/vllm_models").into(),
            ollama_models_dir: or("OLLAMA_MODELS_DIR", "/volumes/ollama_models").into(),
            settings_path: or("MODEL_SETTINGS_PATH", "/volumes/model_settings.json").into(),
            registry_path: or("MODEL_REGISTRY_PATH", "/volumes/model_registry.json").into(),
            ollama_url,
            hf_api_url,
            embeddings_url,
            reranker_url,
            hf_cli: or("HF_CLI", "huggingface-cli"),
            hf_token: var("HF_TOKEN"),
            default_llm_model: var("DEFAULT_LLM_MODEL"),
            vllm_env_file: var("VLLM_ENV_FILE").map(PathBuf::from),
            vllm_restart_cmd: var("VLLM_RESTART_CMD"),
            max_finished_tasks,
            max_upload_bytes,
            bind_addr: or("ADMIN_BIND_ADDR", "0.0.0.0:8084"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(pairs: &[(&str, &str)]) -> Result<AppConfig> {
        let env: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        AppConfig::from_lookup(|k| env.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = from(&[]).unwrap();
        assert_eq!(cfg.models_dir, PathBuf::from("/volumes/vllm_models"));
        assert_eq!(cfg.max_finished_tasks, 50);
        assert_eq!(cfg.hf_cli, "huggingface-cli");
        assert!(cfg.hf_token.is_none());
        assert!(cfg.vllm_restart_cmd.is_none());
        assert_eq!(cfg.hf_api_url, "https://huggingface.co");
        assert_eq!(cfg.max_upload_bytes, DEFAULT_MAX_UPLOAD_BYTES);
    }

    #[test]
    fn test_overrides_and_blank_values() {
        let cfg = from(&[
            ("MODELS_DIR", "/data/models"),
            ("HF_TOKEN", "  "),
            ("MAX_FINISHED_TASKS", "5"),
            ("DEFAULT_LLM_MODEL", "Qwen/Qwen2.5-32B-Instruct-AWQ"),
        ])
        .unwrap();
        assert_eq!(cfg.models_dir, PathBuf::from("/data/models"));
        assert!(cfg.hf_token.is_none());
        assert_eq!(cfg.max_finished_tasks, 5);
        assert_eq!(cfg.default_llm_model.as_deref(), Some("Qwen/Qwen2.5-32B-Instruct-AWQ"));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(from(&[("OLLAMA_URL", "unicorn-ollama:11434")]).is_err());
        assert!(from(&[("MAX_FINISHED_TASKS", "many")]).is_err());
        assert!(from(&[("HF_API_URL", "huggingface.co")]).is_err());
        assert!(from(&[("MAX_UPLOAD_BYTES", "-1")]).is_err());
    }
}
