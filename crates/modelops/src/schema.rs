use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ModelOpsError;

/// Inference engines whose models are managed here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Serves weights from the local models directory.
    Vllm,
    /// Pulls and stores models through its own HTTP API.
    Ollama,
}

impl Backend {
    pub const ALL: [Backend; 2] = [Backend::Vllm, Backend::Ollama];

    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Vllm => "vllm",
            Backend::Ollama => "ollama",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = ModelOpsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vllm" => Ok(Backend::Vllm),
            "ollama" => Ok(Backend::Ollama),
            other => Err(ModelOpsError::InvalidBackend(other.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelFile {
    pub rel_path: String,
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub id: String,
    pub backend: Backend,
    /// Local directory; hub-managed models have none.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub size: String,
    #[serde(default = "unknown_quantization")]
    pub quantization: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloaded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<ModelFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_size: Option<u32>,
}

fn unknown_quantization() -> String {
    "Unknown".to_string()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Initializing,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    pub fn is_in_flight(&self) -> bool {
        !self.is_terminal()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DownloadTask {
    pub task_id: String,
    pub model_id: String,
    pub backend: Backend,
    pub status: TaskStatus,
    pub progress: u8,
    /// Percent per second.
    pub speed: f64,
    /// Seconds remaining, when a rate is known.
    pub eta: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl DownloadTask {
    pub fn new(task_id: String, model_id: &str, backend: Backend) -> Self {
        Self {
            task_id,
            model_id: model_id.to_string(),
            backend,
            status: TaskStatus::Pending,
            progress: 0,
            speed: 0.0,
            eta: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Move forward in the lifecycle. Terminal tasks never change again.
    pub fn advance(&mut self, next: TaskStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        true
    }

    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        if !self.advance(TaskStatus::Failed) {
            return false;
        }
        self.error = Some(error.into());
        true
    }

    pub fn complete(&mut self) -> bool {
        if !self.advance(TaskStatus::Completed) {
            return false;
        }
        self.progress = 100;
        self.eta = Some(0);
        true
    }
}

/// Task ids embed the model, backend and start time so repeated downloads of
/// one model never collide.
pub fn task_id(model_id: &str, backend: Backend, at: DateTime<Utc>) -> String {
    format!("{backend}:{model_id}:{}", at.timestamp_millis())
}

/// Key of a per-model override: `backend:model_id`.
pub fn override_key(model_id: &str, backend: Backend) -> String {
    format!("{backend}:{model_id}")
}

/// `org/name` -> `org--name`, the directory name used for downloads.
pub fn model_dir_name(model_id: &str) -> String {
    model_id.replace('/', "--")
}

/// Reject ids that could name a path outside the models directory once
/// turned into a directory name: empty or absolute ids, `.`/`..` or empty
/// segments, backslashes and control characters.
pub fn validate_model_id(model_id: &str) -> crate::Result<()> {
    let bad = |why: &str| Err(ModelOpsError::InvalidModelId(format!("{model_id:?}: {why}")));
    if model_id.trim().is_empty() {
        return bad("empty");
    }
    if model_id.starts_with('/') {
        return bad("absolute");
    }
    if model_id.contains('\\') || model_id.chars().any(char::is_control) {
        return bad("contains a backslash or control character");
    }
    if model_id.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
        return bad("empty, '.' or '..' path segment");
    }
    Ok(())
}

/// Inverse of [`model_dir_name`]; also accepts the hub cache layout
/// `models--org--name`.
pub fn unescape_model_dir(name: &str) -> String {
    name.strip_prefix("models--").unwrap_or(name).replace("--", "/")
}

/// Best guess of the weight format from a model name.
pub fn detect_quantization(name: &str) -> &'static str {
    let upper = name.to_ascii_uppercase();
    if upper.contains("AWQ") {
        "AWQ"
    } else if upper.contains("GPTQ") {
        "GPTQ"
    } else if upper.contains("GGUF") {
        "GGUF"
    } else {
        "Unknown"
    }
}

pub fn format_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b > GB {
        format!("{:.1} GB", b / GB)
    } else if b > MB {
        format!("{:.1} MB", b / MB)
    } else {
        format!("{:.1} KB", b / KB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parse() {
        assert_eq!("vllm".parse::<Backend>().unwrap(), Backend::Vllm);
        assert_eq!("ollama".parse::<Backend>().unwrap(), Backend::Ollama);
        assert!(matches!(
            "llamacpp".parse::<Backend>(),
            Err(ModelOpsError::InvalidBackend(name)) if name == "llamacpp"
        ));
    }

    #[test]
    fn test_unescape_cache_dir() {
        assert_eq!(unescape_model_dir("models--Qwen--Qwen2.5-7B-Instruct-AWQ"), "Qwen/Qwen2.5-7B-Instruct-AWQ");
        assert_eq!(unescape_model_dir("plain-model"), "plain-model");
        assert_eq!(unescape_model_dir("Qwen--Qwen2.5-7B"), "Qwen/Qwen2.5-7B");
        assert_eq!(model_dir_name("meta-llama/Llama-3.1-8B"), "meta-llama--Llama-3.1-8B");
    }

    #[test]
    fn test_validate_model_id() {
        for ok in ["Qwen/Qwen2.5-7B-Instruct-AWQ", "llama3:8b", "local/tiny.Q4_K_M.gguf", "phi-3"] {
            assert!(validate_model_id(ok).is_ok(), "{ok}");
        }
        for bad in ["", "  ", "..", ".", "/etc", "org/..", "org//m", "org/m/", "..\\x", "a\nb"] {
            assert!(
                matches!(validate_model_id(bad), Err(ModelOpsError::InvalidModelId(_))),
                "{bad:?} accepted"
            );
        }
    }

    #[test]
    fn test_detect_quantization() {
        assert_eq!(detect_quantization("Qwen2.5-32B-Instruct-AWQ"), "AWQ");
        assert_eq!(detect_quantization("TheBloke/Llama-2-7B-GPTQ"), "GPTQ");
        assert_eq!(detect_quantization("phi-3-mini-gguf"), "GGUF");
        assert_eq!(detect_quantization("Mistral-7B-Instruct-v0.3"), "Unknown");
    }

    #[test]
    fn test_terminal_status_is_sticky() {
        let mut t = DownloadTask::new("id".into(), "m", Backend::Vllm);
        assert!(t.advance(TaskStatus::Downloading));
        assert!(t.complete());
        assert_eq!(t.progress, 100);
        assert!(t.finished_at.is_some());

        assert!(!t.fail("late error"));
        assert_eq!(t.status, TaskStatus::Completed);
        assert!(t.error.is_none());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(5 * 1024 * 1024 + 1), "5.0 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024 + 1), "3.0 GB");
    }
}
