use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelOpsError {
    #[error("Invalid backend: {0} (expected 'vllm' or 'ollama')")]
    InvalidBackend(String),

    #[error("Invalid model id: {0}")]
    InvalidModelId(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("External tool failed: {0}")]
    ExternalTool(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Persistence error: {0}")]
    Persistence(#[from] docstore::StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<reqwest::Error> for ModelOpsError {
    fn from(e: reqwest::Error) -> Self {
        ModelOpsError::ExternalTool(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ModelOpsError>;
