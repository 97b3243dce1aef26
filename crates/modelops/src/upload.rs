use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::{
    detect_quantization, format_size, manifest_hash, Backend, ModelFile, ModelOpsError, ModelRecord, ModelRegistry,
    Result,
};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Uploaded {
    pub status: String,
    pub model_id: String,
    pub path: String,
}

/// Stores single-file models (typically `.gguf`) sent by clients and
/// registers them as `local/<filename>`.
pub struct ModelUploader {
    models_dir: PathBuf,
    registry: Arc<ModelRegistry>,
}

/// A bare file name: no separators, no leading dot, no control characters.
pub fn validate_upload_name(name: &str) -> Result<()> {
    let bad = |why: &str| Err(ModelOpsError::Upload(format!("file name {name:?} {why}")));
    if name.trim().is_empty() {
        return bad("is empty");
    }
    if name.contains('/') || name.contains('\\') {
        return bad("contains a path separator");
    }
    if name.starts_with('.') {
        return bad("starts with '.'");
    }
    if name.chars().any(char::is_control) {
        return bad("contains a control character");
    }
    Ok(())
}

impl ModelUploader {
    pub fn new(models_dir: impl Into<PathBuf>, registry: Arc<ModelRegistry>) -> Self {
        Self {
            models_dir: models_dir.into(),
            registry,
        }
    }

    /// Stream `body` to `<models_dir>/<filename>` and register it. The file
    /// only appears under its final name once fully written; an existing
    /// model of the same name is replaced.
    pub async fn import<S, B, E>(&self, filename: &str, body: S) -> Result<Uploaded>
    where
        S: Stream<Item = std::result::Result<B, E>> + Unpin,
        B: AsRef<[u8]>,
        E: Display,
    {
        validate_upload_name(filename)?;
        tokio::fs::create_dir_all(&self.models_dir).await?;

        let part = self.models_dir.join(format!(".{filename}.part"));
        let size = match write_part(&part, body).await {
            Ok(0) => {
                remove_part(&part).await;
                return Err(ModelOpsError::Upload(format!("{filename} is empty")));
            }
            Ok(n) => n,
            Err(e) => {
                remove_part(&part).await;
                return Err(e);
            }
        };

        let path = self.models_dir.join(filename);
        tokio::fs::rename(&part, &path).await?;

        let model_id = format!("local/{filename}");
        let files = vec![ModelFile {
            rel_path: filename.to_string(),
            size,
        }];
        self.registry
            .upsert(ModelRecord {
                id: model_id.clone(),
                backend: Backend::Vllm,
                path: Some(path.display().to_string()),
                size_bytes: size,
                size: format_size(size),
                quantization: detect_quantization(filename).to_string(),
                discovered_at: None,
                downloaded_at: Some(Utc::now()),
                active: false,
                manifest_hash: Some(manifest_hash(&files)),
                files,
                retention: None,
                context_size: None,
            })
            .await;
        info!(model_id=%model_id, size, "upload: model stored");

        Ok(Uploaded {
            status: "uploaded".to_string(),
            model_id,
            path: path.display().to_string(),
        })
    }
}

async fn write_part<S, B, E>(part: &PathBuf, mut body: S) -> Result<u64>
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut file = tokio::fs::File::create(part).await?;
    let mut written = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| ModelOpsError::Upload(e.to_string()))?;
        file.write_all(chunk.as_ref()).await?;
        written += chunk.as_ref().len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

async fn remove_part(part: &PathBuf) {
    if let Err(e) = tokio::fs::remove_file(part).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path=%part.display(), "upload: could not remove partial file: {e}");
        }
    }
}
