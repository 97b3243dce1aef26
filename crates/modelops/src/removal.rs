use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::{model_dir_name, Backend, HubClient, ModelOpsError, ModelRegistry, Result};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Deletion {
    pub model_id: String,
    pub backend: Backend,
    /// Directory removed from disk, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removed_path: Option<String>,
}

enum Resolved {
    Inside(PathBuf),
    Outside(PathBuf),
    Missing,
}

pub struct ModelRemover {
    models_dir: PathBuf,
    registry: Arc<ModelRegistry>,
    hub: HubClient,
}

impl ModelRemover {
    pub fn new(models_dir: impl Into<PathBuf>, registry: Arc<ModelRegistry>, hub: HubClient) -> Self {
        Self {
            models_dir: models_dir.into(),
            registry,
            hub,
        }
    }

    pub async fn delete(&self, model_id: &str, backend: Backend) -> Result<Deletion> {
        match backend {
            Backend::Vllm => self.delete_local(model_id).await,
            Backend::Ollama => {
                self.hub.delete(model_id).await?;
                self.registry.remove(model_id).await;
                info!(model_id=%model_id, "delete: hub model removed");
                Ok(Deletion {
                    model_id: model_id.to_string(),
                    backend,
                    removed_path: None,
                })
            }
        }
    }

    /// Resolve symlinks and `..` on both sides before comparing, so only a
    /// strict descendant of the models root is ever removed.
    async fn resolve_inside_root(&self, path: &Path) -> Result<Resolved> {
        let target = match tokio::fs::canonicalize(path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Resolved::Missing),
            Err(e) => return Err(e.into()),
        };
        let root = match tokio::fs::canonicalize(&self.models_dir).await {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Resolved::Outside(target)),
            Err(e) => return Err(e.into()),
        };
        if target != root && target.starts_with(&root) {
            Ok(Resolved::Inside(target))
        } else {
            Ok(Resolved::Outside(target))
        }
    }

    async fn delete_local(&self, model_id: &str) -> Result<Deletion> {
        let record = self
            .registry
            .get(model_id)
            .await
            .filter(|r| r.backend == Backend::Vllm)
            .ok_or_else(|| ModelOpsError::ModelNotFound(model_id.to_string()))?;

        let path = record
            .path
            .map(PathBuf::from)
            .unwrap_or_else(|| self.models_dir.join(model_dir_name(model_id)));

        let removed_path = match self.resolve_inside_root(&path).await? {
            Resolved::Inside(target) => {
                let meta = tokio::fs::symlink_metadata(&target).await?;
                let res = if meta.is_dir() {
                    tokio::fs::remove_dir_all(&target).await
                } else {
                    tokio::fs::remove_file(&target).await
                };
                match res {
                    Ok(()) => Some(target.display().to_string()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                    Err(e) => return Err(e.into()),
                }
            }
            Resolved::Missing => None,
            Resolved::Outside(target) => {
                warn!(model_id=%model_id, path=%target.display(), "delete: path outside models dir, leaving files");
                None
            }
        };

        self.registry.remove(model_id).await;
        info!(model_id=%model_id, "delete: model removed");
        Ok(Deletion {
            model_id: model_id.to_string(),
            backend: Backend::Vllm,
            removed_path,
        })
    }
}
