use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info};

use crate::{Backend, ModelOpsError, ModelRecord, ModelRegistry, Result};

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ActivationState {
    Inactive,
    Activating { model_id: String, started_at: DateTime<Utc> },
    Active { model_id: String, activated_at: DateTime<Utc> },
    Failed { model_id: String, error: String, failed_at: DateTime<Utc> },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Activation {
    pub model_id: String,
    pub backend: Backend,
    /// `restart_requested` or `ready`.
    pub status: String,
    pub message: String,
}

/// The process serving the filesystem backend.
#[async_trait]
pub trait InferenceServer: Send + Sync {
    /// Point the server at `model` and ask it to restart.
    async fn switch_model(&self, model: &ModelRecord) -> Result<()>;
    fn name(&self) -> &str;
}

/// No restart hook configured. Only the registry flags move.
pub struct NoopServer;

#[async_trait]
impl InferenceServer for NoopServer {
    async fn switch_model(&self, model: &ModelRecord) -> Result<()> {
        info!(model_id=%model.id, "activation: no restart hook configured");
        Ok(())
    }

    fn name(&self) -> &str {
        "noop"
    }
}

/// Rewrites `MODEL=` in an env file, then runs a restart command.
pub struct CommandServer {
    env_file: Option<PathBuf>,
    restart: Vec<String>,
}

impl CommandServer {
    /// `restart` is a whitespace-separated command line, e.g.
    /// `docker restart inference`.
    pub fn new(env_file: Option<PathBuf>, restart: &str) -> Self {
        Self {
            env_file,
            restart: restart.split_whitespace().map(str::to_string).collect(),
        }
    }

    async fn write_env(&self, path: &PathBuf, value: &str) -> Result<()> {
        let current = match tokio::fs::read_to_string(path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let next = set_env_line(&current, "MODEL", value);

        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        tokio::fs::write(&tmp, next).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl InferenceServer for CommandServer {
    async fn switch_model(&self, model: &ModelRecord) -> Result<()> {
        if let Some(env_file) = &self.env_file {
            let value = model.path.as_deref().unwrap_or(&model.id);
            self.write_env(env_file, value).await?;
        }

        let Some((program, args)) = self.restart.split_first() else {
            return Ok(());
        };
        let out = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| ModelOpsError::ExternalTool(format!("failed to run {program}: {e}")))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            return Err(ModelOpsError::ExternalTool(format!(
                "{program} exited with {}: {stderr}",
                out.status
            )));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "command"
    }
}

/// Replace the `KEY=` line, or append one.
pub fn set_env_line(contents: &str, key: &str, value: &str) -> String {
    let prefix = format!("{key}=");
    let mut replaced = false;
    let mut lines: Vec<String> = contents
        .lines()
        .map(|l| {
            if !replaced && l.trim_start().starts_with(&prefix) {
                replaced = true;
                format!("{prefix}{value}")
            } else {
                l.to_string()
            }
        })
        .collect();
    if !replaced {
        lines.push(format!("{prefix}{value}"));
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Switches which model each backend serves.
pub struct ActivationController {
    registry: Arc<ModelRegistry>,
    server: Box<dyn InferenceServer>,
    states: RwLock<HashMap<Backend, ActivationState>>,
    switching: Mutex<()>,
}

impl ActivationController {
    pub fn new(registry: Arc<ModelRegistry>, server: Box<dyn InferenceServer>) -> Self {
        Self {
            registry,
            server,
            states: RwLock::new(HashMap::new()),
            switching: Mutex::new(()),
        }
    }

    /// Seed states from the registry's active flags.
    pub async fn sync_from_registry(&self) {
        let mut states = self.states.write().await;
        for backend in Backend::ALL {
            if let Some(rec) = self.registry.active(backend).await.into_iter().next() {
                states.insert(
                    backend,
                    ActivationState::Active {
                        model_id: rec.id,
                        activated_at: Utc::now(),
                    },
                );
            }
        }
    }

    pub async fn state(&self, backend: Backend) -> ActivationState {
        self.states
            .read()
            .await
            .get(&backend)
            .cloned()
            .unwrap_or(ActivationState::Inactive)
    }

    async fn set_state(&self, backend: Backend, state: ActivationState) {
        self.states.write().await.insert(backend, state);
    }

    pub async fn activate(&self, model_id: &str, backend: Backend) -> Result<Activation> {
        match backend {
            Backend::Ollama => {
                self.set_state(
                    backend,
                    ActivationState::Active {
                        model_id: model_id.to_string(),
                        activated_at: Utc::now(),
                    },
                )
                .await;
                Ok(Activation {
                    model_id: model_id.to_string(),
                    backend,
                    status: "ready".to_string(),
                    message: "hub models are loaded on first request".to_string(),
                })
            }
            Backend::Vllm => self.activate_local(model_id).await,
        }
    }

    async fn activate_local(&self, model_id: &str) -> Result<Activation> {
        let backend = Backend::Vllm;
        let _switching = self.switching.lock().await;

        self.set_state(
            backend,
            ActivationState::Activating {
                model_id: model_id.to_string(),
                started_at: Utc::now(),
            },
        )
        .await;

        // flags move before the restart and stay moved if it fails
        let record = match self.registry.set_active(backend, model_id).await {
            Ok(rec) => rec,
            Err(e) => {
                self.mark_failed(backend, model_id, &e).await;
                return Err(e);
            }
        };

        info!(model_id=%model_id, server=%self.server.name(), "activation: switching model");
        match self.server.switch_model(&record).await {
            Ok(()) => {
                self.set_state(
                    backend,
                    ActivationState::Active {
                        model_id: model_id.to_string(),
                        activated_at: Utc::now(),
                    },
                )
                .await;
                Ok(Activation {
                    model_id: model_id.to_string(),
                    backend,
                    status: "restart_requested".to_string(),
                    message: format!("{} restart requested", self.server.name()),
                })
            }
            Err(e) => {
                error!(model_id=%model_id, "activation: restart failed: {e}");
                self.mark_failed(backend, model_id, &e).await;
                Err(match e {
                    ModelOpsError::ExternalTool(_) => e,
                    other => ModelOpsError::ExternalTool(other.to_string()),
                })
            }
        }
    }

    async fn mark_failed(&self, backend: Backend, model_id: &str, e: &ModelOpsError) {
        self.set_state(
            backend,
            ActivationState::Failed {
                model_id: model_id.to_string(),
                error: e.to_string(),
                failed_at: Utc::now(),
            },
        )
        .await;
    }
}
