use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::progress::{parse_percent, ProgressMeter, EMIT_EVERY};
use crate::{
    detect_quantization, format_size, model_dir_name, task_id, validate_model_id, Backend,
    BackendSettings, DownloadTask, HubClient, Manifest, ModelOpsError, ModelRecord, ModelRegistry, ProgressBroadcaster,
    ProgressEvent, Result, SettingsStore, TaskStatus,
};

/// Stderr lines kept for the failure message.
const STDERR_TAIL: usize = 20;

pub const DEFAULT_MAX_FINISHED_TASKS: usize = 50;

#[derive(Clone, Debug)]
pub struct DownloadConfig {
    pub models_dir: PathBuf,
    /// Command line of the hub download tool; may carry leading arguments,
    /// e.g. `python3 -m huggingface_hub.commands.huggingface_cli`.
    pub hf_cli: String,
    pub hf_token: Option<String>,
    pub max_finished_tasks: usize,
}

impl DownloadConfig {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
            hf_cli: "huggingface-cli".to_string(),
            hf_token: None,
            max_finished_tasks: DEFAULT_MAX_FINISHED_TASKS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StartOutcome {
    Started { task_id: String },
    AlreadyDownloading { task_id: String },
}

impl StartOutcome {
    pub fn task_id(&self) -> &str {
        match self {
            StartOutcome::Started { task_id } | StartOutcome::AlreadyDownloading { task_id } => task_id,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    NotFound,
    AlreadyFinished,
}

enum Fetched {
    Done(ModelRecord),
    Cancelled,
}

/// `--include` patterns for a requested quantization, if it is one the hub
/// tool can filter on.
pub fn include_patterns(quantization: &str) -> Option<Vec<String>> {
    let q = quantization.to_ascii_uppercase();
    let weights = match q.as_str() {
        "AWQ" | "GPTQ" | "Q4_K_M" | "Q5_K_M" | "Q8_0" => format!("*{}*", q.to_ascii_lowercase()),
        _ => return None,
    };
    Some(vec![weights, "*.json".to_string(), "*.txt".to_string()])
}

/// Runs fetches in the background and keeps their task records.
#[derive(Clone)]
pub struct DownloadCoordinator {
    cfg: Arc<DownloadConfig>,
    tasks: Arc<RwLock<HashMap<String, DownloadTask>>>,
    active: Arc<Mutex<HashMap<String, CancellationToken>>>,
    registry: Arc<ModelRegistry>,
    settings: Arc<SettingsStore>,
    hub: HubClient,
    broadcaster: Arc<ProgressBroadcaster>,
}

impl DownloadCoordinator {
    pub fn new(
        cfg: DownloadConfig,
        registry: Arc<ModelRegistry>,
        settings: Arc<SettingsStore>,
        hub: HubClient,
        broadcaster: Arc<ProgressBroadcaster>,
    ) -> Self {
        Self {
            cfg: Arc::new(cfg),
            tasks: Arc::new(RwLock::new(HashMap::new())),
            active: Arc::new(Mutex::new(HashMap::new())),
            registry,
            settings,
            hub,
            broadcaster,
        }
    }

    /// Create a task and spawn its fetch. Returns immediately.
    ///
    /// A settings patch is type-checked here and stored as the model's
    /// override once the fetch succeeds.
    pub async fn start_download(
        &self,
        model_id: &str,
        backend: Backend,
        settings: Option<Map<String, Value>>,
    ) -> Result<StartOutcome> {
        validate_model_id(model_id)?;
        let patch = match settings {
            Some(map) => {
                let map: Map<String, Value> = map.into_iter().filter(|(_, v)| !v.is_null()).collect();
                BackendSettings::parse(backend, &map)?;
                Some(map).filter(|m| !m.is_empty())
            }
            None => None,
        };

        let task = {
            let mut tasks = self.tasks.write().await;
            if let Some(existing) = tasks
                .values()
                .find(|t| t.model_id == model_id && t.backend == backend && t.status.is_in_flight())
            {
                info!(task_id=%existing.task_id, "download: already in progress");
                return Ok(StartOutcome::AlreadyDownloading {
                    task_id: existing.task_id.clone(),
                });
            }

            let mut at = Utc::now();
            let mut id = task_id(model_id, backend, at);
            while tasks.contains_key(&id) {
                at += chrono::Duration::milliseconds(1);
                id = task_id(model_id, backend, at);
            }
            let task = DownloadTask::new(id.clone(), model_id, backend);
            tasks.insert(id, task.clone());
            task
        };

        let cancel = CancellationToken::new();
        self.active.lock().await.insert(task.task_id.clone(), cancel.clone());
        self.publish(&task).await;

        info!(task_id=%task.task_id, model_id=%model_id, backend=%backend, "download: started");
        let this = self.clone();
        let task_id = task.task_id.clone();
        let model_id = model_id.to_string();
        tokio::spawn(async move {
            this.run(task_id, model_id, backend, patch, cancel).await;
        });

        Ok(StartOutcome::Started { task_id: task.task_id })
    }

    pub async fn get_status(&self, task_id: &str) -> Option<DownloadTask> {
        self.tasks.read().await.get(task_id).cloned()
    }

    /// Most recently started task for a model, on any backend.
    pub async fn status_for_model(&self, model_id: &str) -> Option<DownloadTask> {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| t.model_id == model_id)
            .max_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.task_id.cmp(&b.task_id)))
            .cloned()
    }

    pub async fn list_all(&self) -> BTreeMap<String, DownloadTask> {
        self.tasks
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Stop a running fetch. The task turns `cancelled` right away; files
    /// already written stay on disk.
    pub async fn cancel(&self, task_id: &str) -> CancelOutcome {
        let snapshot = {
            let mut tasks = self.tasks.write().await;
            let Some(task) = tasks.get_mut(task_id) else {
                return CancelOutcome::NotFound;
            };
            if !task.advance(TaskStatus::Cancelled) {
                return CancelOutcome::AlreadyFinished;
            }
            task.error = Some("cancelled by request".to_string());
            task.clone()
        };

        if let Some(token) = self.active.lock().await.get(task_id) {
            token.cancel();
        }
        info!(task_id=%task_id, "download: cancelled");
        self.publish(&snapshot).await;
        CancelOutcome::Cancelled
    }

    /// Cancel every running fetch, e.g. on shutdown.
    pub async fn cancel_all(&self) {
        for token in self.active.lock().await.values() {
            token.cancel();
        }
    }

    pub async fn in_flight(&self) -> usize {
        self.active.lock().await.len()
    }

    async fn run(
        self,
        task_id: String,
        model_id: String,
        backend: Backend,
        patch: Option<Map<String, Value>>,
        cancel: CancellationToken,
    ) {
        self.update(&task_id, |t| {
            t.advance(TaskStatus::Initializing);
        })
        .await;

        let fetched = match backend {
            Backend::Vllm => self.fetch_hf(&task_id, &model_id, patch.as_ref(), &cancel).await,
            Backend::Ollama => self.fetch_hub(&task_id, &model_id, &cancel).await,
        };

        match fetched {
            Ok(Fetched::Done(record)) => {
                self.finish(&task_id, &model_id, backend, record, patch.as_ref(), &cancel)
                    .await;
            }
            Ok(_) => {
                self.update(&task_id, |t| {
                    if t.advance(TaskStatus::Cancelled) {
                        t.error = Some("cancelled".to_string());
                    }
                })
                .await;
            }
            Err(e) => {
                error!(task_id=%task_id, model_id=%model_id, "download: failed: {e}");
                let msg = e.to_string();
                self.update(&task_id, |t| {
                    t.fail(msg);
                })
                .await;
            }
        }

        self.evict_finished().await;
        self.active.lock().await.remove(&task_id);
    }

    /// Register a fetched model and complete the task. The task table stays
    /// locked throughout, so a concurrent `cancel` either lands before (and
    /// nothing is registered) or after (and finds the task completed).
    async fn finish(
        &self,
        task_id: &str,
        model_id: &str,
        backend: Backend,
        record: ModelRecord,
        patch: Option<&Map<String, Value>>,
        cancel: &CancellationToken,
    ) {
        let snapshot = {
            let mut tasks = self.tasks.write().await;
            let Some(task) = tasks.get_mut(task_id) else { return };
            if cancel.is_cancelled() || task.status.is_terminal() {
                if task.advance(TaskStatus::Cancelled) {
                    task.error = Some("cancelled".to_string());
                }
                info!(task_id=%task_id, "download: cancelled before registration");
                task.clone()
            } else {
                self.registry.upsert(record).await;
                if let Some(patch) = patch {
                    if let Err(e) = self.settings.set_override(model_id, backend, patch).await {
                        warn!(task_id=%task_id, "download: settings override not stored: {e}");
                    }
                }
                task.complete();
                info!(task_id=%task_id, model_id=%model_id, "download: completed");
                task.clone()
            }
        };
        self.publish(&snapshot).await;
    }

    async fn fetch_hf(
        &self,
        task_id: &str,
        model_id: &str,
        patch: Option<&Map<String, Value>>,
        cancel: &CancellationToken,
    ) -> Result<Fetched> {
        let dir = self.cfg.models_dir.join(model_dir_name(model_id));
        tokio::fs::create_dir_all(&dir).await?;

        let requested = patch
            .and_then(|p| p.get("quantization"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let mut tool = self.cfg.hf_cli.split_whitespace();
        let program = tool
            .next()
            .ok_or_else(|| ModelOpsError::ExternalTool("no download tool configured".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(tool)
            .arg("download")
            .arg(model_id)
            .arg("--local-dir")
            .arg(&dir)
            .arg("--local-dir-use-symlinks")
            .arg("False");
        if let Some(token) = &self.cfg.hf_token {
            cmd.arg("--token").arg(token);
        }
        let patterns = requested.as_deref().and_then(include_patterns);
        if let Some(patterns) = &patterns {
            cmd.arg("--include").args(patterns);
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| ModelOpsError::ExternalTool(format!("failed to spawn {}: {e}", self.cfg.hf_cli)))?;

        self.update(task_id, |t| {
            t.advance(TaskStatus::Downloading);
        })
        .await;

        if let Some(stdout) = child.stdout.take() {
            let task_id = task_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(task_id=%task_id, "hf stdout: {line}");
                }
            });
        }

        let stderr = child.stderr.take();
        let finished = {
            let wait = async {
                let tail = match stderr {
                    Some(stderr) => self.track_progress(task_id, stderr).await,
                    None => VecDeque::new(),
                };
                (child.wait().await, tail)
            };
            tokio::select! {
                _ = cancel.cancelled() => None,
                res = wait => Some(res),
            }
        };

        let Some((status, tail)) = finished else {
            if let Err(e) = child.kill().await {
                warn!(task_id=%task_id, "download: kill failed: {e}");
            }
            return Ok(Fetched::Cancelled);
        };

        let status = status?;
        if !status.success() {
            let detail = Vec::from(tail).join("\n");
            return Err(ModelOpsError::ExternalTool(if detail.is_empty() {
                format!("{} exited with {status}", self.cfg.hf_cli)
            } else {
                detail
            }));
        }

        let quantization = match (&patterns, requested) {
            (Some(_), Some(q)) => q.to_ascii_uppercase(),
            _ => detect_quantization(model_id).to_string(),
        };
        let record = snapshot_record(model_id, &dir, quantization).await?;
        Ok(Fetched::Done(record))
    }

    /// Read the tool's error stream, publishing throttled progress.
    /// Returns the last lines seen.
    async fn track_progress<R: AsyncRead + Unpin>(&self, task_id: &str, stderr: R) -> VecDeque<String> {
        let mut meter = ProgressMeter::new(Instant::now(), EMIT_EVERY);
        let mut tail = VecDeque::with_capacity(STDERR_TAIL);
        // progress bars redraw with '\r'
        let mut segments = BufReader::new(stderr).split(b'\r');

        loop {
            let segment = match segments.next_segment().await {
                Ok(Some(s)) => s,
                Ok(None) => break,
                Err(e) => {
                    warn!(task_id=%task_id, "download: stderr read failed: {e}");
                    break;
                }
            };
            for line in String::from_utf8_lossy(&segment).lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if tail.len() == STDERR_TAIL {
                    tail.pop_front();
                }
                tail.push_back(line.to_string());

                let Some(pct) = parse_percent(line) else { continue };
                let now = Instant::now();
                if !meter.should_emit(now) {
                    continue;
                }
                let (speed, eta) = meter.rates(pct, now);
                self.update(task_id, |t| {
                    if t.status.is_in_flight() {
                        t.status = TaskStatus::Downloading;
                        t.progress = pct;
                        t.speed = (speed * 100.0).round() / 100.0;
                        t.eta = eta;
                    }
                })
                .await;
            }
        }
        tail
    }

    async fn fetch_hub(&self, task_id: &str, model_id: &str, cancel: &CancellationToken) -> Result<Fetched> {
        let mut events = tokio::select! {
            _ = cancel.cancelled() => return Ok(Fetched::Cancelled),
            r = self.hub.pull(model_id) => r?,
        };

        self.update(task_id, |t| {
            t.advance(TaskStatus::Downloading);
        })
        .await;

        let mut meter = ProgressMeter::new(Instant::now(), EMIT_EVERY);
        let mut total: u64 = 0;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Ok(Fetched::Cancelled),
                n = events.next() => n,
            };
            let ev = match next {
                None => {
                    return Err(ModelOpsError::ExternalTool(format!(
                        "pull of {model_id} ended without success"
                    )))
                }
                Some(ev) => ev?,
            };
            if let Some(err) = ev.error {
                return Err(ModelOpsError::ExternalTool(err));
            }
            if ev.is_success() {
                break;
            }
            total = total.max(ev.total.unwrap_or(0));
            let Some(pct) = ev.percent() else { continue };
            let now = Instant::now();
            if meter.should_emit(now) {
                let (speed, eta) = meter.rates(pct, now);
                self.update(task_id, |t| {
                    if t.status.is_in_flight() {
                        t.progress = pct;
                        t.speed = (speed * 100.0).round() / 100.0;
                        t.eta = eta;
                    }
                })
                .await;
            }
        }

        Ok(Fetched::Done(ModelRecord {
            id: model_id.to_string(),
            backend: Backend::Ollama,
            path: None,
            size_bytes: total,
            size: format_size(total),
            quantization: detect_quantization(model_id).to_string(),
            discovered_at: None,
            downloaded_at: Some(Utc::now()),
            active: false,
            files: Vec::new(),
            manifest_hash: None,
            retention: None,
            context_size: None,
        }))
    }

    /// Apply `f` and broadcast the result if the task still exists.
    async fn update(&self, task_id: &str, f: impl FnOnce(&mut DownloadTask)) {
        let snapshot = {
            let mut tasks = self.tasks.write().await;
            let Some(task) = tasks.get_mut(task_id) else { return };
            f(task);
            task.clone()
        };
        self.publish(&snapshot).await;
    }

    async fn publish(&self, task: &DownloadTask) {
        self.broadcaster.broadcast(&ProgressEvent::download(task)).await;
    }

    /// Drop the oldest finished tasks beyond the retention limit.
    async fn evict_finished(&self) {
        let mut tasks = self.tasks.write().await;
        let mut finished: Vec<_> = tasks
            .values()
            .filter(|t| t.status.is_terminal())
            .map(|t| (t.finished_at.unwrap_or(t.started_at), t.task_id.clone()))
            .collect();
        if finished.len() <= self.cfg.max_finished_tasks {
            return;
        }
        finished.sort();
        let excess = finished.len() - self.cfg.max_finished_tasks;
        for (_, id) in finished.into_iter().take(excess) {
            tasks.remove(&id);
            debug!(task_id=%id, "download: evicted finished task");
        }
    }
}

async fn snapshot_record(model_id: &str, dir: &Path, quantization: String) -> Result<ModelRecord> {
    let walk_dir = dir.to_path_buf();
    let manifest = tokio::task::spawn_blocking(move || Manifest::of_dir(&walk_dir))
        .await
        .map_err(|e| ModelOpsError::ExternalTool(format!("snapshot walk failed: {e}")))?;

    Ok(ModelRecord {
        id: model_id.to_string(),
        backend: Backend::Vllm,
        path: Some(dir.display().to_string()),
        size_bytes: manifest.size_bytes,
        size: format_size(manifest.size_bytes),
        quantization,
        discovered_at: None,
        downloaded_at: Some(Utc::now()),
        active: false,
        manifest_hash: Some(manifest.hash),
        files: manifest.files,
        retention: None,
        context_size: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DefaultSettings;
    use docstore::InMemoryStorage;

    fn coordinator(models_dir: &Path, max_finished: usize) -> DownloadCoordinator {
        let mut cfg = DownloadConfig::new(models_dir);
        cfg.hf_cli = "/definitely/not/huggingface-cli".to_string();
        cfg.max_finished_tasks = max_finished;
        DownloadCoordinator::new(
            cfg,
            Arc::new(ModelRegistry::open(InMemoryStorage::new())),
            Arc::new(SettingsStore::open(InMemoryStorage::new(), DefaultSettings::new("/models", "/ollama"))),
            HubClient::new("http://127.0.0.1:9"),
            Arc::new(ProgressBroadcaster::default()),
        )
    }

    async fn seed(c: &DownloadCoordinator, id: &str, status: TaskStatus, finished_secs: i64) {
        let mut t = DownloadTask::new(id.to_string(), "m", Backend::Vllm);
        t.status = status;
        if status.is_terminal() {
            t.finished_at = Some(chrono::DateTime::from_timestamp(finished_secs, 0).unwrap());
        }
        c.tasks.write().await.insert(id.to_string(), t);
    }

    #[test]
    fn test_include_patterns() {
        assert_eq!(include_patterns("AWQ").unwrap(), vec!["*awq*", "*.json", "*.txt"]);
        assert_eq!(include_patterns("q4_k_m").unwrap()[0], "*q4_k_m*");
        assert!(include_patterns("auto").is_none());
    }

    #[tokio::test]
    async fn test_eviction_keeps_newest_finished_and_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let c = coordinator(dir.path(), 2);
        seed(&c, "a", TaskStatus::Completed, 100).await;
        seed(&c, "b", TaskStatus::Failed, 300).await;
        seed(&c, "c", TaskStatus::Cancelled, 200).await;
        seed(&c, "d", TaskStatus::Downloading, 0).await;

        c.evict_finished().await;

        let ids: Vec<String> = c.list_all().await.into_keys().collect();
        assert_eq!(ids, vec!["b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_cancel_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let c = coordinator(dir.path(), 10);
        seed(&c, "done", TaskStatus::Completed, 1).await;
        seed(&c, "live", TaskStatus::Downloading, 0).await;

        assert_eq!(c.cancel("nope").await, CancelOutcome::NotFound);
        assert_eq!(c.cancel("done").await, CancelOutcome::AlreadyFinished);
        assert_eq!(c.cancel("live").await, CancelOutcome::Cancelled);

        let t = c.get_status("live").await.unwrap();
        assert_eq!(t.status, TaskStatus::Cancelled);
        assert!(t.error.is_some());
        assert_eq!(c.cancel("live").await, CancelOutcome::AlreadyFinished);
    }

    #[tokio::test]
    async fn test_invalid_settings_rejected_before_task_created() {
        let dir = tempfile::tempdir().unwrap();
        let c = coordinator(dir.path(), 10);
        let mut patch = Map::new();
        patch.insert("max_model_len".into(), Value::String("lots".into()));

        let err = c.start_download("org/m", Backend::Vllm, Some(patch)).await.unwrap_err();
        assert!(matches!(err, ModelOpsError::InvalidSettings(_)));
        assert!(c.list_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_path_like_ids_rejected_before_task_created() {
        let dir = tempfile::tempdir().unwrap();
        let models = dir.path().join("models");
        let c = coordinator(&models, 10);

        for id in ["..", "", "/abs", "org/../..", "org\\m"] {
            let err = c.start_download(id, Backend::Vllm, None).await.unwrap_err();
            assert!(matches!(err, ModelOpsError::InvalidModelId(_)), "{id:?}");
        }
        assert!(c.list_all().await.is_empty());
        assert!(!models.exists());
    }

    #[tokio::test]
    async fn test_cancel_before_registration_registers_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let c = coordinator(dir.path(), 10);
        seed(&c, "t", TaskStatus::Downloading, 0).await;
        let token = CancellationToken::new();
        c.active.lock().await.insert("t".to_string(), token.clone());

        assert_eq!(c.cancel("t").await, CancelOutcome::Cancelled);
        let record = snapshot_record("m", dir.path(), "Unknown".into()).await.unwrap();
        c.finish("t", "m", Backend::Vllm, record, None, &token).await;

        assert_eq!(c.get_status("t").await.unwrap().status, TaskStatus::Cancelled);
        assert!(c.registry.get("m").await.is_none());
    }

    #[tokio::test]
    async fn test_finish_completes_and_registers() {
        let dir = tempfile::tempdir().unwrap();
        let c = coordinator(dir.path(), 10);
        seed(&c, "t", TaskStatus::Downloading, 0).await;

        let record = snapshot_record("m", dir.path(), "Unknown".into()).await.unwrap();
        c.finish("t", "m", Backend::Vllm, record, None, &CancellationToken::new()).await;

        assert_eq!(c.get_status("t").await.unwrap().status, TaskStatus::Completed);
        assert!(c.registry.get("m").await.is_some());
        assert_eq!(c.cancel("t").await, CancelOutcome::AlreadyFinished);
    }

    #[tokio::test]
    async fn test_missing_tool_fails_task() {
        let dir = tempfile::tempdir().unwrap();
        let c = coordinator(dir.path(), 10);

        let out = c.start_download("org/m", Backend::Vllm, None).await.unwrap();
        let id = out.task_id().to_string();

        let mut task = c.get_status(&id).await.unwrap();
        for _ in 0..100 {
            if task.status.is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            task = c.get_status(&id).await.unwrap();
        }
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("failed to spawn"));
        assert_eq!(c.status_for_model("org/m").await.unwrap().task_id, id);
    }
}
