use std::sync::Arc;

use docstore::FileBackedStorage;
use modelops::{
    ActivationController, CommandServer, DefaultSettings, DownloadConfig, DownloadCoordinator, HfSearchClient,
    HubClient, InferenceServer, ModelRegistry, ModelRemover, ModelScanner, ModelUploader, NoopServer,
    ProgressBroadcaster, ScannerConfig, SettingsStore,
};

use crate::config::AppConfig;

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub cfg: AppConfig,
    pub settings: Arc<SettingsStore>,
    pub registry: Arc<ModelRegistry>,
    pub scanner: ModelScanner,
    pub search: HfSearchClient,
    pub uploader: ModelUploader,
    pub downloads: DownloadCoordinator,
    pub activation: ActivationController,
    pub remover: ModelRemover,
    pub broadcaster: Arc<ProgressBroadcaster>,
}

impl AppState {
    /// Wire every component around one settings document and one registry
    /// document on disk.
    pub fn new(cfg: AppConfig) -> Self {
        let defaults = DefaultSettings::new(
            &cfg.models_dir.display().to_string(),
            &cfg.ollama_models_dir.display().to_string(),
        );
        let settings = Arc::new(SettingsStore::open(FileBackedStorage::new(&cfg.settings_path), defaults));
        let registry = Arc::new(ModelRegistry::open(FileBackedStorage::new(&cfg.registry_path)));
        let broadcaster = Arc::new(ProgressBroadcaster::default());
        let hub = HubClient::new(cfg.ollama_url.clone());

        let scanner = ModelScanner::new(
            ScannerConfig {
                models_dir: cfg.models_dir.clone(),
                embeddings_url: cfg.embeddings_url.clone(),
                reranker_url: cfg.reranker_url.clone(),
                default_model: cfg.default_llm_model.clone(),
            },
            hub.clone(),
            settings.clone(),
        );

        let mut dl = DownloadConfig::new(&cfg.models_dir);
        dl.hf_cli = cfg.hf_cli.clone();
        dl.hf_token = cfg.hf_token.clone();
        dl.max_finished_tasks = cfg.max_finished_tasks;
        let downloads = DownloadCoordinator::new(dl, registry.clone(), settings.clone(), hub.clone(), broadcaster.clone());

        let server: Box<dyn InferenceServer> = match (&cfg.vllm_env_file, &cfg.vllm_restart_cmd) {
            (None, None) => Box::new(NoopServer),
            (env_file, cmd) => Box::new(CommandServer::new(env_file.clone(), cmd.as_deref().unwrap_or(""))),
        };
        let activation = ActivationController::new(registry.clone(), server);
        let remover = ModelRemover::new(&cfg.models_dir, registry.clone(), hub);
        let search = HfSearchClient::new(cfg.hf_api_url.clone(), cfg.hf_token.clone());
        let uploader = ModelUploader::new(&cfg.models_dir, registry.clone());

        Self {
            cfg,
            settings,
            registry,
            scanner,
            search,
            uploader,
            downloads,
            activation,
            remover,
            broadcaster,
        }
    }
}
