use std::sync::Arc;

use lapor_domain::ports::db::TransactionalStore;
use lapor_domain::ports::rooms::RoomDirectory;
use lapor_domain::realtime::RealtimeEngine;
use lapor_domain::reports::ReportService;
use lapor_domain::rooms::RoomService;
use lapor_domain::store::InMemoryStore;
use lapor_infra::config::AppConfig;
use lapor_infra::db::{DbConfig, SurrealStore};
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub engine: RealtimeEngine,
    pub rooms: RoomService,
    pub reports: ReportService,
}

impl AppState {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        if config.uses_surreal() {
            let store = Arc::new(SurrealStore::connect(&DbConfig::from_app_config(&config)).await?);
            return Ok(Self::with_store(config, store.clone(), store));
        }
        tracing::warn!(
            data_backend = %config.data_backend,
            "using in-memory store; data is lost on restart"
        );
        let store = Arc::new(InMemoryStore::new());
        Ok(Self::with_store(config, store.clone(), store))
    }

    pub fn with_store(
        config: AppConfig,
        store: Arc<dyn TransactionalStore>,
        directory: Arc<dyn RoomDirectory>,
    ) -> Self {
        let engine = RealtimeEngine::new(store, directory, config.realtime_config());
        Self {
            rooms: RoomService::new(engine.pipeline.clone()),
            reports: ReportService::new(engine.pipeline.clone()),
            engine,
            config,
        }
    }

    /// Starts the liveness sweeper. The handle is aborted on shutdown.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        self.engine
            .broadcaster
            .registry()
            .spawn_sweeper(self.engine.config.sweep_interval)
    }
}
