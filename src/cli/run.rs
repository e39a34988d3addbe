use crate::api::{run_server, AppState};
use crate::config::parse::load_config;
use crate::config::Config;
use crate::datasource::DataSourceCatalog;
use crate::import::{ImportCoordinator, ImportError};
use crate::promimport::{ImporterError, PrometheusImporter};
use crate::query::{QueryError, QueryRegistry};
use crate::report::{ReportEngine, ReportError, ReportScheduler, ScheduleError};
use crate::storage::{DuckDbStore, MetricStore, StoreError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] crate::config::parse::ConfigError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("import error: {0}")]
    Import(#[from] ImportError),

    #[error("report query error: {0}")]
    Query(#[from] QueryError),

    #[error("report error: {0}")]
    Report(#[from] ReportError),

    #[error("scheduled report error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("prometheus importer error: {0}")]
    Importer(#[from] ImporterError),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("web server error: {0}")]
    WebServer(String),
}

/// Everything the service runs, wired together and restored from storage.
pub struct Services {
    pub state: Arc<AppState>,
    pub prometheus: Option<Arc<PrometheusImporter>>,
}

pub async fn run(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = match config_path {
        Some(path) => path,
        None => {
            eprintln!("Error: config not found");
            eprintln!("Searched locations:");
            for path in crate::config::DEFAULT_CONFIG_PATHS {
                eprintln!("  {}", path);
            }
            eprintln!("\nUse --config <path> to specify a config file, or run 'metering config init' to generate one.");
            std::process::exit(1);
        }
    };

    run_service(&config_path).await.map_err(|e| e.into())
}

async fn run_service(config_path: &Path) -> Result<(), RunError> {
    info!(config_path = %config_path.display(), "Loading configuration");
    let config = load_config(config_path)?;

    info!(path = %config.storage.path.display(), "Opening storage");
    let store: Arc<dyn MetricStore> = Arc::new(DuckDbStore::open(&config.storage.path)?);

    let services = build_services(&config, store).await?;
    let state = services.state.clone();
    let shutdown = CancellationToken::new();

    let scheduler_handle = {
        let scheduler = state.scheduler.clone();
        let interval = config.reports.schedule_check_interval;
        let cancel = shutdown.clone();
        tokio::spawn(async move { scheduler.run(interval, cancel).await })
    };

    let importer_handle = services.prometheus.map(|importer| {
        let cancel = shutdown.clone();
        tokio::spawn(async move { importer.run(cancel).await })
    });

    let server_handle = {
        let state = state.clone();
        let listen = config.web.listen.clone();
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            run_server(state, &listen, cancel)
                .await
                .map_err(|e| e.to_string())
        })
    };

    info!("Metering service started, press Ctrl+C to stop");

    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Received shutdown signal");

    shutdown.cancel();
    state.engine.shutdown();

    scheduler_handle.await?;
    if let Some(handle) = importer_handle {
        handle.await?;
    }
    if let Err(e) = server_handle.await? {
        error!(error = %e, "Web server failed");
        return Err(RunError::WebServer(e));
    }

    info!("Metering service stopped");
    Ok(())
}

/// Build the service over `store`: restore persisted state, then apply the
/// definitions from `config` on top of it.
pub async fn build_services(config: &Config, store: Arc<dyn MetricStore>) -> Result<Services, RunError> {
    store.init_schema().await?;

    let catalog = Arc::new(DataSourceCatalog::new());
    let coordinator = Arc::new(ImportCoordinator::new(
        store.clone(),
        catalog.clone(),
        config.import.clone(),
    ));
    coordinator.load().await?;
    for definition in &config.datasources {
        coordinator.register(definition.clone()).await?;
    }

    let queries = Arc::new(QueryRegistry::new());
    let restored = queries.load(store.as_ref()).await?;
    for query in &config.queries {
        queries.save(store.as_ref(), query.clone()).await?;
    }
    info!(
        restored,
        configured = config.queries.len(),
        total = queries.list().len(),
        "Loaded report queries"
    );

    let engine = ReportEngine::new(
        store.clone(),
        queries.clone(),
        catalog.clone(),
        config.reports.clone(),
    );
    engine.recover().await?;

    let scheduler = Arc::new(ReportScheduler::new(
        engine.clone(),
        queries.clone(),
        store.clone(),
    ));
    scheduler.load().await?;
    for spec in &config.scheduled_reports {
        scheduler.create(spec.clone(), true).await?;
    }

    let prometheus = match &config.prometheus {
        Some(prometheus) => Some(Arc::new(PrometheusImporter::new(
            prometheus.clone(),
            coordinator.clone(),
        )?)),
        None => None,
    };

    let state = Arc::new(AppState::new(store, coordinator, queries, engine, scheduler));
    Ok(Services { state, prometheus })
}
