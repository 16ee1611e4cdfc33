pub mod backend;
pub mod bot;
pub mod config;
pub mod detection;
pub mod errors;
pub mod pipeline;
pub mod storage;

use std::sync::Arc;

use crate::backend::client::HttpDetectionBackend;
use crate::backend::model::CommandModelRunner;
use crate::backend::server::PredictState;
use crate::bot::handler::ConversationHandler;
use crate::bot::telegram::TelegramTransport;
use crate::config::{AppConfig, StoreBackend};
use crate::errors::{DetectBotError, DetectBotResult};
use crate::pipeline::invoker::{DetectionInvoker, InvokerTimeouts};
use crate::storage::object_store::{FsObjectStore, HttpObjectStore, ObjectStore};
use crate::storage::result_store::JsonlResultStore;
use crate::storage::staging::StagingStore;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

fn load() -> DetectBotResult<AppConfig> {
    // Load .env file if present (ignore error if not found)
    let _ = dotenvy::dotenv();
    config::load_config()
}

fn build_object_store(backend: &StoreBackend) -> Arc<dyn ObjectStore> {
    match backend {
        StoreBackend::Fs { root } => Arc::new(FsObjectStore::new(root.clone())),
        StoreBackend::Http { endpoint, token } => {
            Arc::new(HttpObjectStore::new(endpoint.clone(), token.clone()))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

/// Runs the chat bot until ctrl-c.
pub async fn run_bot() -> DetectBotResult<()> {
    init_tracing();
    let cfg = load()?;
    cfg.validate_bot()?;

    // Collaborators are built once here and shared by every request.
    let store = build_object_store(&cfg.storage.store);
    let staging = Arc::new(StagingStore::new(
        store,
        cfg.storage.bucket.clone(),
        cfg.timeouts.stage(),
    ));
    let results_path = cfg.results.resolved_path();
    let results = Arc::new(JsonlResultStore::new(results_path.clone()));
    let backend = Arc::new(HttpDetectionBackend::new(cfg.backend.url.clone()));
    let invoker = Arc::new(DetectionInvoker::new(
        staging,
        backend,
        results,
        InvokerTimeouts {
            backend: cfg.timeouts.backend(),
            persist: cfg.timeouts.persist(),
        },
    ));

    let telegram = Arc::new(TelegramTransport::new(
        cfg.telegram.api_base.clone(),
        cfg.telegram.token.clone(),
        cfg.telegram.poll_timeout_secs,
    ));
    let me = telegram.get_me().await?;
    tracing::info!(
        username = %me["username"].as_str().unwrap_or("?"),
        backend = %cfg.backend.url,
        results = %results_path.display(),
        "telegram bot ready"
    );

    let handler = Arc::new(ConversationHandler::new(
        telegram.clone(),
        invoker,
        cfg.timeouts.fetch(),
    ));
    bot::runner::run(telegram, handler, shutdown_signal()).await;
    Ok(())
}

/// Serves `POST /predict` until ctrl-c.
pub async fn run_predict_server() -> DetectBotResult<()> {
    init_tracing();
    let cfg = load()?;
    cfg.validate_server()?;

    let state = PredictState {
        staging: Arc::new(StagingStore::new(
            build_object_store(&cfg.storage.store),
            cfg.storage.bucket.clone(),
            cfg.timeouts.stage(),
        )),
        runner: Arc::new(CommandModelRunner::new(
            cfg.server.command.clone(),
            cfg.server.args.clone(),
        )),
        work_dir: cfg.server.work_dir.clone(),
        class_names: Arc::new(cfg.server.class_names.clone()),
        model_timeout: std::time::Duration::from_secs(cfg.server.model_timeout_secs),
    };
    if state.class_names.is_empty() {
        tracing::warn!("server.class_names is empty; labels will be reported as class_<n>");
    }

    let listener = tokio::net::TcpListener::bind(&cfg.server.bind)
        .await
        .map_err(|e| DetectBotError::Config(format!("cannot bind {}: {e}", cfg.server.bind)))?;
    tracing::info!(bind = %cfg.server.bind, bucket = %cfg.storage.bucket, "predict server listening");

    axum::serve(listener, backend::server::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("predict server stopped");
    Ok(())
}
