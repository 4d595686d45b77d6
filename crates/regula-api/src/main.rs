//! regula-api - HTTP API server for the regula compliance scheduler

use std::sync::Arc;

use axum::http::HeaderValue;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use regula_api::{ApiConfig, AppState, InstanceMode, StatusSnapshot, StoreBackend, StreamFanout};
use regula_core::{CheckRepository, DictionaryRepository, EventBus, QuotaRepository};
use regula_db::{listen_for_check_updates, Database, MemoryStore};
use regula_inference::{HttpScanBackend, OpenAIBackend};
use regula_jobs::{
    ComplianceScanWorker, EmbeddingJobQueue, EmbeddingQueueBackend, EmbeddingQueueConfig,
    HttpManagedQueue, ManagedQueueConfig, ScanQueue, ScanQueueConfig,
};

const ORPHANED_MESSAGE: &str = "Interrupted by server restart";

/// Store handles chosen by `STORE_BACKEND`.
struct Stores {
    checks: Arc<dyn CheckRepository>,
    quotas: Arc<dyn QuotaRepository>,
    dictionary: Arc<dyn DictionaryRepository>,
    /// Present for PostgreSQL; drives the `LISTEN` bridge.
    database: Option<Database>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let _file_guard = init_tracing();

    let config = ApiConfig::from_env()?;
    info!(
        subsystem = "api",
        store = ?config.store,
        durability = ?config.durability,
        instance_mode = ?config.instance_mode,
        "Configuration loaded"
    );
    if config.instance_mode == InstanceMode::Shared {
        warn!(
            subsystem = "api",
            "Shared scheduler mode: orphan recovery disabled, queue metrics are per instance"
        );
    }

    let events = Arc::new(EventBus::new(config.event_bus_capacity));
    let background = CancellationToken::new();

    let stores = match config.store {
        StoreBackend::Postgres => {
            info!("Connecting to database...");
            let db = Database::connect(&config.database_url).await?;
            info!("Running database migrations...");
            db.migrate().await?;
            info!("Database ready");
            Stores {
                checks: Arc::new(db.checks.clone()),
                quotas: Arc::new(db.quotas.clone()),
                dictionary: Arc::new(db.dictionary.clone()),
                database: Some(db),
            }
        }
        StoreBackend::Memory => {
            warn!(
                subsystem = "api",
                "Using in-memory store; records are lost on restart"
            );
            let store = MemoryStore::new();
            Stores {
                checks: Arc::new(store.clone()),
                quotas: Arc::new(store.clone()),
                dictionary: Arc::new(store),
                database: None,
            }
        }
    };

    if config.should_recover_orphans() {
        let recovered = stores.checks.fail_unfinished(ORPHANED_MESSAGE).await?;
        if recovered > 0 {
            warn!(
                subsystem = "api",
                recovered, "Failed checks orphaned by a previous process"
            );
        }
    }

    // PostgreSQL publishes transitions through its trigger; the memory store
    // has no such source, so the worker and handlers emit directly.
    let emit_events = stores.database.is_none();
    let listener_handle = stores.database.as_ref().map(|db| {
        tokio::spawn(listen_for_check_updates(
            db.pool.clone(),
            events.clone(),
            background.child_token(),
        ))
    });

    // Scan queue
    let scanner = Arc::new(HttpScanBackend::from_env()?);
    let mut worker = ComplianceScanWorker::new(stores.checks.clone(), scanner);
    if emit_events {
        worker = worker.with_events(events.clone());
    }
    let scan_queue = ScanQueue::start(ScanQueueConfig::from_env(), Arc::new(worker));

    // Embedding queue
    let embedder = Arc::new(OpenAIBackend::from_env()?);
    let embedding_config = EmbeddingQueueConfig::from_env()?;
    let embeddings = match embedding_config.backend {
        EmbeddingQueueBackend::Memory => {
            EmbeddingJobQueue::new(embedding_config, stores.dictionary.clone(), embedder)
        }
        EmbeddingQueueBackend::Managed => {
            let managed = HttpManagedQueue::new(ManagedQueueConfig::from_env()?)?;
            EmbeddingJobQueue::with_managed_queue(
                embedding_config,
                stores.dictionary.clone(),
                embedder,
                Arc::new(managed),
            )
        }
    };

    let snapshot = StatusSnapshot::new(
        scan_queue.clone(),
        stores.checks.clone(),
        stores.quotas.clone(),
    );
    let fanout = StreamFanout::new(snapshot, events.clone(), config.stream.clone());

    let state = AppState {
        checks: stores.checks.clone(),
        quotas: stores.quotas.clone(),
        scan_queue: scan_queue.clone(),
        embeddings: embeddings.clone(),
        fanout: fanout.clone(),
        events: events.clone(),
        emit_events,
    };

    let app = regula_api::router(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(cors_layer(&config.cors_origins)),
    );

    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(subsystem = "api", address = %addr, "Listening");

    let stream_fanout = fanout.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Open streams would otherwise hold the server open.
            stream_fanout.shutdown();
        })
        .await?;

    info!(subsystem = "api", "Draining queues...");
    scan_queue.shutdown().await;
    embeddings.shutdown().await;
    background.cancel();
    if let Some(handle) = listener_handle {
        if let Ok(Err(e)) = handle.await {
            warn!(subsystem = "db", error = %e, "Check update listener exited with error");
        }
    }
    info!(subsystem = "api", "Shutdown complete");
    Ok(())
}

/// Initialize tracing with configurable output.
///
/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   LOG_FILE    - path to log file (optional, enables file logging)
///   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
///   RUST_LOG    - standard env filter
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "regula_api=debug,regula_jobs=debug,tower_http=debug".into());

    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("regula-api.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );
    guard
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("Invalid CORS origin '{}': {}", origin, e);
                None
            }
        })
        .collect();
    CorsLayer::new().allow_origin(AllowOrigin::list(allowed))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!(subsystem = "api", "Shutdown signal received");
}
