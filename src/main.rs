//! FSM broker - conversational bot backend
//!
//! Drives one persisted finite state machine per conversation. Inbound
//! platform messages advance the machine; states may stream answers from a
//! compute worker back to the platform through the RPC bridge.

mod api;
mod config;
mod context;
mod db;
mod fsm;
mod mml;
mod rpc;
mod runtime;
mod worker;

use api::{create_router, AppState};
use config::Config;
use context::ContextSettings;
use db::Database;
use fsm::{register_builtins, FsmDefinition, HandlerRegistry};
use mml::TextSerializer;
use rpc::{RpcBridge, WorkerDirectory};
use runtime::{DatabaseStorage, RuntimeManager};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use worker::{ModelRegistry, Worker};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fsm_broker=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = Config::from_env();

    // Ensure database directory exists
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %config.db_path.display(), "Opening database");
    let db = Database::open(&config.db_path)?;

    let mut registry = HandlerRegistry::new();
    register_builtins(&mut registry);

    if let Some(dir) = &config.fsm_dir {
        let loaded = load_definitions(&db, dir, &registry)?;
        tracing::info!(dir = %dir.display(), count = loaded, "Loaded FSM definitions");
    }

    // Compute worker
    let models = Arc::new(ModelRegistry::new(&config.retrieval));
    if models.has_models() {
        tracing::info!(
            models = ?models.available_models(),
            default = ?config.default_model,
            "Model registry initialized"
        );
    } else {
        tracing::warn!("No retrieval models configured. Set RETRIEVAL_URL and RETRIEVAL_MODELS.");
    }

    let bridge = Arc::new(RpcBridge::new());
    let (worker_tx, worker_rx) = mpsc::channel(64);
    let mut directory = WorkerDirectory::new();
    directory.register("llm", worker_tx);

    let shutdown = CancellationToken::new();
    tokio::spawn(Worker::new(Arc::clone(&models), Arc::clone(&bridge)).run(worker_rx, shutdown.clone()));

    let mut runtime = RuntimeManager::new(
        DatabaseStorage::new(db),
        Arc::new(registry),
        bridge,
        directory,
        ContextSettings {
            default_model: config.default_model.clone(),
        },
    );
    // Plain `{"text": ...}` platforms, one outbound payload per stack
    runtime.register_serializer(Arc::new(TextSerializer::new("text")));
    let state = AppState::new(runtime, models);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("FSM broker listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    shutdown.cancel();
    Ok(())
}

/// Upsert every `*.json` definition in `dir` by name. Each one must compile
/// against `registry`; a broken definition stops startup.
fn load_definitions(
    db: &Database,
    dir: &Path,
    registry: &HandlerRegistry,
) -> Result<usize, Box<dyn std::error::Error>> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    for path in &paths {
        let def: FsmDefinition = serde_json::from_str(&std::fs::read_to_string(path)?)
            .map_err(|e| format!("{}: {e}", path.display()))?;
        def.compile(registry)
            .map_err(|e| format!("{}: {e}", path.display()))?;
        let stored = db.upsert_fsm_definition(&def)?;
        tracing::debug!(fsm = %stored.name, id = ?stored.id, "Upserted FSM definition");
    }
    Ok(paths.len())
}
