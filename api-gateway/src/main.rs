// api-gateway/src/main.rs

//! API gateway binary.
//!
//! This binary exposes the HTTP surface of the OMR evaluation ledger
//! on top of the `ledger` crate:
//!
//! - lifecycle commands (`/api/scan`, `/api/quality`, `/api/bubble`,
//!   `/api/score`, `/api/evaluation`, `/api/verify`, `/api/result`,
//!   `/api/recheck`, `/api/intervention`),
//! - exam setup (`/api/question-paper`, `/api/answer-key`),
//! - chain queries (`/api/blockchain/...`),
//! - audit log inspection (`/api/audit/...`),
//! - `GET /health` and a Prometheus exporter on `/metrics`.
//!
//! On startup the chain is replayed from SQLite (or started fresh
//! with a new genesis when the store is empty).

mod config;
mod error;
mod routes;
mod state;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tokio::signal;

use ledger::{
    FsObjectStore, HttpAiProvider, LedgerConfig, LifecycleMachine, MetricsRegistry,
    RetryingProvider, SqliteStore,
};

use config::ApiConfig;
use state::{AppState, SharedState};

#[tokio::main]
async fn main() {
    // Basic tracing setup.
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "api_gateway=info,ledger=info".to_string()),
        )
        .init();

    if let Err(e) = run().await {
        eprintln!("fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    // For now we use default configs. These can be externalised later.
    let api_cfg = ApiConfig::default();
    let ledger_cfg = LedgerConfig::default();

    // ---------------------------
    // Metrics
    // ---------------------------

    let metrics = Arc::new(
        MetricsRegistry::new().map_err(|e| format!("failed to initialise metrics registry: {e}"))?,
    );

    if ledger_cfg.metrics.enabled {
        let metrics_clone = metrics.clone();
        let addr = ledger_cfg.metrics.listen_addr;
        tokio::spawn(async move {
            if let Err(e) = run_metrics_exporter(metrics_clone, addr).await {
                tracing::error!("metrics exporter error: {e}");
            }
        });
        tracing::info!("metrics exporter listening on http://{}/metrics", addr);
    }

    // ---------------------------
    // Storage + providers + lifecycle machine
    // ---------------------------

    let store = Arc::new(
        SqliteStore::open(&ledger_cfg.database_path)
            .map_err(|e| format!("failed to open store at {}: {e}", ledger_cfg.database_path))?,
    );

    let object_store = Arc::new(
        FsObjectStore::new(&ledger_cfg.object_store_root)
            .map_err(|e| format!("failed to open object store: {e}"))?,
    );

    let ai_provider = HttpAiProvider::new(&ledger_cfg.ai_client)
        .map_err(|e| format!("failed to create AI provider client: {e}"))?;
    let ai = Arc::new(RetryingProvider::new(
        ai_provider,
        ledger_cfg.ai_client.retry.clone(),
    ));

    let machine = LifecycleMachine::bootstrap(
        ledger_cfg,
        store,
        object_store,
        ai,
        metrics.clone(),
    )
    .map_err(|e| format!("failed to bootstrap ledger: {e}"))?;

    tracing::info!(
        chain_length = machine.engine().len(),
        "ledger ready, chain validated"
    );

    // ---------------------------
    // Shared state
    // ---------------------------

    let app_state: SharedState = Arc::new(AppState { machine });

    // ---------------------------
    // HTTP router
    // ---------------------------

    let app = Router::new()
        .route("/health", get(routes::health::health))
        .route("/api/scan/create", post(routes::scan::create))
        .route("/api/scan/{sheet_id}", get(routes::scan::get))
        .route("/api/quality/assess", post(routes::quality::assess))
        .route("/api/quality/review", post(routes::quality::review))
        .route("/api/quality/reconstruct", post(routes::quality::reconstruct))
        .route("/api/bubble/create", post(routes::bubble::create))
        .route("/api/bubble/detect", post(routes::bubble::detect))
        .route("/api/score/create", post(routes::score::create))
        .route("/api/question-paper/upload", post(routes::keys::upload_paper))
        .route("/api/answer-key/verify", post(routes::keys::verify_key))
        .route("/api/answer-key/approve", post(routes::keys::approve_key))
        .route("/api/answer-key/{key_id}", get(routes::keys::get_key))
        .route("/api/evaluation/create", post(routes::evaluation::create))
        .route("/api/verify/create", post(routes::verify::create))
        .route("/api/verify/{sheet_id}", get(routes::verify::get))
        .route("/api/result/commit", post(routes::result::commit))
        .route("/api/result/{roll_number}", get(routes::result::lookup))
        .route("/api/recheck/create", post(routes::recheck::create))
        .route("/api/recheck/{sheet_id}", get(routes::recheck::list))
        .route("/api/intervention/pending", get(routes::intervention::pending))
        .route("/api/intervention/resolve", post(routes::intervention::resolve))
        .route("/api/blockchain/stats", get(routes::blockchain::stats))
        .route("/api/blockchain/validate", get(routes::blockchain::validate))
        .route("/api/blockchain/block/{index}", get(routes::blockchain::block))
        .route(
            "/api/blockchain/block/{index}/proof",
            get(routes::blockchain::proof),
        )
        .route("/api/blockchain/export", get(routes::blockchain::export))
        .route(
            "/api/blockchain/sheet/{sheet_id}",
            get(routes::blockchain::by_sheet),
        )
        .route("/api/audit/{sheet_id}", get(routes::audit::read))
        .route("/api/audit/{sheet_id}/verify", get(routes::audit::verify))
        .with_state(app_state);

    // ---------------------------
    // axum 0.8 server (hyper 1 / tokio 1.48 style)
    // ---------------------------

    tracing::info!("API gateway listening on http://{}", api_cfg.listen_addr);

    let listener = tokio::net::TcpListener::bind(api_cfg.listen_addr)
        .await
        .map_err(|e| format!("failed to bind {}: {e}", api_cfg.listen_addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("API server error: {e}"))?;

    Ok(())
}

/// Serves `GET /metrics` on its own port.
///
/// The ledger crate only owns the metric handles; exposition lives
/// here, as one more axum router next to the API itself.
async fn run_metrics_exporter(
    metrics: Arc<MetricsRegistry>,
    addr: std::net::SocketAddr,
) -> Result<(), String> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let metrics = metrics.clone();
            async move {
                (
                    [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
                    metrics.gather_text(),
                )
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("failed to bind metrics port {addr}: {e}"))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| format!("metrics server error: {e}"))
}

/// Waits for Ctrl-C and returns, used for graceful shutdown.
async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
