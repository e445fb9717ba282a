//! Axum HTTP endpoint
//!
//! `GET /addresses?count=N&format=html|json` runs one full pipeline per
//! request on a blocking worker thread. Each request opens its own chain
//! connection; only the wallet keys are shared.

use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use glacier_chain::{ChainError, ChainSource};
use glacier_core::WalletKeys;
use glacier_lock::{Glacier, GlacierReport, LockParams};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;

/// Opens a fresh chain connection for one request.
pub type Connector = Arc<dyn Fn() -> Result<Box<dyn ChainSource>, ChainError> + Send + Sync>;

/// Application state shared across handlers
pub struct AppState {
    pub keys: Arc<WalletKeys>,
    pub params: LockParams,
    /// Count used when a request gives none, or zero
    pub scan_count: u32,
    /// Larger counts are rejected
    pub max_scan_count: u32,
    pub broadcast: bool,
    pub connect: Connector,
}

#[derive(Debug, Deserialize)]
pub struct AddressesQuery {
    pub count: Option<u32>,
    pub format: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Html,
    Json,
}

/// Run one pipeline and, when enabled, broadcast its transactions.
pub fn run_request(state: &AppState, count: u32) -> Result<GlacierReport> {
    let chain = (state.connect)()?;
    let glacier = Glacier::new(&state.keys, state.params);
    let mut report = glacier.run(chain.as_ref(), count)?;

    if state.broadcast && !report.signed.is_empty() {
        glacier.broadcast(chain.as_ref(), &mut report)?;
    }
    Ok(report)
}

/// Create the router with all endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/addresses", get(addresses_handler))
        .with_state(state)
}

/// Serve until Ctrl-C.
pub async fn serve(state: Arc<AppState>, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("Listening on http://{}", addr);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            log::info!("Received shutdown signal. Exiting…");
        })
        .await?;
    Ok(())
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn addresses_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AddressesQuery>,
) -> Response {
    let format = match query.format.as_deref() {
        None | Some("html") => Format::Html,
        Some("json") => Format::Json,
        Some(other) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("unknown format '{}'", other),
            )
        }
    };
    let count = match query.count {
        None | Some(0) => state.scan_count,
        Some(n) if n > state.max_scan_count => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("count {} exceeds maximum {}", n, state.max_scan_count),
            )
        }
        Some(n) => n,
    };

    let worker = state.clone();
    let outcome = tokio::task::spawn_blocking(move || run_request(&worker, count)).await;

    let report = match outcome {
        Ok(Ok(report)) => report,
        Ok(Err(e)) => {
            log::error!("Request failed: {:#}", e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e));
        }
        Err(e) => {
            log::error!("Request worker failed: {}", e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };

    match format {
        Format::Json => Json(report).into_response(),
        Format::Html => match serde_json::to_string_pretty(&report) {
            Ok(text) => Html(format!("<html><pre>{}</pre></html>", escape_html(&text))).into_response(),
            Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
