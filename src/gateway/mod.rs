//! Axum-based HTTP gateway with body limits, timeouts, and the media stream
//! WebSocket.
//!
//! Routes:
//! - `POST /voice`: telephony webhook, answers with TwiML that opens a
//!   bidirectional media stream back to `/ws`
//! - `GET /ws`: media stream upgrade; one relayed call per connection
//! - `GET /health`: liveness plus the live calls

pub mod media_stream;
pub mod twiml;

use crate::config::Config;
use crate::relay::{CallRegistry, CallSettings, ConversationConnector, RealtimeConnector};
use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub settings: Arc<CallSettings>,
    pub connector: Arc<dyn ConversationConnector>,
    pub registry: Arc<CallRegistry>,
}

impl AppState {
    pub fn new(config: Config, connector: Arc<dyn ConversationConnector>) -> Self {
        let settings = CallSettings::from_config(&config);
        let registry = CallRegistry::new(config.gateway.max_concurrent_calls);
        Self {
            config: Arc::new(config),
            settings: Arc::new(settings),
            connector,
            registry,
        }
    }
}

/// Build the router with middleware applied.
pub fn build_router(state: AppState) -> Router {
    let max_body = state.config.gateway.max_body_bytes;
    let timeout = Duration::from_secs(state.config.gateway.request_timeout_secs);

    Router::new()
        .route("/health", get(handle_health))
        .route("/voice", post(handle_voice))
        .route("/ws", get(media_stream::handle_media_stream))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(max_body))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            timeout,
        ))
}

/// Run the gateway until Ctrl-C.
pub async fn run_gateway(config: Config) -> Result<()> {
    let host = config.gateway.host.clone();
    let port = config.gateway.port;

    let listener = tokio::net::TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("Failed to bind gateway to {host}:{port}"))?;
    let actual_port = listener.local_addr()?.port();

    let connector: Arc<dyn ConversationConnector> =
        Arc::new(RealtimeConnector::new(config.realtime.clone()));
    let state = AppState::new(config, connector);

    tracing::info!(
        host = %host,
        port = actual_port,
        protocol = state.config.realtime.protocol.as_str(),
        duplex = ?state.settings.duplex,
        max_calls = state.registry.max_calls(),
        "Call relay gateway listening"
    );
    if state.config.gateway.public_base_url.is_none() {
        tracing::warn!("BASE_URL is not set; /voice will derive the stream host from the Host header");
    }

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

// ══════════════════════════════════════════════════════════════════════════════
// AXUM HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

/// GET /health
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    let calls = state.registry.list();
    Json(serde_json::json!({
        "ok": true,
        "active_calls": calls.len(),
        "calls": calls,
    }))
}

/// POST /voice: an inbound call arrived. Twilio posts form data we do not
/// need; the answer only depends on where the stream should connect.
async fn handle_voice(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let host_header = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok());

    let Some(stream_url) =
        twiml::stream_url(state.config.gateway.public_base_url.as_deref(), host_header)
    else {
        tracing::warn!("Cannot build media stream URL: no BASE_URL and no Host header");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Media stream host is not configured",
        )
            .into_response();
    };

    tracing::info!(stream_url = %stream_url, "Answering inbound call");
    let body = twiml::connect_stream(&stream_url, &state.config.gateway.connect_message);
    ([(header::CONTENT_TYPE, "application/xml")], body).into_response()
}
