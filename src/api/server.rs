//! Server assembly and graceful serve loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::info;

use crate::api::middleware::{log_requests, require_api_key};
use crate::api::routes::{health, transcriptions};
use crate::jobs::{JobProcessor, JobStore, Queue};
use crate::storage::Uploader;
use crate::{Error, Result};

/// Allowance for multipart framing on top of the configured upload ceiling,
/// so a file of exactly `maxUploadSize` bytes is accepted.
const MULTIPART_ENVELOPE_ALLOWANCE: usize = 64 * 1024;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<Queue>,
    pub uploader: Arc<Uploader>,
    pub processor: Arc<dyn JobProcessor>,
    /// The sole configured target name; jobs are bound to it at creation.
    pub target_name: String,
    /// Blank disables the API key gate.
    pub api_key: String,
    pub max_upload_size: u64,
}

/// Build the application router with middleware applied in order: panic
/// recovery, request logging, API key gate, body size limit, request
/// deadline (`server.writeTimeout`).
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    let body_limit = state
        .max_upload_size
        .try_into()
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_ENVELOPE_ALLOWANCE);

    Router::new()
        .route("/healthz", get(health::healthz))
        .route(
            transcriptions::TRANSCRIPTIONS_PATH,
            post(transcriptions::create_transcription),
        )
        .route(
            &format!("{}/{{id}}", transcriptions::TRANSCRIPTIONS_PATH),
            get(transcriptions::get_transcription),
        )
        .layer(TimeoutLayer::new(request_timeout))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .layer(middleware::from_fn(log_requests))
        .layer(CatchPanicLayer::custom(handle_panic))
        .with_state(state)
}

fn handle_panic(_err: Box<dyn std::any::Any + Send + 'static>) -> axum::response::Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
}

/// Bind and serve until `shutdown` fires, then drain in-flight requests.
pub async fn serve(
    address: &str,
    router: Router,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(address)
        .await
        .map_err(|e| Error::Other(format!("bind {address}: {e}")))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| Error::Other(format!("local addr: {e}")))?;
    info!(%local_addr, "http server listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.cancelled().await;
        info!("http server shutting down");
    })
    .await
    .map_err(|e| Error::Other(format!("server error: {e}")))?;
    Ok(())
}
