use std::future::IntoFuture as _;

use gardener_deployers::{
    config::DeployerConfig,
    deployer::{Deployer, State},
    telemetry,
};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init().await;

    let config = DeployerConfig::load()?;
    let client = kube::Client::try_default().await?;

    // Initialize deployer state
    let state = State::default();
    let listen_addr = config.listen_addr.clone();
    let deployer = Deployer::new(client, config, state.clone()).await?;

    // Start web server
    let listener = TcpListener::bind(&listen_addr).await?;
    let router = handlers::router();
    let server = axum::serve(listener, router.with_state(state));
    info!(%listen_addr, "Serving metrics and diagnostics");

    // The deployer finishes after a destroy run or on ctrl-c, the server must not finish on its own
    tokio::select! {
        d = deployer.run() => Ok(d?),
        s = server.into_future() => {
            anyhow::bail!("server exited early: {s:?}")
        }
    }
}

/// Handlers for the web server portion of the deployer
mod handlers {
    use axum::{extract::State, http::StatusCode, response::IntoResponse, routing, Json, Router};
    use prometheus::{Encoder, TextEncoder};

    use gardener_deployers::deployer::State as DeployerState;

    /// Construct the router for all the handlers
    pub fn router() -> Router<DeployerState> {
        Router::new()
            .route("/metrics", routing::get(metrics))
            .route("/health", routing::get(health))
            .route("/observability", routing::get(observability))
            .route("/", routing::get(index))
    }

    /// Handler for exposing prometheus metrics
    async fn metrics(State(state): State<DeployerState>) -> impl IntoResponse {
        let metrics = state.metrics();
        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        match encoder.encode(&metrics, &mut buffer) {
            Ok(()) => (StatusCode::OK, buffer),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string().into_bytes()),
        }
    }

    /// Handler for checking the health of the server
    async fn health() -> impl IntoResponse {
        (StatusCode::OK, Json("healthy"))
    }

    /// Scrape configs, alerting rules and logging configuration of the deployed components
    async fn observability(State(state): State<DeployerState>) -> impl IntoResponse {
        (StatusCode::OK, Json(state.observability().await))
    }

    /// Handler for inspecting the last deployer run
    async fn index(State(state): State<DeployerState>) -> impl IntoResponse {
        let diagnostics = state.diagnostics().await;

        (StatusCode::OK, Json(diagnostics))
    }
}
