//! CamWatch Monitor
//!
//! Main entry point for the monitoring service.

use camwatch_monitor::{
    state::{AppConfig, AppState},
    web_api,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "camwatch_monitor=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting CamWatch Monitor v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::default();
    tracing::info!(
        backend_url = %config.backend_url,
        camera_slot = %config.camera_slot,
        camera_snapshot_url = %config.camera_snapshot_url,
        sample_period_ms = config.sample_period_ms,
        save_cooldown_ms = config.save_cooldown_ms,
        alert_history = config.alert_history,
        backoff = ?config.failure_backoff,
        "Configuration loaded"
    );

    let state = AppState::from_config(config)?;

    if state.ai_client.health_check().await {
        tracing::info!("Inference backend reachable");
    } else {
        tracing::warn!(url = %state.ai_client.base_url(), "Inference backend not reachable yet");
    }

    if state.config.auto_start {
        if let Err(e) = state.session.start().await {
            tracing::error!(error = %e, "Auto start failed, waiting for manual start");
        }
    }

    let app = web_api::create_router(state.clone())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    let session = state.session.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Shutdown requested, releasing camera");
                    session.stop().await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to listen for shutdown signal");
                    std::future::pending::<()>().await;
                }
            }
        })
        .await?;

    Ok(())
}
