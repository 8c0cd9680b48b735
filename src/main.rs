use std::sync::Arc;

use ride_dispatch_client::api;
use ride_dispatch_client::config::Config;
use ride_dispatch_client::error::AppError;
use ride_dispatch_client::session::{DispatchSession, SessionConfig};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false)
        .compact()
        .init();

    let session = Arc::new(DispatchSession::start(SessionConfig::from(&config))?);

    let mut events = BroadcastStream::new(session.subscribe());
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => tracing::info!(event = event.label(), payload = %json, "lifecycle event"),
                    Err(err) => tracing::warn!(error = %err, "failed to serialize lifecycle event"),
                },
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "lifecycle event log lagging");
                }
            }
        }
    });

    if !session.go_online(config.initial_position, true) {
        return Err(AppError::Internal(
            "failed to start dispatch connection".to_string(),
        ));
    }

    let app = api::rest::router(session.clone());

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(
        http_port = config.http_port,
        driver_id = %config.driver_id,
        dispatch_url = %config.dispatch_url,
        "driver dispatch client started"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;

    session.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
