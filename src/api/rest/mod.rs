pub mod driver;
pub mod offers;
pub mod ws;

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use axum::Router;
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::connection::ConnectionState;
use crate::session::DispatchSession;

pub fn router(session: Arc<DispatchSession>) -> Router {
    Router::new()
        .merge(offers::router())
        .merge(driver::router())
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/events", get(ws::ws_handler))
        .with_state(session)
        .layer(CorsLayer::permissive())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    driver_id: String,
    connection: ConnectionState,
    offers: usize,
    active_ride: bool,
}

async fn health(State(session): State<Arc<DispatchSession>>) -> Json<HealthResponse> {
    let snapshot = session.snapshot();
    Json(HealthResponse {
        status: "ok",
        driver_id: session.driver_id().to_string(),
        connection: session.connection_state(),
        offers: snapshot.offers.len(),
        active_ride: snapshot.active_ride.is_some(),
    })
}

async fn metrics(State(session): State<Arc<DispatchSession>>) -> impl IntoResponse {
    match session.metrics().encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err).into_response(),
    }
}
