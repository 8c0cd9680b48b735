use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};

use crate::engine::lifecycle::DispatchSnapshot;
use crate::error::AppError;
use crate::models::driver::Coordinate;
use crate::models::ride::ActiveRide;
use crate::session::DispatchSession;

pub fn router() -> Router<Arc<DispatchSession>> {
    Router::new()
        .route("/online", post(go_online))
        .route("/offline", post(go_offline))
        .route("/location", post(update_location))
        .route("/ride", get(active_ride))
        .route("/ride/start", post(start_ride))
        .route("/ride/complete", post(complete_ride))
}

#[derive(Deserialize)]
pub struct GoOnlineRequest {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(default = "available")]
    pub is_available: bool,
}

#[derive(Deserialize)]
pub struct UpdateLocationRequest {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default = "available")]
    pub is_available: bool,
}

#[derive(Serialize)]
struct GoOnlineResponse {
    initiated: bool,
}

fn available() -> bool {
    true
}

async fn go_online(
    State(session): State<Arc<DispatchSession>>,
    Json(payload): Json<GoOnlineRequest>,
) -> Result<(StatusCode, Json<GoOnlineResponse>), AppError> {
    let position = match (payload.latitude, payload.longitude) {
        (Some(latitude), Some(longitude)) => Some(valid_position(latitude, longitude)?),
        (None, None) => None,
        _ => {
            return Err(AppError::BadRequest(
                "latitude and longitude must be given together".to_string(),
            ));
        }
    };

    let initiated = session.go_online(position, payload.is_available);
    if !initiated {
        return Err(AppError::Internal("failed to start dispatch connection".to_string()));
    }
    Ok((StatusCode::ACCEPTED, Json(GoOnlineResponse { initiated })))
}

async fn go_offline(State(session): State<Arc<DispatchSession>>) -> StatusCode {
    session.go_offline();
    StatusCode::NO_CONTENT
}

async fn update_location(
    State(session): State<Arc<DispatchSession>>,
    Json(payload): Json<UpdateLocationRequest>,
) -> Result<Json<DispatchSnapshot>, AppError> {
    let position = valid_position(payload.latitude, payload.longitude)?;
    session.update_location(position, payload.is_available).await?;
    Ok(Json(session.snapshot()))
}

async fn active_ride(State(session): State<Arc<DispatchSession>>) -> Result<Json<ActiveRide>, AppError> {
    session
        .snapshot()
        .active_ride
        .map(Json)
        .ok_or_else(|| AppError::NotFound("no active ride".to_string()))
}

async fn start_ride(
    State(session): State<Arc<DispatchSession>>,
) -> Result<Json<DispatchSnapshot>, AppError> {
    session.start_ride().await?;
    Ok(Json(session.snapshot()))
}

async fn complete_ride(
    State(session): State<Arc<DispatchSession>>,
) -> Result<Json<DispatchSnapshot>, AppError> {
    session.complete_ride().await?;
    Ok(Json(session.snapshot()))
}

fn valid_position(latitude: f64, longitude: f64) -> Result<Coordinate, AppError> {
    let position = Coordinate::new(latitude, longitude);
    if !position.is_valid() {
        return Err(AppError::BadRequest(format!(
            "invalid position {latitude}, {longitude}"
        )));
    }
    Ok(position)
}
