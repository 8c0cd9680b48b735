use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;

use crate::engine::lifecycle::DispatchSnapshot;
use crate::error::AppError;
use crate::models::ride::RideOffer;
use crate::session::DispatchSession;

pub fn router() -> Router<Arc<DispatchSession>> {
    Router::new()
        .route("/offers", get(list_offers))
        .route("/offers/:ride_id", get(get_offer))
        .route("/offers/:ride_id/request", post(request_ride))
        .route("/offers/:ride_id/cancel", post(cancel_ride))
        .route("/offers/:ride_id/dismiss", post(dismiss_offer))
}

async fn list_offers(State(session): State<Arc<DispatchSession>>) -> Json<Vec<RideOffer>> {
    Json(session.offers())
}

async fn get_offer(
    State(session): State<Arc<DispatchSession>>,
    Path(ride_id): Path<String>,
) -> Result<Json<RideOffer>, AppError> {
    session
        .offer(&ride_id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("ride {ride_id} not found")))
}

async fn request_ride(
    State(session): State<Arc<DispatchSession>>,
    Path(ride_id): Path<String>,
) -> Result<Json<DispatchSnapshot>, AppError> {
    session.request_ride(&ride_id).await?;
    Ok(Json(session.snapshot()))
}

async fn cancel_ride(
    State(session): State<Arc<DispatchSession>>,
    Path(ride_id): Path<String>,
) -> Result<Json<DispatchSnapshot>, AppError> {
    session.cancel(&ride_id).await?;
    Ok(Json(session.snapshot()))
}

async fn dismiss_offer(
    State(session): State<Arc<DispatchSession>>,
    Path(ride_id): Path<String>,
) -> Result<Json<DispatchSnapshot>, AppError> {
    session.dismiss(&ride_id).await?;
    Ok(Json(session.snapshot()))
}
