use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::driver::Coordinate;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub address: String,
    pub coordinates: Coordinate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RideOfferStatus {
    Offered,
    RequestSent,
    AcceptedByRider,
    RejectedByRider,
    Expired,
    Cancelled,
}

impl RideOfferStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RideOfferStatus::Offered | RideOfferStatus::RequestSent)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideOffer {
    pub ride_id: String,
    pub rider_id: String,
    pub pickup: Waypoint,
    pub dropoff: Waypoint,
    pub distance_miles: f64,
    pub eta_minutes: u32,
    pub fare_estimate: f64,
    pub received_at: DateTime<Utc>,
    pub status: RideOfferStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RidePhase {
    EnRoute,
    InProgress,
}

/// The ride the driver committed to after the rider accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveRide {
    pub ride_id: String,
    pub rider_id: String,
    pub pickup: Waypoint,
    pub dropoff: Waypoint,
    pub fare_estimate: f64,
    pub phase: RidePhase,
    pub rider_location: Option<Coordinate>,
    pub accepted_at: DateTime<Utc>,
}
