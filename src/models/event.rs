use serde::Serialize;

use crate::models::driver::Coordinate;
use crate::models::ride::{ActiveRide, RideOffer};

/// Lifecycle transitions published to whoever renders the driver's view.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    OfferPresented { offer: RideOffer },
    OfferUpdated { offer: RideOffer },
    RequestSent { ride_id: String },
    ProceedToRide { ride: ActiveRide },
    RejectedByRider { ride_id: String },
    Expired { ride_id: String },
    Cancelled { ride_id: String, cancelled_by: String },
    OfferWithdrawn { ride_id: String },
    RideStarted { ride_id: String },
    RideCompleted { ride_id: String },
    RiderLocation {
        ride_id: String,
        rider_id: String,
        location: Coordinate,
    },
    ServerError { message: String },
    SessionCleared,
}

impl LifecycleEvent {
    pub fn label(&self) -> &'static str {
        match self {
            LifecycleEvent::OfferPresented { .. } => "offer_presented",
            LifecycleEvent::OfferUpdated { .. } => "offer_updated",
            LifecycleEvent::RequestSent { .. } => "request_sent",
            LifecycleEvent::ProceedToRide { .. } => "proceed_to_ride",
            LifecycleEvent::RejectedByRider { .. } => "rejected_by_rider",
            LifecycleEvent::Expired { .. } => "expired",
            LifecycleEvent::Cancelled { .. } => "cancelled",
            LifecycleEvent::OfferWithdrawn { .. } => "offer_withdrawn",
            LifecycleEvent::RideStarted { .. } => "ride_started",
            LifecycleEvent::RideCompleted { .. } => "ride_completed",
            LifecycleEvent::RiderLocation { .. } => "rider_location",
            LifecycleEvent::ServerError { .. } => "server_error",
            LifecycleEvent::SessionCleared => "session_cleared",
        }
    }
}
