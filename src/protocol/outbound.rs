use serde::Serialize;

use crate::models::driver::DriverPresence;

const DRIVER_ROLE: &str = "driver";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceData {
    pub latitude: f64,
    pub longitude: f64,
    pub is_available: bool,
}

impl From<&DriverPresence> for PresenceData {
    fn from(presence: &DriverPresence) -> Self {
        Self {
            latitude: presence.position.latitude,
            longitude: presence.position.longitude,
            is_available: presence.is_available,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum OutboundFrame {
    Connect {
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<PresenceData>,
    },
    LocationUpdate {
        data: PresenceData,
    },
    SendRideRequest {
        ride_id: String,
        user_id: String,
    },
    AcceptRide {
        ride_id: String,
        user_id: String,
    },
    RejectRide {
        ride_id: String,
        user_id: String,
    },
    CancelRide {
        ride_id: String,
        user_id: String,
    },
    StartRide {
        ride_id: String,
        user_id: String,
    },
    CompleteRide {
        ride_id: String,
        user_id: String,
    },
}

impl OutboundFrame {
    pub fn type_name(&self) -> &'static str {
        match self {
            OutboundFrame::Connect { .. } => "connect",
            OutboundFrame::LocationUpdate { .. } => "locationUpdate",
            OutboundFrame::SendRideRequest { .. } => "sendRideRequest",
            OutboundFrame::AcceptRide { .. } => "acceptRide",
            OutboundFrame::RejectRide { .. } => "rejectRide",
            OutboundFrame::CancelRide { .. } => "cancelRide",
            OutboundFrame::StartRide { .. } => "startRide",
            OutboundFrame::CompleteRide { .. } => "completeRide",
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DriverEnvelope<'a> {
    role: &'static str,
    driver_id: &'a str,
    #[serde(flatten)]
    frame: &'a OutboundFrame,
}

/// Serializes `frame` as a single-line JSON text frame for `driver_id`.
pub fn encode(driver_id: &str, frame: &OutboundFrame) -> Result<String, serde_json::Error> {
    serde_json::to_string(&DriverEnvelope {
        role: DRIVER_ROLE,
        driver_id,
        frame,
    })
}
