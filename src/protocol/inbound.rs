use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::models::driver::Coordinate;
use crate::models::ride::Waypoint;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid json: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("frame has no type discriminator")]
    MissingType,

    #[error("unknown frame type: {0}")]
    UnknownType(String),

    #[error("invalid {kind} frame: {reason}")]
    Invalid { kind: String, reason: String },
}

impl FrameError {
    pub fn label(&self) -> &'static str {
        match self {
            FrameError::Malformed(_) => "malformed",
            FrameError::MissingType => "missing_type",
            FrameError::UnknownType(_) => "unknown_type",
            FrameError::Invalid { .. } => "invalid",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideRequestFrame {
    pub ride_id: String,
    pub user_id: String,
    pub pickup: Waypoint,
    pub dropoff: Waypoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiderResponseFrame {
    pub ride_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideCancelledFrame {
    pub ride_id: String,
    pub cancelled_by: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLocationFrame {
    pub user_id: String,
    pub location: Coordinate,
    pub ride_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerErrorFrame {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatusFrame {
    pub status: String,
}

/// A validated server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    RideRequest(RideRequestFrame),
    AcceptedByUser(RiderResponseFrame),
    RejectedByUser(RiderResponseFrame),
    RideCancelled(RideCancelledFrame),
    UserLocation(UserLocationFrame),
    ServerError(ServerErrorFrame),
    ConnectionStatus(ConnectionStatusFrame),
}

impl DispatchEvent {
    pub fn type_name(&self) -> &'static str {
        match self {
            DispatchEvent::RideRequest(_) => "rideRequest",
            DispatchEvent::AcceptedByUser(_) => "acceptedByUser",
            DispatchEvent::RejectedByUser(_) => "rejectedByUser",
            DispatchEvent::RideCancelled(_) => "rideCancelled",
            DispatchEvent::UserLocation(_) => "userLocation",
            DispatchEvent::ServerError(_) => "error",
            DispatchEvent::ConnectionStatus(_) => "connectionStatus",
        }
    }
}

/// Parses one text frame. Any error means the frame must be dropped.
pub fn decode(text: &str) -> Result<DispatchEvent, FrameError> {
    let value: Value = serde_json::from_str(text).map_err(FrameError::Malformed)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingType)?
        .to_string();

    let event = match kind.as_str() {
        "rideRequest" => {
            let frame: RideRequestFrame = parse(&kind, value)?;
            validate_ride_request(&frame).map_err(|reason| invalid(&kind, reason))?;
            DispatchEvent::RideRequest(frame)
        }
        "acceptedByUser" => DispatchEvent::AcceptedByUser(parse(&kind, value)?),
        "rejectedByUser" => DispatchEvent::RejectedByUser(parse(&kind, value)?),
        "rideCancelled" => DispatchEvent::RideCancelled(parse(&kind, value)?),
        "userLocation" => {
            let frame: UserLocationFrame = parse(&kind, value)?;
            if !frame.location.is_valid() {
                return Err(invalid(&kind, "location out of range"));
            }
            DispatchEvent::UserLocation(frame)
        }
        "error" => DispatchEvent::ServerError(parse(&kind, value)?),
        "connectionStatus" => DispatchEvent::ConnectionStatus(parse(&kind, value)?),
        _ => return Err(FrameError::UnknownType(kind)),
    };

    Ok(event)
}

fn parse<T: DeserializeOwned>(kind: &str, value: Value) -> Result<T, FrameError> {
    T::deserialize(value).map_err(|err| invalid(kind, err.to_string()))
}

fn invalid(kind: &str, reason: impl Into<String>) -> FrameError {
    FrameError::Invalid {
        kind: kind.to_string(),
        reason: reason.into(),
    }
}

fn validate_ride_request(frame: &RideRequestFrame) -> Result<(), &'static str> {
    if frame.ride_id.trim().is_empty() {
        return Err("rideId cannot be empty");
    }
    if !frame.pickup.coordinates.is_valid() {
        return Err("pickup coordinates out of range");
    }
    if !frame.dropoff.coordinates.is_valid() {
        return Err("dropoff coordinates out of range");
    }
    Ok(())
}
