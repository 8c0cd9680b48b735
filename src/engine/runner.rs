use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, warn};

use crate::connection::FrameSink;
use crate::engine::lifecycle::{DispatchSnapshot, Expiry, RideLifecycleController};
use crate::error::AppError;
use crate::models::driver::Coordinate;
use crate::protocol::DispatchEvent;

#[derive(Debug, Clone, PartialEq)]
pub enum DriverCommand {
    RequestRide { ride_id: String },
    Cancel { ride_id: String },
    Dismiss { ride_id: String },
    StartRide,
    CompleteRide,
    UpdateLocation { position: Coordinate, is_available: bool },
}

pub enum EngineInput {
    Dispatch(DispatchEvent),
    Command {
        command: DriverCommand,
        reply: oneshot::Sender<Result<(), AppError>>,
    },
    PositionKnown(Coordinate),
    Reset,
    Shutdown,
}

/// Owns the controller and applies inputs one at a time in arrival order.
/// The snapshot is republished before a command's reply is sent.
pub async fn run_dispatch_engine<S: FrameSink>(
    mut controller: RideLifecycleController<S>,
    mut input_rx: mpsc::UnboundedReceiver<EngineInput>,
    mut expiry_rx: mpsc::UnboundedReceiver<Expiry>,
    snapshot_tx: watch::Sender<DispatchSnapshot>,
) {
    info!("dispatch engine started");

    loop {
        let mut pending_reply = None;

        tokio::select! {
            input = input_rx.recv() => match input {
                Some(EngineInput::Dispatch(event)) => controller.handle_event(event),
                Some(EngineInput::Command { command, reply }) => {
                    let result = apply_command(&mut controller, command);
                    pending_reply = Some((reply, result));
                }
                Some(EngineInput::PositionKnown(position)) => controller.set_position(position),
                Some(EngineInput::Reset) => controller.reset(),
                Some(EngineInput::Shutdown) | None => break,
            },
            Some(expiry) = expiry_rx.recv() => controller.expire(expiry),
        }

        snapshot_tx.send_replace(controller.snapshot());

        if let Some((reply, result)) = pending_reply {
            let _ = reply.send(result);
        }
    }

    controller.reset();
    snapshot_tx.send_replace(controller.snapshot());
    warn!("dispatch engine stopped");
}

fn apply_command<S: FrameSink>(
    controller: &mut RideLifecycleController<S>,
    command: DriverCommand,
) -> Result<(), AppError> {
    match command {
        DriverCommand::RequestRide { ride_id } => controller.request_ride(&ride_id).map(drop),
        DriverCommand::Cancel { ride_id } => controller.cancel(&ride_id),
        DriverCommand::Dismiss { ride_id } => controller.dismiss(&ride_id),
        DriverCommand::StartRide => controller.start_ride().map(drop),
        DriverCommand::CompleteRide => controller.complete_ride().map(drop),
        DriverCommand::UpdateLocation {
            position,
            is_available,
        } => controller.update_location(position, is_available).map(drop),
    }
}
