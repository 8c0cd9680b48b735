use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::info;

use crate::config::Config;
use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionState, EventKind, ReconnectPolicy};
use crate::engine::lifecycle::{
    DispatchSnapshot, LifecycleSettings, RideLifecycleController, DEFAULT_OFFER_WINDOW,
};
use crate::engine::runner::{run_dispatch_engine, DriverCommand, EngineInput};
use crate::error::AppError;
use crate::geo::Pricing;
use crate::models::driver::{Coordinate, DriverPresence};
use crate::models::event::LifecycleEvent;
use crate::models::ride::RideOffer;
use crate::observability::metrics::Metrics;

const RIDE_EVENT_KINDS: [EventKind; 7] = [
    EventKind::RideRequest,
    EventKind::AcceptedByUser,
    EventKind::RejectedByUser,
    EventKind::RideCancelled,
    EventKind::UserLocation,
    EventKind::ServerError,
    EventKind::ConnectionStatus,
];

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub dispatch_url: String,
    pub driver_id: String,
    pub pricing: Pricing,
    pub offer_window: Duration,
    pub event_buffer_size: usize,
    pub reconnect: ReconnectPolicy,
}

impl SessionConfig {
    pub fn new(dispatch_url: impl Into<String>, driver_id: impl Into<String>) -> Self {
        Self {
            dispatch_url: dispatch_url.into(),
            driver_id: driver_id.into(),
            pricing: Pricing::default(),
            offer_window: DEFAULT_OFFER_WINDOW,
            event_buffer_size: 1024,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl From<&Config> for SessionConfig {
    fn from(config: &Config) -> Self {
        Self {
            dispatch_url: config.dispatch_url.clone(),
            driver_id: config.driver_id.clone(),
            pricing: config.pricing,
            offer_window: Duration::from_secs(config.offer_window_secs),
            event_buffer_size: config.event_buffer_size,
            reconnect: config.reconnect,
        }
    }
}

/// One driver session: the connection, the dispatch engine feeding the
/// lifecycle controller, and the channels the UI layer reads from.
pub struct DispatchSession {
    driver_id: String,
    connection: ConnectionManager,
    input_tx: mpsc::UnboundedSender<EngineInput>,
    events_tx: broadcast::Sender<LifecycleEvent>,
    snapshot_rx: watch::Receiver<DispatchSnapshot>,
    metrics: Arc<Metrics>,
}

impl DispatchSession {
    /// Builds the session and spawns its engine. Must run inside a tokio runtime.
    pub fn start(config: SessionConfig) -> Result<Self, AppError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| AppError::Internal(format!("no async runtime: {err}")))?;
        let metrics = Arc::new(
            Metrics::new()
                .map_err(|err| AppError::Internal(format!("failed to register metrics: {err}")))?,
        );

        let connection =
            ConnectionManager::new(config.dispatch_url.clone(), config.reconnect, metrics.clone());
        let (events_tx, _unused_rx) = broadcast::channel(config.event_buffer_size.max(1));
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(DispatchSnapshot::default());

        for kind in RIDE_EVENT_KINDS {
            let input_tx = input_tx.clone();
            connection.on(kind, move |event| {
                if let ConnectionEvent::Dispatch(event) = event {
                    let _ = input_tx.send(EngineInput::Dispatch(event.clone()));
                }
            });
        }

        let controller = RideLifecycleController::new(
            connection.clone(),
            LifecycleSettings {
                pricing: config.pricing,
                offer_window: config.offer_window,
            },
            events_tx.clone(),
            expiry_tx,
            metrics.clone(),
        );
        runtime.spawn(run_dispatch_engine(controller, input_rx, expiry_rx, snapshot_tx));

        Ok(Self {
            driver_id: config.driver_id,
            connection,
            input_tx,
            events_tx,
            snapshot_rx,
            metrics,
        })
    }

    pub fn driver_id(&self) -> &str {
        &self.driver_id
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Connects to the dispatch server, announcing `position` if known.
    pub fn go_online(&self, position: Option<Coordinate>, is_available: bool) -> bool {
        let presence = position.map(|position| DriverPresence {
            driver_id: self.driver_id.clone(),
            position,
            is_available,
        });

        if let Some(position) = position {
            let _ = self.input_tx.send(EngineInput::PositionKnown(position));
        }

        self.connection.initialize(&self.driver_id, presence)
    }

    /// Disconnects and forgets every offer and countdown.
    pub fn go_offline(&self) {
        self.connection.disconnect();
        let _ = self.input_tx.send(EngineInput::Reset);
        info!(driver_id = %self.driver_id, "driver went offline");
    }

    pub fn shutdown(&self) {
        self.connection.disconnect();
        let _ = self.input_tx.send(EngineInput::Shutdown);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events_tx.subscribe()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<DispatchSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn snapshot(&self) -> DispatchSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn offers(&self) -> Vec<RideOffer> {
        self.snapshot_rx.borrow().offers.clone()
    }

    pub fn offer(&self, ride_id: &str) -> Option<RideOffer> {
        self.snapshot_rx
            .borrow()
            .offers
            .iter()
            .find(|offer| offer.ride_id == ride_id)
            .cloned()
    }

    pub async fn request_ride(&self, ride_id: &str) -> Result<(), AppError> {
        self.command(DriverCommand::RequestRide {
            ride_id: ride_id.to_string(),
        })
        .await
    }

    pub async fn cancel(&self, ride_id: &str) -> Result<(), AppError> {
        self.command(DriverCommand::Cancel {
            ride_id: ride_id.to_string(),
        })
        .await
    }

    pub async fn dismiss(&self, ride_id: &str) -> Result<(), AppError> {
        self.command(DriverCommand::Dismiss {
            ride_id: ride_id.to_string(),
        })
        .await
    }

    pub async fn start_ride(&self) -> Result<(), AppError> {
        self.command(DriverCommand::StartRide).await
    }

    pub async fn complete_ride(&self) -> Result<(), AppError> {
        self.command(DriverCommand::CompleteRide).await
    }

    pub async fn update_location(&self, position: Coordinate, is_available: bool) -> Result<(), AppError> {
        self.command(DriverCommand::UpdateLocation {
            position,
            is_available,
        })
        .await
    }

    async fn command(&self, command: DriverCommand) -> Result<(), AppError> {
        let (reply, reply_rx) = oneshot::channel();
        self.input_tx
            .send(EngineInput::Command { command, reply })
            .map_err(|_| AppError::Internal("dispatch engine is not running".to_string()))?;

        reply_rx
            .await
            .map_err(|_| AppError::Internal("dispatch engine dropped the command".to_string()))?
    }
}

impl Drop for DispatchSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}
