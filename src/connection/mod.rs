//! The single persistent socket to the dispatch server.
//!
//! `ConnectionManager` is a cheap cloneable handle. Every `initialize` bumps
//! a connection epoch, and a connection task only touches shared state while
//! its epoch is current, so at most one connection is ever live.

pub mod backoff;
pub mod subscribers;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::models::driver::{Coordinate, DriverPresence};
use crate::observability::metrics::Metrics;
use crate::protocol::{decode, encode, FrameError, OutboundFrame, PresenceData};

pub use backoff::ReconnectPolicy;
pub use subscribers::{ConnectionEvent, EventKind, SubscriptionId};

use subscribers::Subscribers;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Where the lifecycle controller sends its outbound frames.
pub trait FrameSink: Send + Sync {
    fn send_message(&self, frame: OutboundFrame) -> bool;

    fn update_location(&self, position: Coordinate, is_available: bool) -> bool;
}

#[derive(Default)]
struct Link {
    state: ConnectionState,
    epoch: u64,
    driver_id: Option<String>,
    presence: Option<DriverPresence>,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    task: Option<JoinHandle<()>>,
}

impl Link {
    /// Drops the current connection. Returns whether one existed.
    fn teardown(&mut self) -> bool {
        let was_active = self.state != ConnectionState::Disconnected;
        self.state = ConnectionState::Disconnected;
        self.epoch += 1;

        match self.outbound.take() {
            Some(outbound) => {
                // The pump closes the socket and exits on its own.
                let _ = outbound.send(Message::Close(None));
                self.task = None;
            }
            None => {
                if let Some(task) = self.task.take() {
                    task.abort();
                }
            }
        }

        was_active
    }
}

struct Inner {
    url: String,
    reconnect: ReconnectPolicy,
    link: Mutex<Link>,
    subscribers: Subscribers,
    metrics: Arc<Metrics>,
}

enum PumpExit {
    Local,
    PeerClosed,
    Failed(String),
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(url: impl Into<String>, reconnect: ReconnectPolicy, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                reconnect,
                link: Mutex::new(Link::default()),
                subscribers: Subscribers::default(),
                metrics,
            }),
        }
    }

    /// Opens a new connection for `driver_id`, discarding any existing one.
    ///
    /// Returns whether the attempt was started; readiness is reported later
    /// through `EventKind::Connect`.
    pub fn initialize(&self, driver_id: &str, presence: Option<DriverPresence>) -> bool {
        if driver_id.trim().is_empty() {
            warn!("refusing to connect without a driver id");
            return false;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!("cannot connect to dispatch server outside an async runtime");
            return false;
        };

        let (epoch, replaced) = {
            let mut link = self.inner.lock();
            let replaced = link.teardown();
            link.state = ConnectionState::Connecting;
            link.driver_id = Some(driver_id.to_string());
            // Without a new position, keep the one reported while offline.
            let known = link.presence.take().map(|known| DriverPresence {
                driver_id: driver_id.to_string(),
                ..known
            });
            link.presence = presence.or(known);
            (link.epoch, replaced)
        };

        if replaced {
            info!("replacing existing dispatch connection");
            self.inner.subscribers.emit(&ConnectionEvent::Disconnected {
                reason: "replaced by new connection".to_string(),
            });
        }

        info!(driver_id, url = %self.inner.url, "connecting to dispatch server");
        let task = runtime.spawn(run_connection(self.inner.clone(), epoch));

        let mut link = self.inner.lock();
        if link.epoch == epoch {
            link.task = Some(task);
        }
        true
    }

    /// Closes the socket and forgets driver and presence. Idempotent.
    pub fn disconnect(&self) {
        let was_active = {
            let mut link = self.inner.lock();
            let was_active = link.teardown();
            link.driver_id = None;
            link.presence = None;
            was_active
        };

        if was_active {
            info!("disconnected from dispatch server");
            self.inner.subscribers.emit(&ConnectionEvent::Disconnected {
                reason: "client disconnect".to_string(),
            });
        }
    }

    /// Adds a subscriber for `kind`. Subscribers run in registration order.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.inner.subscribers.add(kind, handler)
    }

    pub fn off(&self, kind: EventKind, id: SubscriptionId) -> bool {
        self.inner.subscribers.remove(kind, id)
    }

    pub fn clear(&self, kind: EventKind) {
        self.inner.subscribers.clear(kind);
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn driver_id(&self) -> Option<String> {
        self.inner.lock().driver_id.clone()
    }

    pub fn presence(&self) -> Option<DriverPresence> {
        self.inner.lock().presence.clone()
    }

    /// Sends immediately when connected, otherwise returns `false`. Nothing
    /// is queued for later delivery.
    pub fn send_message(&self, frame: OutboundFrame) -> bool {
        self.inner.send_message(frame)
    }

    /// Records the new presence (replayed on reconnect) and reports it to the
    /// server if connected.
    pub fn update_location(&self, position: Coordinate, is_available: bool) -> bool {
        if !position.is_valid() {
            warn!(?position, "ignoring invalid driver position");
            return false;
        }

        let data = {
            let mut link = self.inner.lock();
            let driver_id = link.driver_id.clone().unwrap_or_default();
            let presence = DriverPresence {
                driver_id,
                position,
                is_available,
            };
            let data = PresenceData::from(&presence);
            link.presence = Some(presence);
            data
        };

        self.send_message(OutboundFrame::LocationUpdate { data })
    }

    pub fn send_ride_request(&self, ride_id: &str, rider_id: &str) -> bool {
        self.send_message(OutboundFrame::SendRideRequest {
            ride_id: ride_id.to_string(),
            user_id: rider_id.to_string(),
        })
    }

    pub fn accept_ride(&self, ride_id: &str, rider_id: &str) -> bool {
        self.send_message(OutboundFrame::AcceptRide {
            ride_id: ride_id.to_string(),
            user_id: rider_id.to_string(),
        })
    }

    pub fn reject_ride(&self, ride_id: &str, rider_id: &str) -> bool {
        self.send_message(OutboundFrame::RejectRide {
            ride_id: ride_id.to_string(),
            user_id: rider_id.to_string(),
        })
    }

    pub fn cancel_ride(&self, ride_id: &str, rider_id: &str) -> bool {
        self.send_message(OutboundFrame::CancelRide {
            ride_id: ride_id.to_string(),
            user_id: rider_id.to_string(),
        })
    }

    pub fn start_ride(&self, ride_id: &str, rider_id: &str) -> bool {
        self.send_message(OutboundFrame::StartRide {
            ride_id: ride_id.to_string(),
            user_id: rider_id.to_string(),
        })
    }

    pub fn complete_ride(&self, ride_id: &str, rider_id: &str) -> bool {
        self.send_message(OutboundFrame::CompleteRide {
            ride_id: ride_id.to_string(),
            user_id: rider_id.to_string(),
        })
    }

    /// Decodes one inbound text frame and hands it to subscribers, exactly
    /// as the read loop does.
    pub fn handle_frame(&self, text: &str) {
        self.inner.dispatch(text);
    }
}

impl FrameSink for ConnectionManager {
    fn send_message(&self, frame: OutboundFrame) -> bool {
        ConnectionManager::send_message(self, frame)
    }

    fn update_location(&self, position: Coordinate, is_available: bool) -> bool {
        ConnectionManager::update_location(self, position, is_available)
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send_message(&self, frame: OutboundFrame) -> bool {
        let frame_type = frame.type_name();
        let link = self.lock();

        let (ConnectionState::Connected, Some(outbound), Some(driver_id)) =
            (link.state, link.outbound.as_ref(), link.driver_id.as_deref())
        else {
            warn!(frame_type, state = ?link.state, "not connected; dropping outbound frame");
            self.record_outbound(frame_type, "rejected");
            return false;
        };

        let text = match encode(driver_id, &frame) {
            Ok(text) => text,
            Err(err) => {
                error!(frame_type, error = %err, "failed to encode outbound frame");
                self.record_outbound(frame_type, "error");
                return false;
            }
        };

        if outbound.send(Message::Text(text)).is_err() {
            warn!(frame_type, "connection writer has stopped; dropping outbound frame");
            self.record_outbound(frame_type, "rejected");
            return false;
        }

        debug!(frame_type, "outbound frame queued");
        self.record_outbound(frame_type, "sent");
        true
    }

    fn record_outbound(&self, frame_type: &str, outcome: &str) {
        self.metrics
            .outbound_frames_total
            .with_label_values(&[frame_type, outcome])
            .inc();
    }

    fn dispatch(&self, text: &str) {
        match decode(text) {
            Ok(event) => {
                let frame_type = event.type_name();
                self.metrics
                    .frames_received_total
                    .with_label_values(&[frame_type])
                    .inc();
                debug!(frame_type, "inbound frame");
                self.subscribers.emit(&ConnectionEvent::Dispatch(event));
            }
            Err(FrameError::UnknownType(frame_type)) => {
                self.metrics
                    .frames_dropped_total
                    .with_label_values(&["unknown_type"])
                    .inc();
                info!(%frame_type, "ignoring unknown inbound frame type");
            }
            Err(err) => {
                self.metrics
                    .frames_dropped_total
                    .with_label_values(&[err.label()])
                    .inc();
                error!(error = %err, "dropping inbound frame");
            }
        }
    }

    fn transition(&self, epoch: u64, state: ConnectionState) -> bool {
        let mut link = self.lock();
        if link.epoch != epoch {
            return false;
        }
        link.state = state;
        if state != ConnectionState::Connected {
            link.outbound = None;
        }
        true
    }

    fn mark_connected(&self, epoch: u64, outbound: mpsc::UnboundedSender<Message>) -> bool {
        let mut link = self.lock();
        if link.epoch != epoch {
            return false;
        }
        link.state = ConnectionState::Connected;
        link.outbound = Some(outbound);
        true
    }

    /// Sends the `connect` frame carrying the last known presence.
    fn announce(&self) -> bool {
        let data = self.lock().presence.as_ref().map(PresenceData::from);
        self.send_message(OutboundFrame::Connect { data })
    }
}

async fn run_connection(inner: Arc<Inner>, epoch: u64) {
    let mut attempt: u32 = 0;

    loop {
        match connect_async(inner.url.as_str()).await {
            Ok((socket, _response)) => {
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                if !inner.mark_connected(epoch, outbound_tx) {
                    return;
                }
                let connected_at = Instant::now();

                info!(url = %inner.url, "connected to dispatch server");
                inner.announce();
                inner.subscribers.emit(&ConnectionEvent::Connected);

                let exit = pump(&inner, socket, outbound_rx).await;
                // Only a connection that stayed up resets the backoff.
                if inner.reconnect.is_stable(connected_at.elapsed()) {
                    attempt = 0;
                }

                let reason = match exit {
                    PumpExit::Local => return,
                    PumpExit::PeerClosed => "closed by server".to_string(),
                    PumpExit::Failed(message) => {
                        if inner.transition(epoch, ConnectionState::Disconnected) {
                            error!(error = %message, "dispatch connection failed");
                            inner
                                .subscribers
                                .emit(&ConnectionEvent::TransportError { message: message.clone() });
                        }
                        message
                    }
                };

                if !inner.transition(epoch, ConnectionState::Disconnected) {
                    return;
                }
                warn!(%reason, "dispatch connection lost");
                inner
                    .subscribers
                    .emit(&ConnectionEvent::Disconnected { reason });
            }
            Err(err) => {
                if !inner.transition(epoch, ConnectionState::Disconnected) {
                    return;
                }
                error!(error = %err, url = %inner.url, "failed to connect to dispatch server");
                inner.subscribers.emit(&ConnectionEvent::TransportError {
                    message: err.to_string(),
                });
            }
        }

        let Some(delay) = inner.reconnect.delay_for(attempt) else {
            return;
        };
        attempt += 1;
        info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting to dispatch server");
        sleep(delay).await;

        if !inner.transition(epoch, ConnectionState::Connecting) {
            return;
        }
    }
}

async fn pump(
    inner: &Inner,
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) -> PumpExit {
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            queued = outbound.recv() => match queued {
                Some(Message::Close(frame)) => {
                    let _ = sink.send(Message::Close(frame)).await;
                    return PumpExit::Local;
                }
                Some(message) => {
                    if let Err(err) = sink.send(message).await {
                        return PumpExit::Failed(err.to_string());
                    }
                }
                None => {
                    let _ = sink.close().await;
                    return PumpExit::Local;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => inner.dispatch(&text),
                Some(Ok(Message::Close(_))) | None => return PumpExit::PeerClosed,
                Some(Ok(_)) => {}
                Some(Err(err)) => return PumpExit::Failed(err.to_string()),
            },
        }
    }
}
