use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use crate::protocol::DispatchEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    Connect,
    Disconnect,
    Error,
    RideRequest,
    AcceptedByUser,
    RejectedByUser,
    RideCancelled,
    UserLocation,
    ServerError,
    ConnectionStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected { reason: String },
    TransportError { message: String },
    Dispatch(DispatchEvent),
}

impl ConnectionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ConnectionEvent::Connected => EventKind::Connect,
            ConnectionEvent::Disconnected { .. } => EventKind::Disconnect,
            ConnectionEvent::TransportError { .. } => EventKind::Error,
            ConnectionEvent::Dispatch(event) => match event {
                DispatchEvent::RideRequest(_) => EventKind::RideRequest,
                DispatchEvent::AcceptedByUser(_) => EventKind::AcceptedByUser,
                DispatchEvent::RejectedByUser(_) => EventKind::RejectedByUser,
                DispatchEvent::RideCancelled(_) => EventKind::RideCancelled,
                DispatchEvent::UserLocation(_) => EventKind::UserLocation,
                DispatchEvent::ServerError(_) => EventKind::ServerError,
                DispatchEvent::ConnectionStatus(_) => EventKind::ConnectionStatus,
            },
        }
    }
}

pub type Handler = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

/// Ordered handler lists, one per event kind.
#[derive(Default)]
pub struct Subscribers {
    handlers: DashMap<EventKind, Vec<(SubscriptionId, Handler)>>,
}

impl Subscribers {
    pub fn add<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(Uuid::new_v4());
        let handler: Handler = Arc::new(handler);
        self.handlers.entry(kind).or_default().push((id, handler));
        id
    }

    pub fn remove(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let Some(mut list) = self.handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        before != list.len()
    }

    pub fn clear(&self, kind: EventKind) {
        self.handlers.remove(&kind);
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map(|list| list.len()).unwrap_or(0)
    }

    /// Invokes every handler for the event's kind in registration order and
    /// returns how many ran.
    pub fn emit(&self, event: &ConnectionEvent) -> usize {
        // Snapshot first so a handler may subscribe or unsubscribe re-entrantly.
        let handlers: Vec<Handler> = match self.handlers.get(&event.kind()) {
            Some(list) => list.iter().map(|(_, handler)| handler.clone()).collect(),
            None => return 0,
        };

        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }
}
