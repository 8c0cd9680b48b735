use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::connection::FrameSink;
use crate::engine::registry::{RideRequestRegistry, Upsert};
use crate::error::AppError;
use crate::geo::Pricing;
use crate::models::driver::Coordinate;
use crate::models::event::LifecycleEvent;
use crate::models::ride::{ActiveRide, RideOffer, RideOfferStatus, RidePhase};
use crate::observability::metrics::Metrics;
use crate::protocol::inbound::{RideRequestFrame, UserLocationFrame};
use crate::protocol::{DispatchEvent, OutboundFrame};

pub const DEFAULT_OFFER_WINDOW: Duration = Duration::from_secs(30);

const CANCELLED_BY_DRIVER: &str = "driver";

/// How many finished ride ids are remembered to reject re-announcements.
const RETIRED_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy)]
pub struct LifecycleSettings {
    pub pricing: Pricing,
    pub offer_window: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            pricing: Pricing::default(),
            offer_window: DEFAULT_OFFER_WINDOW,
        }
    }
}

/// Fired when an offer's countdown elapses. Stale tokens are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expiry {
    pub ride_id: String,
    token: u64,
}

struct Countdown {
    token: u64,
    handle: AbortHandle,
}

/// Ride ids that reached a terminal state this session, oldest evicted first.
#[derive(Debug, Default)]
struct RetiredRides {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl RetiredRides {
    fn insert(&mut self, ride_id: &str) {
        if !self.ids.insert(ride_id.to_string()) {
            return;
        }
        self.order.push_back(ride_id.to_string());
        if self.order.len() > RETIRED_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn contains(&self, ride_id: &str) -> bool {
        self.ids.contains(ride_id)
    }

    fn clear(&mut self) {
        self.ids.clear();
        self.order.clear();
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchSnapshot {
    pub offers: Vec<RideOffer>,
    pub active_ride: Option<ActiveRide>,
}

pub struct RideLifecycleController<S: FrameSink> {
    registry: RideRequestRegistry,
    sink: S,
    events: broadcast::Sender<LifecycleEvent>,
    expiry_tx: mpsc::UnboundedSender<Expiry>,
    countdowns: HashMap<String, Countdown>,
    next_token: u64,
    offer_window: Duration,
    position: Option<Coordinate>,
    active: Option<ActiveRide>,
    retired: RetiredRides,
    metrics: Arc<Metrics>,
}

impl<S: FrameSink> RideLifecycleController<S> {
    pub fn new(
        sink: S,
        settings: LifecycleSettings,
        events: broadcast::Sender<LifecycleEvent>,
        expiry_tx: mpsc::UnboundedSender<Expiry>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            registry: RideRequestRegistry::new(settings.pricing),
            sink,
            events,
            expiry_tx,
            countdowns: HashMap::new(),
            next_token: 0,
            offer_window: settings.offer_window,
            position: None,
            active: None,
            retired: RetiredRides::default(),
            metrics,
        }
    }

    pub fn registry(&self) -> &RideRequestRegistry {
        &self.registry
    }

    pub fn active_ride(&self) -> Option<&ActiveRide> {
        self.active.as_ref()
    }

    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            offers: self.registry.all(),
            active_ride: self.active.clone(),
        }
    }

    pub fn handle_event(&mut self, event: DispatchEvent) {
        match event {
            DispatchEvent::RideRequest(frame) => self.present_offer(frame),
            DispatchEvent::AcceptedByUser(frame) => self.rider_accepted(&frame.ride_id),
            DispatchEvent::RejectedByUser(frame) => self.rider_rejected(&frame.ride_id),
            DispatchEvent::RideCancelled(frame) => {
                self.ride_cancelled(&frame.ride_id, &frame.cancelled_by)
            }
            DispatchEvent::UserLocation(frame) => self.rider_moved(frame),
            DispatchEvent::ServerError(frame) => {
                warn!(message = %frame.message, "dispatch server reported an error");
                self.emit(LifecycleEvent::ServerError {
                    message: frame.message,
                });
            }
            DispatchEvent::ConnectionStatus(frame) => {
                info!(status = %frame.status, "dispatch connection status");
            }
        }
    }

    fn present_offer(&mut self, frame: RideRequestFrame) {
        if self
            .active
            .as_ref()
            .is_some_and(|ride| ride.ride_id == frame.ride_id)
        {
            debug!(ride_id = %frame.ride_id, "ignoring re-announcement of the active ride");
            return;
        }
        if self.retired.contains(&frame.ride_id) {
            debug!(ride_id = %frame.ride_id, "ignoring re-announcement of a finished ride");
            return;
        }

        let (offer, outcome) = self.registry.upsert(
            &frame.ride_id,
            &frame.user_id,
            frame.pickup,
            frame.dropoff,
            self.position.as_ref(),
        );
        self.metrics.offers_active.set(self.registry.len() as i64);

        match outcome {
            Upsert::Created => {
                info!(
                    ride_id = %offer.ride_id,
                    distance_miles = offer.distance_miles,
                    eta_minutes = offer.eta_minutes,
                    fare = offer.fare_estimate,
                    "ride offer presented"
                );
                self.start_countdown(&offer.ride_id);
                self.emit(LifecycleEvent::OfferPresented { offer });
            }
            Upsert::Updated => {
                debug!(ride_id = %offer.ride_id, "ride offer re-announced");
                self.emit(LifecycleEvent::OfferUpdated { offer });
            }
        }
    }

    /// Driver asks the rider for this ride.
    pub fn request_ride(&mut self, ride_id: &str) -> Result<RideOffer, AppError> {
        let offer = self.offer(ride_id)?;
        if offer.status != RideOfferStatus::Offered {
            return Err(AppError::Conflict(format!(
                "ride {ride_id} is {:?}, not Offered",
                offer.status
            )));
        }

        let frame = OutboundFrame::SendRideRequest {
            ride_id: offer.ride_id.clone(),
            user_id: offer.rider_id.clone(),
        };
        if !self.sink.send_message(frame) {
            return Err(AppError::NotConnected);
        }

        let offer = self
            .registry
            .set_status(ride_id, RideOfferStatus::RequestSent)
            .ok_or_else(|| AppError::NotFound(format!("ride {ride_id} not found")))?;
        info!(%ride_id, "ride request sent");
        self.emit(LifecycleEvent::RequestSent {
            ride_id: ride_id.to_string(),
        });
        Ok(offer)
    }

    fn rider_accepted(&mut self, ride_id: &str) {
        let Some(offer) = self.registry.get(ride_id) else {
            debug!(%ride_id, "ignoring acceptance for unknown ride");
            return;
        };
        if offer.status != RideOfferStatus::RequestSent {
            warn!(%ride_id, status = ?offer.status, "ignoring acceptance without a pending request");
            return;
        }

        if let Some(current) = &self.active {
            // Already carrying a rider: back out of the late acceptance.
            warn!(current = %current.ride_id, %ride_id, "acceptance while a ride is active; cancelling it");
            let sent = self.sink.send_message(OutboundFrame::CancelRide {
                ride_id: offer.ride_id.clone(),
                user_id: offer.rider_id.clone(),
            });
            if !sent {
                warn!(%ride_id, "could not tell the server about the cancelled acceptance");
            }
            self.terminate(ride_id, RideOfferStatus::Cancelled);
            self.emit(LifecycleEvent::Cancelled {
                ride_id: ride_id.to_string(),
                cancelled_by: CANCELLED_BY_DRIVER.to_string(),
            });
            return;
        }

        self.registry
            .set_status(ride_id, RideOfferStatus::AcceptedByRider);
        self.cancel_countdown(ride_id);
        self.retired.insert(ride_id);
        let Some(offer) = self.registry.remove(ride_id) else {
            return;
        };

        for other in self.registry.rides_for_rider(&offer.rider_id, ride_id) {
            self.withdraw(&other);
        }

        let ride = ActiveRide {
            ride_id: offer.ride_id,
            rider_id: offer.rider_id,
            pickup: offer.pickup,
            dropoff: offer.dropoff,
            fare_estimate: offer.fare_estimate,
            phase: RidePhase::EnRoute,
            rider_location: None,
            accepted_at: Utc::now(),
        };
        self.active = Some(ride.clone());
        self.metrics.offers_active.set(self.registry.len() as i64);

        info!(%ride_id, "rider accepted; proceeding to pickup");
        self.emit(LifecycleEvent::ProceedToRide { ride });
    }

    fn rider_rejected(&mut self, ride_id: &str) {
        let Some(offer) = self.registry.get(ride_id) else {
            debug!(%ride_id, "ignoring rejection for unknown ride");
            return;
        };
        if offer.status != RideOfferStatus::RequestSent {
            warn!(%ride_id, status = ?offer.status, "ignoring rejection without a pending request");
            return;
        }

        // Stays listed, non-actionable, until dismissed or its countdown ends.
        self.registry
            .set_status(ride_id, RideOfferStatus::RejectedByRider);
        info!(%ride_id, "rider rejected the request");
        self.emit(LifecycleEvent::RejectedByRider {
            ride_id: ride_id.to_string(),
        });
    }

    fn ride_cancelled(&mut self, ride_id: &str, cancelled_by: &str) {
        if self
            .active
            .as_ref()
            .is_some_and(|ride| ride.ride_id == ride_id)
        {
            self.active = None;
            info!(%ride_id, %cancelled_by, "active ride cancelled");
            self.emit(LifecycleEvent::Cancelled {
                ride_id: ride_id.to_string(),
                cancelled_by: cancelled_by.to_string(),
            });
            return;
        }

        match self.registry.get(ride_id).map(|offer| offer.status) {
            Some(status) if !status.is_terminal() => {
                self.terminate(ride_id, RideOfferStatus::Cancelled);
                info!(%ride_id, %cancelled_by, "ride offer cancelled");
                self.emit(LifecycleEvent::Cancelled {
                    ride_id: ride_id.to_string(),
                    cancelled_by: cancelled_by.to_string(),
                });
            }
            Some(_) => self.withdraw(ride_id),
            None => debug!(%ride_id, "ignoring cancellation for unknown ride"),
        }
    }

    fn rider_moved(&mut self, frame: UserLocationFrame) {
        let Some(ride) = self.active.as_mut() else {
            debug!(ride_id = %frame.ride_id, "rider location without an active ride");
            return;
        };
        if ride.ride_id != frame.ride_id {
            debug!(ride_id = %frame.ride_id, "rider location for another ride");
            return;
        }

        ride.rider_location = Some(frame.location);
        self.emit(LifecycleEvent::RiderLocation {
            ride_id: frame.ride_id,
            rider_id: frame.user_id,
            location: frame.location,
        });
    }

    /// Driver backs out of an offer or the active ride.
    pub fn cancel(&mut self, ride_id: &str) -> Result<(), AppError> {
        if let Some(ride) = self.active.as_ref().filter(|ride| ride.ride_id == ride_id) {
            let frame = OutboundFrame::CancelRide {
                ride_id: ride.ride_id.clone(),
                user_id: ride.rider_id.clone(),
            };
            if !self.sink.send_message(frame) {
                return Err(AppError::NotConnected);
            }
            self.active = None;
            info!(%ride_id, "driver cancelled the active ride");
            self.emit(LifecycleEvent::Cancelled {
                ride_id: ride_id.to_string(),
                cancelled_by: CANCELLED_BY_DRIVER.to_string(),
            });
            return Ok(());
        }

        let offer = self.offer(ride_id)?;
        let frame = match offer.status {
            RideOfferStatus::Offered => OutboundFrame::RejectRide {
                ride_id: offer.ride_id.clone(),
                user_id: offer.rider_id.clone(),
            },
            RideOfferStatus::RequestSent => OutboundFrame::CancelRide {
                ride_id: offer.ride_id.clone(),
                user_id: offer.rider_id.clone(),
            },
            status => {
                return Err(AppError::Conflict(format!(
                    "ride {ride_id} is already {status:?}"
                )));
            }
        };
        if !self.sink.send_message(frame) {
            return Err(AppError::NotConnected);
        }

        self.terminate(ride_id, RideOfferStatus::Cancelled);
        info!(%ride_id, "driver cancelled the ride offer");
        self.emit(LifecycleEvent::Cancelled {
            ride_id: ride_id.to_string(),
            cancelled_by: CANCELLED_BY_DRIVER.to_string(),
        });
        Ok(())
    }

    /// Removes an offer the rider already rejected.
    pub fn dismiss(&mut self, ride_id: &str) -> Result<(), AppError> {
        let offer = self.offer(ride_id)?;
        if offer.status != RideOfferStatus::RejectedByRider {
            return Err(AppError::Conflict(format!(
                "ride {ride_id} is {:?}; only rejected offers can be dismissed",
                offer.status
            )));
        }
        self.withdraw(ride_id);
        Ok(())
    }

    pub fn start_ride(&mut self) -> Result<ActiveRide, AppError> {
        let ride = self
            .active
            .as_mut()
            .ok_or_else(|| AppError::NotFound("no active ride".to_string()))?;
        if ride.phase != RidePhase::EnRoute {
            return Err(AppError::Conflict(format!(
                "ride {} already started",
                ride.ride_id
            )));
        }

        let frame = OutboundFrame::StartRide {
            ride_id: ride.ride_id.clone(),
            user_id: ride.rider_id.clone(),
        };
        if !self.sink.send_message(frame) {
            return Err(AppError::NotConnected);
        }

        ride.phase = RidePhase::InProgress;
        let ride = ride.clone();
        info!(ride_id = %ride.ride_id, "ride started");
        self.emit(LifecycleEvent::RideStarted {
            ride_id: ride.ride_id.clone(),
        });
        Ok(ride)
    }

    pub fn complete_ride(&mut self) -> Result<ActiveRide, AppError> {
        let ride = self
            .active
            .as_ref()
            .ok_or_else(|| AppError::NotFound("no active ride".to_string()))?;
        if ride.phase != RidePhase::InProgress {
            return Err(AppError::Conflict(format!(
                "ride {} has not started",
                ride.ride_id
            )));
        }

        let frame = OutboundFrame::CompleteRide {
            ride_id: ride.ride_id.clone(),
            user_id: ride.rider_id.clone(),
        };
        if !self.sink.send_message(frame) {
            return Err(AppError::NotConnected);
        }

        let Some(ride) = self.active.take() else {
            return Err(AppError::NotFound("no active ride".to_string()));
        };
        info!(ride_id = %ride.ride_id, fare = ride.fare_estimate, "ride completed");
        self.emit(LifecycleEvent::RideCompleted {
            ride_id: ride.ride_id.clone(),
        });
        Ok(ride)
    }

    /// Reports a new driver position and re-estimates every offer from it.
    /// Returns whether the server was told.
    pub fn update_location(&mut self, position: Coordinate, is_available: bool) -> Result<bool, AppError> {
        if !position.is_valid() {
            return Err(AppError::BadRequest(format!(
                "invalid position {}, {}",
                position.latitude, position.longitude
            )));
        }

        let reported = self.sink.update_location(position, is_available);
        self.set_position(position);
        Ok(reported)
    }

    /// Adopts a position without reporting it.
    pub fn set_position(&mut self, position: Coordinate) {
        if !position.is_valid() {
            warn!(?position, "ignoring invalid driver position");
            return;
        }
        self.position = Some(position);
        self.registry.refresh(&position);
    }

    pub fn expire(&mut self, expiry: Expiry) {
        let current = self
            .countdowns
            .get(&expiry.ride_id)
            .map(|countdown| countdown.token);
        if current != Some(expiry.token) {
            debug!(ride_id = %expiry.ride_id, "ignoring stale countdown");
            return;
        }
        self.countdowns.remove(&expiry.ride_id);

        let ride_id = expiry.ride_id;
        match self.registry.get(&ride_id).map(|offer| offer.status) {
            Some(status) if !status.is_terminal() => {
                self.terminate(&ride_id, RideOfferStatus::Expired);
                info!(%ride_id, "ride offer expired");
                self.emit(LifecycleEvent::Expired { ride_id });
            }
            Some(_) => self.withdraw(&ride_id),
            None => {}
        }
    }

    /// Drops every offer, countdown and the active ride.
    pub fn reset(&mut self) {
        for (_, countdown) in self.countdowns.drain() {
            countdown.handle.abort();
        }
        self.registry.clear();
        self.retired.clear();
        self.active = None;
        self.position = None;
        self.metrics.offers_active.set(0);
        self.emit(LifecycleEvent::SessionCleared);
    }

    fn offer(&self, ride_id: &str) -> Result<RideOffer, AppError> {
        self.registry
            .get(ride_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("ride {ride_id} not found")))
    }

    fn terminate(&mut self, ride_id: &str, status: RideOfferStatus) {
        self.registry.set_status(ride_id, status);
        self.cancel_countdown(ride_id);
        self.retired.insert(ride_id);
        self.registry.remove(ride_id);
        self.metrics.offers_active.set(self.registry.len() as i64);
    }

    fn withdraw(&mut self, ride_id: &str) {
        self.cancel_countdown(ride_id);
        self.retired.insert(ride_id);
        if self.registry.remove(ride_id).is_some() {
            self.metrics.offers_active.set(self.registry.len() as i64);
            debug!(%ride_id, "ride offer withdrawn");
            self.emit(LifecycleEvent::OfferWithdrawn {
                ride_id: ride_id.to_string(),
            });
        }
    }

    fn start_countdown(&mut self, ride_id: &str) {
        self.next_token += 1;
        let token = self.next_token;
        let window = self.offer_window;
        let expiry_tx = self.expiry_tx.clone();
        let expiry = Expiry {
            ride_id: ride_id.to_string(),
            token,
        };

        let handle = tokio::spawn(async move {
            sleep(window).await;
            let _ = expiry_tx.send(expiry);
        })
        .abort_handle();

        if let Some(previous) = self
            .countdowns
            .insert(ride_id.to_string(), Countdown { token, handle })
        {
            previous.handle.abort();
        }
    }

    fn cancel_countdown(&mut self, ride_id: &str) {
        if let Some(countdown) = self.countdowns.remove(ride_id) {
            countdown.handle.abort();
        }
    }

    fn emit(&self, event: LifecycleEvent) {
        self.metrics
            .lifecycle_events_total
            .with_label_values(&[event.label()])
            .inc();
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::{broadcast, mpsc};
    use tokio::time::{advance, timeout, Instant};

    use super::{Expiry, LifecycleSettings, RideLifecycleController};
    use crate::connection::FrameSink;
    use crate::error::AppError;
    use crate::models::driver::Coordinate;
    use crate::models::event::LifecycleEvent;
    use crate::models::ride::{RideOfferStatus, RidePhase};
    use crate::observability::metrics::Metrics;
    use crate::protocol::{decode, DispatchEvent, OutboundFrame};

    #[derive(Clone, Default)]
    struct RecordingSink {
        offline: Arc<AtomicBool>,
        frames: Arc<Mutex<Vec<OutboundFrame>>>,
    }

    impl RecordingSink {
        fn types(&self) -> Vec<&'static str> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .map(OutboundFrame::type_name)
                .collect()
        }
    }

    impl FrameSink for RecordingSink {
        fn send_message(&self, frame: OutboundFrame) -> bool {
            if self.offline.load(Ordering::SeqCst) {
                return false;
            }
            self.frames.lock().unwrap().push(frame);
            true
        }

        fn update_location(&self, _position: Coordinate, _is_available: bool) -> bool {
            !self.offline.load(Ordering::SeqCst)
        }
    }

    struct Harness {
        controller: RideLifecycleController<RecordingSink>,
        sink: RecordingSink,
        events: broadcast::Receiver<LifecycleEvent>,
        expiries: mpsc::UnboundedReceiver<Expiry>,
    }

    impl Harness {
        fn new() -> Self {
            let sink = RecordingSink::default();
            let (events_tx, events) = broadcast::channel(64);
            let (expiry_tx, expiries) = mpsc::unbounded_channel();
            let controller = RideLifecycleController::new(
                sink.clone(),
                LifecycleSettings::default(),
                events_tx,
                expiry_tx,
                Arc::new(Metrics::new().unwrap()),
            );
            Self {
                controller,
                sink,
                events,
                expiries,
            }
        }

        fn frame(&mut self, value: serde_json::Value) {
            let event = decode(&value.to_string()).unwrap();
            self.controller.handle_event(event);
        }

        fn offer(&mut self, ride_id: &str, rider_id: &str) {
            self.frame(json!({
                "type": "rideRequest",
                "rideId": ride_id,
                "userId": rider_id,
                "pickup": { "address": "pickup", "coordinates": { "latitude": 40.75, "longitude": -73.99 } },
                "dropoff": { "address": "dropoff", "coordinates": { "latitude": 40.70, "longitude": -74.01 } }
            }));
        }

        fn labels(&mut self) -> Vec<&'static str> {
            let mut labels = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                labels.push(event.label());
            }
            labels
        }

        fn status(&self, ride_id: &str) -> Option<RideOfferStatus> {
            self.controller.registry().get(ride_id).map(|offer| offer.status)
        }
    }

    #[tokio::test]
    async fn inbound_offer_is_presented() {
        let mut h = Harness::new();
        h.offer("ride-1", "rider-1");

        assert_eq!(h.status("ride-1"), Some(RideOfferStatus::Offered));
        assert_eq!(h.labels(), vec!["offer_presented"]);

        h.offer("ride-1", "rider-1");
        assert_eq!(h.controller.registry().len(), 1);
        assert_eq!(h.labels(), vec!["offer_updated"]);
    }

    #[tokio::test]
    async fn request_moves_offer_to_request_sent() {
        let mut h = Harness::new();
        h.offer("ride-1", "rider-1");

        let offer = h.controller.request_ride("ride-1").unwrap();
        assert_eq!(offer.status, RideOfferStatus::RequestSent);
        assert_eq!(h.sink.types(), vec!["sendRideRequest"]);

        let err = h.controller.request_ride("ride-1").unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert!(matches!(
            h.controller.request_ride("missing"),
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn request_while_offline_leaves_offer_untouched() {
        let mut h = Harness::new();
        h.offer("ride-1", "rider-1");
        h.sink.offline.store(true, Ordering::SeqCst);

        assert!(matches!(
            h.controller.request_ride("ride-1"),
            Err(AppError::NotConnected)
        ));
        assert_eq!(h.status("ride-1"), Some(RideOfferStatus::Offered));
    }

    #[tokio::test]
    async fn acceptance_removes_offer_and_starts_ride() {
        let mut h = Harness::new();
        h.offer("ride-1", "rider-1");
        h.offer("ride-2", "rider-1");
        h.offer("ride-3", "rider-2");
        h.controller.request_ride("ride-1").unwrap();
        h.labels();

        h.frame(json!({ "type": "acceptedByUser", "rideId": "ride-1", "userId": "rider-1" }));

        let remaining: Vec<String> = h
            .controller
            .registry()
            .all()
            .into_iter()
            .map(|offer| offer.ride_id)
            .collect();
        assert_eq!(remaining, vec!["ride-3"]);

        let ride = h.controller.active_ride().unwrap();
        assert_eq!(ride.ride_id, "ride-1");
        assert_eq!(ride.phase, RidePhase::EnRoute);
        assert_eq!(h.labels(), vec!["offer_withdrawn", "proceed_to_ride"]);
    }

    #[tokio::test]
    async fn second_acceptance_keeps_the_active_ride() {
        let mut h = Harness::new();
        h.offer("ride-1", "rider-1");
        h.offer("ride-2", "rider-2");
        h.controller.request_ride("ride-1").unwrap();
        h.controller.request_ride("ride-2").unwrap();
        h.frame(json!({ "type": "acceptedByUser", "rideId": "ride-1", "userId": "rider-1" }));
        h.labels();

        h.frame(json!({ "type": "acceptedByUser", "rideId": "ride-2", "userId": "rider-2" }));

        assert_eq!(h.controller.active_ride().unwrap().ride_id, "ride-1");
        assert!(h.controller.registry().is_empty());
        assert_eq!(h.labels(), vec!["cancelled"]);
        assert_eq!(
            h.sink.types(),
            vec!["sendRideRequest", "sendRideRequest", "cancelRide"]
        );
    }

    #[tokio::test]
    async fn acceptance_without_request_is_ignored() {
        let mut h = Harness::new();
        h.offer("ride-1", "rider-1");

        h.frame(json!({ "type": "acceptedByUser", "rideId": "ride-1", "userId": "rider-1" }));

        assert_eq!(h.status("ride-1"), Some(RideOfferStatus::Offered));
        assert!(h.controller.active_ride().is_none());
    }

    #[tokio::test]
    async fn rejected_offer_stays_visible_until_dismissed() {
        let mut h = Harness::new();
        h.offer("ride-1", "rider-1");
        h.controller.request_ride("ride-1").unwrap();

        h.frame(json!({ "type": "rejectedByUser", "rideId": "ride-1", "userId": "rider-1" }));
        assert_eq!(h.status("ride-1"), Some(RideOfferStatus::RejectedByRider));
        assert!(matches!(
            h.controller.request_ride("ride-1"),
            Err(AppError::Conflict(_))
        ));
        assert!(matches!(
            h.controller.cancel("ride-1"),
            Err(AppError::Conflict(_))
        ));

        h.controller.dismiss("ride-1").unwrap();
        assert!(h.controller.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_offer_expires_and_late_answers_are_ignored() {
        let mut h = Harness::new();
        h.offer("ride-1", "rider-1");
        h.controller.request_ride("ride-1").unwrap();
        h.labels();

        let expiry = h.expiries.recv().await.unwrap();
        h.controller.expire(expiry);

        assert!(h.controller.registry().is_empty());
        assert_eq!(h.labels(), vec!["expired"]);

        h.frame(json!({ "type": "acceptedByUser", "rideId": "ride-1", "userId": "rider-1" }));
        h.frame(json!({ "type": "rejectedByUser", "rideId": "ride-1", "userId": "rider-1" }));

        assert!(h.controller.registry().is_empty());
        assert!(h.controller.active_ride().is_none());
        assert!(h.labels().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_ride_is_not_offered_again() {
        let mut h = Harness::new();
        h.offer("ride-1", "rider-1");

        let expiry = h.expiries.recv().await.unwrap();
        h.controller.expire(expiry);
        h.offer("ride-1", "rider-1");

        assert!(h.controller.registry().is_empty());
        assert_eq!(h.labels(), vec!["offer_presented", "expired"]);

        let waited = timeout(Duration::from_secs(120), h.expiries.recv()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn finished_rides_are_forgotten_on_reset() {
        let mut h = Harness::new();
        h.offer("ride-1", "rider-1");
        h.controller.cancel("ride-1").unwrap();
        h.offer("ride-1", "rider-1");
        assert!(h.controller.registry().is_empty());

        h.controller.reset();
        h.labels();
        h.offer("ride-1", "rider-1");

        assert_eq!(h.status("ride-1"), Some(RideOfferStatus::Offered));
        assert_eq!(h.labels(), vec!["offer_presented"]);
    }

    #[tokio::test(start_paused = true)]
    async fn re_announcement_does_not_extend_the_countdown() {
        let mut h = Harness::new();
        let start = Instant::now();
        h.offer("ride-1", "rider-1");

        advance(Duration::from_secs(20)).await;
        h.offer("ride-1", "rider-1");

        let expiry = h.expiries.recv().await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(31));

        h.controller.expire(expiry);
        assert!(h.controller.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_transition_cancels_the_countdown() {
        let mut h = Harness::new();
        h.offer("ride-1", "rider-1");
        h.frame(json!({ "type": "rideCancelled", "rideId": "ride-1", "cancelledBy": "rider" }));

        assert!(h.controller.registry().is_empty());
        assert_eq!(h.labels(), vec!["offer_presented", "cancelled"]);

        let waited = timeout(Duration::from_secs(120), h.expiries.recv()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn driver_cancel_picks_frame_by_status() {
        let mut h = Harness::new();
        h.offer("ride-1", "rider-1");
        h.offer("ride-2", "rider-2");
        h.controller.request_ride("ride-2").unwrap();

        h.controller.cancel("ride-1").unwrap();
        h.controller.cancel("ride-2").unwrap();

        assert_eq!(
            h.sink.types(),
            vec!["sendRideRequest", "rejectRide", "cancelRide"]
        );
        assert!(h.controller.registry().is_empty());
    }

    #[tokio::test]
    async fn active_ride_runs_to_completion() {
        let mut h = Harness::new();
        assert!(matches!(h.controller.start_ride(), Err(AppError::NotFound(_))));

        h.offer("ride-1", "rider-1");
        h.controller.request_ride("ride-1").unwrap();
        h.frame(json!({ "type": "acceptedByUser", "rideId": "ride-1", "userId": "rider-1" }));

        assert!(matches!(
            h.controller.complete_ride(),
            Err(AppError::Conflict(_))
        ));

        h.frame(json!({
            "type": "userLocation",
            "userId": "rider-1",
            "rideId": "ride-1",
            "location": { "latitude": 40.751, "longitude": -73.991 }
        }));
        assert!(h.controller.active_ride().unwrap().rider_location.is_some());

        let started = h.controller.start_ride().unwrap();
        assert_eq!(started.phase, RidePhase::InProgress);
        let completed = h.controller.complete_ride().unwrap();
        assert_eq!(completed.ride_id, "ride-1");
        assert!(h.controller.active_ride().is_none());

        assert_eq!(
            h.sink.types(),
            vec!["sendRideRequest", "startRide", "completeRide"]
        );
    }

    #[tokio::test]
    async fn rider_cancelling_active_ride_clears_it() {
        let mut h = Harness::new();
        h.offer("ride-1", "rider-1");
        h.controller.request_ride("ride-1").unwrap();
        h.frame(json!({ "type": "acceptedByUser", "rideId": "ride-1", "userId": "rider-1" }));
        h.labels();

        h.frame(json!({ "type": "rideCancelled", "rideId": "ride-1", "cancelledBy": "rider" }));

        assert!(h.controller.active_ride().is_none());
        assert_eq!(h.labels(), vec!["cancelled"]);
    }

    #[tokio::test]
    async fn position_update_refreshes_estimates() {
        let mut h = Harness::new();
        h.offer("ride-1", "rider-1");
        assert_eq!(h.controller.registry().get("ride-1").unwrap().distance_miles, 0.0);

        let reported = h
            .controller
            .update_location(Coordinate::new(40.70, -73.99), true)
            .unwrap();
        assert!(reported);

        let offer = h.controller.registry().get("ride-1").unwrap();
        assert!(offer.distance_miles > 3.0);
        assert!(offer.eta_minutes > 1);
        assert!(offer.fare_estimate > 5.0);

        assert!(matches!(
            h.controller.update_location(Coordinate::new(f64::NAN, 0.0), true),
            Err(AppError::BadRequest(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_clears_offers_and_timers() {
        let mut h = Harness::new();
        h.offer("ride-1", "rider-1");
        h.offer("ride-2", "rider-2");

        h.controller.reset();

        assert!(h.controller.registry().is_empty());
        assert!(h.labels().ends_with(&["session_cleared"]));
        let waited = timeout(Duration::from_secs(120), h.expiries.recv()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn server_error_is_forwarded() {
        let mut h = Harness::new();
        h.controller.handle_event(DispatchEvent::ServerError(
            crate::protocol::inbound::ServerErrorFrame {
                message: "ride no longer available".to_string(),
            },
        ));
        assert_eq!(h.labels(), vec!["server_error"]);
    }
}
