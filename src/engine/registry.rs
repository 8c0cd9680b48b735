use std::collections::HashMap;

use chrono::Utc;

use crate::geo::{OfferEstimate, Pricing};
use crate::models::driver::Coordinate;
use crate::models::ride::{RideOffer, RideOfferStatus, Waypoint};

/// Whether `upsert` created a new offer or refreshed a known one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Created,
    Updated,
}

/// Authoritative set of ride offers for the session, in arrival order.
#[derive(Debug, Default)]
pub struct RideRequestRegistry {
    offers: HashMap<String, RideOffer>,
    order: Vec<String>,
    pricing: Pricing,
}

impl RideRequestRegistry {
    pub fn new(pricing: Pricing) -> Self {
        Self {
            offers: HashMap::new(),
            order: Vec::new(),
            pricing,
        }
    }

    pub fn upsert(
        &mut self,
        ride_id: &str,
        rider_id: &str,
        pickup: Waypoint,
        dropoff: Waypoint,
        driver_position: Option<&Coordinate>,
    ) -> (RideOffer, Upsert) {
        let estimate = OfferEstimate::compute(driver_position, &pickup.coordinates, &self.pricing);

        if let Some(offer) = self.offers.get_mut(ride_id) {
            offer.rider_id = rider_id.to_string();
            offer.pickup = pickup;
            offer.dropoff = dropoff;
            apply(offer, &estimate);
            return (offer.clone(), Upsert::Updated);
        }

        let offer = RideOffer {
            ride_id: ride_id.to_string(),
            rider_id: rider_id.to_string(),
            pickup,
            dropoff,
            distance_miles: estimate.distance_miles,
            eta_minutes: estimate.eta_minutes,
            fare_estimate: estimate.fare_estimate,
            received_at: Utc::now(),
            status: RideOfferStatus::Offered,
        };

        self.order.push(offer.ride_id.clone());
        self.offers.insert(offer.ride_id.clone(), offer.clone());
        (offer, Upsert::Created)
    }

    /// Recomputes every offer's estimate from one driver-position snapshot.
    pub fn refresh(&mut self, driver_position: &Coordinate) {
        for offer in self.offers.values_mut() {
            let estimate =
                OfferEstimate::compute(Some(driver_position), &offer.pickup.coordinates, &self.pricing);
            apply(offer, &estimate);
        }
    }

    pub fn set_status(&mut self, ride_id: &str, status: RideOfferStatus) -> Option<RideOffer> {
        let offer = self.offers.get_mut(ride_id)?;
        offer.status = status;
        Some(offer.clone())
    }

    pub fn remove(&mut self, ride_id: &str) -> Option<RideOffer> {
        let offer = self.offers.remove(ride_id)?;
        self.order.retain(|id| id != ride_id);
        Some(offer)
    }

    pub fn get(&self, ride_id: &str) -> Option<&RideOffer> {
        self.offers.get(ride_id)
    }

    pub fn all(&self) -> Vec<RideOffer> {
        self.order
            .iter()
            .filter_map(|id| self.offers.get(id).cloned())
            .collect()
    }

    /// Ride ids of the rider's other offers.
    pub fn rides_for_rider(&self, rider_id: &str, except: &str) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| id.as_str() != except)
            .filter(|id| {
                self.offers
                    .get(id.as_str())
                    .is_some_and(|offer| offer.rider_id == rider_id)
            })
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.offers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }

    pub fn clear(&mut self) {
        self.offers.clear();
        self.order.clear();
    }
}

fn apply(offer: &mut RideOffer, estimate: &OfferEstimate) {
    offer.distance_miles = estimate.distance_miles;
    offer.eta_minutes = estimate.eta_minutes;
    offer.fare_estimate = estimate.fare_estimate;
}
