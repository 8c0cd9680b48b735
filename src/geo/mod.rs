use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::driver::Coordinate;

const EARTH_RADIUS_MILES: f64 = 3_958.8;

pub const DEFAULT_AVERAGE_SPEED_MPH: f64 = 30.0;
pub const DEFAULT_BASE_FARE: f64 = 5.0;
pub const DEFAULT_PER_MILE_RATE: f64 = 2.0;

/// Great-circle distance in miles. Invalid input yields 0, which callers
/// must read as "unknown", not "co-located".
pub fn distance_miles(a: &Coordinate, b: &Coordinate) -> f64 {
    if !a.is_valid() || !b.is_valid() {
        warn!(?a, ?b, "invalid coordinate in distance calculation");
        return 0.0;
    }

    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let delta_lat = (b.latitude - a.latitude).to_radians();
    let delta_lng = (b.longitude - a.longitude).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lng * sin_lng;
    let central_angle = 2.0 * haversine.sqrt().min(1.0).asin();

    EARTH_RADIUS_MILES * central_angle
}

/// Minutes to cover `distance_miles`, never below 1.
pub fn eta_minutes(distance_miles: f64, average_speed_mph: f64) -> u32 {
    if !distance_miles.is_finite() || distance_miles < 0.0 {
        warn!(distance_miles, "invalid distance for eta");
        return 1;
    }
    if !average_speed_mph.is_finite() || average_speed_mph <= 0.0 {
        warn!(average_speed_mph, "invalid average speed for eta");
        return 1;
    }

    let minutes = (distance_miles / average_speed_mph * 60.0).ceil();
    (minutes as u32).max(1)
}

/// Linear fare in dollars. Rounding is left to whoever displays it.
pub fn fare(distance_miles: f64, base_fare: f64, per_mile: f64) -> f64 {
    let distance = if distance_miles.is_finite() && distance_miles >= 0.0 {
        distance_miles
    } else {
        warn!(distance_miles, "invalid distance for fare");
        0.0
    };

    let total = base_fare + distance * per_mile;
    if !total.is_finite() {
        warn!(base_fare, per_mile, "invalid pricing for fare");
        return 0.0;
    }
    total
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub average_speed_mph: f64,
    pub base_fare: f64,
    pub per_mile: f64,
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            average_speed_mph: DEFAULT_AVERAGE_SPEED_MPH,
            base_fare: DEFAULT_BASE_FARE,
            per_mile: DEFAULT_PER_MILE_RATE,
        }
    }
}

/// Distance, ETA and fare computed from one driver-position snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OfferEstimate {
    pub distance_miles: f64,
    pub eta_minutes: u32,
    pub fare_estimate: f64,
}

impl OfferEstimate {
    pub fn compute(driver: Option<&Coordinate>, pickup: &Coordinate, pricing: &Pricing) -> Self {
        let distance = match driver {
            Some(position) => distance_miles(position, pickup),
            None => {
                debug!("driver position unknown; estimating from zero distance");
                0.0
            }
        };

        Self {
            distance_miles: distance,
            eta_minutes: eta_minutes(distance, pricing.average_speed_mph),
            fare_estimate: fare(distance, pricing.base_fare, pricing.per_mile),
        }
    }
}
