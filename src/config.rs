use std::env;
use std::time::Duration;

use crate::connection::ReconnectPolicy;
use crate::error::AppError;
use crate::geo::{Pricing, DEFAULT_AVERAGE_SPEED_MPH, DEFAULT_BASE_FARE, DEFAULT_PER_MILE_RATE};
use crate::models::driver::Coordinate;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub dispatch_url: String,
    pub driver_id: String,
    pub initial_position: Option<Coordinate>,
    pub offer_window_secs: u64,
    pub pricing: Pricing,
    pub event_buffer_size: usize,
    pub reconnect: ReconnectPolicy,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let initial_position = match (
            parse_optional::<f64>("DRIVER_LATITUDE")?,
            parse_optional::<f64>("DRIVER_LONGITUDE")?,
        ) {
            (Some(latitude), Some(longitude)) => {
                let position = Coordinate::new(latitude, longitude);
                if !position.is_valid() {
                    return Err(AppError::Internal(format!(
                        "invalid DRIVER_LATITUDE/DRIVER_LONGITUDE: {latitude}, {longitude}"
                    )));
                }
                Some(position)
            }
            (None, None) => None,
            _ => {
                return Err(AppError::Internal(
                    "DRIVER_LATITUDE and DRIVER_LONGITUDE must be set together".to_string(),
                ));
            }
        };

        let reconnect = ReconnectPolicy {
            enabled: parse_or_default("RECONNECT_ENABLED", false)?,
            initial_delay: Duration::from_millis(parse_or_default("RECONNECT_INITIAL_MS", 500)?),
            max_delay: Duration::from_millis(parse_or_default("RECONNECT_MAX_MS", 30_000)?),
            max_attempts: parse_or_default("RECONNECT_MAX_ATTEMPTS", 10)?,
        };

        let pricing = Pricing {
            average_speed_mph: parse_or_default("AVERAGE_SPEED_MPH", DEFAULT_AVERAGE_SPEED_MPH)?,
            base_fare: parse_or_default("BASE_FARE", DEFAULT_BASE_FARE)?,
            per_mile: parse_or_default("PER_MILE_RATE", DEFAULT_PER_MILE_RATE)?,
        };
        validate_pricing(&pricing)?;

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            dispatch_url: env::var("DISPATCH_URL")
                .unwrap_or_else(|_| "ws://127.0.0.1:8080/ws".to_string()),
            driver_id: env::var("DRIVER_ID").unwrap_or_else(|_| "driver-1".to_string()),
            initial_position,
            offer_window_secs: parse_or_default("OFFER_WINDOW_SECS", 30)?,
            pricing,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            reconnect,
        })
    }
}

/// Rates must be finite and non-negative; speed must also be positive.
fn validate_pricing(pricing: &Pricing) -> Result<(), AppError> {
    let rates = [
        ("BASE_FARE", pricing.base_fare),
        ("PER_MILE_RATE", pricing.per_mile),
    ];
    for (key, value) in rates {
        if !value.is_finite() || value < 0.0 {
            return Err(AppError::Internal(format!("invalid {key}: {value}")));
        }
    }

    if !pricing.average_speed_mph.is_finite() || pricing.average_speed_mph <= 0.0 {
        return Err(AppError::Internal(format!(
            "invalid AVERAGE_SPEED_MPH: {}",
            pricing.average_speed_mph
        )));
    }
    Ok(())
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_optional(key)?.unwrap_or(default))
}

fn parse_optional<T>(key: &str) -> Result<Option<T>, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(None),
    }
}
