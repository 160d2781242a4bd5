//! Geographic positions and the initial-position source.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{AppError, AppResult};

/// Used when the query string carries no usable coordinates (Tokyo Station).
pub const DEFAULT_POSITION: Position = Position {
    lat: 35.6809591,
    lng: 139.7673068,
};

/// A WGS84 coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lng: f64,
}

impl Position {
    /// Build a position, rejecting non-finite or out-of-range coordinates.
    pub fn new(lat: f64, lng: f64) -> AppResult<Self> {
        let position = Self { lat, lng };
        if position.is_valid() {
            Ok(position)
        } else {
            Err(AppError::InvalidPosition(format!("({}, {})", lat, lng)))
        }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    /// Parse the `lat` / `lng` pair out of query parameters.
    pub fn from_query(params: &HashMap<String, String>) -> AppResult<Self> {
        let lat = parse_coordinate(params, "lat")?;
        let lng = parse_coordinate(params, "lng")?;
        Self::new(lat, lng)
    }
}

fn parse_coordinate(params: &HashMap<String, String>, key: &str) -> AppResult<f64> {
    let raw = params
        .get(key)
        .ok_or_else(|| AppError::InvalidPosition(format!("missing {}", key)))?;
    raw.trim()
        .parse::<f64>()
        .map_err(|_| AppError::InvalidPosition(format!("{} is not a number: {}", key, raw)))
}

/// Initial position for a new session: the query's `lat`/`lng` when both are
/// present and valid, otherwise [`DEFAULT_POSITION`].
pub fn resolve_initial_position(params: &HashMap<String, String>) -> Position {
    match Position::from_query(params) {
        Ok(position) => position,
        Err(e) => {
            tracing::debug!(error = %e, "falling back to default position");
            DEFAULT_POSITION
        }
    }
}

/// Query string that reopens the map at `position` (used for share links).
pub fn share_query(position: Position) -> String {
    format!("lat={}&lng={}", position.lat, position.lng)
}
