//! Spatial index: geohash cells, their bounding boxes and 3x3 neighborhoods.
//!
//! Filtering everywhere else compares cell codes for equality; [`bounds`] is
//! only needed to draw the search area.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AppError, AppResult};
use crate::models::position::Position;

const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Longest supported code; 12 characters is already sub-centimetre.
pub const MAX_PRECISION: usize = 12;

/// A geohash code identifying a rectangular ground area.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SpatialCell(String);

impl SpatialCell {
    /// Validate an externally supplied code (e.g. a stored record's `geohash`).
    pub fn parse(code: &str) -> AppResult<Self> {
        let code = code.trim().to_ascii_lowercase();
        if code.is_empty() || code.len() > MAX_PRECISION {
            return Err(AppError::MalformedRecord(format!(
                "geohash length out of range: {:?}",
                code
            )));
        }
        if let Some(bad) = code.bytes().find(|b| char_index(*b).is_none()) {
            return Err(AppError::MalformedRecord(format!(
                "invalid geohash character {:?} in {:?}",
                bad as char, code
            )));
        }
        Ok(Self(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn precision(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for SpatialCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SpatialCell {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SpatialCell> for String {
    fn from(cell: SpatialCell) -> Self {
        cell.0
    }
}

fn char_index(c: u8) -> Option<u8> {
    BASE32.iter().position(|&b| b == c).map(|i| i as u8)
}

/// Rectangular extent of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    pub fn contains(&self, position: Position) -> bool {
        (self.min_lat..=self.max_lat).contains(&position.lat)
            && (self.min_lng..=self.max_lng).contains(&position.lng)
    }

    pub fn center(&self) -> Position {
        Position {
            lat: (self.min_lat + self.max_lat) / 2.0,
            lng: (self.min_lng + self.max_lng) / 2.0,
        }
    }

    pub fn height(&self) -> f64 {
        self.max_lat - self.min_lat
    }

    pub fn width(&self) -> f64 {
        self.max_lng - self.min_lng
    }
}

/// Encode a position into a cell of `precision` characters (clamped to 1..=12).
///
/// Bisection keeps the upper half inclusive, so the poles and the +180
/// meridian land in the top/right-most cells instead of failing.
pub fn encode(position: Position, precision: usize) -> SpatialCell {
    let precision = precision.clamp(1, MAX_PRECISION);
    let (mut lat_lo, mut lat_hi) = (-90.0_f64, 90.0_f64);
    let (mut lng_lo, mut lng_hi) = (-180.0_f64, 180.0_f64);
    let lat = position.lat.clamp(-90.0, 90.0);
    let lng = position.lng.clamp(-180.0, 180.0);

    let mut code = String::with_capacity(precision);
    let mut even = true;
    while code.len() < precision {
        let mut idx = 0u8;
        for _ in 0..5 {
            idx <<= 1;
            if even {
                let mid = (lng_lo + lng_hi) / 2.0;
                if lng >= mid {
                    idx |= 1;
                    lng_lo = mid;
                } else {
                    lng_hi = mid;
                }
            } else {
                let mid = (lat_lo + lat_hi) / 2.0;
                if lat >= mid {
                    idx |= 1;
                    lat_lo = mid;
                } else {
                    lat_hi = mid;
                }
            }
            even = !even;
        }
        code.push(BASE32[idx as usize] as char);
    }
    SpatialCell(code)
}

/// Exact bounding box of a cell.
pub fn bounds(cell: &SpatialCell) -> Bounds {
    let (mut lat_lo, mut lat_hi) = (-90.0_f64, 90.0_f64);
    let (mut lng_lo, mut lng_hi) = (-180.0_f64, 180.0_f64);
    let mut even = true;
    for c in cell.0.bytes() {
        // SpatialCell only holds validated characters.
        let idx = char_index(c).unwrap_or(0);
        for bit in (0..5).rev() {
            let set = (idx >> bit) & 1 == 1;
            if even {
                let mid = (lng_lo + lng_hi) / 2.0;
                if set {
                    lng_lo = mid;
                } else {
                    lng_hi = mid;
                }
            } else {
                let mid = (lat_lo + lat_hi) / 2.0;
                if set {
                    lat_lo = mid;
                } else {
                    lat_hi = mid;
                }
            }
            even = !even;
        }
    }
    Bounds {
        min_lat: lat_lo,
        max_lat: lat_hi,
        min_lng: lng_lo,
        max_lng: lng_hi,
    }
}

/// The cell itself followed by its compass neighbors at the same precision.
///
/// Longitude wraps across the antimeridian; latitude is clamped at the poles,
/// where the missing row collapses onto the cell's own row, so the result may
/// hold fewer than 9 distinct cells there (never fewer than 1).
pub fn neighbors(cell: &SpatialCell) -> Vec<SpatialCell> {
    let b = bounds(cell);
    let center = b.center();
    let precision = cell.precision();

    let mut out = vec![cell.clone()];
    for dlat in [1.0, 0.0, -1.0] {
        for dlng in [-1.0, 0.0, 1.0] {
            let lat = (center.lat + dlat * b.height()).clamp(-90.0, 90.0);
            let mut lng = center.lng + dlng * b.width();
            if lng > 180.0 {
                lng -= 360.0;
            } else if lng < -180.0 {
                lng += 360.0;
            }
            let next = encode(Position { lat, lng }, precision);
            if !out.contains(&next) {
                out.push(next);
            }
        }
    }
    out
}

/// A center cell plus its neighbors: the search area of one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Neighborhood {
    pub center: SpatialCell,
    pub cells: Vec<SpatialCell>,
}

impl Neighborhood {
    pub fn around(position: Position, precision: usize) -> Self {
        let center = encode(position, precision);
        let cells = neighbors(&center);
        Self { center, cells }
    }

    pub fn contains(&self, cell: &SpatialCell) -> bool {
        self.cells.contains(cell)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(lat: f64, lng: f64) -> Position {
        Position::new(lat, lng).unwrap()
    }

    fn cell(code: &str) -> SpatialCell {
        SpatialCell::parse(code).unwrap()
    }

    #[test]
    fn encode_known_vectors() {
        assert_eq!(encode(pos(57.64911, 10.40744), 11).as_str(), "u4pruydqqvj");
        assert_eq!(encode(pos(35.6809591, 139.7673068), 6).as_str(), "xn76ur");
    }

    #[test]
    fn nearby_points_share_a_cell() {
        let a = encode(pos(35.6809591, 139.7673068), 6);
        let b = encode(pos(35.6809000, 139.7672000), 6);
        assert_eq!(a, b);
    }

    #[test]
    fn bounds_contain_the_encoded_point() {
        let samples = [
            (35.6809591, 139.7673068),
            (0.0, 0.0),
            (-33.8688, 151.2093),
            (90.0, 180.0),
            (-90.0, -180.0),
            (89.9999, -179.9999),
            (-12.5, 179.99999),
        ];
        for (lat, lng) in samples {
            for precision in [1, 4, 6, 9, 12] {
                let p = pos(lat, lng);
                let b = bounds(&encode(p, precision));
                assert!(b.contains(p), "{:?} not in {:?} at {}", p, b, precision);
            }
        }
    }

    #[test]
    fn bounds_of_known_cell() {
        let b = bounds(&cell("xn76ur"));
        assert!((b.min_lat - 35.6781005859375).abs() < 1e-12);
        assert!((b.max_lat - 35.68359375).abs() < 1e-12);
        assert!((b.min_lng - 139.757080078125).abs() < 1e-12);
        assert!((b.max_lng - 139.76806640625).abs() < 1e-12);
    }

    #[test]
    fn neighbors_are_nine_and_include_origin() {
        let n = neighbors(&cell("u4pruy"));
        assert_eq!(n.len(), 9);
        assert_eq!(n[0].as_str(), "u4pruy");
        for code in [
            "u4pruz", "u4prvn", "u4prvj", "u4prvp", "u4prux", "u4pruw", "u4pruv", "u4prut",
        ] {
            assert!(n.contains(&cell(code)), "missing {}", code);
        }
    }

    #[test]
    fn neighbors_wrap_the_antimeridian() {
        let n = neighbors(&encode(pos(0.0, 179.999), 6));
        assert_eq!(n.len(), 9);
        assert!(n.contains(&cell("800000")));
        assert!(n.contains(&cell("2pbpbp")));
    }

    #[test]
    fn neighbors_collapse_at_the_poles() {
        let north = neighbors(&encode(pos(90.0, 180.0), 6));
        assert_eq!(north.len(), 6);
        assert_eq!(north[0].as_str(), "zzzzzz");

        let south = neighbors(&encode(pos(-90.0, -180.0), 6));
        assert_eq!(south.len(), 6);
        assert!(south.contains(&cell("pbpbpb")));
    }

    #[test]
    fn edge_adjacent_cell_is_in_the_neighborhood() {
        let hood = Neighborhood::around(pos(35.6809591, 139.7673068), 6);
        let east = encode(pos(35.6809591, 139.7783068), 6);
        assert_eq!(east.as_str(), "xn76ux");
        assert_ne!(east, hood.center);
        assert!(hood.contains(&east));
    }

    #[test]
    fn parse_rejects_invalid_codes() {
        assert!(SpatialCell::parse("").is_err());
        assert!(SpatialCell::parse("xn76ua").is_err());
        assert!(SpatialCell::parse("0123456789bcd").is_err());
        assert_eq!(SpatialCell::parse(" XN76UR ").unwrap().as_str(), "xn76ur");
    }
}
