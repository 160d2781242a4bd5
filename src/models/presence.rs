//! Presence: where nearby users currently are, derived from their messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::position::Position;

/// One user's last known position. Never stored, only rebuilt from the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: String,
    pub display_name: String,
    pub position: Position,
    pub last_update_at: DateTime<Utc>,
}

impl PresenceEntry {
    pub fn color(&self) -> String {
        avatar_color(&self.user_id)
    }
}

/// Deterministic `#rrggbb` avatar colour for a user id.
///
/// A 31-multiplier hash over UTF-16 code units picks the hue; saturation
/// stays within 65..85% and lightness within 45..65% so every colour reads
/// on a map.
pub fn avatar_color(user_id: &str) -> String {
    let hash = user_id.encode_utf16().fold(0i32, |h, unit| {
        h.wrapping_shl(5).wrapping_sub(h).wrapping_add(unit as i32)
    });

    let hue = (hash % 360).unsigned_abs() as f64;
    let saturation = 65.0 + ((hash >> 8) % 20).unsigned_abs() as f64;
    let lightness = 45.0 + ((hash >> 16) % 20).unsigned_abs() as f64;

    let (r, g, b) = hsl_to_rgb(hue / 360.0, saturation / 100.0, lightness / 100.0);
    format!("#{:02x}{:02x}{:02x}", r, g, b)
}

fn hsl_to_rgb(h: f64, s: f64, l: f64) -> (u8, u8, u8) {
    if s == 0.0 {
        let v = to_byte(l);
        return (v, v, v);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        to_byte(hue_to_channel(p, q, h + 1.0 / 3.0)),
        to_byte(hue_to_channel(p, q, h)),
        to_byte(hue_to_channel(p, q, h - 1.0 / 3.0)),
    )
}

fn hue_to_channel(p: f64, q: f64, mut t: f64) -> f64 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        p + (q - p) * 6.0 * t
    } else if t < 0.5 {
        q
    } else if t < 2.0 / 3.0 {
        p + (q - p) * (2.0 / 3.0 - t) * 6.0
    } else {
        p
    }
}

fn to_byte(channel: f64) -> u8 {
    (channel * 255.0).round().clamp(0.0, 255.0) as u8
}
