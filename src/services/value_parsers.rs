//! Value encoding fixups shared by discovery and the event pipeline
//!
//! The hub reports several properties in scaled or stringly encodings.
//! Normalization applies the same fixups regardless of which path a value
//! arrived through, so subscribers always see canonical units.

use serde_json::{json, Value};

/// Properties the hub reports in hundredths
const SCALED_BY_100: &[&str] = &["temperature", "humidity"];

/// Battery readings above this are raw millivolts instead of percent
const BATTERY_MV_THRESHOLD: i64 = 1000;

const BATTERY_MV_CEILING: i64 = 3200;
const BATTERY_MV_FLOOR: i64 = 2500;

/// Apply unit/encoding fixups to one property value
pub fn normalize_value(name: &str, value: Value) -> Value {
    if SCALED_BY_100.contains(&name) {
        if let Some(raw) = value.as_f64() {
            return json!(raw / 100.0);
        }
    }

    if let Some(text) = value.as_str() {
        match text {
            "on" | "open" => return json!(1),
            "off" | "close" => return json!(0),
            _ => {}
        }
    }

    if name == "battery" {
        if let Some(raw) = value.as_i64() {
            if raw > BATTERY_MV_THRESHOLD {
                return json!(battery_percent_from_millivolts(raw));
            }
        }
    }

    value
}

/// Rescale a millivolt battery reading to 0-100 percent
pub fn battery_percent_from_millivolts(millivolts: i64) -> i64 {
    let scaled = (millivolts.min(BATTERY_MV_CEILING) - BATTERY_MV_FLOOR) as f64 / 7.0;
    (scaled.round() as i64).clamp(0, 100)
}
