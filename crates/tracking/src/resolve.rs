//! Ordered field resolvers for loosely shaped driver records.
//!
//! Records in the store come in more than one historical shape. Each resolver
//! walks a fixed precedence list and returns `None` (or the documented
//! fallback) instead of inventing a value such as `0.0` or `""`.

use serde_json::Value;

use crate::model::Coordinates;

/// Display name used when no candidate name field is set.
pub const FALLBACK_NAME: &str = "Driver";

/// Read a coordinate stored as a number or numeric string.
pub fn coordinate(value: Option<&Value>) -> Option<f64> {
    let parsed = match value? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    parsed.is_finite().then_some(parsed)
}

fn pair(object: &Value) -> Option<Coordinates> {
    let latitude = coordinate(object.get("latitude"))?;
    let longitude = coordinate(object.get("longitude"))?;
    Some(Coordinates::new(latitude, longitude))
}

/// Coordinates of a record, in order of precedence:
/// 1. nested `currentLocation.{latitude,longitude}` when both are present,
/// 2. flat `latitude` / `longitude` on the record itself.
pub fn resolve_coordinates(record: &Value) -> Option<Coordinates> {
    record
        .get("currentLocation")
        .and_then(pair)
        .or_else(|| pair(record))
}

fn text<'a>(value: Option<&'a Value>) -> Option<&'a str> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Display name of a record: `currentLocation.driverName`, `driverName`,
/// `name`, `username`, `driverUsername`, then [`FALLBACK_NAME`].
pub fn resolve_name(record: &Value) -> String {
    let nested = record.get("currentLocation").and_then(|loc| loc.get("driverName"));
    [
        nested,
        record.get("driverName"),
        record.get("name"),
        record.get("username"),
        record.get("driverUsername"),
    ]
    .into_iter()
    .find_map(text)
    .unwrap_or(FALLBACK_NAME)
    .to_string()
}

/// Optional text field, ignoring blanks.
pub fn optional_text(record: &Value, field: &str) -> Option<String> {
    text(record.get(field)).map(str::to_string)
}

/// A record counts as active when `isActive` is `true` or `status` is
/// `"active"`. Anything else, including a missing flag, is inactive.
pub fn is_active(record: &Value) -> bool {
    record.get("isActive").and_then(Value::as_bool) == Some(true)
        || record.get("status").and_then(Value::as_str) == Some("active")
}
