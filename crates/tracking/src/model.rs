//! Records shared by the store, the reporter and the map views.
//!
//! Field names follow the camelCase layout of the realtime store so the same
//! structs can be written to it and returned from the HTTP API unchanged.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Latitude/longitude pair in decimal degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// One GPS fix as stored under a driver or bus path.
///
/// `speed` is in metres per second, the unit device geolocation reports.
/// Views convert it with [`LocationSample::speed_kmh`]; nothing else in the
/// crate rescales it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy radius in metres.
    #[serde(default)]
    pub accuracy: f64,
    /// Ground speed in m/s, `0.0` when the device did not report one.
    #[serde(default)]
    pub speed: f64,
    /// Heading in degrees clockwise from true north.
    #[serde(default)]
    pub heading: f64,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl LocationSample {
    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.latitude, self.longitude)
    }

    /// Speed converted for display, `None` when the device reported none.
    pub fn speed_kmh(&self) -> Option<f64> {
        (self.speed.is_finite() && self.speed > 0.0).then(|| self.speed * 3.6)
    }
}

/// Staleness classification derived from the age of the latest sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LiveStatus {
    Live,
    Offline,
}

impl LiveStatus {
    pub fn label(self) -> &'static str {
        match self {
            LiveStatus::Live => "LIVE",
            LiveStatus::Offline => "OFFLINE",
        }
    }
}

/// Registered driver and bus metadata stored at `drivers/registered/{driverId}`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverRecord {
    #[serde(default)]
    pub driver_id: String,
    #[serde(default, alias = "driverName")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bus_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bus_photo: Option<String>,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active: Option<String>,
    /// Last location mirrored onto the record. Unparseable values read as
    /// `None` rather than failing the whole record.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_sample"
    )]
    pub current_location: Option<LocationSample>,
}

impl DriverRecord {
    /// Copy of the record safe to hand to API clients.
    pub fn redacted(&self) -> Self {
        Self {
            password: None,
            ..self.clone()
        }
    }

    pub fn identity(&self) -> DriverIdentity {
        DriverIdentity {
            driver_id: self.driver_id.clone(),
            name: self.name.clone(),
            bus_number: self.bus_number.clone(),
            phone: self.phone.clone(),
            username: self.username.clone(),
        }
    }
}

fn lenient_sample<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<LocationSample>, D::Error> {
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.and_then(|value| serde_json::from_value(value).ok()))
}

/// The subset of a driver record a reporting device needs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverIdentity {
    pub driver_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bus_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default)]
    pub username: String,
}

/// Parse a timestamp stored either as RFC 3339 text or as epoch milliseconds
/// (number or numeric string).
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|ms| ms as i64))
            .and_then(from_millis),
        Value::String(text) => parse_timestamp_str(text),
        _ => None,
    }
}

fn parse_timestamp_str(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ms) = text.parse::<i64>() {
        return from_millis(ms);
    }
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Format a timestamp the way every writer in this crate stores it.
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) mod timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_timestamp(at))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        super::parse_timestamp(&raw)
            .ok_or_else(|| de::Error::custom(format!("unrecognised timestamp {raw}")))
    }
}
