//! Single-driver narrowing of the `drivers` snapshot, used by the per-bus
//! tracking page.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::{
    aggregator::{DEFAULT_STALE_AFTER, classify},
    model::{Coordinates, LiveStatus, LocationSample, parse_timestamp},
    resolve::{FALLBACK_NAME, optional_text, resolve_coordinates, resolve_name},
};

/// What the tracking page knows about one driver at a point in time.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleDriverView {
    pub driver_id: String,
    pub name: String,
    /// `false` when neither a record nor a location exists for the id.
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bus_number: Option<String>,
    /// `None` means "location unavailable"; never substituted with zeros.
    pub coordinates: Option<Coordinates>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<LocationSample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_status: Option<LiveStatus>,
}

/// Build the record the tracker resolves against: the registered record with
/// `currentLocation` replaced by the live write at `locations/{id}`.
///
/// The live write only replaces the nested location when it carries
/// coordinates. A bare offline marker (`isOnline`/`lastSeen`) keeps the
/// record's own location and just annotates it.
pub fn narrow(snapshot: Option<&Value>, driver_id: &str) -> Option<Value> {
    let drivers = snapshot?;
    let record = drivers.get("registered").and_then(|r| r.get(driver_id));
    let live = drivers
        .get("locations")
        .and_then(|l| l.get(driver_id))
        .filter(|live| live.is_object());

    match (record, live) {
        (None, None) => None,
        (Some(record), None) => Some(record.clone()),
        (record, Some(live)) => {
            let mut merged = record
                .filter(|record| record.is_object())
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default()));
            if let Value::Object(map) = &mut merged {
                let keep_nested = resolve_coordinates(live).is_none()
                    && map.get("currentLocation").is_some_and(Value::is_object);
                if keep_nested {
                    if let Some(nested) = map.get_mut("currentLocation") {
                        copy_presence(live, nested);
                    }
                } else {
                    map.insert("currentLocation".into(), live.clone());
                }
            }
            Some(merged)
        }
    }
}

fn copy_presence(live: &Value, nested: &mut Value) {
    let Value::Object(nested) = nested else {
        return;
    };
    for key in ["isOnline", "lastSeen"] {
        if let Some(value) = live.get(key) {
            nested.insert(key.into(), value.clone());
        }
    }
}

/// Resolve a (possibly absent) record into a view.
pub fn resolve(
    driver_id: &str,
    record: Option<&Value>,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> SingleDriverView {
    let Some(record) = record else {
        return SingleDriverView {
            driver_id: driver_id.to_string(),
            name: FALLBACK_NAME.to_string(),
            found: false,
            bus_number: None,
            coordinates: None,
            location: None,
            last_update: None,
            live_status: None,
        };
    };

    let location = record
        .get("currentLocation")
        .and_then(|loc| serde_json::from_value::<LocationSample>(loc.clone()).ok());
    let last_update = location
        .as_ref()
        .map(|sample| sample.timestamp.timestamp_millis())
        .or_else(|| {
            record
                .get("lastActive")
                .and_then(parse_timestamp)
                .map(|at| at.timestamp_millis())
        });
    let coordinates = resolve_coordinates(record);
    let bus_number = optional_text(record, "busNumber").or_else(|| {
        record
            .get("currentLocation")
            .and_then(|loc| optional_text(loc, "busNumber"))
    });

    SingleDriverView {
        driver_id: driver_id.to_string(),
        name: resolve_name(record),
        found: true,
        bus_number,
        coordinates,
        location,
        last_update,
        live_status: coordinates
            .and(last_update)
            .map(|ms| classify(now, ms, stale_after)),
    }
}

/// Result of feeding one snapshot through a [`SingleDriverTracker`].
#[derive(Clone, Debug, PartialEq)]
pub struct TrackerUpdate {
    pub view: SingleDriverView,
    /// Set whenever the coordinate pair changed; the map keeps its zoom.
    pub recenter: Option<Coordinates>,
}

/// Follows one driver for the lifetime of a tracking page subscription.
#[derive(Clone, Debug)]
pub struct SingleDriverTracker {
    driver_id: String,
    stale_after: Duration,
    last: Option<Coordinates>,
}

impl SingleDriverTracker {
    pub fn new(driver_id: impl Into<String>) -> Self {
        Self::with_stale_after(driver_id, DEFAULT_STALE_AFTER)
    }

    pub fn with_stale_after(driver_id: impl Into<String>, stale_after: Duration) -> Self {
        Self {
            driver_id: driver_id.into(),
            stale_after,
            last: None,
        }
    }

    pub fn driver_id(&self) -> &str {
        &self.driver_id
    }

    /// Apply a full `drivers` snapshot.
    pub fn apply(&mut self, snapshot: Option<&Value>, now: DateTime<Utc>) -> TrackerUpdate {
        let record = narrow(snapshot, &self.driver_id);
        let view = resolve(&self.driver_id, record.as_ref(), now, self.stale_after);
        let recenter = view.coordinates.filter(|coords| self.last != Some(*coords));
        self.last = view.coordinates;
        TrackerUpdate { view, recenter }
    }
}
