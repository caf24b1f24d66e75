//! Derives the active-driver view from a full `drivers` snapshot.
//!
//! [`aggregate`] is a pure function of the snapshot and the current time and
//! is re-run on every store notification. [`LiveAggregator`] wraps it with the
//! one piece of state the live map needs: whether it has centred yet.

use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::{
    model::{Coordinates, LiveStatus, LocationSample},
    resolve::{is_active, optional_text, resolve_name},
};

/// Samples older than this are shown as OFFLINE.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(5 * 60);

/// Child keys of `drivers` that are layout containers, not driver ids.
const CONTAINER_KEYS: [&str; 3] = ["registered", "usernames", "locations"];

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveDriver {
    pub driver_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bus_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub location: LocationSample,
    /// Epoch milliseconds of the selected sample.
    pub last_update: i64,
    pub live_status: LiveStatus,
}

/// Active drivers keyed by id, iterated in ascending id order.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct AggregatedView {
    drivers: BTreeMap<String, ActiveDriver>,
}

impl AggregatedView {
    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn get(&self, driver_id: &str) -> Option<&ActiveDriver> {
        self.drivers.get(driver_id)
    }

    pub fn first(&self) -> Option<&ActiveDriver> {
        self.drivers.values().next()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActiveDriver> {
        self.drivers.values()
    }

    pub fn live_count(&self) -> usize {
        self.iter()
            .filter(|driver| driver.live_status == LiveStatus::Live)
            .count()
    }

    fn insert(&mut self, driver: ActiveDriver) {
        self.drivers.insert(driver.driver_id.clone(), driver);
    }
}

/// LIVE while the sample is younger than `stale_after`. A sample exactly
/// `stale_after` old is OFFLINE; samples from the future count as LIVE.
pub fn classify(now: DateTime<Utc>, last_update_ms: i64, stale_after: Duration) -> LiveStatus {
    let age = now.timestamp_millis().saturating_sub(last_update_ms);
    let threshold = i64::try_from(stale_after.as_millis()).unwrap_or(i64::MAX);
    if age < threshold {
        LiveStatus::Live
    } else {
        LiveStatus::Offline
    }
}

/// Recompute the view from a `drivers` subtree snapshot.
///
/// Registered records (`registered/{id}`) and legacy entries
/// (`{id}/info` + `{id}/locations`) are both understood. A driver appears only
/// when active and when at least one location sample can be found for it.
pub fn aggregate(
    snapshot: Option<&Value>,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> AggregatedView {
    let mut view = AggregatedView::default();
    let Some(Value::Object(drivers)) = snapshot else {
        return view;
    };
    let registered = drivers.get("registered").and_then(Value::as_object);
    let live = drivers.get("locations").and_then(Value::as_object);
    let live_for = |driver_id: &str| live.and_then(|locations| locations.get(driver_id));

    for (driver_id, record) in registered.into_iter().flatten() {
        if !is_active(record) {
            continue;
        }
        let sources = [record.get("currentLocation"), live_for(driver_id)];
        if let Some((key, sample)) = latest_sample(sources.into_iter().flatten()) {
            view.insert(active_driver(driver_id, record, key, sample, now, stale_after));
        }
    }

    for (driver_id, entry) in legacy_entries(drivers) {
        if registered.is_some_and(|records| records.contains_key(driver_id)) {
            continue;
        }
        let Some(info) = entry.get("info") else {
            continue;
        };
        if !is_active(info) {
            continue;
        }
        let sources = [entry.get("locations"), live_for(driver_id)];
        if let Some((key, sample)) = latest_sample(sources.into_iter().flatten()) {
            view.insert(active_driver(driver_id, info, key, sample, now, stale_after));
        }
    }

    view
}

fn legacy_entries(drivers: &Map<String, Value>) -> impl Iterator<Item = (&String, &Value)> {
    drivers
        .iter()
        .filter(|(key, _)| !CONTAINER_KEYS.contains(&key.as_str()))
}

fn active_driver(
    driver_id: &str,
    record: &Value,
    last_update: i64,
    location: LocationSample,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> ActiveDriver {
    ActiveDriver {
        driver_id: driver_id.to_string(),
        name: resolve_name(record),
        bus_number: optional_text(record, "busNumber"),
        route: optional_text(record, "route"),
        phone: optional_text(record, "phone"),
        location,
        last_update,
        live_status: classify(now, last_update, stale_after),
    }
}

/// Pick the sample with the greatest timestamp key across all sources.
///
/// A source is either one sample (it has a `latitude` field; its key is its
/// own timestamp) or a collection keyed by epoch milliseconds. Keys that are
/// not integers and entries that do not parse as samples are skipped.
fn latest_sample<'a>(sources: impl Iterator<Item = &'a Value>) -> Option<(i64, LocationSample)> {
    sources
        .flat_map(|source| -> Vec<(i64, LocationSample)> {
            if source.get("latitude").is_some() {
                return sample_at(source, None)
                    .map(|sample| (sample.timestamp.timestamp_millis(), sample))
                    .into_iter()
                    .collect();
            }
            source
                .as_object()
                .into_iter()
                .flatten()
                .filter_map(|(key, entry)| {
                    let key = key.parse::<i64>().ok()?;
                    sample_at(entry, Some(key)).map(|sample| (key, sample))
                })
                .collect()
        })
        .max_by_key(|(key, _)| *key)
}

/// Parse one sample; entries of a keyed collection may omit their own
/// timestamp, in which case the key supplies it.
fn sample_at(entry: &Value, key: Option<i64>) -> Option<LocationSample> {
    let mut entry = entry.clone();
    let object = entry.as_object_mut()?;
    if let Some(key) = key {
        object.entry("timestamp").or_insert(Value::from(key));
    }
    serde_json::from_value(entry).ok()
}

/// Result of feeding one snapshot through a [`LiveAggregator`].
#[derive(Clone, Debug, PartialEq)]
pub struct AggregatorUpdate {
    pub view: AggregatedView,
    /// Set exactly once per aggregator: on the first non-empty view.
    pub recenter: Option<Coordinates>,
}

/// Stateful wrapper used by a live map for the lifetime of its subscription.
#[derive(Clone, Debug)]
pub struct LiveAggregator {
    stale_after: Duration,
    has_centered_once: bool,
}

impl Default for LiveAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_AFTER)
    }
}

impl LiveAggregator {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            stale_after,
            has_centered_once: false,
        }
    }

    /// Aggregator for a map that was already centred by an earlier
    /// connection; it never recenters.
    pub fn resumed(stale_after: Duration) -> Self {
        Self {
            stale_after,
            has_centered_once: true,
        }
    }

    pub fn has_centered_once(&self) -> bool {
        self.has_centered_once
    }

    pub fn apply(&mut self, snapshot: Option<&Value>, now: DateTime<Utc>) -> AggregatorUpdate {
        let view = aggregate(snapshot, now, self.stale_after);
        let recenter = if self.has_centered_once {
            None
        } else {
            view.first().map(|driver| driver.location.coordinates())
        };
        if recenter.is_some() {
            self.has_centered_once = true;
        }
        AggregatorUpdate { view, recenter }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    const T0: i64 = 1_709_280_000_000;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn sample(lat: f64, lng: f64, ms: i64) -> Value {
        json!({"latitude": lat, "longitude": lng, "accuracy": 8.0, "timestamp": ms})
    }

    #[test]
    fn selects_greatest_timestamp_key() {
        let snapshot = json!({
            "D1": {
                "info": {"name": "Asha", "status": "active"},
                "locations": {
                    "100": {"latitude": 1.0, "longitude": 1.0},
                    "300": {"latitude": 3.0, "longitude": 3.0},
                    "200": {"latitude": 2.0, "longitude": 2.0},
                    "lastSeen": "ignored"
                }
            }
        });
        let view = aggregate(Some(&snapshot), at(400), DEFAULT_STALE_AFTER);
        let driver = view.get("D1").unwrap();
        assert_eq!(driver.last_update, 300);
        assert_eq!(driver.location.latitude, 3.0);
        assert_eq!(driver.name, "Asha");
    }

    #[test]
    fn inactive_or_unflagged_drivers_are_excluded() {
        let snapshot = json!({
            "registered": {
                "D1": {"name": "Off", "isActive": false},
                "D2": {"name": "Unflagged"},
                "D3": {"name": "On", "isActive": true}
            },
            "locations": {
                "D1": sample(1.0, 1.0, T0),
                "D2": sample(2.0, 2.0, T0),
                "D3": sample(3.0, 3.0, T0)
            }
        });
        let view = aggregate(Some(&snapshot), at(T0), DEFAULT_STALE_AFTER);
        assert_eq!(view.len(), 1);
        assert!(view.get("D3").is_some());
    }

    #[test]
    fn active_driver_without_location_is_excluded() {
        let snapshot = json!({
            "registered": {"D1": {"name": "A", "isActive": true}},
            "locations": {"D1": {"isOnline": false, "lastSeen": "2024-03-01T08:00:00Z"}}
        });
        assert!(aggregate(Some(&snapshot), at(T0), DEFAULT_STALE_AFTER).is_empty());
    }

    #[test]
    fn empty_or_absent_snapshot_gives_empty_view() {
        assert!(aggregate(None, at(T0), DEFAULT_STALE_AFTER).is_empty());
        assert!(aggregate(Some(&json!({})), at(T0), DEFAULT_STALE_AFTER).is_empty());
    }

    #[test]
    fn staleness_boundary() {
        let minute = 60_000;
        let now = at(T0 + 5 * minute);
        assert_eq!(classify(now, T0 + 1_000, DEFAULT_STALE_AFTER), LiveStatus::Live);
        assert_eq!(classify(now, T0 - 1_000, DEFAULT_STALE_AFTER), LiveStatus::Offline);
        assert_eq!(classify(now, T0, DEFAULT_STALE_AFTER), LiveStatus::Offline);
        assert_eq!(classify(now, T0 + 10 * minute, DEFAULT_STALE_AFTER), LiveStatus::Live);
    }

    #[test]
    fn stale_drivers_stay_in_view_as_offline() {
        let snapshot = json!({
            "registered": {"D1": {"name": "A", "isActive": true}},
            "locations": {"D1": sample(1.0, 1.0, T0)}
        });
        let view = aggregate(Some(&snapshot), at(T0 + 3_600_000), DEFAULT_STALE_AFTER);
        assert_eq!(view.get("D1").unwrap().live_status, LiveStatus::Offline);
        assert_eq!(view.live_count(), 0);
    }

    #[test]
    fn later_write_supersedes_earlier() {
        let t1 = T0;
        let t2 = T0 + 10_000;
        let mut snapshot = json!({
            "registered": {"D1": {"name": "A", "busNumber": "KA-01", "isActive": true}},
            "locations": {"D1": sample(12.97, 77.59, t1)}
        });
        let first = aggregate(Some(&snapshot), at(t1 + 1_000), DEFAULT_STALE_AFTER);
        let driver = first.get("D1").unwrap();
        assert_eq!(driver.live_status, LiveStatus::Live);
        assert_eq!(driver.location.coordinates(), Coordinates::new(12.97, 77.59));

        snapshot["locations"]["D1"] = sample(12.98, 77.60, t2);
        let second = aggregate(Some(&snapshot), at(t2 + 1_000), DEFAULT_STALE_AFTER);
        let driver = second.get("D1").unwrap();
        assert_eq!(driver.location.coordinates(), Coordinates::new(12.98, 77.60));
        assert_eq!(driver.last_update, t2);
        assert_eq!(driver.bus_number.as_deref(), Some("KA-01"));
    }

    #[test]
    fn live_write_beats_older_nested_location() {
        let snapshot = json!({
            "registered": {"D1": {"isActive": true, "currentLocation": sample(1.0, 1.0, T0)}},
            "locations": {"D1": sample(2.0, 2.0, T0 + 1)}
        });
        let view = aggregate(Some(&snapshot), at(T0), DEFAULT_STALE_AFTER);
        assert_eq!(view.get("D1").unwrap().location.latitude, 2.0);
    }

    #[test]
    fn recenters_only_on_first_non_empty_view() {
        let mut aggregator = LiveAggregator::default();
        assert_eq!(aggregator.apply(None, at(T0)).recenter, None);
        assert!(!aggregator.has_centered_once());

        let mut snapshot = json!({
            "registered": {
                "B": {"isActive": true},
                "A": {"isActive": true}
            },
            "locations": {"A": sample(1.0, 2.0, T0), "B": sample(5.0, 6.0, T0)}
        });
        let first = aggregator.apply(Some(&snapshot), at(T0));
        assert_eq!(first.recenter, Some(Coordinates::new(1.0, 2.0)));

        snapshot["locations"]["A"] = sample(3.0, 4.0, T0 + 1);
        let second = aggregator.apply(Some(&snapshot), at(T0 + 1));
        assert_eq!(second.recenter, None);
        assert_eq!(second.view.len(), 2);

        let third = aggregator.apply(None, at(T0 + 2));
        assert_eq!(third.recenter, None);
        assert!(third.view.is_empty());
    }

    #[test]
    fn resumed_aggregator_never_recenters() {
        let snapshot = json!({
            "registered": {"A": {"isActive": true}},
            "locations": {"A": sample(1.0, 2.0, T0)}
        });
        let mut aggregator = LiveAggregator::resumed(DEFAULT_STALE_AFTER);
        let update = aggregator.apply(Some(&snapshot), at(T0));
        assert_eq!(update.recenter, None);
        assert_eq!(update.view.len(), 1);
    }
}
