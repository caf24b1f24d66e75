//! Turns aggregated views into map scenes and drives a [`MapWidget`].
//!
//! The presenter owns no map state of its own. Everything a page renders
//! (center, zoom, marker positions and popup text) is computed here so the
//! browser side stays a thin renderer.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    aggregator::{ActiveDriver, AggregatedView, AggregatorUpdate},
    model::{Coordinates, LiveStatus},
    tracker::{SingleDriverView, TrackerUpdate},
};

pub const DEFAULT_CENTER: Coordinates = Coordinates {
    latitude: 12.9716,
    longitude: 77.5946,
};
pub const DEFAULT_LIVE_ZOOM: u8 = 13;
pub const DEFAULT_TRACK_ZOOM: u8 = 15;

/// Text shown in a marker popup.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PopupContent {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bus: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    pub location: String,
    pub speed: String,
    pub last_update: String,
    pub accuracy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<LiveStatus>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Marker {
    pub id: String,
    pub position: Coordinates,
    pub popup: PopupContent,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MapScene {
    pub center: Coordinates,
    pub zoom: u8,
    pub markers: Vec<Marker>,
}

/// Rendering surface for a map page.
pub trait MapWidget {
    /// Replace every marker. `center` and `zoom` only apply when the widget
    /// has not been shown yet; later calls keep the user's viewport.
    fn render(&mut self, center: Coordinates, zoom: u8, markers: &[Marker]);

    /// Move the viewport. `None` keeps the current zoom.
    fn set_view(&mut self, position: Coordinates, zoom: Option<u8>);
}

/// Serializable form of a [`MapWidget`] call.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum MapCommand {
    Render {
        center: Coordinates,
        zoom: u8,
        markers: Vec<Marker>,
    },
    SetView {
        position: Coordinates,
        #[serde(skip_serializing_if = "Option::is_none")]
        zoom: Option<u8>,
    },
}

/// Widget that records commands for a remote renderer.
#[derive(Debug, Default)]
pub struct CommandBuffer {
    commands: Vec<MapCommand>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&mut self) -> Vec<MapCommand> {
        std::mem::take(&mut self.commands)
    }
}

impl MapWidget for CommandBuffer {
    fn render(&mut self, center: Coordinates, zoom: u8, markers: &[Marker]) {
        self.commands.push(MapCommand::Render {
            center,
            zoom,
            markers: markers.to_vec(),
        });
    }

    fn set_view(&mut self, position: Coordinates, zoom: Option<u8>) {
        self.commands.push(MapCommand::SetView { position, zoom });
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MapPresenter {
    pub default_center: Coordinates,
    pub live_zoom: u8,
    pub track_zoom: u8,
}

impl Default for MapPresenter {
    fn default() -> Self {
        Self {
            default_center: DEFAULT_CENTER,
            live_zoom: DEFAULT_LIVE_ZOOM,
            track_zoom: DEFAULT_TRACK_ZOOM,
        }
    }
}

impl MapPresenter {
    pub fn live_scene(&self, view: &AggregatedView, now: DateTime<Utc>) -> MapScene {
        let center = view
            .first()
            .map(|driver| driver.location.coordinates())
            .unwrap_or(self.default_center);
        MapScene {
            center,
            zoom: self.live_zoom,
            markers: view.iter().map(|driver| live_marker(driver, now)).collect(),
        }
    }

    pub fn driver_scene(&self, view: &SingleDriverView, now: DateTime<Utc>) -> MapScene {
        let markers = view
            .coordinates
            .map(|position| vec![driver_marker(view, position, now)])
            .unwrap_or_default();
        MapScene {
            center: view.coordinates.unwrap_or(self.default_center),
            zoom: self.track_zoom,
            markers,
        }
    }

    /// Render the live map and perform its one-time recenter.
    pub fn present_live(
        &self,
        widget: &mut dyn MapWidget,
        update: &AggregatorUpdate,
        now: DateTime<Utc>,
    ) {
        let scene = self.live_scene(&update.view, now);
        widget.render(scene.center, scene.zoom, &scene.markers);
        if let Some(position) = update.recenter {
            widget.set_view(position, Some(self.live_zoom));
        }
    }

    /// Render the tracking map, following the driver without changing zoom.
    pub fn present_driver(
        &self,
        widget: &mut dyn MapWidget,
        update: &TrackerUpdate,
        now: DateTime<Utc>,
    ) {
        let scene = self.driver_scene(&update.view, now);
        widget.render(scene.center, scene.zoom, &scene.markers);
        if let Some(position) = update.recenter {
            widget.set_view(position, None);
        }
    }
}

fn live_marker(driver: &ActiveDriver, now: DateTime<Utc>) -> Marker {
    let location = &driver.location;
    Marker {
        id: driver.driver_id.clone(),
        position: location.coordinates(),
        popup: PopupContent {
            title: format!("{} ({})", driver.name, driver.driver_id),
            bus: driver.bus_number.clone(),
            route: driver.route.clone(),
            location: format_position(location.coordinates()),
            speed: format_speed(location.speed_kmh()),
            last_update: DateTime::<Utc>::from_timestamp_millis(driver.last_update)
                .map(|at| format_relative(now, at))
                .unwrap_or_else(|| "N/A".to_string()),
            accuracy: format_accuracy(location.accuracy),
            status: Some(driver.live_status),
        },
    }
}

fn driver_marker(view: &SingleDriverView, position: Coordinates, now: DateTime<Utc>) -> Marker {
    let sample = view.location.as_ref();
    let last_update = view
        .last_update
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|at| format_relative(now, at))
        .unwrap_or_else(|| "N/A".to_string());
    Marker {
        id: view.driver_id.clone(),
        position,
        popup: PopupContent {
            title: format!("{} ({})", view.name, view.driver_id),
            bus: view.bus_number.clone(),
            route: None,
            location: format_position(position),
            speed: format_speed(sample.and_then(|s| s.speed_kmh())),
            last_update,
            accuracy: format_accuracy(sample.map(|s| s.accuracy).unwrap_or_default()),
            status: view.live_status,
        },
    }
}

fn format_position(position: Coordinates) -> String {
    format!("{:.6}, {:.6}", position.latitude, position.longitude)
}

fn format_speed(kmh: Option<f64>) -> String {
    kmh.map(|kmh| format!("{kmh:.1} km/h"))
        .unwrap_or_else(|| "N/A".to_string())
}

fn format_accuracy(meters: f64) -> String {
    if meters.is_finite() && meters > 0.0 {
        format!("{meters:.1}m")
    } else {
        "N/A".to_string()
    }
}

/// Human-readable age of `then` relative to `now`.
pub fn format_relative(now: DateTime<Utc>, then: DateTime<Utc>) -> String {
    let minutes = (now - then).num_minutes();
    if minutes < 1 {
        return "Just now".to_string();
    }
    if minutes < 60 {
        return format!("{minutes} min ago");
    }
    let hours = minutes / 60;
    if hours < 24 {
        return format!("{hours} {} ago", plural(hours, "hour"));
    }
    let days = hours / 24;
    format!("{days} {} ago", plural(days, "day"))
}

fn plural(n: i64, unit: &str) -> String {
    if n == 1 {
        unit.to_string()
    } else {
        format!("{unit}s")
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    use super::*;
    use crate::{aggregator::LiveAggregator, tracker::SingleDriverTracker};

    fn now() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_709_280_000_000).unwrap()
    }

    #[test]
    fn relative_time_buckets() {
        let ago = |d: Duration| format_relative(now(), now() - d);
        assert_eq!(ago(Duration::seconds(30)), "Just now");
        assert_eq!(ago(Duration::minutes(45)), "45 min ago");
        assert_eq!(ago(Duration::hours(3)), "3 hours ago");
        assert_eq!(ago(Duration::days(2)), "2 days ago");
        assert_eq!(ago(Duration::minutes(90)), "1 hour ago");
        assert_eq!(ago(Duration::hours(30)), "1 day ago");
        assert_eq!(ago(Duration::minutes(1)), "1 min ago");
    }

    #[test]
    fn future_timestamps_are_just_now() {
        assert_eq!(format_relative(now(), now() + Duration::minutes(5)), "Just now");
    }

    fn snapshot() -> serde_json::Value {
        json!({
            "registered": {
                "D1": {"name": "Asha", "busNumber": "7", "isActive": true},
                "D2": {"name": "Ravi", "isActive": true}
            },
            "locations": {
                "D1": {"latitude": 12.5, "longitude": 77.5, "accuracy": 4.0, "speed": 10.0,
                       "timestamp": "2024-03-01T07:58:00Z"},
                "D2": {"latitude": 13.0, "longitude": 78.0, "timestamp": "2024-03-01T06:00:00Z"}
            }
        })
    }

    #[test]
    fn live_popup_formats_fields() {
        let mut aggregator = LiveAggregator::default();
        let update = aggregator.apply(Some(&snapshot()), now());
        let scene = MapPresenter::default().live_scene(&update.view, now());

        assert_eq!(scene.center, Coordinates::new(12.5, 77.5));
        assert_eq!(scene.markers.len(), 2);
        let popup = &scene.markers[0].popup;
        assert_eq!(popup.title, "Asha (D1)");
        assert_eq!(popup.bus.as_deref(), Some("7"));
        assert_eq!(popup.speed, "36.0 km/h");
        assert_eq!(popup.accuracy, "4.0m");
        assert_eq!(popup.last_update, "2 min ago");
        assert_eq!(popup.status, Some(LiveStatus::Live));

        let other = &scene.markers[1].popup;
        assert_eq!(other.speed, "N/A");
        assert_eq!(other.accuracy, "N/A");
        assert_eq!(other.last_update, "2 hours ago");
        assert_eq!(other.status, Some(LiveStatus::Offline));
    }

    #[test]
    fn popup_age_agrees_with_status() {
        let key = (now() - Duration::minutes(2)).timestamp_millis();
        let snapshot = json!({
            "D9": {
                "info": {"name": "Meera", "status": "active"},
                "locations": {
                    key.to_string(): {"latitude": 12.0, "longitude": 77.0,
                                      "timestamp": "2024-03-01T05:00:00Z"}
                }
            }
        });
        let update = LiveAggregator::default().apply(Some(&snapshot), now());
        let scene = MapPresenter::default().live_scene(&update.view, now());

        let popup = &scene.markers[0].popup;
        assert_eq!(popup.status, Some(LiveStatus::Live));
        assert_eq!(popup.last_update, "2 min ago");
    }

    #[test]
    fn empty_live_view_uses_default_center() {
        let scene = MapPresenter::default().live_scene(&AggregatedView::default(), now());
        assert_eq!(scene.center, DEFAULT_CENTER);
        assert!(scene.markers.is_empty());
    }

    #[test]
    fn live_map_recenters_only_once() {
        let presenter = MapPresenter::default();
        let mut aggregator = LiveAggregator::default();
        let mut widget = CommandBuffer::new();

        presenter.present_live(&mut widget, &aggregator.apply(Some(&snapshot()), now()), now());
        presenter.present_live(&mut widget, &aggregator.apply(Some(&snapshot()), now()), now());

        let commands = widget.drain();
        let set_views = commands
            .iter()
            .filter(|c| matches!(c, MapCommand::SetView { .. }))
            .count();
        assert_eq!(commands.len(), 3);
        assert_eq!(set_views, 1);
        assert!(widget.drain().is_empty());
    }

    #[test]
    fn tracking_map_follows_without_zoom() {
        let presenter = MapPresenter::default();
        let mut tracker = SingleDriverTracker::new("D1");
        let mut widget = CommandBuffer::new();

        presenter.present_driver(&mut widget, &tracker.apply(Some(&snapshot()), now()), now());
        let commands = widget.drain();
        assert_eq!(
            commands.last(),
            Some(&MapCommand::SetView {
                position: Coordinates::new(12.5, 77.5),
                zoom: None
            })
        );
    }

    #[test]
    fn unavailable_driver_has_no_marker() {
        let mut tracker = SingleDriverTracker::new("ghost");
        let update = tracker.apply(Some(&snapshot()), now());
        let scene = MapPresenter::default().driver_scene(&update.view, now());
        assert!(scene.markers.is_empty());
        assert_eq!(scene.center, DEFAULT_CENTER);
    }

    #[test]
    fn commands_serialize_with_tag() {
        let command = MapCommand::SetView {
            position: Coordinates::new(1.0, 2.0),
            zoom: None,
        };
        assert_eq!(
            serde_json::to_value(command).unwrap(),
            json!({"command": "setView", "position": {"latitude": 1.0, "longitude": 2.0}})
        );
    }
}
