//! Device geolocation sources consumed by the reporter.
//!
//! A source hands out a [`WatchHandle`]: a channel of readings that stays
//! open until the handle is dropped, mirroring `watchPosition`/`clearWatch`.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::{model::Coordinates, telemetry::spawn_thread};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Sampling policy requested from the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatchOptions {
    pub high_accuracy: bool,
    /// Longest wait for a single fix before the device reports a timeout.
    pub timeout: Duration,
    /// Oldest cached fix the device may hand back instead of sampling.
    pub maximum_age: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            timeout: Duration::from_secs(10),
            maximum_age: Duration::from_secs(5),
        }
    }
}

/// `PositionOptions` as a browser's `watchPosition` expects them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionOptions {
    pub enable_high_accuracy: bool,
    pub timeout: u64,
    pub maximum_age: u64,
}

impl From<WatchOptions> for PositionOptions {
    fn from(options: WatchOptions) -> Self {
        Self {
            enable_high_accuracy: options.high_accuracy,
            timeout: options.timeout.as_millis() as u64,
            maximum_age: options.maximum_age.as_millis() as u64,
        }
    }
}

/// One position delivered by the device.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoFix {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub accuracy: f64,
    /// Metres per second.
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub heading: Option<f64>,
}

/// Classified sampling failure.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeoError {
    #[error("Location permission denied. Please allow location access.")]
    PermissionDenied,
    #[error("Location information unavailable.")]
    PositionUnavailable,
    #[error("Location request timed out.")]
    Timeout,
    #[error("Unknown location error.")]
    Unknown,
}

impl GeoError {
    /// Map a `GeolocationPositionError.code`.
    pub fn from_code(code: u16) -> Self {
        match code {
            1 => GeoError::PermissionDenied,
            2 => GeoError::PositionUnavailable,
            3 => GeoError::Timeout,
            _ => GeoError::Unknown,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            GeoError::PermissionDenied => "permission_denied",
            GeoError::PositionUnavailable => "position_unavailable",
            GeoError::Timeout => "timeout",
            GeoError::Unknown => "unknown",
        }
    }
}

pub type GeoReading = Result<GeoFix, GeoError>;

/// Active watch. Dropping it clears the watch.
pub struct WatchHandle {
    readings: Receiver<GeoReading>,
    clear: Option<Box<dyn FnOnce() + Send>>,
}

impl WatchHandle {
    pub fn new(readings: Receiver<GeoReading>, clear: impl FnOnce() + Send + 'static) -> Self {
        Self {
            readings,
            clear: Some(Box::new(clear)),
        }
    }

    pub fn readings(&self) -> &Receiver<GeoReading> {
        &self.readings
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some(clear) = self.clear.take() {
            clear();
        }
    }
}

pub trait Geolocation: Send + Sync {
    fn watch(&self, options: WatchOptions) -> WatchHandle;
}

/// Source fed from outside, e.g. by fixes a driver's browser posts over HTTP.
#[derive(Clone, Default)]
pub struct ChannelGeolocation {
    state: Arc<Mutex<ChannelState>>,
}

#[derive(Default)]
struct ChannelState {
    sender: Option<Sender<GeoReading>>,
    watch_id: u64,
    options: Option<WatchOptions>,
}

impl ChannelGeolocation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward a reading to the active watch. Returns `false` when nobody is
    /// watching.
    pub fn push(&self, reading: GeoReading) -> bool {
        let Ok(state) = self.state.lock() else {
            return false;
        };
        state
            .sender
            .as_ref()
            .is_some_and(|sender| sender.send(reading).is_ok())
    }

    pub fn is_watching(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.sender.is_some())
            .unwrap_or(false)
    }

    /// Options requested by the current watch, for relaying to the device.
    pub fn options(&self) -> Option<WatchOptions> {
        self.state.lock().ok().and_then(|state| state.options)
    }
}

impl Geolocation for ChannelGeolocation {
    fn watch(&self, options: WatchOptions) -> WatchHandle {
        let (tx, rx) = unbounded();
        let watch_id = match self.state.lock() {
            Ok(mut state) => {
                state.watch_id += 1;
                state.sender = Some(tx);
                state.options = Some(options);
                state.watch_id
            }
            Err(_) => 0,
        };
        let state = Arc::downgrade(&self.state);
        WatchHandle::new(rx, move || {
            let Some(state) = state.upgrade() else {
                return;
            };
            if let Ok(mut state) = state.lock() {
                if state.watch_id == watch_id {
                    state.sender = None;
                    state.options = None;
                }
            }
        })
    }
}

/// Replays a route at a fixed cadence. Speed and heading are derived from
/// consecutive points.
#[derive(Clone, Debug)]
pub struct SimulatedGeolocation {
    route: Vec<Coordinates>,
    interval: Duration,
    accuracy: f64,
}

impl SimulatedGeolocation {
    pub fn new(route: Vec<Coordinates>, interval: Duration) -> Self {
        Self {
            route,
            interval,
            accuracy: 8.0,
        }
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = accuracy;
        self
    }

    /// Closed loop of `points` positions on a circle around `center`.
    pub fn loop_around(center: Coordinates, radius_m: f64, points: usize) -> Vec<Coordinates> {
        let points = points.max(3);
        let lat_step = (radius_m / EARTH_RADIUS_M).to_degrees();
        let lng_step = lat_step / center.latitude.to_radians().cos().max(1e-6);
        (0..points)
            .map(|i| {
                let angle = std::f64::consts::TAU * i as f64 / points as f64;
                Coordinates::new(
                    center.latitude + lat_step * angle.sin(),
                    center.longitude + lng_step * angle.cos(),
                )
            })
            .collect()
    }

    fn fix_between(&self, from: Coordinates, to: Coordinates) -> GeoFix {
        let seconds = self.interval.as_secs_f64();
        GeoFix {
            latitude: from.latitude,
            longitude: from.longitude,
            accuracy: self.accuracy,
            speed: (seconds > 0.0).then(|| distance_m(from, to) / seconds),
            heading: Some(bearing_deg(from, to)),
        }
    }
}

impl Geolocation for SimulatedGeolocation {
    fn watch(&self, _options: WatchOptions) -> WatchHandle {
        let (tx, rx) = bounded(16);
        let (stop_tx, stop_rx) = bounded::<()>(0);

        if self.route.is_empty() {
            let _ = tx.send(Err(GeoError::PositionUnavailable));
            return WatchHandle::new(rx, move || drop(stop_tx));
        }

        let source = self.clone();
        let spawned = spawn_thread("simulated-gps", move || {
            let route = &source.route;
            for (index, point) in route.iter().enumerate().cycle() {
                let next = route[(index + 1) % route.len()];
                if tx.send(Ok(source.fix_between(*point, next))).is_err() {
                    break;
                }
                match stop_rx.recv_timeout(source.interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    _ => break,
                }
            }
        });
        if let Err(err) = spawned {
            warn!("failed to spawn simulated GPS thread: {err}");
        }

        WatchHandle::new(rx, move || drop(stop_tx))
    }
}

/// Great-circle distance in metres.
pub fn distance_m(a: Coordinates, b: Coordinates) -> f64 {
    let (lat1, lat2) = (a.latitude.to_radians(), b.latitude.to_radians());
    let dlat = lat2 - lat1;
    let dlng = (b.longitude - a.longitude).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Initial bearing from `a` to `b`, degrees clockwise from north in `[0, 360)`.
pub fn bearing_deg(a: Coordinates, b: Coordinates) -> f64 {
    let (lat1, lat2) = (a.latitude.to_radians(), b.latitude.to_radians());
    let dlng = (b.longitude - a.longitude).to_radians();
    let y = dlng.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlng.cos();
    y.atan2(x).to_degrees().rem_euclid(360.0)
}
