//! Publishes a driver's GPS fixes to the store.
//!
//! Each fix overwrites two paths: the per-driver location and the per-bus
//! location read by bus-centric views. Nothing is queued or coalesced; every
//! reading becomes an independent overwrite.

use std::{
    sync::{Arc, Mutex},
    thread::JoinHandle,
};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Sender, bounded, select};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    model::{DriverIdentity, LocationSample, format_timestamp},
    store::{LocationStore, StoreError, paths},
    telemetry::spawn_thread,
};

mod geolocation;
mod retry;

pub use geolocation::{
    ChannelGeolocation, GeoError, GeoFix, GeoReading, Geolocation, PositionOptions,
    SimulatedGeolocation, WatchHandle, WatchOptions, bearing_deg, distance_m,
};
pub use retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ReporterError {
    #[error("driver {0} is already reporting")]
    AlreadyReporting(String),
    #[error("failed to spawn reporter worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Operator-facing state of a reporter.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReporterStatus {
    pub tracking: bool,
    pub message: String,
    pub total_updates: u64,
    pub last_update: Option<DateTime<Utc>>,
    pub accuracy: Option<f64>,
    pub last_error: Option<String>,
}

type SharedStatus = Arc<Mutex<ReporterStatus>>;

fn update_status(status: &SharedStatus, apply: impl FnOnce(&mut ReporterStatus)) {
    let mut guard = match status.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    apply(&mut guard);
}

struct Session {
    watch: WatchHandle,
    stop: Sender<()>,
    worker: JoinHandle<()>,
}

/// Reporter for one driver. Start/stop may be repeated; dropping a running
/// reporter stops it.
pub struct LocationReporter {
    store: Arc<dyn LocationStore>,
    identity: DriverIdentity,
    options: WatchOptions,
    retry: RetryPolicy,
    status: SharedStatus,
    session: Option<Session>,
}

impl LocationReporter {
    pub fn new(store: Arc<dyn LocationStore>, identity: DriverIdentity) -> Self {
        Self {
            store,
            identity,
            options: WatchOptions::default(),
            retry: RetryPolicy::default(),
            status: Arc::new(Mutex::new(ReporterStatus::default())),
            session: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_options(mut self, options: WatchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn identity(&self) -> &DriverIdentity {
        &self.identity
    }

    pub fn options(&self) -> WatchOptions {
        self.options
    }

    pub fn is_reporting(&self) -> bool {
        self.session.is_some()
    }

    pub fn status(&self) -> ReporterStatus {
        match self.status.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Begin watching `geolocation` and publishing every fix.
    pub fn start(&mut self, geolocation: &dyn Geolocation) -> Result<(), ReporterError> {
        if self.session.is_some() {
            return Err(ReporterError::AlreadyReporting(
                self.identity.driver_id.clone(),
            ));
        }

        update_status(&self.status, |status| {
            status.tracking = true;
            status.message = "Starting GPS tracking...".into();
            status.last_error = None;
        });

        let watch = geolocation.watch(self.options);
        let readings = watch.readings().clone();
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let store = self.store.clone();
        let identity = self.identity.clone();
        let retry = self.retry;
        let status = self.status.clone();
        let thread_name = format!("reporter-{}", identity.driver_id);

        let spawned = spawn_thread(thread_name, move || {
            let span = tracing::info_span!("tracker.reporter", driver_id = %identity.driver_id);
            let _span_guard = span.enter();
            loop {
                select! {
                    recv(readings) -> reading => match reading {
                        Ok(Ok(fix)) => handle_fix(&*store, &identity, &retry, &status, fix),
                        Ok(Err(err)) => handle_sensor_error(&status, err),
                        Err(_) => {
                            debug!("geolocation source closed");
                            break;
                        }
                    },
                    recv(stop_rx) -> _ => break,
                }
            }
        });

        let worker = match spawned {
            Ok(worker) => worker,
            Err(err) => {
                update_status(&self.status, |status| {
                    status.tracking = false;
                    status.last_error = Some(err.to_string());
                });
                return Err(err.into());
            }
        };

        info!(driver_id = %self.identity.driver_id, "GPS reporting started");
        self.session = Some(Session {
            watch,
            stop: stop_tx,
            worker,
        });
        Ok(())
    }

    /// Cancel sampling and write the offline marker. A no-op when idle.
    pub fn stop(&mut self) -> Result<(), ReporterError> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        drop(session.watch);
        let _ = session.stop.send(());
        if session.worker.join().is_err() {
            warn!(driver_id = %self.identity.driver_id, "reporter worker panicked");
        }

        update_status(&self.status, |status| {
            status.tracking = false;
            status.message = "GPS tracking stopped".into();
        });
        info!(driver_id = %self.identity.driver_id, "GPS reporting stopped");

        let marked = write_offline_marker(
            &*self.store,
            &self.identity.driver_id,
            Utc::now(),
            &self.retry,
        );
        if let Err(err) = &marked {
            update_status(&self.status, |status| {
                status.last_error = Some(format!("Error updating offline status: {err}"));
            });
        }
        marked.map_err(ReporterError::from)
    }
}

impl Drop for LocationReporter {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(driver_id = %self.identity.driver_id, "failed to stop reporter: {err}");
        }
    }
}

fn handle_fix(
    store: &dyn LocationStore,
    identity: &DriverIdentity,
    retry: &RetryPolicy,
    status: &SharedStatus,
    fix: GeoFix,
) {
    let now = Utc::now();
    match publish_fix(store, identity, fix, now, retry) {
        Ok(sample) => {
            metrics::counter!("tracker_location_writes_total").increment(1);
            update_status(status, |status| {
                status.total_updates += 1;
                status.last_update = Some(now);
                status.accuracy = Some(sample.accuracy);
                status.message = format!("Location updated - Accuracy: {}m", sample.accuracy.round());
                status.last_error = None;
            });
        }
        Err(err) => {
            metrics::counter!("tracker_location_write_failures_total").increment(1);
            warn!("failed to publish location: {err}");
            update_status(status, |status| {
                status.message = format!("Failed to send location: {err}");
                status.last_error = Some(err.to_string());
            });
        }
    }
}

fn handle_sensor_error(status: &SharedStatus, err: GeoError) {
    metrics::counter!("tracker_geolocation_errors_total", "kind" => err.label()).increment(1);
    warn!("geolocation error: {err}");
    update_status(status, |status| {
        status.message = format!("Location error: {err}");
        status.last_error = Some(err.to_string());
    });
}

/// Stored form of a sample with the denormalized driver fields.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PublishedSample<'a> {
    #[serde(flatten)]
    sample: &'a LocationSample,
    driver_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    bus_number: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    driver_id: Option<&'a str>,
    last_seen: String,
    is_online: bool,
}

fn encode(path: &str, value: &impl Serialize) -> Result<Value, StoreError> {
    serde_json::to_value(value).map_err(|err| StoreError::Encoding {
        path: path.to_string(),
        reason: err.to_string(),
    })
}

/// Build a sample from `fix` received at `at` and overwrite the per-driver
/// and per-bus paths with it.
pub fn publish_fix(
    store: &dyn LocationStore,
    identity: &DriverIdentity,
    fix: GeoFix,
    at: DateTime<Utc>,
    retry: &RetryPolicy,
) -> Result<LocationSample, StoreError> {
    let sample = LocationSample {
        latitude: fix.latitude,
        longitude: fix.longitude,
        accuracy: fix.accuracy,
        speed: fix.speed.unwrap_or(0.0),
        heading: fix.heading.unwrap_or(0.0),
        timestamp: at,
    };
    let mut published = PublishedSample {
        sample: &sample,
        driver_name: &identity.name,
        bus_number: identity.bus_number.as_deref(),
        driver_id: None,
        last_seen: format_timestamp(&at),
        is_online: true,
    };

    let driver_path = paths::driver_location(&identity.driver_id);
    let value = encode(&driver_path, &published)?;
    retry.run(&driver_path, || store.write(&driver_path, value.clone()))?;

    if let Some(bus_number) = identity.bus_number.as_deref().filter(|b| !b.trim().is_empty()) {
        published.driver_id = Some(&identity.driver_id);
        let bus_path = paths::bus_location(bus_number);
        let value = encode(&bus_path, &published)?;
        retry.run(&bus_path, || store.write(&bus_path, value.clone()))?;
    }

    Ok(sample)
}

/// Mark the driver offline without touching the last known coordinates.
pub fn write_offline_marker(
    store: &dyn LocationStore,
    driver_id: &str,
    at: DateTime<Utc>,
    retry: &RetryPolicy,
) -> Result<(), StoreError> {
    let base = paths::driver_location(driver_id);
    let online_path = format!("{base}/isOnline");
    let seen_path = format!("{base}/lastSeen");
    retry.run(&online_path, || store.write(&online_path, Value::Bool(false)))?;
    retry.run(&seen_path, || {
        store.write(&seen_path, Value::String(format_timestamp(&at)))
    })
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicU32, Ordering},
        thread,
        time::{Duration, Instant},
    };

    use serde_json::json;

    use super::*;
    use crate::store::{ChangeCallback, MemoryStore, Subscription};

    fn identity(bus: Option<&str>) -> DriverIdentity {
        DriverIdentity {
            driver_id: "D1".into(),
            name: "Asha".into(),
            bus_number: bus.map(str::to_string),
            phone: None,
            username: "asha".into(),
        }
    }

    fn fix(lat: f64, lng: f64) -> GeoFix {
        GeoFix {
            latitude: lat,
            longitude: lng,
            accuracy: 7.6,
            speed: Some(10.0),
            heading: None,
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Store whose first `failures` writes fail with `error`.
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicU32,
        error: StoreError,
        attempts: AtomicU32,
    }

    impl FlakyStore {
        fn new(failures: u32, error: StoreError) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures: AtomicU32::new(failures),
                error,
                attempts: AtomicU32::new(0),
            }
        }
    }

    impl LocationStore for FlakyStore {
        fn write(&self, path: &str, value: Value) -> Result<(), StoreError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(self.error.clone());
            }
            self.inner.write(path, value)
        }

        fn read(&self, path: &str) -> Result<Option<Value>, StoreError> {
            self.inner.read(path)
        }

        fn subscribe(&self, path: &str, on_change: ChangeCallback) -> Result<Subscription, StoreError> {
            self.inner.subscribe(path, on_change)
        }

        fn delete(&self, path: &str) -> Result<(), StoreError> {
            self.inner.delete(path)
        }
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    #[test]
    fn publish_writes_driver_and_bus_paths() {
        let store = MemoryStore::new();
        let at = Utc::now();
        let sample = publish_fix(&store, &identity(Some("KA-01")), fix(12.97, 77.59), at, &quick_retry())
            .unwrap();
        assert_eq!(sample.speed, 10.0);
        assert_eq!(sample.heading, 0.0);

        let driver = store.read("drivers/locations/D1").unwrap().unwrap();
        assert_eq!(driver["latitude"], json!(12.97));
        assert_eq!(driver["driverName"], json!("Asha"));
        assert_eq!(driver["busNumber"], json!("KA-01"));
        assert!(driver.get("driverId").is_none());

        let bus = store.read("buses/KA-01/currentLocation").unwrap().unwrap();
        assert_eq!(bus["driverId"], json!("D1"));
        assert_eq!(bus["longitude"], json!(77.59));
    }

    #[test]
    fn publish_without_bus_skips_bus_path() {
        let store = MemoryStore::new();
        publish_fix(&store, &identity(None), fix(1.0, 2.0), Utc::now(), &quick_retry()).unwrap();
        assert!(store.read("buses").unwrap().is_none());
    }

    #[test]
    fn transient_write_failures_are_retried() {
        let store = FlakyStore::new(2, StoreError::Unavailable("network".into()));
        publish_fix(&store, &identity(None), fix(1.0, 2.0), Utc::now(), &quick_retry()).unwrap();
        assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
        assert!(store.read("drivers/locations/D1").unwrap().is_some());
    }

    #[test]
    fn permission_denied_is_surfaced_without_retry() {
        let store = FlakyStore::new(1, StoreError::PermissionDenied { path: "x".into() });
        let result = publish_fix(&store, &identity(None), fix(1.0, 2.0), Utc::now(), &quick_retry());
        assert!(matches!(result, Err(StoreError::PermissionDenied { .. })));
        assert_eq!(store.attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reporter_publishes_until_stopped_then_marks_offline() {
        let store = Arc::new(MemoryStore::new());
        let source = ChannelGeolocation::new();
        let mut reporter = LocationReporter::new(store.clone(), identity(Some("7"))).with_retry(quick_retry());

        reporter.start(&source).unwrap();
        assert!(reporter.is_reporting());
        assert!(source.push(Ok(fix(12.97, 77.59))));
        wait_for(|| reporter.status().total_updates == 1);

        let status = reporter.status();
        assert!(status.tracking);
        assert_eq!(status.message, "Location updated - Accuracy: 8m");
        assert_eq!(status.accuracy, Some(7.6));

        reporter.stop().unwrap();
        assert!(!reporter.is_reporting());
        assert!(!source.is_watching());
        let location = store.read("drivers/locations/D1").unwrap().unwrap();
        assert_eq!(location["isOnline"], json!(false));
        assert_eq!(location["latitude"], json!(12.97));
        assert!(location["lastSeen"].is_string());
        assert!(!reporter.status().tracking);
    }

    #[test]
    fn sensor_errors_do_not_stop_reporting() {
        let store = Arc::new(MemoryStore::new());
        let source = ChannelGeolocation::new();
        let mut reporter = LocationReporter::new(store.clone(), identity(None));
        reporter.start(&source).unwrap();

        source.push(Err(GeoError::PermissionDenied));
        wait_for(|| reporter.status().last_error.is_some());
        assert_eq!(
            reporter.status().message,
            "Location error: Location permission denied. Please allow location access."
        );
        assert!(reporter.is_reporting());

        source.push(Ok(fix(1.0, 2.0)));
        wait_for(|| reporter.status().total_updates == 1);
        assert_eq!(reporter.status().last_error, None);
    }

    #[test]
    fn starting_twice_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let source = ChannelGeolocation::new();
        let mut reporter = LocationReporter::new(store, identity(None));
        reporter.start(&source).unwrap();
        assert!(matches!(
            reporter.start(&source),
            Err(ReporterError::AlreadyReporting(_))
        ));
    }

    #[test]
    fn stop_when_idle_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let mut reporter = LocationReporter::new(store.clone(), identity(None));
        reporter.stop().unwrap();
        assert!(store.read("drivers").unwrap().is_none());
    }
}
