//! Reporting sessions keyed by driver id.
//!
//! A browser session owns a [`ChannelGeolocation`] that the fix endpoint
//! feeds; a simulated session replays a route on its own thread.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use tracing::{info, warn};
use tracking::{
    DriverIdentity, LocationReporter, LocationStore, ReporterError, ReporterStatus,
    reporter::{ChannelGeolocation, GeoReading, Geolocation, PositionOptions, RetryPolicy},
};

struct Session {
    reporter: LocationReporter,
    source: Option<ChannelGeolocation>,
}

pub(crate) struct ReportingSessions {
    store: Arc<dyn LocationStore>,
    retry: RetryPolicy,
    sessions: Mutex<HashMap<String, Session>>,
}

/// Outcome of forwarding a reading to a session.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PushOutcome {
    Accepted,
    NoSession,
    /// The session replays a simulated route and takes no external fixes.
    Simulated,
}

impl ReportingSessions {
    pub(crate) fn new(store: Arc<dyn LocationStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Start a session fed by fixes posted from the driver's browser.
    /// Returns the options the browser should pass to `watchPosition`.
    pub(crate) fn start_browser(
        &self,
        identity: DriverIdentity,
    ) -> Result<(ReporterStatus, PositionOptions), ReporterError> {
        let source = ChannelGeolocation::new();
        let status = self.start(identity, &source, Some(source.clone()))?;
        let options = source.options().unwrap_or_default();
        Ok((status, options.into()))
    }

    pub(crate) fn start_with(
        &self,
        identity: DriverIdentity,
        geolocation: &dyn Geolocation,
    ) -> Result<ReporterStatus, ReporterError> {
        self.start(identity, geolocation, None)
    }

    fn start(
        &self,
        identity: DriverIdentity,
        geolocation: &dyn Geolocation,
        source: Option<ChannelGeolocation>,
    ) -> Result<ReporterStatus, ReporterError> {
        let mut sessions = self.lock();
        if sessions.contains_key(&identity.driver_id) {
            return Err(ReporterError::AlreadyReporting(identity.driver_id));
        }
        let driver_id = identity.driver_id.clone();
        let mut reporter = LocationReporter::new(self.store.clone(), identity).with_retry(self.retry);
        reporter.start(geolocation)?;
        let status = reporter.status();
        sessions.insert(driver_id, Session { reporter, source });
        Ok(status)
    }

    pub(crate) fn push(&self, driver_id: &str, reading: GeoReading) -> PushOutcome {
        let sessions = self.lock();
        match sessions.get(driver_id) {
            None => PushOutcome::NoSession,
            Some(Session { source: None, .. }) => PushOutcome::Simulated,
            Some(Session {
                source: Some(source),
                ..
            }) => {
                if source.push(reading) {
                    PushOutcome::Accepted
                } else {
                    PushOutcome::NoSession
                }
            }
        }
    }

    pub(crate) fn status(&self, driver_id: &str) -> Option<ReporterStatus> {
        self.lock()
            .get(driver_id)
            .map(|session| session.reporter.status())
    }

    /// Stop one session. Blocks until its worker has exited and the offline
    /// marker is written. `None` when no session was running.
    pub(crate) fn stop(&self, driver_id: &str) -> Option<Result<ReporterStatus, ReporterError>> {
        let mut session = self.lock().remove(driver_id)?;
        Some(
            session
                .reporter
                .stop()
                .map(|()| session.reporter.status()),
        )
    }

    pub(crate) fn stop_all(&self) {
        let drained: Vec<(String, Session)> = self.lock().drain().collect();
        for (driver_id, mut session) in drained {
            if let Err(err) = session.reporter.stop() {
                warn!(%driver_id, "failed to stop reporter cleanly: {err}");
            }
        }
        info!("all reporting sessions stopped");
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}
