//! Demo mode: a handful of registered drivers replaying loops around the map
//! center, plus one registered driver that never reports.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};
use tracking::{Coordinates, Registration, RegistryError, reporter::SimulatedGeolocation};

use crate::server::ServerState;

const REPLAY_INTERVAL: Duration = Duration::from_secs(3);

struct DemoDriver {
    driver_id: &'static str,
    name: &'static str,
    bus_number: &'static str,
    route: &'static str,
    /// Offset of the loop center from the map center, in degrees.
    offset: (f64, f64),
    radius_m: f64,
    reports: bool,
}

const DEMO_DRIVERS: [DemoDriver; 4] = [
    DemoDriver {
        driver_id: "DRV001",
        name: "Ravi Kumar",
        bus_number: "BUS-01",
        route: "Main Gate - City Center",
        offset: (0.01, -0.01),
        radius_m: 900.0,
        reports: true,
    },
    DemoDriver {
        driver_id: "DRV002",
        name: "Anita Sharma",
        bus_number: "BUS-02",
        route: "Main Gate - Railway Station",
        offset: (-0.012, 0.008),
        radius_m: 1_400.0,
        reports: true,
    },
    DemoDriver {
        driver_id: "DRV003",
        name: "Suresh Patil",
        bus_number: "BUS-03",
        route: "Hostel Block - Airport Road",
        offset: (0.004, 0.015),
        radius_m: 600.0,
        reports: true,
    },
    DemoDriver {
        driver_id: "DRV004",
        name: "Meena Iyer",
        bus_number: "BUS-04",
        route: "Main Gate - Tech Park",
        offset: (0.0, 0.0),
        radius_m: 0.0,
        reports: false,
    },
];

/// Register the demo drivers (idempotently) and start their simulated
/// reporters. Returns how many reporters were started.
pub(crate) fn start(state: &ServerState) -> Result<usize> {
    let center = state.presenter.default_center;
    let mut started = 0;
    for demo in &DEMO_DRIVERS {
        let registration = Registration {
            driver_id: demo.driver_id.to_string(),
            name: demo.name.to_string(),
            phone: Some("+91 90000 00000".to_string()),
            bus_number: Some(demo.bus_number.to_string()),
            route: Some(demo.route.to_string()),
            username: demo.driver_id.to_lowercase(),
            password: "demo".to_string(),
            bus_photo: None,
        };
        let record = match state.registry.register(registration, Utc::now()) {
            Ok(record) => record,
            Err(RegistryError::UsernameTaken | RegistryError::DriverExists(_)) => state
                .registry
                .get(demo.driver_id)?
                .with_context(|| format!("demo driver {} vanished", demo.driver_id))?,
            Err(err) => return Err(err).context("failed to register demo driver"),
        };

        if !demo.reports {
            continue;
        }
        let loop_center = Coordinates::new(
            center.latitude + demo.offset.0,
            center.longitude + demo.offset.1,
        );
        let route = SimulatedGeolocation::loop_around(loop_center, demo.radius_m, 24);
        let source = SimulatedGeolocation::new(route, REPLAY_INTERVAL);
        match state.sessions.start_with(record.identity(), &source) {
            Ok(_) => started += 1,
            Err(err) => warn!(driver_id = demo.driver_id, "demo reporter not started: {err}"),
        }
    }
    info!(
        reporters = started,
        "demo mode running; drivers log in as drv001..drv004 with password 'demo'"
    );
    Ok(started)
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Instant};

    use tracking::{
        LocationStore, MapPresenter, MemoryStore, aggregate, reporter::RetryPolicy, store::paths,
    };

    use super::*;

    #[test]
    fn demo_drivers_appear_in_the_live_view() {
        let store = Arc::new(MemoryStore::new());
        let state = ServerState::new(
            store.clone(),
            MapPresenter::default(),
            Duration::from_secs(300),
            RetryPolicy::none(),
        );
        assert_eq!(start(&state).unwrap(), 3);
        assert_eq!(state.registry.list().unwrap().len(), 4);

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let snapshot = store.read(paths::DRIVERS).unwrap();
            let view = aggregate(snapshot.as_ref(), Utc::now(), Duration::from_secs(300));
            if view.len() == 3 {
                assert!(view.get("DRV004").is_none());
                break;
            }
            assert!(Instant::now() < deadline, "demo reporters did not publish");
            thread::sleep(Duration::from_millis(10));
        }

        state.sessions.stop_all();
        // Restarting re-uses the existing registrations.
        assert_eq!(start(&state).unwrap(), 3);
        state.sessions.stop_all();
    }
}
