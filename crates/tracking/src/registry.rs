//! Driver accounts: registration, lookup and the bus overview.
//!
//! Records live at `drivers/registered/{driverId}` with a username index at
//! `drivers/usernames/{username}`. The login check is a lookup against stored
//! values and is not a security boundary.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    model::{DriverIdentity, DriverRecord, format_timestamp},
    resolve::is_active,
    store::{LocationStore, StoreError, paths, segments},
};

pub const DEFAULT_BUS_PHOTO: &str = "/default-bus.jpg";
pub const UNASSIGNED_BUS: &str = "Unassigned";
const DEFAULT_ROUTE: &str = "Route information not available";
const DEFAULT_CAPACITY: &str = "50 passengers";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Driver ID, Name, Username, and Password are required (missing {0})")]
    MissingField(&'static str),
    #[error("invalid {field}: {source}")]
    InvalidKey {
        field: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("Username already exists! Please choose a different username.")]
    UsernameTaken,
    #[error("driver {0} is already registered")]
    DriverExists(String),
    #[error("Username not found!")]
    UnknownUsername,
    #[error("Driver account not found!")]
    UnknownDriver,
    #[error("Incorrect password!")]
    IncorrectPassword,
    #[error("Your account is deactivated. Contact admin.")]
    Deactivated,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Registration form as submitted by an administrator.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    #[serde(default)]
    pub driver_id: String,
    #[serde(default, alias = "driverName")]
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub bus_number: Option<String>,
    #[serde(default)]
    pub route: Option<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub bus_photo: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusDriver {
    pub id: String,
    pub name: String,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registered_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_active: Option<String>,
}

/// One bus with the drivers assigned to it.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusOverview {
    pub bus_number: String,
    pub route: String,
    pub capacity: String,
    pub bus_photo: String,
    pub status: String,
    pub drivers: Vec<BusDriver>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn require(value: &str, field: &'static str) -> Result<(), RegistryError> {
    if value.trim().is_empty() {
        return Err(RegistryError::MissingField(field));
    }
    match segments(value) {
        Ok(parts) if parts.len() == 1 => Ok(()),
        Ok(_) => Err(RegistryError::InvalidKey {
            field,
            source: StoreError::InvalidPath {
                path: value.to_string(),
                reason: "may not contain '/'",
            },
        }),
        Err(source) => Err(RegistryError::InvalidKey { field, source }),
    }
}

#[derive(Clone)]
pub struct DriverRegistry {
    store: Arc<dyn LocationStore>,
    // Held across the uniqueness checks and both writes of register/delete.
    accounts: Arc<Mutex<()>>,
}

impl DriverRegistry {
    pub fn new(store: Arc<dyn LocationStore>) -> Self {
        Self {
            store,
            accounts: Arc::new(Mutex::new(())),
        }
    }

    fn lock_accounts(&self) -> MutexGuard<'_, ()> {
        match self.accounts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Store a new driver record and its username index entry.
    pub fn register(
        &self,
        registration: Registration,
        now: DateTime<Utc>,
    ) -> Result<DriverRecord, RegistryError> {
        require(&registration.driver_id, "driverId")?;
        if registration.name.trim().is_empty() {
            return Err(RegistryError::MissingField("name"));
        }
        require(&registration.username, "username")?;
        if registration.password.is_empty() {
            return Err(RegistryError::MissingField("password"));
        }

        let _accounts = self.lock_accounts();
        if self
            .store
            .read(&paths::username(&registration.username))?
            .is_some()
        {
            return Err(RegistryError::UsernameTaken);
        }
        if self
            .store
            .read(&paths::registered(&registration.driver_id))?
            .is_some()
        {
            return Err(RegistryError::DriverExists(registration.driver_id));
        }

        let record = DriverRecord {
            driver_id: registration.driver_id.clone(),
            name: registration.name.trim().to_string(),
            phone: non_empty(registration.phone),
            bus_number: non_empty(registration.bus_number),
            route: non_empty(registration.route),
            username: registration.username.clone(),
            password: Some(registration.password),
            bus_photo: Some(
                non_empty(registration.bus_photo).unwrap_or_else(|| DEFAULT_BUS_PHOTO.to_string()),
            ),
            is_active: true,
            registered_date: Some(now.format("%Y-%m-%d").to_string()),
            last_active: Some(format_timestamp(&now)),
            current_location: None,
        };
        let value = serde_json::to_value(&record).map_err(|err| StoreError::Encoding {
            path: paths::registered(&record.driver_id),
            reason: err.to_string(),
        })?;
        let record_path = paths::registered(&record.driver_id);
        self.store.write(&record_path, value)?;
        if let Err(err) = self.store.write(
            &paths::username(&record.username),
            Value::String(record.driver_id.clone()),
        ) {
            warn!(driver_id = %record.driver_id, "username index write failed: {err}");
            if let Err(rollback) = self.store.delete(&record_path) {
                warn!(driver_id = %record.driver_id, "failed to remove orphan record: {rollback}");
            }
            return Err(err.into());
        }

        info!(driver_id = %record.driver_id, username = %record.username, "driver registered");
        Ok(record)
    }

    /// All registered drivers in ascending id order. Records that cannot be
    /// read are skipped.
    pub fn list(&self) -> Result<Vec<DriverRecord>, RegistryError> {
        let Some(Value::Object(records)) = self.store.read(paths::REGISTERED)? else {
            return Ok(Vec::new());
        };
        let mut drivers: Vec<DriverRecord> = records
            .into_iter()
            .filter_map(|(driver_id, value)| decode(driver_id, value))
            .collect();
        drivers.sort_by(|a, b| a.driver_id.cmp(&b.driver_id));
        Ok(drivers)
    }

    pub fn get(&self, driver_id: &str) -> Result<Option<DriverRecord>, RegistryError> {
        if !is_single_key(driver_id) {
            return Ok(None);
        }
        Ok(self
            .store
            .read(&paths::registered(driver_id))?
            .and_then(|value| decode(driver_id.to_string(), value)))
    }

    /// Remove the record and its username index entry.
    pub fn delete(&self, driver_id: &str) -> Result<DriverRecord, RegistryError> {
        let _accounts = self.lock_accounts();
        let record = self.get(driver_id)?.ok_or(RegistryError::UnknownDriver)?;
        self.store.delete(&paths::registered(driver_id))?;
        if !record.username.is_empty() {
            self.store.delete(&paths::username(&record.username))?;
        }
        info!(driver_id, "driver deleted");
        Ok(record)
    }

    /// Resolve a login to the identity a reporting device needs.
    pub fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<DriverIdentity, RegistryError> {
        if !is_single_key(username) {
            return Err(RegistryError::UnknownUsername);
        }
        let driver_id = match self.store.read(&paths::username(username))? {
            Some(Value::String(driver_id)) => driver_id,
            _ => return Err(RegistryError::UnknownUsername),
        };
        let record = self.get(&driver_id)?.ok_or(RegistryError::UnknownDriver)?;
        if record.password.as_deref() != Some(password) {
            return Err(RegistryError::IncorrectPassword);
        }
        if !record.is_active {
            return Err(RegistryError::Deactivated);
        }
        Ok(DriverIdentity {
            username: username.to_string(),
            ..record.identity()
        })
    }

    /// Drivers grouped by bus number, sorted by bus with unassigned last.
    pub fn buses(&self) -> Result<Vec<BusOverview>, RegistryError> {
        let mut buses: BTreeMap<String, BusOverview> = BTreeMap::new();
        for driver in self.list()? {
            let bus_number = driver
                .bus_number
                .clone()
                .unwrap_or_else(|| UNASSIGNED_BUS.to_string());
            let bus = buses
                .entry(bus_number.clone())
                .or_insert_with(|| BusOverview {
                    bus_number,
                    route: driver
                        .route
                        .clone()
                        .unwrap_or_else(|| DEFAULT_ROUTE.to_string()),
                    capacity: DEFAULT_CAPACITY.to_string(),
                    bus_photo: driver
                        .bus_photo
                        .clone()
                        .unwrap_or_else(|| DEFAULT_BUS_PHOTO.to_string()),
                    status: if driver.is_active { "Active" } else { "Inactive" }.to_string(),
                    drivers: Vec::new(),
                });
            bus.drivers.push(BusDriver {
                id: driver.driver_id,
                name: driver.name,
                username: driver.username,
                phone: driver.phone,
                is_active: driver.is_active,
                registered_date: driver.registered_date,
                last_active: driver.last_active,
            });
        }

        let unassigned = buses.remove(UNASSIGNED_BUS);
        Ok(buses.into_values().chain(unassigned).collect())
    }
}

fn is_single_key(key: &str) -> bool {
    segments(key).is_ok_and(|parts| parts.len() == 1)
}

/// Decode a stored record. The key is the driver id and either activity flag
/// counts, so legacy `status: "active"` records can still log in.
fn decode(driver_id: String, value: Value) -> Option<DriverRecord> {
    let active = is_active(&value);
    match serde_json::from_value::<DriverRecord>(value) {
        Ok(mut record) => {
            record.driver_id = driver_id;
            record.is_active = active;
            Some(record)
        }
        Err(err) => {
            warn!(driver_id, "skipping unreadable driver record: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::store::MemoryStore;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_709_280_000_000).unwrap()
    }

    fn registration(driver_id: &str, username: &str, bus: Option<&str>) -> Registration {
        Registration {
            driver_id: driver_id.into(),
            name: format!("Driver {driver_id}"),
            username: username.into(),
            password: "pw".into(),
            bus_number: bus.map(str::to_string),
            ..Registration::default()
        }
    }

    fn registry() -> (Arc<MemoryStore>, DriverRegistry) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), DriverRegistry::new(store))
    }

    #[test]
    fn register_writes_record_and_username_index() {
        let (store, registry) = registry();
        let record = registry
            .register(registration("D1", "asha", Some("7")), now())
            .unwrap();
        assert!(record.is_active);
        assert_eq!(record.registered_date.as_deref(), Some("2024-03-01"));
        assert_eq!(record.bus_photo.as_deref(), Some(DEFAULT_BUS_PHOTO));

        assert_eq!(
            store.read("drivers/usernames/asha").unwrap(),
            Some(json!("D1"))
        );
        let stored = store.read("drivers/registered/D1").unwrap().unwrap();
        assert_eq!(stored["isActive"], json!(true));
        assert_eq!(stored["busNumber"], json!("7"));
    }

    #[test]
    fn register_rejects_missing_fields_and_duplicates() {
        let (_, registry) = registry();
        let mut incomplete = registration("D1", "asha", None);
        incomplete.password.clear();
        assert!(matches!(
            registry.register(incomplete, now()),
            Err(RegistryError::MissingField("password"))
        ));

        registry
            .register(registration("D1", "asha", None), now())
            .unwrap();
        assert!(matches!(
            registry.register(registration("D2", "asha", None), now()),
            Err(RegistryError::UsernameTaken)
        ));
        assert!(matches!(
            registry.register(registration("D1", "ravi", None), now()),
            Err(RegistryError::DriverExists(_))
        ));
    }

    #[test]
    fn register_rejects_path_characters_in_keys() {
        let (_, registry) = registry();
        assert!(matches!(
            registry.register(registration("a/b", "asha", None), now()),
            Err(RegistryError::InvalidKey { field: "driverId", .. })
        ));
    }

    #[test]
    fn authenticate_checks_password_and_activity() {
        let (store, registry) = registry();
        registry
            .register(registration("D1", "asha", Some("7")), now())
            .unwrap();

        let identity = registry.authenticate("asha", "pw").unwrap();
        assert_eq!(identity.driver_id, "D1");
        assert_eq!(identity.bus_number.as_deref(), Some("7"));

        assert!(matches!(
            registry.authenticate("asha", "nope"),
            Err(RegistryError::IncorrectPassword)
        ));
        assert!(matches!(
            registry.authenticate("ghost", "pw"),
            Err(RegistryError::UnknownUsername)
        ));

        store
            .write("drivers/registered/D1/isActive", json!(false))
            .unwrap();
        assert!(matches!(
            registry.authenticate("asha", "pw"),
            Err(RegistryError::Deactivated)
        ));
    }

    #[test]
    fn delete_removes_record_and_index() {
        let (store, registry) = registry();
        registry
            .register(registration("D1", "asha", None), now())
            .unwrap();
        registry.delete("D1").unwrap();
        assert!(store.read("drivers/registered/D1").unwrap().is_none());
        assert!(store.read("drivers/usernames/asha").unwrap().is_none());
        assert!(matches!(
            registry.delete("D1"),
            Err(RegistryError::UnknownDriver)
        ));
    }

    #[test]
    fn concurrent_registrations_claim_a_username_once() {
        let (store, registry) = registry();
        let outcomes: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|n| {
                    let registry = registry.clone();
                    scope.spawn(move || {
                        registry.register(registration(&format!("D{n}"), "asha", None), now())
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let winners: Vec<_> = outcomes.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1);
        assert!(
            outcomes
                .iter()
                .filter(|r| r.is_err())
                .all(|r| matches!(r, Err(RegistryError::UsernameTaken)))
        );
        assert_eq!(registry.list().unwrap().len(), 1);
        assert_eq!(
            store.read("drivers/usernames/asha").unwrap(),
            Some(json!(winners[0].driver_id))
        );
    }

    /// Store that refuses writes to the username index.
    struct ReadOnlyIndex(MemoryStore);

    impl LocationStore for ReadOnlyIndex {
        fn write(&self, path: &str, value: Value) -> Result<(), StoreError> {
            if path.starts_with(paths::USERNAMES) {
                return Err(StoreError::PermissionDenied { path: path.into() });
            }
            self.0.write(path, value)
        }

        fn read(&self, path: &str) -> Result<Option<Value>, StoreError> {
            self.0.read(path)
        }

        fn subscribe(
            &self,
            path: &str,
            on_change: crate::store::ChangeCallback,
        ) -> Result<crate::store::Subscription, StoreError> {
            self.0.subscribe(path, on_change)
        }

        fn delete(&self, path: &str) -> Result<(), StoreError> {
            self.0.delete(path)
        }
    }

    #[test]
    fn failed_index_write_leaves_no_record() {
        let store = Arc::new(ReadOnlyIndex(MemoryStore::new()));
        let registry = DriverRegistry::new(store.clone());
        assert!(matches!(
            registry.register(registration("D1", "asha", None), now()),
            Err(RegistryError::Store(StoreError::PermissionDenied { .. }))
        ));
        assert!(store.read("drivers/registered/D1").unwrap().is_none());
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn buses_group_drivers_with_unassigned_last() {
        let (_, registry) = registry();
        registry
            .register(registration("D1", "a", Some("B2")), now())
            .unwrap();
        registry
            .register(registration("D2", "b", None), now())
            .unwrap();
        registry
            .register(registration("D3", "c", Some("A1")), now())
            .unwrap();
        registry
            .register(registration("D4", "d", Some("B2")), now())
            .unwrap();

        let buses = registry.buses().unwrap();
        let numbers: Vec<&str> = buses.iter().map(|b| b.bus_number.as_str()).collect();
        assert_eq!(numbers, ["A1", "B2", UNASSIGNED_BUS]);
        assert_eq!(buses[1].drivers.len(), 2);
        assert_eq!(buses[0].route, DEFAULT_ROUTE);
        assert_eq!(buses[0].capacity, DEFAULT_CAPACITY);
        assert_eq!(buses[0].status, "Active");
    }

    #[test]
    fn list_reads_records_without_stored_ids() {
        let store = Arc::new(MemoryStore::with_tree(json!({
            "drivers": {"registered": {"D9": {"driverName": "Legacy", "isActive": true}}}
        })));
        let registry = DriverRegistry::new(store);
        let drivers = registry.list().unwrap();
        assert_eq!(drivers.len(), 1);
        assert_eq!(drivers[0].driver_id, "D9");
        assert_eq!(drivers[0].name, "Legacy");
    }

    #[test]
    fn status_flag_counts_as_active() {
        let store = Arc::new(MemoryStore::with_tree(json!({
            "drivers": {
                "registered": {"D9": {"name": "Legacy", "password": "pw", "status": "active"}},
                "usernames": {"legacy": "D9"}
            }
        })));
        let registry = DriverRegistry::new(store);
        assert!(registry.get("D9").unwrap().unwrap().is_active);
        assert_eq!(registry.authenticate("legacy", "pw").unwrap().driver_id, "D9");
    }
}
