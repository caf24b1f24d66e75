//! Hierarchical realtime store addressed by `/`-separated paths.
//!
//! Values are JSON trees. Subscribers receive the full value at their path
//! (never a diff) whenever anything at, above, or below that path changes.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use serde_json::Value;
use thiserror::Error;

mod memory;

pub use memory::MemoryStore;

/// Callback fired with the subtree value at the subscribed path, `None` when
/// nothing is stored there.
pub type ChangeCallback = Box<dyn Fn(Option<Value>) + Send + Sync>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("invalid store path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    #[error("permission denied writing {path:?}")]
    PermissionDenied { path: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("could not encode value for {path:?}: {reason}")]
    Encoding { path: String, reason: String },
}

impl StoreError {
    /// Whether repeating the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Key-value realtime store with subscribe/push semantics.
///
/// Callbacks run on the writer's thread after the store has released its
/// internal lock. A callback must not write to the path it is subscribed to.
pub trait LocationStore: Send + Sync {
    /// Overwrite the value at `path`. Writing `null` removes it.
    fn write(&self, path: &str, value: Value) -> Result<(), StoreError>;

    fn read(&self, path: &str) -> Result<Option<Value>, StoreError>;

    /// Register `on_change`, which fires once immediately with the current
    /// value and then on every change until the returned handle is dropped.
    fn subscribe(&self, path: &str, on_change: ChangeCallback) -> Result<Subscription, StoreError>;

    fn delete(&self, path: &str) -> Result<(), StoreError>;
}

/// Handle keeping a subscription alive. Dropping it unsubscribes.
pub struct Subscription {
    active: Arc<AtomicBool>,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(active: Arc<AtomicBool>, cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            active,
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Split a path into segments. Leading and trailing slashes are ignored; the
/// empty path addresses the root.
pub fn segments(path: &str) -> Result<Vec<String>, StoreError> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    trimmed
        .split('/')
        .map(|segment| {
            if segment.is_empty() {
                Err(StoreError::InvalidPath {
                    path: path.to_string(),
                    reason: "empty segment",
                })
            } else if segment.contains(['.', '#', '$', '[', ']']) {
                Err(StoreError::InvalidPath {
                    path: path.to_string(),
                    reason: "segments may not contain . # $ [ ]",
                })
            } else {
                Ok(segment.to_string())
            }
        })
        .collect()
}

/// Paths of the persisted layout.
pub mod paths {
    pub const DRIVERS: &str = "drivers";
    pub const REGISTERED: &str = "drivers/registered";
    pub const USERNAMES: &str = "drivers/usernames";
    pub const LOCATIONS: &str = "drivers/locations";

    pub fn registered(driver_id: &str) -> String {
        format!("{REGISTERED}/{driver_id}")
    }

    pub fn username(username: &str) -> String {
        format!("{USERNAMES}/{username}")
    }

    pub fn driver_location(driver_id: &str) -> String {
        format!("{LOCATIONS}/{driver_id}")
    }

    pub fn bus_location(bus_number: &str) -> String {
        format!("buses/{bus_number}/currentLocation")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_ignore_outer_slashes() {
        assert_eq!(
            segments("/drivers/registered/").unwrap(),
            vec!["drivers".to_string(), "registered".to_string()]
        );
        assert!(segments("").unwrap().is_empty());
    }

    #[test]
    fn segments_reject_empty_and_reserved() {
        assert!(matches!(
            segments("drivers//x"),
            Err(StoreError::InvalidPath { .. })
        ));
        assert!(matches!(
            segments("drivers/a.b"),
            Err(StoreError::InvalidPath { .. })
        ));
    }

    #[test]
    fn only_unavailable_is_transient() {
        assert!(StoreError::Unavailable("offline".into()).is_transient());
        assert!(!StoreError::PermissionDenied { path: "x".into() }.is_transient());
    }
}
