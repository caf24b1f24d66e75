//! Live bus tracking: a realtime location store, GPS reporters that publish
//! into it, and the derivations that turn its snapshots into map scenes.

pub mod aggregator;
pub mod config;
pub mod model;
pub mod presenter;
pub mod registry;
pub mod reporter;
pub mod resolve;
pub mod store;
pub mod telemetry;
pub mod tracker;

pub use aggregator::{ActiveDriver, AggregatedView, AggregatorUpdate, LiveAggregator, aggregate};
pub use config::{AggregateArgs, ServeArgs, TelemetryOptions, TrackerConfig};
pub use model::{Coordinates, DriverIdentity, DriverRecord, LiveStatus, LocationSample};
pub use presenter::{CommandBuffer, MapCommand, MapPresenter, MapScene, MapWidget, Marker};
pub use registry::{DriverRegistry, Registration, RegistryError};
pub use reporter::{LocationReporter, ReporterError, ReporterStatus};
pub use store::{LocationStore, MemoryStore, StoreError, Subscription};
pub use tracker::{SingleDriverTracker, SingleDriverView, TrackerUpdate};
