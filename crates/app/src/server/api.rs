//! JSON handlers for driver administration, reporting sessions and views.

use actix_web::{HttpResponse, http::StatusCode, web};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use tracking::{
    DriverRecord, LocationStore, Registration, RegistryError, ReporterError, ReporterStatus,
    StoreError, aggregate,
    reporter::{GeoError, GeoFix, PositionOptions},
    store::paths,
    tracker,
};

use super::ServerState;
use crate::sessions::PushOutcome;

fn error_response(status: StatusCode, message: impl ToString) -> HttpResponse {
    HttpResponse::build(status).json(json!({ "error": message.to_string() }))
}

fn store_error(err: StoreError) -> HttpResponse {
    let status = match err {
        StoreError::InvalidPath { .. } => StatusCode::BAD_REQUEST,
        StoreError::PermissionDenied { .. } => StatusCode::FORBIDDEN,
        StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        StoreError::Encoding { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err)
}

fn registry_error(err: RegistryError) -> HttpResponse {
    let status = match err {
        RegistryError::Store(err) => return store_error(err),
        RegistryError::MissingField(_) | RegistryError::InvalidKey { .. } => {
            StatusCode::BAD_REQUEST
        }
        RegistryError::UsernameTaken | RegistryError::DriverExists(_) => StatusCode::CONFLICT,
        RegistryError::UnknownUsername | RegistryError::IncorrectPassword => {
            StatusCode::UNAUTHORIZED
        }
        RegistryError::UnknownDriver => StatusCode::NOT_FOUND,
        RegistryError::Deactivated => StatusCode::FORBIDDEN,
    };
    error_response(status, err)
}

fn reporter_error(err: ReporterError) -> HttpResponse {
    match err {
        ReporterError::AlreadyReporting(_) => error_response(StatusCode::CONFLICT, err),
        ReporterError::Store(err) => store_error(err),
        ReporterError::Spawn(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err),
    }
}

fn redacted(records: Vec<DriverRecord>) -> Vec<DriverRecord> {
    records.iter().map(DriverRecord::redacted).collect()
}

/// List every registered driver without passwords.
pub(super) async fn list_drivers(state: web::Data<ServerState>) -> HttpResponse {
    match state.registry.list() {
        Ok(records) => HttpResponse::Ok().json(redacted(records)),
        Err(err) => registry_error(err),
    }
}

pub(super) async fn register_driver(
    body: web::Json<Registration>,
    state: web::Data<ServerState>,
) -> HttpResponse {
    match state.registry.register(body.into_inner(), Utc::now()) {
        Ok(record) => HttpResponse::Created().json(record.redacted()),
        Err(err) => registry_error(err),
    }
}

/// Delete a driver, stopping any session it still has running.
pub(super) async fn delete_driver(
    path: web::Path<String>,
    state: web::Data<ServerState>,
) -> HttpResponse {
    let driver_id = path.into_inner();
    let blocking_state = state.clone();
    let blocking_id = driver_id.clone();
    let stopped = web::block(move || blocking_state.sessions.stop(&blocking_id)).await;
    if let Ok(Some(Err(err))) = stopped {
        warn!(%driver_id, "reporter did not stop cleanly before delete: {err}");
    }

    match state.registry.delete(&driver_id) {
        Ok(record) => HttpResponse::Ok().json(record.redacted()),
        Err(err) => registry_error(err),
    }
}

pub(super) async fn list_buses(state: web::Data<ServerState>) -> HttpResponse {
    match state.registry.buses() {
        Ok(buses) => HttpResponse::Ok().json(buses),
        Err(err) => registry_error(err),
    }
}

#[derive(Deserialize)]
pub(super) struct LoginRequest {
    username: String,
    password: String,
}

pub(super) async fn login(
    body: web::Json<LoginRequest>,
    state: web::Data<ServerState>,
) -> HttpResponse {
    match state.registry.authenticate(&body.username, &body.password) {
        Ok(identity) => {
            info!(driver_id = %identity.driver_id, "driver logged in");
            HttpResponse::Ok().json(identity)
        }
        Err(err) => registry_error(err),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartResponse {
    status: ReporterStatus,
    position_options: PositionOptions,
}

pub(super) async fn start_reporting(
    path: web::Path<String>,
    state: web::Data<ServerState>,
) -> HttpResponse {
    let driver_id = path.into_inner();
    let record = match state.registry.get(&driver_id) {
        Ok(Some(record)) => record,
        Ok(None) => return registry_error(RegistryError::UnknownDriver),
        Err(err) => return registry_error(err),
    };
    if !record.is_active {
        return registry_error(RegistryError::Deactivated);
    }
    match state.sessions.start_browser(record.identity()) {
        Ok((status, position_options)) => HttpResponse::Ok().json(StartResponse {
            status,
            position_options,
        }),
        Err(err) => reporter_error(err),
    }
}

/// A reading posted by the driver's browser: `{"fix": {...}}` or
/// `{"error": <GeolocationPositionError code>}`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) enum FixReport {
    Fix(GeoFix),
    Error(u16),
}

pub(super) async fn push_fix(
    path: web::Path<String>,
    body: web::Json<FixReport>,
    state: web::Data<ServerState>,
) -> HttpResponse {
    let driver_id = path.into_inner();
    let reading = match body.into_inner() {
        FixReport::Fix(fix) => Ok(fix),
        FixReport::Error(code) => Err(GeoError::from_code(code)),
    };
    match state.sessions.push(&driver_id, reading) {
        PushOutcome::Accepted => HttpResponse::Accepted().json(state.sessions.status(&driver_id)),
        PushOutcome::NoSession => {
            error_response(StatusCode::NOT_FOUND, "no reporting session for this driver")
        }
        PushOutcome::Simulated => error_response(
            StatusCode::CONFLICT,
            "this driver is replaying a simulated route",
        ),
    }
}

pub(super) async fn stop_reporting(
    path: web::Path<String>,
    state: web::Data<ServerState>,
) -> HttpResponse {
    let driver_id = path.into_inner();
    let blocking_state = state.clone();
    match web::block(move || blocking_state.sessions.stop(&driver_id)).await {
        Ok(Some(Ok(status))) => HttpResponse::Ok().json(status),
        Ok(Some(Err(err))) => reporter_error(err),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "no reporting session for this driver"),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err),
    }
}

pub(super) async fn reporting_status(
    path: web::Path<String>,
    state: web::Data<ServerState>,
) -> HttpResponse {
    match state.sessions.status(&path) {
        Some(status) => HttpResponse::Ok().json(status),
        None => error_response(StatusCode::NOT_FOUND, "no reporting session for this driver"),
    }
}

/// Current aggregated view of every active driver.
pub(super) async fn live_view(state: web::Data<ServerState>) -> HttpResponse {
    let snapshot = match state.store.read(paths::DRIVERS) {
        Ok(snapshot) => snapshot,
        Err(err) => return store_error(err),
    };
    let view = aggregate(snapshot.as_ref(), Utc::now(), state.stale_after);
    metrics::gauge!("tracker_active_drivers").set(view.len() as f64);
    metrics::gauge!("tracker_live_drivers").set(view.live_count() as f64);
    HttpResponse::Ok().json(view)
}

/// Current view of one driver. Unknown drivers yield the unavailable view.
pub(super) async fn track_view(
    path: web::Path<String>,
    state: web::Data<ServerState>,
) -> HttpResponse {
    let driver_id = path.into_inner();
    let snapshot = match state.store.read(paths::DRIVERS) {
        Ok(snapshot) => snapshot,
        Err(err) => return store_error(err),
    };
    let record = tracker::narrow(snapshot.as_ref(), &driver_id);
    let view = tracker::resolve(&driver_id, record.as_ref(), Utc::now(), state.stale_after);
    HttpResponse::Ok().json(view)
}
