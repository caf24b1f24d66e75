//! Actix Web server exposing the map pages, the JSON API, and SSE map streams.
//!
//! The server runs on a dedicated thread so reporter workers and the Ctrl+C
//! supervisor stay free from Actix runtime concerns.

use std::{net::IpAddr, sync::Arc, thread::JoinHandle, time::Duration};

use actix_web::{App, HttpResponse, HttpServer, web};
use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, bounded};
use tokio::sync::oneshot;
use tracing::{error, info};
use tracking::{DriverRegistry, MapPresenter, MemoryStore, reporter::RetryPolicy, telemetry};

use crate::{html, sessions::ReportingSessions};

mod api;
mod stream;

/// Shared state backing HTTP handlers.
pub(crate) struct ServerState {
    pub(crate) store: Arc<MemoryStore>,
    pub(crate) registry: DriverRegistry,
    pub(crate) sessions: ReportingSessions,
    pub(crate) presenter: MapPresenter,
    pub(crate) stale_after: Duration,
}

impl ServerState {
    pub(crate) fn new(
        store: Arc<MemoryStore>,
        presenter: MapPresenter,
        stale_after: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            registry: DriverRegistry::new(store.clone()),
            sessions: ReportingSessions::new(store.clone(), retry),
            store,
            presenter,
            stale_after,
        }
    }
}

/// Register every route on an Actix app.
pub(crate) fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(live_page))
        .route("/track/{driver_id}", web::get().to(track_page))
        .route("/driver", web::get().to(driver_page))
        .route("/metrics", web::get().to(metrics_handler))
        .service(
            web::scope("/api")
                .route("/drivers", web::get().to(api::list_drivers))
                .route("/drivers", web::post().to(api::register_driver))
                .route("/drivers/{driver_id}", web::delete().to(api::delete_driver))
                .route("/buses", web::get().to(api::list_buses))
                .route("/login", web::post().to(api::login))
                .route(
                    "/reporting/{driver_id}",
                    web::get().to(api::reporting_status),
                )
                .route(
                    "/reporting/{driver_id}/start",
                    web::post().to(api::start_reporting),
                )
                .route(
                    "/reporting/{driver_id}/fix",
                    web::post().to(api::push_fix),
                )
                .route(
                    "/reporting/{driver_id}/stop",
                    web::post().to(api::stop_reporting),
                )
                .route("/live", web::get().to(api::live_view))
                .route("/live/stream", web::get().to(stream::live_stream))
                .route("/track/{driver_id}", web::get().to(api::track_view))
                .route(
                    "/track/{driver_id}/stream",
                    web::get().to(stream::track_stream),
                ),
        );
}

/// Handle for the HTTP server thread.
pub(crate) struct TrackerServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    exited: Receiver<()>,
}

impl TrackerServer {
    /// Fires once the server thread has finished, for any reason.
    pub(crate) fn exited(&self) -> &Receiver<()> {
        &self.exited
    }

    /// Signal the server to stop and block until the thread exits.
    pub(crate) fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Spawn the server thread and wait until it has bound its listener.
pub(crate) fn spawn_server(
    state: web::Data<ServerState>,
    address: (IpAddr, u16),
) -> Result<TrackerServer> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (bound_tx, bound_rx) = bounded::<std::result::Result<(), String>>(1);
    let (exited_tx, exited_rx) = bounded::<()>(1);

    let handle = telemetry::spawn_thread("tracker-http-server", move || {
        let span = tracing::info_span!("tracker.server", bind = %address.0, port = address.1);
        let _span_guard = span.enter();
        let result = actix_web::rt::System::new().block_on(async move {
            let server = match HttpServer::new(move || {
                App::new().app_data(state.clone()).configure(configure)
            })
            .bind(address)
            {
                Ok(server) => server.run(),
                Err(err) => {
                    let _ = bound_tx.send(Err(err.to_string()));
                    return Ok(());
                }
            };
            let _ = bound_tx.send(Ok(()));

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });

            server.await
        });
        if let Err(err) = result {
            error!("HTTP server error: {err}");
        }
        let _ = exited_tx.send(());
    })
    .context("Failed to spawn HTTP server thread")?;

    match bound_rx.recv() {
        Ok(Ok(())) => {
            info!("listening on http://{}:{}", address.0, address.1);
            Ok(TrackerServer {
                shutdown: Some(shutdown_tx),
                handle: Some(handle),
                exited: exited_rx,
            })
        }
        Ok(Err(err)) => {
            let _ = handle.join();
            Err(anyhow!("failed to bind {}:{}: {err}", address.0, address.1))
        }
        Err(_) => {
            let _ = handle.join();
            Err(anyhow!("HTTP server thread exited before binding"))
        }
    }
}

fn html_response(body: String) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(body)
}

/// Serve the live map of every active driver.
async fn live_page() -> HttpResponse {
    html_response(html::live_page())
}

/// Serve the map following one driver.
async fn track_page(path: web::Path<String>) -> HttpResponse {
    html_response(html::track_page(&path))
}

/// Serve the driver's reporting page.
async fn driver_page() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(html::DRIVER_HTML)
}

/// Prometheus exposition of the tracker metrics.
async fn metrics_handler() -> HttpResponse {
    let body = telemetry::prometheus_handle()
        .map(|handle| handle.render())
        .unwrap_or_default();
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(body)
}
