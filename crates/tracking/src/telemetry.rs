//! Telemetry helpers for tracing spans, Prometheus metrics, and optional console tooling.

use std::{io, panic, path::Path, sync::OnceLock, thread, time::Duration};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{Dispatch, Subscriber};
use tracing_subscriber::{
    Layer,
    filter::{EnvFilter, filter_fn},
    fmt,
    layer::SubscriberExt,
    registry::LookupSpan,
};

use crate::config::TelemetryOptions;

static PROM_HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Keeps the installed subscriber (and the chrome trace writer) alive.
pub struct TelemetryGuard {
    _default_guard: Option<tracing::dispatcher::DefaultGuard>,
    _chrome_guard: Option<tracing_chrome::FlushGuard>,
}

/// Ensure the global metrics recorder is installed and return the Prometheus handle.
///
/// Returns `None` when another recorder already owns the global slot; metrics
/// are then dropped and `/metrics` serves an empty body.
pub fn init_metrics_recorder() -> Option<&'static PrometheusHandle> {
    PROM_HANDLE
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();

            if let Err(err) = metrics::set_global_recorder(recorder) {
                tracing::warn!("metrics recorder not installed: {err}");
                return None;
            }

            let upkeep_handle = handle.clone();
            let upkeep = spawn_thread("prometheus-upkeep", move || {
                loop {
                    thread::sleep(Duration::from_secs(5));
                    upkeep_handle.run_upkeep();
                }
            });
            if let Err(err) = upkeep {
                tracing::warn!("failed to spawn prometheus upkeep thread: {err}");
            }

            Some(handle)
        })
        .as_ref()
}

/// Access the Prometheus handle when already initialised.
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROM_HANDLE.get().and_then(Option::as_ref)
}

/// Install tracing subscribers based on telemetry options.
///
/// The subscriber becomes the global default so Actix worker threads log too.
/// When a global subscriber already exists (tests, embedding) it is scoped to
/// the current thread instead.
pub fn enter_runtime(opts: &TelemetryOptions, verbose: bool) -> TelemetryGuard {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let console_layer = if opts.enable_tokio_console {
        match panic::catch_unwind(|| {
            console_subscriber::ConsoleLayer::builder()
                .with_default_env()
                .spawn()
        }) {
            Ok(layer) => Some(layer),
            Err(_) => {
                tracing::warn!(
                    "tokio-console requested but current build lacks `tokio_unstable`; skipping console layer"
                );
                None
            }
        }
    } else {
        None
    };

    let (chrome_layer, chrome_guard) = match opts.chrome_trace_path.as_ref() {
        Some(path) => match build_chrome_layer(path) {
            Ok((layer, guard)) => (Some(layer), Some(guard)),
            Err(err) => {
                tracing::warn!(
                    "failed to initialise chrome trace writer at {}: {err}",
                    path.display()
                );
                (None, None)
            }
        },
        None => (None, None),
    };

    let console_layer = match (console_layer, chrome_layer.is_some()) {
        (Some(_), true) => {
            tracing::warn!(
                "Chrome trace and tokio-console enabled together; defaulting to chrome trace only"
            );
            None
        }
        (layer, _) => layer,
    };

    let dispatch = match (console_layer, chrome_layer) {
        (Some(console), _) => Dispatch::new(
            tracing_subscriber::registry()
                .with(console)
                .with(fmt_layer(env_filter))
                .with(tracing_error::ErrorLayer::default()),
        ),
        (None, Some(chrome)) => Dispatch::new(
            tracing_subscriber::registry()
                .with(chrome.with_filter(filter_fn(|metadata| metadata.is_span())))
                .with(fmt_layer(env_filter))
                .with(tracing_error::ErrorLayer::default()),
        ),
        (None, None) => Dispatch::new(
            tracing_subscriber::registry()
                .with(fmt_layer(env_filter))
                .with(tracing_error::ErrorLayer::default()),
        ),
    };

    let default_guard = match tracing::dispatcher::set_global_default(dispatch.clone()) {
        Ok(()) => None,
        Err(_) => Some(tracing::dispatcher::set_default(&dispatch)),
    };

    TelemetryGuard {
        _default_guard: default_guard,
        _chrome_guard: chrome_guard,
    }
}

fn fmt_layer<S>(filter: EnvFilter) -> impl Layer<S> + Send + Sync
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fmt::layer()
        .with_target(false)
        .with_timer(fmt::time::uptime())
        .with_filter(filter)
}

/// Spawn a thread that inherits the current tracing dispatcher.
pub fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

fn build_chrome_layer(
    path: &Path,
) -> Result<
    (
        tracing_chrome::ChromeLayer<tracing_subscriber::Registry>,
        tracing_chrome::FlushGuard,
    ),
    io::Error,
> {
    let file = std::fs::File::create(path)?;
    let (layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
        .writer(file)
        .include_args(true)
        .trace_style(tracing_chrome::TraceStyle::Threaded)
        .build();
    Ok((layer, guard))
}
