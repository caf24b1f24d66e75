//! Configuration parsing for the tracking server.
//!
//! This module owns translation of CLI arguments into a `TrackerConfig`
//! which the server, the demo reporters and the map presenter use without
//! re-parsing flags.

use std::{
    fs,
    net::IpAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use clap::Args;
use serde_json::Value;

use crate::{
    aggregator::DEFAULT_STALE_AFTER,
    model::Coordinates,
    presenter::{DEFAULT_CENTER, DEFAULT_LIVE_ZOOM, DEFAULT_TRACK_ZOOM, MapPresenter},
    reporter::RetryPolicy,
};

const MAX_ZOOM: u8 = 19;

#[derive(Clone, Debug)]
/// Canonical configuration shared by the server and its background workers.
pub struct TrackerConfig {
    /// Address the HTTP server binds to.
    pub bind: IpAddr,
    pub port: u16,
    /// JSON file loaded as the initial store tree.
    pub seed_path: Option<PathBuf>,
    /// Register demo drivers and replay simulated routes.
    pub demo: bool,
    /// Age after which a driver is shown as OFFLINE.
    pub stale_after: Duration,
    pub presenter: MapPresenter,
    pub retry: RetryPolicy,
    /// Emit verbose logging (every published fix).
    pub verbose: bool,
    pub telemetry: TelemetryOptions,
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing and runtime inspection.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing reporter and server spans.
    pub chrome_trace_path: Option<PathBuf>,
    /// Enable the Tokio console subscriber for live task inspection.
    pub enable_tokio_console: bool,
}

/// CLI arguments accepted by the `serve` subcommand.
#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Address to bind the HTTP server to.
    #[arg(long = "bind", value_name = "ADDR", default_value = "127.0.0.1")]
    pub bind: String,
    /// Port to bind the HTTP server to.
    #[arg(long = "port", value_name = "PORT", default_value_t = 8080)]
    pub port: u16,
    /// JSON file loaded as the initial store tree.
    #[arg(long = "seed", value_name = "PATH")]
    pub seed: Option<PathBuf>,
    /// Register demo drivers and replay simulated routes.
    #[arg(long = "demo", action = clap::ArgAction::SetTrue)]
    pub demo: bool,
    /// Seconds after the last fix before a driver is shown as OFFLINE.
    #[arg(long = "stale-after-secs", value_name = "SECS")]
    pub stale_after_secs: Option<u64>,
    /// Zoom level used by the live map.
    #[arg(long = "live-zoom", value_name = "ZOOM")]
    pub live_zoom: Option<u8>,
    /// Zoom level used by the single-driver map.
    #[arg(long = "track-zoom", value_name = "ZOOM")]
    pub track_zoom: Option<u8>,
    /// Map center used before any driver is known, as `LAT,LNG`.
    #[arg(long = "default-center", value_name = "LAT,LNG")]
    pub default_center: Option<String>,
    /// Attempts per location write, including the first.
    #[arg(long = "write-retries", value_name = "N")]
    pub write_retries: Option<u32>,
    /// Enable verbose logging (every published fix).
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
    /// Enable the Tokio console instrumentation server.
    #[arg(long = "tokio-console", action = clap::ArgAction::SetTrue)]
    pub tokio_console: bool,
}

/// CLI arguments accepted by the `aggregate` subcommand.
#[derive(Debug, Args)]
pub struct AggregateArgs {
    /// JSON file holding a store tree.
    #[arg(long = "seed", value_name = "PATH")]
    pub seed: PathBuf,
    /// Seconds after the last fix before a driver is shown as OFFLINE.
    #[arg(long = "stale-after-secs", value_name = "SECS")]
    pub stale_after_secs: Option<u64>,
}

impl TryFrom<ServeArgs> for TrackerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self> {
        let bind: IpAddr = args
            .bind
            .parse()
            .with_context(|| format!("--bind must be an IP address, got {:?}", args.bind))?;

        let stale_after = stale_after(args.stale_after_secs)?;

        let live_zoom = args.live_zoom.unwrap_or(DEFAULT_LIVE_ZOOM);
        let track_zoom = args.track_zoom.unwrap_or(DEFAULT_TRACK_ZOOM);
        if live_zoom > MAX_ZOOM || track_zoom > MAX_ZOOM {
            bail!("--live-zoom and --track-zoom must be between 0 and {MAX_ZOOM}");
        }

        let default_center = match args.default_center.as_deref() {
            Some(raw) => parse_center(raw)?,
            None => DEFAULT_CENTER,
        };

        let write_retries = args.write_retries.unwrap_or(3);
        if write_retries == 0 {
            bail!("--write-retries must be at least 1");
        }

        if let Some(path) = args.seed.as_ref() {
            if !path.is_file() {
                bail!("--seed file {} does not exist", path.display());
            }
        }

        let telemetry = TelemetryOptions {
            chrome_trace_path: args.chrome_trace,
            enable_tokio_console: args.tokio_console,
        };

        Ok(Self {
            bind,
            port: args.port,
            seed_path: args.seed,
            demo: args.demo,
            stale_after,
            presenter: MapPresenter {
                default_center,
                live_zoom,
                track_zoom,
            },
            retry: RetryPolicy::default().with_attempts(write_retries),
            verbose: args.verbose,
            telemetry,
        })
    }
}

impl TrackerConfig {
    pub fn bind_address(&self) -> (IpAddr, u16) {
        (self.bind, self.port)
    }
}

pub fn stale_after(secs: Option<u64>) -> Result<Duration> {
    match secs {
        None => Ok(DEFAULT_STALE_AFTER),
        Some(0) => bail!("--stale-after-secs must be greater than zero"),
        Some(secs) => Ok(Duration::from_secs(secs)),
    }
}

fn parse_center(raw: &str) -> Result<Coordinates> {
    let (lat, lng) = raw
        .split_once(',')
        .ok_or_else(|| anyhow!("--default-center must look like LAT,LNG"))?;
    let latitude: f64 = lat
        .trim()
        .parse()
        .with_context(|| format!("invalid latitude {lat:?}"))?;
    let longitude: f64 = lng
        .trim()
        .parse()
        .with_context(|| format!("invalid longitude {lng:?}"))?;
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        bail!("--default-center is out of range: {latitude},{longitude}");
    }
    Ok(Coordinates::new(latitude, longitude))
}

/// Read a JSON store tree from disk.
pub fn load_seed(path: &Path) -> Result<Value> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read seed file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("seed file {} is not valid JSON", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> ServeArgs {
        ServeArgs {
            bind: "127.0.0.1".into(),
            port: 8080,
            seed: None,
            demo: false,
            stale_after_secs: None,
            live_zoom: None,
            track_zoom: None,
            default_center: None,
            write_retries: None,
            verbose: false,
            chrome_trace: None,
            tokio_console: false,
        }
    }

    #[test]
    fn defaults_are_applied() {
        let config = TrackerConfig::try_from(args()).unwrap();
        assert_eq!(config.stale_after, Duration::from_secs(300));
        assert_eq!(config.presenter.live_zoom, 13);
        assert_eq!(config.presenter.track_zoom, 15);
        assert_eq!(config.presenter.default_center, DEFAULT_CENTER);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn parses_default_center() {
        let mut raw = args();
        raw.default_center = Some("40.5, -3.25".into());
        let config = TrackerConfig::try_from(raw).unwrap();
        assert_eq!(config.presenter.default_center, Coordinates::new(40.5, -3.25));
    }

    #[test]
    fn rejects_invalid_values() {
        let mut zero_stale = args();
        zero_stale.stale_after_secs = Some(0);
        assert!(TrackerConfig::try_from(zero_stale).is_err());

        let mut zero_retries = args();
        zero_retries.write_retries = Some(0);
        assert!(TrackerConfig::try_from(zero_retries).is_err());

        let mut bad_center = args();
        bad_center.default_center = Some("95,10".into());
        assert!(TrackerConfig::try_from(bad_center).is_err());

        let mut bad_bind = args();
        bad_bind.bind = "localhost:80".into();
        assert!(TrackerConfig::try_from(bad_bind).is_err());

        let mut missing_seed = args();
        missing_seed.seed = Some(PathBuf::from("/nonexistent/seed.json"));
        assert!(TrackerConfig::try_from(missing_seed).is_err());
    }
}
