use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracking::{AggregateArgs, ServeArgs, aggregate, config};

/// Campus bus tracker: live maps fed by driver GPS reporters.
#[derive(Debug, Parser)]
#[command(name = "bus-tracker", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP server with the live map, tracking pages and driver portal.
    Serve(ServeArgs),
    /// Print the aggregated active-driver view of a store tree as JSON.
    Aggregate(AggregateArgs),
}

/// One-shot aggregation over a seed file, useful for checking exports.
pub fn run_aggregate(args: AggregateArgs) -> Result<()> {
    let stale_after = config::stale_after(args.stale_after_secs)?;
    let seed = config::load_seed(&args.seed)?;
    let view = aggregate(seed.pointer("/drivers"), Utc::now(), stale_after);
    let rendered = serde_json::to_string_pretty(&view).context("failed to encode view")?;
    println!("{rendered}");
    Ok(())
}
