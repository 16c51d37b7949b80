//! Command line interface for the geoproc engine, built on clap.
//!
//! Defines [`Cli`] with its [`Command`] subcommands and the global flags
//! (--config, --tenant, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// geoproc: run geoprocessing jobs and workflows across execution tiers.
#[derive(Debug, Parser)]
#[command(name = "geoproc", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (defaults to ./geoproc.toml when present).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Tenant that owns catalog reads and writes.
    #[arg(long, global = true, default_value = "default")]
    pub tenant: String,

    /// Enable debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Lists registered processes, or describes one.
    Processes {
        /// Process to describe.
        id: Option<String>,
    },

    /// Runs a single process and waits for it.
    Run {
        /// Process id.
        process: String,

        /// Literal input as name=value. Values are parsed as JSON and fall
        /// back to a plain string.
        #[arg(long = "input", short, value_parser = parse_assignment)]
        inputs: Vec<(String, String)>,

        /// Catalog collection input as name=collection.
        #[arg(long = "catalog", value_parser = parse_assignment)]
        catalog: Vec<(String, String)>,

        /// Publish an output to the catalog as output=collection.
        #[arg(long, value_parser = parse_assignment)]
        publish: Option<(String, String)>,

        /// Seconds until a published output is removed again.
        #[arg(long, requires = "publish")]
        ttl: Option<u64>,

        /// Print the finished job as JSON instead of a summary.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Runs a workflow definition from a JSON or TOML file.
    Workflow {
        file: PathBuf,
    },

    /// Lists persisted jobs, newest first.
    Jobs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },

    /// Runs the built-in demonstration workflow on sample data.
    Demo,
}

/// Splits `name=value` at the first `=`.
pub fn parse_assignment(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected name=value, got {s:?}")),
    }
}
