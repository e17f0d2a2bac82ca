//! # CLI Interface
//!
//! Command-line arguments for `order-node`, via `clap` derive. Three
//! subcommands: `run`, `init`, and `version`.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::logging::LogFormat;

/// RBFT ordering node.
///
/// Runs the ordering layer on a single replica with the solo engine,
/// archives committed blocks, and serves a small HTTP API with
/// Prometheus metrics.
#[derive(Parser, Debug)]
#[command(
    name = "order-node",
    about = "RBFT ordering node",
    version,
    propagate_version = true
)]
pub struct OrderNodeCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Run(RunArgs),
    /// Write a fresh replica key and a single-replica `order.toml`.
    Init(InitArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the ordering configuration (TOML).
    #[arg(long, short = 'c', env = "ORDER_CONFIG", default_value = "order.toml")]
    pub config: PathBuf,

    /// File holding this replica's hex-encoded Ed25519 secret key.
    #[arg(long, short = 'k', env = "ORDER_KEY", default_value = "replica.key")]
    pub key: PathBuf,

    /// Port for the HTTP API and `/metrics`.
    #[arg(long, env = "ORDER_API_PORT", default_value_t = 9801)]
    pub api_port: u16,

    /// Log output format.
    #[arg(long, env = "ORDER_LOG_FORMAT", value_enum, default_value_t = LogArg::Pretty)]
    pub log_format: LogArg,

    /// Default filter directives when `RUST_LOG` is unset.
    #[arg(long, default_value = "order_node=info,rbft_order=info,tower_http=info")]
    pub log_level: String,
}

/// Arguments for the `init` subcommand.
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Directory to write `order.toml` and `replica.key` into.
    #[arg(long, short = 'd', default_value = ".")]
    pub dir: PathBuf,

    /// Replica id to configure.
    #[arg(long, default_value_t = 1)]
    pub id: u64,

    /// Overwrite existing files.
    #[arg(long)]
    pub force: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogArg {
    Pretty,
    Json,
}

impl From<LogArg> for LogFormat {
    fn from(arg: LogArg) -> Self {
        match arg {
            LogArg::Pretty => LogFormat::Pretty,
            LogArg::Json => LogFormat::Json,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        OrderNodeCli::command().debug_assert();
    }

    #[test]
    fn run_defaults() {
        let cli = OrderNodeCli::try_parse_from(["order-node", "run"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.config, PathBuf::from("order.toml"));
        assert_eq!(args.key, PathBuf::from("replica.key"));
        assert_eq!(args.log_format, LogArg::Pretty);
    }

    #[test]
    fn json_log_format_parses() {
        let cli =
            OrderNodeCli::try_parse_from(["order-node", "run", "--log-format", "json"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(LogFormat::from(args.log_format), LogFormat::Json);
    }
}
