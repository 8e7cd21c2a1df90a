//! ChainBatch CLI: drive a demo load through the request-coalescing batcher.
//!
//! # Commands
//! ```text
//! chainbatch run    [--items N] [--config <path.json>] [--max-batch-size N]
//!                   [--max-wait-ms MS] [--max-concurrent N] [--permit-policy P]
//!                   [--latency-ms MS] [--fail-batches] [--json]
//! chainbatch config
//!
//! global: --log-level L  --log-component CRATE=L  --log-json
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chainbatch_core::{BatcherConfig, PermitPolicy};
use clap::{Parser, Subcommand};

mod cmd_run;
mod hex;
mod tracing_setup;

use hex::HexConverter;
use tracing_setup::{init_tracing, parse_component, LogConfig};

#[derive(Parser)]
#[command(
    name = "chainbatch",
    about = "Request-coalescing batcher: ChainBatch CLI",
    long_about = "
ChainBatch CLI: submit integers one by one, let the batcher group them by
count or time, and convert each batch to hex with a single worker call.

ENVIRONMENT VARIABLES:
  RUST_LOG    tracing filter, overrides --log-level
",
    version
)]
struct Cli {
    /// Global log level: trace | debug | info | warn | error
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Per-crate level override, repeatable: --log-component chainbatch-engine=debug
    #[arg(long = "log-component", global = true, value_parser = parse_component)]
    log_components: Vec<(String, String)>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a burst of items and print every result
    Run {
        /// Number of items to submit (1..=N)
        #[arg(long, default_value_t = 30)]
        items: u64,
        /// JSON file with a batcher configuration
        #[arg(long)]
        config: Option<PathBuf>,
        /// Seal a batch once it holds this many items
        #[arg(long)]
        max_batch_size: Option<usize>,
        /// Seal a non-empty batch after this many milliseconds
        #[arg(long)]
        max_wait_ms: Option<u64>,
        /// Worker calls allowed to run at once
        #[arg(long)]
        max_concurrent: Option<usize>,
        /// When a dispatch permit is returned: until_complete | until_dispatched
        #[arg(long)]
        permit_policy: Option<PermitPolicy>,
        /// Simulated worker latency per batch
        #[arg(long, default_value_t = 0)]
        latency_ms: u64,
        /// Make the worker fail every batch as a whole
        #[arg(long)]
        fail_batches: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the default batcher configuration as JSON
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(&LogConfig {
        level: cli.log_level.clone(),
        components: cli.log_components.iter().cloned().collect(),
        json: cli.log_json,
    });

    match cli.command {
        Commands::Run {
            items,
            config,
            max_batch_size,
            max_wait_ms,
            max_concurrent,
            permit_policy,
            latency_ms,
            fail_batches,
            json,
        } => {
            let mut cfg = match config {
                Some(path) => load_config(&path)?,
                None => BatcherConfig::default(),
            };
            if let Some(n) = max_batch_size {
                cfg = cfg.with_max_batch_size(n);
            }
            if let Some(ms) = max_wait_ms {
                cfg = cfg.with_max_batch_wait(Duration::from_millis(ms));
            }
            if let Some(n) = max_concurrent {
                cfg = cfg.with_max_concurrent_dispatches(n);
            }
            if let Some(policy) = permit_policy {
                cfg = cfg.with_permit_policy(policy);
            }

            let worker = HexConverter::new()
                .with_latency(Duration::from_millis(latency_ms))
                .with_batch_failures(fail_batches);
            cmd_run::run(cfg, items, worker, json).await
        }

        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&BatcherConfig::default())?);
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> Result<BatcherConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config '{}'", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing config '{}'", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_flags_parse() {
        let cli = Cli::parse_from([
            "chainbatch",
            "--log-level",
            "debug",
            "run",
            "--items",
            "12",
            "--permit-policy",
            "until-dispatched",
            "--fail-batches",
        ]);
        assert_eq!(cli.log_level, "debug");
        assert!(cli.log_components.is_empty());
        match cli.command {
            Commands::Run {
                items,
                permit_policy,
                fail_batches,
                ..
            } => {
                assert_eq!(items, 12);
                assert_eq!(permit_policy, Some(PermitPolicy::UntilDispatched));
                assert!(fail_batches);
            }
            Commands::Config => panic!("expected run"),
        }
    }

    #[test]
    fn log_component_flags_collect() {
        let cli = Cli::parse_from([
            "chainbatch",
            "--log-component",
            "chainbatch-engine=trace",
            "config",
            "--log-component",
            "chainbatch_core=debug",
        ]);
        assert_eq!(
            cli.log_components,
            vec![
                ("chainbatch-engine".to_string(), "trace".to_string()),
                ("chainbatch_core".to_string(), "debug".to_string()),
            ]
        );
        assert!(Cli::try_parse_from(["chainbatch", "--log-component", "engine", "config"]).is_err());
    }

    #[test]
    fn partial_config_file_keeps_defaults() {
        let path = std::env::temp_dir().join(format!("chainbatch-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "max_batch_size": 8 }"#).unwrap();
        let cfg = load_config(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(cfg.max_batch_size, 8);
        assert_eq!(cfg.max_batch_wait_ms, 50);
        assert_eq!(cfg.permit_policy, PermitPolicy::UntilComplete);
    }
}
