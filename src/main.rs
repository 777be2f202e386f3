//! CLI entry point for devicehub.
//!
//! Exercises the orchestration core against the mock backend:
//! - `discover`: list visible devices
//! - `capture`: initialize one device and capture a single artifact
//! - `batch-capture`: initialize and capture from several devices at once
//! - `hdr`: run a sequenced exposure sweep on one device
//!
//! # Usage
//!
//! ```bash
//! devicehub discover
//! devicehub capture Mock:A
//! devicehub --limit 2 batch-capture Mock:A Mock:B
//! devicehub hdr Mock:A --steps 5 --multiplier 2.0
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use devicehub::backend::mock::MockBackend;
use devicehub::registry::DeviceRegistry;
use devicehub::settings::Settings;
use devicehub::telemetry;

#[derive(Parser)]
#[command(name = "devicehub")]
#[command(about = "Orchestration core for heterogeneous lab hardware", long_about = None)]
struct Cli {
    /// Configuration name (loads config/<name>.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Override the concurrency limit from the configuration
    #[arg(long, global = true)]
    limit: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List devices visible to the registered backends
    Discover {
        /// Only query this backend
        #[arg(long)]
        backend: Option<String>,
    },

    /// Initialize one device and capture a single artifact
    Capture {
        /// Full device name, e.g. Mock:A
        name: String,
    },

    /// Initialize several devices and capture from all of them concurrently
    BatchCapture {
        /// Full device names
        names: Vec<String>,
    },

    /// Run a sequenced exposure sweep on one device
    Hdr {
        /// Full device name, e.g. Mock:A
        name: String,

        /// Number of ladder steps
        #[arg(long, default_value = "3")]
        steps: u32,

        /// Geometric step between exposures
        #[arg(long, default_value = "2.0")]
        multiplier: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings =
        Settings::new(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(limit) = cli.limit {
        settings.concurrency_limit = limit;
    }
    telemetry::init(&settings).context("failed to initialize tracing")?;

    let registry = Arc::new(
        DeviceRegistry::new(settings)
            .context("failed to build device registry")?
            .with_driver(Arc::new(MockBackend::new())),
    );

    match cli.command {
        Commands::Discover { backend } => {
            let devices = registry.discover(backend.as_deref()).await;
            if devices.is_empty() {
                println!("no devices found");
            } else {
                for name in devices {
                    println!("{name}");
                }
            }
        }

        Commands::Capture { name } => {
            registry.initialize(&name, true).await?;
            let artifact = registry.capture(&name).await?;
            println!("{}", artifact.summary());
            registry.close(&name).await?;
        }

        Commands::BatchCapture { names } => {
            let failed = registry.initialize_batch(&names, true).await?;
            if !failed.is_empty() {
                info!(?failed, "some devices failed to initialize");
            }

            let active: Vec<String> = names
                .iter()
                .filter(|n| !failed.contains(n))
                .cloned()
                .collect();
            if !active.is_empty() {
                let report = registry.batch_capture(&active).await?;
                for (name, outcome) in report.iter() {
                    match outcome {
                        Ok(artifact) => println!("{name}: {}", artifact.summary()),
                        Err(err) => println!("{name}: FAILED ({err})"),
                    }
                }
                println!(
                    "{} captured, {} failed",
                    report.success_count(),
                    report.fail_count() + failed.len()
                );
            }
            registry.close_all().await;
        }

        Commands::Hdr {
            name,
            steps,
            multiplier,
        } => {
            registry.initialize(&name, true).await?;
            let sweep = registry.sequenced_capture(&name, steps, multiplier).await?;
            println!(
                "swept {} over {:?} (restored: {})",
                sweep.parameter, sweep.planned, sweep.restored
            );
            for capture in &sweep.captures {
                println!("  {} = {}: {}", sweep.parameter, capture.value, capture.artifact.summary());
            }
            for failure in &sweep.failures {
                println!("  {} = {}: FAILED ({})", sweep.parameter, failure.value, failure.error);
            }
            registry.close(&name).await?;
        }
    }

    Ok(())
}
