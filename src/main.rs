//! edgepick binary
//!
//! Usage:
//!   edgepick --config config.toml
//!   edgepick --once --ip 104.16.0.0/24,104.17.0.0/24
//!
//! Runs a single full test, or keeps running the health cycle when
//! `[cron] enable = true`. Stop with Ctrl-C.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use tracing::info;
use tracing_subscriber::layer::Layered;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use edgepick::config::AppConfig;
use edgepick::dns::Publisher;
use edgepick::output::open_log_file;
use edgepick::pipeline::{
    HealthCycleController, PipelineOrchestrator, PublishingRunner, SpeedTestRunner,
};

type FileLayer = fmt::Layer<Registry, fmt::format::DefaultFields, fmt::format::Format, Mutex<File>>;
type FileSlot = reload::Layer<Option<FileLayer>, Registry>;

#[derive(Parser, Debug)]
#[command(name = "edgepick", version)]
#[command(about = "Pick the fastest CDN edge addresses and publish them to DNS")]
struct Args {
    /// Configuration file (defaults to ./config.toml)
    #[arg(long, short, env = "EDGEPICK_CONFIG")]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(long)]
    debug: bool,

    /// Run one full test and exit, even when the health cycle is enabled
    #[arg(long)]
    once: bool,

    /// Inline candidate addresses/ranges, comma-separated
    #[arg(long)]
    ip: Option<String>,
}

/// Parts of the subscriber that depend on the configuration file
struct LogHandles {
    filter: reload::Handle<EnvFilter, Layered<FileSlot, Registry>>,
    file: reload::Handle<Option<FileLayer>, Registry>,
}

impl LogHandles {
    /// Apply `debug` and `log_file` once the configuration is loaded
    fn apply(&self, config: &AppConfig, cli_debug: bool) -> Result<()> {
        if config.debug && !cli_debug {
            self.filter.reload(log_filter(true))?;
        }
        if let Some(path) = config.log_file_path() {
            let file = open_log_file(&path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let layer = fmt::layer().with_ansi(false).with_writer(Mutex::new(file));
            self.file.reload(Some(layer))?;
            info!("Logging to {}", path.display());
        }
        Ok(())
    }
}

fn load_env() {
    let _ = dotenv();
}

fn log_filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if debug {
            "edgepick=debug".into()
        } else {
            "edgepick=info".into()
        }
    })
}

fn init_tracing(debug: bool) -> LogHandles {
    let (file_layer, file): (FileSlot, _) = reload::Layer::new(None);
    let (filter_layer, filter) = reload::Layer::new(log_filter(debug));
    tracing_subscriber::registry()
        .with(file_layer)
        .with(filter_layer)
        .with(fmt::layer())
        .init();
    LogHandles { filter, file }
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    let args = Args::parse();
    let logs = init_tracing(args.debug);

    let mut config = AppConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    logs.apply(&config, args.debug)?;

    if let Some(ip) = args.ip {
        config.ip_text = ip;
    }

    let pipeline = config.pipeline_config();
    let orchestrator =
        PipelineOrchestrator::from_config(&pipeline).context("Invalid probe configuration")?;
    let mut runner = PublishingRunner::new(
        orchestrator,
        pipeline,
        config.health_cycle_config(),
        config.output_config(),
        Publisher::from_config(&config),
    );

    if config.cron.enable && !args.once {
        let mut controller = HealthCycleController::new(runner, config.health_cycle_config());
        controller
            .run_until(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await;
    } else {
        let published = runner.full_test().await;
        info!("Done, {} addresses published", published.len());
    }

    Ok(())
}
