use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kube::CustomResourceExt;
use secmeta_kubehub::get_kube_client;
use secmeta_schema::{builtin_defaults, defaults_from_yaml, ScanPipeline};
use tracing::{error, info, warn};

mod config;
mod engine;
mod telemetry;

use config::{Cli, Commands, EngineConfig};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    telemetry::init_tracing(&cli.global.log_level);
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "secmetad failed");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let engine = match cli.command {
        Commands::Crd => {
            print!("{}", serde_yaml::to_string(&ScanPipeline::crd()).context("encoding CRD")?);
            return Ok(());
        }
        Commands::PodProcessor => {
            let cfg = Arc::new(EngineConfig::from_args(&cli.global, true)?);
            telemetry::init_metrics(cli.global.metrics_addr);
            engine::start_pod_processor(cfg, get_kube_client().await?).await?
        }
        Commands::ImageProcessor => {
            let cfg = Arc::new(EngineConfig::from_args(&cli.global, true)?);
            telemetry::init_metrics(cli.global.metrics_addr);
            engine::start_image_processor(cfg, get_kube_client().await?).await?
        }
        Commands::PipelineController { defaults_file, resync_interval_secs } => {
            let cfg = Arc::new(EngineConfig::from_args(&cli.global, false)?);
            if resync_interval_secs == 0 {
                anyhow::bail!("--resync-interval-secs must be positive");
            }
            let defaults = match defaults_file {
                Some(path) => {
                    let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
                    defaults_from_yaml(&raw).with_context(|| format!("loading {}", path.display()))?
                }
                None => builtin_defaults(),
            };
            telemetry::init_metrics(cli.global.metrics_addr);
            engine::start_pipeline_controller(cfg, get_kube_client().await?, defaults, Duration::from_secs(resync_interval_secs)).await?
        }
    };
    shutdown_signal().await;
    engine.stop().await;
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("interrupt received"),
                    _ = term.recv() => info!("SIGTERM received"),
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM; waiting for Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupt received");
    }
}
