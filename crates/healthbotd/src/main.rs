//! Healthbot daemon.
//!
//! Loads the config, wires in-memory stores into a [`HealthService`] and
//! keeps requesting the periodic tasks until interrupted. The scheduler
//! coalesces the repeated requests, so the refresh interval only bounds how
//! quickly a finished task is requested again.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use healthbot_core::telemetry::init_tracing;
use healthbot_core::{HealthService, HealthbotConfig, LogTransport, Stores};
use tracing::{info, Level};

#[derive(Parser, Debug)]
#[command(name = "healthbotd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "CI health monitoring daemon", long_about = None)]
struct Cli {
    /// Path to the TOML config file; built-in defaults when omitted
    #[arg(short, long, env = "HEALTHBOT_CONFIG")]
    config: Option<PathBuf>,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Seconds between periodic task requests
    #[arg(long, default_value_t = 60)]
    refresh_secs: u64,

    /// Run every task once in the foreground and exit
    #[arg(long)]
    once: bool,
}

fn load_config(path: Option<&Path>) -> Result<HealthbotConfig> {
    match path {
        Some(path) => HealthbotConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(HealthbotConfig::default()),
    }
}

/// One foreground pass over every component, in pipeline order.
async fn run_once(service: &HealthService) -> Result<()> {
    for tracked in &service.config().detection.tracked {
        let found = service
            .detector()
            .check_branch(&tracked.server, &tracked.branch)
            .await?;
        info!(server = %tracked.server, branch = %tracked.branch, new_issues = found, "detection finished");
    }

    let report = service.clusterer().cluster_new_issues().await?;
    info!(%report, "issues converted to defects");

    let report = service.notifier().send_new_notifications().await?;
    info!(sent = report.messages_sent, failed = report.messages_failed, "notifications processed");

    if service.config().cleaner.enabled {
        service.cleaner().clean().await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json, if cli.verbose { Level::DEBUG } else { Level::INFO });

    let config = load_config(cli.config.as_deref())?;
    let service = HealthService::new(config, Stores::in_memory(), Arc::new(LogTransport));

    if cli.once {
        return run_once(&service).await;
    }

    info!(
        tracked = service.config().detection.tracked.len(),
        pollers = service.config().scheduler.pollers,
        "healthbotd started"
    );

    let mut refresh = tokio::time::interval(Duration::from_secs(cli.refresh_secs.max(1)));
    loop {
        tokio::select! {
            _ = refresh.tick() => service.schedule_periodic(),
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for shutdown signal")?;
                info!("shutdown requested");
                break;
            }
        }
    }

    service.stop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["healthbotd"]).unwrap();
        assert!(!cli.once);
        assert!(!cli.json);
        assert_eq!(cli.refresh_secs, 60);
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from([
            "healthbotd",
            "--config",
            "/etc/healthbot.toml",
            "--json",
            "-v",
            "--once",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/healthbot.toml")));
        assert!(cli.json && cli.verbose && cli.once);
    }

    #[test]
    fn test_load_config_defaults_without_path() {
        assert_eq!(load_config(None).unwrap(), HealthbotConfig::default());
    }

    #[test]
    fn test_load_config_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[scheduler]\npollers = 0").unwrap();
        let err = load_config(Some(file.path())).unwrap_err();
        assert!(format!("{err:#}").contains("scheduler.pollers"));
    }

    #[tokio::test]
    async fn test_run_once_on_empty_stores() {
        let service = HealthService::new(
            HealthbotConfig::default(),
            Stores::in_memory(),
            Arc::new(LogTransport),
        );
        run_once(&service).await.unwrap();
        assert!(service.scheduler().task_names().is_empty());
    }
}
