mod cli;
mod config;
mod pushgateway;
mod signals;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Cli;
use kibanakit::CancelToken;
use pushgateway::PushGateway;
use reconcile::{Job, Options};

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.log_level.into())
        .format_timestamp_millis()
        .init();

    let mut config = config::load(&cli.config)?;
    let overridden = config::apply_overrides(
        &mut config,
        cli.reconcile_mode.map(Into::into),
        cli.drift_mode.map(Into::into),
    );

    let gateway = PushGateway::from_env()?;

    let mut job = Job::new(
        config,
        Options {
            dry_run: cli.dry_run,
        },
    )
    .context("Failed to create sync job")?;

    let loaded = job.config();
    log::info!(
        "loaded configuration from {} (dry_run={}, environment_targets={}, reconcile_mode={}, drift_mode={})",
        config::absolute(&cli.config).display(),
        job.options().dry_run,
        loaded.uses_environment_targets(),
        loaded.reconcile_mode,
        loaded.drift_mode
    );
    if overridden {
        log::debug!("modes overridden from the command line");
    }

    let cancel = CancelToken::new();
    signals::install(&cancel)?;

    let result = job.run(&cancel);
    let metrics = job.metrics();
    log::info!("run summary: {metrics}");
    if let Ok(json) = serde_json::to_string(&metrics) {
        log::debug!("run summary (json): {json}");
    }

    if let Some(gateway) = &gateway
        && let Err(e) = gateway.push(&metrics, result.is_ok())
    {
        log::warn!("{e:#}");
    }

    result.context("Sync failed")
}
