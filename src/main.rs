use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tokio::signal;

use zone_alerts::channels::{EmailChannel, SmsChannel};
use zone_alerts::config::Config;
use zone_alerts::db::Repository;
use zone_alerts::engine::{Dispatcher, Engine, EngineSettings, Scheduler};
use zone_alerts::models::CadenceTier;

#[derive(Parser, Debug)]
#[command(name = "zone-alerts")]
#[command(about = "Matches new incidents against alert zones and notifies subscribers")]
#[command(version)]
struct Args {
    /// Config file (defaults to the user config directory)
    #[arg(short, long, env = "ZONE_ALERTS_CONFIG")]
    config: Option<PathBuf>,

    /// Run a single cycle of one tier (immediate, daily, weekly) and exit
    #[arg(long, value_name = "TIER", conflicts_with = "audit")]
    once: Option<CadenceTier>,

    /// Print the delivery history of a subscription as JSON and exit
    #[arg(long, value_name = "SUBSCRIPTION_ID")]
    audit: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    let repository = Arc::new(
        Repository::new(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path))?,
    );

    if let Some(subscription_id) = args.audit {
        let deliveries = repository.deliveries_for_subscription(subscription_id).await?;
        println!("{}", serde_json::to_string_pretty(&deliveries)?);
        return Ok(());
    }

    let mut dispatcher = Dispatcher::new(repository.clone(), config.engine.brand.clone())?;
    if let Some(email) = &config.email {
        dispatcher = dispatcher.with_channel(Arc::new(EmailChannel::new(email)?));
    }
    if let Some(sms) = &config.sms {
        dispatcher = dispatcher.with_channel(Arc::new(SmsChannel::new(sms)?));
    }
    if dispatcher.registered().is_empty() {
        tracing::warn!("No notification channels configured; deliveries will be recorded as failed");
    }

    let engine = Arc::new(Engine::new(
        repository.clone(),
        repository.clone(),
        repository,
        dispatcher,
        EngineSettings::from(&config.engine),
    ));

    if let Some(tier) = args.once {
        let report = engine.run_tier(tier, Utc::now()).await?;
        println!(
            "{}: {} subscriptions, {} delivered, {} already covered, {} without matches, {} failed",
            report.tier,
            report.subscriptions,
            report.delivered,
            report.already_covered,
            report.no_matches,
            report.failed
        );
        return Ok(());
    }

    let mut scheduler = Scheduler::from_config(engine, &config.schedule)?;
    scheduler.start();
    tracing::info!(tiers = ?CadenceTier::ALL, "Alert engine running");

    shutdown_signal().await?;
    tracing::info!("Shutting down");
    scheduler.shutdown().await;
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to install signal handler")?;
        tokio::select! {
            result = signal::ctrl_c() => result.context("Failed to listen for Ctrl+C")?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;

    Ok(())
}
