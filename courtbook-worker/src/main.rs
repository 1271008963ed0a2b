use anyhow::Context;
use clap::{Parser, Subcommand};
use courtbook_booking::BookingManager;
use courtbook_core::OutboxReceiver;
use courtbook_store::app_config::Config;
use courtbook_worker::{dispatch, worker, AppState};
use serde::Serialize;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "courtbook-worker", about = "Court booking maintenance worker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Deliver notifications and sweep expired bookings and offers until interrupted
    Run,
    /// One expiry sweep, then exit
    Sweep,
    /// Compare bookings against the slot cache
    Reconcile {
        /// Write the repaired slot cache and refresh bridge flags
        #[arg(long)]
        apply: bool,
    },
    /// Drop mappings whose booking strings are gone
    PruneMappings,
    /// Override the pending-booking expiry and re-time pending bookings
    SetBookingExpiry { seconds: i64 },
    /// Override the offer expiry and re-time pending offers
    SetOfferExpiry { seconds: i64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courtbook_worker=info,courtbook_booking=info,courtbook_store=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("Failed to load config")?;
    tracing::info!("Using data directory {}", config.storage.data_dir);

    let (state, mut rx) = AppState::from_config(config)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(state, rx).await,
        Command::Sweep => {
            let summary = worker::sweep_once(state.manager.clone()).await?;
            finish(&state, &mut rx, &summary).await
        }
        Command::Reconcile { apply } => {
            let report = blocking(&state, move |m| m.reconcile(apply)).await?;
            finish(&state, &mut rx, &report).await
        }
        Command::PruneMappings => {
            let pruned = blocking(&state, |m| m.prune_orphaned_mappings()).await?;
            finish(&state, &mut rx, &pruned).await
        }
        Command::SetBookingExpiry { seconds } => {
            let retimed = blocking(&state, move |m| m.set_booking_expiry(seconds)).await?;
            finish(&state, &mut rx, &serde_json::json!({ "bookingExpirySeconds": seconds, "retimed": retimed })).await
        }
        Command::SetOfferExpiry { seconds } => {
            let retimed = blocking(&state, move |m| m.set_offer_expiry(seconds)).await?;
            finish(&state, &mut rx, &serde_json::json!({ "offerExpirySeconds": seconds, "retimed": retimed })).await
        }
    }
}

async fn run(state: AppState, rx: OutboxReceiver) -> anyhow::Result<()> {
    let dispatcher = tokio::spawn(dispatch::run_dispatcher(
        rx,
        state.email.clone(),
        state.activity.clone(),
        state.email_timeout(),
    ));
    let sweeper = tokio::spawn(worker::start_expiry_worker(
        state.manager.clone(),
        Duration::from_secs(state.config.worker.sweep_interval_seconds.max(1)),
    ));

    tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");

    sweeper.abort();
    // The dispatcher drains what is queued once the last outbox handle goes away.
    drop(state);
    match tokio::time::timeout(Duration::from_secs(10), dispatcher).await {
        Ok(Ok(stats)) => tracing::info!("Dispatcher finished: {} delivered, {} failed", stats.delivered, stats.failed),
        Ok(Err(e)) => tracing::error!("Dispatcher task failed: {}", e),
        Err(_) => tracing::warn!("Dispatcher did not drain within 10s, pending notifications dropped"),
    }
    Ok(())
}

async fn blocking<T, F>(state: &AppState, op: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&BookingManager) -> courtbook_booking::BookingResult<T> + Send + 'static,
{
    let manager = state.manager.clone();
    let result = tokio::task::spawn_blocking(move || op(&manager)).await?;
    Ok(result?)
}

async fn finish<T: Serialize>(state: &AppState, rx: &mut OutboxReceiver, report: &T) -> anyhow::Result<()> {
    let stats = dispatch::flush(rx, state.email.as_ref(), state.activity.as_ref(), state.email_timeout()).await;
    if stats.failed > 0 {
        tracing::warn!("{} notification(s) could not be delivered", stats.failed);
    }
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}
