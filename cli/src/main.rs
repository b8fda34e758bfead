// bluecap: desktop driver for the deferred-result core
//
// Plays the part of the Bluetooth stack with a simulated peripheral so scans,
// reads and cancellation can be exercised from a terminal.

mod config;
mod selftest;
mod simulator;

use anyhow::{Context, Result};
use bluecap_core::futures::first_completed;
use bluecap_core::{
    CancelToken, ExecutionContexts, Future, FutureError, FutureResult, Subscription,
};
use clap::{Parser, Subcommand};
use colored::*;
use futures::StreamExt;
use simulator::{Advertisement, SimulatedPeripheral};
use std::future::IntoFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "bluecap")]
#[command(about = "Bluecap: futures and streams for BLE plumbing", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a simulated peripheral with two subscribers
    Scan {
        #[arg(short, long, default_value = "10")]
        count: u32,
        #[arg(short, long, default_value = "100")]
        interval_ms: u64,
        /// Per-subscription backlog (defaults to the configured capacity)
        #[arg(long)]
        capacity: Option<usize>,
        /// Cancel the first subscriber after this many advertisements
        #[arg(long, default_value = "3")]
        cancel_after: usize,
    },
    /// Read the battery level of a simulated peripheral
    Read {
        #[arg(short, long, default_value = "50")]
        latency_ms: u64,
        #[arg(short, long, default_value = "500")]
        timeout_ms: u64,
        /// Make the simulated read fail
        #[arg(long)]
        fail: bool,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run self-tests
    Test,
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load().unwrap_or_default();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_filter)),
        )
        .init();

    match cli.command {
        Commands::Scan {
            count,
            interval_ms,
            capacity,
            cancel_after,
        } => {
            let contexts = build_contexts(&config)?;
            cmd_scan(&contexts, count, interval_ms, capacity, cancel_after).await
        }
        Commands::Read {
            latency_ms,
            timeout_ms,
            fail,
        } => {
            let contexts = build_contexts(&config)?;
            cmd_read(&contexts, latency_ms, timeout_ms, fail).await
        }
        Commands::Config { action } => cmd_config(action),
        Commands::Test => cmd_test(&build_contexts(&config)?),
    }
}

/// Contexts whose pool shares this process's tokio runtime
fn build_contexts(config: &config::Config) -> Result<ExecutionContexts> {
    ExecutionContexts::from_settings_on(&config.contexts, tokio::runtime::Handle::current())
        .context("Failed to build execution contexts")
}

async fn cmd_scan(
    contexts: &ExecutionContexts,
    count: u32,
    interval_ms: u64,
    capacity: Option<usize>,
    cancel_after: usize,
) -> Result<()> {
    let capacity = capacity.or(contexts.stream_capacity());
    let peripheral = SimulatedPeripheral::new("sim-hrm", contexts.pool_context().clone());

    println!(
        "{} {} ({} advertisements, capacity {})",
        "Scanning".bold(),
        peripheral.name().bright_cyan(),
        count,
        config::format_capacity(capacity)
    );
    println!();

    let session = peripheral.scan(count, Duration::from_millis(interval_ms), capacity);
    let advertisements = session.advertisements.clone();

    // Subscriber A: callback on the serial context, cancels itself
    let token = CancelToken::new();
    let seen_by_a = Arc::new(AtomicUsize::new(0));
    {
        let seen = Arc::clone(&seen_by_a);
        let stream = advertisements.clone();
        advertisements.on_success(&contexts.serial(), Some(token), move |adv| {
            let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
            println!("  {} [A] {}", "→".cyan(), adv);
            if n == cancel_after && stream.cancel(token) {
                println!("  {} [A] cancelled after {} advertisements", "✗".yellow(), n);
            }
        });
    }

    // Subscriber B: pull handle drained from this task until the scan ends
    let (mut subscription, _) = advertisements.subscribe(&contexts.immediate());
    let mut seen_by_b = 0usize;
    let mut finished = std::pin::pin!(session.finished.clone().into_future());
    loop {
        tokio::select! {
            entry = subscription.next() => match entry {
                Some(entry) => report_entry(entry, &mut seen_by_b),
                None => break,
            },
            _ = &mut finished => {
                drain_ready(&subscription, &mut seen_by_b);
                break;
            }
        }
    }

    // Let A's serial callbacks catch up before reporting
    Future::spawn(&contexts.serial(), || Ok(()))
        .await
        .context("Serial context stopped")?;

    println!();
    println!("{}", "Summary".bold());
    let summary = [
        ("Subscriber A received", seen_by_a.load(Ordering::SeqCst).to_string()),
        ("Subscriber B received", seen_by_b.to_string()),
        ("Subscriber B dropped", subscription.dropped().to_string()),
        ("Entries retained", advertisements.count().to_string()),
    ];
    for (label, value) in summary {
        println!("  {:<24} {}", label.bright_cyan(), value);
    }

    Ok(())
}

fn report_entry(entry: FutureResult<Advertisement>, seen: &mut usize) {
    match entry {
        Ok(adv) => {
            *seen += 1;
            println!("  {} [B] {}", "→".green(), adv);
        }
        Err(e) => println!("  {} [B] {}", "✗".red(), e),
    }
}

/// Report everything already buffered, failures included
fn drain_ready(subscription: &Subscription<Advertisement>, seen: &mut usize) {
    while let Some(entry) = subscription.try_next() {
        report_entry(entry, seen);
    }
}

async fn cmd_read(
    contexts: &ExecutionContexts,
    latency_ms: u64,
    timeout_ms: u64,
    fail: bool,
) -> Result<()> {
    let pool = contexts.pool();
    let peripheral = SimulatedPeripheral::new("sim-hrm", contexts.pool_context().clone());
    let timeout = Duration::from_millis(timeout_ms);

    println!(
        "{} battery level from {} (latency {}ms, timeout {}ms)",
        "Reading".bold(),
        peripheral.name().bright_cyan(),
        latency_ms,
        timeout_ms
    );

    let read = peripheral.read_battery(Duration::from_millis(latency_ms), fail);
    let timer = Future::after(
        contexts.pool_context(),
        timeout,
        Err(FutureError::Timeout(timeout)),
    );

    let level = first_completed(&pool, [read, timer])
        .map(&pool, simulator::decode_battery_level)
        .map(&pool, |level| Ok(format!("{}%", level)))
        .recover(&pool, |error| match error {
            FutureError::Timeout(after) => Ok(format!("unknown (no answer within {:?})", after)),
            other => Err(other),
        })
        .await
        .context("Battery read failed")?;

    println!("  {} Battery level: {}", "✓".green(), level);
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<20} {}", key.bright_cyan(), value);
            }

            println!();
            println!(
                "  {}",
                format!("File: {}", config::Config::config_file()?.display()).dimmed()
            );
        }
    }

    Ok(())
}

fn cmd_test(contexts: &ExecutionContexts) -> Result<()> {
    println!("{}", "Running self-tests...".bold());
    println!();

    let mut failed = 0;
    for (name, check) in selftest::CHECKS {
        match check(contexts) {
            Ok(()) => println!("{} {}", "✓".green(), name),
            Err(e) => {
                failed += 1;
                println!("{} {}: {:#}", "✗".red(), name, e);
            }
        }
    }

    println!();
    if failed > 0 {
        anyhow::bail!("{} of {} self-tests failed", failed, selftest::CHECKS.len());
    }
    println!("{}", "All tests passed!".green().bold());

    Ok(())
}
