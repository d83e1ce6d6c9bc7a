//! vidmirror-sync - CLI tool to catch the local mirror up with the remote
//! platform
//!
//! Selects candidate containers (counters say items are missing), runs
//! bounded catch-up scans across the credential pool, and optionally
//! extends history depth (backfill) and fetches pending preview assets.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/vidmirror/mirror.db
//! - Logs: $XDG_STATE_HOME/vidmirror/vidmirror.log
//! - Config: $XDG_CONFIG_HOME/vidmirror/config.toml

mod process_lock;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use indicatif::{ProgressBar, ProgressStyle};
use process_lock::acquire_sync_guard;

use vidmirror_core::remote::{GatewayClient, PlatformClient};
use vidmirror_core::sync::SyncSummary;
use vidmirror_core::types::CredentialKind;
use vidmirror_core::{Config, Database, SyncEngine};

#[derive(Parser)]
#[command(name = "vidmirror-sync")]
#[command(about = "Catch the local media mirror up with the remote platform")]
#[command(version)]
struct Args {
    /// Verbose output (-v per-container results)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Max candidate containers per pass
    #[arg(long, default_value = "25")]
    limit: usize,

    /// Also extend history depth below the oldest known entries
    #[arg(long)]
    backfill: bool,

    /// Also stage items into the relay container and fetch pending assets
    #[arg(long)]
    assets: bool,

    /// Dry run - list candidates but don't scan
    #[arg(long)]
    dry_run: bool,

    /// Watch mode - continuously sync instead of one-shot
    #[arg(short, long)]
    watch: bool,

    /// Poll interval in seconds (only with --watch)
    #[arg(long, default_value = "300")]
    poll: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Ensure XDG environment variables are set before using core library
    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard =
        vidmirror_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("vidmirror-sync starting");

    // Resolve database path and enforce process-level exclusivity for it.
    let db_path = Config::database_path();
    let _sync_guard = acquire_sync_guard(&db_path).context("failed to acquire process lock")?;

    tracing::info!(path = %db_path.display(), "Opening database");
    let db = Database::open(&db_path).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;
    let db = Arc::new(db);

    println!("Database: {}", db_path.display());

    if args.dry_run {
        let candidates = db.containers_needing_catchup(args.limit)?;
        println!("Candidates ({}):", candidates.len());
        for id in candidates {
            let counters = db.counters(id)?.unwrap_or_default();
            println!(
                "  {}: {} missing ({} remote, {} indexed, {} duplicate)",
                id,
                counters.missing(),
                counters.remote_total,
                counters.indexed,
                counters.duplicate
            );
        }
        println!("\nDry run - no sync performed");
        tracing::info!("Dry run complete");
        return Ok(());
    }

    let clients = build_clients(&config)?;
    println!("Credentials: {} usable", clients.len());

    let engine = SyncEngine::new(db.clone(), &config, clients);

    if args.watch {
        run_watch_mode(&engine, &db, &args).await
    } else {
        let summary = run_single_pass(&engine, &db, &args).await?;
        print_summary(&summary, args.verbose);
        Ok(())
    }
}

/// Build one gateway client per usable credential.
fn build_clients(config: &Config) -> Result<Vec<(CredentialKind, Arc<dyn PlatformClient>)>> {
    let mut clients: Vec<(CredentialKind, Arc<dyn PlatformClient>)> = Vec::new();
    for cred in config.credentials.iter().filter(|c| !c.excluded) {
        let client = GatewayClient::new(&config.gateway, cred, &config.throttle)
            .with_context(|| format!("failed to create client for credential '{}'", cred.name))?;
        clients.push((cred.kind, Arc::new(client)));
    }
    if clients.is_empty() {
        anyhow::bail!("no usable credentials configured - add [[credentials]] to config.toml");
    }
    Ok(clients)
}

/// One full pass: catch-up, then optional backfill and asset work.
async fn run_single_pass(engine: &SyncEngine, db: &Database, args: &Args) -> Result<SyncSummary> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap(),
    );
    pb.enable_steady_tick(Duration::from_millis(120));

    pb.set_message("catching up...");
    let summary = engine.run_all(args.limit).await.context("catch-up failed")?;

    if args.backfill {
        pb.set_message("backfilling...");
        for container_id in db.containers_for_backfill(args.limit)? {
            if let Err(e) = engine.run_backfill(container_id).await {
                tracing::warn!(container_id, error = %e, "Backfill failed");
            }
        }
    }

    if args.assets {
        pb.set_message("staging relay...");
        let staged = engine.stage_for_relay(args.limit).await?;
        pb.set_message("fetching assets...");
        let assets = engine.fetch_pending_assets(args.limit).await?;
        pb.finish_and_clear();
        println!(
            "Assets: {} staged, {} fetched, {} absent, {} no access, {} deferred",
            staged, assets.fetched, assets.absent, assets.no_access, assets.deferred
        );
    } else {
        pb.finish_and_clear();
    }

    Ok(summary)
}

/// Run continuous watch mode
async fn run_watch_mode(engine: &SyncEngine, db: &Database, args: &Args) -> Result<()> {
    // Set up signal handler for graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        eprintln!("\nShutting down...");
        r.store(false, Ordering::SeqCst);
    })
    .context("failed to set Ctrl+C handler")?;

    println!(
        "Watch mode active (poll every {}s). Press Ctrl+C to stop.",
        args.poll
    );
    println!();

    let mut iteration = 0u64;

    while running.load(Ordering::SeqCst) {
        iteration += 1;

        let summary = run_single_pass(engine, db, args).await?;

        // Only print if there were changes
        if summary.new_count > 0 || summary.gap_filled > 0 || summary.skipped_containers > 0 {
            let timestamp = chrono::Local::now().format("%H:%M:%S");
            println!(
                "[{}] Synced: {} containers, {} new, {} gap-filled",
                timestamp,
                summary.containers.len(),
                summary.new_count,
                summary.gap_filled
            );
            if args.verbose >= 1 {
                for result in &summary.containers {
                    if result.new_count + result.gap_filled > 0 {
                        println!(
                            "  {}: +{} new, +{} gap-filled ({:?})",
                            result.container_id,
                            result.new_count,
                            result.gap_filled,
                            result.final_state
                        );
                    }
                }
            }

            tracing::info!(
                iteration,
                containers = summary.containers.len(),
                new = summary.new_count,
                "watch sync iteration"
            );
        }

        // Sleep until next poll, waking early on shutdown.
        let mut slept = 0;
        while slept < args.poll && running.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(1)).await;
            slept += 1;
        }
    }

    println!("Watch mode stopped.");
    tracing::info!("vidmirror-sync watch mode stopped");

    Ok(())
}

/// Print pass summary
fn print_summary(summary: &SyncSummary, verbose: u8) {
    println!("\nSync complete:");
    println!("  Containers scanned:  {}", summary.containers.len());
    println!("  New items:           {}", summary.new_count);
    println!("  Gaps filled:         {}", summary.gap_filled);
    println!("  Containers skipped:  {}", summary.skipped_containers);
    println!("  Runs failed:         {}", summary.failed);
    println!("  Flood incidents:     {}", summary.flood_incidents);

    if verbose >= 1 && !summary.containers.is_empty() {
        println!("\nPer container:");
        for result in &summary.containers {
            println!(
                "  {}: {} processed, {} new, {} gap-filled, {:?}",
                result.container_id,
                result.processed,
                result.new_count,
                result.gap_filled,
                result.final_state
            );
        }
    }
}
