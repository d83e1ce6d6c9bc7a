//! vidmirror-reconcile - rebuild the derived per-container counters
//!
//! Resets every counter row and recomputes it from the mention log in a
//! single transaction. Counters are scheduling hints only, so this is
//! always safe to run; it exists for recovery after suspected drift
//! (crash mid-batch, manual database surgery).

mod process_lock;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use process_lock::acquire_reconcile_guard;

use vidmirror_core::sync::CounterReconciler;
use vidmirror_core::{Config, Database};

#[derive(Parser)]
#[command(name = "vidmirror-reconcile")]
#[command(about = "Rebuild derived counters from the mention log")]
#[command(version)]
struct Args {
    /// Verbose output
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Rebuild a single container instead of all of them
    #[arg(long)]
    container: Option<i64>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard =
        vidmirror_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("vidmirror-reconcile starting");

    let db_path = Config::database_path();
    let _guard = acquire_reconcile_guard(&db_path).context("failed to acquire process lock")?;

    let db = Database::open(&db_path).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;
    let db = std::sync::Arc::new(db);

    println!("Database: {}", db_path.display());

    let reconciler = CounterReconciler::new(db.clone());

    if let Some(container_id) = args.container {
        reconciler
            .rebuild(container_id)
            .with_context(|| format!("failed to rebuild counters for container {container_id}"))?;
        let counters = db.counters(container_id)?.unwrap_or_default();
        println!(
            "Container {}: {} remote, {} indexed, {} duplicate, {} missing",
            container_id,
            counters.remote_total,
            counters.indexed,
            counters.duplicate,
            counters.missing()
        );
        tracing::info!(container_id, "Counter rebuild complete");
        return Ok(());
    }

    match reconciler.rebuild_all().context("counter rebuild failed")? {
        Some(containers) => {
            println!("Rebuilt counters for {containers} containers");
            tracing::info!(containers, "Full counter rebuild complete");
        }
        None => {
            // try_lock lost the race against an in-process rebuild; with the
            // process lock held this should not happen, but report it anyway.
            println!("Another rebuild is already in progress, nothing done");
        }
    }

    if args.verbose >= 1 {
        for container_id in db.containers_needing_catchup(10_000)? {
            let counters = db.counters(container_id)?.unwrap_or_default();
            println!(
                "  {}: {} missing ({} remote, {} indexed, {} duplicate)",
                container_id,
                counters.missing(),
                counters.remote_total,
                counters.indexed,
                counters.duplicate
            );
        }
    }

    Ok(())
}
