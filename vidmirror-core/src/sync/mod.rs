//! Synchronization engine
//!
//! Wires the scanner, the counter reconciler, and the credential pool into
//! the operations the CLI drives: catch-up across candidate containers,
//! backfill, relay staging, and pending-asset acquisition. Candidate
//! selection is counter-driven: only containers whose counters say items
//! are still missing get scanned, so a quiescent mirror costs nothing.

pub mod cursor;
pub mod reconcile;
pub mod scanner;

pub use cursor::HistoryCursor;
pub use reconcile::CounterReconciler;
pub use scanner::Scanner;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::config::{Config, ScanConfig, ThrottleConfig};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::pool::{AcquireOutcome, FallbackAcquirer, RateLimiter, UnitHandler, UnitOutcome, WorkerPool};
use crate::remote::PlatformClient;
use crate::types::{AssetState, CredentialKind, RunResult};

/// Aggregate outcome of one `run_all` pass.
#[derive(Debug, Default)]
pub struct SyncSummary {
    /// Per-container results, in completion order
    pub containers: Vec<RunResult>,
    pub new_count: u64,
    pub gap_filled: u64,
    /// Containers newly flagged with a sticky skip
    pub skipped_containers: usize,
    /// Containers whose run was abandoned (retries exhausted or store error)
    pub failed: usize,
    pub flood_incidents: usize,
}

/// Outcome of one asset-acquisition pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AssetSummary {
    pub fetched: usize,
    pub absent: usize,
    pub no_access: usize,
    /// Left pending because every credential was cooling
    pub deferred: usize,
    pub failed: usize,
}

pub struct SyncEngine {
    db: Arc<Database>,
    scan: ScanConfig,
    throttle: ThrottleConfig,
    relay_container: Option<i64>,
    clients: Vec<(CredentialKind, Arc<dyn PlatformClient>)>,
    limiter: Arc<RateLimiter>,
    reconciler: CounterReconciler,
    assets_dir: PathBuf,
}

impl SyncEngine {
    pub fn new(
        db: Arc<Database>,
        config: &Config,
        clients: Vec<(CredentialKind, Arc<dyn PlatformClient>)>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(
            config.throttle.clone(),
            &config.credentials,
        ));
        Self {
            db: db.clone(),
            scan: config.scan.clone(),
            throttle: config.throttle.clone(),
            relay_container: config.relay.container_id,
            clients,
            limiter,
            reconciler: CounterReconciler::new(db),
            assets_dir: Config::data_dir().join("assets"),
        }
    }

    /// Override where fetched preview assets are written.
    pub fn with_assets_dir(mut self, dir: PathBuf) -> Self {
        self.assets_dir = dir;
        self
    }

    pub fn reconciler(&self) -> &CounterReconciler {
        &self.reconciler
    }

    fn client_list(&self) -> Vec<Arc<dyn PlatformClient>> {
        self.clients.iter().map(|(_, c)| c.clone()).collect()
    }

    /// First credential that is not statically excluded.
    fn any_client(&self) -> Result<&Arc<dyn PlatformClient>> {
        self.clients
            .iter()
            .map(|(_, c)| c)
            .find(|c| {
                !matches!(
                    self.limiter.availability(c.credential()),
                    crate::pool::Availability::Skipped
                )
            })
            .ok_or_else(|| Error::Config("no usable credentials configured".to_string()))
    }

    /// One-shot catch-up for a single container.
    pub async fn run_catchup(&self, container_id: i64) -> Result<RunResult> {
        let client = self.any_client()?.clone();
        self.limiter.acquire(client.credential()).await;

        let scanner = Scanner::new(&self.db, &self.scan);
        match scanner.catch_up(client.as_ref(), container_id).await {
            Ok(result) => {
                self.limiter.on_success(client.credential());
                Ok(result)
            }
            Err(e) => {
                self.note_run_error(container_id, client.credential(), &e)?;
                Err(e)
            }
        }
    }

    /// One-shot backfill for a single container.
    pub async fn run_backfill(&self, container_id: i64) -> Result<RunResult> {
        let client = self.any_client()?.clone();
        self.limiter.acquire(client.credential()).await;

        let scanner = Scanner::new(&self.db, &self.scan);
        match scanner.backfill(client.as_ref(), container_id).await {
            Ok(result) => {
                self.limiter.on_success(client.credential());
                Ok(result)
            }
            Err(e) => {
                self.note_run_error(container_id, client.credential(), &e)?;
                Err(e)
            }
        }
    }

    /// Side effects an errored direct run leaves behind before propagating.
    fn note_run_error(&self, container_id: i64, credential: &str, e: &Error) -> Result<()> {
        match e {
            Error::PermanentContainer { reason, .. } => {
                self.db.mark_container_skipped(container_id, reason)?;
                tracing::warn!(container_id, %reason, "Container skipped permanently");
            }
            Error::RateLimited { seconds } => {
                let incident = self.limiter.on_rate_limited(credential, *seconds);
                self.db.record_flood_incident(&incident)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Counter-driven catch-up across up to `limit` candidate containers,
    /// bounded by `container_concurrency` and the credential pool.
    pub async fn run_all(&self, limit: usize) -> Result<SyncSummary> {
        let candidates = self.db.containers_needing_catchup(limit)?;
        tracing::info!(candidates = candidates.len(), "Catch-up candidates selected");
        if candidates.is_empty() {
            return Ok(SyncSummary::default());
        }

        let handler = Arc::new(CatchupHandler {
            db: self.db.clone(),
            scan: self.scan.clone(),
            containers_in_flight: Semaphore::new(self.scan.container_concurrency),
            results: Mutex::new(Vec::new()),
        });
        let pool = WorkerPool::new(self.client_list(), self.limiter.clone(), self.throttle.clone());
        let run = pool.run(candidates, handler.clone()).await;

        let mut summary = SyncSummary::default();
        for (container_id, outcome) in &run.outcomes {
            match outcome {
                UnitOutcome::Done => {}
                UnitOutcome::StickyContainer { container_id: cid, reason } => {
                    let id = if *cid != 0 { *cid } else { *container_id };
                    self.db.mark_container_skipped(id, reason)?;
                    tracing::warn!(container_id = id, %reason, "Container skipped permanently");
                    summary.skipped_containers += 1;
                }
                UnitOutcome::StickyItem { reason } => {
                    tracing::warn!(container_id, %reason, "Container run abandoned");
                    summary.failed += 1;
                }
                UnitOutcome::Failed { reason } => {
                    tracing::error!(container_id, %reason, "Container run failed");
                    summary.failed += 1;
                }
            }
        }

        for incident in &run.incidents {
            self.db.record_flood_incident(incident)?;
        }
        summary.flood_incidents = run.incidents.len();

        let results = std::mem::take(&mut *handler.results.lock().unwrap());
        summary.new_count = results.iter().map(|r| r.new_count).sum();
        summary.gap_filled = results.iter().map(|r| r.gap_filled).sum();
        summary.containers = results;

        tracing::info!(
            containers = summary.containers.len(),
            new = summary.new_count,
            gap_filled = summary.gap_filled,
            skipped = summary.skipped_containers,
            failed = summary.failed,
            flood_incidents = summary.flood_incidents,
            "Catch-up pass complete"
        );
        Ok(summary)
    }

    /// Forward unstaged items into the relay container through the owner
    /// credential, so relay credentials can serve their assets later.
    pub async fn stage_for_relay(&self, limit: usize) -> Result<usize> {
        let Some(relay) = self.relay_container else {
            return Ok(0);
        };
        let Some((_, owner)) = self
            .clients
            .iter()
            .find(|(kind, _)| *kind == CredentialKind::Owner)
        else {
            tracing::debug!("No owner credential, relay staging disabled");
            return Ok(0);
        };

        let tasks = self.db.items_needing_relay(limit)?;
        let mut staged = 0;

        for task in &tasks {
            if !self.limiter.acquire(owner.credential()).await {
                break;
            }
            match owner
                .forward_entry(task.origin_container_id, task.origin_sequence_id, relay)
                .await
            {
                Ok(sequence_id) => {
                    self.db.set_relay_sequence(&task.content_id, sequence_id)?;
                    self.limiter.on_success(owner.credential());
                    staged += 1;
                }
                Err(Error::RateLimited { seconds }) => {
                    let incident = self.limiter.on_rate_limited(owner.credential(), seconds);
                    self.db.record_flood_incident(&incident)?;
                    // The item stays unstaged; the next pass retries it.
                }
                Err(Error::PermanentItem(reason)) => {
                    tracing::info!(content_id = %task.content_id, %reason, "Source entry gone");
                    self.db.set_asset_state(&task.content_id, AssetState::Absent)?;
                }
                Err(e) => {
                    tracing::debug!(content_id = %task.content_id, error = %e, "Staging failed");
                }
            }
        }

        tracing::info!(staged, of = tasks.len(), "Relay staging pass complete");
        Ok(staged)
    }

    /// Fetch preview assets for pending items through the fallback chain,
    /// writing the bytes under the assets directory.
    pub async fn fetch_pending_assets(&self, limit: usize) -> Result<AssetSummary> {
        let tasks = self.db.pending_assets(limit)?;
        if tasks.is_empty() {
            return Ok(AssetSummary::default());
        }
        std::fs::create_dir_all(&self.assets_dir)?;

        let acquirer = FallbackAcquirer::new(
            self.clients.clone(),
            self.limiter.clone(),
            self.relay_container,
        );

        let mut summary = AssetSummary::default();
        let total = tasks.len();

        for (i, task) in tasks.iter().enumerate() {
            match acquirer.acquire(task).await {
                Ok(AcquireOutcome::Fetched(bytes)) => {
                    std::fs::write(self.assets_dir.join(&task.content_id), &bytes)?;
                    self.db.set_asset_state(&task.content_id, AssetState::Fetched)?;
                    summary.fetched += 1;
                }
                Ok(AcquireOutcome::Absent) => {
                    self.db.set_asset_state(&task.content_id, AssetState::Absent)?;
                    summary.absent += 1;
                }
                Ok(AcquireOutcome::NoAccess) => {
                    self.db.set_asset_state(&task.content_id, AssetState::NoAccess)?;
                    summary.no_access += 1;
                }
                Err(Error::RateLimited { seconds }) => {
                    // Whole chain is cooling; stop the pass, the rest stays
                    // pending for the next run.
                    tracing::info!(
                        wait_secs = seconds,
                        remaining = total - i,
                        "All credentials cooling, deferring remaining assets"
                    );
                    summary.deferred = total - i;
                    break;
                }
                Err(e) => {
                    tracing::error!(content_id = %task.content_id, error = %e, "Asset fetch failed");
                    summary.failed += 1;
                }
            }
        }

        for incident in acquirer.take_incidents() {
            self.db.record_flood_incident(&incident)?;
        }

        tracing::info!(
            fetched = summary.fetched,
            absent = summary.absent,
            no_access = summary.no_access,
            deferred = summary.deferred,
            "Asset pass complete"
        );
        Ok(summary)
    }
}

/// Worker-pool handler: one unit = one container catch-up.
struct CatchupHandler {
    db: Arc<Database>,
    scan: ScanConfig,
    containers_in_flight: Semaphore,
    results: Mutex<Vec<RunResult>>,
}

#[async_trait]
impl UnitHandler<i64> for CatchupHandler {
    async fn run(&self, container_id: &i64, client: &dyn PlatformClient) -> Result<()> {
        let _permit = self
            .containers_in_flight
            .acquire()
            .await
            .map_err(|_| Error::TransientRemote("scheduler stopped".to_string()))?;

        let result = Scanner::new(&self.db, &self.scan)
            .catch_up(client, *container_id)
            .await?;
        self.results.lock().unwrap().push(result);
        Ok(())
    }
}
