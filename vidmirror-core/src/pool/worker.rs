//! Per-credential worker pool
//!
//! One worker task per usable credential, all draining a shared queue of
//! work units. A rate-limited worker requeues its unit (front of the queue,
//! no retry penalty) and waits out the cooldown; any other ready credential
//! picks the unit up first. Retry behavior is decided exclusively by
//! [`RetryClass`], never by string matching at call sites.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::{sleep, Duration};

use crate::config::ThrottleConfig;
use crate::error::{Error, Result, RetryClass};
use crate::remote::PlatformClient;
use crate::types::FloodIncident;

use super::ratelimit::RateLimiter;

/// One unit's execution against one credential.
#[async_trait]
pub trait UnitHandler<U>: Send + Sync {
    async fn run(&self, unit: &U, client: &dyn PlatformClient) -> Result<()>;
}

/// Terminal disposition of one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    Done,
    /// Container is permanently gone; the caller flags it sticky
    StickyContainer { container_id: i64, reason: String },
    /// The unit itself can never complete
    StickyItem { reason: String },
    /// Fatal for this unit only (store or IO trouble)
    Failed { reason: String },
}

/// Everything one pool run produced.
#[derive(Debug)]
pub struct PoolRun<U> {
    pub outcomes: Vec<(U, UnitOutcome)>,
    pub incidents: Vec<FloodIncident>,
}

impl<U> PoolRun<U> {
    pub fn completed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| *o == UnitOutcome::Done)
            .count()
    }
}

struct Shared<U> {
    queue: Mutex<VecDeque<U>>,
    /// Units not yet terminally disposed (queued or in flight)
    remaining: AtomicUsize,
    notify: Notify,
    outcomes: Mutex<Vec<(U, UnitOutcome)>>,
    incidents: Mutex<Vec<FloodIncident>>,
}

/// What the worker decided for the unit it holds.
enum Disposition {
    Terminal(UnitOutcome),
    Requeue,
}

/// Worker pool over a fixed credential set.
pub struct WorkerPool {
    clients: Vec<Arc<dyn PlatformClient>>,
    limiter: Arc<RateLimiter>,
    throttle: ThrottleConfig,
}

impl WorkerPool {
    pub fn new(
        clients: Vec<Arc<dyn PlatformClient>>,
        limiter: Arc<RateLimiter>,
        throttle: ThrottleConfig,
    ) -> Self {
        Self {
            clients,
            limiter,
            throttle,
        }
    }

    /// Drain `units` to completion across all credentials and return every
    /// unit's disposition.
    pub async fn run<U, H>(&self, units: Vec<U>, handler: Arc<H>) -> PoolRun<U>
    where
        U: Send + Sync + 'static,
        H: UnitHandler<U> + 'static,
    {
        let total = units.len();
        let shared = Arc::new(Shared {
            queue: Mutex::new(units.into()),
            remaining: AtomicUsize::new(total),
            notify: Notify::new(),
            outcomes: Mutex::new(Vec::with_capacity(total)),
            incidents: Mutex::new(Vec::new()),
        });

        let mut workers = JoinSet::new();
        for client in &self.clients {
            let client = client.clone();
            let shared = shared.clone();
            let limiter = self.limiter.clone();
            let handler = handler.clone();
            let throttle = self.throttle.clone();
            workers.spawn(async move {
                worker_loop(client, shared, limiter, handler, throttle).await;
            });
        }

        while workers.join_next().await.is_some() {}

        let shared = Arc::try_unwrap(shared).unwrap_or_else(|_| unreachable!("workers joined"));
        PoolRun {
            outcomes: shared.outcomes.into_inner().unwrap(),
            incidents: shared.incidents.into_inner().unwrap(),
        }
    }
}

async fn worker_loop<U, H>(
    client: Arc<dyn PlatformClient>,
    shared: Arc<Shared<U>>,
    limiter: Arc<RateLimiter>,
    handler: Arc<H>,
    throttle: ThrottleConfig,
) where
    U: Send + Sync + 'static,
    H: UnitHandler<U>,
{
    let credential = client.credential().to_string();

    loop {
        if shared.remaining.load(Ordering::SeqCst) == 0 {
            return;
        }

        // Acquire the credential before taking a unit, so a cooling worker
        // never sits on work another credential could serve. A worker stuck
        // in a long cooldown is released once the run drains.
        tokio::select! {
            usable = limiter.acquire(&credential) => {
                if !usable {
                    return;
                }
            }
            _ = all_done(&shared) => return,
        }

        let unit = shared.queue.lock().unwrap().pop_front();
        let unit = match unit {
            Some(u) => u,
            None => {
                // Units are in flight on other workers; park until one is
                // requeued or everything finishes. Enabling the future
                // before the recheck closes the lost-wakeup window.
                let notified = shared.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if shared.remaining.load(Ordering::SeqCst) == 0 {
                    return;
                }
                if !shared.queue.lock().unwrap().is_empty() {
                    continue;
                }
                notified.await;
                continue;
            }
        };

        let disposition = run_unit(
            &unit,
            client.as_ref(),
            handler.as_ref(),
            &limiter,
            &shared,
            &throttle,
            &credential,
        )
        .await;

        match disposition {
            Disposition::Requeue => {
                // No retry-count penalty; the next acquire waits out the
                // cooldown unless another credential takes the unit first.
                shared.queue.lock().unwrap().push_front(unit);
                shared.notify.notify_waiters();
            }
            Disposition::Terminal(outcome) => {
                shared.outcomes.lock().unwrap().push((unit, outcome));
                if shared.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                    shared.notify.notify_waiters();
                }
            }
        }
    }
}

/// Resolves once every unit has a terminal disposition.
async fn all_done<U>(shared: &Shared<U>) {
    loop {
        let notified = shared.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if shared.remaining.load(Ordering::SeqCst) == 0 {
            return;
        }
        notified.await;
    }
}

/// Execute one unit, retrying transient failures with bounded backoff.
async fn run_unit<U, H>(
    unit: &U,
    client: &dyn PlatformClient,
    handler: &H,
    limiter: &RateLimiter,
    shared: &Shared<U>,
    throttle: &ThrottleConfig,
    credential: &str,
) -> Disposition
where
    U: Send + Sync,
    H: UnitHandler<U>,
{
    let mut attempt: u32 = 0;
    let mut backoff = Duration::from_millis(throttle.retry_base_ms);

    loop {
        match handler.run(unit, client).await {
            Ok(()) => {
                limiter.on_success(credential);
                return Disposition::Terminal(UnitOutcome::Done);
            }
            Err(e) => match e.retry_class() {
                RetryClass::RequeueAfterCooldown => {
                    let seconds = match &e {
                        Error::RateLimited { seconds } => *seconds,
                        _ => 1,
                    };
                    let incident = limiter.on_rate_limited(credential, seconds);
                    shared.incidents.lock().unwrap().push(incident);
                    return Disposition::Requeue;
                }
                RetryClass::RetryBounded => {
                    attempt += 1;
                    if attempt > throttle.max_retries {
                        tracing::warn!(
                            credential,
                            attempts = attempt,
                            error = %e,
                            "Transient failures exhausted retries"
                        );
                        return Disposition::Terminal(UnitOutcome::StickyItem {
                            reason: e.to_string(),
                        });
                    }
                    tracing::debug!(
                        credential,
                        attempt,
                        max = throttle.max_retries,
                        error = %e,
                        "Transient failure, backing off"
                    );
                    sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, Duration::from_secs(30));
                }
                RetryClass::StickyContainer => {
                    let (container_id, reason) = match &e {
                        Error::PermanentContainer {
                            container_id,
                            reason,
                        } => (*container_id, reason.clone()),
                        _ => (0, e.to_string()),
                    };
                    return Disposition::Terminal(UnitOutcome::StickyContainer {
                        container_id,
                        reason,
                    });
                }
                RetryClass::StickyItem => {
                    return Disposition::Terminal(UnitOutcome::StickyItem {
                        reason: e.to_string(),
                    });
                }
                RetryClass::FatalUnit => {
                    tracing::error!(credential, error = %e, "Unit failed fatally");
                    return Disposition::Terminal(UnitOutcome::Failed {
                        reason: e.to_string(),
                    });
                }
            },
        }
    }
}
