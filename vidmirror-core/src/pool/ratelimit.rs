//! Per-credential rate-limit bookkeeping
//!
//! Tracks every credential's cooldown window, success counters, and the
//! self-imposed idle throttle. All timing runs on `tokio::time`, so tests
//! drive the clock with `start_paused` instead of sleeping for real.
//!
//! Two kinds of waiting live here:
//! - platform-imposed cooldowns after a rate-limit response (mandatory,
//!   length dictated by the platform)
//! - self-imposed idle windows after `burst_limit` consecutive successes,
//!   which in practice keep the platform from imposing the former
//!
//! Both are awaited with `sleep_until`; nothing in this module polls.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use tokio::time::{sleep_until, Duration, Instant};

use crate::config::{CredentialConfig, ThrottleConfig};
use crate::types::{CredentialId, FloodIncident};

/// Scheduling role of a credential right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialRole {
    /// Available for work
    Working,
    /// Waiting out a cooldown (platform-imposed or self-imposed)
    Cooling,
    /// Statically excluded by configuration, never scheduled
    Skipped,
}

/// Non-blocking availability probe, used by the fallback chain to skip
/// cooling credentials instead of waiting for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Ready,
    /// Cooling; the remaining wait
    Cooling(Duration),
    Skipped,
}

#[derive(Debug)]
struct CredState {
    cooldown_until: Option<Instant>,
    role: CredentialRole,
    /// Successful calls since the last platform cooldown
    successes_since_cooldown: u64,
    /// Successful calls since the last self-imposed idle window
    successes_since_idle: u64,
    /// When this credential last came out of a cooldown (or started)
    working_since: Instant,
}

impl CredState {
    fn new(skipped: bool) -> Self {
        Self {
            cooldown_until: None,
            role: if skipped {
                CredentialRole::Skipped
            } else {
                CredentialRole::Working
            },
            successes_since_cooldown: 0,
            successes_since_idle: 0,
            working_since: Instant::now(),
        }
    }
}

/// Shared rate-limit state for the whole credential pool.
///
/// Held behind an `Arc` by the worker pool and the fallback chain; all
/// methods take `&self`.
pub struct RateLimiter {
    throttle: ThrottleConfig,
    states: Mutex<HashMap<CredentialId, CredState>>,
}

impl RateLimiter {
    /// Seed state for every configured credential. Excluded credentials are
    /// registered as skipped so the schedulers treat them uniformly.
    pub fn new(throttle: ThrottleConfig, credentials: &[CredentialConfig]) -> Self {
        let states = credentials
            .iter()
            .map(|c| (c.name.clone(), CredState::new(c.excluded)))
            .collect();
        Self {
            throttle,
            states: Mutex::new(states),
        }
    }

    /// Wait until the credential may issue a call. Returns false for
    /// credentials that are statically excluded.
    ///
    /// The wait is a single `sleep_until` per cooldown; a cooldown set while
    /// we sleep (cannot happen for a single-worker credential, but cheap to
    /// handle) just extends the loop.
    pub async fn acquire(&self, id: &str) -> bool {
        loop {
            let deadline = {
                let mut states = self.states.lock().unwrap();
                let state = match states.get_mut(id) {
                    Some(s) => s,
                    None => return false,
                };
                match state.role {
                    CredentialRole::Skipped => return false,
                    _ => {}
                }
                match state.cooldown_until {
                    Some(until) if until > Instant::now() => until,
                    _ => {
                        state.cooldown_until = None;
                        state.role = CredentialRole::Working;
                        return true;
                    }
                }
            };
            sleep_until(deadline).await;
        }
    }

    /// Probe availability without waiting.
    pub fn availability(&self, id: &str) -> Availability {
        let states = self.states.lock().unwrap();
        let state = match states.get(id) {
            Some(s) => s,
            None => return Availability::Skipped,
        };
        match state.role {
            CredentialRole::Skipped => Availability::Skipped,
            _ => match state.cooldown_until {
                Some(until) if until > Instant::now() => {
                    Availability::Cooling(until - Instant::now())
                }
                _ => Availability::Ready,
            },
        }
    }

    /// Shortest remaining cooldown across all non-skipped credentials, for
    /// requeueing a unit no credential can serve right now.
    pub fn min_cooldown_remaining(&self) -> Option<Duration> {
        let states = self.states.lock().unwrap();
        let now = Instant::now();
        states
            .values()
            .filter(|s| s.role != CredentialRole::Skipped)
            .filter_map(|s| s.cooldown_until)
            .filter(|until| *until > now)
            .map(|until| until - now)
            .min()
    }

    /// Record one successful call. After `burst_limit` consecutive successes
    /// the credential self-imposes an idle window, served by the next
    /// [`acquire`](Self::acquire).
    pub fn on_success(&self, id: &str) {
        let mut states = self.states.lock().unwrap();
        let state = match states.get_mut(id) {
            Some(s) => s,
            None => return,
        };
        state.successes_since_cooldown += 1;
        state.successes_since_idle += 1;

        if self.throttle.burst_limit > 0 && state.successes_since_idle >= self.throttle.burst_limit
        {
            tracing::debug!(
                credential = id,
                successes = state.successes_since_idle,
                idle_secs = self.throttle.burst_idle_secs,
                "Burst limit reached, self-throttling"
            );
            state.cooldown_until =
                Some(Instant::now() + Duration::from_secs(self.throttle.burst_idle_secs));
            state.role = CredentialRole::Cooling;
            state.successes_since_idle = 0;
        }
    }

    /// Record a platform-imposed cooldown and produce the diagnostic
    /// incident for telemetry. Resets the success streak.
    pub fn on_rate_limited(&self, id: &str, cooldown_secs: u64) -> FloodIncident {
        let mut states = self.states.lock().unwrap();
        let now = Instant::now();

        let state = states
            .entry(id.to_string())
            .or_insert_with(|| CredState::new(false));

        let incident = FloodIncident {
            credential_id: id.to_string(),
            completed_before: state.successes_since_cooldown,
            elapsed_secs: (now - state.working_since).as_secs(),
            cooldown_secs,
            recorded_at: Utc::now(),
        };

        tracing::warn!(
            credential = id,
            cooldown_secs,
            completed_before = incident.completed_before,
            elapsed_secs = incident.elapsed_secs,
            "Credential rate limited"
        );

        state.cooldown_until = Some(now + Duration::from_secs(cooldown_secs));
        state.role = CredentialRole::Cooling;
        state.successes_since_cooldown = 0;
        state.successes_since_idle = 0;
        state.working_since = now + Duration::from_secs(cooldown_secs);

        incident
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CredentialKind;

    fn credentials() -> Vec<CredentialConfig> {
        vec![
            CredentialConfig {
                name: "relay-1".to_string(),
                kind: CredentialKind::Relay,
                token: None,
                excluded: false,
            },
            CredentialConfig {
                name: "relay-2".to_string(),
                kind: CredentialKind::Relay,
                token: None,
                excluded: true,
            },
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_ready_credential() {
        let limiter = RateLimiter::new(ThrottleConfig::default(), &credentials());
        assert!(limiter.acquire("relay-1").await);
        assert_eq!(limiter.availability("relay-1"), Availability::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_excluded_credential_never_acquires() {
        let limiter = RateLimiter::new(ThrottleConfig::default(), &credentials());
        assert!(!limiter.acquire("relay-2").await);
        assert_eq!(limiter.availability("relay-2"), Availability::Skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_blocks_then_releases() {
        let limiter = RateLimiter::new(ThrottleConfig::default(), &credentials());

        let incident = limiter.on_rate_limited("relay-1", 30);
        assert_eq!(incident.cooldown_secs, 30);
        assert!(matches!(
            limiter.availability("relay-1"),
            Availability::Cooling(_)
        ));

        // acquire must wait out the full cooldown (paused clock auto-advances).
        let start = Instant::now();
        assert!(limiter.acquire("relay-1").await);
        assert!(Instant::now() - start >= Duration::from_secs(30));
        assert_eq!(limiter.availability("relay-1"), Availability::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_throttle_after_limit() {
        let throttle = ThrottleConfig {
            burst_limit: 3,
            burst_idle_secs: 20,
            ..Default::default()
        };
        let limiter = RateLimiter::new(throttle, &credentials());

        limiter.on_success("relay-1");
        limiter.on_success("relay-1");
        assert_eq!(limiter.availability("relay-1"), Availability::Ready);

        // Third success crosses the burst limit.
        limiter.on_success("relay-1");
        assert!(matches!(
            limiter.availability("relay-1"),
            Availability::Cooling(_)
        ));

        let start = Instant::now();
        assert!(limiter.acquire("relay-1").await);
        assert!(Instant::now() - start >= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_incident_counts_successes_since_cooldown() {
        let limiter = RateLimiter::new(ThrottleConfig::default(), &credentials());

        limiter.on_success("relay-1");
        limiter.on_success("relay-1");
        let incident = limiter.on_rate_limited("relay-1", 5);
        assert_eq!(incident.completed_before, 2);

        // Streak resets after the incident.
        limiter.acquire("relay-1").await;
        limiter.on_success("relay-1");
        let incident = limiter.on_rate_limited("relay-1", 5);
        assert_eq!(incident.completed_before, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_cooldown_remaining() {
        let limiter = RateLimiter::new(ThrottleConfig::default(), &credentials());
        assert_eq!(limiter.min_cooldown_remaining(), None);

        limiter.on_rate_limited("relay-1", 40);
        let min = limiter.min_cooldown_remaining().unwrap();
        assert!(min <= Duration::from_secs(40));
        assert!(min > Duration::from_secs(39));
    }
}
