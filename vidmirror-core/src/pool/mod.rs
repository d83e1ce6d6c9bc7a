//! Credential pool: rate limiting, worker scheduling, fallback acquisition
//!
//! The platform meters each credential independently, so all throttling
//! state is per-credential and shared through one [`RateLimiter`]. The
//! [`WorkerPool`] drains queues of work units across credentials; the
//! [`FallbackAcquirer`] walks the relay-then-owner chain for one asset at a
//! time.

pub mod fallback;
pub mod ratelimit;
pub mod worker;

pub use fallback::{AcquireOutcome, FallbackAcquirer};
pub use ratelimit::{Availability, CredentialRole, RateLimiter};
pub use worker::{PoolRun, UnitHandler, UnitOutcome, WorkerPool};
