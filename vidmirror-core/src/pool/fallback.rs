//! Credential fallback chain for asset acquisition
//!
//! Relay credentials try the staged copy in the relay container first; the
//! owner session reads from the origin container as the slow path of last
//! resort. The first success wins and the rest of the chain is never
//! touched.
//!
//! Outcome classification happens only once the chain is exhausted: a gone
//! verdict ([`Error::PermanentItem`]) from one credential does not end the
//! walk, since a pruned relay copy can be gone while the origin still serves
//! the asset. With no success, at least one gone verdict makes the asset
//! `Absent` (sticky); "every credential was refused" is `NoAccess` and may
//! be retried in a later run once container membership or permissions
//! change.

use std::sync::{Arc, Mutex};

use crate::db::repo::AssetTask;
use crate::error::{Error, Result};
use crate::remote::PlatformClient;
use crate::types::{CredentialKind, FloodIncident};

use super::ratelimit::{Availability, RateLimiter};

/// What the chain concluded about one asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Asset bytes in hand
    Fetched(Vec<u8>),
    /// Deleted at the source; never retry
    Absent,
    /// No credential can currently reach it; retry in a later run
    NoAccess,
}

/// Ordered chain of per-credential clients sharing one rate limiter.
pub struct FallbackAcquirer {
    chain: Vec<(CredentialKind, Arc<dyn PlatformClient>)>,
    limiter: Arc<RateLimiter>,
    /// Relay container id, if staging is configured
    relay_container: Option<i64>,
    /// Incidents observed during acquisition, drained by the caller for
    /// persistence
    incidents: Mutex<Vec<FloodIncident>>,
}

impl FallbackAcquirer {
    /// Build the chain. Relays are tried before the owner regardless of the
    /// order credentials were supplied in.
    pub fn new(
        mut clients: Vec<(CredentialKind, Arc<dyn PlatformClient>)>,
        limiter: Arc<RateLimiter>,
        relay_container: Option<i64>,
    ) -> Self {
        clients.sort_by_key(|(kind, _)| match kind {
            CredentialKind::Relay => 0,
            CredentialKind::Owner => 1,
        });
        Self {
            chain: clients,
            limiter,
            relay_container,
            incidents: Mutex::new(Vec::new()),
        }
    }

    /// Incidents recorded since the last drain.
    pub fn take_incidents(&self) -> Vec<FloodIncident> {
        std::mem::take(&mut self.incidents.lock().unwrap())
    }

    /// Walk the chain for one asset. Cooling credentials are skipped, not
    /// waited for; if every usable credential was cooling the unit comes
    /// back as [`Error::RateLimited`] with the shortest remaining cooldown
    /// so the caller requeues it without penalty.
    pub async fn acquire(&self, task: &AssetTask) -> Result<AcquireOutcome> {
        let mut any_cooling = false;
        let mut any_gone = false;

        for (kind, client) in &self.chain {
            let credential = client.credential();

            match self.limiter.availability(credential) {
                Availability::Skipped => continue,
                Availability::Cooling(_) => {
                    any_cooling = true;
                    continue;
                }
                Availability::Ready => {}
            }

            match self.try_credential(*kind, client.as_ref(), task).await {
                Ok(Some(bytes)) => {
                    self.limiter.on_success(credential);
                    return Ok(AcquireOutcome::Fetched(bytes));
                }
                // This credential cannot see the asset; the next one might.
                Ok(None) => {}
                Err(Error::PermanentItem(reason)) => {
                    tracing::info!(
                        credential,
                        content_id = %task.content_id,
                        %reason,
                        "Asset gone at this location, falling through"
                    );
                    any_gone = true;
                }
                Err(Error::RateLimited { seconds }) => {
                    let incident = self.limiter.on_rate_limited(credential, seconds);
                    self.incidents.lock().unwrap().push(incident);
                    any_cooling = true;
                }
                Err(Error::PermanentContainer { container_id, reason }) => {
                    tracing::debug!(
                        credential,
                        container_id,
                        %reason,
                        "Credential denied, falling through"
                    );
                }
                Err(Error::TransientRemote(reason)) => {
                    tracing::debug!(
                        credential,
                        %reason,
                        "Transient failure, falling through"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        // A cooling credential may still succeed once its cooldown ends, so
        // requeue outranks the sticky verdicts.
        if any_cooling {
            let seconds = self
                .limiter
                .min_cooldown_remaining()
                .map(|d| d.as_secs().max(1))
                .unwrap_or(1);
            return Err(Error::RateLimited { seconds });
        }

        if any_gone {
            return Ok(AcquireOutcome::Absent);
        }
        Ok(AcquireOutcome::NoAccess)
    }

    /// One credential's attempt: resolve the entry at the location this
    /// credential can read, then download its asset.
    async fn try_credential(
        &self,
        kind: CredentialKind,
        client: &dyn PlatformClient,
        task: &AssetTask,
    ) -> Result<Option<Vec<u8>>> {
        let (container_id, sequence_id) = match kind {
            CredentialKind::Relay => match (self.relay_container, task.relay_sequence_id) {
                (Some(relay), Some(seq)) => (relay, seq),
                // Not staged into the relay; relay credentials cannot help.
                _ => return Ok(None),
            },
            CredentialKind::Owner => (task.origin_container_id, task.origin_sequence_id),
        };

        let entry = match client.get_entry(container_id, sequence_id).await? {
            Some(entry) => entry,
            // The entry disappeared at this location; stale mention or
            // pruned relay copy.
            None => return Ok(None),
        };

        let asset_ref = match entry.media.and_then(|m| m.asset_ref) {
            Some(r) => r,
            None => return Ok(None),
        };

        let bytes = client.download_asset(&asset_ref).await?;
        Ok(Some(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CredentialConfig, ThrottleConfig};
    use crate::remote::{Page, RemoteContainer, RemoteEntry, RemoteMedia};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed,
        DenyContainer,
        RateLimit(u64),
        AssetGone,
    }

    struct FakeClient {
        name: String,
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl FakeClient {
        fn new(name: &str, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                behavior,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PlatformClient for FakeClient {
        fn credential(&self) -> &str {
            &self.name
        }

        async fn get_container(&self, _id: i64) -> Result<RemoteContainer> {
            unimplemented!("not used by the fallback chain")
        }

        async fn list_history(&self, _c: i64, _b: Option<i64>, _l: u32) -> Result<Page> {
            unimplemented!("not used by the fallback chain")
        }

        async fn get_entry(&self, container_id: i64, sequence_id: i64) -> Result<Option<RemoteEntry>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::DenyContainer => Err(Error::PermanentContainer {
                    container_id,
                    reason: "revoked".to_string(),
                }),
                Behavior::RateLimit(secs) => Err(Error::RateLimited { seconds: secs }),
                _ => Ok(Some(RemoteEntry {
                    sequence_id,
                    ts: None,
                    sender: None,
                    media: Some(RemoteMedia {
                        content_id: "a".to_string(),
                        size_bytes: 1,
                        duration_secs: 1,
                        asset_ref: Some("ref-a".to_string()),
                    }),
                })),
            }
        }

        async fn forward_entry(&self, _f: i64, _s: i64, _t: i64) -> Result<i64> {
            unimplemented!("not used by the fallback chain")
        }

        async fn download_asset(&self, _asset_ref: &str) -> Result<Vec<u8>> {
            match self.behavior {
                Behavior::Succeed => Ok(vec![1, 2, 3]),
                Behavior::AssetGone => {
                    Err(Error::PermanentItem("asset absent at source".to_string()))
                }
                Behavior::DenyContainer => unreachable!(),
                Behavior::RateLimit(secs) => Err(Error::RateLimited { seconds: secs }),
            }
        }
    }

    fn limiter(names: &[&str]) -> Arc<RateLimiter> {
        let creds: Vec<CredentialConfig> = names
            .iter()
            .map(|n| CredentialConfig {
                name: n.to_string(),
                kind: CredentialKind::Relay,
                token: None,
                excluded: false,
            })
            .collect();
        Arc::new(RateLimiter::new(ThrottleConfig::default(), &creds))
    }

    fn task_staged() -> AssetTask {
        AssetTask {
            content_id: "a".to_string(),
            asset_ref: None,
            relay_sequence_id: Some(77),
            origin_container_id: 1,
            origin_sequence_id: 10,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_success_short_circuits() {
        let relay = FakeClient::new("relay-1", Behavior::Succeed);
        let owner = FakeClient::new("owner", Behavior::Succeed);
        let acquirer = FallbackAcquirer::new(
            vec![
                (CredentialKind::Owner, owner.clone() as Arc<dyn PlatformClient>),
                (CredentialKind::Relay, relay.clone() as Arc<dyn PlatformClient>),
            ],
            limiter(&["relay-1", "owner"]),
            Some(-100),
        );

        let outcome = acquirer.acquire(&task_staged()).await.unwrap();
        assert_eq!(outcome, AcquireOutcome::Fetched(vec![1, 2, 3]));

        // Relay ran despite being supplied second; the owner never did.
        assert_eq!(relay.calls(), 1);
        assert_eq!(owner.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_falls_through_to_owner() {
        let relay = FakeClient::new("relay-1", Behavior::DenyContainer);
        let owner = FakeClient::new("owner", Behavior::Succeed);
        let acquirer = FallbackAcquirer::new(
            vec![
                (CredentialKind::Relay, relay as Arc<dyn PlatformClient>),
                (CredentialKind::Owner, owner.clone() as Arc<dyn PlatformClient>),
            ],
            limiter(&["relay-1", "owner"]),
            Some(-100),
        );

        let outcome = acquirer.acquire(&task_staged()).await.unwrap();
        assert_eq!(outcome, AcquireOutcome::Fetched(vec![1, 2, 3]));
        assert_eq!(owner.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gone_on_one_credential_falls_through() {
        // A pruned relay copy reports the asset gone while a second relay
        // still serves it; the fetch must succeed without waking the owner.
        let relay1 = FakeClient::new("relay-1", Behavior::AssetGone);
        let relay2 = FakeClient::new("relay-2", Behavior::Succeed);
        let owner = FakeClient::new("owner", Behavior::Succeed);
        let acquirer = FallbackAcquirer::new(
            vec![
                (CredentialKind::Relay, relay1.clone() as Arc<dyn PlatformClient>),
                (CredentialKind::Relay, relay2.clone() as Arc<dyn PlatformClient>),
                (CredentialKind::Owner, owner.clone() as Arc<dyn PlatformClient>),
            ],
            limiter(&["relay-1", "relay-2", "owner"]),
            Some(-100),
        );

        let outcome = acquirer.acquire(&task_staged()).await.unwrap();
        assert_eq!(outcome, AcquireOutcome::Fetched(vec![1, 2, 3]));
        assert_eq!(relay1.calls(), 1);
        assert_eq!(relay2.calls(), 1);
        assert_eq!(owner.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gone_everywhere_is_sticky_absent() {
        let relay = FakeClient::new("relay-1", Behavior::AssetGone);
        let owner = FakeClient::new("owner", Behavior::AssetGone);
        let acquirer = FallbackAcquirer::new(
            vec![
                (CredentialKind::Relay, relay.clone() as Arc<dyn PlatformClient>),
                (CredentialKind::Owner, owner.clone() as Arc<dyn PlatformClient>),
            ],
            limiter(&["relay-1", "owner"]),
            Some(-100),
        );

        // Every credential was asked before the verdict became terminal.
        let outcome = acquirer.acquire(&task_staged()).await.unwrap();
        assert_eq!(outcome, AcquireOutcome::Absent);
        assert_eq!(relay.calls(), 1);
        assert_eq!(owner.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_denied_is_no_access() {
        let relay = FakeClient::new("relay-1", Behavior::DenyContainer);
        let owner = FakeClient::new("owner", Behavior::DenyContainer);
        let acquirer = FallbackAcquirer::new(
            vec![
                (CredentialKind::Relay, relay as Arc<dyn PlatformClient>),
                (CredentialKind::Owner, owner as Arc<dyn PlatformClient>),
            ],
            limiter(&["relay-1", "owner"]),
            Some(-100),
        );

        let outcome = acquirer.acquire(&task_staged()).await.unwrap();
        assert_eq!(outcome, AcquireOutcome::NoAccess);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_rate_limited_requeues_with_min_cooldown() {
        let relay = FakeClient::new("relay-1", Behavior::RateLimit(40));
        let owner = FakeClient::new("owner", Behavior::RateLimit(10));
        let acquirer = FallbackAcquirer::new(
            vec![
                (CredentialKind::Relay, relay as Arc<dyn PlatformClient>),
                (CredentialKind::Owner, owner as Arc<dyn PlatformClient>),
            ],
            limiter(&["relay-1", "owner"]),
            Some(-100),
        );

        let err = acquirer.acquire(&task_staged()).await.unwrap_err();
        match err {
            Error::RateLimited { seconds } => assert!(seconds <= 10),
            other => panic!("expected RateLimited, got {:?}", other),
        }

        let incidents = acquirer.take_incidents();
        assert_eq!(incidents.len(), 2);
        assert!(acquirer.take_incidents().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unstaged_task_skips_relay_credentials() {
        let relay = FakeClient::new("relay-1", Behavior::Succeed);
        let owner = FakeClient::new("owner", Behavior::Succeed);
        let acquirer = FallbackAcquirer::new(
            vec![
                (CredentialKind::Relay, relay.clone() as Arc<dyn PlatformClient>),
                (CredentialKind::Owner, owner.clone() as Arc<dyn PlatformClient>),
            ],
            limiter(&["relay-1", "owner"]),
            Some(-100),
        );

        let task = AssetTask {
            relay_sequence_id: None,
            ..task_staged()
        };
        let outcome = acquirer.acquire(&task).await.unwrap();
        assert_eq!(outcome, AcquireOutcome::Fetched(vec![1, 2, 3]));
        assert_eq!(relay.calls(), 0);
        assert_eq!(owner.calls(), 1);
    }
}
