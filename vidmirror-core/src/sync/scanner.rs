//! Catch-up and backfill scanning
//!
//! One scanner, parameterized by policy, covers both walk directions:
//!
//! - **Catch-up** walks backward from the newest entry and stops after
//!   `stop_threshold` consecutive locally-known items. Any new item resets
//!   the streak: sparse history (upstream deletions) means one unseen item
//!   says nothing about what lies before it, but an unbroken run of knowns
//!   is strong evidence the mirror is current. A full scan costs
//!   O(threshold + new_count) remote calls instead of O(container size).
//!
//! - **Backfill** walks strictly older than the oldest known entry. Known
//!   runs carry no evidence in all-unknown territory, so termination is a
//!   double empty-page confirmation at the oldest boundary instead; that
//!   verdict is durable and the container is never backfilled again.
//!
//! New items are buffered and persisted in batches; the cursor acknowledges
//! only after a flush, so an aborted run replays at most one batch of
//! idempotent upserts.

use chrono::Utc;

use crate::config::ScanConfig;
use crate::db::Database;
use crate::error::Result;
use crate::remote::{PlatformClient, RemoteEntry, RemoteMedia};
use crate::types::{AssetState, Item, Mention, RunResult, ScanStop};

use super::cursor::HistoryCursor;

pub struct Scanner<'a> {
    db: &'a Database,
    policy: &'a ScanConfig,
}

/// Mutable accumulator for one run.
struct RunState {
    container_id: i64,
    buffer: Vec<(Item, Mention)>,
    processed: u64,
    new_count: u64,
    gap_filled: u64,
}

impl RunState {
    fn new(container_id: i64) -> Self {
        Self {
            container_id,
            buffer: Vec::new(),
            processed: 0,
            new_count: 0,
            gap_filled: 0,
        }
    }

    fn mirrored(&self) -> u64 {
        self.new_count + self.gap_filled
    }

    fn into_result(self, final_state: ScanStop) -> RunResult {
        RunResult {
            container_id: self.container_id,
            processed: self.processed,
            new_count: self.new_count,
            gap_filled: self.gap_filled,
            final_state,
        }
    }
}

impl<'a> Scanner<'a> {
    pub fn new(db: &'a Database, policy: &'a ScanConfig) -> Self {
        Self { db, policy }
    }

    /// Catch-up run for one container. Loads the known-id set once, walks
    /// from the newest entry, and stops on threshold, cap, or exhaustion.
    pub async fn catch_up(
        &self,
        client: &dyn PlatformClient,
        container_id: i64,
    ) -> Result<RunResult> {
        let known = self.db.known_sequence_ids(container_id)?;
        let newest_known = known.iter().copied().max();

        let mut cursor = HistoryCursor::from_newest(client, container_id, self.policy.page_size);
        let mut state = RunState::new(container_id);
        let mut consecutive_known: u32 = 0;
        let mut first_page = true;

        let stop = 'walk: loop {
            let page = match cursor.next_page().await {
                Ok(p) => p,
                Err(e) => {
                    // Keep what we have; the requeued run resumes cheaply
                    // because these ids become known.
                    self.flush(&mut state, &mut cursor)?;
                    return Err(e);
                }
            };

            if first_page {
                first_page = false;
                if let Some(total) = page.total {
                    self.db.set_remote_total(container_id, total)?;
                }
                if let Some(ts) = page.entries.first().and_then(|e| e.ts) {
                    self.db.touch_last_activity(container_id, ts)?;
                }
            }

            if page.entries.is_empty() {
                break ScanStop::StoppedByExhaustion;
            }

            for entry in &page.entries {
                let Some(media) = &entry.media else {
                    continue;
                };
                state.processed += 1;

                if known.contains(&entry.sequence_id) {
                    consecutive_known += 1;
                    if consecutive_known >= self.policy.stop_threshold {
                        break 'walk ScanStop::StoppedByThreshold;
                    }
                } else {
                    consecutive_known = 0;
                    match newest_known {
                        Some(n) if entry.sequence_id < n => state.gap_filled += 1,
                        _ => state.new_count += 1,
                    }
                    state.buffer.push(to_item_mention(container_id, entry, media));

                    if let Some(cap) = self.policy.per_run_cap {
                        if state.mirrored() >= cap {
                            break 'walk ScanStop::StoppedByCap;
                        }
                    }
                    if state.buffer.len() >= self.policy.persist_batch {
                        self.flush(&mut state, &mut cursor)?;
                    }
                }
            }
        };

        self.flush(&mut state, &mut cursor)?;
        self.db.touch_last_scan(container_id)?;

        let result = state.into_result(stop);
        tracing::info!(
            container_id,
            processed = result.processed,
            new = result.new_count,
            gap_filled = result.gap_filled,
            stop = ?result.final_state,
            "Catch-up run finished"
        );
        Ok(result)
    }

    /// Backfill run: extend history depth below the oldest known entry.
    /// Containers with nothing mirrored yet have no anchor and are served
    /// by catch-up instead.
    pub async fn backfill(
        &self,
        client: &dyn PlatformClient,
        container_id: i64,
    ) -> Result<RunResult> {
        // The terminal flag holds for direct invocations too, not just for
        // the scheduling query that filters retired containers out.
        if let Some(container) = self.db.get_container(container_id)? {
            if container.history_exhausted {
                return Ok(RunState::new(container_id).into_result(ScanStop::StoppedByExhaustion));
            }
        }

        let anchor = match self.db.oldest_known_sequence_id(container_id)? {
            Some(a) => a,
            None => {
                return Ok(RunState::new(container_id).into_result(ScanStop::StoppedByExhaustion))
            }
        };

        let known = self.db.known_sequence_ids(container_id)?;
        let mut cursor =
            HistoryCursor::older_than(client, container_id, anchor, self.policy.page_size);
        let mut state = RunState::new(container_id);
        let mut empty_streak: u32 = 0;

        let stop = 'walk: loop {
            let page = match cursor.next_page().await {
                Ok(p) => p,
                Err(e) => {
                    self.flush(&mut state, &mut cursor)?;
                    return Err(e);
                }
            };

            if page.entries.is_empty() {
                empty_streak += 1;
                if empty_streak >= 2 {
                    // Confirmed: nothing older exists. Durable and terminal.
                    self.db.mark_history_exhausted(container_id)?;
                    tracing::info!(container_id, "History exhausted, backfill retired");
                    break ScanStop::StoppedByExhaustion;
                }
                continue;
            }
            empty_streak = 0;

            for entry in &page.entries {
                let Some(media) = &entry.media else {
                    continue;
                };
                state.processed += 1;

                // A previous backfill may have mirrored part of this range.
                if known.contains(&entry.sequence_id) {
                    continue;
                }
                state.gap_filled += 1;
                state.buffer.push(to_item_mention(container_id, entry, media));

                if let Some(cap) = self.policy.per_run_cap {
                    if state.mirrored() >= cap {
                        break 'walk ScanStop::StoppedByCap;
                    }
                }
                if state.buffer.len() >= self.policy.persist_batch {
                    self.flush(&mut state, &mut cursor)?;
                }
            }
        };

        self.flush(&mut state, &mut cursor)?;

        let result = state.into_result(stop);
        tracing::info!(
            container_id,
            mirrored = result.gap_filled,
            stop = ?result.final_state,
            "Backfill run finished"
        );
        Ok(result)
    }

    /// Persist the buffered batch, bump counters, and acknowledge the
    /// cursor up to here.
    fn flush(&self, state: &mut RunState, cursor: &mut HistoryCursor<'_>) -> Result<()> {
        if !state.buffer.is_empty() {
            let batch = std::mem::take(&mut state.buffer);
            let stats = self.db.record_batch(&batch)?;
            self.db.bump_counters(state.container_id, &stats)?;
        }
        cursor.ack_page();
        Ok(())
    }
}

fn to_item_mention(container_id: i64, entry: &RemoteEntry, media: &RemoteMedia) -> (Item, Mention) {
    (
        Item {
            content_id: media.content_id.clone(),
            size_bytes: media.size_bytes,
            duration_secs: media.duration_secs,
            asset_ref: media.asset_ref.clone(),
            hidden: false,
            asset_state: AssetState::Pending,
            relay_sequence_id: None,
            first_seen_at: Utc::now(),
        },
        Mention {
            container_id,
            sequence_id: entry.sequence_id,
            content_id: media.content_id.clone(),
            ts: entry.ts,
            sender: entry.sender.clone(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{Page, RemoteContainer};
    use crate::types::{Container, ContainerKind};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted remote container: a fixed set of media entries addressed by
    /// sequence id, served in descending pages.
    struct FakeHistory {
        name: String,
        /// (sequence_id, content_id), any order
        entries: Vec<(i64, String)>,
        total: Option<i64>,
        fetches: AtomicUsize,
    }

    impl FakeHistory {
        fn new(entries: Vec<(i64, String)>, total: Option<i64>) -> Self {
            let mut entries = entries;
            entries.sort_by_key(|(s, _)| std::cmp::Reverse(*s));
            Self {
                name: "relay-1".to_string(),
                entries,
                total,
                fetches: AtomicUsize::new(0),
            }
        }

        fn uniform(range: std::ops::RangeInclusive<i64>) -> Self {
            Self::new(range.map(|s| (s, format!("v{}", s))).collect(), None)
        }
    }

    #[async_trait]
    impl PlatformClient for FakeHistory {
        fn credential(&self) -> &str {
            &self.name
        }

        async fn get_container(&self, _id: i64) -> Result<RemoteContainer> {
            unimplemented!()
        }

        async fn list_history(
            &self,
            _container_id: i64,
            before: Option<i64>,
            limit: u32,
        ) -> Result<Page> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let entries = self
                .entries
                .iter()
                .filter(|(s, _)| before.map_or(true, |b| *s < b))
                .take(limit as usize)
                .map(|(sequence_id, content_id)| RemoteEntry {
                    sequence_id: *sequence_id,
                    ts: None,
                    sender: None,
                    media: Some(RemoteMedia {
                        content_id: content_id.clone(),
                        size_bytes: 100,
                        duration_secs: 10,
                        asset_ref: Some(format!("ref-{}", content_id)),
                    }),
                })
                .collect();
            Ok(Page {
                entries,
                total: self.total,
            })
        }

        async fn get_entry(&self, _c: i64, _s: i64) -> Result<Option<RemoteEntry>> {
            unimplemented!()
        }
        async fn forward_entry(&self, _f: i64, _s: i64, _t: i64) -> Result<i64> {
            unimplemented!()
        }
        async fn download_asset(&self, _r: &str) -> Result<Vec<u8>> {
            unimplemented!()
        }
    }

    fn test_db(container_id: i64) -> Database {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db.upsert_container(&Container {
            id: container_id,
            name: None,
            kind: ContainerKind::Channel,
            active: true,
            last_activity_at: None,
            last_scan_at: None,
            skipped: false,
            skip_reason: None,
            history_exhausted: false,
        })
        .unwrap();
        db
    }

    /// Seed local mentions (sequence_id, content_id) and rebuild counters.
    fn seed(db: &Database, container_id: i64, mentions: &[(i64, &str)]) {
        let batch: Vec<(Item, Mention)> = mentions
            .iter()
            .map(|(seq, cid)| {
                to_item_mention(
                    container_id,
                    &RemoteEntry {
                        sequence_id: *seq,
                        ts: None,
                        sender: None,
                        media: None,
                    },
                    &RemoteMedia {
                        content_id: cid.to_string(),
                        size_bytes: 100,
                        duration_secs: 10,
                        asset_ref: None,
                    },
                )
            })
            .collect();
        db.record_batch(&batch).unwrap();
        db.recompute_counters(container_id).unwrap();
    }

    fn policy(threshold: u32, cap: Option<u64>) -> ScanConfig {
        ScanConfig {
            stop_threshold: threshold,
            per_run_cap: cap,
            page_size: 20,
            container_concurrency: 1,
            persist_batch: 8,
        }
    }

    #[tokio::test]
    async fn test_fresh_container_fully_mirrored() {
        let db = test_db(1);
        let client = FakeHistory::uniform(1..=10);
        let policy = policy(30, None);

        let result = Scanner::new(&db, &policy).catch_up(&client, 1).await.unwrap();
        assert_eq!(result.new_count, 10);
        assert_eq!(result.gap_filled, 0);
        assert_eq!(result.final_state, ScanStop::StoppedByExhaustion);
        assert_eq!(db.known_sequence_ids(1).unwrap().len(), 10);
        assert_eq!(db.counters(1).unwrap().unwrap().indexed, 10);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent_and_stops_by_threshold() {
        let db = test_db(1);
        let client = FakeHistory::uniform(1..=50);
        let policy = policy(5, None);

        let first = Scanner::new(&db, &policy).catch_up(&client, 1).await.unwrap();
        assert_eq!(first.new_count, 50);

        let second = Scanner::new(&db, &policy).catch_up(&client, 1).await.unwrap();
        assert_eq!(second.new_count, 0);
        assert_eq!(second.final_state, ScanStop::StoppedByThreshold);
        // Stops within the first `stop_threshold` items.
        assert_eq!(second.processed, 5);
        assert_eq!(db.counters(1).unwrap().unwrap().indexed, 50);
    }

    #[tokio::test]
    async fn test_new_item_resets_the_known_streak() {
        let db = test_db(1);
        // Remote 26..=50; locally everything except 45 is known. Walking
        // down: 50..46 known (5), 45 new (reset), 44..35 known (10) -> stop.
        let client = FakeHistory::uniform(26..=50);
        let local: Vec<(i64, String)> = (26..=50)
            .filter(|s| *s != 45)
            .map(|s| (s, format!("v{}", s)))
            .collect();
        let local_refs: Vec<(i64, &str)> = local.iter().map(|(s, c)| (*s, c.as_str())).collect();
        seed(&db, 1, &local_refs);

        let policy = policy(10, None);
        let result = Scanner::new(&db, &policy).catch_up(&client, 1).await.unwrap();

        // The hole below the newest known id counts as gap fill, and the
        // scan must not stop before reaching it.
        assert_eq!(result.gap_filled, 1);
        assert_eq!(result.new_count, 0);
        assert_eq!(result.final_state, ScanStop::StoppedByThreshold);
        assert!(db.known_sequence_ids(1).unwrap().contains(&45));
    }

    #[tokio::test]
    async fn test_per_run_cap_stops_early() {
        let db = test_db(1);
        let client = FakeHistory::uniform(1..=10);
        let policy = policy(30, Some(3));

        let result = Scanner::new(&db, &policy).catch_up(&client, 1).await.unwrap();
        assert_eq!(result.new_count, 3);
        assert_eq!(result.final_state, ScanStop::StoppedByCap);
        assert_eq!(db.known_sequence_ids(1).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_backfill_mirrors_older_history_then_retires() {
        let db = test_db(1);
        let client = FakeHistory::uniform(1..=60);
        let local: Vec<(i64, String)> = (50..=60).map(|s| (s, format!("v{}", s))).collect();
        let local_refs: Vec<(i64, &str)> = local.iter().map(|(s, c)| (*s, c.as_str())).collect();
        seed(&db, 1, &local_refs);

        let policy = policy(30, None);
        let result = Scanner::new(&db, &policy).backfill(&client, 1).await.unwrap();

        assert_eq!(result.gap_filled, 49);
        assert_eq!(result.final_state, ScanStop::StoppedByExhaustion);
        assert_eq!(db.known_sequence_ids(1).unwrap().len(), 60);

        // Two empty confirmations at the oldest boundary retire the
        // container from backfill for good.
        assert!(db.get_container(1).unwrap().unwrap().history_exhausted);
        assert!(db.containers_for_backfill(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backfill_never_rewalks_exhausted_container() {
        let db = test_db(1);
        let client = FakeHistory::uniform(1..=60);
        let local: Vec<(i64, String)> = (50..=60).map(|s| (s, format!("v{}", s))).collect();
        let local_refs: Vec<(i64, &str)> = local.iter().map(|(s, c)| (*s, c.as_str())).collect();
        seed(&db, 1, &local_refs);
        db.mark_history_exhausted(1).unwrap();

        let policy = policy(30, None);
        let result = Scanner::new(&db, &policy).backfill(&client, 1).await.unwrap();

        // The terminal flag stops a direct backfill cold: no remote calls,
        // nothing mirrored below the anchor.
        assert_eq!(result.processed, 0);
        assert_eq!(result.gap_filled, 0);
        assert_eq!(result.final_state, ScanStop::StoppedByExhaustion);
        assert_eq!(client.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(db.known_sequence_ids(1).unwrap().len(), 11);
    }

    #[tokio::test]
    async fn test_backfill_without_anchor_is_a_noop() {
        let db = test_db(1);
        let client = FakeHistory::uniform(1..=10);
        let policy = policy(30, None);

        let result = Scanner::new(&db, &policy).backfill(&client, 1).await.unwrap();
        assert_eq!(result.processed, 0);
        assert!(!db.get_container(1).unwrap().unwrap().history_exhausted);
    }

    #[tokio::test]
    async fn test_catchup_scenario_with_hole_and_duplicate() {
        let db = test_db(1);

        // Remote: media at 1..=970, a duplicate mention at 999 (same content
        // as 400), and five new entries 1001..=1005. Sequences 971..998 and
        // 1000 carry no media. Platform reports 1000 items in total.
        let mut remote: Vec<(i64, String)> = (1..=970).map(|s| (s, format!("v{}", s))).collect();
        remote.push((999, "v400".to_string()));
        remote.extend((1001..=1005).map(|s| (s, format!("v{}", s))));
        let client = FakeHistory::new(remote, Some(1000));

        // Local mirror: 1..=970 except a hole at 500, plus the duplicate
        // mention at 999.
        let local: Vec<(i64, String)> = (1..=970)
            .filter(|s| *s != 500)
            .map(|s| (s, format!("v{}", s)))
            .chain(std::iter::once((999, "v400".to_string())))
            .collect();
        let local_refs: Vec<(i64, &str)> = local.iter().map(|(s, c)| (*s, c.as_str())).collect();
        seed(&db, 1, &local_refs);

        let before = db.counters(1).unwrap().unwrap();
        assert_eq!(before.indexed, 970);
        assert_eq!(before.duplicate, 1);

        let policy = policy(30, None);
        let result = Scanner::new(&db, &policy).catch_up(&client, 1).await.unwrap();

        // 1005..1001 are new; then 999 and 970..942 make 30 consecutive
        // knowns and the scan stops without reaching the hole at 500.
        assert_eq!(result.new_count, 5);
        assert_eq!(result.gap_filled, 0);
        assert_eq!(result.final_state, ScanStop::StoppedByThreshold);

        let after = db.counters(1).unwrap().unwrap();
        assert_eq!(after.indexed, 975);
        assert_eq!(after.remote_total, 1000);

        // Full rebuild agrees with the incremental bumps.
        db.recompute_counters(1).unwrap();
        let rebuilt = db.counters(1).unwrap().unwrap();
        assert_eq!(rebuilt.indexed, 975);
        assert_eq!(rebuilt.duplicate, 1);

        // The hole keeps the container a catch-up candidate.
        assert!(rebuilt.missing() > 0);
        assert_eq!(db.containers_needing_catchup(10).unwrap(), vec![1]);
    }
}
