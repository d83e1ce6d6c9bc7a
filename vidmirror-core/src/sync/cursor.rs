//! Resumable paging over one container's remote history
//!
//! The cursor walks descending sequence order and keeps two positions: the
//! paging position (advances on every fetch) and the acknowledged position
//! (advances only on [`ack_page`](HistoryCursor::ack_page), after the caller
//! made the page's effects durable). [`rewind`](HistoryCursor::rewind) drops
//! unacknowledged progress, so replaying a partially processed page is the
//! normal recovery path and relies on the store's idempotent upserts.
//!
//! Rate limits surface to the caller untouched; retry policy belongs to the
//! worker pool, not here.

use crate::error::Result;
use crate::remote::{Page, PlatformClient};

pub struct HistoryCursor<'a> {
    client: &'a dyn PlatformClient,
    container_id: i64,
    page_size: u32,
    /// Durable resume position (exclusive: fetch strictly older)
    committed: Option<i64>,
    /// Paging position across unacknowledged pages
    pending: Option<i64>,
}

impl<'a> HistoryCursor<'a> {
    /// Catch-up mode: walk backward from the newest entry.
    pub fn from_newest(client: &'a dyn PlatformClient, container_id: i64, page_size: u32) -> Self {
        Self {
            client,
            container_id,
            page_size,
            committed: None,
            pending: None,
        }
    }

    /// Backfill mode: walk entries strictly older than `anchor`.
    pub fn older_than(
        client: &'a dyn PlatformClient,
        container_id: i64,
        anchor: i64,
        page_size: u32,
    ) -> Self {
        Self {
            client,
            container_id,
            page_size,
            committed: Some(anchor),
            pending: None,
        }
    }

    /// Fetch the next page. An empty page means the walk reached the end of
    /// history at the current position; fetching again without acknowledging
    /// re-asks the same position.
    pub async fn next_page(&mut self) -> Result<Page> {
        let before = self.pending.or(self.committed);
        let page = self
            .client
            .list_history(self.container_id, before, self.page_size)
            .await?;

        // Entries arrive newest-first; the last one is the new position.
        if let Some(last) = page.entries.last() {
            self.pending = Some(last.sequence_id);
        }
        Ok(page)
    }

    /// Mark everything fetched so far as durably processed.
    pub fn ack_page(&mut self) {
        if let Some(p) = self.pending.take() {
            self.committed = Some(p);
        }
    }

    /// Drop unacknowledged progress; the next fetch replays from the last
    /// acknowledged position.
    pub fn rewind(&mut self) {
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{RemoteContainer, RemoteEntry};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeHistory {
        name: String,
        /// Descending sequence ids that exist remotely
        sequence_ids: Vec<i64>,
        fetches: AtomicUsize,
    }

    impl FakeHistory {
        fn new(sequence_ids: Vec<i64>) -> Self {
            Self {
                name: "relay-1".to_string(),
                sequence_ids,
                fetches: AtomicUsize::new(0),
            }
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
                .sequence_ids
                .iter()
                .copied()
                .filter(|s| before.map_or(true, |b| *s < b))
                .take(limit as usize)
                .map(|sequence_id| RemoteEntry {
                    sequence_id,
                    ts: None,
                    sender: None,
                    media: None,
                })
                .collect();
            Ok(Page {
                entries,
                total: None,
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

    fn ids(page: &Page) -> Vec<i64> {
        page.entries.iter().map(|e| e.sequence_id).collect()
    }

    #[tokio::test]
    async fn test_pages_descend_without_overlap() {
        let client = FakeHistory::new((1..=10).rev().collect());
        let mut cursor = HistoryCursor::from_newest(&client, 1, 4);

        assert_eq!(ids(&cursor.next_page().await.unwrap()), vec![10, 9, 8, 7]);
        assert_eq!(ids(&cursor.next_page().await.unwrap()), vec![6, 5, 4, 3]);
        assert_eq!(ids(&cursor.next_page().await.unwrap()), vec![2, 1]);
        assert!(cursor.next_page().await.unwrap().entries.is_empty());
    }

    #[tokio::test]
    async fn test_rewind_replays_unacked_pages() {
        let client = FakeHistory::new((1..=10).rev().collect());
        let mut cursor = HistoryCursor::from_newest(&client, 1, 4);

        cursor.next_page().await.unwrap();
        cursor.ack_page();
        cursor.next_page().await.unwrap();

        // Second page was never acknowledged; after a rewind it comes again.
        cursor.rewind();
        assert_eq!(ids(&cursor.next_page().await.unwrap()), vec![6, 5, 4, 3]);
    }

    #[tokio::test]
    async fn test_rewind_without_ack_restarts() {
        let client = FakeHistory::new((1..=6).rev().collect());
        let mut cursor = HistoryCursor::from_newest(&client, 1, 3);

        cursor.next_page().await.unwrap();
        cursor.next_page().await.unwrap();
        cursor.rewind();
        assert_eq!(ids(&cursor.next_page().await.unwrap()), vec![6, 5, 4]);
    }

    #[tokio::test]
    async fn test_older_than_anchor_is_strict() {
        let client = FakeHistory::new((1..=10).rev().collect());
        let mut cursor = HistoryCursor::older_than(&client, 1, 5, 10);
        assert_eq!(ids(&cursor.next_page().await.unwrap()), vec![4, 3, 2, 1]);
    }
}
