//! Change Correlator
//!
//! Lets a write block until its revision appears on the confirming replica's
//! live change feed. The feed can deliver a change before the matching wait
//! is registered, so unmatched revisions are buffered for one wait window
//! and claimed by late-arriving waits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::replica::ChangeFeed;

/// Confirmation wait window. Sits just under common 5-second client
/// timeouts so a timeout here surfaces before the caller's own deadline.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(4900);

/// A confirmed change, carrying the revision that was observed
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmedChange {
    /// Revision observed on the change feed
    pub rev: String,
}

/// Pending waits and buffered changes share one lock: the feed-consumption
/// path and `wait_for_change` race on the same revision id.
#[derive(Default)]
struct CorrelationTable {
    pending: HashMap<String, oneshot::Sender<ConfirmedChange>>,
    buffered: HashMap<String, Instant>,
}

impl CorrelationTable {
    /// Buffer an unmatched revision and sweep entries older than the wait
    /// window, bounding memory growth.
    fn buffer(&mut self, rev: String, window: Duration) {
        let now = Instant::now();
        self.buffered
            .retain(|_, observed_at| now.duration_since(*observed_at) <= window);
        self.buffered.insert(rev, now);
    }
}

/// Correlates write revisions with their appearance on a live change feed
pub struct ChangeCorrelator {
    table: Arc<Mutex<CorrelationTable>>,
    cancellation: CancellationToken,
    wait_timeout: Duration,
}

impl ChangeCorrelator {
    /// Start consuming the given change feed with the default wait window
    pub fn new(feed: ChangeFeed) -> Self {
        Self::with_timeout(feed, DEFAULT_WAIT_TIMEOUT)
    }

    /// Start consuming the given change feed with a custom wait window
    pub fn with_timeout(mut feed: ChangeFeed, wait_timeout: Duration) -> Self {
        let table = Arc::new(Mutex::new(CorrelationTable::default()));
        let cancellation = CancellationToken::new();

        let consumer_table = Arc::clone(&table);
        let consumer_cancel = cancellation.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = consumer_cancel.cancelled() => break,
                    event = feed.next() => {
                        let Some(event) = event else { break };
                        let mut table = consumer_table.lock().await;
                        for entry in event.changes {
                            match table.pending.remove(&entry.rev) {
                                Some(waiter) => {
                                    let _ = waiter.send(ConfirmedChange { rev: entry.rev });
                                }
                                None => table.buffer(entry.rev, wait_timeout),
                            }
                        }
                    }
                }
            }
        });

        Self {
            table,
            cancellation,
            wait_timeout,
        }
    }

    /// Block until a change event carrying `rev` is observed.
    ///
    /// Resolves immediately when the change was already buffered. Fails with
    /// [`Error::ConfirmationTimeout`] when no matching event arrives within
    /// the wait window.
    pub async fn wait_for_change(&self, rev: &str) -> Result<ConfirmedChange> {
        let waiter = {
            let mut table = self.table.lock().await;
            if table.buffered.remove(rev).is_some() {
                return Ok(ConfirmedChange {
                    rev: rev.to_string(),
                });
            }
            let (tx, rx) = oneshot::channel();
            table.pending.insert(rev.to_string(), tx);
            rx
        };

        match tokio::time::timeout(self.wait_timeout, waiter).await {
            Ok(Ok(confirmed)) => Ok(confirmed),
            // Sender dropped (correlator torn down) or the window elapsed;
            // either way the confirmation never arrived.
            Ok(Err(_)) | Err(_) => {
                self.table.lock().await.pending.remove(rev);
                Err(Error::ConfirmationTimeout {
                    rev: rev.to_string(),
                })
            }
        }
    }

    /// Stop feed consumption. Outstanding waits are not resolved or
    /// rejected here; they time out independently.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    #[cfg(test)]
    async fn pending_len(&self) -> usize {
        self.table.lock().await.pending.len()
    }

    #[cfg(test)]
    async fn buffered_len(&self) -> usize {
        self.table.lock().await.buffered.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::{ChangeEntry, ChangeEvent};
    use tokio::sync::broadcast;
    use tokio::time::{sleep, Duration};

    fn feed_pair() -> (broadcast::Sender<ChangeEvent>, ChangeFeed) {
        let (tx, rx) = broadcast::channel(64);
        (tx, ChangeFeed::new(rx))
    }

    fn change(id: &str, seq: u64, revs: &[&str]) -> ChangeEvent {
        ChangeEvent {
            id: id.to_string(),
            seq,
            changes: revs
                .iter()
                .map(|rev| ChangeEntry {
                    rev: rev.to_string(),
                })
                .collect(),
            deleted: false,
        }
    }

    #[tokio::test]
    async fn test_wait_resolves_on_later_change() {
        let (tx, feed) = feed_pair();
        let correlator = Arc::new(ChangeCorrelator::with_timeout(
            feed,
            Duration::from_millis(500),
        ));

        let waiter = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move { correlator.wait_for_change("1-abc").await })
        };

        sleep(Duration::from_millis(50)).await;
        tx.send(change("doc1", 1, &["1-abc"])).unwrap();

        let confirmed = waiter.await.unwrap().unwrap();
        assert_eq!(confirmed.rev, "1-abc");
        assert_eq!(correlator.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_buffered_change_resolves_immediately_and_is_consumed() {
        let (tx, feed) = feed_pair();
        let correlator = ChangeCorrelator::with_timeout(feed, Duration::from_millis(500));

        tx.send(change("doc1", 1, &["1-abc"])).unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(correlator.buffered_len().await, 1);

        let confirmed = correlator.wait_for_change("1-abc").await.unwrap();
        assert_eq!(confirmed.rev, "1-abc");
        assert_eq!(correlator.buffered_len().await, 0);

        // The buffer entry is gone, so a second wait for the same revision
        // has to time out.
        let err = correlator.wait_for_change("1-abc").await.unwrap_err();
        assert!(err.is_confirmation_timeout());
    }

    #[tokio::test]
    async fn test_wait_times_out_without_matching_change() {
        let (tx, feed) = feed_pair();
        let correlator = ChangeCorrelator::with_timeout(feed, Duration::from_millis(100));

        tx.send(change("doc1", 1, &["1-other"])).unwrap();

        let err = correlator.wait_for_change("1-abc").await.unwrap_err();
        assert!(matches!(err, Error::ConfirmationTimeout { rev } if rev == "1-abc"));
        assert_eq!(correlator.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_waits_resolve_independently() {
        let (tx, feed) = feed_pair();
        let correlator = Arc::new(ChangeCorrelator::with_timeout(
            feed,
            Duration::from_millis(500),
        ));

        let first = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move { correlator.wait_for_change("1-aaa").await })
        };
        let second = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move { correlator.wait_for_change("1-bbb").await })
        };

        sleep(Duration::from_millis(50)).await;
        tx.send(change("doc2", 1, &["1-bbb"])).unwrap();
        tx.send(change("doc1", 2, &["1-aaa"])).unwrap();

        assert_eq!(first.await.unwrap().unwrap().rev, "1-aaa");
        assert_eq!(second.await.unwrap().unwrap().rev, "1-bbb");
    }

    #[tokio::test]
    async fn test_multi_revision_event_resolves_all_waiters() {
        let (tx, feed) = feed_pair();
        let correlator = Arc::new(ChangeCorrelator::with_timeout(
            feed,
            Duration::from_millis(500),
        ));

        let first = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move { correlator.wait_for_change("2-aaa").await })
        };
        let second = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move { correlator.wait_for_change("2-bbb").await })
        };

        sleep(Duration::from_millis(50)).await;
        tx.send(change("doc1", 1, &["2-aaa", "2-bbb"])).unwrap();

        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_buffer_sweeps_expired_entries() {
        let (tx, feed) = feed_pair();
        let correlator = ChangeCorrelator::with_timeout(feed, Duration::from_millis(100));

        tx.send(change("doc1", 1, &["1-old"])).unwrap();
        sleep(Duration::from_millis(200)).await;

        // The next buffering insertion drops the expired entry
        tx.send(change("doc2", 2, &["1-new"])).unwrap();
        sleep(Duration::from_millis(50)).await;

        assert_eq!(correlator.buffered_len().await, 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_feed_consumption() {
        let (tx, feed) = feed_pair();
        let correlator = ChangeCorrelator::with_timeout(feed, Duration::from_millis(100));

        correlator.cancel();
        sleep(Duration::from_millis(20)).await;

        // The consumer has exited and dropped its receiver, so the send
        // may find no subscribers left
        let _ = tx.send(change("doc1", 1, &["1-abc"]));
        let err = correlator.wait_for_change("1-abc").await.unwrap_err();
        assert!(err.is_confirmation_timeout());
    }
}
