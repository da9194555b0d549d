//! Local-First Delta Sync
//!
//! After the bootstrap sync, the local replica serves reads and writes and
//! every local mutation arms a debounced one-shot two-way sync back to the
//! remote. Repeated mutations within the debounce window collapse into a
//! single sync. `destroy` defers while a delta sync is scheduled or in
//! flight and proceeds once it settles.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::error::{Error, Result};
use crate::replica::{ReplicationEvent, ReplicationOptions};
use crate::strategy::Strategy;

use super::{SessionEvent, SyncSession};

/// Delta-sync bookkeeping for a local-first session
#[derive(Default)]
pub(super) struct DeltaState {
    /// Armed debounce timer, replaced on every local change
    timer: Option<JoinHandle<()>>,
    /// Cancellation for a delta sync currently running
    in_flight: Option<CancellationToken>,
    /// Deferred destroy waiting for the delta sync to settle
    pending_destroy: Option<watch::Sender<bool>>,
}

impl SyncSession {
    /// Watch the local change feed and debounce delta syncs
    pub(super) fn spawn_local_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let session = Arc::clone(self);
        let mut feed = self.local.changes();
        tokio::spawn(async move {
            while feed.next().await.is_some() {
                session.schedule_delta_sync().await;
            }
        })
    }

    /// Re-arm the debounce timer, cancelling any previously scheduled
    /// trigger that has not fired yet
    async fn schedule_delta_sync(self: &Arc<Self>) {
        let mut delta = self.delta.lock().await;
        if let Some(timer) = delta.timer.take() {
            timer.abort();
        }
        let session = Arc::clone(self);
        let debounce = self.config.debounce_interval();
        delta.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            session.run_delta_sync().await;
        }));
    }

    /// One-shot two-way sync pushing accumulated local mutations to the
    /// remote replica
    async fn run_delta_sync(self: Arc<Self>) {
        let cancellation = CancellationToken::new();
        {
            let mut delta = self.delta.lock().await;
            delta.timer = None;
            if delta.in_flight.is_some() {
                // Already syncing; the monitor re-arms on the next change
                return;
            }
            delta.in_flight = Some(cancellation.clone());
        }

        tracing::debug!("Starting delta sync for {}", self.local.name());
        let back_off = Backoff::new(self.config.max_backoff_ms).unwrap_or_default();
        let mut outcome: Result<()> = Ok(());
        let mut cancelled = false;

        match self
            .local
            .sync_with(Arc::clone(&self.remote), ReplicationOptions::one_shot(back_off))
        {
            Ok(mut handle) => loop {
                tokio::select! {
                    _ = cancellation.cancelled() => {
                        handle.cancel();
                        cancelled = true;
                        break;
                    }
                    event = handle.next_event() => match event {
                        Some(ReplicationEvent::Complete { .. }) | None => break,
                        Some(ReplicationEvent::Denied { reason }) => {
                            outcome = Err(Error::ReplicationDenied(reason));
                            break;
                        }
                        Some(ReplicationEvent::Error { reason }) => {
                            outcome = Err(Error::ReplicationFatal(reason));
                            break;
                        }
                        Some(_) => {}
                    }
                }
            },
            Err(e) => outcome = Err(e),
        }

        {
            let mut delta = self.delta.lock().await;
            delta.in_flight = None;
            if let Some(release) = delta.pending_destroy.take() {
                let _ = release.send(true);
            }
        }
        if cancelled {
            return;
        }

        match outcome {
            Ok(()) => {
                tracing::debug!("Delta sync complete for {}", self.local.name());
                let _ = self.events.send(SessionEvent::DeltaSynced {
                    db: self.local.name().to_string(),
                });
            }
            // Delta failures do not reset the session; the next local
            // change schedules another attempt
            Err(e) => tracing::error!("Delta sync failed for {}: {}", self.local.name(), e),
        }
    }

    /// Abort any scheduled or running delta sync and release deferred
    /// destroys
    pub(super) async fn teardown_delta(&self) {
        let mut delta = self.delta.lock().await;
        if let Some(timer) = delta.timer.take() {
            timer.abort();
        }
        if let Some(in_flight) = delta.in_flight.take() {
            in_flight.cancel();
        }
        if let Some(release) = delta.pending_destroy.take() {
            let _ = release.send(true);
        }
    }

    /// Tear down the local replica.
    ///
    /// For local-first, waits for a scheduled or in-flight delta sync to
    /// settle first so the sync never races replica teardown. The session
    /// is stopped before the replica goes away.
    pub async fn destroy(&self) -> Result<()> {
        if self.strategy == Strategy::LocalFirst {
            self.await_delta_settled().await;
        }
        self.pause().await?;
        self.local.destroy().await
    }

    async fn await_delta_settled(&self) {
        let mut settled = {
            let mut delta = self.delta.lock().await;
            if delta.timer.is_none() && delta.in_flight.is_none() {
                return;
            }
            delta
                .pending_destroy
                .get_or_insert_with(|| watch::channel(false).0)
                .subscribe()
        };
        while !*settled.borrow_and_update() {
            if settled.changed().await.is_err() {
                break;
            }
        }
    }
}
