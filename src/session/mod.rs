//! Sync Session
//!
//! Owns the read/write target selection for one mirrored replica pair,
//! tracks sync progress, drives replication lifecycle events, and confirms
//! writes through the change correlator. The coordination strategy is a
//! construction-time tagged variant; both variants expose the same
//! operation surface.

mod delta;

use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::config::MirrorConfig;
use crate::correlator::ChangeCorrelator;
use crate::error::{Error, Result};
use crate::replica::{
    AllDocsOptions, AllDocsResponse, Attachment, BulkDocsRow, BulkGetRequest, BulkGetRow,
    Document, QueryRequest, QueryResponse, Replica, ReplicaInfo, ReplicationEvent,
    ReplicationHandle, ReplicationOptions, WriteResult,
};
use crate::strategy::Strategy;

use delta::DeltaState;

/// Which replica of the pair an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// The eventually-consistent local replica
    Local,
    /// The durable remote replica
    Remote,
}

/// Options for starting a session
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Retry replication on transient failures
    pub retry: bool,
    /// Reconnect delay schedule; defaults to one built from the mirror
    /// configuration when retry is enabled
    pub back_off: Option<Backoff>,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            retry: true,
            back_off: None,
        }
    }
}

/// Notifications emitted by a session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The mirrored pair caught up for the first time since start
    UpToDate {
        /// Name of the local replica
        db: String,
    },
    /// A local-first delta sync finished
    DeltaSynced {
        /// Name of the local replica
        db: String,
    },
    /// Replication was denied by the counterpart; the session has reset
    Denied {
        /// Engine-reported reason
        reason: String,
    },
    /// Replication failed fatally; the session has reset
    Fatal {
        /// Engine-reported reason
        reason: String,
    },
}

/// Snapshot of a session's current state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    /// Configured coordination strategy
    pub strategy: Strategy,
    /// Whether replication is running
    pub active: bool,
    /// Whether the pair has caught up since start
    pub remote_synced: bool,
    /// Replica currently serving reads
    pub read_target: Target,
    /// Replica currently serving writes
    pub write_target: Target,
}

/// Paired info snapshots, gathered concurrently
#[derive(Debug, Clone)]
pub struct MirrorInfo {
    /// Info for the remote replica
    pub remote: ReplicaInfo,
    /// Info for the local replica
    pub local: ReplicaInfo,
}

/// Mutable session state, reset to its initial value on pause and on fatal
/// replication errors. The remote replica is the source of truth until the
/// initial sync completes.
struct SessionState {
    active: bool,
    remote_synced: bool,
    read_target: Target,
    write_target: Target,
    correlator: Option<Arc<ChangeCorrelator>>,
    replication: Option<CancellationToken>,
    monitor: Option<JoinHandle<()>>,
}

impl SessionState {
    fn initial() -> Self {
        Self {
            active: false,
            remote_synced: false,
            read_target: Target::Remote,
            write_target: Target::Remote,
            correlator: None,
            replication: None,
            monitor: None,
        }
    }
}

/// Coordination session for one mirrored replica pair
pub struct SyncSession {
    strategy: Strategy,
    local: Arc<dyn Replica>,
    remote: Arc<dyn Replica>,
    config: MirrorConfig,
    state: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    delta: Mutex<DeltaState>,
}

impl SyncSession {
    /// Create an idle session over the given pair
    pub fn new(
        local: Arc<dyn Replica>,
        remote: Arc<dyn Replica>,
        config: MirrorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            strategy: config.strategy,
            local,
            remote,
            config,
            state: Mutex::new(SessionState::initial()),
            events,
            delta: Mutex::new(DeltaState::default()),
        }
    }

    /// Configured coordination strategy
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Subscribe to session notifications
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Snapshot the current session state
    pub async fn status(&self) -> SessionStatus {
        let state = self.state.lock().await;
        SessionStatus {
            strategy: self.strategy,
            active: state.active,
            remote_synced: state.remote_synced,
            read_target: state.read_target,
            write_target: state.write_target,
        }
    }

    /// Start replication for this pair.
    ///
    /// Remote-first starts live remote-to-local replication; local-first
    /// runs a one-shot two-way bootstrap sync. Fails synchronously with
    /// [`Error::AlreadyActive`] when the session is already running.
    pub async fn start(self: &Arc<Self>, options: StartOptions) -> Result<()> {
        let back_off = if options.retry {
            Some(match options.back_off {
                Some(back_off) => back_off,
                None => Backoff::new(self.config.max_backoff_ms)?,
            })
        } else {
            None
        };
        let replication_options = ReplicationOptions {
            live: self.strategy == Strategy::RemoteFirst,
            retry: options.retry,
            back_off,
        };

        let mut state = self.state.lock().await;
        if state.active {
            return Err(Error::AlreadyActive);
        }
        state.active = true;

        // Start buffering changes before replication so no confirmation
        // slips past the correlator
        let correlator = Arc::new(ChangeCorrelator::with_timeout(
            self.local.changes(),
            self.config.confirm_timeout(),
        ));
        state.correlator = Some(Arc::clone(&correlator));

        let handle = match self.strategy {
            Strategy::RemoteFirst => self
                .local
                .replicate_from(Arc::clone(&self.remote), replication_options),
            Strategy::LocalFirst => self
                .local
                .sync_with(Arc::clone(&self.remote), replication_options),
        };
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                correlator.cancel();
                *state = SessionState::initial();
                return Err(e);
            }
        };

        let cancellation = handle.canceller();
        state.replication = Some(cancellation.clone());
        drop(state);

        tracing::info!(
            "Session started ({}) for {} <- {}",
            self.strategy,
            self.local.name(),
            self.remote.name()
        );

        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.drive_replication(handle, cancellation).await;
        });
        Ok(())
    }

    /// Cancel the active replication and correlator and reset to idle
    pub async fn pause(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if let Some(replication) = state.replication.take() {
                replication.cancel();
            }
            if let Some(correlator) = state.correlator.take() {
                correlator.cancel();
            }
            if let Some(monitor) = state.monitor.take() {
                monitor.abort();
            }
            *state = SessionState::initial();
        }
        self.teardown_delta().await;
        tracing::info!("Session paused for {}", self.local.name());
        Ok(())
    }

    /// Consume replication lifecycle events until the replication ends
    async fn drive_replication(
        self: Arc<Self>,
        mut handle: ReplicationHandle,
        cancellation: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    handle.cancel();
                    break;
                }
                event = handle.next_event() => {
                    let Some(event) = event else { break };
                    match event {
                        ReplicationEvent::Active => {}
                        ReplicationEvent::Paused { error: None } => {
                            if self.strategy == Strategy::RemoteFirst {
                                self.mark_caught_up().await;
                            }
                        }
                        ReplicationEvent::Paused { error: Some(reason) } => {
                            // Left to the engine's own retry/backoff
                            tracing::warn!(
                                "Non-fatal replication pause on {}: {}",
                                self.local.name(),
                                reason
                            );
                        }
                        ReplicationEvent::Complete { docs_written } => {
                            if self.strategy == Strategy::LocalFirst {
                                tracing::debug!(
                                    "Bootstrap sync complete, {} docs transferred",
                                    docs_written
                                );
                                self.mark_caught_up().await;
                            }
                        }
                        ReplicationEvent::Denied { reason } => {
                            self.reset_after_fatal(Error::ReplicationDenied(reason)).await;
                            break;
                        }
                        ReplicationEvent::Error { reason } => {
                            self.reset_after_fatal(Error::ReplicationFatal(reason)).await;
                            break;
                        }
                    }
                }
            }
        }
    }

    /// First clean pause (remote-first) or bootstrap completion
    /// (local-first): flip targets and notify listeners
    async fn mark_caught_up(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            if !state.active || state.remote_synced {
                return;
            }
            state.remote_synced = true;
            state.read_target = Target::Local;
            if self.strategy == Strategy::LocalFirst {
                state.write_target = Target::Local;
                state.monitor = Some(self.spawn_local_monitor());
            }
        }
        tracing::info!(
            "Mirror caught up, reads now target {}",
            self.local.name()
        );
        let _ = self.events.send(SessionEvent::UpToDate {
            db: self.local.name().to_string(),
        });
    }

    /// Fatal replication error: cancel the correlator, reset to the safe
    /// default authoritative replica, and surface the error to listeners.
    /// In-flight confirmation waits are left to their own timeouts.
    async fn reset_after_fatal(&self, error: Error) {
        tracing::error!(
            "Fatal replication error on {}: {}",
            self.local.name(),
            error
        );
        {
            let mut state = self.state.lock().await;
            if let Some(correlator) = state.correlator.take() {
                correlator.cancel();
            }
            if let Some(monitor) = state.monitor.take() {
                monitor.abort();
            }
            if let Some(replication) = state.replication.take() {
                replication.cancel();
            }
            *state = SessionState::initial();
        }
        self.teardown_delta().await;

        let reason = error.to_string();
        let event = match error {
            Error::ReplicationDenied(_) => SessionEvent::Denied { reason },
            _ => SessionEvent::Fatal { reason },
        };
        let _ = self.events.send(event);
    }

    async fn read_replica(&self) -> Arc<dyn Replica> {
        match self.state.lock().await.read_target {
            Target::Local => Arc::clone(&self.local),
            Target::Remote => Arc::clone(&self.remote),
        }
    }

    async fn write_replica(&self) -> Arc<dyn Replica> {
        match self.state.lock().await.write_target {
            Target::Local => Arc::clone(&self.local),
            Target::Remote => Arc::clone(&self.remote),
        }
    }

    async fn active_correlator(&self) -> Option<Arc<ChangeCorrelator>> {
        let state = self.state.lock().await;
        if state.active {
            state.correlator.clone()
        } else {
            None
        }
    }

    /// Await confirmation of a write on the local change feed. Writes on an
    /// inactive session return immediately.
    async fn confirm(&self, result: WriteResult) -> Result<WriteResult> {
        if let Some(correlator) = self.active_correlator().await {
            correlator.wait_for_change(&result.rev).await?;
        }
        Ok(result)
    }

    // Read family

    /// Fetch a document from the current read target
    pub async fn get(&self, id: &str) -> Result<Document> {
        self.read_replica().await.get(id).await
    }

    /// List documents from the current read target
    pub async fn all_docs(&self, options: AllDocsOptions) -> Result<AllDocsResponse> {
        self.read_replica().await.all_docs(options).await
    }

    /// Fetch several documents from the current read target
    pub async fn bulk_get(&self, requests: Vec<BulkGetRequest>) -> Result<Vec<BulkGetRow>> {
        self.read_replica().await.bulk_get(requests).await
    }

    /// Run a view query against the current read target
    pub async fn query(&self, request: QueryRequest) -> Result<QueryResponse> {
        self.read_replica().await.query(request).await
    }

    /// Fetch an attachment from the current read target
    pub async fn get_attachment(&self, id: &str, name: &str) -> Result<Attachment> {
        self.read_replica().await.get_attachment(id, name).await
    }

    // Write family

    /// Write a document and await its confirmation
    pub async fn put(&self, doc: Document) -> Result<WriteResult> {
        let result = self.write_replica().await.put(doc).await?;
        self.confirm(result).await
    }

    /// Write a document with a generated id and await its confirmation
    pub async fn post(&self, doc: Document) -> Result<WriteResult> {
        let result = self.write_replica().await.post(doc).await?;
        self.confirm(result).await
    }

    /// Write several documents; confirmation is awaited for every
    /// successful row before the rows are returned
    pub async fn bulk_docs(&self, docs: Vec<Document>) -> Result<Vec<BulkDocsRow>> {
        let rows = self.write_replica().await.bulk_docs(docs).await?;
        if let Some(correlator) = self.active_correlator().await {
            let waits = rows
                .iter()
                .filter(|row| row.ok)
                .filter_map(|row| row.rev.clone())
                .map(|rev| {
                    let correlator = Arc::clone(&correlator);
                    async move { correlator.wait_for_change(&rev).await }
                });
            futures::future::try_join_all(waits).await?;
        }
        Ok(rows)
    }

    /// Delete a document and await its confirmation
    pub async fn remove(&self, id: &str, rev: &str) -> Result<WriteResult> {
        let result = self.write_replica().await.remove(id, rev).await?;
        self.confirm(result).await
    }

    /// Attach a payload and await its confirmation
    pub async fn put_attachment(
        &self,
        id: &str,
        name: &str,
        rev: Option<&str>,
        attachment: Attachment,
    ) -> Result<WriteResult> {
        let result = self
            .write_replica()
            .await
            .put_attachment(id, name, rev, attachment)
            .await?;
        self.confirm(result).await
    }

    /// Remove an attachment and await its confirmation
    pub async fn remove_attachment(&self, id: &str, name: &str, rev: &str) -> Result<WriteResult> {
        let result = self
            .write_replica()
            .await
            .remove_attachment(id, name, rev)
            .await?;
        self.confirm(result).await
    }

    /// Info snapshots for both replicas, gathered concurrently
    pub async fn info(&self) -> Result<MirrorInfo> {
        let (remote, local) = futures::try_join!(self.remote.info(), self.local.info())?;
        Ok(MirrorInfo { remote, local })
    }
}
