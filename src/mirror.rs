//! Mirror Facade
//!
//! The caller-facing surface over a mirrored replica pair. Every supported
//! operation is enumerated here and dispatched to the session's current
//! read or write target; nothing else from the underlying engine is
//! exposed.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::MirrorConfig;
use crate::error::{Error, Result};
use crate::replica::{
    AllDocsOptions, AllDocsResponse, Attachment, BulkDocsRow, BulkGetRequest, BulkGetRow,
    Document, QueryRequest, QueryResponse, Replica, WriteResult,
};
use crate::session::{MirrorInfo, SessionEvent, SessionStatus, StartOptions, SyncSession};
use crate::strategy::Strategy;

/// A single logical database over a local/remote replica pair
pub struct Mirror {
    session: Arc<SyncSession>,
}

impl Mirror {
    /// Build a mirror over the given pair.
    ///
    /// The remote replica is the durable source of truth; the local replica
    /// is kept eventually consistent with it once [`start`](Self::start) is
    /// called. The two replicas must be distinct.
    pub fn new(
        local: Arc<dyn Replica>,
        remote: Arc<dyn Replica>,
        config: MirrorConfig,
    ) -> Result<Self> {
        config.validate()?;
        if local.name() == remote.name() {
            return Err(Error::InvalidReplica(format!(
                "local and remote must be distinct replicas, both named {}",
                local.name()
            )));
        }
        Ok(Self {
            session: Arc::new(SyncSession::new(local, remote, config)),
        })
    }

    /// Build a mirror with default configuration for the given strategy
    pub fn with_strategy(
        local: Arc<dyn Replica>,
        remote: Arc<dyn Replica>,
        strategy: Strategy,
    ) -> Result<Self> {
        Self::new(local, remote, MirrorConfig::for_strategy(strategy))
    }

    /// Start replication with default options
    pub async fn start(&self) -> Result<()> {
        self.session.start(StartOptions::default()).await
    }

    /// Start replication with explicit options
    pub async fn start_with(&self, options: StartOptions) -> Result<()> {
        self.session.start(options).await
    }

    /// Stop replication and reset the session to idle
    pub async fn pause(&self) -> Result<()> {
        self.session.pause().await
    }

    /// Tear down the local replica, deferring while a delta sync is in
    /// flight
    pub async fn destroy(&self) -> Result<()> {
        self.session.destroy().await
    }

    /// Subscribe to session notifications
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.subscribe()
    }

    /// Snapshot of the session state
    pub async fn status(&self) -> SessionStatus {
        self.session.status().await
    }

    /// Fetch a document from the current read target
    pub async fn get(&self, id: &str) -> Result<Document> {
        self.session.get(id).await
    }

    /// List documents from the current read target
    pub async fn all_docs(&self, options: AllDocsOptions) -> Result<AllDocsResponse> {
        self.session.all_docs(options).await
    }

    /// Fetch several documents from the current read target
    pub async fn bulk_get(&self, requests: Vec<BulkGetRequest>) -> Result<Vec<BulkGetRow>> {
        self.session.bulk_get(requests).await
    }

    /// Run a view query against the current read target
    pub async fn query(&self, request: QueryRequest) -> Result<QueryResponse> {
        self.session.query(request).await
    }

    /// Write a document; while the session is active the call returns only
    /// after the write is confirmed on the local change feed
    pub async fn put(&self, doc: Document) -> Result<WriteResult> {
        self.session.put(doc).await
    }

    /// Write a document with a generated id, awaiting confirmation
    pub async fn post(&self, doc: Document) -> Result<WriteResult> {
        self.session.post(doc).await
    }

    /// Write several documents, awaiting confirmation of every successful
    /// row
    pub async fn bulk_docs(&self, docs: Vec<Document>) -> Result<Vec<BulkDocsRow>> {
        self.session.bulk_docs(docs).await
    }

    /// Delete a document, awaiting confirmation
    pub async fn remove(&self, id: &str, rev: &str) -> Result<WriteResult> {
        self.session.remove(id, rev).await
    }

    /// Attach a payload to a document, awaiting confirmation
    pub async fn put_attachment(
        &self,
        id: &str,
        name: &str,
        rev: Option<&str>,
        attachment: Attachment,
    ) -> Result<WriteResult> {
        self.session.put_attachment(id, name, rev, attachment).await
    }

    /// Fetch an attachment from the current read target
    pub async fn get_attachment(&self, id: &str, name: &str) -> Result<Attachment> {
        self.session.get_attachment(id, name).await
    }

    /// Remove an attachment, awaiting confirmation
    pub async fn remove_attachment(&self, id: &str, name: &str, rev: &str) -> Result<WriteResult> {
        self.session.remove_attachment(id, name, rev).await
    }

    /// Info snapshots for both replicas, gathered concurrently
    pub async fn info(&self) -> Result<MirrorInfo> {
        self.session.info().await
    }
}
