//! Replica Engine Contract
//!
//! The abstract surface MirrorSync requires from the replicated storage
//! engine: document CRUD, attachments, queries, a live change feed, and
//! cancellable replication between two replicas. MirrorSync layers its
//! coordination logic on top of this contract and defines no wire or file
//! format of its own.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::error::Result;

/// A document stored in a replica.
///
/// The body is an arbitrary JSON object; `rev` is the opaque revision
/// identifier assigned by the engine on every write.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document {
    /// Document identifier (generated on `post` when empty)
    pub id: String,
    /// Current revision, `None` for a document that has never been written
    pub rev: Option<String>,
    /// Tombstone marker set by `remove`
    pub deleted: bool,
    /// JSON body of the document
    pub body: serde_json::Map<String, serde_json::Value>,
    /// Named binary attachments
    pub attachments: HashMap<String, Attachment>,
}

impl Document {
    /// Create a document with the given id and body
    pub fn new(id: impl Into<String>, body: serde_json::Value) -> Self {
        let body = match body {
            serde_json::Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self {
            id: id.into(),
            body,
            ..Default::default()
        }
    }

    /// Create a document with no id, for `post`
    pub fn from_body(body: serde_json::Value) -> Self {
        Self::new(String::new(), body)
    }

    /// Look up a field in the document body
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.body.get(name)
    }
}

/// A named binary attachment
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    /// MIME type of the attachment
    pub content_type: String,
    /// Attachment payload
    pub data: Bytes,
}

/// Result of a single write operation
#[derive(Debug, Clone, PartialEq)]
pub struct WriteResult {
    /// Document id
    pub id: String,
    /// Revision assigned by the write
    pub rev: String,
}

/// One row of a `bulk_docs` response, preserving input order
#[derive(Debug, Clone, PartialEq)]
pub struct BulkDocsRow {
    /// Document id
    pub id: String,
    /// Revision assigned by the write, when it succeeded
    pub rev: Option<String>,
    /// Whether this row was written successfully
    pub ok: bool,
    /// Engine error message for a failed row
    pub error: Option<String>,
}

/// One request row for `bulk_get`
#[derive(Debug, Clone)]
pub struct BulkGetRequest {
    /// Document id to fetch
    pub id: String,
    /// Specific revision, or latest when `None`
    pub rev: Option<String>,
}

/// One result row of a `bulk_get` response
#[derive(Debug, Clone)]
pub struct BulkGetRow {
    /// Document id
    pub id: String,
    /// The document, when found
    pub doc: Option<Document>,
    /// Engine error message when the lookup failed
    pub error: Option<String>,
}

/// Options for `all_docs`
#[derive(Debug, Clone, Default)]
pub struct AllDocsOptions {
    /// Include full document bodies in the rows
    pub include_docs: bool,
}

/// One row of an `all_docs` response
#[derive(Debug, Clone)]
pub struct AllDocsRow {
    /// Document id
    pub id: String,
    /// Current revision
    pub rev: String,
    /// Full document, when `include_docs` was set
    pub doc: Option<Document>,
}

/// Response of `all_docs`
#[derive(Debug, Clone)]
pub struct AllDocsResponse {
    /// Total number of non-deleted documents in the replica
    pub total_rows: usize,
    /// Rows ordered by document id
    pub rows: Vec<AllDocsRow>,
}

/// A view query request
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    /// Name of the field the view indexes
    pub field: String,
    /// Only emit rows whose key equals this value
    pub key: Option<serde_json::Value>,
    /// Include full document bodies in the rows
    pub include_docs: bool,
}

/// One row of a query response
#[derive(Debug, Clone)]
pub struct QueryRow {
    /// Document id
    pub id: String,
    /// Emitted key
    pub key: serde_json::Value,
    /// Full document, when `include_docs` was set
    pub doc: Option<Document>,
}

/// Response of `query`
#[derive(Debug, Clone)]
pub struct QueryResponse {
    /// Matching rows ordered by document id
    pub rows: Vec<QueryRow>,
}

/// Info snapshot for one replica
#[derive(Debug, Clone)]
pub struct ReplicaInfo {
    /// Replica name
    pub name: String,
    /// Number of non-deleted documents
    pub doc_count: u64,
    /// Monotonic update sequence
    pub update_seq: u64,
}

/// One revision entry carried by a change event
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEntry {
    /// Revision of the mutated document
    pub rev: String,
}

/// A single change-feed notification
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Id of the mutated document
    pub id: String,
    /// Update sequence at which the mutation was recorded
    pub seq: u64,
    /// Revisions produced by the mutation
    pub changes: Vec<ChangeEntry>,
    /// Whether the document is now a tombstone
    pub deleted: bool,
}

/// Live change feed subscription, delivering mutations observed after the
/// subscription was created. Delivery stops when the feed is dropped or the
/// replica is destroyed.
pub struct ChangeFeed {
    stream: BroadcastStream<ChangeEvent>,
}

impl ChangeFeed {
    /// Wrap a broadcast subscription into a feed
    pub fn new(rx: tokio::sync::broadcast::Receiver<ChangeEvent>) -> Self {
        Self {
            stream: BroadcastStream::new(rx),
        }
    }

    /// Next change event, or `None` once the feed is closed.
    ///
    /// A slow consumer that falls behind skips the missed events rather than
    /// erroring; skipped confirmations surface as wait timeouts upstream.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.stream.next().await {
                Some(Ok(event)) => return Some(event),
                Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                    tracing::warn!("Change feed lagged, skipped {} events", missed);
                    continue;
                }
                None => return None,
            }
        }
    }
}

/// Lifecycle events emitted by a replication handle
#[derive(Debug, Clone)]
pub enum ReplicationEvent {
    /// Replication is actively transferring changes
    Active,
    /// Replication went idle; an error here is non-fatal and the engine's
    /// own retry/backoff keeps going
    Paused {
        /// Non-fatal error that caused the pause, if any
        error: Option<String>,
    },
    /// The target replica refused the replicated changes
    Denied {
        /// Engine-reported reason
        reason: String,
    },
    /// Replication failed fatally and will not continue
    Error {
        /// Engine-reported reason
        reason: String,
    },
    /// One-shot replication finished
    Complete {
        /// Number of documents transferred
        docs_written: u64,
    },
}

/// Options for starting replication between two replicas
#[derive(Debug, Clone, Default)]
pub struct ReplicationOptions {
    /// Keep replicating live after the initial transfer
    pub live: bool,
    /// Retry on transient failures using the backoff schedule
    pub retry: bool,
    /// Delay schedule for reconnect attempts
    pub back_off: Option<Backoff>,
}

impl ReplicationOptions {
    /// Live replication with retry and the given backoff schedule
    pub fn live(back_off: Backoff) -> Self {
        Self {
            live: true,
            retry: true,
            back_off: Some(back_off),
        }
    }

    /// One-shot replication that completes after the initial transfer
    pub fn one_shot(back_off: Backoff) -> Self {
        Self {
            live: false,
            retry: true,
            back_off: Some(back_off),
        }
    }
}

/// Cancellable, event-emitting handle to a running replication
pub struct ReplicationHandle {
    events: tokio::sync::mpsc::UnboundedReceiver<ReplicationEvent>,
    cancellation: CancellationToken,
}

impl ReplicationHandle {
    /// Build a handle from its event channel and cancellation token
    pub fn new(
        events: tokio::sync::mpsc::UnboundedReceiver<ReplicationEvent>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            events,
            cancellation,
        }
    }

    /// Next lifecycle event, or `None` once the replication task is gone
    pub async fn next_event(&mut self) -> Option<ReplicationEvent> {
        self.events.recv().await
    }

    /// Token that stops the replication task when cancelled
    pub fn canceller(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Stop the replication
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }
}

/// Contract required from the replicated storage engine.
///
/// Every write-family operation returns at least `{id, rev}`; bulk writes
/// return one row per input document in input order. Replication entry
/// points return an event-emitting [`ReplicationHandle`].
#[async_trait::async_trait]
pub trait Replica: Send + Sync + 'static {
    /// Stable name identifying this replica
    fn name(&self) -> &str;

    /// Fetch the latest revision of a document
    async fn get(&self, id: &str) -> Result<Document>;

    /// List documents ordered by id
    async fn all_docs(&self, options: AllDocsOptions) -> Result<AllDocsResponse>;

    /// Fetch several documents in one call
    async fn bulk_get(&self, requests: Vec<BulkGetRequest>) -> Result<Vec<BulkGetRow>>;

    /// Write a document; the document must carry an id and, for updates,
    /// the current revision
    async fn put(&self, doc: Document) -> Result<WriteResult>;

    /// Write a document with a generated id
    async fn post(&self, doc: Document) -> Result<WriteResult>;

    /// Write several documents; per-row failures do not fail the call
    async fn bulk_docs(&self, docs: Vec<Document>) -> Result<Vec<BulkDocsRow>>;

    /// Delete a document at the given revision
    async fn remove(&self, id: &str, rev: &str) -> Result<WriteResult>;

    /// Attach a binary payload to a document
    async fn put_attachment(
        &self,
        id: &str,
        name: &str,
        rev: Option<&str>,
        attachment: Attachment,
    ) -> Result<WriteResult>;

    /// Fetch an attachment payload
    async fn get_attachment(&self, id: &str, name: &str) -> Result<Attachment>;

    /// Remove an attachment from a document
    async fn remove_attachment(&self, id: &str, name: &str, rev: &str) -> Result<WriteResult>;

    /// Run a view query
    async fn query(&self, request: QueryRequest) -> Result<QueryResponse>;

    /// Info snapshot for this replica
    async fn info(&self) -> Result<ReplicaInfo>;

    /// Tear down the replica and its change feed
    async fn destroy(&self) -> Result<()>;

    /// Subscribe to mutations from now on
    fn changes(&self) -> ChangeFeed;

    /// Replication write path: apply documents while preserving their
    /// revisions, as produced by another replica
    async fn apply_replicated(&self, docs: Vec<Document>) -> Result<()>;

    /// Start one-way replication from `source` into this replica
    fn replicate_from(
        &self,
        source: Arc<dyn Replica>,
        options: ReplicationOptions,
    ) -> Result<ReplicationHandle>;

    /// Start two-way synchronization between this replica and `other`
    fn sync_with(
        &self,
        other: Arc<dyn Replica>,
        options: ReplicationOptions,
    ) -> Result<ReplicationHandle>;
}
