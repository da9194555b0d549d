//! In-Memory Replica Engine
//!
//! A reference implementation of the [`Replica`] contract backed by a plain
//! map: generation-prefixed revisions, tombstones, attachments, a broadcast
//! change feed, and task-based replication between replica pairs. Used by
//! the integration tests and example setups; conflict resolution is a
//! deterministic highest-generation / highest-revision rule, not a contract.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::replica::{
    AllDocsOptions, AllDocsResponse, AllDocsRow, Attachment, BulkDocsRow, BulkGetRequest,
    BulkGetRow, ChangeEntry, ChangeEvent, ChangeFeed, Document, QueryRequest, QueryResponse,
    QueryRow, Replica, ReplicaInfo, ReplicationEvent, ReplicationHandle, ReplicationOptions,
    WriteResult,
};

/// Change feed fan-out capacity per replica
const CHANGE_FEED_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct StoredDoc {
    rev: String,
    deleted: bool,
    body: serde_json::Map<String, serde_json::Value>,
    attachments: HashMap<String, Attachment>,
}

struct Inner {
    name: String,
    docs: RwLock<BTreeMap<String, StoredDoc>>,
    update_seq: AtomicU64,
    changes_tx: StdMutex<Option<broadcast::Sender<ChangeEvent>>>,
    destroyed: AtomicBool,
}

/// In-memory document replica
#[derive(Clone)]
pub struct MemoryReplica {
    inner: Arc<Inner>,
}

fn rev_generation(rev: &str) -> u64 {
    rev.split('-')
        .next()
        .and_then(|gen| gen.parse().ok())
        .unwrap_or(0)
}

fn next_rev(previous: Option<&str>) -> String {
    let generation = previous.map(rev_generation).unwrap_or(0) + 1;
    format!("{}-{}", generation, Uuid::new_v4().simple())
}

impl Inner {
    fn ensure_alive(&self) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::Storage(format!(
                "replica {} has been destroyed",
                self.name
            )));
        }
        Ok(())
    }

    fn emit(&self, id: &str, rev: &str, deleted: bool) {
        let seq = self.update_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let guard = self.changes_tx.lock().unwrap();
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(ChangeEvent {
                id: id.to_string(),
                seq,
                changes: vec![ChangeEntry {
                    rev: rev.to_string(),
                }],
                deleted,
            });
        }
    }

    /// Single write path shared by put/post/bulk_docs
    async fn write_doc(&self, mut doc: Document) -> Result<WriteResult> {
        self.ensure_alive()?;
        if doc.id.is_empty() {
            return Err(Error::InvalidDocument("missing document id".to_string()));
        }

        let mut docs = self.docs.write().await;
        let existing = docs.get(&doc.id);
        let new_rev = match existing {
            Some(stored) if stored.deleted => {
                // Tombstones may be recreated without supplying the
                // deleted revision
                if let Some(rev) = &doc.rev {
                    if rev != &stored.rev {
                        return Err(Error::Conflict(doc.id));
                    }
                }
                next_rev(Some(&stored.rev))
            }
            Some(stored) => match &doc.rev {
                Some(rev) if rev == &stored.rev => next_rev(Some(&stored.rev)),
                _ => return Err(Error::Conflict(doc.id)),
            },
            None => {
                if doc.rev.is_some() {
                    return Err(Error::Conflict(doc.id));
                }
                next_rev(None)
            }
        };

        docs.insert(
            doc.id.clone(),
            StoredDoc {
                rev: new_rev.clone(),
                deleted: false,
                body: std::mem::take(&mut doc.body),
                attachments: std::mem::take(&mut doc.attachments),
            },
        );
        drop(docs);

        self.emit(&doc.id, &new_rev, false);
        Ok(WriteResult {
            id: doc.id,
            rev: new_rev,
        })
    }

    /// Replication write path: keep the incoming revision, apply only when
    /// it wins over what is stored (higher generation, then higher revision)
    async fn apply_replicated_docs(&self, docs: Vec<Document>) -> Result<u64> {
        self.ensure_alive()?;
        let mut applied = 0;
        for doc in docs {
            let rev = doc
                .rev
                .clone()
                .ok_or_else(|| Error::InvalidDocument("replicated doc without rev".to_string()))?;

            let mut map = self.docs.write().await;
            let wins = match map.get(&doc.id) {
                None => true,
                Some(stored) if stored.rev == rev => false,
                Some(stored) => {
                    let (incoming, current) = (rev_generation(&rev), rev_generation(&stored.rev));
                    incoming > current || (incoming == current && rev > stored.rev)
                }
            };
            if !wins {
                continue;
            }

            map.insert(
                doc.id.clone(),
                StoredDoc {
                    rev: rev.clone(),
                    deleted: doc.deleted,
                    body: doc.body,
                    attachments: doc.attachments,
                },
            );
            drop(map);

            self.emit(&doc.id, &rev, doc.deleted);
            applied += 1;
        }
        Ok(applied)
    }
}

impl MemoryReplica {
    /// Create an empty replica with the given name
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let (changes_tx, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                name,
                docs: RwLock::new(BTreeMap::new()),
                update_seq: AtomicU64::new(0),
                changes_tx: StdMutex::new(Some(changes_tx)),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /// Create an empty replica behind an `Arc<dyn Replica>`
    pub fn shared(name: impl Into<String>) -> Arc<dyn Replica> {
        Arc::new(Self::new(name))
    }
}

#[async_trait::async_trait]
impl Replica for MemoryReplica {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn get(&self, id: &str) -> Result<Document> {
        self.inner.ensure_alive()?;
        let docs = self.inner.docs.read().await;
        match docs.get(id) {
            Some(stored) if !stored.deleted => Ok(Document {
                id: id.to_string(),
                rev: Some(stored.rev.clone()),
                deleted: false,
                body: stored.body.clone(),
                attachments: stored.attachments.clone(),
            }),
            _ => Err(Error::NotFound(id.to_string())),
        }
    }

    async fn all_docs(&self, options: AllDocsOptions) -> Result<AllDocsResponse> {
        self.inner.ensure_alive()?;
        let docs = self.inner.docs.read().await;
        let rows: Vec<AllDocsRow> = docs
            .iter()
            .filter(|(_, stored)| !stored.deleted)
            .map(|(id, stored)| AllDocsRow {
                id: id.clone(),
                rev: stored.rev.clone(),
                doc: options.include_docs.then(|| Document {
                    id: id.clone(),
                    rev: Some(stored.rev.clone()),
                    deleted: false,
                    body: stored.body.clone(),
                    attachments: stored.attachments.clone(),
                }),
            })
            .collect();
        Ok(AllDocsResponse {
            total_rows: rows.len(),
            rows,
        })
    }

    async fn bulk_get(&self, requests: Vec<BulkGetRequest>) -> Result<Vec<BulkGetRow>> {
        self.inner.ensure_alive()?;
        let mut rows = Vec::with_capacity(requests.len());
        for request in requests {
            let row = match self.get(&request.id).await {
                Ok(doc) => match &request.rev {
                    Some(rev) if doc.rev.as_deref() != Some(rev) => BulkGetRow {
                        id: request.id,
                        doc: None,
                        error: Some(format!("missing revision {}", rev)),
                    },
                    _ => BulkGetRow {
                        id: request.id,
                        doc: Some(doc),
                        error: None,
                    },
                },
                Err(e) => BulkGetRow {
                    id: request.id,
                    doc: None,
                    error: Some(e.to_string()),
                },
            };
            rows.push(row);
        }
        Ok(rows)
    }

    async fn put(&self, doc: Document) -> Result<WriteResult> {
        self.inner.write_doc(doc).await
    }

    async fn post(&self, mut doc: Document) -> Result<WriteResult> {
        if doc.id.is_empty() {
            doc.id = Uuid::new_v4().simple().to_string();
        }
        self.inner.write_doc(doc).await
    }

    async fn bulk_docs(&self, docs: Vec<Document>) -> Result<Vec<BulkDocsRow>> {
        self.inner.ensure_alive()?;
        let mut rows = Vec::with_capacity(docs.len());
        for mut doc in docs {
            if doc.id.is_empty() {
                doc.id = Uuid::new_v4().simple().to_string();
            }
            let id = doc.id.clone();
            let row = match self.inner.write_doc(doc).await {
                Ok(result) => BulkDocsRow {
                    id: result.id,
                    rev: Some(result.rev),
                    ok: true,
                    error: None,
                },
                Err(e) => BulkDocsRow {
                    id,
                    rev: None,
                    ok: false,
                    error: Some(e.to_string()),
                },
            };
            rows.push(row);
        }
        Ok(rows)
    }

    async fn remove(&self, id: &str, rev: &str) -> Result<WriteResult> {
        self.inner.ensure_alive()?;
        let mut docs = self.inner.docs.write().await;
        let stored = docs
            .get(id)
            .filter(|stored| !stored.deleted)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if stored.rev != rev {
            return Err(Error::Conflict(id.to_string()));
        }

        let new_rev = next_rev(Some(rev));
        docs.insert(
            id.to_string(),
            StoredDoc {
                rev: new_rev.clone(),
                deleted: true,
                body: serde_json::Map::new(),
                attachments: HashMap::new(),
            },
        );
        drop(docs);

        self.inner.emit(id, &new_rev, true);
        Ok(WriteResult {
            id: id.to_string(),
            rev: new_rev,
        })
    }

    async fn put_attachment(
        &self,
        id: &str,
        name: &str,
        rev: Option<&str>,
        attachment: Attachment,
    ) -> Result<WriteResult> {
        self.inner.ensure_alive()?;
        let mut doc = match self.get(id).await {
            Ok(doc) => {
                if doc.rev.as_deref() != rev {
                    return Err(Error::Conflict(id.to_string()));
                }
                doc
            }
            Err(Error::NotFound(_)) if rev.is_none() => {
                Document::new(id, serde_json::json!({}))
            }
            Err(e) => return Err(e),
        };
        doc.attachments.insert(name.to_string(), attachment);
        self.inner.write_doc(doc).await
    }

    async fn get_attachment(&self, id: &str, name: &str) -> Result<Attachment> {
        let doc = self.get(id).await?;
        doc.attachments
            .get(name)
            .cloned()
            .ok_or_else(|| Error::AttachmentNotFound {
                id: id.to_string(),
                name: name.to_string(),
            })
    }

    async fn remove_attachment(&self, id: &str, name: &str, rev: &str) -> Result<WriteResult> {
        let mut doc = self.get(id).await?;
        if doc.rev.as_deref() != Some(rev) {
            return Err(Error::Conflict(id.to_string()));
        }
        if doc.attachments.remove(name).is_none() {
            return Err(Error::AttachmentNotFound {
                id: id.to_string(),
                name: name.to_string(),
            });
        }
        self.inner.write_doc(doc).await
    }

    async fn query(&self, request: QueryRequest) -> Result<QueryResponse> {
        self.inner.ensure_alive()?;
        let docs = self.inner.docs.read().await;
        let rows = docs
            .iter()
            .filter(|(_, stored)| !stored.deleted)
            .filter_map(|(id, stored)| {
                let key = stored.body.get(&request.field)?.clone();
                if let Some(wanted) = &request.key {
                    if &key != wanted {
                        return None;
                    }
                }
                Some(QueryRow {
                    id: id.clone(),
                    key,
                    doc: request.include_docs.then(|| Document {
                        id: id.clone(),
                        rev: Some(stored.rev.clone()),
                        deleted: false,
                        body: stored.body.clone(),
                        attachments: stored.attachments.clone(),
                    }),
                })
            })
            .collect();
        Ok(QueryResponse { rows })
    }

    async fn info(&self) -> Result<ReplicaInfo> {
        self.inner.ensure_alive()?;
        let docs = self.inner.docs.read().await;
        Ok(ReplicaInfo {
            name: self.inner.name.clone(),
            doc_count: docs.values().filter(|stored| !stored.deleted).count() as u64,
            update_seq: self.inner.update_seq.load(Ordering::SeqCst),
        })
    }

    async fn destroy(&self) -> Result<()> {
        self.inner.destroyed.store(true, Ordering::SeqCst);
        self.inner.docs.write().await.clear();
        // Dropping the sender closes every subscribed change feed
        self.inner.changes_tx.lock().unwrap().take();
        tracing::debug!("Replica {} destroyed", self.inner.name);
        Ok(())
    }

    fn changes(&self) -> ChangeFeed {
        let guard = self.inner.changes_tx.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => ChangeFeed::new(tx.subscribe()),
            None => {
                // Destroyed replica: hand out an already-closed feed
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                ChangeFeed::new(rx)
            }
        }
    }

    async fn apply_replicated(&self, docs: Vec<Document>) -> Result<()> {
        self.inner.apply_replicated_docs(docs).await?;
        Ok(())
    }

    fn replicate_from(
        &self,
        source: Arc<dyn Replica>,
        options: ReplicationOptions,
    ) -> Result<ReplicationHandle> {
        self.inner.ensure_alive()?;
        let target: Arc<dyn Replica> = Arc::new(self.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let cancellation = CancellationToken::new();
        tokio::spawn(run_replication(
            source,
            target,
            options,
            tx,
            cancellation.clone(),
        ));
        Ok(ReplicationHandle::new(rx, cancellation))
    }

    fn sync_with(
        &self,
        other: Arc<dyn Replica>,
        options: ReplicationOptions,
    ) -> Result<ReplicationHandle> {
        self.inner.ensure_alive()?;
        let me: Arc<dyn Replica> = Arc::new(self.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let cancellation = CancellationToken::new();
        tokio::spawn(run_sync(me, other, options, tx, cancellation.clone()));
        Ok(ReplicationHandle::new(rx, cancellation))
    }
}

/// Copy every non-deleted document from `source` into `target`, preserving
/// revisions
async fn transfer_snapshot(source: &Arc<dyn Replica>, target: &Arc<dyn Replica>) -> Result<u64> {
    let response = source
        .all_docs(AllDocsOptions { include_docs: true })
        .await?;
    let docs: Vec<Document> = response.rows.into_iter().filter_map(|row| row.doc).collect();
    let count = docs.len() as u64;
    target.apply_replicated(docs).await?;
    Ok(count)
}

/// Mirror one observed change from `source` into `target`
async fn apply_change(
    source: &Arc<dyn Replica>,
    target: &Arc<dyn Replica>,
    event: &ChangeEvent,
) -> Result<()> {
    let doc = if event.deleted {
        tombstone_from(event)
    } else {
        match source.get(&event.id).await {
            Ok(doc) => doc,
            // Deleted between the event and the fetch
            Err(Error::NotFound(_)) => tombstone_from(event),
            Err(e) => return Err(e),
        }
    };
    target.apply_replicated(vec![doc]).await
}

fn tombstone_from(event: &ChangeEvent) -> Document {
    Document {
        id: event.id.clone(),
        rev: event.changes.first().map(|entry| entry.rev.clone()),
        deleted: true,
        ..Default::default()
    }
}

async fn run_replication(
    source: Arc<dyn Replica>,
    target: Arc<dyn Replica>,
    options: ReplicationOptions,
    tx: mpsc::UnboundedSender<ReplicationEvent>,
    cancellation: CancellationToken,
) {
    let _ = tx.send(ReplicationEvent::Active);

    // Subscribe before the snapshot so no mutation slips between the two
    let mut feed = source.changes();
    let docs_written = match transfer_snapshot(&source, &target).await {
        Ok(count) => count,
        Err(e) => {
            let _ = tx.send(ReplicationEvent::Error {
                reason: e.to_string(),
            });
            return;
        }
    };

    if !options.live {
        let _ = tx.send(ReplicationEvent::Complete { docs_written });
        return;
    }

    let _ = tx.send(ReplicationEvent::Paused { error: None });

    loop {
        tokio::select! {
            _ = cancellation.cancelled() => break,
            event = feed.next() => {
                let Some(event) = event else {
                    let _ = tx.send(ReplicationEvent::Error {
                        reason: "change feed closed".to_string(),
                    });
                    break;
                };
                match apply_change(&source, &target, &event).await {
                    Ok(()) => {
                        let _ = tx.send(ReplicationEvent::Paused { error: None });
                    }
                    Err(e) => {
                        let _ = tx.send(ReplicationEvent::Error {
                            reason: e.to_string(),
                        });
                        break;
                    }
                }
            }
        }
    }
}

async fn run_sync(
    a: Arc<dyn Replica>,
    b: Arc<dyn Replica>,
    options: ReplicationOptions,
    tx: mpsc::UnboundedSender<ReplicationEvent>,
    cancellation: CancellationToken,
) {
    let _ = tx.send(ReplicationEvent::Active);

    let mut feed_a = a.changes();
    let mut feed_b = b.changes();

    // Pull from the counterpart first, then push
    let pulled = match transfer_snapshot(&b, &a).await {
        Ok(count) => count,
        Err(e) => {
            let _ = tx.send(ReplicationEvent::Error {
                reason: e.to_string(),
            });
            return;
        }
    };
    let pushed = match transfer_snapshot(&a, &b).await {
        Ok(count) => count,
        Err(e) => {
            let _ = tx.send(ReplicationEvent::Error {
                reason: e.to_string(),
            });
            return;
        }
    };

    if !options.live {
        let _ = tx.send(ReplicationEvent::Complete {
            docs_written: pulled + pushed,
        });
        return;
    }

    let _ = tx.send(ReplicationEvent::Paused { error: None });

    // Live two-way: bridge both feeds; replays of already-applied revisions
    // lose the apply rule and do not echo
    loop {
        let applied = tokio::select! {
            _ = cancellation.cancelled() => break,
            event = feed_a.next() => match event {
                Some(event) => apply_change(&a, &b, &event).await,
                None => break,
            },
            event = feed_b.next() => match event {
                Some(event) => apply_change(&b, &a, &event).await,
                None => break,
            },
        };
        match applied {
            Ok(()) => {
                let _ = tx.send(ReplicationEvent::Paused { error: None });
            }
            Err(e) => {
                let _ = tx.send(ReplicationEvent::Error {
                    reason: e.to_string(),
                });
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::{sleep, timeout, Duration};

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let replica = MemoryReplica::new("local");
        let result = replica
            .put(Document::new("doc1", json!({"title": "x"})))
            .await
            .unwrap();
        assert_eq!(result.id, "doc1");
        assert!(result.rev.starts_with("1-"));

        let doc = replica.get("doc1").await.unwrap();
        assert_eq!(doc.field("title"), Some(&json!("x")));
        assert_eq!(doc.rev.as_deref(), Some(result.rev.as_str()));
    }

    #[tokio::test]
    async fn test_update_requires_current_rev() {
        let replica = MemoryReplica::new("local");
        let first = replica
            .put(Document::new("doc1", json!({"n": 1})))
            .await
            .unwrap();

        // Stale write (no rev) conflicts
        let err = replica
            .put(Document::new("doc1", json!({"n": 2})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let mut update = Document::new("doc1", json!({"n": 2}));
        update.rev = Some(first.rev.clone());
        let second = replica.put(update).await.unwrap();
        assert!(second.rev.starts_with("2-"));
    }

    #[tokio::test]
    async fn test_remove_leaves_tombstone() {
        let replica = MemoryReplica::new("local");
        let result = replica
            .put(Document::new("doc1", json!({"title": "x"})))
            .await
            .unwrap();
        let removed = replica.remove("doc1", &result.rev).await.unwrap();
        assert!(removed.rev.starts_with("2-"));

        assert!(matches!(
            replica.get("doc1").await,
            Err(Error::NotFound(_))
        ));
        let info = replica.info().await.unwrap();
        assert_eq!(info.doc_count, 0);
        assert_eq!(info.update_seq, 2);
    }

    #[tokio::test]
    async fn test_changes_feed_sees_only_new_mutations() {
        let replica = MemoryReplica::new("local");
        replica
            .put(Document::new("before", json!({})))
            .await
            .unwrap();

        let mut feed = replica.changes();
        let result = replica
            .put(Document::new("after", json!({})))
            .await
            .unwrap();

        let event = timeout(Duration::from_millis(500), feed.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.id, "after");
        assert_eq!(event.changes[0].rev, result.rev);
    }

    #[tokio::test]
    async fn test_bulk_docs_reports_per_row_outcome() {
        let replica = MemoryReplica::new("local");
        replica
            .put(Document::new("taken", json!({})))
            .await
            .unwrap();

        let rows = replica
            .bulk_docs(vec![
                Document::new("fresh", json!({})),
                // No rev for an existing doc: conflicts
                Document::new("taken", json!({})),
            ])
            .await
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert!(rows[0].ok);
        assert!(rows[0].rev.is_some());
        assert!(!rows[1].ok);
        assert!(rows[1].error.is_some());
    }

    #[tokio::test]
    async fn test_attachments_roundtrip() {
        let replica = MemoryReplica::new("local");
        let result = replica
            .put(Document::new("doc1", json!({})))
            .await
            .unwrap();

        let written = replica
            .put_attachment(
                "doc1",
                "notes.txt",
                Some(&result.rev),
                Attachment {
                    content_type: "text/plain".to_string(),
                    data: bytes::Bytes::from_static(b"hello"),
                },
            )
            .await
            .unwrap();

        let attachment = replica.get_attachment("doc1", "notes.txt").await.unwrap();
        assert_eq!(attachment.data.as_ref(), b"hello");

        replica
            .remove_attachment("doc1", "notes.txt", &written.rev)
            .await
            .unwrap();
        assert!(matches!(
            replica.get_attachment("doc1", "notes.txt").await,
            Err(Error::AttachmentNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_query_filters_by_field_and_key() {
        let replica = MemoryReplica::new("local");
        replica
            .put(Document::new("a", json!({"kind": "fruit"})))
            .await
            .unwrap();
        replica
            .put(Document::new("b", json!({"kind": "tool"})))
            .await
            .unwrap();
        replica
            .put(Document::new("c", json!({"other": true})))
            .await
            .unwrap();

        let all = replica
            .query(QueryRequest {
                field: "kind".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(all.rows.len(), 2);

        let fruit = replica
            .query(QueryRequest {
                field: "kind".to_string(),
                key: Some(json!("fruit")),
                include_docs: true,
            })
            .await
            .unwrap();
        assert_eq!(fruit.rows.len(), 1);
        assert_eq!(fruit.rows[0].id, "a");
        assert!(fruit.rows[0].doc.is_some());
    }

    #[tokio::test]
    async fn test_live_replication_mirrors_writes() {
        let remote = MemoryReplica::new("remote");
        let local = MemoryReplica::new("local");
        remote
            .put(Document::new("seeded", json!({"n": 1})))
            .await
            .unwrap();

        let remote_arc: Arc<dyn Replica> = Arc::new(remote.clone());
        let mut handle = local
            .replicate_from(remote_arc, ReplicationOptions::live(Default::default()))
            .unwrap();

        // Active, then the post-snapshot pause
        loop {
            match timeout(Duration::from_millis(500), handle.next_event())
                .await
                .unwrap()
                .unwrap()
            {
                ReplicationEvent::Paused { error: None } => break,
                ReplicationEvent::Active => continue,
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert!(local.get("seeded").await.is_ok());

        let written = remote
            .put(Document::new("later", json!({"n": 2})))
            .await
            .unwrap();
        sleep(Duration::from_millis(100)).await;
        let mirrored = local.get("later").await.unwrap();
        assert_eq!(mirrored.rev.as_deref(), Some(written.rev.as_str()));

        handle.cancel();
    }

    #[tokio::test]
    async fn test_one_shot_sync_merges_both_sides() {
        let a = MemoryReplica::new("a");
        let b = MemoryReplica::new("b");
        a.put(Document::new("only-a", json!({}))).await.unwrap();
        b.put(Document::new("only-b", json!({}))).await.unwrap();

        let b_arc: Arc<dyn Replica> = Arc::new(b.clone());
        let mut handle = a
            .sync_with(b_arc, ReplicationOptions::one_shot(Default::default()))
            .unwrap();

        loop {
            match timeout(Duration::from_millis(500), handle.next_event())
                .await
                .unwrap()
                .unwrap()
            {
                ReplicationEvent::Complete { .. } => break,
                ReplicationEvent::Active => continue,
                other => panic!("unexpected event: {:?}", other),
            }
        }

        assert!(a.get("only-b").await.is_ok());
        assert!(b.get("only-a").await.is_ok());
    }

    #[tokio::test]
    async fn test_destroy_closes_feed_and_rejects_ops() {
        let replica = MemoryReplica::new("local");
        let mut feed = replica.changes();
        replica.destroy().await.unwrap();

        assert!(feed.next().await.is_none());
        assert!(matches!(
            replica.get("doc1").await,
            Err(Error::Storage(_))
        ));
    }
}
