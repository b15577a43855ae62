//! # Dispatcher Boundary
//!
//! Hands canonical documents to a queueing collaborator. Each document
//! travels as one JSON object, base64-encoded and length-bounded. Delivery
//! is at-least-once; nothing here deduplicates, because reconciliation is
//! idempotent.
//!
//! Every message carries a partition key naming the entity it touches (the
//! twin id, or a relationship's source id). A transport that serializes
//! messages per partition key keeps two documents for the same entity from
//! being reconciled concurrently.

use std::collections::VecDeque;
use std::io::Read;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::FailurePolicy;
use crate::model::CanonicalDocument;
use crate::transform::{BatchKind, BatchSource, RowIssue, Transformer};
use crate::{Error, Result};

// ============================================================================
// Queue message
// ============================================================================

/// One encoded document, as it travels through the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    body: String,
    partition_key: String,
}

impl QueueMessage {
    /// Encode a document. Fails when the encoded body exceeds `limit` bytes.
    pub fn encode(doc: &CanonicalDocument, limit: usize) -> Result<Self> {
        let json = doc.to_json_string()?;
        let body = STANDARD.encode(json.as_bytes());
        if body.len() > limit {
            return Err(Error::MessageTooLarge { id: doc.id().to_owned(), size: body.len(), limit });
        }
        Ok(Self { body, partition_key: partition_key(doc).to_owned() })
    }

    /// Wrap a body received from the transport.
    pub fn from_encoded(body: impl Into<String>) -> Self {
        Self { body: body.into(), partition_key: String::new() }
    }

    /// Decode the body back into a document.
    pub fn decode(&self) -> Result<CanonicalDocument> {
        decode_body(&self.body)
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Entity this message touches. Empty for messages wrapped with
    /// [`from_encoded`](Self::from_encoded).
    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// Decode one base64 JSON body.
pub fn decode_body(body: &str) -> Result<CanonicalDocument> {
    let bytes = STANDARD
        .decode(body.trim())
        .map_err(|e| Error::Envelope(format!("invalid base64: {e}")))?;
    let text = String::from_utf8(bytes).map_err(|e| Error::Envelope(format!("invalid UTF-8: {e}")))?;
    CanonicalDocument::from_json_str(&text)
}

fn partition_key(doc: &CanonicalDocument) -> &str {
    match doc {
        CanonicalDocument::Twin(t) => &t.id,
        CanonicalDocument::Relationship(r) => &r.source_id,
    }
}

// ============================================================================
// Dispatcher trait
// ============================================================================

/// A queueing collaborator.
///
/// Transports report a refused message as `Error::Dispatch`; `ingest_batch`
/// stops at the first one, whatever the failure policy.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Hand one message to the transport. Returning `Ok` means the transport
    /// accepted it, not that it has been reconciled.
    async fn dispatch(&self, message: QueueMessage) -> Result<()>;
}

// ============================================================================
// MemoryQueue
// ============================================================================

/// FIFO in-memory queue. Cloning shares the same queue.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<Mutex<VecDeque<QueueMessage>>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pop(&self) -> Option<QueueMessage> {
        self.inner.lock().pop_front()
    }

    /// Take every queued message, oldest first.
    pub fn drain(&self) -> Vec<QueueMessage> {
        self.inner.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[async_trait]
impl Dispatcher for MemoryQueue {
    async fn dispatch(&self, message: QueueMessage) -> Result<()> {
        self.inner.lock().push_back(message);
        Ok(())
    }
}

// ============================================================================
// Ingest driver
// ============================================================================

/// What [`ingest_batch`] did with one batch.
#[derive(Debug)]
pub struct IngestSummary {
    pub batch: String,
    pub kind: BatchKind,
    /// Messages accepted by the dispatcher.
    pub sent: usize,
    /// Rows that failed to build or encode.
    pub failures: Vec<RowIssue>,
    pub warnings: Vec<RowIssue>,
}

/// Transform a batch and dispatch every document, in row order.
///
/// Oversized documents are row failures and follow the failure policy. A
/// dispatcher error stops the batch; messages already accepted stay queued
/// and rerunning the batch is safe.
pub async fn ingest_batch<D, R>(
    transformer: &Transformer,
    source: &BatchSource,
    input: R,
    dispatcher: &D,
) -> Result<IngestSummary>
where
    D: Dispatcher + ?Sized,
    R: Read,
{
    let config = transformer.config();
    let report = transformer.transform_csv(source, input)?;
    let mut failures = report.failures;
    let mut sent = 0;

    for (row, doc) in report.rows.iter().copied().zip(&report.documents) {
        let message = match QueueMessage::encode(doc, config.max_message_bytes) {
            Ok(message) => message,
            Err(error) => match config.failure_policy {
                FailurePolicy::AbortBatch => return Err(error),
                FailurePolicy::ReportAndContinue => {
                    warn!(batch = %source.name, row, %error, "document not dispatched");
                    failures.push(RowIssue { row, error });
                    continue;
                }
            },
        };
        debug!(batch = %source.name, row, id = doc.id(), bytes = message.len(), "dispatching");
        dispatcher.dispatch(message).await?;
        sent += 1;
    }

    info!(batch = %source.name, sent, failures = failures.len(), "batch dispatched");
    Ok(IngestSummary {
        batch: report.batch,
        kind: report.kind,
        sent,
        failures,
        warnings: report.warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::model::{RelationshipDocument, TwinDocument};
    use serde_json::json;

    #[test]
    fn test_encode_decode() {
        let doc = CanonicalDocument::from(TwinDocument::new("t1", "dtmi:w;1").with_property("k", 1));
        let message = QueueMessage::encode(&doc, 1024).unwrap();
        assert_eq!(message.partition_key(), "t1");

        let decoded = QueueMessage::from_encoded(message.body()).decode().unwrap();
        assert_eq!(decoded, doc);
    }

    #[test]
    fn test_body_is_base64_json() {
        let doc = CanonicalDocument::from(RelationshipDocument::new("A", "B", "linksTo"));
        let message = QueueMessage::encode(&doc, 1024).unwrap();
        let raw = STANDARD.decode(message.body()).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(json["$relationshipId"], json!("A-B"));
        assert_eq!(message.partition_key(), "A");
    }

    #[test]
    fn test_size_limit() {
        let doc = CanonicalDocument::from(TwinDocument::new("big", "dtmi:w;1").with_property("blob", "x".repeat(200)));
        let err = QueueMessage::encode(&doc, 64).unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge { ref id, limit: 64, .. } if id == "big"));
    }

    #[test]
    fn test_bad_envelopes() {
        assert!(matches!(decode_body("***"), Err(Error::Envelope(_))));
        let not_a_document = STANDARD.encode(br#"{"hello": 1}"#);
        assert!(matches!(decode_body(&not_a_document), Err(Error::UnrecognizedFormat { .. })));
    }

    #[tokio::test]
    async fn test_ingest_into_memory_queue() {
        let queue = MemoryQueue::new();
        let transformer = Transformer::new(SyncConfig::without_throttle());
        let csv = "source,target\nA,B\nB,C\n";
        let summary = ingest_batch(&transformer, &BatchSource::new("linksTo"), csv.as_bytes(), &queue)
            .await
            .unwrap();

        assert_eq!(summary.sent, 2);
        assert_eq!(summary.kind, BatchKind::Relationships);
        let ids: Vec<String> = queue
            .drain()
            .iter()
            .map(|m| m.decode().unwrap().id().to_owned())
            .collect();
        assert_eq!(ids, vec!["A-B", "B-C"]);
    }

    /// Accepts `capacity` messages, then refuses.
    struct FullQueue {
        inner: MemoryQueue,
        capacity: usize,
    }

    #[async_trait]
    impl Dispatcher for FullQueue {
        async fn dispatch(&self, message: QueueMessage) -> Result<()> {
            if self.inner.len() >= self.capacity {
                return Err(Error::Dispatch(format!("queue full, {} refused", message.partition_key())));
            }
            self.inner.dispatch(message).await
        }
    }

    #[tokio::test]
    async fn test_refused_message_stops_ingest() {
        let queue = FullQueue { inner: MemoryQueue::new(), capacity: 1 };
        let config = SyncConfig::without_throttle().with_failure_policy(FailurePolicy::ReportAndContinue);
        let transformer = Transformer::new(config);
        let csv = "id\nt1\nt2\nt3\n";

        let err = ingest_batch(&transformer, &BatchSource::new("w"), csv.as_bytes(), &queue)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Dispatch(ref reason) if reason.contains("t2")));
        assert_eq!(queue.inner.len(), 1);
    }

    #[tokio::test]
    async fn test_oversized_document_reported() {
        let queue = MemoryQueue::new();
        let config = SyncConfig {
            max_message_bytes: 120,
            failure_policy: FailurePolicy::ReportAndContinue,
            ..SyncConfig::without_throttle()
        };
        let transformer = Transformer::new(config);
        let csv = format!("id,blob\nsmall,x\nlarge,{}\n", "y".repeat(300));
        let summary = ingest_batch(&transformer, &BatchSource::new("w"), csv.as_bytes(), &queue)
            .await
            .unwrap();

        assert_eq!(summary.sent, 1);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].row, 2);
        assert_eq!(queue.len(), 1);
    }
}
