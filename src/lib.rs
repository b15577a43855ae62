//! # twinsync: CSV to Digital-Twin Graph Sync
//!
//! Turns tabular batches into canonical twin and relationship documents and
//! reconciles them, one document at a time, against a twin graph store.
//!
//! ## Design Principles
//!
//! 1. **Trait-first**: `GraphStore` is the contract between the reconciler and the graph
//! 2. **Clean DTOs**: `TwinDocument`, `RelationshipDocument`, `Value` cross all boundaries
//! 3. **Transform owns nothing**: CSV → documents is a pure function of bytes and config
//! 4. **Idempotent by construction**: deterministic ids, probe-before-write,
//!    delete-of-absent is success
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use twinsync::{BatchSource, MemoryStore, Reconciler, SyncConfig, Transformer};
//!
//! # async fn example() -> twinsync::Result<()> {
//! let config = SyncConfig::default();
//! let transformer = Transformer::new(config.clone());
//! let reconciler = Reconciler::new(Arc::new(MemoryStore::new()), &config);
//!
//! let csv = "id,name\nt1,Ada\n";
//! let summary = twinsync::sync_batch(
//!     &transformer,
//!     &reconciler,
//!     &BatchSource::new("person").with_version("2"),
//!     csv.as_bytes(),
//! ).await?;
//!
//! for outcome in &summary.outcomes {
//!     println!("{} {} → {:?}", outcome.kind, outcome.id, outcome.action);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Stages
//!
//! | Stage | Module | Description |
//! |-------|--------|-------------|
//! | Transform | `transform` | CSV batch → canonical documents |
//! | Dispatch | `dispatch` | Documents → base64 queue messages |
//! | Reconcile | `reconcile` | One document → graph store calls |

// ============================================================================
// Modules
// ============================================================================

pub mod config;
pub mod dispatch;
pub mod model;
pub mod reconcile;
pub mod store;
pub mod transform;

use std::io::Read;

use serde::Serialize;
use tracing::info;

// ============================================================================
// Re-exports: Model (the DTOs)
// ============================================================================

pub use model::{
    CanonicalDocument, DocumentKind, TwinDocument, RelationshipDocument,
    RelKey, Direction, Value, PropertyMap,
};

// ============================================================================
// Re-exports: Pipeline
// ============================================================================

pub use config::{FailurePolicy, SyncConfig};
pub use transform::{BatchKind, BatchReport, BatchSource, RowIssue, Transformer};
pub use dispatch::{ingest_batch, Dispatcher, IngestSummary, MemoryQueue, QueueMessage};
pub use reconcile::{ReconcileAction, ReconcileOutcome, ReconcileState, Reconciler, Throttle};

// ============================================================================
// Re-exports: Storage
// ============================================================================

pub use store::{GraphStore, JsonPatch, MemoryStore, StoreError, StoreOp};

// ============================================================================
// In-process driver
// ============================================================================

/// What [`sync_batch`] did with one batch.
#[derive(Debug)]
pub struct SyncSummary {
    pub batch: String,
    pub kind: BatchKind,
    /// One outcome per produced document, in row order.
    pub outcomes: Vec<ReconcileOutcome>,
    pub failures: Vec<RowIssue>,
    pub warnings: Vec<RowIssue>,
}

/// Transform a batch and reconcile every document in-process, in row order,
/// with no transport in between.
///
/// Row build failures follow the transformer's failure policy. A store
/// failure stops the batch and is returned; documents reconciled before it
/// stay applied, and rerunning the batch is safe.
pub async fn sync_batch<S, R>(
    transformer: &Transformer,
    reconciler: &Reconciler<S>,
    source: &BatchSource,
    input: R,
) -> Result<SyncSummary>
where
    S: GraphStore + ?Sized,
    R: Read,
{
    let report = transformer.transform_csv(source, input)?;
    let mut outcomes = Vec::with_capacity(report.documents.len());
    for doc in &report.documents {
        outcomes.push(reconciler.reconcile(doc).await?);
    }
    info!(batch = %report.batch, reconciled = outcomes.len(), "batch synced");

    Ok(SyncSummary {
        batch: report.batch,
        kind: report.kind,
        outcomes,
        failures: report.failures,
        warnings: report.warnings,
    })
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("batch {batch}: missing required field {field}")]
    MissingRequiredField { batch: String, field: String },

    #[error("batch {batch}: conflicting path {path}")]
    ConflictingPath { batch: String, path: String },

    #[error("unrecognized format: {origin}")]
    UnrecognizedFormat { origin: String },

    #[error("{kind} {id}: {operation} failed: {source}")]
    TransportFailure {
        kind: DocumentKind,
        id: String,
        operation: StoreOp,
        #[source]
        source: StoreError,
    },

    #[error("batch {batch}: column {column} looks like JSON but does not parse: {reason}")]
    StructuralCoercionAmbiguity { batch: String, column: String, reason: String },

    #[error("batch {batch}: malformed input: {reason}")]
    MalformedBatch { batch: String, reason: String },

    #[error("Envelope error: {0}")]
    Envelope(String),

    #[error("{id}: encoded message is {size} bytes, limit is {limit}")]
    MessageTooLarge { id: String, size: usize, limit: usize },

    /// A transport refused a message. Returned by `Dispatcher` implementations.
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Kind and identifier of the document a transport failure belongs to.
    pub fn document(&self) -> Option<(DocumentKind, &str)> {
        match self {
            Error::TransportFailure { kind, id, .. } => Some((*kind, id.as_str())),
            _ => None,
        }
    }
}

/// Serializable view of an error, for reports printed by drivers.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub row: usize,
    pub message: String,
}

impl From<&RowIssue> for ErrorReport {
    fn from(issue: &RowIssue) -> Self {
        Self { row: issue.row, message: issue.error.to_string() }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
