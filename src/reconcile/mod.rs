//! # Reconciler
//!
//! Applies one canonical document to the graph store. Per document:
//!
//! ```text
//! Received ──▶ Probed ──▶ Created ─┐
//!    │           │  ├───▶ Updated ─┼──▶ Acknowledged
//!    │           │  └───▶ Deleted ─┘
//!    └───────────┴──────────────────▶ Failed
//! ```
//!
//! - delete twin: list its relationships in both directions, delete each,
//!   then delete the twin
//! - delete relationship: delete it directly (`Received → Deleted`)
//! - otherwise: fetch; patch-update when present, full upsert when absent.
//!   The patch is merged against the fetched form so nested members written
//!   by other imports are kept
//!
//! Deleting something already gone counts as success. Every store call is
//! preceded by an awaited delay for its call kind. A failed call ends the
//! document in `Failed` and is returned as `TransportFailure`; nothing is
//! retried here.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::SyncConfig;
use crate::dispatch::decode_body;
use crate::model::{CanonicalDocument, Direction, DocumentKind, RelKey, RelationshipDocument, TwinDocument};
use crate::store::{GraphStore, JsonPatch, StoreError, StoreOp, StoreResult};
use crate::{Error, Result};

// ============================================================================
// States
// ============================================================================

/// Where a document is in its reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileState {
    Received,
    Probed,
    Created,
    Updated,
    Deleted,
    Acknowledged,
    Failed,
}

impl ReconcileState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReconcileState::Acknowledged | ReconcileState::Failed)
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_advance_to(&self, next: ReconcileState) -> bool {
        use ReconcileState::*;
        match (self, next) {
            (s, Failed) => !s.is_terminal(),
            (Received, Probed | Deleted) => true,
            (Probed, Created | Updated | Deleted) => true,
            (Created | Updated | Deleted, Acknowledged) => true,
            _ => false,
        }
    }
}

/// What the reconciler did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileAction {
    /// Absent before; created with the full document.
    Created,
    /// Present before; patched. `ops == 0` means nothing was sent.
    Updated { ops: usize },
    Deleted,
    /// Delete requested for something already gone.
    AlreadyAbsent,
}

/// Result of reconciling one document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileOutcome {
    pub kind: DocumentKind,
    pub id: String,
    pub action: ReconcileAction,
    /// Relationships removed ahead of a twin delete, whether or not they were
    /// still present when their delete ran.
    pub cascaded: Vec<RelKey>,
    /// States visited, in order. Ends in `Acknowledged`.
    pub trace: Vec<ReconcileState>,
}

/// Per-document state tracker.
struct Machine {
    kind: DocumentKind,
    id: String,
    state: ReconcileState,
    trace: Vec<ReconcileState>,
}

impl Machine {
    fn new(kind: DocumentKind, id: &str) -> Self {
        debug!(state = ?ReconcileState::Received, "transition");
        Self {
            kind,
            id: id.to_owned(),
            state: ReconcileState::Received,
            trace: vec![ReconcileState::Received],
        }
    }

    fn advance(&mut self, next: ReconcileState) {
        debug_assert!(self.state.can_advance_to(next), "{:?} → {:?}", self.state, next);
        debug!(from = ?self.state, to = ?next, "transition");
        self.state = next;
        self.trace.push(next);
    }

    /// Move to `Failed` and build the error for a failed store call.
    fn fail(&mut self, operation: StoreOp, source: StoreError) -> Error {
        self.advance(ReconcileState::Failed);
        error!(kind = %self.kind, id = %self.id, %operation, error = %source, "store call failed");
        Error::TransportFailure { kind: self.kind, id: self.id.clone(), operation, source }
    }

    fn acknowledge(mut self, action: ReconcileAction, cascaded: Vec<RelKey>) -> ReconcileOutcome {
        self.advance(ReconcileState::Acknowledged);
        ReconcileOutcome { kind: self.kind, id: self.id, action, cascaded, trace: self.trace }
    }
}

// ============================================================================
// Throttle
// ============================================================================

/// Fixed pre-call delay per call kind. Rate shaping only; never a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Throttle {
    pub twin: Duration,
    pub relationship: Duration,
}

impl Throttle {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self { twin: config.twin_call_delay(), relationship: config.relationship_call_delay() }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn delay_for(&self, kind: DocumentKind) -> Duration {
        match kind {
            DocumentKind::Twin => self.twin,
            DocumentKind::Relationship => self.relationship,
        }
    }

    /// Suspend for the delay of `kind`.
    pub async fn pause(&self, kind: DocumentKind) {
        let delay = self.delay_for(kind);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

// ============================================================================
// Reconciler
// ============================================================================

/// Applies documents to a [`GraphStore`]. Holds no cache of remote state;
/// every document is probed afresh.
pub struct Reconciler<S: GraphStore + ?Sized> {
    store: Arc<S>,
    throttle: Throttle,
}

impl<S: GraphStore + ?Sized> Reconciler<S> {
    pub fn new(store: Arc<S>, config: &SyncConfig) -> Self {
        Self { store, throttle: Throttle::from_config(config) }
    }

    pub fn with_throttle(mut self, throttle: Throttle) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn throttle(&self) -> Throttle {
        self.throttle
    }

    /// Decode one base64 queue message and reconcile it.
    pub async fn handle_message(&self, body: &str) -> Result<ReconcileOutcome> {
        let doc = decode_body(body)?;
        self.reconcile(&doc).await
    }

    /// Reconcile one document.
    pub async fn reconcile(&self, doc: &CanonicalDocument) -> Result<ReconcileOutcome> {
        let span = info_span!("reconcile", kind = %doc.kind(), id = %doc.id());
        async {
            let outcome = match doc {
                CanonicalDocument::Twin(twin) if twin.delete => self.delete_twin(twin).await,
                CanonicalDocument::Twin(twin) => self.apply_twin(twin).await,
                CanonicalDocument::Relationship(rel) if rel.delete => self.delete_relationship(rel).await,
                CanonicalDocument::Relationship(rel) => self.apply_relationship(rel).await,
            }?;
            info!(action = ?outcome.action, cascaded = outcome.cascaded.len(), "reconciled");
            Ok::<_, Error>(outcome)
        }
        .instrument(span)
        .await
    }

    /// Await the delay for `pace`, then the call.
    async fn paced<T, F>(&self, pace: DocumentKind, call: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        self.throttle.pause(pace).await;
        call.await
    }

    // ========================================================================
    // Twins
    // ========================================================================

    async fn apply_twin(&self, twin: &TwinDocument) -> Result<ReconcileOutcome> {
        let mut m = Machine::new(DocumentKind::Twin, &twin.id);
        let twin_pace = DocumentKind::Twin;

        let stored = self
            .paced(twin_pace, self.store.get_twin(&twin.id))
            .await
            .map_err(|e| m.fail(StoreOp::GetTwin, e))?;
        m.advance(ReconcileState::Probed);

        if let Some(current) = stored {
            let patch = JsonPatch::merge(&current, &twin.properties);
            if !patch.is_empty() {
                self.paced(twin_pace, self.store.update_twin(&twin.id, &patch))
                    .await
                    .map_err(|e| m.fail(StoreOp::UpdateTwin, e))?;
            }
            m.advance(ReconcileState::Updated);
            Ok(m.acknowledge(ReconcileAction::Updated { ops: patch.len() }, Vec::new()))
        } else {
            self.paced(twin_pace, self.store.upsert_twin(twin))
                .await
                .map_err(|e| m.fail(StoreOp::UpsertTwin, e))?;
            m.advance(ReconcileState::Created);
            Ok(m.acknowledge(ReconcileAction::Created, Vec::new()))
        }
    }

    async fn delete_twin(&self, twin: &TwinDocument) -> Result<ReconcileOutcome> {
        let mut m = Machine::new(DocumentKind::Twin, &twin.id);
        let rel_pace = DocumentKind::Relationship;

        // A self-loop shows up in both listings.
        let mut attached = BTreeSet::new();
        for direction in [Direction::Outgoing, Direction::Incoming] {
            let keys = self
                .paced(rel_pace, self.store.list_relationships(&twin.id, direction))
                .await
                .map_err(|e| m.fail(StoreOp::ListRelationships, e))?;
            attached.extend(keys);
        }
        m.advance(ReconcileState::Probed);
        debug!(relationships = attached.len(), "cascading delete");

        for key in &attached {
            match self.paced(rel_pace, self.store.delete_relationship(key)).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => warn!(relationship = %key, "already gone"),
                Err(e) => return Err(m.fail(StoreOp::DeleteRelationship, e)),
            }
        }

        let action = match self.paced(DocumentKind::Twin, self.store.delete_twin(&twin.id)).await {
            Ok(()) => ReconcileAction::Deleted,
            Err(e) if e.is_not_found() => {
                warn!("twin already gone");
                ReconcileAction::AlreadyAbsent
            }
            Err(e) => return Err(m.fail(StoreOp::DeleteTwin, e)),
        };
        m.advance(ReconcileState::Deleted);
        Ok(m.acknowledge(action, attached.into_iter().collect()))
    }

    // ========================================================================
    // Relationships
    // ========================================================================

    async fn apply_relationship(&self, rel: &RelationshipDocument) -> Result<ReconcileOutcome> {
        let mut m = Machine::new(DocumentKind::Relationship, &rel.relationship_id);
        let pace = DocumentKind::Relationship;
        let key = rel.key();

        let stored = self
            .paced(pace, self.store.get_relationship(&key))
            .await
            .map_err(|e| m.fail(StoreOp::GetRelationship, e))?;
        m.advance(ReconcileState::Probed);

        if let Some(current) = stored {
            let patch = JsonPatch::merge(&current, &rel.properties);
            if !patch.is_empty() {
                self.paced(pace, self.store.update_relationship(&key, &patch))
                    .await
                    .map_err(|e| m.fail(StoreOp::UpdateRelationship, e))?;
            }
            m.advance(ReconcileState::Updated);
            Ok(m.acknowledge(ReconcileAction::Updated { ops: patch.len() }, Vec::new()))
        } else {
            self.paced(pace, self.store.upsert_relationship(rel))
                .await
                .map_err(|e| m.fail(StoreOp::UpsertRelationship, e))?;
            m.advance(ReconcileState::Created);
            Ok(m.acknowledge(ReconcileAction::Created, Vec::new()))
        }
    }

    async fn delete_relationship(&self, rel: &RelationshipDocument) -> Result<ReconcileOutcome> {
        let mut m = Machine::new(DocumentKind::Relationship, &rel.relationship_id);

        let action = match self
            .paced(DocumentKind::Relationship, self.store.delete_relationship(&rel.key()))
            .await
        {
            Ok(()) => ReconcileAction::Deleted,
            Err(e) if e.is_not_found() => {
                warn!("relationship already gone");
                ReconcileAction::AlreadyAbsent
            }
            Err(e) => return Err(m.fail(StoreOp::DeleteRelationship, e)),
        };
        m.advance(ReconcileState::Deleted);
        Ok(m.acknowledge(action, Vec::new()))
    }
}
