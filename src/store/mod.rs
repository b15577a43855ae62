//! # Graph Store Contract
//!
//! The boundary between the reconciler and whatever holds the twin graph.
//! Every call the reconciler makes is one of the operations below; nothing
//! else about the remote store (authentication, connection pooling, HTTP)
//! leaks through.
//!
//! ## Implementations
//!
//! | Store | Module | Description |
//! |-------|--------|-------------|
//! | `MemoryStore` | `memory` | In-memory reference store for tests and dry runs |

pub mod memory;
pub mod patch;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::model::{Direction, RelKey, RelationshipDocument, TwinDocument};

pub use memory::{MemoryStore, StoreCall};
pub use patch::{escape_token, JsonPatch, PatchOp};

// ============================================================================
// Errors
// ============================================================================

/// Failure reported by a store collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The addressed twin or relationship does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The store refused because of the current graph state, e.g. deleting a
    /// twin that still has relationships.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid patch: {0}")]
    InvalidPatch(String),

    /// The store answered with a failure status.
    #[error("rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The store could not be reached.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ============================================================================
// Operations
// ============================================================================

/// Names each store call, for journals, fault injection and error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreOp {
    GetTwin,
    UpsertTwin,
    UpdateTwin,
    DeleteTwin,
    GetRelationship,
    UpsertRelationship,
    UpdateRelationship,
    DeleteRelationship,
    ListRelationships,
}

impl StoreOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreOp::GetTwin => "get_twin",
            StoreOp::UpsertTwin => "upsert_twin",
            StoreOp::UpdateTwin => "update_twin",
            StoreOp::DeleteTwin => "delete_twin",
            StoreOp::GetRelationship => "get_relationship",
            StoreOp::UpsertRelationship => "upsert_relationship",
            StoreOp::UpdateRelationship => "update_relationship",
            StoreOp::DeleteRelationship => "delete_relationship",
            StoreOp::ListRelationships => "list_relationships",
        }
    }
}

impl std::fmt::Display for StoreOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// GraphStore Trait
// ============================================================================

/// The graph store contract.
///
/// Deletes of absent items report `StoreError::NotFound`; deciding that this
/// is harmless is the caller's business, not the store's.
#[async_trait]
pub trait GraphStore: Send + Sync {
    // ========================================================================
    // Twins
    // ========================================================================

    /// Fetch a twin's stored form; `None` when it does not exist.
    async fn get_twin(&self, id: &str) -> StoreResult<Option<Map<String, Json>>>;

    /// Create or fully replace a twin.
    async fn upsert_twin(&self, twin: &TwinDocument) -> StoreResult<()>;

    /// Apply a patch to an existing twin. Members not named by the patch are
    /// left as they are.
    async fn update_twin(&self, id: &str, patch: &JsonPatch) -> StoreResult<()>;

    /// Delete a twin. Fails with `Conflict` while relationships remain.
    async fn delete_twin(&self, id: &str) -> StoreResult<()>;

    // ========================================================================
    // Relationships
    // ========================================================================

    /// Fetch a relationship's stored form: identity fields, `$targetId`,
    /// `$relationshipName` and its properties as top-level members.
    async fn get_relationship(&self, key: &RelKey) -> StoreResult<Option<Map<String, Json>>>;

    /// Create or fully replace a relationship.
    async fn upsert_relationship(&self, rel: &RelationshipDocument) -> StoreResult<()>;

    async fn update_relationship(&self, key: &RelKey, patch: &JsonPatch) -> StoreResult<()>;

    async fn delete_relationship(&self, key: &RelKey) -> StoreResult<()>;

    /// Relationships where `twin_id` is the source (`Outgoing`) or the
    /// target (`Incoming`).
    async fn list_relationships(&self, twin_id: &str, direction: Direction) -> StoreResult<Vec<RelKey>>;
}
