//! In-memory graph store.
//!
//! This is the reference implementation of `GraphStore`. Twins and
//! relationships are kept in their stored JSON form in hash maps protected
//! by `RwLock`, and behave like the remote store in the ways the reconciler
//! can observe:
//!
//! - upserts replace the whole stored object and stamp
//!   `$metadata.$lastUpdateTime`
//! - patches leave unnamed members untouched
//! - relationships need both endpoints to exist
//! - a twin cannot be deleted while any relationship touches it
//! - deletes and updates of absent items fail with `NotFound`
//!
//! For tests it also keeps a journal of every call it received and can be
//! told to fail the next N calls of a given operation.
//!
//! ## Limitations
//!
//! - **Incoming scans are linear**: there is no adjacency index, so listing
//!   incoming relationships walks every stored relationship.
//! - **No concurrency control**: probe-then-write sequences from two callers
//!   can interleave, exactly as they can against the remote store.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use async_trait::async_trait;
use serde_json::{Map, Value as Json};
use tracing::debug;

use crate::model::{keys, Direction, RelKey, RelationshipDocument, TwinDocument};
use super::{GraphStore, JsonPatch, StoreError, StoreOp, StoreResult};

// ============================================================================
// Journal
// ============================================================================

/// One call received by the store, successful or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreCall {
    pub op: StoreOp,
    /// Twin id, or `source/relationship` for relationship calls.
    pub target: String,
}

impl StoreCall {
    fn new(op: StoreOp, target: impl ToString) -> Self {
        Self { op, target: target.to_string() }
    }
}

struct Fault {
    remaining: usize,
    error: StoreError,
}

// ============================================================================
// MemoryStore
// ============================================================================

/// In-memory twin graph. Cloning shares the same graph.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    twins: RwLock<HashMap<String, Map<String, Json>>>,
    relationships: RwLock<HashMap<RelKey, Map<String, Json>>>,
    journal: Mutex<Vec<StoreCall>>,
    faults: Mutex<HashMap<StoreOp, Fault>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls of `op` with `error`.
    pub fn fail_next(&self, op: StoreOp, times: usize, error: StoreError) {
        self.inner.faults.lock().insert(op, Fault { remaining: times, error });
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Vec<StoreCall> {
        self.inner.journal.lock().clone()
    }

    /// Targets of the calls of one kind, in order.
    pub fn calls_of(&self, op: StoreOp) -> Vec<String> {
        self.inner
            .journal
            .lock()
            .iter()
            .filter(|c| c.op == op)
            .map(|c| c.target.clone())
            .collect()
    }

    pub fn clear_journal(&self) {
        self.inner.journal.lock().clear();
    }

    /// Stored form of a twin.
    pub fn twin(&self, id: &str) -> Option<Json> {
        self.inner.twins.read().get(id).cloned().map(Json::Object)
    }

    /// Stored form of a relationship.
    pub fn relationship(&self, key: &RelKey) -> Option<Json> {
        self.inner.relationships.read().get(key).cloned().map(Json::Object)
    }

    pub fn twin_count(&self) -> usize {
        self.inner.twins.read().len()
    }

    pub fn relationship_count(&self) -> usize {
        self.inner.relationships.read().len()
    }

    /// Record the call, then consume an injected fault if one is armed.
    fn enter(&self, op: StoreOp, target: impl ToString) -> StoreResult<()> {
        let call = StoreCall::new(op, target);
        debug!(op = %call.op, target = %call.target, "store call");
        self.inner.journal.lock().push(call);

        let mut faults = self.inner.faults.lock();
        if let Some(fault) = faults.get_mut(&op) {
            if fault.remaining > 0 {
                fault.remaining -= 1;
                return Err(fault.error.clone());
            }
        }
        Ok(())
    }

    fn twin_attached(&self, id: &str) -> bool {
        self.inner
            .relationships
            .read()
            .iter()
            .any(|(key, body)| key.source_id == id || target_of(body) == Some(id))
    }
}

fn target_of(body: &Map<String, Json>) -> Option<&str> {
    body.get(keys::TARGET_ID).and_then(Json::as_str)
}

fn stamp(object: &mut Map<String, Json>) {
    let now = Json::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
    match object.get_mut(keys::METADATA) {
        Some(Json::Object(metadata)) => {
            metadata.insert(keys::LAST_UPDATE_TIME.into(), now);
        }
        _ => {
            let mut metadata = Map::new();
            metadata.insert(keys::LAST_UPDATE_TIME.into(), now);
            object.insert(keys::METADATA.into(), Json::Object(metadata));
        }
    }
}

/// Stored relationship: identity fields next to the body members.
fn stored_relationship(rel: &RelationshipDocument) -> Map<String, Json> {
    let mut stored = Map::new();
    stored.insert(keys::RELATIONSHIP_ID.into(), Json::String(rel.relationship_id.clone()));
    stored.insert(keys::SOURCE_ID.into(), Json::String(rel.source_id.clone()));
    stored.extend(rel.body());
    stored
}

// ============================================================================
// GraphStore impl
// ============================================================================

#[async_trait]
impl GraphStore for MemoryStore {
    // ========================================================================
    // Twins
    // ========================================================================

    async fn get_twin(&self, id: &str) -> StoreResult<Option<Map<String, Json>>> {
        self.enter(StoreOp::GetTwin, id)?;
        Ok(self.inner.twins.read().get(id).cloned())
    }

    async fn upsert_twin(&self, twin: &TwinDocument) -> StoreResult<()> {
        self.enter(StoreOp::UpsertTwin, &twin.id)?;
        let Json::Object(mut stored) = twin.to_json() else {
            return Err(StoreError::Rejected { status: 400, message: "twin is not an object".into() });
        };
        stamp(&mut stored);
        self.inner.twins.write().insert(twin.id.clone(), stored);
        Ok(())
    }

    async fn update_twin(&self, id: &str, patch: &JsonPatch) -> StoreResult<()> {
        self.enter(StoreOp::UpdateTwin, id)?;
        let mut twins = self.inner.twins.write();
        let stored = twins.get_mut(id).ok_or_else(|| StoreError::NotFound(format!("twin {id}")))?;
        // Patch a copy so a failing op leaves the stored twin untouched.
        let mut patched = stored.clone();
        patch.apply(&mut patched)?;
        stamp(&mut patched);
        *stored = patched;
        Ok(())
    }

    async fn delete_twin(&self, id: &str) -> StoreResult<()> {
        self.enter(StoreOp::DeleteTwin, id)?;
        if !self.inner.twins.read().contains_key(id) {
            return Err(StoreError::NotFound(format!("twin {id}")));
        }
        if self.twin_attached(id) {
            return Err(StoreError::Conflict(format!("twin {id} still has relationships")));
        }
        self.inner.twins.write().remove(id);
        Ok(())
    }

    // ========================================================================
    // Relationships
    // ========================================================================

    async fn get_relationship(&self, key: &RelKey) -> StoreResult<Option<Map<String, Json>>> {
        self.enter(StoreOp::GetRelationship, key)?;
        Ok(self.inner.relationships.read().get(key).cloned())
    }

    async fn upsert_relationship(&self, rel: &RelationshipDocument) -> StoreResult<()> {
        self.enter(StoreOp::UpsertRelationship, rel.key())?;
        {
            let twins = self.inner.twins.read();
            for endpoint in [&rel.source_id, &rel.target_id] {
                if !twins.contains_key(endpoint.as_str()) {
                    return Err(StoreError::NotFound(format!("twin {endpoint}")));
                }
            }
        }
        self.inner.relationships.write().insert(rel.key(), stored_relationship(rel));
        Ok(())
    }

    async fn update_relationship(&self, key: &RelKey, patch: &JsonPatch) -> StoreResult<()> {
        self.enter(StoreOp::UpdateRelationship, key)?;
        let mut relationships = self.inner.relationships.write();
        let stored = relationships
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(format!("relationship {key}")))?;
        let mut patched = stored.clone();
        patch.apply(&mut patched)?;
        *stored = patched;
        Ok(())
    }

    async fn delete_relationship(&self, key: &RelKey) -> StoreResult<()> {
        self.enter(StoreOp::DeleteRelationship, key)?;
        match self.inner.relationships.write().remove(key) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(format!("relationship {key}"))),
        }
    }

    async fn list_relationships(&self, twin_id: &str, direction: Direction) -> StoreResult<Vec<RelKey>> {
        self.enter(StoreOp::ListRelationships, twin_id)?;
        let relationships = self.inner.relationships.read();
        let mut found: Vec<RelKey> = relationships
            .iter()
            .filter(|(key, body)| match direction {
                Direction::Outgoing => key.source_id == twin_id,
                Direction::Incoming => target_of(body) == Some(twin_id),
            })
            .map(|(key, _)| key.clone())
            .collect();
        found.sort();
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        for id in ["A", "B", "C"] {
            store.upsert_twin(&TwinDocument::new(id, "dtmi:t;1")).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_upsert_and_stamp() {
        let store = MemoryStore::new();
        let twin = TwinDocument::new("a", "dtmi:t;1").with_property("size", 3);
        store.upsert_twin(&twin).await.unwrap();

        let stored = store.twin("a").unwrap();
        assert_eq!(stored["size"], json!(3));
        assert_eq!(stored["$metadata"]["$model"], json!("dtmi:t;1"));
        assert!(stored["$metadata"]["$lastUpdateTime"].is_string());
        assert_eq!(store.get_twin("a").await.unwrap().map(Json::Object), Some(stored));
    }

    #[tokio::test]
    async fn test_update_preserves_other_members() {
        let store = MemoryStore::new();
        let twin = TwinDocument::new("a", "dtmi:t;1").with_property("keep", "me").with_property("size", 1);
        store.upsert_twin(&twin).await.unwrap();

        store.update_twin("a", &JsonPatch::new().add("size", 2)).await.unwrap();
        let stored = store.twin("a").unwrap();
        assert_eq!(stored["keep"], json!("me"));
        assert_eq!(stored["size"], json!(2));
    }

    #[tokio::test]
    async fn test_update_of_absent_twin() {
        let store = MemoryStore::new();
        let err = store.update_twin("nope", &JsonPatch::new().add("k", 1)).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_relationship_needs_endpoints() {
        let store = seeded().await;
        let err = store
            .upsert_relationship(&RelationshipDocument::new("A", "Z", "r"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(store.relationship_count(), 0);
    }

    #[tokio::test]
    async fn test_list_by_direction() {
        let store = seeded().await;
        store.upsert_relationship(&RelationshipDocument::new("A", "B", "r")).await.unwrap();
        store.upsert_relationship(&RelationshipDocument::new("A", "C", "r")).await.unwrap();
        store.upsert_relationship(&RelationshipDocument::new("C", "A", "r")).await.unwrap();

        let out = store.list_relationships("A", Direction::Outgoing).await.unwrap();
        assert_eq!(out, vec![RelKey::new("A", "A-B"), RelKey::new("A", "A-C")]);
        let inc = store.list_relationships("A", Direction::Incoming).await.unwrap();
        assert_eq!(inc, vec![RelKey::new("C", "C-A")]);
    }

    #[tokio::test]
    async fn test_cannot_delete_connected_twin() {
        let store = seeded().await;
        store.upsert_relationship(&RelationshipDocument::new("B", "A", "r")).await.unwrap();

        let err = store.delete_twin("A").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        store.delete_relationship(&RelKey::new("B", "B-A")).await.unwrap();
        store.delete_twin("A").await.unwrap();
        assert!(store.twin("A").is_none());
    }

    #[tokio::test]
    async fn test_delete_absent_is_not_found() {
        let store = MemoryStore::new();
        assert!(store.delete_twin("x").await.unwrap_err().is_not_found());
        assert!(store.delete_relationship(&RelKey::new("x", "y")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_fault_injection_and_journal() {
        let store = MemoryStore::new();
        store.fail_next(StoreOp::GetTwin, 1, StoreError::Unavailable("down".into()));

        assert!(store.get_twin("a").await.is_err());
        assert!(store.get_twin("a").await.unwrap().is_none());
        assert_eq!(store.calls_of(StoreOp::GetTwin), vec!["a", "a"]);

        store.clear_journal();
        assert!(store.calls().is_empty());
    }
}
