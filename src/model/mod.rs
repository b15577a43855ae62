//! # Canonical Document Model
//!
//! DTOs that cross every boundary: transform → dispatch → reconcile → store.
//!
//! Design rule: this module is pure data. No I/O, no state, no async.

pub mod document;
pub mod property_map;
pub mod relationship;
pub mod twin;
pub mod value;

pub use document::{keys, is_reserved, CanonicalDocument, DocumentKind, SIGIL};
pub use property_map::{property_map, PropertyMap};
pub use relationship::{derive_relationship_id, Direction, RelKey, RelationshipDocument};
pub use twin::TwinDocument;
pub use value::Value;
