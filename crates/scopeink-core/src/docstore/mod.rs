//! The real-time document store the engine synchronizes through.
//!
//! The engine needs only two primitives from a provider: a prefix
//! subscription that streams changes, and a single-document write tagged with
//! an idempotency key. Documents live at
//! `projects/{project}/{collection}/{key}`:
//!
//! ```text
//! projects/site-42/
//! ├── shapes/{shape id}    Shape JSON
//! ├── layers/{layer id}    Layer JSON
//! ├── locks/{shape id}     Lock JSON
//! └── presence/{user id}   PresenceRecord JSON
//! ```
//!
//! A `null` value is a deletion.

mod memory;
mod relay;

pub use memory::{MemoryConnection, MemoryDocumentStore};
pub use relay::RelayDocumentStore;

use crate::error::{SyncError, SyncResult};
use crate::ids::{OpId, ProjectId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Top-level document collections of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Shapes,
    Layers,
    Locks,
    Presence,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Collection::Shapes,
        Collection::Layers,
        Collection::Locks,
        Collection::Presence,
    ];

    pub fn segment(&self) -> &'static str {
        match self {
            Collection::Shapes => "shapes",
            Collection::Layers => "layers",
            Collection::Locks => "locks",
            Collection::Presence => "presence",
        }
    }

    fn from_segment(segment: &str) -> Option<Self> {
        Collection::ALL.into_iter().find(|c| c.segment() == segment)
    }
}

/// Address of a single document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocPath {
    pub project: ProjectId,
    pub collection: Collection,
    pub key: String,
}

impl DocPath {
    pub fn new(project: &ProjectId, collection: Collection, key: impl Into<String>) -> Self {
        Self {
            project: project.clone(),
            collection,
            key: key.into(),
        }
    }

    /// Subscription prefix for a whole collection.
    pub fn prefix(project: &ProjectId, collection: Collection) -> String {
        format!("projects/{}/{}/", project, collection.segment())
    }

    pub fn parse(path: &str) -> SyncResult<Self> {
        let invalid = || SyncError::InvalidPath(path.to_string());
        let mut parts = path.split('/');
        if parts.next() != Some("projects") {
            return Err(invalid());
        }
        let project = parts.next().filter(|p| !p.is_empty()).ok_or_else(invalid)?;
        let collection = parts
            .next()
            .and_then(Collection::from_segment)
            .ok_or_else(invalid)?;
        let key = parts.next().filter(|k| !k.is_empty()).ok_or_else(invalid)?;
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self {
            project: ProjectId::new(project),
            collection,
            key: key.to_string(),
        })
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "projects/{}/{}/{}",
            self.project,
            self.collection.segment(),
            self.key
        )
    }
}

/// A document write. `value: None` deletes the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocWrite {
    pub path: String,
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_id: Option<OpId>,
}

impl DocWrite {
    pub fn put(path: &DocPath, value: Value, op_id: Option<OpId>) -> Self {
        Self {
            path: path.to_string(),
            value: Some(value),
            op_id,
        }
    }

    pub fn delete(path: &DocPath, op_id: Option<OpId>) -> Self {
        Self {
            path: path.to_string(),
            value: None,
            op_id,
        }
    }
}

/// One changed document as seen by a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocChange {
    pub path: String,
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_id: Option<OpId>,
}

impl From<DocWrite> for DocChange {
    fn from(write: DocWrite) -> Self {
        Self {
            path: write.path,
            value: write.value,
            op_id: write.op_id,
        }
    }
}

/// A batch delivered to a subscription callback.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    /// True for the snapshot delivered when a subscription opens.
    pub initial: bool,
    pub prefix: String,
    pub changes: Vec<DocChange>,
}

/// Handle for cancelling a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

pub type ChangeCallback = Box<dyn FnMut(ChangeSet)>;
pub type ErrorCallback = Box<dyn FnMut(SyncError)>;

/// The minimal contract of a real-time document store.
///
/// Callbacks run on the thread that owns the store and must not call back
/// into it.
pub trait DocumentStore {
    /// Stream every change under `prefix`, starting with a snapshot.
    fn subscribe(
        &self,
        prefix: &str,
        on_change: ChangeCallback,
        on_error: ErrorCallback,
    ) -> SyncResult<SubscriptionId>;

    fn unsubscribe(&self, id: SubscriptionId);

    /// Hand a write to the store without waiting for it to persist.
    fn write(&self, write: DocWrite) -> SyncResult<()>;

    /// Whether the store is currently reachable.
    fn is_connected(&self) -> bool {
        true
    }

    /// Deliver pending network events to callbacks.
    fn pump(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_roundtrip() {
        let path = DocPath::new(&ProjectId::new("site-42"), Collection::Locks, "abc");
        let text = path.to_string();
        assert_eq!(text, "projects/site-42/locks/abc");
        assert_eq!(DocPath::parse(&text).unwrap(), path);
        assert!(text.starts_with(&DocPath::prefix(&path.project, Collection::Locks)));
    }

    #[test]
    fn test_invalid_paths() {
        for bad in [
            "",
            "projects",
            "projects/p",
            "projects/p/widgets/k",
            "projects/p/shapes/",
            "projects/p/shapes/k/extra",
            "users/p/shapes/k",
        ] {
            assert!(
                matches!(DocPath::parse(bad), Err(SyncError::InvalidPath(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_write_serializes_null_delete() {
        let path = DocPath::new(&ProjectId::new("p"), Collection::Shapes, "s");
        let json = serde_json::to_value(DocWrite::delete(&path, None)).unwrap();
        assert!(json["value"].is_null());
        assert!(json.get("op_id").is_none());
    }
}
