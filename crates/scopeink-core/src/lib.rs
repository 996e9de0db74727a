//! ScopeInk Core Library
//!
//! Synchronization engine for collaborative canvases: a per-project shape
//! store with optimistic local edits, last-writer-wins reconciliation,
//! advisory edit locks, presence, undo/redo and a durable offline queue.

pub mod clock;
pub mod config;
pub mod docstore;
pub mod error;
pub mod ids;
pub mod layers;
pub mod locks;
pub mod offline;
pub mod ops;
pub mod presence;
pub mod protocol;
pub mod recent;
pub mod registry;
pub mod shape_store;
pub mod shapes;
pub mod storage;
pub mod sync;
pub mod undo;

pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use config::SyncConfig;
pub use docstore::{DocumentStore, MemoryDocumentStore, RelayDocumentStore};
pub use error::{SyncError, SyncResult, ValidationError};
pub use ids::{GroupId, LayerId, OpId, ProjectId, ShapeId, UserId};
pub use layers::{Layer, LayerPatch};
pub use locks::{Lock, LockDenied, LockOutcome};
pub use offline::{ConnectionStatus, PersistentFailure};
pub use ops::{Operation, OperationKind};
pub use presence::{PresenceRecord, PresenceView};
pub use registry::ProjectRegistry;
pub use shape_store::{
    Backends, ChangeOrigin, ConflictDiscard, LocalUser, ShapeStore, ShapeSyncState, StoreEvent,
    SyncStatus,
};
pub use shapes::{Geometry, SerializableColor, Shape, ShapeDraft, ShapePatch, ShapeStyle};
pub use storage::{FileStorage, KeyValueStorage, MemoryStorage};
