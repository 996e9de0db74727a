//! Error types.

use crate::ids::{LayerId, ShapeId};
use crate::storage::StorageError;
use thiserror::Error;

/// A malformed shape, patch, or layer request.
///
/// Raised synchronously before any state is touched; never reaches persistence.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("shape {id}: {dimension} must be positive, got {value}")]
    NonPositiveDimension {
        id: ShapeId,
        dimension: &'static str,
        value: f64,
    },
    #[error("shape {id}: needs at least {min} points, got {got}")]
    TooFewPoints { id: ShapeId, min: usize, got: usize },
    #[error("shape {id}: coordinates must be finite")]
    NonFiniteCoordinate { id: ShapeId },
    #[error("shape {id}: text content is empty")]
    EmptyText { id: ShapeId },
    #[error("shape {id}: unknown layer {layer}")]
    UnknownLayer { id: ShapeId, layer: LayerId },
    #[error("shape {0} already exists")]
    DuplicateShape(ShapeId),
    #[error("shape id {0} was deleted in this session and cannot be reused")]
    ReusedShapeId(ShapeId),
    #[error("layer {0} already exists")]
    DuplicateLayer(LayerId),
    #[error("layer order must list every layer exactly once")]
    UnknownLayerOrder,
}

/// Failures at the document-store boundary.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    /// Publish or subscribe could not reach the remote store.
    #[error("network failure: {0}")]
    Network(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("invalid document path: {0}")]
    InvalidPath(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl SyncError {
    pub fn is_network(&self) -> bool {
        matches!(self, SyncError::Network(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<StorageError> for SyncError {
    fn from(e: StorageError) -> Self {
        SyncError::Storage(e.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
