//! Persist operations produced by local mutations.
//!
//! An operation is what the Shape Store hands to the Sync Channel, or to the
//! Offline Queue while disconnected. Its `op_id` is the idempotency key: every
//! document write it produces carries it, so a replayed operation is applied
//! at most once.

use crate::docstore::{Collection, DocPath, DocWrite};
use crate::error::SyncResult;
use crate::ids::{OpId, ProjectId, ShapeId};
use crate::layers::Layer;
use crate::shapes::Shape;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    Reorder,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Reorder => "reorder",
        };
        f.write_str(name)
    }
}

/// A full document written by create/update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum Entity {
    Shape(Shape),
    Layer(Layer),
}

impl Entity {
    fn document(&self) -> (Collection, String) {
        match self {
            Entity::Shape(shape) => (Collection::Shapes, shape.id.to_string()),
            Entity::Layer(layer) => (Collection::Layers, layer.id.as_str().to_string()),
        }
    }

    fn path(&self, project: &ProjectId) -> DocPath {
        let (collection, key) = self.document();
        DocPath::new(project, collection, key)
    }

    fn to_value(&self) -> SyncResult<serde_json::Value> {
        Ok(match self {
            Entity::Shape(shape) => serde_json::to_value(shape)?,
            Entity::Layer(layer) => serde_json::to_value(layer)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Create { entity: Entity },
    Update { entity: Entity },
    Delete { shape_id: ShapeId },
    /// New stacking order; carries every layer whose position changed.
    Reorder { layers: Vec<Layer> },
}

/// A committed local mutation awaiting persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub op_id: OpId,
    pub payload: Payload,
}

impl Operation {
    pub fn new(payload: Payload) -> Self {
        Self {
            op_id: OpId::new(),
            payload,
        }
    }

    pub fn create_shape(shape: Shape) -> Self {
        Self::new(Payload::Create {
            entity: Entity::Shape(shape),
        })
    }

    pub fn update_shape(shape: Shape) -> Self {
        Self::new(Payload::Update {
            entity: Entity::Shape(shape),
        })
    }

    pub fn delete_shape(shape_id: ShapeId) -> Self {
        Self::new(Payload::Delete { shape_id })
    }

    pub fn create_layer(layer: Layer) -> Self {
        Self::new(Payload::Create {
            entity: Entity::Layer(layer),
        })
    }

    pub fn update_layer(layer: Layer) -> Self {
        Self::new(Payload::Update {
            entity: Entity::Layer(layer),
        })
    }

    pub fn reorder(layers: Vec<Layer>) -> Self {
        Self::new(Payload::Reorder { layers })
    }

    pub fn kind(&self) -> OperationKind {
        match &self.payload {
            Payload::Create { .. } => OperationKind::Create,
            Payload::Update { .. } => OperationKind::Update,
            Payload::Delete { .. } => OperationKind::Delete,
            Payload::Reorder { .. } => OperationKind::Reorder,
        }
    }

    /// The shape this operation touches, if any.
    pub fn shape_id(&self) -> Option<ShapeId> {
        match &self.payload {
            Payload::Create {
                entity: Entity::Shape(shape),
            }
            | Payload::Update {
                entity: Entity::Shape(shape),
            } => Some(shape.id),
            Payload::Delete { shape_id } => Some(*shape_id),
            _ => None,
        }
    }

    /// Documents this operation overwrites, as `(collection, key)`.
    fn documents(&self) -> Vec<(Collection, String)> {
        match &self.payload {
            Payload::Create { entity } | Payload::Update { entity } => vec![entity.document()],
            Payload::Delete { shape_id } => vec![(Collection::Shapes, shape_id.to_string())],
            Payload::Reorder { layers } => layers
                .iter()
                .map(|layer| (Collection::Layers, layer.id.as_str().to_string()))
                .collect(),
        }
    }

    /// Whether this operation overwrites every document `earlier` wrote, so
    /// re-sending `earlier` after it would change nothing.
    pub fn supersedes(&self, earlier: &Operation) -> bool {
        let mine = self.documents();
        earlier.documents().iter().all(|doc| mine.contains(doc))
    }

    /// Document writes that persist this operation, all tagged with `op_id`.
    pub fn writes(&self, project: &ProjectId) -> SyncResult<Vec<DocWrite>> {
        let op_id = Some(self.op_id);
        match &self.payload {
            Payload::Create { entity } | Payload::Update { entity } => Ok(vec![DocWrite::put(
                &entity.path(project),
                entity.to_value()?,
                op_id,
            )]),
            Payload::Delete { shape_id } => Ok(vec![DocWrite::delete(
                &DocPath::new(project, Collection::Shapes, shape_id.to_string()),
                op_id,
            )]),
            Payload::Reorder { layers } => layers
                .iter()
                .map(|layer| {
                    let path = DocPath::new(project, Collection::Layers, layer.id.as_str());
                    Ok(DocWrite::put(&path, serde_json::to_value(layer)?, op_id))
                })
                .collect(),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.shape_id() {
            Some(id) => write!(f, "{} shape {} ({})", self.kind(), id, self.op_id),
            None => write!(f, "{} layer ({})", self.kind(), self.op_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{LayerId, UserId};
    use crate::shapes::{Geometry, SerializableColor, ShapeDraft};
    use kurbo::Point;

    fn shape() -> Shape {
        let draft = ShapeDraft::new(Geometry::rectangle(Point::new(0.0, 0.0), 4.0, 4.0));
        Shape::from_draft(draft, LayerId::default_layer(), &UserId::new("ana"), 7)
    }

    #[test]
    fn test_create_writes_full_document() {
        let shape = shape();
        let op = Operation::create_shape(shape.clone());
        let project = ProjectId::new("p");
        let writes = op.writes(&project).unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].path, format!("projects/p/shapes/{}", shape.id));
        assert_eq!(writes[0].op_id, Some(op.op_id));
        let back: Shape = serde_json::from_value(writes[0].value.clone().unwrap()).unwrap();
        assert_eq!(back, shape);
    }

    #[test]
    fn test_delete_writes_null() {
        let id = shape().id;
        let op = Operation::delete_shape(id);
        assert_eq!(op.kind(), OperationKind::Delete);
        assert_eq!(op.shape_id(), Some(id));
        let writes = op.writes(&ProjectId::new("p")).unwrap();
        assert!(writes[0].value.is_none());
    }

    #[test]
    fn test_reorder_writes_each_layer_with_same_op_id() {
        let mut a = Layer::new(LayerId::new("a"), "A", SerializableColor::black());
        let mut b = Layer::new(LayerId::new("b"), "B", SerializableColor::black());
        a.order = 1;
        b.order = 0;
        let op = Operation::reorder(vec![a, b]);
        let writes = op.writes(&ProjectId::new("p")).unwrap();
        assert_eq!(writes.len(), 2);
        assert!(writes.iter().all(|w| w.op_id == Some(op.op_id)));
        assert_eq!(op.shape_id(), None);
    }

    #[test]
    fn test_later_write_to_same_document_supersedes() {
        let shape = shape();
        let create = Operation::create_shape(shape.clone());
        let delete = Operation::delete_shape(shape.id);
        assert!(delete.supersedes(&create));
        assert!(create.supersedes(&delete));
        assert!(!Operation::delete_shape(uuid::Uuid::new_v4()).supersedes(&create));

        let a = Layer::new(LayerId::new("a"), "A", SerializableColor::black());
        let b = Layer::new(LayerId::new("b"), "B", SerializableColor::black());
        let reorder = Operation::reorder(vec![a.clone(), b]);
        assert!(reorder.supersedes(&Operation::update_layer(a.clone())));
        assert!(!Operation::update_layer(a).supersedes(&reorder));
    }

    #[test]
    fn test_operation_json_is_tagged() {
        let op = Operation::update_shape(shape());
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["payload"]["kind"], "update");
        assert_eq!(json["payload"]["entity"]["entity"], "shape");
        let back: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }
}
