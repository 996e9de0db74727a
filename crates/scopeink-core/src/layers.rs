//! Layers: ordered, named groupings of shapes.

use crate::clock::Timestamp;
use crate::error::ValidationError;
use crate::ids::{LayerId, UserId};
use crate::shapes::SerializableColor;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A named group of shapes sharing visibility and color.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub id: LayerId,
    pub name: String,
    pub color: SerializableColor,
    pub visible: bool,
    /// Position in the layer stack, lowest first.
    pub order: u32,
    pub updated_by: UserId,
    /// Client-local monotonic stamp used for last-writer-wins.
    pub client_updated_at: Timestamp,
}

impl Layer {
    pub fn new(id: LayerId, name: impl Into<String>, color: SerializableColor) -> Self {
        Self {
            id,
            name: name.into(),
            color,
            visible: true,
            order: 0,
            updated_by: UserId::new(""),
            client_updated_at: 0,
        }
    }

    /// The layer every project starts with.
    pub fn default_layer() -> Self {
        Self::new(LayerId::default_layer(), "Default", SerializableColor::black())
    }

    /// Same tie-breaking rule as shapes.
    pub fn is_superseded_by(&self, other: &Layer) -> bool {
        (other.client_updated_at, &other.updated_by) > (self.client_updated_at, &self.updated_by)
    }
}

/// Changes to a layer's presentation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayerPatch {
    pub name: Option<String>,
    pub color: Option<SerializableColor>,
    pub visible: Option<bool>,
}

/// The layers of one project plus the active layer.
#[derive(Debug, Clone)]
pub struct LayerSet {
    layers: HashMap<LayerId, Layer>,
    active: LayerId,
}

impl Default for LayerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl LayerSet {
    /// A set containing only the default layer, which is active.
    pub fn new() -> Self {
        let default = Layer::default_layer();
        let active = default.id.clone();
        let mut layers = HashMap::new();
        layers.insert(default.id.clone(), default);
        Self { layers, active }
    }

    pub fn contains(&self, id: &LayerId) -> bool {
        self.layers.contains_key(id)
    }

    pub fn get(&self, id: &LayerId) -> Option<&Layer> {
        self.layers.get(id)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn active(&self) -> &LayerId {
        &self.active
    }

    /// Make `id` the active layer. Returns false if it does not exist.
    pub fn set_active(&mut self, id: &LayerId) -> bool {
        if self.layers.contains_key(id) {
            self.active = id.clone();
            true
        } else {
            false
        }
    }

    /// The layer a new shape lands on.
    pub fn resolve(&self, explicit: Option<&LayerId>) -> LayerId {
        explicit.cloned().unwrap_or_else(|| self.active.clone())
    }

    /// Layers bottom to top.
    pub fn ordered(&self) -> Vec<&Layer> {
        let mut layers: Vec<&Layer> = self.layers.values().collect();
        layers.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
        layers
    }

    /// Next free position at the top of the stack.
    pub fn next_order(&self) -> u32 {
        self.layers.values().map(|l| l.order + 1).max().unwrap_or(0)
    }

    /// Insert a new local layer.
    pub fn insert(&mut self, layer: Layer) -> Result<(), ValidationError> {
        if self.layers.contains_key(&layer.id) {
            return Err(ValidationError::DuplicateLayer(layer.id));
        }
        self.layers.insert(layer.id.clone(), layer);
        Ok(())
    }

    /// Apply a presentation patch. Returns the updated layer.
    pub fn patch(&mut self, id: &LayerId, patch: &LayerPatch) -> Option<&mut Layer> {
        let layer = self.layers.get_mut(id)?;
        if let Some(name) = &patch.name {
            layer.name = name.clone();
        }
        if let Some(color) = patch.color {
            layer.color = color;
        }
        if let Some(visible) = patch.visible {
            layer.visible = visible;
        }
        Some(layer)
    }

    /// Reorder layers to match `order`, which must list every layer once.
    ///
    /// Returns the ids whose position changed.
    pub fn reorder(&mut self, order: &[LayerId]) -> Result<Vec<LayerId>, ValidationError> {
        let mut seen = std::collections::HashSet::new();
        let complete = order.len() == self.layers.len()
            && order.iter().all(|id| self.layers.contains_key(id) && seen.insert(id));
        if !complete {
            return Err(ValidationError::UnknownLayerOrder);
        }

        let mut changed = Vec::new();
        for (index, id) in order.iter().enumerate() {
            if let Some(layer) = self.layers.get_mut(id) {
                if layer.order != index as u32 {
                    layer.order = index as u32;
                    changed.push(id.clone());
                }
            }
        }
        Ok(changed)
    }

    /// Merge a remote layer with last-writer-wins. Returns true if applied.
    pub fn merge_remote(&mut self, layer: Layer) -> bool {
        match self.layers.get_mut(&layer.id) {
            Some(local) if !local.is_superseded_by(&layer) => false,
            Some(local) => {
                *local = layer;
                true
            }
            None => {
                self.layers.insert(layer.id.clone(), layer);
                true
            }
        }
    }

    pub fn get_mut(&mut self, id: &LayerId) -> Option<&mut Layer> {
        self.layers.get_mut(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(id: &str, order: u32) -> Layer {
        let mut layer = Layer::new(LayerId::new(id), id, SerializableColor::black());
        layer.order = order;
        layer
    }

    #[test]
    fn test_new_set_has_active_default() {
        let set = LayerSet::new();
        assert_eq!(set.len(), 1);
        assert!(set.active().is_default());
        assert_eq!(set.resolve(None), LayerId::default_layer());
    }

    #[test]
    fn test_resolve_prefers_explicit_layer() {
        let mut set = LayerSet::new();
        set.insert(layer("walls", 1)).unwrap();
        assert!(set.set_active(&LayerId::new("walls")));
        assert_eq!(set.resolve(None), LayerId::new("walls"));
        assert_eq!(
            set.resolve(Some(&LayerId::default_layer())),
            LayerId::default_layer()
        );
    }

    #[test]
    fn test_set_active_unknown_layer() {
        let mut set = LayerSet::new();
        assert!(!set.set_active(&LayerId::new("ghost")));
        assert!(set.active().is_default());
    }

    #[test]
    fn test_duplicate_layer_rejected() {
        let mut set = LayerSet::new();
        assert!(matches!(
            set.insert(Layer::default_layer()),
            Err(ValidationError::DuplicateLayer(_))
        ));
    }

    #[test]
    fn test_reorder() {
        let mut set = LayerSet::new();
        set.insert(layer("walls", 1)).unwrap();
        set.insert(layer("roof", 2)).unwrap();

        let changed = set
            .reorder(&[LayerId::new("roof"), LayerId::default_layer(), LayerId::new("walls")])
            .unwrap();
        assert_eq!(changed.len(), 3);
        let ids: Vec<&str> = set.ordered().iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["roof", "default", "walls"]);
    }

    #[test]
    fn test_reorder_requires_every_layer_once() {
        let mut set = LayerSet::new();
        set.insert(layer("walls", 1)).unwrap();
        assert!(set.reorder(&[LayerId::new("walls")]).is_err());
        assert!(set.reorder(&[LayerId::new("walls"), LayerId::new("walls")]).is_err());
    }

    #[test]
    fn test_merge_remote_last_writer_wins() {
        let mut set = LayerSet::new();
        let mut newer = Layer::default_layer();
        newer.name = "Site plan".to_string();
        newer.client_updated_at = 10;
        assert!(set.merge_remote(newer.clone()));

        let mut older = Layer::default_layer();
        older.name = "Stale".to_string();
        older.client_updated_at = 5;
        assert!(!set.merge_remote(older));
        assert_eq!(set.get(&LayerId::default_layer()).unwrap().name, "Site plan");
    }
}
