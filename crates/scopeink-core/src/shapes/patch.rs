//! Partial shape updates.

use super::{Geometry, SerializableColor, Shape, ShapeStyle};
use crate::ids::LayerId;
use kurbo::Point;
use serde::{Deserialize, Serialize};

/// A set of fields to merge into an existing shape.
///
/// `geometry` replaces the whole geometry; `x`/`y` then move its anchor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShapePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Geometry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<ShapeStyle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke_color: Option<SerializableColor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_id: Option<LayerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f64>,
}

impl ShapePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn x(mut self, x: f64) -> Self {
        self.x = Some(x);
        self
    }

    pub fn y(mut self, y: f64) -> Self {
        self.y = Some(y);
        self
    }

    pub fn geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = Some(geometry);
        self
    }

    pub fn stroke_color(mut self, color: SerializableColor) -> Self {
        self.stroke_color = Some(color);
        self
    }

    pub fn layer(mut self, layer_id: LayerId) -> Self {
        self.layer_id = Some(layer_id);
        self
    }

    pub fn rotation(mut self, rotation: f64) -> Self {
        self.rotation = Some(rotation);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Merge into `shape`. Audit fields are left to the caller.
    pub fn apply_to(&self, shape: &mut Shape) {
        if let Some(geometry) = &self.geometry {
            shape.geometry = geometry.clone();
        }
        if self.x.is_some() || self.y.is_some() {
            let anchor = shape.geometry.anchor();
            let target = Point::new(self.x.unwrap_or(anchor.x), self.y.unwrap_or(anchor.y));
            shape.geometry.move_anchor_to(target);
        }
        if let Some(style) = &self.style {
            shape.style = style.clone();
        }
        if let Some(color) = self.stroke_color {
            shape.style.stroke_color = color;
        }
        if let Some(layer_id) = &self.layer_id {
            shape.layer_id = layer_id.clone();
        }
        if let Some(rotation) = self.rotation {
            shape.rotation = rotation;
        }
    }
}
