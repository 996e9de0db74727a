//! Shape definitions for the canvas.

mod geometry;
mod patch;

pub use geometry::{Geometry, ShapeKind};
pub use patch::ShapePatch;

use crate::clock::Timestamp;
use crate::error::ValidationError;
use crate::ids::{LayerId, ShapeId, UserId};
use kurbo::Rect;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Serializable color representation (RGBA8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SerializableColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl SerializableColor {
    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self::new(r, g, b, 255)
    }

    pub const fn black() -> Self {
        Self::rgb(0, 0, 0)
    }

    pub const fn white() -> Self {
        Self::rgb(255, 255, 255)
    }

    pub const fn transparent() -> Self {
        Self::new(0, 0, 0, 0)
    }

    /// Parse `#RRGGBB` or `#RRGGBBAA`.
    pub fn from_hex(hex: &str) -> Option<Self> {
        let hex = hex.strip_prefix('#').unwrap_or(hex);
        let byte = |i: usize| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok();
        match hex.len() {
            6 => Some(Self::rgb(byte(0)?, byte(2)?, byte(4)?)),
            8 => Some(Self::new(byte(0)?, byte(2)?, byte(4)?, byte(6)?)),
            _ => None,
        }
    }

    /// Format as `#RRGGBB`, or `#RRGGBBAA` when not fully opaque.
    pub fn to_hex(&self) -> String {
        if self.a == 255 {
            format!("#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
        } else {
            format!("#{:02X}{:02X}{:02X}{:02X}", self.r, self.g, self.b, self.a)
        }
    }
}

/// Style properties for shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeStyle {
    /// Stroke color.
    pub stroke_color: SerializableColor,
    /// Stroke width.
    pub stroke_width: f64,
    /// Fill color (None = no fill).
    pub fill_color: Option<SerializableColor>,
    /// Overall opacity (0.0 = fully transparent, 1.0 = fully opaque).
    #[serde(default = "default_opacity")]
    pub opacity: f64,
}

fn default_opacity() -> f64 {
    1.0
}

impl Default for ShapeStyle {
    fn default() -> Self {
        Self {
            stroke_color: SerializableColor::black(),
            stroke_width: 2.0,
            fill_color: None,
            opacity: 1.0,
        }
    }
}

/// A shape as requested by a local gesture, before the store stamps it.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeDraft {
    pub id: ShapeId,
    pub geometry: Geometry,
    pub style: ShapeStyle,
    /// Explicit layer; `None` means the active layer.
    pub layer_id: Option<LayerId>,
    pub rotation: f64,
}

impl ShapeDraft {
    pub fn new(geometry: Geometry) -> Self {
        Self {
            id: Uuid::new_v4(),
            geometry,
            style: ShapeStyle::default(),
            layer_id: None,
            rotation: 0.0,
        }
    }

    pub fn with_id(mut self, id: ShapeId) -> Self {
        self.id = id;
        self
    }

    pub fn on_layer(mut self, layer_id: LayerId) -> Self {
        self.layer_id = Some(layer_id);
        self
    }

    pub fn with_style(mut self, style: ShapeStyle) -> Self {
        self.style = style;
        self
    }

    pub fn with_rotation(mut self, rotation: f64) -> Self {
        self.rotation = rotation;
        self
    }
}

/// A synchronized shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shape {
    pub id: ShapeId,
    pub geometry: Geometry,
    pub style: ShapeStyle,
    pub layer_id: LayerId,
    /// Rotation angle in radians (around the bounds center).
    #[serde(default)]
    pub rotation: f64,
    pub created_by: UserId,
    pub created_at: Timestamp,
    pub updated_by: UserId,
    pub updated_at: Timestamp,
    /// Client-local monotonic stamp used for last-writer-wins.
    pub client_updated_at: Timestamp,
}

impl Shape {
    /// Build a shape from a draft. Audit fields are all set to `now`.
    pub fn from_draft(draft: ShapeDraft, layer_id: LayerId, user: &UserId, now: Timestamp) -> Self {
        Self {
            id: draft.id,
            geometry: draft.geometry,
            style: draft.style,
            layer_id,
            rotation: draft.rotation,
            created_by: user.clone(),
            created_at: now,
            updated_by: user.clone(),
            updated_at: now,
            client_updated_at: now,
        }
    }

    pub fn kind(&self) -> ShapeKind {
        self.geometry.kind()
    }

    pub fn bounds(&self) -> Rect {
        self.geometry.bounds()
    }

    /// Check geometry and style. Layer existence is checked by the store.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.geometry.validate(self.id)?;
        if self.style.stroke_width.is_nan() || self.style.stroke_width < 0.0 {
            return Err(ValidationError::NonPositiveDimension {
                id: self.id,
                dimension: "stroke_width",
                value: self.style.stroke_width,
            });
        }
        if !self.rotation.is_finite() {
            return Err(ValidationError::NonFiniteCoordinate { id: self.id });
        }
        Ok(())
    }

    /// Record a local modification.
    pub fn touch(&mut self, user: &UserId, now: Timestamp, stamp: Timestamp) {
        self.updated_by = user.clone();
        self.updated_at = now;
        self.client_updated_at = stamp;
    }

    /// Whether `other` wins last-writer-wins against `self`.
    ///
    /// Higher `client_updated_at` wins; equal stamps fall back to the
    /// author id so every client picks the same winner.
    pub fn is_superseded_by(&self, other: &Shape) -> bool {
        (other.client_updated_at, &other.updated_by) > (self.client_updated_at, &self.updated_by)
    }
}
