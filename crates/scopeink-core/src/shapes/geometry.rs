//! Kind-specific shape geometry.

use crate::error::ValidationError;
use crate::ids::ShapeId;
use kurbo::{Point, Rect, Vec2};
use serde::{Deserialize, Serialize};

/// The kind of a shape, without its geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeKind {
    Rectangle,
    Circle,
    Text,
    Line,
    Polyline,
    Polygon,
    BoundingBox,
}

/// Geometry of a shape, one variant per kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Geometry {
    Rectangle {
        /// Top-left corner.
        origin: Point,
        width: f64,
        height: f64,
        #[serde(default)]
        corner_radius: f64,
    },
    Circle {
        center: Point,
        radius: f64,
    },
    Text {
        /// Baseline origin of the first line.
        origin: Point,
        content: String,
        font_size: f64,
    },
    Line {
        start: Point,
        end: Point,
    },
    Polyline {
        points: Vec<Point>,
    },
    Polygon {
        points: Vec<Point>,
    },
    /// A measurement or takeoff region.
    BoundingBox {
        origin: Point,
        width: f64,
        height: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
}

impl Geometry {
    pub fn rectangle(origin: Point, width: f64, height: f64) -> Self {
        Geometry::Rectangle {
            origin,
            width,
            height,
            corner_radius: 0.0,
        }
    }

    pub fn circle(center: Point, radius: f64) -> Self {
        Geometry::Circle { center, radius }
    }

    pub fn text(origin: Point, content: impl Into<String>, font_size: f64) -> Self {
        Geometry::Text {
            origin,
            content: content.into(),
            font_size,
        }
    }

    pub fn line(start: Point, end: Point) -> Self {
        Geometry::Line { start, end }
    }

    pub fn bounding_box(origin: Point, width: f64, height: f64) -> Self {
        Geometry::BoundingBox {
            origin,
            width,
            height,
            label: None,
        }
    }

    pub fn kind(&self) -> ShapeKind {
        match self {
            Geometry::Rectangle { .. } => ShapeKind::Rectangle,
            Geometry::Circle { .. } => ShapeKind::Circle,
            Geometry::Text { .. } => ShapeKind::Text,
            Geometry::Line { .. } => ShapeKind::Line,
            Geometry::Polyline { .. } => ShapeKind::Polyline,
            Geometry::Polygon { .. } => ShapeKind::Polygon,
            Geometry::BoundingBox { .. } => ShapeKind::BoundingBox,
        }
    }

    /// Reject malformed geometry before it reaches the store.
    pub fn validate(&self, id: ShapeId) -> Result<(), ValidationError> {
        let positive = |dimension: &'static str, value: f64| {
            if value > 0.0 && value.is_finite() {
                Ok(())
            } else {
                Err(ValidationError::NonPositiveDimension {
                    id,
                    dimension,
                    value,
                })
            }
        };
        let finite = |points: &[Point]| {
            if points.iter().all(|p| p.x.is_finite() && p.y.is_finite()) {
                Ok(())
            } else {
                Err(ValidationError::NonFiniteCoordinate { id })
            }
        };
        let min_points = |points: &[Point], min: usize| {
            if points.len() >= min {
                Ok(())
            } else {
                Err(ValidationError::TooFewPoints {
                    id,
                    min,
                    got: points.len(),
                })
            }
        };

        match self {
            Geometry::Rectangle {
                origin,
                width,
                height,
                corner_radius,
            } => {
                finite(&[*origin])?;
                positive("width", *width)?;
                positive("height", *height)?;
                if *corner_radius < 0.0 {
                    return Err(ValidationError::NonPositiveDimension {
                        id,
                        dimension: "corner_radius",
                        value: *corner_radius,
                    });
                }
                Ok(())
            }
            Geometry::Circle { center, radius } => {
                finite(&[*center])?;
                positive("radius", *radius)
            }
            Geometry::Text {
                origin,
                content,
                font_size,
            } => {
                finite(&[*origin])?;
                positive("font_size", *font_size)?;
                if content.trim().is_empty() {
                    return Err(ValidationError::EmptyText { id });
                }
                Ok(())
            }
            Geometry::Line { start, end } => {
                finite(&[*start, *end])?;
                positive("length", (*end - *start).hypot())
            }
            Geometry::Polyline { points } => {
                finite(points)?;
                min_points(points, 2)
            }
            Geometry::Polygon { points } => {
                finite(points)?;
                min_points(points, 3)
            }
            Geometry::BoundingBox {
                origin,
                width,
                height,
                ..
            } => {
                finite(&[*origin])?;
                positive("width", *width)?;
                positive("height", *height)
            }
        }
    }

    /// The point that `x`/`y` patches move.
    pub fn anchor(&self) -> Point {
        match self {
            Geometry::Rectangle { origin, .. }
            | Geometry::Text { origin, .. }
            | Geometry::BoundingBox { origin, .. } => *origin,
            Geometry::Circle { center, .. } => *center,
            Geometry::Line { start, .. } => *start,
            Geometry::Polyline { points } | Geometry::Polygon { points } => {
                points.first().copied().unwrap_or(Point::ORIGIN)
            }
        }
    }

    /// Translate every point of the geometry.
    pub fn translate(&mut self, delta: Vec2) {
        match self {
            Geometry::Rectangle { origin, .. }
            | Geometry::Text { origin, .. }
            | Geometry::BoundingBox { origin, .. } => *origin += delta,
            Geometry::Circle { center, .. } => *center += delta,
            Geometry::Line { start, end } => {
                *start += delta;
                *end += delta;
            }
            Geometry::Polyline { points } | Geometry::Polygon { points } => {
                for p in points.iter_mut() {
                    *p += delta;
                }
            }
        }
    }

    /// Move the geometry so that its anchor lands on `anchor`.
    pub fn move_anchor_to(&mut self, anchor: Point) {
        let delta = anchor - self.anchor();
        self.translate(delta);
    }

    /// Axis-aligned bounds, ignoring rotation.
    pub fn bounds(&self) -> Rect {
        match self {
            Geometry::Rectangle {
                origin,
                width,
                height,
                ..
            }
            | Geometry::BoundingBox {
                origin,
                width,
                height,
                ..
            } => {
                Rect::new(origin.x, origin.y, origin.x + width, origin.y + height)
            }
            Geometry::Circle { center, radius } => Rect::new(
                center.x - radius,
                center.y - radius,
                center.x + radius,
                center.y + radius,
            ),
            Geometry::Text {
                origin,
                content,
                font_size,
            } => {
                // Rough estimate, the renderer owns real text metrics.
                let width = content.chars().count() as f64 * font_size * 0.6;
                Rect::new(origin.x, origin.y - font_size, origin.x + width, origin.y)
            }
            Geometry::Line { start, end } => Rect::from_points(*start, *end),
            Geometry::Polyline { points } | Geometry::Polygon { points } => {
                let mut iter = points.iter();
                let Some(first) = iter.next() else {
                    return Rect::ZERO;
                };
                iter.fold(Rect::from_points(*first, *first), |r, p| r.union_pt(*p))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_rectangle_rejects_zero_width() {
        let geometry = Geometry::rectangle(Point::new(0.0, 0.0), 0.0, 10.0);
        let err = geometry.validate(Uuid::new_v4()).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::NonPositiveDimension { dimension: "width", .. }
        ));
    }

    #[test]
    fn test_circle_rejects_negative_radius() {
        let geometry = Geometry::circle(Point::new(5.0, 5.0), -1.0);
        assert!(geometry.validate(Uuid::new_v4()).is_err());
    }

    #[test]
    fn test_polygon_needs_three_points() {
        let geometry = Geometry::Polygon {
            points: vec![Point::new(0.0, 0.0), Point::new(1.0, 1.0)],
        };
        assert!(matches!(
            geometry.validate(Uuid::new_v4()),
            Err(ValidationError::TooFewPoints { min: 3, got: 2, .. })
        ));
    }

    #[test]
    fn test_degenerate_line_rejected() {
        let p = Point::new(3.0, 3.0);
        assert!(Geometry::line(p, p).validate(Uuid::new_v4()).is_err());
    }

    #[test]
    fn test_nan_rejected() {
        let geometry = Geometry::rectangle(Point::new(f64::NAN, 0.0), 1.0, 1.0);
        assert!(matches!(
            geometry.validate(Uuid::new_v4()),
            Err(ValidationError::NonFiniteCoordinate { .. })
        ));
    }

    #[test]
    fn test_move_anchor_translates_all_points() {
        let mut geometry = Geometry::Polyline {
            points: vec![Point::new(0.0, 0.0), Point::new(10.0, 5.0)],
        };
        geometry.move_anchor_to(Point::new(2.0, 3.0));
        assert_eq!(
            geometry,
            Geometry::Polyline {
                points: vec![Point::new(2.0, 3.0), Point::new(12.0, 8.0)],
            }
        );
    }

    #[test]
    fn test_bounds() {
        let circle = Geometry::circle(Point::new(10.0, 10.0), 5.0);
        let bounds = circle.bounds();
        assert!((bounds.x0 - 5.0).abs() < f64::EPSILON);
        assert!((bounds.y1 - 15.0).abs() < f64::EPSILON);

        let polygon = Geometry::Polygon {
            points: vec![
                Point::new(0.0, 4.0),
                Point::new(3.0, -1.0),
                Point::new(-2.0, 0.0),
            ],
        };
        assert_eq!(polygon.bounds(), Rect::new(-2.0, -1.0, 3.0, 4.0));
    }

    #[test]
    fn test_geometry_serializes_with_kind_tag() {
        let json = serde_json::to_value(Geometry::circle(Point::new(1.0, 2.0), 3.0)).unwrap();
        assert_eq!(json["kind"], "circle");
        assert_eq!(json["radius"], 3.0);
    }
}
