//! Drawable elements: the records a shared board is made of.
//!
//! An element is always replaced whole. Replicas never patch a single field
//! of someone else's element, so the unit of conflict is the element id.
//!
//! ```text
//! Element
//!   ├── id          ElementId (uuid, never nil)
//!   ├── created_at  ms since epoch, strictly increasing per process,
//!   │               drives paint order
//!   ├── style       stroke color / width / fill
//!   └── shape       Freehand | Rectangle | Ellipse | Arrow
//!                   | Polygon | Text | StraightLine
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use uuid::Uuid;

use crate::error::InvalidOperation;

// ───────────────────────────────────────────────────────────────────
// Geometry
// ───────────────────────────────────────────────────────────────────

/// 2D position in document (world) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point.
    pub fn distance(&self, other: &Vec2) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// Linear interpolation toward `target` by factor `t` ∈ [0, 1].
    pub fn lerp(&self, target: &Vec2, t: f32) -> Vec2 {
        Vec2 {
            x: self.x + (target.x - self.x) * t,
            y: self.y + (target.y - self.y) * t,
        }
    }

    pub fn offset(&self, delta: Vec2) -> Vec2 {
        Vec2::new(self.x + delta.x, self.y + delta.y)
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl Default for Vec2 {
    fn default() -> Self {
        Self::ZERO
    }
}

// ───────────────────────────────────────────────────────────────────
// Identity
// ───────────────────────────────────────────────────────────────────

/// Globally unique element identifier.
///
/// The nil uuid is reserved to mean "no id" and is rejected by validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(Uuid);

impl ElementId {
    /// Fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The reserved "missing" id.
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for ElementId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ───────────────────────────────────────────────────────────────────
// Style
// ───────────────────────────────────────────────────────────────────

/// Stroke and fill of an element. Colors are CSS color strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Style {
    pub stroke: String,
    pub stroke_width: f32,
    /// `None` renders unfilled.
    pub fill: Option<String>,
}

impl Style {
    pub fn new(stroke: impl Into<String>, stroke_width: f32) -> Self {
        Self {
            stroke: stroke.into(),
            stroke_width,
            fill: None,
        }
    }

    pub fn with_fill(mut self, fill: impl Into<String>) -> Self {
        self.fill = Some(fill.into());
        self
    }
}

impl Default for Style {
    fn default() -> Self {
        Self::new("#000000", 2.0)
    }
}

// ───────────────────────────────────────────────────────────────────
// Shapes
// ───────────────────────────────────────────────────────────────────

/// Regular outline drawn inside a bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolygonKind {
    Triangle,
    Diamond,
    Star,
}

/// Variant-specific geometry of an element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Shape {
    /// Pen stroke through an ordered list of points.
    Freehand { points: Vec<Vec2> },
    Rectangle { origin: Vec2, width: f32, height: f32 },
    Ellipse { center: Vec2, radius_x: f32, radius_y: f32 },
    Arrow { start: Vec2, end: Vec2 },
    Polygon { kind: PolygonKind, origin: Vec2, width: f32, height: f32 },
    Text { origin: Vec2, content: String, font_size: f32 },
    StraightLine { start: Vec2, end: Vec2 },
}

/// Discriminant of [`Shape`], used in logs and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShapeKind {
    Freehand,
    Rectangle,
    Ellipse,
    Arrow,
    Polygon,
    Text,
    StraightLine,
}

impl ShapeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShapeKind::Freehand => "freehand",
            ShapeKind::Rectangle => "rectangle",
            ShapeKind::Ellipse => "ellipse",
            ShapeKind::Arrow => "arrow",
            ShapeKind::Polygon => "polygon",
            ShapeKind::Text => "text",
            ShapeKind::StraightLine => "straight-line",
        }
    }
}

impl fmt::Display for ShapeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Shape {
    pub fn kind(&self) -> ShapeKind {
        match self {
            Shape::Freehand { .. } => ShapeKind::Freehand,
            Shape::Rectangle { .. } => ShapeKind::Rectangle,
            Shape::Ellipse { .. } => ShapeKind::Ellipse,
            Shape::Arrow { .. } => ShapeKind::Arrow,
            Shape::Polygon { .. } => ShapeKind::Polygon,
            Shape::Text { .. } => ShapeKind::Text,
            Shape::StraightLine { .. } => ShapeKind::StraightLine,
        }
    }

    /// Move every anchor point of the shape by `delta`.
    pub fn translate(&mut self, delta: Vec2) {
        match self {
            Shape::Freehand { points } => {
                for p in points.iter_mut() {
                    *p = p.offset(delta);
                }
            }
            Shape::Rectangle { origin, .. }
            | Shape::Polygon { origin, .. }
            | Shape::Text { origin, .. } => *origin = origin.offset(delta),
            Shape::Ellipse { center, .. } => *center = center.offset(delta),
            Shape::Arrow { start, end } | Shape::StraightLine { start, end } => {
                *start = start.offset(delta);
                *end = end.offset(delta);
            }
        }
    }

    fn validate(&self, id: ElementId) -> Result<(), InvalidOperation> {
        let kind = self.kind();
        let non_finite = || InvalidOperation::NonFiniteGeometry { id, kind };
        let negative = || InvalidOperation::NegativeExtent { id, kind };

        match self {
            Shape::Freehand { points } => {
                if points.is_empty() {
                    return Err(InvalidOperation::EmptyPath { id });
                }
                if !points.iter().all(Vec2::is_finite) {
                    return Err(non_finite());
                }
            }
            Shape::Rectangle { origin, width, height }
            | Shape::Polygon { origin, width, height, .. } => {
                if !origin.is_finite() || !width.is_finite() || !height.is_finite() {
                    return Err(non_finite());
                }
                if *width < 0.0 || *height < 0.0 {
                    return Err(negative());
                }
            }
            Shape::Ellipse { center, radius_x, radius_y } => {
                if !center.is_finite() || !radius_x.is_finite() || !radius_y.is_finite() {
                    return Err(non_finite());
                }
                if *radius_x < 0.0 || *radius_y < 0.0 {
                    return Err(negative());
                }
            }
            Shape::Arrow { start, end } | Shape::StraightLine { start, end } => {
                if !start.is_finite() || !end.is_finite() {
                    return Err(non_finite());
                }
            }
            Shape::Text { origin, font_size, .. } => {
                if !origin.is_finite() {
                    return Err(non_finite());
                }
                if !font_size.is_finite() || *font_size <= 0.0 {
                    return Err(InvalidOperation::InvalidFontSize { id, size: *font_size });
                }
            }
        }
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────────
// Element
// ───────────────────────────────────────────────────────────────────

/// One drawable record of a board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: ElementId,
    /// Milliseconds since the unix epoch, bumped so that elements created
    /// here never share or go back in time. Ties between writers break on `id`.
    pub created_at: u64,
    pub style: Style,
    pub shape: Shape,
}

impl Element {
    /// New element with a fresh id, stamped after every element created before it.
    pub fn new(shape: Shape, style: Style) -> Self {
        Self::with_id(ElementId::new(), shape, style)
    }

    pub fn with_id(id: ElementId, shape: Shape, style: Style) -> Self {
        Self {
            id,
            created_at: next_created_at(),
            style,
            shape,
        }
    }

    pub fn kind(&self) -> ShapeKind {
        self.shape.kind()
    }

    /// Check the element is well formed: a real id, a usable stroke and
    /// finite geometry.
    pub fn validate(&self) -> Result<(), InvalidOperation> {
        if self.id.is_nil() {
            return Err(InvalidOperation::MissingId);
        }
        if self.style.stroke.trim().is_empty() {
            return Err(InvalidOperation::EmptyColor { id: self.id });
        }
        let width = self.style.stroke_width;
        if !width.is_finite() || width < 0.0 {
            return Err(InvalidOperation::InvalidStrokeWidth { id: self.id, width });
        }
        self.shape.validate(self.id)
    }

    /// Copy of this element moved by `delta`.
    pub fn translated(&self, delta: Vec2) -> Self {
        let mut moved = self.clone();
        moved.shape.translate(delta);
        moved
    }
}

static LAST_CREATED_AT: AtomicU64 = AtomicU64::new(0);

/// Wall-clock milliseconds, or one past the last value handed out if the
/// clock has not moved (or moved backwards) since.
fn next_created_at() -> u64 {
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let previous = LAST_CREATED_AT
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |last| {
            Some(now.max(last.saturating_add(1)))
        })
        .unwrap_or_else(|last| last);
    now.max(previous.saturating_add(1))
}
