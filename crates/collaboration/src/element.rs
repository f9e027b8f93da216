//! Document content: shape and image elements.
//!
//! Elements are a closed sum over the shape kinds. The variant tag and the id are
//! fixed at creation; every other attribute is a writable field addressed by
//! [`ElementField`] and changed through an [`ElementPatch`].
use serde::{Deserialize, Serialize};

use crate::{CollaborationError, Result, UserId};

/// Unique element identifier (caller generated)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementId(pub String);

impl ElementId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for ElementId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ElementId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ElementId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Canvas coordinate, serialized as `[x, y]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point(pub f64, pub f64);

impl Point {
    pub fn is_finite(&self) -> bool {
        self.0.is_finite() && self.1.is_finite()
    }
}

/// Variant-specific part of an element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Shape {
    Rectangle { fill_color: String },
    Ellipse { fill_color: String },
    Line { points: [Point; 2] },
    Path { points: Vec<Point> },
    Image { src: String },
}

impl Shape {
    pub fn kind(&self) -> &'static str {
        match self {
            Shape::Rectangle { .. } => "rectangle",
            Shape::Ellipse { .. } => "ellipse",
            Shape::Line { .. } => "line",
            Shape::Path { .. } => "path",
            Shape::Image { .. } => "image",
        }
    }
}

/// A drawable element of a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: ElementId,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    /// Degrees, clockwise
    pub rotation: f64,
    pub stroke_color: String,
    pub stroke_width: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<UserId>,
    #[serde(flatten)]
    pub shape: Shape,
}

impl Element {
    pub const DEFAULT_STROKE_COLOR: &'static str = "#000000";
    pub const DEFAULT_STROKE_WIDTH: f64 = 2.0;

    pub fn new(shape: Shape, x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            id: ElementId::new(),
            x,
            y,
            width,
            height,
            rotation: 0.0,
            stroke_color: Self::DEFAULT_STROKE_COLOR.to_string(),
            stroke_width: Self::DEFAULT_STROKE_WIDTH,
            locked_by: None,
            shape,
        }
    }

    pub fn rectangle(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self::new(
            Shape::Rectangle {
                fill_color: "transparent".to_string(),
            },
            x,
            y,
            width,
            height,
        )
    }

    pub fn ellipse(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self::new(
            Shape::Ellipse {
                fill_color: "transparent".to_string(),
            },
            x,
            y,
            width,
            height,
        )
    }

    /// Line between two points; the bounding box is derived from the endpoints
    pub fn line(from: Point, to: Point) -> Self {
        let x = from.0.min(to.0);
        let y = from.1.min(to.1);
        Self::new(
            Shape::Line { points: [from, to] },
            x,
            y,
            (to.0 - from.0).abs(),
            (to.1 - from.1).abs(),
        )
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = ElementId(id.into());
        self
    }

    pub fn with_stroke(mut self, color: impl Into<String>, width: f64) -> Self {
        self.stroke_color = color.into();
        self.stroke_width = width;
        self
    }

    pub fn with_rotation(mut self, rotation: f64) -> Self {
        self.rotation = rotation;
        self
    }

    /// Reject elements no renderer could draw
    pub fn validate(&self) -> Result<()> {
        let geometry = [
            self.x,
            self.y,
            self.width,
            self.height,
            self.rotation,
            self.stroke_width,
        ];
        if geometry.iter().any(|v| !v.is_finite()) {
            return Err(self.invalid("non-finite geometry"));
        }

        match &self.shape {
            Shape::Path { points } if points.is_empty() => {
                Err(self.invalid("path needs at least one point"))
            }
            Shape::Path { points } if points.iter().any(|p| !p.is_finite()) => {
                Err(self.invalid("non-finite point"))
            }
            Shape::Line { points } if points.iter().any(|p| !p.is_finite()) => {
                Err(self.invalid("non-finite point"))
            }
            _ => Ok(()),
        }
    }

    fn invalid(&self, reason: &str) -> CollaborationError {
        CollaborationError::InvalidElement {
            id: self.id.0.clone(),
            reason: reason.to_string(),
        }
    }

    /// Fields this element currently carries
    pub fn fields(&self) -> Vec<ElementField> {
        use ElementField::*;

        let mut fields = vec![X, Y, Width, Height, Rotation, StrokeColor, StrokeWidth];
        if self.locked_by.is_some() {
            fields.push(LockedBy);
        }
        fields.push(match self.shape {
            Shape::Rectangle { .. } | Shape::Ellipse { .. } => FillColor,
            Shape::Line { .. } | Shape::Path { .. } => Points,
            Shape::Image { .. } => Src,
        });
        fields
    }

    /// Overwrite every field of `patch` that applies to this element's variant.
    ///
    /// Returns the patch narrowed to exactly the fields written.
    pub fn apply_patch(&mut self, patch: &ElementPatch) -> ElementPatch {
        let mut applied = ElementPatch::default();

        if let Some(x) = patch.x {
            self.x = x;
            applied.x = Some(x);
        }
        if let Some(y) = patch.y {
            self.y = y;
            applied.y = Some(y);
        }
        if let Some(width) = patch.width {
            self.width = width;
            applied.width = Some(width);
        }
        if let Some(height) = patch.height {
            self.height = height;
            applied.height = Some(height);
        }
        if let Some(rotation) = patch.rotation {
            self.rotation = rotation;
            applied.rotation = Some(rotation);
        }
        if let Some(color) = &patch.stroke_color {
            self.stroke_color = color.clone();
            applied.stroke_color = Some(color.clone());
        }
        if let Some(width) = patch.stroke_width {
            self.stroke_width = width;
            applied.stroke_width = Some(width);
        }

        if let Some(color) = &patch.fill_color {
            if let Shape::Rectangle { fill_color } | Shape::Ellipse { fill_color } =
                &mut self.shape
            {
                *fill_color = color.clone();
                applied.fill_color = Some(color.clone());
            }
        }

        if let Some(new_points) = &patch.points {
            match &mut self.shape {
                Shape::Line { points } => {
                    if let [from, to] = new_points.as_slice() {
                        *points = [*from, *to];
                        applied.points = Some(new_points.clone());
                    }
                }
                Shape::Path { points } if !new_points.is_empty() => {
                    *points = new_points.clone();
                    applied.points = Some(new_points.clone());
                }
                _ => {}
            }
        }

        if let Some(new_src) = &patch.src {
            if let Shape::Image { src } = &mut self.shape {
                *src = new_src.clone();
                applied.src = Some(new_src.clone());
            }
        }

        applied
    }

    /// Read the current value of every field named by `patch`
    pub fn capture(&self, patch: &ElementPatch) -> ElementPatch {
        let mut current = ElementPatch::default();

        if patch.x.is_some() {
            current.x = Some(self.x);
        }
        if patch.y.is_some() {
            current.y = Some(self.y);
        }
        if patch.width.is_some() {
            current.width = Some(self.width);
        }
        if patch.height.is_some() {
            current.height = Some(self.height);
        }
        if patch.rotation.is_some() {
            current.rotation = Some(self.rotation);
        }
        if patch.stroke_color.is_some() {
            current.stroke_color = Some(self.stroke_color.clone());
        }
        if patch.stroke_width.is_some() {
            current.stroke_width = Some(self.stroke_width);
        }

        match &self.shape {
            Shape::Rectangle { fill_color } | Shape::Ellipse { fill_color } => {
                if patch.fill_color.is_some() {
                    current.fill_color = Some(fill_color.clone());
                }
            }
            Shape::Line { points } => {
                if patch.points.is_some() {
                    current.points = Some(points.to_vec());
                }
            }
            Shape::Path { points } => {
                if patch.points.is_some() {
                    current.points = Some(points.clone());
                }
            }
            Shape::Image { src } => {
                if patch.src.is_some() {
                    current.src = Some(src.clone());
                }
            }
        }

        current
    }
}

/// Name of a writable element field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementField {
    X,
    Y,
    Width,
    Height,
    Rotation,
    StrokeColor,
    StrokeWidth,
    LockedBy,
    FillColor,
    Points,
    Src,
}

/// Partial field set carried by an `update` operation.
///
/// `locked_by` is deliberately absent: lock state only changes through the
/// lock/unlock actions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke_width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<Vec<Point>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
}

impl ElementPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn moved_to(x: f64, y: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            ..Self::default()
        }
    }

    pub fn resized_to(width: f64, height: f64) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            ..Self::default()
        }
    }

    pub fn with_rotation(mut self, rotation: f64) -> Self {
        self.rotation = Some(rotation);
        self
    }

    pub fn with_stroke_color(mut self, color: impl Into<String>) -> Self {
        self.stroke_color = Some(color.into());
        self
    }

    pub fn with_fill_color(mut self, color: impl Into<String>) -> Self {
        self.fill_color = Some(color.into());
        self
    }

    pub fn with_points(mut self, points: Vec<Point>) -> Self {
        self.points = Some(points);
        self
    }

    pub fn fields(&self) -> Vec<ElementField> {
        use ElementField::*;

        [
            (self.x.is_some(), X),
            (self.y.is_some(), Y),
            (self.width.is_some(), Width),
            (self.height.is_some(), Height),
            (self.rotation.is_some(), Rotation),
            (self.stroke_color.is_some(), StrokeColor),
            (self.stroke_width.is_some(), StrokeWidth),
            (self.fill_color.is_some(), FillColor),
            (self.points.is_some(), Points),
            (self.src.is_some(), Src),
        ]
        .into_iter()
        .filter_map(|(present, field)| present.then_some(field))
        .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.fields().is_empty()
    }
}
