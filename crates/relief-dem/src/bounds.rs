//! Axis-aligned bounding boxes in a projected or geographic CRS.

use crate::{ReliefError, Result};
use serde::{Deserialize, Serialize};

/// An axis-aligned rectangle `(left, bottom, right, top)`.
///
/// The CRS is implied by context; a box carries no CRS of its own.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Minimum x (west edge).
    pub left: f64,
    /// Minimum y (south edge).
    pub bottom: f64,
    /// Maximum x (east edge).
    pub right: f64,
    /// Maximum y (north edge).
    pub top: f64,
}

impl BoundingBox {
    /// Create a bounding box, rejecting inverted or non-finite extents.
    pub fn new(left: f64, bottom: f64, right: f64, top: f64) -> Result<Self> {
        let bbox = Self {
            left,
            bottom,
            right,
            top,
        };
        bbox.validate()?;
        Ok(bbox)
    }

    /// Smallest box containing all the given points, or `None` for an empty iterator.
    pub fn from_points<I: IntoIterator<Item = (f64, f64)>>(points: I) -> Option<Self> {
        let mut iter = points.into_iter();
        let (x0, y0) = iter.next()?;
        let mut bbox = Self {
            left: x0,
            bottom: y0,
            right: x0,
            top: y0,
        };
        for (x, y) in iter {
            bbox.left = bbox.left.min(x);
            bbox.bottom = bbox.bottom.min(y);
            bbox.right = bbox.right.max(x);
            bbox.top = bbox.top.max(y);
        }
        Some(bbox)
    }

    /// Check that the box is finite and not inverted.
    pub fn validate(&self) -> Result<()> {
        let finite = [self.left, self.bottom, self.right, self.top]
            .iter()
            .all(|v| v.is_finite());
        if !finite || self.left > self.right || self.bottom > self.top {
            return Err(ReliefError::InvalidParameter(format!(
                "malformed bounding box ({}, {}, {}, {})",
                self.left, self.bottom, self.right, self.top
            )));
        }
        Ok(())
    }

    /// Width along x.
    pub fn width(&self) -> f64 {
        self.right - self.left
    }

    /// Height along y.
    pub fn height(&self) -> f64 {
        self.top - self.bottom
    }

    /// Center point.
    pub fn center(&self) -> (f64, f64) {
        (
            (self.left + self.right) / 2.0,
            (self.bottom + self.top) / 2.0,
        )
    }

    /// Check if a point is within the box (edges included).
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.left && x <= self.right && y >= self.bottom && y <= self.top
    }

    /// Rectangles overlap unless one lies entirely left, right, above or below the other.
    ///
    /// Touching edges count as overlap.
    pub fn overlaps(&self, other: &BoundingBox) -> bool {
        !(self.right < other.left
            || self.left > other.right
            || self.top < other.bottom
            || self.bottom > other.top)
    }

    /// Grow the box by `margin` on every side.
    pub fn buffered(&self, margin: f64) -> Self {
        Self {
            left: self.left - margin,
            bottom: self.bottom - margin,
            right: self.right + margin,
            top: self.top + margin,
        }
    }
}
