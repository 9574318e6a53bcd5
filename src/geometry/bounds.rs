//! Closed axis-aligned bounding boxes in three dimensions.
//!
//! All containment and overlap tests are *closed*: a point on a face is inside,
//! and two boxes sharing only a face overlap. Lower-dimensional data uses a
//! degenerate (zero-width) box along the unused axes.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::empty()
    }
}

impl BoundingBox {
    /// The empty box; the identity for [`join`](Self::join).
    pub const fn empty() -> Self {
        Self {
            min: [f64::INFINITY; 3],
            max: [f64::NEG_INFINITY; 3],
        }
    }

    pub const fn new(min: [f64; 3], max: [f64; 3]) -> Self {
        Self { min, max }
    }

    pub const fn from_point(p: [f64; 3]) -> Self {
        Self { min: p, max: p }
    }

    pub fn from_points<'a, I>(points: I) -> Self
    where
        I: IntoIterator<Item = &'a [f64; 3]>,
    {
        let mut b = Self::empty();
        for p in points {
            b.join_point(*p);
        }
        b
    }

    /// `true` if no point is contained (some `min > max`, or NaN bounds).
    pub fn is_empty(&self) -> bool {
        (0..3).any(|d| !(self.min[d] <= self.max[d]))
    }

    pub fn join_point(&mut self, p: [f64; 3]) {
        for d in 0..3 {
            self.min[d] = self.min[d].min(p[d]);
            self.max[d] = self.max[d].max(p[d]);
        }
    }

    pub fn join(&mut self, other: &BoundingBox) {
        if other.is_empty() {
            return;
        }
        for d in 0..3 {
            self.min[d] = self.min[d].min(other.min[d]);
            self.max[d] = self.max[d].max(other.max[d]);
        }
    }

    #[inline]
    pub fn contains_point(&self, p: [f64; 3]) -> bool {
        (0..3).all(|d| self.min[d] <= p[d] && p[d] <= self.max[d])
    }

    #[inline]
    pub fn overlaps(&self, other: &BoundingBox) -> bool {
        (0..3).all(|d| self.min[d] <= other.max[d] && other.min[d] <= self.max[d])
    }

    pub fn intersection(&self, other: &BoundingBox) -> Option<BoundingBox> {
        let mut out = BoundingBox::empty();
        for d in 0..3 {
            out.min[d] = self.min[d].max(other.min[d]);
            out.max[d] = self.max[d].min(other.max[d]);
        }
        (!out.is_empty()).then_some(out)
    }

    pub fn center(&self) -> [f64; 3] {
        [
            0.5 * (self.min[0] + self.max[0]),
            0.5 * (self.min[1] + self.max[1]),
            0.5 * (self.min[2] + self.max[2]),
        ]
    }

    pub fn extents(&self) -> [f64; 3] {
        if self.is_empty() {
            return [0.0; 3];
        }
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }

    /// Axis of largest extent; ties go to the lower axis.
    pub fn longest_axis(&self) -> usize {
        let e = self.extents();
        let mut axis = 0;
        for d in 1..3 {
            if e[d] > e[axis] {
                axis = d;
            }
        }
        axis
    }

    pub fn diagonal(&self) -> f64 {
        let e = self.extents();
        (e[0] * e[0] + e[1] * e[1] + e[2] * e[2]).sqrt()
    }

    /// Grow every face outward by `pad`.
    pub fn padded(&self, pad: f64) -> BoundingBox {
        if self.is_empty() {
            return *self;
        }
        let mut out = *self;
        for d in 0..3 {
            out.min[d] -= pad;
            out.max[d] += pad;
        }
        out
    }

    /// Euclidean distance from `p` to the closest point of the box (zero inside).
    pub fn distance_to_point(&self, p: [f64; 3]) -> f64 {
        if self.is_empty() {
            return f64::INFINITY;
        }
        let mut sq = 0.0;
        for d in 0..3 {
            let gap = if p[d] < self.min[d] {
                self.min[d] - p[d]
            } else if p[d] > self.max[d] {
                p[d] - self.max[d]
            } else {
                0.0
            };
            sq += gap * gap;
        }
        sq.sqrt()
    }
}
