//! Geometry utilities: bounding boxes, the box index used for point location,
//! and linear cell shape functions.

pub mod bounds;
pub mod interval_index;
pub mod shape;

pub use bounds::BoundingBox;
pub use interval_index::IntervalIndex;
pub use shape::CellType;
