//! Common-mesh field evaluation.
//!
//! The pieces, in the order [`perform_cmfe`] uses them:
//! - [`QueryPointSet`]: destination points with origin tags, compact for
//!   rectilinear fragments;
//! - [`LookupGrouping`]: source cells and point-in-cell evaluation;
//! - [`SpatialPartition`]: load-aware division of the global extent, one region
//!   per active worker;
//! - relocation of points and cells to their regions, local evaluation, an
//!   optional boundary retry, and the return of values to their origin.

pub mod config;
pub mod lookup;
pub mod partition;
pub mod perform;
pub mod query_points;

pub use config::CmfeOptions;
pub use lookup::{CandidateList, LookupGrouping};
pub use partition::{LoadSource, SpatialPartition, WorkerSummary};
pub use perform::{CmfeOutput, CmfeStats, EvaluatedField, perform_cmfe};
pub use query_points::{PointTag, QueryPointSet, RGridBlock};
