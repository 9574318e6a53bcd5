#![cfg_attr(docsrs, feature(doc_cfg))]
//! # mesh-cmfe
//!
//! Common-mesh field evaluation: sample a field defined on one distributed mesh
//! at the nodes or cell centres of another mesh that is partitioned
//! independently across the same workers.
//!
//! Each call of [`perform_cmfe`](cmfe::perform_cmfe) runs on every worker of a
//! [`Communicator`](algs::Communicator):
//! 1. destination points are collected into a [`QueryPointSet`](cmfe::QueryPointSet)
//!    and source cells into a [`LookupGrouping`](cmfe::LookupGrouping);
//! 2. a [`SpatialPartition`](cmfe::SpatialPartition) divides the global extent
//!    into one box per active worker;
//! 3. points and cells move to the workers owning them, are evaluated there,
//!    and the values travel back tagged with their origin.
//!
//! Points that no source cell contains get the configured fill value and are
//! flagged invalid; they are not errors.
//!
//! ## Communicators
//! - [`NoComm`](algs::NoComm): single process, everything is local.
//! - [`LocalComm`](algs::LocalComm): ranks on threads of one process, for tests
//!   and in-process pipelines.
//! - `MpiComm` (feature `mpi-support`): MPI processes.
//!
//! ## Determinism
//!
//! Every tie is broken by the lowest id: the lowest zone among cells containing
//! a point, the lowest worker among regions claiming a seam point, and the
//! lowest source rank among duplicate values returned for one point. Results do
//! not depend on message arrival order.

#[macro_use]
pub mod debug_invariants;

pub mod algs;
pub mod cmfe;
pub mod geometry;
pub mod mesh;
pub mod mesh_error;

pub use debug_invariants::DebugInvariants;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::algs::communicator::{CommTag, Communicator, LocalComm, NoComm};
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::cmfe::{
        CandidateList, CmfeOptions, CmfeOutput, CmfeStats, EvaluatedField, LookupGrouping,
        QueryPointSet, SpatialPartition, perform_cmfe,
    };
    pub use crate::debug_invariants::DebugInvariants;
    pub use crate::geometry::{BoundingBox, CellType, IntervalIndex};
    pub use crate::mesh::{Cell, Centering, Field, FragmentGeometry, MeshFragment};
    pub use crate::mesh_error::CmfeError;
}
