//! CmfeError: Unified error type for mesh-cmfe public APIs
//!
//! Every fallible operation in the crate returns this error. Points that cannot be
//! located in any source cell are *not* errors; they are reported through the
//! validity mask of the evaluated field.

use thiserror::Error;

/// Unified error type for common-mesh field evaluation.
#[derive(Debug, Error)]
pub enum CmfeError {
    /// A source fragment does not carry the requested field.
    #[error("field `{0}` not found on source fragment")]
    FieldNotFound(String),
    /// Component counts disagree (between fragments, workers, or the caller's expectation).
    #[error("component count mismatch: expected {expected}, found {found}")]
    ComponentMismatch { expected: usize, found: usize },
    /// A mesh fragment is internally inconsistent.
    #[error("invalid fragment: {0}")]
    InvalidFragment(String),
    /// Cell geometry cannot be mapped or interpolated.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
    /// Point, cell, or fragment index outside the valid range.
    #[error("index {index} out of bounds (len {len})")]
    IndexOutOfBounds { index: usize, len: usize },
    /// Operation not allowed in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    /// Communication failure with a specific neighbor.
    #[error("communication error with rank {neighbor}: {source}")]
    CommError {
        neighbor: usize,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// A received buffer has the wrong length.
    #[error("buffer size mismatch with rank {neighbor}: expected {expected} bytes, got {got}")]
    BufferSizeMismatch {
        neighbor: usize,
        expected: usize,
        got: usize,
    },
    /// A received message could not be decoded.
    #[error("wire format error: {0}")]
    WireFormat(String),
    /// The partition was built for a different number of workers.
    #[error("partition built for {expected} workers, communicator has {found}")]
    PartitionMismatch { expected: usize, found: usize },
    /// A point set was created for a different rank than the communicator's.
    #[error("point set belongs to rank {expected}, communicator is rank {found}")]
    RankMismatch { expected: usize, found: usize },
    /// A native query point received no value back after un-relocation.
    #[error("query point {index} received no value after un-relocation")]
    LostPoint { index: usize },
    /// Another worker hit a fatal local error and left the protocol.
    #[error("rank {rank} aborted the evaluation")]
    PeerAborted { rank: usize },
    /// MPI could not be initialized.
    #[cfg(feature = "mpi-support")]
    #[error("MPI initialization failed")]
    MpiInit,
}
