//! Communication plumbing: communicator backends, wire records, and the
//! point-to-point collectives they share.

pub mod communicator;
pub mod exchange;
pub mod wire;

pub use communicator::{CmfeCommTags, CommTag, Communicator, LocalComm, NoComm, Wait};
#[cfg(feature = "mpi-support")]
pub use communicator::MpiComm;
