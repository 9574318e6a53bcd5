//! Thin façade over intra-process (threads) or inter-process (MPI) message passing.
//!
//! Messages are *contiguous byte slices* (no zero-copy guarantees).
//! All handles are **waitable**; the collective helpers call `.wait()` on every
//! handle they post before they trust that a buffer is ready.
//!
//! The engine itself only needs two collectives, [`Communicator::all_gather`] and
//! [`Communicator::all_to_all`]. Their provided implementations are built on
//! `isend`/`irecv` (see [`crate::algs::exchange`]); backends with native
//! collectives override them.

use crate::algs::exchange;
use crate::mesh_error::CmfeError;
use bytes::Bytes;
use hashbrown::HashMap;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Typed message tag.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct CommTag(pub u16);

impl CommTag {
    pub const fn new(tag: u16) -> Self {
        Self(tag)
    }
    pub const fn as_u16(self) -> u16 {
        self.0
    }
    /// Tag `by` slots after this one (wrapping).
    pub const fn offset(self, by: u16) -> Self {
        Self(self.0.wrapping_add(by))
    }
}

/// Tag block used by one `perform_cmfe` call. Every collective consumes two
/// consecutive tags (sizes, then payloads), hence the stride of two.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CmfeCommTags {
    pub summary: CommTag,
    pub split: CommTag,
    pub scatter_points: CommTag,
    pub scatter_cells: CommTag,
    pub gather_values: CommTag,
    pub retry_request: CommTag,
    pub retry_reply: CommTag,
}

impl CmfeCommTags {
    pub const fn from_base(base: CommTag) -> Self {
        Self {
            summary: base,
            split: base.offset(2),
            scatter_points: base.offset(4),
            scatter_cells: base.offset(6),
            gather_values: base.offset(8),
            retry_request: base.offset(10),
            retry_reply: base.offset(12),
        }
    }
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

/// Communication interface between the workers of one evaluation.
pub trait Communicator {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    /// Post a receive; the handle yields at most `buf.len()` bytes.
    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle;

    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    fn is_no_comm(&self) -> bool {
        false
    }

    /// Every rank contributes `local`; every rank receives all contributions,
    /// indexed by source rank.
    fn all_gather(&self, tag: CommTag, local: &[u8]) -> Result<Vec<Vec<u8>>, CmfeError> {
        exchange::all_gather_p2p(self, tag, local)
    }

    /// Variable-count all-to-all: `outgoing[p]` is delivered to rank `p`; the
    /// result holds what every rank sent to this one, indexed by source rank.
    fn all_to_all(
        &self,
        tag: CommTag,
        outgoing: Vec<Vec<u8>>,
    ) -> Result<Vec<Vec<u8>>, CmfeError> {
        exchange::all_to_all_p2p(self, tag, outgoing)
    }
}

/// Compile-time no-op comm for pure serial use.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u16, _buf: &mut [u8]) {}
    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn is_no_comm(&self) -> bool {
        true
    }
}

// --- LocalComm: intra-process ranks, one thread per rank ---
type Key = (usize, usize, u16); // (src, dst, tag)

#[derive(Default)]
struct Mailbox {
    queues: Mutex<HashMap<Key, VecDeque<Bytes>>>,
    ready: Condvar,
}

static GLOBAL_MAILBOX: Lazy<Arc<Mailbox>> = Lazy::new(|| Arc::new(Mailbox::default()));

/// In-process communicator: ranks are threads exchanging messages through a
/// shared mailbox. Messages between one `(src, dst, tag)` triple are FIFO.
#[derive(Clone)]
pub struct LocalComm {
    rank: usize,
    size: usize,
    mailbox: Arc<Mailbox>,
}

impl fmt::Debug for LocalComm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalComm")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

impl LocalComm {
    /// Rank `rank` of a `size`-rank group on the process-global mailbox.
    ///
    /// Groups built this way share one mailbox, so concurrent groups must use
    /// disjoint tags. Prefer [`LocalComm::world`] for isolated groups.
    pub fn new(rank: usize, size: usize) -> Self {
        Self {
            rank,
            size,
            mailbox: GLOBAL_MAILBOX.clone(),
        }
    }

    /// All ranks of a fresh group with a private mailbox.
    pub fn world(size: usize) -> Vec<Self> {
        let mailbox = Arc::new(Mailbox::default());
        (0..size)
            .map(|rank| Self {
                rank,
                size,
                mailbox: mailbox.clone(),
            })
            .collect()
    }
}

pub struct LocalHandle {
    mailbox: Arc<Mailbox>,
    key: Key,
    len: usize,
}

impl Wait for LocalHandle {
    fn wait(self) -> Option<Vec<u8>> {
        let mut queues = self.mailbox.queues.lock();
        loop {
            if let Some(queue) = queues.get_mut(&self.key) {
                if let Some(bytes) = queue.pop_front() {
                    if queue.is_empty() {
                        queues.remove(&self.key);
                    }
                    let n = bytes.len().min(self.len);
                    return Some(bytes[..n].to_vec());
                }
            }
            self.mailbox.ready.wait(&mut queues);
        }
    }
}

impl Communicator for LocalComm {
    type SendHandle = ();
    type RecvHandle = LocalHandle;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) {
        let key = (self.rank, peer, tag);
        let mut queues = self.mailbox.queues.lock();
        queues
            .entry(key)
            .or_default()
            .push_back(Bytes::copy_from_slice(buf));
        drop(queues);
        self.mailbox.ready.notify_all();
    }

    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> LocalHandle {
        LocalHandle {
            mailbox: self.mailbox.clone(),
            key: (peer, self.rank, tag),
            len: buf.len(),
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::{CommTag, Communicator, Wait};
    use crate::mesh_error::CmfeError;
    use mpi::Count;
    use mpi::datatype::{Partition, PartitionMut};
    use mpi::environment::Universe;
    use mpi::request::{Request, StaticScope};
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;
    use std::sync::Arc;

    /// MPI communicator.
    ///
    /// `isend` posts a non-blocking send over an owned copy of the buffer.
    /// `irecv` only records the match; the blocking receive runs in `wait`, so a
    /// rank can post all of its receives before any of its sends. The
    /// collectives the engine uses are native MPI collectives.
    pub struct MpiComm {
        world: Arc<SimpleCommunicator>,
        rank: usize,
        size: usize,
        _universe: Option<Universe>,
    }

    impl MpiComm {
        /// Initialize MPI and wrap `MPI_COMM_WORLD`.
        pub fn new() -> Result<Self, CmfeError> {
            let universe = mpi::initialize().ok_or(CmfeError::MpiInit)?;
            let world = universe.world();
            Ok(Self {
                rank: world.rank() as usize,
                size: world.size() as usize,
                world: Arc::new(world),
                _universe: Some(universe),
            })
        }

        /// Wrap a communicator owned by an already-initialized MPI environment.
        pub fn from_world(world: SimpleCommunicator) -> Self {
            Self {
                rank: world.rank() as usize,
                size: world.size() as usize,
                world: Arc::new(world),
                _universe: None,
            }
        }
    }

    /// In-flight send; owns the message bytes until the request completes.
    pub struct MpiSend {
        request: Request<'static, [u8], StaticScope>,
        buf: *mut [u8],
    }

    impl Wait for MpiSend {
        fn wait(self) -> Option<Vec<u8>> {
            self.request.wait();
            // SAFETY: `buf` came from `Box::into_raw` in `isend` and the only
            // borrow of it was held by the request, which has now completed.
            drop(unsafe { Box::from_raw(self.buf) });
            None
        }
    }

    /// Posted receive, matched by source rank and tag when waited on.
    pub struct MpiRecv {
        world: Arc<SimpleCommunicator>,
        peer: usize,
        tag: u16,
        len: usize,
    }

    impl Wait for MpiRecv {
        fn wait(self) -> Option<Vec<u8>> {
            let (mut data, _status) = self
                .world
                .process_at_rank(self.peer as i32)
                .receive_vec_with_tag::<u8>(self.tag as i32);
            data.truncate(self.len);
            Some(data)
        }
    }

    fn displacements(counts: &[Count]) -> Vec<Count> {
        counts
            .iter()
            .scan(0, |acc, &x| {
                let old = *acc;
                *acc += x;
                Some(old)
            })
            .collect()
    }

    fn split(buf: Vec<u8>, counts: &[Count], displs: &[Count]) -> Vec<Vec<u8>> {
        counts
            .iter()
            .zip(displs)
            .map(|(&n, &d)| buf[d as usize..(d + n) as usize].to_vec())
            .collect()
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiSend;
        type RecvHandle = MpiRecv;

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> MpiSend {
            let owned: *mut [u8] = Box::into_raw(buf.to_vec().into_boxed_slice());
            // SAFETY: the allocation stays alive until `MpiSend::wait` frees it
            // after the request completes.
            let data: &'static [u8] = unsafe { &*owned };
            let request = self.world.process_at_rank(peer as i32).immediate_send_with_tag(
                StaticScope,
                data,
                tag as i32,
            );
            MpiSend {
                request,
                buf: owned,
            }
        }

        fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> MpiRecv {
            MpiRecv {
                world: self.world.clone(),
                peer,
                tag,
                len: buf.len(),
            }
        }

        fn rank(&self) -> usize {
            self.rank
        }

        fn size(&self) -> usize {
            self.size
        }

        fn all_gather(&self, _tag: CommTag, local: &[u8]) -> Result<Vec<Vec<u8>>, CmfeError> {
            let mut counts = vec![0 as Count; self.size];
            self.world
                .all_gather_into(&(local.len() as Count), &mut counts[..]);
            let displs = displacements(&counts);
            let total: Count = counts.iter().sum();
            let mut recv = vec![0u8; total as usize];
            {
                let mut partition =
                    PartitionMut::new(&mut recv[..], counts.clone(), displs.clone());
                self.world.all_gather_varcount_into(local, &mut partition);
            }
            Ok(split(recv, &counts, &displs))
        }

        fn all_to_all(
            &self,
            _tag: CommTag,
            outgoing: Vec<Vec<u8>>,
        ) -> Result<Vec<Vec<u8>>, CmfeError> {
            if outgoing.len() != self.size {
                return Err(CmfeError::PartitionMismatch {
                    expected: self.size,
                    found: outgoing.len(),
                });
            }
            let counts: Vec<Count> = outgoing.iter().map(|b| b.len() as Count).collect();
            let mut recv_counts = vec![0 as Count; self.size];
            self.world.all_to_all_into(&counts[..], &mut recv_counts[..]);
            let send_displs = displacements(&counts);
            let recv_displs = displacements(&recv_counts);
            let send: Vec<u8> = outgoing.concat();
            let total: Count = recv_counts.iter().sum();
            let mut recv = vec![0u8; total as usize];
            {
                let send_partition = Partition::new(&send[..], counts, send_displs);
                let mut recv_partition =
                    PartitionMut::new(&mut recv[..], recv_counts.clone(), recv_displs.clone());
                self.world
                    .all_to_all_varcount_into(&send_partition, &mut recv_partition);
            }
            Ok(split(recv, &recv_counts, &recv_displs))
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;
