//! Point-to-point implementations of the collectives used by the engine.
//!
//! Both collectives run in two stages, as the completion exchanges do: first the
//! byte length of every message is exchanged, then the payloads. Every posted
//! send/receive handle is drained before returning, even if an error occurs.
//! Zero-length payloads are never put on the wire.

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::{WireLen, cast_slice, cast_slice_mut};
use crate::mesh_error::CmfeError;

/// All-gather built on `isend`/`irecv`.
pub fn all_gather_p2p<C>(comm: &C, tag: CommTag, local: &[u8]) -> Result<Vec<Vec<u8>>, CmfeError>
where
    C: Communicator + ?Sized,
{
    let outgoing = vec![local.to_vec(); comm.size()];
    all_to_all_p2p(comm, tag, outgoing)
}

/// Variable-count all-to-all built on `isend`/`irecv`.
pub fn all_to_all_p2p<C>(
    comm: &C,
    tag: CommTag,
    mut outgoing: Vec<Vec<u8>>,
) -> Result<Vec<Vec<u8>>, CmfeError>
where
    C: Communicator + ?Sized,
{
    let size = comm.size();
    let me = comm.rank();
    if outgoing.len() != size {
        return Err(CmfeError::PartitionMismatch {
            expected: size,
            found: outgoing.len(),
        });
    }
    let peers: Vec<usize> = (0..size).filter(|&p| p != me).collect();

    let lens = exchange_lengths(comm, tag, &peers, &outgoing)?;
    let data_tag = tag.offset(1).as_u16();

    // 1) post receives for every non-empty incoming message
    let mut pending_recvs = Vec::with_capacity(peers.len());
    for (&nbr, &len) in peers.iter().zip(&lens) {
        if len == 0 {
            continue;
        }
        let mut buffer = vec![0u8; len];
        let h = comm.irecv(nbr, data_tag, &mut buffer);
        pending_recvs.push((nbr, len, h));
    }

    // 2) post sends
    let mut pending_sends = Vec::with_capacity(peers.len());
    for &nbr in &peers {
        if outgoing[nbr].is_empty() {
            continue;
        }
        log::trace!(
            "rank {me}: sending {} bytes to rank {nbr} (tag {data_tag:#06x})",
            outgoing[nbr].len()
        );
        pending_sends.push(comm.isend(nbr, data_tag, &outgoing[nbr]));
    }

    let mut incoming = vec![Vec::new(); size];
    incoming[me] = std::mem::take(&mut outgoing[me]);

    // 3) wait for all recvs (but do not early-return)
    let mut maybe_err = None;
    for (nbr, len, h) in pending_recvs {
        match h.wait() {
            Some(data) if data.len() == len => {
                incoming[nbr] = data;
            }
            Some(data) if maybe_err.is_none() => {
                maybe_err = Some(CmfeError::BufferSizeMismatch {
                    neighbor: nbr,
                    expected: len,
                    got: data.len(),
                });
            }
            None if maybe_err.is_none() => {
                maybe_err = Some(CmfeError::CommError {
                    neighbor: nbr,
                    source: "No data received (wait returned None)".into(),
                });
            }
            _ => {}
        }
    }

    // 4) always drain all send handles before returning
    for send in pending_sends {
        let _ = send.wait();
    }

    match maybe_err {
        Some(err) => Err(err),
        None => Ok(incoming),
    }
}

/// Stage 1: tell every peer how many bytes to expect, learn the same from them.
fn exchange_lengths<C>(
    comm: &C,
    tag: CommTag,
    peers: &[usize],
    outgoing: &[Vec<u8>],
) -> Result<Vec<usize>, CmfeError>
where
    C: Communicator + ?Sized,
{
    let mut pending_recvs = Vec::with_capacity(peers.len());
    for &nbr in peers {
        let mut len = WireLen::new(0);
        let h = comm.irecv(
            nbr,
            tag.as_u16(),
            cast_slice_mut(std::slice::from_mut(&mut len)),
        );
        pending_recvs.push((nbr, h));
    }

    let mut pending_sends = Vec::with_capacity(peers.len());
    let mut send_bufs = Vec::with_capacity(peers.len());
    for &nbr in peers {
        let len = WireLen::new(outgoing[nbr].len());
        pending_sends.push(comm.isend(nbr, tag.as_u16(), cast_slice(std::slice::from_ref(&len))));
        send_bufs.push(len);
    }

    let mut lens = Vec::with_capacity(peers.len());
    let mut maybe_err = None;
    for (nbr, h) in pending_recvs {
        match h.wait() {
            Some(data) if data.len() == std::mem::size_of::<WireLen>() => {
                let len: WireLen = bytemuck::pod_read_unaligned(&data);
                lens.push(len.get());
            }
            Some(data) => {
                lens.push(0);
                if maybe_err.is_none() {
                    maybe_err = Some(CmfeError::CommError {
                        neighbor: nbr,
                        source: format!(
                            "expected {} bytes for size header, got {}",
                            std::mem::size_of::<WireLen>(),
                            data.len()
                        )
                        .into(),
                    });
                }
            }
            None => {
                lens.push(0);
                if maybe_err.is_none() {
                    maybe_err = Some(CmfeError::CommError {
                        neighbor: nbr,
                        source: format!("failed to receive size from rank {nbr}").into(),
                    });
                }
            }
        }
    }

    for send in pending_sends {
        let _ = send.wait();
    }
    drop(send_bufs);

    match maybe_err {
        Some(err) => Err(err),
        None => Ok(lens),
    }
}
