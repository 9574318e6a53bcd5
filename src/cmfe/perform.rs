//! The evaluation driver: collect, index, partition, scatter, evaluate, gather,
//! assemble.
//!
//! Every worker of `comm` must call [`perform_cmfe`] with the same options and
//! field name. In parallel mode the call is collective; a worker that fails
//! before the first exchange still takes part in it with an abort flag, so its
//! peers return [`CmfeError::PeerAborted`] instead of blocking.

use crate::algs::communicator::{CommTag, Communicator};
use crate::algs::wire::{
    WireCount, WirePointRecord, WireReader, WireValueHeader, WireWriter, kind,
};
use crate::cmfe::config::CmfeOptions;
use crate::cmfe::lookup::{CandidateList, LookupGrouping};
use crate::cmfe::partition::{SpatialPartition, WorkerSummary, exchange_summaries};
use crate::cmfe::query_points::QueryPointSet;
use crate::mesh::fragment::{Centering, Field, MeshFragment};
use crate::mesh_error::CmfeError;

/// Result for one destination fragment.
#[derive(Clone, Debug, PartialEq)]
pub struct EvaluatedField {
    /// Values in the destination's node or cell order.
    pub field: Field,
    /// `false` where no source cell contained the point; those entries hold
    /// [`CmfeOptions::fill_value`].
    pub valid: Vec<bool>,
}

impl EvaluatedField {
    pub fn len(&self) -> usize {
        self.valid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.valid.is_empty()
    }

    pub fn invalid_count(&self) -> usize {
        self.valid.iter().filter(|v| !**v).count()
    }
}

/// Per-worker counters of one evaluation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CmfeStats {
    pub native_points: usize,
    pub relocated_points: usize,
    pub found: usize,
    pub retried_found: usize,
    pub missing: usize,
}

#[derive(Clone, Debug)]
pub struct CmfeOutput {
    /// One entry per destination fragment, in input order.
    pub fields: Vec<EvaluatedField>,
    pub stats: CmfeStats,
}

/// Evaluate `field_name` from `source` at the nodes or cell centres
/// (`centering`) of every `destination` fragment.
pub fn perform_cmfe<C: Communicator>(
    comm: &C,
    source: &[MeshFragment],
    destination: &[MeshFragment],
    field_name: &str,
    centering: Centering,
    options: &CmfeOptions,
) -> Result<CmfeOutput, CmfeError> {
    options.validate()?;
    let parallel = !options.serial_only && comm.size() > 1;

    let (mut lookup, mut query) =
        match prepare(comm.rank(), source, destination, field_name, centering, options) {
            Ok(prepared) => prepared,
            Err(e) => {
                if parallel {
                    let tags = options.tags();
                    if let Err(comm_err) =
                        exchange_summaries(comm, tags.summary, &WorkerSummary::aborted())
                    {
                        log::warn!("rank {}: abort notification failed: {comm_err}", comm.rank());
                    }
                }
                return Err(e);
            }
        };

    let mut stats = CmfeStats {
        native_points: query.total_point_count(),
        ..CmfeStats::default()
    };
    if parallel {
        evaluate_parallel(comm, &mut lookup, &mut query, options, &mut stats)?;
    } else {
        let nc = lookup.components().or(options.expected_components).unwrap_or(1);
        query.set_components(nc)?;
        stats.relocated_points = query.total_point_count();
        stats.found = evaluate_local(&lookup, &mut query, options.fill_value)?;
    }

    let mut fields = Vec::with_capacity(destination.len());
    for f in 0..destination.len() {
        let (values, valid) = query.fragment_values(f)?;
        fields.push(EvaluatedField {
            field: Field::new(field_name, centering, query.components(), values.to_vec()),
            valid: valid.to_vec(),
        });
    }
    stats.missing = fields.iter().map(EvaluatedField::invalid_count).sum();
    log::debug!("rank {}: cmfe `{field_name}` done: {stats:?}", comm.rank());
    Ok(CmfeOutput { fields, stats })
}

/// Steps 1 and 2: build and finalize the point set and the lookup grouping.
fn prepare<'a>(
    rank: usize,
    source: &'a [MeshFragment],
    destination: &[MeshFragment],
    field_name: &str,
    centering: Centering,
    options: &CmfeOptions,
) -> Result<(LookupGrouping<'a>, QueryPointSet), CmfeError> {
    let mut lookup = LookupGrouping::new(field_name);
    for frag in source {
        lookup.add_fragment(frag)?;
    }
    lookup.finalize();
    if let (Some(expected), Some(found)) = (options.expected_components, lookup.components()) {
        if expected != found {
            return Err(CmfeError::ComponentMismatch { expected, found });
        }
    }

    let nc = lookup.components().or(options.expected_components).unwrap_or(1);
    let mut query = QueryPointSet::new(rank, centering, nc);
    for frag in destination {
        query.add_fragment(frag)?;
    }
    query.finalize();
    Ok((lookup, query))
}

/// Evaluate every current point against `lookup`, one fresh candidate list
/// per block. Returns the number of points found.
fn evaluate_local(
    lookup: &LookupGrouping<'_>,
    query: &mut QueryPointSet,
    fill: f64,
) -> Result<usize, CmfeError> {
    let mut buf = vec![0.0; query.components()];
    let mut list = CandidateList::new();
    let mut found = 0;
    for range in query.block_ranges() {
        list.clear();
        for i in range {
            let p = query.point(i);
            if lookup.get_value_using_list(&mut list, p, &mut buf) {
                query.set_value(i, &buf)?;
                found += 1;
            } else {
                query.mark_missing(i, fill)?;
            }
        }
    }
    Ok(found)
}

fn evaluate_parallel<C: Communicator>(
    comm: &C,
    lookup: &mut LookupGrouping<'_>,
    query: &mut QueryPointSet,
    options: &CmfeOptions,
    stats: &mut CmfeStats,
) -> Result<(), CmfeError> {
    let tags = options.tags();
    let partition = SpatialPartition::create_partition(comm, query, lookup, options)?;
    let nc = partition
        .components()
        .or(options.expected_components)
        .unwrap_or(1);
    query.set_components(nc)?;

    if partition.global_point_count() == 0 || partition.global_cell_count() == 0 {
        log::debug!(
            "rank {}: nothing to evaluate ({} points, {} cells globally)",
            comm.rank(),
            partition.global_point_count(),
            partition.global_cell_count()
        );
        for i in 0..query.total_point_count() {
            query.mark_missing(i, options.fill_value)?;
        }
        return Ok(());
    }

    query.relocate_using_partition(&partition, comm, tags.scatter_points)?;
    lookup.relocate_using_partition(&partition, comm, tags.scatter_cells)?;
    stats.relocated_points = query.total_point_count();
    log::debug!(
        "rank {}: {} native points, {} relocated points, {} local zones",
        comm.rank(),
        stats.native_points,
        stats.relocated_points,
        lookup.zone_count()
    );

    stats.found = evaluate_local(lookup, query, options.fill_value)?;
    if options.boundary_retry {
        stats.retried_found = retry_boundary_points(
            comm,
            &partition,
            lookup,
            query,
            options,
            (tags.retry_request, tags.retry_reply),
        )?;
    }

    query.unrelocate_using_partition(&partition, comm, tags.gather_values)?;
    Ok(())
}

/// Step 5 fallback: ask neighbouring regions for points missed locally.
/// Collective; every worker takes part even with nothing to ask.
fn retry_boundary_points<C: Communicator>(
    comm: &C,
    partition: &SpatialPartition,
    lookup: &LookupGrouping<'_>,
    query: &mut QueryPointSet,
    options: &CmfeOptions,
    (request_tag, reply_tag): (CommTag, CommTag),
) -> Result<usize, CmfeError> {
    let me = comm.rank();
    let size = comm.size();
    let tolerance = options.boundary_tolerance * partition.extent().diagonal();

    let mut requests: Vec<Option<WireWriter>> = (0..size).map(|_| None).collect();
    let mut workers = Vec::new();
    let mut distances = Vec::new();
    let mut asked = 0usize;
    for i in 0..query.total_point_count() {
        if query.is_valid(i) {
            continue;
        }
        let p = query.point(i);
        partition.get_processor_boundaries(p, tolerance, &mut workers, &mut distances);
        for &r in workers
            .iter()
            .filter(|&&r| r != me)
            .take(options.max_boundary_retries)
        {
            requests[r]
                .get_or_insert_with(|| WireWriter::new(kind::RETRY))
                .put(&WirePointRecord::new(me, i, p));
            asked += 1;
        }
    }
    let outgoing = requests
        .into_iter()
        .map(|w| w.map(WireWriter::finish).unwrap_or_default())
        .collect();
    let incoming = comm.all_to_all(request_tag, outgoing)?;

    let nc = query.components();
    let components = WireCount::new(nc)?;
    let mut buf = vec![0.0; nc];
    let mut list = CandidateList::new();
    let mut replies = Vec::with_capacity(size);
    for bytes in &incoming {
        if bytes.is_empty() {
            replies.push(Vec::new());
            continue;
        }
        let mut r = WireReader::open(bytes, kind::RETRY)?;
        let mut reply: Option<WireWriter> = None;
        while !r.is_empty() {
            let rec: WirePointRecord = r.read()?;
            if lookup.get_value_using_list(&mut list, rec.xyz(), &mut buf) {
                let w = reply.get_or_insert_with(|| {
                    let mut w = WireWriter::new(kind::VALUES);
                    w.put(&components);
                    w
                });
                w.put(&WireValueHeader::new(me, rec.index(), true));
                w.put_f64s(&buf);
            }
        }
        replies.push(reply.map(WireWriter::finish).unwrap_or_default());
    }
    let answers = comm.all_to_all(reply_tag, replies)?;

    let mut recovered = 0;
    let mut values = Vec::with_capacity(nc);
    for bytes in &answers {
        if bytes.is_empty() {
            continue;
        }
        let mut r = WireReader::open(bytes, kind::VALUES)?;
        let found = r.read::<WireCount>()?.get();
        if found != nc {
            return Err(CmfeError::ComponentMismatch { expected: nc, found });
        }
        while !r.is_empty() {
            let hdr: WireValueHeader = r.read()?;
            values.clear();
            r.read_f64s(nc, &mut values)?;
            let i = hdr.index();
            if hdr.valid() && !query.is_valid(i) {
                query.set_value(i, &values)?;
                recovered += 1;
            }
        }
    }
    if asked > 0 {
        log::trace!("rank {me}: boundary retry asked {asked}, recovered {recovered}");
    }
    Ok(recovered)
}
