//! Load-aware spatial partition of the evaluation domain.
//!
//! Every worker contributes a [`WorkerSummary`] (aggregate bounds, point and cell
//! counts, component count). The union of the summaries, padded along degenerate
//! axes, is bisected recursively: each split runs along the longest axis of the
//! current region, and the plane is placed from an all-gathered load histogram
//! so that each side carries load proportional to the number of workers it will
//! hold. Only workers holding points or cells get a region. Leaf regions tile the
//! extent and share closed faces; a point on a shared face belongs to every
//! adjacent region, and single-owner queries resolve it to the lowest worker id.

use crate::algs::communicator::{CommTag, Communicator};
use crate::algs::wire::{WireCount, WireLen, WireReader, WireWorkerSummary, WireWriter, kind};
use crate::cmfe::config::CmfeOptions;
use crate::cmfe::lookup::LookupGrouping;
use crate::cmfe::query_points::QueryPointSet;
use crate::geometry::bounds::BoundingBox;
use crate::geometry::interval_index::IntervalIndex;
use crate::mesh_error::CmfeError;
use itertools::Itertools;

/// Anything whose spatial load can be binned for the bisection.
pub trait LoadSource {
    /// Add the load located inside `region` (closed) to `bins`, which split
    /// `region` evenly along `axis`.
    fn accumulate_load(&self, region: &BoundingBox, axis: usize, bins: &mut [u64]);
}

/// Bin of coordinate `v` in `bins` equal slices of `[lo, hi]`.
#[inline]
pub(crate) fn bin_of(v: f64, lo: f64, hi: f64, bins: usize) -> usize {
    if hi <= lo {
        return 0;
    }
    let b = ((v - lo) / (hi - lo) * bins as f64).floor();
    if b <= 0.0 {
        0
    } else {
        (b as usize).min(bins - 1)
    }
}

/// What one worker reports at the start of partitioning.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WorkerSummary {
    pub bounds: BoundingBox,
    pub points: usize,
    pub cells: usize,
    pub components: Option<usize>,
    pub aborted: bool,
}

impl WorkerSummary {
    /// Summary of a worker that hit a local error and is leaving the protocol.
    pub fn aborted() -> Self {
        Self {
            bounds: BoundingBox::empty(),
            points: 0,
            cells: 0,
            components: None,
            aborted: true,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.aborted && (self.points > 0 || self.cells > 0) && !self.bounds.is_empty()
    }

    fn to_wire(self) -> WireWorkerSummary {
        let mut flags = 0;
        if self.aborted {
            flags |= WireWorkerSummary::ABORTED;
        }
        if self.components.is_some() {
            flags |= WireWorkerSummary::HAS_SOURCE;
        }
        WireWorkerSummary::new(
            self.bounds.min,
            self.bounds.max,
            self.points,
            self.cells,
            self.components.unwrap_or(0),
            flags,
        )
    }

    fn from_wire(w: &WireWorkerSummary) -> Self {
        Self {
            bounds: BoundingBox::new(w.min(), w.max()),
            points: w.points(),
            cells: w.cells(),
            components: w
                .has(WireWorkerSummary::HAS_SOURCE)
                .then(|| w.components()),
            aborted: w.has(WireWorkerSummary::ABORTED),
        }
    }
}

/// All-gather one summary per worker, indexed by rank.
pub fn exchange_summaries<C: Communicator>(
    comm: &C,
    tag: CommTag,
    local: &WorkerSummary,
) -> Result<Vec<WorkerSummary>, CmfeError> {
    let mut w = WireWriter::new(kind::SUMMARY);
    w.put(&local.to_wire());
    let gathered = comm.all_gather(tag, &w.finish())?;
    gathered
        .iter()
        .map(|bytes| {
            let mut r = WireReader::open(bytes, kind::SUMMARY)?;
            Ok(WorkerSummary::from_wire(&r.read::<WireWorkerSummary>()?))
        })
        .collect()
}

/// All-gather a histogram and sum it element-wise.
fn allgather_histogram<C: Communicator>(
    comm: &C,
    tag: CommTag,
    local: &[u64],
) -> Result<Vec<u64>, CmfeError> {
    let mut w = WireWriter::new(kind::HISTOGRAM);
    w.put(&WireCount::new(local.len())?);
    for &count in local {
        w.put(&WireLen::new(count as usize));
    }
    let gathered = comm.all_gather(tag, &w.finish())?;
    let mut total = vec![0u64; local.len()];
    for (src, bytes) in gathered.iter().enumerate() {
        let mut r = WireReader::open(bytes, kind::HISTOGRAM)?;
        let n = r.read::<WireCount>()?.get();
        if n != local.len() {
            return Err(CmfeError::BufferSizeMismatch {
                neighbor: src,
                expected: local.len(),
                got: n,
            });
        }
        for slot in total.iter_mut() {
            *slot += r.read::<WireLen>()?.get() as u64;
        }
    }
    Ok(total)
}

/// Assignment of disjoint (up to shared faces) regions of space to workers.
#[derive(Clone, Debug)]
pub struct SpatialPartition {
    regions: Vec<Option<BoundingBox>>,
    index: IntervalIndex,
    extent: BoundingBox,
    components: Option<usize>,
    global_points: usize,
    global_cells: usize,
}

impl SpatialPartition {
    /// Partition from explicit per-worker regions (`None` for workers without one).
    ///
    /// The regions are expected to tile their union.
    pub fn from_regions(regions: Vec<Option<BoundingBox>>) -> Self {
        let mut extent = BoundingBox::empty();
        for r in regions.iter().flatten() {
            extent.join(r);
        }
        let index = IntervalIndex::new(
            regions
                .iter()
                .enumerate()
                .filter_map(|(rank, r)| r.map(|b| (rank, b)))
                .collect(),
        );
        Self {
            regions,
            index,
            extent,
            components: None,
            global_points: 0,
            global_cells: 0,
        }
    }

    /// Collective: build the partition for the points in `query` and the cells
    /// in `lookup` (both finalized) across all ranks of `comm`.
    pub fn create_partition<C: Communicator>(
        comm: &C,
        query: &QueryPointSet,
        lookup: &LookupGrouping<'_>,
        options: &CmfeOptions,
    ) -> Result<Self, CmfeError> {
        let tags = options.tags();
        let mut bounds = query.bounds();
        bounds.join(&lookup.bounds());
        let local = WorkerSummary {
            bounds,
            points: query.total_point_count(),
            cells: lookup.zone_count(),
            components: lookup.components(),
            aborted: false,
        };
        let summaries = exchange_summaries(comm, tags.summary, &local)?;

        if let Some(rank) = summaries.iter().position(|s| s.aborted) {
            return Err(CmfeError::PeerAborted { rank });
        }

        // every worker holding the field must agree on its shape
        let mut components: Option<usize> = None;
        for s in &summaries {
            match (components, s.components) {
                (None, found) => components = found,
                (Some(expected), Some(found)) if expected != found => {
                    return Err(CmfeError::ComponentMismatch { expected, found });
                }
                _ => {}
            }
        }
        if let (Some(expected), Some(found)) = (options.expected_components, components) {
            if expected != found {
                return Err(CmfeError::ComponentMismatch { expected, found });
            }
        }

        let global_points = summaries.iter().map(|s| s.points).sum();
        let global_cells = summaries.iter().map(|s| s.cells).sum();
        let active: Vec<usize> = (0..summaries.len())
            .filter(|&r| summaries[r].is_active())
            .collect();

        let mut extent = BoundingBox::empty();
        for &r in &active {
            extent.join(&summaries[r].bounds);
        }
        let extent = pad_degenerate_axes(extent, options.global_extent.as_ref());

        let mut regions = vec![None; comm.size()];
        if !active.is_empty() {
            let sources: [&dyn LoadSource; 2] = [query, lookup];
            bisect(
                comm,
                tags.split,
                &sources,
                extent,
                &active,
                options.partition_bins,
                &mut regions,
            )?;
        }
        log::debug!(
            "rank {}: partition over {} active of {} workers, extent {:?}",
            comm.rank(),
            active.len(),
            comm.size(),
            extent
        );

        let mut partition = Self::from_regions(regions);
        partition.extent = extent;
        partition.components = components;
        partition.global_points = global_points;
        partition.global_cells = global_cells;
        Ok(partition)
    }

    pub fn worker_count(&self) -> usize {
        self.regions.len()
    }

    pub fn region(&self, rank: usize) -> Option<&BoundingBox> {
        self.regions.get(rank).and_then(Option::as_ref)
    }

    /// Ranks owning a region, ascending.
    pub fn active_workers(&self) -> impl Iterator<Item = usize> + '_ {
        self.regions
            .iter()
            .enumerate()
            .filter_map(|(rank, r)| r.map(|_| rank))
    }

    pub fn extent(&self) -> &BoundingBox {
        &self.extent
    }

    /// Component count of the source field, if any worker holds it.
    pub fn components(&self) -> Option<usize> {
        self.components
    }

    pub fn global_point_count(&self) -> usize {
        self.global_points
    }

    pub fn global_cell_count(&self) -> usize {
        self.global_cells
    }

    /// Lowest-id worker whose region contains `p`.
    pub fn get_processor(&self, p: [f64; 3]) -> Option<usize> {
        self.index.first_containing(p)
    }

    /// [`get_processor`](Self::get_processor), falling back to the region with
    /// the nearest centre. `None` only if no worker owns a region.
    pub fn get_processor_or_nearest(&self, p: [f64; 3]) -> Option<usize> {
        self.get_processor(p).or_else(|| self.nearest_region(p))
    }

    /// Primary owner of a cell: the lowest-id region overlapping its box.
    pub fn get_processor_for_cell(&self, cell: &BoundingBox) -> Option<usize> {
        let mut list = Vec::new();
        self.get_processor_list(cell, &mut list);
        list.first().copied()
    }

    /// Every worker whose region overlaps `cell`, ascending; the nearest region
    /// if none does.
    pub fn get_processor_list(&self, cell: &BoundingBox, out: &mut Vec<usize>) {
        self.index.find_overlapping_into(cell, out);
        if out.is_empty() {
            if let Some(r) = self.nearest_region(cell.center()) {
                out.push(r);
            }
        }
    }

    /// Workers whose region lies within `tolerance` of `p`, ordered by
    /// (distance, rank). A region containing `p` is at distance zero.
    pub fn get_processor_boundaries(
        &self,
        p: [f64; 3],
        tolerance: f64,
        workers: &mut Vec<usize>,
        distances: &mut Vec<f64>,
    ) {
        workers.clear();
        distances.clear();
        let hits = self
            .active_workers()
            .filter_map(|rank| {
                let d = self.regions[rank]?.distance_to_point(p);
                (d <= tolerance).then_some((d, rank))
            })
            .sorted_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        for (d, rank) in hits {
            workers.push(rank);
            distances.push(d);
        }
    }

    fn nearest_region(&self, p: [f64; 3]) -> Option<usize> {
        let mut best: Option<(f64, usize)> = None;
        for rank in self.active_workers() {
            let Some(region) = self.regions[rank] else {
                continue;
            };
            let c = region.center();
            let d2 = (0..3).map(|d| (c[d] - p[d]) * (c[d] - p[d])).sum::<f64>();
            if best.is_none_or(|(bd, _)| d2 < bd) {
                best = Some((d2, rank));
            }
        }
        best.map(|(_, rank)| rank)
    }
}

fn pad_degenerate_axes(mut extent: BoundingBox, caller: Option<&BoundingBox>) -> BoundingBox {
    if extent.is_empty() {
        return extent;
    }
    let pad = 1e-6 * extent.diagonal().max(1.0);
    for d in 0..3 {
        if extent.max[d] > extent.min[d] {
            continue;
        }
        match caller {
            Some(g) if !g.is_empty() && g.max[d] > g.min[d] => {
                extent.min[d] = extent.min[d].min(g.min[d]);
                extent.max[d] = extent.max[d].max(g.max[d]);
            }
            _ => {
                extent.min[d] -= pad;
                extent.max[d] += pad;
            }
        }
    }
    extent
}

/// Recursive bisection; every rank runs the same recursion, so the histogram
/// all-gathers line up.
fn bisect<C: Communicator>(
    comm: &C,
    tag: CommTag,
    sources: &[&dyn LoadSource],
    region: BoundingBox,
    workers: &[usize],
    bins: usize,
    regions: &mut [Option<BoundingBox>],
) -> Result<(), CmfeError> {
    if let [only] = workers {
        regions[*only] = Some(region);
        return Ok(());
    }
    let n_left = workers.len() / 2;
    let fraction = n_left as f64 / workers.len() as f64;
    let axis = region.longest_axis();
    let (lo, hi) = (region.min[axis], region.max[axis]);

    let mut local = vec![0u64; bins];
    for s in sources {
        s.accumulate_load(&region, axis, &mut local);
    }
    let hist = allgather_histogram(comm, tag, &local)?;
    let total: u64 = hist.iter().sum();

    let plane = if total == 0 {
        lo + (hi - lo) * fraction
    } else {
        let target = fraction * total as f64;
        let mut cumulative = 0u64;
        let mut cut = bins - 1;
        for (b, &count) in hist.iter().enumerate() {
            cumulative += count;
            if cumulative as f64 >= target {
                cut = b + 1;
                break;
            }
        }
        let cut = cut.clamp(1, bins - 1);
        lo + (hi - lo) * (cut as f64 / bins as f64)
    };
    log::trace!(
        "split {:?} on axis {axis} at {plane} ({} | {} workers, load {total})",
        workers,
        n_left,
        workers.len() - n_left
    );

    let mut left = region;
    left.max[axis] = plane;
    let mut right = region;
    right.min[axis] = plane;
    bisect(comm, tag, sources, left, &workers[..n_left], bins, regions)?;
    bisect(comm, tag, sources, right, &workers[n_left..], bins, regions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;

    fn two_halves() -> SpatialPartition {
        SpatialPartition::from_regions(vec![
            Some(BoundingBox::new([0.0; 3], [1.0, 2.0, 1.0])),
            None,
            Some(BoundingBox::new([1.0, 0.0, 0.0], [2.0, 2.0, 1.0])),
        ])
    }

    #[test]
    fn seam_goes_to_lowest_rank() {
        let p = two_halves();
        assert_eq!(p.get_processor([1.0, 1.0, 0.5]), Some(0));
        assert_eq!(p.get_processor([1.5, 1.0, 0.5]), Some(2));
        assert_eq!(p.get_processor([5.0, 1.0, 0.5]), None);
        assert_eq!(p.get_processor_or_nearest([5.0, 1.0, 0.5]), Some(2));
        assert_eq!(p.active_workers().collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn straddling_cell_goes_to_both() {
        let p = two_halves();
        let cell = BoundingBox::new([0.8, 0.0, 0.0], [1.2, 0.5, 0.5]);
        let mut list = Vec::new();
        p.get_processor_list(&cell, &mut list);
        assert_eq!(list, vec![0, 2]);
        assert_eq!(p.get_processor_for_cell(&cell), Some(0));
        let far = BoundingBox::new([-3.0; 3], [-2.0; 3]);
        p.get_processor_list(&far, &mut list);
        assert_eq!(list, vec![0]);
    }

    #[test]
    fn boundaries_sorted_by_distance() {
        let p = two_halves();
        let mut workers = Vec::new();
        let mut dist = Vec::new();
        p.get_processor_boundaries([0.999, 1.0, 0.5], 0.01, &mut workers, &mut dist);
        assert_eq!(workers, vec![0, 2]);
        assert_eq!(dist[0], 0.0);
        p.get_processor_boundaries([0.5, 1.0, 0.5], 0.01, &mut workers, &mut dist);
        assert_eq!(workers, vec![0]);
    }

    #[test]
    fn bin_clamps_to_range() {
        assert_eq!(bin_of(-1.0, 0.0, 1.0, 4), 0);
        assert_eq!(bin_of(0.26, 0.0, 1.0, 4), 1);
        assert_eq!(bin_of(1.0, 0.0, 1.0, 4), 3);
        assert_eq!(bin_of(0.5, 1.0, 1.0, 4), 0);
    }

    #[test]
    fn degenerate_axis_is_padded() {
        let flat = BoundingBox::new([0.0, 0.0, 0.0], [1.0, 1.0, 0.0]);
        let padded = pad_degenerate_axes(flat, None);
        assert!(padded.min[2] < 0.0 && padded.max[2] > 0.0);
        assert_eq!(padded.min[0], 0.0);
        let caller = BoundingBox::new([0.0, 0.0, -5.0], [1.0, 1.0, 5.0]);
        let padded = pad_degenerate_axes(flat, Some(&caller));
        assert_eq!((padded.min[2], padded.max[2]), (-5.0, 5.0));
    }

    #[test]
    fn single_worker_owns_padded_extent() {
        let mut query = QueryPointSet::new(0, crate::mesh::Centering::Nodal, 1);
        let frag = crate::mesh::MeshFragment::rectilinear(
            vec![0.0, 1.0],
            vec![0.0, 1.0],
            vec![0.0],
        )
        .unwrap();
        query.add_fragment(&frag).unwrap();
        query.finalize();
        let mut lookup = LookupGrouping::new("f");
        lookup.finalize();
        let opts = CmfeOptions::default();
        let p = SpatialPartition::create_partition(&NoComm, &query, &lookup, &opts).unwrap();
        assert_eq!(p.global_point_count(), 4);
        assert_eq!(p.global_cell_count(), 0);
        assert_eq!(p.get_processor([1.0, 1.0, 0.0]), Some(0));
        assert!(p.region(0).unwrap().extents()[2] > 0.0);
    }
}
