//! Destination query points of one worker.
//!
//! Points are stored per destination fragment, either as a compact rectilinear
//! block (three axes) or as an explicit coordinate list. Both are reachable
//! through the same flat point index; only [`QueryPointSet::get_rgrid`] exposes
//! the compact form.
//!
//! ## Relocation
//! [`relocate_using_partition`](QueryPointSet::relocate_using_partition) ships
//! every point to the worker whose region contains it. List points go to a
//! single owner; rectilinear blocks are clipped against each region, so points
//! on a region face travel to every adjacent region. Every point carries its
//! native [`PointTag`]. The native storage is stashed while relocated and is
//! restored by [`unrelocate_using_partition`](QueryPointSet::unrelocate_using_partition),
//! which also brings each point's value home. Of several values for one point,
//! the first in ascending source-rank order wins, valid or not.

use crate::algs::communicator::{CommTag, Communicator};
use crate::algs::wire::{
    WireCount, WirePointRecord, WireRGridHeader, WireReader, WireValueHeader, WireWriter, kind,
};
use crate::cmfe::partition::{LoadSource, SpatialPartition, bin_of};
use crate::debug_invariants::DebugInvariants;
use crate::geometry::bounds::BoundingBox;
use crate::mesh::fragment::{Centering, FragmentGeometry, MeshFragment, zonal_axes};
use crate::mesh_error::CmfeError;
use std::ops::Range;

/// Native identity of a query point: owning worker and its index there.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PointTag {
    pub rank: usize,
    pub index: usize,
}

/// Where a rectilinear (sub-)block sits inside its native block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockOrigin {
    pub rank: usize,
    /// Native flat index of the native block's first point.
    pub base: usize,
    pub full_dims: [usize; 3],
    pub start: [usize; 3],
}

/// Compact rectilinear point block, `i` fastest.
#[derive(Clone, Debug, PartialEq)]
pub struct RGridBlock {
    pub axes: [Vec<f64>; 3],
    pub origin: BlockOrigin,
}

impl RGridBlock {
    pub fn dims(&self) -> [usize; 3] {
        [self.axes[0].len(), self.axes[1].len(), self.axes[2].len()]
    }

    pub fn len(&self) -> usize {
        self.dims().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn ijk(&self, local: usize) -> [usize; 3] {
        let nx = self.axes[0].len();
        let ny = self.axes[1].len();
        [local % nx, (local / nx) % ny, local / (nx * ny)]
    }

    #[inline]
    pub fn point(&self, local: usize) -> [f64; 3] {
        let [i, j, k] = self.ijk(local);
        [self.axes[0][i], self.axes[1][j], self.axes[2][k]]
    }

    pub fn tag(&self, local: usize) -> PointTag {
        let [i, j, k] = self.ijk(local);
        let o = &self.origin;
        let [fx, fy, _] = o.full_dims;
        PointTag {
            rank: o.rank,
            index: o.base + (o.start[0] + i) + (o.start[1] + j) * fx + (o.start[2] + k) * fx * fy,
        }
    }

    pub fn bounds(&self) -> BoundingBox {
        if self.is_empty() {
            return BoundingBox::empty();
        }
        let mut b = BoundingBox::empty();
        for d in 0..3 {
            b.min[d] = self.axes[d][0];
            b.max[d] = self.axes[d][self.axes[d].len() - 1];
        }
        b
    }

    /// The sub-block of points inside `region` (closed), if any.
    pub fn clip(&self, region: &BoundingBox) -> Option<RGridBlock> {
        let mut axes: [Vec<f64>; 3] = Default::default();
        let mut start = self.origin.start;
        for d in 0..3 {
            let a = &self.axes[d];
            let lo = a.partition_point(|&v| v < region.min[d]);
            let hi = a.partition_point(|&v| v <= region.max[d]);
            if lo >= hi {
                return None;
            }
            start[d] += lo;
            axes[d] = a[lo..hi].to_vec();
        }
        Some(RGridBlock {
            axes,
            origin: BlockOrigin {
                start,
                ..self.origin
            },
        })
    }
}

#[derive(Clone, Debug)]
enum PointBlock {
    RGrid(RGridBlock),
    List {
        coords: Vec<[f64; 3]>,
        tags: Vec<PointTag>,
    },
}

impl PointBlock {
    fn len(&self) -> usize {
        match self {
            PointBlock::RGrid(g) => g.len(),
            PointBlock::List { coords, .. } => coords.len(),
        }
    }

    #[inline]
    fn point(&self, local: usize) -> [f64; 3] {
        match self {
            PointBlock::RGrid(g) => g.point(local),
            PointBlock::List { coords, .. } => coords[local],
        }
    }

    fn tag(&self, local: usize) -> PointTag {
        match self {
            PointBlock::RGrid(g) => g.tag(local),
            PointBlock::List { tags, .. } => tags[local],
        }
    }

    fn bounds(&self) -> BoundingBox {
        match self {
            PointBlock::RGrid(g) => g.bounds(),
            PointBlock::List { coords, .. } => BoundingBox::from_points(coords),
        }
    }
}

#[derive(Clone, Debug, Default)]
struct PointStorage {
    blocks: Vec<PointBlock>,
    /// `blocks.len() + 1` offsets once finalized.
    block_start: Vec<usize>,
    values: Vec<f64>,
    valid: Vec<bool>,
}

impl PointStorage {
    fn total(&self) -> usize {
        self.block_start.last().copied().unwrap_or(0)
    }

    fn rebuild_offsets(&mut self, components: usize) {
        self.block_start.clear();
        self.block_start.push(0);
        let mut acc = 0;
        for b in &self.blocks {
            acc += b.len();
            self.block_start.push(acc);
        }
        self.values = vec![0.0; acc * components];
        self.valid = vec![false; acc];
    }

    #[inline]
    fn locate(&self, i: usize) -> (usize, usize) {
        let b = self.block_start[..self.blocks.len()].partition_point(|&s| s <= i) - 1;
        (b, i - self.block_start[b])
    }
}

/// Query points of one worker for one evaluation.
#[derive(Clone, Debug)]
pub struct QueryPointSet {
    rank: usize,
    centering: Centering,
    components: usize,
    current: PointStorage,
    native: Option<PointStorage>,
    finalized: bool,
}

impl QueryPointSet {
    pub fn new(rank: usize, centering: Centering, components: usize) -> Self {
        Self {
            rank,
            centering,
            components,
            current: PointStorage::default(),
            native: None,
            finalized: false,
        }
    }

    pub fn centering(&self) -> Centering {
        self.centering
    }

    pub fn components(&self) -> usize {
        self.components
    }

    pub fn is_relocated(&self) -> bool {
        self.native.is_some()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Record one destination fragment's query points (nodes or cell centres).
    /// Every fragment gets a block, even one without points, so block `f`
    /// always corresponds to the `f`-th fragment added.
    pub fn add_fragment(&mut self, fragment: &MeshFragment) -> Result<(), CmfeError> {
        if self.is_relocated() {
            return Err(CmfeError::InvalidState(
                "cannot add fragments to a relocated point set",
            ));
        }
        let base: usize = self.current.blocks.iter().map(PointBlock::len).sum();
        let block = match (fragment.geometry(), self.centering) {
            (FragmentGeometry::Rectilinear { axes }, centering) => {
                let axes = match centering {
                    Centering::Nodal => axes.clone(),
                    Centering::Zonal => zonal_axes(axes),
                };
                let full_dims = [axes[0].len(), axes[1].len(), axes[2].len()];
                PointBlock::RGrid(RGridBlock {
                    axes,
                    origin: BlockOrigin {
                        rank: self.rank,
                        base,
                        full_dims,
                        start: [0; 3],
                    },
                })
            }
            (_, centering) => {
                let n = fragment.point_count(centering);
                let coords: Vec<[f64; 3]> = match centering {
                    Centering::Nodal => (0..n).map(|i| fragment.node(i)).collect(),
                    Centering::Zonal => (0..n).map(|c| fragment.cell_center(c)).collect(),
                };
                let tags = (0..n)
                    .map(|i| PointTag {
                        rank: self.rank,
                        index: base + i,
                    })
                    .collect();
                PointBlock::List { coords, tags }
            }
        };
        self.current.blocks.push(block);
        self.finalized = false;
        Ok(())
    }

    /// Compute offsets and allocate value storage. Idempotent.
    pub fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.current.rebuild_offsets(self.components);
        self.finalized = true;
        debug_invariants!(self.validate_invariants(), "QueryPointSet::finalize");
    }

    /// Change the component count; discards stored values.
    pub fn set_components(&mut self, components: usize) -> Result<(), CmfeError> {
        if self.is_relocated() {
            return Err(CmfeError::InvalidState(
                "cannot change components of a relocated point set",
            ));
        }
        self.components = components;
        if self.finalized {
            self.current.values = vec![0.0; self.current.total() * components];
            self.current.valid.fill(false);
        }
        Ok(())
    }

    pub fn total_point_count(&self) -> usize {
        self.current.total()
    }

    pub fn block_count(&self) -> usize {
        self.current.blocks.len()
    }

    /// Flat index range of each block, in block order.
    pub fn block_ranges(&self) -> Vec<Range<usize>> {
        self.current
            .block_start
            .windows(2)
            .map(|w| w[0]..w[1])
            .collect()
    }

    fn check_index(&self, i: usize) -> Result<(), CmfeError> {
        if i >= self.total_point_count() {
            return Err(CmfeError::IndexOutOfBounds {
                index: i,
                len: self.total_point_count(),
            });
        }
        Ok(())
    }

    pub fn get_point(&self, i: usize) -> Result<[f64; 3], CmfeError> {
        self.check_index(i)?;
        Ok(self.point(i))
    }

    /// Unchecked variant of [`get_point`](Self::get_point).
    ///
    /// # Panics
    /// If `i >= total_point_count()`.
    #[inline]
    pub fn point(&self, i: usize) -> [f64; 3] {
        let (b, local) = self.current.locate(i);
        self.current.blocks[b].point(local)
    }

    pub fn tag(&self, i: usize) -> Result<PointTag, CmfeError> {
        self.check_index(i)?;
        let (b, local) = self.current.locate(i);
        Ok(self.current.blocks[b].tag(local))
    }

    /// The compact form of block `block`, if it is rectilinear.
    pub fn get_rgrid(&self, block: usize) -> Option<&RGridBlock> {
        match self.current.blocks.get(block)? {
            PointBlock::RGrid(g) => Some(g),
            PointBlock::List { .. } => None,
        }
    }

    /// All points in flat-index order.
    pub fn points(&self) -> impl Iterator<Item = [f64; 3]> + '_ {
        self.current
            .blocks
            .iter()
            .flat_map(|b| (0..b.len()).map(move |l| b.point(l)))
    }

    pub fn bounds(&self) -> BoundingBox {
        let mut b = BoundingBox::empty();
        for block in &self.current.blocks {
            b.join(&block.bounds());
        }
        b
    }

    /// Store the value of point `i` and mark it valid.
    pub fn set_value(&mut self, i: usize, value: &[f64]) -> Result<(), CmfeError> {
        self.check_index(i)?;
        if value.len() != self.components {
            return Err(CmfeError::ComponentMismatch {
                expected: self.components,
                found: value.len(),
            });
        }
        let nc = self.components;
        self.current.values[i * nc..(i + 1) * nc].copy_from_slice(value);
        self.current.valid[i] = true;
        Ok(())
    }

    /// Fill point `i` with `fill` and mark it invalid.
    pub fn mark_missing(&mut self, i: usize, fill: f64) -> Result<(), CmfeError> {
        self.check_index(i)?;
        let nc = self.components;
        self.current.values[i * nc..(i + 1) * nc].fill(fill);
        self.current.valid[i] = false;
        Ok(())
    }

    /// Component `component` of point `i`.
    ///
    /// # Panics
    /// If either index is out of range.
    pub fn get_value(&self, component: usize, i: usize) -> f64 {
        assert!(component < self.components, "component out of range");
        self.current.values[i * self.components + component]
    }

    pub fn value(&self, i: usize) -> &[f64] {
        &self.current.values[i * self.components..(i + 1) * self.components]
    }

    pub fn is_valid(&self, i: usize) -> bool {
        self.current.valid[i]
    }

    /// Values and validity of destination fragment `f` (native state only).
    pub fn fragment_values(&self, f: usize) -> Result<(&[f64], &[bool]), CmfeError> {
        if self.is_relocated() {
            return Err(CmfeError::InvalidState(
                "fragment values are only available in native state",
            ));
        }
        if !self.finalized {
            return Err(CmfeError::InvalidState("point set is not finalized"));
        }
        if f >= self.current.blocks.len() {
            return Err(CmfeError::IndexOutOfBounds {
                index: f,
                len: self.current.blocks.len(),
            });
        }
        let (s, e) = (self.current.block_start[f], self.current.block_start[f + 1]);
        let nc = self.components;
        Ok((
            &self.current.values[s * nc..e * nc],
            &self.current.valid[s..e],
        ))
    }

    /// Collective: move every point to the worker(s) whose region contains it.
    pub fn relocate_using_partition<C: Communicator>(
        &mut self,
        partition: &SpatialPartition,
        comm: &C,
        tag: CommTag,
    ) -> Result<(), CmfeError> {
        if !self.finalized {
            return Err(CmfeError::InvalidState("point set is not finalized"));
        }
        if self.is_relocated() {
            return Err(CmfeError::InvalidState("point set is already relocated"));
        }
        if partition.worker_count() != comm.size() {
            return Err(CmfeError::PartitionMismatch {
                expected: partition.worker_count(),
                found: comm.size(),
            });
        }
        if self.rank != comm.rank() {
            return Err(CmfeError::RankMismatch {
                expected: self.rank,
                found: comm.rank(),
            });
        }
        let size = comm.size();
        let active: Vec<usize> = partition.active_workers().collect();
        let mut grids: Vec<Vec<RGridBlock>> = vec![Vec::new(); size];
        let mut lists: Vec<Vec<WirePointRecord>> = vec![Vec::new(); size];
        let mut fallbacks = 0usize;

        let mut route_point = |p: [f64; 3], t: PointTag, lists: &mut Vec<Vec<WirePointRecord>>| {
            let dest = match partition.get_processor(p) {
                Some(r) => Some(r),
                None => {
                    fallbacks += 1;
                    partition.get_processor_or_nearest(p)
                }
            };
            let Some(dest) = dest else {
                return Err(CmfeError::InvalidState("partition has no regions"));
            };
            lists[dest].push(WirePointRecord::new(t.rank, t.index, p));
            Ok(())
        };

        for block in &self.current.blocks {
            match block {
                PointBlock::RGrid(g) if g.is_empty() => {}
                // regions tile the extent, so clipping covers every point inside it
                PointBlock::RGrid(g) if contains_box(partition.extent(), &g.bounds()) => {
                    for &r in &active {
                        if let Some(region) = partition.region(r) {
                            if let Some(sub) = g.clip(region) {
                                grids[r].push(sub);
                            }
                        }
                    }
                }
                other => {
                    for l in 0..other.len() {
                        route_point(other.point(l), other.tag(l), &mut lists)?;
                    }
                }
            }
        }
        if fallbacks > 0 {
            log::warn!(
                "rank {}: {fallbacks} query points outside every region, sent to the nearest",
                self.rank
            );
        }

        let outgoing = (0..size)
            .map(|r| {
                if grids[r].is_empty() && lists[r].is_empty() {
                    return Ok(Vec::new());
                }
                let mut w = WireWriter::new(kind::POINTS);
                w.put(&WireCount::new(grids[r].len())?);
                for g in &grids[r] {
                    let o = &g.origin;
                    w.put(&WireRGridHeader::new(o.rank, o.base, o.full_dims, o.start, g.dims()));
                    for axis in &g.axes {
                        w.put_f64s(axis);
                    }
                }
                w.put(&WireCount::new(lists[r].len())?);
                for rec in &lists[r] {
                    w.put(rec);
                }
                Ok(w.finish())
            })
            .collect::<Result<Vec<Vec<u8>>, CmfeError>>()?;

        let incoming = comm.all_to_all(tag, outgoing)?;

        let mut blocks = Vec::new();
        for bytes in &incoming {
            if bytes.is_empty() {
                continue;
            }
            let mut r = WireReader::open(bytes, kind::POINTS)?;
            let n_grids = r.read::<WireCount>()?.get();
            for _ in 0..n_grids {
                let hdr: WireRGridHeader = r.read()?;
                let dims = hdr.dims();
                let mut axes: [Vec<f64>; 3] = Default::default();
                for d in 0..3 {
                    r.read_f64s(dims[d], &mut axes[d])?;
                }
                blocks.push(PointBlock::RGrid(RGridBlock {
                    axes,
                    origin: BlockOrigin {
                        rank: hdr.rank(),
                        base: hdr.base(),
                        full_dims: hdr.full_dims(),
                        start: hdr.start(),
                    },
                }));
            }
            let n_points = r.read::<WireCount>()?.get();
            if n_points > 0 {
                let mut coords = Vec::with_capacity(n_points);
                let mut tags = Vec::with_capacity(n_points);
                for _ in 0..n_points {
                    let rec: WirePointRecord = r.read()?;
                    coords.push(rec.xyz());
                    tags.push(PointTag {
                        rank: rec.rank(),
                        index: rec.index(),
                    });
                }
                blocks.push(PointBlock::List { coords, tags });
            }
        }

        let mut relocated = PointStorage {
            blocks,
            ..Default::default()
        };
        relocated.rebuild_offsets(self.components);
        log::debug!(
            "rank {}: relocated {} native points, now holding {}",
            self.rank,
            self.current.total(),
            relocated.total()
        );
        self.native = Some(std::mem::replace(&mut self.current, relocated));
        debug_invariants!(self.validate_invariants(), "QueryPointSet::relocate");
        Ok(())
    }

    /// Collective: send every relocated point's value home and restore the
    /// native storage.
    pub fn unrelocate_using_partition<C: Communicator>(
        &mut self,
        partition: &SpatialPartition,
        comm: &C,
        tag: CommTag,
    ) -> Result<(), CmfeError> {
        if !self.is_relocated() {
            return Err(CmfeError::InvalidState("point set is not relocated"));
        }
        if partition.worker_count() != comm.size() {
            return Err(CmfeError::PartitionMismatch {
                expected: partition.worker_count(),
                found: comm.size(),
            });
        }
        let size = comm.size();
        let nc = self.components;
        let components = WireCount::new(nc)?;
        let mut writers: Vec<Option<WireWriter>> = (0..size).map(|_| None).collect();
        for (b, block) in self.current.blocks.iter().enumerate() {
            let start = self.current.block_start[b];
            for l in 0..block.len() {
                let t = block.tag(l);
                if t.rank >= size {
                    return Err(CmfeError::IndexOutOfBounds {
                        index: t.rank,
                        len: size,
                    });
                }
                let i = start + l;
                let w = writers[t.rank].get_or_insert_with(|| {
                    let mut w = WireWriter::new(kind::VALUES);
                    w.put(&components);
                    w
                });
                w.put(&WireValueHeader::new(t.rank, t.index, self.current.valid[i]));
                w.put_f64s(&self.current.values[i * nc..(i + 1) * nc]);
            }
        }
        let outgoing = writers
            .into_iter()
            .map(|w| w.map(WireWriter::finish).unwrap_or_default())
            .collect();

        let incoming = comm.all_to_all(tag, outgoing)?;

        let Some(native) = self.native.as_ref() else {
            return Err(CmfeError::InvalidState("point set is not relocated"));
        };
        let total = native.total();
        let mut values = vec![0.0; total * nc];
        let mut valid = vec![false; total];
        // first value per native point wins, in ascending source rank
        let mut received = vec![false; total];
        let mut scratch = Vec::with_capacity(nc);
        for bytes in &incoming {
            if bytes.is_empty() {
                continue;
            }
            let mut r = WireReader::open(bytes, kind::VALUES)?;
            let found = r.read::<WireCount>()?.get();
            if found != nc {
                return Err(CmfeError::ComponentMismatch {
                    expected: nc,
                    found,
                });
            }
            while !r.is_empty() {
                let hdr: WireValueHeader = r.read()?;
                scratch.clear();
                r.read_f64s(nc, &mut scratch)?;
                if hdr.rank() != self.rank {
                    return Err(CmfeError::WireFormat(format!(
                        "rank {} received a value owned by rank {}",
                        self.rank,
                        hdr.rank()
                    )));
                }
                let i = hdr.index();
                if i >= total {
                    return Err(CmfeError::IndexOutOfBounds {
                        index: i,
                        len: total,
                    });
                }
                if !received[i] {
                    values[i * nc..(i + 1) * nc].copy_from_slice(&scratch);
                    valid[i] = hdr.valid();
                    received[i] = true;
                }
            }
        }
        let Some(mut native) = self.native.take() else {
            return Err(CmfeError::InvalidState("point set is not relocated"));
        };
        native.values = values;
        native.valid = valid;
        self.current = native;
        if let Some(index) = received.iter().position(|&r| !r) {
            return Err(CmfeError::LostPoint { index });
        }
        debug_invariants!(self.validate_invariants(), "QueryPointSet::unrelocate");
        Ok(())
    }
}

fn contains_box(outer: &BoundingBox, inner: &BoundingBox) -> bool {
    (0..3).all(|d| outer.min[d] <= inner.min[d] && inner.max[d] <= outer.max[d])
}

impl LoadSource for QueryPointSet {
    fn accumulate_load(&self, region: &BoundingBox, axis: usize, bins: &mut [u64]) {
        let (lo, hi) = (region.min[axis], region.max[axis]);
        let inside = |d: usize, v: f64| region.min[d] <= v && v <= region.max[d];
        for block in &self.current.blocks {
            match block {
                PointBlock::RGrid(g) => {
                    let mut across: u64 = 1;
                    for d in (0..3).filter(|&d| d != axis) {
                        across *= g.axes[d].iter().filter(|&&v| inside(d, v)).count() as u64;
                    }
                    if across == 0 {
                        continue;
                    }
                    for &v in g.axes[axis].iter().filter(|&&v| inside(axis, v)) {
                        bins[bin_of(v, lo, hi, bins.len())] += across;
                    }
                }
                PointBlock::List { coords, .. } => {
                    for p in coords.iter().filter(|p| region.contains_point(**p)) {
                        bins[bin_of(p[axis], lo, hi, bins.len())] += 1;
                    }
                }
            }
        }
    }
}

impl DebugInvariants for QueryPointSet {
    fn debug_assert_invariants(&self) {
        debug_invariants!(self.validate_invariants(), "QueryPointSet");
    }

    fn validate_invariants(&self) -> Result<(), CmfeError> {
        if !self.finalized {
            return Ok(());
        }
        let s = &self.current;
        if s.block_start.len() != s.blocks.len() + 1 {
            return Err(CmfeError::InvalidState(
                "block offsets do not match block count",
            ));
        }
        for (b, block) in s.blocks.iter().enumerate() {
            if s.block_start[b + 1] != s.block_start[b] + block.len() {
                return Err(CmfeError::InvalidState(
                    "block offsets inconsistent with block sizes",
                ));
            }
        }
        if s.values.len() != s.total() * self.components || s.valid.len() != s.total() {
            return Err(CmfeError::InvalidState(
                "value storage not sized components x points",
            ));
        }
        Ok(())
    }
}
