//! Source cells of one worker for one field, and point evaluation against them.
//!
//! Cells of all added fragments share one flat zone numbering (fragment order,
//! then local cell order). When several cells contain a point, the one with the
//! lowest flat zone id is used.
//!
//! ## Locality cache
//! [`CandidateList`] is owned by the caller and passed into
//! [`LookupGrouping::get_value_using_list`]. After a successful full search it
//! holds the box of the containing cell and every cell whose box overlaps it,
//! ascending. While the next point stays inside that box, any cell containing it
//! is in the list, so a linear scan finds the same cell a full search would.

use crate::algs::communicator::{CommTag, Communicator};
use crate::algs::wire::{WireCellHeader, WireCount, WireReader, WireWriter, kind};
use crate::cmfe::partition::{LoadSource, SpatialPartition, bin_of};
use crate::debug_invariants::DebugInvariants;
use crate::geometry::bounds::BoundingBox;
use crate::geometry::interval_index::IntervalIndex;
use crate::geometry::shape::{self, CellType};
use crate::mesh::fragment::{Cell, Centering, Field, MeshFragment};
use crate::mesh_error::CmfeError;
use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Caller-owned locality cache for [`LookupGrouping::get_value_using_list`].
#[derive(Clone, Debug, Default)]
pub struct CandidateList {
    region: BoundingBox,
    cells: Vec<usize>,
    generation: u64,
}

impl CandidateList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.region = BoundingBox::empty();
        self.cells.clear();
        self.generation = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn cells(&self) -> &[usize] {
        &self.cells
    }
}

/// A worker's source fragments for one field.
#[derive(Clone, Debug)]
pub struct LookupGrouping<'a> {
    field_name: String,
    components: Option<usize>,
    fragments: Vec<Cow<'a, MeshFragment>>,
    field_index: Vec<usize>,
    zone_start: Vec<usize>,
    cell_bounds: Vec<BoundingBox>,
    index: Option<IntervalIndex>,
    generation: u64,
}

impl<'a> LookupGrouping<'a> {
    pub fn new(field_name: impl Into<String>) -> Self {
        Self {
            field_name: field_name.into(),
            components: None,
            fragments: Vec::new(),
            field_index: Vec::new(),
            zone_start: vec![0],
            cell_bounds: Vec::new(),
            index: None,
            generation: 0,
        }
    }

    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    /// Component count of the field, once a fragment has been added.
    pub fn components(&self) -> Option<usize> {
        self.components
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    /// Number of cells across all fragments (after [`finalize`](Self::finalize)).
    pub fn zone_count(&self) -> usize {
        self.zone_start.last().copied().unwrap_or(0)
    }

    pub fn is_finalized(&self) -> bool {
        self.index.is_some()
    }

    /// Borrow `fragment` into the grouping. The field must exist and agree in
    /// component count with fragments added earlier.
    pub fn add_fragment(&mut self, fragment: &'a MeshFragment) -> Result<(), CmfeError> {
        self.push_fragment(Cow::Borrowed(fragment))
    }

    pub fn add_owned_fragment(&mut self, fragment: MeshFragment) -> Result<(), CmfeError> {
        self.push_fragment(Cow::Owned(fragment))
    }

    fn push_fragment(&mut self, fragment: Cow<'a, MeshFragment>) -> Result<(), CmfeError> {
        let idx = fragment
            .fields()
            .iter()
            .position(|f| f.name == self.field_name)
            .ok_or_else(|| CmfeError::FieldNotFound(self.field_name.clone()))?;
        let found = fragment.fields()[idx].components;
        match self.components {
            Some(expected) if expected != found => {
                return Err(CmfeError::ComponentMismatch { expected, found });
            }
            _ => self.components = Some(found),
        }
        self.fragments.push(fragment);
        self.field_index.push(idx);
        self.index = None;
        Ok(())
    }

    /// Build the cell index. Idempotent; an empty grouping finds nothing.
    pub fn finalize(&mut self) {
        if self.index.is_some() {
            return;
        }
        self.zone_start.clear();
        self.zone_start.push(0);
        self.cell_bounds.clear();
        for frag in &self.fragments {
            let n = frag.cell_count();
            self.cell_bounds.extend((0..n).map(|c| frag.cell_bounds(c)));
            self.zone_start.push(self.cell_bounds.len());
        }
        self.index = Some(IntervalIndex::from_boxes(&self.cell_bounds));
        self.generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "lookup `{}`: {} fragments, {} zones",
            self.field_name,
            self.fragments.len(),
            self.zone_count()
        );
        debug_invariants!(self.validate_invariants(), "LookupGrouping::finalize");
    }

    /// Union of all cell boxes (empty before [`finalize`](Self::finalize)).
    pub fn bounds(&self) -> BoundingBox {
        self.index
            .as_ref()
            .map(IntervalIndex::bounds)
            .unwrap_or_else(BoundingBox::empty)
    }

    #[inline]
    fn zone_location(&self, z: usize) -> (usize, usize) {
        let f = self.zone_start[..self.fragments.len()].partition_point(|&s| s <= z) - 1;
        (f, z - self.zone_start[f])
    }

    /// Evaluate the field in zone `z` at `p` if the cell contains `p`.
    fn evaluate_zone(&self, z: usize, p: [f64; 3], out: &mut [f64]) -> bool {
        let (f, local) = self.zone_location(z);
        let frag = &self.fragments[f];
        let field = &frag.fields()[self.field_index[f]];
        let mut nodes = Vec::with_capacity(8);
        let mut verts = Vec::with_capacity(8);
        let cell_type = frag.cell_vertices(local, &mut nodes, &mut verts);
        let Some(weights) = shape::locate(cell_type, &verts, p) else {
            return false;
        };
        let out = &mut out[..field.components];
        match field.centering {
            Centering::Zonal => out.copy_from_slice(field.tuple(local)),
            Centering::Nodal => {
                out.fill(0.0);
                for (w, &n) in weights.iter().zip(&nodes) {
                    for (o, v) in out.iter_mut().zip(field.tuple(n)) {
                        *o += w * v;
                    }
                }
            }
        }
        true
    }

    fn full_search(&self, p: [f64; 3], out: &mut [f64]) -> Option<usize> {
        let index = self.index.as_ref()?;
        index
            .find_containing(p)
            .into_iter()
            .find(|&z| self.evaluate_zone(z, p, out))
    }

    /// Evaluate the field at `p` into `out[..components]`.
    ///
    /// Returns `false` if no cell contains `p`, or before
    /// [`finalize`](Self::finalize).
    pub fn get_value(&self, p: [f64; 3], out: &mut [f64]) -> bool {
        self.full_search(p, out).is_some()
    }

    /// [`get_value`](Self::get_value), trying the cells in `list` first and
    /// refreshing `list` after a full search succeeds.
    pub fn get_value_using_list(
        &self,
        list: &mut CandidateList,
        p: [f64; 3],
        out: &mut [f64],
    ) -> bool {
        if list.generation == self.generation && list.region.contains_point(p) {
            for &z in &list.cells {
                if self.cell_bounds[z].contains_point(p) && self.evaluate_zone(z, p, out) {
                    return true;
                }
            }
        }
        let Some(z) = self.full_search(p, out) else {
            return false;
        };
        if let Some(index) = &self.index {
            list.region = self.cell_bounds[z];
            index.find_overlapping_into(&list.region, &mut list.cells);
            list.generation = self.generation;
        }
        true
    }

    /// Collective: send every cell to all workers whose region it overlaps and
    /// replace this grouping with the cells received.
    ///
    /// Received cells are ordered by (source rank, source zone id), so the
    /// lowest-zone tie-break stays deterministic.
    pub fn relocate_using_partition<C: Communicator>(
        &mut self,
        partition: &SpatialPartition,
        comm: &C,
        tag: CommTag,
    ) -> Result<(), CmfeError> {
        if !self.is_finalized() {
            return Err(CmfeError::InvalidState("lookup grouping is not finalized"));
        }
        if partition.worker_count() != comm.size() {
            return Err(CmfeError::PartitionMismatch {
                expected: partition.worker_count(),
                found: comm.size(),
            });
        }
        let size = comm.size();
        let nc = self.components.unwrap_or(0);
        let components = WireCount::new(nc)?;
        let mut writers: Vec<Option<WireWriter>> = (0..size).map(|_| None).collect();
        let mut targets = Vec::new();
        let mut nodes = Vec::with_capacity(8);
        let mut verts = Vec::with_capacity(8);
        let mut coords = Vec::with_capacity(24);
        let mut sent = 0usize;
        for z in 0..self.zone_count() {
            partition.get_processor_list(&self.cell_bounds[z], &mut targets);
            if targets.is_empty() {
                continue;
            }
            let (f, local) = self.zone_location(z);
            let frag = &self.fragments[f];
            let field = &frag.fields()[self.field_index[f]];
            let cell_type = frag.cell_vertices(local, &mut nodes, &mut verts);
            coords.clear();
            coords.extend(verts.iter().flatten());
            let hdr = WireCellHeader::new(
                cell_type.to_wire(),
                field.centering.to_wire(),
                nodes.len(),
            );
            for &r in &targets {
                let w = writers[r].get_or_insert_with(|| {
                    let mut w = WireWriter::new(kind::CELLS);
                    w.put(&components);
                    w
                });
                w.put(&hdr);
                w.put_f64s(&coords);
                match field.centering {
                    Centering::Zonal => w.put_f64s(field.tuple(local)),
                    Centering::Nodal => {
                        for &n in &nodes {
                            w.put_f64s(field.tuple(n));
                        }
                    }
                }
                sent += 1;
            }
        }
        let outgoing = writers
            .into_iter()
            .map(|w| w.map(WireWriter::finish).unwrap_or_default())
            .collect();

        let incoming = comm.all_to_all(tag, outgoing)?;

        let mut builder = FragmentBuilder::new(&self.field_name);
        for bytes in &incoming {
            if bytes.is_empty() {
                continue;
            }
            let mut r = WireReader::open(bytes, kind::CELLS)?;
            let found = r.read::<WireCount>()?.get();
            builder.set_components(found)?;
            while !r.is_empty() {
                let hdr: WireCellHeader = r.read()?;
                let cell_type = CellType::from_wire(hdr.cell_type)?;
                let centering = Centering::from_wire(hdr.centering)?;
                let n = hdr.n_nodes();
                if n != cell_type.vertex_count() {
                    return Err(CmfeError::WireFormat(format!(
                        "{cell_type:?} cell with {n} nodes"
                    )));
                }
                builder.push_cell(&mut r, cell_type, centering, n)?;
            }
        }
        let (components, fragments) = builder.finish()?;
        log::debug!(
            "rank {}: shipped {sent} cell copies, received {} fragments",
            comm.rank(),
            fragments.len()
        );

        self.fragments.clear();
        self.field_index.clear();
        if components.is_some() {
            self.components = components;
        }
        for frag in fragments {
            self.fragments.push(Cow::Owned(frag));
            self.field_index.push(0);
        }
        self.index = None;
        self.finalize();
        Ok(())
    }
}

/// Accumulates received cells into unstructured fragments, starting a new
/// fragment whenever the centering changes so cell order is preserved.
struct FragmentBuilder<'n> {
    field_name: &'n str,
    components: Option<usize>,
    centering: Option<Centering>,
    points: Vec<[f64; 3]>,
    cells: Vec<Cell>,
    values: Vec<f64>,
    done: Vec<MeshFragment>,
}

impl<'n> FragmentBuilder<'n> {
    fn new(field_name: &'n str) -> Self {
        Self {
            field_name,
            components: None,
            centering: None,
            points: Vec::new(),
            cells: Vec::new(),
            values: Vec::new(),
            done: Vec::new(),
        }
    }

    fn set_components(&mut self, nc: usize) -> Result<(), CmfeError> {
        match self.components {
            Some(expected) if expected != nc => Err(CmfeError::ComponentMismatch {
                expected,
                found: nc,
            }),
            _ => {
                self.components = Some(nc);
                Ok(())
            }
        }
    }

    fn push_cell(
        &mut self,
        r: &mut WireReader<'_>,
        cell_type: CellType,
        centering: Centering,
        n: usize,
    ) -> Result<(), CmfeError> {
        if self.centering != Some(centering) {
            self.flush()?;
            self.centering = Some(centering);
        }
        let nc = self.components.unwrap_or(0);
        let mut xyz = Vec::with_capacity(3 * n);
        r.read_f64s(3 * n, &mut xyz)?;
        let first = self.points.len();
        self.points
            .extend(xyz.chunks_exact(3).map(|c| [c[0], c[1], c[2]]));
        self.cells
            .push(Cell::new(cell_type, (first..first + n).collect()));
        let n_values = match centering {
            Centering::Nodal => n * nc,
            Centering::Zonal => nc,
        };
        r.read_f64s(n_values, &mut self.values)
    }

    fn flush(&mut self) -> Result<(), CmfeError> {
        let Some(centering) = self.centering.take() else {
            return Ok(());
        };
        if self.cells.is_empty() {
            return Ok(());
        }
        let frag = MeshFragment::unstructured(
            std::mem::take(&mut self.points),
            std::mem::take(&mut self.cells),
        )?
        .with_field(Field::new(
            self.field_name,
            centering,
            self.components.unwrap_or(0),
            std::mem::take(&mut self.values),
        ))?;
        self.done.push(frag);
        Ok(())
    }

    fn finish(mut self) -> Result<(Option<usize>, Vec<MeshFragment>), CmfeError> {
        self.flush()?;
        Ok((self.components, self.done))
    }
}

impl LoadSource for LookupGrouping<'_> {
    fn accumulate_load(&self, region: &BoundingBox, axis: usize, bins: &mut [u64]) {
        let (lo, hi) = (region.min[axis], region.max[axis]);
        for b in &self.cell_bounds {
            let c = b.center();
            if region.contains_point(c) {
                bins[bin_of(c[axis], lo, hi, bins.len())] += 1;
            }
        }
    }
}

impl DebugInvariants for LookupGrouping<'_> {
    fn debug_assert_invariants(&self) {
        debug_invariants!(self.validate_invariants(), "LookupGrouping");
    }

    fn validate_invariants(&self) -> Result<(), CmfeError> {
        if self.fragments.len() != self.field_index.len() {
            return Err(CmfeError::InvalidState(
                "field index table does not match fragments",
            ));
        }
        let Some(index) = &self.index else {
            return Ok(());
        };
        if self.zone_start.len() != self.fragments.len() + 1 {
            return Err(CmfeError::InvalidState(
                "zone offsets do not match fragment count",
            ));
        }
        for (f, frag) in self.fragments.iter().enumerate() {
            if self.zone_start[f + 1] != self.zone_start[f] + frag.cell_count() {
                return Err(CmfeError::InvalidState(
                    "zone offsets inconsistent with cell counts",
                ));
            }
        }
        if self.cell_bounds.len() != self.zone_count() || index.len() > self.zone_count() {
            return Err(CmfeError::InvalidState("cell index out of sync with zones"));
        }
        Ok(())
    }
}
