//! Fixed, versioned, little-endian wire types for the evaluation exchanges.
//!
//! Every non-empty message starts with a [`WireHdr`] naming its kind, followed by
//! a kind-specific sequence of `Pod` records and raw `f64` runs. Floating point
//! values travel as their IEEE-754 bit patterns, so coordinates and field values
//! arrive bit-identical.

use crate::mesh_error::CmfeError;
use bytemuck::{Pod, Zeroable};
use bytes::{Buf, BufMut, BytesMut};
use static_assertions::const_assert_eq;
use std::mem::size_of;

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

pub fn cast_slice_mut<T: Pod>(v: &mut [T]) -> &mut [u8] {
    bytemuck::cast_slice_mut(v)
}

/// Bump when the layout or semantics change in incompatible ways.
pub const WIRE_VERSION: u16 = 1;

/// Message kinds carried in [`WireHdr::kind`].
pub mod kind {
    pub const POINTS: u16 = 1;
    pub const CELLS: u16 = 2;
    pub const VALUES: u16 = 3;
    pub const SUMMARY: u16 = 4;
    pub const HISTOGRAM: u16 = 5;
    pub const RETRY: u16 = 6;
}

#[inline]
fn f64_le(x: f64) -> u64 {
    x.to_bits().to_le()
}

#[inline]
fn f64_from_le(bits: u64) -> f64 {
    f64::from_bits(u64::from_le(bits))
}

#[inline]
fn xyz_le(p: [f64; 3]) -> [u64; 3] {
    [f64_le(p[0]), f64_le(p[1]), f64_le(p[2])]
}

#[inline]
fn xyz_from_le(bits: [u64; 3]) -> [f64; 3] {
    [f64_from_le(bits[0]), f64_from_le(bits[1]), f64_from_le(bits[2])]
}

#[inline]
fn u64x3_le(v: [usize; 3]) -> [u64; 3] {
    [(v[0] as u64).to_le(), (v[1] as u64).to_le(), (v[2] as u64).to_le()]
}

#[inline]
fn u64x3_from_le(v: [u64; 3]) -> [usize; 3] {
    [
        u64::from_le(v[0]) as usize,
        u64::from_le(v[1]) as usize,
        u64::from_le(v[2]) as usize,
    ]
}

// ===== Common records ======================================================

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireHdr {
    pub version_le: u16,
    pub kind_le: u16,
    pub reserved_le: u32, // keep zero
}

impl WireHdr {
    pub fn new(kind: u16) -> Self {
        Self {
            version_le: WIRE_VERSION.to_le(),
            kind_le: kind.to_le(),
            reserved_le: 0,
        }
    }
    pub fn kind(&self) -> u16 {
        u16::from_le(self.kind_le)
    }
    pub fn version(&self) -> u16 {
        u16::from_le(self.version_le)
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u32, // count of following records
}

impl WireCount {
    pub fn new(n: usize) -> Result<Self, CmfeError> {
        let n = u32::try_from(n)
            .map_err(|_| CmfeError::WireFormat(format!("record count {n} exceeds u32")))?;
        Ok(Self { n_le: n.to_le() })
    }
    pub fn get(&self) -> usize {
        u32::from_le(self.n_le) as usize
    }
}

/// Byte length (or bin count) exchanged ahead of a payload.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireLen {
    pub n_le: u64,
}

impl WireLen {
    pub fn new(n: usize) -> Self {
        Self {
            n_le: (n as u64).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u64::from_le(self.n_le) as usize
    }
}

// ===== Partition construction =============================================

/// Per-worker summary all-gathered at the start of partitioning.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireWorkerSummary {
    pub min_bits_le: [u64; 3],
    pub max_bits_le: [u64; 3],
    pub points_le: u64,
    pub cells_le: u64,
    pub components_le: u32,
    pub flags_le: u32,
}

impl WireWorkerSummary {
    /// This worker hit a local error and will not take part in the exchanges.
    pub const ABORTED: u32 = 1;
    /// This worker holds at least one source fragment carrying the field.
    pub const HAS_SOURCE: u32 = 2;

    pub fn new(
        min: [f64; 3],
        max: [f64; 3],
        points: usize,
        cells: usize,
        components: usize,
        flags: u32,
    ) -> Self {
        Self {
            min_bits_le: xyz_le(min),
            max_bits_le: xyz_le(max),
            points_le: (points as u64).to_le(),
            cells_le: (cells as u64).to_le(),
            components_le: (components as u32).to_le(),
            flags_le: flags.to_le(),
        }
    }
    pub fn min(&self) -> [f64; 3] {
        xyz_from_le(self.min_bits_le)
    }
    pub fn max(&self) -> [f64; 3] {
        xyz_from_le(self.max_bits_le)
    }
    pub fn points(&self) -> usize {
        u64::from_le(self.points_le) as usize
    }
    pub fn cells(&self) -> usize {
        u64::from_le(self.cells_le) as usize
    }
    pub fn components(&self) -> usize {
        u32::from_le(self.components_le) as usize
    }
    pub fn flags(&self) -> u32 {
        u32::from_le(self.flags_le)
    }
    pub fn has(&self, flag: u32) -> bool {
        self.flags() & flag != 0
    }
}

// ===== Point relocation ===================================================

/// One relocated list point, tagged with its native `(rank, index)`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WirePointRecord {
    pub rank_le: u32,
    pub _pad: u32,
    pub index_le: u64,
    pub xyz_bits_le: [u64; 3],
}

impl WirePointRecord {
    pub fn new(rank: usize, index: usize, xyz: [f64; 3]) -> Self {
        Self {
            rank_le: (rank as u32).to_le(),
            _pad: 0,
            index_le: (index as u64).to_le(),
            xyz_bits_le: xyz_le(xyz),
        }
    }
    pub fn rank(&self) -> usize {
        u32::from_le(self.rank_le) as usize
    }
    pub fn index(&self) -> usize {
        u64::from_le(self.index_le) as usize
    }
    pub fn xyz(&self) -> [f64; 3] {
        xyz_from_le(self.xyz_bits_le)
    }
}

/// Header of a rectilinear sub-block; followed by `dims[0] + dims[1] + dims[2]`
/// axis coordinates.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireRGridHeader {
    pub rank_le: u32,
    pub _pad: u32,
    pub base_le: u64,
    pub full_dims_le: [u64; 3],
    pub start_le: [u64; 3],
    pub dims_le: [u64; 3],
}

impl WireRGridHeader {
    pub fn new(
        rank: usize,
        base: usize,
        full_dims: [usize; 3],
        start: [usize; 3],
        dims: [usize; 3],
    ) -> Self {
        Self {
            rank_le: (rank as u32).to_le(),
            _pad: 0,
            base_le: (base as u64).to_le(),
            full_dims_le: u64x3_le(full_dims),
            start_le: u64x3_le(start),
            dims_le: u64x3_le(dims),
        }
    }
    pub fn rank(&self) -> usize {
        u32::from_le(self.rank_le) as usize
    }
    pub fn base(&self) -> usize {
        u64::from_le(self.base_le) as usize
    }
    pub fn full_dims(&self) -> [usize; 3] {
        u64x3_from_le(self.full_dims_le)
    }
    pub fn start(&self) -> [usize; 3] {
        u64x3_from_le(self.start_le)
    }
    pub fn dims(&self) -> [usize; 3] {
        u64x3_from_le(self.dims_le)
    }
}

/// Header of one evaluated value; followed by `components` f64s.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireValueHeader {
    pub rank_le: u32,
    pub valid_le: u32,
    pub index_le: u64,
}

impl WireValueHeader {
    pub fn new(rank: usize, index: usize, valid: bool) -> Self {
        Self {
            rank_le: (rank as u32).to_le(),
            valid_le: (valid as u32).to_le(),
            index_le: (index as u64).to_le(),
        }
    }
    pub fn rank(&self) -> usize {
        u32::from_le(self.rank_le) as usize
    }
    pub fn index(&self) -> usize {
        u64::from_le(self.index_le) as usize
    }
    pub fn valid(&self) -> bool {
        u32::from_le(self.valid_le) != 0
    }
}

// ===== Cell relocation ====================================================

/// Header of one relocated source cell; followed by `3 * n_nodes` coordinates
/// and then the field values (`n_nodes * ncomp` nodal or `ncomp` zonal).
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireCellHeader {
    pub cell_type: u8,
    pub centering: u8,
    pub _pad: u16,
    pub n_nodes_le: u32,
}

impl WireCellHeader {
    pub fn new(cell_type: u8, centering: u8, n_nodes: usize) -> Self {
        Self {
            cell_type,
            centering,
            _pad: 0,
            n_nodes_le: (n_nodes as u32).to_le(),
        }
    }
    pub fn n_nodes(&self) -> usize {
        u32::from_le(self.n_nodes_le) as usize
    }
}

// ===== Compile-time sanity checks =========================================

const_assert_eq!(size_of::<WireHdr>(), 8);
const_assert_eq!(size_of::<WireCount>(), 4);
const_assert_eq!(size_of::<WireLen>(), 8);
const_assert_eq!(size_of::<WireWorkerSummary>(), 72);
const_assert_eq!(size_of::<WirePointRecord>(), 40);
const_assert_eq!(size_of::<WireRGridHeader>(), 88);
const_assert_eq!(size_of::<WireValueHeader>(), 16);
const_assert_eq!(size_of::<WireCellHeader>(), 8);

// ===== Framing ============================================================

/// Append-only message builder.
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new(kind: u16) -> Self {
        let mut w = Self {
            buf: BytesMut::new(),
        };
        w.put(&WireHdr::new(kind));
        w
    }

    pub fn put<T: Pod>(&mut self, rec: &T) {
        self.buf.put_slice(bytemuck::bytes_of(rec));
    }

    pub fn put_f64s(&mut self, values: &[f64]) {
        for &v in values {
            self.buf.put_f64_le(v);
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

/// Cursor over a received message.
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    /// Validate the header of `buf` and position the cursor after it.
    pub fn open(buf: &'a [u8], expected_kind: u16) -> Result<Self, CmfeError> {
        let mut r = Self { buf };
        let hdr: WireHdr = r.read()?;
        if hdr.version() != WIRE_VERSION {
            return Err(CmfeError::WireFormat(format!(
                "unsupported wire version {} (expected {WIRE_VERSION})",
                hdr.version()
            )));
        }
        if hdr.kind() != expected_kind {
            return Err(CmfeError::WireFormat(format!(
                "unexpected message kind {} (expected {expected_kind})",
                hdr.kind()
            )));
        }
        Ok(r)
    }

    pub fn read<T: Pod>(&mut self) -> Result<T, CmfeError> {
        let n = size_of::<T>();
        if self.buf.len() < n {
            return Err(CmfeError::WireFormat(format!(
                "truncated record: need {n} bytes, {} left",
                self.buf.len()
            )));
        }
        let rec = bytemuck::pod_read_unaligned(&self.buf[..n]);
        self.buf = &self.buf[n..];
        Ok(rec)
    }

    /// Append `n` f64s to `out`.
    pub fn read_f64s(&mut self, n: usize, out: &mut Vec<f64>) -> Result<(), CmfeError> {
        let Some(need) = n.checked_mul(size_of::<f64>()) else {
            return Err(CmfeError::WireFormat(format!("value run of {n} overflows")));
        };
        if self.buf.len() < need {
            return Err(CmfeError::WireFormat(format!(
                "truncated value run: need {need} bytes, {} left",
                self.buf.len()
            )));
        }
        out.reserve(n);
        for _ in 0..n {
            out.push(self.buf.get_f64_le());
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
