//! Mesh fragments: one worker-local piece of a mesh plus its field arrays.
//!
//! A fragment is either
//! - **rectilinear**: three non-decreasing coordinate axes, nodes at their tensor product;
//! - **curvilinear**: structured node dimensions with explicit node coordinates;
//! - **unstructured**: explicit nodes and explicit cells of any [`CellType`].
//!
//! Structured fragments have implicit cells. Their node (and cell) numbering runs
//! `i + j*nx + k*nx*ny` with `i` fastest. The cell type follows the number of
//! axes with more than one node: hexahedra in 3-D, quadrilaterals in 2-D and
//! segments in 1-D. A single-node grid has no cells.

use crate::geometry::bounds::BoundingBox;
use crate::geometry::shape::CellType;
use crate::mesh_error::CmfeError;
use serde::{Deserialize, Serialize};

/// Where field values live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Centering {
    /// One tuple per node.
    Nodal,
    /// One tuple per cell (zone).
    Zonal,
}

impl Centering {
    pub const fn to_wire(self) -> u8 {
        match self {
            Centering::Nodal => 0,
            Centering::Zonal => 1,
        }
    }

    pub fn from_wire(code: u8) -> Result<Self, CmfeError> {
        match code {
            0 => Ok(Centering::Nodal),
            1 => Ok(Centering::Zonal),
            other => Err(CmfeError::WireFormat(format!(
                "unknown centering code {other}"
            ))),
        }
    }
}

/// A named field array: `components` values per node or cell, interleaved.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub centering: Centering,
    pub components: usize,
    pub values: Vec<f64>,
}

impl Field {
    pub fn new(
        name: impl Into<String>,
        centering: Centering,
        components: usize,
        values: Vec<f64>,
    ) -> Self {
        Self {
            name: name.into(),
            centering,
            components,
            values,
        }
    }

    /// Number of tuples (nodes or cells) stored.
    pub fn tuple_count(&self) -> usize {
        if self.components == 0 {
            0
        } else {
            self.values.len() / self.components
        }
    }

    #[inline]
    pub fn tuple(&self, i: usize) -> &[f64] {
        &self.values[i * self.components..(i + 1) * self.components]
    }
}

/// Explicit cell of an unstructured fragment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub cell_type: CellType,
    pub nodes: Vec<usize>,
}

impl Cell {
    pub fn new(cell_type: CellType, nodes: Vec<usize>) -> Self {
        Self { cell_type, nodes }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FragmentGeometry {
    Rectilinear { axes: [Vec<f64>; 3] },
    Curvilinear { dims: [usize; 3], points: Vec<[f64; 3]> },
    Unstructured { points: Vec<[f64; 3]>, cells: Vec<Cell> },
}

#[derive(Clone, Debug)]
pub struct MeshFragment {
    geometry: FragmentGeometry,
    fields: Vec<Field>,
}

const HEX_PATTERN: [[usize; 3]; 8] = [
    [0, 0, 0],
    [1, 0, 0],
    [1, 1, 0],
    [0, 1, 0],
    [0, 0, 1],
    [1, 0, 1],
    [1, 1, 1],
    [0, 1, 1],
];

/// Cells per axis of a structured grid with node dimensions `dims`.
pub fn structured_cell_dims(dims: [usize; 3]) -> [usize; 3] {
    dims.map(|n| if n > 1 { n - 1 } else { 1 })
}

fn topological_dimension(dims: [usize; 3]) -> usize {
    dims.iter().filter(|&&n| n > 1).count()
}

fn structured_cell_count(dims: [usize; 3]) -> usize {
    if topological_dimension(dims) == 0 {
        return 0;
    }
    structured_cell_dims(dims).iter().product()
}

fn structured_cell_type(dims: [usize; 3]) -> CellType {
    match topological_dimension(dims) {
        1 => CellType::Segment,
        2 => CellType::Quadrilateral,
        _ => CellType::Hexahedron,
    }
}

fn structured_cell_nodes(dims: [usize; 3], cell: usize, out: &mut Vec<usize>) -> CellType {
    let cdims = structured_cell_dims(dims);
    let ijk = [
        cell % cdims[0],
        (cell / cdims[0]) % cdims[1],
        cell / (cdims[0] * cdims[1]),
    ];
    let mut active = [0usize; 3];
    let mut n_active = 0;
    for axis in 0..3 {
        if dims[axis] > 1 {
            active[n_active] = axis;
            n_active += 1;
        }
    }
    let cell_type = structured_cell_type(dims);
    out.clear();
    for offs in &HEX_PATTERN[..cell_type.vertex_count()] {
        let mut n = ijk;
        for (k, &axis) in active[..n_active].iter().enumerate() {
            n[axis] += offs[k];
        }
        out.push(n[0] + n[1] * dims[0] + n[2] * dims[0] * dims[1]);
    }
    cell_type
}

impl MeshFragment {
    /// Rectilinear grid from three coordinate axes. Lower-dimensional grids
    /// use single-entry axes.
    pub fn rectilinear(x: Vec<f64>, y: Vec<f64>, z: Vec<f64>) -> Result<Self, CmfeError> {
        for (name, axis) in [("x", &x), ("y", &y), ("z", &z)] {
            if axis.is_empty() {
                return Err(CmfeError::InvalidFragment(format!("{name} axis is empty")));
            }
            if axis.iter().any(|v| !v.is_finite()) {
                return Err(CmfeError::InvalidFragment(format!(
                    "{name} axis has non-finite coordinates"
                )));
            }
            if axis.windows(2).any(|w| w[1] < w[0]) {
                return Err(CmfeError::InvalidFragment(format!(
                    "{name} axis is not non-decreasing"
                )));
            }
        }
        Ok(Self {
            geometry: FragmentGeometry::Rectilinear { axes: [x, y, z] },
            fields: Vec::new(),
        })
    }

    /// Structured grid with explicit node coordinates, `i` fastest.
    pub fn curvilinear(dims: [usize; 3], points: Vec<[f64; 3]>) -> Result<Self, CmfeError> {
        if dims.contains(&0) {
            return Err(CmfeError::InvalidFragment(format!(
                "curvilinear dims {dims:?} contain a zero"
            )));
        }
        let expected: usize = dims.iter().product();
        if points.len() != expected {
            return Err(CmfeError::InvalidFragment(format!(
                "curvilinear dims {dims:?} need {expected} points, got {}",
                points.len()
            )));
        }
        Ok(Self {
            geometry: FragmentGeometry::Curvilinear { dims, points },
            fields: Vec::new(),
        })
    }

    pub fn unstructured(points: Vec<[f64; 3]>, cells: Vec<Cell>) -> Result<Self, CmfeError> {
        for (c, cell) in cells.iter().enumerate() {
            if cell.nodes.len() != cell.cell_type.vertex_count() {
                return Err(CmfeError::InvalidFragment(format!(
                    "cell {c} ({:?}) has {} nodes, expected {}",
                    cell.cell_type,
                    cell.nodes.len(),
                    cell.cell_type.vertex_count()
                )));
            }
            if let Some(&bad) = cell.nodes.iter().find(|&&n| n >= points.len()) {
                return Err(CmfeError::IndexOutOfBounds {
                    index: bad,
                    len: points.len(),
                });
            }
        }
        Ok(Self {
            geometry: FragmentGeometry::Unstructured { points, cells },
            fields: Vec::new(),
        })
    }

    pub fn with_field(mut self, field: Field) -> Result<Self, CmfeError> {
        self.add_field(field)?;
        Ok(self)
    }

    /// Attach a field; its length must match the node or cell count.
    pub fn add_field(&mut self, field: Field) -> Result<(), CmfeError> {
        if field.components == 0 {
            return Err(CmfeError::InvalidFragment(format!(
                "field `{}` has zero components",
                field.name
            )));
        }
        let tuples = match field.centering {
            Centering::Nodal => self.node_count(),
            Centering::Zonal => self.cell_count(),
        };
        if field.values.len() != tuples * field.components {
            return Err(CmfeError::InvalidFragment(format!(
                "field `{}` has {} values, expected {} ({} x {})",
                field.name,
                field.values.len(),
                tuples * field.components,
                tuples,
                field.components
            )));
        }
        if self.fields.iter().any(|f| f.name == field.name) {
            return Err(CmfeError::InvalidFragment(format!(
                "duplicate field `{}`",
                field.name
            )));
        }
        self.fields.push(field);
        Ok(())
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn geometry(&self) -> &FragmentGeometry {
        &self.geometry
    }

    pub fn is_rectilinear(&self) -> bool {
        matches!(self.geometry, FragmentGeometry::Rectilinear { .. })
    }

    pub fn rectilinear_axes(&self) -> Option<&[Vec<f64>; 3]> {
        match &self.geometry {
            FragmentGeometry::Rectilinear { axes } => Some(axes),
            _ => None,
        }
    }

    /// Node dimensions of a structured fragment.
    pub fn structured_dims(&self) -> Option<[usize; 3]> {
        match &self.geometry {
            FragmentGeometry::Rectilinear { axes } => {
                Some([axes[0].len(), axes[1].len(), axes[2].len()])
            }
            FragmentGeometry::Curvilinear { dims, .. } => Some(*dims),
            FragmentGeometry::Unstructured { .. } => None,
        }
    }

    pub fn node_count(&self) -> usize {
        match &self.geometry {
            FragmentGeometry::Rectilinear { axes } => axes.iter().map(Vec::len).product(),
            FragmentGeometry::Curvilinear { points, .. }
            | FragmentGeometry::Unstructured { points, .. } => points.len(),
        }
    }

    pub fn cell_count(&self) -> usize {
        match &self.geometry {
            FragmentGeometry::Unstructured { cells, .. } => cells.len(),
            _ => self.structured_dims().map_or(0, structured_cell_count),
        }
    }

    /// Number of query points for `centering`.
    pub fn point_count(&self, centering: Centering) -> usize {
        match centering {
            Centering::Nodal => self.node_count(),
            Centering::Zonal => self.cell_count(),
        }
    }

    #[inline]
    pub fn node(&self, i: usize) -> [f64; 3] {
        match &self.geometry {
            FragmentGeometry::Rectilinear { axes } => {
                let nx = axes[0].len();
                let ny = axes[1].len();
                [axes[0][i % nx], axes[1][(i / nx) % ny], axes[2][i / (nx * ny)]]
            }
            FragmentGeometry::Curvilinear { points, .. }
            | FragmentGeometry::Unstructured { points, .. } => points[i],
        }
    }

    /// Node ids of cell `c` in reference order; returns the cell type.
    pub fn cell_nodes(&self, c: usize, out: &mut Vec<usize>) -> CellType {
        match &self.geometry {
            FragmentGeometry::Unstructured { cells, .. } => {
                out.clear();
                out.extend_from_slice(&cells[c].nodes);
                cells[c].cell_type
            }
            FragmentGeometry::Rectilinear { axes } => structured_cell_nodes(
                [axes[0].len(), axes[1].len(), axes[2].len()],
                c,
                out,
            ),
            FragmentGeometry::Curvilinear { dims, .. } => structured_cell_nodes(*dims, c, out),
        }
    }

    /// Vertex coordinates of cell `c`; `nodes` is scratch space.
    pub fn cell_vertices(
        &self,
        c: usize,
        nodes: &mut Vec<usize>,
        out: &mut Vec<[f64; 3]>,
    ) -> CellType {
        let cell_type = self.cell_nodes(c, nodes);
        out.clear();
        out.extend(nodes.iter().map(|&n| self.node(n)));
        cell_type
    }

    /// Cell centre: vertex average, or axis midpoints on rectilinear grids.
    pub fn cell_center(&self, c: usize) -> [f64; 3] {
        if let FragmentGeometry::Rectilinear { axes } = &self.geometry {
            let dims = [axes[0].len(), axes[1].len(), axes[2].len()];
            let cdims = structured_cell_dims(dims);
            let ijk = [
                c % cdims[0],
                (c / cdims[0]) % cdims[1],
                c / (cdims[0] * cdims[1]),
            ];
            return [0, 1, 2].map(|d| axis_center(&axes[d], ijk[d]));
        }
        let mut nodes = Vec::with_capacity(8);
        self.cell_nodes(c, &mut nodes);
        let mut sum = [0.0; 3];
        for &n in &nodes {
            let p = self.node(n);
            for d in 0..3 {
                sum[d] += p[d];
            }
        }
        let inv = 1.0 / nodes.len() as f64;
        sum.map(|s| s * inv)
    }

    pub fn cell_bounds(&self, c: usize) -> BoundingBox {
        let mut nodes = Vec::with_capacity(8);
        self.cell_nodes(c, &mut nodes);
        let mut b = BoundingBox::empty();
        for &n in &nodes {
            b.join_point(self.node(n));
        }
        b
    }

    /// Bounds of all nodes.
    pub fn bounds(&self) -> BoundingBox {
        match &self.geometry {
            FragmentGeometry::Rectilinear { axes } => {
                let mut b = BoundingBox::empty();
                for d in 0..3 {
                    b.min[d] = axes[d][0];
                    b.max[d] = axes[d][axes[d].len() - 1];
                }
                b
            }
            FragmentGeometry::Curvilinear { points, .. }
            | FragmentGeometry::Unstructured { points, .. } => BoundingBox::from_points(points),
        }
    }
}

/// Centre of cell `i` along one rectilinear axis; a single-node axis is its own centre.
pub fn axis_center(axis: &[f64], i: usize) -> f64 {
    if axis.len() > 1 {
        0.5 * (axis[i] + axis[i + 1])
    } else {
        axis[0]
    }
}

/// Zonal query axes of a rectilinear grid: the cell centres along each axis.
pub fn zonal_axes(axes: &[Vec<f64>; 3]) -> [Vec<f64>; 3] {
    let dims = [axes[0].len(), axes[1].len(), axes[2].len()];
    if structured_cell_count(dims) == 0 {
        return [Vec::new(), Vec::new(), Vec::new()];
    }
    let cdims = structured_cell_dims(dims);
    [0, 1, 2].map(|d| (0..cdims[d]).map(|i| axis_center(&axes[d], i)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rectilinear_counts_and_numbering() {
        let f = MeshFragment::rectilinear(vec![0.0, 1.0, 2.0], vec![0.0, 1.0], vec![0.0]).unwrap();
        assert_eq!(f.node_count(), 6);
        assert_eq!(f.cell_count(), 2);
        assert_eq!(f.node(4), [1.0, 1.0, 0.0]);
        let mut nodes = Vec::new();
        assert_eq!(f.cell_nodes(1, &mut nodes), CellType::Quadrilateral);
        assert_eq!(nodes, vec![1, 2, 5, 4]);
        assert_eq!(f.cell_center(1), [1.5, 0.5, 0.0]);
        assert_eq!(f.bounds(), BoundingBox::new([0.0; 3], [2.0, 1.0, 0.0]));
    }

    #[test]
    fn hex_cells_follow_reference_order() {
        let f = MeshFragment::rectilinear(vec![0.0, 1.0], vec![0.0, 1.0], vec![0.0, 1.0]).unwrap();
        let mut nodes = Vec::new();
        assert_eq!(f.cell_nodes(0, &mut nodes), CellType::Hexahedron);
        assert_eq!(nodes, vec![0, 1, 3, 2, 4, 5, 7, 6]);
    }

    #[test]
    fn line_along_y_is_segments() {
        let f = MeshFragment::rectilinear(vec![0.5], vec![0.0, 1.0, 3.0], vec![0.0]).unwrap();
        assert_eq!(f.cell_count(), 2);
        let mut nodes = Vec::new();
        assert_eq!(f.cell_nodes(1, &mut nodes), CellType::Segment);
        assert_eq!(nodes, vec![1, 2]);
        assert_eq!(zonal_axes(f.rectilinear_axes().unwrap())[1], vec![0.5, 2.0]);
    }

    #[test]
    fn single_node_grid_has_no_cells() {
        let f = MeshFragment::rectilinear(vec![1.0], vec![2.0], vec![3.0]).unwrap();
        assert_eq!(f.cell_count(), 0);
        assert!(zonal_axes(f.rectilinear_axes().unwrap())[0].is_empty());
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        assert!(MeshFragment::rectilinear(vec![1.0, 0.0], vec![0.0], vec![0.0]).is_err());
        assert!(MeshFragment::rectilinear(vec![], vec![0.0], vec![0.0]).is_err());
        assert!(MeshFragment::curvilinear([2, 2, 1], vec![[0.0; 3]; 3]).is_err());
        let tri = Cell::new(CellType::Triangle, vec![0, 1, 5]);
        assert!(matches!(
            MeshFragment::unstructured(vec![[0.0; 3]; 3], vec![tri]),
            Err(CmfeError::IndexOutOfBounds { index: 5, len: 3 })
        ));
    }

    #[test]
    fn field_length_is_validated() {
        let f = MeshFragment::rectilinear(vec![0.0, 1.0], vec![0.0, 1.0], vec![0.0]).unwrap();
        let bad = Field::new("u", Centering::Nodal, 2, vec![0.0; 4]);
        assert!(f.clone().with_field(bad).is_err());
        let good = Field::new("u", Centering::Zonal, 3, vec![1.0, 2.0, 3.0]);
        let f = f.with_field(good).unwrap();
        assert_eq!(f.field("u").unwrap().tuple(0), &[1.0, 2.0, 3.0]);
        assert!(f.field("v").is_none());
    }
}
