//! Linear cell shapes: shape functions, forward/inverse maps, point location.
//!
//! The reference elements use the following vertex ordering:
//! - Segment: `[v0, v1]` with `r` in `[0, 1]`.
//! - Triangle: `[v0, v1, v2]` with `(r, s)` in the unit right triangle.
//! - Quadrilateral: `[v0, v1, v2, v3]` (counter-clockwise) with `(r, s)` in `[0, 1]^2`.
//! - Tetrahedron: `[v0, v1, v2, v3]` with `(r, s, t)` in the unit tetrahedron.
//! - Hexahedron: bottom face `[v0..v3]` then top face `[v4..v7]`, `(r, s, t)` in `[0, 1]^3`.
//! - Prism: bottom triangle `[v0, v1, v2]`, top triangle `[v3, v4, v5]`.
//! - Pyramid: base quad `[v0..v3]`, apex `v4` at `t = 1`.
//!
//! Structured grids map node `(i, j, k)` and its `+1` neighbours onto the
//! hexahedron (or quadrilateral, segment) ordering above with `r`, `s`, `t`
//! running along the grid's first, second and third axes.

use crate::mesh_error::CmfeError;
use serde::{Deserialize, Serialize};

const EPS: f64 = 1e-14;
/// Reference-space slack when deciding whether a mapped point is inside.
pub const REFERENCE_TOLERANCE: f64 = 1e-8;
const MAX_NEWTON_ITERS: usize = 25;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CellType {
    Segment,
    Triangle,
    Quadrilateral,
    Tetrahedron,
    Hexahedron,
    Prism,
    Pyramid,
}

impl CellType {
    pub const fn vertex_count(self) -> usize {
        match self {
            CellType::Segment => 2,
            CellType::Triangle => 3,
            CellType::Quadrilateral => 4,
            CellType::Tetrahedron => 4,
            CellType::Hexahedron => 8,
            CellType::Prism => 6,
            CellType::Pyramid => 5,
        }
    }

    /// Reference (topological) dimension.
    pub const fn dimension(self) -> usize {
        match self {
            CellType::Segment => 1,
            CellType::Triangle | CellType::Quadrilateral => 2,
            _ => 3,
        }
    }

    pub const fn to_wire(self) -> u8 {
        match self {
            CellType::Segment => 1,
            CellType::Triangle => 2,
            CellType::Quadrilateral => 3,
            CellType::Tetrahedron => 4,
            CellType::Hexahedron => 5,
            CellType::Prism => 6,
            CellType::Pyramid => 7,
        }
    }

    pub fn from_wire(code: u8) -> Result<Self, CmfeError> {
        Ok(match code {
            1 => CellType::Segment,
            2 => CellType::Triangle,
            3 => CellType::Quadrilateral,
            4 => CellType::Tetrahedron,
            5 => CellType::Hexahedron,
            6 => CellType::Prism,
            7 => CellType::Pyramid,
            other => {
                return Err(CmfeError::WireFormat(format!(
                    "unknown cell type code {other}"
                )));
            }
        })
    }
}

/// Shape function values and reference gradients at `reference_point`.
pub fn shape_functions(
    cell_type: CellType,
    reference_point: &[f64],
) -> Result<(Vec<f64>, Vec<Vec<f64>>), CmfeError> {
    let dim = cell_type.dimension();
    if reference_point.len() != dim {
        return Err(CmfeError::InvalidGeometry(format!(
            "{cell_type:?} reference point must have {dim} components, got {}",
            reference_point.len()
        )));
    }
    let r = reference_point[0];
    let s = reference_point.get(1).copied().unwrap_or(0.0);
    let t = reference_point.get(2).copied().unwrap_or(0.0);
    Ok(match cell_type {
        CellType::Segment => (vec![1.0 - r, r], vec![vec![-1.0], vec![1.0]]),
        CellType::Triangle => (
            vec![1.0 - r - s, r, s],
            vec![vec![-1.0, -1.0], vec![1.0, 0.0], vec![0.0, 1.0]],
        ),
        CellType::Quadrilateral => (
            vec![(1.0 - r) * (1.0 - s), r * (1.0 - s), r * s, (1.0 - r) * s],
            vec![
                vec![-(1.0 - s), -(1.0 - r)],
                vec![1.0 - s, -r],
                vec![s, r],
                vec![-s, 1.0 - r],
            ],
        ),
        CellType::Tetrahedron => (
            vec![1.0 - r - s - t, r, s, t],
            vec![
                vec![-1.0, -1.0, -1.0],
                vec![1.0, 0.0, 0.0],
                vec![0.0, 1.0, 0.0],
                vec![0.0, 0.0, 1.0],
            ],
        ),
        CellType::Hexahedron => {
            let (rm, sm, tm) = (1.0 - r, 1.0 - s, 1.0 - t);
            (
                vec![
                    rm * sm * tm,
                    r * sm * tm,
                    r * s * tm,
                    rm * s * tm,
                    rm * sm * t,
                    r * sm * t,
                    r * s * t,
                    rm * s * t,
                ],
                vec![
                    vec![-sm * tm, -rm * tm, -rm * sm],
                    vec![sm * tm, -r * tm, -r * sm],
                    vec![s * tm, r * tm, -r * s],
                    vec![-s * tm, rm * tm, -rm * s],
                    vec![-sm * t, -rm * t, rm * sm],
                    vec![sm * t, -r * t, r * sm],
                    vec![s * t, r * t, r * s],
                    vec![-s * t, rm * t, rm * s],
                ],
            )
        }
        CellType::Prism => {
            let (rm, tm) = (1.0 - r - s, 1.0 - t);
            (
                vec![rm * tm, r * tm, s * tm, rm * t, r * t, s * t],
                vec![
                    vec![-tm, -tm, -rm],
                    vec![tm, 0.0, -r],
                    vec![0.0, tm, -s],
                    vec![-t, -t, rm],
                    vec![t, 0.0, r],
                    vec![0.0, t, s],
                ],
            )
        }
        CellType::Pyramid => {
            let (rm, sm, tm) = (1.0 - r, 1.0 - s, 1.0 - t);
            (
                vec![tm * rm * sm, tm * r * sm, tm * r * s, tm * rm * s, t],
                vec![
                    vec![-tm * sm, -tm * rm, -rm * sm],
                    vec![tm * sm, -tm * r, -r * sm],
                    vec![tm * s, tm * r, -r * s],
                    vec![-tm * s, tm * rm, -rm * s],
                    vec![0.0, 0.0, 1.0],
                ],
            )
        }
    })
}

fn check_vertex_count(cell_type: CellType, vertices: &[[f64; 3]]) -> Result<(), CmfeError> {
    if vertices.len() != cell_type.vertex_count() {
        return Err(CmfeError::InvalidGeometry(format!(
            "vertex count mismatch for {cell_type:?}: expected {}, got {}",
            cell_type.vertex_count(),
            vertices.len()
        )));
    }
    Ok(())
}

/// Map a point in reference coordinates to physical coordinates.
pub fn reference_to_physical(
    cell_type: CellType,
    vertices: &[[f64; 3]],
    reference_point: &[f64],
) -> Result<[f64; 3], CmfeError> {
    check_vertex_count(cell_type, vertices)?;
    let (weights, _) = shape_functions(cell_type, reference_point)?;
    let mut out = [0.0; 3];
    for (weight, vertex) in weights.iter().zip(vertices) {
        out[0] += weight * vertex[0];
        out[1] += weight * vertex[1];
        out[2] += weight * vertex[2];
    }
    Ok(out)
}

/// Jacobian columns `d x / d r_i` at a reference point.
fn jacobian_columns(
    cell_type: CellType,
    vertices: &[[f64; 3]],
    reference_point: &[f64],
) -> Result<Vec<[f64; 3]>, CmfeError> {
    let (_, grads) = shape_functions(cell_type, reference_point)?;
    let dim = cell_type.dimension();
    let mut cols = vec![[0.0; 3]; dim];
    for (vertex, grad) in vertices.iter().zip(&grads) {
        for (col, g) in cols.iter_mut().zip(grad) {
            col[0] += g * vertex[0];
            col[1] += g * vertex[1];
            col[2] += g * vertex[2];
        }
    }
    Ok(cols)
}

/// Pull a physical vector back into reference space (least squares for
/// cells of lower dimension than the ambient space).
pub fn pull_back_vector(
    cell_type: CellType,
    vertices: &[[f64; 3]],
    reference_point: &[f64],
    physical_vector: &[f64; 3],
) -> Result<Vec<f64>, CmfeError> {
    check_vertex_count(cell_type, vertices)?;
    let cols = jacobian_columns(cell_type, vertices, reference_point)?;
    let degenerate = || CmfeError::InvalidGeometry("degenerate jacobian".into());
    match cols.len() {
        1 => {
            let col = cols[0];
            let denom = dot(col, col);
            if denom.abs() <= EPS {
                return Err(degenerate());
            }
            Ok(vec![dot(col, *physical_vector) / denom])
        }
        2 => {
            let a = dot(cols[0], cols[0]);
            let b = dot(cols[0], cols[1]);
            let c = dot(cols[1], cols[1]);
            let det = a * c - b * b;
            if det.abs() <= EPS * (a * c).max(EPS) {
                return Err(degenerate());
            }
            let rhs0 = dot(cols[0], *physical_vector);
            let rhs1 = dot(cols[1], *physical_vector);
            let inv_det = 1.0 / det;
            Ok(vec![
                (c * rhs0 - b * rhs1) * inv_det,
                (-b * rhs0 + a * rhs1) * inv_det,
            ])
        }
        _ => {
            let mut mat = [0.0; 9];
            for i in 0..3 {
                for j in 0..3 {
                    mat[i * 3 + j] = dot(cols[i], cols[j]);
                }
            }
            let rhs = [
                dot(cols[0], *physical_vector),
                dot(cols[1], *physical_vector),
                dot(cols[2], *physical_vector),
            ];
            let inv = invert_3x3(mat)?;
            Ok(vec![
                inv[0] * rhs[0] + inv[1] * rhs[1] + inv[2] * rhs[2],
                inv[3] * rhs[0] + inv[4] * rhs[1] + inv[5] * rhs[2],
                inv[6] * rhs[0] + inv[7] * rhs[1] + inv[8] * rhs[2],
            ])
        }
    }
}

/// Map a physical point back to reference coordinates using Newton iteration.
///
/// For cells of lower dimension than the ambient space the result is the
/// reference point of the closest mapped point.
pub fn physical_to_reference(
    cell_type: CellType,
    vertices: &[[f64; 3]],
    physical_point: &[f64; 3],
) -> Result<Vec<f64>, CmfeError> {
    let dim = cell_type.dimension();
    let start = match cell_type {
        CellType::Triangle | CellType::Tetrahedron | CellType::Prism => 0.25,
        _ => 0.5,
    };
    let mut ref_point = vec![start; dim];
    for _ in 0..MAX_NEWTON_ITERS {
        let mapped = reference_to_physical(cell_type, vertices, &ref_point)?;
        let residual = sub(mapped, *physical_point);
        let correction = pull_back_vector(cell_type, vertices, &ref_point, &residual)?;
        let mut step = 0.0f64;
        for (r, c) in ref_point.iter_mut().zip(&correction) {
            *r -= c;
            step = step.max(c.abs());
        }
        if step <= 1e-13 {
            break;
        }
    }
    Ok(ref_point)
}

/// `true` if `r` lies in the closed reference element, widened by `tol`.
pub fn reference_contains(cell_type: CellType, r: &[f64], tol: f64) -> bool {
    let unit = |x: f64| x >= -tol && x <= 1.0 + tol;
    match cell_type {
        CellType::Segment => unit(r[0]),
        CellType::Triangle => r[0] >= -tol && r[1] >= -tol && r[0] + r[1] <= 1.0 + tol,
        CellType::Quadrilateral => unit(r[0]) && unit(r[1]),
        CellType::Tetrahedron => {
            r[0] >= -tol && r[1] >= -tol && r[2] >= -tol && r[0] + r[1] + r[2] <= 1.0 + tol
        }
        CellType::Hexahedron | CellType::Pyramid => unit(r[0]) && unit(r[1]) && unit(r[2]),
        CellType::Prism => r[0] >= -tol && r[1] >= -tol && r[0] + r[1] <= 1.0 + tol && unit(r[2]),
    }
}

/// Locate `p` in the cell: the interpolation weights of the cell's vertices at
/// `p`, or `None` if `p` is outside (or the cell is degenerate).
pub fn locate(cell_type: CellType, vertices: &[[f64; 3]], p: [f64; 3]) -> Option<Vec<f64>> {
    let r = physical_to_reference(cell_type, vertices, &p).ok()?;
    if !reference_contains(cell_type, &r, REFERENCE_TOLERANCE) {
        return None;
    }
    let mapped = reference_to_physical(cell_type, vertices, &r).ok()?;
    let mut scale = 0.0f64;
    for v in &vertices[1..] {
        scale = scale.max(norm(sub(*v, vertices[0])));
    }
    // off-manifold points (e.g. above a surface triangle) are not inside
    if norm(sub(mapped, p)) > REFERENCE_TOLERANCE * scale.max(f64::MIN_POSITIVE) {
        return None;
    }
    shape_functions(cell_type, &r).ok().map(|(w, _)| w)
}

fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn norm(a: [f64; 3]) -> f64 {
    dot(a, a).sqrt()
}

fn invert_3x3(mat: [f64; 9]) -> Result<[f64; 9], CmfeError> {
    let det = mat[0] * (mat[4] * mat[8] - mat[5] * mat[7])
        - mat[1] * (mat[3] * mat[8] - mat[5] * mat[6])
        + mat[2] * (mat[3] * mat[7] - mat[4] * mat[6]);
    let scale = mat[0].abs().max(mat[4].abs()).max(mat[8].abs());
    if det.abs() <= EPS * (scale * scale * scale).max(EPS) {
        return Err(CmfeError::InvalidGeometry("degenerate jacobian".into()));
    }
    let inv_det = 1.0 / det;
    Ok([
        (mat[4] * mat[8] - mat[5] * mat[7]) * inv_det,
        (mat[2] * mat[7] - mat[1] * mat[8]) * inv_det,
        (mat[1] * mat[5] - mat[2] * mat[4]) * inv_det,
        (mat[5] * mat[6] - mat[3] * mat[8]) * inv_det,
        (mat[0] * mat[8] - mat[2] * mat[6]) * inv_det,
        (mat[2] * mat[3] - mat[0] * mat[5]) * inv_det,
        (mat[3] * mat[7] - mat[4] * mat[6]) * inv_det,
        (mat[1] * mat[6] - mat[0] * mat[7]) * inv_det,
        (mat[0] * mat[4] - mat[1] * mat[3]) * inv_det,
    ])
}
