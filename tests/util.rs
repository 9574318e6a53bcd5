#![allow(dead_code)]
use mesh_cmfe::prelude::*;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Run `f` on every rank of a fresh in-process world, one scoped thread per
/// rank, and collect the results in rank order.
pub fn run_world<T, F>(size: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(&LocalComm) -> T + Sync,
{
    let world = LocalComm::world(size);
    std::thread::scope(|s| {
        let handles: Vec<_> = world
            .iter()
            .map(|comm| {
                let f = &f;
                s.spawn(move || f(comm))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("worker panicked"))
            .collect()
    })
}

/// A linear field, reproduced exactly (up to rounding) by every linear cell.
pub fn linear(p: [f64; 3]) -> f64 {
    1.0 + 2.0 * p[0] - 3.0 * p[1] + 0.5 * p[2]
}

/// Unit quad with nodal values 0, 10, 0, 0 at its corners.
pub fn unit_quad() -> MeshFragment {
    MeshFragment::unstructured(
        vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [1.0, 1.0, 0.0],
            [0.0, 1.0, 0.0],
        ],
        vec![Cell::new(CellType::Quadrilateral, vec![0, 1, 2, 3])],
    )
    .unwrap()
    .with_field(Field::new("f", Centering::Nodal, 1, vec![0.0, 10.0, 0.0, 0.0]))
    .unwrap()
}

/// Attach the nodal field `name = linear(node)` to `frag`.
pub fn with_linear_field(frag: MeshFragment, name: &str) -> MeshFragment {
    let values = (0..frag.node_count()).map(|i| linear(frag.node(i))).collect();
    frag.with_field(Field::new(name, Centering::Nodal, 1, values))
        .unwrap()
}

pub fn axis(lo: f64, hi: f64, n: usize) -> Vec<f64> {
    (0..=n)
        .map(|i| lo + (hi - lo) * i as f64 / n as f64)
        .collect()
}

/// Source strips covering `[0, 4] x [0, 1]`: strip `s` spans `[s*w, (s+1)*w]`
/// with `cells_per_strip` rectilinear cells along x and two along y.
pub fn source_strips(strips: usize, cells_per_strip: usize) -> Vec<MeshFragment> {
    let w = 4.0 / strips as f64;
    (0..strips)
        .map(|s| {
            let lo = s as f64 * w;
            let hi = if s + 1 == strips { 4.0 } else { (s + 1) as f64 * w };
            let frag = MeshFragment::rectilinear(
                axis(lo, hi, cells_per_strip),
                axis(0.0, 1.0, 2),
                vec![0.0],
            )
            .unwrap();
            with_linear_field(frag, "f")
        })
        .collect()
}

/// Triangulated strip over `[x0, x1] x [0, 1]`, `n` squares split on the diagonal.
pub fn triangle_strip(x0: f64, x1: f64, n: usize) -> MeshFragment {
    let xs = axis(x0, x1, n);
    let mut points = Vec::new();
    for &x in &xs {
        points.push([x, 0.0, 0.0]);
        points.push([x, 1.0, 0.0]);
    }
    let mut cells = Vec::new();
    for i in 0..n {
        let (a, b, c, d) = (2 * i, 2 * i + 2, 2 * i + 3, 2 * i + 1);
        cells.push(Cell::new(CellType::Triangle, vec![a, b, c]));
        cells.push(Cell::new(CellType::Triangle, vec![a, c, d]));
    }
    with_linear_field(MeshFragment::unstructured(points, cells).unwrap(), "f")
}

pub fn point_cloud(points: Vec<[f64; 3]>) -> MeshFragment {
    MeshFragment::unstructured(points, Vec::new()).unwrap()
}

/// `n` random points in the z = 0 plane over `[x0, x1] x [y0, y1]`.
pub fn random_points(n: usize, seed: u64, x: (f64, f64), y: (f64, f64)) -> Vec<[f64; 3]> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..n)
        .map(|_| [rng.gen_range(x.0..x.1), rng.gen_range(y.0..y.1), 0.0])
        .collect()
}

/// Destination fragments: random clouds plus one rectilinear grid.
pub fn destinations() -> Vec<MeshFragment> {
    vec![
        point_cloud(random_points(40, 1, (-0.5, 4.5), (-0.2, 1.2))),
        MeshFragment::rectilinear(axis(0.1, 3.9, 12), axis(0.05, 0.95, 4), vec![0.0]).unwrap(),
        point_cloud(random_points(25, 2, (0.0, 4.0), (0.0, 1.0))),
        point_cloud(Vec::new()),
        MeshFragment::rectilinear(axis(2.0, 6.0, 5), vec![0.5], vec![0.0]).unwrap(),
    ]
}

/// Fragments `k` with `k % size == rank`.
pub fn round_robin<T: Clone>(items: &[T], rank: usize, size: usize) -> Vec<T> {
    items
        .iter()
        .enumerate()
        .filter(|(k, _)| k % size == rank)
        .map(|(_, t)| t.clone())
        .collect()
}
