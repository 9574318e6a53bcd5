use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use mesh_cmfe::cmfe::{CandidateList, LookupGrouping};
use mesh_cmfe::geometry::{BoundingBox, IntervalIndex};
use mesh_cmfe::mesh::{Centering, Field, MeshFragment};

// 1) Random boxes of roughly cell size in a unit cube
fn random_boxes(n: usize, seed: u64) -> Vec<BoundingBox> {
    let mut rng = SmallRng::seed_from_u64(seed);
    let h = 2.0 / (n as f64).cbrt();
    (0..n)
        .map(|_| {
            let min = [rng.r#gen::<f64>(), rng.r#gen::<f64>(), rng.r#gen::<f64>()];
            BoundingBox::new(min, [min[0] + h, min[1] + h, min[2] + h])
        })
        .collect()
}

// 2) Hexahedral grid with a nodal field
fn grid(n: usize) -> MeshFragment {
    let axis: Vec<f64> = (0..=n).map(|i| i as f64 / n as f64).collect();
    let frag = MeshFragment::rectilinear(axis.clone(), axis.clone(), axis).unwrap();
    let values = (0..frag.node_count()).map(|i| frag.node(i)[0]).collect();
    frag.with_field(Field::new("x", Centering::Nodal, 1, values))
        .unwrap()
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("interval_index_build");
    for &n in &[1_000usize, 10_000, 100_000] {
        let boxes = random_boxes(n, 42);
        group.bench_with_input(BenchmarkId::from_parameter(n), &boxes, |b, boxes| {
            b.iter(|| IntervalIndex::from_boxes(boxes));
        });
    }
    group.finish();
}

fn bench_query(c: &mut Criterion) {
    let boxes = random_boxes(50_000, 7);
    let index = IntervalIndex::from_boxes(&boxes);
    let mut rng = SmallRng::seed_from_u64(9);
    let probes: Vec<[f64; 3]> = (0..1_000)
        .map(|_| [rng.r#gen(), rng.r#gen(), rng.r#gen()])
        .collect();
    c.bench_function("interval_index_find_containing", |b| {
        let mut out = Vec::new();
        b.iter(|| {
            for &p in &probes {
                index.find_containing_into(p, &mut out);
            }
        });
    });
}

// 3) Coherent sweep through a grid: full search vs. candidate list
fn bench_lookup(c: &mut Criterion) {
    let frag = grid(24);
    let mut lookup = LookupGrouping::new("x");
    lookup.add_fragment(&frag).unwrap();
    lookup.finalize();
    let sweep: Vec<[f64; 3]> = (0..2_000)
        .map(|i| {
            let t = i as f64 / 2_000.0;
            [t, 0.5 + 0.3 * (8.0 * t).sin(), 0.4]
        })
        .collect();

    let mut group = c.benchmark_group("lookup_sweep");
    group.bench_function("full_search", |b| {
        let mut out = [0.0];
        b.iter(|| {
            for &p in &sweep {
                lookup.get_value(p, &mut out);
            }
        });
    });
    group.bench_function("candidate_list", |b| {
        let mut out = [0.0];
        b.iter(|| {
            let mut list = CandidateList::new();
            for &p in &sweep {
                lookup.get_value_using_list(&mut list, p, &mut out);
            }
        });
    });
    group.finish();
}

criterion_group!(benches, bench_build, bench_query, bench_lookup);
criterion_main!(benches);
