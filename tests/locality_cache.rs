mod util;

use mesh_cmfe::prelude::*;
use proptest::prelude::*;
use util::*;

fn mixed_sources() -> Vec<MeshFragment> {
    let mut v = source_strips(2, 3);
    // overlaps the rectilinear strips on [1, 3]
    v.push(triangle_strip(1.0, 3.0, 5));
    v
}

fn coord() -> impl Strategy<Value = [f64; 3]> {
    (-0.5f64..4.5, -0.25f64..1.25).prop_map(|(x, y)| [x, y, 0.0])
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn cached_lookup_agrees_with_full_search(points in prop::collection::vec(coord(), 1..60)) {
        let sources = mixed_sources();
        let mut lookup = LookupGrouping::new("f");
        for s in &sources {
            lookup.add_fragment(s).unwrap();
        }
        lookup.finalize();

        let mut list = CandidateList::new();
        let mut full = [0.0];
        let mut cached = [0.0];
        for p in points {
            let hit = lookup.get_value(p, &mut full);
            prop_assert_eq!(lookup.get_value_using_list(&mut list, p, &mut cached), hit);
            if hit {
                // same cell, same arithmetic
                prop_assert_eq!(full[0].to_bits(), cached[0].to_bits());
            }
        }
    }

    #[test]
    fn foreign_lists_do_not_change_results(
        train in prop::collection::vec(coord(), 1..20),
        probe in prop::collection::vec(coord(), 1..20),
    ) {
        let other = vec![triangle_strip(0.0, 4.0, 3)];
        let mut foreign = LookupGrouping::new("f");
        foreign.add_fragment(&other[0]).unwrap();
        foreign.finalize();

        let sources = mixed_sources();
        let mut lookup = LookupGrouping::new("f");
        for s in &sources {
            lookup.add_fragment(s).unwrap();
        }
        lookup.finalize();

        // a list trained on another grouping is stale for this one
        let mut list = CandidateList::new();
        let mut scratch = [0.0];
        for p in train {
            foreign.get_value_using_list(&mut list, p, &mut scratch);
        }
        let mut full = [0.0];
        let mut cached = [0.0];
        for p in probe {
            let hit = lookup.get_value(p, &mut full);
            prop_assert_eq!(lookup.get_value_using_list(&mut list, p, &mut cached), hit);
            if hit {
                prop_assert_eq!(full[0].to_bits(), cached[0].to_bits());
            }
        }
    }
}

#[test]
fn finalize_twice_gives_identical_answers() {
    let sources = mixed_sources();
    let mut lookup = LookupGrouping::new("f");
    for s in &sources {
        lookup.add_fragment(s).unwrap();
    }
    lookup.finalize();
    let probes = random_points(100, 5, (-0.5, 4.5), (-0.25, 1.25));
    let first: Vec<Option<u64>> = probes
        .iter()
        .map(|&p| {
            let mut out = [0.0];
            lookup.get_value(p, &mut out).then(|| out[0].to_bits())
        })
        .collect();
    lookup.finalize();
    let second: Vec<Option<u64>> = probes
        .iter()
        .map(|&p| {
            let mut out = [0.0];
            lookup.get_value(p, &mut out).then(|| out[0].to_bits())
        })
        .collect();
    assert_eq!(first, second);

    let dests = destinations();
    let mut q = QueryPointSet::new(0, Centering::Nodal, 1);
    for d in &dests {
        q.add_fragment(d).unwrap();
    }
    q.finalize();
    let before: Vec<[f64; 3]> = q.points().collect();
    let ranges = q.block_ranges();
    q.finalize();
    assert_eq!(q.points().collect::<Vec<_>>(), before);
    assert_eq!(q.block_ranges(), ranges);
}
