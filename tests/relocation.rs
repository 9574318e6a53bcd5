mod util;

use mesh_cmfe::algs::CmfeCommTags;
use mesh_cmfe::prelude::*;
use util::*;

const TAGS: CmfeCommTags = CmfeCommTags::from_base(CommTag::new(0x4100));

fn empty_lookup() -> LookupGrouping<'static> {
    let mut g = LookupGrouping::new("f");
    g.finalize();
    g
}

fn query_for(rank: usize, frags: &[MeshFragment]) -> QueryPointSet {
    let mut q = QueryPointSet::new(rank, Centering::Nodal, 1);
    for f in frags {
        q.add_fragment(f).unwrap();
    }
    q.finalize();
    q
}

/// Destination fragments for rank `rank`: one cloud and one grid that crosses
/// the other ranks' grids.
fn rank_destinations(rank: usize) -> Vec<MeshFragment> {
    let r = rank as f64;
    vec![
        point_cloud(random_points(30, 100 + rank as u64, (0.0, 4.0), (0.0, 1.0))),
        MeshFragment::rectilinear(axis(r * 0.5, r * 0.5 + 2.0, 8), axis(0.0, 1.0, 4), vec![0.0])
            .unwrap(),
    ]
}

#[test]
fn round_trip_restores_points_and_order() {
    let results = run_world(3, |comm| {
        let frags = rank_destinations(comm.rank());
        let mut q = query_for(comm.rank(), &frags);
        let before: Vec<[f64; 3]> = q.points().collect();
        let lookup = empty_lookup();
        let opts = CmfeOptions {
            comm_tag_base: 0x4100,
            ..Default::default()
        };
        let partition = SpatialPartition::create_partition(comm, &q, &lookup, &opts).unwrap();
        q.relocate_using_partition(&partition, comm, TAGS.scatter_points)
            .unwrap();
        assert!(q.is_relocated());
        q.unrelocate_using_partition(&partition, comm, TAGS.gather_values)
            .unwrap();
        let after: Vec<[f64; 3]> = q.points().collect();
        (before, after, q)
    });
    for (before, after, q) in results {
        assert_eq!(before, after);
        assert!(!q.is_relocated());
        assert!(q.validate_invariants().is_ok());
        assert!((0..q.total_point_count()).all(|i| !q.is_valid(i)));
    }
}

#[test]
fn scattered_point_lists_are_conserved() {
    let results = run_world(4, |comm| {
        let frags = vec![point_cloud(random_points(
            50,
            7 + comm.rank() as u64,
            (-1.0, 5.0),
            (0.0, 2.0),
        ))];
        let mut q = query_for(comm.rank(), &frags);
        let native = q.total_point_count();
        let lookup = empty_lookup();
        let partition = SpatialPartition::create_partition(
            comm,
            &q,
            &lookup,
            &CmfeOptions {
                comm_tag_base: 0x4100,
                ..Default::default()
            },
        )
        .unwrap();
        q.relocate_using_partition(&partition, comm, TAGS.scatter_points)
            .unwrap();
        // every relocated point lies in this worker's region
        let region = *partition.region(comm.rank()).unwrap();
        for p in q.points() {
            assert!(region.contains_point(p), "{p:?} outside {region:?}");
        }
        (native, q.total_point_count())
    });
    let native: usize = results.iter().map(|r| r.0).sum();
    let relocated: usize = results.iter().map(|r| r.1).sum();
    assert_eq!(native, 200);
    assert_eq!(relocated, native);
}

#[test]
fn seam_points_keep_the_lowest_claimant() {
    let results = run_world(3, |comm| {
        let frags = rank_destinations(comm.rank());
        let mut q = query_for(comm.rank(), &frags);
        // seams at x = 1.5 and x = 3, both on grid nodes
        let partition = SpatialPartition::from_regions(vec![
            Some(BoundingBox::new([0.0, 0.0, -1.0], [1.5, 1.0, 1.0])),
            Some(BoundingBox::new([1.5, 0.0, -1.0], [3.0, 1.0, 1.0])),
            Some(BoundingBox::new([3.0, 0.0, -1.0], [4.0, 1.0, 1.0])),
        ]);
        let native: Vec<[f64; 3]> = q.points().collect();
        q.relocate_using_partition(&partition, comm, TAGS.scatter_points)
            .unwrap();
        let me = [comm.rank() as f64];
        for i in 0..q.total_point_count() {
            q.set_value(i, &me).unwrap();
        }
        q.unrelocate_using_partition(&partition, comm, TAGS.gather_values)
            .unwrap();
        (native, partition, q)
    });
    let mut seam_points = 0;
    for (native, partition, q) in &results {
        for (i, p) in native.iter().enumerate() {
            let claimants: Vec<usize> = partition
                .active_workers()
                .filter(|&r| partition.region(r).is_some_and(|b| b.contains_point(*p)))
                .collect();
            if claimants.len() > 1 {
                seam_points += 1;
            }
            assert!(q.is_valid(i));
            assert_eq!(q.get_value(0, i), claimants[0] as f64, "point {p:?}");
        }
    }
    assert!(seam_points > 0);
}

#[test]
fn seam_keeps_first_value_even_when_invalid() {
    let results = run_world(2, |comm| {
        let frags: Vec<MeshFragment> = if comm.rank() == 0 {
            let grid = MeshFragment::rectilinear(vec![0.0, 1.0, 2.0], vec![0.0, 1.0], vec![0.0]);
            vec![grid.unwrap()]
        } else {
            Vec::new()
        };
        let mut q = query_for(comm.rank(), &frags);
        let partition = SpatialPartition::from_regions(vec![
            Some(BoundingBox::new([0.0, 0.0, -1.0], [1.0, 1.0, 1.0])),
            Some(BoundingBox::new([1.0, 0.0, -1.0], [2.0, 1.0, 1.0])),
        ]);
        q.relocate_using_partition(&partition, comm, TAGS.scatter_points)
            .unwrap();
        for i in 0..q.total_point_count() {
            if comm.rank() == 0 {
                q.mark_missing(i, -1.0).unwrap();
            } else {
                q.set_value(i, &[7.0]).unwrap();
            }
        }
        q.unrelocate_using_partition(&partition, comm, TAGS.gather_values)
            .unwrap();
        q
    });
    let q = &results[0];
    assert_eq!(q.total_point_count(), 6);
    for i in 0..6 {
        let x = q.get_point(i).unwrap()[0];
        let got = (q.get_value(0, i), q.is_valid(i));
        if x < 2.0 {
            // rank 0 claims x = 1 first, so its invalid answer stands
            assert_eq!(got, (-1.0, false), "x = {x}");
        } else {
            assert_eq!(got, (7.0, true), "x = {x}");
        }
    }
}

#[test]
fn corner_shared_by_four_regions_goes_to_lowest_id() {
    // quadrants around (1, 1), numbered 3 1 / 2 0 counter-clockwise from lower left
    let quadrant =
        |x0: f64, y0: f64| Some(BoundingBox::new([x0, y0, -1.0], [x0 + 1.0, y0 + 1.0, 1.0]));
    let results = run_world(4, |comm| {
        let mut frags = vec![point_cloud(vec![[1.0, 1.0, 0.0], [0.5, 1.5, 0.0]])];
        if comm.rank() == 2 {
            let grid = MeshFragment::rectilinear(axis(0.0, 2.0, 4), axis(0.0, 2.0, 4), vec![0.0]);
            frags.push(grid.unwrap());
        }
        let mut q = query_for(comm.rank(), &frags);
        let partition = SpatialPartition::from_regions(vec![
            quadrant(0.0, 1.0),
            quadrant(1.0, 0.0),
            quadrant(1.0, 1.0),
            quadrant(0.0, 0.0),
        ]);
        let native: Vec<[f64; 3]> = q.points().collect();
        q.relocate_using_partition(&partition, comm, TAGS.scatter_points)
            .unwrap();
        let me = [comm.rank() as f64];
        for i in 0..q.total_point_count() {
            q.set_value(i, &me).unwrap();
        }
        q.unrelocate_using_partition(&partition, comm, TAGS.gather_values)
            .unwrap();
        (native, partition, q)
    });
    let mut corners = 0;
    for (native, partition, q) in &results {
        for (i, p) in native.iter().enumerate() {
            let lowest = partition
                .active_workers()
                .find(|&r| partition.region(r).is_some_and(|b| b.contains_point(*p)))
                .unwrap();
            if *p == [1.0, 1.0, 0.0] {
                assert_eq!(lowest, 0);
                corners += 1;
            }
            assert!(q.is_valid(i));
            assert_eq!(q.get_value(0, i), lowest as f64, "point {p:?}");
        }
    }
    // one cloud point per rank plus the grid node
    assert_eq!(corners, 5);
}

#[test]
fn source_cells_reach_every_overlapping_region() {
    let results = run_world(2, |comm| {
        let src = triangle_strip(2.0 * comm.rank() as f64, 2.0 * comm.rank() as f64 + 2.0, 4);
        let mut lookup = LookupGrouping::new("f");
        lookup.add_fragment(&src).unwrap();
        lookup.finalize();
        let q = query_for(comm.rank(), &[]);
        let partition = SpatialPartition::create_partition(
            comm,
            &q,
            &lookup,
            &CmfeOptions {
                comm_tag_base: 0x4100,
                ..Default::default()
            },
        )
        .unwrap();
        lookup
            .relocate_using_partition(&partition, comm, TAGS.scatter_cells)
            .unwrap();
        let region = *partition.region(comm.rank()).unwrap();
        // any point of the region is found if some cell covers it
        let mut out = [0.0];
        let probes = random_points(50, 3, (region.min[0], region.max[0]), (0.0, 1.0));
        for p in probes {
            assert!(lookup.get_value(p, &mut out), "{p:?} in {region:?}");
            approx::assert_relative_eq!(out[0], linear(p), epsilon = 1e-9);
        }
        lookup.zone_count()
    });
    // 16 triangles in total, those crossing the split are duplicated
    assert!(results.iter().sum::<usize>() >= 16);
}
