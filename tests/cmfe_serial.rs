mod util;

use approx::assert_relative_eq;
use mesh_cmfe::prelude::*;
use serial_test::serial;
use util::*;

#[test]
fn quad_center_is_bilinear_average() {
    let src = [unit_quad()];
    let dst = [point_cloud(vec![[0.5, 0.5, 0.0]])];
    let out = perform_cmfe(&NoComm, &src, &dst, "f", Centering::Nodal, &CmfeOptions::default())
        .unwrap();
    assert_eq!(out.fields[0].field.values, vec![2.5]);
    assert_eq!(out.fields[0].valid, vec![true]);
}

#[test]
fn far_point_is_invalid_not_extrapolated() {
    let src = unit_quad();
    let mut lookup = LookupGrouping::new("f");
    lookup.add_fragment(&src).unwrap();
    lookup.finalize();
    let mut out = [123.0];
    assert!(!lookup.get_value([2.0, 2.0, 0.0], &mut out));
    let mut list = CandidateList::new();
    assert!(!lookup.get_value_using_list(&mut list, [2.0, 2.0, 0.0], &mut out));
    assert!(list.is_empty());
}

#[test]
fn destination_order_and_shapes_are_preserved() {
    let src = source_strips(4, 3);
    let dst = destinations();
    let out = perform_cmfe(&NoComm, &src, &dst, "f", Centering::Nodal, &CmfeOptions::default())
        .unwrap();
    assert_eq!(out.fields.len(), dst.len());
    for (frag, ev) in dst.iter().zip(&out.fields) {
        assert_eq!(ev.len(), frag.node_count());
        assert_eq!(ev.field.values.len(), frag.node_count());
        assert_eq!(ev.field.name, "f");
    }
    assert!(out.fields[3].is_empty());
    assert_eq!(out.stats.native_points, out.stats.relocated_points);
    assert_eq!(
        out.stats.found + out.stats.missing,
        out.stats.native_points
    );
}

#[test]
fn unstructured_and_rectilinear_sources_agree() {
    let rect = source_strips(1, 8);
    let tris = [triangle_strip(0.0, 4.0, 8)];
    let dst =
        [MeshFragment::rectilinear(axis(0.0, 4.0, 17), axis(0.0, 1.0, 3), vec![0.0]).unwrap()];
    let a = perform_cmfe(&NoComm, &rect, &dst, "f", Centering::Nodal, &CmfeOptions::default())
        .unwrap();
    let b = perform_cmfe(&NoComm, &tris, &dst, "f", Centering::Nodal, &CmfeOptions::default())
        .unwrap();
    assert!(a.fields[0].valid.iter().all(|v| *v));
    assert_eq!(a.fields[0].valid, b.fields[0].valid);
    for (i, (x, y)) in a.fields[0]
        .field
        .values
        .iter()
        .zip(&b.fields[0].field.values)
        .enumerate()
    {
        assert_relative_eq!(*x, *y, epsilon = 1e-9);
        assert_relative_eq!(*x, linear(dst[0].node(i)), epsilon = 1e-9);
    }
}

#[test]
fn hexahedral_source_in_three_dimensions() {
    let src = MeshFragment::rectilinear(axis(0.0, 1.0, 2), axis(0.0, 2.0, 2), axis(-1.0, 1.0, 2))
        .unwrap();
    let src = with_linear_field(src, "f");
    let pts = vec![[0.3, 1.7, -0.2], [0.9, 0.1, 0.95], [1.5, 0.0, 0.0]];
    let dst = [point_cloud(pts.clone())];
    let out = perform_cmfe(
        &NoComm,
        std::slice::from_ref(&src),
        &dst,
        "f",
        Centering::Nodal,
        &CmfeOptions::default(),
    )
    .unwrap();
    let ev = &out.fields[0];
    assert_eq!(ev.valid, vec![true, true, false]);
    assert_relative_eq!(ev.field.values[0], linear(pts[0]), epsilon = 1e-9);
    assert_relative_eq!(ev.field.values[1], linear(pts[1]), epsilon = 1e-9);
}

#[test]
fn compact_grid_survives_finalize() {
    let grid = MeshFragment::rectilinear(axis(0.0, 1.0, 4), axis(0.0, 1.0, 2), vec![0.0]).unwrap();
    let mut q = QueryPointSet::new(0, Centering::Zonal, 1);
    q.add_fragment(&grid).unwrap();
    q.finalize();
    let g = q.get_rgrid(0).expect("rectilinear block stays compact");
    assert_eq!(g.dims(), [4, 2, 1]);
    assert_eq!(q.total_point_count(), 8);
    assert_eq!(q.get_point(5).unwrap(), [0.375, 0.75, 0.0]);
    assert!(q.get_point(8).is_err());
}

#[test]
fn options_load_from_json() {
    let opts: CmfeOptions = serde_json::from_str(
        r#"{ "boundary_retry": false, "partition_bins": 16, "expected_components": 3 }"#,
    )
    .unwrap();
    assert!(!opts.boundary_retry);
    assert_eq!(opts.partition_bins, 16);
    assert_eq!(opts.expected_components, Some(3));
    assert_eq!(opts.fill_value, 0.0);
}

// LocalComm::new shares the process-wide mailbox, so these run one at a time.

#[test]
#[serial]
fn global_mailbox_two_rank_evaluation() {
    let outputs: Vec<CmfeOutput> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|rank| {
                s.spawn(move || {
                    let comm = LocalComm::new(rank, 2);
                    let src = [triangle_strip(2.0 * rank as f64, 2.0 * rank as f64 + 2.0, 4)];
                    let dst = [point_cloud(vec![[3.25 - 2.0 * rank as f64, 0.25, 0.0]])];
                    perform_cmfe(&comm, &src, &dst, "f", Centering::Nodal, &CmfeOptions::default())
                        .unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    let got = [
        outputs[0].fields[0].field.values[0],
        outputs[1].fields[0].field.values[0],
    ];
    assert_relative_eq!(got[0], linear([3.25, 0.25, 0.0]), epsilon = 1e-9);
    assert_relative_eq!(got[1], linear([1.25, 0.25, 0.0]), epsilon = 1e-9);
}

#[test]
#[serial]
fn global_mailbox_is_clean_between_runs() {
    for _ in 0..2 {
        let outputs: Vec<bool> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..3)
                .map(|rank| {
                    s.spawn(move || {
                        let comm = LocalComm::new(rank, 3);
                        let dst = [point_cloud(vec![[rank as f64, 0.5, 0.0]])];
                        let src = [triangle_strip(0.0, 3.0, 3)];
                        let src: &[MeshFragment] = if rank == 0 { &src } else { &[] };
                        let out = perform_cmfe(
                            &comm,
                            src,
                            &dst,
                            "f",
                            Centering::Nodal,
                            &CmfeOptions::default(),
                        )
                        .unwrap();
                        out.fields[0].valid[0]
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(outputs, vec![true, true, true]);
    }
}
