//! Surface classification: patch labelling, vertex classes and collapse
//! admissibility.

mod common;

use std::collections::BTreeSet;

use common::{cube_around_centre, l_shape, split_square, ID2, ID3};
use mesh_adapt::prelude::*;
use mesh_adapt::surface::VertexClass;

fn patch_count(surface: &Surface) -> usize {
    surface
        .live_facets()
        .map(|f| surface.coplanar_id(f))
        .collect::<BTreeSet<_>>()
        .len()
}

#[test]
fn single_simplex_is_all_boundary() {
    let mesh = Mesh::new_2d(
        vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0],
        ID2.repeat(3),
        vec![0, 1, 2],
    )
    .unwrap();
    let surface = Surface::new(&mesh).unwrap();
    assert_eq!(surface.num_live_facets(), 3);
    assert_eq!(patch_count(&surface), 3);
    for v in 0..3 {
        assert_eq!(surface.classify_vertex(v), Some(VertexClass::Corner));
    }
    surface.validate_against(&mesh).unwrap();

    let tet = Mesh::new_3d(
        vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
        ID3.repeat(4),
        vec![0, 1, 2, 3],
    )
    .unwrap();
    let tet_surface = Surface::new(&tet).unwrap();
    assert_eq!(tet_surface.num_live_facets(), 4);
    assert_eq!(patch_count(&tet_surface), 4);
    tet_surface.validate_against(&tet).unwrap();
}

#[test]
fn shared_face_is_not_a_boundary_facet() {
    // Two tetrahedra glued along the face (1, 2, 3).
    let coords = vec![
        0.0, 0.0, 0.0, // 0
        1.0, 0.0, 0.0, // 1
        0.0, 1.0, 0.0, // 2
        0.0, 0.0, 1.0, // 3
        1.0, 1.0, 1.0, // 4 (on the far side of the shared face)
    ];
    let mesh = Mesh::new_3d(coords, ID3.repeat(5), vec![0, 1, 2, 3, 4, 1, 3, 2]).unwrap();
    let surface = Surface::new(&mesh).unwrap();
    assert_eq!(surface.num_live_facets(), 6);
    for f in surface.live_facets() {
        let fv: BTreeSet<_> = surface.facet(f).unwrap().iter().copied().collect();
        assert_ne!(fv, BTreeSet::from([1, 2, 3]), "shared face leaked");
    }
    surface.validate_against(&mesh).unwrap();
}

#[test]
fn cube_has_six_patches_and_eight_corners() {
    let mesh = cube_around_centre([0.5, 0.5, 0.5], ID3);
    let surface = Surface::new(&mesh).unwrap();

    assert_eq!(surface.num_live_facets(), 12);
    assert_eq!(surface.num_surface_nodes(), 8);
    assert_eq!(patch_count(&surface), 6);
    for v in 0..8 {
        assert_eq!(surface.classify_vertex(v), Some(VertexClass::Corner));
        assert!(surface.is_corner_vertex(v));
    }
    // The centre vertex is interior and unconstrained.
    assert!(!surface.contains_node(8));
    assert!(surface.is_collapsible(8, 0));
    surface.validate_against(&mesh).unwrap();
}

#[test]
fn cube_edge_vertices_classify_between_corner_and_patch() {
    // Split the bottom-front cube edge: the midpoint vertex lies on the
    // geometric edge between the bottom and front patches.
    let mut coords = vec![
        0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0, // bottom
        0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0, 1.0, 1.0, 0.0, 1.0, 1.0, // top
        0.5, 0.5, 0.5, // centre
    ];
    coords.extend_from_slice(&[0.5, 0.0, 0.0]); // 9: mid bottom-front edge
    let mut triangles: Vec<[usize; 3]> = Vec::new();
    for tri in common::cube_surface_triangles().chunks_exact(3) {
        match [tri[0], tri[1], tri[2]] {
            // The two faces containing edge (0, 1) are split at vertex 9.
            [0, 2, 1] => triangles.extend_from_slice(&[[0, 2, 9], [9, 2, 1]]),
            [0, 1, 5] => triangles.extend_from_slice(&[[0, 9, 5], [9, 1, 5]]),
            other => triangles.push(other),
        }
    }
    let mut enlist = Vec::new();
    for tri in &triangles {
        enlist.push(8);
        enlist.extend_from_slice(tri);
    }
    let mesh = Mesh::new_3d(coords, ID3.repeat(10), enlist).unwrap();
    let surface = Surface::new(&mesh).unwrap();

    assert_eq!(surface.classify_vertex(9), Some(VertexClass::Edge));
    // An edge vertex may collapse along its edge (both patches present at
    // the corner)…
    assert!(surface.is_collapsible(9, 0));
    assert!(surface.is_collapsible(9, 1));
    // …but not onto a vertex missing one of its planes.
    assert!(!surface.is_collapsible(9, 6));
    surface.validate_against(&mesh).unwrap();
}

#[test]
fn reentrant_corner_is_corner_vertex() {
    let mesh = l_shape(ID2);
    let surface = Surface::new(&mesh).unwrap();

    // The re-entrant corner joins two patches; with D = 2 that makes it a
    // corner and every collapse attempt must be refused.
    assert_eq!(surface.incident_planes(4).len(), 2);
    assert_eq!(surface.classify_vertex(4), Some(VertexClass::Corner));
    for target in [1, 3, 5, 7] {
        assert!(!surface.is_collapsible(4, target));
    }
    surface.validate_against(&mesh).unwrap();
}

#[test]
fn coplanar_tolerance_splits_rotated_face() {
    // Rotate the top face of the cube by 0.01 rad about its normal. The
    // top stays planar, but each side face becomes a twisted quad whose
    // two triangles disagree by ~0.01 rad.
    let mut mesh = cube_around_centre([0.5, 0.5, 0.5], ID3);
    let theta: f64 = 0.01;
    let (sin, cos) = theta.sin_cos();
    let rotated: Vec<(usize, [f64; 3])> = (4..8)
        .map(|v| {
            let x = mesh.coords(v);
            let (dx, dy) = (x[0] - 0.5, x[1] - 0.5);
            (v, [0.5 + dx * cos - dy * sin, 0.5 + dx * sin + dy * cos, x[2]])
        })
        .collect();
    for (v, x) in rotated {
        let m = ID3;
        mesh.set_position(v, &x, &m);
    }

    // Tight tolerance: the twisted side faces split in two, the flat top
    // and bottom do not. 2 + 4 * 2 = 10 patches.
    let tight = Surface::new(&mesh).unwrap();
    assert_eq!(patch_count(&tight), 10);

    // Relaxed tolerance re-merges each side pair without merging
    // neighbouring faces (adjacent normals are nearly orthogonal).
    let relaxed = Surface::with_tolerance(&mesh, 0.99).unwrap();
    assert_eq!(patch_count(&relaxed), 6);
}

#[test]
fn collapse_then_reextraction_agrees() {
    // Coarsening the split square removes the bottom mid-edge vertex; the
    // incrementally maintained surface must agree with a fresh extraction.
    let mut mesh = split_square([4.0, 0.0, 4.0]);
    let mut surface = Surface::new(&mesh).unwrap();
    let nodes_before = surface.num_surface_nodes();
    let bottom_id = surface
        .live_facets()
        .find(|&f| surface.facet(f).unwrap().contains(&4))
        .map(|f| surface.coplanar_id(f))
        .unwrap();

    let removed = Coarsen::new(&mut mesh, &mut surface)
        .unwrap()
        .coarsen(1.5, 10.0)
        .unwrap();
    assert_eq!(removed, 1);
    assert!(!mesh.is_live_vertex(4));
    assert_eq!(surface.num_surface_nodes(), nodes_before - 1);

    // Patch ids survive on the rewritten facet.
    let bottom: Vec<_> = surface
        .live_facets()
        .filter(|&f| {
            let fv = surface.facet(f).unwrap();
            fv.contains(&0) && fv.contains(&1)
        })
        .collect();
    assert_eq!(bottom.len(), 1);
    assert_eq!(surface.coplanar_id(bottom[0]), bottom_id);

    // Re-extract from scratch and compare facet vertex sets.
    let fresh = Surface::new(&mesh).unwrap();
    let live_sets = |s: &Surface| -> BTreeSet<BTreeSet<usize>> {
        s.live_facets()
            .map(|f| s.facet(f).unwrap().iter().copied().collect())
            .collect()
    };
    assert_eq!(live_sets(&surface), live_sets(&fresh));
    surface.validate_against(&mesh).unwrap();
}
