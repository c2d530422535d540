//! Invariant fuzzing: the mesh/surface/colouring contracts must hold in
//! every reachable state.

mod common;

use common::unit_square_grid;
use mesh_adapt::colouring::{verify_colouring, ColouringOracle, GreedyColouring};
use mesh_adapt::prelude::*;
use proptest::prelude::*;

fn run_pipeline(
    n: usize,
    scales: &[f64],
    l_low: f64,
    l_max: f64,
    sweeps: usize,
) -> (Mesh, Surface) {
    let mut mesh = unit_square_grid(n, scales);
    let mut surface = Surface::new(&mesh).unwrap();
    Coarsen::new(&mut mesh, &mut surface)
        .unwrap()
        .coarsen(l_low, l_max)
        .unwrap();
    if sweeps > 0 {
        Smooth::new(&mut mesh, &surface)
            .unwrap()
            .smooth(SmoothMethod::SmartLaplacian, sweeps, None)
            .unwrap();
    }
    (mesh, surface)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn adjacency_survives_random_coarsening(
        n in 2usize..5,
        scales in prop::collection::vec(0.25f64..4.0, 1..6),
        l_low in 0.3f64..1.2,
        stretch in 1.0f64..3.0,
    ) {
        let (mesh, surface) = run_pipeline(n, &scales, l_low, l_low + stretch, 0);
        mesh.validate_invariants().unwrap();
        surface.validate_against(&mesh).unwrap();
    }

    #[test]
    fn smoothing_after_coarsening_keeps_the_mesh_consistent(
        n in 2usize..5,
        scales in prop::collection::vec(0.25f64..4.0, 1..6),
        sweeps in 1usize..4,
    ) {
        let (mesh, surface) = run_pipeline(n, &scales, 0.8, 2.5, sweeps);
        mesh.validate_invariants().unwrap();
        surface.validate_against(&mesh).unwrap();
        // Smoothing never mutates topology.
        let fresh = Surface::new(&mesh).unwrap();
        prop_assert_eq!(fresh.num_live_facets(), surface.num_live_facets());
    }

    #[test]
    fn colouring_stays_independent_on_mutated_meshes(
        n in 2usize..5,
        scales in prop::collection::vec(0.25f64..4.0, 1..6),
        distance in 1usize..3,
    ) {
        let (mesh, _surface) = run_pipeline(n, &scales, 0.9, 2.4, 0);
        let colour = GreedyColouring.colour(&mesh, distance);
        verify_colouring(&mesh, &colour).unwrap();
        // Live owned vertices are all scheduled.
        for v in mesh.live_vertices() {
            prop_assert!(colour[v] >= 0);
        }
    }
}

#[test]
fn cached_edge_lengths_track_the_metric_field() {
    // P4 after the full pipeline: cached lengths equal recomputation.
    let scales = [0.4, 1.5, 0.8];
    let (mesh, _surface) = run_pipeline(4, &scales, 0.9, 2.4, 3);
    for (key, data) in &mesh.edges {
        let fresh = mesh.calc_edge_length(key.first(), key.second());
        assert!(
            (data.length - fresh).abs() <= 1e-10 * fresh.max(1.0),
            "edge ({}, {}): cached {} vs fresh {}",
            key.first(),
            key.second(),
            data.length,
            fresh
        );
    }
}
