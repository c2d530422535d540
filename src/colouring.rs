//! Vertex colouring for the independent-set mutation schedule.
//!
//! The engines only rely on the independence property: no two vertices of
//! the same colour may be adjacent at the requested distance. Distance 1
//! suffices for kernels that write a single vertex (smoothing); the
//! coarsening engine rewrites the whole one-ring of a vertex and therefore
//! asks for distance 2, i.e. a colouring of the square graph.
//!
//! [`GreedyColouring`] is the built-in deterministic first-fit oracle. In a
//! distributed run a globally consistent colouring service can be plugged
//! in through the [`ColouringOracle`] trait; the engines validate nothing
//! beyond what [`verify_colouring`] checks.

use std::collections::BTreeSet;

use crate::mesh::{Mesh, VertexId};
use crate::mesh_error::MeshAdaptError;

/// A vertex colouring of the mutable adjacency. `colour[v] >= 0` for every
/// live owned vertex; dead and unowned vertices carry `-1`.
pub type Colouring = Vec<i32>;

/// Oracle producing an independent-set schedule for the current adjacency.
pub trait ColouringOracle {
    /// Colour the owned live vertices so that no two vertices within
    /// `distance` hops of each other share a colour.
    fn colour(&self, mesh: &Mesh, distance: usize) -> Colouring;
}

/// Deterministic first-fit greedy colouring.
#[derive(Copy, Clone, Debug, Default)]
pub struct GreedyColouring;

impl ColouringOracle for GreedyColouring {
    fn colour(&self, mesh: &Mesh, distance: usize) -> Colouring {
        let n = mesh.num_vertices();
        let mut colour = vec![-1i32; n];
        let mut used: Vec<i32> = Vec::new();
        for v in 0..n {
            if !mesh.is_live_vertex(v) || !mesh.is_owned_node(v) {
                continue;
            }
            used.clear();
            for u in reach(mesh, v, distance) {
                if colour[u] >= 0 {
                    used.push(colour[u]);
                }
            }
            used.sort_unstable();
            used.dedup();
            let mut c = 0i32;
            for &taken in &used {
                if taken == c {
                    c += 1;
                } else if taken > c {
                    break;
                }
            }
            colour[v] = c;
        }
        colour
    }
}

/// Vertices within `distance` hops of `v` (excluding `v` itself).
fn reach(mesh: &Mesh, v: VertexId, distance: usize) -> BTreeSet<VertexId> {
    let mut out: BTreeSet<VertexId> = mesh.node_neighbours[v].iter().copied().collect();
    if distance >= 2 {
        for &u in &mesh.node_neighbours[v] {
            out.extend(mesh.node_neighbours[u].iter().copied());
        }
        out.remove(&v);
    }
    out
}

/// Check the distance-1 independence property over owned vertices.
pub fn verify_colouring(mesh: &Mesh, colour: &[i32]) -> Result<(), MeshAdaptError> {
    for v in mesh.live_vertices() {
        if colour[v] < 0 {
            continue;
        }
        for &u in &mesh.node_neighbours[v] {
            if colour[u] >= 0 && colour[u] == colour[v] {
                return Err(MeshAdaptError::InvalidColouring {
                    a: v,
                    b: u,
                    colour: colour[v],
                });
            }
        }
    }
    Ok(())
}

/// Group vertices by colour, ascending; the class index equals the colour.
pub fn colour_classes(colour: &[i32]) -> Vec<Vec<VertexId>> {
    let max = colour.iter().copied().max().unwrap_or(-1);
    let mut classes = vec![Vec::new(); (max + 1).max(0) as usize];
    for (v, &c) in colour.iter().enumerate() {
        if c >= 0 {
            classes[c as usize].push(v);
        }
    }
    classes
}
