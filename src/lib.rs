//! # mesh-adapt
//!
//! mesh-adapt is a Rust library for anisotropic adaptation of unstructured
//! simplicial meshes (triangles in 2D, tetrahedra in 3D) driven by a
//! per-vertex Riemannian metric field. Given a mesh whose vertices carry a
//! symmetric positive-definite metric tensor, the engine transforms the mesh
//! so that edges approach unit length measured in the metric, while keeping
//! element shape quality acceptable and preserving the geometric boundary.
//!
//! ## Features
//! - [`Mesh`](mesh::Mesh): the shared graph store — coordinates, metrics,
//!   element/node/edge adjacency, halo descriptors, global numbering
//! - [`Surface`](surface::Surface): boundary extraction, co-planar patch
//!   labelling, and collapse-admissibility queries
//! - [`Coarsen`](adapt::coarsen::Coarsen): parallel maximal-independent-set
//!   edge collapse bounded by metric edge lengths
//! - [`Smooth`](adapt::smooth::Smooth): colour-scheduled vertex relaxation
//!   (Laplacian, smart Laplacian, or Linf quality optimisation)
//! - Pluggable [`Communicator`](comm::Communicator) backends for the
//!   message-passing rank model (serial and in-process multi-rank)
//! - Pluggable [`ColouringOracle`](colouring::ColouringOracle) for the
//!   independent-set schedule
//!
//! ## Usage
//! ```rust,ignore
//! use mesh_adapt::prelude::*;
//!
//! let mut mesh = Mesh::new_3d(coords, metrics, elements)?;
//! let mut surface = Surface::new(&mesh)?;
//! Coarsen::new(&mut mesh, &mut surface)?.coarsen(1.0 / 2f64.sqrt(), 2f64.sqrt())?;
//! Smooth::new(&mut mesh, &surface)?.smooth(SmoothMethod::SmartLaplacian, 10, None)?;
//! ```
//!
//! Mutation is scheduled by graph colouring: kernels are evaluated in
//! parallel across a colour class (the class is an independent set, so all
//! reads are race-free) and committed at the class boundary. All writes of
//! class `k` are visible before class `k+1` starts.

pub mod adapt;
pub mod colouring;
pub mod comm;
pub mod geometry;
pub mod mesh;
pub mod mesh_error;
pub mod surface;

/// A convenient prelude importing the most-used types.
pub mod prelude {
    pub use crate::adapt::coarsen::{Coarsen, CollapseOutcome};
    pub use crate::adapt::smooth::{Smooth, SmoothMethod};
    pub use crate::colouring::{ColouringOracle, GreedyColouring};
    pub use crate::comm::{Communicator, NoComm, RayonComm};
    pub use crate::geometry::element::ElementProperty;
    pub use crate::mesh::{ElementId, Mesh, VertexId};
    pub use crate::mesh_error::MeshAdaptError;
    pub use crate::surface::Surface;
}
