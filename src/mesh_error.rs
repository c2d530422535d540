//! `MeshAdaptError`: unified error type for the mesh-adapt public APIs.
//!
//! Fatal conditions (malformed input meshes, non-SPD metrics, broken
//! adjacency) are reported through this enum. Transient geometric rejection
//! (a smoothing move that would invert an element, a collapse that fails the
//! volume guard) is *not* an error; kernels report those through their
//! accept/reject return values and the caller carries on.

use thiserror::Error;

use crate::mesh::{ElementId, VertexId};

/// Unified error type for mesh-adapt operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MeshAdaptError {
    /// The mesh dimension is not 2 or 3.
    #[error("unsupported mesh dimension {0} (expected 2 or 3)")]
    UnsupportedDimension(usize),
    /// An element references a vertex outside the vertex array.
    #[error("element {element} references vertex {vertex} out of range {nnodes}")]
    VertexOutOfRange {
        element: ElementId,
        vertex: usize,
        nnodes: usize,
    },
    /// A vertex coordinate is NaN or infinite.
    #[error("vertex {0} has a non-finite coordinate")]
    NonFiniteCoordinate(VertexId),
    /// A vertex metric tensor is not symmetric positive definite.
    #[error("vertex {0} carries a non-SPD metric tensor")]
    NonSpdMetric(VertexId),
    /// An input element has non-positive signed volume.
    #[error("element {element} has non-positive signed volume {volume}")]
    InvertedElement { element: ElementId, volume: f64 },
    /// Lookup of a vertex that has been deleted or never existed.
    #[error("vertex {0} is not live")]
    DeadVertex(VertexId),
    /// Lookup of an element that has been deleted or never existed.
    #[error("element {0} is not live")]
    DeadElement(ElementId),
    /// The edge set disagrees with the element list.
    #[error("edge ({0}, {1}) missing from the edge map")]
    MissingEdge(VertexId, VertexId),
    /// An adjacency invariant does not hold; the string names the violation.
    #[error("adjacency invariant violated: {0}")]
    BrokenAdjacency(String),
    /// A surface invariant does not hold; the string names the violation.
    #[error("surface invariant violated: {0}")]
    BrokenSurface(String),
    /// The per-rank halo descriptors are inconsistent with ownership.
    #[error("halo descriptor invalid: {0}")]
    BrokenHalo(String),
    /// A received negotiation buffer could not be decoded.
    #[error("malformed negotiation buffer from rank {rank}: {reason}")]
    MalformedBuffer { rank: usize, reason: String },
    /// A colouring oracle returned an inadmissible colouring.
    #[error("colouring assigns colour {colour} to adjacent vertices {a} and {b}")]
    InvalidColouring { a: VertexId, b: VertexId, colour: i32 },
}
