//! Geometric kernels: packed metric-tensor arithmetic and per-element
//! shape measures in metric space.

pub mod element;
pub mod metric;
