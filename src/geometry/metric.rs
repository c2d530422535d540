//! Packed symmetric-tensor arithmetic for per-vertex Riemannian metrics.
//!
//! # Storage layout
//! A metric is a symmetric positive-definite `D×D` tensor stored as its
//! upper triangle, row-major:
//!
//! - 2D: `[m00, m01, m11]` (3 entries)
//! - 3D: `[m00, m01, m02, m11, m12, m22]` (6 entries)
//!
//! The 3,3 component of a 3D tensor is packed index **5**. All routines in
//! this crate read and write this layout; there is no dense representation.
//!
//! Lengths measured in the metric use the arithmetic mean of the endpoint
//! tensors: `ℓ = √(dᵀ M̄ d)`.

/// Maximum packed length across supported dimensions; 2D uses the first 3 slots.
pub const PACKED_MAX: usize = 6;

/// Number of packed entries for a `ndims`-dimensional symmetric tensor.
#[inline]
pub const fn packed_len(ndims: usize) -> usize {
    ndims * (ndims + 1) / 2
}

/// Evaluate `dᵀ M d` for a packed metric.
#[inline]
pub fn quadratic_form(ndims: usize, m: &[f64], d: &[f64]) -> f64 {
    if ndims == 2 {
        m[0] * d[0] * d[0] + 2.0 * m[1] * d[0] * d[1] + m[2] * d[1] * d[1]
    } else {
        m[0] * d[0] * d[0]
            + m[3] * d[1] * d[1]
            + m[5] * d[2] * d[2]
            + 2.0 * (m[1] * d[0] * d[1] + m[2] * d[0] * d[2] + m[4] * d[1] * d[2])
    }
}

/// Evaluate `M d`, writing the product into `out[..ndims]`.
#[inline]
pub fn apply(ndims: usize, m: &[f64], d: &[f64], out: &mut [f64]) {
    if ndims == 2 {
        out[0] = m[0] * d[0] + m[1] * d[1];
        out[1] = m[1] * d[0] + m[2] * d[1];
    } else {
        out[0] = m[0] * d[0] + m[1] * d[1] + m[2] * d[2];
        out[1] = m[1] * d[0] + m[3] * d[1] + m[4] * d[2];
        out[2] = m[2] * d[0] + m[4] * d[1] + m[5] * d[2];
    }
}

/// Arithmetic mean of packed metrics, written into the first
/// `packed_len(ndims)` slots of the returned buffer.
pub fn mean(ndims: usize, ms: &[&[f64]]) -> [f64; PACKED_MAX] {
    let len = packed_len(ndims);
    let inv = 1.0 / ms.len() as f64;
    let mut out = [0.0; PACKED_MAX];
    for m in ms {
        for i in 0..len {
            out[i] += m[i];
        }
    }
    for v in out[..len].iter_mut() {
        *v *= inv;
    }
    out
}

/// Determinant of a packed metric.
#[inline]
pub fn determinant(ndims: usize, m: &[f64]) -> f64 {
    if ndims == 2 {
        m[0] * m[2] - m[1] * m[1]
    } else {
        m[0] * (m[3] * m[5] - m[4] * m[4]) - m[1] * (m[1] * m[5] - m[4] * m[2])
            + m[2] * (m[1] * m[4] - m[3] * m[2])
    }
}

/// Length of the vector `d` measured in the metric `m`.
#[inline]
pub fn length(ndims: usize, m: &[f64], d: &[f64]) -> f64 {
    quadratic_form(ndims, m, d).max(0.0).sqrt()
}

/// Length of the segment `a → b` in the mean of the endpoint metrics.
pub fn edge_length(ndims: usize, ma: &[f64], mb: &[f64], a: &[f64], b: &[f64]) -> f64 {
    let mbar = mean(ndims, &[ma, mb]);
    let mut d = [0.0; 3];
    for i in 0..ndims {
        d[i] = b[i] - a[i];
    }
    length(ndims, &mbar[..packed_len(ndims)], &d[..ndims])
}

/// True if the packed tensor is finite and positive definite
/// (leading principal minors all strictly positive).
pub fn is_spd(ndims: usize, m: &[f64]) -> bool {
    if m[..packed_len(ndims)].iter().any(|v| !v.is_finite()) {
        return false;
    }
    if ndims == 2 {
        m[0] > 0.0 && determinant(2, m) > 0.0
    } else {
        m[0] > 0.0 && (m[0] * m[3] - m[1] * m[1]) > 0.0 && determinant(3, m) > 0.0
    }
}
