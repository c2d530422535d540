//! Shared mesh builders for the integration suites.
#![allow(dead_code)]

use mesh_adapt::mesh::Mesh;

pub const ID2: [f64; 3] = [1.0, 0.0, 1.0];
pub const ID3: [f64; 6] = [1.0, 0.0, 0.0, 1.0, 0.0, 1.0];

/// Unit square split along the diagonal.
pub fn unit_square(metric: [f64; 3]) -> Mesh {
    let coords = vec![0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0];
    Mesh::new_2d(coords, metric.repeat(4), vec![0, 1, 2, 0, 2, 3]).unwrap()
}

/// Unit square with the bottom edge split at `(0.5, 0)` (vertex 4).
pub fn split_square(metric: [f64; 3]) -> Mesh {
    let coords = vec![0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0, 0.5, 0.0];
    Mesh::new_2d(
        coords,
        metric.repeat(5),
        vec![0, 4, 3, 4, 2, 3, 4, 1, 2],
    )
    .unwrap()
}

/// L-shaped domain `[0,2]² \ [1,2]×[1,2]`, six triangles. Vertex 4 sits at
/// the re-entrant corner `(1,1)`.
pub fn l_shape(metric: [f64; 3]) -> Mesh {
    let coords = vec![
        0.0, 0.0, // 0
        1.0, 0.0, // 1
        2.0, 0.0, // 2
        2.0, 1.0, // 3
        1.0, 1.0, // 4
        1.0, 2.0, // 5
        0.0, 2.0, // 6
        0.0, 1.0, // 7
    ];
    let enlist = vec![
        0, 1, 4, 0, 4, 7, // left-bottom square
        1, 2, 3, 1, 3, 4, // right-bottom square
        7, 4, 5, 7, 5, 6, // top-left square
    ];
    Mesh::new_2d(coords, metric.repeat(8), enlist).unwrap()
}

/// The twelve outward-wound surface triangles of the unit cube, one pair
/// per face, over corner indices 0..8.
pub fn cube_surface_triangles() -> Vec<usize> {
    vec![
        0, 3, 2, 0, 2, 1, // bottom  (z = 0)
        4, 5, 6, 4, 6, 7, // top     (z = 1)
        0, 1, 5, 0, 5, 4, // front   (y = 0)
        2, 3, 7, 2, 7, 6, // back    (y = 1)
        0, 4, 7, 0, 7, 3, // left    (x = 0)
        1, 2, 6, 1, 6, 5, // right   (x = 1)
    ]
}

/// Unit cube (corners 0..8) fanned into 12 tetrahedra around a ninth
/// vertex at `centre`.
pub fn cube_around_centre(centre: [f64; 3], metric: [f64; 6]) -> Mesh {
    let mut coords = vec![
        0.0, 0.0, 0.0, // 0
        1.0, 0.0, 0.0, // 1
        1.0, 1.0, 0.0, // 2
        0.0, 1.0, 0.0, // 3
        0.0, 0.0, 1.0, // 4
        1.0, 0.0, 1.0, // 5
        1.0, 1.0, 1.0, // 6
        0.0, 1.0, 1.0, // 7
    ];
    coords.extend_from_slice(&centre);

    let mut enlist = Vec::with_capacity(12 * 4);
    for tri in cube_surface_triangles().chunks_exact(3) {
        // Apex first; the face is outward-wound, so the tet is positive.
        enlist.push(8);
        enlist.extend_from_slice(tri);
    }
    Mesh::new_3d(coords, metric.repeat(9), enlist).unwrap()
}

/// `n × n` structured triangulation of the unit square with a per-vertex
/// isotropic metric `diag(scale[v], scale[v])`.
pub fn unit_square_grid(n: usize, scale: &[f64]) -> Mesh {
    let stride = n + 1;
    let h = 1.0 / n as f64;
    let mut coords = Vec::with_capacity(stride * stride * 2);
    let mut metric = Vec::with_capacity(stride * stride * 3);
    for j in 0..stride {
        for i in 0..stride {
            coords.push(i as f64 * h);
            coords.push(j as f64 * h);
            let s = scale[(j * stride + i) % scale.len()];
            metric.extend_from_slice(&[s, 0.0, s]);
        }
    }
    let mut enlist = Vec::with_capacity(n * n * 6);
    for j in 0..n {
        for i in 0..n {
            let a = j * stride + i;
            let b = a + stride;
            enlist.extend_from_slice(&[a, a + 1, b + 1]);
            enlist.extend_from_slice(&[a, b + 1, b]);
        }
    }
    Mesh::new_2d(coords, metric, enlist).unwrap()
}
