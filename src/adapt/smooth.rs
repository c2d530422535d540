//! Colour-scheduled vertex relaxation in metric space.
//!
//! One sweep visits every colour class in order; within a class the
//! kernels run in parallel against the frozen pre-class state (the class
//! is an independent set, so no kernel reads another's write) and accepted
//! moves are committed at the class boundary. After the first sweep only
//! vertices whose neighbourhood changed stay active. Boundary vertices
//! never move.
//!
//! Three kernels are available:
//! - **Laplacian**: metric-weighted barycentre of the one-ring, committed
//!   unconditionally (rejected only when the metric cannot be interpolated
//!   at the new position);
//! - **smart Laplacian**: same proposal, committed only when the worst
//!   incident quality improves;
//! - **optimisation Linf**: gradient ascent on the worst incident
//!   element's quality with a simplex-style step bound and a halving line
//!   search.

use log::warn;
use rayon::prelude::*;

use crate::colouring::{colour_classes, ColouringOracle, GreedyColouring};
use crate::comm::{Communicator, NoComm};
use crate::geometry::element::ElementProperty;
use crate::geometry::metric::PACKED_MAX;
use crate::mesh::{ElementId, Mesh, VertexId};
use crate::mesh_error::MeshAdaptError;
use crate::surface::Surface;

/// Quality improvement below which a smart-Laplacian move is discarded.
const EPSILON_Q: f64 = 1.0e-6;
/// Line-search halvings for the Linf kernel.
const LINE_SEARCH_STEPS: usize = 10;

/// Smoothing kernel selection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SmoothMethod {
    /// Metric-weighted Laplacian, committed unconditionally.
    Laplacian,
    /// Laplacian proposal, committed only on improvement.
    SmartLaplacian,
    /// Gradient ascent on the worst incident element quality.
    OptimisationLinf,
}

impl SmoothMethod {
    /// Parse a method name. Unknown names fall back to
    /// [`SmoothMethod::OptimisationLinf`] with a warning.
    pub fn parse(name: &str) -> Self {
        match name {
            "Laplacian" => SmoothMethod::Laplacian,
            "smart Laplacian" => SmoothMethod::SmartLaplacian,
            "optimisation Linf" => SmoothMethod::OptimisationLinf,
            other => {
                warn!("unknown smoothing method {other:?}; using \"optimisation Linf\"");
                SmoothMethod::OptimisationLinf
            }
        }
    }
}

/// An accepted kernel result waiting to be committed.
struct Move {
    vertex: VertexId,
    coords: [f64; 3],
    metric: [f64; PACKED_MAX],
    /// Refreshed qualities of the incident elements.
    quality: Vec<(ElementId, f64)>,
}

/// Vertex smoothing engine.
pub struct Smooth<'a> {
    mesh: &'a mut Mesh,
    surface: &'a Surface,
    property: ElementProperty,
    quality: Vec<f64>,
    good_q: f64,
}

impl<'a> Smooth<'a> {
    /// Bind the engine to a mesh and its surface index. Fails on an empty
    /// mesh.
    pub fn new(mesh: &'a mut Mesh, surface: &'a Surface) -> Result<Self, MeshAdaptError> {
        let property = mesh
            .reference_property()
            .ok_or(MeshAdaptError::DeadElement(0))?;
        Ok(Self {
            mesh,
            surface,
            property,
            quality: Vec::new(),
            good_q: 0.0,
        })
    }

    /// Serial convenience wrapper: [`NoComm`] and the built-in greedy
    /// colouring. Returns the number of accepted moves.
    pub fn smooth(
        &mut self,
        method: SmoothMethod,
        max_iterations: usize,
        quality_tol: Option<f64>,
    ) -> Result<usize, MeshAdaptError> {
        self.smooth_with(method, max_iterations, quality_tol, &NoComm, &GreedyColouring)
    }

    /// Run up to `max_iterations` sweeps of the chosen kernel over the
    /// interior owned vertices. `quality_tol`, when given, replaces the
    /// mean initial quality as the Linf kernel's "good enough" threshold.
    pub fn smooth_with<C: Communicator, O: ColouringOracle>(
        &mut self,
        method: SmoothMethod,
        max_iterations: usize,
        quality_tol: Option<f64>,
        com: &C,
        oracle: &O,
    ) -> Result<usize, MeshAdaptError> {
        self.init_cache(quality_tol);

        let colour = oracle.colour(self.mesh, 1);
        let classes = colour_classes(&colour);

        // Boundary vertices are immovable in this engine.
        let movable: Vec<bool> = (0..self.mesh.num_vertices())
            .map(|v| {
                self.mesh.is_live_vertex(v)
                    && self.mesh.is_owned_node(v)
                    && !self.mesh.node_neighbours[v].is_empty()
                    && !self.surface.contains_node(v)
            })
            .collect();

        // Elements straddling the partition boundary need their cached
        // quality refreshed after every halo exchange.
        let halo_elements: Vec<ElementId> = if com.size() > 1 {
            self.mesh
                .live_elements()
                .filter(|&e| {
                    self.mesh
                        .element_vertices(e)
                        .expect("live element")
                        .iter()
                        .any(|&v| !self.mesh.is_owned_node(v))
                })
                .collect()
        } else {
            Vec::new()
        };

        let mut active = vec![false; self.mesh.num_vertices()];
        let mut accepted_total = 0usize;

        for sweep in 0..max_iterations.max(1) {
            for class in &classes {
                let moves: Vec<Move> = {
                    let kernels = Kernels {
                        mesh: &*self.mesh,
                        property: self.property,
                        quality: &self.quality,
                        good_q: self.good_q,
                    };
                    class
                        .par_iter()
                        .filter(|&&v| movable[v] && (sweep == 0 || active[v]))
                        .filter_map(|&v| kernels.propose(method, v))
                        .collect()
                };

                // Sweeps after the first only revisit disturbed vertices.
                if sweep > 0 {
                    for &v in class {
                        active[v] = false;
                    }
                }
                accepted_total += moves.len();
                for mv in moves {
                    self.mesh
                        .set_position(mv.vertex, &mv.coords, &mv.metric);
                    for (e, q) in mv.quality {
                        self.quality[e] = q;
                    }
                    for &u in &self.mesh.node_neighbours[mv.vertex] {
                        active[u] = true;
                    }
                }

                if com.size() > 1 {
                    self.mesh.halo_exchange(com);
                    for &e in &halo_elements {
                        self.quality[e] = element_quality(self.mesh, &self.property, e);
                    }
                }
            }
        }
        Ok(accepted_total)
    }

    /// Seed the per-element quality cache and the "good enough" threshold.
    fn init_cache(&mut self, quality_tol: Option<f64>) {
        let mesh = &*self.mesh;
        let property = self.property;
        self.quality = (0..mesh.num_elements())
            .into_par_iter()
            .map(|e| {
                if mesh.is_live_element(e) {
                    element_quality(mesh, &property, e)
                } else {
                    // Holes must never rank as the worst element.
                    1.0
                }
            })
            .collect();
        let live = mesh.num_live_elements();
        let qsum: f64 = mesh.live_elements().map(|e| self.quality[e]).sum();
        self.good_q = match quality_tol {
            Some(tol) if tol > 0.0 => tol,
            _ => {
                if live > 0 {
                    qsum / live as f64
                } else {
                    0.0
                }
            }
        };
    }
}

/// Lipnikov quality of element `e` from the current fields.
fn element_quality(mesh: &Mesh, property: &ElementProperty, e: ElementId) -> f64 {
    let n = mesh.element_vertices(e).expect("live element");
    let xs: Vec<&[f64]> = n.iter().map(|&v| mesh.coords(v)).collect();
    let ms: Vec<&[f64]> = n.iter().map(|&v| mesh.metric(v)).collect();
    property.lipnikov(&xs, &ms)
}

/// Read-only kernel context shared by the workers of one colour class.
struct Kernels<'m> {
    mesh: &'m Mesh,
    property: ElementProperty,
    quality: &'m [f64],
    good_q: f64,
}

impl Kernels<'_> {
    fn propose(&self, method: SmoothMethod, v: VertexId) -> Option<Move> {
        match method {
            SmoothMethod::Laplacian => self.laplacian(v),
            SmoothMethod::SmartLaplacian => self.smart_laplacian(v),
            SmoothMethod::OptimisationLinf => self.optimisation_linf(v),
        }
    }

    /// Metric-weighted Laplacian move, accepted whenever the metric can be
    /// interpolated at the proposed position.
    fn laplacian(&self, v: VertexId) -> Option<Move> {
        let p = self.laplacian_position(v)?;
        let mp = self.interpolate_metric(v, &p)?;
        Some(Move {
            vertex: v,
            coords: p,
            metric: mp,
            quality: self.patch_quality_at(v, &p, &mp)?,
        })
    }

    /// Laplacian move accepted only if the worst incident quality improves
    /// by more than the acceptance threshold.
    fn smart_laplacian(&self, v: VertexId) -> Option<Move> {
        let p = self.laplacian_position(v)?;
        let mp = self.interpolate_metric(v, &p)?;
        let current: f64 = self.mesh.node_elements[v]
            .iter()
            .map(|&e| self.quality[e])
            .fold(f64::INFINITY, f64::min);
        let updates = self.patch_quality_at(v, &p, &mp)?;
        let proposed = updates
            .iter()
            .map(|&(_, q)| q)
            .fold(f64::INFINITY, f64::min);
        if proposed - current <= EPSILON_Q {
            return None;
        }
        Some(Move {
            vertex: v,
            coords: p,
            metric: mp,
            quality: updates,
        })
    }

    /// Gradient ascent on the worst incident element quality.
    fn optimisation_linf(&self, v: VertexId) -> Option<Move> {
        let ndims = self.mesh.ndims();
        let x0 = self.mesh.coords(v);
        let m0 = self.mesh.metric(v);

        let (worst_element, worst_q) = self.mesh.node_elements[v]
            .iter()
            .map(|&e| (e, self.quality[e]))
            .min_by(|a, b| a.1.total_cmp(&b.1))?;
        if worst_q > self.good_q {
            return None;
        }

        let grad_w = self.quality_gradient(worst_element, v, m0);
        let mag = grad_w.iter().map(|g| g * g).sum::<f64>().sqrt();
        if !mag.is_normal() {
            // A vanishing gradient here usually means a broken metric field.
            return None;
        }
        let search: Vec<f64> = grad_w.iter().map(|g| g / mag).collect();

        // Initial step: mean extent of the one-ring bounding box.
        let mut alpha = {
            let mut lo = [f64::INFINITY; 3];
            let mut hi = [f64::NEG_INFINITY; 3];
            for &u in &self.mesh.node_neighbours[v] {
                let x = self.mesh.coords(u);
                for d in 0..ndims {
                    lo[d] = lo[d].min(x[d]);
                    hi[d] = hi[d].max(x[d]);
                }
            }
            (0..ndims).map(|d| hi[d] - lo[d]).sum::<f64>() / (2.0 * ndims as f64)
        };

        // Clip against the linearised quality of every other incident
        // element: step no further than where it would drop to the worst.
        let s_dot_gw: f64 = search.iter().zip(&grad_w).map(|(s, g)| s * g).sum();
        for &e in &self.mesh.node_elements[v] {
            if e == worst_element {
                continue;
            }
            let grad = self.quality_gradient(e, v, m0);
            let s_dot_g: f64 = search.iter().zip(&grad).map(|(s, g)| s * g).sum();
            let denominator = s_dot_gw - s_dot_g;
            if denominator.abs() < f64::EPSILON {
                continue;
            }
            let bound = (self.quality[e] - worst_q) / denominator;
            if bound > 0.0 {
                alpha = alpha.min(bound);
            }
        }

        // Halving line search: every incident quality must strictly beat
        // the current worst.
        for _ in 0..LINE_SEARCH_STEPS {
            alpha *= 0.5;
            let mut p = [0.0; 3];
            for d in 0..ndims {
                p[d] = x0[d] + alpha * search[d];
            }
            let Some(mp) = self.interpolate_metric(v, &p) else {
                continue;
            };
            let Some(updates) = self.patch_quality_at(v, &p, &mp) else {
                continue;
            };
            if updates.iter().all(|&(_, q)| q > worst_q) {
                return Some(Move {
                    vertex: v,
                    coords: p,
                    metric: mp,
                    quality: updates,
                });
            }
        }
        None
    }

    /// Solve `(Σ_u M) (p − x_v) = Σ_u M (x_u − x_v)` for the proposed
    /// position `p`, using the metric at `v`.
    fn laplacian_position(&self, v: VertexId) -> Option<[f64; 3]> {
        let ndims = self.mesh.ndims();
        let x0 = self.mesh.coords(v);
        let m = self.mesh.metric(v);

        let mut lhs = [0.0f64; PACKED_MAX];
        let mut rhs = [0.0f64; 3];
        for &u in &self.mesh.node_neighbours[v] {
            let x = self.mesh.coords(u);
            let mut d = [0.0; 3];
            for i in 0..ndims {
                d[i] = x[i] - x0[i];
            }
            let mut md = [0.0; 3];
            crate::geometry::metric::apply(ndims, m, &d, &mut md);
            for i in 0..ndims {
                rhs[i] += md[i];
            }
            for (l, mi) in lhs.iter_mut().zip(m) {
                *l += mi;
            }
        }

        let rel = solve_sym(ndims, &lhs, &rhs)?;
        let mut p = [0.0; 3];
        for i in 0..ndims {
            p[i] = x0[i] + rel[i];
        }
        Some(p)
    }

    /// Interpolate the metric at `p` from the incident simplex maximising
    /// the minimum barycentric coordinate. Fails when moving `v` to `p`
    /// would invert one of its elements.
    fn interpolate_metric(&self, v: VertexId, p: &[f64; 3]) -> Option<[f64; PACKED_MAX]> {
        let mesh = self.mesh;
        let nloc = mesh.nloc();
        let mut best: Option<(f64, ElementId, Vec<f64>)> = None;

        for &e in &mesh.node_elements[v] {
            let n = mesh.element_vertices(e).expect("live element");
            let xs: Vec<&[f64]> = n.iter().map(|&u| mesh.coords(u)).collect();
            let total = self.property.measure(&xs);

            let mut weights = vec![0.0f64; nloc];
            let mut min_weight = f64::INFINITY;
            for i in 0..nloc {
                let mut sub = xs.clone();
                sub[i] = &p[..mesh.ndims()];
                let w = self.property.measure(&sub) / total;
                // The element whose vertex is being moved must not invert.
                if n[i] == v && w * total < 0.0 {
                    return None;
                }
                weights[i] = w;
                min_weight = min_weight.min(w);
            }
            let better = match &best {
                Some((tol, _, _)) => min_weight > *tol,
                None => true,
            };
            if better {
                best = Some((min_weight, e, weights));
            }
        }

        let (_, e, weights) = best?;
        let n = mesh.element_vertices(e).expect("live element");
        let msize = mesh.msize();
        let mut mp = [0.0f64; PACKED_MAX];
        for (i, &u) in n.iter().enumerate() {
            let m = mesh.metric(u);
            for j in 0..msize {
                mp[j] += weights[i] * m[j];
            }
        }
        crate::geometry::metric::is_spd(mesh.ndims(), &mp).then_some(mp)
    }

    /// Quality of every element incident to `v` with `v` moved to `p`
    /// carrying metric `mp`. `None` if any of them degenerates.
    fn patch_quality_at(
        &self,
        v: VertexId,
        p: &[f64; 3],
        mp: &[f64],
    ) -> Option<Vec<(ElementId, f64)>> {
        let mesh = self.mesh;
        let ndims = mesh.ndims();
        let mut out = Vec::with_capacity(mesh.node_elements[v].len());
        for &e in &mesh.node_elements[v] {
            let n = mesh.element_vertices(e).expect("live element");
            let xs: Vec<&[f64]> = n
                .iter()
                .map(|&u| if u == v { &p[..ndims] } else { mesh.coords(u) })
                .collect();
            let ms: Vec<&[f64]> = n
                .iter()
                .map(|&u| {
                    if u == v {
                        &mp[..mesh.msize()]
                    } else {
                        mesh.metric(u)
                    }
                })
                .collect();
            let q = self.property.lipnikov(&xs, &ms);
            if q.is_nan() {
                return None;
            }
            out.push((e, q));
        }
        Some(out)
    }

    /// Gradient of element `e`'s quality with respect to `v`'s position,
    /// with the element reordered so `v` leads (orientation preserved).
    fn quality_gradient(&self, e: ElementId, v: VertexId, m0: &[f64]) -> Vec<f64> {
        let mesh = self.mesh;
        let n = mesh.element_vertices(e).expect("live element");
        let ordered = lead_with(n, v);
        if mesh.ndims() == 2 {
            self.property
                .lipnikov_grad_2d(
                    mesh.coords(ordered[0]),
                    mesh.coords(ordered[1]),
                    mesh.coords(ordered[2]),
                    m0,
                )
                .to_vec()
        } else {
            self.property
                .lipnikov_grad_3d(
                    mesh.coords(ordered[0]),
                    mesh.coords(ordered[1]),
                    mesh.coords(ordered[2]),
                    mesh.coords(ordered[3]),
                    m0,
                )
                .to_vec()
        }
    }
}

/// Even permutation of the element's vertices that puts `v` first.
fn lead_with(n: &[VertexId], v: VertexId) -> Vec<VertexId> {
    let loc = n.iter().position(|&u| u == v).expect("vertex in element");
    if n.len() == 3 {
        match loc {
            0 => vec![n[0], n[1], n[2]],
            1 => vec![n[1], n[2], n[0]],
            _ => vec![n[2], n[0], n[1]],
        }
    } else {
        match loc {
            0 => vec![n[0], n[1], n[2], n[3]],
            1 => vec![n[1], n[2], n[0], n[3]],
            2 => vec![n[2], n[0], n[1], n[3]],
            _ => vec![n[3], n[0], n[2], n[1]],
        }
    }
}

/// Solve the small symmetric system `A x = b` by cofactor inversion;
/// `None` on a (near-)singular matrix.
fn solve_sym(ndims: usize, a: &[f64], b: &[f64]) -> Option<[f64; 3]> {
    let mut x = [0.0f64; 3];
    if ndims == 2 {
        let det = a[0] * a[2] - a[1] * a[1];
        if det.abs() < f64::EPSILON * (a[0].abs() + a[2].abs()).powi(2) {
            return None;
        }
        x[0] = (a[2] * b[0] - a[1] * b[1]) / det;
        x[1] = (a[0] * b[1] - a[1] * b[0]) / det;
    } else {
        let c00 = a[3] * a[5] - a[4] * a[4];
        let c01 = a[2] * a[4] - a[1] * a[5];
        let c02 = a[1] * a[4] - a[2] * a[3];
        let det = a[0] * c00 + a[1] * c01 + a[2] * c02;
        let scale = a[0].abs() + a[3].abs() + a[5].abs();
        if det.abs() < f64::EPSILON * scale.powi(3) {
            return None;
        }
        let c11 = a[0] * a[5] - a[2] * a[2];
        let c12 = a[1] * a[2] - a[0] * a[4];
        let c22 = a[0] * a[3] - a[1] * a[1];
        x[0] = (c00 * b[0] + c01 * b[1] + c02 * b[2]) / det;
        x[1] = (c01 * b[0] + c11 * b[1] + c12 * b[2]) / det;
        x[2] = (c02 * b[0] + c12 * b[1] + c22 * b[2]) / det;
    }
    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn parse_falls_back_to_linf() {
        assert_eq!(SmoothMethod::parse("Laplacian"), SmoothMethod::Laplacian);
        assert_eq!(
            SmoothMethod::parse("smart Laplacian"),
            SmoothMethod::SmartLaplacian
        );
        assert_eq!(
            SmoothMethod::parse("no such method"),
            SmoothMethod::OptimisationLinf
        );
    }

    #[test]
    fn symmetric_solvers_invert_known_systems() {
        // 2x2: A = [[2,1],[1,3]], b = (5, 10) → x = (1, 3)
        let x = solve_sym(2, &[2.0, 1.0, 3.0], &[5.0, 10.0]).unwrap();
        assert_relative_eq!(x[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(x[1], 3.0, epsilon = 1e-12);

        // Singular system is refused.
        assert!(solve_sym(2, &[1.0, 1.0, 1.0], &[1.0, 2.0]).is_none());

        // 3x3 identity-ish: A = diag(2,4,8)
        let a = [2.0, 0.0, 0.0, 4.0, 0.0, 8.0];
        let x = solve_sym(3, &a, &[2.0, 8.0, 32.0]).unwrap();
        assert_relative_eq!(x[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(x[1], 2.0, epsilon = 1e-12);
        assert_relative_eq!(x[2], 4.0, epsilon = 1e-12);
    }

    #[test]
    fn lead_with_preserves_even_parity() {
        let n = [10usize, 11, 12, 13];
        for &v in &n {
            let ordered = lead_with(&n, v);
            assert_eq!(ordered[0], v);
            // Even permutations of 4 elements can be sorted back with an
            // even number of swaps.
            let mut perm: Vec<usize> = ordered
                .iter()
                .map(|&x| n.iter().position(|&y| y == x).unwrap())
                .collect();
            let mut swaps = 0;
            for i in 0..perm.len() {
                while perm[i] != i {
                    let j = perm[i];
                    perm.swap(i, j);
                    swaps += 1;
                }
            }
            assert_eq!(swaps % 2, 0, "odd permutation for leading vertex {v}");
        }
    }
}
