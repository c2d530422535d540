//! Boundary surface extraction, co-planar patch labelling and
//! collapse-admissibility queries.
//!
//! The surface is rebuilt from the element list once, at construction, and
//! thereafter mutated in lockstep with coarsening through
//! [`Surface::collapse`] and [`Surface::append_facet`]. It holds only
//! vertex/facet indices plus its own facet list, patch ids and normals;
//! the [`Mesh`] stays the single owner of geometry, so methods that need
//! coordinates borrow it per call.
//!
//! Patch ids partition the boundary facets into maximal connected sets of
//! near-coplanar facets (normal dot product against the patch seed at or
//! above the configured tolerance). A boundary vertex incident to one patch
//! is free to slide inside it, one incident to `D` or more patches is a
//! geometric corner and immovable, and in 3D a vertex on exactly two
//! patches lies on a geometric edge.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use hashbrown::HashMap;

use crate::mesh::{ElementId, Mesh, VertexId};
use crate::mesh_error::MeshAdaptError;

/// Index of a boundary facet. Stable; may become a hole after collapses.
pub type FacetId = usize;

/// Classification of a boundary vertex by incident patch count.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VertexClass {
    /// Interior of a single co-planar patch.
    Patch,
    /// On the geometric edge between two patches (3D only).
    Edge,
    /// Meeting point of `D` or more patches; immovable.
    Corner,
}

/// Boundary index of a simplicial mesh.
pub struct Surface {
    ndims: usize,
    snloc: usize,
    tolerance: f64,
    facets: Vec<VertexId>,
    facet_live: Vec<bool>,
    coplanar_ids: Vec<i32>,
    normals: Vec<f64>,
    node_facets: BTreeMap<VertexId, BTreeSet<FacetId>>,
    surface_nodes: BTreeSet<VertexId>,
}

/// Default dot-product tolerance for the co-planar flood fill.
pub const COPLANAR_TOLERANCE: f64 = 0.999_999_9;

impl Surface {
    /// Extract the boundary of `mesh` with the default co-planar tolerance.
    pub fn new(mesh: &Mesh) -> Result<Self, MeshAdaptError> {
        Self::with_tolerance(mesh, COPLANAR_TOLERANCE)
    }

    /// Extract the boundary of `mesh`, flood-filling patches with the given
    /// normal dot-product tolerance.
    pub fn with_tolerance(mesh: &Mesh, tolerance: f64) -> Result<Self, MeshAdaptError> {
        let mut surface = Self {
            ndims: mesh.ndims(),
            snloc: mesh.snloc(),
            tolerance,
            facets: Vec::new(),
            facet_live: Vec::new(),
            coplanar_ids: Vec::new(),
            normals: Vec::new(),
            node_facets: BTreeMap::new(),
            surface_nodes: BTreeSet::new(),
        };
        surface.find_surface(mesh)?;
        surface.calculate_coplanar_ids(mesh)?;
        Ok(surface)
    }

    // --- queries ---------------------------------------------------------

    /// Facet array length, holes included.
    #[inline]
    pub fn num_facets(&self) -> usize {
        self.facet_live.len()
    }

    /// Number of facets that have not been deleted.
    pub fn num_live_facets(&self) -> usize {
        self.facet_live.iter().filter(|l| **l).count()
    }

    /// Iterate over live facet ids.
    pub fn live_facets(&self) -> impl Iterator<Item = FacetId> + '_ {
        self.facet_live
            .iter()
            .enumerate()
            .filter_map(|(f, &live)| live.then_some(f))
    }

    /// Vertex tuple of facet `f`, or `None` if `f` is a hole.
    #[inline]
    pub fn facet(&self, f: FacetId) -> Option<&[VertexId]> {
        if f < self.facet_live.len() && self.facet_live[f] {
            Some(&self.facets[f * self.snloc..(f + 1) * self.snloc])
        } else {
            None
        }
    }

    /// Co-planar patch id of facet `f` (≥ 1).
    #[inline]
    pub fn coplanar_id(&self, f: FacetId) -> i32 {
        self.coplanar_ids[f]
    }

    /// Unit normal of facet `f`, outward for positively-oriented meshes.
    #[inline]
    pub fn normal(&self, f: FacetId) -> &[f64] {
        &self.normals[f * self.ndims..(f + 1) * self.ndims]
    }

    /// True if vertex `v` lies on the boundary.
    #[inline]
    pub fn contains_node(&self, v: VertexId) -> bool {
        self.surface_nodes.contains(&v)
    }

    /// Number of boundary vertices.
    pub fn num_surface_nodes(&self) -> usize {
        self.surface_nodes.len()
    }

    /// Facets incident to vertex `v`.
    pub fn surface_patch(&self, v: VertexId) -> Option<&BTreeSet<FacetId>> {
        self.node_facets.get(&v)
    }

    /// Distinct patch ids among the facets incident to `v`.
    pub fn incident_planes(&self, v: VertexId) -> BTreeSet<i32> {
        self.node_facets
            .get(&v)
            .into_iter()
            .flatten()
            .map(|&f| self.coplanar_ids[f])
            .collect()
    }

    /// True if `v` is a geometric corner (incident to ≥ `D` patches).
    pub fn is_corner_vertex(&self, v: VertexId) -> bool {
        self.incident_planes(v).len() >= self.ndims
    }

    /// Classify a boundary vertex, or `None` for interior vertices.
    pub fn classify_vertex(&self, v: VertexId) -> Option<VertexClass> {
        if !self.contains_node(v) {
            return None;
        }
        let planes = self.incident_planes(v).len();
        Some(if planes >= self.ndims {
            VertexClass::Corner
        } else if self.ndims == 3 && planes == 2 {
            VertexClass::Edge
        } else {
            VertexClass::Patch
        })
    }

    /// May `free` be collapsed onto `target` without damaging the geometry?
    ///
    /// Unconstrained off the surface; corners never move; a vertex on a
    /// geometric edge needs both bounding patches present at the target;
    /// a patch-interior vertex needs its patch present at the target.
    pub fn is_collapsible(&self, free: VertexId, target: VertexId) -> bool {
        if !self.contains_node(free) {
            return true;
        }
        let planes_free = self.incident_planes(free);
        if planes_free.len() >= self.ndims {
            return false;
        }
        let planes_target = self.incident_planes(target);
        planes_free.iter().all(|p| planes_target.contains(p))
    }

    /// Facets of `element_vertices` that lie on the surface: every facet
    /// whose vertex set is contained in the element's vertex set.
    pub fn find_facets(&self, element_vertices: &[VertexId]) -> Vec<FacetId> {
        let verts: BTreeSet<VertexId> = element_vertices.iter().copied().collect();
        let mut out = BTreeSet::new();
        for v in element_vertices {
            if let Some(facets) = self.node_facets.get(v) {
                for &f in facets {
                    if self.facet(f).is_some_and(|fv| fv.iter().all(|u| verts.contains(u))) {
                        out.insert(f);
                    }
                }
            }
        }
        out.into_iter().collect()
    }

    // --- mutators --------------------------------------------------------

    /// Append a facet received from a peer partition, carrying its patch
    /// id. The normal is recomputed from the current coordinates.
    pub fn append_facet(&mut self, mesh: &Mesh, verts: &[VertexId], coplanar_id: i32) -> FacetId {
        debug_assert_eq!(verts.len(), self.snloc);
        let f = self.num_facets();
        self.facets.extend_from_slice(verts);
        self.facet_live.push(true);
        self.coplanar_ids.push(coplanar_id);
        let normal = self.facet_normal(mesh, verts);
        self.normals.extend_from_slice(&normal[..self.ndims]);
        for &v in verts {
            self.node_facets.entry(v).or_default().insert(f);
            self.surface_nodes.insert(v);
        }
        f
    }

    /// Mirror an element-level contraction `free → target` on the surface:
    /// facets containing both endpoints are deleted, every other facet
    /// incident to `free` is rewritten to reference `target`.
    ///
    /// Callers must have established [`Surface::is_collapsible`].
    pub fn collapse(&mut self, free: VertexId, target: VertexId) {
        debug_assert!(self.is_collapsible(free, target));

        // Snapshot before mutating; the loops below edit node_facets.
        let incident: Vec<FacetId> = self
            .node_facets
            .get(&free)
            .into_iter()
            .flatten()
            .copied()
            .collect();
        let target_facets: BTreeSet<FacetId> = self
            .node_facets
            .get(&target)
            .cloned()
            .unwrap_or_default();

        for f in incident {
            if target_facets.contains(&f) {
                // Shared facet degenerates under the contraction.
                let verts: Vec<VertexId> =
                    self.facets[f * self.snloc..(f + 1) * self.snloc].to_vec();
                for v in verts {
                    if let Some(set) = self.node_facets.get_mut(&v) {
                        set.remove(&f);
                    }
                }
                self.facet_live[f] = false;
            } else {
                for slot in self.facets[f * self.snloc..(f + 1) * self.snloc].iter_mut() {
                    if *slot == free {
                        *slot = target;
                        break;
                    }
                }
                self.node_facets.entry(target).or_default().insert(f);
            }
        }

        self.node_facets.remove(&free);
        self.surface_nodes.remove(&free);
    }

    // --- construction ----------------------------------------------------

    /// Identify the boundary: enumerate every element facet, cancel pairs,
    /// and keep the survivors with outward orientation.
    fn find_surface(&mut self, mesh: &Mesh) -> Result<(), MeshAdaptError> {
        let nloc = mesh.nloc();
        let mut parity: HashMap<Vec<VertexId>, Vec<VertexId>> = HashMap::new();
        for e in mesh.live_elements() {
            let n = mesh.element_vertices(e).expect("live element");
            for j in 0..nloc {
                let oriented = oriented_facet(self.ndims, n, j);
                let mut key = oriented.clone();
                key.sort_unstable();
                if parity.remove(&key).is_none() {
                    parity.insert(key, oriented);
                }
            }
        }

        let mut boundary: Vec<Vec<VertexId>> = parity.into_values().collect();
        boundary.sort_unstable();
        for oriented in boundary {
            let f = self.facet_live.len();
            for &v in &oriented {
                self.node_facets.entry(v).or_default().insert(f);
                self.surface_nodes.insert(v);
            }
            self.facets.extend_from_slice(&oriented);
            self.facet_live.push(true);
        }
        Ok(())
    }

    /// Partition the boundary into co-planar patches by flood fill.
    fn calculate_coplanar_ids(&mut self, mesh: &Mesh) -> Result<(), MeshAdaptError> {
        let nfacets = self.num_facets();
        self.normals = vec![0.0; nfacets * self.ndims];
        for f in 0..nfacets {
            let verts: Vec<VertexId> = self.facets[f * self.snloc..(f + 1) * self.snloc].to_vec();
            let normal = self.facet_normal(mesh, &verts);
            self.normals[f * self.ndims..(f + 1) * self.ndims]
                .copy_from_slice(&normal[..self.ndims]);
        }

        let adjacency = self.facet_adjacency()?;

        self.coplanar_ids = vec![0; nfacets];
        let mut current_id = 1;
        for seed in 0..nfacets {
            if self.coplanar_ids[seed] != 0 {
                continue;
            }
            self.coplanar_ids[seed] = current_id;
            let ref_normal: Vec<f64> =
                self.normals[seed * self.ndims..(seed + 1) * self.ndims].to_vec();

            let mut front = VecDeque::new();
            front.push_back(seed);
            while let Some(f) = front.pop_front() {
                for &g in &adjacency[f] {
                    if self.coplanar_ids[g] != 0 {
                        continue;
                    }
                    let dot: f64 = (0..self.ndims)
                        .map(|d| ref_normal[d] * self.normals[g * self.ndims + d])
                        .sum();
                    if dot >= self.tolerance {
                        self.coplanar_ids[g] = current_id;
                        front.push_back(g);
                    }
                }
            }
            current_id += 1;
        }
        Ok(())
    }

    /// Facet→facet adjacency: two facets are neighbours when they share
    /// `snloc − 1` vertices. The boundary of a compact domain is closed, so
    /// every facet has exactly `snloc` neighbours.
    fn facet_adjacency(&self) -> Result<Vec<Vec<FacetId>>, MeshAdaptError> {
        let nfacets = self.num_facets();
        let mut adjacency = vec![Vec::with_capacity(self.snloc); nfacets];
        for f in 0..nfacets {
            let verts = &self.facets[f * self.snloc..(f + 1) * self.snloc];
            if self.snloc == 2 {
                for &v in verts {
                    let other = self.node_facets[&v].iter().copied().find(|&g| g != f);
                    match other {
                        Some(g) => adjacency[f].push(g),
                        None => {
                            return Err(MeshAdaptError::BrokenSurface(format!(
                                "boundary vertex {v} has a single incident facet"
                            )))
                        }
                    }
                }
            } else {
                for j in 0..3 {
                    let a = verts[(j + 1) % 3];
                    let b = verts[(j + 2) % 3];
                    let other = self.node_facets[&a]
                        .iter()
                        .copied()
                        .find(|&g| g != f && self.node_facets[&b].contains(&g));
                    match other {
                        Some(g) => adjacency[f].push(g),
                        None => {
                            return Err(MeshAdaptError::BrokenSurface(format!(
                                "boundary edge ({a}, {b}) has a single incident facet"
                            )))
                        }
                    }
                }
            }
        }
        Ok(adjacency)
    }

    fn facet_normal(&self, mesh: &Mesh, verts: &[VertexId]) -> [f64; 3] {
        let mut n = [0.0; 3];
        if self.ndims == 2 {
            let a = mesh.coords(verts[0]);
            let b = mesh.coords(verts[1]);
            let d = [b[0] - a[0], b[1] - a[1]];
            let mag = (d[0] * d[0] + d[1] * d[1]).sqrt();
            n[0] = d[1] / mag;
            n[1] = -d[0] / mag;
        } else {
            let x0 = mesh.coords(verts[0]);
            let x1 = mesh.coords(verts[1]);
            let x2 = mesh.coords(verts[2]);
            let u = [x1[0] - x0[0], x1[1] - x0[1], x1[2] - x0[2]];
            let w = [x2[0] - x0[0], x2[1] - x0[1], x2[2] - x0[2]];
            n = [
                u[1] * w[2] - u[2] * w[1],
                u[2] * w[0] - u[0] * w[2],
                u[0] * w[1] - u[1] * w[0],
            ];
            let mag = (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt();
            for v in n.iter_mut() {
                *v /= mag;
            }
        }
        n
    }

    /// Cross-check the surface against the mesh: every live facet is the
    /// boundary complement of exactly one live element, every boundary
    /// vertex appears in a facet, and the node→facet index is exact.
    pub fn validate_against(&self, mesh: &Mesh) -> Result<(), MeshAdaptError> {
        // Re-derive the boundary facet multiset from the element list.
        let mut parity: HashMap<Vec<VertexId>, ElementId> = HashMap::new();
        for e in mesh.live_elements() {
            let n = mesh.element_vertices(e).expect("live element");
            for j in 0..mesh.nloc() {
                let mut key = oriented_facet(self.ndims, n, j);
                key.sort_unstable();
                if parity.remove(&key).is_none() {
                    parity.insert(key, e);
                }
            }
        }

        let mut expected_nodes = BTreeSet::new();
        for key in parity.keys() {
            expected_nodes.extend(key.iter().copied());
        }

        let mut seen = 0usize;
        for f in self.live_facets() {
            let mut key = self.facet(f).expect("live facet").to_vec();
            key.sort_unstable();
            if !parity.contains_key(&key) {
                return Err(MeshAdaptError::BrokenSurface(format!(
                    "facet {f} {key:?} is not a boundary facet of any live element"
                )));
            }
            seen += 1;
        }
        if seen != parity.len() {
            return Err(MeshAdaptError::BrokenSurface(format!(
                "surface holds {seen} live facets, mesh boundary has {}",
                parity.len()
            )));
        }
        if self.surface_nodes != expected_nodes {
            return Err(MeshAdaptError::BrokenSurface(
                "surface node set disagrees with the facet list".into(),
            ));
        }
        for (&v, facets) in &self.node_facets {
            for &f in facets {
                if !self.facet(f).is_some_and(|fv| fv.contains(&v)) {
                    return Err(MeshAdaptError::BrokenSurface(format!(
                        "node_facets[{v}] lists facet {f} which does not contain it"
                    )));
                }
            }
        }
        for f in self.live_facets() {
            for &v in self.facet(f).expect("live facet") {
                if !self.node_facets.get(&v).is_some_and(|s| s.contains(&f)) {
                    return Err(MeshAdaptError::BrokenSurface(format!(
                        "facet {f} missing from node_facets[{v}]"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// The oriented boundary facet of element `n` opposite local vertex `j`,
/// wound so the normal points out of a positively-oriented element.
fn oriented_facet(ndims: usize, n: &[VertexId], j: usize) -> Vec<VertexId> {
    if ndims == 2 {
        vec![n[(j + 1) % 3], n[(j + 2) % 3]]
    } else {
        match j {
            0 => vec![n[1], n[2], n[3]],
            1 => vec![n[0], n[3], n[2]],
            2 => vec![n[0], n[1], n[3]],
            _ => vec![n[0], n[2], n[1]],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn unit_square() -> Mesh {
        let coords = vec![0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0];
        let metric = [1.0, 0.0, 1.0].repeat(4);
        Mesh::new_2d(coords, metric, vec![0, 1, 2, 0, 2, 3]).unwrap()
    }

    #[test]
    fn square_boundary_has_four_patches() {
        let mesh = unit_square();
        let surface = Surface::new(&mesh).unwrap();
        assert_eq!(surface.num_live_facets(), 4);
        assert_eq!(surface.num_surface_nodes(), 4);
        let ids: BTreeSet<i32> = surface.live_facets().map(|f| surface.coplanar_id(f)).collect();
        assert_eq!(ids.len(), 4);
        // Every corner of the square is a corner vertex.
        for v in 0..4 {
            assert_eq!(surface.classify_vertex(v), Some(VertexClass::Corner));
        }
        surface.validate_against(&mesh).unwrap();
    }

    #[test]
    fn square_normals_point_outward() {
        let mesh = unit_square();
        let surface = Surface::new(&mesh).unwrap();
        for f in surface.live_facets() {
            let verts = surface.facet(f).unwrap();
            let mid = [
                0.5 * (mesh.coords(verts[0])[0] + mesh.coords(verts[1])[0]),
                0.5 * (mesh.coords(verts[0])[1] + mesh.coords(verts[1])[1]),
            ];
            let n = surface.normal(f);
            // Outward means pointing away from the square's centre.
            let outward = (mid[0] - 0.5) * n[0] + (mid[1] - 0.5) * n[1];
            assert!(outward > 0.0, "facet {f} normal {n:?} at {mid:?}");
            assert_relative_eq!(n[0] * n[0] + n[1] * n[1], 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn collapse_rewrites_and_deletes_facets() {
        // Split one square edge: boundary path 0-4-1 along the bottom.
        let coords = vec![0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0, 0.5, 0.0];
        let metric = [1.0, 0.0, 1.0].repeat(5);
        let mesh =
            Mesh::new_2d(coords, metric, vec![0, 4, 3, 4, 2, 3, 4, 1, 2]).unwrap();
        let mut surface = Surface::new(&mesh).unwrap();
        assert_eq!(surface.num_live_facets(), 5);

        // Vertex 4 sits inside the bottom patch and may slide along it.
        assert_eq!(surface.classify_vertex(4), Some(VertexClass::Patch));
        assert!(surface.is_collapsible(4, 0));
        assert!(surface.is_collapsible(4, 1));
        assert!(!surface.is_collapsible(0, 4), "corner must not collapse");

        surface.collapse(4, 0);
        assert!(!surface.contains_node(4));
        assert_eq!(surface.num_live_facets(), 4);
        // The surviving bottom facet now runs 0 → 1.
        let bottom: Vec<_> = surface
            .live_facets()
            .filter(|&f| surface.facet(f).unwrap().contains(&1) && surface.facet(f).unwrap().contains(&0))
            .collect();
        assert_eq!(bottom.len(), 1);
    }
}
