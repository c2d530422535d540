//! The mutable mesh graph store.
//!
//! [`Mesh`] is the single source of truth shared by the surface index, the
//! coarsening engine and the smoother. It owns vertex coordinates, the
//! per-vertex metric field, the element→node list and every derived
//! adjacency: node→element ([`Mesh::node_elements`]), node→node
//! ([`Mesh::node_neighbours`]) and the edge map with cached metric lengths.
//!
//! # Invariants
//! The mutators (`append_element`, `erase_element`,
//! `rewrite_element_vertex`, `set_position`, `erase_vertex`) maintain:
//! - `e ∈ node_elements[v] ⇔ v ∈ element(e)`;
//! - `w ∈ node_neighbours[v] ⇔ v,w co-occur in a live element`, symmetric;
//! - the edge map keys are exactly the co-occurring pairs and each edge's
//!   `adjacent_elements` is exactly its incident live element set;
//! - each cached edge length equals `√(dᵀ M̄ d)` for the current
//!   coordinates and metrics.
//!
//! Positive element volume and every surface invariant are the caller's
//! responsibility. [`Mesh::validate_invariants`] re-derives the lot for
//! tests and the `strict-invariants` build.
//!
//! Vertex and element ids are stable across mutation; deletion leaves a
//! hole that is skipped by the live iterators.

pub mod edge;

use std::collections::BTreeSet;

use hashbrown::HashMap;

use crate::comm::{self, Communicator};
use crate::geometry::element::ElementProperty;
use crate::geometry::metric;
use crate::mesh_error::MeshAdaptError;

pub use edge::{EdgeData, EdgeKey};

/// Index of a vertex in `[0, num_vertices)`. Stable; may become a hole.
pub type VertexId = usize;
/// Index of an element in `[0, num_elements)`. Stable; may become a hole.
pub type ElementId = usize;

/// Placeholder for a global id that has not been assigned yet.
pub const UNSET_GID: usize = usize::MAX;

/// Unstructured simplicial mesh with a per-vertex metric field.
pub struct Mesh {
    ndims: usize,
    nloc: usize,
    coords: Vec<f64>,
    metric: Vec<f64>,
    enlist: Vec<VertexId>,
    vertex_live: Vec<bool>,
    element_live: Vec<bool>,

    /// Node→element adjacency (`NEList`).
    pub node_elements: Vec<BTreeSet<ElementId>>,
    /// Node→node adjacency (`NNList`). Unsorted; mirrors the edge map.
    pub node_neighbours: Vec<Vec<VertexId>>,
    /// Edge map keyed by the unordered endpoint pair.
    pub edges: HashMap<EdgeKey, EdgeData>,

    rank: usize,
    nranks: usize,
    owner: Vec<usize>,
    global_ids: Vec<usize>,
    /// Per-rank lists of owned vertices the peer needs updates for.
    pub send: Vec<Vec<VertexId>>,
    /// Per-rank lists of ghost vertices updated by the peer.
    pub recv: Vec<Vec<VertexId>>,
    /// Union of the send lists.
    pub send_halo: BTreeSet<VertexId>,
    /// Union of the recv lists.
    pub recv_halo: BTreeSet<VertexId>,
}

impl Mesh {
    /// Build a 2D (triangle) mesh. `coords` is xy-interleaved, `metric`
    /// packs `[m00, m01, m11]` per vertex, `enlist` is 3-strided.
    pub fn new_2d(
        coords: Vec<f64>,
        metric: Vec<f64>,
        enlist: Vec<VertexId>,
    ) -> Result<Self, MeshAdaptError> {
        Self::new(2, coords, metric, enlist)
    }

    /// Build a 3D (tetrahedron) mesh. `coords` is xyz-interleaved, `metric`
    /// packs `[m00, m01, m02, m11, m12, m22]` per vertex, `enlist` is
    /// 4-strided.
    pub fn new_3d(
        coords: Vec<f64>,
        metric: Vec<f64>,
        enlist: Vec<VertexId>,
    ) -> Result<Self, MeshAdaptError> {
        Self::new(3, coords, metric, enlist)
    }

    fn new(
        ndims: usize,
        coords: Vec<f64>,
        metric: Vec<f64>,
        enlist: Vec<VertexId>,
    ) -> Result<Self, MeshAdaptError> {
        if ndims != 2 && ndims != 3 {
            return Err(MeshAdaptError::UnsupportedDimension(ndims));
        }
        let nloc = ndims + 1;
        let msize = metric::packed_len(ndims);
        let nnodes = coords.len() / ndims;
        let nelements = enlist.len() / nloc;

        for v in 0..nnodes {
            if coords[v * ndims..(v + 1) * ndims].iter().any(|c| !c.is_finite()) {
                return Err(MeshAdaptError::NonFiniteCoordinate(v));
            }
            if !metric::is_spd(ndims, &metric[v * msize..(v + 1) * msize]) {
                return Err(MeshAdaptError::NonSpdMetric(v));
            }
        }
        for (e, chunk) in enlist.chunks_exact(nloc).enumerate() {
            for &v in chunk {
                if v >= nnodes {
                    return Err(MeshAdaptError::VertexOutOfRange {
                        element: e,
                        vertex: v,
                        nnodes,
                    });
                }
            }
        }

        let mut mesh = Self {
            ndims,
            nloc,
            coords,
            metric,
            enlist,
            vertex_live: vec![true; nnodes],
            element_live: vec![true; nelements],
            node_elements: vec![BTreeSet::new(); nnodes],
            node_neighbours: vec![Vec::new(); nnodes],
            edges: HashMap::new(),
            rank: 0,
            nranks: 1,
            owner: vec![0; nnodes],
            global_ids: (0..nnodes).collect(),
            send: vec![Vec::new()],
            recv: vec![Vec::new()],
            send_halo: BTreeSet::new(),
            recv_halo: BTreeSet::new(),
        };
        mesh.build_adjacency();

        // All input elements must agree with the reference orientation.
        if let Some(property) = mesh.reference_property() {
            for e in 0..mesh.num_elements() {
                if !mesh.element_live[e] {
                    continue;
                }
                let vol = mesh.element_measure(&property, e);
                if vol <= 0.0 || !vol.is_finite() {
                    return Err(MeshAdaptError::InvertedElement { element: e, volume: vol });
                }
            }
        }
        Ok(mesh)
    }

    fn build_adjacency(&mut self) {
        for e in 0..self.num_elements() {
            if !self.element_live[e] {
                continue;
            }
            let verts: Vec<VertexId> = self.element_vertices(e).unwrap_or(&[]).to_vec();
            for &v in &verts {
                self.node_elements[v].insert(e);
            }
            for i in 0..self.nloc {
                for j in (i + 1)..self.nloc {
                    self.link_edge(verts[i], verts[j], e);
                }
            }
        }
    }

    /// Install partitioning descriptors produced by the loader. `owner[v]`
    /// is the owning rank of each vertex; `send[p]`/`recv[p]` list the halo
    /// vertices exchanged with rank `p`.
    pub fn set_partition(
        &mut self,
        rank: usize,
        nranks: usize,
        owner: Vec<usize>,
        send: Vec<Vec<VertexId>>,
        recv: Vec<Vec<VertexId>>,
    ) -> Result<(), MeshAdaptError> {
        if owner.len() != self.num_vertices() || send.len() != nranks || recv.len() != nranks {
            return Err(MeshAdaptError::BrokenHalo(format!(
                "descriptor sizes (owner {}, send {}, recv {}) do not match nranks {} / nnodes {}",
                owner.len(),
                send.len(),
                recv.len(),
                nranks,
                self.num_vertices()
            )));
        }
        for (v, &r) in owner.iter().enumerate() {
            if r >= nranks {
                return Err(MeshAdaptError::BrokenHalo(format!(
                    "vertex {v} owned by rank {r} out of {nranks}"
                )));
            }
        }
        self.rank = rank;
        self.nranks = nranks;
        self.owner = owner;
        self.send_halo = send.iter().flatten().copied().collect();
        self.recv_halo = recv.iter().flatten().copied().collect();
        self.send = send;
        self.recv = recv;
        Ok(())
    }

    // --- counts and classification -------------------------------------

    /// Spatial dimension (2 or 3).
    #[inline]
    pub fn ndims(&self) -> usize {
        self.ndims
    }

    /// Vertices per element (`D + 1`).
    #[inline]
    pub fn nloc(&self) -> usize {
        self.nloc
    }

    /// Vertices per boundary facet (`D`).
    #[inline]
    pub fn snloc(&self) -> usize {
        self.ndims
    }

    /// Packed metric entries per vertex.
    #[inline]
    pub fn msize(&self) -> usize {
        metric::packed_len(self.ndims)
    }

    /// Vertex array length, holes included.
    #[inline]
    pub fn num_vertices(&self) -> usize {
        self.vertex_live.len()
    }

    /// Element array length, holes included.
    #[inline]
    pub fn num_elements(&self) -> usize {
        self.element_live.len()
    }

    /// Number of vertices that have not been deleted.
    pub fn num_live_vertices(&self) -> usize {
        self.vertex_live.iter().filter(|l| **l).count()
    }

    /// Number of elements that have not been deleted.
    pub fn num_live_elements(&self) -> usize {
        self.element_live.iter().filter(|l| **l).count()
    }

    #[inline]
    pub fn is_live_vertex(&self, v: VertexId) -> bool {
        v < self.vertex_live.len() && self.vertex_live[v]
    }

    #[inline]
    pub fn is_live_element(&self, e: ElementId) -> bool {
        e < self.element_live.len() && self.element_live[e]
    }

    /// Iterate over live vertex ids.
    pub fn live_vertices(&self) -> impl Iterator<Item = VertexId> + '_ {
        self.vertex_live
            .iter()
            .enumerate()
            .filter_map(|(v, &live)| live.then_some(v))
    }

    /// Iterate over live element ids.
    pub fn live_elements(&self) -> impl Iterator<Item = ElementId> + '_ {
        self.element_live
            .iter()
            .enumerate()
            .filter_map(|(e, &live)| live.then_some(e))
    }

    // --- geometry access ------------------------------------------------

    /// Vertex tuple of element `e`, or `None` if `e` is a hole.
    #[inline]
    pub fn element_vertices(&self, e: ElementId) -> Option<&[VertexId]> {
        if self.is_live_element(e) {
            Some(&self.enlist[e * self.nloc..(e + 1) * self.nloc])
        } else {
            None
        }
    }

    /// Coordinates of vertex `v`.
    #[inline]
    pub fn coords(&self, v: VertexId) -> &[f64] {
        &self.coords[v * self.ndims..(v + 1) * self.ndims]
    }

    /// Packed metric of vertex `v`.
    #[inline]
    pub fn metric(&self, v: VertexId) -> &[f64] {
        let msize = self.msize();
        &self.metric[v * msize..(v + 1) * msize]
    }

    /// Metric length of the segment between `a` and `b` under the mean of
    /// their metrics, recomputed from the current field.
    pub fn calc_edge_length(&self, a: VertexId, b: VertexId) -> f64 {
        metric::edge_length(
            self.ndims,
            self.metric(a),
            self.metric(b),
            self.coords(a),
            self.coords(b),
        )
    }

    /// Cached metric length of the edge `(a, b)`, if the edge exists.
    pub fn edge_length(&self, a: VertexId, b: VertexId) -> Option<f64> {
        self.edges.get(&EdgeKey::new(a, b)).map(|d| d.length)
    }

    /// The adjacent-vertex set of `v` as an ordered set.
    pub fn node_patch(&self, v: VertexId) -> BTreeSet<VertexId> {
        self.node_neighbours[v].iter().copied().collect()
    }

    /// Geometric kernels oriented by the first live element, or `None` on
    /// an empty mesh.
    pub fn reference_property(&self) -> Option<ElementProperty> {
        let e = self.live_elements().next()?;
        let n = self.element_vertices(e)?;
        Some(if self.ndims == 2 {
            ElementProperty::from_triangle(self.coords(n[0]), self.coords(n[1]), self.coords(n[2]))
        } else {
            ElementProperty::from_tetrahedron(
                self.coords(n[0]),
                self.coords(n[1]),
                self.coords(n[2]),
                self.coords(n[3]),
            )
        })
    }

    /// Signed measure (area/volume) of element `e`.
    pub fn element_measure(&self, property: &ElementProperty, e: ElementId) -> f64 {
        let n = &self.enlist[e * self.nloc..(e + 1) * self.nloc];
        if self.ndims == 2 {
            property.area(self.coords(n[0]), self.coords(n[1]), self.coords(n[2]))
        } else {
            property.volume(
                self.coords(n[0]),
                self.coords(n[1]),
                self.coords(n[2]),
                self.coords(n[3]),
            )
        }
    }

    // --- ownership and halo --------------------------------------------

    /// Rank of this partition.
    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of partitions.
    #[inline]
    pub fn nranks(&self) -> usize {
        self.nranks
    }

    /// Owning rank of vertex `v`.
    #[inline]
    pub fn owner(&self, v: VertexId) -> usize {
        self.owner[v]
    }

    #[inline]
    pub fn set_owner(&mut self, v: VertexId, rank: usize) {
        self.owner[v] = rank;
    }

    /// True if `v` is owned by this partition.
    #[inline]
    pub fn is_owned_node(&self, v: VertexId) -> bool {
        self.owner[v] == self.rank
    }

    /// True if `v` participates in any halo exchange.
    #[inline]
    pub fn is_halo_node(&self, v: VertexId) -> bool {
        self.send_halo.contains(&v) || self.recv_halo.contains(&v)
    }

    /// Global id of vertex `v` ([`UNSET_GID`] before numbering).
    #[inline]
    pub fn global_id(&self, v: VertexId) -> usize {
        self.global_ids[v]
    }

    #[inline]
    pub fn set_global_id(&mut self, v: VertexId, gid: usize) {
        self.global_ids[v] = gid;
    }

    /// Assign contiguous global ids: owned vertices are numbered by rank
    /// offset (exclusive prefix sum of owned counts), then halo vertices
    /// learn their ids from the owning rank through the send/recv lists.
    pub fn create_global_node_numbering<C: Communicator>(
        &mut self,
        com: &C,
    ) -> Result<(), MeshAdaptError> {
        if self.nranks == 1 {
            for v in 0..self.num_vertices() {
                self.global_ids[v] = v;
            }
            return Ok(());
        }

        let owned: Vec<VertexId> = (0..self.num_vertices())
            .filter(|&v| self.vertex_live[v] && self.is_owned_node(v))
            .collect();
        let counts = comm::all_gather_count(com, owned.len());
        let offset: usize = counts[..self.rank].iter().sum();
        for (i, &v) in owned.iter().enumerate() {
            self.global_ids[v] = offset + i;
        }

        // Owned halo ids travel along the send lists; ghosts fill from recv.
        let payload: Vec<Vec<u8>> = (0..self.nranks)
            .map(|p| {
                let gids: Vec<u64> = self.send[p].iter().map(|&v| self.global_ids[v] as u64).collect();
                bytemuck::cast_slice(&gids).to_vec()
            })
            .collect();
        let received = comm::all_to_all(com, comm::TAG_GLOBAL_NUMBERING, payload);
        for (p, buf) in received.into_iter().enumerate() {
            let gids: Vec<u64> = bytemuck::pod_collect_to_vec(&buf);
            if gids.len() != self.recv[p].len() {
                return Err(MeshAdaptError::MalformedBuffer {
                    rank: p,
                    reason: format!(
                        "expected {} halo gids, got {}",
                        self.recv[p].len(),
                        gids.len()
                    ),
                });
            }
            for (&v, gid) in self.recv[p].iter().zip(gids) {
                self.global_ids[v] = gid as usize;
            }
        }
        Ok(())
    }

    /// Push updated coordinates and metrics of owned halo vertices to the
    /// peers and refresh the ghosts from theirs.
    pub fn halo_exchange<C: Communicator>(&mut self, com: &C) {
        if self.nranks == 1 {
            return;
        }
        let ndims = self.ndims;
        let msize = self.msize();
        let stride = ndims + msize;
        let payload: Vec<Vec<u8>> = (0..self.nranks)
            .map(|p| {
                let mut out = Vec::with_capacity(self.send[p].len() * stride);
                for &v in &self.send[p] {
                    out.extend_from_slice(self.coords(v));
                    out.extend_from_slice(self.metric(v));
                }
                bytemuck::cast_slice(&out).to_vec()
            })
            .collect();
        let received = comm::all_to_all(com, comm::TAG_HALO_FIELDS, payload);
        for (p, buf) in received.into_iter().enumerate() {
            let vals: Vec<f64> = bytemuck::pod_collect_to_vec(&buf);
            for (i, &v) in self.recv[p].iter().enumerate() {
                let base = i * stride;
                self.coords[v * ndims..(v + 1) * ndims]
                    .copy_from_slice(&vals[base..base + ndims]);
                self.metric[v * msize..(v + 1) * msize]
                    .copy_from_slice(&vals[base + ndims..base + stride]);
            }
        }
        // Ghost movement invalidates cached lengths of ghost-touching edges.
        let stale: Vec<EdgeKey> = self
            .edges
            .keys()
            .filter(|k| self.recv_halo.contains(&k.first()) || self.recv_halo.contains(&k.second()))
            .copied()
            .collect();
        for key in stale {
            let length = self.calc_edge_length(key.first(), key.second());
            if let Some(data) = self.edges.get_mut(&key) {
                data.length = length;
            }
        }
    }

    // --- mutators -------------------------------------------------------

    /// Append a vertex with the given coordinates and metric; it starts
    /// with empty adjacency, owned by this rank and without a global id.
    pub fn append_vertex(&mut self, coords: &[f64], metric: &[f64]) -> VertexId {
        let v = self.num_vertices();
        self.coords.extend_from_slice(&coords[..self.ndims]);
        self.metric.extend_from_slice(&metric[..self.msize()]);
        self.vertex_live.push(true);
        self.node_elements.push(BTreeSet::new());
        self.node_neighbours.push(Vec::new());
        self.owner.push(self.rank);
        self.global_ids.push(UNSET_GID);
        v
    }

    /// Append an element, wiring up node→element, node→node and edge
    /// adjacency (new edges get a freshly computed metric length).
    pub fn append_element(&mut self, verts: &[VertexId]) -> ElementId {
        debug_assert_eq!(verts.len(), self.nloc);
        let e = self.num_elements();
        self.enlist.extend_from_slice(verts);
        self.element_live.push(true);
        for &v in verts {
            self.node_elements[v].insert(e);
        }
        for i in 0..self.nloc {
            for j in (i + 1)..self.nloc {
                self.link_edge(verts[i], verts[j], e);
            }
        }
        e
    }

    /// Delete element `e`, unlinking it from every adjacency. Edges left
    /// with no incident element disappear along with the corresponding
    /// neighbour entries.
    pub fn erase_element(&mut self, e: ElementId) {
        if !self.is_live_element(e) {
            return;
        }
        let verts: Vec<VertexId> = self.enlist[e * self.nloc..(e + 1) * self.nloc].to_vec();
        for &v in &verts {
            self.node_elements[v].remove(&e);
        }
        for i in 0..self.nloc {
            for j in (i + 1)..self.nloc {
                self.unlink_edge(verts[i], verts[j], e);
            }
        }
        self.element_live[e] = false;
    }

    /// Substitute `from` → `to` inside element `e`, restitching adjacency.
    /// Edges that collapse onto an existing edge keep that edge's cached
    /// length; genuinely new edges get a recomputed one.
    pub fn rewrite_element_vertex(&mut self, e: ElementId, from: VertexId, to: VertexId) {
        debug_assert!(self.is_live_element(e));
        let base = e * self.nloc;
        let others: Vec<VertexId> = self.enlist[base..base + self.nloc]
            .iter()
            .copied()
            .filter(|&v| v != from)
            .collect();
        for slot in self.enlist[base..base + self.nloc].iter_mut() {
            if *slot == from {
                *slot = to;
                break;
            }
        }
        self.node_elements[from].remove(&e);
        self.node_elements[to].insert(e);
        for &u in &others {
            self.unlink_edge(from, u, e);
            if u != to {
                self.link_edge(to, u, e);
            }
        }
    }

    /// Delete vertex `v`. All incident elements must already have been
    /// erased or rewritten away from it.
    pub fn erase_vertex(&mut self, v: VertexId) {
        debug_assert!(
            self.node_elements[v].is_empty() && self.node_neighbours[v].is_empty(),
            "erase_vertex on a vertex with live adjacency"
        );
        self.vertex_live[v] = false;
    }

    /// Move vertex `v` and replace its metric, refreshing the cached
    /// length of every incident edge.
    pub fn set_position(&mut self, v: VertexId, coords: &[f64], metric: &[f64]) {
        let ndims = self.ndims;
        let msize = self.msize();
        self.coords[v * ndims..(v + 1) * ndims].copy_from_slice(&coords[..ndims]);
        self.metric[v * msize..(v + 1) * msize].copy_from_slice(&metric[..msize]);
        let neighbours: Vec<VertexId> = self.node_neighbours[v].clone();
        for u in neighbours {
            let length = self.calc_edge_length(v, u);
            if let Some(data) = self.edges.get_mut(&EdgeKey::new(v, u)) {
                data.length = length;
            }
        }
    }

    fn link_edge(&mut self, a: VertexId, b: VertexId, e: ElementId) {
        let key = EdgeKey::new(a, b);
        if !self.edges.contains_key(&key) {
            let length = self.calc_edge_length(a, b);
            self.edges.insert(
                key,
                EdgeData {
                    adjacent_elements: BTreeSet::new(),
                    length,
                },
            );
            self.node_neighbours[a].push(b);
            self.node_neighbours[b].push(a);
        }
        if let Some(data) = self.edges.get_mut(&key) {
            data.adjacent_elements.insert(e);
        }
    }

    fn unlink_edge(&mut self, a: VertexId, b: VertexId, e: ElementId) {
        let key = EdgeKey::new(a, b);
        if let Some(data) = self.edges.get_mut(&key) {
            data.adjacent_elements.remove(&e);
            if data.adjacent_elements.is_empty() {
                self.edges.remove(&key);
                self.node_neighbours[a].retain(|&w| w != b);
                self.node_neighbours[b].retain(|&w| w != a);
            }
        }
    }
}

impl Mesh {
    /// Re-derive every adjacency from the element list and cross-check it
    /// against the stored structures, the cached edge lengths, the metric
    /// field and element orientation. Returns the first violation found.
    pub fn validate_invariants(&self) -> Result<(), MeshAdaptError> {
        let msize = self.msize();
        for v in self.live_vertices() {
            if self.coords(v).iter().any(|c| !c.is_finite()) {
                return Err(MeshAdaptError::NonFiniteCoordinate(v));
            }
            if !metric::is_spd(self.ndims, &self.metric[v * msize..(v + 1) * msize]) {
                return Err(MeshAdaptError::NonSpdMetric(v));
            }
        }

        // Re-derive adjacency from the element list and compare.
        let mut expect_ne: Vec<BTreeSet<ElementId>> = vec![BTreeSet::new(); self.num_vertices()];
        let mut expect_edges: HashMap<EdgeKey, BTreeSet<ElementId>> = HashMap::new();
        for e in self.live_elements() {
            let verts = self.element_vertices(e).expect("live element");
            for &v in verts {
                if !self.is_live_vertex(v) {
                    return Err(MeshAdaptError::BrokenAdjacency(format!(
                        "element {e} references dead vertex {v}"
                    )));
                }
                expect_ne[v].insert(e);
            }
            for i in 0..self.nloc {
                for j in (i + 1)..self.nloc {
                    expect_edges
                        .entry(EdgeKey::new(verts[i], verts[j]))
                        .or_default()
                        .insert(e);
                }
            }
        }
        for v in 0..self.num_vertices() {
            if self.node_elements[v] != expect_ne[v] {
                return Err(MeshAdaptError::BrokenAdjacency(format!(
                    "node_elements[{v}] = {:?}, expected {:?}",
                    self.node_elements[v], expect_ne[v]
                )));
            }
            let nn: BTreeSet<VertexId> = self.node_neighbours[v].iter().copied().collect();
            if nn.len() != self.node_neighbours[v].len() {
                return Err(MeshAdaptError::BrokenAdjacency(format!(
                    "node_neighbours[{v}] contains duplicates"
                )));
            }
            let expect_nn: BTreeSet<VertexId> = expect_edges
                .keys()
                .filter(|k| k.contains(v))
                .map(|k| k.other(v))
                .collect();
            if nn != expect_nn {
                return Err(MeshAdaptError::BrokenAdjacency(format!(
                    "node_neighbours[{v}] = {nn:?}, expected {expect_nn:?}"
                )));
            }
        }
        if self.edges.len() != expect_edges.len() {
            return Err(MeshAdaptError::BrokenAdjacency(format!(
                "edge map has {} entries, expected {}",
                self.edges.len(),
                expect_edges.len()
            )));
        }
        for (key, data) in &self.edges {
            let expected = expect_edges
                .get(key)
                .ok_or(MeshAdaptError::MissingEdge(key.first(), key.second()))?;
            if &data.adjacent_elements != expected {
                return Err(MeshAdaptError::BrokenAdjacency(format!(
                    "edge ({}, {}) adjacency {:?}, expected {expected:?}",
                    key.first(),
                    key.second(),
                    data.adjacent_elements
                )));
            }
            let fresh = self.calc_edge_length(key.first(), key.second());
            if (data.length - fresh).abs() > 1e-10 * fresh.max(1.0) {
                return Err(MeshAdaptError::BrokenAdjacency(format!(
                    "edge ({}, {}) cached length {} differs from {}",
                    key.first(),
                    key.second(),
                    data.length,
                    fresh
                )));
            }
        }

        // Every live element must be positively oriented.
        if let Some(property) = self.reference_property() {
            for e in self.live_elements() {
                let vol = self.element_measure(&property, e);
                if !(vol > 0.0) {
                    return Err(MeshAdaptError::InvertedElement { element: e, volume: vol });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Unit square split along the diagonal, identity metric.
    fn unit_square() -> Mesh {
        let coords = vec![0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0];
        let metric = [1.0, 0.0, 1.0].repeat(4);
        Mesh::new_2d(coords, metric, vec![0, 1, 2, 0, 2, 3]).unwrap()
    }

    /// Unit square fanned around a centre vertex, identity metric.
    fn fanned_square() -> Mesh {
        let coords = vec![0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0, 0.5, 0.5];
        let metric = [1.0, 0.0, 1.0].repeat(5);
        Mesh::new_2d(coords, metric, vec![0, 1, 4, 1, 2, 4, 2, 3, 4, 3, 0, 4]).unwrap()
    }

    #[test]
    fn adjacency_is_built_and_valid() {
        let mesh = unit_square();
        assert_eq!(mesh.num_live_elements(), 2);
        assert_eq!(mesh.edges.len(), 5);
        assert_eq!(
            mesh.edges[&EdgeKey::new(0, 2)].adjacent_elements.len(),
            2,
            "diagonal is interior"
        );
        mesh.validate_invariants().unwrap();
    }

    #[test]
    fn rejects_non_spd_metric() {
        let coords = vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0];
        let metric = vec![1.0, 0.0, 1.0, 1.0, 2.0, 1.0, 1.0, 0.0, 1.0];
        assert!(matches!(
            Mesh::new_2d(coords, metric, vec![0, 1, 2]),
            Err(MeshAdaptError::NonSpdMetric(1))
        ));
    }

    #[test]
    fn rewrite_and_erase_keep_invariants() {
        // Collapse the centre vertex 4 onto corner 0 by hand, the way the
        // coarsening kernel does it: erase the elements containing both,
        // rewrite the rest, then drop the vertex.
        let mut mesh = fanned_square();
        mesh.erase_element(0);
        mesh.erase_element(3);
        mesh.rewrite_element_vertex(1, 4, 0);
        mesh.rewrite_element_vertex(2, 4, 0);
        assert!(mesh.node_elements[4].is_empty());
        assert!(mesh.node_neighbours[4].is_empty());
        mesh.erase_vertex(4);
        mesh.validate_invariants().unwrap();
        assert_eq!(mesh.num_live_elements(), 2);
        assert_eq!(mesh.edges.len(), 5);
    }

    #[test]
    fn set_position_refreshes_edge_lengths() {
        let mut mesh = unit_square();
        let m = [1.0, 0.0, 1.0];
        mesh.set_position(2, &[2.0, 2.0], &m);
        mesh.validate_invariants().unwrap();
        let cached = mesh.edge_length(0, 2).unwrap();
        assert!((cached - 8f64.sqrt()).abs() < 1e-12);
    }
}
