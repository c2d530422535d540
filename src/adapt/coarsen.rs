//! Mesh coarsening by maximal-independent-set edge collapse.
//!
//! Each pass identifies, for every owned vertex, the shortest admissible
//! edge below `l_low` it could collapse along, colours the adjacency at
//! distance 2, applies the globally largest colour class of candidates and
//! re-identifies the neighbourhood of every contraction. The loop stops
//! when no candidate survives anywhere, or at the safety cap.
//!
//! A contraction is admissible when the surface allows it
//! ([`Surface::is_collapsible`]), no rewritten element loses more than
//! 99.9% of its measure (inversion/sliver guard) and no edge around the
//! target would stretch past `l_max`.

use log::{debug, warn};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

use crate::colouring::{colour_classes, ColouringOracle, GreedyColouring};
use crate::comm::{self, Communicator, NoComm};
use crate::geometry::element::ElementProperty;
use crate::mesh::{ElementId, Mesh, VertexId};
use crate::mesh_error::MeshAdaptError;
use crate::surface::Surface;

/// Safety cap on coarsening passes.
const MAX_PASSES: usize = 100;
/// Rewritten elements keeping less than this fraction of their measure
/// reject the collapse.
const VOLUME_RATIO_FLOOR: f64 = 1.0e-3;

/// Result of identifying a collapse candidate for one vertex.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CollapseOutcome {
    /// Collapse the vertex onto this neighbour.
    CollapseTo(VertexId),
    /// The vertex is a geometric corner and must stay.
    RejectedCorner,
    /// The vertex is not owned by this partition.
    RejectedHalo,
    /// No incident edge passes the length, surface and quality guards.
    RejectedQuality,
}

impl CollapseOutcome {
    /// Target vertex for an accepted collapse.
    #[inline]
    pub fn target(self) -> Option<VertexId> {
        match self {
            CollapseOutcome::CollapseTo(v) => Some(v),
            _ => None,
        }
    }
}

/// Coarsening engine. Borrows the mesh and surface for the duration of the
/// operation; holds no state beyond the reference-element kernels.
pub struct Coarsen<'a> {
    mesh: &'a mut Mesh,
    surface: &'a mut Surface,
    property: ElementProperty,
}

impl<'a> Coarsen<'a> {
    /// Bind the engine to a mesh/surface pair. Fails on an empty mesh.
    pub fn new(mesh: &'a mut Mesh, surface: &'a mut Surface) -> Result<Self, MeshAdaptError> {
        let property = mesh
            .reference_property()
            .ok_or(MeshAdaptError::DeadElement(0))?;
        Ok(Self {
            mesh,
            surface,
            property,
        })
    }

    /// Serial convenience wrapper: [`NoComm`] and the built-in greedy
    /// colouring. Returns the number of vertices removed.
    pub fn coarsen(&mut self, l_low: f64, l_max: f64) -> Result<usize, MeshAdaptError> {
        self.coarsen_with(l_low, l_max, &NoComm, &GreedyColouring)
    }

    /// Collapse every edge shorter than `l_low` (in metric space) that can
    /// be removed without stretching any edge past `l_max`, negotiating
    /// halo collapses through `com`. Returns the number of vertices
    /// removed.
    pub fn coarsen_with<C: Communicator, O: ColouringOracle>(
        &mut self,
        l_low: f64,
        l_max: f64,
        com: &C,
        oracle: &O,
    ) -> Result<usize, MeshAdaptError> {
        self.mesh.create_global_node_numbering(com)?;

        // Initial identification over every owned vertex.
        let mut dynamic: Vec<CollapseOutcome> = {
            let mesh = &*self.mesh;
            let surface = &*self.surface;
            let property = self.property;
            (0..mesh.num_vertices())
                .into_par_iter()
                .map(|v| {
                    if mesh.is_live_vertex(v) && mesh.is_owned_node(v) {
                        identify_kernel(mesh, surface, &property, v, l_low, l_max)
                    } else {
                        CollapseOutcome::RejectedHalo
                    }
                })
                .collect()
        };
        let mut recalculate = vec![false; dynamic.len()];
        let mut removed = 0usize;

        for pass in 0..MAX_PASSES {
            if pass == MAX_PASSES - 1 {
                warn!("coarsening hit the {MAX_PASSES}-pass cap; check the metric field");
            }

            // Refresh stale identifications.
            let stale: Vec<VertexId> = recalculate
                .iter()
                .enumerate()
                .filter_map(|(v, &dirty)| dirty.then_some(v))
                .collect();
            if !stale.is_empty() {
                let mesh = &*self.mesh;
                let surface = &*self.surface;
                let property = self.property;
                let refreshed: Vec<CollapseOutcome> = stale
                    .par_iter()
                    .map(|&v| {
                        if mesh.is_live_vertex(v) && mesh.is_owned_node(v) {
                            identify_kernel(mesh, surface, &property, v, l_low, l_max)
                        } else {
                            CollapseOutcome::RejectedHalo
                        }
                    })
                    .collect();
                for (&v, outcome) in stale.iter().zip(refreshed) {
                    dynamic[v] = outcome;
                    recalculate[v] = false;
                }
            }

            // Group collapse candidates by colour and pick the globally
            // largest class as this pass's independent set.
            let colour = oracle.colour(self.mesh, 2);
            let classes = colour_classes(&colour);
            let local_sizes: Vec<usize> = classes
                .iter()
                .map(|class| {
                    class
                        .iter()
                        .filter(|&&v| dynamic[v].target().is_some())
                        .count()
                })
                .collect();
            let global_sizes = global_class_sizes(com, &local_sizes);
            let Some((best_colour, &best_size)) = global_sizes
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(&a.0)))
            else {
                break;
            };
            if best_size == 0 {
                break;
            }

            let mut independent_set: Vec<VertexId> = classes
                .get(best_colour)
                .into_iter()
                .flatten()
                .copied()
                .filter(|&v| dynamic[v].target().is_some())
                .collect();

            if com.size() > 1 {
                self.negotiate_halo_collapses(com, &mut dynamic, &mut recalculate, &mut independent_set)?;
            }

            debug!(
                "coarsen pass {pass}: colour {best_colour}, {} local candidates",
                independent_set.len()
            );

            // Apply the contractions. The set is independent at distance 2,
            // so the rewrites touch disjoint neighbourhoods.
            for rm_vertex in independent_set {
                if !self.mesh.is_live_vertex(rm_vertex) {
                    continue;
                }
                let Some(target) = dynamic[rm_vertex].target() else {
                    continue;
                };
                self.coarsen_kernel(rm_vertex, target);
                removed += 1;
                dynamic[rm_vertex] = CollapseOutcome::RejectedQuality;

                if self.mesh.is_owned_node(target) {
                    let outcome = identify_kernel(
                        self.mesh,
                        self.surface,
                        &self.property,
                        target,
                        l_low,
                        l_max,
                    );
                    debug_assert_ne!(outcome, CollapseOutcome::CollapseTo(rm_vertex));
                    dynamic[target] = outcome;
                }
                for &u in &self.mesh.node_neighbours[target] {
                    recalculate[u] = true;
                }
            }

            #[cfg(any(debug_assertions, feature = "strict-invariants"))]
            if let Err(e) = self.mesh.validate_invariants() {
                panic!("coarsening pass {pass} left the mesh inconsistent: {e}");
            }
        }

        Ok(removed)
    }

    /// Contract `rm_vertex` onto `target`: mirror the collapse on the
    /// surface, delete the elements shared by both endpoints, rewrite the
    /// rest, and drop the vertex. The mesh mutators keep the adjacency and
    /// edge caches consistent throughout.
    fn coarsen_kernel(&mut self, rm_vertex: VertexId, target: VertexId) {
        if self.surface.contains_node(rm_vertex) && self.surface.contains_node(target) {
            self.surface.collapse(rm_vertex, target);
        }

        let incident: Vec<ElementId> = self.mesh.node_elements[rm_vertex].iter().copied().collect();
        for e in incident {
            let shares_target = self
                .mesh
                .element_vertices(e)
                .is_some_and(|n| n.contains(&target));
            if shares_target {
                self.mesh.erase_element(e);
            } else {
                self.mesh.rewrite_element_vertex(e, rm_vertex, target);
            }
        }
        self.mesh.erase_vertex(rm_vertex);
    }

    /// Forward halo collapse directives to the partitions that know the
    /// vertex, shipping any vertices, elements and facets the peer does not
    /// hold yet, then extend the halo from the second exchange round.
    fn negotiate_halo_collapses<C: Communicator>(
        &mut self,
        com: &C,
        dynamic: &mut Vec<CollapseOutcome>,
        recalculate: &mut Vec<bool>,
        independent_set: &mut Vec<VertexId>,
    ) -> Result<(), MeshAdaptError> {
        let nranks = com.size();
        let rank = com.rank();
        let ndims = self.mesh.ndims();
        let nloc = self.mesh.nloc();
        let snloc = self.mesh.snloc();
        let msize = self.mesh.msize();

        let mut gnn2lnn: BTreeMap<usize, VertexId> = BTreeMap::new();
        for v in 0..self.mesh.num_vertices() {
            gnn2lnn.insert(self.mesh.global_id(v), v);
        }

        // Who already knows which of our vertices.
        let known: Vec<BTreeSet<VertexId>> = (0..nranks)
            .map(|p| {
                self.mesh.send[p]
                    .iter()
                    .chain(self.mesh.recv[p].iter())
                    .copied()
                    .collect()
            })
            .collect();

        let mut send_edges: Vec<Vec<usize>> = vec![Vec::new(); nranks];
        let mut send_elements: Vec<BTreeSet<ElementId>> = vec![BTreeSet::new(); nranks];
        let mut send_nodes: Vec<BTreeSet<VertexId>> = vec![BTreeSet::new(); nranks];

        for &v in independent_set.iter() {
            if !self.mesh.is_halo_node(v) {
                continue;
            }
            let Some(target) = dynamic[v].target() else {
                continue;
            };
            for p in 0..nranks {
                if p == rank || !known[p].contains(&v) {
                    continue;
                }
                send_edges[p].push(self.mesh.global_id(v));
                send_edges[p].push(self.mesh.global_id(target));
                send_elements[p].extend(self.mesh.node_elements[v].iter());
            }
        }

        // Drop elements the peer necessarily holds (it owns one of their
        // vertices); whatever survives may reference vertices unknown there.
        for p in 0..nranks {
            let keep: BTreeSet<ElementId> = send_elements[p]
                .iter()
                .copied()
                .filter(|&e| {
                    let n = self.mesh.element_vertices(e).expect("live element");
                    let peer_owned = n.iter().any(|&v| self.mesh.owner(v) == p);
                    if !peer_owned {
                        for &v in n {
                            if !known[p].contains(&v) {
                                send_nodes[p].insert(v);
                            }
                        }
                    }
                    !peer_owned
                })
                .collect();
            send_elements[p] = keep;
        }

        // Pack: nodes, directives, elements, facets — all u64 words.
        let mut payload: Vec<Vec<u8>> = Vec::with_capacity(nranks);
        for p in 0..nranks {
            if p == rank || send_edges[p].is_empty() {
                payload.push(Vec::new());
                continue;
            }
            let mut words: Vec<u64> = Vec::new();
            words.push(send_nodes[p].len() as u64);
            for &v in &send_nodes[p] {
                words.push(self.mesh.global_id(v) as u64);
                words.push(self.mesh.owner(v) as u64);
                for &c in self.mesh.coords(v) {
                    words.push(c.to_bits());
                }
                for &m in self.mesh.metric(v) {
                    words.push(m.to_bits());
                }
            }
            words.push(send_edges[p].len() as u64);
            words.extend(send_edges[p].iter().map(|&g| g as u64));

            let mut facets: BTreeSet<usize> = BTreeSet::new();
            words.push(send_elements[p].len() as u64);
            for &e in &send_elements[p] {
                let n = self.mesh.element_vertices(e).expect("live element");
                words.extend(n.iter().map(|&v| self.mesh.global_id(v) as u64));
                facets.extend(self.surface.find_facets(n));
            }
            words.push(facets.len() as u64);
            for f in facets {
                let fv = self.surface.facet(f).expect("live facet");
                words.extend(fv.iter().map(|&v| self.mesh.global_id(v) as u64));
                words.push(self.surface.coplanar_id(f) as u64);
            }
            payload.push(bytemuck::cast_slice(&words).to_vec());
        }

        let received = comm::all_to_all(com, comm::TAG_COARSEN_FORWARD, payload);

        // Unpack, extending the local mesh and recording which peers now
        // know which owned-by-whom vertices.
        let mut extra_halo: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); nranks];
        for (p, buf) in received.iter().enumerate() {
            if buf.is_empty() {
                continue;
            }
            let words: Vec<u64> = bytemuck::pod_collect_to_vec(buf);
            let mut cur = 0usize;

            let nnodes = take(&words, &mut cur, 1, p)?[0] as usize;
            for _ in 0..nnodes {
                let rec = take(&words, &mut cur, 2 + ndims + msize, p)?;
                let gid = rec[0] as usize;
                let owner = rec[1] as usize;
                extra_halo[owner].insert(gid);
                if !gnn2lnn.contains_key(&gid) {
                    let coords: Vec<f64> =
                        rec[2..2 + ndims].iter().map(|&w| f64::from_bits(w)).collect();
                    let metric: Vec<f64> = rec[2 + ndims..2 + ndims + msize]
                        .iter()
                        .map(|&w| f64::from_bits(w))
                        .collect();
                    let lnn = self.mesh.append_vertex(&coords, &metric);
                    self.mesh.set_owner(lnn, owner);
                    self.mesh.set_global_id(lnn, gid);
                    dynamic.push(CollapseOutcome::RejectedHalo);
                    recalculate.push(false);
                    gnn2lnn.insert(gid, lnn);
                }
            }

            let ndirectives = take(&words, &mut cur, 1, p)?[0] as usize;
            for _ in 0..ndirectives / 2 {
                let pair = take(&words, &mut cur, 2, p)?;
                let rm = lookup(&gnn2lnn, pair[0] as usize, p)?;
                let target = lookup(&gnn2lnn, pair[1] as usize, p)?;
                dynamic[rm] = CollapseOutcome::CollapseTo(target);
                independent_set.push(rm);
            }

            let nelements = take(&words, &mut cur, 1, p)?[0] as usize;
            for _ in 0..nelements {
                let rec = take(&words, &mut cur, nloc, p)?;
                let mut verts = Vec::with_capacity(nloc);
                for &g in rec {
                    verts.push(lookup(&gnn2lnn, g as usize, p)?);
                }
                // Only append if some vertex pair is not yet an edge here;
                // otherwise the element is already present.
                let new = (0..nloc).any(|i| {
                    (i + 1..nloc).any(|j| self.mesh.edge_length(verts[i], verts[j]).is_none())
                });
                if new {
                    self.mesh.append_element(&verts);
                }
            }

            let nfacets = take(&words, &mut cur, 1, p)?[0] as usize;
            for _ in 0..nfacets {
                let rec = take(&words, &mut cur, snloc + 1, p)?;
                let mut verts = Vec::with_capacity(snloc);
                for &g in &rec[..snloc] {
                    verts.push(lookup(&gnn2lnn, g as usize, p)?);
                }
                let coplanar_id = rec[snloc] as i32;
                if !self.surface.find_facets(&verts).iter().any(|&f| {
                    let mut fv = self.surface.facet(f).expect("live facet").to_vec();
                    let mut want = verts.clone();
                    fv.sort_unstable();
                    want.sort_unstable();
                    fv == want
                }) {
                    self.surface.append_facet(self.mesh, &verts, coplanar_id);
                }
            }
        }

        // Second round: tell each owner which of its vertices entered our
        // recv halo, and extend both sides' descriptors.
        let halo_payload: Vec<Vec<u8>> = (0..nranks)
            .map(|p| {
                let words: Vec<u64> = extra_halo[p].iter().map(|&g| g as u64).collect();
                bytemuck::cast_slice(&words).to_vec()
            })
            .collect();
        let halo_received = comm::all_to_all(com, comm::TAG_COARSEN_HALO, halo_payload);
        for p in 0..nranks {
            if p == rank {
                continue;
            }
            let words: Vec<u64> = bytemuck::pod_collect_to_vec(&halo_received[p]);
            for g in words {
                let lnn = lookup(&gnn2lnn, g as usize, p)?;
                self.mesh.send[p].push(lnn);
                self.mesh.send_halo.insert(lnn);
            }
            for &g in &extra_halo[p] {
                let lnn = lookup(&gnn2lnn, g, p)?;
                self.mesh.recv[p].push(lnn);
                self.mesh.recv_halo.insert(lnn);
            }
        }
        Ok(())
    }
}

/// Consume `n` words of a received buffer, erroring on truncation.
fn take<'w>(
    words: &'w [u64],
    cur: &mut usize,
    n: usize,
    from: usize,
) -> Result<&'w [u64], MeshAdaptError> {
    if *cur + n > words.len() {
        return Err(MeshAdaptError::MalformedBuffer {
            rank: from,
            reason: format!("truncated at word {}", *cur),
        });
    }
    let out = &words[*cur..*cur + n];
    *cur += n;
    Ok(out)
}

fn lookup(
    gnn2lnn: &BTreeMap<usize, VertexId>,
    gid: usize,
    from: usize,
) -> Result<VertexId, MeshAdaptError> {
    gnn2lnn
        .get(&gid)
        .copied()
        .ok_or(MeshAdaptError::MalformedBuffer {
            rank: from,
            reason: format!("unknown global id {gid}"),
        })
}

/// Identify the vertex `rm_vertex` should collapse onto, testing candidate
/// edges from shortest to longest.
fn identify_kernel(
    mesh: &Mesh,
    surface: &Surface,
    property: &ElementProperty,
    rm_vertex: VertexId,
    l_low: f64,
    l_max: f64,
) -> CollapseOutcome {
    if surface.is_corner_vertex(rm_vertex) {
        return CollapseOutcome::RejectedCorner;
    }
    if !mesh.is_owned_node(rm_vertex) {
        return CollapseOutcome::RejectedHalo;
    }

    let mut short_edges: Vec<(f64, VertexId)> = Vec::new();
    for &u in &mesh.node_neighbours[rm_vertex] {
        // No coarsening across the partition recv halo.
        if mesh.recv_halo.contains(&u) {
            continue;
        }
        if !surface.is_collapsible(rm_vertex, u) {
            continue;
        }
        let length = mesh
            .edge_length(rm_vertex, u)
            .expect("neighbour without an edge");
        if length < l_low {
            short_edges.push((length, u));
        }
    }
    short_edges.sort_by(|a, b| a.0.total_cmp(&b.0));

    'candidates: for (_, target) in short_edges {
        // Elements that survive the collapse are rewritten; their measure
        // must not collapse with them.
        for &e in &mesh.node_elements[rm_vertex] {
            let n = mesh.element_vertices(e).expect("live element");
            if n.contains(&target) {
                continue;
            }
            let orig: Vec<&[f64]> = n.iter().map(|&v| mesh.coords(v)).collect();
            let moved: Vec<&[f64]> = n
                .iter()
                .map(|&v| mesh.coords(if v == rm_vertex { target } else { v }))
                .collect();
            let orig_volume = property.measure(&orig);
            let volume = property.measure(&moved);
            if volume / orig_volume <= VOLUME_RATIO_FLOOR {
                continue 'candidates;
            }
        }
        // The collapse must not stretch any surviving edge past l_max.
        for &u in &mesh.node_neighbours[rm_vertex] {
            if u == target {
                continue;
            }
            if mesh.calc_edge_length(target, u) > l_max {
                continue 'candidates;
            }
        }
        return CollapseOutcome::CollapseTo(target);
    }

    CollapseOutcome::RejectedQuality
}

/// Element-wise global sum of the per-colour candidate counts.
fn global_class_sizes<C: Communicator>(com: &C, local: &[usize]) -> Vec<usize> {
    if com.size() == 1 {
        return local.to_vec();
    }
    let payload: Vec<Vec<u8>> = (0..com.size())
        .map(|_| {
            let words: Vec<u64> = local.iter().map(|&n| n as u64).collect();
            bytemuck::cast_slice(&words).to_vec()
        })
        .collect();
    let received = comm::all_to_all(com, comm::TAG_COARSEN_SIZES, payload);
    let mut total: Vec<usize> = local.to_vec();
    for (p, buf) in received.into_iter().enumerate() {
        if p == com.rank() {
            continue;
        }
        let words: Vec<u64> = bytemuck::pod_collect_to_vec(&buf);
        if words.len() > total.len() {
            total.resize(words.len(), 0);
        }
        for (t, w) in total.iter_mut().zip(words) {
            *t += w as usize;
        }
    }
    total
}
