//! Hierarchical navigable small-world graph under cosine distance.
//!
//! Insert-only: logical deletion is handled a level up by the fingerprint
//! map, which simply stops resolving tombstoned labels. The graph is
//! serialisable as a whole for the binary index file.

use super::metric::cosine_distance;
use crate::error::{MediatorError, MediatorResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashSet};

const MAX_LEVEL: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GraphNode {
    vector: Vec<f32>,
    /// Adjacency per level, index 0 = base layer.
    neighbors: Vec<Vec<u64>>,
}

/// Search frontier entry ordered by distance; the heap ordering is flipped
/// as needed with `std::cmp::Reverse`.
#[derive(PartialEq)]
struct Candidate {
    id: u64,
    distance: f32,
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .partial_cmp(&other.distance)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Approximate-nearest-neighbour graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswGraph {
    dimension: usize,
    m: usize,
    m_max0: usize,
    ef_construction: usize,
    level_mult: f64,
    next_id: u64,
    entry_point: Option<u64>,
    max_level: usize,
    nodes: BTreeMap<u64, GraphNode>,
}

impl HnswGraph {
    pub fn new(dimension: usize, m: usize, ef_construction: usize) -> Self {
        let m = m.max(2);
        Self {
            dimension,
            m,
            m_max0: m * 2,
            ef_construction: ef_construction.max(m),
            level_mult: 1.0 / (m as f64).ln(),
            next_id: 1,
            entry_point: None,
            max_level: 0,
            nodes: BTreeMap::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn vector(&self, id: u64) -> Option<&[f32]> {
        self.nodes.get(&id).map(|n| n.vector.as_slice())
    }

    fn random_level(&self) -> usize {
        let r = fastrand::f64().max(f64::MIN_POSITIVE);
        ((-r.ln() * self.level_mult).floor() as usize).min(MAX_LEVEL)
    }

    fn dist_to(&self, query: &[f32], id: u64) -> f32 {
        match self.nodes.get(&id) {
            Some(node) => cosine_distance(query, &node.vector),
            None => f32::INFINITY,
        }
    }

    /// Insert a vector and return its label.
    pub fn insert(&mut self, vector: Vec<f32>) -> MediatorResult<u64> {
        if vector.len() != self.dimension {
            return Err(MediatorError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }

        let level = self.random_level();
        let id = self.next_id;
        self.next_id += 1;
        let node = GraphNode {
            vector,
            neighbors: vec![Vec::new(); level + 1],
        };

        let Some(entry) = self.entry_point else {
            self.nodes.insert(id, node);
            self.entry_point = Some(id);
            self.max_level = level;
            return Ok(id);
        };

        let query = node.vector.clone();
        self.nodes.insert(id, node);

        // Greedy descent through the layers above the new node's level.
        let mut curr = entry;
        let mut curr_dist = self.dist_to(&query, curr);
        for l in ((level + 1)..=self.max_level).rev() {
            loop {
                let next = self.closer_neighbor(&query, curr, curr_dist, l);
                match next {
                    Some((n, d)) => {
                        curr = n;
                        curr_dist = d;
                    }
                    None => break,
                }
            }
        }

        // Link into every layer the new node participates in.
        for l in (0..=level.min(self.max_level)).rev() {
            let found = self.search_layer(&query, curr, self.ef_construction, l, Some(id));
            let cap = if l == 0 { self.m_max0 } else { self.m };
            let chosen: Vec<u64> = found.iter().take(self.m).map(|c| c.id).collect();
            if let Some(best) = found.first() {
                curr = best.id;
            }
            for &neighbor in &chosen {
                self.link(id, neighbor, l, cap);
                self.link(neighbor, id, l, cap);
            }
        }

        if level > self.max_level {
            self.max_level = level;
            self.entry_point = Some(id);
        }
        Ok(id)
    }

    fn closer_neighbor(
        &self,
        query: &[f32],
        curr: u64,
        curr_dist: f32,
        level: usize,
    ) -> Option<(u64, f32)> {
        let node = self.nodes.get(&curr)?;
        let adjacency = node.neighbors.get(level)?;
        let mut best = None;
        let mut best_dist = curr_dist;
        for &id in adjacency {
            let d = self.dist_to(query, id);
            if d < best_dist {
                best = Some((id, d));
                best_dist = d;
            }
        }
        best
    }

    fn link(&mut self, from: u64, to: u64, level: usize, cap: usize) {
        if from == to {
            return;
        }
        let from_vector = match self.nodes.get(&from) {
            Some(n) => n.vector.clone(),
            None => return,
        };
        let mut ranked: Vec<(u64, f32)> = Vec::new();
        if let Some(node) = self.nodes.get(&from) {
            let Some(adjacency) = node.neighbors.get(level) else {
                return;
            };
            if adjacency.contains(&to) {
                return;
            }
            for &id in adjacency {
                ranked.push((id, self.dist_to(&from_vector, id)));
            }
        }
        ranked.push((to, self.dist_to(&from_vector, to)));
        ranked.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        ranked.truncate(cap);
        if let Some(node) = self.nodes.get_mut(&from) {
            if let Some(adjacency) = node.neighbors.get_mut(level) {
                *adjacency = ranked.into_iter().map(|(id, _)| id).collect();
            }
        }
    }

    /// Beam search inside one layer; results ascending by distance.
    fn search_layer(
        &self,
        query: &[f32],
        entry: u64,
        ef: usize,
        level: usize,
        skip: Option<u64>,
    ) -> Vec<Candidate> {
        let mut visited: HashSet<u64> = HashSet::new();
        let mut frontier: BinaryHeap<std::cmp::Reverse<Candidate>> = BinaryHeap::new();
        let mut results: BinaryHeap<Candidate> = BinaryHeap::new();

        let entry_dist = self.dist_to(query, entry);
        visited.insert(entry);
        frontier.push(std::cmp::Reverse(Candidate {
            id: entry,
            distance: entry_dist,
        }));
        if skip != Some(entry) {
            results.push(Candidate {
                id: entry,
                distance: entry_dist,
            });
        }

        while let Some(std::cmp::Reverse(nearest)) = frontier.pop() {
            let worst = results.peek().map(|c| c.distance).unwrap_or(f32::INFINITY);
            if nearest.distance > worst && results.len() >= ef {
                break;
            }
            let Some(node) = self.nodes.get(&nearest.id) else {
                continue;
            };
            let Some(adjacency) = node.neighbors.get(level) else {
                continue;
            };
            for &id in adjacency {
                if !visited.insert(id) {
                    continue;
                }
                let d = self.dist_to(query, id);
                let worst = results.peek().map(|c| c.distance).unwrap_or(f32::INFINITY);
                if results.len() < ef || d < worst {
                    frontier.push(std::cmp::Reverse(Candidate { id, distance: d }));
                    if skip != Some(id) {
                        results.push(Candidate { id, distance: d });
                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }
        }

        let mut out: Vec<Candidate> = results.into_vec();
        out.sort();
        out
    }

    /// k approximate nearest labels with their distances, ascending.
    pub fn search(&self, query: &[f32], k: usize, ef: usize) -> Vec<(u64, f32)> {
        let Some(entry) = self.entry_point else {
            return Vec::new();
        };
        if query.len() != self.dimension {
            return Vec::new();
        }

        let mut curr = entry;
        let mut curr_dist = self.dist_to(query, curr);
        for l in (1..=self.max_level).rev() {
            loop {
                match self.closer_neighbor(query, curr, curr_dist, l) {
                    Some((n, d)) => {
                        curr = n;
                        curr_dist = d;
                    }
                    None => break,
                }
            }
        }

        self.search_layer(query, curr, ef.max(k), 0, None)
            .into_iter()
            .take(k)
            .map(|c| (c.id, c.distance))
            .collect()
    }
}
