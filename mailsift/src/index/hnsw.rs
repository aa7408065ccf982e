//! Hierarchical navigable small world graph over unit-length vectors.
//!
//! Distances are cosine distances (`1 - dot`). Every ordering in the graph
//! compares `(distance, slot)`, so equal distances always resolve to the
//! lower slot and a fixed graph answers a fixed query identically.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};

use crate::types::Slot;

const MAX_LEVEL: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HnswParams {
    /// Links per node on upper layers; layer 0 allows twice as many.
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub seed: u64,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 50,
            seed: 0x6d61_696c_7369_6674,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Node {
    vector: Vec<f32>,
    level: usize,
    /// neighbors[layer] for layer in 0..=level
    neighbors: Vec<Vec<Slot>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Scored {
    pub dist: f32,
    pub slot: Slot,
}

impl Eq for Scored {}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then_with(|| self.slot.cmp(&other.slot))
    }
}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Cosine distance between unit vectors, clamped at zero against rounding.
pub fn distance(a: &[f32], b: &[f32]) -> f32 {
    (1.0 - dot(a, b)).max(0.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hnsw {
    params: HnswParams,
    nodes: Vec<Option<Node>>,
    entry: Option<Slot>,
    /// Insertions so far; seeds the level of the next insert
    inserted: u64,
}

impl Hnsw {
    pub fn new(params: HnswParams) -> Self {
        Self {
            params,
            nodes: Vec::new(),
            entry: None,
            inserted: 0,
        }
    }

    pub fn params(&self) -> &HnswParams {
        &self.params
    }

    /// Number of inserts performed, which seeds the next level draw.
    pub fn inserted(&self) -> u64 {
        self.inserted
    }

    pub(crate) fn set_inserted(&mut self, inserted: u64) {
        self.inserted = inserted;
    }

    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.entry.is_none()
    }

    pub fn contains(&self, slot: Slot) -> bool {
        self.node(slot).is_some()
    }

    pub fn vector(&self, slot: Slot) -> Option<&[f32]> {
        self.node(slot).map(|n| n.vector.as_slice())
    }

    /// Live slots in ascending order.
    pub fn slots(&self) -> impl Iterator<Item = Slot> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.is_some())
            .map(|(i, _)| i as Slot)
    }

    fn node(&self, slot: Slot) -> Option<&Node> {
        self.nodes.get(slot as usize).and_then(|n| n.as_ref())
    }

    fn max_links(&self, layer: usize) -> usize {
        if layer == 0 {
            self.params.m * 2
        } else {
            self.params.m
        }
    }

    fn next_level(&self) -> usize {
        let mut rng =
            StdRng::seed_from_u64(self.params.seed ^ self.inserted.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let ml = 1.0 / (self.params.m.max(2) as f64).ln();
        let r: f64 = rng.gen();
        let level = (-(1.0 - r).ln() * ml).floor() as usize;
        level.min(MAX_LEVEL)
    }

    /// Insert a unit vector at `slot`. The slot must not be occupied.
    pub fn insert(&mut self, slot: Slot, vector: Vec<f32>) {
        debug_assert!(!self.contains(slot), "slot {} already occupied", slot);

        let level = self.next_level();
        self.inserted += 1;

        let mut neighbors: Vec<Vec<Slot>> = vec![Vec::new(); level + 1];

        if let Some(entry) = self.entry {
            let entry_level = self.node(entry).map(|n| n.level).unwrap_or(0);
            let mut eps = vec![entry];

            for layer in (level + 1..=entry_level).rev() {
                if let Some(best) = self.search_layer(&vector, &eps, 1, layer).first() {
                    eps = vec![best.slot];
                }
            }

            for layer in (0..=level.min(entry_level)).rev() {
                let candidates = self.search_layer(&vector, &eps, self.params.ef_construction, layer);
                neighbors[layer] = candidates
                    .iter()
                    .take(self.params.m)
                    .map(|s| s.slot)
                    .collect();
                if !candidates.is_empty() {
                    eps = candidates.iter().map(|s| s.slot).collect();
                }
            }
        }

        let index = slot as usize;
        if self.nodes.len() <= index {
            self.nodes.resize(index + 1, None);
        }
        self.nodes[index] = Some(Node {
            vector,
            level,
            neighbors: neighbors.clone(),
        });

        for (layer, linked) in neighbors.iter().enumerate() {
            for &other in linked {
                if let Some(node) = self.nodes.get_mut(other as usize).and_then(|n| n.as_mut()) {
                    if let Some(list) = node.neighbors.get_mut(layer) {
                        list.push(slot);
                    }
                }
                self.prune(other, layer);
            }
        }

        let entry_level = self.entry.and_then(|e| self.node(e)).map(|n| n.level);
        match entry_level {
            Some(current) if current >= level => {}
            _ => self.entry = Some(slot),
        }
    }

    /// Remove the node at `slot`, repairing the links of nodes that pointed
    /// at it. Returns the removed vector.
    pub fn remove(&mut self, slot: Slot) -> Option<Vec<f32>> {
        let removed = self.nodes.get_mut(slot as usize)?.take()?;

        // Every node that linked to the removed one, by layer
        let mut repairs: Vec<(Slot, usize)> = Vec::new();
        for (i, entry) in self.nodes.iter_mut().enumerate() {
            let Some(node) = entry.as_mut() else { continue };
            for (layer, list) in node.neighbors.iter_mut().enumerate() {
                let before = list.len();
                list.retain(|&n| n != slot);
                if list.len() != before {
                    repairs.push((i as Slot, layer));
                }
            }
        }

        for (other, layer) in repairs {
            let Some(replacements) = removed.neighbors.get(layer) else { continue };
            let live: Vec<Slot> = replacements
                .iter()
                .copied()
                .filter(|&r| r != other && self.contains(r))
                .collect();
            if let Some(node) = self.nodes.get_mut(other as usize).and_then(|n| n.as_mut()) {
                let list = &mut node.neighbors[layer];
                for r in live {
                    if !list.contains(&r) {
                        list.push(r);
                    }
                }
            }
            self.prune(other, layer);
        }

        while matches!(self.nodes.last(), Some(None)) {
            self.nodes.pop();
        }

        if self.entry == Some(slot) {
            self.entry = self
                .nodes
                .iter()
                .enumerate()
                .filter_map(|(i, n)| n.as_ref().map(|n| (i as Slot, n.level)))
                .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
                .map(|(i, _)| i);
        }

        Some(removed.vector)
    }

    /// Keep only the closest `max_links(layer)` neighbours of `slot`.
    fn prune(&mut self, slot: Slot, layer: usize) {
        let cap = self.max_links(layer);
        let kept = {
            let Some(node) = self.node(slot) else { return };
            let Some(list) = node.neighbors.get(layer) else { return };
            if list.len() <= cap {
                return;
            }
            let mut scored: Vec<Scored> = list
                .iter()
                .filter_map(|&n| {
                    self.node(n).map(|other| Scored {
                        dist: distance(&node.vector, &other.vector),
                        slot: n,
                    })
                })
                .collect();
            scored.sort();
            scored.truncate(cap);
            scored.into_iter().map(|s| s.slot).collect::<Vec<_>>()
        };
        if let Some(node) = self.nodes.get_mut(slot as usize).and_then(|n| n.as_mut()) {
            node.neighbors[layer] = kept;
        }
    }

    /// Best-first search restricted to one layer. Results ascend by (distance, slot).
    fn search_layer(&self, query: &[f32], entry_points: &[Slot], ef: usize, layer: usize) -> Vec<Scored> {
        let ef = ef.max(1);
        let mut visited: HashSet<Slot> = HashSet::new();
        let mut candidates: BinaryHeap<Reverse<Scored>> = BinaryHeap::new();
        let mut results: BinaryHeap<Scored> = BinaryHeap::new();

        for &ep in entry_points {
            if !visited.insert(ep) {
                continue;
            }
            let Some(node) = self.node(ep) else { continue };
            let scored = Scored {
                dist: distance(query, &node.vector),
                slot: ep,
            };
            candidates.push(Reverse(scored));
            results.push(scored);
            if results.len() > ef {
                results.pop();
            }
        }

        while let Some(Reverse(current)) = candidates.pop() {
            if let Some(worst) = results.peek() {
                if results.len() >= ef && current > *worst {
                    break;
                }
            }
            let Some(node) = self.node(current.slot) else { continue };
            let Some(links) = node.neighbors.get(layer) else { continue };
            for &next in links {
                if !visited.insert(next) {
                    continue;
                }
                let Some(other) = self.node(next) else { continue };
                let scored = Scored {
                    dist: distance(query, &other.vector),
                    slot: next,
                };
                let admit = results.len() < ef || results.peek().map_or(true, |w| scored < *w);
                if admit {
                    candidates.push(Reverse(scored));
                    results.push(scored);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        results.into_sorted_vec()
    }

    /// Up to `k` nearest slots, ascending by (distance, slot).
    pub fn search(&self, query: &[f32], k: usize, ef: usize) -> Vec<(Slot, f32)> {
        let Some(entry) = self.entry else {
            return Vec::new();
        };
        if k == 0 {
            return Vec::new();
        }
        let entry_level = self.node(entry).map(|n| n.level).unwrap_or(0);

        let mut eps = vec![entry];
        for layer in (1..=entry_level).rev() {
            if let Some(best) = self.search_layer(query, &eps, 1, layer).first() {
                eps = vec![best.slot];
            }
        }

        let mut found = self.search_layer(query, &eps, ef.max(k), 0);
        found.truncate(k);
        found.into_iter().map(|s| (s.slot, s.dist)).collect()
    }

    /// Exhaustive scan for recall checks.
    #[cfg(test)]
    pub fn brute_force(&self, query: &[f32], k: usize) -> Vec<(Slot, f32)> {
        let mut all: Vec<Scored> = self
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| {
                n.as_ref().map(|n| Scored {
                    dist: distance(query, &n.vector),
                    slot: i as Slot,
                })
            })
            .collect();
        all.sort();
        all.truncate(k);
        all.into_iter().map(|s| (s.slot, s.dist)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(v: &[f32]) -> Vec<f32> {
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        v.iter().map(|x| x / norm).collect()
    }

    fn vectors(n: usize) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(7);
        (0..n)
            .map(|_| unit(&(0..8).map(|_| rng.gen_range(-1.0..1.0)).collect::<Vec<f32>>()))
            .collect()
    }

    fn small_params() -> HnswParams {
        HnswParams {
            m: 4,
            ef_construction: 32,
            ef_search: 32,
            seed: 1,
        }
    }

    #[test]
    fn test_empty_graph_returns_nothing() {
        let graph = Hnsw::new(HnswParams::default());
        assert!(graph.search(&[1.0, 0.0], 3, 10).is_empty());
    }

    #[test]
    fn test_finds_exact_match_first() {
        let mut graph = Hnsw::new(small_params());
        let data = vectors(50);
        for (i, v) in data.iter().enumerate() {
            graph.insert(i as Slot, v.clone());
        }
        for (i, v) in data.iter().enumerate().step_by(7) {
            let hits = graph.search(v, 1, 32);
            assert_eq!(hits[0].0, i as Slot);
            assert!(hits[0].1 < 1e-5);
        }
    }

    #[test]
    fn test_results_ascend_and_respect_k() {
        let mut graph = Hnsw::new(small_params());
        for (i, v) in vectors(40).into_iter().enumerate() {
            graph.insert(i as Slot, v);
        }
        let hits = graph.search(&unit(&[1.0; 8]), 5, 32);
        assert_eq!(hits.len(), 5);
        for pair in hits.windows(2) {
            assert!(pair[0].1 <= pair[1].1);
        }
    }

    #[test]
    fn test_ties_break_on_lower_slot() {
        let mut graph = Hnsw::new(small_params());
        graph.insert(3, vec![1.0, 0.0]);
        graph.insert(1, vec![1.0, 0.0]);
        graph.insert(2, vec![0.0, 1.0]);
        let hits = graph.search(&[1.0, 0.0], 2, 10);
        assert_eq!(hits.iter().map(|h| h.0).collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn test_search_is_deterministic() {
        let build = || {
            let mut graph = Hnsw::new(small_params());
            for (i, v) in vectors(60).into_iter().enumerate() {
                graph.insert(i as Slot, v);
            }
            graph
        };
        let a = build();
        let b = build();
        assert_eq!(a, b);
        let q = unit(&[0.3, -0.2, 0.9, 0.1, 0.0, 0.4, -0.5, 0.2]);
        assert_eq!(a.search(&q, 10, 32), b.search(&q, 10, 32));
    }

    #[test]
    fn test_remove_unlinks_node() {
        let mut graph = Hnsw::new(small_params());
        let data = vectors(30);
        for (i, v) in data.iter().enumerate() {
            graph.insert(i as Slot, v.clone());
        }
        let removed = graph.remove(5).unwrap();
        assert_eq!(removed, data[5]);
        assert!(!graph.contains(5));
        assert_eq!(graph.len(), 29);
        assert!(graph.remove(5).is_none());

        let hits = graph.search(&data[5], 29, 64);
        assert!(hits.iter().all(|h| h.0 != 5));
        for node in graph.nodes.iter().flatten() {
            for list in &node.neighbors {
                assert!(!list.contains(&5));
            }
        }
    }

    #[test]
    fn test_remove_entry_point_reselects() {
        let mut graph = Hnsw::new(small_params());
        for (i, v) in vectors(20).into_iter().enumerate() {
            graph.insert(i as Slot, v);
        }
        let entry = graph.entry.unwrap();
        graph.remove(entry);
        let new_entry = graph.entry.unwrap();
        assert_ne!(new_entry, entry);
        let top = graph.nodes.iter().flatten().map(|n| n.level).max().unwrap();
        assert_eq!(graph.node(new_entry).unwrap().level, top);
    }

    #[test]
    fn test_remove_all_empties_graph() {
        let mut graph = Hnsw::new(small_params());
        for (i, v) in vectors(5).into_iter().enumerate() {
            graph.insert(i as Slot, v);
        }
        for i in 0..5 {
            graph.remove(i);
        }
        assert!(graph.is_empty());
        assert_eq!(graph.len(), 0);
        assert!(graph.search(&[1.0; 8], 3, 10).is_empty());
    }

    #[test]
    fn test_recall_against_brute_force() {
        let mut graph = Hnsw::new(HnswParams {
            m: 8,
            ef_construction: 64,
            ef_search: 64,
            seed: 3,
        });
        let data = vectors(200);
        for (i, v) in data.iter().enumerate() {
            graph.insert(i as Slot, v.clone());
        }
        let mut hit = 0;
        let mut total = 0;
        for q in data.iter().step_by(10) {
            let exact: HashSet<Slot> = graph.brute_force(q, 10).into_iter().map(|h| h.0).collect();
            let approx = graph.search(q, 10, 64);
            hit += approx.iter().filter(|h| exact.contains(&h.0)).count();
            total += exact.len();
        }
        assert!(hit as f64 / total as f64 > 0.9);
    }
}
