//! Common-input-ownership clustering.
//!
//! Addresses spent together as inputs of one transaction are assumed to be
//! controlled by the same actor and linked pairwise with SAME_ENTITY.

use crate::analysis::AnalysisError;
use crate::graph::GraphStore;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info};

/// Counts from one clustering pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClusteringReport {
    /// Transactions with at least two distinct input addresses
    pub transactions_visited: usize,
    /// Pair assertions made, including ones already present
    pub pairs_asserted: usize,
    /// Pairs that were not in the graph before this pass
    pub pairs_created: usize,
}

/// Link every pair of distinct input addresses of every transaction.
///
/// Safe to rerun after further ingestion; existing pairs are left alone.
pub fn apply_common_input_ownership(
    store: &dyn GraphStore,
) -> Result<ClusteringReport, AnalysisError> {
    let mut report = ClusteringReport::default();

    for tx in store.transactions()? {
        let mut distinct: Vec<String> = Vec::new();
        for edge in store.inputs(&tx.txid)? {
            if !distinct.contains(&edge.address) {
                distinct.push(edge.address);
            }
        }
        if distinct.len() < 2 {
            continue;
        }

        report.transactions_visited += 1;
        for (i, a) in distinct.iter().enumerate() {
            for b in &distinct[i + 1..] {
                report.pairs_asserted += 1;
                if store.link_same_entity(a, b)? {
                    report.pairs_created += 1;
                }
            }
        }
        debug!("{}: {} co-spent addresses", tx.txid, distinct.len());
    }

    info!(
        "Clustering: {} multi-input transactions, {} pairs asserted, {} new",
        report.transactions_visited, report.pairs_asserted, report.pairs_created
    );
    Ok(report)
}

/// Union-find over address indices (path compression, union by rank)
struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u32>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }

        let mut node = x;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// Connected components of the SAME_ENTITY relation with at least two
/// addresses, largest first. Members keep address discovery order.
pub fn entity_clusters(store: &dyn GraphStore) -> Result<Vec<Vec<String>>, AnalysisError> {
    let addresses = store.addresses()?;
    let index: HashMap<&str, usize> = addresses
        .iter()
        .enumerate()
        .map(|(i, a)| (a.as_str(), i))
        .collect();

    let mut sets = DisjointSet::new(addresses.len());
    for (a, b) in store.same_entity_pairs()? {
        if let (Some(&ia), Some(&ib)) = (index.get(a.as_str()), index.get(b.as_str())) {
            sets.union(ia, ib);
        }
    }

    let mut by_root: HashMap<usize, Vec<String>> = HashMap::new();
    let mut roots_in_order = Vec::new();
    for (i, address) in addresses.iter().enumerate() {
        let root = sets.find(i);
        let members = by_root.entry(root).or_insert_with(|| {
            roots_in_order.push(root);
            Vec::new()
        });
        members.push(address.clone());
    }

    let mut clusters: Vec<Vec<String>> = roots_in_order
        .into_iter()
        .filter_map(|root| by_root.remove(&root))
        .filter(|members| members.len() >= 2)
        .collect();
    clusters.sort_by(|a, b| b.len().cmp(&a.len()));
    Ok(clusters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraph;

    #[test]
    fn test_all_pairs_linked() {
        let g = MemoryGraph::new();
        for a in ["a", "b", "c", "d"] {
            g.link_sent(a, "t1", 1.0, None).unwrap();
        }
        g.link_sent("e", "t2", 1.0, None).unwrap();

        let report = apply_common_input_ownership(&g).unwrap();
        assert_eq!(report.transactions_visited, 1);
        assert_eq!(report.pairs_asserted, 6);
        assert_eq!(report.pairs_created, 6);
        assert_eq!(g.stats().unwrap().same_entity_edges, 6);

        let pairs = g.same_entity_pairs().unwrap();
        assert!(pairs.iter().all(|(a, b)| a != b));
        assert!(pairs.contains(&("a".to_string(), "d".to_string())));
    }

    #[test]
    fn test_rerun_creates_nothing_new() {
        let g = MemoryGraph::new();
        g.link_sent("a", "t1", 1.0, None).unwrap();
        g.link_sent("b", "t1", 1.0, None).unwrap();
        apply_common_input_ownership(&g).unwrap();

        // Same pair co-spent again, plus one new address
        g.link_sent("b", "t2", 1.0, None).unwrap();
        g.link_sent("a", "t2", 1.0, None).unwrap();
        g.link_sent("c", "t2", 1.0, None).unwrap();

        let report = apply_common_input_ownership(&g).unwrap();
        assert_eq!(report.pairs_asserted, 4);
        assert_eq!(report.pairs_created, 2);
        assert_eq!(g.stats().unwrap().same_entity_edges, 3);
    }

    #[test]
    fn test_single_input_address_no_pairs() {
        let g = MemoryGraph::new();
        g.link_sent("a", "t1", 1.0, None).unwrap();
        g.link_received("t1", "a", 0.5).unwrap();

        let report = apply_common_input_ownership(&g).unwrap();
        assert_eq!(report, ClusteringReport::default());
    }

    #[test]
    fn test_entity_clusters() {
        let g = MemoryGraph::new();
        g.upsert_address("loner").unwrap();
        g.link_same_entity("a", "b").unwrap();
        g.link_same_entity("c", "d").unwrap();
        g.link_same_entity("d", "e").unwrap();

        let clusters = entity_clusters(&g).unwrap();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0], vec!["c", "d", "e"]);
        assert_eq!(clusters[1], vec!["a", "b"]);
    }
}
