//! Cluster builder: connected components over accepted matches.
//!
//! Union-find over integer record indices, with path compression and union by
//! rank. Membership is exactly the transitive closure of the accepted edges:
//! if A–B and B–C are accepted, A and C share a cluster even if they were
//! never compared.

use crate::scoring::MatchScore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct UnionFind {
    parent: Vec<usize>,
    rank:   Vec<u8>,
}

impl UnionFind {
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank:   vec![0; n],
        }
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    pub fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        // Compress.
        let mut cur = x;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    /// Merge the sets of `a` and `b`. Returns false if already joined.
    pub fn union(&mut self, a: usize, b: usize) -> bool {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return false;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] = self.rank[ra].saturating_add(1);
            }
        }
        true
    }
}

/// One equivalence class of record indices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    /// Sorted ascending.
    pub members:    Vec<usize>,
    /// Mean accepted score inside the cluster; 1.0 for a singleton.
    pub confidence: f64,
    /// Max accepted score inside the cluster; 1.0 for a singleton.
    pub max_score:  f64,
}

impl Cluster {
    pub fn is_singleton(&self) -> bool {
        self.members.len() == 1
    }
}

/// Connected components of `n` records under the accepted scores.
///
/// Every index in `0..n` lands in exactly one cluster; clusters are ordered
/// by their smallest member.
pub fn build_clusters(n: usize, scores: &[MatchScore]) -> Vec<Cluster> {
    let mut uf = UnionFind::new(n);
    for s in scores.iter().filter(|s| s.accepted) {
        uf.union(s.left, s.right);
    }

    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..n {
        let root = uf.find(i);
        groups.entry(root).or_default().push(i);
    }

    let mut edge_scores: BTreeMap<usize, Vec<f64>> = BTreeMap::new();
    for s in scores.iter().filter(|s| s.accepted) {
        let root = uf.find(s.left);
        edge_scores.entry(root).or_default().push(s.total);
    }

    let mut clusters: Vec<Cluster> = groups
        .into_iter()
        .map(|(root, members)| {
            let (confidence, max_score) = match edge_scores.get(&root) {
                Some(totals) if !totals.is_empty() => {
                    let mean = totals.iter().sum::<f64>() / totals.len() as f64;
                    let max = totals.iter().copied().fold(0.0_f64, f64::max);
                    (mean, max)
                }
                _ => (1.0, 1.0),
            };
            Cluster { members, confidence, max_score }
        })
        .collect();

    // Members were pushed in index order, so members[0] is the minimum.
    clusters.sort_by_key(|c| c.members[0]);
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::DimensionScores;

    fn edge(left: usize, right: usize, total: f64, accepted: bool) -> MatchScore {
        MatchScore {
            left,
            right,
            blocking_key: "test".into(),
            dimensions: DimensionScores::default(),
            total,
            accepted,
            evidence: Vec::new(),
        }
    }

    #[test]
    fn union_find_joins_transitively() {
        let mut uf = UnionFind::new(4);
        assert!(uf.union(0, 1));
        assert!(uf.union(1, 2));
        assert!(!uf.union(0, 2));
        assert_eq!(uf.find(0), uf.find(2));
        assert_ne!(uf.find(0), uf.find(3));
    }

    #[test]
    fn rejected_edges_do_not_merge() {
        let clusters = build_clusters(3, &[edge(0, 1, 0.9, true), edge(1, 2, 0.6, false)]);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].members, vec![0, 1]);
        assert_eq!(clusters[0].confidence, 0.9);
        assert!(clusters[1].is_singleton());
        assert_eq!(clusters[1].confidence, 1.0);
    }

    #[test]
    fn zero_records_yield_no_clusters() {
        assert!(build_clusters(0, &[]).is_empty());
    }
}
