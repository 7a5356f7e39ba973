//! The dynamic spatial approximation tree with clusters.

use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::dataset::{ObjId, ObjectDb};
use crate::scope::{Counters, DbScope};
use crate::utils::{MaxItem, SizedHeap};
use crate::MetricIndex;

/// A node of the [`DsaclTree`]: a center, a bounded sorted cluster, and the
/// neighbor subtrees, in insertion (timestamp) order.
struct Node {
    /// The center object of this node.
    center: ObjId,
    /// Covering radius of the whole subtree.
    radius: f64,
    /// Cluster members, sorted by ascending distance to the center.
    cluster: Vec<ObjId>,
    /// `cluster_dist[i] = d(center, cluster[i])`, kept sorted.
    cluster_dist: Vec<f64>,
    /// Arena indices of neighbor subtrees, oldest first.
    neighbors: Vec<usize>,
    /// Creation time of this node.
    time: u64,
}

/// A dynamic SAT whose nodes each hold a bounded cluster of their nearest
/// objects.
///
/// Insertion follows the Navarro-Reyes rules: a new object joins the cluster
/// when there is room or it is closer than the current cluster radius,
/// otherwise it routes to the nearest neighbor, possibly becoming a new
/// neighbor itself when it is closer to the center than to all of them and
/// the arity allows. A cluster overflow evicts the farthest member and
/// reinserts it below.
pub struct DsaclTree {
    /// The counted route to the database.
    scope: DbScope,
    /// The node arena; index 0 is the root.
    nodes: Vec<Node>,
    /// Maximum number of neighbors per node.
    max_arity: usize,
    /// Maximum cluster size per node.
    cluster_size: usize,
    /// The insertion clock.
    current_time: u64,
    /// Counters accumulated during the build.
    build: Counters,
}

impl DsaclTree {
    /// Builds a DSACL-tree by inserting every object in id order.
    ///
    /// # Errors
    ///
    /// - If the database is empty.
    /// - If `max_arity` or `cluster_size` is zero.
    pub fn build(db: Arc<ObjectDb>, max_arity: usize, cluster_size: usize) -> Result<Self, String> {
        if db.size() == 0 {
            return Err("Cannot build a DSACL-tree over an empty database.".to_string());
        }
        if max_arity == 0 || cluster_size == 0 {
            return Err("DSACL-tree arity and cluster size must be positive.".to_string());
        }

        let mut tree = Self {
            scope: DbScope::new(db),
            nodes: Vec::new(),
            max_arity,
            cluster_size,
            current_time: 0,
            build: Counters::default(),
        };

        tree.new_node(0);
        for obj in 1..tree.scope.size() {
            tree.insert(0, obj);
        }

        tree.build = tree.scope.counters;
        tree.scope.clear_counters();
        Ok(tree)
    }

    /// Allocates a fresh node centered on `center`.
    fn new_node(&mut self, center: ObjId) -> usize {
        self.current_time += 1;
        self.nodes.push(Node {
            center,
            radius: 0.0,
            cluster: Vec::new(),
            cluster_dist: Vec::new(),
            neighbors: Vec::new(),
            time: self.current_time,
        });
        self.nodes.len() - 1
    }

    /// The cluster radius of `node`: distance of its farthest member.
    fn cluster_radius(&self, node: usize) -> f64 {
        self.nodes[node].cluster_dist.last().copied().unwrap_or(0.0)
    }

    /// Inserts `obj` into the subtree rooted at `node`.
    fn insert(&mut self, node: usize, obj: ObjId) {
        let d = self.scope.d(self.nodes[node].center, obj);
        if d > self.nodes[node].radius {
            self.nodes[node].radius = d;
        }

        let rc = self.cluster_radius(node);
        if self.nodes[node].cluster.len() < self.cluster_size || d < rc {
            // Join the cluster, keeping it sorted by distance.
            let pos = self.nodes[node]
                .cluster_dist
                .partition_point(|&existing| existing < d);
            self.nodes[node].cluster.insert(pos, obj);
            self.nodes[node].cluster_dist.insert(pos, d);
            self.current_time += 1;

            if self.nodes[node].cluster.len() == self.cluster_size + 1 {
                // Overflow: evict the farthest member and reinsert it below.
                let evicted = self.nodes[node].cluster.pop().unwrap_or(obj);
                self.nodes[node].cluster_dist.pop();
                self.insert(node, evicted);
            }
            return;
        }

        if self.nodes[node].neighbors.is_empty() {
            let child = self.new_node(obj);
            self.nodes[node].neighbors.push(child);
            return;
        }

        // Route to the nearest neighbor, or become a new neighbor when the
        // center is closer than all of them and the arity allows.
        let neighbors = self.nodes[node].neighbors.clone();
        let mut best = neighbors[0];
        let mut best_d = f64::INFINITY;
        for nb in neighbors {
            let dn = self.scope.d(self.nodes[nb].center, obj);
            if dn < best_d {
                best_d = dn;
                best = nb;
            }
        }

        if d < best_d && self.nodes[node].neighbors.len() < self.max_arity {
            let child = self.new_node(obj);
            self.nodes[node].neighbors.push(child);
        } else {
            self.insert(best, obj);
        }
    }

    /// Range search in the subtree rooted at `node`.
    ///
    /// `t` is the timestamp bound from the DSA-tree ancestor argument: a
    /// neighbor created at or after `t` cannot hold relevant objects.
    fn search_range(&mut self, node: usize, query: ObjId, radius: f64, t: u64, hits: &mut Vec<ObjId>) {
        let d = self.scope.d(self.nodes[node].center, query);

        if !(self.nodes[node].time < t && d <= self.nodes[node].radius + radius) {
            return;
        }

        if d <= radius {
            hits.push(self.nodes[node].center);
        }

        let rc = self.cluster_radius(node);
        if d - radius <= rc || d + radius <= rc {
            let members = self.nodes[node]
                .cluster
                .iter()
                .copied()
                .zip(self.nodes[node].cluster_dist.iter().copied())
                .collect::<Vec<_>>();
            for (member, d_prime) in members {
                if (d - d_prime).abs() <= radius && self.scope.d(member, query) <= radius {
                    hits.push(member);
                }
            }
            if d + radius < rc {
                return;
            }
        }

        let neighbors = self.nodes[node].neighbors.clone();
        if neighbors.is_empty() {
            return;
        }

        let d_nb = neighbors
            .iter()
            .map(|&nb| self.scope.d(self.nodes[nb].center, query))
            .collect::<Vec<_>>();

        let mut dmin = f64::INFINITY;
        for (i, &nb) in neighbors.iter().enumerate() {
            if d_nb[i] <= dmin + 2.0 * radius {
                // Later siblings much closer to the query bound the window of
                // insertion times that could have reached this neighbor.
                let mut t_next = t;
                for (j, &other) in neighbors.iter().enumerate().skip(i + 1) {
                    if d_nb[i] > d_nb[j] + 2.0 * radius {
                        t_next = t_next.min(self.nodes[other].time);
                    }
                }
                self.search_range(nb, query, radius, t_next, hits);
                dmin = dmin.min(d_nb[i]);
            }
        }
    }

    /// Best-first k-NN over nodes and cluster members, keyed by covering
    /// radius and cluster-distance lower bounds respectively.
    fn knn(&mut self, query: ObjId, k: usize) -> Vec<(ObjId, f64)> {
        let mut hits = SizedHeap::new(Some(k));
        if k == 0 {
            return Vec::new();
        }

        /// A frontier entry: either a node subtree or one cluster member.
        #[derive(Clone, Copy)]
        enum Entry {
            /// A subtree with its cached center distance.
            Node(usize, f64),
            /// A concrete object candidate.
            Object(ObjId),
        }

        let mut entries = Vec::new();
        let mut frontier = BinaryHeap::new();

        let d0 = self.scope.d(self.nodes[0].center, query);
        entries.push(Entry::Node(0, d0));
        frontier.push(MaxItem(0_usize, (d0 - self.nodes[0].radius).max(0.0)));

        while let Some(MaxItem(entry_idx, lb)) = frontier.pop() {
            let tau = if hits.is_full() {
                hits.peek().map_or(f64::INFINITY, |(_, &d)| d)
            } else {
                f64::INFINITY
            };
            if hits.is_full() && lb > tau {
                break;
            }

            match entries[entry_idx] {
                Entry::Object(obj) => {
                    let d = self.scope.d(obj, query);
                    hits.push((obj, d));
                }
                Entry::Node(node, d) => {
                    hits.push((self.nodes[node].center, d));

                    let members = self.nodes[node]
                        .cluster
                        .iter()
                        .copied()
                        .zip(self.nodes[node].cluster_dist.iter().copied())
                        .collect::<Vec<_>>();
                    for (member, d_prime) in members {
                        let idx = entries.len();
                        entries.push(Entry::Object(member));
                        frontier.push(MaxItem(idx, (d - d_prime).abs().max(0.0)));
                    }

                    let neighbors = self.nodes[node].neighbors.clone();
                    for nb in neighbors {
                        let dn = self.scope.d(self.nodes[nb].center, query);
                        let idx = entries.len();
                        entries.push(Entry::Node(nb, dn));
                        frontier.push(MaxItem(idx, (dn - self.nodes[nb].radius).max(0.0)));
                    }
                }
            }
        }

        hits.into_sorted()
    }
}

impl MetricIndex for DsaclTree {
    fn name(&self) -> String {
        format!("DSACL(arity={}, cluster={})", self.max_arity, self.cluster_size)
    }

    fn range_search(&mut self, query: ObjId, radius: f64) -> Result<Vec<ObjId>, String> {
        let mut hits = Vec::new();
        self.search_range(0, query, radius, u64::MAX, &mut hits);
        Ok(hits)
    }

    fn knn_search(&mut self, query: ObjId, k: usize) -> Result<Vec<(ObjId, f64)>, String> {
        Ok(self.knn(query, k))
    }

    fn counters(&self) -> Counters {
        self.scope.counters
    }

    fn clear_counters(&mut self) {
        self.scope.clear_counters();
    }

    fn build_counters(&self) -> Counters {
        self.build
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::Lp;

    fn two_cluster_db() -> Arc<ObjectDb> {
        Arc::new(ObjectDb::Vectors {
            rows: vec![
                vec![0.0, 0.0],
                vec![1.0, 0.0],
                vec![0.0, 1.0],
                vec![10.0, 10.0],
                vec![10.0, 11.0],
                vec![11.0, 10.0],
            ],
            dim: 2,
            lp: Lp::L2,
        })
    }

    #[test]
    fn every_object_lands_exactly_once() -> Result<(), String> {
        let tree = DsaclTree::build(two_cluster_db(), 4, 2)?;

        let mut seen = Vec::new();
        for node in &tree.nodes {
            seen.push(node.center);
            seen.extend_from_slice(&node.cluster);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
        Ok(())
    }

    #[test]
    fn searches_match_brute_force() -> Result<(), String> {
        let mut tree = DsaclTree::build(two_cluster_db(), 4, 2)?;

        let mut hits = tree.range_search(0, 1.0)?;
        hits.sort_unstable();
        assert_eq!(hits, vec![0, 1, 2]);

        let knn = tree.knn_search(0, 3)?;
        assert_eq!(knn[0], (0, 0.0));
        assert_eq!((knn[1].0, knn[2].0), (1, 2));
        Ok(())
    }

    #[test]
    fn cluster_overflow_evicts_farthest() -> Result<(), String> {
        let tree = DsaclTree::build(two_cluster_db(), 4, 1)?;
        for node in &tree.nodes {
            assert!(node.cluster.len() <= 1);
        }
        Ok(())
    }
}
