//! The fixed-queries tree.

use std::sync::Arc;

use crate::dataset::{ObjId, ObjectDb};
use crate::scope::{Counters, DbScope};
use crate::utils::{tau_of, MinItem, SizedHeap};
use crate::MetricIndex;

/// A node of the [`FqTree`], stored in the tree's arena.
enum Node {
    /// A bounded bucket of objects.
    Leaf {
        /// The object ids in this bucket.
        bucket: Vec<ObjId>,
    },
    /// An internal node partitioned by the distance to this level's pivot.
    Internal {
        /// `(lower edge, child)` per interval; interval `i` covers
        /// `[edges[i], edges[i + 1])`, the last one unbounded above.
        intervals: Vec<(f64, Option<usize>)>,
    },
}

/// A fixed-queries tree.
///
/// One pivot per level, shared by every node at that level. Internal nodes
/// cut their objects into `arity` equal-width distance intervals, so a query
/// evaluates at most one distance per level regardless of how many nodes it
/// visits there.
pub struct FqTree {
    /// The counted route to the database.
    scope: DbScope,
    /// The per-level pivots, in level order.
    level_pivots: Vec<ObjId>,
    /// The node arena; index 0 is the root.
    nodes: Vec<Node>,
    /// Maximum number of objects in a leaf bucket.
    bucket_size: usize,
    /// The number of intervals per internal node.
    arity: usize,
    /// Counters accumulated during the build.
    build: Counters,
}

impl FqTree {
    /// Builds an FQ-tree over the whole database.
    ///
    /// A level's pivot is taken from the first subtree that reaches that
    /// level (the last object of its working set) and removed from the set;
    /// pivots are answered from the per-level distances at query time, never
    /// from buckets.
    ///
    /// # Errors
    ///
    /// - If `bucket_size` is zero or `arity < 2`.
    pub fn build(db: Arc<ObjectDb>, bucket_size: usize, arity: usize) -> Result<Self, String> {
        if bucket_size == 0 {
            return Err("FQ-tree bucket size must be positive.".to_string());
        }
        if arity < 2 {
            return Err("FQ-tree arity must be at least 2.".to_string());
        }

        let mut scope = DbScope::new(db);
        let ids = (0..scope.size()).collect::<Vec<_>>();

        let mut builder = Builder {
            scope: &mut scope,
            bucket_size,
            arity,
            level_pivots: Vec::new(),
            nodes: Vec::new(),
        };
        builder.node(ids, 0);
        let (nodes, level_pivots) = (builder.nodes, builder.level_pivots);

        let build = scope.counters;
        scope.clear_counters();
        Ok(Self {
            scope,
            level_pivots,
            nodes,
            bucket_size,
            arity,
            build,
        })
    }
}

/// Build-time state threaded through the recursive construction.
struct Builder<'a> {
    /// The counted route to the database.
    scope: &'a mut DbScope,
    /// Maximum number of objects in a leaf bucket.
    bucket_size: usize,
    /// The number of intervals per internal node.
    arity: usize,
    /// The per-level pivots discovered so far.
    level_pivots: Vec<ObjId>,
    /// The arena under construction.
    nodes: Vec<Node>,
}

impl Builder<'_> {
    /// Builds the subtree for `ids` at `depth`; returns its arena index.
    fn node(&mut self, mut ids: Vec<ObjId>, depth: usize) -> usize {
        if ids.len() <= self.bucket_size {
            let idx = self.nodes.len();
            self.nodes.push(Node::Leaf { bucket: ids });
            return idx;
        }

        // First subtree to reach this depth donates its last object as the
        // level pivot.
        if self.level_pivots.len() <= depth {
            let pivot = ids.pop().unwrap_or_default();
            self.level_pivots.push(pivot);
        }
        let pivot = self.level_pivots[depth];

        let mut by_dist = ids
            .into_iter()
            .map(|id| (id, self.scope.d(pivot, id)))
            .collect::<Vec<_>>();
        by_dist.sort_by_key(|&(id, d)| MinItem(id, d));

        let min = by_dist.first().map_or(0.0, |&(_, d)| d);
        let max = by_dist.last().map_or(0.0, |&(_, d)| d);
        #[expect(clippy::cast_precision_loss)]
        let step = (max - min) / self.arity as f64;

        let idx = self.nodes.len();
        self.nodes.push(Node::Leaf { bucket: Vec::new() });

        let mut intervals = Vec::with_capacity(self.arity);
        let mut lower = min;
        let mut start = 0;
        for i in 0..self.arity {
            let upper = lower + step;
            let end = if i + 1 < self.arity {
                let mut e = start;
                while e < by_dist.len() && by_dist[e].1 < upper {
                    e += 1;
                }
                e
            } else {
                by_dist.len()
            };

            let child_ids = by_dist[start..end].iter().map(|&(id, _)| id).collect::<Vec<_>>();
            let child = if child_ids.is_empty() {
                None
            } else {
                Some(self.node(child_ids, depth + 1))
            };
            intervals.push((lower, child));

            lower = upper;
            start = end;
        }

        self.nodes[idx] = Node::Internal { intervals };
        idx
    }
}

/// Range search in the subtree rooted at `node`, with the query's per-level
/// pivot distances precomputed in `level_dists`.
fn search_range(
    nodes: &[Node],
    scope: &mut DbScope,
    level_dists: &[f64],
    node: usize,
    depth: usize,
    query: ObjId,
    radius: f64,
    hits: &mut Vec<ObjId>,
) {
    match &nodes[node] {
        Node::Leaf { bucket } => {
            for &o in bucket {
                if scope.d(query, o) <= radius {
                    hits.push(o);
                }
            }
        }
        Node::Internal { intervals } => {
            let d = level_dists[depth];
            let arity = intervals.len();
            for (i, &(lower, child)) in intervals.iter().enumerate() {
                let Some(child) = child else { continue };
                let next_lower = if i + 1 < arity { intervals[i + 1].0 } else { f64::INFINITY };
                if next_lower > d - radius && lower <= d + radius {
                    search_range(nodes, scope, level_dists, child, depth + 1, query, radius, hits);
                }
            }
        }
    }
}

/// k-NN search in the subtree rooted at `node`: intervals are visited from
/// the one containing the pivot distance outward, pruned against tau.
fn search_knn(
    nodes: &[Node],
    scope: &mut DbScope,
    level_dists: &[f64],
    node: usize,
    depth: usize,
    query: ObjId,
    heap: &mut SizedHeap<ObjId, f64>,
) {
    match &nodes[node] {
        Node::Leaf { bucket } => {
            for &o in bucket {
                let d = scope.d(query, o);
                heap.push((o, d));
            }
        }
        Node::Internal { intervals } => {
            let d = level_dists[depth];
            let arity = intervals.len();

            let mut closest = arity - 1;
            for i in 1..arity {
                if intervals[i].0 > d {
                    closest = i - 1;
                    break;
                }
            }

            let mut order = vec![closest];
            for offset in 1..arity {
                if closest >= offset {
                    order.push(closest - offset);
                }
                if closest + offset < arity {
                    order.push(closest + offset);
                }
            }

            for i in order {
                let Some(child) = intervals[i].1 else { continue };
                let tau = tau_of(heap);
                let lower = intervals[i].0;
                let next_lower = if i + 1 < arity { intervals[i + 1].0 } else { f64::INFINITY };
                if !heap.is_full() || (next_lower > d - tau && lower <= d + tau) {
                    search_knn(nodes, scope, level_dists, child, depth + 1, query, heap);
                }
            }
        }
    }
}

impl FqTree {
    /// Distances from the query to every level pivot, counted once per level.
    fn level_dists(&mut self, query: ObjId) -> Vec<f64> {
        let pivots = self.level_pivots.clone();
        pivots.into_iter().map(|p| self.scope.d(query, p)).collect()
    }
}

impl MetricIndex for FqTree {
    fn name(&self) -> String {
        format!("FQT(bucket={}, arity={})", self.bucket_size, self.arity)
    }

    fn range_search(&mut self, query: ObjId, radius: f64) -> Result<Vec<ObjId>, String> {
        let level_dists = self.level_dists(query);

        let mut hits = Vec::new();
        for (i, &p) in self.level_pivots.clone().iter().enumerate() {
            if level_dists[i] <= radius {
                hits.push(p);
            }
        }
        search_range(&self.nodes, &mut self.scope, &level_dists, 0, 0, query, radius, &mut hits);
        Ok(hits)
    }

    fn knn_search(&mut self, query: ObjId, k: usize) -> Result<Vec<(ObjId, f64)>, String> {
        let mut heap = SizedHeap::new(Some(k));
        if k == 0 {
            return Ok(Vec::new());
        }

        let level_dists = self.level_dists(query);
        for (i, &p) in self.level_pivots.clone().iter().enumerate() {
            heap.push((p, level_dists[i]));
        }
        search_knn(&self.nodes, &mut self.scope, &level_dists, 0, 0, query, &mut heap);
        Ok(heap.into_sorted())
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
    fn every_object_is_pivot_or_in_one_bucket() -> Result<(), String> {
        let fqt = FqTree::build(two_cluster_db(), 2, 2)?;

        let mut seen = fqt.level_pivots.clone();
        for node in &fqt.nodes {
            if let Node::Leaf { bucket } = node {
                seen.extend_from_slice(bucket);
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
        Ok(())
    }

    #[test]
    fn searches_match_brute_force() -> Result<(), String> {
        let mut fqt = FqTree::build(two_cluster_db(), 2, 2)?;

        let mut hits = fqt.range_search(0, 1.0)?;
        hits.sort_unstable();
        assert_eq!(hits, vec![0, 1, 2]);

        let knn = fqt.knn_search(0, 3)?;
        assert_eq!(knn[0], (0, 0.0));
        assert_eq!((knn[1].0, knn[2].0), (1, 2));
        Ok(())
    }
}
