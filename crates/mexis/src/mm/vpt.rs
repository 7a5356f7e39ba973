//! The m-ary vantage-point tree.

use std::sync::Arc;

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::dataset::{ObjId, ObjectDb};
use crate::scope::{Counters, DbScope};
use crate::utils::{tau_of, MinItem, SizedHeap};
use crate::MetricIndex;

/// A node of the [`Mvpt`], stored in the tree's arena.
enum Node {
    /// A bounded bucket of objects.
    Leaf {
        /// The object ids in this bucket.
        bucket: Vec<ObjId>,
    },
    /// A vantage point with children over distance quantile rings.
    Internal {
        /// The vantage point of this node.
        pivot: ObjId,
        /// Ring boundaries; `radii[0] = 0` and ring `i` covers
        /// `[radii[i], radii[i + 1])`, with the last ring unbounded.
        radii: Vec<f64>,
        /// One child per ring; `None` when the ring received no objects.
        children: Vec<Option<usize>>,
    },
}

/// An m-ary vantage-point tree.
///
/// With `arity` 2 this is the classical VPT. Each internal node sorts its
/// objects by distance to the vantage point and cuts them into `arity`
/// equal-population rings. When externally selected pivots are supplied,
/// one is consumed per level in order, overriding the random choice.
pub struct Mvpt {
    /// The counted route to the database.
    scope: DbScope,
    /// The node arena; index 0 is the root.
    nodes: Vec<Node>,
    /// Maximum number of objects in a leaf bucket.
    bucket_size: usize,
    /// The number of rings per internal node.
    arity: usize,
    /// When positive, force the tree height to exactly this many levels.
    configured_height: usize,
    /// Counters accumulated during the build.
    build: Counters,
}

impl Mvpt {
    /// Builds an MVPT over the whole database.
    ///
    /// `pivots_per_level`, when non-empty, supplies the vantage point for
    /// each level (externally precomputed pivots); levels beyond its length
    /// fall back to a seeded random choice.
    ///
    /// # Errors
    ///
    /// - If `bucket_size` is zero or `arity < 2`.
    pub fn build(
        db: Arc<ObjectDb>,
        bucket_size: usize,
        arity: usize,
        configured_height: usize,
        pivots_per_level: &[ObjId],
        seed: u64,
    ) -> Result<Self, String> {
        if bucket_size == 0 {
            return Err("MVPT bucket size must be positive.".to_string());
        }
        if arity < 2 {
            return Err("MVPT arity must be at least 2.".to_string());
        }

        let mut scope = DbScope::new(db);
        let mut rng = StdRng::seed_from_u64(seed);
        let ids = (0..scope.size()).collect::<Vec<_>>();

        let mut builder = Builder {
            scope: &mut scope,
            rng: &mut rng,
            bucket_size,
            arity,
            configured_height,
            pivots_per_level,
            nodes: Vec::new(),
        };
        builder.node(ids, 1);
        let nodes = builder.nodes;

        let build = scope.counters;
        scope.clear_counters();
        Ok(Self {
            scope,
            nodes,
            bucket_size,
            arity,
            configured_height,
            build,
        })
    }
}

/// Build-time state threaded through the recursive construction.
struct Builder<'a> {
    /// The counted route to the database.
    scope: &'a mut DbScope,
    /// Seeded generator for fallback pivot choices.
    rng: &'a mut StdRng,
    /// Maximum number of objects in a leaf bucket.
    bucket_size: usize,
    /// The number of rings per internal node.
    arity: usize,
    /// When positive, the forced tree height.
    configured_height: usize,
    /// Externally supplied per-level pivots, possibly empty.
    pivots_per_level: &'a [ObjId],
    /// The arena under construction.
    nodes: Vec<Node>,
}

impl Builder<'_> {
    /// Builds the subtree for `ids` at 1-based `depth`; returns its index.
    fn node(&mut self, mut ids: Vec<ObjId>, depth: usize) -> usize {
        let height_reached = self.configured_height > 0 && depth >= self.configured_height;
        if height_reached || ids.len() <= self.bucket_size {
            let idx = self.nodes.len();
            self.nodes.push(Node::Leaf { bucket: ids });
            return idx;
        }

        let pivot = if depth - 1 < self.pivots_per_level.len() {
            self.pivots_per_level[depth - 1]
        } else {
            ids[self.rng.gen_range(0..ids.len())]
        };
        if let Some(pos) = ids.iter().position(|&id| id == pivot) {
            ids.remove(pos);
        }

        let mut by_dist = ids
            .into_iter()
            .map(|id| (id, self.scope.d(id, pivot)))
            .collect::<Vec<_>>();
        by_dist.sort_by_key(|&(id, d)| MinItem(id, d));

        // Quantile boundaries for equal-population rings.
        let n = by_dist.len();
        let per_child = n / self.arity;
        let remainder = n % self.arity;

        let mut radii = vec![0.0; self.arity];
        for i in 1..self.arity {
            let idx = i * per_child + i.min(remainder);
            radii[i] = if idx > 0 && idx <= n {
                by_dist[idx - 1].1
            } else {
                f64::INFINITY
            };
        }

        let idx = self.nodes.len();
        self.nodes.push(Node::Leaf { bucket: Vec::new() });

        let mut children = Vec::with_capacity(self.arity);
        let mut start = 0;
        for i in 0..self.arity {
            let count = per_child + usize::from(i < remainder);
            let end = (start + count).min(n);
            let child_ids = by_dist[start..end].iter().map(|&(id, _)| id).collect::<Vec<_>>();
            start = end;

            if child_ids.is_empty() {
                children.push(None);
            } else {
                children.push(Some(self.node(child_ids, depth + 1)));
            }
        }

        self.nodes[idx] = Node::Internal { pivot, radii, children };
        idx
    }
}

/// The ring interval `[lower, upper)` of child `i`.
fn ring_bounds(radii: &[f64], i: usize) -> (f64, f64) {
    let lower = radii[i];
    let upper = if i + 1 < radii.len() { radii[i + 1] } else { f64::INFINITY };
    (lower, upper)
}

/// Range search in the subtree rooted at `node`.
fn search_range(nodes: &[Node], scope: &mut DbScope, node: usize, query: ObjId, radius: f64, hits: &mut Vec<ObjId>) {
    match &nodes[node] {
        Node::Leaf { bucket } => {
            for &o in bucket {
                if scope.d(query, o) <= radius {
                    hits.push(o);
                }
            }
        }
        Node::Internal { pivot, radii, children } => {
            let d = scope.d(query, *pivot);
            if d <= radius {
                hits.push(*pivot);
            }

            for (i, child) in children.iter().enumerate() {
                let Some(child) = child else { continue };
                let (lower, upper) = ring_bounds(radii, i);
                if d - radius <= upper && d + radius >= lower {
                    search_range(nodes, scope, *child, query, radius, hits);
                }
            }
        }
    }
}

/// k-NN search in the subtree rooted at `node`: the closest ring first, then
/// spiraling outward, pruning rings against the current k-th best distance.
fn search_knn(nodes: &[Node], scope: &mut DbScope, node: usize, query: ObjId, heap: &mut SizedHeap<ObjId, f64>) {
    match &nodes[node] {
        Node::Leaf { bucket } => {
            for &o in bucket {
                let d = scope.d(query, o);
                heap.push((o, d));
            }
        }
        Node::Internal { pivot, radii, children } => {
            let d = scope.d(query, *pivot);
            heap.push((*pivot, d));

            let arity = children.len();
            let mut closest = arity - 1;
            for i in 1..arity {
                if radii[i] > d {
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
                let Some(child) = children[i] else { continue };
                let (lower, upper) = ring_bounds(radii, i);
                let tau = tau_of(heap);
                if !heap.is_full() || (d - tau <= upper && d + tau >= lower) {
                    search_knn(nodes, scope, child, query, heap);
                }
            }
        }
    }
}

impl MetricIndex for Mvpt {
    fn name(&self) -> String {
        if self.configured_height > 0 {
            format!(
                "MVPT(bucket={}, arity={}, height={})",
                self.bucket_size, self.arity, self.configured_height
            )
        } else {
            format!("MVPT(bucket={}, arity={})", self.bucket_size, self.arity)
        }
    }

    fn range_search(&mut self, query: ObjId, radius: f64) -> Result<Vec<ObjId>, String> {
        let mut hits = Vec::new();
        search_range(&self.nodes, &mut self.scope, 0, query, radius, &mut hits);
        Ok(hits)
    }

    fn knn_search(&mut self, query: ObjId, k: usize) -> Result<Vec<(ObjId, f64)>, String> {
        let mut heap = SizedHeap::new(Some(k));
        if k > 0 {
            search_knn(&self.nodes, &mut self.scope, 0, query, &mut heap);
        }
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
    use test_case::test_case;

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

    #[test_case(2)]
    #[test_case(3)]
    #[test_case(4)]
    fn range_search_across_arities(arity: usize) -> Result<(), String> {
        let mut vpt = Mvpt::build(two_cluster_db(), 2, arity, 0, &[], 42)?;

        let mut hits = vpt.range_search(0, 1.0)?;
        hits.sort_unstable();
        assert_eq!(hits, vec![0, 1, 2]);
        Ok(())
    }

    #[test]
    fn honors_supplied_pivots() -> Result<(), String> {
        // With pivot 3 forced at the root, object 3 must be reported as the
        // root pivot, not from a bucket.
        let mut vpt = Mvpt::build(two_cluster_db(), 2, 2, 0, &[3], 42)?;

        let mut hits = vpt.range_search(3, 1.5)?;
        hits.sort_unstable();
        assert_eq!(hits, vec![3, 4, 5]);
        Ok(())
    }

    #[test]
    fn knn_matches_brute_force_order() -> Result<(), String> {
        let mut vpt = Mvpt::build(two_cluster_db(), 1, 3, 0, &[], 42)?;

        let knn = vpt.knn_search(0, 6)?;
        assert_eq!(knn.len(), 6);
        assert_eq!(knn[0], (0, 0.0));
        assert_eq!((knn[1].0, knn[2].0), (1, 2));
        Ok(())
    }
}
