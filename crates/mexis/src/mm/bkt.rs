//! The Burkhard-Keller tree.

use std::sync::Arc;

use crate::dataset::{ObjId, ObjectDb};
use crate::scope::{Counters, DbScope};
use crate::utils::{tau_of, SizedHeap};
use crate::MetricIndex;

/// A node of the [`Bkt`], stored in the tree's arena.
enum Node {
    /// A bounded bucket of objects.
    Leaf {
        /// The object ids in this bucket.
        bucket: Vec<ObjId>,
    },
    /// A pivot with one child per occupied distance ring.
    Internal {
        /// The routing object of this node.
        pivot: ObjId,
        /// `(ring, child)` pairs; `ring` is the lower edge of the child's
        /// distance interval `[ring, ring + step)` from the pivot. Children
        /// are materialized lazily, in first-touch order.
        children: Vec<(f64, usize)>,
    },
}

/// A Burkhard-Keller tree.
///
/// Each internal node holds one pivot and partitions its objects into
/// fixed-width distance rings around it. The pivot of a split node stays a
/// routing-only entry; it is reported directly at query time and never
/// reappears in a bucket.
pub struct Bkt {
    /// The counted route to the database.
    scope: DbScope,
    /// The node arena; index 0 is the root.
    nodes: Vec<Node>,
    /// Maximum number of objects in a leaf bucket.
    bucket_size: usize,
    /// The width of each distance ring.
    step: f64,
    /// Counters accumulated during the build.
    build: Counters,
}

impl Bkt {
    /// Builds a BKT over the whole database by successive insertion.
    ///
    /// # Errors
    ///
    /// - If `bucket_size` is zero or `step` is not positive.
    pub fn build(db: Arc<ObjectDb>, bucket_size: usize, step: f64) -> Result<Self, String> {
        if bucket_size == 0 {
            return Err("BKT bucket size must be positive.".to_string());
        }
        if step <= 0.0 {
            return Err("BKT ring width must be positive.".to_string());
        }

        let mut scope = DbScope::new(db);
        let mut nodes = vec![Node::Leaf { bucket: Vec::new() }];
        for o in 0..scope.size() {
            insert(&mut nodes, &mut scope, bucket_size, step, 0, o);
        }

        let build = scope.counters;
        scope.clear_counters();
        Ok(Self {
            scope,
            nodes,
            bucket_size,
            step,
            build,
        })
    }
}

/// Inserts `obj` into the subtree rooted at `node`.
fn insert(nodes: &mut Vec<Node>, scope: &mut DbScope, bucket_size: usize, step: f64, node: usize, obj: ObjId) {
    match &mut nodes[node] {
        Node::Leaf { bucket } => {
            if bucket.len() < bucket_size {
                bucket.push(obj);
                return;
            }

            // Split: the first object of the bucket becomes the pivot, the
            // rest are redistributed into ring children.
            let old_bucket = core::mem::take(bucket);
            nodes[node] = Node::Internal {
                pivot: old_bucket[0],
                children: Vec::new(),
            };
            for &o in &old_bucket[1..] {
                insert(nodes, scope, bucket_size, step, node, o);
            }
            insert(nodes, scope, bucket_size, step, node, obj);
        }
        Node::Internal { pivot, .. } => {
            let pivot = *pivot;
            let d = scope.d(obj, pivot);
            let ring = (d / step).floor() * step;

            let existing = match &nodes[node] {
                Node::Internal { children, .. } => {
                    children.iter().find(|&&(r, _)| (r - ring).abs() < 1e-9).map(|&(_, c)| c)
                }
                Node::Leaf { .. } => unreachable!("node was just matched as internal"),
            };

            let child = existing.unwrap_or_else(|| {
                let c = nodes.len();
                nodes.push(Node::Leaf { bucket: Vec::new() });
                match &mut nodes[node] {
                    Node::Internal { children, .. } => children.push((ring, c)),
                    Node::Leaf { .. } => unreachable!("node was just matched as internal"),
                }
                c
            });

            insert(nodes, scope, bucket_size, step, child, obj);
        }
    }
}

/// Range search in the subtree rooted at `node`.
fn search_range(
    nodes: &[Node],
    scope: &mut DbScope,
    step: f64,
    node: usize,
    query: ObjId,
    radius: f64,
    hits: &mut Vec<ObjId>,
) {
    match &nodes[node] {
        Node::Leaf { bucket } => {
            for &o in bucket {
                if scope.d(o, query) <= radius {
                    hits.push(o);
                }
            }
        }
        Node::Internal { pivot, children } => {
            let d = scope.d(query, *pivot);
            if d <= radius {
                hits.push(*pivot);
            }

            for &(ring, child) in children {
                if ring + step > d - radius && ring <= d + radius {
                    search_range(nodes, scope, step, child, query, radius, hits);
                }
            }
        }
    }
}

/// k-NN search in the subtree rooted at `node`: the ring inequality of the
/// range search with the current k-th best distance in place of the radius.
fn search_knn(
    nodes: &[Node],
    scope: &mut DbScope,
    step: f64,
    node: usize,
    query: ObjId,
    heap: &mut SizedHeap<ObjId, f64>,
) {
    match &nodes[node] {
        Node::Leaf { bucket } => {
            for &o in bucket {
                let d = scope.d(o, query);
                heap.push((o, d));
            }
        }
        Node::Internal { pivot, children } => {
            let d = scope.d(query, *pivot);
            heap.push((*pivot, d));

            for &(ring, child) in children {
                let tau = tau_of(heap);
                if ring + step > d - tau && ring <= d + tau {
                    search_knn(nodes, scope, step, child, query, heap);
                }
            }
        }
    }
}

impl MetricIndex for Bkt {
    fn name(&self) -> String {
        format!("BKT(bucket={}, step={})", self.bucket_size, self.step)
    }

    fn range_search(&mut self, query: ObjId, radius: f64) -> Result<Vec<ObjId>, String> {
        let mut hits = Vec::new();
        search_range(&self.nodes, &mut self.scope, self.step, 0, query, radius, &mut hits);
        Ok(hits)
    }

    fn knn_search(&mut self, query: ObjId, k: usize) -> Result<Vec<(ObjId, f64)>, String> {
        let mut heap = SizedHeap::new(Some(k));
        if k > 0 {
            search_knn(&self.nodes, &mut self.scope, self.step, 0, query, &mut heap);
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
    use super::*;
    use crate::metric::Lp;

    /// Six 2-D points: a tight triple at the origin and another at (10, 10).
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
    fn range_search_on_two_clusters() -> Result<(), String> {
        let mut bkt = Bkt::build(two_cluster_db(), 2, 1.0)?;

        let mut hits = bkt.range_search(0, 1.0)?;
        hits.sort_unstable();
        assert_eq!(hits, vec![0, 1, 2]);

        assert_eq!(bkt.range_search(0, 0.5)?, vec![0]);
        Ok(())
    }

    #[test]
    fn knn_search_breaks_ties_by_id() -> Result<(), String> {
        let mut bkt = Bkt::build(two_cluster_db(), 2, 1.0)?;

        let hits = bkt.knn_search(0, 3)?;
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0], (0, 0.0));
        // Objects 1 and 2 are both at distance 1; id order decides.
        assert_eq!(hits[1].0, 1);
        assert_eq!(hits[2].0, 2);
        Ok(())
    }

    #[test]
    fn queries_are_idempotent() -> Result<(), String> {
        let mut bkt = Bkt::build(two_cluster_db(), 2, 1.0)?;

        bkt.clear_counters();
        let first = bkt.range_search(0, 1.0)?;
        let first_dists = bkt.counters().comp_dist;

        bkt.clear_counters();
        let second = bkt.range_search(0, 1.0)?;
        assert_eq!(first, second);
        assert_eq!(first_dists, bkt.counters().comp_dist);
        Ok(())
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(Bkt::build(two_cluster_db(), 0, 1.0).is_err());
        assert!(Bkt::build(two_cluster_db(), 2, 0.0).is_err());
    }
}
