//! The bisector tree.

use std::sync::Arc;

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::dataset::{ObjId, ObjectDb};
use crate::scope::{Counters, DbScope};
use crate::utils::{tau_of, SizedHeap};
use crate::MetricIndex;

/// A node of the [`Bst`], stored in the tree's arena.
enum Node {
    /// A bounded bucket of objects.
    Leaf {
        /// The object ids in this bucket.
        bucket: Vec<ObjId>,
    },
    /// Two pivots bisecting the space, each covering a ball.
    Internal {
        /// The left pivot.
        left_pivot: ObjId,
        /// The right pivot, the object farthest from the left pivot.
        right_pivot: ObjId,
        /// Covering radius of the left subtree around `left_pivot`.
        left_radius: f64,
        /// Covering radius of the right subtree around `right_pivot`.
        right_radius: f64,
        /// Arena index of the left child.
        left: usize,
        /// Arena index of the right child.
        right: usize,
    },
}

/// A bisector tree.
///
/// Each internal node picks two pivots farthest-first and sends every other
/// object to the closer one, recording per-side covering radii for ball
/// pruning.
pub struct Bst {
    /// The counted route to the database.
    scope: DbScope,
    /// The node arena; index 0 is the root.
    nodes: Vec<Node>,
    /// Maximum number of objects in a leaf bucket.
    bucket_size: usize,
    /// Maximum tree depth before forcing a leaf.
    max_height: usize,
    /// Counters accumulated during the build.
    build: Counters,
}

impl Bst {
    /// Builds a BST over the whole database.
    ///
    /// The left pivot of each node is drawn from the seeded generator; the
    /// right pivot is the object farthest from it.
    ///
    /// # Errors
    ///
    /// - If `bucket_size` is zero or `max_height` is zero.
    pub fn build(db: Arc<ObjectDb>, bucket_size: usize, max_height: usize, seed: u64) -> Result<Self, String> {
        if bucket_size == 0 {
            return Err("BST bucket size must be positive.".to_string());
        }
        if max_height == 0 {
            return Err("BST height cap must be positive.".to_string());
        }

        let mut scope = DbScope::new(db);
        let mut rng = StdRng::seed_from_u64(seed);
        let ids = (0..scope.size()).collect::<Vec<_>>();

        let mut nodes = Vec::new();
        build_node(&mut nodes, &mut scope, &mut rng, bucket_size, max_height, ids, 0);

        let build = scope.counters;
        scope.clear_counters();
        Ok(Self {
            scope,
            nodes,
            bucket_size,
            max_height,
            build,
        })
    }
}

/// Builds the subtree for `ids` at `depth` and returns its arena index.
fn build_node(
    nodes: &mut Vec<Node>,
    scope: &mut DbScope,
    rng: &mut StdRng,
    bucket_size: usize,
    max_height: usize,
    ids: Vec<ObjId>,
    depth: usize,
) -> usize {
    if ids.len() <= bucket_size || depth + 1 >= max_height {
        let idx = nodes.len();
        nodes.push(Node::Leaf { bucket: ids });
        return idx;
    }

    // Farthest-first pivot pair: a random left pivot, then the object
    // farthest from it as the right pivot.
    let left_pivot = ids[rng.gen_range(0..ids.len())];
    let mut right_pivot = left_pivot;
    let mut max_d = -1.0;
    for &id in &ids {
        let d = scope.d(left_pivot, id);
        if d > max_d {
            max_d = d;
            right_pivot = id;
        }
    }

    let mut left_ids = Vec::new();
    let mut right_ids = Vec::new();
    let (mut left_radius, mut right_radius) = (0.0_f64, 0.0_f64);
    for &id in &ids {
        if id == left_pivot || id == right_pivot {
            continue;
        }
        let dl = scope.d(id, left_pivot);
        let dr = scope.d(id, right_pivot);
        if dl < dr {
            left_ids.push(id);
            left_radius = left_radius.max(dl);
        } else {
            right_ids.push(id);
            right_radius = right_radius.max(dr);
        }
    }

    let idx = nodes.len();
    nodes.push(Node::Leaf { bucket: Vec::new() });
    let left = build_node(nodes, scope, rng, bucket_size, max_height, left_ids, depth + 1);
    let right = build_node(nodes, scope, rng, bucket_size, max_height, right_ids, depth + 1);
    nodes[idx] = Node::Internal {
        left_pivot,
        right_pivot,
        left_radius,
        right_radius,
        left,
        right,
    };
    idx
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
        Node::Internal {
            left_pivot,
            right_pivot,
            left_radius,
            right_radius,
            left,
            right,
        } => {
            let dl = scope.d(query, *left_pivot);
            let dr = scope.d(query, *right_pivot);

            if dl <= radius {
                hits.push(*left_pivot);
            }
            if dr <= radius {
                hits.push(*right_pivot);
            }

            if dl - left_radius <= radius {
                search_range(nodes, scope, *left, query, radius, hits);
            }
            if dr - right_radius <= radius {
                search_range(nodes, scope, *right, query, radius, hits);
            }
        }
    }
}

/// k-NN search in the subtree rooted at `node`, pruning each side with the
/// current k-th best distance against its covering radius.
fn search_knn(nodes: &[Node], scope: &mut DbScope, node: usize, query: ObjId, heap: &mut SizedHeap<ObjId, f64>) {
    match &nodes[node] {
        Node::Leaf { bucket } => {
            for &o in bucket {
                let d = scope.d(query, o);
                heap.push((o, d));
            }
        }
        Node::Internal {
            left_pivot,
            right_pivot,
            left_radius,
            right_radius,
            left,
            right,
        } => {
            let dl = scope.d(query, *left_pivot);
            let dr = scope.d(query, *right_pivot);
            heap.push((*left_pivot, dl));
            heap.push((*right_pivot, dr));

            if dl - left_radius <= tau_of(heap) {
                search_knn(nodes, scope, *left, query, heap);
            }
            if dr - right_radius <= tau_of(heap) {
                search_knn(nodes, scope, *right, query, heap);
            }
        }
    }
}

impl MetricIndex for Bst {
    fn name(&self) -> String {
        format!("BST(bucket={}, maxHeight={})", self.bucket_size, self.max_height)
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
    fn matches_expected_neighborhoods() -> Result<(), String> {
        let mut bst = Bst::build(two_cluster_db(), 2, 10, 42)?;

        let mut hits = bst.range_search(0, 1.0)?;
        hits.sort_unstable();
        assert_eq!(hits, vec![0, 1, 2]);

        let knn = bst.knn_search(0, 3)?;
        assert_eq!(knn[0], (0, 0.0));
        assert_eq!((knn[1].0, knn[2].0), (1, 2));
        Ok(())
    }

    #[test]
    fn same_seed_same_structure() -> Result<(), String> {
        let db = two_cluster_db();
        let mut a = Bst::build(db.clone(), 1, 10, 42)?;
        let mut b = Bst::build(db, 1, 10, 42)?;

        assert_eq!(a.build_counters(), b.build_counters());
        for q in 0..6 {
            a.clear_counters();
            b.clear_counters();
            assert_eq!(a.knn_search(q, 4)?, b.knn_search(q, 4)?);
            assert_eq!(a.counters(), b.counters());
        }
        Ok(())
    }

    #[test]
    fn height_cap_forces_leaves() -> Result<(), String> {
        let mut bst = Bst::build(two_cluster_db(), 1, 1, 42)?;
        // Height 1 means the root is a single leaf holding everything.
        let mut hits = bst.range_search(0, 100.0)?;
        hits.sort_unstable();
        assert_eq!(hits, vec![0, 1, 2, 3, 4, 5]);
        Ok(())
    }
}
