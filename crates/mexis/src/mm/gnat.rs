//! The geometric near-neighbor access tree.

use std::sync::Arc;

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::dataset::{ObjId, ObjectDb};
use crate::scope::{Counters, DbScope};
use crate::utils::{tau_of, MinItem, SizedHeap};
use crate::MetricIndex;

/// A node of the [`Gnat`], stored in the tree's arena.
enum Node {
    /// A bounded bucket of objects, created when the height cap is reached.
    Leaf {
        /// The object ids in this bucket.
        bucket: Vec<ObjId>,
    },
    /// A set of pivots, one region per pivot, with the min/max distance of
    /// every region as seen from every pivot.
    Internal {
        /// The pivots of this node.
        pivots: Vec<ObjId>,
        /// `ranges[i][j]` is the `(min, max)` of `d(o, pivots[i])` over the
        /// objects assigned to region `j`.
        ranges: Vec<Vec<(f64, f64)>>,
        /// One child per region; `None` when the region is empty.
        children: Vec<Option<usize>>,
    },
}

/// A geometric near-neighbor access tree.
///
/// Each node selects pivots farthest-first from a sample of three times the
/// pivot budget, assigns every other object to its nearest pivot, and records
/// the min/max band of each region from every pivot's viewpoint. A region
/// survives a query only if the query ball intersects all of its bands.
pub struct Gnat {
    /// The counted route to the database.
    scope: DbScope,
    /// The node arena; `root` is the arena index of the root.
    nodes: Vec<Node>,
    /// Arena index of the root node, `None` for an empty database.
    root: Option<usize>,
    /// The average per-node pivot budget.
    avg_pivot_cnt: usize,
    /// Maximum tree height before forcing leaves.
    max_height: usize,
    /// Counters accumulated during the build.
    build: Counters,
}

/// The per-region pivot budget, clipped to the configured bounds.
fn next_pivot_budget(region_size: usize, avg: usize, pivot_cnt: usize, total: usize, max_cnt: usize) -> usize {
    if region_size == 0 {
        return 0;
    }
    let raw = region_size * avg * pivot_cnt / total;
    raw.clamp(2, max_cnt).min(region_size)
}

impl Gnat {
    /// Builds a GNAT over the whole database.
    ///
    /// # Errors
    ///
    /// - If `avg_pivot_cnt < 2` or `max_height` is zero.
    pub fn build(db: Arc<ObjectDb>, avg_pivot_cnt: usize, max_height: usize, seed: u64) -> Result<Self, String> {
        if avg_pivot_cnt < 2 {
            return Err("GNAT pivot budget must be at least 2.".to_string());
        }
        if max_height == 0 {
            return Err("GNAT height cap must be positive.".to_string());
        }

        let mut scope = DbScope::new(db);
        let mut objects = (0..scope.size()).collect::<Vec<_>>();
        let mut rng = StdRng::seed_from_u64(seed);
        objects.shuffle(&mut rng);

        let max_pivot_cnt = (4 * avg_pivot_cnt).min(256);
        let mut builder = Builder {
            scope: &mut scope,
            avg_pivot_cnt,
            max_pivot_cnt,
            max_height,
            nodes: Vec::new(),
        };
        let pivot_cnt = avg_pivot_cnt.min(objects.len());
        let root = builder.node(objects, pivot_cnt, 1);
        let nodes = builder.nodes;

        let build = scope.counters;
        scope.clear_counters();
        Ok(Self {
            scope,
            nodes,
            root,
            avg_pivot_cnt,
            max_height,
            build,
        })
    }
}

/// Build-time state threaded through the recursive construction.
struct Builder<'a> {
    /// The counted route to the database.
    scope: &'a mut DbScope,
    /// The average per-node pivot budget.
    avg_pivot_cnt: usize,
    /// The upper clip of the per-region pivot budget.
    max_pivot_cnt: usize,
    /// Maximum tree height before forcing leaves.
    max_height: usize,
    /// The arena under construction.
    nodes: Vec<Node>,
}

impl Builder<'_> {
    /// Builds the subtree for `objects` at height `h`; returns its index, or
    /// `None` when `objects` is empty.
    fn node(&mut self, mut objects: Vec<ObjId>, pivot_cnt: usize, h: usize) -> Option<usize> {
        if objects.is_empty() {
            return None;
        }

        if h >= self.max_height {
            let idx = self.nodes.len();
            self.nodes.push(Node::Leaf { bucket: objects });
            return Some(idx);
        }

        let pivots = self.select_pivots(pivot_cnt, &mut objects);
        let pivot_cnt = pivots.len();
        let total = objects.len();

        let mut ranges = vec![vec![(f64::INFINITY, 0.0_f64); pivot_cnt]; pivot_cnt];
        let mut regions = vec![Vec::new(); pivot_cnt];
        for &obj in &objects {
            let dists = pivots.iter().map(|&p| self.scope.d(obj, p)).collect::<Vec<_>>();
            let nearest = dists
                .iter()
                .enumerate()
                .min_by(|(i, a), (j, b)| a.partial_cmp(b).unwrap_or(core::cmp::Ordering::Equal).then(i.cmp(j)))
                .map_or(0, |(i, _)| i);
            regions[nearest].push(obj);
            for (i, &d) in dists.iter().enumerate() {
                let (min, max) = ranges[i][nearest];
                ranges[i][nearest] = (min.min(d), max.max(d));
            }
        }

        let idx = self.nodes.len();
        self.nodes.push(Node::Leaf { bucket: Vec::new() });

        let mut children = Vec::with_capacity(pivot_cnt);
        for region in regions {
            let budget = next_pivot_budget(region.len(), self.avg_pivot_cnt, pivot_cnt, total.max(1), self.max_pivot_cnt);
            children.push(self.node(region, budget, h + 1));
        }

        self.nodes[idx] = Node::Internal { pivots, ranges, children };
        Some(idx)
    }

    /// Selects up to `pivot_cnt` pivots farthest-first from a sample of three
    /// times the budget, taken from the tail of `objects`. Non-pivot sample
    /// members are returned to `objects`.
    fn select_pivots(&mut self, pivot_cnt: usize, objects: &mut Vec<ObjId>) -> Vec<ObjId> {
        let sample_cnt = (pivot_cnt * 3).min(objects.len());
        let sample = objects.split_off(objects.len() - sample_cnt);
        let pivot_cnt = pivot_cnt.min(sample_cnt);

        let mut d = vec![vec![0.0; sample_cnt]; sample_cnt];
        for i in 0..sample_cnt {
            for j in (i + 1)..sample_cnt {
                let dist = self.scope.d(sample[i], sample[j]);
                d[i][j] = dist;
                d[j][i] = dist;
            }
        }

        // First pivot: the sample point farthest from its nearest neighbor.
        let mut is_pivot = vec![false; sample_cnt];
        let mut pivot_pos = Vec::with_capacity(pivot_cnt);
        let first = (0..sample_cnt)
            .map(|i| {
                (0..sample_cnt)
                    .filter(|&j| j != i)
                    .map(|j| d[i][j])
                    .fold(f64::INFINITY, f64::min)
            })
            .enumerate()
            .max_by(|(i, a), (j, b)| a.partial_cmp(b).unwrap_or(core::cmp::Ordering::Equal).then(j.cmp(i)))
            .map_or(0, |(i, _)| i);
        pivot_pos.push(first);
        is_pivot[first] = true;

        // Remaining pivots: farthest-first from the chosen set.
        let mut dist_pivot = vec![f64::INFINITY; sample_cnt];
        for _ in 1..pivot_cnt {
            let &last = pivot_pos.last().unwrap_or(&first);
            for j in 0..sample_cnt {
                dist_pivot[j] = dist_pivot[j].min(d[j][last]);
            }
            let next = (0..sample_cnt)
                .filter(|&j| !is_pivot[j])
                .max_by(|&i, &j| {
                    dist_pivot[i]
                        .partial_cmp(&dist_pivot[j])
                        .unwrap_or(core::cmp::Ordering::Equal)
                        .then(j.cmp(&i))
                })
                .unwrap_or(first);
            pivot_pos.push(next);
            is_pivot[next] = true;
        }

        for (i, &obj) in sample.iter().enumerate() {
            if !is_pivot[i] {
                objects.push(obj);
            }
        }
        pivot_pos.into_iter().map(|i| sample[i]).collect()
    }
}

/// Whether the query ball `(d_to_pivots, radius)` intersects every band of
/// region `j`.
fn region_survives(ranges: &[Vec<(f64, f64)>], d_to_pivots: &[f64], j: usize, radius: f64) -> bool {
    d_to_pivots.iter().enumerate().all(|(i, &d)| {
        let (min, max) = ranges[i][j];
        max >= d - radius && min <= d + radius
    })
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
        Node::Internal { pivots, ranges, children } => {
            let d_to_pivots = pivots.iter().map(|&p| scope.d(p, query)).collect::<Vec<_>>();
            for (&p, &d) in pivots.iter().zip(d_to_pivots.iter()) {
                if d <= radius {
                    hits.push(p);
                }
            }

            for (j, child) in children.iter().enumerate() {
                let Some(child) = child else { continue };
                if region_survives(ranges, &d_to_pivots, j, radius) {
                    search_range(nodes, scope, *child, query, radius, hits);
                }
            }
        }
    }
}

/// k-NN search in the subtree rooted at `node`: regions are visited in
/// ascending order of pivot distance, with the band check running against
/// the current k-th best distance, and an early cut once even the halfway
/// bound of the remaining regions exceeds it.
fn search_knn(nodes: &[Node], scope: &mut DbScope, node: usize, query: ObjId, heap: &mut SizedHeap<ObjId, f64>) {
    match &nodes[node] {
        Node::Leaf { bucket } => {
            for &o in bucket {
                let d = scope.d(query, o);
                heap.push((o, d));
            }
        }
        Node::Internal { pivots, ranges, children } => {
            let d_to_pivots = pivots.iter().map(|&p| scope.d(query, p)).collect::<Vec<_>>();
            for (&p, &d) in pivots.iter().zip(d_to_pivots.iter()) {
                heap.push((p, d));
            }

            let mut order = (0..pivots.len()).collect::<Vec<_>>();
            order.sort_by_key(|&i| MinItem(i, d_to_pivots[i]));
            let d_closest = order.first().map_or(0.0, |&i| d_to_pivots[i]);

            for &i in &order {
                let tau = tau_of(heap);
                if heap.is_full() && (d_to_pivots[i] - d_closest) / 2.0 > tau {
                    break;
                }
                let Some(child) = children[i] else { continue };
                if region_survives(ranges, &d_to_pivots, i, tau) {
                    search_knn(nodes, scope, child, query, heap);
                }
            }
        }
    }
}

impl MetricIndex for Gnat {
    fn name(&self) -> String {
        format!("GNAT(pivots={}, maxHeight={})", self.avg_pivot_cnt, self.max_height)
    }

    fn range_search(&mut self, query: ObjId, radius: f64) -> Result<Vec<ObjId>, String> {
        let mut hits = Vec::new();
        if let Some(root) = self.root {
            search_range(&self.nodes, &mut self.scope, root, query, radius, &mut hits);
        }
        Ok(hits)
    }

    fn knn_search(&mut self, query: ObjId, k: usize) -> Result<Vec<(ObjId, f64)>, String> {
        let mut heap = SizedHeap::new(Some(k));
        if k > 0 {
            if let Some(root) = self.root {
                search_knn(&self.nodes, &mut self.scope, root, query, &mut heap);
            }
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
    fn range_and_knn_agree_with_brute_force() -> Result<(), String> {
        let mut gnat = Gnat::build(two_cluster_db(), 2, 4, 42)?;

        let mut hits = gnat.range_search(0, 1.0)?;
        hits.sort_unstable();
        assert_eq!(hits, vec![0, 1, 2]);

        let knn = gnat.knn_search(0, 3)?;
        assert_eq!(knn[0], (0, 0.0));
        assert_eq!((knn[1].0, knn[2].0), (1, 2));
        Ok(())
    }

    #[test]
    fn singleton_database() -> Result<(), String> {
        let db = Arc::new(ObjectDb::Vectors {
            rows: vec![vec![1.0, 2.0]],
            dim: 2,
            lp: Lp::L2,
        });
        let mut gnat = Gnat::build(db, 2, 4, 42)?;

        assert_eq!(gnat.range_search(0, 0.0)?, vec![0]);
        assert_eq!(gnat.knn_search(0, 5)?, vec![(0, 0.0)]);
        Ok(())
    }
}
