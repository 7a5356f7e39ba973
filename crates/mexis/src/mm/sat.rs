//! The spatial approximation tree.

use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::dataset::{ObjId, ObjectDb};
use crate::scope::{Counters, DbScope};
use crate::utils::{MaxItem, SizedHeap};
use crate::MetricIndex;

/// A node of the [`Sat`]: one center, its neighbors, and the covering radius
/// of its subtree.
struct Node {
    /// The center object of this node.
    center: ObjId,
    /// Covering radius: max distance from the center to anything below.
    max_dist: f64,
    /// Arena indices of the neighbor subtrees.
    children: Vec<usize>,
}

/// A queue element used only while building: an object waiting at a node,
/// its best distance so far, and the best neighbor found for it.
struct Pending {
    /// The waiting object.
    obj: ObjId,
    /// Best distance to the current center or any considered neighbor.
    dist: f64,
    /// Position in `children` of the best neighbor, if any.
    best_child: Option<usize>,
}

/// A spatial approximation tree.
///
/// Navarro's construction: the neighbors of a node form a minimal set such
/// that every remaining object is closer to some neighbor than to the
/// center. Objects are processed in ascending distance from the center; each
/// either becomes a new neighbor or is routed to its closest existing one.
pub struct Sat {
    /// The counted route to the database.
    scope: DbScope,
    /// The node arena; index 0 is the root (centered on object 0).
    nodes: Vec<Node>,
    /// Counters accumulated during the build.
    build: Counters,
}

impl Sat {
    /// Builds a SAT over the whole database, rooted at object 0.
    ///
    /// # Errors
    ///
    /// - If the database is empty.
    pub fn build(db: Arc<ObjectDb>) -> Result<Self, String> {
        if db.size() == 0 {
            return Err("Cannot build a SAT over an empty database.".to_string());
        }

        let mut scope = DbScope::new(db);
        let mut nodes = vec![Node {
            center: 0,
            max_dist: 0.0,
            children: Vec::new(),
        }];
        let mut queues: Vec<Vec<Pending>> = vec![Vec::new()];

        for obj in 1..scope.size() {
            let dist = scope.d(0, obj);
            queues[0].push(Pending {
                obj,
                dist,
                best_child: None,
            });
        }

        distribute(&mut nodes, &mut queues, &mut scope, 0);

        let build = scope.counters;
        scope.clear_counters();
        Ok(Self { scope, nodes, build })
    }
}

/// Settles the pending queue of `node`: closest objects first, each becomes
/// a new neighbor or is forwarded to its best neighbor, then recurses.
fn distribute(nodes: &mut Vec<Node>, queues: &mut Vec<Vec<Pending>>, scope: &mut DbScope, node: usize) {
    let mut queue = core::mem::take(&mut queues[node]);
    if queue.is_empty() {
        nodes[node].max_dist = 0.0;
        return;
    }

    queue.sort_by(|a, b| {
        a.dist
            .partial_cmp(&b.dist)
            .unwrap_or(core::cmp::Ordering::Equal)
            .then(a.obj.cmp(&b.obj))
    });
    nodes[node].max_dist = queue.last().map_or(0.0, |p| p.dist);

    // First pass: an object nearer to the center than to every existing
    // neighbor becomes a neighbor itself; the rest wait for the second pass.
    let mut waiting = Vec::new();
    for mut pending in queue {
        pending.best_child = None;
        for (j, &child) in nodes[node].children.iter().enumerate() {
            let d = scope.d(pending.obj, nodes[child].center);
            if d <= pending.dist {
                pending.dist = d;
                pending.best_child = Some(j);
            }
        }

        if pending.best_child.is_none() {
            let child = nodes.len();
            nodes.push(Node {
                center: pending.obj,
                max_dist: 0.0,
                children: Vec::new(),
            });
            queues.push(Vec::new());
            nodes[node].children.push(child);
        } else {
            waiting.push(pending);
        }
    }

    // Second pass: neighbors created after an object was examined may be
    // closer still, so finish the comparison before forwarding.
    for mut pending in waiting {
        let start = pending.best_child.map_or(0, |j| j + 1);
        for j in start..nodes[node].children.len() {
            let child = nodes[node].children[j];
            let d = scope.d(pending.obj, nodes[child].center);
            if d <= pending.dist {
                pending.dist = d;
                pending.best_child = Some(j);
            }
        }

        let target = match pending.best_child {
            Some(j) => nodes[node].children[j],
            None => continue,
        };
        queues[target].push(Pending {
            obj: pending.obj,
            dist: pending.dist,
            best_child: None,
        });
    }

    let children = nodes[node].children.clone();
    for child in children {
        distribute(nodes, queues, scope, child);
    }
}

/// Range search in the subtree rooted at `node`.
///
/// `d_center` is the precomputed `d(q, center)`, `mind` the running minimum
/// distance from the query to any center on the path, and `s` the
/// accumulated digression.
fn search_range(
    nodes: &[Node],
    scope: &mut DbScope,
    node: usize,
    query: ObjId,
    radius: f64,
    d_center: f64,
    mind: f64,
    s: f64,
    hits: &mut Vec<ObjId>,
) {
    let n = &nodes[node];

    if s > 2.0 * radius {
        return;
    }
    if d_center - radius > n.max_dist {
        return;
    }

    if d_center <= radius {
        hits.push(n.center);
    }
    if n.children.is_empty() {
        return;
    }

    let dd = n
        .children
        .iter()
        .map(|&c| scope.d(query, nodes[c].center))
        .collect::<Vec<_>>();
    let new_mind = dd.iter().copied().fold(mind, f64::min);

    for (j, &child) in n.children.iter().enumerate() {
        if dd[j] <= new_mind + 2.0 * radius {
            let new_s = (s + (dd[j] - d_center)).max(0.0);
            search_range(nodes, scope, child, query, radius, dd[j], new_mind, new_s, hits);
        }
    }
}

/// An entry of the best-first k-NN frontier.
#[derive(Clone, Copy)]
struct FrontierEntry {
    /// Arena index of the subtree.
    node: usize,
    /// `d(q, center)` of the subtree's center.
    dist: f64,
    /// Minimum distance from the query to any sibling/ancestor center seen
    /// when this entry was pushed.
    mind: f64,
}

impl Sat {
    /// Best-first k-NN: the frontier is keyed by the lower bound
    /// `max(lb_parent, (d - mind) / 2, d - max_dist)`.
    fn knn(&mut self, query: ObjId, k: usize) -> Vec<(ObjId, f64)> {
        let mut hits = SizedHeap::new(Some(k));
        if k == 0 {
            return Vec::new();
        }

        let mut entries = Vec::new();
        let mut frontier = BinaryHeap::new();

        let d0 = self.scope.d(query, self.nodes[0].center);
        entries.push(FrontierEntry {
            node: 0,
            dist: d0,
            mind: d0,
        });
        frontier.push(MaxItem(0_usize, (d0 - self.nodes[0].max_dist).max(0.0)));

        while let Some(MaxItem(entry_idx, lbound)) = frontier.pop() {
            let tau = if hits.is_full() {
                hits.peek().map_or(f64::INFINITY, |(_, &d)| d)
            } else {
                f64::INFINITY
            };
            if hits.is_full() && lbound > tau {
                break;
            }

            let FrontierEntry { node, dist, mut mind } = entries[entry_idx];
            hits.push((self.nodes[node].center, dist));

            let children = self.nodes[node].children.clone();
            if children.is_empty() {
                continue;
            }

            let dd = children
                .iter()
                .map(|&c| self.scope.d(query, self.nodes[c].center))
                .collect::<Vec<_>>();
            mind = dd.iter().copied().fold(mind, f64::min);

            for (j, &child) in children.iter().enumerate() {
                let mut lb = lbound;
                lb = lb.max((dd[j] - mind) / 2.0);
                lb = lb.max(dd[j] - self.nodes[child].max_dist);

                let idx = entries.len();
                entries.push(FrontierEntry {
                    node: child,
                    dist: dd[j],
                    mind,
                });
                frontier.push(MaxItem(idx, lb.max(0.0)));
            }
        }

        hits.into_sorted()
    }
}

impl MetricIndex for Sat {
    fn name(&self) -> String {
        "SAT".to_string()
    }

    fn range_search(&mut self, query: ObjId, radius: f64) -> Result<Vec<ObjId>, String> {
        let mut hits = Vec::new();
        let d0 = self.scope.d(query, self.nodes[0].center);
        search_range(&self.nodes, &mut self.scope, 0, query, radius, d0, d0, 0.0, &mut hits);
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
    fn neighbor_sets_route_all_objects() -> Result<(), String> {
        let sat = Sat::build(two_cluster_db())?;

        // Every object is the center of exactly one node.
        let mut centers = sat.nodes.iter().map(|n| n.center).collect::<Vec<_>>();
        centers.sort_unstable();
        assert_eq!(centers, vec![0, 1, 2, 3, 4, 5]);
        Ok(())
    }

    #[test]
    fn covering_radii_are_tight() -> Result<(), String> {
        let sat = Sat::build(two_cluster_db())?;
        // The root covers everything, so its radius is the distance to the
        // farthest object from object 0: (11, 10).
        float_cmp::assert_approx_eq!(f64, sat.nodes[0].max_dist, (221.0_f64).sqrt());
        Ok(())
    }

    #[test]
    fn searches_match_brute_force() -> Result<(), String> {
        let mut sat = Sat::build(two_cluster_db())?;

        let mut hits = sat.range_search(0, 1.0)?;
        hits.sort_unstable();
        assert_eq!(hits, vec![0, 1, 2]);

        let knn = sat.knn_search(0, 3)?;
        assert_eq!(knn[0], (0, 0.0));
        assert_eq!((knn[1].0, knn[2].0), (1, 2));
        Ok(())
    }
}
