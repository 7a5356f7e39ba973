//! The PM-tree: an M-tree augmented with pivot-space bounding rectangles.

use std::path::Path;
use std::sync::Arc;

use crate::dataset::{ObjId, ObjectDb};
use crate::scope::{pages_for, Counters, DbScope};
use crate::sm::NodeFile;
use crate::utils::{best_first_knn, Frontier, KnnHeap, KnnSource, MaxItem};
use crate::MetricIndex;

/// One entry of a persisted node.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
struct Entry {
    /// The object (leaf) or routing object (internal).
    obj: u64,
    /// Covering radius of the subtree; zero in leaves.
    radius: f64,
    /// Distance from this entry to its parent routing object.
    parent_dist: f64,
    /// File offset of the child node; `None` in leaves.
    child: Option<u64>,
    /// Pivot-space band of the subtree: `band[j]` is the `(min, max)` of
    /// `d(o, pivot_j)` over every object below. In leaves both ends collapse
    /// to the object's own pivot distance.
    band: Vec<(f64, f64)>,
}

/// A persisted node.
#[derive(serde::Serialize, serde::Deserialize)]
struct DiskNode {
    /// Whether this node is a leaf.
    is_leaf: bool,
    /// The entries of the node.
    entries: Vec<Entry>,
}

/// Structural parameters, persisted in the file's metadata record.
#[derive(serde::Serialize, serde::Deserialize)]
struct Meta {
    /// Number of objects at build time.
    n: u64,
    /// Maximum entries per node.
    node_capacity: u64,
    /// The global pivots of the pivot-space filter.
    pivots: Vec<u64>,
}

/// A node under construction.
enum RamNode {
    /// A leaf: `(object, parent distance, pivot distances)`.
    Leaf(Vec<(ObjId, f64, Vec<f64>)>),
    /// An internal node: `(center, radius, parent distance, band, child)`.
    Internal(Vec<(ObjId, f64, f64, Vec<(f64, f64)>, RamNode)>),
}

/// The pivot-space band of a RAM subtree.
fn band_of(node: &RamNode, n_pivots: usize) -> Vec<(f64, f64)> {
    let mut band = vec![(f64::INFINITY, 0.0_f64); n_pivots];
    match node {
        RamNode::Leaf(entries) => {
            for (_, _, pivot_dists) in entries {
                for (j, &d) in pivot_dists.iter().enumerate() {
                    band[j] = (band[j].0.min(d), band[j].1.max(d));
                }
            }
        }
        RamNode::Internal(entries) => {
            for (_, _, _, child_band, _) in entries {
                for (j, &(lo, hi)) in child_band.iter().enumerate() {
                    band[j] = (band[j].0.min(lo), band[j].1.max(hi));
                }
            }
        }
    }
    band
}

/// The L-infinity lower bound on `d(q, o)` for any `o` inside `band`, given
/// the query's pivot distances.
fn band_lower_bound(query_pivot_dists: &[f64], band: &[(f64, f64)]) -> f64 {
    query_pivot_dists
        .iter()
        .zip(band.iter())
        .map(|(&dq, &(lo, hi))| (dq - hi).max(lo - dq).max(0.0))
        .fold(0.0, f64::max)
}

/// A PM-tree.
///
/// The M-tree structure and pruning, plus a global pivot set: every entry
/// carries the `[min, max]` band of its subtree's distances to each pivot,
/// and queries apply the LAESA-style L-infinity lower bound before the
/// covering-radius test.
pub struct PmTree {
    /// The counted route to the database.
    scope: DbScope,
    /// The open node file.
    file: NodeFile,
    /// File offset of the root node.
    root: u64,
    /// Maximum entries per node.
    node_capacity: usize,
    /// The global pivots.
    pivots: Vec<ObjId>,
    /// Query-time scratch: pivot distances of the active query.
    query_pivot_dists: Vec<f64>,
    /// Counters accumulated during the build.
    build: Counters,
}

impl PmTree {
    /// Bulk-builds a PM-tree and persists it at `path`.
    ///
    /// `pivots`, when non-empty, supplies the global pivot set (HFI pivots);
    /// otherwise the first `n_pivots` objects are used.
    ///
    /// # Errors
    ///
    /// - If `node_capacity < 4` or no pivots are available.
    /// - If the index file cannot be written.
    pub fn build<P: AsRef<Path>>(
        db: Arc<ObjectDb>,
        path: P,
        node_capacity: usize,
        n_pivots: usize,
        pivots: &[ObjId],
    ) -> Result<Self, String> {
        if node_capacity < 4 {
            return Err("PM-tree node capacity must be at least 4.".to_string());
        }
        let pivots = if pivots.is_empty() {
            if n_pivots == 0 {
                return Err("PM-tree needs at least one pivot.".to_string());
            }
            (0..n_pivots.min(db.size())).collect::<Vec<_>>()
        } else {
            pivots.to_vec()
        };

        let mut scope = DbScope::new(db);
        let objs = (0..scope.size()).collect::<Vec<_>>();
        let root_ram = build_recursive(&mut scope, &objs, None, node_capacity, &pivots);

        let mut file = NodeFile::create(path)?;
        let root = write_post_order(&mut file, &mut scope, &root_ram)?;
        file.finish(
            root,
            &Meta {
                n: scope.size() as u64,
                node_capacity: node_capacity as u64,
                pivots: pivots.iter().map(|&p| p as u64).collect(),
            },
        )?;

        let build = scope.counters;
        scope.clear_counters();
        Ok(Self {
            scope,
            file,
            root,
            node_capacity,
            pivots,
            query_pivot_dists: Vec::new(),
            build,
        })
    }

    /// Reopens a persisted PM-tree from `path`.
    ///
    /// # Errors
    ///
    /// - If the file is missing or its header/metadata is corrupt.
    pub fn open<P: AsRef<Path>>(db: Arc<ObjectDb>, path: P) -> Result<Self, String> {
        let (mut file, root) = NodeFile::open(path)?;
        let meta: Meta = file.read_meta()?;

        Ok(Self {
            scope: DbScope::new(db),
            file,
            root,
            node_capacity: usize::try_from(meta.node_capacity).unwrap_or(4),
            pivots: meta.pivots.iter().map(|&p| p as ObjId).collect(),
            query_pivot_dists: Vec::new(),
            build: Counters::default(),
        })
    }

    /// Reads a node, charging its logical pages.
    fn read(&mut self, offset: u64) -> Result<DiskNode, String> {
        let (node, bytes) = self.file.read_node(offset)?;
        self.scope.page_reads(pages_for(bytes));
        Ok(node)
    }

    /// Computes and caches the query's pivot distances.
    fn prepare_query(&mut self, query: ObjId) {
        let pivots = self.pivots.clone();
        self.query_pivot_dists = pivots.into_iter().map(|p| self.scope.d(query, p)).collect();
    }

    /// Range descent with the pivot-space prefilter and parent filtering.
    fn range_descent(
        &mut self,
        offset: u64,
        parent: Option<f64>,
        query: ObjId,
        radius: f64,
        hits: &mut Vec<ObjId>,
    ) -> Result<(), String> {
        let node = self.read(offset)?;

        for e in node.entries {
            if band_lower_bound(&self.query_pivot_dists, &e.band) > radius {
                continue;
            }
            if let Some(d_pq) = parent {
                if (d_pq - e.parent_dist).abs() > radius + e.radius {
                    continue;
                }
            }

            let d = self.scope.d(query, e.obj as ObjId);
            if d > radius + e.radius {
                continue;
            }

            match e.child {
                None => {
                    if d <= radius {
                        hits.push(e.obj as ObjId);
                    }
                }
                Some(child) => self.range_descent(child, Some(d), query, radius, hits)?,
            }
        }
        Ok(())
    }
}

/// Bulk-loads the subtree of `objs`; the M-tree construction with pivot
/// distances carried along.
fn build_recursive(
    scope: &mut DbScope,
    objs: &[ObjId],
    parent: Option<ObjId>,
    node_capacity: usize,
    pivots: &[ObjId],
) -> RamNode {
    if objs.len() <= node_capacity {
        let entries = objs
            .iter()
            .map(|&o| {
                let parent_dist = parent.map_or(0.0, |p| scope.d(o, p));
                let pivot_dists = pivots.iter().map(|&p| scope.d(o, p)).collect();
                (o, parent_dist, pivot_dists)
            })
            .collect();
        return RamNode::Leaf(entries);
    }

    let max_centers = node_capacity.min(objs.len());
    let mut centers = vec![objs[0]];
    let mut min_dist = objs.iter().map(|&o| scope.d(o, objs[0])).collect::<Vec<_>>();
    while centers.len() < max_centers {
        let best = min_dist
            .iter()
            .enumerate()
            .max_by(|(i, a), (j, b)| a.partial_cmp(b).unwrap_or(core::cmp::Ordering::Equal).then(j.cmp(i)))
            .map(|(i, _)| objs[i]);
        let Some(best) = best else { break };
        if centers.contains(&best) {
            break;
        }
        centers.push(best);
        for (i, &o) in objs.iter().enumerate() {
            let d = scope.d(o, best);
            if d < min_dist[i] {
                min_dist[i] = d;
            }
        }
    }

    if centers.len() < 2 {
        // Monochrome split; a leaf is the only way forward.
        let entries = objs
            .iter()
            .map(|&o| {
                let parent_dist = parent.map_or(0.0, |p| scope.d(o, p));
                let pivot_dists = pivots.iter().map(|&p| scope.d(o, p)).collect();
                (o, parent_dist, pivot_dists)
            })
            .collect();
        return RamNode::Leaf(entries);
    }

    let mut groups = vec![Vec::new(); centers.len()];
    for &o in objs {
        let mut best_c = 0;
        let mut best_d = f64::INFINITY;
        for (i, &c) in centers.iter().enumerate() {
            let d = scope.d(o, c);
            if d < best_d {
                best_d = d;
                best_c = i;
            }
        }
        groups[best_c].push(o);
    }

    let mut entries = Vec::new();
    for (i, group) in groups.into_iter().enumerate() {
        if group.is_empty() {
            continue;
        }
        let center = centers[i];
        let radius = group.iter().map(|&o| scope.d(center, o)).fold(0.0, f64::max);
        let child = build_recursive(scope, &group, Some(center), node_capacity, pivots);
        let parent_dist = parent.map_or(0.0, |p| scope.d(center, p));
        let band = band_of(&child, pivots.len());
        entries.push((center, radius, parent_dist, band, child));
    }
    RamNode::Internal(entries)
}

/// Writes the subtree post-order and returns the offset of its root.
fn write_post_order(file: &mut NodeFile, scope: &mut DbScope, node: &RamNode) -> Result<u64, String> {
    let disk = match node {
        RamNode::Leaf(entries) => DiskNode {
            is_leaf: true,
            entries: entries
                .iter()
                .map(|(obj, parent_dist, pivot_dists)| Entry {
                    obj: *obj as u64,
                    radius: 0.0,
                    parent_dist: *parent_dist,
                    child: None,
                    band: pivot_dists.iter().map(|&d| (d, d)).collect(),
                })
                .collect(),
        },
        RamNode::Internal(entries) => {
            let mut disk_entries = Vec::with_capacity(entries.len());
            for (center, radius, parent_dist, band, child) in entries {
                let child_offset = write_post_order(file, scope, child)?;
                disk_entries.push(Entry {
                    obj: *center as u64,
                    radius: *radius,
                    parent_dist: *parent_dist,
                    child: Some(child_offset),
                    band: band.clone(),
                });
            }
            DiskNode {
                is_leaf: false,
                entries: disk_entries,
            }
        }
    };

    let (offset, bytes) = file.write_node(&disk)?;
    scope.page_writes(pages_for(bytes));
    Ok(offset)
}

impl KnnSource for PmTree {
    type Node = u64;

    fn roots(&mut self, query: ObjId, frontier: &mut Frontier<u64>, _: &mut KnnHeap) -> Result<(), String> {
        self.prepare_query(query);
        frontier.push(MaxItem(self.root, 0.0));
        Ok(())
    }

    fn expand(&mut self, offset: u64, query: ObjId, frontier: &mut Frontier<u64>, hits: &mut KnnHeap) -> Result<(), String> {
        let node = self.read(offset)?;

        for e in node.entries {
            let band_lb = band_lower_bound(&self.query_pivot_dists, &e.band);
            if hits.is_full() && band_lb > hits.tau() {
                continue;
            }

            let d = self.scope.d(query, e.obj as ObjId);
            match e.child {
                None => hits.offer(e.obj as ObjId, d),
                Some(child) => {
                    let lb = (d - e.radius).max(0.0).max(band_lb);
                    if !(hits.is_full() && lb > hits.tau()) {
                        frontier.push(MaxItem(child, lb));
                    }
                }
            }
        }
        Ok(())
    }
}

impl MetricIndex for PmTree {
    fn name(&self) -> String {
        format!("PMTree(capacity={}, pivots={})", self.node_capacity, self.pivots.len())
    }

    fn range_search(&mut self, query: ObjId, radius: f64) -> Result<Vec<ObjId>, String> {
        self.prepare_query(query);
        let mut hits = Vec::new();
        let root = self.root;
        self.range_descent(root, None, query, radius, &mut hits)?;
        Ok(hits)
    }

    fn knn_search(&mut self, query: ObjId, k: usize) -> Result<Vec<(ObjId, f64)>, String> {
        best_first_knn(self, query, k)
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
    fn searches_match_brute_force() -> Result<(), String> {
        let tmp = tempdir::TempDir::new("mexis-pmtree").map_err(|e| e.to_string())?;
        let path = tmp.path().join("toy.pmtree_index");
        let mut tree = PmTree::build(two_cluster_db(), &path, 4, 2, &[])?;

        let mut hits = tree.range_search(0, 1.0)?;
        hits.sort_unstable();
        assert_eq!(hits, vec![0, 1, 2]);

        let knn = tree.knn_search(0, 3)?;
        assert_eq!(knn[0], (0, 0.0));
        assert_eq!((knn[1].0, knn[2].0), (1, 2));
        Ok(())
    }

    #[test]
    fn pivot_filter_skips_far_subtrees() -> Result<(), String> {
        let tmp = tempdir::TempDir::new("mexis-pmtree").map_err(|e| e.to_string())?;
        let path = tmp.path().join("toy.pmtree_index");
        let mut tree = PmTree::build(two_cluster_db(), &path, 4, 2, &[])?;

        tree.clear_counters();
        let hits = tree.range_search(0, 0.5)?;
        assert_eq!(hits, vec![0]);
        // The far cluster never contributes a distance evaluation beyond its
        // routing object, if that.
        assert!(tree.counters().comp_dist < 6 + tree.pivots.len() as u64);
        Ok(())
    }

    #[test]
    fn reopen_matches_fresh_build() -> Result<(), String> {
        let tmp = tempdir::TempDir::new("mexis-pmtree").map_err(|e| e.to_string())?;
        let path = tmp.path().join("toy.pmtree_index");
        let db = two_cluster_db();

        let mut built = PmTree::build(db.clone(), &path, 4, 2, &[])?;
        built.clear_counters();
        let fresh = built.range_search(3, 2.0)?;
        let fresh_counters = built.counters();

        let mut reopened = PmTree::open(db, &path)?;
        let again = reopened.range_search(3, 2.0)?;
        assert_eq!(fresh, again);
        assert_eq!(fresh_counters, reopened.counters());
        Ok(())
    }
}
