//! The M-tree.

use std::path::Path;
use std::sync::Arc;

use mt_logger::{mt_log, Level};

use crate::dataset::{ObjId, ObjectDb};
use crate::scope::{pages_for, Counters, DbScope};
use crate::sm::NodeFile;
use crate::utils::{best_first_knn, Frontier, KnnHeap, KnnSource, MaxItem};
use crate::MetricIndex;

/// When a node has more objects than this, center selection runs on a
/// stride sample of this size instead of the full set.
const SAMPLE_THRESHOLD: usize = 10_000;

/// One entry of a persisted node.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
struct Entry {
    /// The object (leaf) or routing object (internal).
    obj: u64,
    /// Covering radius of the subtree; zero in leaves.
    radius: f64,
    /// Distance from this entry to its parent routing object; zero at the
    /// root level.
    parent_dist: f64,
    /// File offset of the child node; `None` in leaves.
    child: Option<u64>,
}

/// A persisted node: a leaf of objects or an internal node of routing
/// entries.
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
}

/// A node under construction, in RAM until the post-order write.
enum RamNode {
    /// A leaf: `(object, parent distance)` pairs.
    Leaf(Vec<(ObjId, f64)>),
    /// An internal node: `(center, radius, parent distance, child)` tuples.
    Internal(Vec<(ObjId, f64, f64, RamNode)>),
}

/// An M-tree, bulk-loaded and persisted to a single node file.
///
/// Routing entries carry a covering radius and the distance to their parent
/// routing object, so a range descent can discard an entry from the cached
/// parent distance alone before evaluating `d(q, R)` (the classic parent
/// filtering lemma).
pub struct MTree {
    /// The counted route to the database.
    scope: DbScope,
    /// The open node file.
    file: NodeFile,
    /// File offset of the root node.
    root: u64,
    /// Maximum entries per node.
    node_capacity: usize,
    /// Counters accumulated during the build.
    build: Counters,
}

impl MTree {
    /// Bulk-builds an M-tree over the whole database and persists it at
    /// `path`.
    ///
    /// # Errors
    ///
    /// - If `node_capacity < 4`.
    /// - If the index file cannot be written.
    pub fn build<P: AsRef<Path>>(db: Arc<ObjectDb>, path: P, node_capacity: usize) -> Result<Self, String> {
        if node_capacity < 4 {
            return Err("M-tree node capacity must be at least 4.".to_string());
        }

        let mut scope = DbScope::new(db);
        let objs = (0..scope.size()).collect::<Vec<_>>();
        let root_ram = build_recursive(&mut scope, &objs, None, node_capacity);

        let mut file = NodeFile::create(path)?;
        let root = write_post_order(&mut file, &mut scope, &root_ram)?;
        file.finish(
            root,
            &Meta {
                n: scope.size() as u64,
                node_capacity: node_capacity as u64,
            },
        )?;

        let build = scope.counters;
        scope.clear_counters();
        mt_log!(Level::Info, "M-tree build done: root at offset {root}, {} page writes", build.page_writes);
        Ok(Self {
            scope,
            file,
            root,
            node_capacity,
            build,
        })
    }

    /// Reopens a persisted M-tree from `path`.
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
            build: Counters::default(),
        })
    }

    /// File offset of the root node, as recorded in the header.
    #[must_use]
    pub const fn root_offset(&self) -> u64 {
        self.root
    }

    /// Collects the leaf buckets in depth-first order; this is the physical
    /// clustering other indexes reuse as a page layout.
    pub(crate) fn leaf_pages(&mut self) -> Result<Vec<Vec<ObjId>>, String> {
        let mut pages = Vec::new();
        let mut stack = vec![self.root];
        while let Some(offset) = stack.pop() {
            let node = self.read(offset)?;
            if node.is_leaf {
                pages.push(node.entries.iter().map(|e| e.obj as ObjId).collect());
            } else {
                // Reverse so the depth-first order matches entry order.
                for e in node.entries.iter().rev() {
                    if let Some(child) = e.child {
                        stack.push(child);
                    }
                }
            }
        }
        Ok(pages)
    }

    /// Reads a node, charging its logical pages.
    fn read(&mut self, offset: u64) -> Result<DiskNode, String> {
        let (node, bytes) = self.file.read_node(offset)?;
        self.scope.page_reads(pages_for(bytes));
        Ok(node)
    }

    /// Range descent with parent filtering.
    ///
    /// `parent` carries `d(parent, q)` when this node has a parent routing
    /// object.
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
            // Parent filtering: |d(P,q) - d(P,R)| > r + r_R rules the entry
            // out without evaluating d(R, q).
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

/// Bulk-loads the subtree of `objs`, with `parent` as the routing object of
/// the caller's entry.
fn build_recursive(scope: &mut DbScope, objs: &[ObjId], parent: Option<ObjId>, node_capacity: usize) -> RamNode {
    if objs.len() <= node_capacity {
        let entries = objs
            .iter()
            .map(|&o| (o, parent.map_or(0.0, |p| scope.d(o, p))))
            .collect();
        return RamNode::Leaf(entries);
    }

    // Farthest-first center selection, on a stride sample for large sets.
    let max_centers = node_capacity.min(objs.len());
    let sample = if objs.len() > SAMPLE_THRESHOLD {
        let step = objs.len() / SAMPLE_THRESHOLD;
        objs.iter().step_by(step.max(1)).copied().take(SAMPLE_THRESHOLD).collect()
    } else {
        objs.to_vec()
    };

    let mut centers = vec![objs[0]];
    let mut min_dist = sample.iter().map(|&o| scope.d(o, objs[0])).collect::<Vec<_>>();
    while centers.len() < max_centers {
        let best = min_dist
            .iter()
            .enumerate()
            .max_by(|(i, a), (j, b)| a.partial_cmp(b).unwrap_or(core::cmp::Ordering::Equal).then(j.cmp(i)))
            .map(|(i, _)| sample[i]);
        let Some(best) = best else { break };
        if centers.contains(&best) {
            break;
        }
        centers.push(best);
        for (i, &o) in sample.iter().enumerate() {
            let d = scope.d(o, best);
            if d < min_dist[i] {
                min_dist[i] = d;
            }
        }
    }

    // A monochrome split cannot make progress; fall back to a leaf.
    if centers.len() < 2 {
        let entries = objs
            .iter()
            .map(|&o| (o, parent.map_or(0.0, |p| scope.d(o, p))))
            .collect();
        return RamNode::Leaf(entries);
    }

    // Assign every object (centers included) to its nearest center.
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
        let child = build_recursive(scope, &group, Some(center), node_capacity);
        let parent_dist = parent.map_or(0.0, |p| scope.d(center, p));
        entries.push((center, radius, parent_dist, child));
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
                .map(|&(obj, parent_dist)| Entry {
                    obj: obj as u64,
                    radius: 0.0,
                    parent_dist,
                    child: None,
                })
                .collect(),
        },
        RamNode::Internal(entries) => {
            let mut disk_entries = Vec::with_capacity(entries.len());
            for (center, radius, parent_dist, child) in entries {
                let child_offset = write_post_order(file, scope, child)?;
                disk_entries.push(Entry {
                    obj: *center as u64,
                    radius: *radius,
                    parent_dist: *parent_dist,
                    child: Some(child_offset),
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

impl KnnSource for MTree {
    type Node = u64;

    fn roots(&mut self, _: ObjId, frontier: &mut Frontier<u64>, _: &mut KnnHeap) -> Result<(), String> {
        frontier.push(MaxItem(self.root, 0.0));
        Ok(())
    }

    fn expand(&mut self, offset: u64, query: ObjId, frontier: &mut Frontier<u64>, hits: &mut KnnHeap) -> Result<(), String> {
        let node = self.read(offset)?;

        for e in node.entries {
            let d = self.scope.d(query, e.obj as ObjId);
            match e.child {
                None => hits.offer(e.obj as ObjId, d),
                Some(child) => {
                    let lb = (d - e.radius).max(0.0);
                    if !(hits.is_full() && lb > hits.tau()) {
                        frontier.push(MaxItem(child, lb));
                    }
                }
            }
        }
        Ok(())
    }
}

impl MetricIndex for MTree {
    fn name(&self) -> String {
        format!("MTree(capacity={})", self.node_capacity)
    }

    fn range_search(&mut self, query: ObjId, radius: f64) -> Result<Vec<ObjId>, String> {
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
        let tmp = tempdir::TempDir::new("mexis-mtree").map_err(|e| e.to_string())?;
        let path = tmp.path().join("toy.mtree_index");
        let mut tree = MTree::build(two_cluster_db(), &path, 4)?;

        let mut hits = tree.range_search(0, 1.0)?;
        hits.sort_unstable();
        assert_eq!(hits, vec![0, 1, 2]);

        let knn = tree.knn_search(0, 3)?;
        assert_eq!(knn[0], (0, 0.0));
        assert_eq!((knn[1].0, knn[2].0), (1, 2));
        Ok(())
    }

    #[test]
    fn reopen_matches_fresh_build() -> Result<(), String> {
        let tmp = tempdir::TempDir::new("mexis-mtree").map_err(|e| e.to_string())?;
        let path = tmp.path().join("toy.mtree_index");
        let db = two_cluster_db();

        let mut built = MTree::build(db.clone(), &path, 4)?;
        let built_root = built.root_offset();
        built.clear_counters();
        let fresh = built.knn_search(2, 4)?;
        let fresh_counters = built.counters();

        let mut reopened = MTree::open(db, &path)?;
        assert_eq!(reopened.root_offset(), built_root);
        let again = reopened.knn_search(2, 4)?;
        assert_eq!(fresh, again);
        assert_eq!(fresh_counters, reopened.counters());
        Ok(())
    }

    #[test]
    fn duplicate_heavy_data_still_builds() -> Result<(), String> {
        let db = Arc::new(ObjectDb::Vectors {
            rows: vec![vec![1.0]; 20],
            dim: 1,
            lp: Lp::L2,
        });
        let tmp = tempdir::TempDir::new("mexis-mtree").map_err(|e| e.to_string())?;
        let path = tmp.path().join("dup.mtree_index");

        let mut tree = MTree::build(db, &path, 4)?;
        let hits = tree.range_search(0, 0.0)?;
        assert_eq!(hits.len(), 20);
        Ok(())
    }
}
