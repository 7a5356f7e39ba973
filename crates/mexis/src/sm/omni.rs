//! The OmniR-tree: pivot mapping into an R-tree.

use std::collections::BinaryHeap;
use std::path::Path;
use std::sync::Arc;

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::dataset::{ObjId, ObjectDb};
use crate::scope::{Counters, DbScope};
use crate::sm::Raf;
use crate::utils::{MaxItem, SizedHeap};
use crate::MetricIndex;

/// A hyper-rectangle in pivot space.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
struct Mbb {
    /// Per-dimension lower bounds.
    low: Vec<f64>,
    /// Per-dimension upper bounds.
    high: Vec<f64>,
}

impl Mbb {
    /// An empty box of `dim` dimensions, ready to be expanded.
    fn empty(dim: usize) -> Self {
        Self {
            low: vec![f64::INFINITY; dim],
            high: vec![f64::NEG_INFINITY; dim],
        }
    }

    /// Expands the box to cover `point`.
    fn expand_point(&mut self, point: &[f64]) {
        for (i, &x) in point.iter().enumerate() {
            self.low[i] = self.low[i].min(x);
            self.high[i] = self.high[i].max(x);
        }
    }

    /// Expands the box to cover `other`.
    fn expand_box(&mut self, other: &Self) {
        for i in 0..self.low.len() {
            self.low[i] = self.low[i].min(other.low[i]);
            self.high[i] = self.high[i].max(other.high[i]);
        }
    }

    /// Whether the box intersects the hyper-cube of side `2r` around `q`.
    fn intersects_query(&self, q: &[f64], r: f64) -> bool {
        q.iter()
            .enumerate()
            .all(|(i, &x)| x - r <= self.high[i] && x + r >= self.low[i])
    }

    /// The L-infinity distance from `q` to the box; a lower bound on the
    /// metric distance from the query to anything mapped inside it.
    fn lower_bound(&self, q: &[f64]) -> f64 {
        q.iter()
            .enumerate()
            .map(|(i, &x)| (self.low[i] - x).max(x - self.high[i]).max(0.0))
            .fold(0.0, f64::max)
    }

    /// The volume of the box, for the enlargement heuristics.
    fn volume(&self) -> f64 {
        self.low
            .iter()
            .zip(self.high.iter())
            .map(|(&lo, &hi)| (hi - lo).max(0.0))
            .product()
    }

    /// The center of the box.
    fn center(&self) -> Vec<f64> {
        self.low
            .iter()
            .zip(self.high.iter())
            .map(|(&lo, &hi)| (lo + hi) / 2.0)
            .collect()
    }
}

/// One R-tree node, in the arena.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
struct RNode {
    /// Whether this node's entries are objects rather than children.
    is_leaf: bool,
    /// Leaf entries: `(object id, mapped point)`.
    points: Vec<(u64, Vec<f64>)>,
    /// Internal entries: `(bounding box, child arena index)`.
    children: Vec<(Mbb, u32)>,
}

/// The whole structure, persisted in the metadata file.
#[derive(serde::Serialize, serde::Deserialize)]
struct Meta {
    /// Number of objects at build time.
    n: u64,
    /// The pivot ids of the mapping.
    pivots: Vec<u64>,
    /// Maximum entries per node.
    max_entries: u64,
    /// The node arena.
    nodes: Vec<RNode>,
    /// Arena index of the root.
    root: u32,
}

/// An OmniR-tree.
///
/// Objects are mapped to pivot space by `φ(o) = (d(o, p_1), ..., d(o, p_l))`
/// and inserted into an R-tree with linear split and minimal-enlargement
/// descent. A range query searches the hyper-cube of side `2r` around
/// `φ(q)` and verifies the surviving candidates with the true distance,
/// fetching each from the record file.
pub struct OmniRTree {
    /// The counted route to the database.
    scope: DbScope,
    /// The pivot ids of the mapping.
    pivots: Vec<ObjId>,
    /// The node arena.
    nodes: Vec<RNode>,
    /// Arena index of the root.
    root: u32,
    /// Maximum entries per node.
    max_entries: usize,
    /// The record file holding the stored objects.
    raf: Raf,
    /// Counters accumulated during the build.
    build: Counters,
}

/// The two files of an OmniR-tree: `<base>.omni_meta` and `<base>.omni_raf`.
fn paths(base: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
    (base.with_extension("omni_meta"), base.with_extension("omni_raf"))
}

impl OmniRTree {
    /// Builds an OmniR-tree and persists it under `base`.
    ///
    /// `pivots`, when non-empty, supplies the pivot set (HFI pivots);
    /// otherwise `n_pivots` seeded-random objects are used.
    ///
    /// # Errors
    ///
    /// - If no pivots are available or `max_entries < 4`.
    /// - If the files cannot be written.
    pub fn build<P: AsRef<Path>>(
        db: Arc<ObjectDb>,
        base: P,
        n_pivots: usize,
        pivots: &[ObjId],
        max_entries: usize,
        seed: u64,
    ) -> Result<Self, String> {
        if max_entries < 4 {
            return Err("OmniR-tree node capacity must be at least 4.".to_string());
        }
        let pivots = if pivots.is_empty() {
            if n_pivots == 0 {
                return Err("OmniR-tree needs at least one pivot.".to_string());
            }
            let mut ids = (0..db.size()).collect::<Vec<_>>();
            let mut rng = StdRng::seed_from_u64(seed);
            ids.shuffle(&mut rng);
            let mut chosen = ids.into_iter().take(n_pivots.min(db.size())).collect::<Vec<_>>();
            chosen.sort_unstable();
            chosen
        } else {
            pivots.to_vec()
        };
        let (meta_path, raf_path) = paths(base.as_ref());

        let mut scope = DbScope::new(db);
        let n = scope.size();

        let mut raf = Raf::create(&raf_path)?;
        for id in 0..n {
            let payload = scope.db().render(id);
            raf.append(id as u64, payload.as_bytes())?;
            scope.page_writes(1);
        }
        raf.sync()?;

        let mut tree = Tree {
            nodes: vec![RNode {
                is_leaf: true,
                points: Vec::new(),
                children: Vec::new(),
            }],
            root: 0,
            max_entries,
            dim: pivots.len(),
        };
        for id in 0..n {
            let mapped = pivots.iter().map(|&p| scope.d(id, p)).collect::<Vec<_>>();
            tree.insert(id as u64, mapped);
        }

        let meta = Meta {
            n: n as u64,
            pivots: pivots.iter().map(|&p| p as u64).collect(),
            max_entries: max_entries as u64,
            nodes: tree.nodes.clone(),
            root: tree.root,
        };
        let encoded = bincode::serialize(&meta).map_err(|e| format!("Could not serialize OmniR-tree: {e}"))?;
        let meta_tmp = meta_path.with_extension("omni_meta.tmp");
        std::fs::write(&meta_tmp, &encoded)
            .map_err(|e| format!("Could not write '{}': {e}", meta_tmp.display()))?;
        std::fs::rename(&meta_tmp, &meta_path)
            .map_err(|e| format!("Could not rename '{}' into place: {e}", meta_tmp.display()))?;

        let build = scope.counters;
        scope.clear_counters();
        Ok(Self {
            scope,
            pivots,
            nodes: tree.nodes,
            root: tree.root,
            max_entries,
            raf,
            build,
        })
    }

    /// Reopens a persisted OmniR-tree from `base`.
    ///
    /// # Errors
    ///
    /// - If either file is missing or corrupt.
    pub fn open<P: AsRef<Path>>(db: Arc<ObjectDb>, base: P) -> Result<Self, String> {
        let (meta_path, raf_path) = paths(base.as_ref());

        let encoded = std::fs::read(&meta_path)
            .map_err(|e| format!("Could not read '{}': {e}", meta_path.display()))?;
        let meta: Meta = bincode::deserialize(&encoded)
            .map_err(|e| format!("Corrupt OmniR-tree in '{}': {e}", meta_path.display()))?;
        let raf = Raf::open(&raf_path)?;

        Ok(Self {
            scope: DbScope::new(db),
            pivots: meta.pivots.iter().map(|&p| p as ObjId).collect(),
            nodes: meta.nodes,
            root: meta.root,
            max_entries: usize::try_from(meta.max_entries).unwrap_or(4),
            raf,
            build: Counters::default(),
        })
    }

    /// The query's mapped point `φ(q)`.
    fn map_query(&mut self, query: ObjId) -> Vec<f64> {
        let pivots = self.pivots.clone();
        pivots.into_iter().map(|p| self.scope.d(query, p)).collect()
    }

    /// Verifies one candidate with the true distance, fetching it from the
    /// record file first.
    fn verify(&mut self, query: ObjId, id: ObjId) -> Result<f64, String> {
        self.raf.read(id as u64)?;
        self.scope.page_reads(1);
        Ok(self.scope.d(query, id))
    }
}

/// The in-memory R-tree under construction and at query time.
struct Tree {
    /// The node arena.
    nodes: Vec<RNode>,
    /// Arena index of the root.
    root: u32,
    /// Maximum entries per node.
    max_entries: usize,
    /// Dimensionality of the mapped space.
    dim: usize,
}

impl Tree {
    /// The bounding box of a node's entries.
    fn node_mbb(&self, node: u32) -> Mbb {
        let n = &self.nodes[node as usize];
        let mut mbb = Mbb::empty(self.dim);
        if n.is_leaf {
            for (_, point) in &n.points {
                mbb.expand_point(point);
            }
        } else {
            for (child_box, _) in &n.children {
                mbb.expand_box(child_box);
            }
        }
        mbb
    }

    /// Inserts one mapped point, splitting on overflow.
    fn insert(&mut self, id: u64, point: Vec<f64>) {
        let root = self.root;
        self.insert_rec(root, id, &point);

        let needs_split = {
            let r = &self.nodes[self.root as usize];
            if r.is_leaf {
                r.points.len() > self.max_entries
            } else {
                r.children.len() > self.max_entries
            }
        };
        if needs_split {
            let old_root = self.root;
            let (a, b) = self.split(old_root);
            let box_a = self.node_mbb(a);
            let box_b = self.node_mbb(b);
            let new_root = u32::try_from(self.nodes.len()).unwrap_or(0);
            self.nodes.push(RNode {
                is_leaf: false,
                points: Vec::new(),
                children: vec![(box_a, a), (box_b, b)],
            });
            self.root = new_root;
        }
    }

    /// Recursive insertion along the minimal-enlargement path.
    fn insert_rec(&mut self, node: u32, id: u64, point: &[f64]) {
        if self.nodes[node as usize].is_leaf {
            self.nodes[node as usize].points.push((id, point.to_vec()));
            return;
        }

        // Choose the child whose box grows the least.
        let mut best = 0;
        let mut best_inc = f64::INFINITY;
        for (i, (child_box, _)) in self.nodes[node as usize].children.iter().enumerate() {
            let mut merged = child_box.clone();
            merged.expand_point(point);
            let inc = merged.volume() - child_box.volume();
            if inc < best_inc {
                best_inc = inc;
                best = i;
            }
        }

        let child = self.nodes[node as usize].children[best].1;
        self.insert_rec(child, id, point);
        self.nodes[node as usize].children[best].0.expand_point(point);

        let overflow = {
            let c = &self.nodes[child as usize];
            if c.is_leaf {
                c.points.len() > self.max_entries
            } else {
                c.children.len() > self.max_entries
            }
        };
        if overflow {
            let (a, b) = self.split(child);
            let box_a = self.node_mbb(a);
            let box_b = self.node_mbb(b);
            let children = &mut self.nodes[node as usize].children;
            children.remove(best);
            children.insert(best, (box_b, b));
            children.insert(best, (box_a, a));
        }
    }

    /// Linear split: the two entries with maximal center separation seed the
    /// halves, the rest go to whichever grows less.
    fn split(&mut self, node: u32) -> (u32, u32) {
        let is_leaf = self.nodes[node as usize].is_leaf;

        // Collect entry boxes.
        let entries: Vec<(Mbb, EntryPayload)> = if is_leaf {
            self.nodes[node as usize]
                .points
                .clone()
                .into_iter()
                .map(|(id, point)| {
                    let mut b = Mbb::empty(self.dim);
                    b.expand_point(&point);
                    (b, EntryPayload::Point(id, point))
                })
                .collect()
        } else {
            self.nodes[node as usize]
                .children
                .clone()
                .into_iter()
                .map(|(b, c)| (b.clone(), EntryPayload::Child(b, c)))
                .collect()
        };

        let mut seed_a = 0;
        let mut seed_b = if entries.len() > 1 { 1 } else { 0 };
        let mut best_sep = -1.0;
        for i in 0..entries.len() {
            for j in (i + 1)..entries.len() {
                let ci = entries[i].0.center();
                let cj = entries[j].0.center();
                let sep = ci
                    .iter()
                    .zip(cj.iter())
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum::<f64>();
                if sep > best_sep {
                    best_sep = sep;
                    seed_a = i;
                    seed_b = j;
                }
            }
        }

        let mut half_a = Vec::new();
        let mut half_b = Vec::new();
        let mut box_a = entries[seed_a].0.clone();
        let mut box_b = entries[seed_b].0.clone();
        for (i, (entry_box, payload)) in entries.into_iter().enumerate() {
            if i == seed_a {
                half_a.push(payload);
                continue;
            }
            if i == seed_b {
                half_b.push(payload);
                continue;
            }
            let mut grown_a = box_a.clone();
            grown_a.expand_box(&entry_box);
            let mut grown_b = box_b.clone();
            grown_b.expand_box(&entry_box);
            let inc_a = grown_a.volume() - box_a.volume();
            let inc_b = grown_b.volume() - box_b.volume();
            if inc_a < inc_b {
                box_a = grown_a;
                half_a.push(payload);
            } else {
                box_b = grown_b;
                half_b.push(payload);
            }
        }

        let make_node = |payloads: Vec<EntryPayload>| -> RNode {
            let mut node = RNode {
                is_leaf,
                points: Vec::new(),
                children: Vec::new(),
            };
            for p in payloads {
                match p {
                    EntryPayload::Point(id, point) => node.points.push((id, point)),
                    EntryPayload::Child(b, c) => node.children.push((b, c)),
                }
            }
            node
        };

        // Reuse the split node's slot for the first half.
        let a = node;
        self.nodes[a as usize] = make_node(half_a);
        let b = u32::try_from(self.nodes.len()).unwrap_or(0);
        self.nodes.push(make_node(half_b));
        (a, b)
    }
}

/// One entry moved around during a node split.
enum EntryPayload {
    /// A leaf point.
    Point(u64, Vec<f64>),
    /// A child reference with its box.
    Child(Mbb, u32),
}

impl MetricIndex for OmniRTree {
    fn name(&self) -> String {
        format!("OmniRTree(pivots={}, fanout={})", self.pivots.len(), self.max_entries)
    }

    fn range_search(&mut self, query: ObjId, radius: f64) -> Result<Vec<ObjId>, String> {
        let q_map = self.map_query(query);

        // Hyper-rectangle search for candidates.
        let mut candidates = Vec::new();
        let mut stack = vec![self.root];
        while let Some(node) = stack.pop() {
            let node = self.nodes[node as usize].clone();
            if node.is_leaf {
                for (id, point) in &node.points {
                    let inside = q_map
                        .iter()
                        .zip(point.iter())
                        .all(|(&qx, &px)| (qx - px).abs() <= radius);
                    if inside {
                        candidates.push(*id as ObjId);
                    }
                }
            } else {
                for (child_box, child) in &node.children {
                    if child_box.intersects_query(&q_map, radius) {
                        stack.push(*child);
                    }
                }
            }
        }
        candidates.sort_unstable();

        let mut hits = Vec::new();
        for id in candidates {
            if self.verify(query, id)? <= radius {
                hits.push(id);
            }
        }
        Ok(hits)
    }

    fn knn_search(&mut self, query: ObjId, k: usize) -> Result<Vec<(ObjId, f64)>, String> {
        let mut heap = SizedHeap::new(Some(k));
        if k == 0 {
            return Ok(Vec::new());
        }
        let q_map = self.map_query(query);

        // Best-first over nodes and mapped points; the L-infinity distance
        // in pivot space lower-bounds the metric distance.
        /// A frontier entry: an R-tree node or one mapped object.
        #[derive(Clone, Copy)]
        enum Entry {
            /// A node in the arena.
            Node(u32),
            /// An object candidate.
            Object(ObjId),
        }

        let mut entries = Vec::new();
        let mut frontier = BinaryHeap::new();
        entries.push(Entry::Node(self.root));
        frontier.push(MaxItem(0_usize, 0.0));

        while let Some(MaxItem(entry_idx, lb)) = frontier.pop() {
            let tau = if heap.is_full() {
                heap.peek().map_or(f64::INFINITY, |(_, &d)| d)
            } else {
                f64::INFINITY
            };
            if heap.is_full() && lb > tau {
                break;
            }

            match entries[entry_idx] {
                Entry::Object(id) => {
                    let d = self.verify(query, id)?;
                    heap.push((id, d));
                }
                Entry::Node(node) => {
                    let node = self.nodes[node as usize].clone();
                    if node.is_leaf {
                        for (id, point) in &node.points {
                            let lb = q_map
                                .iter()
                                .zip(point.iter())
                                .map(|(&qx, &px)| (qx - px).abs())
                                .fold(0.0, f64::max);
                            let idx = entries.len();
                            entries.push(Entry::Object(*id as ObjId));
                            frontier.push(MaxItem(idx, lb));
                        }
                    } else {
                        for (child_box, child) in &node.children {
                            let idx = entries.len();
                            entries.push(Entry::Node(*child));
                            frontier.push(MaxItem(idx, child_box.lower_bound(&q_map)));
                        }
                    }
                }
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
    fn searches_match_brute_force() -> Result<(), String> {
        let tmp = tempdir::TempDir::new("mexis-omni").map_err(|e| e.to_string())?;
        let base = tmp.path().join("toy");
        let mut omni = OmniRTree::build(two_cluster_db(), &base, 2, &[], 4, 42)?;

        let mut hits = omni.range_search(0, 1.0)?;
        hits.sort_unstable();
        assert_eq!(hits, vec![0, 1, 2]);

        let knn = omni.knn_search(0, 3)?;
        assert_eq!(knn[0], (0, 0.0));
        assert_eq!((knn[1].0, knn[2].0), (1, 2));
        Ok(())
    }

    #[test]
    fn reopen_matches_fresh_build() -> Result<(), String> {
        let tmp = tempdir::TempDir::new("mexis-omni").map_err(|e| e.to_string())?;
        let base = tmp.path().join("toy");
        let db = two_cluster_db();

        let mut built = OmniRTree::build(db.clone(), &base, 2, &[], 4, 42)?;
        built.clear_counters();
        let fresh = built.range_search(5, 2.0)?;
        let fresh_counters = built.counters();

        let mut reopened = OmniRTree::open(db, &base)?;
        let again = reopened.range_search(5, 2.0)?;
        assert_eq!(fresh, again);
        assert_eq!(fresh_counters, reopened.counters());
        Ok(())
    }
}
