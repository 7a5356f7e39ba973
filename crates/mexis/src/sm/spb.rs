//! The SPB-tree: pivot mapping, a space-filling curve, and a B+-tree.

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
    /// An empty box of `dim` dimensions.
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

    /// The L-infinity distance from `q` to the box.
    fn lower_bound(&self, q: &[f64]) -> f64 {
        q.iter()
            .enumerate()
            .map(|(i, &x)| (self.low[i] - x).max(x - self.high[i]).max(0.0))
            .fold(0.0, f64::max)
    }

    /// Whether the box intersects the range region `[q - r, q + r]` per
    /// dimension.
    fn intersects_region(&self, q: &[f64], r: f64) -> bool {
        q.iter()
            .enumerate()
            .all(|(i, &x)| self.high[i] >= (x - r).max(0.0) && self.low[i] <= x + r)
    }
}

/// The discretizer from pivot space onto the Morton curve.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
struct SfcMapper {
    /// Per-dimension minima observed at build time.
    min: Vec<f64>,
    /// Per-dimension maxima observed at build time.
    max: Vec<f64>,
    /// Bits per dimension; dimensions share a 64-bit key.
    bits_per_dim: u32,
}

impl SfcMapper {
    /// Fits the mapper to the mapped vectors of the whole dataset.
    fn fit(mapped: &[Vec<f64>]) -> Self {
        let dims = mapped.first().map_or(1, Vec::len);
        let mut min = vec![f64::INFINITY; dims];
        let mut max = vec![f64::NEG_INFINITY; dims];
        for point in mapped {
            for (i, &x) in point.iter().enumerate() {
                min[i] = min[i].min(x);
                max[i] = max[i].max(x);
            }
        }
        let bits_per_dim = (64 / dims.max(1) as u32).clamp(1, 16);
        Self { min, max, bits_per_dim }
    }

    /// Quantizes one coordinate to `bits_per_dim` bits.
    fn scalarize(&self, i: usize, x: f64) -> u64 {
        let (lo, hi) = (self.min[i], self.max[i]);
        let max_q = (1_u64 << self.bits_per_dim) - 1;
        if hi <= lo {
            return 0;
        }
        let t = ((x - lo) / (hi - lo)).clamp(0.0, 1.0);
        #[expect(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let q = (t * max_q as f64 + 0.5).floor() as u64;
        q.min(max_q)
    }

    /// The Morton key of one mapped point: coordinate bits interleaved from
    /// the most significant down.
    fn key(&self, point: &[f64]) -> u64 {
        let coords = point
            .iter()
            .enumerate()
            .map(|(i, &x)| self.scalarize(i, x))
            .collect::<Vec<_>>();

        let mut key = 0_u64;
        for b in (0..self.bits_per_dim).rev() {
            for &c in &coords {
                key = (key << 1) | ((c >> b) & 1);
            }
        }
        key
    }
}

/// One record of the B+-tree: SFC key, object id, and the mapped vector.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
struct Record {
    /// The Morton key of the mapped vector.
    key: u64,
    /// The object id.
    id: u64,
    /// The mapped vector `φ(o)`.
    mapped: Vec<f64>,
}

/// One node of the bulk-loaded B+-tree.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
struct BNode {
    /// Whether this node holds records rather than children.
    is_leaf: bool,
    /// Leaf records, sorted by key.
    records: Vec<Record>,
    /// Child arena indices for internal nodes.
    children: Vec<u32>,
    /// The pivot-space box of the subtree.
    mbb: Mbb,
    /// Smallest key below this node.
    min_key: u64,
    /// Largest key below this node.
    max_key: u64,
}

/// The whole structure, persisted in the metadata file.
#[derive(serde::Serialize, serde::Deserialize)]
struct Meta {
    /// Number of objects at build time.
    n: u64,
    /// The pivot ids of the mapping.
    pivots: Vec<u64>,
    /// The fitted SFC mapper.
    sfc: SfcMapper,
    /// The node arena.
    nodes: Vec<BNode>,
    /// Arena index of the root, `None` for an empty tree.
    root: Option<u32>,
}

/// An SPB-tree.
///
/// Objects are mapped to pivot space, discretized onto a Morton curve, and
/// bulk-loaded into a B+-tree whose nodes carry the pivot-space box of their
/// subtree. Range queries prune by box intersection with the range region,
/// confirm certain members without a distance call when some pivot already
/// proves `d(q, o) <= r`, and verify the rest against the record file.
pub struct SpbTree {
    /// The counted route to the database.
    scope: DbScope,
    /// The pivot ids of the mapping.
    pivots: Vec<ObjId>,
    /// The node arena.
    nodes: Vec<BNode>,
    /// Arena index of the root.
    root: Option<u32>,
    /// The record file holding the stored objects.
    raf: Raf,
    /// Counters accumulated during the build.
    build: Counters,
}

/// The two files of an SPB-tree: `<base>.spb_meta` and `<base>.spb_raf`.
fn paths(base: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
    (base.with_extension("spb_meta"), base.with_extension("spb_raf"))
}

/// Leaf capacity and fanout of the bulk load.
const LEAF_CAPACITY: usize = 128;
/// Fanout of internal levels.
const FANOUT: usize = 64;

impl SpbTree {
    /// Builds an SPB-tree and persists it under `base`.
    ///
    /// `pivots`, when non-empty, supplies the pivot set (HFI pivots);
    /// otherwise `n_pivots` seeded-random objects are used.
    ///
    /// # Errors
    ///
    /// - If no pivots are available.
    /// - If the files cannot be written.
    pub fn build<P: AsRef<Path>>(
        db: Arc<ObjectDb>,
        base: P,
        n_pivots: usize,
        pivots: &[ObjId],
        seed: u64,
    ) -> Result<Self, String> {
        let pivots = if pivots.is_empty() {
            if n_pivots == 0 {
                return Err("SPB-tree needs at least one pivot.".to_string());
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

        let mapped = (0..n)
            .map(|id| pivots.iter().map(|&p| scope.d(id, p)).collect::<Vec<_>>())
            .collect::<Vec<_>>();
        let sfc = SfcMapper::fit(&mapped);

        let mut records = mapped
            .into_iter()
            .enumerate()
            .map(|(id, mv)| Record {
                key: sfc.key(&mv),
                id: id as u64,
                mapped: mv,
            })
            .collect::<Vec<_>>();
        records.sort_by(|a, b| a.key.cmp(&b.key).then(a.id.cmp(&b.id)));

        let (nodes, root) = bulk_load(records, pivots.len());

        let meta = Meta {
            n: n as u64,
            pivots: pivots.iter().map(|&p| p as u64).collect(),
            sfc: sfc.clone(),
            nodes: nodes.clone(),
            root,
        };
        let encoded = bincode::serialize(&meta).map_err(|e| format!("Could not serialize SPB-tree: {e}"))?;
        let meta_tmp = meta_path.with_extension("spb_meta.tmp");
        std::fs::write(&meta_tmp, &encoded)
            .map_err(|e| format!("Could not write '{}': {e}", meta_tmp.display()))?;
        std::fs::rename(&meta_tmp, &meta_path)
            .map_err(|e| format!("Could not rename '{}' into place: {e}", meta_tmp.display()))?;

        let build = scope.counters;
        scope.clear_counters();
        Ok(Self {
            scope,
            pivots,
            nodes,
            root,
            raf,
            build,
        })
    }

    /// Reopens a persisted SPB-tree from `base`.
    ///
    /// # Errors
    ///
    /// - If either file is missing or corrupt.
    pub fn open<P: AsRef<Path>>(db: Arc<ObjectDb>, base: P) -> Result<Self, String> {
        let (meta_path, raf_path) = paths(base.as_ref());

        let encoded = std::fs::read(&meta_path)
            .map_err(|e| format!("Could not read '{}': {e}", meta_path.display()))?;
        let meta: Meta = bincode::deserialize(&encoded)
            .map_err(|e| format!("Corrupt SPB-tree in '{}': {e}", meta_path.display()))?;
        let raf = Raf::open(&raf_path)?;

        Ok(Self {
            scope: DbScope::new(db),
            pivots: meta.pivots.iter().map(|&p| p as ObjId).collect(),
            nodes: meta.nodes,
            root: meta.root,
            raf,
            build: Counters::default(),
        })
    }

    /// The query's mapped point `φ(q)`.
    fn map_query(&mut self, query: ObjId) -> Vec<f64> {
        let pivots = self.pivots.clone();
        pivots.into_iter().map(|p| self.scope.d(query, p)).collect()
    }
}

/// Bulk-loads sorted records into a B+-tree arena; returns `(arena, root)`.
fn bulk_load(records: Vec<Record>, dims: usize) -> (Vec<BNode>, Option<u32>) {
    if records.is_empty() {
        return (Vec::new(), None);
    }

    let mut nodes = Vec::new();
    let mut level = Vec::new();
    for chunk in records.chunks(LEAF_CAPACITY) {
        let mut mbb = Mbb::empty(dims);
        for rec in chunk {
            mbb.expand_point(&rec.mapped);
        }
        let idx = u32::try_from(nodes.len()).unwrap_or(0);
        nodes.push(BNode {
            is_leaf: true,
            records: chunk.to_vec(),
            children: Vec::new(),
            mbb,
            min_key: chunk.first().map_or(0, |r| r.key),
            max_key: chunk.last().map_or(0, |r| r.key),
        });
        level.push(idx);
    }

    while level.len() > 1 {
        let mut next = Vec::new();
        for chunk in level.chunks(FANOUT) {
            let mut mbb = Mbb::empty(dims);
            let mut min_key = u64::MAX;
            let mut max_key = 0;
            for &c in chunk {
                mbb.expand_box(&nodes[c as usize].mbb);
                min_key = min_key.min(nodes[c as usize].min_key);
                max_key = max_key.max(nodes[c as usize].max_key);
            }
            let idx = u32::try_from(nodes.len()).unwrap_or(0);
            nodes.push(BNode {
                is_leaf: false,
                records: Vec::new(),
                children: chunk.to_vec(),
                mbb,
                min_key,
                max_key,
            });
            next.push(idx);
        }
        level = next;
    }

    let root = level.first().copied();
    (nodes, root)
}

impl MetricIndex for SpbTree {
    fn name(&self) -> String {
        format!("SPBTree(pivots={})", self.pivots.len())
    }

    fn range_search(&mut self, query: ObjId, radius: f64) -> Result<Vec<ObjId>, String> {
        let Some(root) = self.root else {
            return Ok(Vec::new());
        };
        let q_map = self.map_query(query);

        let mut hits = Vec::new();
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            let node = self.nodes[node as usize].clone();
            if !node.mbb.intersects_region(&q_map, radius) {
                continue;
            }

            if node.is_leaf {
                for rec in &node.records {
                    // The range region contains every possible answer.
                    let in_region = q_map
                        .iter()
                        .zip(rec.mapped.iter())
                        .all(|(&qx, &px)| px >= (qx - radius).max(0.0) && px <= qx + radius);
                    if !in_region {
                        continue;
                    }

                    // Certain inclusion: one pivot close enough to both ends
                    // proves membership without a distance call.
                    let sure = q_map
                        .iter()
                        .zip(rec.mapped.iter())
                        .any(|(&qx, &px)| radius - qx >= 0.0 && px <= radius - qx);
                    if sure {
                        hits.push(rec.id as ObjId);
                        continue;
                    }

                    self.raf.read(rec.id)?;
                    self.scope.page_reads(1);
                    if self.scope.d(query, rec.id as ObjId) <= radius {
                        hits.push(rec.id as ObjId);
                    }
                }
            } else {
                for &child in &node.children {
                    stack.push(child);
                }
            }
        }
        hits.sort_unstable();
        Ok(hits)
    }

    fn knn_search(&mut self, query: ObjId, k: usize) -> Result<Vec<(ObjId, f64)>, String> {
        let mut heap = SizedHeap::new(Some(k));
        if k == 0 {
            return Ok(Vec::new());
        }
        let Some(root) = self.root else {
            return Ok(Vec::new());
        };
        let q_map = self.map_query(query);

        /// A frontier entry: a B+-tree node or one record candidate.
        #[derive(Clone, Copy)]
        enum Entry {
            /// A node in the arena.
            Node(u32),
            /// A record: `(node, record index)`.
            Record(u32, u32),
        }

        let mut entries = Vec::new();
        let mut frontier = BinaryHeap::new();
        entries.push(Entry::Node(root));
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
                Entry::Record(node, rec_idx) => {
                    let rec = self.nodes[node as usize].records[rec_idx as usize].clone();
                    self.raf.read(rec.id)?;
                    self.scope.page_reads(1);
                    let d = self.scope.d(query, rec.id as ObjId);
                    heap.push((rec.id as ObjId, d));
                }
                Entry::Node(node_idx) => {
                    let node = self.nodes[node_idx as usize].clone();
                    if node.is_leaf {
                        for (i, rec) in node.records.iter().enumerate() {
                            let lb = q_map
                                .iter()
                                .zip(rec.mapped.iter())
                                .map(|(&qx, &px)| (qx - px).abs())
                                .fold(0.0, f64::max);
                            let idx = entries.len();
                            entries.push(Entry::Record(node_idx, u32::try_from(i).unwrap_or(0)));
                            frontier.push(MaxItem(idx, lb));
                        }
                    } else {
                        for &child in &node.children {
                            let idx = entries.len();
                            entries.push(Entry::Node(child));
                            frontier.push(MaxItem(idx, self.nodes[child as usize].mbb.lower_bound(&q_map)));
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
    fn morton_keys_interleave_bits() {
        let sfc = SfcMapper {
            min: vec![0.0, 0.0],
            max: vec![3.0, 3.0],
            bits_per_dim: 2,
        };
        // (3, 0) -> coords (3, 0) -> bits 11 and 00 -> interleaved 1010.
        assert_eq!(sfc.key(&[3.0, 0.0]), 0b1010);
        // (3, 3) -> all ones.
        assert_eq!(sfc.key(&[3.0, 3.0]), 0b1111);
    }

    #[test]
    fn searches_match_brute_force() -> Result<(), String> {
        let tmp = tempdir::TempDir::new("mexis-spb").map_err(|e| e.to_string())?;
        let base = tmp.path().join("toy");
        let mut spb = SpbTree::build(two_cluster_db(), &base, 2, &[], 42)?;

        let mut hits = spb.range_search(0, 1.0)?;
        hits.sort_unstable();
        assert_eq!(hits, vec![0, 1, 2]);

        let knn = spb.knn_search(0, 3)?;
        assert_eq!(knn[0], (0, 0.0));
        assert_eq!((knn[1].0, knn[2].0), (1, 2));
        Ok(())
    }

    #[test]
    fn reopen_matches_fresh_build() -> Result<(), String> {
        let tmp = tempdir::TempDir::new("mexis-spb").map_err(|e| e.to_string())?;
        let base = tmp.path().join("toy");
        let db = two_cluster_db();

        let mut built = SpbTree::build(db.clone(), &base, 2, &[], 42)?;
        built.clear_counters();
        let fresh = built.knn_search(3, 4)?;
        let fresh_counters = built.counters();

        let mut reopened = SpbTree::open(db, &base)?;
        let again = reopened.knn_search(3, 4)?;
        assert_eq!(fresh, again);
        assert_eq!(fresh_counters, reopened.counters());
        Ok(())
    }
}
