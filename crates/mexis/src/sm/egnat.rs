//! The EGNAT: a disk-resident geometric near-neighbor access tree.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::dataset::{ObjId, ObjectDb};
use crate::scope::{pages_for, Counters, DbScope};
use crate::utils::{tau_of, MinItem, SizedHeap};
use crate::MetricIndex;

/// Bytes per persisted leaf entry: a `u32` id and an `f64` parent distance.
const LEAF_ENTRY_BYTES: u64 = 12;

/// An internal node: pivots with the min/max band of every bucket as seen
/// from every pivot.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
struct InternalNode {
    /// The pivots of this node.
    pivots: Vec<u64>,
    /// `bands[i][j]` is the `(min, max)` of `d(o, pivots[i])` over bucket
    /// `j` (pivot `j` included).
    bands: Vec<Vec<(f64, f64)>>,
    /// Arena index of each bucket's subtree; `None` when empty.
    children: Vec<Option<u32>>,
}

/// A leaf pointer: where the leaf's entries live in the leaf file.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
struct LeafInfo {
    /// The parent pivot whose cached distances the entries carry.
    parent: Option<u64>,
    /// Byte offset of the first entry in the leaf file.
    offset: u64,
    /// Number of entries.
    count: u32,
}

/// A node of the EGNAT arena.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
enum Node {
    /// An internal GNAT node, one logical page.
    Internal(InternalNode),
    /// A leaf pointer into the leaf file.
    Leaf(LeafInfo),
}

/// The whole directory structure, persisted in the index file.
#[derive(serde::Serialize, serde::Deserialize)]
struct Meta {
    /// Number of objects at build time.
    n: u64,
    /// Per-node pivot budget.
    m: u64,
    /// The logical page size in bytes.
    page_bytes: u64,
    /// The node arena; the last node is the root.
    nodes: Vec<Node>,
    /// Arena index of the root.
    root: u32,
}

/// A disk-resident GNAT.
///
/// Internal nodes keep the GNAT band tables and cost one page per visit;
/// leaves store `(id, distance to parent pivot)` pairs in a separate file,
/// so the cached parent distance filters members before `d(q, o)` is
/// evaluated.
pub struct Egnat {
    /// The counted route to the database.
    scope: DbScope,
    /// The node arena, resident after build or open.
    nodes: Vec<Node>,
    /// Arena index of the root.
    root: u32,
    /// The open leaf file.
    leaf_file: std::fs::File,
    /// Per-node pivot budget.
    m: usize,
    /// The logical page size in bytes.
    page_bytes: u64,
    /// Pages charged per leaf visit.
    pages_per_leaf: u64,
    /// Counters accumulated during the build.
    build: Counters,
}

/// The two files of an EGNAT: `<base>.egnat_index` and `<base>.egnat_leaf`.
fn paths(base: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
    (base.with_extension("egnat_index"), base.with_extension("egnat_leaf"))
}

impl Egnat {
    /// Builds an EGNAT and persists it under `base`.
    ///
    /// # Errors
    ///
    /// - If `m < 2` or `page_bytes` is zero.
    /// - If the index files cannot be written.
    pub fn build<P: AsRef<Path>>(db: Arc<ObjectDb>, base: P, m: usize, page_bytes: u64, seed: u64) -> Result<Self, String> {
        if m < 2 {
            return Err("EGNAT pivot budget must be at least 2.".to_string());
        }
        if page_bytes == 0 {
            return Err("EGNAT page size must be positive.".to_string());
        }
        let leaf_cap = (page_bytes / LEAF_ENTRY_BYTES).max(1) as usize;
        let (index_path, leaf_path) = paths(base.as_ref());

        let mut scope = DbScope::new(db);
        let mut rng = StdRng::seed_from_u64(seed);

        let leaf_tmp = leaf_path.with_extension("egnat_leaf.tmp");
        let mut leaf_out = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&leaf_tmp)
            .map_err(|e| format!("Could not create '{}': {e}", leaf_tmp.display()))?;

        let mut builder = Builder {
            scope: &mut scope,
            rng: &mut rng,
            m,
            leaf_cap,
            nodes: Vec::new(),
            leaf_out: &mut leaf_out,
            leaf_offset: 0,
            page_bytes,
        };
        let objs = (0..builder.scope.size()).collect::<Vec<_>>();
        let root = builder.node(&objs, None)?;
        let nodes = builder.nodes;

        leaf_out
            .sync_all()
            .map_err(|e| format!("Could not sync '{}': {e}", leaf_tmp.display()))?;

        let meta = Meta {
            n: scope.size() as u64,
            m: m as u64,
            page_bytes,
            nodes: nodes.clone(),
            root,
        };
        let encoded = bincode::serialize(&meta).map_err(|e| format!("Could not serialize EGNAT directory: {e}"))?;
        let index_tmp = index_path.with_extension("egnat_index.tmp");
        std::fs::write(&index_tmp, &encoded)
            .map_err(|e| format!("Could not write '{}': {e}", index_tmp.display()))?;
        scope.page_writes(pages_for(encoded.len() as u64));

        std::fs::rename(&leaf_tmp, &leaf_path)
            .map_err(|e| format!("Could not rename '{}' into place: {e}", leaf_tmp.display()))?;
        std::fs::rename(&index_tmp, &index_path)
            .map_err(|e| format!("Could not rename '{}' into place: {e}", index_tmp.display()))?;

        let leaf_file = std::fs::File::open(&leaf_path)
            .map_err(|e| format!("Could not open '{}': {e}", leaf_path.display()))?;

        let build = scope.counters;
        scope.clear_counters();
        Ok(Self {
            scope,
            nodes,
            root,
            leaf_file,
            m,
            page_bytes,
            pages_per_leaf: page_bytes.div_ceil(4096).max(1),
            build,
        })
    }

    /// Reopens a persisted EGNAT from `base`.
    ///
    /// # Errors
    ///
    /// - If either file is missing or the directory is corrupt.
    pub fn open<P: AsRef<Path>>(db: Arc<ObjectDb>, base: P) -> Result<Self, String> {
        let (index_path, leaf_path) = paths(base.as_ref());

        let encoded = std::fs::read(&index_path)
            .map_err(|e| format!("Could not read '{}': {e}", index_path.display()))?;
        let meta: Meta = bincode::deserialize(&encoded)
            .map_err(|e| format!("Corrupt EGNAT directory in '{}': {e}", index_path.display()))?;
        let leaf_file = std::fs::File::open(&leaf_path)
            .map_err(|e| format!("Could not open '{}': {e}", leaf_path.display()))?;

        Ok(Self {
            scope: DbScope::new(db),
            nodes: meta.nodes,
            root: meta.root,
            leaf_file,
            m: usize::try_from(meta.m).unwrap_or(2),
            page_bytes: meta.page_bytes,
            pages_per_leaf: meta.page_bytes.div_ceil(4096).max(1),
            build: Counters::default(),
        })
    }

    /// Reads one leaf's `(id, parent distance)` entries from the leaf file.
    fn read_leaf(&mut self, info: &LeafInfo) -> Result<Vec<(ObjId, f64)>, String> {
        self.leaf_file
            .seek(SeekFrom::Start(info.offset))
            .map_err(|e| format!("Could not seek EGNAT leaf file: {e}"))?;
        let mut bytes = vec![0_u8; info.count as usize * LEAF_ENTRY_BYTES as usize];
        self.leaf_file
            .read_exact(&mut bytes)
            .map_err(|e| format!("Short read in EGNAT leaf file: {e}"))?;

        Ok(bytes
            .chunks_exact(LEAF_ENTRY_BYTES as usize)
            .map(|chunk| {
                let id = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as ObjId;
                let dist = f64::from_le_bytes([
                    chunk[4], chunk[5], chunk[6], chunk[7], chunk[8], chunk[9], chunk[10], chunk[11],
                ]);
                (id, dist)
            })
            .collect())
    }

    /// Range search in the subtree rooted at `node`.
    fn range_descent(&mut self, node: u32, query: ObjId, radius: f64, hits: &mut Vec<ObjId>) -> Result<(), String> {
        match self.nodes[node as usize].clone() {
            Node::Leaf(info) => {
                self.scope.page_reads(self.pages_per_leaf);
                let d_parent = match info.parent {
                    Some(p) => self.scope.d(query, p as ObjId),
                    None => 0.0,
                };
                for (id, dist_parent) in self.read_leaf(&info)? {
                    // Parent filtering before the real distance.
                    if info.parent.is_some() && (dist_parent - d_parent).abs() > radius {
                        continue;
                    }
                    if self.scope.d(query, id) <= radius {
                        hits.push(id);
                    }
                }
            }
            Node::Internal(internal) => {
                self.scope.page_reads(1);
                let dq = internal
                    .pivots
                    .iter()
                    .map(|&p| self.scope.d(query, p as ObjId))
                    .collect::<Vec<_>>();

                for (i, &p) in internal.pivots.iter().enumerate() {
                    if dq[i] <= radius {
                        hits.push(p as ObjId);
                    }
                }

                for (j, child) in internal.children.iter().enumerate() {
                    let Some(child) = child else { continue };
                    let survives = (0..internal.pivots.len()).all(|i| {
                        let (min, max) = internal.bands[i][j];
                        max >= dq[i] - radius && min <= dq[i] + radius
                    });
                    if survives {
                        self.range_descent(*child, query, radius, hits)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// k-NN search in the subtree rooted at `node`, closest bucket first.
    fn knn_descent(&mut self, node: u32, query: ObjId, heap: &mut SizedHeap<ObjId, f64>) -> Result<(), String> {
        match self.nodes[node as usize].clone() {
            Node::Leaf(info) => {
                self.scope.page_reads(self.pages_per_leaf);
                let d_parent = match info.parent {
                    Some(p) => self.scope.d(query, p as ObjId),
                    None => 0.0,
                };
                for (id, dist_parent) in self.read_leaf(&info)? {
                    if info.parent.is_some() && (dist_parent - d_parent).abs() > tau_of(heap) {
                        continue;
                    }
                    let d = self.scope.d(query, id);
                    heap.push((id, d));
                }
            }
            Node::Internal(internal) => {
                self.scope.page_reads(1);
                let dq = internal
                    .pivots
                    .iter()
                    .map(|&p| self.scope.d(query, p as ObjId))
                    .collect::<Vec<_>>();
                for (i, &p) in internal.pivots.iter().enumerate() {
                    heap.push((p as ObjId, dq[i]));
                }

                let mut order = (0..internal.pivots.len()).collect::<Vec<_>>();
                order.sort_by_key(|&i| MinItem(i, dq[i]));

                for &j in &order {
                    let Some(child) = internal.children[j] else { continue };
                    let tau = tau_of(heap);
                    let survives = (0..internal.pivots.len()).all(|i| {
                        let (min, max) = internal.bands[i][j];
                        max >= dq[i] - tau && min <= dq[i] + tau
                    });
                    if survives {
                        self.knn_descent(child, query, heap)?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Build-time state threaded through the recursive construction.
struct Builder<'a> {
    /// The counted route to the database.
    scope: &'a mut DbScope,
    /// Seeded generator for pivot selection.
    rng: &'a mut StdRng,
    /// Per-node pivot budget.
    m: usize,
    /// Maximum entries per leaf.
    leaf_cap: usize,
    /// The arena under construction.
    nodes: Vec<Node>,
    /// The open leaf file being appended to.
    leaf_out: &'a mut std::fs::File,
    /// Current end of the leaf file.
    leaf_offset: u64,
    /// The logical page size in bytes.
    page_bytes: u64,
}

impl Builder<'_> {
    /// Builds the subtree for `objs` under `parent`; returns its arena
    /// index.
    fn node(&mut self, objs: &[ObjId], parent: Option<ObjId>) -> Result<u32, String> {
        if objs.len() <= self.leaf_cap {
            let mut bytes = Vec::with_capacity(objs.len() * LEAF_ENTRY_BYTES as usize);
            for &id in objs {
                let dist = parent.map_or(0.0, |p| self.scope.d(id, p));
                let id = u32::try_from(id).map_err(|_| "Object id exceeds u32.".to_string())?;
                bytes.extend_from_slice(&id.to_le_bytes());
                bytes.extend_from_slice(&dist.to_le_bytes());
            }
            self.leaf_out
                .write_all(&bytes)
                .map_err(|e| format!("Could not write EGNAT leaf file: {e}"))?;
            self.scope.page_writes(self.page_bytes.div_ceil(4096).max(1));

            let info = LeafInfo {
                parent: parent.map(|p| p as u64),
                offset: self.leaf_offset,
                count: u32::try_from(objs.len()).map_err(|_| "Leaf count exceeds u32.".to_string())?,
            };
            self.leaf_offset += bytes.len() as u64;
            self.nodes.push(Node::Leaf(info));
            return u32::try_from(self.nodes.len() - 1).map_err(|_| "Node count exceeds u32.".to_string());
        }

        // Seeded random pivots.
        let m = self.m.min(objs.len());
        let mut perm = objs.to_vec();
        perm.shuffle(self.rng);
        let pivots = perm[..m].to_vec();

        // Bucket every non-pivot object with its nearest pivot; the bands
        // cover members and the bucket's own pivot.
        let mut buckets = vec![Vec::new(); m];
        for (j, &p) in pivots.iter().enumerate() {
            buckets[j].push(p);
        }
        for &id in objs {
            if pivots.contains(&id) {
                continue;
            }
            let mut best = 0;
            let mut best_d = f64::INFINITY;
            for (j, &p) in pivots.iter().enumerate() {
                let d = self.scope.d(id, p);
                if d < best_d {
                    best_d = d;
                    best = j;
                }
            }
            buckets[best].push(id);
        }

        let mut bands = vec![vec![(f64::INFINITY, 0.0_f64); m]; m];
        for (j, bucket) in buckets.iter().enumerate() {
            for &id in bucket {
                for (i, &p) in pivots.iter().enumerate() {
                    let d = self.scope.d(id, p);
                    bands[i][j] = (bands[i][j].0.min(d), bands[i][j].1.max(d));
                }
            }
        }

        let me = self.nodes.len();
        self.nodes.push(Node::Internal(InternalNode {
            pivots: pivots.iter().map(|&p| p as u64).collect(),
            bands,
            children: vec![None; m],
        }));
        self.scope.page_writes(1);

        for (j, bucket) in buckets.iter().enumerate() {
            let members = bucket.iter().copied().filter(|&id| id != pivots[j]).collect::<Vec<_>>();
            if members.is_empty() {
                continue;
            }
            let child = self.node(&members, Some(pivots[j]))?;
            if let Node::Internal(internal) = &mut self.nodes[me] {
                internal.children[j] = Some(child);
            }
        }

        u32::try_from(me).map_err(|_| "Node count exceeds u32.".to_string())
    }
}

impl MetricIndex for Egnat {
    fn name(&self) -> String {
        format!("EGNAT(m={}, pageBytes={})", self.m, self.page_bytes)
    }

    fn range_search(&mut self, query: ObjId, radius: f64) -> Result<Vec<ObjId>, String> {
        let mut hits = Vec::new();
        let root = self.root;
        self.range_descent(root, query, radius, &mut hits)?;
        Ok(hits)
    }

    fn knn_search(&mut self, query: ObjId, k: usize) -> Result<Vec<(ObjId, f64)>, String> {
        let mut heap = SizedHeap::new(Some(k));
        if k > 0 {
            let root = self.root;
            self.knn_descent(root, query, &mut heap)?;
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
        let tmp = tempdir::TempDir::new("mexis-egnat").map_err(|e| e.to_string())?;
        let base = tmp.path().join("toy");
        let mut egnat = Egnat::build(two_cluster_db(), &base, 2, 48, 42)?;

        let mut hits = egnat.range_search(0, 1.0)?;
        hits.sort_unstable();
        assert_eq!(hits, vec![0, 1, 2]);

        let knn = egnat.knn_search(0, 3)?;
        assert_eq!(knn[0], (0, 0.0));
        assert_eq!((knn[1].0, knn[2].0), (1, 2));
        Ok(())
    }

    #[test]
    fn reopen_matches_fresh_build() -> Result<(), String> {
        let tmp = tempdir::TempDir::new("mexis-egnat").map_err(|e| e.to_string())?;
        let base = tmp.path().join("toy");
        let db = two_cluster_db();

        let mut built = Egnat::build(db.clone(), &base, 2, 48, 42)?;
        built.clear_counters();
        let fresh = built.knn_search(4, 3)?;
        let fresh_counters = built.counters();

        let mut reopened = Egnat::open(db, &base)?;
        let again = reopened.knn_search(4, 3)?;
        assert_eq!(fresh, again);
        assert_eq!(fresh_counters, reopened.counters());
        Ok(())
    }
}
