//! The MB+-tree: a ρ-split block tree over an ordered key dictionary.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::dataset::{ObjId, ObjectDb};
use crate::scope::{Counters, DbScope};
use crate::utils::{sort_hits, SizedHeap};
use crate::MetricIndex;

/// Bits of the normalized distance key inside the composite key.
const DISTANCE_KEY_BITS: u32 = 16;

/// Maximum block-tree depth; keeps the partition key (with its leading
/// sentinel bit) inside the composite 64-bit key.
const MAX_DEPTH: u32 = 47;

/// One node of the block tree.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
struct BlockNode {
    /// Whether this node is a terminal block.
    is_leaf: bool,
    /// The partition key accumulated along the path from the root, with a
    /// leading sentinel bit so values of different depths never collide.
    block_value: u64,
    /// The partition center of this node.
    center: u64,
    /// The median distance of the node's objects to the center.
    d_med: f64,
    /// The ρ-split half-width.
    rho: f64,
    /// The max distance to the center, the distance-key normalizer.
    max_dist: f64,
    /// Left child: objects with `d(o, c)` at most `d_med - rho`.
    left: Option<u32>,
    /// Right child: the rest.
    right: Option<u32>,
}

/// The whole structure, persisted in the metadata file.
#[derive(serde::Serialize, serde::Deserialize)]
struct Meta {
    /// Number of objects at build time.
    n: u64,
    /// The ρ-split half-width.
    rho: f64,
    /// Maximum objects per terminal block.
    leaf_cap: u64,
    /// The block-tree arena; index 0 is the root.
    blocks: Vec<BlockNode>,
    /// The ordered dictionary: composite key to object ids.
    dictionary: BTreeMap<u64, Vec<u64>>,
}

/// An MB+-tree.
///
/// A binary block tree splits the data with ρ-split partitions; every object
/// receives a composite key `(partitionKey || distanceKey)`, the distance
/// key being its distance to the block center normalized to a fixed bit
/// width, and the keys live in an ordered dictionary. A range query walks
/// the block tree to the candidate blocks, then scans only the dictionary
/// key range `[d(q, c) - r, d(q, c) + r]` of each.
pub struct MbPlusTree {
    /// The counted route to the database.
    scope: DbScope,
    /// The ρ-split half-width.
    rho: f64,
    /// Maximum objects per terminal block.
    leaf_cap: usize,
    /// The block-tree arena; index 0 is the root.
    blocks: Vec<BlockNode>,
    /// The ordered dictionary: composite key to object ids.
    dictionary: BTreeMap<u64, Vec<u64>>,
    /// Counters accumulated during the build.
    build: Counters,
}

/// The file of an MB+-tree: `<base>.mbpt_meta`.
fn meta_path(base: &Path) -> std::path::PathBuf {
    base.with_extension("mbpt_meta")
}

/// Normalizes a distance to the fixed-width distance key; monotone, so key
/// ranges cover distance ranges.
fn distance_key(dist: f64, max_dist: f64) -> u64 {
    let max_val = f64::from((1_u32 << DISTANCE_KEY_BITS) - 1);
    let normalized = if max_dist > 0.0 { (dist / max_dist).clamp(0.0, 1.0) } else { 0.0 };
    #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let key = (normalized * max_val).floor() as u64;
    key
}

/// Composes `(partitionKey || distanceKey)` into one ordered key.
const fn compose_key(block_value: u64, dk: u64) -> u64 {
    (block_value << DISTANCE_KEY_BITS) | dk
}

impl MbPlusTree {
    /// Builds an MB+-tree and persists it under `base`.
    ///
    /// # Errors
    ///
    /// - If `leaf_cap` is zero or `rho` is negative.
    /// - If the file cannot be written.
    pub fn build<P: AsRef<Path>>(db: Arc<ObjectDb>, base: P, rho: f64, leaf_cap: usize, seed: u64) -> Result<Self, String> {
        if leaf_cap == 0 {
            return Err("MB+-tree block capacity must be positive.".to_string());
        }
        if rho < 0.0 {
            return Err("MB+-tree band half-width must be non-negative.".to_string());
        }

        let mut scope = DbScope::new(db);
        let mut rng = StdRng::seed_from_u64(seed);

        let mut blocks = Vec::new();
        let objs = (0..scope.size()).collect::<Vec<_>>();
        build_block(&mut blocks, &mut scope, &mut rng, objs, 1, 0, rho, leaf_cap);

        // Re-walk the finished tree to key every object of every terminal
        // block into the dictionary.
        let mut dictionary: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
        let mut pending = vec![(0_u32, (0..scope.size()).collect::<Vec<_>>())];
        while let Some((idx, objs)) = pending.pop() {
            let block = blocks[idx as usize].clone();
            if block.is_leaf {
                for id in objs {
                    let dist = scope.d(id, block.center as ObjId);
                    let key = compose_key(block.block_value, distance_key(dist, block.max_dist));
                    dictionary.entry(key).or_default().push(id as u64);
                }
                continue;
            }

            let mut left_objs = Vec::new();
            let mut right_objs = Vec::new();
            let threshold = block.d_med - block.rho;
            for id in objs {
                let d = scope.d(id, block.center as ObjId);
                if d <= threshold {
                    left_objs.push(id);
                } else {
                    right_objs.push(id);
                }
            }
            if let Some(left) = block.left {
                pending.push((left, left_objs));
            }
            if let Some(right) = block.right {
                pending.push((right, right_objs));
            }
        }
        for ids in dictionary.values_mut() {
            ids.sort_unstable();
        }

        let meta = Meta {
            n: scope.size() as u64,
            rho,
            leaf_cap: leaf_cap as u64,
            blocks: blocks.clone(),
            dictionary: dictionary.clone(),
        };
        let encoded = bincode::serialize(&meta).map_err(|e| format!("Could not serialize MB+-tree: {e}"))?;
        let path = meta_path(base.as_ref());
        let tmp = path.with_extension("mbpt_meta.tmp");
        std::fs::write(&tmp, &encoded).map_err(|e| format!("Could not write '{}': {e}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| format!("Could not rename '{}' into place: {e}", tmp.display()))?;
        scope.page_writes(crate::scope::pages_for(encoded.len() as u64));

        let build = scope.counters;
        scope.clear_counters();
        Ok(Self {
            scope,
            rho,
            leaf_cap,
            blocks,
            dictionary,
            build,
        })
    }

    /// Reopens a persisted MB+-tree from `base`.
    ///
    /// # Errors
    ///
    /// - If the file is missing or corrupt.
    pub fn open<P: AsRef<Path>>(db: Arc<ObjectDb>, base: P) -> Result<Self, String> {
        let path = meta_path(base.as_ref());
        let encoded =
            std::fs::read(&path).map_err(|e| format!("Could not read '{}': {e}", path.display()))?;
        let meta: Meta = bincode::deserialize(&encoded)
            .map_err(|e| format!("Corrupt MB+-tree in '{}': {e}", path.display()))?;

        Ok(Self {
            scope: DbScope::new(db),
            rho: meta.rho,
            leaf_cap: usize::try_from(meta.leaf_cap).unwrap_or(1),
            blocks: meta.blocks,
            dictionary: meta.dictionary,
            build: Counters::default(),
        })
    }

    /// Collects the terminal blocks whose region the query ball can reach.
    fn candidate_blocks(&mut self, query: ObjId, radius: f64) -> Vec<u32> {
        let mut out = Vec::new();
        let mut pending = vec![0_u32];
        while let Some(idx) = pending.pop() {
            let block = self.blocks[idx as usize].clone();
            if block.is_leaf {
                out.push(idx);
                continue;
            }

            let d = self.scope.d(query, block.center as ObjId);
            let threshold = block.d_med - block.rho;
            // The query ball reaches the left region when it dips below the
            // split threshold, the right when it rises above it.
            if d - radius <= threshold {
                if let Some(left) = block.left {
                    pending.push(left);
                }
            }
            if d + radius > threshold {
                if let Some(right) = block.right {
                    pending.push(right);
                }
            }
        }
        out.sort_unstable();
        out
    }

    /// Scans one block's dictionary key range for true hits.
    fn scan_block(
        &mut self,
        block_idx: u32,
        query: ObjId,
        radius: f64,
        hits: &mut Vec<ObjId>,
    ) {
        let block = self.blocks[block_idx as usize].clone();
        let d = self.scope.d(query, block.center as ObjId);

        let min_key = compose_key(block.block_value, distance_key((d - radius).max(0.0), block.max_dist));
        let max_key = compose_key(block.block_value, distance_key(d + radius, block.max_dist));

        self.scope.page_reads(1);
        let candidates = self
            .dictionary
            .range(min_key..=max_key)
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect::<Vec<_>>();
        for id in candidates {
            if self.scope.d(query, id as ObjId) <= radius {
                hits.push(id as ObjId);
            }
        }
    }
}

/// Builds the block subtree for `objs`; the node lands at index
/// `blocks.len()` with the given accumulated `block_value`.
#[expect(clippy::too_many_arguments)]
fn build_block(
    blocks: &mut Vec<BlockNode>,
    scope: &mut DbScope,
    rng: &mut StdRng,
    objs: Vec<ObjId>,
    block_value: u64,
    depth: u32,
    rho: f64,
    leaf_cap: usize,
) -> u32 {
    let idx = u32::try_from(blocks.len()).unwrap_or(0);

    // Partition center: a random object, then the farthest from it.
    let center = if objs.is_empty() {
        0
    } else {
        let start = objs[rng.gen_range(0..objs.len())];
        let mut center = start;
        let mut max_d = -1.0;
        for &id in &objs {
            let d = scope.d(start, id);
            if d > max_d {
                max_d = d;
                center = id;
            }
        }
        center
    };

    let dists = objs.iter().map(|&id| scope.d(id, center)).collect::<Vec<_>>();
    let max_dist = dists.iter().copied().fold(0.0, f64::max).max(1.0);

    if objs.len() <= leaf_cap || depth >= MAX_DEPTH {
        blocks.push(BlockNode {
            is_leaf: true,
            block_value,
            center: center as u64,
            d_med: 0.0,
            rho,
            max_dist,
            left: None,
            right: None,
        });
        return idx;
    }

    let mut sorted = dists.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(core::cmp::Ordering::Equal));
    let d_med = sorted[sorted.len() / 2];
    let threshold = d_med - rho;

    let mut left_objs = Vec::new();
    let mut right_objs = Vec::new();
    for (&id, &d) in objs.iter().zip(dists.iter()) {
        if d <= threshold {
            left_objs.push(id);
        } else {
            right_objs.push(id);
        }
    }

    // A split that separates nothing degrades to a terminal block.
    if left_objs.is_empty() || right_objs.is_empty() {
        blocks.push(BlockNode {
            is_leaf: true,
            block_value,
            center: center as u64,
            d_med,
            rho,
            max_dist,
            left: None,
            right: None,
        });
        return idx;
    }

    blocks.push(BlockNode {
        is_leaf: false,
        block_value,
        center: center as u64,
        d_med,
        rho,
        max_dist,
        left: None,
        right: None,
    });

    let left = build_block(blocks, scope, rng, left_objs, block_value << 1, depth + 1, rho, leaf_cap);
    let right = build_block(blocks, scope, rng, right_objs, (block_value << 1) | 1, depth + 1, rho, leaf_cap);
    blocks[idx as usize].left = Some(left);
    blocks[idx as usize].right = Some(right);
    idx
}

impl MetricIndex for MbPlusTree {
    fn name(&self) -> String {
        format!("MBPlusTree(rho={}, blockCap={})", self.rho, self.leaf_cap)
    }

    fn range_search(&mut self, query: ObjId, radius: f64) -> Result<Vec<ObjId>, String> {
        let mut hits = Vec::new();
        for block in self.candidate_blocks(query, radius) {
            self.scan_block(block, query, radius, &mut hits);
        }
        Ok(hits)
    }

    fn knn_search(&mut self, query: ObjId, k: usize) -> Result<Vec<(ObjId, f64)>, String> {
        if k == 0 {
            return Ok(Vec::new());
        }

        // Find k candidates by keys alone: the blocks around the query give
        // the first radius estimate.
        let mut probe = SizedHeap::new(Some(k));
        for block_idx in self.candidate_blocks(query, 0.0) {
            let block = self.blocks[block_idx as usize].clone();
            let d = self.scope.d(query, block.center as ObjId);
            let q_key = compose_key(block.block_value, distance_key(d, block.max_dist));

            // The nearest dictionary entries by key on either side.
            self.scope.page_reads(1);
            let below = self
                .dictionary
                .range(..=q_key)
                .rev()
                .take(k)
                .flat_map(|(_, ids)| ids.iter().copied());
            let above = self
                .dictionary
                .range(q_key..)
                .take(k)
                .flat_map(|(_, ids)| ids.iter().copied());
            let mut seen = below.chain(above).collect::<Vec<_>>();
            seen.sort_unstable();
            seen.dedup();
            for id in seen {
                let dist = self.scope.d(query, id as ObjId);
                probe.push((id as ObjId, dist));
            }
        }

        // The k-th candidate distance turns the query into a range search,
        // widening until enough answers surface.
        let mut radius = probe
            .into_sorted()
            .last()
            .map_or(self.rho.max(1.0), |&(_, d)| d);
        loop {
            let mut hits = Vec::new();
            for block in self.candidate_blocks(query, radius) {
                self.scan_block(block, query, radius, &mut hits);
            }
            let mut with_dists = hits
                .into_iter()
                .map(|id| {
                    let d = self.scope.d(query, id);
                    (id, d)
                })
                .collect::<Vec<_>>();
            sort_hits(&mut with_dists);
            with_dists.truncate(k);

            if with_dists.len() >= k.min(self.scope.size()) {
                return Ok(with_dists);
            }
            radius = radius.mul_add(2.0, 1.0);
        }
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

    fn line_db() -> Arc<ObjectDb> {
        Arc::new(ObjectDb::Vectors {
            rows: (0..16).map(|i| vec![f64::from(i)]).collect(),
            dim: 1,
            lp: Lp::L2,
        })
    }

    #[test]
    fn distance_keys_are_monotone() {
        let max = 100.0;
        let mut prev = 0;
        for d in 0..=100 {
            let key = distance_key(f64::from(d), max);
            assert!(key >= prev);
            prev = key;
        }
    }

    #[test]
    fn range_equals_linear_scan() -> Result<(), String> {
        let tmp = tempdir::TempDir::new("mexis-mbpt").map_err(|e| e.to_string())?;
        let base = tmp.path().join("line");
        let mut mbpt = MbPlusTree::build(line_db(), &base, 0.5, 4, 42)?;

        for radius in [0.0, 1.0, 2.5] {
            for q in 0..16 {
                let mut hits = mbpt.range_search(q, radius)?;
                hits.sort_unstable();
                #[expect(clippy::cast_precision_loss)]
                let expected = (0..16_usize)
                    .filter(|&o| (o.abs_diff(q) as f64) <= radius)
                    .collect::<Vec<_>>();
                assert_eq!(hits, expected, "q={q} r={radius}");
            }
        }
        Ok(())
    }

    #[test]
    fn knn_equals_linear_scan() -> Result<(), String> {
        let tmp = tempdir::TempDir::new("mexis-mbpt").map_err(|e| e.to_string())?;
        let base = tmp.path().join("line");
        let mut mbpt = MbPlusTree::build(line_db(), &base, 0.5, 4, 42)?;

        let knn = mbpt.knn_search(8, 3)?;
        assert_eq!(knn, vec![(8, 0.0), (7, 1.0), (9, 1.0)]);

        // k beyond the dataset returns everything.
        assert_eq!(mbpt.knn_search(0, 100)?.len(), 16);
        Ok(())
    }

    #[test]
    fn reopen_matches_fresh_build() -> Result<(), String> {
        let tmp = tempdir::TempDir::new("mexis-mbpt").map_err(|e| e.to_string())?;
        let base = tmp.path().join("line");
        let db = line_db();

        let mut built = MbPlusTree::build(db.clone(), &base, 0.5, 4, 42)?;
        built.clear_counters();
        let fresh = built.range_search(5, 3.0)?;
        let fresh_counters = built.counters();

        let mut reopened = MbPlusTree::open(db, &base)?;
        let again = reopened.range_search(5, 3.0)?;
        assert_eq!(fresh, again);
        assert_eq!(fresh_counters, reopened.counters());
        Ok(())
    }
}
