//! The M-index: pivot-permutation keys over clustered leaves.

use std::collections::BinaryHeap;
use std::path::Path;
use std::sync::Arc;

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::dataset::{ObjId, ObjectDb};
use crate::scope::{Counters, DbScope};
use crate::sm::Raf;
use crate::utils::{MaxItem, SizedHeap};
use crate::MetricIndex;

/// Maximum number of objects per leaf cluster.
const CLUSTER_CAPACITY: usize = 64;

/// One leaf cluster: a contiguous key range of objects sharing a nearest
/// pivot.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
struct Cluster {
    /// Index of the shared nearest pivot.
    pivot_idx: u32,
    /// Smallest mapped key in the cluster.
    min_key: f64,
    /// Largest mapped key in the cluster.
    max_key: f64,
    /// Per-pivot `(min, max)` band over the members.
    band: Vec<(f64, f64)>,
    /// The member ids, in key order.
    members: Vec<u64>,
    /// The members' pivot distances, aligned with `members`.
    member_dists: Vec<Vec<f64>>,
}

/// The whole structure, persisted in the metadata file.
#[derive(serde::Serialize, serde::Deserialize)]
struct Meta {
    /// Number of objects at build time.
    n: u64,
    /// The pivot ids of the mapping.
    pivots: Vec<u64>,
    /// Global upper bound on any distance, the key stride between pivots.
    d_plus: f64,
    /// The leaf clusters, in key order.
    clusters: Vec<Cluster>,
}

/// An M-index.
///
/// Every object is keyed by `d(o, p_nearest) + nearestPivotIdx * d_plus`,
/// where `d_plus` bounds all distances, so keys of different pivot groups
/// never interleave. Objects sharing a nearest pivot form contiguous leaf
/// clusters in key order; each cluster carries a pivot-space band for
/// L-infinity pruning, and members keep their full pivot distances so most
/// of them are filtered before the real distance is evaluated.
pub struct MIndex {
    /// The counted route to the database.
    scope: DbScope,
    /// The pivot ids of the mapping.
    pivots: Vec<ObjId>,
    /// The leaf clusters, in key order.
    clusters: Vec<Cluster>,
    /// The record file holding the stored objects.
    raf: Raf,
    /// Counters accumulated during the build.
    build: Counters,
}

/// The two files of an M-index: `<base>.midx_meta` and `<base>.midx_raf`.
fn paths(base: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
    (base.with_extension("midx_meta"), base.with_extension("midx_raf"))
}

impl MIndex {
    /// Builds an M-index and persists it under `base`.
    ///
    /// # Errors
    ///
    /// - If `n_pivots` is zero.
    /// - If the files cannot be written.
    pub fn build<P: AsRef<Path>>(db: Arc<ObjectDb>, base: P, n_pivots: usize, seed: u64) -> Result<Self, String> {
        if n_pivots == 0 {
            return Err("M-index needs at least one pivot.".to_string());
        }
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

        let mut ids = (0..n).collect::<Vec<_>>();
        let mut rng = StdRng::seed_from_u64(seed);
        ids.shuffle(&mut rng);
        let pivots = ids.into_iter().take(n_pivots.min(n.max(1))).collect::<Vec<_>>();

        // Pivot map of every object, and the global distance bound d_plus.
        let mapping = (0..n)
            .map(|id| pivots.iter().map(|&p| scope.d(id, p)).collect::<Vec<_>>())
            .collect::<Vec<_>>();
        let d_plus = mapping
            .iter()
            .flat_map(|dists| dists.iter().copied())
            .fold(0.0, f64::max)
            .mul_add(2.0, 1.0);

        // Key every object by its nearest pivot.
        let mut items = (0..n)
            .map(|id| {
                let dists = &mapping[id];
                let nearest = dists
                    .iter()
                    .enumerate()
                    .min_by(|(i, a), (j, b)| a.partial_cmp(b).unwrap_or(core::cmp::Ordering::Equal).then(i.cmp(j)))
                    .map_or(0, |(i, _)| i);
                #[expect(clippy::cast_precision_loss)]
                let key = dists[nearest] + nearest as f64 * d_plus;
                (key, id, nearest)
            })
            .collect::<Vec<_>>();
        items.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(core::cmp::Ordering::Equal).then(a.1.cmp(&b.1)));

        // Chunk each pivot group into bounded leaf clusters.
        let mut clusters = Vec::new();
        let mut start = 0;
        while start < items.len() {
            let pivot_idx = items[start].2;
            let mut end = start;
            while end < items.len() && items[end].2 == pivot_idx && end - start < CLUSTER_CAPACITY {
                end += 1;
            }

            let chunk = &items[start..end];
            let mut band = vec![(f64::INFINITY, 0.0_f64); pivots.len()];
            let mut member_dists = Vec::with_capacity(chunk.len());
            for &(_, id, _) in chunk {
                for (j, &d) in mapping[id].iter().enumerate() {
                    band[j] = (band[j].0.min(d), band[j].1.max(d));
                }
                member_dists.push(mapping[id].clone());
            }

            clusters.push(Cluster {
                pivot_idx: u32::try_from(pivot_idx).map_err(|_| "Pivot index exceeds u32.".to_string())?,
                min_key: chunk.first().map_or(0.0, |&(k, _, _)| k),
                max_key: chunk.last().map_or(0.0, |&(k, _, _)| k),
                band,
                members: chunk.iter().map(|&(_, id, _)| id as u64).collect(),
                member_dists,
            });
            start = end;
        }

        let meta = Meta {
            n: n as u64,
            pivots: pivots.iter().map(|&p| p as u64).collect(),
            d_plus,
            clusters: clusters.clone(),
        };
        let encoded = bincode::serialize(&meta).map_err(|e| format!("Could not serialize M-index: {e}"))?;
        let meta_tmp = meta_path.with_extension("midx_meta.tmp");
        std::fs::write(&meta_tmp, &encoded)
            .map_err(|e| format!("Could not write '{}': {e}", meta_tmp.display()))?;
        std::fs::rename(&meta_tmp, &meta_path)
            .map_err(|e| format!("Could not rename '{}' into place: {e}", meta_tmp.display()))?;

        let build = scope.counters;
        scope.clear_counters();
        Ok(Self {
            scope,
            pivots,
            clusters,
            raf,
            build,
        })
    }

    /// Reopens a persisted M-index from `base`.
    ///
    /// # Errors
    ///
    /// - If either file is missing or corrupt.
    pub fn open<P: AsRef<Path>>(db: Arc<ObjectDb>, base: P) -> Result<Self, String> {
        let (meta_path, raf_path) = paths(base.as_ref());

        let encoded = std::fs::read(&meta_path)
            .map_err(|e| format!("Could not read '{}': {e}", meta_path.display()))?;
        let meta: Meta = bincode::deserialize(&encoded)
            .map_err(|e| format!("Corrupt M-index in '{}': {e}", meta_path.display()))?;
        let raf = Raf::open(&raf_path)?;

        Ok(Self {
            scope: DbScope::new(db),
            pivots: meta.pivots.iter().map(|&p| p as ObjId).collect(),
            clusters: meta.clusters,
            raf,
            build: Counters::default(),
        })
    }

    /// The query's distances to every pivot.
    fn map_query(&mut self, query: ObjId) -> Vec<f64> {
        let pivots = self.pivots.clone();
        pivots.into_iter().map(|p| self.scope.d(query, p)).collect()
    }

    /// The L-infinity lower bound from the query map to a cluster band.
    fn cluster_lower_bound(q_map: &[f64], band: &[(f64, f64)]) -> f64 {
        q_map
            .iter()
            .zip(band.iter())
            .map(|(&qx, &(lo, hi))| (lo - qx).max(qx - hi).max(0.0))
            .fold(0.0, f64::max)
    }

    /// Scans one cluster: filters members on their stored pivot distances,
    /// short-circuits certain answers, verifies the rest from the record
    /// file.
    fn scan_cluster(
        &mut self,
        cluster_idx: usize,
        query: ObjId,
        q_map: &[f64],
        radius: f64,
        hits: &mut Vec<ObjId>,
    ) -> Result<(), String> {
        self.scope.page_reads(1);
        let cluster = self.clusters[cluster_idx].clone();

        for (id, dists) in cluster.members.iter().zip(cluster.member_dists.iter()) {
            // Object-level pivot filter.
            let pruned = q_map
                .iter()
                .zip(dists.iter())
                .any(|(&qx, &px)| (qx - px).abs() > radius);
            if pruned {
                continue;
            }

            // Certain inclusion: some pivot proves membership outright.
            let sure = q_map
                .iter()
                .zip(dists.iter())
                .any(|(&qx, &px)| radius - qx >= 0.0 && px <= radius - qx);
            if sure {
                hits.push(*id as ObjId);
                continue;
            }

            self.raf.read(*id)?;
            self.scope.page_reads(1);
            if self.scope.d(query, *id as ObjId) <= radius {
                hits.push(*id as ObjId);
            }
        }
        Ok(())
    }
}

impl MetricIndex for MIndex {
    fn name(&self) -> String {
        format!("MIndex(pivots={})", self.pivots.len())
    }

    fn range_search(&mut self, query: ObjId, radius: f64) -> Result<Vec<ObjId>, String> {
        let q_map = self.map_query(query);

        let mut hits = Vec::new();
        for i in 0..self.clusters.len() {
            if Self::cluster_lower_bound(&q_map, &self.clusters[i].band) > radius {
                continue;
            }
            self.scan_cluster(i, query, &q_map, radius, &mut hits)?;
        }
        Ok(hits)
    }

    fn knn_search(&mut self, query: ObjId, k: usize) -> Result<Vec<(ObjId, f64)>, String> {
        let mut heap = SizedHeap::new(Some(k));
        if k == 0 {
            return Ok(Vec::new());
        }
        let q_map = self.map_query(query);

        // Best-first over clusters by band lower bound.
        let mut frontier = BinaryHeap::new();
        for i in 0..self.clusters.len() {
            let lb = Self::cluster_lower_bound(&q_map, &self.clusters[i].band);
            frontier.push(MaxItem(i, lb));
        }

        while let Some(MaxItem(cluster_idx, lb)) = frontier.pop() {
            let tau = if heap.is_full() {
                heap.peek().map_or(f64::INFINITY, |(_, &d)| d)
            } else {
                f64::INFINITY
            };
            if heap.is_full() && lb > tau {
                break;
            }

            self.scope.page_reads(1);
            let cluster = self.clusters[cluster_idx].clone();
            for (id, dists) in cluster.members.iter().zip(cluster.member_dists.iter()) {
                let bound = if heap.is_full() {
                    heap.peek().map_or(f64::INFINITY, |(_, &d)| d)
                } else {
                    f64::INFINITY
                };
                let pruned = q_map
                    .iter()
                    .zip(dists.iter())
                    .any(|(&qx, &px)| (qx - px).abs() > bound);
                if pruned {
                    continue;
                }

                self.raf.read(*id)?;
                self.scope.page_reads(1);
                let d = self.scope.d(query, *id as ObjId);
                heap.push((*id as ObjId, d));
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
    fn keys_separate_pivot_groups() -> Result<(), String> {
        let tmp = tempdir::TempDir::new("mexis-midx").map_err(|e| e.to_string())?;
        let base = tmp.path().join("toy");
        let midx = MIndex::build(two_cluster_db(), &base, 2, 42)?;

        // Clusters are in key order and never mix pivot groups.
        for w in midx.clusters.windows(2) {
            assert!(w[0].max_key <= w[1].min_key);
            assert!(w[0].pivot_idx <= w[1].pivot_idx);
        }
        for c in &midx.clusters {
            assert!(c.min_key <= c.max_key);
            assert_eq!(c.members.len(), c.member_dists.len());
        }
        Ok(())
    }

    #[test]
    fn searches_match_brute_force() -> Result<(), String> {
        let tmp = tempdir::TempDir::new("mexis-midx").map_err(|e| e.to_string())?;
        let base = tmp.path().join("toy");
        let mut midx = MIndex::build(two_cluster_db(), &base, 2, 42)?;

        let mut hits = midx.range_search(0, 1.0)?;
        hits.sort_unstable();
        assert_eq!(hits, vec![0, 1, 2]);

        let knn = midx.knn_search(0, 3)?;
        assert_eq!(knn[0], (0, 0.0));
        assert_eq!((knn[1].0, knn[2].0), (1, 2));
        Ok(())
    }

    #[test]
    fn reopen_matches_fresh_build() -> Result<(), String> {
        let tmp = tempdir::TempDir::new("mexis-midx").map_err(|e| e.to_string())?;
        let base = tmp.path().join("toy");
        let db = two_cluster_db();

        let mut built = MIndex::build(db.clone(), &base, 2, 42)?;
        built.clear_counters();
        let fresh = built.range_search(4, 1.5)?;
        let fresh_counters = built.counters();

        let mut reopened = MIndex::open(db, &base)?;
        let again = reopened.range_search(4, 1.5)?;
        assert_eq!(fresh, again);
        assert_eq!(fresh_counters, reopened.counters());
        Ok(())
    }
}
