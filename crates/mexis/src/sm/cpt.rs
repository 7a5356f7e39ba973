//! The clustered pivot table.

use std::path::Path;
use std::sync::Arc;

use crate::dataset::{ObjId, ObjectDb};
use crate::scope::{pages_for, Counters, DbScope};
use crate::sm::MTree;
use crate::utils::{tau_of, SizedHeap};
use crate::MetricIndex;

/// Fraction of the database pre-scanned by a k-NN query to seed the pruning
/// radius before the clustered scan.
const PRE_SCAN_FRACTION: f64 = 0.02;

/// The whole structure, persisted in the metadata file.
#[derive(serde::Serialize, serde::Deserialize)]
struct Meta {
    /// Number of objects at build time.
    n: u64,
    /// The pivot ids.
    pivots: Vec<u64>,
    /// `table[o][j] = d(o, pivots[j])`.
    table: Vec<Vec<f64>>,
    /// The physical pages: groups of object ids stored together.
    pages: Vec<Vec<u64>>,
}

/// A clustered pivot table.
///
/// A LAESA-style precomputed pivot-distance table whose objects are laid out
/// in pages borrowed from an M-tree leaf clustering, so that metrically
/// close objects share a page. A page is read only when at least one of its
/// objects survives the L-infinity lower bound; a page whose objects are all
/// pruned costs nothing.
pub struct Cpt {
    /// The counted route to the database.
    scope: DbScope,
    /// The pivot ids.
    pivots: Vec<ObjId>,
    /// `table[o][j] = d(o, pivots[j])`.
    table: Vec<Vec<f64>>,
    /// The physical pages of object ids.
    pages: Vec<Vec<ObjId>>,
    /// Counters accumulated during the build.
    build: Counters,
}

/// The metadata file of a CPT: `<base>.cpt_meta`. The page layout comes from
/// an M-tree persisted at `<base>.cpt_mtree`.
fn paths(base: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
    (base.with_extension("cpt_meta"), base.with_extension("cpt_mtree"))
}

impl Cpt {
    /// Builds a CPT under `base`: an M-tree supplies the page clustering,
    /// then the pivot table is computed over it.
    ///
    /// `pivots`, when non-empty, supplies the pivot set (HFI pivots);
    /// otherwise the first `n_pivots` objects are used.
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
        node_capacity: usize,
    ) -> Result<Self, String> {
        let pivots = if pivots.is_empty() {
            if n_pivots == 0 {
                return Err("CPT needs at least one pivot.".to_string());
            }
            (0..n_pivots.min(db.size())).collect::<Vec<_>>()
        } else {
            pivots.to_vec()
        };
        let (meta_path, mtree_path) = paths(base.as_ref());

        // The M-tree's leaves become the physical page layout.
        let mut mtree = MTree::build(db.clone(), &mtree_path, node_capacity)?;
        let pages = mtree.leaf_pages()?;
        let clustering_cost = mtree.build_counters();

        let mut scope = DbScope::new(db);
        scope.counters = clustering_cost;
        let table = (0..scope.size())
            .map(|o| pivots.iter().map(|&p| scope.d(o, p)).collect())
            .collect::<Vec<Vec<f64>>>();

        let meta = Meta {
            n: scope.size() as u64,
            pivots: pivots.iter().map(|&p| p as u64).collect(),
            table: table.clone(),
            pages: pages.iter().map(|page| page.iter().map(|&id| id as u64).collect()).collect(),
        };
        let encoded = bincode::serialize(&meta).map_err(|e| format!("Could not serialize CPT: {e}"))?;
        let tmp = meta_path.with_extension("cpt_meta.tmp");
        std::fs::write(&tmp, &encoded).map_err(|e| format!("Could not write '{}': {e}", tmp.display()))?;
        std::fs::rename(&tmp, &meta_path)
            .map_err(|e| format!("Could not rename '{}' into place: {e}", tmp.display()))?;
        scope.page_writes(pages_for(encoded.len() as u64));

        let build = scope.counters;
        scope.clear_counters();
        Ok(Self {
            scope,
            pivots,
            table,
            pages,
            build,
        })
    }

    /// Reopens a persisted CPT from `base`.
    ///
    /// # Errors
    ///
    /// - If the metadata file is missing or corrupt.
    pub fn open<P: AsRef<Path>>(db: Arc<ObjectDb>, base: P) -> Result<Self, String> {
        let (meta_path, _) = paths(base.as_ref());
        let encoded = std::fs::read(&meta_path)
            .map_err(|e| format!("Could not read '{}': {e}", meta_path.display()))?;
        let meta: Meta = bincode::deserialize(&encoded)
            .map_err(|e| format!("Corrupt CPT in '{}': {e}", meta_path.display()))?;

        Ok(Self {
            scope: DbScope::new(db),
            pivots: meta.pivots.iter().map(|&p| p as ObjId).collect(),
            table: meta.table,
            pages: meta.pages.iter().map(|page| page.iter().map(|&id| id as ObjId).collect()).collect(),
            build: Counters::default(),
        })
    }

    /// The lower bound `max_j |d(q, p_j) - T[o][j]|` on `d(q, o)`.
    fn lower_bound(&self, query_dists: &[f64], o: ObjId) -> f64 {
        query_dists
            .iter()
            .zip(self.table[o].iter())
            .map(|(q, t)| (q - t).abs())
            .fold(0.0, f64::max)
    }

    /// Distances from the query to every pivot.
    fn query_dists(&mut self, query: ObjId) -> Vec<f64> {
        let pivots = self.pivots.clone();
        pivots.into_iter().map(|p| self.scope.d(query, p)).collect()
    }
}

impl MetricIndex for Cpt {
    fn name(&self) -> String {
        format!("CPT(pivots={})", self.pivots.len())
    }

    fn range_search(&mut self, query: ObjId, radius: f64) -> Result<Vec<ObjId>, String> {
        let query_dists = self.query_dists(query);

        let mut hits = Vec::new();
        for page in self.pages.clone() {
            // A page is fetched only when some member survives the bound.
            let candidates = page
                .into_iter()
                .filter(|&o| self.lower_bound(&query_dists, o) <= radius)
                .collect::<Vec<_>>();
            if candidates.is_empty() {
                continue;
            }

            self.scope.page_reads(1);
            for o in candidates {
                if self.scope.d(query, o) <= radius {
                    hits.push(o);
                }
            }
        }
        Ok(hits)
    }

    fn knn_search(&mut self, query: ObjId, k: usize) -> Result<Vec<(ObjId, f64)>, String> {
        let mut heap = SizedHeap::new(Some(k));
        if k == 0 {
            return Ok(Vec::new());
        }
        let query_dists = self.query_dists(query);

        // Pre-scan a small prefix of the database to seed tau.
        #[expect(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let n0 = ((PRE_SCAN_FRACTION * self.scope.size() as f64).ceil() as usize)
            .clamp(1, self.scope.size());
        for o in 0..n0 {
            let d = self.scope.d(query, o);
            heap.push((o, d));
        }

        // Clustered scan over the remaining objects, page by page.
        for page in self.pages.clone() {
            let tau = tau_of(&heap);
            let candidates = page
                .into_iter()
                .filter(|&o| o >= n0)
                .filter(|&o| !heap.is_full() || self.lower_bound(&query_dists, o) <= tau)
                .collect::<Vec<_>>();
            if candidates.is_empty() {
                continue;
            }

            self.scope.page_reads(1);
            for o in candidates {
                let d = self.scope.d(query, o);
                heap.push((o, d));
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
    fn pages_cover_every_object_once() -> Result<(), String> {
        let tmp = tempdir::TempDir::new("mexis-cpt").map_err(|e| e.to_string())?;
        let base = tmp.path().join("toy");
        let cpt = Cpt::build(two_cluster_db(), &base, 2, &[], 4)?;

        let mut seen = cpt.pages.iter().flatten().copied().collect::<Vec<_>>();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
        Ok(())
    }

    #[test]
    fn searches_match_brute_force() -> Result<(), String> {
        let tmp = tempdir::TempDir::new("mexis-cpt").map_err(|e| e.to_string())?;
        let base = tmp.path().join("toy");
        let mut cpt = Cpt::build(two_cluster_db(), &base, 2, &[], 4)?;

        let mut hits = cpt.range_search(0, 1.0)?;
        hits.sort_unstable();
        assert_eq!(hits, vec![0, 1, 2]);

        let knn = cpt.knn_search(0, 3)?;
        assert_eq!(knn[0], (0, 0.0));
        assert_eq!((knn[1].0, knn[2].0), (1, 2));
        Ok(())
    }

    #[test]
    fn pruned_pages_cost_no_reads() -> Result<(), String> {
        let tmp = tempdir::TempDir::new("mexis-cpt").map_err(|e| e.to_string())?;
        let base = tmp.path().join("toy");
        let mut cpt = Cpt::build(two_cluster_db(), &base, 2, &[], 4)?;

        cpt.clear_counters();
        cpt.range_search(0, 0.5)?;
        assert!(cpt.counters().page_reads < cpt.pages.len() as u64);
        Ok(())
    }

    #[test]
    fn reopen_matches_fresh_build() -> Result<(), String> {
        let tmp = tempdir::TempDir::new("mexis-cpt").map_err(|e| e.to_string())?;
        let base = tmp.path().join("toy");
        let db = two_cluster_db();

        let mut built = Cpt::build(db.clone(), &base, 2, &[], 4)?;
        built.clear_counters();
        let fresh = built.knn_search(1, 4)?;
        let fresh_counters = built.counters();

        let mut reopened = Cpt::open(db, &base)?;
        let again = reopened.knn_search(1, 4)?;
        assert_eq!(fresh, again);
        assert_eq!(fresh_counters, reopened.counters());
        Ok(())
    }
}
