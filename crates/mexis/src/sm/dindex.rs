//! The D-index: multilevel ρ-split hashing.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::dataset::{ObjId, ObjectDb};
use crate::scope::{Counters, DbScope};
use crate::sm::Raf;
use crate::utils::sort_hits;
use crate::MetricIndex;

/// How many radius-doubling refinements MkNN runs before settling.
const MAX_KNN_ITERATIONS: usize = 5;

/// One level of the index: a pivot and the median distance of the objects
/// that reached that level.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
struct Level {
    /// The pivot of this level.
    pivot: u64,
    /// Median of `d(o, pivot)` over the level's candidates.
    d_med: f64,
}

/// One bucket: the per-level distance intervals of its objects, plus the
/// object ids.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
struct Bucket {
    /// Per level, the `[min, max]` interval of member distances to that
    /// level's pivot; `f64::INFINITY` for unbounded tops.
    intervals: Vec<(f64, f64)>,
    /// The member ids.
    objects: Vec<u64>,
}

/// The whole structure, persisted in the metadata file.
#[derive(serde::Serialize, serde::Deserialize)]
struct Meta {
    /// Number of objects at build time.
    n: u64,
    /// The split band half-width.
    rho: f64,
    /// The levels, in order.
    levels: Vec<Level>,
    /// Buckets keyed by their separation string over `{L, -, R}`.
    buckets: BTreeMap<String, Bucket>,
}

/// A D-index.
///
/// Each level splits the remaining objects on the ball of median radius
/// around its pivot: inside the band of half-width ρ the object survives to
/// the next level, outside it lands in this level's `L` or `R` bucket.
/// Objects that stay in the band at every level form the global exclusion
/// bucket. Queries prune whole buckets with the L-infinity distance from the
/// query's pivot map to the bucket's interval box.
pub struct DIndex {
    /// The counted route to the database.
    scope: DbScope,
    /// The split band half-width.
    rho: f64,
    /// The levels, in order.
    levels: Vec<Level>,
    /// Buckets keyed by separation string; deterministic iteration order.
    buckets: BTreeMap<String, Bucket>,
    /// The record file holding the stored objects.
    raf: Raf,
    /// Counters accumulated during the build.
    build: Counters,
}

/// The two files of a D-index: `<base>.didx_meta` and `<base>.didx_raf`.
fn paths(base: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
    (base.with_extension("didx_meta"), base.with_extension("didx_raf"))
}

/// Distance from scalar `x` to the interval `[a, b]`.
fn dist_to_interval(x: f64, (a, b): (f64, f64)) -> f64 {
    if x < a {
        a - x
    } else if x > b {
        x - b
    } else {
        0.0
    }
}

impl DIndex {
    /// Builds a D-index with `n_levels` seeded-random pivots and band
    /// half-width `rho`, persisting it under `base`.
    ///
    /// # Errors
    ///
    /// - If `n_levels` is zero or `rho` is negative.
    /// - If the files cannot be written.
    pub fn build<P: AsRef<Path>>(db: Arc<ObjectDb>, base: P, n_levels: usize, rho: f64, seed: u64) -> Result<Self, String> {
        if n_levels == 0 {
            return Err("D-index needs at least one level.".to_string());
        }
        if rho < 0.0 {
            return Err("D-index band half-width must be non-negative.".to_string());
        }
        let (meta_path, raf_path) = paths(base.as_ref());

        let mut scope = DbScope::new(db);
        let n = scope.size();
        let n_levels = n_levels.min(n.max(1));

        // Store every object's payload in the record file.
        let mut raf = Raf::create(&raf_path)?;
        for id in 0..n {
            let payload = scope.db().render(id);
            raf.append(id as u64, payload.as_bytes())?;
            scope.page_writes(1);
        }
        raf.sync()?;

        // Seeded random pivots.
        let mut ids = (0..n).collect::<Vec<_>>();
        let mut rng = StdRng::seed_from_u64(seed);
        ids.shuffle(&mut rng);
        let pivots = ids.into_iter().take(n_levels).collect::<Vec<_>>();

        // Pivot map of every object.
        let mapping = (0..n)
            .map(|id| pivots.iter().map(|&p| scope.d(id, p)).collect::<Vec<_>>())
            .collect::<Vec<_>>();

        // Multilevel split: each object lands in the first level where it
        // separates; band-dwellers fall through to the next level.
        let mut levels = Vec::with_capacity(n_levels);
        let mut left_by_level = vec![Vec::new(); n_levels];
        let mut right_by_level = vec![Vec::new(); n_levels];
        let mut candidates = (0..n).collect::<Vec<_>>();

        for (lvl, &pivot) in pivots.iter().enumerate() {
            if candidates.is_empty() {
                levels.push(Level {
                    pivot: pivot as u64,
                    d_med: 0.0,
                });
                continue;
            }

            let mut dists = candidates.iter().map(|&id| mapping[id][lvl]).collect::<Vec<_>>();
            dists.sort_by(|a, b| a.partial_cmp(b).unwrap_or(core::cmp::Ordering::Equal));
            let d_med = dists[dists.len() / 2];
            levels.push(Level {
                pivot: pivot as u64,
                d_med,
            });

            let mut next = Vec::with_capacity(candidates.len());
            for id in candidates {
                let d = mapping[id][lvl];
                if d < d_med - rho {
                    left_by_level[lvl].push(id);
                } else if d > d_med + rho {
                    right_by_level[lvl].push(id);
                } else {
                    next.push(id);
                }
            }
            candidates = next;
        }

        // Assemble buckets with tight per-level intervals over their actual
        // members.
        let mut buckets = BTreeMap::new();
        let mut add_bucket = |key: String, members: &[ObjId]| {
            if members.is_empty() {
                return;
            }
            let intervals = (0..n_levels)
                .map(|lvl| {
                    members.iter().fold((f64::INFINITY, 0.0_f64), |(lo, hi), &id| {
                        let d = mapping[id][lvl];
                        (lo.min(d), hi.max(d))
                    })
                })
                .collect();
            buckets.insert(
                key,
                Bucket {
                    intervals,
                    objects: members.iter().map(|&id| id as u64).collect(),
                },
            );
        };

        for lvl in 0..n_levels {
            let mut key = vec![b'-'; n_levels];
            key[lvl] = b'L';
            add_bucket(String::from_utf8_lossy(&key).into_owned(), &left_by_level[lvl]);
            key[lvl] = b'R';
            add_bucket(String::from_utf8_lossy(&key).into_owned(), &right_by_level[lvl]);
        }
        add_bucket("-".repeat(n_levels), &candidates);

        let meta = Meta {
            n: n as u64,
            rho,
            levels: levels.clone(),
            buckets: buckets.clone(),
        };
        let encoded = bincode::serialize(&meta).map_err(|e| format!("Could not serialize D-index: {e}"))?;
        let meta_tmp = meta_path.with_extension("didx_meta.tmp");
        std::fs::write(&meta_tmp, &encoded)
            .map_err(|e| format!("Could not write '{}': {e}", meta_tmp.display()))?;
        std::fs::rename(&meta_tmp, &meta_path)
            .map_err(|e| format!("Could not rename '{}' into place: {e}", meta_tmp.display()))?;

        let build = scope.counters;
        scope.clear_counters();
        Ok(Self {
            scope,
            rho,
            levels,
            buckets,
            raf,
            build,
        })
    }

    /// Reopens a persisted D-index from `base`.
    ///
    /// # Errors
    ///
    /// - If either file is missing or corrupt.
    pub fn open<P: AsRef<Path>>(db: Arc<ObjectDb>, base: P) -> Result<Self, String> {
        let (meta_path, raf_path) = paths(base.as_ref());

        let encoded = std::fs::read(&meta_path)
            .map_err(|e| format!("Could not read '{}': {e}", meta_path.display()))?;
        let meta: Meta = bincode::deserialize(&encoded)
            .map_err(|e| format!("Corrupt D-index in '{}': {e}", meta_path.display()))?;
        let raf = Raf::open(&raf_path)?;

        Ok(Self {
            scope: DbScope::new(db),
            rho: meta.rho,
            levels: meta.levels,
            buckets: meta.buckets,
            raf,
            build: Counters::default(),
        })
    }

    /// The query's distances to every level pivot.
    fn query_map(&mut self, query: ObjId) -> Vec<f64> {
        let pivots = self.levels.iter().map(|l| l.pivot as ObjId).collect::<Vec<_>>();
        pivots.into_iter().map(|p| self.scope.d(query, p)).collect()
    }

    /// Candidate ids of all buckets the query ball can reach.
    fn candidates(&mut self, query_map: &[f64], radius: f64) -> Vec<ObjId> {
        let mut out = Vec::new();
        for bucket in self.buckets.values() {
            let mut lb = 0.0_f64;
            for (lvl, &interval) in bucket.intervals.iter().enumerate() {
                lb = lb.max(dist_to_interval(query_map[lvl], interval));
                if lb > radius {
                    break;
                }
            }
            if lb <= radius {
                out.extend(bucket.objects.iter().map(|&id| id as ObjId));
            }
        }
        out
    }

    /// Verifies candidates against the true distance, fetching each stored
    /// object from the record file.
    fn verify(&mut self, query: ObjId, candidates: &[ObjId]) -> Result<Vec<(ObjId, f64)>, String> {
        let mut out = Vec::with_capacity(candidates.len());
        for &id in candidates {
            self.raf.read(id as u64)?;
            self.scope.page_reads(1);
            let d = self.scope.d(query, id);
            out.push((id, d));
        }
        Ok(out)
    }
}

impl MetricIndex for DIndex {
    fn name(&self) -> String {
        format!("DIndex(levels={}, rho={})", self.levels.len(), self.rho)
    }

    fn range_search(&mut self, query: ObjId, radius: f64) -> Result<Vec<ObjId>, String> {
        let query_map = self.query_map(query);
        let candidates = self.candidates(&query_map, radius);
        Ok(self
            .verify(query, &candidates)?
            .into_iter()
            .filter(|&(_, d)| d <= radius)
            .map(|(id, _)| id)
            .collect())
    }

    fn knn_search(&mut self, query: ObjId, k: usize) -> Result<Vec<(ObjId, f64)>, String> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let query_map = self.query_map(query);
        let mut radius = self.rho;
        let mut results = Vec::new();

        for _ in 0..MAX_KNN_ITERATIONS {
            let candidates = self.candidates(&query_map, radius);
            let mut dists = self.verify(query, &candidates)?;
            sort_hits(&mut dists);

            if dists.len() >= k {
                let dk = dists[k - 1].1;
                results = dists.into_iter().take(k).collect();
                if dk <= radius + 1e-12 {
                    break;
                }
                radius = dk;
            } else {
                // Fewer than k candidates: widen conservatively, always
                // making progress so a zero radius cannot stall the loop.
                let mut new_radius = dists
                    .last()
                    .map_or_else(|| radius.mul_add(2.0, 1.0), |&(_, d)| radius.max(d * 2.0));
                if new_radius <= radius + 1e-12 {
                    new_radius = radius.mul_add(2.0, 1.0);
                }
                results = dists;
                radius = new_radius;
            }
        }
        Ok(results)
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

    /// Ten 1-D points on a line.
    fn line_db() -> Arc<ObjectDb> {
        Arc::new(ObjectDb::Vectors {
            rows: (0..10).map(|i| vec![f64::from(i)]).collect(),
            dim: 1,
            lp: Lp::L2,
        })
    }

    #[test]
    fn zero_rho_partitions_every_object_once() -> Result<(), String> {
        let tmp = tempdir::TempDir::new("mexis-dindex").map_err(|e| e.to_string())?;
        let base = tmp.path().join("line");
        let dindex = DIndex::build(line_db(), &base, 2, 0.0, 42)?;

        let mut seen = Vec::new();
        for bucket in dindex.buckets.values() {
            seen.extend(bucket.objects.iter().map(|&id| id as ObjId));
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn range_equals_linear_scan() -> Result<(), String> {
        let tmp = tempdir::TempDir::new("mexis-dindex").map_err(|e| e.to_string())?;
        let base = tmp.path().join("line");
        let mut dindex = DIndex::build(line_db(), &base, 2, 0.0, 42)?;

        for radius in [0.0, 0.5, 1.0, 2.0] {
            for q in 0..10 {
                let mut hits = dindex.range_search(q, radius)?;
                hits.sort_unstable();
                #[expect(clippy::cast_precision_loss)]
                let expected = (0..10_usize)
                    .filter(|&o| (o.abs_diff(q) as f64) <= radius)
                    .collect::<Vec<_>>();
                assert_eq!(hits, expected, "q={q} r={radius}");
            }
        }
        Ok(())
    }

    #[test]
    fn knn_converges_on_small_data() -> Result<(), String> {
        let tmp = tempdir::TempDir::new("mexis-dindex").map_err(|e| e.to_string())?;
        let base = tmp.path().join("line");
        let mut dindex = DIndex::build(line_db(), &base, 2, 0.5, 42)?;

        let knn = dindex.knn_search(5, 3)?;
        assert_eq!(knn, vec![(5, 0.0), (4, 1.0), (6, 1.0)]);
        Ok(())
    }

    #[test]
    fn reopen_matches_fresh_build() -> Result<(), String> {
        let tmp = tempdir::TempDir::new("mexis-dindex").map_err(|e| e.to_string())?;
        let base = tmp.path().join("line");
        let db = line_db();

        let mut built = DIndex::build(db.clone(), &base, 2, 0.5, 42)?;
        built.clear_counters();
        let fresh = built.range_search(3, 2.0)?;
        let fresh_counters = built.counters();

        let mut reopened = DIndex::open(db, &base)?;
        let again = reopened.range_search(3, 2.0)?;
        assert_eq!(fresh, again);
        assert_eq!(fresh_counters, reopened.counters());
        Ok(())
    }
}
