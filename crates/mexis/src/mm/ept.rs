//! The excluded-pivot table.

use std::sync::Arc;

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::dataset::{ObjId, ObjectDb};
use crate::scope::{Counters, DbScope};
use crate::utils::{tau_of, SizedHeap};
use crate::MetricIndex;

/// An excluded-pivot table.
///
/// Like [`Laesa`](crate::mm::Laesa), this keeps an `N x |P|` table of
/// precomputed pivot distances, but the pivots are drawn at random from the
/// database and are excluded from the candidate table: they are answered
/// directly from the query-to-pivot distances. Candidates are rejected when
/// the maximum per-pivot lower bound exceeds the query radius.
pub struct Ept {
    /// The counted route to the database.
    scope: DbScope,
    /// The pivot object ids.
    pivots: Vec<ObjId>,
    /// `table[o][j] = d(o, pivots[j])`; rows of pivots are left empty.
    table: Vec<Vec<f64>>,
    /// Counters accumulated during the build.
    build: Counters,
}

impl Ept {
    /// Builds an EPT with `n_pivots` seeded-random pivots.
    ///
    /// The pivot count is clamped to the database size.
    ///
    /// # Errors
    ///
    /// - If `n_pivots` is zero.
    pub fn build(db: Arc<ObjectDb>, n_pivots: usize, seed: u64) -> Result<Self, String> {
        if n_pivots == 0 {
            return Err("EPT needs at least one pivot.".to_string());
        }

        let mut ids = (0..db.size()).collect::<Vec<_>>();
        let mut rng = StdRng::seed_from_u64(seed);
        ids.shuffle(&mut rng);
        let mut pivots = ids.into_iter().take(n_pivots.min(db.size())).collect::<Vec<_>>();
        pivots.sort_unstable();

        let mut scope = DbScope::new(db);
        let table = (0..scope.size())
            .map(|o| {
                if pivots.contains(&o) {
                    Vec::new()
                } else {
                    pivots.iter().map(|&p| scope.d(o, p)).collect()
                }
            })
            .collect();

        let build = scope.counters;
        scope.clear_counters();
        Ok(Self {
            scope,
            pivots,
            table,
            build,
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
}

impl MetricIndex for Ept {
    fn name(&self) -> String {
        format!("EPT(pivots={})", self.pivots.len())
    }

    fn range_search(&mut self, query: ObjId, radius: f64) -> Result<Vec<ObjId>, String> {
        let pivots = self.pivots.clone();
        let query_dists = pivots.iter().map(|&p| self.scope.d(query, p)).collect::<Vec<_>>();

        let mut hits = Vec::new();
        for (j, &p) in pivots.iter().enumerate() {
            if query_dists[j] <= radius {
                hits.push(p);
            }
        }

        for o in 0..self.scope.size() {
            if pivots.contains(&o) {
                continue;
            }
            if self.lower_bound(&query_dists, o) <= radius && self.scope.d(query, o) <= radius {
                hits.push(o);
            }
        }
        Ok(hits)
    }

    fn knn_search(&mut self, query: ObjId, k: usize) -> Result<Vec<(ObjId, f64)>, String> {
        let mut heap = SizedHeap::new(Some(k));
        if k == 0 {
            return Ok(Vec::new());
        }

        let pivots = self.pivots.clone();
        let query_dists = pivots.iter().map(|&p| self.scope.d(query, p)).collect::<Vec<_>>();
        for (j, &p) in pivots.iter().enumerate() {
            heap.push((p, query_dists[j]));
        }

        for o in 0..self.scope.size() {
            if pivots.contains(&o) {
                continue;
            }
            let tau = tau_of(&heap);
            if !heap.is_full() || self.lower_bound(&query_dists, o) <= tau {
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

    fn grid_db() -> Arc<ObjectDb> {
        Arc::new(ObjectDb::Vectors {
            rows: (0..20).map(|i| vec![f64::from(i)]).collect(),
            dim: 1,
            lp: Lp::L1,
        })
    }

    #[test]
    fn range_matches_interval() -> Result<(), String> {
        let mut ept = Ept::build(grid_db(), 3, 42)?;
        let mut hits = ept.range_search(10, 2.0)?;
        hits.sort_unstable();
        assert_eq!(hits, vec![8, 9, 10, 11, 12]);
        Ok(())
    }

    #[test]
    fn knn_matches_interval() -> Result<(), String> {
        let mut ept = Ept::build(grid_db(), 3, 42)?;
        let knn = ept.knn_search(10, 3)?;
        assert_eq!(knn, vec![(10, 0.0), (9, 1.0), (11, 1.0)]);
        Ok(())
    }

    #[test]
    fn pivot_count_is_clamped() -> Result<(), String> {
        let ept = Ept::build(grid_db(), 100, 42)?;
        assert_eq!(ept.pivots.len(), 20);
        Ok(())
    }
}
