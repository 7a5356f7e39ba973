//! The linear approximating and eliminating search algorithm.

use std::sync::Arc;

use crate::dataset::{ObjId, ObjectDb};
use crate::scope::{Counters, DbScope};
use crate::utils::{tau_of, MinItem, SizedHeap};
use crate::MetricIndex;

/// LAESA: a pivot table with no tree at all.
///
/// An `N x |P|` matrix of precomputed distances to a small pivot set. At
/// query time, `|P|` distances to the pivots give a per-object lower bound
/// `max_j |d(q, p_j) - T[o][j]|` that eliminates most candidates before any
/// further distance evaluation.
pub struct Laesa {
    /// The counted route to the database.
    scope: DbScope,
    /// The pivot object ids.
    pivots: Vec<ObjId>,
    /// `table[o][j] = d(o, pivots[j])` for every object `o`.
    table: Vec<Vec<f64>>,
    /// Counters accumulated during the build.
    build: Counters,
}

impl Laesa {
    /// Builds a LAESA table with the first `n_pivots` objects as pivots, or
    /// with an externally supplied pivot set.
    ///
    /// `pivots`, when non-empty, overrides the default choice (this is how
    /// precomputed HFI pivots are honored). The pivot count is clamped to
    /// the database size.
    ///
    /// # Errors
    ///
    /// - If `n_pivots` is zero and no pivots are supplied.
    pub fn build(db: Arc<ObjectDb>, n_pivots: usize, pivots: &[ObjId]) -> Result<Self, String> {
        let pivots = if pivots.is_empty() {
            if n_pivots == 0 {
                return Err("LAESA needs at least one pivot.".to_string());
            }
            (0..n_pivots.min(db.size())).collect::<Vec<_>>()
        } else {
            pivots.to_vec()
        };

        let mut scope = DbScope::new(db);
        let table = (0..scope.size())
            .map(|o| pivots.iter().map(|&p| scope.d(o, p)).collect())
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

    /// Distances from the query to every pivot, counted.
    fn query_dists(&mut self, query: ObjId) -> Vec<f64> {
        let pivots = self.pivots.clone();
        pivots.into_iter().map(|p| self.scope.d(query, p)).collect()
    }
}

impl MetricIndex for Laesa {
    fn name(&self) -> String {
        format!("LAESA(pivots={})", self.pivots.len())
    }

    fn range_search(&mut self, query: ObjId, radius: f64) -> Result<Vec<ObjId>, String> {
        let query_dists = self.query_dists(query);

        let mut hits = Vec::new();
        for (j, &p) in self.pivots.clone().iter().enumerate() {
            if query_dists[j] <= radius {
                hits.push(p);
            }
        }

        for o in 0..self.scope.size() {
            if self.pivots.contains(&o) {
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

        let query_dists = self.query_dists(query);
        for (j, &p) in self.pivots.clone().iter().enumerate() {
            heap.push((p, query_dists[j]));
        }

        // Process candidates in ascending order of the L1 proximity
        // heuristic over the pivot space, so tau tightens early.
        let mut candidates = (0..self.scope.size())
            .filter(|o| !self.pivots.contains(o))
            .map(|o| {
                let l1 = query_dists
                    .iter()
                    .zip(self.table[o].iter())
                    .map(|(q, t)| (q - t).abs())
                    .sum::<f64>();
                (o, l1)
            })
            .collect::<Vec<_>>();
        candidates.sort_by_key(|&(o, l1)| MinItem(o, l1));

        for (o, _) in candidates {
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

    /// The four-string dataset used across the suite.
    fn words_db() -> Arc<ObjectDb> {
        Arc::new(ObjectDb::Strings {
            rows: vec![
                "abc".to_string(),
                "abd".to_string(),
                "xyz".to_string(),
                "abcd".to_string(),
            ],
        })
    }

    #[test]
    fn string_range_and_knn() -> Result<(), String> {
        let mut laesa = Laesa::build(words_db(), 1, &[])?;

        let mut hits = laesa.range_search(0, 1.0)?;
        hits.sort_unstable();
        assert_eq!(hits, vec![0, 1, 3]);

        let knn = laesa.knn_search(0, 2)?;
        assert_eq!(knn, vec![(0, 0.0), (1, 1.0)]);
        Ok(())
    }

    #[test]
    fn lower_bound_identity() -> Result<(), String> {
        // With P = {0}, LB(o) = |d(q, p_0) - T[o][0]|.
        let mut laesa = Laesa::build(words_db(), 1, &[])?;
        let query = 0;
        let query_dists = laesa.query_dists(query);
        let expected = (query_dists[0] - laesa.table[3][0]).abs();
        float_cmp::assert_approx_eq!(f64, laesa.lower_bound(&query_dists, 3), expected);
        Ok(())
    }

    #[test]
    fn honors_supplied_pivots() -> Result<(), String> {
        let laesa = Laesa::build(words_db(), 0, &[2, 3])?;
        assert_eq!(laesa.pivots, vec![2, 3]);
        Ok(())
    }

    #[test]
    fn build_cost_is_table_size() -> Result<(), String> {
        let db = words_db();
        let laesa = Laesa::build(db.clone(), 2, &[])?;
        assert_eq!(laesa.build_counters().comp_dist, (db.size() * 2) as u64);
        Ok(())
    }

    #[test]
    fn vector_knn_with_more_pivots_is_no_worse() -> Result<(), String> {
        let db = Arc::new(ObjectDb::Vectors {
            rows: (0..50).map(|i| vec![f64::from(i), f64::from(i % 7)]).collect(),
            dim: 2,
            lp: Lp::L2,
        });

        let mut few = Laesa::build(db.clone(), 2, &[])?;
        let mut many = Laesa::build(db, 10, &[])?;

        few.clear_counters();
        many.clear_counters();
        let a = few.knn_search(25, 5)?;
        let b = many.knn_search(25, 5)?;
        assert_eq!(a, b);
        Ok(())
    }
}
