//! Brute-force linear scan.
//!
//! No pruning at all: every query evaluates the distance to every object.
//! This is the ground truth that every other index is checked against, and
//! the baseline row in benchmark reports.

use std::sync::Arc;

use crate::dataset::{ObjId, ObjectDb};
use crate::scope::{Counters, DbScope};
use crate::utils::SizedHeap;
use crate::MetricIndex;

/// A linear scan over the whole database.
pub struct LinearScan {
    /// The counted route to the database.
    scope: DbScope,
}

impl LinearScan {
    /// Creates a linear scan over `db`. There is nothing to build.
    #[must_use]
    pub fn new(db: Arc<ObjectDb>) -> Self {
        Self {
            scope: DbScope::new(db),
        }
    }
}

impl MetricIndex for LinearScan {
    fn name(&self) -> String {
        "LinearScan".to_string()
    }

    fn range_search(&mut self, query: ObjId, radius: f64) -> Result<Vec<ObjId>, String> {
        let mut hits = Vec::new();
        for o in 0..self.scope.size() {
            if self.scope.d(query, o) <= radius {
                hits.push(o);
            }
        }
        Ok(hits)
    }

    fn knn_search(&mut self, query: ObjId, k: usize) -> Result<Vec<(ObjId, f64)>, String> {
        let mut heap = SizedHeap::new(Some(k));
        for o in 0..self.scope.size() {
            let d = self.scope.d(query, o);
            heap.push((o, d));
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
        Counters::default()
    }
}
