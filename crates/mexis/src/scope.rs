//! Per-index cost counters and the counted route to the object database.

use std::sync::Arc;

use crate::dataset::{ObjId, ObjectDb};

/// The cost counters maintained by every index.
///
/// `comp_dist` counts calls to the distance function, the primary cost
/// metric. `page_reads` and `page_writes` count logical 4 KB I/O and stay
/// zero for main-memory indexes. The caller resets them before each query
/// batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Counters {
    /// Number of distance evaluations.
    pub comp_dist: u64,
    /// Number of logical 4 KB page reads.
    pub page_reads: u64,
    /// Number of logical 4 KB page writes.
    pub page_writes: u64,
}

/// An index's window onto the object database.
///
/// Every distance evaluation flows through [`DbScope::d`] so that `comp_dist`
/// counts each call exactly once. The database itself is shared, read-only,
/// between all indexes in a process; the counters are private to one index.
pub struct DbScope {
    /// The shared object database.
    db: Arc<ObjectDb>,
    /// The counters of the owning index.
    pub counters: Counters,
}

impl DbScope {
    /// Creates a scope over a shared database with zeroed counters.
    #[must_use]
    pub fn new(db: Arc<ObjectDb>) -> Self {
        Self {
            db,
            counters: Counters::default(),
        }
    }

    /// The distance between two objects, counted.
    pub fn d(&mut self, a: ObjId, b: ObjId) -> f64 {
        self.counters.comp_dist += 1;
        self.db.distance(a, b)
    }

    /// The number of objects in the database.
    #[must_use]
    pub fn size(&self) -> usize {
        self.db.size()
    }

    /// The shared database handle.
    #[must_use]
    pub fn db(&self) -> &Arc<ObjectDb> {
        &self.db
    }

    /// Records `pages` logical page reads.
    pub fn page_reads(&mut self, pages: u64) {
        self.counters.page_reads += pages;
    }

    /// Records `pages` logical page writes.
    pub fn page_writes(&mut self, pages: u64) {
        self.counters.page_writes += pages;
    }

    /// Zeroes all counters.
    pub fn clear_counters(&mut self) {
        self.counters = Counters::default();
    }
}

/// Converts a node size in bytes to a logical page count.
///
/// Nodes smaller than one page still cost one page, so that indexes with
/// 4 KB and 40 KB nodes compare on equal footing.
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    let pages = bytes.div_ceil(4096);
    if pages == 0 { 1 } else { pages }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::Lp;

    #[test]
    fn distance_calls_are_counted() {
        let db = Arc::new(ObjectDb::Vectors {
            rows: vec![vec![0.0, 0.0], vec![3.0, 4.0]],
            dim: 2,
            lp: Lp::L2,
        });
        let mut scope = DbScope::new(db);

        float_cmp::assert_approx_eq!(f64, scope.d(0, 1), 5.0);
        float_cmp::assert_approx_eq!(f64, scope.d(1, 0), 5.0);
        assert_eq!(scope.counters.comp_dist, 2);

        scope.clear_counters();
        assert_eq!(scope.counters, Counters::default());
    }

    #[test]
    fn page_rounding() {
        assert_eq!(pages_for(0), 1);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(4096), 1);
        assert_eq!(pages_for(4097), 2);
        assert_eq!(pages_for(40960), 10);
    }
}
