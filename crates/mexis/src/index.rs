//! The contract shared by every metric index.

use crate::dataset::ObjId;
use crate::scope::Counters;

/// A metric-space similarity search index.
///
/// Implementations answer two query types without scanning the whole
/// database: metric range queries and metric k-nearest-neighbor queries.
/// Both rely only on the triangle inequality of the underlying metric.
pub trait MetricIndex {
    /// A diagnostic name for the index, including its key parameters.
    fn name(&self) -> String;

    /// Returns all object ids within `radius` of `query`, without duplicates
    /// and in no particular order.
    ///
    /// # Errors
    ///
    /// Secondary-memory indexes propagate I/O errors; main-memory indexes do
    /// not fail.
    fn range_search(&mut self, query: ObjId, radius: f64) -> Result<Vec<ObjId>, String>;

    /// Returns the `min(k, N)` objects nearest to `query`, sorted by
    /// ascending distance with ties broken by ascending id.
    ///
    /// # Errors
    ///
    /// Secondary-memory indexes propagate I/O errors; main-memory indexes do
    /// not fail.
    fn knn_search(&mut self, query: ObjId, k: usize) -> Result<Vec<(ObjId, f64)>, String>;

    /// The counters accumulated since the last [`MetricIndex::clear_counters`].
    fn counters(&self) -> Counters;

    /// Zeroes the per-query counters.
    fn clear_counters(&mut self);

    /// The counters accumulated while building the index: distance
    /// evaluations and, for secondary-memory indexes, page writes.
    fn build_counters(&self) -> Counters;
}
