//! Metric-space exact indexing and search.
//!
//! This crate provides a catalog of metric-space similarity search indexes:
//! data structures that, given a finite set of objects and a black-box
//! distance function satisfying the metric axioms, answer range queries and
//! k-nearest-neighbor queries while evaluating as few distances as possible.
//!
//! ## Organization
//!
//! - [`dataset`]: the object database that owns the raw objects and supplies
//!   distances, plus loaders for the prepared query/radius/pivot side-files.
//! - [`metric`]: the supported distance functions (Minkowski norms and the
//!   Levenshtein edit distance).
//! - [`mm`]: main-memory indexes, where the cost metric is the number of
//!   distance evaluations.
//! - [`sm`]: secondary-memory indexes, which persist to page-addressable
//!   files and additionally count page reads and writes.
//!
//! All indexes implement [`MetricIndex`] and are driven uniformly by the
//! benchmark harness in the companion `mexis-results` crate.

pub mod dataset;
pub mod metric;
pub mod mm;
pub mod sm;

mod index;
mod scope;
mod utils;

pub use index::MetricIndex;
pub use scope::{pages_for, Counters, DbScope};
pub use utils::{MaxItem, MinItem, SizedHeap};
