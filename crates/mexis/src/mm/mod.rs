//! Main-memory indexes.
//!
//! These indexes live entirely in RAM; their cost metric is the number of
//! distance evaluations. All of them share the contract of
//! [`MetricIndex`](crate::MetricIndex) and differ in the partitioning rule
//! and the pruning inequalities.

mod bkt;
mod bst;
mod dsacl;
mod ept;
mod fqt;
mod gnat;
mod laesa;
mod linear;
mod sat;
mod vpt;

pub use bkt::Bkt;
pub use bst::Bst;
pub use dsacl::DsaclTree;
pub use ept::Ept;
pub use fqt::FqTree;
pub use gnat::Gnat;
pub use laesa::Laesa;
pub use linear::LinearScan;
pub use sat::Sat;
pub use vpt::Mvpt;
