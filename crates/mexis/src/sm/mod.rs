//! Secondary-memory indexes and their storage primitives.
//!
//! These indexes persist to page-addressable binary files and count logical
//! 4 KB page reads and writes alongside distance evaluations. Every index
//! here can be rebuilt from its files alone: build once, reopen in a fresh
//! process, and query with bitwise-identical results.

mod cpt;
mod dindex;
mod egnat;
mod lc;
mod mbpt;
mod mindex;
mod mtree;
mod omni;
mod paged;
mod pmtree;
mod raf;
mod spb;

pub use cpt::Cpt;
pub use dindex::DIndex;
pub use egnat::Egnat;
pub use lc::ListOfClusters;
pub use mbpt::MbPlusTree;
pub use mindex::MIndex;
pub use mtree::MTree;
pub use omni::OmniRTree;
pub use paged::NodeFile;
pub use pmtree::PmTree;
pub use raf::Raf;
pub use spb::SpbTree;
