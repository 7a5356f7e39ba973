//! Distance functions for the metric spaces supported by this crate.
//!
//! All functions here satisfy non-negativity, identity, symmetry, and the
//! triangle inequality. Every index in this crate relies on those properties
//! for pruning, so a metric that violates them breaks all indexes.

mod levenshtein;
mod lp_norms;

pub use levenshtein::levenshtein;
pub use lp_norms::{chebyshev, euclidean, manhattan, minkowski5};

/// The Minkowski norms selectable for vector datasets.
///
/// The numeric code follows the dataset file headers: `1` is L1, `2` is L2,
/// `5` is L5, and any other value is L-infinity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Lp {
    /// Manhattan distance.
    L1,
    /// Euclidean distance.
    L2,
    /// Minkowski distance with exponent 5.
    L5,
    /// Chebyshev distance.
    LInf,
}

impl Lp {
    /// Maps a numeric metric code from a dataset header to a norm.
    #[must_use]
    pub const fn from_code(p: i64) -> Self {
        match p {
            1 => Self::L1,
            2 => Self::L2,
            5 => Self::L5,
            _ => Self::LInf,
        }
    }

    /// The numeric code of this norm, as written in dataset headers.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::L1 => 1,
            Self::L2 => 2,
            Self::L5 => 5,
            Self::LInf => 0,
        }
    }

    /// Evaluates this norm on a pair of equal-length vectors.
    #[must_use]
    pub fn eval(self, x: &[f64], y: &[f64]) -> f64 {
        match self {
            Self::L1 => manhattan(x, y),
            Self::L2 => euclidean(x, y),
            Self::L5 => minkowski5(x, y),
            Self::LInf => chebyshev(x, y),
        }
    }
}

impl core::fmt::Display for Lp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::L1 => write!(f, "L1"),
            Self::L2 => write!(f, "L2"),
            Self::L5 => write!(f, "L5"),
            Self::LInf => write!(f, "Linf"),
        }
    }
}
