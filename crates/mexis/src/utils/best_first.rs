//! The best-first k-NN traversal skeleton shared by every index.
//!
//! All k-NN algorithms in this crate follow the same shape: a min heap of
//! subtree candidates keyed by a lower bound on the distance from the query
//! to anything in the subtree, and a bounded max heap of the k best answers
//! whose worst distance is the pruning radius tau. Each index supplies only
//! the frontier seeding and the subtree expansion.

use std::collections::BinaryHeap;

use crate::dataset::ObjId;

use super::{MaxItem, SizedHeap};

/// The frontier of a best-first traversal: subtrees keyed by lower bound,
/// popped in ascending order.
pub(crate) type Frontier<N> = BinaryHeap<MaxItem<N, f64>>;

/// The bounded heap of the k best answers found so far.
pub(crate) struct KnnHeap {
    /// The k best `(id, distance)` answers.
    hits: SizedHeap<ObjId, f64>,
}

impl KnnHeap {
    /// Creates a heap bounded at `k` answers.
    #[must_use]
    pub fn new(k: usize) -> Self {
        Self {
            hits: SizedHeap::new(Some(k)),
        }
    }

    /// Offers one candidate answer.
    pub fn offer(&mut self, id: ObjId, d: f64) {
        self.hits.push((id, d));
    }

    /// The pruning radius: the current worst answer distance, or infinity
    /// while fewer than k answers have been found.
    #[must_use]
    pub fn tau(&self) -> f64 {
        if self.hits.is_full() {
            self.hits.peek().map_or(f64::INFINITY, |(_, &d)| d)
        } else {
            f64::INFINITY
        }
    }

    /// Returns whether k answers have been found.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.hits.is_full()
    }

    /// The answers sorted by ascending distance, ties by ascending id.
    #[must_use]
    pub fn into_sorted(self) -> Vec<(ObjId, f64)> {
        self.hits.into_sorted()
    }
}

/// A source of subtrees for the best-first traversal.
pub(crate) trait KnnSource {
    /// An opaque handle to one subtree in the frontier.
    type Node: Copy + Ord;

    /// Seeds the frontier with the root subtree(s) and offers any answers
    /// that fall out of doing so (for instance, routing objects).
    fn roots(&mut self, query: ObjId, frontier: &mut Frontier<Self::Node>, hits: &mut KnnHeap) -> Result<(), String>;

    /// Expands one subtree: offers candidate answers and pushes surviving
    /// children onto the frontier with their lower bounds.
    fn expand(
        &mut self,
        node: Self::Node,
        query: ObjId,
        frontier: &mut Frontier<Self::Node>,
        hits: &mut KnnHeap,
    ) -> Result<(), String>;
}

/// Runs a best-first k-NN search over `source`.
///
/// Subtrees are expanded in ascending lower-bound order; once k answers are
/// known, a subtree whose lower bound exceeds tau is discarded without
/// expansion, and no true k-nearest answer is ever lost because its subtree's
/// lower bound cannot exceed its own distance.
///
/// # Errors
///
/// Propagates any error from the source (I/O for secondary-memory indexes).
pub(crate) fn best_first_knn<S: KnnSource>(source: &mut S, query: ObjId, k: usize) -> Result<Vec<(ObjId, f64)>, String> {
    let mut hits = KnnHeap::new(k);
    if k == 0 {
        return Ok(Vec::new());
    }

    let mut frontier = Frontier::new();
    source.roots(query, &mut frontier, &mut hits)?;

    while let Some(MaxItem(node, lb)) = frontier.pop() {
        if hits.is_full() && lb > hits.tau() {
            break;
        }
        source.expand(node, query, &mut frontier, &mut hits)?;
    }

    Ok(hits.into_sorted())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A flat list of points behind the `KnnSource` interface: one frontier
    /// node per point, lower bound equal to the true distance.
    struct FlatSource {
        /// The distance of each point from the (implicit) query.
        points: Vec<f64>,
    }

    impl KnnSource for FlatSource {
        type Node = usize;

        fn roots(&mut self, _: ObjId, frontier: &mut Frontier<usize>, _: &mut KnnHeap) -> Result<(), String> {
            for (i, &d) in self.points.iter().enumerate() {
                frontier.push(MaxItem(i, d));
            }
            Ok(())
        }

        fn expand(&mut self, node: usize, _: ObjId, _: &mut Frontier<usize>, hits: &mut KnnHeap) -> Result<(), String> {
            hits.offer(node, self.points[node]);
            Ok(())
        }
    }

    #[test]
    fn finds_the_k_nearest_in_order() -> Result<(), String> {
        let mut source = FlatSource {
            points: vec![3.0, 1.0, 4.0, 1.0, 5.0, 0.5],
        };
        let hits = best_first_knn(&mut source, 0, 3)?;
        assert_eq!(hits, vec![(5, 0.5), (1, 1.0), (3, 1.0)]);
        Ok(())
    }

    #[test]
    fn zero_k_is_empty() -> Result<(), String> {
        let mut source = FlatSource { points: vec![1.0] };
        assert!(best_first_knn(&mut source, 0, 0)?.is_empty());
        Ok(())
    }
}
