//! Shared helpers: ordered heap items, the bounded answer heap, and the
//! best-first k-NN traversal skeleton used by every index.

mod best_first;
mod ord_items;
mod sized_heap;

pub use ord_items::{MaxItem, MinItem};
pub use sized_heap::SizedHeap;

pub(crate) use best_first::{best_first_knn, Frontier, KnnHeap, KnnSource};

/// Sorts `(id, distance)` pairs by ascending distance, breaking ties by
/// ascending id.
pub(crate) fn sort_hits(hits: &mut [(usize, f64)]) {
    hits.sort_by(|&(i, a), &(j, b)| a.partial_cmp(&b).unwrap_or(core::cmp::Ordering::Equal).then(i.cmp(&j)));
}

/// The pruning radius of a bounded answer heap: the worst kept distance once
/// the heap is full, infinity before that.
pub(crate) fn tau_of(heap: &SizedHeap<usize, f64>) -> f64 {
    if heap.is_full() {
        heap.peek().map_or(f64::INFINITY, |(_, &d)| d)
    } else {
        f64::INFINITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_hits_orders_by_distance_then_id() {
        let mut hits = vec![(4, 1.0), (2, 0.5), (3, 1.0), (1, 1.0)];
        sort_hits(&mut hits);
        assert_eq!(hits, vec![(2, 0.5), (1, 1.0), (3, 1.0), (4, 1.0)]);
    }
}
