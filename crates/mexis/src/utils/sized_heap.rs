//! A max heap of an optionally bounded size.

use std::collections::BinaryHeap;

use super::MinItem;

/// A helper struct for maintaining the `k` smallest items seen so far.
///
/// Internally a max heap: the current worst item is on top and is evicted
/// when a better one arrives. Ties on the ordering value fall back to the
/// associated data, so eviction order is deterministic.
#[derive(Debug)]
pub struct SizedHeap<A: Ord, T: PartialOrd> {
    /// The heap of items.
    heap: BinaryHeap<MinItem<A, T>>,
    /// The maximum size of the heap.
    k: usize,
}

impl<A: Ord, T: PartialOrd> SizedHeap<A, T> {
    /// Creates a new `SizedHeap`, unbounded when `k` is `None`.
    #[must_use]
    pub fn new(k: Option<usize>) -> Self {
        k.map_or_else(
            || Self {
                heap: BinaryHeap::new(),
                k: usize::MAX,
            },
            |k| Self {
                heap: BinaryHeap::with_capacity(k.saturating_add(1)),
                k,
            },
        )
    }

    /// Pushes an item onto the heap, maintaining the max size.
    pub fn push(&mut self, (a, item): (A, T)) {
        if self.k == 0 {
            return;
        }
        if self.heap.len() < self.k {
            self.heap.push(MinItem(a, item));
        } else if let Some(top) = self.heap.peek() {
            if MinItem(&a, &item) < MinItem(&top.0, &top.1) {
                self.heap.pop();
                self.heap.push(MinItem(a, item));
            }
        }
    }

    /// Pushes several items onto the heap, maintaining the max size.
    pub fn extend<I: IntoIterator<Item = (A, T)>>(&mut self, items: I) {
        for (a, item) in items {
            self.push((a, item));
        }
    }

    /// Peeks at the worst item currently in the heap.
    #[must_use]
    pub fn peek(&self) -> Option<(&A, &T)> {
        self.heap.peek().map(|MinItem(a, x)| (a, x))
    }

    /// Pops the worst item from the heap.
    pub fn pop(&mut self) -> Option<(A, T)> {
        self.heap.pop().map(|MinItem(a, x)| (a, x))
    }

    /// Consumes the heap and returns the items sorted best-first.
    #[must_use]
    pub fn into_sorted(self) -> Vec<(A, T)> {
        // `into_sorted_vec` is ascending in `(value, data)`, which is exactly
        // best-first order.
        self.heap.into_sorted_vec().into_iter().map(|MinItem(a, x)| (a, x)).collect()
    }

    /// The number of items currently in the heap.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns whether the heap is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Returns whether the heap has reached its bound.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.k
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_the_k_smallest() {
        let mut heap = SizedHeap::new(Some(3));
        heap.extend([(0, 5.0), (1, 1.0), (2, 4.0), (3, 2.0), (4, 3.0)]);

        assert!(heap.is_full());
        assert_eq!(heap.into_sorted(), vec![(1, 1.0), (3, 2.0), (4, 3.0)]);
    }

    #[test]
    fn ties_evict_the_larger_id() {
        let mut heap = SizedHeap::new(Some(2));
        heap.extend([(7, 1.0), (3, 1.0), (5, 1.0)]);

        assert_eq!(heap.into_sorted(), vec![(3, 1.0), (5, 1.0)]);
    }

    #[test]
    fn zero_bound_stays_empty() {
        let mut heap = SizedHeap::new(Some(0));
        heap.push((0, 1.0));
        assert!(heap.is_empty());
        assert!(heap.is_full());
    }
}
