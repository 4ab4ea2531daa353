//! Bounded Top-N heap
//!
//! A capacity-bounded heap whose root holds the currently-worst retained
//! row under the ORDER BY comparator, so an arrival better than the root
//! replaces it. Draining sorts into the final ordering. NULLs sort last.

use std::cmp::Ordering;

use crate::types::{cmp_values, SortOrder, Value};

// ============================================================================
// Comparator
// ============================================================================

/// ORDER BY comparator over resolved column positions, NULL-last.
#[derive(Debug, Clone)]
pub struct RowComparator {
    terms: Vec<(usize, SortOrder)>,
}

impl RowComparator {
    pub fn new(terms: Vec<(usize, SortOrder)>) -> RowComparator {
        RowComparator { terms }
    }

    pub fn compare(&self, a: &[Value], b: &[Value]) -> Ordering {
        for &(col, order) in &self.terms {
            let (x, y) = (&a[col], &b[col]);
            let ord = match (x.is_null(), y.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => order.apply(cmp_values(x, y)),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

// ============================================================================
// Heap
// ============================================================================

/// Bounded heap of the best `n` rows seen so far.
pub struct TopN {
    capacity: usize,
    cmp: RowComparator,
    /// Max-heap under the comparator: the root is the worst retained row.
    heap: Vec<Vec<Value>>,
}

impl TopN {
    pub fn new(capacity: usize, cmp: RowComparator) -> TopN {
        TopN {
            capacity,
            cmp,
            heap: Vec::with_capacity(capacity.min(1024)),
        }
    }

    /// Retain `row` if the heap has room or the row beats the current
    /// worst; returns whether the row was kept.
    pub fn try_insert(&mut self, row: Vec<Value>) -> bool {
        if self.capacity == 0 {
            return false;
        }
        if self.heap.len() < self.capacity {
            self.heap.push(row);
            self.sift_up(self.heap.len() - 1);
            return true;
        }
        if self.cmp.compare(&row, &self.heap[0]) == Ordering::Less {
            self.heap[0] = row;
            self.sift_down(0);
            return true;
        }
        false
    }

    /// Drain into a list in the final ordering.
    pub fn extract_sorted(mut self) -> Vec<Vec<Value>> {
        let cmp = self.cmp.clone();
        self.heap.sort_by(|a, b| cmp.compare(a, b));
        self.heap
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    fn worse(&self, a: usize, b: usize) -> bool {
        self.cmp.compare(&self.heap[a], &self.heap[b]) == Ordering::Greater
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.worse(i, parent) {
                self.heap.swap(i, parent);
                i = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        loop {
            let (l, r) = (2 * i + 1, 2 * i + 2);
            let mut largest = i;
            if l < self.heap.len() && self.worse(l, largest) {
                largest = l;
            }
            if r < self.heap.len() && self.worse(r, largest) {
                largest = r;
            }
            if largest == i {
                break;
            }
            self.heap.swap(i, largest);
            i = largest;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_row(v: i64) -> Vec<Value> {
        vec![Value::Integer(v)]
    }

    fn asc() -> RowComparator {
        RowComparator::new(vec![(0, SortOrder::Asc)])
    }

    #[test]
    fn test_top_n_matches_full_sort_prefix() {
        let input = [42i64, 7, -3, 99, 0, 15, 15, -20, 8, 63];
        let mut top = TopN::new(4, asc());
        for v in input {
            top.try_insert(int_row(v));
        }
        let got: Vec<i64> = top
            .extract_sorted()
            .iter()
            .map(|r| match r[0] {
                Value::Integer(i) => i,
                _ => unreachable!(),
            })
            .collect();
        let mut all = input.to_vec();
        all.sort();
        assert_eq!(got, all[..4].to_vec());
    }

    #[test]
    fn test_desc_ordering() {
        let mut top = TopN::new(2, RowComparator::new(vec![(0, SortOrder::Desc)]));
        for v in [5, 1, 9, 3] {
            top.try_insert(int_row(v));
        }
        let got: Vec<Value> = top.extract_sorted().into_iter().map(|mut r| r.remove(0)).collect();
        assert_eq!(got, vec![Value::Integer(9), Value::Integer(5)]);
    }

    #[test]
    fn test_nulls_sort_last() {
        let mut top = TopN::new(3, asc());
        top.try_insert(vec![Value::Null]);
        top.try_insert(int_row(2));
        top.try_insert(int_row(1));
        top.try_insert(int_row(3));
        let got = top.extract_sorted();
        assert_eq!(got[0], int_row(1));
        assert_eq!(got[1], int_row(2));
        assert_eq!(got[2], int_row(3));
    }

    #[test]
    fn test_capacity_zero_retains_nothing() {
        let mut top = TopN::new(0, asc());
        assert!(!top.try_insert(int_row(1)));
        assert!(top.extract_sorted().is_empty());
    }

    #[test]
    fn test_multi_column_tiebreak() {
        let cmp = RowComparator::new(vec![(0, SortOrder::Asc), (1, SortOrder::Desc)]);
        let mut top = TopN::new(3, cmp);
        for (a, b) in [(1, 10), (1, 20), (0, 5)] {
            top.try_insert(vec![Value::Integer(a), Value::Integer(b)]);
        }
        let got = top.extract_sorted();
        assert_eq!(got[0], vec![Value::Integer(0), Value::Integer(5)]);
        assert_eq!(got[1], vec![Value::Integer(1), Value::Integer(20)]);
        assert_eq!(got[2], vec![Value::Integer(1), Value::Integer(10)]);
    }
}
