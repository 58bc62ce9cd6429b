//! Binary min-heap with a fallible comparator.

use std::cmp::Ordering;

use crate::error::Result;

/// Array-backed binary min-heap.
///
/// The root is always the comparator minimum. Items that compare equal pop in
/// insertion order. Comparator errors abort the operation and are returned to the
/// caller; the heap is left in a valid but unspecified order.
pub struct MinHeap<T, C> {
    items: Vec<(u64, T)>,
    next_seq: u64,
    compare: C,
}

impl<T, C> MinHeap<T, C>
where
    C: FnMut(&T, &T) -> Result<Ordering>,
{
    pub fn new(compare: C) -> Self {
        Self::with_capacity(0, compare)
    }

    pub fn with_capacity(capacity: usize, compare: C) -> Self {
        MinHeap {
            items: Vec::with_capacity(capacity),
            next_seq: 0,
            compare,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn peek(&self) -> Option<&T> {
        self.items.first().map(|(_, item)| item)
    }

    pub fn push(&mut self, item: T) -> Result<()> {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.items.push((seq, item));
        self.sift_up(self.items.len() - 1)
    }

    pub fn pop(&mut self) -> Result<Option<T>> {
        if self.items.is_empty() {
            return Ok(None);
        }
        let last = self.items.len() - 1;
        self.items.swap(0, last);
        let top = self.items.pop().map(|(_, item)| item);
        if !self.items.is_empty() {
            self.sift_down(0)?;
        }
        Ok(top)
    }

    fn less(&mut self, i: usize, j: usize) -> Result<bool> {
        let (seq_i, a) = &self.items[i];
        let (seq_j, b) = &self.items[j];
        Ok(match (self.compare)(a, b)? {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => seq_i < seq_j,
        })
    }

    fn sift_up(&mut self, mut index: usize) -> Result<()> {
        while index > 0 {
            let parent = (index - 1) / 2;
            if !self.less(index, parent)? {
                break;
            }
            self.items.swap(index, parent);
            index = parent;
        }
        Ok(())
    }

    fn sift_down(&mut self, mut index: usize) -> Result<()> {
        let len = self.items.len();
        loop {
            let left = index * 2 + 1;
            let right = left + 1;
            let mut smallest = index;
            if left < len && self.less(left, smallest)? {
                smallest = left;
            }
            if right < len && self.less(right, smallest)? {
                smallest = right;
            }
            if smallest == index {
                return Ok(());
            }
            self.items.swap(index, smallest);
            index = smallest;
        }
    }
}
