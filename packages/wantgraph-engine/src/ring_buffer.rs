use std::collections::VecDeque;

/// Fixed-capacity FIFO that drops the oldest item when full
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    /// The newest `limit` items, oldest first. `limit == 0` means all.
    pub fn snapshot(&self, limit: usize) -> Vec<T> {
        let skip = if limit == 0 || limit >= self.items.len() {
            0
        } else {
            self.items.len() - limit
        };
        self.items.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_snapshot_limit() {
        let mut ring = RingBuffer::new(3);
        for i in 0..5 {
            ring.push(i);
        }
        assert_eq!(ring.snapshot(0), vec![2, 3, 4]);
        assert_eq!(ring.snapshot(2), vec![3, 4]);
        assert_eq!(ring.snapshot(10), vec![2, 3, 4]);
        ring.clear();
        assert!(ring.is_empty());
    }

    proptest! {
        #[test]
        fn prop_keeps_newest_items(capacity in 1usize..32, pushes in 0usize..100) {
            let mut ring = RingBuffer::new(capacity);
            for i in 0..pushes {
                ring.push(i);
            }
            let kept = ring.snapshot(0);
            prop_assert_eq!(kept.len(), pushes.min(capacity));
            let expected: Vec<usize> = (pushes.saturating_sub(capacity)..pushes).collect();
            prop_assert_eq!(kept, expected);
        }
    }
}
