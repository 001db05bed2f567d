//! Fixed-capacity rolling buffer of encoded frames.

use std::collections::VecDeque;

/// Ring buffer that evicts its oldest item when full.
///
/// Items are kept in capture order, oldest first.
#[derive(Debug, Clone)]
pub struct RollingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RollingBuffer<T> {
    /// Create an empty buffer.  A zero capacity is rounded up to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        RollingBuffer {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `item`, returning the evicted oldest item if the buffer was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() == self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
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

    /// Oldest first.
    #[allow(dead_code)]
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter()
    }

    /// Most recently captured first.
    pub fn iter_newest_first(&self) -> impl Iterator<Item = &T> + ExactSizeIterator {
        self.items.iter().rev()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}
