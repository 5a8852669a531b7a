use std::collections::VecDeque;

/// FIFO buffer that evicts its oldest entry once `capacity` is reached.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundedHistory<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedHistory<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(64)),
            capacity: capacity.max(1),
        }
    }

    /// Appends `item`, returning the entry evicted to make room.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() >= self.capacity {
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

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn last(&self) -> Option<&T> {
        self.items.back()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter()
    }
}

impl<T: Clone> BoundedHistory<T> {
    /// The newest `limit` entries, oldest first. `0` returns everything.
    pub fn latest(&self, limit: usize) -> Vec<T> {
        let skip = match limit {
            0 => 0,
            n => self.items.len().saturating_sub(n),
        };
        self.items.iter().skip(skip).cloned().collect()
    }
}
