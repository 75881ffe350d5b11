use std::collections::VecDeque;

/// Ordered in-memory history with an optional length cap.
///
/// `push_back` keeps arrival order (oldest first) and evicts from the front;
/// `push_front` keeps newest-first order and evicts from the back. Either
/// way the oldest entry is the one dropped once the cap is exceeded.
#[derive(Debug, Clone)]
pub struct BoundedLog<T> {
    entries: VecDeque<T>,
    capacity: Option<usize>,
}

impl<T> BoundedLog<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: Some(capacity),
        }
    }

    pub fn unbounded() -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: None,
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn push_back(&mut self, entry: T) {
        self.entries.push_back(entry);
        if let Some(capacity) = self.capacity {
            while self.entries.len() > capacity {
                self.entries.pop_front();
            }
        }
    }

    pub fn push_front(&mut self, entry: T) {
        self.entries.push_front(entry);
        if let Some(capacity) = self.capacity {
            self.entries.truncate(capacity);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.entries.iter()
    }

    pub fn front(&self) -> Option<&T> {
        self.entries.front()
    }

    pub fn back(&self) -> Option<&T> {
        self.entries.back()
    }

    pub fn back_mut(&mut self) -> Option<&mut T> {
        self.entries.back_mut()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<T: Clone> BoundedLog<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }
}
