use std::collections::VecDeque;

use crate::error::{Error, Result};

/// Fixed capacity FIFO holding the most recent frames.
///
/// Pushing onto a full buffer drops the oldest element first.
#[derive(Debug, Clone)]
pub struct DataBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> DataBuffer<T> {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::Config("data buffer capacity must be positive".to_string()));
        }
        Ok(Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        })
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
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

    pub fn newest(&self) -> Option<&T> {
        self.items.back()
    }

    pub fn newest_mut(&mut self) -> Option<&mut T> {
        self.items.back_mut()
    }

    /// The element pushed right before the newest one
    pub fn previous(&self) -> Option<&T> {
        self.items.len().checked_sub(2).and_then(|i| self.items.get(i))
    }

    /// Previous and newest element, once two are buffered
    pub fn previous_and_newest_mut(&mut self) -> Option<(&T, &mut T)> {
        let len = self.items.len();
        if len < 2 {
            return None;
        }
        let mut tail = self.items.range_mut(len - 2..);
        let previous = tail.next()?;
        let newest = tail.next()?;
        Some((&*previous, newest))
    }

    /// Oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(DataBuffer::<u8>::new(0).is_err());
    }

    #[test]
    fn never_exceeds_capacity_and_evicts_oldest() {
        let mut buffer = DataBuffer::new(2).unwrap();
        assert!(buffer.is_empty());
        assert_eq!(buffer.previous(), None);

        for i in 0..5 {
            buffer.push(i);
            assert!(buffer.len() <= buffer.capacity());
            assert_eq!(buffer.newest(), Some(&i));
        }
        assert_eq!(buffer.iter().copied().collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(buffer.previous(), Some(&3));
    }

    #[test]
    fn previous_and_newest_are_split_borrows() {
        let mut buffer = DataBuffer::new(3).unwrap();
        buffer.push(String::from("a"));
        assert!(buffer.previous_and_newest_mut().is_none());

        buffer.push(String::from("b"));
        buffer.push(String::from("c"));
        let (previous, newest) = buffer.previous_and_newest_mut().unwrap();
        newest.push_str(previous);
        assert_eq!(buffer.newest().map(String::as_str), Some("cb"));
        assert_eq!(buffer.iter().count(), 3);
    }
}
