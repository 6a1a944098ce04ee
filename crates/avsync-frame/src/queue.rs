//! Bounded FIFO of pending frames.

use std::collections::VecDeque;

use crate::{FrameError, FrameResult};

/// Fixed-capacity FIFO with peek-by-offset.
///
/// The session wraps it in its own lock, so the queue itself is a plain
/// single-threaded container.
#[derive(Debug)]
pub struct FrameQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> FrameQueue<T> {
    /// Creates an empty queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> FrameResult<Self> {
        if capacity == 0 {
            return Err(FrameError::InvalidCapacity(capacity));
        }
        Ok(Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        })
    }

    /// Append at the tail. Hands the item back when full.
    pub fn push(&mut self, item: T) -> Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        self.items.push_back(item);
        Ok(())
    }

    /// The `offset`-th oldest item, without removing it.
    pub fn peek(&self, offset: usize) -> Option<&T> {
        self.items.get(offset)
    }

    pub fn peek_mut(&mut self, offset: usize) -> Option<&mut T> {
        self.items.get_mut(offset)
    }

    /// Most recently pushed item.
    pub fn back(&self) -> Option<&T> {
        self.items.back()
    }

    /// Remove the oldest item.
    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Remove the most recently pushed item.
    pub fn pop_back(&mut self) -> Option<T> {
        self.items.pop_back()
    }

    /// Remove everything, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.items.drain(..)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            FrameQueue::<u32>::new(0),
            Err(FrameError::InvalidCapacity(0))
        ));
    }

    #[test]
    fn test_full_queue_hands_item_back() {
        let mut q = FrameQueue::new(2).unwrap();
        q.push(1).unwrap();
        q.push(2).unwrap();
        assert_eq!(q.push(3), Err(3));
        assert_eq!(q.len(), 2);
        assert_eq!(q.peek(0), Some(&1));
        assert_eq!(q.peek(1), Some(&2));
        assert_eq!(q.peek(2), None);
    }

    #[test]
    fn test_full_capacity_usable() {
        let mut q = FrameQueue::new(crate::MAX_FRAME_NUM).unwrap();
        for i in 0..crate::MAX_FRAME_NUM {
            q.push(i).unwrap();
        }
        assert!(q.is_full());
        assert_eq!(q.drain().collect::<Vec<_>>(), (0..crate::MAX_FRAME_NUM).collect::<Vec<_>>());
        assert!(q.is_empty());
    }

    #[test]
    fn test_pop_back_removes_newest() {
        let mut q = FrameQueue::new(4).unwrap();
        q.push(10).unwrap();
        q.push(20).unwrap();
        assert_eq!(q.pop_back(), Some(20));
        assert_eq!(q.back(), Some(&10));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Push(u32),
        Pop,
        Peek(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<u32>().prop_map(Op::Push),
            Just(Op::Pop),
            (0usize..10).prop_map(Op::Peek),
        ]
    }

    proptest! {
        #[test]
        fn test_matches_model(ops in proptest::collection::vec(op(), 0..200)) {
            let mut q = FrameQueue::new(8).unwrap();
            let mut model = std::collections::VecDeque::new();
            for op in ops {
                match op {
                    Op::Push(v) => {
                        let res = q.push(v);
                        if model.len() < 8 {
                            prop_assert!(res.is_ok());
                            model.push_back(v);
                        } else {
                            prop_assert_eq!(res, Err(v));
                        }
                    }
                    Op::Pop => prop_assert_eq!(q.pop(), model.pop_front()),
                    Op::Peek(k) => prop_assert_eq!(q.peek(k), model.get(k)),
                }
                prop_assert_eq!(q.len(), model.len());
            }
        }
    }
}
