//! First-fit fixed-capacity tables
//!
//! Used for the socket descriptor table, the DNS request table and the
//! multicast membership table. Allocation takes the lowest free index,
//! freeing clears the slot; capacity never changes after creation.

/// A fixed number of optional slots indexed by small integers.
#[derive(Debug, Clone)]
pub struct Arena<T> {
    slots: Vec<Option<T>>,
    len: usize,
}

impl<T> Arena<T> {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots, len: 0 }
    }

    /// Store `value` in the first free slot. Gives the value back when full.
    pub fn alloc(&mut self, value: T) -> Result<usize, T> {
        match self.slots.iter().position(Option::is_none) {
            Some(index) => {
                self.slots[index] = Some(value);
                self.len += 1;
                Ok(index)
            }
            None => Err(value),
        }
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    #[inline]
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    /// Clear a slot, returning what it held.
    pub fn free(&mut self, index: usize) -> Option<T> {
        let taken = self.slots.get_mut(index).and_then(Option::take);
        if taken.is_some() {
            self.len -= 1;
        }
        taken
    }

    /// Index of the first occupied slot matching `pred`.
    pub fn position<F>(&self, mut pred: F) -> Option<usize>
    where
        F: FnMut(&T) -> bool,
    {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().map_or(false, &mut pred))
    }

    /// Free every occupied slot matching `pred`, returning the values.
    pub fn drain_filter<F>(&mut self, mut pred: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut out = Vec::new();
        for slot in self.slots.iter_mut() {
            if slot.as_ref().map_or(false, &mut pred) {
                if let Some(value) = slot.take() {
                    out.push(value);
                }
            }
        }
        self.len -= out.len();
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|v| (i, v)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_mut().map(|v| (i, v)))
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_fit() {
        let mut arena = Arena::new(4);
        assert_eq!(arena.alloc("a"), Ok(0));
        assert_eq!(arena.alloc("b"), Ok(1));
        assert_eq!(arena.alloc("c"), Ok(2));
        assert_eq!(arena.free(1), Some("b"));
        // lowest hole is reused, not the end
        assert_eq!(arena.alloc("d"), Ok(1));
        assert_eq!(arena.len(), 3);
    }

    #[test]
    fn test_full_returns_value() {
        let mut arena = Arena::new(1);
        arena.alloc(10).unwrap();
        assert!(arena.is_full());
        assert_eq!(arena.alloc(11), Err(11));
    }

    #[test]
    fn test_drain_filter_and_position() {
        let mut arena = Arena::new(5);
        for v in [1, 2, 3, 4, 5] {
            arena.alloc(v).unwrap();
        }
        assert_eq!(arena.position(|v| *v == 4), Some(3));
        let evens = arena.drain_filter(|v| v % 2 == 0);
        assert_eq!(evens, vec![2, 4]);
        assert_eq!(arena.len(), 3);
        assert!(arena.get(1).is_none());
        assert_eq!(arena.iter().map(|(_, v)| *v).collect::<Vec<_>>(), vec![1, 3, 5]);
    }

    #[test]
    fn test_out_of_range() {
        let mut arena: Arena<u8> = Arena::new(2);
        assert!(arena.get(7).is_none());
        assert!(arena.free(7).is_none());
    }
}
