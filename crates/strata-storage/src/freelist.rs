//! Growable list of 64-bit page/slot identifiers.
//!
//! [`LongArrayList`] supports amortized O(1) append and pop from the tail,
//! and an O(1) "first unconsumed" cursor: [`LongArrayList::move_first`]
//! logically consumes the head without shifting storage. The consumed prefix
//! stays allocated until [`LongArrayList::clear`].
//!
//! # Trusted caller contract
//!
//! `get`, `set`, `get_last` and `get_first` do not validate their index
//! against the logical window `first..size`. Callers must check `size`,
//! `first` and `is_last` themselves. An index past `size` still panics
//! through slice indexing; nothing ever reads uninitialized memory.

/// Ordered growable sequence of `i64` identifiers with a head cursor.
#[derive(Debug, Clone)]
pub struct LongArrayList {
    data: Vec<i64>,
    first: usize,
    growth: usize,
}

impl LongArrayList {
    /// Creates an empty list with room for `initial_capacity` items that
    /// grows by `growth` items whenever it is full.
    pub fn new(initial_capacity: usize, growth: usize) -> Self {
        Self {
            data: Vec::with_capacity(initial_capacity),
            first: 0,
            growth: growth.max(1),
        }
    }

    /// Number of items appended (consumed ones included).
    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Index of the first unconsumed item.
    #[inline]
    pub fn first(&self) -> usize {
        self.first
    }

    /// Appends an item at the tail.
    pub fn add(&mut self, value: i64) {
        if self.data.len() == self.data.capacity() {
            self.data.reserve_exact(self.growth);
        }
        self.data.push(value);
    }

    /// Inserts an item at the head of the unconsumed window.
    ///
    /// Shifts every unconsumed item, O(n).
    pub fn add_first(&mut self, value: i64) {
        self.data.insert(self.first, value);
    }

    /// Drops the last item. No-op on an empty list.
    pub fn remove_last(&mut self) {
        self.data.pop();
        self.first = self.first.min(self.data.len());
    }

    /// Returns the last item. Caller ensures `size() > 0`.
    #[inline]
    pub fn get_last(&self) -> i64 {
        self.data[self.data.len() - 1]
    }

    /// Returns the item at `index`. Caller ensures `index < size()`.
    #[inline]
    pub fn get(&self, index: usize) -> i64 {
        self.data[index]
    }

    /// Overwrites the item at `index`. Caller ensures `index < size()`.
    #[inline]
    pub fn set(&mut self, index: usize, value: i64) {
        self.data[index] = value;
    }

    /// Returns the first unconsumed item. Caller ensures `!is_last()`.
    #[inline]
    pub fn get_first(&self) -> i64 {
        self.data[self.first]
    }

    /// Consumes the first item. Caller ensures `!is_last()`.
    #[inline]
    pub fn move_first(&mut self) {
        debug_assert!(self.first < self.data.len(), "move_first past the last item");
        self.first += 1;
    }

    /// Empties the list and resets the head cursor, keeping the allocation.
    pub fn clear(&mut self) {
        self.data.clear();
        self.first = 0;
    }

    /// True when every item has been consumed.
    #[inline]
    pub fn is_last(&self) -> bool {
        self.first == self.data.len()
    }

    /// True when nothing has been appended since the last clear.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Iterates the unconsumed items.
    pub fn remaining(&self) -> impl Iterator<Item = i64> + '_ {
        self.data[self.first..].iter().copied()
    }
}

impl Default for LongArrayList {
    fn default() -> Self {
        Self::new(64, 64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_list() {
        let list = LongArrayList::new(4, 4);
        assert!(list.is_empty());
        assert!(list.is_last());
        assert_eq!(list.first(), 0);
        assert_eq!(list.size(), 0);
    }

    #[test]
    fn test_add_then_get_last() {
        let mut list = LongArrayList::new(1, 1);
        for value in [10, 20, 30] {
            list.add(value);
            assert_eq!(list.get_last(), value);
        }
        assert_eq!(list.size(), 3);
        assert_eq!(list.get(1), 20);
    }

    #[test]
    fn test_growth_past_initial_capacity() {
        let mut list = LongArrayList::new(2, 3);
        for i in 0..100 {
            list.add(i);
        }
        assert_eq!(list.size(), 100);
        assert_eq!(list.get(99), 99);
    }

    #[test]
    fn test_move_first_until_last() {
        let mut list = LongArrayList::new(4, 4);
        list.add(1);
        list.add(2);
        list.add(3);

        let mut consumed = Vec::new();
        // Caller-guarded: get_first/move_first only while !is_last()
        while !list.is_last() {
            consumed.push(list.get_first());
            list.move_first();
        }
        assert_eq!(consumed, vec![1, 2, 3]);
        assert_eq!(list.first(), list.size());
        assert!(!list.is_empty());
    }

    #[test]
    fn test_add_first_then_get_first() {
        let mut list = LongArrayList::new(4, 4);
        list.add(5);
        list.add(6);
        list.move_first();

        list.add_first(42);
        assert_eq!(list.get_first(), 42);
        assert_eq!(list.size(), 3);
        assert_eq!(list.remaining().collect::<Vec<_>>(), vec![42, 6]);
        // Consumed prefix is untouched
        assert_eq!(list.get(0), 5);
    }

    #[test]
    fn test_remove_last() {
        let mut list = LongArrayList::new(4, 4);
        list.remove_last();
        assert!(list.is_empty());

        list.add(1);
        list.add(2);
        list.move_first();
        list.move_first();
        list.remove_last();
        assert_eq!(list.size(), 1);
        assert_eq!(list.first(), 1);
        assert!(list.is_last());
    }

    #[test]
    fn test_set_and_clear() {
        let mut list = LongArrayList::new(4, 4);
        list.add(1);
        list.add(2);
        // Caller-guarded: index 1 < size
        list.set(1, 9);
        assert_eq!(list.get(1), 9);

        list.move_first();
        list.clear();
        assert!(list.is_empty());
        assert_eq!(list.first(), 0);
    }

    #[test]
    #[should_panic]
    fn test_get_past_size_panics() {
        let mut list = LongArrayList::new(8, 8);
        list.add(1);
        // Violates the trusted caller contract: index >= size
        let _ = list.get(1);
    }
}
