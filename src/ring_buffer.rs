//! Fixed-capacity ring of the most recently ingested records.
//!
//! Introspection state only: nothing on the write path reads it.

/// Overwrite-oldest ring buffer.
///
/// Storage is allocated once in [`RingBuffer::new`]; inserting never
/// reallocates.
#[derive(Debug)]
pub struct RingBuffer<T> {
    slots: Vec<Option<T>>,
    /// Index the next insert writes to.
    head: usize,
    len: usize,
}

impl<T> RingBuffer<T> {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be positive");
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            head: 0,
            len: 0,
        }
    }

    /// Inserts `item`, returning the oldest item if it had to be evicted.
    pub fn insert(&mut self, item: T) -> Option<T> {
        let evicted = self.slots[self.head].replace(item);
        self.head = (self.head + 1) % self.slots.len();
        if evicted.is_none() {
            self.len += 1;
        }
        evicted
    }

    /// Up to `n` items, most recent first.
    pub fn recent(&self, n: usize) -> Vec<T>
    where
        T: Clone,
    {
        self.iter_recent().take(n).cloned().collect()
    }

    /// Iterates from the most recent item to the oldest.
    pub fn iter_recent(&self) -> impl Iterator<Item = &T> + '_ {
        let capacity = self.slots.len();
        (1..=self.len).filter_map(move |offset| {
            let index = (self.head + capacity - offset) % capacity;
            self.slots[index].as_ref()
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
