//! Bounded circular queue.
//!
//! All pipeline queues (rasterized stamps, tested stamps, shader inputs,
//! setup FIFO, ...) are instances of [`RingQueue`]. The queue keeps the
//! `len() + free() == capacity()` invariant by construction; pushing into a
//! full queue is a flow-control bug and panics.

#[derive(Debug, Clone)]
pub struct RingQueue<T> {
    name: &'static str,
    slots: Vec<Option<T>>,
    head: usize,
    tail: usize,
    count: usize,
}

impl<T> RingQueue<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        assert!(capacity > 0, "queue {name}: capacity must be non-zero");
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            name,
            slots,
            head: 0,
            tail: 0,
            count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn free(&self) -> usize {
        self.capacity() - self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.capacity()
    }

    /// Append at the tail.
    ///
    /// # Panics
    /// If the queue is full.
    pub fn push(&mut self, item: T) {
        if self.try_push(item).is_err() {
            panic!(
                "queue {}: push into full queue (capacity {})",
                self.name,
                self.capacity()
            );
        }
    }

    /// Append at the tail, handing the item back when full.
    pub fn try_push(&mut self, item: T) -> Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        self.slots[self.tail] = Some(item);
        self.tail = (self.tail + 1) % self.capacity();
        self.count += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let item = self.slots[self.head].take();
        self.head = (self.head + 1) % self.capacity();
        self.count -= 1;
        item
    }

    pub fn front(&self) -> Option<&T> {
        if self.is_empty() {
            None
        } else {
            self.slots[self.head].as_ref()
        }
    }

    pub fn front_mut(&mut self) -> Option<&mut T> {
        if self.is_empty() {
            None
        } else {
            self.slots[self.head].as_mut()
        }
    }

    /// Iterate from head to tail.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.count).filter_map(move |i| self.slots[(self.head + i) % self.capacity()].as_ref())
    }

    /// Empty the queue without reallocating.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.head = 0;
        self.tail = 0;
        self.count = 0;
    }
}
