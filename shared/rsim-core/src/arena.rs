//! Slab storage for records that sit in several queues over their lifetime.
//!
//! Boxes keep their stamps by value in an [`Arena`] and move small
//! [`Handle`]s between their internal ring buffers instead of the records
//! themselves.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u32);

impl Handle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
pub struct Arena<T> {
    name: &'static str,
    slots: Vec<Option<T>>,
    free: Vec<u32>,
}

impl<T> Arena<T> {
    /// Arena with room for `capacity` live records.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        let free = (0..capacity as u32).rev().collect();
        Self { name, slots, free }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn live(&self) -> usize {
        self.capacity() - self.free.len()
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Store a record.
    ///
    /// # Panics
    /// If the arena is exhausted.
    pub fn insert(&mut self, value: T) -> Handle {
        let Some(idx) = self.free.pop() else {
            panic!("arena {}: no free records (capacity {})", self.name, self.capacity());
        };
        self.slots[idx as usize] = Some(value);
        Handle(idx)
    }

    pub fn get(&self, h: Handle) -> &T {
        match self.slots.get(h.index()).and_then(Option::as_ref) {
            Some(v) => v,
            None => panic!("arena {}: dangling handle {}", self.name, h.0),
        }
    }

    pub fn get_mut(&mut self, h: Handle) -> &mut T {
        let name = self.name;
        match self.slots.get_mut(h.index()).and_then(Option::as_mut) {
            Some(v) => v,
            None => panic!("arena {name}: dangling handle {}", h.0),
        }
    }

    /// Release a record and return it.
    pub fn remove(&mut self, h: Handle) -> T {
        match self.slots.get_mut(h.index()).and_then(Option::take) {
            Some(v) => {
                self.free.push(h.0);
                v
            }
            None => panic!("arena {}: double free of handle {}", self.name, h.0),
        }
    }

    pub fn clear(&mut self) {
        for s in &mut self.slots {
            *s = None;
        }
        self.free = (0..self.slots.len() as u32).rev().collect();
    }
}
