//! Reorder buffer: out-of-order completion, in-order commit.
//!
//! Work dispatched to the unified shader may come back in any order. Each
//! dispatched item first reserves a [`Slot`] at the tail with its value;
//! the shader's answer completes that slot, optionally replacing the value;
//! commits only ever happen from the head, and only while the head slot is
//! completed. Every slot holds a value, so [`ReorderBuffer::pop_ready`]
//! returning `None` always means the head is not ready. Used for shaded fragments,
//! vertices and setup triangles alike.

#[derive(Debug, Clone)]
struct Entry<T> {
    sequence: u64,
    value: T,
    done: bool,
}

/// Reservation handle returned by [`ReorderBuffer::reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot {
    pub index: usize,
    pub sequence: u64,
}

#[derive(Debug, Clone)]
pub struct ReorderBuffer<T> {
    name: &'static str,
    entries: Vec<Option<Entry<T>>>,
    head: usize,
    count: usize,
    next_sequence: u64,
}

impl<T> ReorderBuffer<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        assert!(capacity > 0, "reorder buffer {name}: capacity must be non-zero");
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, || None);
        Self {
            name,
            entries,
            head: 0,
            count: 0,
            next_sequence: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
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

    /// Reserve the next slot in submission order, carrying a value that the
    /// completion may later replace.
    ///
    /// # Panics
    /// If the buffer is full.
    pub fn reserve(&mut self, value: T) -> Slot {
        if self.is_full() {
            panic!("reorder buffer {}: reserve on full buffer", self.name);
        }
        let index = (self.head + self.count) % self.capacity();
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries[index] = Some(Entry {
            sequence,
            value,
            done: false,
        });
        self.count += 1;
        Slot { index, sequence }
    }

    /// Mark a reserved slot completed. `value` replaces the stored value when
    /// present.
    ///
    /// # Panics
    /// If the slot is not currently reserved or was already completed.
    pub fn complete(&mut self, slot: Slot, value: Option<T>) {
        let name = self.name;
        match self.entries.get_mut(slot.index).and_then(Option::as_mut) {
            Some(entry) if entry.sequence == slot.sequence && !entry.done => {
                entry.done = true;
                if let Some(v) = value {
                    entry.value = v;
                }
            }
            _ => panic!(
                "reorder buffer {name}: completion for slot {} (sequence {}) that is not outstanding",
                slot.index, slot.sequence
            ),
        }
    }

    /// True when the oldest entry is completed and may be committed.
    pub fn head_ready(&self) -> bool {
        self.count > 0
            && self.entries[self.head]
                .as_ref()
                .map(|e| e.done)
                .unwrap_or(false)
    }

    pub fn head(&self) -> Option<&T> {
        if self.count == 0 {
            return None;
        }
        self.entries[self.head].as_ref().map(|e| &e.value)
    }

    /// Commit the head entry if it is completed; `None` while it is not.
    pub fn pop_ready(&mut self) -> Option<T> {
        if !self.head_ready() {
            return None;
        }
        let entry = self.entries[self.head].take();
        self.head = (self.head + 1) % self.capacity();
        self.count -= 1;
        entry.map(|e| e.value)
    }

    /// Value stored in an outstanding slot.
    pub fn get(&self, slot: Slot) -> Option<&T> {
        self.entries
            .get(slot.index)
            .and_then(Option::as_ref)
            .filter(|e| e.sequence == slot.sequence)
            .map(|e| &e.value)
    }

    /// Number of entries reserved but not yet completed.
    pub fn outstanding(&self) -> usize {
        self.entries
            .iter()
            .flatten()
            .filter(|e| !e.done)
            .count()
    }

    pub fn clear(&mut self) {
        for e in &mut self.entries {
            *e = None;
        }
        self.head = 0;
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn head_blocks_later_completions() {
        let mut rob = ReorderBuffer::new("rob", 4);
        let a = rob.reserve('a');
        let b = rob.reserve('b');
        rob.complete(b, None);
        assert!(!rob.head_ready());
        assert_eq!(rob.pop_ready(), None);
        rob.complete(a, None);
        assert_eq!(rob.pop_ready(), Some('a'));
        assert_eq!(rob.pop_ready(), Some('b'));
        assert!(rob.is_empty());
    }

    #[test]
    fn completion_value_replaces_reserved_value() {
        let mut rob = ReorderBuffer::new("rob", 2);
        let s = rob.reserve(1);
        rob.complete(s, Some(10));
        assert_eq!(rob.pop_ready(), Some(10));
    }

    #[test]
    fn completed_head_always_yields_its_value() {
        let mut rob = ReorderBuffer::new("rob", 2);
        let a = rob.reserve(7u32);
        assert_eq!(rob.head(), Some(&7));
        assert_eq!(rob.pop_ready(), None);
        rob.complete(a, None);
        assert_eq!(rob.pop_ready(), Some(7));
        assert_eq!(rob.pop_ready(), None);
        assert!(rob.is_empty());
    }

    #[test]
    #[should_panic(expected = "not outstanding")]
    fn double_completion_panics() {
        let mut rob = ReorderBuffer::<u8>::new("rob", 2);
        let s = rob.reserve(0);
        rob.complete(s, None);
        rob.complete(s, None);
    }

    #[test]
    #[should_panic(expected = "not outstanding")]
    fn stale_slot_panics() {
        let mut rob = ReorderBuffer::new("rob", 1);
        let s = rob.reserve(0);
        rob.complete(s, None);
        rob.pop_ready();
        let _fresh = rob.reserve(1);
        rob.complete(s, None);
    }

    proptest! {
        #[test]
        fn commits_follow_submission_order(order in Just((0..12usize).collect::<Vec<_>>()).prop_shuffle()) {
            let mut rob = ReorderBuffer::new("prop", 12);
            let slots: Vec<Slot> = (0..12usize).map(|i| rob.reserve(i)).collect();
            let mut committed = Vec::new();
            for i in order {
                rob.complete(slots[i], None);
                while let Some(v) = rob.pop_ready() {
                    committed.push(v);
                }
            }
            prop_assert_eq!(committed, (0..12usize).collect::<Vec<_>>());
        }
    }
}
