//! Fixed-latency channels between boxes.
//!
//! A [`Signal`] is written by exactly one box and read by exactly one box.
//! Items written at cycle `c` become readable at `c + latency`. The
//! per-cycle bandwidth bounds how many items the producer may write in a
//! single cycle; exceeding it means the producer's flow control is broken.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

#[derive(Debug)]
struct SignalState<T> {
    name: String,
    bandwidth: u32,
    latency: u64,
    in_flight: VecDeque<(u64, T)>,
    write_cycle: u64,
    writes_this_cycle: u32,
}

/// Cloneable handle to a shared fixed-latency channel.
#[derive(Debug)]
pub struct Signal<T> {
    inner: Rc<RefCell<SignalState<T>>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> Signal<T> {
    /// Create a channel. `latency` is clamped to at least one cycle so that
    /// the clocking order of producer and consumer never matters.
    pub fn new(name: impl Into<String>, bandwidth: u32, latency: u64) -> Self {
        assert!(bandwidth > 0, "signal bandwidth must be non-zero");
        Self {
            inner: Rc::new(RefCell::new(SignalState {
                name: name.into(),
                bandwidth,
                latency: latency.max(1),
                in_flight: VecDeque::new(),
                write_cycle: u64::MAX,
                writes_this_cycle: 0,
            })),
        }
    }

    /// Single-item, single-cycle channel used for state feedback.
    pub fn state(name: impl Into<String>) -> Self {
        Self::new(name, 1, 1)
    }

    pub fn name(&self) -> String {
        self.inner.borrow().name.clone()
    }

    pub fn bandwidth(&self) -> u32 {
        self.inner.borrow().bandwidth
    }

    pub fn latency(&self) -> u64 {
        self.inner.borrow().latency
    }

    /// Send an item.
    ///
    /// # Panics
    /// If more than `bandwidth` items are written in the same cycle.
    pub fn write(&self, cycle: u64, item: T) {
        let mut s = self.inner.borrow_mut();
        if s.write_cycle != cycle {
            s.write_cycle = cycle;
            s.writes_this_cycle = 0;
        }
        if s.writes_this_cycle >= s.bandwidth {
            panic!(
                "signal {}: bandwidth of {} items per cycle exceeded at cycle {}",
                s.name, s.bandwidth, cycle
            );
        }
        s.writes_this_cycle += 1;
        let ready = cycle + s.latency;
        s.in_flight.push_back((ready, item));
    }

    /// Receive the oldest item that has arrived by `cycle`.
    pub fn read(&self, cycle: u64) -> Option<T> {
        let mut s = self.inner.borrow_mut();
        match s.in_flight.front() {
            Some((ready, _)) if *ready <= cycle => s.in_flight.pop_front().map(|(_, item)| item),
            _ => None,
        }
    }

    /// Receive up to `max` arrived items.
    pub fn read_up_to(&self, cycle: u64, max: usize) -> Vec<T> {
        let mut out = Vec::new();
        while out.len() < max {
            match self.read(cycle) {
                Some(item) => out.push(item),
                None => break,
            }
        }
        out
    }

    /// Drain everything that has arrived by `cycle`, keeping only the newest.
    /// State signals are read this way so a reader never acts on stale state.
    pub fn read_latest(&self, cycle: u64) -> Option<T> {
        let mut latest = None;
        while let Some(item) = self.read(cycle) {
            latest = Some(item);
        }
        latest
    }

    /// Items written but not yet consumed, arrived or not.
    pub fn pending(&self) -> usize {
        self.inner.borrow().in_flight.len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Drop everything in flight.
    pub fn clear(&self) {
        self.inner.borrow_mut().in_flight.clear();
    }
}
