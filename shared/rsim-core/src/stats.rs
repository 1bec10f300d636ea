//! Named event counters.
//!
//! Each box owns one [`Statistics`] and only ever increments it; the
//! driver reads the counters after a run.

use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Default)]
pub struct Statistics {
    counters: BTreeMap<&'static str, u64>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters created up front so that they are reported even when zero.
    pub fn with_counters(names: &[&'static str]) -> Self {
        let mut s = Self::new();
        for &n in names {
            s.counters.insert(n, 0);
        }
        s
    }

    pub fn inc(&mut self, name: &'static str) {
        self.add(name, 1);
    }

    pub fn add(&mut self, name: &'static str, n: u64) {
        *self.counters.entry(name).or_insert(0) += n;
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        self.counters.iter().map(|(k, v)| (*k, *v))
    }

    pub fn reset(&mut self) {
        for v in self.counters.values_mut() {
            *v = 0;
        }
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.counters.iter().enumerate() {
            if i > 0 {
                f.write_str(" | ")?;
            }
            write!(f, "{k} = {v}")?;
        }
        Ok(())
    }
}
