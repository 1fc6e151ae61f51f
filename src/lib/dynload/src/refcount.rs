//! Open counts of directly opened images.

use std::{collections::HashMap, num::NonZeroUsize};

use parking_lot::RwLock;
use tracing::{trace, warn};

/// Maps a load address to the number of outstanding direct opens. An address has an entry only
/// while its count is non-zero. Images pulled in purely as dependencies never get one.
#[derive(Default)]
pub struct ReferenceCounter {
    counts: RwLock<HashMap<usize, NonZeroUsize>>,
}

impl ReferenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a direct open. Returns the new count.
    pub fn open(&self, load_address: usize) -> usize {
        let mut counts = self.counts.write();
        let count = counts
            .entry(load_address)
            .and_modify(|c| *c = c.saturating_add(1))
            .or_insert(NonZeroUsize::MIN);
        trace!("open {:#x}: count {}", load_address, count);
        count.get()
    }

    /// Drop one direct open. Returns true if that was the last one, in which case the entry is
    /// gone and a collection is required.
    pub fn close(&self, load_address: usize) -> bool {
        let mut counts = self.counts.write();
        let Some(count) = counts.get_mut(&load_address) else {
            warn!("close of {:#x}, which has no open references", load_address);
            return false;
        };
        match NonZeroUsize::new(count.get() - 1) {
            Some(lower) => {
                *count = lower;
                trace!("close {:#x}: count {}", load_address, lower);
                false
            }
            None => {
                counts.remove(&load_address);
                trace!("close {:#x}: last reference dropped", load_address);
                true
            }
        }
    }

    pub fn is_open(&self, load_address: usize) -> bool {
        self.counts.read().contains_key(&load_address)
    }

    /// Current count, zero if there is no entry.
    pub fn count(&self, load_address: usize) -> usize {
        self.counts
            .read()
            .get(&load_address)
            .map_or(0, |c| c.get())
    }

    /// Addresses with live entries.
    pub fn open_addresses(&self) -> Vec<usize> {
        self.counts.read().keys().copied().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn balanced_opens_and_closes_leave_nothing() {
        let refs = ReferenceCounter::new();
        for n in 1..=5 {
            assert_eq!(refs.open(0x1000), n);
        }
        for remaining in (1..5).rev() {
            assert!(!refs.close(0x1000));
            assert_eq!(refs.count(0x1000), remaining);
            assert!(refs.is_open(0x1000));
        }
        assert!(refs.close(0x1000));
        assert!(!refs.is_open(0x1000));
        assert_eq!(refs.count(0x1000), 0);
        assert!(refs.open_addresses().is_empty());
    }

    #[test]
    fn close_without_open() {
        let refs = ReferenceCounter::new();
        assert!(!refs.close(0x2000));
        refs.open(0x3000);
        assert!(!refs.close(0x2000));
        assert_eq!(refs.open_addresses(), vec![0x3000]);
    }
}
