//! Transfer Property Slot Pool
//!
//! Conversion results and transfer chunks land in a small fixed pool of
//! property slots (the CUT_BUFFER0..7 names). Each slot carries an explicit
//! in-use bit and acquisition scans round-robin from the last position, so
//! slot aliasing is impossible rather than merely unlikely.

use crate::engine::error::{EngineError, Result};
use crate::transport::Atom;

/// Fixed-capacity ring allocator over transfer property slots.
#[derive(Debug)]
pub struct PropertySlotPool {
    slots: Vec<Atom>,
    in_use: Vec<bool>,
    next: usize,
}

impl PropertySlotPool {
    /// Build a pool over the given slot atoms.
    pub fn new(slots: Vec<Atom>) -> Self {
        let len = slots.len();
        Self {
            slots,
            in_use: vec![false; len],
            next: 0,
        }
    }

    /// Acquire the next free slot, round-robin.
    pub fn acquire(&mut self) -> Result<Atom> {
        let capacity = self.slots.len();
        for offset in 0..capacity {
            let idx = (self.next + offset) % capacity;
            if !self.in_use[idx] {
                self.in_use[idx] = true;
                self.next = (idx + 1) % capacity;
                return Ok(self.slots[idx]);
            }
        }
        Err(EngineError::SlotsExhausted { capacity })
    }

    /// Release a previously acquired slot. Unknown atoms are ignored.
    pub fn release(&mut self, slot: Atom) {
        if let Some(idx) = self.slots.iter().position(|s| *s == slot) {
            debug_assert!(self.in_use[idx], "releasing a slot that was not held");
            self.in_use[idx] = false;
        }
    }

    /// Whether `atom` names one of the pool's slots.
    pub fn contains(&self, atom: Atom) -> bool {
        self.slots.contains(&atom)
    }

    /// Number of slots currently held.
    pub fn held(&self) -> usize {
        self.in_use.iter().filter(|b| **b).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_of(n: u32) -> PropertySlotPool {
        PropertySlotPool::new((1..=n).map(Atom).collect())
    }

    #[test]
    fn test_round_robin_rotation() {
        let mut pool = pool_of(3);
        let a = pool.acquire().unwrap();
        assert!(pool.contains(a));
        assert!(!pool.contains(Atom(99)));
        pool.release(a);
        let b = pool.acquire().unwrap();
        // Rotation keeps advancing even after a release, so recently
        // freed slots are not immediately reused.
        assert_ne!(a, b);
    }

    #[test]
    fn test_exhaustion_is_detected() {
        let mut pool = pool_of(2);
        pool.acquire().unwrap();
        pool.acquire().unwrap();
        assert!(matches!(
            pool.acquire(),
            Err(EngineError::SlotsExhausted { capacity: 2 })
        ));
    }

    #[test]
    fn test_release_frees_exactly_one() {
        let mut pool = pool_of(2);
        let a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        pool.release(a);
        assert_eq!(pool.held(), 1);
        assert_eq!(pool.acquire().unwrap(), a);
    }
}
