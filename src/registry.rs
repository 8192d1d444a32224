//! The per-thread hazard registry: a lock-free open-addressed set of the raw
//! addresses one thread currently protects.
//!
//! The owning thread is the only writer; reclamation scans on other threads
//! read it concurrently. Removals leave a tombstone instead of null so probe
//! chains stay intact for concurrent readers.

use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::hash::hash_ptr;

////////////////////////////////////////////////////////////////////////////////////////////////////
// HazardRegistry
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A fixed-capacity open-addressed probe set of protected pointers.
///
/// The capacity is at least twice the requested maximum, rounded up to a
/// power of two, which keeps the load factor at or below one half. The table
/// is never resized; exhausting it is a sizing error on the caller's part.
#[derive(Debug)]
pub struct HazardRegistry<T> {
    slots: Box<[AtomicPtr<T>]>,
    mask: usize,
}

/********** impl inherent *************************************************************************/

impl<T> HazardRegistry<T> {
    /// Creates a registry able to hold at least `requested` distinct
    /// pointers.
    pub fn new(requested: usize) -> Self {
        let capacity = match requested {
            0 => 1,
            n => (n * 2).next_power_of_two(),
        };

        let slots = (0..capacity).map(|_| AtomicPtr::new(ptr::null_mut())).collect();
        Self { slots, mask: capacity - 1 }
    }

    /// Returns the total number of probe slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Publishes `ptr` in the registry.
    ///
    /// Idempotent; returns `false` only for null input or a full table.
    pub fn add(&self, ptr: *mut T) -> bool {
        if ptr.is_null() {
            return false;
        }

        let tomb = tombstone::<T>();
        let hash = hash_ptr(ptr);
        for probe in 0..self.slots.len() {
            let slot = &self.slots[(hash + probe) & self.mask];
            let mut current = slot.load(Ordering::Acquire);

            loop {
                if current == ptr {
                    return true;
                }
                if !current.is_null() && current != tomb {
                    // occupied by a different pointer, advance the probe
                    break;
                }
                match slot.compare_exchange_weak(current, ptr, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => return true,
                    Err(observed) => current = observed,
                }
            }
        }

        false
    }

    /// Withdraws `ptr` from the registry, leaving a tombstone.
    pub fn remove(&self, ptr: *mut T) -> bool {
        if ptr.is_null() {
            return false;
        }

        let tomb = tombstone::<T>();
        let hash = hash_ptr(ptr);
        for probe in 0..self.slots.len() {
            let slot = &self.slots[(hash + probe) & self.mask];
            let mut current = slot.load(Ordering::Acquire);

            if current == ptr {
                while current == ptr {
                    match slot.compare_exchange_weak(
                        current,
                        tomb,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return true,
                        Err(observed) => current = observed,
                    }
                }
                return true;
            }
            if current.is_null() {
                return false;
            }
        }

        false
    }

    /// Returns whether `ptr` is currently published.
    pub fn contains(&self, ptr: *const T) -> bool {
        if ptr.is_null() {
            return false;
        }

        let hash = hash_ptr(ptr);
        for probe in 0..self.slots.len() {
            let current = self.slots[(hash + probe) & self.mask].load(Ordering::Acquire);
            if current as *const T == ptr {
                return true;
            }
            if current.is_null() {
                return false;
            }
        }

        false
    }

    /// Collects all published pointers, excluding tombstones.
    pub fn snapshot(&self) -> Vec<*mut T> {
        let mut hazards = Vec::with_capacity(self.slots.len() / 2);
        self.snapshot_into(&mut hazards);
        hazards
    }

    /// Appends all published pointers to `out`, excluding tombstones.
    pub fn snapshot_into(&self, out: &mut Vec<*mut T>) {
        let tomb = tombstone::<T>();
        for slot in self.slots.iter() {
            let current = slot.load(Ordering::Acquire);
            if !current.is_null() && current != tomb {
                out.push(current);
            }
        }
    }

    /// Resets every slot to null.
    pub fn clear(&self) {
        for slot in self.slots.iter() {
            slot.store(ptr::null_mut(), Ordering::Relaxed);
        }
    }
}

/// The sentinel marking a withdrawn slot; the address value 1 is never a
/// valid heap address.
#[inline]
fn tombstone<T>() -> *mut T {
    1usize as *mut T
}

#[cfg(test)]
mod tests {
    use super::HazardRegistry;

    fn ptr(addr: usize) -> *mut u64 {
        (addr * 8) as *mut u64
    }

    #[test]
    fn capacity_rounding() {
        assert_eq!(HazardRegistry::<u64>::new(0).capacity(), 1);
        assert_eq!(HazardRegistry::<u64>::new(1).capacity(), 2);
        assert_eq!(HazardRegistry::<u64>::new(2).capacity(), 4);
        assert_eq!(HazardRegistry::<u64>::new(3).capacity(), 8);
        assert_eq!(HazardRegistry::<u64>::new(64).capacity(), 128);
    }

    #[test]
    fn add_is_idempotent() {
        let registry = HazardRegistry::new(4);
        assert!(registry.add(ptr(1)));
        assert!(registry.add(ptr(1)));
        assert_eq!(registry.snapshot(), [ptr(1)]);
    }

    #[test]
    fn null_input_is_rejected() {
        let registry = HazardRegistry::<u64>::new(4);
        assert!(!registry.add(core::ptr::null_mut()));
        assert!(!registry.remove(core::ptr::null_mut()));
        assert!(!registry.contains(core::ptr::null()));
    }

    #[test]
    fn full_table_rejects_new_entries() {
        // capacity rounds to 4
        let registry = HazardRegistry::new(2);
        for i in 1..=4 {
            assert!(registry.add(ptr(i)));
        }
        assert!(!registry.add(ptr(5)));
        // but re-adding a present pointer still succeeds
        assert!(registry.add(ptr(3)));
    }

    #[test]
    fn remove_leaves_probe_chains_intact() {
        let registry = HazardRegistry::new(2);
        for i in 1..=4 {
            assert!(registry.add(ptr(i)));
        }

        assert!(registry.remove(ptr(2)));
        assert!(!registry.contains(ptr(2)));
        // every survivor must remain reachable across the tombstone
        for i in [1, 3, 4] {
            assert!(registry.contains(ptr(i)));
        }

        // the tombstone is reusable
        assert!(registry.add(ptr(5)));
        assert!(registry.contains(ptr(5)));
    }

    #[test]
    fn remove_absent_returns_false() {
        let registry = HazardRegistry::new(4);
        registry.add(ptr(1));
        assert!(!registry.remove(ptr(2)));
    }

    #[test]
    fn snapshot_excludes_tombstones() {
        let registry = HazardRegistry::new(4);
        for i in 1..=3 {
            registry.add(ptr(i));
        }
        registry.remove(ptr(2));

        let mut snapshot = registry.snapshot();
        snapshot.sort_unstable();
        assert_eq!(snapshot, [ptr(1), ptr(3)]);
    }

    #[test]
    fn clear_empties_the_table() {
        let registry = HazardRegistry::new(4);
        for i in 1..=4 {
            registry.add(ptr(i));
        }
        registry.clear();
        assert!(registry.snapshot().is_empty());
        assert!(registry.add(ptr(9)));
    }
}
