//! The per-thread retire list: an address-keyed map owning retired objects
//! until no hazard matches them.
//!
//! Each entry carries one of three destructor variants: reconstitute and drop
//! a `Box`, drop a held shared owner (`Arc`), or run a custom closure. The
//! map owns every entry; dropping the list destroys all remaining entries
//! regardless of hazard state (teardown).
//!
//! Ownership on rejection: a shared-owner retire stores a *clone* of the
//! caller's `Arc`, so a rejected retire leaves the caller's stake untouched
//! and it can back off and retry. A rejected boxed retire hands the `Box`
//! back in the error value for the same reason.

use core::ptr::NonNull;
use std::collections::HashMap;
use std::sync::Arc;

use crate::hash::BuildAddressHasher;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Destructor
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The destructor variant attached to a retired entry.
enum Destructor<T> {
    /// Reconstitute the `Box` the pointer came from and drop it.
    Boxed,
    /// Drop a held shared owner; the object survives until its final owner
    /// releases.
    SharedOwner(Arc<T>),
    /// Run a caller-supplied closure on the raw pointer.
    Custom(Option<Box<dyn FnOnce(*mut T) + Send>>),
}

/********** impl Debug ****************************************************************************/

impl<T> core::fmt::Debug for Destructor<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Destructor::Boxed => f.write_str("Boxed"),
            Destructor::SharedOwner(_) => f.write_str("SharedOwner"),
            Destructor::Custom(_) => f.write_str("Custom"),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// RetiredEntry
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An owned retired object; dropping the entry runs its destructor variant.
#[derive(Debug)]
struct RetiredEntry<T> {
    ptr: NonNull<T>,
    destructor: Destructor<T>,
}

/********** impl Drop *****************************************************************************/

impl<T> Drop for RetiredEntry<T> {
    fn drop(&mut self) {
        match &mut self.destructor {
            Destructor::Boxed => unsafe { drop(Box::from_raw(self.ptr.as_ptr())) },
            // the held Arc is dropped alongside the entry
            Destructor::SharedOwner(_) => {}
            Destructor::Custom(deleter) => {
                if let Some(deleter) = deleter.take() {
                    deleter(self.ptr.as_ptr());
                }
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// RetireList
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An owning map from raw address to retired entry with a reclamation
/// threshold.
///
/// Single-writer: only the owning thread mutates the list. The hazard
/// predicate supplied at construction answers "is this address still
/// protected by any thread?".
pub struct RetireList<T> {
    threshold: usize,
    is_hazard: Box<dyn Fn(*const T) -> bool + Send + Sync>,
    retired: HashMap<usize, RetiredEntry<T>, BuildAddressHasher>,
}

/********** impl Debug ****************************************************************************/

impl<T> core::fmt::Debug for RetireList<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RetireList")
            .field("threshold", &self.threshold)
            .field("retired", &self.retired.len())
            .finish()
    }
}

/********** impl inherent *************************************************************************/

impl<T> RetireList<T> {
    /// Creates a list that triggers reclamation at `threshold` entries
    /// (rounded up to a power of two) using `is_hazard` to query protection.
    pub fn new<F>(threshold: usize, is_hazard: F) -> Self
    where
        F: Fn(*const T) -> bool + Send + Sync + 'static,
    {
        let threshold = threshold.next_power_of_two();
        Self {
            threshold,
            is_hazard: Box::new(is_hazard),
            retired: HashMap::with_capacity_and_hasher(threshold, BuildAddressHasher),
        }
    }

    /// Returns the number of retired entries currently held.
    #[inline]
    pub fn size(&self) -> usize {
        self.retired.len()
    }

    /// Returns the current reclamation threshold.
    #[inline]
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Retires a uniquely owned object.
    ///
    /// On rejection (the list is full and nothing could be reclaimed) the box
    /// is handed back so the caller can retry after yielding.
    pub fn retire_boxed(&mut self, owned: Box<T>) -> Result<(), Box<T>> {
        let ptr = NonNull::from(Box::leak(owned));
        if self.retire_entry(ptr, Destructor::Boxed) {
            Ok(())
        } else {
            Err(unsafe { Box::from_raw(ptr.as_ptr()) })
        }
    }

    /// Retires a shared object by storing a clone of `owner`.
    ///
    /// Returns `false` when the address is already retired or the list is
    /// full and nothing could be reclaimed; the caller's own stake is
    /// unaffected either way.
    pub fn retire_shared(&mut self, owner: &Arc<T>) -> bool {
        let Some(ptr) = NonNull::new(Arc::as_ptr(owner) as *mut T) else {
            return false;
        };
        self.retire_entry(ptr, Destructor::SharedOwner(Arc::clone(owner)))
    }

    /// Retires a raw pointer with a custom deleter.
    ///
    /// The deleter is dropped without running when the retire is rejected;
    /// the caller retains ownership of the pointee in that case.
    pub fn retire_with<F>(&mut self, ptr: NonNull<T>, deleter: F) -> bool
    where
        F: FnOnce(*mut T) + Send + 'static,
    {
        self.retire_entry(ptr, Destructor::Custom(Some(Box::new(deleter))))
    }

    /// Destroys every entry whose address the list's own hazard predicate
    /// reports unprotected; returns the count, or `None` if nothing was
    /// reclaimed.
    pub fn reclaim(&mut self) -> Option<usize> {
        let before = self.retired.len();
        let is_hazard = &self.is_hazard;
        self.retired.retain(|_, entry| is_hazard(entry.ptr.as_ptr() as *const T));
        checked_removed(before, self.retired.len())
    }

    /// Like [`reclaim`](Self::reclaim), but with a caller-supplied predicate
    /// (typically a membership test against an already-taken snapshot).
    pub fn reclaim_with<F>(&mut self, is_hazard: F) -> Option<usize>
    where
        F: Fn(*const T) -> bool,
    {
        let before = self.retired.len();
        self.retired.retain(|_, entry| is_hazard(entry.ptr.as_ptr() as *const T));
        checked_removed(before, self.retired.len())
    }

    /// Destroys every remaining entry without consulting hazards (teardown).
    pub fn clear(&mut self) {
        self.retired.clear();
    }

    /// Raises the threshold to hold at least `requested` entries (rounded up
    /// to a power of two); fails when `requested` is below the current size.
    pub fn resize(&mut self, requested: usize) -> bool {
        if requested < self.retired.len() {
            return false;
        }

        let rounded = requested.next_power_of_two();
        self.retired.reserve(rounded.saturating_sub(self.retired.len()));
        self.threshold = rounded;
        true
    }

    fn retire_entry(&mut self, ptr: NonNull<T>, destructor: Destructor<T>) -> bool {
        if self.retired.len() >= self.threshold && self.reclaim().is_none() {
            return false;
        }

        if self.should_grow() {
            let len = self.retired.len();
            let increase = len / 5;
            let requested = len + if increase == 0 { 1 } else { increase };
            if !self.resize(requested) {
                return false;
            }
        }

        let address = ptr.as_ptr() as usize;
        if self.retired.contains_key(&address) {
            return false;
        }

        self.retired.insert(address, RetiredEntry { ptr, destructor });
        true
    }

    #[inline]
    fn should_grow(&self) -> bool {
        self.retired.len() > self.threshold - self.threshold / 5
    }
}

#[inline]
fn checked_removed(before: usize, after: usize) -> Option<usize> {
    match before - after {
        0 => None,
        removed => Some(removed),
    }
}

#[cfg(test)]
mod tests {
    use core::ptr::NonNull;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use matches::assert_matches;

    use super::RetireList;

    struct DropCount(Arc<AtomicUsize>);
    impl Drop for DropCount {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn no_hazards(_: *const DropCount) -> bool {
        false
    }

    #[test]
    fn reclaim_destroys_unprotected() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut list = RetireList::new(8, no_hazards);

        for _ in 0..3 {
            assert!(list.retire_boxed(Box::new(DropCount(Arc::clone(&count)))).is_ok());
        }
        assert_eq!(list.size(), 3);

        assert_matches!(list.reclaim(), Some(3));
        assert_eq!(list.size(), 0);
        assert_eq!(count.load(Ordering::Relaxed), 3);
        assert_matches!(list.reclaim(), None);
    }

    #[test]
    fn threshold_triggers_reclaim() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut list = RetireList::new(2, no_hazards);

        for _ in 0..5 {
            assert!(list.retire_boxed(Box::new(DropCount(Arc::clone(&count)))).is_ok());
        }

        // each retire past the threshold reclaimed the backlog first
        assert!(count.load(Ordering::Relaxed) >= 2);
        assert!(list.size() <= 2);
    }

    #[test]
    fn full_list_with_hazards_rejects() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut list = RetireList::new(1, |_| true);

        assert!(list.retire_boxed(Box::new(DropCount(Arc::clone(&count)))).is_ok());
        // threshold 1 reached and the sole entry is protected
        let rejected = list.retire_boxed(Box::new(DropCount(Arc::clone(&count))));
        let rejected = rejected.unwrap_err();
        assert_eq!(list.size(), 1);
        assert_eq!(count.load(Ordering::Relaxed), 0);

        drop(rejected);
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn duplicate_address_is_rejected() {
        let owner = Arc::new(7u32);
        let mut list = RetireList::new(8, |_: *const u32| false);

        assert!(list.retire_shared(&owner));
        assert!(!list.retire_shared(&owner));
        assert_eq!(list.size(), 1);
    }

    #[test]
    fn shared_owner_defers_to_last_stake() {
        let owner = Arc::new(41u32);
        let weak = Arc::downgrade(&owner);
        let mut list = RetireList::new(8, |_: *const u32| false);

        assert!(list.retire_shared(&owner));
        assert_matches!(list.reclaim(), Some(1));
        // the caller's own stake still keeps the object alive
        assert!(weak.upgrade().is_some());

        drop(owner);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn custom_deleter_runs_on_reclaim() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut list = RetireList::new(8, |_: *const u32| false);

        let boxed = Box::into_raw(Box::new(99u32));
        let counter = Arc::clone(&count);
        let retired = list.retire_with(NonNull::new(boxed).unwrap(), move |ptr| {
            counter.fetch_add(1, Ordering::Relaxed);
            unsafe { drop(Box::from_raw(ptr)) };
        });
        assert!(retired);

        assert_matches!(list.reclaim(), Some(1));
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn drop_destroys_remaining_entries() {
        let count = Arc::new(AtomicUsize::new(0));
        {
            let mut list = RetireList::new(8, |_| true);
            for _ in 0..4 {
                assert!(list.retire_boxed(Box::new(DropCount(Arc::clone(&count)))).is_ok());
            }
            // everything is protected, nothing reclaimable
            assert_matches!(list.reclaim(), None);
            assert_eq!(count.load(Ordering::Relaxed), 0);
        }
        // teardown ignores hazards
        assert_eq!(count.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn resize_rules() {
        let mut list = RetireList::new(4, |_: *const u32| true);
        let owners: Vec<_> = (0..3).map(|value| Arc::new(value)).collect();
        for owner in &owners {
            assert!(list.retire_shared(owner));
        }

        assert!(!list.resize(2));
        assert!(list.resize(3));
        assert_eq!(list.threshold(), 4);
        assert!(list.resize(9));
        assert_eq!(list.threshold(), 16);
    }

    #[test]
    fn threshold_grows_near_capacity() {
        let mut list = RetireList::new(16, |_: *const u32| true);
        let owners: Vec<_> = (0..16).map(|value| Arc::new(value)).collect();
        for (i, owner) in owners.iter().enumerate() {
            assert!(list.retire_shared(owner), "retire #{} rejected", i);
        }

        assert_eq!(list.size(), 16);
        assert!(list.threshold() > 16);
    }
}
