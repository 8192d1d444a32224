//! The per-type coordinator tying one slot table to per-thread hazard
//! registries and retire lists.
//!
//! # Protection protocol
//!
//! Protecting an atomic cell is a publish-then-re-verify loop: load the cell,
//! publish the observed pointer as a hazard (slot cell and thread registry),
//! fence, then re-load the cell. If the value is unchanged the hazard was
//! globally visible before any later retire could have been scanned, so the
//! object cannot be reclaimed while the returned [`GuardedRef`] lives. If the
//! value changed, the loop restarts with the new pointer.
//!
//! # Retiring and reclaiming
//!
//! Writers unlink an object (e.g. by swapping the cell), then hand a shared
//! owner to [`retire`](Coordinator::retire). The calling thread's retire list
//! takes a stake in the object and destroys it during a later reclamation
//! pass, once no registry in the coordinator publishes its address.
//!
//! # Per-type instances
//!
//! [`Coordinator::instance`] hands out one process-wide instance per payload
//! type (and capacity parameter), created on first use and never destroyed.
//! The instances live in a global grow-only directory keyed by `TypeId`. The
//! first call's configuration wins; later calls receive the same instance.

use core::any::TypeId;
use core::cell::UnsafeCell;
use core::ptr::{self, NonNull};
use core::sync::atomic::{fence, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::config::Config;
use crate::guarded::GuardedRef;
use crate::registry::HazardRegistry;
use crate::retired::RetireList;
use crate::slots::SlotTable;
use crate::thread_registry::{self, MAX_THREADS};

////////////////////////////////////////////////////////////////////////////////////////////////////
// ThreadState
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The hazard registry and retire list of one registered thread.
struct ThreadState<T> {
    registry: HazardRegistry<T>,
    retired: UnsafeCell<RetireList<T>>,
    /// Mirror of the retire list's size, maintained by the owning thread for
    /// lock-free introspection.
    retired_count: AtomicUsize,
}

/********** impl Debug ****************************************************************************/

impl<T> core::fmt::Debug for ThreadState<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadState")
            .field("retired", &self.retired_count.load(Ordering::Relaxed))
            .finish()
    }
}

// The `UnsafeCell` is only ever mutated by the thread owning the state (or
// during quiescent teardown); the registry and counter are atomic. Entries
// hold `Arc<T>`/`Box<T>` owners, so crossing threads requires `T: Send + Sync`.
unsafe impl<T: Send + Sync> Send for ThreadState<T> {}
unsafe impl<T: Send + Sync> Sync for ThreadState<T> {}

/********** impl inherent *************************************************************************/

impl<T: Send + Sync + 'static> ThreadState<T> {
    fn new<const N: usize>(coordinator: &'static Coordinator<T, N>) -> Self {
        Self {
            registry: HazardRegistry::new(coordinator.slots.capacity()),
            retired: UnsafeCell::new(RetireList::new(
                coordinator.config.retire_threshold(),
                move |ptr| coordinator.is_hazard(ptr),
            )),
            retired_count: AtomicUsize::new(0),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Coordinator
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The process-wide coordination state for one payload type.
///
/// `N > 0` fixes the slot capacity at compile time; `N = 0` (the default)
/// takes it from the [`Config`] at construction.
///
/// Directly constructed coordinators must outlive every [`GuardedRef`] they
/// hand out; dropping one with outstanding guards is undefined behavior.
/// Instances obtained through [`instance`](Self::instance) are immortal and
/// free of that concern.
#[derive(Debug)]
pub struct Coordinator<T, const N: usize = 0> {
    config: Config,
    slots: SlotTable<T, N>,
    threads: Box<[AtomicPtr<ThreadState<T>>]>,
}

/********** impl inherent *************************************************************************/

impl<T: Send + Sync + 'static, const N: usize> Coordinator<T, N> {
    /// Creates a standalone coordinator.
    pub fn new(config: Config) -> Self {
        let capacity = if N == 0 { config.hazard_capacity() } else { N };
        Self {
            config,
            slots: SlotTable::init(capacity),
            threads: (0..MAX_THREADS).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
        }
    }

    /// Returns the process-wide instance for `(T, N)`, creating it on first
    /// use with the given capacities.
    pub fn instance(hazard_capacity: usize, retire_threshold: usize) -> &'static Self {
        Self::instance_with(Config::with_params(hazard_capacity, retire_threshold))
    }

    /// Returns the process-wide instance for `(T, N)`, creating it on first
    /// use with `config`. A later caller's `config` is ignored.
    pub fn instance_with(config: Config) -> &'static Self {
        let key = TypeId::of::<Self>();
        if let Some(instance) = directory_lookup::<Self>(key) {
            return instance;
        }

        let instance = Box::into_raw(Box::new(Self::new(config)));
        let node = Box::into_raw(Box::new(DirectoryNode {
            key,
            instance: instance.cast(),
            next: ptr::null_mut(),
        }));

        loop {
            let head = DIRECTORY.load(Ordering::Acquire);
            if let Some(existing) = directory_lookup::<Self>(key) {
                // lost the race to publish this type's instance
                unsafe {
                    drop(Box::from_raw(node));
                    drop(Box::from_raw(instance));
                }
                return existing;
            }

            unsafe { (*node).next = head };
            let published =
                DIRECTORY.compare_exchange(head, node, Ordering::AcqRel, Ordering::Acquire);
            if published.is_ok() {
                return unsafe { &*instance };
            }
        }
    }

    /// Protects an object the caller already shares ownership of.
    ///
    /// The returned guard carries a clone of `shared`, so it stays
    /// dereferenceable regardless of the hazard machinery; the published
    /// hazard makes the object visible to scans protecting *other* owners of
    /// the same object.
    pub fn protect_shared(&'static self, shared: &Arc<T>) -> GuardedRef<T> {
        let Some(state) = self.thread_state() else {
            return GuardedRef::invalid();
        };
        let Some(slot) = self.slots.acquire() else {
            return GuardedRef::invalid();
        };

        let protect = Arc::as_ptr(shared) as *mut T;
        self.slots.set(slot, protect);
        if !state.registry.add(protect) {
            self.slots.set(slot, ptr::null_mut());
            self.slots.release(slot);
            return GuardedRef::invalid();
        }

        // Arc pointers are never null
        let pointer = unsafe { NonNull::new_unchecked(protect) };
        GuardedRef::new(pointer, Some(Arc::clone(shared)), self.release_fn(state, slot, protect))
    }

    /// Protects the object currently published in `cell`.
    ///
    /// Loops until a pointer could be validated or the cell went empty. The
    /// guard does not own the object: it stays alive because every writer
    /// routes unlinked objects through [`retire`](Self::retire) instead of
    /// dropping them directly.
    pub fn protect(&'static self, cell: &ArcSwapOption<T>) -> GuardedRef<T> {
        self.protect_cell(cell, None)
    }

    /// Like [`protect`](Self::protect), but gives up after the published
    /// pointer changed `retries + 1` times during validation.
    pub fn try_protect(&'static self, cell: &ArcSwapOption<T>, retries: u32) -> GuardedRef<T> {
        self.protect_cell(cell, Some(retries))
    }

    fn protect_cell(&'static self, cell: &ArcSwapOption<T>, mut retries: Option<u32>) -> GuardedRef<T> {
        let Some(state) = self.thread_state() else {
            return GuardedRef::invalid();
        };
        let Some(slot) = self.slots.acquire() else {
            return GuardedRef::invalid();
        };

        let mut protect = match &*cell.load() {
            Some(arc) => Arc::as_ptr(arc) as *mut T,
            None => {
                self.slots.release(slot);
                return GuardedRef::invalid();
            }
        };

        loop {
            self.slots.set(slot, protect);
            if !state.registry.add(protect) {
                self.slots.set(slot, ptr::null_mut());
                self.slots.release(slot);
                return GuardedRef::invalid();
            }

            // the hazard must be globally visible before the validation load;
            // reclamation scans fence likewise before snapshotting
            fence(Ordering::SeqCst);

            let current = match &*cell.load() {
                Some(arc) => Arc::as_ptr(arc) as *mut T,
                None => {
                    state.registry.remove(protect);
                    self.slots.set(slot, ptr::null_mut());
                    self.slots.release(slot);
                    return GuardedRef::invalid();
                }
            };

            if current == protect {
                // validated: the pointer observed both before and after the
                // hazard publication, and Arc pointers are never null
                let pointer = unsafe { NonNull::new_unchecked(protect) };
                return GuardedRef::new(pointer, None, self.release_fn(state, slot, protect));
            }

            state.registry.remove(protect);
            if let Some(remaining) = retries.as_mut() {
                if *remaining == 0 {
                    self.slots.set(slot, ptr::null_mut());
                    self.slots.release(slot);
                    return GuardedRef::invalid();
                }
                *remaining -= 1;
            }
            protect = current;
        }
    }

    /// Hands an unlinked object to the calling thread's retire list.
    ///
    /// The list takes its own stake in `owner`; destruction is deferred until
    /// no registry publishes the address and every other owner has released.
    /// Returns `false` when the address is already retired, the list is full
    /// with every entry still protected, or the thread cannot be registered.
    pub fn retire(&'static self, owner: &Arc<T>) -> bool {
        let Some(state) = self.thread_state() else {
            return false;
        };

        let retired = unsafe { &mut *state.retired.get() };
        let accepted = retired.retire_shared(owner);
        state.retired_count.store(retired.size(), Ordering::Release);
        accepted
    }

    /// Hands a uniquely owned unlinked object to the calling thread's retire
    /// list; the rejected box is handed back on failure.
    pub fn retire_boxed(&'static self, owned: Box<T>) -> Result<(), Box<T>> {
        let Some(state) = self.thread_state() else {
            return Err(owned);
        };

        let retired = unsafe { &mut *state.retired.get() };
        let result = retired.retire_boxed(owned);
        state.retired_count.store(retired.size(), Ordering::Release);
        result
    }

    /// Reclaims the calling thread's retire list against a snapshot of every
    /// registry; returns the count destroyed, or `None` for no progress.
    pub fn reclaim(&'static self) -> Option<usize> {
        let state = self.thread_state()?;
        let snapshot = self.hazard_snapshot();

        let retired = unsafe { &mut *state.retired.get() };
        let reclaimed =
            retired.reclaim_with(|ptr| snapshot.binary_search(&(ptr as usize)).is_ok());
        state.retired_count.store(retired.size(), Ordering::Release);
        reclaimed
    }

    /// Destroys every thread's remaining retired entries without consulting
    /// hazards.
    ///
    /// # Safety
    ///
    /// Teardown only: no thread may concurrently protect, retire or reclaim
    /// through this coordinator, and no [`GuardedRef`] may be outstanding.
    pub unsafe fn reclaim_all(&self) {
        for state in self.thread_states() {
            let retired = unsafe { &mut *state.retired.get() };
            retired.clear();
            state.retired_count.store(0, Ordering::Release);
        }
    }

    /// Resets the coordinator: all retired entries destroyed, all registries
    /// and slots cleared.
    ///
    /// # Safety
    ///
    /// Same quiescence requirement as [`reclaim_all`](Self::reclaim_all).
    pub unsafe fn clear(&self) {
        unsafe { self.reclaim_all() };
        for state in self.thread_states() {
            state.registry.clear();
        }
        self.slots.clear();
    }

    /// Returns the total number of hazard slots.
    #[inline]
    pub fn hazard_capacity(&self) -> usize {
        self.slots.capacity()
    }

    /// Returns the number of currently acquired hazard slots.
    #[inline]
    pub fn hazard_size(&self) -> usize {
        self.slots.size()
    }

    /// Returns the total number of retired entries across all threads.
    #[inline]
    pub fn retire_size(&self) -> usize {
        self.thread_states().map(|state| state.retired_count.load(Ordering::Acquire)).sum()
    }

    /// Returns the calling thread's state, registering the thread and
    /// creating the state on first use.
    fn thread_state(&'static self) -> Option<&'static ThreadState<T>> {
        let registry = thread_registry::registry();
        if !registry.register_current_thread() {
            return None;
        }

        let id = registry.current_thread_id()?;
        let slot = &self.threads[id];
        let mut state = slot.load(Ordering::Acquire);
        if state.is_null() {
            // the id is claimed exclusively by this thread, so the slot
            // cannot be initialized concurrently
            state = Box::into_raw(Box::new(ThreadState::new(self)));
            slot.store(state, Ordering::Release);
        }

        Some(unsafe { &*state })
    }

    fn thread_states(&self) -> impl Iterator<Item = &ThreadState<T>> {
        self.threads.iter().filter_map(|slot| unsafe { slot.load(Ordering::Acquire).as_ref() })
    }

    /// Returns whether any slot cell or registry currently publishes `ptr`.
    ///
    /// Both sources are consulted: the registries hold one entry per thread
    /// and pointer, while the slot cells hold one entry per guard, which
    /// keeps overlapping guards of one thread on the same pointer protected.
    fn is_hazard(&self, ptr: *const T) -> bool {
        fence(Ordering::SeqCst);
        self.slots.contains(ptr) || self.thread_states().any(|state| state.registry.contains(ptr))
    }

    /// Collects the union of all slot cells and registries into a sorted
    /// address list.
    fn hazard_snapshot(&self) -> Vec<usize> {
        fence(Ordering::SeqCst);

        let mut hazards = Vec::new();
        self.slots.for_each_fast(|_, ptr| hazards.push(ptr.as_ptr()));
        for state in self.thread_states() {
            state.registry.snapshot_into(&mut hazards);
        }

        let mut snapshot: Vec<usize> = hazards.into_iter().map(|ptr| ptr as usize).collect();
        snapshot.sort_unstable();
        snapshot
    }

    /// Builds the one-shot release clearing the slot payload, the registry
    /// entry and the slot reservation.
    fn release_fn(
        &'static self,
        state: &'static ThreadState<T>,
        slot: usize,
        protect: *mut T,
    ) -> Box<dyn FnOnce()> {
        Box::new(move || {
            state.registry.remove(protect);
            self.slots.set(slot, ptr::null_mut());
            self.slots.release(slot);
        })
    }
}

/********** impl Drop *****************************************************************************/

impl<T, const N: usize> Drop for Coordinator<T, N> {
    fn drop(&mut self) {
        // entries are reclaimed without consulting hazards; outstanding
        // guards at this point are a usage error (documented)
        for slot in self.threads.iter() {
            let state = slot.swap(ptr::null_mut(), Ordering::Relaxed);
            if !state.is_null() {
                drop(unsafe { Box::from_raw(state) });
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Directory
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Head of the global, grow-only list of per-type coordinator instances.
static DIRECTORY: AtomicPtr<DirectoryNode> = AtomicPtr::new(ptr::null_mut());

/// One published coordinator instance; nodes are never removed.
struct DirectoryNode {
    key: TypeId,
    instance: *mut (),
    next: *mut DirectoryNode,
}

fn directory_lookup<C: 'static>(key: TypeId) -> Option<&'static C> {
    let mut node = DIRECTORY.load(Ordering::Acquire);
    while !node.is_null() {
        let entry = unsafe { &*node };
        if entry.key == key {
            return Some(unsafe { &*entry.instance.cast::<C>() });
        }
        node = entry.next;
    }

    None
}
