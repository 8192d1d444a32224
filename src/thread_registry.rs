//! Process-wide registration of reader/writer threads.
//!
//! Every thread that protects or retires through a coordinator needs a small
//! stable integer id, used to index the coordinator-owned per-thread state
//! tables. Ids start at 1 (0 means unregistered) and are handed out from a
//! claim array; unregistering frees the id for reuse by later threads.
//!
//! Registration is idempotent and cheap once performed (a thread-local read).
//! A thread that exits without unregistering permanently consumes its id.

use core::cell::Cell;
use core::sync::atomic::{AtomicBool, Ordering};

use conquer_once::Lazy;

/// The process-wide ceiling on concurrently registered threads.
pub const MAX_THREADS: usize = 256;

const UNREGISTERED: usize = 0;

static REGISTRY: Lazy<ThreadRegistry> = Lazy::new(ThreadRegistry::new);

thread_local! {
    static THREAD_ID: Cell<usize> = const { Cell::new(UNREGISTERED) };
}

/// Returns the process-wide thread registry.
#[inline]
pub fn registry() -> &'static ThreadRegistry {
    &REGISTRY
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// ThreadRegistry
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The claim table assigning stable small-integer ids to threads.
#[derive(Debug)]
pub struct ThreadRegistry {
    used: [AtomicBool; MAX_THREADS],
}

/********** impl inherent *************************************************************************/

impl ThreadRegistry {
    fn new() -> Self {
        Self { used: core::array::from_fn(|_| AtomicBool::new(false)) }
    }

    /// Registers the calling thread, assigning it an id if it has none.
    ///
    /// Idempotent; returns `false` only when every id is taken.
    pub fn register_current_thread(&self) -> bool {
        THREAD_ID.with(|id| {
            if id.get() != UNREGISTERED {
                return true;
            }

            for candidate in 1..MAX_THREADS {
                if self.used[candidate]
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    id.set(candidate);
                    return true;
                }
            }

            false
        })
    }

    /// Returns whether the calling thread holds an id.
    #[inline]
    pub fn is_registered(&self) -> bool {
        THREAD_ID.with(|id| id.get() != UNREGISTERED)
    }

    /// Returns the calling thread's id, if registered.
    #[inline]
    pub fn current_thread_id(&self) -> Option<usize> {
        THREAD_ID.with(|id| match id.get() {
            UNREGISTERED => None,
            id => Some(id),
        })
    }

    /// Releases the calling thread's id for reuse.
    ///
    /// Intended to be called at thread exit; returns `false` when the thread
    /// was not registered.
    pub fn unregister_current_thread(&self) -> bool {
        THREAD_ID.with(|id| {
            let current = id.get();
            if current == UNREGISTERED {
                return false;
            }

            self.used[current].store(false, Ordering::Release);
            id.set(UNREGISTERED);
            true
        })
    }
}
