//! Hazard pointer based memory reclamation for lock-free data structures,
//! with a hierarchical bitmap index over the hazard slots.
//!
//! # Overview
//!
//! Readers of a lock-free structure cannot take locks to keep the nodes they
//! traverse alive, so writers cannot know when it is safe to free an unlinked
//! node. Hazard pointers close that gap: before dereferencing a shared
//! pointer, a reader *publishes* it, writers hand unlinked nodes to the
//! library instead of dropping them, and the library destroys a node only
//! once its address is absent from every published hazard.
//!
//! The pieces, bottom up:
//!
//! - [`BitmapTree`]: a lock-free summary tree over bitset planes; finds a
//!   free slot with a single word test in the common case.
//! - [`SlotTable`]: the fixed pool of hazard cells, indexed by a two-plane
//!   [`BitmapTree`] (availability and a non-empty iteration hint).
//! - [`HazardRegistry`]: one open-addressed set per thread of the addresses
//!   that thread currently protects.
//! - [`RetireList`]: one owning map per thread of retired objects awaiting
//!   destruction, with boxed, shared-owner and custom destructor variants.
//! - [`GuardedRef`]: the scoped handle whose drop releases the hazard.
//! - [`Coordinator`]: the per-type singleton tying the above together and
//!   implementing protect, retire and reclaim.
//!
//! Protected cells are [`arc_swap::ArcSwapOption`] values holding
//! [`Arc`](std::sync::Arc) owners; unlinking is a `swap`, and the swapped-out
//! owner goes to [`Coordinator::retire`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use hazbit::{ArcSwapOption, Coordinator};
//!
//! let coordinator = Coordinator::<u64>::instance(16, 16);
//! let cell = ArcSwapOption::new(Some(Arc::new(1u64)));
//!
//! // a reader protects whatever the cell currently publishes
//! let guard = coordinator.protect(&cell);
//! assert_eq!(guard.as_ref(), Some(&1));
//!
//! // a writer unlinks the object and retires it instead of dropping it
//! let unlinked = cell.swap(Some(Arc::new(2u64))).unwrap();
//! assert!(coordinator.retire(&unlinked));
//! drop(unlinked);
//!
//! // the protected object survives reclamation until the guard drops
//! assert_eq!(coordinator.reclaim(), None);
//! assert_eq!(guard.as_ref(), Some(&1));
//! drop(guard);
//! assert_eq!(coordinator.reclaim(), Some(1));
//! ```
//!
//! # The writer contract
//!
//! A guard from [`Coordinator::protect`] does not own the object it
//! references; it stays valid because every writer routes unlinked objects
//! through [`Coordinator::retire`], which holds an ownership stake until no
//! hazard matches. Dropping the final `Arc` of a published object directly,
//! without retiring it, bypasses the scheme and can free memory a reader is
//! still using.

mod bitmap;
mod config;
mod coordinator;
mod guarded;
mod hash;
mod registry;
mod retired;
mod slots;

pub mod thread_registry;

pub use arc_swap::{ArcSwap, ArcSwapOption};

pub use crate::bitmap::BitmapTree;
pub use crate::config::{Config, ConfigBuilder};
pub use crate::coordinator::Coordinator;
pub use crate::guarded::GuardedRef;
pub use crate::registry::HazardRegistry;
pub use crate::retired::RetireList;
pub use crate::slots::SlotTable;
