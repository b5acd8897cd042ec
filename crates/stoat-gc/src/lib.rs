//! # Stoat Garbage Collector
//!
//! Generational, tracing garbage collector over a handle arena.
//!
//! ## Design
//!
//! - **Handles, not pointers**: objects live in an arena of slots and are
//!   addressed by stable [`Ref`] handles. Reachability is a pure graph
//!   traversal over handles; no native pointer ever crosses the API.
//! - **Young generation**: new objects accumulate against a byte budget and
//!   are collected by tracing roots plus the remembered set.
//! - **Old generation**: survivors are promoted; full-heap collections run
//!   when the old generation crosses its (growing) limit.
//! - **Write barrier**: every store of a handle into an already-old object
//!   must pass through [`Heap::write_barrier`] so no old-to-young edge is
//!   missed by a minor collection.

#![warn(missing_docs)]

pub mod barrier;
pub mod collector;
pub mod heap;
pub mod object;

pub use barrier::RememberedSet;
pub use heap::{GcConfig, Heap, HeapStats, OomError};
pub use object::{Color, ExternalRootSet, Generation, GcHeader, Ref, Trace};
