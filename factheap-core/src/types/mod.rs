//! Core types for factheap.
//!
//! This module provides fundamental types used throughout the engine:
//! - `RegionOffset`: Byte offset from the base of the shared region
//! - `Vertex`: 31-bit node identifier in the dependency graph
//! - `Fingerprint`: 64-bit hashtable key for cached values
//! - `WorkerId`: Index of a process into the per-worker local array

mod ids;
mod offset;

pub use ids::{Fingerprint, Vertex, WorkerId};
pub use offset::{align_up, RegionOffset};
