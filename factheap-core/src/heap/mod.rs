//! Concurrent key-value store over a bump-allocated, compactable heap.
//!
//! # Write protocol
//!
//! A writer publishes an entry in three steps:
//!
//! 1. Claim the slot's fingerprint (CAS `0 -> key`), or find it already set.
//! 2. Claim the slot's address (CAS `NULL -> SENTINEL`). Losing this CAS
//!    means another writer owns the entry; the call is a no-op.
//! 3. Allocate, copy header and payload, then store the real address with
//!    Release ordering.
//!
//! Readers that find the sentinel wait (bounded by the configured publish
//! timeout) until step 3 lands, so a reader never observes a partially
//! written payload.
//!
//! # Heap entries
//!
//! ```text
//! ┌────────────────────┬──────────────────────────┬─────────┐
//! │ header (8 bytes)   │ payload (size bytes)     │ padding │
//! └────────────────────┴──────────────────────────┴─────────┘
//! ```
//!
//! Removal only clears the address and counts the bytes as wasted;
//! [`HashStore::collect`] slides live entries down to reclaim them.

mod codec;
mod collect;
mod header;
mod store;

pub use codec::{
    CompressionCodec, JsonSerializer, NoCompression, Payload, PayloadSerializer, RawBytes,
};
pub use collect::{CollectPolicy, CollectionReport};
pub use header::{EntryHeader, EntryKind, HeapWord, ENTRY_ALIGNMENT, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use store::{HashStore, HeapStats, PutOutcome, StoredSize};
