//! Strongly-typed identifiers for graph vertices, cache keys and workers.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A node in the dependency graph.
///
/// Vertex ids are 31 bits wide: the top bit of every 32-bit cell in the
/// dependency table is reserved for a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
#[repr(transparent)]
pub struct Vertex(u32);

impl Vertex {
    /// Largest representable vertex id.
    pub const MAX: u32 = (1 << 31) - 1;

    /// Create a vertex.
    ///
    /// # Panics
    /// Panics if `id` does not fit in 31 bits. Callers own the id space, so an
    /// oversized id is a programming error rather than a runtime condition.
    #[must_use]
    pub fn new(id: u32) -> Self {
        assert!(id <= Self::MAX, "vertex id {id} does not fit in 31 bits");
        Self(id)
    }

    /// Create a vertex, returning `None` for ids that do not fit in 31 bits.
    #[must_use]
    pub const fn try_new(id: u32) -> Option<Self> {
        if id <= Self::MAX {
            Some(Self(id))
        } else {
            None
        }
    }

    /// Get the raw id.
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for Vertex {
    type Error = String;

    fn try_from(id: u32) -> Result<Self, Self::Error> {
        Self::try_new(id).ok_or_else(|| format!("vertex id {id} does not fit in 31 bits"))
    }
}

impl From<Vertex> for u32 {
    fn from(vertex: Vertex) -> Self {
        vertex.0
    }
}

impl fmt::Display for Vertex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// 64-bit digest identifying a cached value in the hashtable.
///
/// Zero marks an empty hashtable slot and is never a valid fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
#[repr(transparent)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// Wrap a precomputed digest.
    ///
    /// # Panics
    /// Panics if `hash` is zero.
    #[must_use]
    pub fn new(hash: u64) -> Self {
        assert!(hash != 0, "fingerprint 0 is reserved for empty slots");
        Self(hash)
    }

    /// Derive a fingerprint from arbitrary key bytes.
    ///
    /// Uses the first eight bytes of the SHA-256 digest. The one-in-2^64
    /// zero digest is folded onto 1.
    #[must_use]
    pub fn of(key: impl AsRef<[u8]>) -> Self {
        let digest = Sha256::digest(key.as_ref());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        Self(u64::from_le_bytes(prefix).max(1))
    }

    /// Get the raw digest.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl TryFrom<u64> for Fingerprint {
    type Error = String;

    fn try_from(hash: u64) -> Result<Self, Self::Error> {
        if hash == 0 {
            return Err("fingerprint 0 is reserved for empty slots".to_string());
        }
        Ok(Self(hash))
    }
}

impl From<Fingerprint> for u64 {
    fn from(fingerprint: Fingerprint) -> Self {
        fingerprint.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Index of a process into the worker-local array.
///
/// The coordinator is always worker 0; attached workers are numbered
/// `1..=num_workers`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct WorkerId(u32);

impl WorkerId {
    /// The coordinator's slot.
    pub const COORDINATOR: Self = Self(0);

    /// Create a worker id.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw index.
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Check if this is the coordinator's slot.
    #[must_use]
    pub const fn is_coordinator(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_coordinator() {
            write!(f, "coordinator")
        } else {
            write!(f, "worker_{}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_range() {
        assert_eq!(Vertex::new(Vertex::MAX).as_u32(), Vertex::MAX);
        assert!(Vertex::try_new(1 << 31).is_none());
        assert_eq!(Vertex::new(7).to_string(), "v7");
    }

    #[test]
    fn deserialize_checks_ranges() {
        assert_eq!(serde_json::from_str::<Vertex>("42").unwrap(), Vertex::new(42));
        let err = serde_json::from_str::<Vertex>("2147483648").unwrap_err();
        assert!(err.to_string().contains("31 bits"));

        let key = Fingerprint::of(b"key");
        let text = serde_json::to_string(&key).unwrap();
        assert_eq!(serde_json::from_str::<Fingerprint>(&text).unwrap(), key);
        assert!(serde_json::from_str::<Fingerprint>("0").is_err());
    }

    #[test]
    #[should_panic(expected = "does not fit in 31 bits")]
    fn vertex_out_of_range_panics() {
        let _ = Vertex::new(u32::MAX);
    }

    #[test]
    fn fingerprint_is_stable_and_non_zero() {
        let a = Fingerprint::of("Foo::bar");
        let b = Fingerprint::of("Foo::bar");
        assert_eq!(a, b);
        assert_ne!(a.as_u64(), 0);
        assert_ne!(a, Fingerprint::of("Foo::baz"));
    }

    #[test]
    #[should_panic(expected = "reserved for empty slots")]
    fn zero_fingerprint_panics() {
        let _ = Fingerprint::new(0);
    }

    #[test]
    fn worker_display() {
        assert_eq!(WorkerId::COORDINATOR.to_string(), "coordinator");
        assert_eq!(WorkerId::new(3).to_string(), "worker_3");
    }
}
