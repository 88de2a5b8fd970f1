//! Bit layout of dependency table words.
//!
//! ```text
//!  63   62 ........... 32   31   30 ............ 0
//! ┌────┬─────────────────┬────┬──────────────────┐
//! │NEXT│   next / value  │KEY │   key / value    │
//! └────┴─────────────────┴────┴──────────────────┘
//! ```
//!
//! A bucket head is `(key, KEY) | link`; a list node is `(value, VAL) | link`,
//! where `link` is either the index of the next node (NEXT) or the last
//! value of the list (VAL). Zero is the empty slot.

use crate::types::Vertex;

const NUM_MASK: u64 = (1 << 31) - 1;
const LOW_TAG: u64 = 1 << 31;
const HIGH_TAG: u64 = 1 << 63;

/// Marks an occupied dedup slot, so the pair (0, 0) is not mistaken for empty.
pub(crate) const BINDING_PRESENT: u64 = 1 << 63;

/// Placeholder link written into a freshly claimed node before it is wired.
const UNWIRED: u64 = NUM_MASK;

/// Multiplicative mix followed by a byte swap, so the high-entropy bits of
/// the product land in the low bits used for the slot index.
#[must_use]
pub fn hash_u64(n: u64) -> u64 {
    n.wrapping_mul(0x9e37_79b9_7f4a_7c15).swap_bytes()
}

/// Pack an edge into the 62-bit dedup key.
#[must_use]
pub(crate) fn pack_edge(key: Vertex, val: Vertex) -> u64 {
    (u64::from(key.as_u32()) << 31) | u64::from(val.as_u32())
}

/// Second half of a dependency slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Link {
    /// Last value of the list.
    Value(Vertex),
    /// Index of the next node.
    Next(u64),
}

impl Link {
    fn encode(self) -> u64 {
        match self {
            Link::Value(v) => u64::from(v.as_u32()) << 32,
            Link::Next(index) => ((index & NUM_MASK) << 32) | HIGH_TAG,
        }
    }
}

/// One 64-bit dependency table word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DepSlot(u64);

impl DepSlot {
    pub(crate) const EMPTY: Self = Self(0);

    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub(crate) const fn raw(self) -> u64 {
        self.0
    }

    pub(crate) const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// A bucket head for `key` whose only value is `first`.
    pub(crate) fn head(key: Vertex, first: Vertex) -> Self {
        Self::head_with(key, Link::Value(first))
    }

    /// A bucket head for `key` followed by `link`.
    pub(crate) fn head_with(key: Vertex, link: Link) -> Self {
        Self(u64::from(key.as_u32()) | LOW_TAG | link.encode())
    }

    /// A list node holding `val` followed by `link`.
    pub(crate) fn node(val: Vertex, link: Link) -> Self {
        Self(u64::from(val.as_u32()) | link.encode())
    }

    /// A claimed node whose link is not wired yet. Never zero.
    pub(crate) fn unwired(val: Vertex) -> Self {
        Self::node(val, Link::Next(UNWIRED))
    }

    /// True when this is a bucket head (KEY tag set).
    pub(crate) const fn is_head(self) -> bool {
        self.0 & LOW_TAG != 0
    }

    /// True when this is the bucket head for `key`.
    pub(crate) fn is_head_for(self, key: Vertex) -> bool {
        self.is_head() && self.low() == key
    }

    /// The key of a head or the value of a node.
    pub(crate) fn low(self) -> Vertex {
        Vertex::new((self.0 & NUM_MASK) as u32)
    }

    /// The link half.
    pub(crate) fn link(self) -> Link {
        let num = (self.0 >> 32) & NUM_MASK;
        if self.0 & HIGH_TAG != 0 {
            Link::Next(num)
        } else {
            Link::Value(Vertex::new(num as u32))
        }
    }
}
