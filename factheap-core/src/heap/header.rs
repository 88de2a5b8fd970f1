//! Heap entry headers and the word type used during compaction.

use crate::types::{align_up, RegionOffset};

/// Heap entries start on 8-byte boundaries.
pub const ENTRY_ALIGNMENT: u64 = 8;

/// Size of the header word.
pub const HEADER_SIZE: u64 = 8;

/// Largest payload a header can describe (31 bits).
pub const MAX_PAYLOAD_SIZE: u64 = (1 << 31) - 1;

const SIZE_SHIFT: u32 = 33;
const KIND_BIT: u64 = 1 << 32;
const ORIGINAL_SHIFT: u32 = 1;
const ORIGINAL_MASK: u64 = (1 << 31) - 1;
const HEADER_BIT: u64 = 1;

/// What the payload bytes represent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntryKind {
    /// Produced by a caller-supplied serializer.
    Serialized = 0,
    /// Bytes stored as given.
    Raw = 1,
}

/// Decoded entry header.
///
/// ```text
///  63 ............ 33   32   31 ............ 1   0
/// ┌──────────────────┬──────┬─────────────────┬───┐
/// │   stored size    │ kind │  original size  │ 1 │
/// └──────────────────┴──────┴─────────────────┴───┘
/// ```
///
/// `original size` is zero unless the payload is compressed. The low bit is
/// always set, which is what tells a header apart from a back-pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    size: u64,
    kind: EntryKind,
    original_size: u64,
}

impl EntryHeader {
    /// Build a header for `size` stored bytes.
    ///
    /// Both sizes must be at most [`MAX_PAYLOAD_SIZE`]; callers check this
    /// before building.
    #[must_use]
    pub fn new(size: u64, kind: EntryKind, original_size: Option<u64>) -> Self {
        debug_assert!(size <= MAX_PAYLOAD_SIZE);
        Self {
            size,
            kind,
            original_size: original_size.unwrap_or(0),
        }
    }

    /// Header for a dead run of `gap` bytes (including the header itself).
    pub(crate) fn filler(gap: u64) -> Self {
        Self::new(gap.saturating_sub(HEADER_SIZE), EntryKind::Raw, None)
    }

    /// Encode to the in-heap word.
    #[must_use]
    pub fn encode(&self) -> u64 {
        let kind = match self.kind {
            EntryKind::Serialized => 0,
            EntryKind::Raw => KIND_BIT,
        };
        (self.size << SIZE_SHIFT)
            | kind
            | ((self.original_size & ORIGINAL_MASK) << ORIGINAL_SHIFT)
            | HEADER_BIT
    }

    /// Decode an in-heap word.
    pub fn decode(word: u64) -> Result<Self, &'static str> {
        if word & HEADER_BIT == 0 {
            return Err("word is not a header (low bit clear)");
        }
        let kind = if word & KIND_BIT != 0 {
            EntryKind::Raw
        } else {
            EntryKind::Serialized
        };
        Ok(Self {
            size: word >> SIZE_SHIFT,
            kind,
            original_size: (word >> ORIGINAL_SHIFT) & ORIGINAL_MASK,
        })
    }

    /// Stored payload bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Payload kind.
    #[must_use]
    pub const fn kind(&self) -> EntryKind {
        self.kind
    }

    /// Pre-compression size, if the payload is compressed.
    #[must_use]
    pub const fn original_size(&self) -> Option<u64> {
        if self.original_size == 0 {
            None
        } else {
            Some(self.original_size)
        }
    }

    /// True when the payload must be decompressed before use.
    #[must_use]
    pub const fn is_compressed(&self) -> bool {
        self.original_size != 0
    }

    /// Header plus payload.
    #[must_use]
    pub const fn total_size(&self) -> u64 {
        HEADER_SIZE + self.size
    }

    /// Bytes the entry occupies in the heap.
    #[must_use]
    pub const fn slot_size(&self) -> u64 {
        align_up(self.total_size(), ENTRY_ALIGNMENT)
    }
}

/// The first word of a heap entry.
///
/// Outside compaction it is always a header. During compaction live entries
/// have their header parked in their hashtable slot and hold a pointer back
/// to that slot instead. Back-pointers are 8-byte aligned offsets, so their
/// low bit is clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapWord {
    /// A header: the entry is dead if seen during compaction.
    Header(EntryHeader),
    /// Offset of the hashtable address field that owns this live entry.
    BackPointer(RegionOffset),
}

impl HeapWord {
    /// Interpret a raw heap word.
    #[must_use]
    pub fn from_raw(word: u64) -> Self {
        match EntryHeader::decode(word) {
            Ok(header) => Self::Header(header),
            Err(_) => Self::BackPointer(RegionOffset::new(word)),
        }
    }

    /// Raw heap word.
    #[must_use]
    pub fn to_raw(self) -> u64 {
        match self {
            Self::Header(header) => header.encode(),
            Self::BackPointer(offset) => {
                debug_assert!(offset.as_u64() % ENTRY_ALIGNMENT == 0);
                offset.as_u64()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_bit_layout() {
        let header = EntryHeader::new(5, EntryKind::Raw, None);
        assert_eq!(header.encode(), (5 << 33) | (1 << 32) | 1);

        let header = EntryHeader::new(3, EntryKind::Serialized, Some(10));
        assert_eq!(header.encode(), (3 << 33) | (10 << 1) | 1);
        assert_eq!(EntryHeader::decode(header.encode()).unwrap(), header);
    }

    #[test]
    fn decode_rejects_even_words() {
        assert!(EntryHeader::decode(0x1000).is_err());
    }

    #[test]
    fn sizes() {
        let header = EntryHeader::new(13, EntryKind::Raw, None);
        assert_eq!(header.total_size(), 21);
        assert_eq!(header.slot_size(), 24);
        assert!(!header.is_compressed());
        assert_eq!(header.original_size(), None);

        let max = EntryHeader::new(MAX_PAYLOAD_SIZE, EntryKind::Serialized, Some(MAX_PAYLOAD_SIZE));
        assert_eq!(EntryHeader::decode(max.encode()).unwrap().size(), MAX_PAYLOAD_SIZE);
    }

    #[test]
    fn heap_word_disambiguation() {
        let header = EntryHeader::new(16, EntryKind::Serialized, None);
        assert_eq!(HeapWord::from_raw(header.encode()), HeapWord::Header(header));

        let back = RegionOffset::new(0x2008);
        assert_eq!(HeapWord::from_raw(back.as_u64()), HeapWord::BackPointer(back));
        assert_eq!(HeapWord::BackPointer(back).to_raw(), 0x2008);
    }

    #[test]
    fn filler_covers_gap() {
        let filler = EntryHeader::filler(40);
        assert_eq!(filler.slot_size(), 40);
    }
}
