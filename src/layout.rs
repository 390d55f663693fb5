//! On-region binary layout: control block, slots, consumer group table.
//!
//! # Region Layout
//!
//! ```text
//! +--------------------------------------------------------------+
//! | ControlBlock (256 bytes, four cache lines)                   |
//! +--------------------------------------------------------------+
//! | Slot[0]  (slot_size bytes: 8-byte header + payload)          |
//! | Slot[1]                                                      |
//! | ...                                                          |
//! | Slot[capacity-1]                                             |
//! +--------------------------------------------------------------+
//! | GroupTable (only when the queue was created for fan-out)     |
//! +--------------------------------------------------------------+
//! ```
//!
//! The control block spreads its mutable state over separate cache lines so
//! the producer's `head` and the consumer's `tail` never share a line:
//!
//! ```text
//! Line 0: magic, version, capacity, slot_size, buffer_offset  (immutable)
//! Line 1: head  (stored only by the producer)
//! Line 2: tail  (stored only by the single consumer)
//! Line 3: reserved
//! ```
//!
//! All counters are monotone u64 sequence numbers; the slot for logical
//! index `i` is `buffer + (i & mask) * slot_size`. Carrying the full 64-bit
//! counters makes `head == tail` unambiguously empty and
//! `head - tail == capacity` unambiguously full, with no wasted slot and no
//! separate count field. At one billion operations per second the counters
//! take over five centuries to wrap.

use std::mem::{offset_of, size_of};
use std::sync::atomic::{AtomicU32, AtomicU64};

/// Cache line size assumed by the layout. Matches contemporary x86-64 and
/// aarch64 parts.
pub const CACHE_LINE: usize = 64;

/// Magic stamped into byte 0 of every region: ASCII "NABD" plus a v1 marker.
pub const REGION_MAGIC: u64 = 0x4442_414E_0001_0000;

/// Magic stamped into the consumer group table when fan-out is enabled.
pub const GROUP_TABLE_MAGIC: u64 = 0x4442_414E_0001_0001;

/// Protocol version, packed `(major << 16) | minor`.
pub const VERSION_MAJOR: u64 = 0;
pub const VERSION_MINOR: u64 = 1;
pub const VERSION: u64 = (VERSION_MAJOR << 16) | VERSION_MINOR;

/// Geometry defaults applied when the creator passes zero.
pub const DEFAULT_CAPACITY: u64 = 1024;
pub const DEFAULT_SLOT_SIZE: u64 = 4096;

/// Fixed size of the consumer group table.
pub const MAX_GROUPS: usize = 16;

/// Bytes of header at the front of every slot.
pub const SLOT_HEADER_SIZE: usize = size_of::<SlotHeader>();

/// Smallest slot that can carry the header plus a minimal payload.
pub const MIN_SLOT_SIZE: u64 = (SLOT_HEADER_SIZE + 8) as u64;

/// Per-message header written at the start of each slot.
///
/// `sequence` records the producer index at publication time and exists for
/// post-mortem inspection only; readers trust `head`, never `sequence`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SlotHeader {
    /// Payload length in bytes.
    pub length: u16,
    /// Reserved, always zero.
    pub flags: u16,
    /// Producer index at the time of the write, truncated to 32 bits.
    pub sequence: u32,
}

/// Control block at offset 0 of the region.
///
/// Field mutability is split by owner: line 0 is written once at creation,
/// `head` is stored only by the producer, `tail` only by the single
/// consumer. Group cursors live in the [`GroupTable`], not here.
#[repr(C, align(64))]
pub struct ControlBlock {
    /// Identifies the region format. [`REGION_MAGIC`] when valid.
    pub magic: u64,
    /// Packed protocol version, compared against [`VERSION`].
    pub version: u64,
    /// Number of slots; always a power of two.
    pub capacity: u64,
    /// Bytes per slot, header included.
    pub slot_size: u64,
    /// Byte offset from the region base to slot 0. Always 256.
    pub buffer_offset: u64,
    _reserved: [u64; 3],

    /// Next write position. Producer-owned.
    pub head: AtomicU64,
    _head_pad: [u64; 7],

    /// Next read position. Consumer-owned.
    pub tail: AtomicU64,
    _tail_pad: [u64; 7],

    _ext: [u64; 8],
}

const _: () = assert!(size_of::<ControlBlock>() == 256);
const _: () = assert!(offset_of!(ControlBlock, head) % CACHE_LINE == 0);
const _: () = assert!(offset_of!(ControlBlock, tail) % CACHE_LINE == 0);
const _: () = assert!(offset_of!(ControlBlock, buffer_offset) == 32);

impl ControlBlock {
    /// Stamp a freshly created (zeroed) control block.
    ///
    /// Must only be called on a region no other process can observe yet.
    pub fn init(&mut self, capacity: u64, slot_size: u64) {
        self.magic = REGION_MAGIC;
        self.version = VERSION;
        self.capacity = capacity;
        self.slot_size = slot_size;
        self.buffer_offset = size_of::<ControlBlock>() as u64;
        *self.head.get_mut() = 0;
        *self.tail.get_mut() = 0;
    }
}

/// One consumer group: a shared read cursor, exactly one cache line.
///
/// `tail` is stored only by handles bound to this group. Multiple handles
/// in one group race on it with release stores; the cursor stays monotone
/// and the group may observe a message twice in that window, never a gap.
#[repr(C, align(64))]
pub struct GroupSlot {
    /// This group's read position.
    pub tail: AtomicU64,
    /// 1 when claimed, 0 when free. Claimed by CAS.
    pub active: AtomicU32,
    /// Group identifier, assigned at claim time.
    pub group_id: AtomicU32,
    _pad: [u64; 6],
}

const _: () = assert!(size_of::<GroupSlot>() == CACHE_LINE);

/// Fan-out extension placed immediately after the last slot.
#[repr(C)]
pub struct GroupTable {
    /// [`GROUP_TABLE_MAGIC`] when the table was initialised.
    pub magic: u64,
    /// Number of entries in `groups`. Always [`MAX_GROUPS`].
    pub num_groups: u64,
    _pad: [u64; 6],
    /// The group entries, each cache-line sized.
    pub groups: [GroupSlot; MAX_GROUPS],
}

const _: () = assert!(size_of::<GroupTable>() == CACHE_LINE + MAX_GROUPS * CACHE_LINE);
const _: () = assert!(offset_of!(GroupTable, groups) == CACHE_LINE);

/// Validated queue geometry, cached on every handle for hot-path addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Slot count, power of two.
    pub capacity: u64,
    /// Bytes per slot, header included.
    pub slot_size: u64,
}

impl Geometry {
    /// Apply creation-time normalisation: zero means default, capacity is
    /// rounded up to the next power of two, slot_size is raised to the
    /// minimum that fits a header and eight payload bytes.
    pub fn normalized(capacity: u64, slot_size: u64) -> Self {
        let capacity = match capacity {
            0 => DEFAULT_CAPACITY,
            n => n.next_power_of_two().max(2),
        };
        let slot_size = match slot_size {
            0 => DEFAULT_SLOT_SIZE,
            n => n.max(MIN_SLOT_SIZE),
        };
        Self {
            capacity,
            slot_size,
        }
    }

    /// Index mask; valid because capacity is a power of two.
    #[inline]
    pub fn mask(&self) -> u64 {
        self.capacity - 1
    }

    /// Largest payload a slot can carry.
    #[inline]
    pub fn max_payload(&self) -> usize {
        self.slot_size as usize - SLOT_HEADER_SIZE
    }

    /// Bytes occupied by the ring of slots.
    #[inline]
    pub fn ring_bytes(&self) -> usize {
        (self.capacity * self.slot_size) as usize
    }

    /// Total region size, with or without the fan-out table.
    pub fn region_size(&self, with_groups: bool) -> usize {
        let base = size_of::<ControlBlock>() + self.ring_bytes();
        if with_groups {
            base + size_of::<GroupTable>()
        } else {
            base
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_block_is_four_cache_lines() {
        assert_eq!(size_of::<ControlBlock>(), 256);
        assert_eq!(offset_of!(ControlBlock, head), 64);
        assert_eq!(offset_of!(ControlBlock, tail), 128);
    }

    #[test]
    fn group_slot_is_one_cache_line() {
        assert_eq!(size_of::<GroupSlot>(), 64);
        assert_eq!(std::mem::align_of::<GroupSlot>(), 64);
    }

    #[test]
    fn slot_header_is_eight_bytes() {
        assert_eq!(SLOT_HEADER_SIZE, 8);
    }

    #[test]
    fn normalization_rounds_capacity_up() {
        let g = Geometry::normalized(1000, 4096);
        assert_eq!(g.capacity, 1024);
        let g = Geometry::normalized(1024, 4096);
        assert_eq!(g.capacity, 1024);
        let g = Geometry::normalized(3, 64);
        assert_eq!(g.capacity, 4);
    }

    #[test]
    fn normalization_applies_defaults() {
        let g = Geometry::normalized(0, 0);
        assert_eq!(g.capacity, DEFAULT_CAPACITY);
        assert_eq!(g.slot_size, DEFAULT_SLOT_SIZE);
    }

    #[test]
    fn normalization_enforces_minimum_slot() {
        let g = Geometry::normalized(4, 5);
        assert_eq!(g.slot_size, MIN_SLOT_SIZE);
    }

    #[test]
    fn region_size_accounts_for_table() {
        let g = Geometry::normalized(4, 64);
        assert_eq!(g.region_size(false), 256 + 4 * 64);
        assert_eq!(
            g.region_size(true),
            256 + 4 * 64 + size_of::<GroupTable>()
        );
    }

    #[test]
    fn init_stamps_the_immutable_line() {
        let mut blk: ControlBlock = unsafe { std::mem::zeroed() };
        blk.init(4, 64);
        assert_eq!(blk.magic, REGION_MAGIC);
        assert_eq!(blk.version, VERSION);
        assert_eq!(blk.capacity, 4);
        assert_eq!(blk.slot_size, 64);
        assert_eq!(blk.buffer_offset, 256);
        assert_eq!(*blk.head.get_mut(), 0);
        assert_eq!(*blk.tail.get_mut(), 0);
    }
}
