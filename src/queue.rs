//! Queue handle: lifecycle, SPSC data plane, zero-copy guards.
//!
//! # Memory ordering protocol
//!
//! The ring is coordinated entirely by two monotone u64 counters in the
//! control block (plus one cursor per consumer group when fan-out is on):
//!
//! **Producer (push / reserve+commit):**
//! 1. Load `head` with Relaxed (only the producer ever stores it)
//! 2. Load `tail` with Acquire (synchronises with the consumer's Release,
//!    so a slot being reused is no longer read on the other side)
//! 3. Full when `head - tail >= capacity`
//! 4. Write payload, then the slot header, as plain stores
//! 5. Store `head + 1` with Release (publishes every write from step 4)
//!
//! **Consumer (pop / peek+release):**
//! 1. Load `tail` with Relaxed (only this consumer stores it)
//! 2. Load `head` with Acquire (synchronises with the producer's Release,
//!    so header and payload bytes are visible before use)
//! 3. Empty when `tail == head`
//! 4. Read header and payload as plain loads
//! 5. Store `tail + 1` with Release (returns the slot to the producer)
//!
//! The payload bytes themselves are deliberately not atomic: the producer
//! never touches a slot after releasing `head` past it, and the consumer
//! never touches it before acquiring `head` over it, so the plain accesses
//! in step 4 are race-free under the protocol.
//!
//! Carrying full 64-bit counters (never masked except for addressing)
//! removes the classic empty/full ambiguity: `head == tail` is empty and
//! `head - tail == capacity` is full, with every slot usable. At a billion
//! messages per second the counters take centuries to wrap.

use std::cell::Cell;
use std::mem::size_of;
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::backpressure::Watermarks;
use crate::error::{Error, Result};
use crate::layout::{
    ControlBlock, Geometry, GroupTable, SlotHeader, GROUP_TABLE_MAGIC, MAX_GROUPS, MIN_SLOT_SIZE,
    REGION_MAGIC, SLOT_HEADER_SIZE, VERSION,
};
use crate::region::ShmRegion;

/// How to open a queue: name, geometry intent, and role flags.
///
/// Geometry is only meaningful together with `create`; attaching discovers
/// the region's real geometry from its control block.
///
/// # Example
///
/// ```no_run
/// use shmring::OpenOptions;
///
/// let queue = OpenOptions::new("/orders")
///     .capacity(1024)
///     .slot_size(4096)
///     .create(true)
///     .producer(true)
///     .open()?;
/// # Ok::<(), shmring::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct OpenOptions {
    name: String,
    capacity: u64,
    slot_size: u64,
    create: bool,
    producer: bool,
    consumer: bool,
    fan_out: bool,
}

impl OpenOptions {
    /// Start options for the named region (POSIX name, leading slash).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity: 0,
            slot_size: 0,
            create: false,
            producer: false,
            consumer: false,
            fan_out: false,
        }
    }

    /// Slot count. Zero means the default (1024); other values are rounded
    /// up to the next power of two at creation.
    pub fn capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    /// Bytes per slot, header included. Zero means the default (4096).
    pub fn slot_size(mut self, slot_size: u64) -> Self {
        self.slot_size = slot_size;
        self
    }

    /// Create the region if it does not exist. Falls back to attaching
    /// when another process won the creation race.
    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    /// Open as the (single) producer.
    pub fn producer(mut self, producer: bool) -> Self {
        self.producer = producer;
        self
    }

    /// Open as a consumer.
    pub fn consumer(mut self, consumer: bool) -> Self {
        self.consumer = consumer;
        self
    }

    /// Lay out a consumer group table after the ring at creation, enabling
    /// independent consumer groups on this region.
    pub fn fan_out(mut self, fan_out: bool) -> Self {
        self.fan_out = fan_out;
        self
    }

    /// Open the queue.
    pub fn open(&self) -> Result<Queue> {
        if !self.producer && !self.consumer {
            return Err(Error::InvalidArgument(
                "open requires at least one of producer or consumer",
            ));
        }

        if self.create {
            let geometry = Geometry::normalized(self.capacity, self.slot_size);
            match ShmRegion::create(&self.name, geometry.region_size(self.fan_out)) {
                Ok(region) => return Queue::init_created(region, geometry, self.fan_out, self),
                Err(Error::Exists) => {} // lost the race, attach below
                Err(e) => return Err(e),
            }
        }

        Queue::attach_existing(self)
    }
}

/// Queue statistics at a single instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Producer position.
    pub head: u64,
    /// Single-consumer position.
    pub tail: u64,
    /// Number of slots.
    pub capacity: u64,
    /// Messages currently pending (`head - tail`).
    pub used: u64,
    /// Bytes per slot, header included.
    pub slot_size: u64,
}

/// A handle onto a mapped queue region.
///
/// The handle owns only local bookkeeping (cached geometry, the
/// outstanding-reservation flag); all shared state lives in the mapped
/// region and is manipulated through atomics. A handle is `Send` but not
/// `Sync`: one thread drives one handle, and the single-producer contract
/// spans processes, not just threads.
pub struct Queue {
    region: ShmRegion,
    ctrl: NonNull<ControlBlock>,
    buffer: NonNull<u8>,
    groups: Option<NonNull<GroupTable>>,

    // Hot-path geometry, cached off the control block at open.
    capacity: u64,
    mask: u64,
    slot_size: u64,
    max_payload: usize,

    producer: bool,
    reservation: Cell<Option<u64>>,
    watermarks: Cell<Option<Watermarks>>,
}

// SAFETY: all region state is atomic or protocol-partitioned; the Cells
// keep the handle !Sync, which is exactly the intended single-thread use.
unsafe impl Send for Queue {}

impl Queue {
    fn init_created(
        region: ShmRegion,
        geometry: Geometry,
        fan_out: bool,
        opts: &OpenOptions,
    ) -> Result<Self> {
        // SAFETY: the region was created exclusively and is large enough
        // for the control block; nobody else can map it until we return.
        let ctrl = unsafe { &mut *region.as_ptr().cast::<ControlBlock>() };
        ctrl.init(geometry.capacity, geometry.slot_size);

        if fan_out {
            // SAFETY: region_size(true) reserved the table right after the
            // ring; the memory is zeroed, so every group starts free.
            let table = unsafe {
                &mut *region
                    .as_ptr()
                    .add(size_of::<ControlBlock>() + geometry.ring_bytes())
                    .cast::<GroupTable>()
            };
            table.magic = GROUP_TABLE_MAGIC;
            table.num_groups = MAX_GROUPS as u64;
        }

        log::debug!(
            "created queue {} (capacity {}, slot_size {}, fan_out {})",
            region.name(),
            geometry.capacity,
            geometry.slot_size,
            fan_out
        );
        Self::from_region(region, geometry, fan_out, opts.producer)
    }

    fn attach_existing(opts: &OpenOptions) -> Result<Self> {
        // Map just the control block first to learn the geometry.
        let probe = ShmRegion::attach(&opts.name, size_of::<ControlBlock>(), true)?;
        // SAFETY: the probe mapping covers exactly one control block; the
        // immutable line was written before the region became reachable.
        let ctrl = unsafe { &*probe.as_ptr().cast::<ControlBlock>() };
        if ctrl.magic != REGION_MAGIC {
            return Err(Error::InvalidArgument("region magic mismatch"));
        }
        if ctrl.version != VERSION {
            return Err(Error::VersionMismatch {
                found: ctrl.version,
                expected: VERSION,
            });
        }
        let geometry = Geometry {
            capacity: ctrl.capacity,
            slot_size: ctrl.slot_size,
        };
        if !geometry.capacity.is_power_of_two() || geometry.slot_size < MIN_SLOT_SIZE {
            return Err(Error::Corrupted("implausible geometry in control block"));
        }
        drop(probe);

        // Remap at full size. The group table is discovered from the
        // object size, then confirmed by its magic.
        let with_groups = ShmRegion::object_size(&opts.name)? >= geometry.region_size(true);
        let region = ShmRegion::attach(&opts.name, geometry.region_size(with_groups), true)?;

        log::debug!(
            "attached queue {} (capacity {}, slot_size {})",
            region.name(),
            geometry.capacity,
            geometry.slot_size
        );
        Self::from_region(region, geometry, with_groups, opts.producer)
    }

    fn from_region(
        region: ShmRegion,
        geometry: Geometry,
        probe_groups: bool,
        producer: bool,
    ) -> Result<Self> {
        let base = region.as_ptr();
        let ctrl = NonNull::new(base.cast::<ControlBlock>())
            .ok_or(Error::Corrupted("null mapping"))?;
        // SAFETY: the mapping is at least control block + ring bytes.
        let buffer = unsafe { NonNull::new_unchecked(base.add(size_of::<ControlBlock>())) };

        let groups = if probe_groups {
            // SAFETY: probe_groups is only set when the mapping extends
            // past the ring by a full table.
            let table = unsafe {
                base.add(size_of::<ControlBlock>() + geometry.ring_bytes())
                    .cast::<GroupTable>()
            };
            // SAFETY: table points inside the mapping; magic is immutable
            // after table initialisation.
            if unsafe { (*table).magic } == GROUP_TABLE_MAGIC {
                NonNull::new(table)
            } else {
                None
            }
        } else {
            None
        };

        // Payload length travels in a u16 header field.
        let max_payload =
            (geometry.slot_size as usize - SLOT_HEADER_SIZE).min(u16::MAX as usize);

        Ok(Self {
            region,
            ctrl,
            buffer,
            groups,
            capacity: geometry.capacity,
            mask: geometry.mask(),
            slot_size: geometry.slot_size,
            max_payload,
            producer,
            reservation: Cell::new(None),
            watermarks: Cell::new(None),
        })
    }

    // ---------------------------------------------------------------------
    // ADDRESSING
    // ---------------------------------------------------------------------

    #[inline]
    pub(crate) fn ctrl(&self) -> &ControlBlock {
        // SAFETY: ctrl points at the start of the mapping, which lives as
        // long as self.region.
        unsafe { self.ctrl.as_ref() }
    }

    #[inline]
    fn slot_ptr(&self, index: u64) -> *mut u8 {
        // SAFETY: (index & mask) < capacity, so the offset stays inside
        // the ring portion of the mapping.
        unsafe {
            self.buffer
                .as_ptr()
                .add(((index & self.mask) * self.slot_size) as usize)
        }
    }

    #[inline]
    pub(crate) fn header_ptr(&self, index: u64) -> *mut SlotHeader {
        self.slot_ptr(index).cast()
    }

    #[inline]
    pub(crate) fn payload_ptr(&self, index: u64) -> *mut u8 {
        // SAFETY: every slot is at least header + 8 bytes.
        unsafe { self.slot_ptr(index).add(SLOT_HEADER_SIZE) }
    }

    #[inline]
    pub(crate) fn group_table(&self) -> Option<&GroupTable> {
        // SAFETY: when present, the table pointer is inside the mapping
        // and outlives self borrows.
        self.groups.map(|t| unsafe { &*t.as_ptr() })
    }

    /// The slowest read cursor the producer must respect: the minimum tail
    /// across active groups, or the control-block tail when the table is
    /// absent or no group is active.
    pub fn min_tail(&self) -> u64 {
        if let Some(table) = self.group_table() {
            let mut min: Option<u64> = None;
            for group in &table.groups {
                if group.active.load(Ordering::Acquire) == 1 {
                    let tail = group.tail.load(Ordering::Acquire);
                    min = Some(min.map_or(tail, |m| m.min(tail)));
                }
            }
            if let Some(m) = min {
                return m;
            }
        }
        self.ctrl().tail.load(Ordering::Acquire)
    }

    // ---------------------------------------------------------------------
    // PRODUCER API
    // ---------------------------------------------------------------------

    /// Copy `data` into the next slot and publish it.
    ///
    /// Non-blocking: a full ring returns [`Error::Full`] immediately. The
    /// space check honours fan-out by measuring against [`Queue::min_tail`],
    /// so a slot is never recycled while any active group still needs it.
    pub fn push(&self, data: &[u8]) -> Result<()> {
        if data.len() > self.max_payload {
            return Err(Error::TooBig {
                len: data.len(),
                max: self.max_payload,
            });
        }

        let head = self.ctrl().head.load(Ordering::Relaxed);
        let tail = self.min_tail();
        if head.wrapping_sub(tail) >= self.capacity {
            return Err(Error::Full);
        }

        // Plain stores, sequenced before the Release below.
        // SAFETY: the slot at `head` is unpublished (head has not moved
        // past it) and reclaimed (the full check above), so no reader
        // touches it.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.payload_ptr(head), data.len());
            self.header_ptr(head).write(SlotHeader {
                length: data.len() as u16,
                flags: 0,
                sequence: head as u32,
            });
        }

        self.ctrl().head.store(head + 1, Ordering::Release);
        Ok(())
    }

    /// Reserve the next slot for zero-copy writing.
    ///
    /// At most one reservation may be outstanding per handle; a second
    /// call while a [`Reservation`] is live fails with
    /// [`Error::ReservationPending`]. Dropping the guard without
    /// committing abandons the slot: nothing is published and the bytes
    /// are reused by the next reservation or push.
    pub fn reserve(&self, len: usize) -> Result<Reservation<'_>> {
        if self.reservation.get().is_some() {
            return Err(Error::ReservationPending);
        }
        if len > self.max_payload {
            return Err(Error::TooBig {
                len,
                max: self.max_payload,
            });
        }

        let head = self.ctrl().head.load(Ordering::Relaxed);
        let tail = self.min_tail();
        if head.wrapping_sub(tail) >= self.capacity {
            return Err(Error::Full);
        }

        self.reservation.set(Some(head));
        Ok(Reservation {
            queue: self,
            pos: head,
            len,
        })
    }

    // ---------------------------------------------------------------------
    // CONSUMER API (single-consumer cursor)
    // ---------------------------------------------------------------------

    /// Copy the next message into `buf`, returning its length.
    ///
    /// A buffer smaller than the message fails with
    /// [`Error::BufferTooSmall`] carrying the required size, and the
    /// message stays in the queue.
    pub fn pop(&self, buf: &mut [u8]) -> Result<usize> {
        let tail = self.ctrl().tail.load(Ordering::Relaxed);
        let head = self.ctrl().head.load(Ordering::Acquire);
        if tail == head {
            return Err(Error::Empty);
        }

        // SAFETY: tail < head, so this slot was published by a Release
        // store of head that our Acquire load synchronised with.
        let header = unsafe { self.header_ptr(tail).read() };
        let len = header.length as usize;
        if len > buf.len() {
            return Err(Error::BufferTooSmall { required: len });
        }

        // SAFETY: same slot as above; the copy happens before we release
        // the slot back to the producer.
        unsafe {
            ptr::copy_nonoverlapping(self.payload_ptr(tail), buf.as_mut_ptr(), len);
        }

        self.ctrl().tail.store(tail + 1, Ordering::Release);
        Ok(len)
    }

    /// Borrow the next message in place without consuming it.
    ///
    /// Repeated peeks observe the same message until [`Peek::release`]
    /// advances the cursor.
    pub fn peek(&self) -> Result<Peek<'_>> {
        let tail = self.ctrl().tail.load(Ordering::Relaxed);
        let head = self.ctrl().head.load(Ordering::Acquire);
        if tail == head {
            return Err(Error::Empty);
        }

        // SAFETY: slot published, see pop.
        let header = unsafe { self.header_ptr(tail).read() };
        Ok(Peek {
            cursor: &self.ctrl().tail,
            pos: tail,
            data: self.payload_ptr(tail),
            len: header.length as usize,
            _queue: std::marker::PhantomData,
        })
    }

    // ---------------------------------------------------------------------
    // QUERIES
    // ---------------------------------------------------------------------

    /// Positions and occupancy at a single instant.
    pub fn stats(&self) -> Stats {
        let head = self.ctrl().head.load(Ordering::Relaxed);
        let tail = self.ctrl().tail.load(Ordering::Relaxed);
        Stats {
            head,
            tail,
            capacity: self.capacity,
            used: head.saturating_sub(tail),
            slot_size: self.slot_size,
        }
    }

    /// True when no message is pending for the single-consumer cursor.
    pub fn is_empty(&self) -> bool {
        let tail = self.ctrl().tail.load(Ordering::Relaxed);
        let head = self.ctrl().head.load(Ordering::Acquire);
        tail == head
    }

    /// True when the producer has no slot available. Honours fan-out the
    /// same way [`Queue::push`] does.
    pub fn is_full(&self) -> bool {
        let head = self.ctrl().head.load(Ordering::Relaxed);
        head.wrapping_sub(self.min_tail()) >= self.capacity
    }

    /// Number of slots.
    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes per slot, header included.
    #[inline]
    pub fn slot_size(&self) -> u64 {
        self.slot_size
    }

    /// Largest payload a single message can carry.
    #[inline]
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Region name this handle is attached to.
    #[inline]
    pub fn name(&self) -> &str {
        self.region.name()
    }

    /// Whether this handle was opened as the producer.
    #[inline]
    pub fn is_producer(&self) -> bool {
        self.producer
    }

    /// Whether this region carries a consumer group table.
    #[inline]
    pub fn has_group_table(&self) -> bool {
        self.groups.is_some()
    }

    pub(crate) fn watermarks_cell(&self) -> &Cell<Option<Watermarks>> {
        &self.watermarks
    }

    pub(crate) fn clear_reservation(&self) {
        self.reservation.set(None);
    }

    /// Remove the region name from the namespace. Existing mappings stay
    /// valid; the backing memory is freed when the last one drops.
    pub fn unlink(name: &str) -> Result<()> {
        ShmRegion::unlink(name)
    }
}

/// Zero-copy write guard returned by [`Queue::reserve`].
///
/// Write through [`Reservation::payload`], then [`commit`](Self::commit)
/// to publish. Dropping the guard uncommitted leaves the slot invisible
/// to every consumer.
pub struct Reservation<'q> {
    queue: &'q Queue,
    pos: u64,
    len: usize,
}

impl Reservation<'_> {
    /// The reserved payload bytes, writable in place in shared memory.
    #[inline]
    pub fn payload(&mut self) -> &mut [u8] {
        // SAFETY: the slot at pos is unpublished and owned by this guard
        // until commit or drop; len was bounded by max_payload.
        unsafe { slice::from_raw_parts_mut(self.queue.payload_ptr(self.pos), self.len) }
    }

    /// Number of bytes reserved.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when zero bytes were reserved.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Publish `len` bytes (at most the reserved length) to consumers.
    ///
    /// On error nothing is published and the reservation is abandoned.
    pub fn commit(self, len: usize) -> Result<()> {
        if len > self.len {
            return Err(Error::CommitExceedsReservation {
                committed: len,
                reserved: self.len,
            });
        }

        // SAFETY: still the unpublished slot owned by this guard; the
        // header write is sequenced before the Release below.
        unsafe {
            self.queue.header_ptr(self.pos).write(SlotHeader {
                length: len as u16,
                flags: 0,
                sequence: self.pos as u32,
            });
        }
        self.queue
            .ctrl()
            .head
            .store(self.pos + 1, Ordering::Release);
        Ok(())
        // Drop clears the outstanding flag.
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.queue.clear_reservation();
    }
}

/// Zero-copy read guard returned by [`Queue::peek`] and
/// [`Consumer::peek`](crate::Consumer::peek).
///
/// The payload borrow is valid for the life of the guard;
/// [`release`](Self::release) consumes the guard and the message with it.
/// Dropping without releasing leaves the message in place.
pub struct Peek<'q> {
    pub(crate) cursor: &'q AtomicU64,
    pub(crate) pos: u64,
    pub(crate) data: *const u8,
    pub(crate) len: usize,
    pub(crate) _queue: std::marker::PhantomData<&'q Queue>,
}

impl Peek<'_> {
    /// The message bytes, read directly from shared memory.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        // SAFETY: the slot stays published and unreclaimed at least until
        // this cursor advances past it, which only release() does.
        unsafe { slice::from_raw_parts(self.data, self.len) }
    }

    /// Message length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-length message.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Consume the message: advance the cursor past it. Any pointer
    /// previously obtained from this peek must not be used afterwards.
    pub fn release(self) {
        self.cursor.store(self.pos + 1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("/shmring_q_{tag}_{ts}")
    }

    fn open_pair(tag: &str, capacity: u64, slot_size: u64) -> (Queue, Queue, String) {
        let name = unique_name(tag);
        let producer = OpenOptions::new(&name)
            .capacity(capacity)
            .slot_size(slot_size)
            .create(true)
            .producer(true)
            .open()
            .unwrap();
        let consumer = OpenOptions::new(&name).consumer(true).open().unwrap();
        (producer, consumer, name)
    }

    #[test]
    fn open_requires_a_role() {
        let name = unique_name("role");
        assert!(matches!(
            OpenOptions::new(&name).create(true).open(),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn push_pop_roundtrip() {
        let (producer, consumer, name) = open_pair("rt", 8, 64);

        producer.push(b"hello").unwrap();
        let mut buf = [0u8; 64];
        let n = consumer.pop(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert!(matches!(consumer.pop(&mut buf), Err(Error::Empty)));

        Queue::unlink(&name).unwrap();
    }

    #[test]
    fn full_and_empty_oracles_track_counters() {
        let (producer, consumer, name) = open_pair("oracle", 2, 32);

        assert!(producer.is_empty());
        assert!(!producer.is_full());

        producer.push(b"x").unwrap();
        producer.push(b"y").unwrap();
        assert!(producer.is_full());
        assert!(matches!(producer.push(b"z"), Err(Error::Full)));

        let mut buf = [0u8; 32];
        consumer.pop(&mut buf).unwrap();
        assert!(!producer.is_full());
        producer.push(b"z").unwrap();

        assert_eq!(&buf[..1], b"x");
        consumer.pop(&mut buf).unwrap();
        assert_eq!(&buf[..1], b"y");
        consumer.pop(&mut buf).unwrap();
        assert_eq!(&buf[..1], b"z");
        assert!(consumer.is_empty());

        Queue::unlink(&name).unwrap();
    }

    #[test]
    fn payload_bounds() {
        let (producer, consumer, name) = open_pair("bounds", 4, 32);
        let max = producer.max_payload();
        assert_eq!(max, 24);

        producer.push(&vec![0xAB; max]).unwrap();
        assert!(matches!(
            producer.push(&vec![0xAB; max + 1]),
            Err(Error::TooBig { .. })
        ));

        let mut small = [0u8; 4];
        assert!(matches!(
            consumer.pop(&mut small),
            Err(Error::BufferTooSmall { required }) if required == max
        ));
        // The message survived the failed pop.
        let mut buf = [0u8; 32];
        assert_eq!(consumer.pop(&mut buf).unwrap(), max);

        Queue::unlink(&name).unwrap();
    }

    #[test]
    fn zero_length_message() {
        let (producer, consumer, name) = open_pair("zero", 4, 32);
        producer.push(b"").unwrap();
        let mut buf = [0u8; 32];
        assert_eq!(consumer.pop(&mut buf).unwrap(), 0);
        Queue::unlink(&name).unwrap();
    }

    #[test]
    fn reserve_commit_matches_push() {
        let (producer, consumer, name) = open_pair("reserve", 4, 32);

        let mut reservation = producer.reserve(20).unwrap();
        reservation.payload().fill(0xAA);
        reservation.commit(20).unwrap();

        let mut buf = [0u8; 32];
        let n = consumer.pop(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0xAA; 20]);

        Queue::unlink(&name).unwrap();
    }

    #[test]
    fn single_outstanding_reservation() {
        let (producer, _consumer, name) = open_pair("single", 4, 32);

        let first = producer.reserve(8).unwrap();
        assert!(matches!(
            producer.reserve(8),
            Err(Error::ReservationPending)
        ));
        drop(first);

        // An abandoned reservation publishes nothing and frees the handle.
        assert!(producer.is_empty());
        let again = producer.reserve(8).unwrap();
        again.commit(8).unwrap();
        assert_eq!(producer.stats().head, 1);

        Queue::unlink(&name).unwrap();
    }

    #[test]
    fn commit_cannot_exceed_reservation() {
        let (producer, _consumer, name) = open_pair("commitlen", 4, 32);
        let reservation = producer.reserve(8).unwrap();
        assert!(matches!(
            reservation.commit(9),
            Err(Error::CommitExceedsReservation {
                committed: 9,
                reserved: 8
            })
        ));
        // Nothing was published.
        assert!(producer.is_empty());
        Queue::unlink(&name).unwrap();
    }

    #[test]
    fn commit_may_shrink() {
        let (producer, consumer, name) = open_pair("shrink", 4, 32);
        let mut reservation = producer.reserve(16).unwrap();
        reservation.payload()[..5].copy_from_slice(b"short");
        reservation.commit(5).unwrap();

        let mut buf = [0u8; 32];
        assert_eq!(consumer.pop(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"short");
        Queue::unlink(&name).unwrap();
    }

    #[test]
    fn peek_is_idempotent_until_release() {
        let (producer, consumer, name) = open_pair("peek", 4, 64);
        producer.push(b"stay").unwrap();

        for _ in 0..3 {
            let peek = consumer.peek().unwrap();
            assert_eq!(peek.payload(), b"stay");
            // Dropped without release: message remains.
        }

        let peek = consumer.peek().unwrap();
        assert_eq!(peek.payload(), b"stay");
        peek.release();
        assert!(matches!(consumer.peek(), Err(Error::Empty)));

        Queue::unlink(&name).unwrap();
    }

    #[test]
    fn wrap_around_preserves_data_and_monotonicity() {
        let (producer, consumer, name) = open_pair("wrap", 4, 32);
        let mut buf = [0u8; 32];

        for round in 0..40u64 {
            let msg = round.to_le_bytes();
            producer.push(&msg).unwrap();
            let n = consumer.pop(&mut buf).unwrap();
            assert_eq!(&buf[..n], &msg);
        }

        let stats = producer.stats();
        assert_eq!(stats.head, 40);
        assert_eq!(stats.tail, 40);
        assert_eq!(stats.used, 0);

        Queue::unlink(&name).unwrap();
    }

    #[test]
    fn attach_discovers_geometry() {
        let name = unique_name("geom");
        let producer = OpenOptions::new(&name)
            .capacity(100) // rounds up to 128
            .slot_size(10) // raised to the 16-byte minimum
            .create(true)
            .producer(true)
            .open()
            .unwrap();
        assert_eq!(producer.capacity(), 128);
        assert_eq!(producer.slot_size(), 16);

        let consumer = OpenOptions::new(&name).consumer(true).open().unwrap();
        assert_eq!(consumer.capacity(), 128);
        assert_eq!(consumer.slot_size(), 16);

        Queue::unlink(&name).unwrap();
    }

    #[test]
    fn create_falls_back_to_attach() {
        let name = unique_name("race");
        let first = OpenOptions::new(&name)
            .capacity(8)
            .slot_size(64)
            .create(true)
            .producer(true)
            .open()
            .unwrap();

        // Second creator loses the race and attaches instead.
        let second = OpenOptions::new(&name)
            .capacity(999)
            .slot_size(999)
            .create(true)
            .consumer(true)
            .open()
            .unwrap();
        assert_eq!(second.capacity(), first.capacity());
        assert_eq!(second.slot_size(), first.slot_size());

        Queue::unlink(&name).unwrap();
    }

    #[test]
    fn attach_missing_region_fails() {
        let name = unique_name("absent");
        assert!(matches!(
            OpenOptions::new(&name).consumer(true).open(),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn peek_after_partial_drain() {
        let (producer, consumer, name) = open_pair("drain", 4, 64);
        for _ in 0..3 {
            producer.push(b"m").unwrap();
        }
        let mut buf = [0u8; 64];
        consumer.pop(&mut buf).unwrap();
        consumer.pop(&mut buf).unwrap();
        assert_eq!(consumer.stats().tail, 2);

        let peek = consumer.peek().unwrap();
        assert_eq!(peek.len(), 1);
        peek.release();
        assert_eq!(consumer.stats(), producer.stats());
        assert!(consumer.is_empty());
        Queue::unlink(&name).unwrap();
    }
}
