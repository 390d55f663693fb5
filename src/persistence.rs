//! Diagnostics, forced recovery, and consumer checkpoints.
//!
//! [`diagnose`] reasons about a region from the outside: it maps only the
//! control block, read-only, and classifies what it finds without touching
//! queue state. [`recover`] is the single repair operation the format
//! supports: moving the tail up to the head, discarding pending messages.
//! Payloads are never inspected or salvaged.
//!
//! Checkpoints persist a consumer group's cursor to an ordinary file so a
//! restarted process can resume where it left off. The file is a fixed
//! 40-byte little-endian record protected by an XOR-and-rotate checksum.

use std::fs;
use std::io;
use std::mem::size_of;
use std::path::Path;
use std::sync::atomic::Ordering;

use crate::consumer::Consumer;
use crate::error::{Error, Result};
use crate::layout::{ControlBlock, REGION_MAGIC, VERSION};
use crate::metrics::now_ns;
use crate::queue::Queue;
use crate::region::ShmRegion;

/// Magic identifying a checkpoint file ("NABDCKPT" packed).
pub const CHECKPOINT_MAGIC: u64 = 0x0043_4B50_5441_4244;

/// Overall classification of an inspected region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    /// Healthy with pending messages.
    Ok,
    /// Healthy and drained.
    Empty,
    /// Integrity check failed (bad magic or impossible counters).
    Corrupted,
    /// Appears abandoned. Never produced by [`diagnose`] today: the
    /// format records no activity timestamp to base it on.
    Stale,
    /// Initialisation never finished.
    Incomplete,
    /// Written by an incompatible protocol version.
    VersionMismatch,
}

/// Result of a read-only region inspection.
#[derive(Debug, Clone, Copy)]
pub struct Diagnostic {
    /// Overall classification.
    pub state: RegionState,
    /// Producer position.
    pub head: u64,
    /// Single-consumer position.
    pub tail: u64,
    /// Pending messages, clamped to zero when the counters are inverted.
    pub pending: u64,
    /// Whether the region magic matched.
    pub magic_ok: bool,
    /// Whether the version matched.
    pub version_ok: bool,
    /// Capacity read from the control block.
    pub capacity: u64,
    /// Slot size read from the control block.
    pub slot_size: u64,
}

/// Inspect a region without modifying it.
///
/// Returns [`Error::NotFound`] when no region of that name exists; any
/// other outcome, including corruption, is reported through the
/// [`Diagnostic`] rather than as an error.
pub fn diagnose(name: &str) -> Result<Diagnostic> {
    let probe = ShmRegion::attach(name, size_of::<ControlBlock>(), false)?;
    // SAFETY: the mapping covers one control block; all mutable fields
    // are atomics, loads from a read-only mapping are fine.
    let ctrl = unsafe { &*probe.as_ptr().cast::<ControlBlock>() };

    let mut diag = Diagnostic {
        state: RegionState::Corrupted,
        head: 0,
        tail: 0,
        pending: 0,
        magic_ok: ctrl.magic == REGION_MAGIC,
        version_ok: false,
        capacity: 0,
        slot_size: 0,
    };
    if !diag.magic_ok {
        return Ok(diag);
    }

    diag.version_ok = ctrl.version == VERSION;
    if !diag.version_ok {
        diag.state = RegionState::VersionMismatch;
        return Ok(diag);
    }

    diag.head = ctrl.head.load(Ordering::Acquire);
    diag.tail = ctrl.tail.load(Ordering::Acquire);
    diag.capacity = ctrl.capacity;
    diag.slot_size = ctrl.slot_size;
    diag.pending = diag.head.saturating_sub(diag.tail);

    diag.state = if diag.pending > diag.capacity {
        RegionState::Corrupted
    } else if diag.pending == 0 {
        RegionState::Empty
    } else {
        RegionState::Ok
    };
    Ok(diag)
}

/// Repair a region, discarding pending messages when `force` is set.
///
/// Healthy regions are left untouched. A corrupted region without `force`
/// fails with [`Error::Corrupted`]; with `force` the tail is moved up to
/// the head, which is the only recovery the format supports.
pub fn recover(name: &str, force: bool) -> Result<()> {
    let diag = diagnose(name)?;

    match diag.state {
        RegionState::Ok | RegionState::Empty => Ok(()),
        RegionState::Corrupted if !force => {
            Err(Error::Corrupted("region damaged, pass force to reset"))
        }
        RegionState::Incomplete => {
            // Half-created region: remove the name so the next producer
            // can recreate it.
            ShmRegion::unlink(name)
        }
        _ if force => {
            let region = ShmRegion::attach(name, size_of::<ControlBlock>(), true)?;
            // SAFETY: writable control-block mapping, atomics only.
            let ctrl = unsafe { &*region.as_ptr().cast::<ControlBlock>() };
            let head = ctrl.head.load(Ordering::Acquire);
            let tail = ctrl.tail.load(Ordering::Acquire);
            ctrl.tail.store(head, Ordering::Release);
            log::warn!(
                "forced recovery of {name}: discarded {} pending messages",
                head.saturating_sub(tail)
            );
            Ok(())
        }
        _ => Ok(()),
    }
}

/// A consumer group's persisted cursor.
///
/// Fixed 40-byte on-disk record:
///
/// ```text
/// Offset  Size  Field
/// 0       8     magic
/// 8       8     timestamp_ns (realtime clock at capture)
/// 16      4     group_id
/// 20      4     padding (zero)
/// 24      8     tail
/// 32      8     checksum
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    /// File format magic.
    pub magic: u64,
    /// Capture time, wall-clock nanoseconds.
    pub timestamp_ns: u64,
    /// Group the cursor belongs to.
    pub group_id: u32,
    /// The group's read position at capture time.
    pub tail: u64,
    /// Integrity check over the fields above.
    pub checksum: u64,
}

/// Serialized size of a checkpoint.
pub const CHECKPOINT_SIZE: usize = 40;

impl Checkpoint {
    fn checksum_of(magic: u64, timestamp_ns: u64, group_id: u32, tail: u64) -> u64 {
        let sum = magic ^ timestamp_ns ^ u64::from(group_id) ^ tail;
        sum.rotate_left(13)
    }

    /// Capture the current cursor of `consumer`.
    pub fn capture(consumer: &Consumer<'_>) -> Self {
        let timestamp_ns = now_ns();
        let group_id = consumer.group_id();
        let tail = consumer.group().tail.load(Ordering::Acquire);
        Self {
            magic: CHECKPOINT_MAGIC,
            timestamp_ns,
            group_id,
            tail,
            checksum: Self::checksum_of(CHECKPOINT_MAGIC, timestamp_ns, group_id, tail),
        }
    }

    /// Serialize to the fixed on-disk record.
    pub fn to_bytes(&self) -> [u8; CHECKPOINT_SIZE] {
        let mut buf = [0u8; CHECKPOINT_SIZE];
        buf[0..8].copy_from_slice(&self.magic.to_le_bytes());
        buf[8..16].copy_from_slice(&self.timestamp_ns.to_le_bytes());
        buf[16..20].copy_from_slice(&self.group_id.to_le_bytes());
        // bytes 20..24 stay zero
        buf[24..32].copy_from_slice(&self.tail.to_le_bytes());
        buf[32..40].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// Parse and verify an on-disk record.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != CHECKPOINT_SIZE {
            return Err(Error::Corrupted("checkpoint file has wrong size"));
        }
        let magic = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let timestamp_ns = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        let group_id = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
        let tail = u64::from_le_bytes(bytes[24..32].try_into().unwrap());
        let checksum = u64::from_le_bytes(bytes[32..40].try_into().unwrap());

        if magic != CHECKPOINT_MAGIC {
            return Err(Error::Corrupted("checkpoint magic mismatch"));
        }
        if checksum != Self::checksum_of(magic, timestamp_ns, group_id, tail) {
            return Err(Error::Corrupted("checkpoint checksum mismatch"));
        }
        Ok(Self {
            magic,
            timestamp_ns,
            group_id,
            tail,
            checksum,
        })
    }
}

/// Persist `consumer`'s cursor to `path`.
///
/// The record is written to a temporary sibling and renamed into place, so
/// a crash mid-write never leaves a torn checkpoint behind.
pub fn checkpoint_save(consumer: &Consumer<'_>, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let ckpt = Checkpoint::capture(consumer);

    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    fs::write(&tmp, ckpt.to_bytes())?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Load and verify a checkpoint from `path`.
pub fn checkpoint_load(path: impl AsRef<Path>) -> Result<Checkpoint> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            Error::NotFound(path.display().to_string())
        } else {
            Error::Sys(e)
        }
    })?;
    Checkpoint::from_bytes(&bytes)
}

impl Queue {
    /// Rebind a consumer group from a checkpoint.
    ///
    /// Joins the group named in the checkpoint, creating it if it no
    /// longer exists, then restores its cursor. A checkpoint ahead of the
    /// current head is clamped to the head: slots that were never
    /// published cannot be read.
    pub fn consumer_resume(&self, ckpt: &Checkpoint) -> Result<Consumer<'_>> {
        let consumer = match self.consumer_join(ckpt.group_id) {
            Ok(c) => c,
            Err(Error::GroupNotFound { .. }) => self.consumer_create(ckpt.group_id)?,
            Err(e) => return Err(e),
        };

        let head = self.ctrl().head.load(Ordering::Acquire);
        consumer
            .group()
            .tail
            .store(ckpt.tail.min(head), Ordering::Release);
        Ok(consumer)
    }

    /// Timestamp of the most recent activity on the region.
    ///
    /// The format records no activity timestamp in-region, so this
    /// currently reports the present time.
    pub fn last_activity(&self) -> u64 {
        now_ns()
    }
}
