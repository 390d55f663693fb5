//! Error types for queue operations.

use std::io;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when operating on a shared-memory queue.
///
/// `Empty` and `Full` are ordinary operating states, not failures: pollers
/// see them on every idle cycle and are expected to retry or back off.
/// Everything else indicates a caller mistake, a missing resource, or a
/// damaged region.
#[derive(Debug, Error)]
pub enum Error {
    /// No message is available for this reader right now.
    #[error("queue is empty")]
    Empty,

    /// No slot is available for the producer right now.
    #[error("queue is full")]
    Full,

    /// Every consumer group slot is claimed.
    #[error("all {max} consumer group slots are claimed")]
    GroupsExhausted {
        /// Fixed size of the group table.
        max: usize,
    },

    /// Payload does not fit in a slot.
    #[error("message of {len} bytes exceeds slot payload capacity of {max}")]
    TooBig {
        /// Length the caller attempted to enqueue.
        len: usize,
        /// Largest payload this queue's slots can hold.
        max: usize,
    },

    /// The caller's receive buffer is smaller than the pending message.
    #[error("receive buffer too small, next message is {required} bytes")]
    BufferTooSmall {
        /// Size the buffer must have for the pop to succeed.
        required: usize,
    },

    /// A zero-copy reservation is already outstanding on this handle.
    #[error("a reservation is already outstanding on this handle")]
    ReservationPending,

    /// `commit` was asked to publish more bytes than were reserved.
    #[error("cannot commit {committed} bytes, only {reserved} were reserved")]
    CommitExceedsReservation {
        /// Bytes passed to `commit`.
        committed: usize,
        /// Bytes originally reserved.
        reserved: usize,
    },

    /// The region was not created with a consumer group table.
    #[error("region has no consumer group table")]
    NoGroupTable,

    /// No active group carries this identifier.
    #[error("consumer group {group_id} not found")]
    GroupNotFound {
        /// Identifier the caller asked for.
        group_id: u32,
    },

    /// Malformed shared-memory object name.
    #[error("invalid shared memory name {0:?}")]
    InvalidName(String),

    /// A caller-supplied argument or configuration value is out of range.
    #[error("{0}")]
    InvalidArgument(&'static str),

    /// Exclusive creation failed because the region already exists.
    #[error("region already exists")]
    Exists,

    /// The named region or file does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// On-region or on-file integrity check failed.
    #[error("corrupted: {0}")]
    Corrupted(&'static str),

    /// The region was written by an incompatible protocol version.
    #[error("protocol version mismatch (found {found:#x}, expected {expected:#x})")]
    VersionMismatch {
        /// Version stamped in the region.
        found: u64,
        /// Version this build speaks.
        expected: u64,
    },

    /// The host denied access to the region.
    #[error("permission denied")]
    PermissionDenied,

    /// A host syscall failed.
    #[error("system error: {0}")]
    Sys(#[from] io::Error),
}

impl Error {
    /// Stable numeric code for the error, matching the wire-level contract
    /// used by non-Rust peers of this format. Success is `Ok(())` and has
    /// no code here.
    pub fn code(&self) -> i32 {
        match self {
            Error::Empty => -1,
            Error::Full => -2,
            Error::GroupsExhausted { .. } => -3,
            Error::ReservationPending
            | Error::CommitExceedsReservation { .. }
            | Error::NoGroupTable
            | Error::InvalidName(_)
            | Error::InvalidArgument(_) => -4,
            Error::Exists => -5,
            Error::NotFound(_) | Error::GroupNotFound { .. } => -6,
            Error::TooBig { .. } | Error::BufferTooSmall { .. } => -7,
            Error::Corrupted(_) => -8,
            Error::VersionMismatch { .. } => -9,
            Error::PermissionDenied => -10,
            Error::Sys(_) => -11,
        }
    }

    /// Returns `true` for the transient operating states a caller should
    /// simply retry (`Empty`, `Full`).
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Empty | Error::Full)
    }
}

/// Translate a raw errno from a failed shm syscall into the crate error.
pub(crate) fn from_errno(name: &str) -> Error {
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EEXIST) => Error::Exists,
        Some(libc::ENOENT) => Error::NotFound(name.to_string()),
        Some(libc::EACCES) | Some(libc::EPERM) => Error::PermissionDenied,
        _ => Error::Sys(err),
    }
}
