//! shmring - Lock-Free Shared-Memory Ring Queue
//!
//! A single-node IPC queue backed by a POSIX shared-memory region. One
//! producer writes fixed-maximum-size messages into a ring of slots; one
//! consumer (or several independent consumer groups) reads them with no
//! locks and no syscalls on the hot path.
//!
//! # Key Features
//!
//! - Cache-line separated head/tail counters (no false sharing)
//! - Acquire/release publication protocol over monotone u64 counters
//! - Zero-copy reserve/commit writes and peek/release reads
//! - Consumer groups with independent cursors and min-tail reclamation
//! - Detached diagnostics, forced recovery, and checkpoint/resume
//! - Opt-in backpressure wrappers (the core never blocks)
//!
//! # Example
//!
//! ```no_run
//! use shmring::OpenOptions;
//!
//! // Producer process
//! let queue = OpenOptions::new("/myqueue")
//!     .capacity(1024)
//!     .slot_size(4096)
//!     .create(true)
//!     .producer(true)
//!     .open()?;
//! queue.push(b"hello")?;
//!
//! // Consumer process
//! let queue = OpenOptions::new("/myqueue").consumer(true).open()?;
//! let mut buf = [0u8; 4096];
//! let len = queue.pop(&mut buf)?;
//! assert_eq!(&buf[..len], b"hello");
//! # Ok::<(), shmring::Error>(())
//! ```
//!
//! # Crash behaviour
//!
//! A producer dying between writing a slot and publishing `head` loses
//! that message; nothing ever observes it. A consumer dying between
//! copying a payload and releasing its cursor causes that one message to
//! be redelivered to the next reader in the group, so consumers must
//! tolerate at-least-once delivery across crashes. [`checkpoint_save`]
//! and [`Queue::consumer_resume`] give applications coarser-grained
//! recovery points on top.

mod backpressure;
mod consumer;
mod error;
mod layout;
mod metrics;
mod persistence;
mod queue;
mod region;

pub use backpressure::Watermarks;
pub use consumer::{Consumer, GroupStats};
pub use error::{Error, Result};
pub use layout::{
    Geometry, DEFAULT_CAPACITY, DEFAULT_SLOT_SIZE, MAX_GROUPS, REGION_MAGIC, SLOT_HEADER_SIZE,
    VERSION,
};
pub use metrics::{QueueMetrics, Snapshot};
pub use persistence::{
    checkpoint_load, checkpoint_save, diagnose, recover, Checkpoint, Diagnostic, RegionState,
    CHECKPOINT_MAGIC, CHECKPOINT_SIZE,
};
pub use queue::{OpenOptions, Peek, Queue, Reservation, Stats};
