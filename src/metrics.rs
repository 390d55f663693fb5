//! Observability: point-in-time metrics, snapshots, throughput.
//!
//! Everything here is derived from the monotone counters with Relaxed
//! loads. These are statistics: no control flow depends on exact values
//! and eventual visibility is acceptable.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::queue::Queue;

/// Detailed queue metrics at a single instant.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueMetrics {
    /// Producer position.
    pub head: u64,
    /// Single-consumer position.
    pub tail: u64,
    /// Messages currently pending.
    pub pending: u64,
    /// Number of slots.
    pub capacity: u64,
    /// Bytes per slot.
    pub slot_size: u64,
    /// Fill percentage, 0 to 100.
    pub fill_pct: u8,
    /// Bytes occupied by pending messages (slot granularity).
    pub used_bytes: u64,
    /// Messages published since creation. Equals head: the counters never
    /// reset, so position doubles as a cumulative count.
    pub total_pushed: u64,
    /// Messages consumed since creation. Equals tail.
    pub total_popped: u64,
}

impl QueueMetrics {
    /// Render as a JSON object.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("metrics serialize to JSON")
    }
}

impl fmt::Display for QueueMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Queue metrics:")?;
        writeln!(
            f,
            "  head: {}, tail: {}, pending: {}",
            self.head, self.tail, self.pending
        )?;
        writeln!(
            f,
            "  capacity: {} slots ({} bytes/slot)",
            self.capacity, self.slot_size
        )?;
        writeln!(
            f,
            "  fill: {}% ({} bytes used)",
            self.fill_pct, self.used_bytes
        )?;
        write!(
            f,
            "  total pushed: {}, popped: {}",
            self.total_pushed, self.total_popped
        )
    }
}

/// Lightweight counter snapshot for rate calculations.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Snapshot {
    /// Wall-clock nanoseconds when the snapshot was taken.
    pub timestamp_ns: u64,
    /// Producer position.
    pub head: u64,
    /// Single-consumer position.
    pub tail: u64,
    /// Cumulative messages pushed (equals head).
    pub pushed: u64,
    /// Cumulative messages popped (equals tail).
    pub popped: u64,
}

impl Snapshot {
    /// Combined push+pop throughput in messages per second between `prev`
    /// and `self`. Zero when no time has passed.
    pub fn throughput_since(&self, prev: &Snapshot) -> u64 {
        let elapsed_ns = self.timestamp_ns.saturating_sub(prev.timestamp_ns);
        if elapsed_ns == 0 {
            return 0;
        }
        let messages = (self.pushed - prev.pushed) + (self.popped - prev.popped);
        messages.saturating_mul(1_000_000_000) / elapsed_ns
    }
}

pub(crate) fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

impl Queue {
    /// Detailed metrics derived from the current counters.
    pub fn metrics(&self) -> QueueMetrics {
        let stats = self.stats();
        let fill_pct = if stats.capacity > 0 {
            ((stats.used * 100) / stats.capacity) as u8
        } else {
            0
        };
        QueueMetrics {
            head: stats.head,
            tail: stats.tail,
            pending: stats.used,
            capacity: stats.capacity,
            slot_size: stats.slot_size,
            fill_pct,
            used_bytes: stats.used * stats.slot_size,
            total_pushed: stats.head,
            total_popped: stats.tail,
        }
    }

    /// Timestamped counter snapshot for [`Snapshot::throughput_since`].
    pub fn snapshot(&self) -> Snapshot {
        let stats = self.stats();
        Snapshot {
            timestamp_ns: now_ns(),
            head: stats.head,
            tail: stats.tail,
            pushed: stats.head,
            popped: stats.tail,
        }
    }
}
