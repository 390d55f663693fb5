//! Consumer groups: independent fan-out cursors over one ring.
//!
//! Each group is a shared read cursor in the region's [`GroupTable`]. A
//! group sees the full message stream from the moment it is created;
//! different groups never steal from each other. Handles bound to the
//! *same* group do compete: their release stores race on the group tail,
//! the cursor stays monotone, and in that window one message can be
//! observed by two handles. Callers needing strict one-delivery within a
//! group serialise externally or use separate groups.
//!
//! Claiming a group is the only compare-and-swap in the whole protocol:
//! `active` goes 0 to 1 with acquire-release ordering, after which the
//! winner owns the entry and stamps its identifier and starting cursor.
//!
//! Group identity is shared between processes, so dropping a [`Consumer`]
//! handle leaves its group active. Groups are reclaimed by recreating the
//! region.

use std::sync::atomic::Ordering;

use crate::error::{Error, Result};
use crate::layout::{GroupSlot, GroupTable, MAX_GROUPS};
use crate::queue::{Peek, Queue};

/// Statistics for one consumer group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupStats {
    /// Group identifier.
    pub group_id: u32,
    /// Whether the group slot is claimed.
    pub active: bool,
    /// The group's read position.
    pub tail: u64,
    /// Messages between this group and the producer (`head - tail`).
    pub lag: u64,
}

/// A consumer handle bound to one group of a fan-out queue.
///
/// Created by [`Queue::consumer_create`] or [`Queue::consumer_join`].
/// Dropping the handle releases only process-local state; the group keeps
/// consuming identity in shared memory.
pub struct Consumer<'q> {
    queue: &'q Queue,
    group: &'q GroupSlot,
    group_id: u32,
}

impl Queue {
    fn require_table(&self) -> Result<&GroupTable> {
        self.group_table().ok_or(Error::NoGroupTable)
    }

    /// Claim a free group slot and bind a handle to it.
    ///
    /// Passing `group_id == 0` derives an identifier from the claimed slot
    /// index. The new group's cursor starts at the current head: it
    /// consumes only messages published after it joined.
    pub fn consumer_create(&self, group_id: u32) -> Result<Consumer<'_>> {
        let table = self.require_table()?;

        for (index, group) in table.groups.iter().enumerate() {
            if group
                .active
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let id = if group_id == 0 {
                    index as u32 + 1
                } else {
                    group_id
                };
                group.group_id.store(id, Ordering::Release);

                // Start at the current head so history is skipped.
                let head = self.ctrl().head.load(Ordering::Acquire);
                group.tail.store(head, Ordering::Release);

                log::debug!("claimed consumer group {id} on {}", self.name());
                return Ok(Consumer {
                    queue: self,
                    group,
                    group_id: id,
                });
            }
        }

        Err(Error::GroupsExhausted { max: MAX_GROUPS })
    }

    /// Bind another handle to an already-active group.
    ///
    /// Handles sharing a group share its cursor (work-sharing semantics).
    pub fn consumer_join(&self, group_id: u32) -> Result<Consumer<'_>> {
        let table = self.require_table()?;

        for group in &table.groups {
            if group.active.load(Ordering::Acquire) == 1
                && group.group_id.load(Ordering::Acquire) == group_id
            {
                return Ok(Consumer {
                    queue: self,
                    group,
                    group_id,
                });
            }
        }

        Err(Error::GroupNotFound { group_id })
    }

    /// Statistics for every claimed group.
    pub fn group_stats(&self) -> Result<Vec<GroupStats>> {
        let table = self.require_table()?;
        let head = self.ctrl().head.load(Ordering::Acquire);

        Ok(table
            .groups
            .iter()
            .filter(|g| g.active.load(Ordering::Acquire) == 1)
            .map(|g| {
                let tail = g.tail.load(Ordering::Acquire);
                GroupStats {
                    group_id: g.group_id.load(Ordering::Acquire),
                    active: true,
                    tail,
                    lag: head.saturating_sub(tail),
                }
            })
            .collect())
    }
}

impl<'q> Consumer<'q> {
    /// Identifier of the bound group.
    #[inline]
    pub fn group_id(&self) -> u32 {
        self.group_id
    }

    /// The queue this consumer reads from.
    #[inline]
    pub fn queue(&self) -> &'q Queue {
        self.queue
    }

    pub(crate) fn group(&self) -> &'q GroupSlot {
        self.group
    }

    /// Copy this group's next message into `buf`, returning its length.
    pub fn pop(&self, buf: &mut [u8]) -> Result<usize> {
        let tail = self.group.tail.load(Ordering::Relaxed);
        let head = self.queue.ctrl().head.load(Ordering::Acquire);
        if tail >= head {
            return Err(Error::Empty);
        }

        // SAFETY: tail < head, so the slot was published by a Release
        // store our Acquire load synchronised with.
        let header = unsafe { self.queue.header_ptr(tail).read() };
        let len = header.length as usize;
        if len > buf.len() {
            return Err(Error::BufferTooSmall { required: len });
        }

        // SAFETY: same published slot; copied before the cursor moves.
        unsafe {
            std::ptr::copy_nonoverlapping(self.queue.payload_ptr(tail), buf.as_mut_ptr(), len);
        }

        self.group.tail.store(tail + 1, Ordering::Release);
        Ok(len)
    }

    /// Borrow this group's next message without consuming it.
    pub fn peek(&self) -> Result<Peek<'q>> {
        let tail = self.group.tail.load(Ordering::Relaxed);
        let head = self.queue.ctrl().head.load(Ordering::Acquire);
        if tail >= head {
            return Err(Error::Empty);
        }

        // SAFETY: published slot, see pop.
        let header = unsafe { self.queue.header_ptr(tail).read() };
        Ok(Peek {
            cursor: &self.group.tail,
            pos: tail,
            data: self.queue.payload_ptr(tail),
            len: header.length as usize,
            _queue: std::marker::PhantomData,
        })
    }

    /// True when this group has consumed everything published so far.
    pub fn is_empty(&self) -> bool {
        let tail = self.group.tail.load(Ordering::Relaxed);
        let head = self.queue.ctrl().head.load(Ordering::Acquire);
        tail >= head
    }

    /// Statistics for the bound group.
    pub fn stats(&self) -> GroupStats {
        let head = self.queue.ctrl().head.load(Ordering::Acquire);
        let tail = self.group.tail.load(Ordering::Acquire);
        GroupStats {
            group_id: self.group_id,
            active: self.group.active.load(Ordering::Acquire) == 1,
            tail,
            lag: head.saturating_sub(tail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OpenOptions;

    fn unique_name(tag: &str) -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("/shmring_c_{tag}_{ts}")
    }

    fn fan_out_queue(tag: &str, capacity: u64) -> (Queue, String) {
        let name = unique_name(tag);
        let queue = OpenOptions::new(&name)
            .capacity(capacity)
            .slot_size(64)
            .create(true)
            .producer(true)
            .fan_out(true)
            .open()
            .unwrap();
        (queue, name)
    }

    #[test]
    fn groups_need_a_table() {
        let name = unique_name("notable");
        let queue = OpenOptions::new(&name)
            .capacity(4)
            .slot_size(64)
            .create(true)
            .producer(true)
            .open()
            .unwrap();
        assert!(matches!(
            queue.consumer_create(0),
            Err(Error::NoGroupTable)
        ));
        Queue::unlink(&name).unwrap();
    }

    #[test]
    fn groups_consume_independently() {
        let (queue, name) = fan_out_queue("indep", 16);
        let g1 = queue.consumer_create(1).unwrap();
        let g2 = queue.consumer_create(2).unwrap();

        for i in 0..10u8 {
            queue.push(&[i]).unwrap();
        }

        let mut buf = [0u8; 64];
        for i in 0..10u8 {
            assert_eq!(g1.pop(&mut buf).unwrap(), 1);
            assert_eq!(buf[0], i);
        }
        assert!(matches!(g1.pop(&mut buf), Err(Error::Empty)));

        // Group 2 still sees the entire stream.
        for i in 0..10u8 {
            assert_eq!(g2.pop(&mut buf).unwrap(), 1);
            assert_eq!(buf[0], i);
        }

        Queue::unlink(&name).unwrap();
    }

    #[test]
    fn new_group_starts_at_head() {
        let (queue, name) = fan_out_queue("athead", 16);
        queue.push(b"old").unwrap();
        queue.push(b"old").unwrap();

        let late = queue.consumer_create(7).unwrap();
        let mut buf = [0u8; 64];
        assert!(matches!(late.pop(&mut buf), Err(Error::Empty)));

        queue.push(b"new").unwrap();
        assert_eq!(late.pop(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"new");

        Queue::unlink(&name).unwrap();
    }

    #[test]
    fn derived_group_ids_start_at_one() {
        let (queue, name) = fan_out_queue("derive", 4);
        let a = queue.consumer_create(0).unwrap();
        let b = queue.consumer_create(0).unwrap();
        assert_eq!(a.group_id(), 1);
        assert_eq!(b.group_id(), 2);
        Queue::unlink(&name).unwrap();
    }

    #[test]
    fn table_exhaustion() {
        let (queue, name) = fan_out_queue("exhaust", 4);
        let mut held = Vec::new();
        for _ in 0..MAX_GROUPS {
            held.push(queue.consumer_create(0).unwrap());
        }
        assert!(matches!(
            queue.consumer_create(0),
            Err(Error::GroupsExhausted { max }) if max == MAX_GROUPS
        ));
        Queue::unlink(&name).unwrap();
    }

    #[test]
    fn join_shares_the_cursor() {
        let (queue, name) = fan_out_queue("join", 16);
        let creator = queue.consumer_create(5).unwrap();
        let joiner = queue.consumer_join(5).unwrap();

        queue.push(b"a").unwrap();
        queue.push(b"b").unwrap();

        let mut buf = [0u8; 64];
        creator.pop(&mut buf).unwrap();
        assert_eq!(&buf[..1], b"a");
        joiner.pop(&mut buf).unwrap();
        assert_eq!(&buf[..1], b"b");

        assert!(matches!(
            queue.consumer_join(99),
            Err(Error::GroupNotFound { group_id: 99 })
        ));

        Queue::unlink(&name).unwrap();
    }

    #[test]
    fn dropping_a_handle_keeps_the_group_active() {
        let (queue, name) = fan_out_queue("sticky", 16);
        {
            let c = queue.consumer_create(3).unwrap();
            drop(c);
        }
        // The group survives and can be rejoined.
        let again = queue.consumer_join(3).unwrap();
        assert_eq!(again.group_id(), 3);

        let stats = queue.group_stats().unwrap();
        assert_eq!(stats.len(), 1);
        assert!(stats[0].active);

        Queue::unlink(&name).unwrap();
    }

    #[test]
    fn min_tail_tracks_the_slowest_group() {
        let (queue, name) = fan_out_queue("mintail", 16);

        // No groups yet: falls back to the control-block tail.
        assert_eq!(queue.min_tail(), 0);

        let g1 = queue.consumer_create(1).unwrap();
        let g2 = queue.consumer_create(2).unwrap();

        for i in 0..10u8 {
            queue.push(&[i]).unwrap();
        }

        let mut buf = [0u8; 64];
        for _ in 0..5 {
            g1.pop(&mut buf).unwrap();
            g2.pop(&mut buf).unwrap();
        }
        assert_eq!(queue.min_tail(), 5);

        for _ in 0..3 {
            g1.pop(&mut buf).unwrap();
        }
        // g2 is now the slowest.
        assert_eq!(queue.min_tail(), 5);
        assert_eq!(g1.stats().lag, 2);
        assert_eq!(g2.stats().lag, 5);

        Queue::unlink(&name).unwrap();
    }

    #[test]
    fn producer_full_check_respects_slow_groups() {
        let (queue, name) = fan_out_queue("pressure", 4);
        let fast = queue.consumer_create(1).unwrap();
        let _slow = queue.consumer_create(2).unwrap();

        for i in 0..4u8 {
            queue.push(&[i]).unwrap();
        }
        // The fast group drains, but the slow group pins min_tail at 0.
        let mut buf = [0u8; 64];
        for _ in 0..4 {
            fast.pop(&mut buf).unwrap();
        }
        assert!(queue.is_full());
        assert!(matches!(queue.push(b"x"), Err(Error::Full)));

        Queue::unlink(&name).unwrap();
    }

    #[test]
    fn group_peek_release_consumes_one() {
        let (queue, name) = fan_out_queue("gpeek", 8);
        let g = queue.consumer_create(1).unwrap();
        queue.push(b"one").unwrap();
        queue.push(b"two").unwrap();

        let p = g.peek().unwrap();
        assert_eq!(p.payload(), b"one");
        let p2 = g.peek().unwrap();
        assert_eq!(p2.payload(), b"one");
        p2.release();

        let mut buf = [0u8; 64];
        assert_eq!(g.pop(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"two");

        Queue::unlink(&name).unwrap();
    }
}
