//! Idle-timeout buckets.
//!
//! Streams sharing a timeout value are threaded onto one intrusive
//! doubly-linked list, driven by a single deadline. `active` moves a stream
//! to the tail in O(1), so the list stays sorted by last activity and the
//! head is always the earliest expiry candidate. With N streams and M
//! distinct timeout values this costs M timers instead of N, and M is tiny
//! in practice.
//!
//! Linkage is threaded through stream slots by index. A slot whose links
//! point at itself is in no list; list ends point at [`NIL`], with the
//! bucket's head/tail fields acting as the sentinel.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::stream::{NIL, StreamTable};

/// One timeout value's intrusive list plus its deadline.
struct Bucket {
    /// Normalized timeout in ms.
    ms: u64,
    /// Oldest stream. NIL when the list is empty.
    head: u32,
    /// Most recently active stream. NIL when the list is empty.
    tail: u32,
    /// Next expiry. Armed iff the list is non-empty.
    deadline: Option<Instant>,
}

impl Bucket {
    fn new(ms: u64) -> Self {
        Bucket {
            ms,
            head: NIL,
            tail: NIL,
            deadline: None,
        }
    }
}

/// Bucketed idle-timeout scheduler. Buckets are created lazily per timeout
/// value and persist for the loop lifetime; a bucket's deadline stops when
/// its list empties and restarts on the next enrolment.
pub(crate) struct IdleScheduler {
    buckets: HashMap<u64, Bucket>,
}

/// Round a timeout to whole seconds: values in (0, 1000) round up to one
/// second, larger values round down. Zero disables.
pub(crate) fn normalize_ms(ms: u64) -> u64 {
    if ms == 0 {
        0
    } else if ms < 1000 {
        1000
    } else {
        ms - ms % 1000
    }
}

impl IdleScheduler {
    pub fn new() -> Self {
        IdleScheduler {
            buckets: HashMap::new(),
        }
    }

    /// Set a stream's timeout, unlinking it from any current bucket.
    /// Does not arm anything; [`active`](Self::active) inserts.
    pub fn enroll(&mut self, table: &mut StreamTable, idx: u32, ms: u64) {
        self.unenroll(table, idx);
        table.slot_mut(idx).timeout_ms = normalize_ms(ms);
    }

    /// Mark a stream active: append it to its bucket's tail and stamp now.
    /// Arms the bucket deadline when the list was empty.
    pub fn active(&mut self, table: &mut StreamTable, idx: u32, now: Instant) {
        let ms = table.slot(idx).timeout_ms;
        if ms == 0 {
            return;
        }
        let bucket = self.buckets.entry(ms).or_insert_with(|| Bucket::new(ms));
        if table.slot(idx).idle_linked(idx) {
            unlink(bucket, table, idx);
        }
        let was_empty = bucket.head == NIL;
        push_tail(bucket, table, idx, now);
        if was_empty {
            bucket.deadline = Some(now + Duration::from_millis(ms));
        }
    }

    /// Remove a stream from its bucket, stopping the deadline on empty.
    pub fn unenroll(&mut self, table: &mut StreamTable, idx: u32) {
        if !table.slot(idx).idle_linked(idx) {
            return;
        }
        let ms = table.slot(idx).timeout_ms;
        if let Some(bucket) = self.buckets.get_mut(&ms) {
            unlink(bucket, table, idx);
        }
    }

    /// Earliest armed deadline across all buckets (the poll timeout).
    pub fn next_deadline(&self) -> Option<Instant> {
        self.buckets.values().filter_map(|b| b.deadline).min()
    }

    /// Collect expired streams into `fired`, oldest first per bucket.
    ///
    /// Each due bucket is scanned from the head: expired streams are spliced
    /// out; the first survivor rearms the deadline for its exact remaining
    /// delta; an emptied bucket stops its deadline.
    pub fn expire(&mut self, table: &mut StreamTable, now: Instant, fired: &mut Vec<u32>) {
        for bucket in self.buckets.values_mut() {
            let Some(deadline) = bucket.deadline else {
                continue;
            };
            if deadline > now {
                continue;
            }
            let period = Duration::from_millis(bucket.ms);
            loop {
                let head = bucket.head;
                if head == NIL {
                    bucket.deadline = None;
                    break;
                }
                let idle_start = table.slot(head).idle_start;
                if now.duration_since(idle_start) < period {
                    bucket.deadline = Some(idle_start + period);
                    break;
                }
                unlink(bucket, table, head);
                fired.push(head);
            }
        }
    }
}

fn unlink(bucket: &mut Bucket, table: &mut StreamTable, idx: u32) {
    let (prev, next) = {
        let slot = table.slot(idx);
        (slot.idle_prev, slot.idle_next)
    };
    if prev == NIL {
        bucket.head = next;
    } else {
        table.slot_mut(prev).idle_next = next;
    }
    if next == NIL {
        bucket.tail = prev;
    } else {
        table.slot_mut(next).idle_prev = prev;
    }
    let slot = table.slot_mut(idx);
    slot.idle_prev = idx;
    slot.idle_next = idx;
    if bucket.head == NIL {
        bucket.deadline = None;
    }
}

fn push_tail(bucket: &mut Bucket, table: &mut StreamTable, idx: u32, now: Instant) {
    let old_tail = bucket.tail;
    {
        let slot = table.slot_mut(idx);
        slot.idle_prev = old_tail;
        slot.idle_next = NIL;
        slot.idle_start = now;
    }
    if old_tail == NIL {
        bucket.head = idx;
    } else {
        table.slot_mut(old_tail).idle_next = idx;
    }
    bucket.tail = idx;
}
