use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::time::Instant;

use bytes::Bytes;

use crate::encoding::Encoding;
use crate::freelist::FreeList;

/// Sentinel index meaning "no neighbour" inside an idle-bucket list.
pub(crate) const NIL: u32 = u32::MAX;

/// Transport kind of a stream or server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Unix,
}

/// Observable lifecycle state, derived from the flag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Resolving or connecting; no direction open yet.
    Opening,
    /// Both directions open.
    Open,
    /// Write side shut, read side open.
    ReadOnly,
    /// Read side ended, write side open.
    WriteOnly,
    /// Terminal.
    Closed,
}

/// One entry in a stream's write queue.
pub(crate) enum WriteItem {
    /// Pending bytes. Partially flushed items are advanced in place.
    Data(Bytes),
    /// End-of-stream marker: shutdown-write when the queue reaches it.
    Eof,
}

/// Opaque stream handle passed to handler callbacks.
/// Encodes the slot index and generation for stale detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamToken {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl StreamToken {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        StreamToken { index, generation }
    }

    /// Returns the slot index. Useful for indexing per-stream arrays.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

/// Per-stream state tracked by the event loop.
pub(crate) struct StreamState {
    /// OS descriptor. `None` means closed.
    pub fd: Option<RawFd>,
    pub kind: Transport,
    /// Whether the slot is allocated.
    pub active: bool,
    /// Generation counter to detect stale tokens.
    pub generation: u32,
    pub readable: bool,
    pub writable: bool,
    /// True from connect() submission until the lookup continuation runs.
    pub resolving: bool,
    /// Non-blocking connect in flight; first write-readiness decides.
    pub connecting: bool,
    /// Whether the fd is currently registered with the poller.
    pub registered: bool,
    /// Torn down; the `close` delivery is pending on the deferred queue.
    pub closing: bool,
    /// Read watcher armed.
    pub read_interest: bool,
    /// Write watcher armed.
    pub write_interest: bool,
    /// Pending writes in submission order; a partial write's residual sits
    /// at the front.
    pub write_queue: VecDeque<WriteItem>,
    /// Bytes currently queued (the single queue-depth metric).
    pub queued_bytes: usize,
    /// Text decoding for data delivery. `None` = raw slices.
    pub encoding: Option<Encoding>,
    /// Peer address (TCP only; set on accept or connect).
    pub peer_addr: Option<SocketAddr>,
    /// Owning server slot for accepted streams.
    pub server: Option<u32>,
    // ── Idle-timeout linkage ──
    /// Previous stream in the bucket list. Self-referential when unlinked.
    pub idle_prev: u32,
    /// Next stream in the bucket list. Self-referential when unlinked.
    pub idle_next: u32,
    /// Last activity stamp.
    pub idle_start: Instant,
    /// Normalized idle timeout in ms. 0 = disabled.
    pub timeout_ms: u64,
}

impl StreamState {
    fn new(index: u32) -> Self {
        StreamState {
            fd: None,
            kind: Transport::Tcp,
            active: false,
            generation: 0,
            readable: false,
            writable: false,
            resolving: false,
            connecting: false,
            registered: false,
            closing: false,
            read_interest: false,
            write_interest: false,
            write_queue: VecDeque::new(),
            queued_bytes: 0,
            encoding: None,
            peer_addr: None,
            server: None,
            idle_prev: index,
            idle_next: index,
            idle_start: Instant::now(),
            timeout_ms: 0,
        }
    }

    /// Derived lifecycle state. A pure function of
    /// `(fd, resolving, readable, writable)`.
    pub fn ready_state(&self) -> ReadyState {
        if self.resolving {
            ReadyState::Opening
        } else if self.readable && self.writable {
            ReadyState::Open
        } else if self.readable {
            ReadyState::ReadOnly
        } else if self.writable {
            ReadyState::WriteOnly
        } else if self.fd.is_some() {
            ReadyState::Opening
        } else {
            ReadyState::Closed
        }
    }

    /// Whether the stream sits in an idle bucket.
    pub fn idle_linked(&self, index: u32) -> bool {
        self.idle_next != index || self.idle_prev != index
    }

    /// Whether close() already queued the end-of-stream marker.
    pub fn eof_queued(&self) -> bool {
        matches!(self.write_queue.back(), Some(WriteItem::Eof))
    }
}

/// Manages stream slots with a free list for O(1) allocation.
///
/// Write-queue allocations are recycled through a bounded [`FreeList`] so a
/// busy accept loop does not churn the allocator.
pub(crate) struct StreamTable {
    slots: Vec<StreamState>,
    free_list: Vec<u32>,
    queue_pool: FreeList<VecDeque<WriteItem>>,
}

impl StreamTable {
    pub fn new(max_streams: u32, freelist_capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(max_streams as usize);
        for i in 0..max_streams {
            slots.push(StreamState::new(i));
        }
        // Free list: indices in reverse order so pop gives lowest first.
        let free_list: Vec<u32> = (0..max_streams).rev().collect();
        StreamTable {
            slots,
            free_list,
            queue_pool: FreeList::new(freelist_capacity),
        }
    }

    /// Allocate a slot for a stream of the given kind. Returns the index.
    pub fn allocate(&mut self, kind: Transport) -> Option<u32> {
        let idx = self.free_list.pop()?;
        let generation = self.slots[idx as usize].generation;
        let mut queue = self.queue_pool.alloc(VecDeque::new);
        queue.clear();
        let slot = &mut self.slots[idx as usize];
        *slot = StreamState::new(idx);
        slot.generation = generation;
        slot.kind = kind;
        slot.active = true;
        slot.write_queue = queue;
        Some(idx)
    }

    /// Release a slot back to the free list.
    pub fn release(&mut self, idx: u32) {
        let slot = &mut self.slots[idx as usize];
        if !slot.active {
            return; // already released — avoid double-push to free list
        }
        debug_assert!(slot.fd.is_none(), "releasing a slot with a live fd");
        debug_assert!(!slot.idle_linked(idx), "releasing a slot still enrolled");
        slot.active = false;
        slot.generation = slot.generation.wrapping_add(1);
        let mut queue = std::mem::take(&mut slot.write_queue);
        queue.clear();
        self.queue_pool.free(queue);
        self.free_list.push(idx);
    }

    /// Resolve a token to its slot, checking liveness and generation.
    pub fn get(&self, token: StreamToken) -> Option<&StreamState> {
        let slot = self.slots.get(token.index as usize)?;
        if !slot.active || slot.generation != token.generation {
            return None;
        }
        Some(slot)
    }

    /// Mutable variant of [`get`](Self::get).
    pub fn get_mut(&mut self, token: StreamToken) -> Option<&mut StreamState> {
        let slot = self.slots.get_mut(token.index as usize)?;
        if !slot.active || slot.generation != token.generation {
            return None;
        }
        Some(slot)
    }

    /// Slot access by raw index (idle lists, readiness dispatch).
    pub fn slot(&self, idx: u32) -> &StreamState {
        &self.slots[idx as usize]
    }

    pub fn slot_mut(&mut self, idx: u32) -> &mut StreamState {
        &mut self.slots[idx as usize]
    }

    /// Token for a live slot.
    pub fn token(&self, idx: u32) -> StreamToken {
        StreamToken::new(idx, self.slots[idx as usize].generation)
    }

    /// Number of active streams.
    #[allow(dead_code)]
    pub fn active_count(&self) -> usize {
        self.slots.len().saturating_sub(self.free_list.len())
    }

    /// Total number of slots.
    pub fn max_slots(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Indices of all active slots (teardown sweep).
    pub fn active_indices(&self) -> Vec<u32> {
        (0..self.max_slots())
            .filter(|&i| self.slots[i as usize].active)
            .collect()
    }
}
