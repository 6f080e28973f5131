//! Shared read slab.
//!
//! All streams read into one slab and hand inbound bytes out as refcounted
//! [`Bytes`] slices. The slab is replaced, never recycled, once its spare
//! capacity drops below the low-water mark: outstanding slices keep the old
//! allocation alive, so reusing its storage would alias live data.

use std::mem::MaybeUninit;

use bytes::{Bytes, BytesMut};

use crate::encoding::Encoding;

/// The process-wide inbound slab shared by all streams on a loop.
///
/// Between operations the slab holds no committed bytes: every read chunk is
/// split off immediately and every string encode is either rewound (fully
/// flushed) or taken as a residual.
pub struct ReadPool {
    slab: BytesMut,
    capacity: usize,
    low_water: usize,
}

impl ReadPool {
    /// Create a pool with the given slab capacity and low-water mark.
    pub fn new(capacity: usize, low_water: usize) -> Self {
        ReadPool {
            slab: BytesMut::with_capacity(capacity),
            capacity,
            low_water,
        }
    }

    /// Replace the slab when its spare capacity is below the low-water mark.
    pub fn ensure(&mut self) {
        debug_assert!(self.slab.is_empty(), "pool slab holds uncommitted bytes");
        if self.slab.capacity() < self.low_water {
            self.slab = BytesMut::with_capacity(self.capacity);
            crate::metrics::POOL_SLABS_REPLACED.increment();
        }
    }

    /// Spare capacity of the current slab in bytes.
    pub fn spare_len(&self) -> usize {
        self.slab.capacity() - self.slab.len()
    }

    /// Writable tail of the slab for an OS read.
    pub fn spare(&mut self) -> &mut [MaybeUninit<u8>] {
        self.slab.spare_capacity_mut()
    }

    /// Take `n` just-read bytes from the slab tail as an owned slice.
    ///
    /// # Safety
    ///
    /// The first `n` bytes of [`spare`](Self::spare) must have been
    /// initialised since the last commit.
    pub unsafe fn commit(&mut self, n: usize) -> Bytes {
        debug_assert!(n <= self.spare_len());
        unsafe { self.slab.set_len(n) };
        self.slab.split_to(n).freeze()
    }

    /// Encode `s` into the slab tail. Returns the encoded length, or `None`
    /// when the encoded form does not fit the current slab.
    pub fn try_encode(&mut self, s: &str, enc: Encoding) -> Option<usize> {
        debug_assert!(self.slab.is_empty());
        let needed = enc.byte_length(s);
        if needed > self.slab.capacity() {
            return None;
        }
        enc.encode_into(s, &mut self.slab);
        Some(needed)
    }

    /// Bytes staged by [`try_encode`](Self::try_encode).
    pub fn pending(&self) -> &[u8] {
        &self.slab[..]
    }

    /// Rewind a fully-flushed encode, making its space reusable.
    pub fn rewind(&mut self) {
        self.slab.clear();
    }

    /// Take the staged encode as an owned slice (partial-write residual).
    pub fn take(&mut self) -> Bytes {
        let n = self.slab.len();
        self.slab.split_to(n).freeze()
    }
}
