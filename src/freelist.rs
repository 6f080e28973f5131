/// Bounded cache of reusable objects.
///
/// `alloc` pops a pooled object or falls back to the supplied constructor;
/// `free` keeps the object only while below capacity. Returned objects are
/// handed back as-is; consumers reset whatever state they rely on.
pub struct FreeList<T> {
    items: Vec<T>,
    capacity: usize,
}

impl<T> FreeList<T> {
    /// Create a free list that retains at most `capacity` objects.
    pub fn new(capacity: usize) -> Self {
        FreeList {
            items: Vec::new(),
            capacity,
        }
    }

    /// Pop a pooled object, or construct one with `ctor`.
    pub fn alloc(&mut self, ctor: impl FnOnce() -> T) -> T {
        self.items.pop().unwrap_or_else(ctor)
    }

    /// Return an object to the pool. Dropped when the pool is full.
    pub fn free(&mut self, item: T) {
        if self.items.len() < self.capacity {
            self.items.push(item);
        }
    }

    /// Number of pooled objects.
    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the pool is empty.
    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
