//! Command Read Buffer
//!
//! Most responses are small, so every command carries an inline buffer and
//! only moves to the heap when a block declares a larger body. Growth
//! replaces the heap buffer with one sized exactly to the declared length;
//! the inline buffer is never used again once it has been outgrown.
//!
//! ```text
//!   declared ≤ 1024 ──► inline [u8; 1024]          (no allocation)
//!   declared > cap  ──► BytesMut::zeroed(declared) (old heap buffer freed)
//! ```

use bytes::BytesMut;

/// Size of the inline buffer every command starts with.
pub const INLINE_READ_CAPACITY: usize = 1024;

/// A read buffer that starts inline and grows to the heap on demand.
pub struct ReadBuffer {
    inline: [u8; INLINE_READ_CAPACITY],
    heap: Option<BytesMut>,
    heap_allocations: usize,
}

impl ReadBuffer {
    pub fn new() -> Self {
        Self {
            inline: [0; INLINE_READ_CAPACITY],
            heap: None,
            heap_allocations: 0,
        }
    }

    /// Current usable capacity.
    pub fn capacity(&self) -> usize {
        match &self.heap {
            Some(heap) => heap.len(),
            None => INLINE_READ_CAPACITY,
        }
    }

    /// Makes room for `len` bytes, reallocating only if they do not fit.
    /// Returns true if a heap allocation happened.
    pub fn reserve(&mut self, len: usize) -> bool {
        if len <= self.capacity() {
            return false;
        }
        // Drop the outgrown buffer before allocating the new one.
        self.heap = None;
        self.heap = Some(BytesMut::zeroed(len));
        self.heap_allocations += 1;
        true
    }

    /// The first `len` bytes. `len` must not exceed the capacity.
    pub fn slice(&self, len: usize) -> &[u8] {
        match &self.heap {
            Some(heap) => &heap[..len],
            None => &self.inline[..len],
        }
    }

    /// Mutable view of `start..end`.
    pub fn slice_mut(&mut self, start: usize, end: usize) -> &mut [u8] {
        match &mut self.heap {
            Some(heap) => &mut heap[start..end],
            None => &mut self.inline[start..end],
        }
    }

    /// Whether the buffer has moved to the heap.
    pub fn is_heap(&self) -> bool {
        self.heap.is_some()
    }

    /// Number of heap allocations over the buffer's life.
    pub fn heap_allocations(&self) -> usize {
        self.heap_allocations
    }

    /// Frees the heap buffer, if any.
    pub fn release(&mut self) {
        self.heap = None;
    }
}

impl Default for ReadBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReadBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadBuffer")
            .field("capacity", &self.capacity())
            .field("heap", &self.is_heap())
            .field("heap_allocations", &self.heap_allocations)
            .finish()
    }
}
