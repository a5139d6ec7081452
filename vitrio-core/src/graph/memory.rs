//! Linear Memory
//!
//! Backends hand propagation results back through a flat byte region
//! instead of returning owned collections. The engine reads the affected
//! node ids out of that region as little-endian `i32` values.
//!
//! # Growth
//!
//! A backend may reallocate its memory (for example when a propagation
//! touches more nodes than the update buffer can hold). Every reallocation
//! bumps the memory's generation. The engine caches an
//! [`UpdateBufferView`] and only rebuilds it when the generation it was
//! built against no longer matches.

use tracing::debug;

/// Size of one growth step, in bytes.
pub const PAGE_SIZE: usize = 64 * 1024;

const SLOT: usize = std::mem::size_of::<i32>();

/// A growable, page-granular byte region.
#[derive(Debug, Clone)]
pub struct LinearMemory {
    bytes: Vec<u8>,
    generation: u64,
}

impl LinearMemory {
    /// Create a memory of `pages` zeroed pages.
    pub fn new(pages: usize) -> Self {
        Self {
            bytes: vec![0; pages * PAGE_SIZE],
            generation: 0,
        }
    }

    /// Number of pages in the region.
    pub fn pages(&self) -> usize {
        self.bytes.len() / PAGE_SIZE
    }

    /// Size of the region in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Generation counter, bumped on every reallocation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Grow the region by `additional` pages. Returns the previous page count.
    ///
    /// Contents are preserved; any view built before the call is stale.
    pub fn grow(&mut self, additional: usize) -> usize {
        let previous = self.pages();
        if additional == 0 {
            return previous;
        }

        let mut bytes = vec![0; (previous + additional) * PAGE_SIZE];
        bytes[..self.bytes.len()].copy_from_slice(&self.bytes);
        self.bytes = bytes;
        self.generation += 1;

        debug!(previous, pages = self.pages(), generation = self.generation, "linear memory grown");
        previous
    }

    /// Read the `i32` stored at `offset`.
    pub fn read_i32(&self, offset: usize) -> Option<i32> {
        let raw = self.bytes.get(offset..offset + SLOT)?;
        let mut word = [0u8; SLOT];
        word.copy_from_slice(raw);
        Some(i32::from_le_bytes(word))
    }

    /// Store `value` at `offset`. Returns `false` when out of bounds.
    pub fn write_i32(&mut self, offset: usize, value: i32) -> bool {
        match self.bytes.get_mut(offset..offset + SLOT) {
            Some(raw) => {
                raw.copy_from_slice(&value.to_le_bytes());
                true
            }
            None => false,
        }
    }
}

/// A typed `i32` window over a [`LinearMemory`].
///
/// Built once against a memory generation and reused for every
/// propagation until the memory is reallocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateBufferView {
    generation: u64,
    ptr: usize,
    capacity: usize,
}

impl UpdateBufferView {
    /// Build a view of `capacity` slots starting at byte offset `ptr`.
    ///
    /// The capacity is clamped to what the memory actually holds.
    pub fn new(memory: &LinearMemory, ptr: usize, capacity: usize) -> Self {
        let available = memory.len().saturating_sub(ptr) / SLOT;
        Self {
            generation: memory.generation(),
            ptr,
            capacity: capacity.min(available),
        }
    }

    /// Whether this view was built against the current memory.
    pub fn is_current(&self, memory: &LinearMemory) -> bool {
        self.generation == memory.generation()
    }

    /// Number of slots visible through the view.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Read slot `index`.
    pub fn get(&self, memory: &LinearMemory, index: usize) -> Option<i32> {
        if index >= self.capacity {
            return None;
        }
        memory.read_i32(self.ptr + index * SLOT)
    }
}
