//! Contiguous-space heap backing the simulated runtime.
//!
//! One anonymous mapping holds the heap followed by a small metadata region.
//! The heap is cut into equally sized spaces with bump allocation; nothing is
//! ever freed.
//!
//! Object layout:
//!
//! ```text
//! +0   mark word   [MARKED | FORWARDED | LOCKED] or forwardee | FORWARDED
//! +8   type word   TypeId
//! +16  fields (arrays: length word, then elements)
//! ```

use std::{collections::BTreeSet, ops::Range, ptr::NonNull};

use bitflags::bitflags;

use crate::{
    Address, SpaceId, WORD_SIZE,
    system::{self, OS_PAGE_SIZE},
};

// ── Settings ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SimSettings {
    /// Total heap bytes. Must be a multiple of `space_size`.
    pub heap_size: usize,
    /// Bytes per contiguous space. Must be page aligned.
    pub space_size: usize,
    /// Bytes of metadata region mapped after the heap.
    pub metadata_size: usize,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            heap_size: 4 * 1024 * 1024, // 4 MB
            space_size: 256 * 1024,     // 256 KB
            metadata_size: 64 * 1024,   // 64 KB
        }
    }
}

impl SimSettings {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.heap_size == 0 || self.space_size == 0 {
            return Err("Sizes must be > 0");
        }
        if !self.space_size.is_multiple_of(OS_PAGE_SIZE)
            || !self.metadata_size.is_multiple_of(OS_PAGE_SIZE)
        {
            return Err("space_size and metadata_size must match OS page alignment");
        }
        if !self.heap_size.is_multiple_of(self.space_size) {
            return Err("heap_size must be a multiple of space_size");
        }
        Ok(())
    }
}

// ── Mark word ─────────────────────────────────────────────────────────

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MarkBits: u64 {
        const MARKED = 1 << 0;
        const FORWARDED = 1 << 1;
        /// Carries state that must survive the relayout (e.g. a held monitor).
        const LOCKED = 1 << 2;
    }
}

const FORWARD_MASK: u64 = !(WORD_SIZE as u64 - 1);

#[derive(Debug, Clone)]
struct Space {
    bottom: Address,
    top: Address,
    end: Address,
}

// ── SimHeap ───────────────────────────────────────────────────────────

pub struct SimHeap {
    base: NonNull<u8>,
    heap_size: usize,
    mapped: usize,
    spaces: Vec<Space>,
    starts: BTreeSet<Address>,
}

// SAFETY: the mapping is owned by the heap and only reached through &self/&mut self
unsafe impl Send for SimHeap {}
// SAFETY: shared access is read-only
unsafe impl Sync for SimHeap {}

impl SimHeap {
    pub fn new(settings: &SimSettings) -> Self {
        if let Err(err) = settings.validate() {
            panic!("Invalid Sim Settings: {err}");
        }
        let mapped = settings.heap_size + settings.metadata_size;
        let Some(base) = system::map_memory(mapped) else {
            panic!("out of memory");
        };
        let start = base.as_ptr() as Address;
        let spaces = (0..settings.heap_size / settings.space_size)
            .map(|i| {
                let bottom = start + i * settings.space_size;
                Space {
                    bottom,
                    top: bottom,
                    end: bottom + settings.space_size,
                }
            })
            .collect();
        Self {
            base,
            heap_size: settings.heap_size,
            mapped,
            spaces,
            starts: BTreeSet::new(),
        }
    }

    #[inline]
    fn start(&self) -> Address {
        self.base.as_ptr() as Address
    }

    pub fn reserved(&self) -> Range<Address> {
        self.start()..self.start() + self.heap_size
    }

    pub fn metadata(&self) -> Range<Address> {
        self.start() + self.heap_size..self.start() + self.mapped
    }

    #[inline]
    fn bytes(&self) -> &[u8] {
        // SAFETY: base points to a live mapping of `mapped` bytes
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.mapped) }
    }

    #[inline]
    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: base points to a live mapping of `mapped` bytes, &mut self is unique
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr(), self.mapped) }
    }

    #[inline]
    fn index(&self, addr: Address) -> usize {
        debug_assert!(self.reserved().contains(&addr), "{addr:#x} outside heap");
        addr - self.start()
    }

    pub fn read(&self, addr: Address, len: usize) -> &[u8] {
        let index = self.index(addr);
        &self.bytes()[index..index + len]
    }

    pub fn write(&mut self, addr: Address, data: &[u8]) {
        let index = self.index(addr);
        self.bytes_mut()[index..index + data.len()].copy_from_slice(data);
    }

    pub fn read_word(&self, addr: Address) -> u64 {
        let mut word = [0u8; WORD_SIZE];
        word.copy_from_slice(self.read(addr, WORD_SIZE));
        u64::from_ne_bytes(word)
    }

    pub fn write_word(&mut self, addr: Address, value: u64) {
        self.write(addr, &value.to_ne_bytes());
    }

    // ── Spaces ──

    pub fn space_count(&self) -> usize {
        self.spaces.len()
    }

    pub fn space_used(&self, space: SpaceId) -> Range<Address> {
        let space = &self.spaces[space.0];
        space.bottom..space.top
    }

    /// Bump allocates `size` zeroed bytes in `space`.
    pub fn allocate(&mut self, space: SpaceId, size: usize) -> Option<Address> {
        let size = size.next_multiple_of(WORD_SIZE);
        let target = self.spaces.get_mut(space.0)?;
        if target.end - target.top < size {
            return None;
        }
        let addr = target.top;
        target.top += size;
        let index = self.index(addr);
        self.bytes_mut()[index..index + size].fill(0);
        self.starts.insert(addr);
        Some(addr)
    }

    /// First space, starting at `from`, with room for `size` bytes.
    pub fn allocate_from(&mut self, from: usize, size: usize) -> Option<Address> {
        (from..self.spaces.len()).find_map(|i| self.allocate(SpaceId(i), size))
    }

    /// Closest allocation start at or below `addr`.
    pub fn start_at_or_below(&self, addr: Address) -> Option<Address> {
        self.starts.range(..=addr).next_back().copied()
    }

    pub fn is_start(&self, addr: Address) -> bool {
        self.starts.contains(&addr)
    }

    pub fn is_below_top(&self, addr: Address) -> bool {
        self.spaces
            .iter()
            .any(|space| (space.bottom..space.top).contains(&addr))
    }

    pub fn object_starts(&self) -> impl Iterator<Item = Address> + '_ {
        self.starts.iter().copied()
    }

    // ── Mark word ──

    pub fn mark_bits(&self, obj: Address) -> MarkBits {
        MarkBits::from_bits_truncate(self.read_word(obj))
    }

    pub fn set_mark_bits(&mut self, obj: Address, bits: MarkBits) {
        let word = self.read_word(obj);
        self.write_word(obj, word | bits.bits());
    }

    pub fn clear_mark_bits(&mut self, obj: Address, bits: MarkBits) {
        let word = self.read_word(obj);
        self.write_word(obj, word & !bits.bits());
    }

    pub fn forwardee(&self, obj: Address) -> Option<Address> {
        let word = self.read_word(obj);
        (word & MarkBits::FORWARDED.bits() != 0).then_some((word & FORWARD_MASK) as Address)
    }

    pub fn forward_to(&mut self, obj: Address, new: Address) {
        debug_assert!(new % WORD_SIZE == 0);
        self.write_word(obj, new as u64 | MarkBits::FORWARDED.bits());
    }

    pub fn reset_mark(&mut self, obj: Address) {
        self.write_word(obj, 0);
    }
}

impl Drop for SimHeap {
    fn drop(&mut self) {
        system::unmap_memory(self.base, self.mapped);
    }
}

impl std::fmt::Debug for SimHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimHeap")
            .field("reserved", &self.reserved())
            .field("spaces", &self.spaces.len())
            .field("objects", &self.starts.len())
            .finish()
    }
}
