//! A small managed runtime that implements every host trait.
//!
//! It drives the demo binary, the benchmarks and the relayout tests: a bump
//! allocated heap, a type table, a root set, a mark/forward collector and a
//! counter standing in for compiled code. Application threads are replayed
//! sample streams.

mod heap;
mod types;

use std::ops::Range;

use log::trace;

use crate::{
    Address, CodeCache, GcPhases, HEADER_SIZE, HeapRegions, ReferencePolicy, ReplayStream, SpaceId,
    ThreadRegistry, ThreadSampler, TypeId, TypeKind, TypeMetadata, WORD_SIZE,
};

pub use heap::{MarkBits, SimHeap, SimSettings};
pub use types::{FieldKind, TypeTable};

const ARRAY_LENGTH_OFFSET: usize = HEADER_SIZE as usize;
const ARRAY_BASE_OFFSET: usize = ARRAY_LENGTH_OFFSET + WORD_SIZE;

// ── SimRuntime ────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct SimRuntime {
    heap: SimHeap,
    types: TypeTable,
    roots: Vec<Address>,
    preserved: Vec<Address>,
    compiled_methods: usize,
}

impl SimRuntime {
    pub fn new(settings: &SimSettings, types: TypeTable) -> Self {
        Self {
            heap: SimHeap::new(settings),
            types,
            roots: Vec::new(),
            preserved: Vec::new(),
            compiled_methods: 0,
        }
    }

    pub fn heap(&self) -> &SimHeap {
        &self.heap
    }

    pub fn types(&self) -> &TypeTable {
        &self.types
    }

    pub fn types_mut(&mut self) -> &mut TypeTable {
        &mut self.types
    }

    // ── Allocation ──

    pub fn alloc(&mut self, ty: TypeId) -> Option<Address> {
        debug_assert_ne!(self.types.kind(ty), TypeKind::Array);
        let size = self.types.instance_size(ty) as usize;
        let obj = self.heap.allocate_from(0, size)?;
        self.set_object_type(obj, ty);
        Some(obj)
    }

    pub fn alloc_array(&mut self, ty: TypeId, len: usize) -> Option<Address> {
        debug_assert_eq!(self.types.kind(ty), TypeKind::Array);
        let obj = self.heap.allocate_from(0, ARRAY_BASE_OFFSET + len * WORD_SIZE)?;
        self.set_object_type(obj, ty);
        self.heap.write_word(obj + ARRAY_LENGTH_OFFSET, len as u64);
        Some(obj)
    }

    // ── Roots ──

    pub fn add_root(&mut self, obj: Address) -> usize {
        self.roots.push(obj);
        self.roots.len() - 1
    }

    pub fn root(&self, index: usize) -> Address {
        self.roots[index]
    }

    pub fn clear_roots(&mut self) {
        self.roots.clear();
    }

    // ── Field access ──

    /// Address of `field` in `obj`, resolved against the object's current type.
    pub fn field_address(&self, obj: Address, field: &str) -> Option<Address> {
        let offset = self.types.field_offset(self.object_type(obj), field)?;
        Some(obj + offset as usize)
    }

    pub fn read_field(&self, obj: Address, field: &str) -> Option<u64> {
        Some(self.heap.read_word(self.field_address(obj, field)?))
    }

    pub fn write_field(&mut self, obj: Address, field: &str, value: u64) -> Option<()> {
        let addr = self.field_address(obj, field)?;
        self.heap.write_word(addr, value);
        Some(())
    }

    pub fn array_length(&self, obj: Address) -> usize {
        self.heap.read_word(obj + ARRAY_LENGTH_OFFSET) as usize
    }

    pub fn array_get(&self, obj: Address, index: usize) -> u64 {
        debug_assert!(index < self.array_length(obj));
        self.heap.read_word(obj + ARRAY_BASE_OFFSET + index * WORD_SIZE)
    }

    pub fn array_set(&mut self, obj: Address, index: usize, value: u64) {
        debug_assert!(index < self.array_length(obj));
        self.heap
            .write_word(obj + ARRAY_BASE_OFFSET + index * WORD_SIZE, value);
    }

    // ── Header state ──

    pub fn lock(&mut self, obj: Address) {
        self.heap.set_mark_bits(obj, MarkBits::LOCKED);
    }

    pub fn is_locked(&self, obj: Address) -> bool {
        self.heap.mark_bits(obj).contains(MarkBits::LOCKED)
    }

    pub fn forwardee(&self, obj: Address) -> Option<Address> {
        self.heap.forwardee(obj)
    }

    // ── Code cache ──

    pub fn compile(&mut self, methods: usize) {
        self.compiled_methods += methods;
    }

    pub fn compiled_methods(&self) -> usize {
        self.compiled_methods
    }

    /// Addresses of the reference slots of `obj`.
    fn reference_slots(&self, obj: Address, keep_referents: bool) -> Vec<Address> {
        let ty = self.object_type(obj);
        match self.types.kind(ty) {
            TypeKind::Placeholder => Vec::new(),
            TypeKind::Array => match self.types.element_kind(ty) {
                FieldKind::Value => Vec::new(),
                FieldKind::Reference => (0..self.array_length(obj))
                    .map(|i| obj + ARRAY_BASE_OFFSET + i * WORD_SIZE)
                    .collect(),
            },
            TypeKind::Instance | TypeKind::Reference => {
                let mut slots: Vec<Address> = self
                    .types
                    .reference_offsets(ty)
                    .iter()
                    .map(|&offset| obj + offset as usize)
                    .collect();
                if keep_referents {
                    if let Some(referent) = self.types.referent_offset(ty) {
                        slots.push(obj + referent as usize);
                    }
                }
                slots
            }
        }
    }

    fn live_objects(&self) -> Vec<Address> {
        self.heap
            .object_starts()
            .filter(|&obj| self.heap.forwardee(obj).is_none())
            .collect()
    }

    fn forwarded(&self, value: u64) -> Option<Address> {
        let addr = value as Address;
        if value == 0 || !self.heap.is_start(addr) {
            return None;
        }
        self.heap.forwardee(addr)
    }
}

// ── Host traits ───────────────────────────────────────────────────────

impl TypeMetadata for SimRuntime {
    fn all_types(&self) -> Vec<TypeId> {
        self.types.all_types()
    }

    fn type_name(&self, ty: TypeId) -> &str {
        self.types.type_name(ty)
    }

    fn super_type(&self, ty: TypeId) -> Option<TypeId> {
        self.types.super_type(ty)
    }

    fn kind(&self, ty: TypeId) -> TypeKind {
        self.types.kind(ty)
    }

    fn is_foundational(&self, ty: TypeId) -> bool {
        self.types.is_foundational(ty)
    }

    fn declared_fields(&self, ty: TypeId) -> &[crate::FieldDesc] {
        self.types.declared_fields(ty)
    }

    fn set_field_offset(&mut self, ty: TypeId, index: usize, offset: u32) {
        self.types.set_field_offset(ty, index, offset);
    }

    fn instance_size(&self, ty: TypeId) -> u32 {
        self.types.instance_size(ty)
    }

    fn set_instance_size(&mut self, ty: TypeId, size: u32) {
        self.types.set_instance_size(ty, size);
    }

    fn reference_offsets(&self, ty: TypeId) -> &[u32] {
        self.types.reference_offsets(ty)
    }

    fn set_reference_offset(&mut self, ty: TypeId, index: usize, offset: u32) {
        self.types.set_reference_offset(ty, index, offset);
    }

    fn create_placeholder(&mut self, ty: TypeId) -> TypeId {
        self.types.create_placeholder(ty)
    }

    fn call_sites(&self, ty: TypeId) -> &[crate::CallSiteEntry] {
        self.types.call_sites(ty)
    }

    fn set_call_site_offset(&mut self, ty: TypeId, index: usize, offset: u32) {
        self.types.set_call_site_offset(ty, index, offset);
    }

    fn static_slot(&self, ty: TypeId, slot: u32) -> u64 {
        self.types.static_slot(ty, slot)
    }

    fn store_static_slot(&mut self, ty: TypeId, slot: u32, value: u64) {
        self.types.store_static_slot(ty, slot, value);
    }
}

impl HeapRegions for SimRuntime {
    fn reserved_region(&self) -> Range<Address> {
        self.heap.reserved()
    }

    fn metadata_region(&self) -> Range<Address> {
        self.heap.metadata()
    }

    fn block_start(&self, addr: Address) -> Option<Address> {
        if !self.heap.is_below_top(addr) {
            return None;
        }
        self.heap.start_at_or_below(addr)
    }

    fn block_is_object(&self, block: Address) -> bool {
        self.heap.is_start(block)
    }

    fn object_type(&self, obj: Address) -> TypeId {
        TypeId(self.heap.read_word(obj + WORD_SIZE) as u32)
    }

    fn set_object_type(&mut self, obj: Address, ty: TypeId) {
        self.heap.write_word(obj + WORD_SIZE, ty.0 as u64);
    }

    fn object_size(&self, obj: Address) -> usize {
        let ty = self.object_type(obj);
        match self.types.kind(ty) {
            TypeKind::Array => ARRAY_BASE_OFFSET + self.array_length(obj) * WORD_SIZE,
            _ => self.types.instance_size(ty) as usize,
        }
    }

    fn spaces(&self) -> Vec<SpaceId> {
        (0..self.heap.space_count()).map(SpaceId).collect()
    }

    fn space_used(&self, space: SpaceId) -> Range<Address> {
        self.heap.space_used(space)
    }

    fn allocate(&mut self, space: SpaceId, size: usize) -> Option<Address> {
        self.heap.allocate(space, size)
    }

    fn read_bytes(&self, addr: Address, len: usize) -> &[u8] {
        self.heap.read(addr, len)
    }

    fn write_bytes(&mut self, addr: Address, bytes: &[u8]) {
        self.heap.write(addr, bytes);
    }

    fn is_marked(&self, obj: Address) -> bool {
        self.heap.mark_bits(obj).contains(MarkBits::MARKED)
    }

    fn reset_header(&mut self, obj: Address) {
        self.heap.reset_mark(obj);
    }

    fn forward_to(&mut self, obj: Address, new: Address) {
        self.heap.forward_to(obj, new);
    }
}

impl GcPhases for SimRuntime {
    fn prologue(&mut self) {
        self.preserved = self
            .heap
            .object_starts()
            .filter(|&obj| self.heap.mark_bits(obj).contains(MarkBits::LOCKED))
            .collect();
        trace!("preserved {} headers", self.preserved.len());
    }

    fn mark_live(&mut self, references: ReferencePolicy) {
        let keep_referents = references == ReferencePolicy::KeepAll;
        for obj in self.live_objects() {
            self.heap.clear_mark_bits(obj, MarkBits::MARKED);
        }
        let mut stack: Vec<Address> = self.roots.clone();
        while let Some(obj) = stack.pop() {
            if obj == 0 || self.is_marked(obj) {
                continue;
            }
            self.heap.set_mark_bits(obj, MarkBits::MARKED);
            for slot in self.reference_slots(obj, keep_referents) {
                let value = self.heap.read_word(slot) as Address;
                if value != 0 && self.heap.is_start(value) {
                    stack.push(value);
                }
            }
        }
    }

    fn adjust_pointers(&mut self) {
        for index in 0..self.roots.len() {
            if let Some(new) = self.forwarded(self.roots[index] as u64) {
                self.roots[index] = new;
            }
        }
        for index in 0..self.preserved.len() {
            if let Some(new) = self.forwarded(self.preserved[index] as u64) {
                self.preserved[index] = new;
            }
        }
        for obj in self.live_objects() {
            for slot in self.reference_slots(obj, true) {
                if let Some(new) = self.forwarded(self.heap.read_word(slot)) {
                    self.heap.write_word(slot, new as u64);
                }
            }
        }
    }

    fn epilogue(&mut self) {
        for obj in std::mem::take(&mut self.preserved) {
            self.heap.set_mark_bits(obj, MarkBits::LOCKED);
        }
        for obj in self.live_objects() {
            self.heap.clear_mark_bits(obj, MarkBits::MARKED);
        }
    }
}

impl CodeCache for SimRuntime {
    fn deoptimize_all(&mut self) -> usize {
        std::mem::take(&mut self.compiled_methods)
    }
}

// ── SimThreads ────────────────────────────────────────────────────────

/// Application threads backed by replayed streams. A `None` slot is a
/// hidden thread that never samples.
#[derive(Debug, Default)]
pub struct SimThreads {
    samplers: Vec<Option<ThreadSampler<ReplayStream>>>,
}

impl SimThreads {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an application thread. Returns its index.
    pub fn spawn(&mut self, events: &[u64], timed: bool) -> usize {
        self.samplers.push(Some(ThreadSampler::replay(events, timed)));
        self.samplers.len() - 1
    }

    pub fn spawn_hidden(&mut self) -> usize {
        self.samplers.push(None);
        self.samplers.len() - 1
    }

    /// Replays one access of `addr` by thread `thread` on its first event.
    pub fn access(&mut self, thread: usize, addr: Address) -> bool {
        self.sampler_mut(thread)
            .is_some_and(|sampler| sampler.record(0, addr, 0))
    }

    /// Drops the sampler of a finished thread.
    pub fn remove(&mut self, thread: usize) -> Option<ThreadSampler<ReplayStream>> {
        self.samplers.get_mut(thread)?.take()
    }
}

impl ThreadRegistry for SimThreads {
    type Stream = ReplayStream;

    fn thread_count(&self) -> usize {
        self.samplers.len()
    }

    fn sampler_mut(&mut self, index: usize) -> Option<&mut ThreadSampler<ReplayStream>> {
        self.samplers.get_mut(index)?.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ObjectCursor;

    fn create_test_runtime() -> (SimRuntime, TypeId, TypeId) {
        let mut types = TypeTable::new();
        let node = types.define(
            "Node",
            TypeTable::OBJECT,
            &[("value", FieldKind::Value), ("next", FieldKind::Reference)],
        );
        let weak = types.define_reference("Weak", &[("referent", FieldKind::Reference)]);
        let settings = SimSettings {
            heap_size: 64 * 1024,
            space_size: 16 * 1024,
            metadata_size: 4096,
        };
        (SimRuntime::new(&settings, types), node, weak)
    }

    #[test]
    fn test_block_start_finds_object() {
        let (mut rt, node, _) = create_test_runtime();
        let a = rt.alloc(node).unwrap();
        let b = rt.alloc(node).unwrap();

        assert_eq!(rt.block_start(a + 20), Some(a));
        assert_eq!(rt.block_start(b), Some(b));
        assert!(rt.block_is_object(b));
        assert_eq!(rt.block_start(b + 32), None, "above top");
        assert_eq!(rt.object_size(a), 32);
    }

    #[test]
    fn test_cursor_walks_mixed_objects() {
        let (mut rt, node, _) = create_test_runtime();
        let longs = rt.types_mut().define_array("long[]", FieldKind::Value);
        let a = rt.alloc(node).unwrap();
        let arr = rt.alloc_array(longs, 5).unwrap();
        let b = rt.alloc(node).unwrap();

        let mut cursor = ObjectCursor::new(rt.space_used(SpaceId(0)));
        let mut seen = Vec::new();
        while let Some(obj) = cursor.advance(&rt) {
            seen.push(obj);
        }
        assert_eq!(seen, vec![a, arr, b]);
        assert_eq!(rt.object_size(arr), 64);
    }

    #[test]
    fn test_mark_follows_references() {
        let (mut rt, node, weak) = create_test_runtime();
        let head = rt.alloc(node).unwrap();
        let tail = rt.alloc(node).unwrap();
        let garbage = rt.alloc(node).unwrap();
        let holder = rt.alloc(weak).unwrap();
        let referent = rt.alloc(node).unwrap();
        rt.write_field(head, "next", tail as u64).unwrap();
        rt.write_field(holder, "referent", referent as u64).unwrap();
        rt.add_root(head);
        rt.add_root(holder);

        rt.mark_live(ReferencePolicy::Default);
        assert!(rt.is_marked(head) && rt.is_marked(tail) && rt.is_marked(holder));
        assert!(!rt.is_marked(garbage));
        assert!(!rt.is_marked(referent), "referents are weak by default");

        rt.mark_live(ReferencePolicy::KeepAll);
        assert!(rt.is_marked(referent));
    }

    #[test]
    fn test_adjust_follows_forwarding() {
        let (mut rt, node, _) = create_test_runtime();
        let head = rt.alloc(node).unwrap();
        let tail = rt.alloc(node).unwrap();
        rt.write_field(head, "next", tail as u64).unwrap();
        rt.add_root(tail);
        rt.lock(tail);

        rt.prologue();
        let copy = rt.allocate(SpaceId(1), 32).unwrap();
        let bytes = rt.read_bytes(tail, 32).to_vec();
        rt.write_bytes(copy, &bytes);
        rt.forward_to(tail, copy);
        rt.reset_header(copy);
        rt.adjust_pointers();
        rt.epilogue();

        assert_eq!(rt.read_field(head, "next"), Some(copy as u64));
        assert_eq!(rt.root(0), copy);
        assert!(rt.is_locked(copy), "preserved header restored on the copy");
    }

    #[test]
    fn test_deoptimize_drains_code_cache() {
        let (mut rt, _, _) = create_test_runtime();
        rt.compile(3);
        assert_eq!(rt.deoptimize_all(), 3);
        assert_eq!(rt.compiled_methods(), 0);
    }

    #[test]
    fn test_threads_replay_accesses() {
        let mut threads = SimThreads::new();
        let t0 = threads.spawn(&[0x10D3], false);
        let hidden = threads.spawn_hidden();
        threads.sampler_mut(t0).unwrap().open(true).unwrap();

        assert!(threads.access(t0, 0x1000));
        assert!(!threads.access(hidden, 0x1000));
        assert_eq!(threads.thread_count(), 2);
        assert!(threads.remove(t0).is_some());
        assert!(threads.sampler_mut(t0).is_none());
    }
}
