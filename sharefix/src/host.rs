//! Services the host runtime provides to the detector.
//!
//! The detector never owns the heap, the type metadata or the collector. It
//! reaches them through the traits below, which the host implements. All of
//! them are only called from the safepoint coordinator except
//! [`ThreadRegistry`], which is also read while threads merge their own data.

use std::ops::Range;

use crate::{SampleStream, ThreadSampler};

/// Raw address inside the managed process.
pub type Address = usize;

pub const WORD_SIZE: usize = 8;

/// Bytes of per-object metadata before the first field.
pub const HEADER_SIZE: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpaceId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Instance,
    /// Weak, soft or phantom reference holder.
    Reference,
    Array,
    /// Same-size stand-in installed on instances whose layout is stale.
    Placeholder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDesc {
    pub name: String,
    pub offset: u32,
    pub is_static: bool,
}

/// A resolved field access cached at a call site of `owner`'s code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSiteEntry {
    pub target: TypeId,
    pub offset: u32,
    pub reads_field: bool,
}

// ── Type metadata ─────────────────────────────────────────────────────

pub trait TypeMetadata {
    fn all_types(&self) -> Vec<TypeId>;
    fn type_name(&self, ty: TypeId) -> &str;
    fn super_type(&self, ty: TypeId) -> Option<TypeId>;
    fn kind(&self, ty: TypeId) -> TypeKind;
    /// Core runtime types whose layout must never change.
    fn is_foundational(&self, ty: TypeId) -> bool;

    /// Fields declared by `ty` itself, static ones included.
    fn declared_fields(&self, ty: TypeId) -> &[FieldDesc];
    fn set_field_offset(&mut self, ty: TypeId, index: usize, offset: u32);

    fn instance_size(&self, ty: TypeId) -> u32;
    fn set_instance_size(&mut self, ty: TypeId, size: u32);

    /// Offsets of every reference field of an instance, inherited ones included.
    fn reference_offsets(&self, ty: TypeId) -> &[u32];
    fn set_reference_offset(&mut self, ty: TypeId, index: usize, offset: u32);

    fn create_placeholder(&mut self, ty: TypeId) -> TypeId;

    fn call_sites(&self, ty: TypeId) -> &[CallSiteEntry];
    fn set_call_site_offset(&mut self, ty: TypeId, index: usize, offset: u32);

    fn static_slot(&self, ty: TypeId, slot: u32) -> u64;
    fn store_static_slot(&mut self, ty: TypeId, slot: u32, value: u64);
}

// ── Heap regions ──────────────────────────────────────────────────────

pub trait HeapRegions {
    fn reserved_region(&self) -> Range<Address>;

    /// Region holding runtime metadata. Hits there are counted separately.
    fn metadata_region(&self) -> Range<Address> {
        0..0
    }

    /// Start of the block containing `addr`, if `addr` is below a space's top.
    fn block_start(&self, addr: Address) -> Option<Address>;
    fn block_is_object(&self, block: Address) -> bool;

    fn object_type(&self, obj: Address) -> TypeId;
    fn set_object_type(&mut self, obj: Address, ty: TypeId);
    /// Size in bytes, computed from the object's current type.
    fn object_size(&self, obj: Address) -> usize;

    /// Contiguous spaces in allocation order.
    fn spaces(&self) -> Vec<SpaceId>;
    /// `bottom..top` of the allocated part of `space`.
    fn space_used(&self, space: SpaceId) -> Range<Address>;
    fn allocate(&mut self, space: SpaceId, size: usize) -> Option<Address>;

    fn read_bytes(&self, addr: Address, len: usize) -> &[u8];
    fn write_bytes(&mut self, addr: Address, bytes: &[u8]);

    fn is_marked(&self, obj: Address) -> bool;
    /// Reset the synchronization header to its freshly allocated state.
    fn reset_header(&mut self, obj: Address);
    fn forward_to(&mut self, obj: Address, new: Address);
}

/// Walks the objects of one space between two bounds.
///
/// The cursor holds no borrow of the heap, so the heap can be mutated between
/// steps. Objects allocated above `limit` after the cursor was created are
/// never visited.
#[derive(Debug, Clone)]
pub struct ObjectCursor {
    next: Address,
    limit: Address,
}

impl ObjectCursor {
    pub fn new(used: Range<Address>) -> Self {
        Self {
            next: used.start,
            limit: used.end,
        }
    }

    pub fn advance<H: HeapRegions + ?Sized>(&mut self, heap: &H) -> Option<Address> {
        if self.next >= self.limit {
            return None;
        }
        let obj = self.next;
        let size = heap.object_size(obj);
        debug_assert!(size > 0, "zero sized object at {obj:#x}");
        self.next += size.max(WORD_SIZE);
        Some(obj)
    }
}

// ── Collector phases ──────────────────────────────────────────────────

/// How the collector treats weak, soft and phantom referents while marking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferencePolicy {
    /// Referents are traced like strong fields and nothing is cleared.
    KeepAll,
    /// The collector's regular clearing policy.
    Default,
}

pub trait GcPhases {
    /// Save header state the marking phase will overwrite.
    fn prologue(&mut self);
    fn mark_live(&mut self, references: ReferencePolicy);
    /// Rewrite every reference to a forwarded object, roots included.
    fn adjust_pointers(&mut self);
    /// Restore saved header state and update heap accounting.
    fn epilogue(&mut self);
}

pub trait CodeCache {
    /// Invalidate compiled code that may embed field offsets. Returns the
    /// number of methods invalidated.
    fn deoptimize_all(&mut self) -> usize;
}

/// Everything the relayout pass needs from the host.
pub trait Runtime: HeapRegions + TypeMetadata + GcPhases + CodeCache {}

impl<T: HeapRegions + TypeMetadata + GcPhases + CodeCache> Runtime for T {}

// ── Threads ───────────────────────────────────────────────────────────

pub trait ThreadRegistry {
    type Stream: SampleStream;

    fn thread_count(&self) -> usize;
    /// The sampler of live application thread `index`, `None` for hidden threads.
    fn sampler_mut(&mut self, index: usize) -> Option<&mut ThreadSampler<Self::Stream>>;
}
