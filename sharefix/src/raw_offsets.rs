//! Raw field offsets handed out to privileged code.
//!
//! Code that reads fields by byte offset gets the offset through a static slot
//! of the holder type. Registered slots are rewritten whenever the holder's
//! layout changes. A type whose raw offset escaped without a slot is pinned
//! and never relaid out.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::{EditList, TypeId, TypeMetadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawOffsetEntry {
    /// Static slot of the holder that publishes the offset.
    pub slot: u32,
    pub field_offset: u32,
}

#[derive(Debug, Default)]
pub struct RawOffsetRegistry {
    entries: BTreeMap<TypeId, Vec<RawOffsetEntry>>,
    pinned: BTreeSet<TypeId>,
}

impl RawOffsetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes `field_offset` in `slot` without tracking it.
    pub fn publish<T: TypeMetadata + ?Sized>(types: &mut T, holder: TypeId, slot: u32, field_offset: u32) {
        types.store_static_slot(holder, slot, field_offset as u64);
    }

    /// Publishes and tracks an offset so relayout keeps the slot current.
    pub fn register<T: TypeMetadata + ?Sized>(
        &mut self,
        types: &mut T,
        holder: TypeId,
        slot: u32,
        field_offset: u32,
    ) {
        Self::publish(types, holder, slot, field_offset);
        self.entries
            .entry(holder)
            .or_default()
            .push(RawOffsetEntry { slot, field_offset });
    }

    /// Records that an offset into `holder` escaped untracked.
    pub fn pin(&mut self, holder: TypeId) {
        if self.pinned.insert(holder) {
            debug!("type {holder:?} pinned by untracked raw offset");
        }
    }

    #[inline]
    pub fn is_pinned(&self, ty: TypeId) -> bool {
        self.pinned.contains(&ty)
    }

    pub fn entries(&self, holder: TypeId) -> &[RawOffsetEntry] {
        self.entries.get(&holder).map_or(&[], Vec::as_slice)
    }

    /// Translates every tracked offset of `holder` and rewrites its slot.
    pub fn update<T: TypeMetadata + ?Sized>(&mut self, types: &mut T, holder: TypeId, edits: &EditList) {
        let Some(entries) = self.entries.get_mut(&holder) else {
            return;
        };
        for entry in entries {
            let translated = edits.translate(entry.field_offset);
            if translated == entry.field_offset {
                continue;
            }
            debug!(
                "raw offset of {} slot {}: {} -> {}",
                types.type_name(holder),
                entry.slot,
                entry.field_offset,
                translated
            );
            entry.field_offset = translated;
            types.store_static_slot(holder, entry.slot, translated as u64);
            debug_assert_eq!(types.static_slot(holder, entry.slot), translated as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{FieldKind, TypeTable};

    fn create_test_holder() -> (TypeTable, TypeId, u32) {
        let mut types = TypeTable::new();
        let holder = types.define(
            "Counter",
            TypeTable::OBJECT,
            &[("lock", FieldKind::Value), ("count", FieldKind::Value)],
        );
        let slot = types.define_static(holder, "COUNT_OFFSET");
        (types, holder, slot)
    }

    #[test]
    fn test_register_publishes_and_tracks() {
        let (mut types, holder, slot) = create_test_holder();
        let mut registry = RawOffsetRegistry::new();
        registry.register(&mut types, holder, slot, 24);

        assert_eq!(types.static_slot(holder, slot), 24);
        assert_eq!(
            registry.entries(holder),
            &[RawOffsetEntry {
                slot,
                field_offset: 24
            }]
        );
    }

    #[test]
    fn test_update_rewrites_slot() {
        let (mut types, holder, slot) = create_test_holder();
        let mut registry = RawOffsetRegistry::new();
        registry.register(&mut types, holder, slot, 24);

        let mut edits = EditList::new();
        edits.push(24, 64);
        registry.update(&mut types, holder, &edits);

        assert_eq!(types.static_slot(holder, slot), 88);
        assert_eq!(registry.entries(holder)[0].field_offset, 88);
    }

    #[test]
    fn test_publish_is_untracked() {
        let (mut types, holder, slot) = create_test_holder();
        let mut registry = RawOffsetRegistry::new();
        RawOffsetRegistry::publish(&mut types, holder, slot, 24);

        let mut edits = EditList::new();
        edits.push(16, 64);
        registry.update(&mut types, holder, &edits);

        assert_eq!(types.static_slot(holder, slot), 24, "untracked slots are left alone");
        assert!(registry.entries(holder).is_empty());
    }

    #[test]
    fn test_pin() {
        let (_, holder, _) = create_test_holder();
        let mut registry = RawOffsetRegistry::new();
        assert!(!registry.is_pinned(holder));
        registry.pin(holder);
        registry.pin(holder);
        assert!(registry.is_pinned(holder));
    }
}
