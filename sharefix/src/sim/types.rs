//! Type table of the simulated runtime.

use std::collections::HashMap;

use ahash::RandomState;

use crate::{CallSiteEntry, FieldDesc, HEADER_SIZE, TypeId, TypeKind, TypeMetadata, WORD_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Value,
    Reference,
}

#[derive(Debug, Clone)]
struct TypeInfo {
    name: String,
    super_type: Option<TypeId>,
    kind: TypeKind,
    foundational: bool,
    fields: Vec<FieldDesc>,
    instance_size: u32,
    reference_offsets: Vec<u32>,
    /// Referent slot of reference types. Traced only when referents are kept.
    referent_offset: Option<u32>,
    element: FieldKind,
    statics: Vec<u64>,
    call_sites: Vec<CallSiteEntry>,
}

impl TypeInfo {
    fn empty(name: String, super_type: Option<TypeId>, kind: TypeKind) -> Self {
        Self {
            name,
            super_type,
            kind,
            foundational: false,
            fields: Vec::new(),
            instance_size: HEADER_SIZE,
            reference_offsets: Vec::new(),
            referent_offset: None,
            element: FieldKind::Value,
            statics: Vec::new(),
            call_sites: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TypeTable {
    types: Vec<TypeInfo>,
    /// Placeholder type per instance size.
    placeholders: HashMap<u32, TypeId, RandomState>,
}

impl Default for TypeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeTable {
    /// Root of every instance hierarchy.
    pub const OBJECT: TypeId = TypeId(0);

    pub fn new() -> Self {
        let mut object = TypeInfo::empty("Object".to_string(), None, TypeKind::Instance);
        object.foundational = true;
        Self {
            types: vec![object],
            placeholders: HashMap::default(),
        }
    }

    fn info(&self, ty: TypeId) -> &TypeInfo {
        &self.types[ty.0 as usize]
    }

    fn info_mut(&mut self, ty: TypeId) -> &mut TypeInfo {
        &mut self.types[ty.0 as usize]
    }

    fn push(&mut self, info: TypeInfo) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.types.push(info);
        id
    }

    /// Defines an instance type. Fields are laid out one word each after the
    /// parent's instance.
    pub fn define(&mut self, name: &str, parent: TypeId, fields: &[(&str, FieldKind)]) -> TypeId {
        self.define_kind(name, parent, TypeKind::Instance, fields)
    }

    /// Defines a reference holder. Its first field is the referent.
    pub fn define_reference(&mut self, name: &str, fields: &[(&str, FieldKind)]) -> TypeId {
        let ty = self.define_kind(name, Self::OBJECT, TypeKind::Reference, fields);
        let info = self.info_mut(ty);
        if let Some(referent) = info.fields.first().map(|field| field.offset) {
            info.reference_offsets.retain(|&offset| offset != referent);
            info.referent_offset = Some(referent);
        }
        ty
    }

    pub fn define_array(&mut self, name: &str, element: FieldKind) -> TypeId {
        let mut info = TypeInfo::empty(name.to_string(), Some(Self::OBJECT), TypeKind::Array);
        info.element = element;
        info.instance_size = HEADER_SIZE + WORD_SIZE as u32;
        self.push(info)
    }

    fn define_kind(
        &mut self,
        name: &str,
        parent: TypeId,
        kind: TypeKind,
        fields: &[(&str, FieldKind)],
    ) -> TypeId {
        let base = self.info(parent);
        let mut info = TypeInfo::empty(name.to_string(), Some(parent), kind);
        info.reference_offsets.clone_from(&base.reference_offsets);
        let mut offset = base.instance_size;
        for &(field, field_kind) in fields {
            info.fields.push(FieldDesc {
                name: field.to_string(),
                offset,
                is_static: false,
            });
            if field_kind == FieldKind::Reference {
                info.reference_offsets.push(offset);
            }
            offset += WORD_SIZE as u32;
        }
        info.instance_size = offset;
        self.push(info)
    }

    /// Adds a static field and returns its slot.
    pub fn define_static(&mut self, ty: TypeId, name: &str) -> u32 {
        let info = self.info_mut(ty);
        let slot = info.statics.len() as u32;
        info.statics.push(0);
        info.fields.push(FieldDesc {
            name: name.to_string(),
            offset: slot,
            is_static: true,
        });
        slot
    }

    pub fn set_foundational(&mut self, ty: TypeId) {
        self.info_mut(ty).foundational = true;
    }

    /// Caches a load of `target.field` in the code of `owner`.
    pub fn add_call_site(&mut self, owner: TypeId, target: TypeId, field: &str) -> Option<usize> {
        self.push_call_site(owner, target, field, true)
    }

    /// Caches a store to `target.field` in the code of `owner`.
    pub fn add_write_site(&mut self, owner: TypeId, target: TypeId, field: &str) -> Option<usize> {
        self.push_call_site(owner, target, field, false)
    }

    fn push_call_site(
        &mut self,
        owner: TypeId,
        target: TypeId,
        field: &str,
        reads_field: bool,
    ) -> Option<usize> {
        let offset = self.field_offset(target, field)?;
        let sites = &mut self.info_mut(owner).call_sites;
        sites.push(CallSiteEntry {
            target,
            offset,
            reads_field,
        });
        Some(sites.len() - 1)
    }

    /// Current offset of an instance field of `ty` or one of its ancestors.
    pub fn field_offset(&self, ty: TypeId, field: &str) -> Option<u32> {
        let mut current = Some(ty);
        while let Some(id) = current {
            let info = self.info(id);
            if let Some(desc) = info.fields.iter().find(|f| !f.is_static && f.name == field) {
                return Some(desc.offset);
            }
            current = info.super_type;
        }
        None
    }

    pub fn referent_offset(&self, ty: TypeId) -> Option<u32> {
        self.info(ty).referent_offset
    }

    pub fn element_kind(&self, ty: TypeId) -> FieldKind {
        self.info(ty).element
    }

    pub fn find(&self, name: &str) -> Option<TypeId> {
        self.types
            .iter()
            .position(|info| info.name == name)
            .map(|index| TypeId(index as u32))
    }
}

impl TypeMetadata for TypeTable {
    fn all_types(&self) -> Vec<TypeId> {
        (0..self.types.len() as u32).map(TypeId).collect()
    }

    fn type_name(&self, ty: TypeId) -> &str {
        &self.info(ty).name
    }

    fn super_type(&self, ty: TypeId) -> Option<TypeId> {
        self.info(ty).super_type
    }

    fn kind(&self, ty: TypeId) -> TypeKind {
        self.info(ty).kind
    }

    fn is_foundational(&self, ty: TypeId) -> bool {
        self.info(ty).foundational
    }

    fn declared_fields(&self, ty: TypeId) -> &[FieldDesc] {
        &self.info(ty).fields
    }

    fn set_field_offset(&mut self, ty: TypeId, index: usize, offset: u32) {
        let info = self.info_mut(ty);
        debug_assert!(!info.fields[index].is_static);
        if info.referent_offset == Some(info.fields[index].offset) {
            info.referent_offset = Some(offset);
        }
        info.fields[index].offset = offset;
    }

    fn instance_size(&self, ty: TypeId) -> u32 {
        self.info(ty).instance_size
    }

    fn set_instance_size(&mut self, ty: TypeId, size: u32) {
        self.info_mut(ty).instance_size = size;
    }

    fn reference_offsets(&self, ty: TypeId) -> &[u32] {
        &self.info(ty).reference_offsets
    }

    fn set_reference_offset(&mut self, ty: TypeId, index: usize, offset: u32) {
        self.info_mut(ty).reference_offsets[index] = offset;
    }

    fn create_placeholder(&mut self, ty: TypeId) -> TypeId {
        let size = self.info(ty).instance_size;
        if let Some(&placeholder) = self.placeholders.get(&size) {
            return placeholder;
        }
        let mut info = TypeInfo::empty(format!("$stale{size}"), None, TypeKind::Placeholder);
        info.instance_size = size;
        let placeholder = self.push(info);
        self.placeholders.insert(size, placeholder);
        placeholder
    }

    fn call_sites(&self, ty: TypeId) -> &[CallSiteEntry] {
        &self.info(ty).call_sites
    }

    fn set_call_site_offset(&mut self, ty: TypeId, index: usize, offset: u32) {
        self.info_mut(ty).call_sites[index].offset = offset;
    }

    fn static_slot(&self, ty: TypeId, slot: u32) -> u64 {
        self.info(ty).statics[slot as usize]
    }

    fn store_static_slot(&mut self, ty: TypeId, slot: u32, value: u64) {
        self.info_mut(ty).statics[slot as usize] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_follow_parent() {
        let mut table = TypeTable::new();
        let base = table.define("Base", TypeTable::OBJECT, &[("a", FieldKind::Value)]);
        let derived = table.define(
            "Derived",
            base,
            &[("b", FieldKind::Reference), ("c", FieldKind::Value)],
        );

        assert_eq!(table.instance_size(base), 24);
        assert_eq!(table.instance_size(derived), 40);
        assert_eq!(table.field_offset(derived, "a"), Some(16));
        assert_eq!(table.field_offset(derived, "b"), Some(24));
        assert_eq!(table.field_offset(derived, "c"), Some(32));
        assert_eq!(table.reference_offsets(derived), &[24]);
        assert_eq!(table.super_type(derived), Some(base));
        assert_eq!(table.find("Derived"), Some(derived));
    }

    #[test]
    fn test_statics_are_slots() {
        let mut table = TypeTable::new();
        let ty = table.define("Holder", TypeTable::OBJECT, &[("x", FieldKind::Value)]);
        let slot = table.define_static(ty, "X_OFFSET");
        table.store_static_slot(ty, slot, 16);

        assert_eq!(table.static_slot(ty, slot), 16);
        assert_eq!(table.instance_size(ty), 24, "statics take no instance space");
        assert_eq!(table.field_offset(ty, "X_OFFSET"), None);
    }

    #[test]
    fn test_reference_types_hide_referent() {
        let mut table = TypeTable::new();
        let weak = table.define_reference(
            "Weak",
            &[("referent", FieldKind::Reference), ("next", FieldKind::Reference)],
        );
        assert_eq!(table.kind(weak), TypeKind::Reference);
        assert_eq!(table.referent_offset(weak), Some(16));
        assert_eq!(table.reference_offsets(weak), &[24]);

        table.set_field_offset(weak, 0, 80);
        assert_eq!(table.referent_offset(weak), Some(80));
    }

    #[test]
    fn test_placeholder_keeps_size() {
        let mut table = TypeTable::new();
        let ty = table.define(
            "Pair",
            TypeTable::OBJECT,
            &[("a", FieldKind::Value), ("b", FieldKind::Value)],
        );
        let placeholder = table.create_placeholder(ty);
        assert_eq!(table.kind(placeholder), TypeKind::Placeholder);
        assert_eq!(table.instance_size(placeholder), 32);
        assert_eq!(table.type_name(placeholder), "$stale32");
    }

    #[test]
    fn test_placeholder_shared_per_size() {
        let mut table = TypeTable::new();
        let pair = table.define(
            "Pair",
            TypeTable::OBJECT,
            &[("a", FieldKind::Value), ("b", FieldKind::Value)],
        );
        let other = table.define(
            "Other",
            TypeTable::OBJECT,
            &[("x", FieldKind::Reference), ("y", FieldKind::Value)],
        );
        let wide = table.define(
            "Wide",
            TypeTable::OBJECT,
            &[("a", FieldKind::Value), ("b", FieldKind::Value), ("c", FieldKind::Value)],
        );

        let first = table.create_placeholder(pair);
        let count = table.all_types().len();
        assert_eq!(table.create_placeholder(pair), first);
        assert_eq!(table.create_placeholder(other), first);
        assert_eq!(table.all_types().len(), count);

        let bigger = table.create_placeholder(wide);
        assert_ne!(bigger, first);
        assert_eq!(table.instance_size(bigger), 40);
        assert_eq!(table.all_types().len(), count + 1);
    }

    #[test]
    fn test_call_sites_resolve_offsets() {
        let mut table = TypeTable::new();
        let target = table.define("Target", TypeTable::OBJECT, &[("hot", FieldKind::Value)]);
        let user = table.define("User", TypeTable::OBJECT, &[]);
        let index = table.add_call_site(user, target, "hot").unwrap();
        assert_eq!(table.call_sites(user)[index].offset, 16);
        assert!(table.add_call_site(user, target, "missing").is_none());

        let store = table.add_write_site(user, target, "hot").unwrap();
        assert_eq!(table.call_sites(user)[store].offset, 16);
        assert!(!table.call_sites(user)[store].reads_field);
        assert!(table.call_sites(user)[index].reads_field);
    }
}
