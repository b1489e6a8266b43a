//! Layout rebuild planning.
//!
//! For every type hot enough to repair, the planner builds a [`LayoutPlan`]:
//! the list of padding edits that pushes contended fields onto their own
//! cache lines and the resulting instance size. Plans chain to the plan of
//! the super type, so a subtype's fields shift by exactly the growth of its
//! ancestors.
//!
//! Planner state per type lives in a side table stamped with the epoch in
//! which it was written. Starting a new epoch invalidates every plan mark
//! without touching the table.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use ahash::RandomState;
use log::{debug, trace};

use crate::{
    CACHE_LINE_SIZE, EditList, HEADER_SIZE, Policy, RawOffsetRegistry, Stage, Timings, TypeHitStat,
    TypeId, TypeKind, TypeMetadata, WORD_SIZE,
};

const LINE: u32 = CACHE_LINE_SIZE as u32;

pub type PlanId = usize;

/// Types whose super type is the hierarchy root, or that have none.
pub fn is_terminal<T: TypeMetadata + ?Sized>(types: &T, ty: TypeId) -> bool {
    match types.super_type(ty) {
        None => true,
        Some(parent) => types.super_type(parent).is_none(),
    }
}

// ── LayoutPlan ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LayoutPlan {
    ty: TypeId,
    parent: Option<PlanId>,
    placeholder: Option<TypeId>,
    pinned: bool,
    flattened: bool,
    viable: bool,
    direct_hit: bool,
    header_hit: bool,
    old_size: u32,
    new_size: u32,
    /// Hot field offsets of this level of the hierarchy, ascending.
    candidates: Vec<u32>,
    /// Offsets of the instance fields `ty` declares itself, ascending.
    own_fields: Vec<u32>,
    edits: EditList,
}

impl LayoutPlan {
    fn new<T: TypeMetadata + ?Sized>(types: &T, ty: TypeId, parent: Option<PlanId>, pinned: bool) -> Self {
        let old_size = types.instance_size(ty) & !(WORD_SIZE as u32 - 1);
        debug_assert!(old_size > 0, "size error");
        let mut own_fields: Vec<u32> = types
            .declared_fields(ty)
            .iter()
            .filter(|field| !field.is_static)
            .map(|field| field.offset)
            .collect();
        own_fields.sort_unstable();
        Self {
            ty,
            parent,
            placeholder: None,
            pinned,
            flattened: false,
            viable: false,
            direct_hit: false,
            header_hit: false,
            old_size,
            new_size: old_size,
            candidates: Vec::new(),
            own_fields,
            edits: EditList::new(),
        }
    }

    pub fn ty(&self) -> TypeId {
        self.ty
    }

    pub fn parent(&self) -> Option<PlanId> {
        self.parent
    }

    /// Same-size type installed on instances left in the old layout.
    pub fn placeholder(&self) -> Option<TypeId> {
        self.placeholder
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub fn is_direct_hit(&self) -> bool {
        self.direct_hit
    }

    pub fn old_size(&self) -> u32 {
        self.old_size
    }

    pub fn new_size(&self) -> u32 {
        self.new_size
    }

    pub fn candidates(&self) -> &[u32] {
        &self.candidates
    }

    pub fn edits(&self) -> &EditList {
        &self.edits
    }

    /// A plan that changes nothing.
    #[inline]
    pub fn is_unused(&self) -> bool {
        self.old_size == self.new_size
    }

    /// Translates an offset of the old layout into the planned one.
    #[inline]
    pub fn translate(&self, offset: u32) -> u32 {
        self.edits.translate(offset)
    }

    /// Rewrites the type's metadata to the planned layout. Runs while the
    /// world is stopped, after every instance has been moved.
    pub fn apply<T: TypeMetadata + ?Sized>(&self, types: &mut T, raw_offsets: &mut RawOffsetRegistry) {
        types.set_instance_size(self.ty, self.new_size);
        if self.edits.is_empty() {
            return;
        }

        let fields: Vec<(usize, u32)> = types
            .declared_fields(self.ty)
            .iter()
            .enumerate()
            .filter(|(_, field)| !field.is_static)
            .map(|(index, field)| (index, field.offset))
            .collect();
        for (index, offset) in fields {
            types.set_field_offset(self.ty, index, self.translate(offset));
        }

        raw_offsets.update(types, self.ty, &self.edits);

        let references = types.reference_offsets(self.ty).to_vec();
        for (index, offset) in references.into_iter().enumerate() {
            types.set_reference_offset(self.ty, index, self.translate(offset));
        }
    }
}

// ── Planner ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Planned(PlanId),
    /// Visited this epoch, nothing to do.
    Uninteresting,
    /// Reference holders are never relaid out. Survives epochs.
    Reference,
}

#[derive(Debug, Default, Clone, Copy)]
struct TypeState {
    epoch: u64,
    mark: Option<Mark>,
    blank_count: u32,
}

#[derive(Debug, Default)]
pub struct Planner {
    epoch: u64,
    states: HashMap<TypeId, TypeState, RandomState>,
    plans: Vec<LayoutPlan>,
    by_type: BTreeMap<TypeId, PlanId>,
    types_searched: usize,
}

impl Planner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Consecutive epochs in which `ty` was inspected and found nothing to pad.
    pub fn blank_count(&self, ty: TypeId) -> u32 {
        self.states.get(&ty).map_or(0, |state| state.blank_count)
    }

    fn mark(&self, ty: TypeId) -> Option<Mark> {
        let state = self.states.get(&ty)?;
        match state.mark {
            Some(Mark::Reference) => Some(Mark::Reference),
            mark if state.epoch == self.epoch => mark,
            _ => None,
        }
    }

    fn set_mark(&mut self, ty: TypeId, mark: Mark) {
        let epoch = self.epoch;
        let state = self.states.entry(ty).or_default();
        state.epoch = epoch;
        state.mark = Some(mark);
    }

    fn add_blank(&mut self, ty: TypeId) {
        let state = self.states.entry(ty).or_default();
        state.blank_count = state.blank_count.saturating_add(1);
    }

    /// Live plan of `ty` in the current epoch.
    pub fn plan_for(&self, ty: TypeId) -> Option<&LayoutPlan> {
        self.by_type.get(&ty).map(|&id| &self.plans[id])
    }

    pub fn plans(&self) -> impl Iterator<Item = &LayoutPlan> + '_ {
        self.by_type.values().map(|&id| &self.plans[id])
    }

    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }

    /// Drops every plan of the current epoch.
    pub fn clear(&mut self) {
        self.plans.clear();
        self.by_type.clear();
    }

    /// Builds the plans for one epoch from the gathered statistics. Returns
    /// the number of types that will be relaid out.
    pub fn generate<T: TypeMetadata + ?Sized>(
        &mut self,
        types: &mut T,
        hits: BTreeMap<TypeId, TypeHitStat>,
        policy: &Policy,
        raw_offsets: &RawOffsetRegistry,
        timings: &Timings,
    ) -> usize {
        let _clock = timings.clock(Stage::Planner);
        self.epoch += 1;
        self.clear();

        {
            let _clock = timings.clock(Stage::PlannerDrillDown);
            self.drill_down(types, hits, policy, raw_offsets);
        }
        let mut conflicts = {
            let _clock = timings.clock(Stage::PlannerFlatten);
            self.flatten_all()
        };
        {
            let _clock = timings.clock(Stage::PlannerSubtypes);
            self.walk_subtypes(types, raw_offsets, &mut conflicts);
        }
        self.drop_conflicts(types, conflicts);

        for &id in self.by_type.values() {
            let plan = &mut self.plans[id];
            plan.placeholder = Some(types.create_placeholder(plan.ty));
            debug!(
                "plan for {}: {} -> {} bytes, edits {:?}",
                types.type_name(plan.ty),
                plan.old_size,
                plan.new_size,
                plan.edits.as_slice()
            );
        }
        let planned: Vec<TypeId> = self.by_type.keys().copied().collect();
        for ty in planned {
            if let Some(state) = self.states.get_mut(&ty) {
                state.blank_count = 0;
            }
        }
        self.by_type.len()
    }

    fn drill_down<T: TypeMetadata + ?Sized>(
        &mut self,
        types: &T,
        hits: BTreeMap<TypeId, TypeHitStat>,
        policy: &Policy,
        raw_offsets: &RawOffsetRegistry,
    ) {
        for (ty, stat) in hits {
            if !stat.should_relayout(policy, self.blank_count(ty)) {
                continue;
            }
            if !Self::plannable(types, ty) {
                debug!("not planning {} ({:?})", types.type_name(ty), types.kind(ty));
                continue;
            }
            let id = self.allocate(types, ty, raw_offsets);
            self.plans[id].direct_hit = true;
            self.merge_hits(id, &stat, stat.should_relayout_header(policy), policy);
        }
    }

    /// Plain instance types outside any reference hierarchy.
    fn plannable<T: TypeMetadata + ?Sized>(types: &T, ty: TypeId) -> bool {
        let mut current = Some(ty);
        while let Some(id) = current {
            if types.kind(id) == TypeKind::Reference {
                return false;
            }
            current = types.super_type(id);
        }
        types.kind(ty) == TypeKind::Instance
    }

    fn allocate<T: TypeMetadata + ?Sized>(
        &mut self,
        types: &T,
        ty: TypeId,
        raw_offsets: &RawOffsetRegistry,
    ) -> PlanId {
        if let Some(Mark::Planned(id)) = self.mark(ty) {
            return id;
        }
        let parent = match types.super_type(ty) {
            Some(parent) if !is_terminal(types, ty) => Some(self.allocate(types, parent, raw_offsets)),
            _ => None,
        };
        self.init(types, ty, parent, raw_offsets)
    }

    fn init<T: TypeMetadata + ?Sized>(
        &mut self,
        types: &T,
        ty: TypeId,
        parent: Option<PlanId>,
        raw_offsets: &RawOffsetRegistry,
    ) -> PlanId {
        let pinned = raw_offsets.is_pinned(ty) || parent.is_some_and(|p| self.plans[p].pinned);
        if pinned {
            debug!("type {} has a raw offset taken, ignoring", types.type_name(ty));
        }
        let id = self.plans.len();
        self.plans.push(LayoutPlan::new(types, ty, parent, pinned));
        self.set_mark(ty, Mark::Planned(id));
        trace!(
            "considering padding for {} (old size {}, parent {parent:?})",
            types.type_name(ty),
            self.plans[id].old_size
        );
        id
    }

    /// Records hot fields as pad candidates. Ancestors consume the fields
    /// they declare first. Returns the index of the first field past `id`.
    fn merge_hits(&mut self, id: PlanId, stat: &TypeHitStat, header_hit: bool, policy: &Policy) -> usize {
        let mut index = match self.plans[id].parent {
            Some(parent) => self.merge_hits(parent, stat, header_hit, policy),
            None => 0,
        };
        let plan = &mut self.plans[id];
        plan.header_hit |= header_hit;
        let fields = stat.fields();
        while let Some(field) = fields.get(index) {
            if field.offset >= plan.old_size {
                break;
            }
            if policy.should_handle_field_hit(field.hit) {
                if let Err(at) = plan.candidates.binary_search(&field.offset) {
                    plan.candidates.insert(at, field.offset);
                }
            }
            index += 1;
        }
        index
    }

    /// Computes the edit list of `id`. Memoized: later calls return the
    /// first result. Returns whether the plan changes the layout.
    pub fn flatten(&mut self, id: PlanId) -> bool {
        if self.plans[id].flattened {
            return self.plans[id].viable;
        }
        self.plans[id].flattened = true;
        if self.plans[id].pinned {
            return false;
        }

        let mut diff = 0;
        let mut edits = EditList::new();
        if let Some(parent) = self.plans[id].parent {
            if self.flatten(parent) {
                let parent = &self.plans[parent];
                diff = parent.new_size - parent.old_size;
                edits.inherit(&parent.edits);
                edits.push(parent.old_size, diff);
            } else {
                self.plans[id].parent = None;
            }
        }

        let plan = &mut self.plans[id];
        let mut force = plan.direct_hit;
        let mut header_padded = false;
        if plan.header_hit {
            match plan.candidates.first() {
                Some(&first) if first + diff < HEADER_SIZE + LINE => {
                    diff += LINE;
                    edits.push(first, diff);
                    header_padded = true;
                }
                None if plan.direct_hit && plan.old_size >= 2 * LINE => {
                    debug!("true sharing on {:?}, abandoning", plan.ty);
                    return false;
                }
                _ => {}
            }
        }

        if let Some(&last) = plan.candidates.last() {
            force = true;
            let mut last_padded = header_padded && plan.candidates.len() == 1;
            for pair in plan.candidates.windows(2) {
                if pair[0] + LINE > pair[1] {
                    diff += LINE;
                    edits.push(pair[1], diff);
                    last_padded = pair[1] == last;
                }
            }
            // the last hot field starts a fresh line even when nothing hot
            // precedes it
            if !last_padded {
                diff += LINE;
                edits.push(last, diff);
            }
            // and the own field after it is pushed off that line
            if let Some(&next) = plan.own_fields.iter().find(|&&offset| offset > last) {
                diff += LINE;
                edits.push(next, diff);
            }
        }

        let ty = plan.ty;
        if diff == 0 && !force {
            self.add_blank(ty);
            return false;
        }
        let new_size = (plan.old_size + diff).next_multiple_of(LINE);
        if new_size == plan.old_size {
            self.add_blank(ty);
            return false;
        }
        plan.new_size = new_size;
        plan.edits = edits;
        plan.viable = true;
        true
    }

    /// Flattens every plan, prunes the unused ones and returns the live plans
    /// sitting above a pinned one.
    fn flatten_all(&mut self) -> Vec<PlanId> {
        for id in 0..self.plans.len() {
            self.flatten(id);
        }
        for id in 0..self.plans.len() {
            let plan = &self.plans[id];
            if plan.viable && !plan.is_unused() {
                self.by_type.insert(plan.ty, id);
            } else {
                trace!("pruned plan for {:?}", plan.ty);
                self.set_mark(plan.ty, Mark::Uninteresting);
            }
        }
        let mut conflicts = Vec::new();
        for id in 0..self.plans.len() {
            if self.plans[id].pinned {
                self.record_conflict(id, &mut conflicts);
            }
        }
        conflicts
    }

    /// Extends planning to every subtype of a planned type. Live plans with a
    /// pinned subtype are added to `conflicts`.
    fn walk_subtypes<T: TypeMetadata + ?Sized>(
        &mut self,
        types: &T,
        raw_offsets: &RawOffsetRegistry,
        conflicts: &mut Vec<PlanId>,
    ) {
        self.types_searched = 0;
        for ty in types.all_types() {
            self.process_type(types, ty, raw_offsets, conflicts);
        }
        debug!("processed {} types", self.types_searched);
    }

    fn process_type<T: TypeMetadata + ?Sized>(
        &mut self,
        types: &T,
        ty: TypeId,
        raw_offsets: &RawOffsetRegistry,
        conflicts: &mut Vec<PlanId>,
    ) -> Option<PlanId> {
        match self.mark(ty) {
            Some(Mark::Planned(id)) => return Some(id),
            Some(Mark::Uninteresting | Mark::Reference) => return None,
            None => {}
        }
        self.types_searched += 1;
        match types.kind(ty) {
            TypeKind::Reference => {
                self.set_mark(ty, Mark::Reference);
                return None;
            }
            TypeKind::Array | TypeKind::Placeholder => {
                self.set_mark(ty, Mark::Uninteresting);
                return None;
            }
            TypeKind::Instance => {}
        }

        let parent = match types.super_type(ty) {
            Some(parent) if !is_terminal(types, ty) => self.process_type(types, parent, raw_offsets, conflicts),
            _ => None,
        };
        let Some(parent) = parent else {
            self.set_mark(ty, Mark::Uninteresting);
            return None;
        };

        if raw_offsets.is_pinned(ty) {
            debug!(
                "{} is pinned below a planned type, dropping its hierarchy",
                types.type_name(ty)
            );
            conflicts.push(parent);
            self.set_mark(ty, Mark::Uninteresting);
            return None;
        }

        let id = self.init(types, ty, Some(parent), raw_offsets);
        if self.flatten(id) && !self.plans[id].is_unused() {
            self.by_type.insert(ty, id);
            Some(id)
        } else {
            self.set_mark(ty, Mark::Uninteresting);
            None
        }
    }

    /// A pinned plan conflicts with any live plan among its ancestors.
    fn record_conflict(&self, id: PlanId, conflicts: &mut Vec<PlanId>) {
        let mut current = self.plans[id].parent;
        while let Some(parent) = current {
            if self.by_type.get(&self.plans[parent].ty) == Some(&parent) {
                conflicts.push(parent);
                return;
            }
            current = self.plans[parent].parent;
        }
    }

    /// Drops the topmost planned ancestor of every conflict and everything
    /// planned below it.
    fn drop_conflicts<T: TypeMetadata + ?Sized>(&mut self, types: &T, conflicts: Vec<PlanId>) {
        if conflicts.is_empty() {
            return;
        }
        let mut roots = BTreeSet::new();
        for mut id in conflicts {
            while let Some(parent) = self.plans[id].parent {
                if !self.by_type.contains_key(&self.plans[parent].ty) {
                    break;
                }
                id = parent;
            }
            roots.insert(id);
        }

        let doomed: Vec<TypeId> = self
            .by_type
            .iter()
            .filter(|&(_, &id)| {
                let mut current = Some(id);
                while let Some(plan) = current {
                    if roots.contains(&plan) {
                        return true;
                    }
                    current = self.plans[plan].parent;
                }
                false
            })
            .map(|(&ty, _)| ty)
            .collect();
        for ty in doomed {
            debug!("dropping plan for {} (pinned subtype)", types.type_name(ty));
            self.by_type.remove(&ty);
            self.set_mark(ty, Mark::Uninteresting);
        }
    }

    /// Translates every cached field access, loads and stores alike, whose
    /// target is being relaid out. Returns the number of entries rewritten.
    pub fn fix_call_sites<T: TypeMetadata + ?Sized>(&self, types: &mut T) -> usize {
        if self.by_type.is_empty() {
            return 0;
        }
        let mut fixed = 0;
        for ty in types.all_types() {
            for index in 0..types.call_sites(ty).len() {
                let entry = types.call_sites(ty)[index];
                let Some(plan) = self.plan_for(entry.target) else {
                    continue;
                };
                let offset = plan.translate(entry.offset);
                if offset != entry.offset {
                    types.set_call_site_offset(ty, index, offset);
                    fixed += 1;
                }
            }
        }
        fixed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        HitCount,
        sim::{FieldKind, TypeTable},
    };

    const V: FieldKind = FieldKind::Value;

    fn shared(count: u32) -> HitCount {
        HitCount::new(true, count)
    }

    fn hits_for(types: &TypeTable, ty: TypeId, offsets: &[(u32, u32)]) -> TypeHitStat {
        let mut stat = TypeHitStat::new(types, ty);
        for &(offset, count) in offsets {
            stat.update_hit(offset, shared(count));
        }
        stat
    }

    fn run(
        planner: &mut Planner,
        types: &mut TypeTable,
        stats: Vec<(TypeId, TypeHitStat)>,
        raw: &RawOffsetRegistry,
    ) -> usize {
        let hits = stats.into_iter().collect();
        planner.generate(types, hits, &Policy::default(), raw, &Timings::new(false))
    }

    #[test]
    fn test_single_hot_field_moves_past_a_line() {
        let mut types = TypeTable::new();
        let t = types.define("T", TypeTable::OBJECT, &[("a", V), ("b", V)]);
        let stat = hits_for(&types, t, &[(24, 1000)]);
        let mut planner = Planner::new();

        assert_eq!(run(&mut planner, &mut types, vec![(t, stat)], &RawOffsetRegistry::new()), 1);
        let plan = planner.plan_for(t).unwrap();
        assert_eq!(plan.old_size(), 32);
        assert_eq!(plan.new_size(), 128);
        assert_eq!(plan.translate(16), 16);
        assert_eq!(plan.translate(24), 88);
        assert!(plan.placeholder().is_some());
        assert_eq!(types.instance_size(plan.placeholder().unwrap()), 32);
    }

    #[test]
    fn test_close_candidates_are_split() {
        let mut types = TypeTable::new();
        let t = types.define("Pair", TypeTable::OBJECT, &[("x", V), ("y", V), ("z", V)]);
        let stat = hits_for(&types, t, &[(16, 40), (24, 40)]);
        let mut planner = Planner::new();
        run(&mut planner, &mut types, vec![(t, stat)], &RawOffsetRegistry::new());

        let plan = planner.plan_for(t).unwrap();
        let (x, y, z) = (plan.translate(16), plan.translate(24), plan.translate(32));
        assert!(plan.new_size() >= plan.old_size() + LINE);
        assert!(y - x >= LINE, "hot fields must land on different lines: {x} {y}");
        assert!(z - y >= LINE, "trailing field must not share the hot line: {y} {z}");
        assert_eq!(plan.new_size() % LINE, 0);
    }

    #[test]
    fn test_flatten_is_memoized() {
        let mut types = TypeTable::new();
        let t = types.define("T", TypeTable::OBJECT, &[("a", V), ("b", V)]);
        let stat = hits_for(&types, t, &[(24, 1000)]);
        let mut planner = Planner::new();
        run(&mut planner, &mut types, vec![(t, stat)], &RawOffsetRegistry::new());

        let id = planner.by_type[&t];
        let before = planner.plans[id].edits().clone();
        assert!(planner.flatten(id));
        assert!(planner.flatten(id));
        assert_eq!(planner.plans[id].edits(), &before);
    }

    #[test]
    fn test_header_hit_pads_after_header() {
        let mut types = TypeTable::new();
        let t = types.define("Locked", TypeTable::OBJECT, &[("state", V), ("other", V)]);
        let stat = hits_for(&types, t, &[(0, 100), (16, 50)]);
        let mut planner = Planner::new();
        run(&mut planner, &mut types, vec![(t, stat)], &RawOffsetRegistry::new());

        let plan = planner.plan_for(t).unwrap();
        assert!(plan.translate(16) >= HEADER_SIZE + LINE);
        assert!(plan.translate(24) - plan.translate(16) >= LINE);
    }

    #[test]
    fn test_true_sharing_is_abandoned() {
        let mut types = TypeTable::new();
        let fields: Vec<(String, FieldKind)> = (0..14).map(|i| (format!("f{i}"), V)).collect();
        let fields: Vec<(&str, FieldKind)> = fields.iter().map(|(n, k)| (n.as_str(), *k)).collect();
        let t = types.define("Big", TypeTable::OBJECT, &fields);
        assert_eq!(types.instance_size(t), 128);
        let stat = hits_for(&types, t, &[(8, 100)]);
        let mut planner = Planner::new();

        assert_eq!(run(&mut planner, &mut types, vec![(t, stat)], &RawOffsetRegistry::new()), 0);
        assert!(planner.plan_for(t).is_none());
        assert_eq!(planner.blank_count(t), 0, "true sharing is not a blank inspection");
    }

    #[test]
    fn test_blank_types_are_debounced() {
        let mut types = TypeTable::new();
        let fields: Vec<(String, FieldKind)> = (0..6).map(|i| (format!("f{i}"), V)).collect();
        let fields: Vec<(&str, FieldKind)> = fields.iter().map(|(n, k)| (n.as_str(), *k)).collect();
        let t = types.define("Spread", TypeTable::OBJECT, &fields);
        assert_eq!(types.instance_size(t), 64);
        // Hot as a whole, but no single field reaches the field threshold.
        let mut spread: Vec<(u32, u32)> = (0..6).map(|i| (16 + i * 8, 4)).collect();
        spread.push((0, 4));
        let mut planner = Planner::new();
        let raw = RawOffsetRegistry::new();

        for epoch in 1..=3 {
            let stat = hits_for(&types, t, &spread);
            assert_eq!(run(&mut planner, &mut types, vec![(t, stat)], &raw), 0);
            assert_eq!(planner.blank_count(t), epoch);
        }
        let stat = hits_for(&types, t, &spread);
        run(&mut planner, &mut types, vec![(t, stat)], &raw);
        assert_eq!(planner.blank_count(t), 3, "fourth epoch must skip the type");
    }

    #[test]
    fn test_subtypes_inherit_parent_growth() {
        let mut types = TypeTable::new();
        let base = types.define("Base", TypeTable::OBJECT, &[("a", V), ("b", V)]);
        let derived = types.define("Derived", base, &[("c", V)]);
        let unrelated = types.define("Other", TypeTable::OBJECT, &[("x", V)]);
        let stat = hits_for(&types, base, &[(24, 500)]);
        let mut planner = Planner::new();

        assert_eq!(run(&mut planner, &mut types, vec![(base, stat)], &RawOffsetRegistry::new()), 2);
        let parent = planner.plan_for(base).unwrap();
        let child = planner.plan_for(derived).unwrap();
        assert_eq!(child.translate(24), parent.translate(24));
        assert_eq!(child.translate(32), 32 + parent.new_size() - parent.old_size());
        assert_eq!(child.new_size() % LINE, 0);
        assert!(planner.plan_for(unrelated).is_none());
    }

    #[test]
    fn test_hits_on_inherited_fields_plan_the_ancestor() {
        let mut types = TypeTable::new();
        let base = types.define("Base", TypeTable::OBJECT, &[("a", V), ("b", V)]);
        let derived = types.define("Derived", base, &[("c", V), ("d", V)]);
        let stat = hits_for(&types, derived, &[(24, 500)]);
        let mut planner = Planner::new();
        run(&mut planner, &mut types, vec![(derived, stat)], &RawOffsetRegistry::new());

        let parent = planner.plan_for(base).expect("ancestor declares the hot field");
        assert_eq!(parent.candidates(), &[24]);
        let child = planner.plan_for(derived).unwrap();
        assert!(child.candidates().is_empty());
        assert!(child.is_direct_hit() && !parent.is_direct_hit());
        assert_eq!(child.translate(24), 88);
    }

    #[test]
    fn test_pinned_type_is_excluded() {
        let mut types = TypeTable::new();
        let t = types.define("Unsafe", TypeTable::OBJECT, &[("a", V), ("b", V)]);
        let child = types.define("UnsafeChild", t, &[("c", V)]);
        let mut raw = RawOffsetRegistry::new();
        raw.pin(t);
        let stat = hits_for(&types, t, &[(24, 1000)]);
        let mut planner = Planner::new();

        assert_eq!(run(&mut planner, &mut types, vec![(t, stat)], &raw), 0);
        assert!(planner.plan_for(t).is_none());
        assert!(planner.plan_for(child).is_none());
    }

    #[test]
    fn test_pinned_subtype_drops_hierarchy() {
        let mut types = TypeTable::new();
        let base = types.define("Base", TypeTable::OBJECT, &[("a", V), ("b", V)]);
        let left = types.define("Left", base, &[("c", V)]);
        let right = types.define("Right", base, &[("d", V)]);
        let mut raw = RawOffsetRegistry::new();
        raw.pin(right);
        let stat = hits_for(&types, base, &[(24, 1000)]);
        let mut planner = Planner::new();

        assert_eq!(run(&mut planner, &mut types, vec![(base, stat)], &raw), 0);
        for ty in [base, left, right] {
            assert!(planner.plan_for(ty).is_none(), "{} must not be planned", types.type_name(ty));
        }
    }

    #[test]
    fn test_reference_types_are_never_planned() {
        let mut types = TypeTable::new();
        let weak = types.define_reference("Weak", &[("referent", FieldKind::Reference), ("q", V)]);
        let stat = hits_for(&types, weak, &[(24, 1000)]);
        let mut planner = Planner::new();

        assert_eq!(run(&mut planner, &mut types, vec![(weak, stat)], &RawOffsetRegistry::new()), 0);
        assert_eq!(planner.mark(weak), Some(Mark::Reference));
    }

    #[test]
    fn test_epoch_invalidates_plans() {
        let mut types = TypeTable::new();
        let t = types.define("T", TypeTable::OBJECT, &[("a", V), ("b", V)]);
        let stat = hits_for(&types, t, &[(24, 1000)]);
        let mut planner = Planner::new();
        run(&mut planner, &mut types, vec![(t, stat)], &RawOffsetRegistry::new());
        assert!(matches!(planner.mark(t), Some(Mark::Planned(_))));

        run(&mut planner, &mut types, Vec::new(), &RawOffsetRegistry::new());
        assert_eq!(planner.mark(t), Some(Mark::Uninteresting));
        assert!(planner.is_empty());
    }

    #[test]
    fn test_apply_and_call_sites() {
        let mut types = TypeTable::new();
        let t = types.define(
            "Node",
            TypeTable::OBJECT,
            &[("a", V), ("next", FieldKind::Reference)],
        );
        let user = types.define("User", TypeTable::OBJECT, &[]);
        let site = types.add_call_site(user, t, "next").unwrap();
        let slot = types.define_static(t, "NEXT_OFFSET");
        let mut raw = RawOffsetRegistry::new();
        raw.register(&mut types, t, slot, 24);

        let stat = hits_for(&types, t, &[(24, 1000)]);
        let mut planner = Planner::new();
        run(&mut planner, &mut types, vec![(t, stat)], &raw);
        let plan = planner.plan_for(t).unwrap().clone();
        plan.apply(&mut types, &mut raw);
        assert_eq!(planner.fix_call_sites(&mut types), 1);

        assert_eq!(types.instance_size(t), 128);
        assert_eq!(types.field_offset(t, "next"), Some(88));
        assert_eq!(types.reference_offsets(t), &[88]);
        assert_eq!(types.static_slot(t, slot), 88);
        assert_eq!(types.call_sites(user)[site].offset, 88);
    }

    #[test]
    fn test_fix_call_sites_rewrites_loads_and_stores() {
        let mut types = TypeTable::new();
        let t = types.define(
            "Node",
            TypeTable::OBJECT,
            &[("a", V), ("next", FieldKind::Reference)],
        );
        let user = types.define("User", TypeTable::OBJECT, &[]);
        let load = types.add_call_site(user, t, "next").unwrap();
        let store = types.add_write_site(user, t, "next").unwrap();
        let untouched = types.add_write_site(user, t, "a").unwrap();
        let mut raw = RawOffsetRegistry::new();

        let stat = hits_for(&types, t, &[(24, 1000)]);
        let mut planner = Planner::new();
        run(&mut planner, &mut types, vec![(t, stat)], &raw);
        let plan = planner.plan_for(t).unwrap().clone();
        plan.apply(&mut types, &mut raw);
        assert_eq!(planner.fix_call_sites(&mut types), 2);

        let sites = types.call_sites(user);
        assert_eq!(sites[load].offset, 88);
        assert_eq!(sites[store].offset, 88);
        assert!(!sites[store].reads_field);
        assert_eq!(sites[untouched].offset, 16);
        assert_eq!(types.field_offset(t, "a"), Some(16));
    }
}
