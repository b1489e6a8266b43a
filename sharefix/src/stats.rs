//! Per-type, per-field hit statistics.
//!
//! A gather pass resolves every buffered heap hit to the object that contains
//! it and charges the hit to the field at or below the hit's offset.

use std::{
    collections::BTreeMap,
    io::{self, BufRead, Write},
};

use log::{info, trace, warn};

use crate::{
    Address, HeapRegions, HitCount, PerfCollector, Policy, TypeId, TypeKind, TypeMetadata,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldHitStat {
    pub inherited: bool,
    pub offset: u32,
    pub name: String,
    pub hit: HitCount,
}

impl FieldHitStat {
    pub fn new(inherited: bool, offset: u32, name: impl Into<String>) -> Self {
        Self {
            inherited,
            offset,
            name: name.into(),
            hit: HitCount::ZERO,
        }
    }
}

// ── TypeHitStat ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeHitStat {
    name: String,
    total: HitCount,
    header: HitCount,
    /// Sorted by offset at construction, never reordered.
    fields: Vec<FieldHitStat>,
}

impl TypeHitStat {
    /// Collects the instance fields of `ty` and all of its ancestors.
    pub fn new<T: TypeMetadata + ?Sized>(types: &T, ty: TypeId) -> Self {
        let mut fields = Vec::new();
        let mut current = Some(ty);
        let mut inherited = false;
        while let Some(owner) = current {
            fields.extend(
                types
                    .declared_fields(owner)
                    .iter()
                    .filter(|field| !field.is_static)
                    .map(|field| FieldHitStat::new(inherited, field.offset, field.name.as_str())),
            );
            current = types.super_type(owner);
            inherited = true;
        }
        Self::from_fields(types.type_name(ty), fields)
    }

    pub fn from_fields(name: impl Into<String>, mut fields: Vec<FieldHitStat>) -> Self {
        fields.sort_by_key(|field| field.offset);
        Self {
            name: name.into(),
            total: HitCount::ZERO,
            header: HitCount::ZERO,
            fields,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn total(&self) -> HitCount {
        self.total
    }

    pub fn header(&self) -> HitCount {
        self.header
    }

    pub fn fields(&self) -> &[FieldHitStat] {
        &self.fields
    }

    /// Charges `hit` to the field at `offset`, or the closest field below it.
    /// Offsets below the first field, header words included, go to the header.
    pub fn update_hit(&mut self, offset: u32, hit: HitCount) {
        self.total.merge(hit);
        let index = match self
            .fields
            .binary_search_by_key(&offset, |field| field.offset)
        {
            Ok(index) => index,
            Err(0) => {
                self.header.merge(hit);
                warn!(
                    "hit at {}+{offset} below the first field, charged to header",
                    self.name
                );
                return;
            }
            Err(insert) => insert - 1,
        };

        let field = &mut self.fields[index];
        trace!(
            "hit to {}:{offset} -> {} {}:{}",
            self.name, field.name, hit.shared, hit.single
        );
        field.hit.merge(hit);
    }

    pub fn should_relayout(&self, policy: &Policy, blank_count: u32) -> bool {
        policy.under_blank_limit(blank_count) && policy.should_handle_hit(self.total)
    }

    pub fn should_relayout_header(&self, policy: &Policy) -> bool {
        policy.should_handle_hit(self.header)
    }

    pub fn log_report(&self) {
        info!("hits for type '{}':", self.name);
        if !self.header.is_empty() {
            info!(
                "- {}::header: {}:{}",
                self.name, self.header.shared, self.header.single
            );
        }
        for field in self.fields.iter().filter(|field| !field.hit.is_empty()) {
            info!(
                "- {}::{}[{}]{}: {}:{}",
                self.name,
                field.name,
                field.offset,
                if field.inherited { " <inherited>" } else { "" },
                field.hit.shared,
                field.hit.single
            );
        }
    }

    /// Writes `name\tfield\tfield...` for the fields over the field threshold.
    /// Nothing is written when no field qualifies.
    pub fn serialize<W: Write + ?Sized>(&self, policy: &Policy, out: &mut W) -> io::Result<()> {
        let mut hot = self
            .fields
            .iter()
            .filter(|field| policy.should_handle_field_hit(field.hit))
            .peekable();
        if hot.peek().is_none() {
            return Ok(());
        }
        write!(out, "{}", self.name)?;
        for field in hot {
            write!(out, "\t{}", field.name)?;
        }
        writeln!(out)
    }

    /// Rebuilds a skeletal record from one report line. Offsets are not stored,
    /// so every field comes back at offset 0.
    pub fn deserialize(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let name = words.next()?;
        let fields: Vec<_> = words.map(|field| FieldHitStat::new(false, 0, field)).collect();
        if fields.is_empty() {
            return None;
        }
        Some(Self::from_fields(name, fields))
    }

    pub fn read_report<R: BufRead>(reader: R) -> io::Result<Vec<Self>> {
        let mut stats = Vec::new();
        for line in reader.lines() {
            if let Some(stat) = Self::deserialize(&line?) {
                stats.push(stat);
            }
        }
        Ok(stats)
    }
}

// ── Gather ────────────────────────────────────────────────────────────

/// How heap hits are mapped back to objects.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum GatherStrategy {
    /// Ask the heap for the block start of every hit address.
    #[default]
    BlockStart,
    /// Walk every space once, matching objects against the sorted hot hits.
    SpaceWalk,
}

#[derive(Debug, Default)]
pub struct TypeCollector {
    strategy: GatherStrategy,
    hits: BTreeMap<TypeId, TypeHitStat>,
    array_hits: u64,
    dropped_hits: u64,
}

impl TypeCollector {
    pub fn new(strategy: GatherStrategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    pub fn gather<R>(&mut self, perf: &PerfCollector, runtime: &R, policy: &Policy)
    where
        R: HeapRegions + TypeMetadata + ?Sized,
    {
        match self.strategy {
            GatherStrategy::BlockStart => {
                for (address, hit) in perf.hits().iter() {
                    if let Some(obj) = runtime
                        .block_start(address)
                        .filter(|&block| runtime.block_is_object(block))
                    {
                        self.attribute(runtime, obj, address, hit);
                    }
                }
            }
            GatherStrategy::SpaceWalk => {
                let vector = perf.to_hit_vector(|hit| policy.should_handle_field_hit(hit));
                self.gather_space_walk(runtime, &vector);
            }
        }
    }

    fn gather_space_walk<R>(&mut self, runtime: &R, vector: &[(Address, HitCount)])
    where
        R: HeapRegions + TypeMetadata + ?Sized,
    {
        if vector.is_empty() {
            return;
        }
        for space in runtime.spaces() {
            let used = runtime.space_used(space);
            let mut pos = vector.partition_point(|&(address, _)| address < used.start);
            let mut cursor = crate::ObjectCursor::new(used.clone());
            while pos < vector.len() && vector[pos].0 < used.end {
                let Some(obj) = cursor.advance(runtime) else { break };
                let end = obj + runtime.object_size(obj);
                while pos < vector.len() && vector[pos].0 < end {
                    let (address, hit) = vector[pos];
                    if address >= obj {
                        self.attribute(runtime, obj, address, hit);
                    }
                    pos += 1;
                }
            }
        }
    }

    fn attribute<R>(&mut self, runtime: &R, obj: Address, address: Address, hit: HitCount)
    where
        R: HeapRegions + TypeMetadata + ?Sized,
    {
        let ty = runtime.object_type(obj);
        match runtime.kind(ty) {
            TypeKind::Array => {
                self.array_hits += 1;
                trace!("array hit {address:#x} in {obj:#x}");
                return;
            }
            TypeKind::Placeholder => return,
            TypeKind::Instance | TypeKind::Reference => {}
        }
        if runtime.is_foundational(ty) {
            self.dropped_hits += 1;
            trace!("ignoring hit in {}", runtime.type_name(ty));
            return;
        }
        if hit.shared == 0 {
            return;
        }
        let offset = (address - obj) as u32;
        self.hits
            .entry(ty)
            .or_insert_with(|| TypeHitStat::new(runtime, ty))
            .update_hit(offset, hit);
    }

    pub fn hits(&self) -> &BTreeMap<TypeId, TypeHitStat> {
        &self.hits
    }

    pub fn get(&self, ty: TypeId) -> Option<&TypeHitStat> {
        self.hits.get(&ty)
    }

    /// Hands the accumulated statistics to the planner and starts over.
    pub fn take_hits(&mut self) -> BTreeMap<TypeId, TypeHitStat> {
        std::mem::take(&mut self.hits)
    }

    pub fn array_hits(&self) -> u64 {
        self.array_hits
    }

    pub fn dropped_hits(&self) -> u64 {
        self.dropped_hits
    }

    pub fn log_report(&self) {
        info!("processed {} types", self.hits.len());
        for stat in self.hits.values() {
            stat.log_report();
        }
    }

    pub fn write_report<W: Write + ?Sized>(&self, policy: &Policy, out: &mut W) -> io::Result<()> {
        for stat in self.hits.values() {
            stat.serialize(policy, out)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ThreadSampler,
        sim::{FieldKind, SimRuntime, SimSettings, TypeTable},
    };

    fn three_fields() -> TypeHitStat {
        TypeHitStat::from_fields(
            "Counter",
            vec![
                FieldHitStat::new(false, 40, "c"),
                FieldHitStat::new(true, 16, "a"),
                FieldHitStat::new(false, 24, "b"),
            ],
        )
    }

    fn field<'a>(stat: &'a TypeHitStat, name: &str) -> &'a FieldHitStat {
        stat.fields()
            .iter()
            .find(|field| field.name == name)
            .expect("field exists")
    }

    #[test]
    fn test_fields_sorted_by_offset() {
        let stat = three_fields();
        let offsets: Vec<_> = stat.fields().iter().map(|field| field.offset).collect();
        assert_eq!(offsets, vec![16, 24, 40]);
    }

    #[test]
    fn test_field_resolution() {
        let mut stat = three_fields();
        stat.update_hit(24, HitCount::new(true, 1));
        assert_eq!(field(&stat, "b").hit.shared, 1, "exact match");

        stat.update_hit(30, HitCount::new(true, 2));
        assert_eq!(field(&stat, "b").hit.shared, 3, "nearest field below");

        stat.update_hit(10, HitCount::new(true, 4));
        assert_eq!(stat.header().shared, 4, "offset inside the header");

        stat.update_hit(100, HitCount::new(false, 1));
        assert_eq!(field(&stat, "c").hit.single, 1, "past the last field");

        assert_eq!(stat.total(), HitCount { shared: 7, single: 1 });
    }

    #[test]
    fn test_hit_below_first_field_goes_to_header() {
        let mut stat = TypeHitStat::from_fields("Late", vec![FieldHitStat::new(false, 32, "x")]);
        stat.update_hit(20, HitCount::new(true, 3));
        assert_eq!(stat.header().shared, 3);
        assert_eq!(field(&stat, "x").hit, HitCount::ZERO);

        let mut empty = TypeHitStat::from_fields("Empty", Vec::new());
        empty.update_hit(24, HitCount::new(true, 1));
        assert_eq!(empty.header().shared, 1);
    }

    #[test]
    fn test_header_word_hits_take_the_header_path() {
        let mut stat = three_fields();
        stat.update_hit(0, HitCount::new(true, 2));
        stat.update_hit(8, HitCount::new(true, 3));
        stat.update_hit(15, HitCount::new(false, 1));
        assert_eq!(stat.header(), HitCount { shared: 5, single: 1 });
        assert!(stat.fields().iter().all(|f| f.hit == HitCount::ZERO));
        assert_eq!(stat.total(), stat.header());
    }

    #[test]
    fn test_should_relayout_uses_shared_and_blank_count() {
        let policy = Policy::default();
        let mut stat = three_fields();
        stat.update_hit(24, HitCount::new(false, 1_000));
        assert!(!stat.should_relayout(&policy, 0), "private hits never qualify");

        stat.update_hit(24, HitCount::new(true, 25));
        assert!(stat.should_relayout(&policy, 0));
        assert!(stat.should_relayout(&policy, 2));
        assert!(!stat.should_relayout(&policy, 3));
        assert!(!stat.should_relayout_header(&policy));
    }

    #[test]
    fn test_serialize_only_hot_fields() {
        let policy = Policy::default();
        let mut stat = three_fields();
        stat.update_hit(16, HitCount::new(true, 4));
        stat.update_hit(24, HitCount::new(true, 5));
        stat.update_hit(40, HitCount::new(true, 50));

        let mut out = Vec::new();
        stat.serialize(&policy, &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "Counter\tb\tc\n");

        let mut cold = Vec::new();
        three_fields().serialize(&policy, &mut cold).unwrap();
        assert!(cold.is_empty());
    }

    #[test]
    fn test_deserialize() {
        let stat = TypeHitStat::deserialize("Counter\tb\tc\n").expect("line parses");
        assert_eq!(stat.name(), "Counter");
        let names: Vec<_> = stat.fields().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);
        assert!(stat.fields().iter().all(|f| f.offset == 0));

        assert_eq!(TypeHitStat::deserialize("Lonely\n"), None);
        assert_eq!(TypeHitStat::deserialize(""), None);

        let report = "A\tx\nB\ny\tz\nC\tw\n";
        let stats = TypeHitStat::read_report(report.as_bytes()).unwrap();
        let names: Vec<_> = stats.iter().map(|s| s.name().to_owned()).collect();
        assert_eq!(names, vec!["A", "y", "C"]);
    }

    struct GatherFixture {
        rt: SimRuntime,
        perf: PerfCollector,
        pair: TypeId,
        first: Address,
    }

    /// Two pairs sharing a line, a long array next to a plain object, and a
    /// third pair touched by one writer only.
    fn create_test_gather() -> GatherFixture {
        let mut types = TypeTable::new();
        let pair = types.define(
            "Pair",
            TypeTable::OBJECT,
            &[("a", FieldKind::Value), ("b", FieldKind::Value)],
        );
        let longs = types.define_array("long[]", FieldKind::Value);
        let settings = SimSettings {
            heap_size: 64 * 1024,
            space_size: 16 * 1024,
            metadata_size: 4096,
        };
        let mut rt = SimRuntime::new(&settings, types);
        let p0 = rt.alloc(pair).unwrap();
        let p1 = rt.alloc(pair).unwrap();
        let arr = rt.alloc_array(longs, 2).unwrap();
        let obj = rt.alloc(TypeTable::OBJECT).unwrap();
        let p2 = rt.alloc(pair).unwrap();
        assert_eq!(p1, p0 + 32);
        assert_eq!(p2, obj + 16);

        let mut perf = PerfCollector::new(false);
        perf.update_bounds(&rt);
        let mut sampler = ThreadSampler::replay(&[0x10D3], false);
        sampler.open(true).unwrap();
        for address in [p0 + 24, p1 + 24, arr + 24, obj + 8, p2 + 16] {
            for _ in 0..6 {
                sampler.record(0, address, 0);
            }
        }
        perf.merge_thread(&mut sampler);
        GatherFixture {
            rt,
            perf,
            pair,
            first: p0,
        }
    }

    fn check_gather(strategy: GatherStrategy) {
        let fixture = create_test_gather();
        let mut collector = TypeCollector::new(strategy);
        collector.gather(&fixture.perf, &fixture.rt, &Policy::default());

        assert_eq!(collector.hits().len(), 1, "only Pair is attributed");
        let stat = collector.get(fixture.pair).unwrap();
        assert_eq!(field(stat, "b").hit, HitCount::new(true, 12));
        assert_eq!(field(stat, "a").hit, HitCount::ZERO, "private line ignored");
        assert_eq!(collector.array_hits(), 1);
        assert_eq!(collector.dropped_hits(), 1, "foundational type");

        let mut out = Vec::new();
        collector.write_report(&Policy::default(), &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "Pair\tb\n");

        let taken = collector.take_hits();
        assert!(taken.contains_key(&fixture.pair));
        assert!(collector.hits().is_empty());
    }

    #[test]
    fn test_gather_block_start() {
        check_gather(GatherStrategy::BlockStart);
    }

    #[test]
    fn test_gather_space_walk() {
        check_gather(GatherStrategy::SpaceWalk);
    }

    #[test]
    fn test_space_walk_keeps_hits_at_field_threshold() {
        let mut fixture = create_test_gather();
        let p0 = fixture.first;
        fixture.perf.clear();
        let mut sampler = ThreadSampler::replay(&[0x10D3], false);
        sampler.open(true).unwrap();
        for (address, count) in [(p0 + 16, 4), (p0 + 24, 5)] {
            for _ in 0..count {
                sampler.record(0, address, 0);
            }
        }
        fixture.perf.merge_thread(&mut sampler);

        let mut collector = TypeCollector::new(GatherStrategy::SpaceWalk);
        collector.gather(&fixture.perf, &fixture.rt, &Policy::default());
        let stat = collector.get(fixture.pair).unwrap();
        assert_eq!(field(stat, "b").hit, HitCount::new(true, 5));
        assert_eq!(field(stat, "a").hit, HitCount::ZERO, "one below the threshold");
    }

    #[test]
    fn test_gather_accumulates_across_rounds() {
        let fixture = create_test_gather();
        let mut collector = TypeCollector::default();
        collector.gather(&fixture.perf, &fixture.rt, &Policy::default());
        collector.gather(&fixture.perf, &fixture.rt, &Policy::default());
        let stat = collector.get(fixture.pair).unwrap();
        assert_eq!(stat.total(), HitCount::new(true, 24));
    }
}
