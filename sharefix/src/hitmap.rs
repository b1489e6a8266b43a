//! Per-address hit counting with cache-line occupancy.
//!
//! Every address added to a [`HitMap`] also sets one bit in the bitmap of the
//! 64-byte line that contains it. A line with more than one distinct byte
//! offset touched is considered shared between writers.

use std::collections::HashMap;

use ahash::RandomState;

use crate::Address;

pub const CACHE_LINE_SIZE: usize = 64;
const LINE_SHIFT: u32 = CACHE_LINE_SIZE.trailing_zeros();
const LINE_MASK: usize = CACHE_LINE_SIZE - 1;

// ── HitCount ──────────────────────────────────────────────────────────

/// Hits observed at one location, split by whether the line was contended.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HitCount {
    pub shared: u32,
    pub single: u32,
}

impl HitCount {
    pub const ZERO: Self = Self { shared: 0, single: 0 };

    /// A count of `count` hits, all of one classification.
    #[inline]
    pub const fn new(shared: bool, count: u32) -> Self {
        if shared {
            Self { shared: count, single: 0 }
        } else {
            Self { shared: 0, single: count }
        }
    }

    #[inline]
    pub fn merge(&mut self, other: HitCount) {
        self.shared = self.shared.saturating_add(other.shared);
        self.single = self.single.saturating_add(other.single);
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.shared == 0 && self.single == 0
    }

    #[inline]
    pub const fn total(&self) -> u64 {
        self.shared as u64 + self.single as u64
    }
}

// ── HitMap ────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
pub struct HitMap {
    addrs: HashMap<Address, u32, RandomState>,
    lines: HashMap<usize, u64, RandomState>,
}

#[inline(always)]
const fn line_of(address: Address) -> usize {
    address >> LINE_SHIFT
}

#[inline(always)]
const fn line_bit(address: Address) -> u64 {
    1u64 << (address & LINE_MASK)
}

impl HitMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, address: Address, count: u32) {
        let entry = self.addrs.entry(address).or_insert(0);
        *entry = entry.saturating_add(count);
        *self.lines.entry(line_of(address)).or_insert(0) |= line_bit(address);
    }

    /// Unions `other` into `self`: counts add, line bitmaps OR.
    pub fn merge(&mut self, other: &HitMap) {
        for (&address, &count) in &other.addrs {
            let entry = self.addrs.entry(address).or_insert(0);
            *entry = entry.saturating_add(count);
        }
        for (&line, &bits) in &other.lines {
            *self.lines.entry(line).or_insert(0) |= bits;
        }
    }

    /// Whether more than one distinct byte of `address`'s line was touched.
    ///
    /// # Panics
    ///
    /// If no address on that line was ever added.
    pub fn is_shared(&self, address: Address) -> bool {
        let bits = match self.lines.get(&line_of(address)) {
            Some(&bits) => bits,
            None => panic!("no line entry for address {address:#x}"),
        };
        bits & bits.wrapping_neg() != bits
    }

    pub fn count(&self, address: Address) -> Option<u32> {
        self.addrs.get(&address).copied()
    }

    pub fn hit_count(&self, address: Address) -> Option<HitCount> {
        let count = self.count(address)?;
        Some(HitCount::new(self.is_shared(address), count))
    }

    /// Classified hits for every address, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (Address, HitCount)> + '_ {
        self.addrs
            .iter()
            .map(|(&address, &count)| (address, HitCount::new(self.is_shared(address), count)))
    }

    /// Classified hits sorted by address.
    pub fn sorted(&self) -> Vec<(Address, HitCount)> {
        let mut hits: Vec<_> = self.iter().collect();
        hits.sort_unstable_by_key(|&(address, _)| address);
        hits
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn clear(&mut self) {
        self.addrs.clear();
        self.lines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(samples: &[(Address, u32)]) -> HitMap {
        let mut map = HitMap::new();
        for &(address, count) in samples {
            map.add(address, count);
        }
        map
    }

    fn snapshot(map: &HitMap) -> Vec<(Address, HitCount)> {
        map.sorted()
    }

    #[test]
    fn test_hit_count_construction() {
        assert_eq!(HitCount::new(true, 7), HitCount { shared: 7, single: 0 });
        assert_eq!(HitCount::new(false, 3), HitCount { shared: 0, single: 3 });

        let mut count = HitCount::new(true, 2);
        count.merge(HitCount::new(false, 5));
        assert_eq!(count, HitCount { shared: 2, single: 5 });
        assert_eq!(count.total(), 7);
    }

    #[test]
    fn test_single_address_is_private() {
        let mut map = HitMap::new();
        map.add(0x1000_0008, 100);
        map.add(0x1000_0008, 100);

        assert!(!map.is_shared(0x1000_0008), "one distinct address must be private");
        assert_eq!(map.count(0x1000_0008), Some(200));
        assert_eq!(
            map.hit_count(0x1000_0008),
            Some(HitCount { shared: 0, single: 200 })
        );
    }

    #[test]
    fn test_two_addresses_in_line_are_shared() {
        let map = build(&[(0x1000_0008, 1), (0x1000_0030, 1)]);
        assert!(map.is_shared(0x1000_0008));
        assert!(map.is_shared(0x1000_0030));
    }

    #[test]
    fn test_neighbouring_lines_are_independent() {
        let map = build(&[(0x1000_0038, 50), (0x1000_0040, 50)]);
        assert!(!map.is_shared(0x1000_0038));
        assert!(!map.is_shared(0x1000_0040));
    }

    #[test]
    #[should_panic]
    fn test_unknown_line_panics() {
        let map = HitMap::new();
        map.is_shared(0xdead_0000);
    }

    #[test]
    fn test_merge_is_associative_and_matches_union() {
        let a = [(0x2000_0000, 3), (0x2000_0010, 1)];
        let b = [(0x2000_0010, 4), (0x2000_0100, 9)];
        let c = [(0x2000_0108, 2), (0x2000_0000, 1)];

        let mut left = build(&a);
        left.merge(&build(&b));
        left.merge(&build(&c));

        let mut bc = build(&b);
        bc.merge(&build(&c));
        let mut right = build(&a);
        right.merge(&bc);

        let all: Vec<_> = a.iter().chain(&b).chain(&c).copied().collect();
        let union = build(&all);

        assert_eq!(snapshot(&left), snapshot(&right));
        assert_eq!(snapshot(&left), snapshot(&union));
        assert!(union.is_shared(0x2000_0100), "0x100 and 0x108 share a line");
    }

    #[test]
    fn test_merge_is_commutative() {
        let a = build(&[(0x3000_0000, 1), (0x3000_0020, 6)]);
        let b = build(&[(0x3000_0020, 2), (0x3000_0400, 1)]);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);

        assert_eq!(snapshot(&ab), snapshot(&ba));
    }

    #[test]
    fn test_clear() {
        let mut map = build(&[(0x10, 1)]);
        map.clear();
        assert!(map.is_empty());
        assert_eq!(map.count(0x10), None);
    }
}
