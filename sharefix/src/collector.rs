//! Aggregation of per-thread samples into one hit map.
//!
//! The aggregate lives behind the finder's lock. Threads feed it in one of two
//! ways: [`PerfCollector::merge_thread`] drains a sampler while the lock is
//! held, and [`PerfCollector::collect_partial`] drains without the lock into a
//! [`PartialHits`] that is later folded in with [`PerfCollector::absorb`].

use log::trace;

use crate::{
    Address, HeapRegions, HitCount, HitMap, SampleStream, ThreadRegistry, ThreadSampler,
    hitmap::CACHE_LINE_SIZE,
};

const SPEED_TEST_SEED: u32 = 0x0348_930A;
const SPEED_TEST_MUL: u32 = 0x4848_FA41;
const SPEED_TEST_INC: u32 = 0x1837_AB11;

/// Address ranges samples are classified against.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapBounds {
    pub heap_start: Address,
    pub heap_end: Address,
    pub meta_start: Address,
    pub meta_end: Address,
    pub track_metadata: bool,
}

impl HeapBounds {
    #[inline]
    pub fn in_heap(&self, address: Address) -> bool {
        (self.heap_start..self.heap_end).contains(&address)
    }

    #[inline]
    pub fn in_metadata(&self, address: Address) -> bool {
        (self.meta_start..self.meta_end).contains(&address)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HitTotals {
    pub total: u64,
    pub heap: u64,
    pub metaspace: u64,
    pub unprocessed: u64,
}

impl HitTotals {
    fn add(&mut self, other: HitTotals) {
        self.total += other.total;
        self.heap += other.heap;
        self.metaspace += other.metaspace;
        self.unprocessed += other.unprocessed;
    }
}

/// A thread's samples drained outside the lock.
#[derive(Debug, Default)]
pub struct PartialHits {
    hits: HitMap,
    meta_hits: HitMap,
    totals: HitTotals,
}

impl PartialHits {
    pub fn totals(&self) -> HitTotals {
        self.totals
    }
}

fn drain<S: SampleStream>(
    bounds: &HeapBounds,
    sampler: &mut ThreadSampler<S>,
    hits: &mut HitMap,
    meta_hits: &mut HitMap,
) -> HitTotals {
    let mut totals = HitTotals::default();
    if !sampler.start_iterate() {
        return totals;
    }
    while let Some(sample) = sampler.next_sample() {
        totals.total += 1;
        let address = sample.address;
        trace!(
            "raw hit {:?} [line {:#x}] {:#x}",
            sample.time,
            address & !(CACHE_LINE_SIZE - 1),
            address
        );
        if !bounds.in_heap(address) {
            if bounds.track_metadata && bounds.in_metadata(address) {
                meta_hits.add(address, 1);
                totals.metaspace += 1;
            } else {
                trace!("hit outside heap {address:#x}");
            }
            continue;
        }
        hits.add(address, 1);
        totals.heap += 1;
        totals.unprocessed += 1;
    }
    totals
}

#[derive(Debug, Default)]
pub struct PerfCollector {
    bounds: HeapBounds,
    hits: HitMap,
    meta_hits: HitMap,
    totals: HitTotals,
}

impl PerfCollector {
    pub fn new(track_metadata: bool) -> Self {
        Self {
            bounds: HeapBounds {
                track_metadata,
                ..HeapBounds::default()
            },
            ..Self::default()
        }
    }

    pub fn update_bounds<H: HeapRegions + ?Sized>(&mut self, heap: &H) {
        let heap_range = heap.reserved_region();
        let meta_range = heap.metadata_region();
        self.bounds.heap_start = heap_range.start;
        self.bounds.heap_end = heap_range.end;
        self.bounds.meta_start = meta_range.start;
        self.bounds.meta_end = meta_range.end;
    }

    pub fn bounds(&self) -> HeapBounds {
        self.bounds
    }

    /// Suspends every live thread's sampling and drains it.
    ///
    /// Sampling stays suspended until [`Self::restore_thread_perf`].
    pub fn merge_live_threads<T: ThreadRegistry + ?Sized>(&mut self, threads: &mut T) {
        for index in 0..threads.thread_count() {
            if let Some(sampler) = threads.sampler_mut(index) {
                sampler.store_disable();
                self.merge_locked(sampler);
            }
        }
    }

    pub fn restore_thread_perf<T: ThreadRegistry + ?Sized>(&mut self, threads: &mut T) {
        for index in 0..threads.thread_count() {
            if let Some(sampler) = threads.sampler_mut(index) {
                sampler.restore_disable();
            }
        }
    }

    /// Drains one thread while the caller holds the aggregate's lock.
    pub fn merge_thread<S: SampleStream>(&mut self, sampler: &mut ThreadSampler<S>) {
        sampler.store_disable();
        self.merge_locked(sampler);
        sampler.restore_disable();
    }

    fn merge_locked<S: SampleStream>(&mut self, sampler: &mut ThreadSampler<S>) {
        let totals = drain(&self.bounds, sampler, &mut self.hits, &mut self.meta_hits);
        self.totals.add(totals);
    }

    /// Drains one thread without touching the aggregate.
    pub fn collect_partial<S: SampleStream>(
        bounds: &HeapBounds,
        sampler: &mut ThreadSampler<S>,
    ) -> PartialHits {
        let mut partial = PartialHits::default();
        partial.totals = drain(bounds, sampler, &mut partial.hits, &mut partial.meta_hits);
        partial
    }

    pub fn absorb(&mut self, partial: &PartialHits) {
        self.hits.merge(&partial.hits);
        if self.bounds.track_metadata {
            self.meta_hits.merge(&partial.meta_hits);
            self.totals.metaspace += partial.totals.metaspace;
        }
        self.totals.total += partial.totals.total;
        self.totals.heap += partial.totals.heap;
        self.totals.unprocessed += partial.totals.unprocessed;
    }

    #[inline]
    pub fn unprocessed_hits(&self) -> u64 {
        self.totals.unprocessed
    }

    #[inline]
    pub fn total_hits(&self) -> u64 {
        self.totals.total
    }

    #[inline]
    pub fn heap_hits(&self) -> u64 {
        self.totals.heap
    }

    #[inline]
    pub fn metaspace_hits(&self) -> u64 {
        self.totals.metaspace
    }

    pub fn hits(&self) -> &HitMap {
        &self.hits
    }

    pub fn meta_hits(&self) -> &HitMap {
        &self.meta_hits
    }

    /// Hits whose shared count passes `keep`, sorted by address.
    pub fn to_hit_vector(&self, keep: impl Fn(HitCount) -> bool) -> Vec<(Address, HitCount)> {
        let mut vector: Vec<_> = self.hits.iter().filter(|&(_, hit)| keep(hit)).collect();
        vector.sort_unstable_by_key(|&(address, _)| address);
        vector
    }

    /// Drops the buffered heap hits once they have been gathered.
    pub fn clear(&mut self) {
        self.totals.unprocessed = 0;
        self.hits.clear();
    }

    pub fn clear_metadata(&mut self) {
        self.totals.metaspace = 0;
        self.meta_hits.clear();
    }

    /// Fills the aggregate with `count` pseudo-random word-aligned heap addresses.
    pub fn seed_synthetic_hits(&mut self, count: u32) {
        let words = (self.bounds.heap_end - self.bounds.heap_start) / size_of::<usize>();
        let words = words.saturating_sub(size_of::<usize>()).max(1);
        let mut rpos = SPEED_TEST_SEED;
        for _ in 0..count {
            let address = self.bounds.heap_start + size_of::<usize>() * (rpos as usize % words);
            self.hits.add(address, 1);
            rpos = rpos.wrapping_mul(SPEED_TEST_MUL).wrapping_add(SPEED_TEST_INC);
        }
        let count = count as u64;
        self.totals.total += count;
        self.totals.heap += count;
        self.totals.unprocessed += count;
    }
}
