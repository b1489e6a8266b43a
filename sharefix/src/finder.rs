//! The hooks a runtime calls to run false-sharing detection and repair.
//!
//! A [`FalseSharingFinder`] owns the whole pipeline: the aggregate of raw
//! hits, the per-type statistics, the layout planner and the raw offset
//! registry. All of it sits behind one lock; only the draining of a thread's
//! streams in [`FalseSharingFinder::parallel_merge`] runs outside it.

use std::{collections::BTreeMap, fs::OpenOptions, io::Write, time::Instant};

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::{
    FinderCreateInfo, HeapRegions, Level, PerfCollector, PerfStream, Planner, RawOffsetRegistry,
    RelayoutOperation, Result, Runtime, SampleStream, Settings, Stage, ThreadRegistry,
    ThreadSampler, Timings, TypeCollector, TypeHitStat, TypeId, TypeMetadata, system,
};

/// Totals over every relayout run so far.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    pub relayouts: u64,
    pub transformed_types: u64,
    pub moved_instances: u64,
}

struct FinderState {
    perf: PerfCollector,
    types: TypeCollector,
    planner: Planner,
    raw_offsets: RawOffsetRegistry,
    stats: RunStats,
}

pub struct FalseSharingFinder {
    settings: Settings,
    events: Vec<u64>,
    state: Mutex<FinderState>,
    timings: Timings,
    started: Instant,
}

impl FalseSharingFinder {
    /// Builds a finder for the sampling hardware of this machine.
    ///
    /// Fails when an active level is requested on a CPU or kernel without
    /// HITM load sampling.
    pub fn new(info: FinderCreateInfo) -> Result<Self> {
        let settings = Settings::from_info(info)?;
        let events = if settings.level.is_active() {
            system::detect_hitm_events()?.to_vec()
        } else {
            Vec::new()
        };
        Ok(Self::with_settings(settings, events))
    }

    /// Builds a finder that samples `events` without probing the machine.
    pub fn with_events(info: FinderCreateInfo, events: &[u64]) -> Result<Self> {
        let settings = Settings::from_info(info)?;
        Ok(Self::with_settings(settings, events.to_vec()))
    }

    fn with_settings(settings: Settings, events: Vec<u64>) -> Self {
        if settings.level.is_active() {
            info!(
                "false sharing finder: level {:?}, sampling 1 of {} events on {:x?}",
                settings.level, settings.sampling_period, events
            );
        }
        let state = FinderState {
            perf: PerfCollector::new(settings.track_metadata),
            types: TypeCollector::new(settings.gather),
            planner: Planner::new(),
            raw_offsets: RawOffsetRegistry::new(),
            stats: RunStats::default(),
        };
        Self {
            timings: Timings::new(settings.timing),
            settings,
            events,
            state: Mutex::new(state),
            started: Instant::now(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn events(&self) -> &[u64] {
        &self.events
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.settings.level.is_active()
    }

    pub fn run_stats(&self) -> RunStats {
        self.state.lock().stats
    }

    /// Snapshot of the per-type statistics gathered since the last relayout.
    pub fn hit_stats(&self) -> BTreeMap<TypeId, TypeHitStat> {
        self.state.lock().types.hits().clone()
    }

    pub fn unprocessed_hits(&self) -> u64 {
        self.state.lock().perf.unprocessed_hits()
    }

    // ── Thread lifecycle ──

    /// A hardware sampler for a new application thread, not yet opened.
    pub fn perf_sampler(&self) -> ThreadSampler<PerfStream> {
        ThreadSampler::perf(
            &self.events,
            self.settings.sampling_period,
            self.settings.ring_pages_log2,
            self.settings.timed_samples,
        )
    }

    /// Opens and enables the sampler of a starting thread.
    pub fn thread_starting<S: SampleStream>(&self, sampler: &mut ThreadSampler<S>) {
        if !self.is_active() {
            return;
        }
        if let Err(err) = sampler.open(true) {
            warn!("thread runs without sampling: {err}");
        }
    }

    /// Merges the last samples of an exiting thread and closes its streams.
    pub fn thread_ending<S: SampleStream>(&self, sampler: &mut ThreadSampler<S>) {
        if !self.is_active() {
            return;
        }
        self.merge_thread(sampler);
        sampler.close();
    }

    /// Drains one thread into the aggregate under the lock.
    pub fn merge_thread<S: SampleStream>(&self, sampler: &mut ThreadSampler<S>) {
        if !self.is_active() || !sampler.is_ok() {
            return;
        }
        let mut state = self.state.lock();
        let _clock = self.timings.clock(Stage::PerfCollect);
        state.perf.merge_thread(sampler);
    }

    /// Drains one thread outside the lock, then folds the result in.
    ///
    /// Safe to call from many threads at once, each with its own sampler.
    pub fn parallel_merge<S: SampleStream>(&self, sampler: &mut ThreadSampler<S>) {
        if !self.is_active() || !sampler.is_ok() {
            return;
        }
        let bounds = self.state.lock().perf.bounds();
        let partial = {
            let _clock = self.timings.clock(Stage::PerfCollectParallel);
            sampler.store_disable();
            let partial = PerfCollector::collect_partial(&bounds, sampler);
            sampler.restore_disable();
            partial
        };
        let mut blocked = self.timings.clock(Stage::PerfCollectParallelBlocked);
        let mut state = self.state.lock();
        blocked.stop();
        state.perf.absorb(&partial);
    }

    // ── Safepoints ──

    /// Runs at the start of a stop-the-world pause.
    ///
    /// Drains every live thread. Once enough unprocessed hits have piled up
    /// they are attributed to types, and in repair mode hot types are
    /// relaid out before the pause ends. Sampling stays suspended until
    /// [`Self::end_safepoint`].
    pub fn begin_safepoint<R, T>(&self, runtime: &mut R, threads: &mut T)
    where
        R: Runtime + ?Sized,
        T: ThreadRegistry + ?Sized,
    {
        if !self.is_active() {
            return;
        }
        let _clock = self.timings.clock(Stage::SafepointOp);
        let mut state = self.state.lock();
        {
            let _clock = self.timings.clock(Stage::PerfCollect);
            state.perf.update_bounds(&*runtime);
            let _merge = self.timings.clock(Stage::MergeLiveThreads);
            state.perf.merge_live_threads(threads);
        }

        let policy = &self.settings.policy;
        if !policy.should_process(state.perf.unprocessed_hits()) {
            return;
        }
        {
            let _clock = self.timings.clock(Stage::TypeGather);
            let FinderState { perf, types, .. } = &mut *state;
            types.gather(perf, &*runtime, policy);
            perf.clear();
        }
        if Self::should_repair_locked(&self.settings, &state) {
            self.relayout_locked(&mut state, runtime);
        }
    }

    /// Runs when the pause ends. Resumes sampling on every live thread.
    pub fn end_safepoint<T: ThreadRegistry + ?Sized>(&self, threads: &mut T) {
        if !self.is_active() {
            return;
        }
        let _clock = self.timings.clock(Stage::RestoreLiveThreads);
        self.state.lock().perf.restore_thread_perf(threads);
    }

    // ── Repair ──

    /// Whether any gathered type is hot enough to relayout.
    pub fn should_repair(&self) -> bool {
        let state = self.state.lock();
        Self::should_repair_locked(&self.settings, &state)
    }

    fn should_repair_locked(settings: &Settings, state: &FinderState) -> bool {
        settings.level.repairs()
            && state
                .types
                .hits()
                .iter()
                .any(|(&ty, stat)| stat.should_relayout(&settings.policy, state.planner.blank_count(ty)))
    }

    /// Plans and relays out every hot type now. The world must be stopped.
    pub fn repair<R: Runtime + ?Sized>(&self, runtime: &mut R) {
        if !self.settings.level.repairs() {
            return;
        }
        let mut state = self.state.lock();
        self.relayout_locked(&mut state, runtime);
    }

    fn relayout_locked<R: Runtime + ?Sized>(&self, state: &mut FinderState, runtime: &mut R) {
        let FinderState {
            types,
            planner,
            raw_offsets,
            stats,
            ..
        } = state;
        let planned = planner.generate(
            runtime,
            types.take_hits(),
            &self.settings.policy,
            raw_offsets,
            &self.timings,
        );
        if planned == 0 {
            debug!("nothing to relayout");
            return;
        }
        match RelayoutOperation::new(planner, raw_offsets, &self.timings).run(runtime) {
            Ok(run) => {
                stats.relayouts += 1;
                stats.transformed_types += planned as u64;
                stats.moved_instances += run.moved;
                info!(
                    "relayout: {} types, {} moved, {} neutralized, {} call sites, {} deoptimized",
                    planned, run.moved, run.neutralized, run.call_sites_fixed, run.deoptimized
                );
            }
            Err(err) => {
                // the heap is half converted and cannot be walked any more
                error!("relayout failed: {err}");
                std::process::abort();
            }
        }
    }

    // ── Raw offsets ──

    /// Publishes the offset of a field into a static slot of `holder`.
    ///
    /// In repair mode the slot is tracked and rewritten on relayout.
    pub fn register_raw_offset<T: TypeMetadata + ?Sized>(
        &self,
        types: &mut T,
        holder: TypeId,
        slot: u32,
        field_offset: u32,
    ) {
        if self.settings.level.repairs() {
            self.state
                .lock()
                .raw_offsets
                .register(types, holder, slot, field_offset);
        } else {
            RawOffsetRegistry::publish(types, holder, slot, field_offset);
        }
    }

    /// Records an offset into `holder` taken where it cannot be tracked.
    /// `holder` is never relaid out afterwards.
    pub fn register_raw_offset_taken(&self, holder: TypeId, field_offset: u32) {
        if !self.settings.level.repairs() {
            return;
        }
        debug!("untracked offset {field_offset} into {holder:?}");
        self.state.lock().raw_offsets.pin(holder);
    }

    // ── Diagnostics ──

    /// Times the attribution of `count` synthetic hits spread over the heap.
    pub fn speed_test<R>(&self, runtime: &R, count: u32)
    where
        R: HeapRegions + TypeMetadata + ?Sized,
    {
        let mut state = self.state.lock();
        let FinderState { perf, types, .. } = &mut *state;
        perf.update_bounds(runtime);
        perf.seed_synthetic_hits(count);
        let started = Instant::now();
        types.gather(perf, runtime, &self.settings.policy);
        let elapsed = started.elapsed();
        perf.clear();
        info!(
            "speed test: gathered {count} hits in {} us ({} types)",
            elapsed.as_micros(),
            types.hits().len()
        );
    }

    /// Runs at shutdown: final report, timings and totals.
    pub fn done<R, T>(&self, runtime: &R, threads: &mut T) -> Result<()>
    where
        R: HeapRegions + TypeMetadata + ?Sized,
        T: ThreadRegistry + ?Sized,
    {
        if !self.is_active() {
            return Ok(());
        }
        let mut state = self.state.lock();
        if self.settings.level == Level::Detect {
            let FinderState { perf, types, .. } = &mut *state;
            perf.update_bounds(runtime);
            perf.merge_live_threads(threads);
            types.gather(perf, runtime, &self.settings.policy);
            perf.clear();
            perf.restore_thread_perf(threads);
            types.log_report();
        }

        if let Some(path) = &self.settings.hit_report {
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            state.types.write_report(&self.settings.policy, &mut file)?;
            file.flush()?;
            debug!("hit report appended to {}", path.display());
        }

        self.timings.record(Stage::Total, self.started.elapsed());
        self.timings.log_timings();
        if self.timings.is_enabled() {
            let perf = &state.perf;
            let collect_ms = self.timings.get(Stage::PerfCollect).total.as_secs_f64() * 1000.0;
            let rate = if collect_ms > 0.0 {
                perf.total_hits() as f64 / collect_ms
            } else {
                0.0
            };
            info!(
                "hits: {} total, {} heap, {} metaspace, {:.1} per ms collecting",
                perf.total_hits(),
                perf.heap_hits(),
                perf.metaspace_hits(),
                rate
            );
            info!(
                "attribution: {} array hits, {} dropped",
                state.types.array_hits(),
                state.types.dropped_hits()
            );
        }
        info!(
            "Transformed {} types, moved {} instances",
            state.stats.transformed_types, state.stats.moved_instances
        );
        Ok(())
    }
}
