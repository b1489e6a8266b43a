use std::time::{Duration, Instant};

use log::info;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Stage {
    Total = 0,
    SafepointOp,
    PerfCollect,
    PerfCollectParallel,
    PerfCollectParallelBlocked,
    MergeLiveThreads,
    RestoreLiveThreads,
    TypeGather,
    Planner,
    PlannerDrillDown,
    PlannerFlatten,
    PlannerSubtypes,
    Relayout,
    RelayoutPrologue,
    RelayoutMark,
    RelayoutMove,
    RelayoutAdjust,
    RelayoutEpilogue,
    RelayoutDeoptimize,
}

impl Stage {
    pub const COUNT: usize = Self::RelayoutDeoptimize as usize + 1;

    pub const ALL: [Stage; Self::COUNT] = [
        Self::Total,
        Self::SafepointOp,
        Self::PerfCollect,
        Self::PerfCollectParallel,
        Self::PerfCollectParallelBlocked,
        Self::MergeLiveThreads,
        Self::RestoreLiveThreads,
        Self::TypeGather,
        Self::Planner,
        Self::PlannerDrillDown,
        Self::PlannerFlatten,
        Self::PlannerSubtypes,
        Self::Relayout,
        Self::RelayoutPrologue,
        Self::RelayoutMark,
        Self::RelayoutMove,
        Self::RelayoutAdjust,
        Self::RelayoutEpilogue,
        Self::RelayoutDeoptimize,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Total => "total",
            Self::SafepointOp => "safepoint_op",
            Self::PerfCollect => "perf_collect",
            Self::PerfCollectParallel => "perf_collect_parallel",
            Self::PerfCollectParallelBlocked => "perf_collect_parallel_blocked",
            Self::MergeLiveThreads => "merge_live_threads",
            Self::RestoreLiveThreads => "restore_live_threads",
            Self::TypeGather => "type_gather",
            Self::Planner => "planner",
            Self::PlannerDrillDown => "planner_drill_down",
            Self::PlannerFlatten => "planner_flatten",
            Self::PlannerSubtypes => "planner_subtypes",
            Self::Relayout => "relayout",
            Self::RelayoutPrologue => "relayout_prologue",
            Self::RelayoutMark => "relayout_mark",
            Self::RelayoutMove => "relayout_move",
            Self::RelayoutAdjust => "relayout_adjust",
            Self::RelayoutEpilogue => "relayout_epilogue",
            Self::RelayoutDeoptimize => "relayout_deoptimize",
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StageStats {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

/// Per-stage counters, shared by every component of one finder.
#[derive(Debug)]
pub struct Timings {
    enabled: bool,
    stages: Mutex<[StageStats; Stage::COUNT]>,
}

impl Timings {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            stages: Mutex::new([StageStats::default(); Stage::COUNT]),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn record(&self, stage: Stage, elapsed: Duration) {
        if !self.enabled {
            return;
        }
        let mut stages = self.stages.lock();
        let stats = &mut stages[stage as usize];
        stats.count += 1;
        stats.total += elapsed;
        stats.max = stats.max.max(elapsed);
    }

    pub fn get(&self, stage: Stage) -> StageStats {
        self.stages.lock()[stage as usize]
    }

    /// Starts a clock that records into `stage` when dropped.
    pub fn clock(&self, stage: Stage) -> Clock<'_> {
        Clock {
            timings: self,
            stage,
            start: Instant::now(),
            stopped: false,
        }
    }

    pub fn log_timings(&self) {
        if !self.enabled {
            return;
        }
        let stages = self.stages.lock();
        info!("stage timings (count / total ns / max ns):");
        for stage in Stage::ALL {
            let stats = stages[stage as usize];
            if stats.count == 0 {
                continue;
            }
            info!(
                "  {:<32} {:>8} {:>14} {:>12}",
                stage.name(),
                stats.count,
                stats.total.as_nanos(),
                stats.max.as_nanos()
            );
        }
    }
}

pub struct Clock<'a> {
    timings: &'a Timings,
    stage: Stage,
    start: Instant,
    stopped: bool,
}

impl Clock<'_> {
    /// Records now instead of at drop. Returns the elapsed time.
    pub fn stop(&mut self) -> Duration {
        let elapsed = self.start.elapsed();
        if !self.stopped {
            self.stopped = true;
            self.timings.record(self.stage, elapsed);
        }
        elapsed
    }
}

impl Drop for Clock<'_> {
    fn drop(&mut self) {
        self.stop();
    }
}
