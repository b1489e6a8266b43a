use std::path::PathBuf;

use crate::{
    DEFAULT_RING_PAGES_LOG2, DEFAULT_SAMPLING_PERIOD, Error, GatherStrategy, Policy, Result,
};

/// How much of the pipeline runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    /// Every hook is a no-op.
    None,
    /// Collect hits and report them at shutdown.
    #[default]
    Detect,
    /// Collect hits and relayout hot types at safepoints.
    RepairOnline,
}

impl Level {
    pub fn is_active(self) -> bool {
        self != Level::None
    }

    pub fn repairs(self) -> bool {
        self == Level::RepairOnline
    }
}

#[derive(Debug, Default, Clone)]
pub struct FinderCreateInfo {
    pub level: Option<Level>,
    pub sampling_period: Option<u64>,
    // data pages of each ring, as a power of two
    pub ring_pages_log2: Option<u32>,
    pub timed_samples: Option<bool>,
    pub track_metadata: Option<bool>,
    pub gather: Option<GatherStrategy>,
    pub policy: Option<Policy>,
    pub hit_report: Option<PathBuf>,
    pub timing: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub level: Level,
    /// Events between two samples.
    pub sampling_period: u64,
    pub ring_pages_log2: u32,
    /// Record a timestamp with every sample.
    pub timed_samples: bool,
    /// Count hits in the metadata region instead of discarding them.
    pub track_metadata: bool,
    pub gather: GatherStrategy,
    pub policy: Policy,
    /// File the tab separated hit report is appended to at shutdown.
    pub hit_report: Option<PathBuf>,
    pub timing: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            level: Level::Detect,
            sampling_period: DEFAULT_SAMPLING_PERIOD, // 10k events
            ring_pages_log2: DEFAULT_RING_PAGES_LOG2, // 64 pages
            timed_samples: false,
            track_metadata: false,
            gather: GatherStrategy::BlockStart,
            policy: Policy::default(),
            hit_report: None,
            timing: false,
        }
    }
}

impl Settings {
    pub fn from_info(info: FinderCreateInfo) -> Result<Self> {
        let defaults = Self::default();
        let settings = Self {
            level: info.level.unwrap_or(defaults.level),
            sampling_period: info.sampling_period.unwrap_or(defaults.sampling_period),
            ring_pages_log2: info.ring_pages_log2.unwrap_or(defaults.ring_pages_log2),
            timed_samples: info.timed_samples.unwrap_or(defaults.timed_samples),
            track_metadata: info.track_metadata.unwrap_or(defaults.track_metadata),
            gather: info.gather.unwrap_or(defaults.gather),
            policy: info.policy.unwrap_or(defaults.policy),
            hit_report: info.hit_report.or(defaults.hit_report),
            timing: info.timing.unwrap_or(defaults.timing),
        };
        settings.validate().map_err(Error::InvalidSettings)?;
        Ok(settings)
    }

    pub fn validate(&self) -> std::result::Result<(), &'static str> {
        if self.sampling_period == 0 {
            return Err("sampling_period must be > 0");
        }
        if self.ring_pages_log2 > 16 {
            return Err("ring_pages_log2 must be <= 16");
        }
        self.policy.validate()
    }
}
