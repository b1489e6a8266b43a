//! False-sharing detection and field relayout for a managed heap.
//!
//! Hardware load samples that hit a modified line in another core's cache
//! are drained per thread, folded into an address aggregate, attributed to
//! the fields of the types they land in, and, in repair mode, used to pad
//! hot fields onto their own cache lines while the world is stopped.

mod collector;
mod config;
mod error;
mod finder;
pub mod hitmap;
mod host;
mod layout;
mod planner;
mod policy;
mod raw_offsets;
mod relayout;
mod sample;
pub mod sim;
mod stats;
pub mod system;
mod timing;

pub use collector::{HeapBounds, HitTotals, PartialHits, PerfCollector};
pub use config::{FinderCreateInfo, Level, Settings};
pub use error::{Error, Result};
pub use finder::{FalseSharingFinder, RunStats};
pub use hitmap::{CACHE_LINE_SIZE, HitCount, HitMap};
pub use host::*;
pub use layout::{Edit, EditList};
pub use planner::{LayoutPlan, PlanId, Planner, is_terminal};
pub use policy::Policy;
pub use raw_offsets::{RawOffsetEntry, RawOffsetRegistry};
pub use relayout::{RelayoutOperation, RelayoutStats};
pub use sample::*;
pub use stats::{FieldHitStat, GatherStrategy, TypeCollector, TypeHitStat};
pub use timing::{Clock, Stage, StageStats, Timings};
