//! The stop-the-world pass that moves live instances to their new layout.
//!
//! Sequence: prologue, mark, move, post-relayout metadata update, pointer
//! adjustment, epilogue, deoptimization. Once the move phase starts the pass
//! cannot be unwound; failing to find room for a moved instance leaves the
//! heap half converted and the caller must abort the process.

use log::{debug, info, trace};

use crate::{
    Address, Error, HeapRegions, ObjectCursor, Planner, RawOffsetRegistry,
    ReferencePolicy, Result, Runtime, SpaceId, Stage, Timings,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayoutStats {
    /// Live instances copied into the new layout.
    pub moved: u64,
    /// Dead instances of planned types given the placeholder type.
    pub neutralized: u64,
    pub call_sites_fixed: usize,
    pub deoptimized: usize,
}

pub struct RelayoutOperation<'a> {
    planner: &'a Planner,
    raw_offsets: &'a mut RawOffsetRegistry,
    timings: &'a Timings,
    stats: RelayoutStats,
}

impl<'a> RelayoutOperation<'a> {
    pub fn new(planner: &'a Planner, raw_offsets: &'a mut RawOffsetRegistry, timings: &'a Timings) -> Self {
        Self {
            planner,
            raw_offsets,
            timings,
            stats: RelayoutStats::default(),
        }
    }

    /// Runs the whole pass. The caller must hold the world stopped.
    pub fn run<R: Runtime + ?Sized>(mut self, runtime: &mut R) -> Result<RelayoutStats> {
        if self.planner.is_empty() {
            return Ok(self.stats);
        }
        let _clock = self.timings.clock(Stage::Relayout);
        info!("relayout of {} types", self.planner.len());

        {
            let _clock = self.timings.clock(Stage::RelayoutPrologue);
            runtime.prologue();
        }
        {
            let _clock = self.timings.clock(Stage::RelayoutMark);
            runtime.mark_live(ReferencePolicy::KeepAll);
        }
        {
            let _clock = self.timings.clock(Stage::RelayoutMove);
            self.move_objects(runtime)?;
            self.post_relayout(runtime);
        }
        {
            let _clock = self.timings.clock(Stage::RelayoutAdjust);
            runtime.adjust_pointers();
        }
        {
            let _clock = self.timings.clock(Stage::RelayoutEpilogue);
            runtime.epilogue();
        }
        {
            let _clock = self.timings.clock(Stage::RelayoutDeoptimize);
            self.stats.deoptimized = runtime.deoptimize_all();
        }

        info!(
            "relayout done: moved {} instances, neutralized {}, deoptimized {} methods",
            self.stats.moved, self.stats.neutralized, self.stats.deoptimized
        );
        Ok(self.stats)
    }

    fn move_objects<R: Runtime + ?Sized>(&mut self, runtime: &mut R) -> Result<()> {
        let spaces = runtime.spaces();
        // Fix every walk bound first; moved copies land above them.
        let limits: Vec<_> = spaces.iter().map(|&space| runtime.space_used(space)).collect();
        for (index, used) in limits.into_iter().enumerate() {
            trace!("relayout space {index}: {:#x}-{:#x}", used.start, used.end);
            let mut alloc_index = index;
            let mut cursor = ObjectCursor::new(used);
            while let Some(obj) = cursor.advance(runtime) {
                self.relayout_object(runtime, &spaces, &mut alloc_index, obj)?;
            }
        }
        Ok(())
    }

    fn relayout_object<R: Runtime + ?Sized>(
        &mut self,
        runtime: &mut R,
        spaces: &[SpaceId],
        alloc_index: &mut usize,
        obj: Address,
    ) -> Result<()> {
        let planner = self.planner;
        let ty = runtime.object_type(obj);
        let Some(plan) = planner.plan_for(ty) else {
            runtime.reset_header(obj);
            return Ok(());
        };
        let Some(placeholder) = plan.placeholder() else {
            runtime.reset_header(obj);
            return Ok(());
        };

        if !runtime.is_marked(obj) {
            runtime.set_object_type(obj, placeholder);
            runtime.reset_header(obj);
            self.stats.neutralized += 1;
            return Ok(());
        }

        let old_size = plan.old_size() as usize;
        let new_size = plan.new_size() as usize;
        debug_assert_eq!(runtime.object_size(obj), old_size, "old size discrepancy");
        let new = allocate(runtime, spaces, alloc_index, new_size)?;

        let mut copy = vec![0u8; new_size];
        plan.edits().copy_with_gaps(runtime.read_bytes(obj, old_size), &mut copy);
        runtime.write_bytes(new, &copy);
        runtime.forward_to(obj, new);
        runtime.set_object_type(obj, placeholder);
        runtime.reset_header(new);

        trace!("moved {obj:#x} -> {new:#x} ({})", runtime.type_name(ty));
        self.stats.moved += 1;
        Ok(())
    }

    fn post_relayout<R: Runtime + ?Sized>(&mut self, runtime: &mut R) {
        for plan in self.planner.plans() {
            plan.apply(runtime, self.raw_offsets);
        }
        self.stats.call_sites_fixed = self.planner.fix_call_sites(runtime);
        debug!("fixed {} call sites", self.stats.call_sites_fixed);
    }
}

/// Allocates from the current space, moving on to later spaces when full.
fn allocate<H: HeapRegions + ?Sized>(
    heap: &mut H,
    spaces: &[SpaceId],
    alloc_index: &mut usize,
    size: usize,
) -> Result<Address> {
    while let Some(&space) = spaces.get(*alloc_index) {
        if let Some(addr) = heap.allocate(space, size) {
            return Ok(addr);
        }
        *alloc_index += 1;
        trace!("space {space:?} exhausted, trying the next one");
    }
    Err(Error::RelocationExhausted { size })
}
