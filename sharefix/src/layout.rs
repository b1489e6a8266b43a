//! Layout edits: where padding is inserted and how old offsets move.

/// Padding inserted before `offset`. `delta` is cumulative: it already
/// includes every earlier edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edit {
    pub offset: u32,
    pub delta: u32,
}

/// Edits sorted by offset with non-decreasing deltas.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EditList {
    edits: Vec<Edit>,
}

impl EditList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, offset: u32, delta: u32) {
        if let Some(last) = self.edits.last() {
            debug_assert!(last.offset <= offset, "edits must be sorted by offset");
            debug_assert!(last.delta <= delta, "deltas must be cumulative");
        }
        self.edits.push(Edit { offset, delta });
    }

    /// Replaces the contents with a copy of `other`.
    pub fn inherit(&mut self, other: &EditList) {
        self.edits.clone_from(&other.edits);
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[Edit] {
        &self.edits
    }

    /// Padding in effect at `offset` of the old layout.
    pub fn delta_at(&self, offset: u32) -> u32 {
        match self.edits.partition_point(|edit| edit.offset <= offset) {
            0 => 0,
            index => self.edits[index - 1].delta,
        }
    }

    /// Translates an offset of the old layout into the new one.
    #[inline]
    pub fn translate(&self, offset: u32) -> u32 {
        offset + self.delta_at(offset)
    }

    /// Copies an instance in the old layout (`src`) into `dst`, which holds the
    /// new layout, zero-filling every inserted gap and the tail.
    ///
    /// # Panics
    ///
    /// If an edit lies past the end of `src` or `dst` is too small for it.
    pub fn copy_with_gaps(&self, src: &[u8], dst: &mut [u8]) {
        let mut prev_offset = 0usize;
        let mut prev_delta = 0usize;
        for edit in &self.edits {
            let offset = edit.offset as usize;
            let delta = edit.delta as usize;
            dst[prev_offset + prev_delta..offset + prev_delta]
                .copy_from_slice(&src[prev_offset..offset]);
            dst[offset + prev_delta..offset + delta].fill(0);
            prev_offset = offset;
            prev_delta = delta;
        }
        let copied_end = src.len() + prev_delta;
        dst[prev_offset + prev_delta..copied_end].copy_from_slice(&src[prev_offset..]);
        dst[copied_end..].fill(0);
    }
}
