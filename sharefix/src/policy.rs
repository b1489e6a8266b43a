use crate::HitCount;

/// Numeric thresholds for every relayout decision.
///
/// Only `shared` hits gate repair; thread-private hits are reported but never
/// trigger a relayout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    /// Shared hits a whole type (or its header) needs before it is repaired.
    pub type_threshold: u32,
    /// Shared hits a single field needs to become a pad candidate.
    pub field_threshold: u32,
    /// Number of blank inspections after which a type is no longer evaluated.
    pub blank_limit: u32,
    /// Buffered in-heap hits needed before a gather pass runs.
    pub unprocessed_threshold: u64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            type_threshold: 25,
            field_threshold: 5,
            blank_limit: 3,
            unprocessed_threshold: 25,
        }
    }
}

impl Policy {
    #[inline]
    pub fn should_handle_hit(&self, hit: HitCount) -> bool {
        hit.shared >= self.type_threshold
    }

    #[inline]
    pub fn should_handle_field_hit(&self, hit: HitCount) -> bool {
        hit.shared >= self.field_threshold
    }

    #[inline]
    pub fn under_blank_limit(&self, blank_count: u32) -> bool {
        blank_count < self.blank_limit
    }

    #[inline]
    pub fn should_process(&self, unprocessed: u64) -> bool {
        unprocessed >= self.unprocessed_threshold
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.type_threshold == 0 || self.field_threshold == 0 {
            return Err("hit thresholds must be > 0");
        }
        if self.blank_limit == 0 {
            return Err("blank_limit must be > 0");
        }
        Ok(())
    }
}
