//! Task tunables (spec.md §3, defaults pinned in §6).

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Per-task tunables. All fields have conformance-test defaults (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskConfig {
    pub max_steps: u32,
    pub confidence_threshold: f64,
    pub ax_deficient_interactive_threshold: u32,
    pub scroll_step_px: u32,
    pub max_scroll_steps: u32,
    pub max_no_progress_steps: u32,
    pub max_subtask_retries: u32,
    pub navigation_timeout_ms: u64,
    pub observation_cache_ttl_ms: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_steps: 20,
            confidence_threshold: 0.75,
            ax_deficient_interactive_threshold: 5,
            scroll_step_px: 800,
            max_scroll_steps: 8,
            max_no_progress_steps: 6,
            max_subtask_retries: 2,
            navigation_timeout_ms: 30_000,
            observation_cache_ttl_ms: 60_000,
        }
    }
}

/// Constants pinned by spec.md §6 that are not per-task tunables.
pub mod constants {
    pub const RECENT_PAIR_LIMIT: usize = 5;
    pub const SUMMARY_CHAR_BUDGET: usize = 420;
    pub const PROMPT_TOKEN_ALERT_THRESHOLD: u64 = 12_000;
    pub const BELOW_FOLD_MARGIN_RATIO: f64 = 0.11;
    pub const BELOW_FOLD_MARGIN_FLOOR_PX: f64 = 24.0;
    pub const DOM_BYPASS_MIN_SCORE: i32 = 2;
    pub const DOM_BYPASS_MIN_SCORE_GAP: i32 = 1;
    pub const ALERT_RING_BUFFER_LEN: usize = 64;
    pub const ARCHIVED_SUMMARY_OBSERVATION_TRUNCATE: usize = 160;
    pub const INTERACTIVE_ELEMENT_CHAR_BUDGET: usize = 8_000;
}

impl TaskConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_steps < 1 {
            return Err(CoreError::InvalidTunable {
                name: "max_steps",
                detail: "must be >= 1".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(CoreError::InvalidTunable {
                name: "confidence_threshold",
                detail: "must be in [0, 1]".into(),
            });
        }
        if self.ax_deficient_interactive_threshold == 0 {
            return Err(CoreError::InvalidTunable {
                name: "ax_deficient_interactive_threshold",
                detail: "must be > 0".into(),
            });
        }
        if self.scroll_step_px == 0 {
            return Err(CoreError::InvalidTunable {
                name: "scroll_step_px",
                detail: "must be > 0".into(),
            });
        }
        if self.max_no_progress_steps == 0 {
            return Err(CoreError::InvalidTunable {
                name: "max_no_progress_steps",
                detail: "must be > 0".into(),
            });
        }
        if self.navigation_timeout_ms == 0 {
            return Err(CoreError::InvalidTunable {
                name: "navigation_timeout_ms",
                detail: "must be > 0".into(),
            });
        }
        if self.observation_cache_ttl_ms == 0 {
            return Err(CoreError::InvalidTunable {
                name: "observation_cache_ttl_ms",
                detail: "must be > 0".into(),
            });
        }
        // max_scroll_steps >= 0 and max_subtask_retries >= 0 hold for any u32.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(TaskConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_max_steps() {
        let mut cfg = TaskConfig::default();
        cfg.max_steps = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_confidence_out_of_range() {
        let mut cfg = TaskConfig::default();
        cfg.confidence_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }
}
