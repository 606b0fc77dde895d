//! C1 — Task State Machine (spec.md §4.1).
//!
//! Grounded on the teacher's `src/unified_kernel/state_center.rs`: a guarded
//! state holder that records every transition and tallies outcomes, adapted
//! here from a session-id-keyed map into a single-task guarded FSM with a
//! full transition history rather than a running tally.

use chrono::Utc;

use crate::error::{CoreError, Result};
use crate::events::TransitionEvent;
use crate::types::TaskState;

/// Allowed transitions (spec.md §4.1's DAG).
fn is_allowed(from: TaskState, to: TaskState) -> bool {
    use TaskState::*;
    matches!(
        (from, to),
        (Idle, Loading)
            | (Loading, Perceiving)
            | (Loading, Failed)
            | (Perceiving, Inferring)
            | (Perceiving, Failed)
            | (Inferring, Acting)
            | (Inferring, Perceiving)
            | (Inferring, Failed)
            | (Acting, Perceiving)
            | (Acting, Complete)
            | (Acting, Failed)
            | (Complete, Idle)
            | (Failed, Idle)
    )
}

pub struct TaskStateMachine {
    current: TaskState,
    history: Vec<TransitionEvent>,
}

impl TaskStateMachine {
    pub fn new() -> Self {
        Self {
            current: TaskState::Idle,
            history: Vec::new(),
        }
    }

    pub fn current(&self) -> TaskState {
        self.current
    }

    pub fn history(&self) -> &[TransitionEvent] {
        &self.history
    }

    pub fn can_transition(&self, to: TaskState) -> bool {
        is_allowed(self.current, to)
    }

    /// Transition to `to`. `FAILED` must carry `error_detail`; any other
    /// illegal transition or a missing error detail on `FAILED` raises
    /// (spec.md §4.1, §7: these are programmer errors).
    pub fn transition(
        &mut self,
        to: TaskState,
        step: u32,
        url: &str,
        reason: &str,
        error_detail: Option<String>,
    ) -> Result<TransitionEvent> {
        if !is_allowed(self.current, to) {
            return Err(CoreError::IllegalTransition {
                from: self.current,
                to,
            });
        }
        if to == TaskState::Failed && error_detail.is_none() {
            return Err(CoreError::ProgrammerError(
                "FAILED transition requires a non-null error_detail".into(),
            ));
        }
        let event = TransitionEvent {
            from: self.current,
            to,
            step,
            url: url.to_string(),
            reason: reason.to_string(),
            error_detail,
            timestamp: Utc::now(),
        };
        self.current = to;
        self.history.push(event.clone());
        Ok(event)
    }
}

impl Default for TaskStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
