//! Timeline records and the synchronous callback sinks the orchestrator
//! invokes (spec.md §3, §6, §9). Modelled as handler objects, as the
//! teacher's observer pattern does for event-driven communication between
//! engines (`src/events.rs`), but narrowed to exactly the four sinks the
//! spec names rather than a generic `EventType` enum.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{StructuredError, TaskState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub from: TaskState,
    pub to: TaskState,
    pub step: u32,
    pub url: String,
    pub reason: String,
    pub error_detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EscalationKind {
    NoProgress,
    AxDeficient,
    LowConfidence,
    UnsafeAction,
    Tier3Scroll,
    DomBypass,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationEvent {
    pub step: u32,
    pub url: String,
    pub kind: EscalationKind,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredErrorEvent {
    pub step: u32,
    pub error: StructuredError,
    pub reason: &'static str,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SubtaskStatusReason {
    Verified,
    RetryFromCheckpoint,
    RetriesExhausted,
    SynthesizedOnDone,
    StructuredErrorFailure,
    NoProgressLoopGuard,
    MaxStepsReached,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskStatusEvent {
    pub subtask_id: String,
    pub status: crate::types::SubtaskStatus,
    pub reason: SubtaskStatusReason,
    pub step: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptBudgetAlertEvent {
    pub step: u32,
    pub tier: crate::types::Tier,
    pub prompt_char_count: u32,
    pub estimated_prompt_tokens: u64,
    pub threshold: u64,
    pub timestamp: DateTime<Utc>,
}

/// Callback sinks the orchestrator invokes synchronously (spec.md §6, §9).
/// Return values are never consulted; callbacks must not mutate core state.
pub trait TaskCallbacks: Send + Sync {
    fn on_state_transition(&self, _event: &TransitionEvent) {}
    fn on_subtask_status(&self, _event: &SubtaskStatusEvent) {}
    fn on_structured_error(&self, _event: &StructuredErrorEvent) {}
    fn on_task_cleanup(&self, _result: &crate::types::TaskResult) {}
}

/// A callback implementation that does nothing; the default when the caller
/// supplies no sinks.
pub struct NoopCallbacks;
impl TaskCallbacks for NoopCallbacks {}
