//! Core data model (spec.md §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::TaskConfig;

/// Task lifecycle states (spec.md §4.1).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskState {
    Idle,
    Loading,
    Perceiving,
    Inferring,
    Acting,
    Complete,
    Failed,
}

/// A submitted task. Tunables live on [`TaskConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub context_id: Option<String>,
    pub intent: String,
    pub start_url: String,
    pub config: TaskConfig,
}

impl Task {
    /// Builds a task with a fresh UUIDv4 `taskId`, no `contextId`, and
    /// default tunables (spec.md §6: `taskId` is optional on input). Callers
    /// who already have a `taskId` to propagate should build a `Task`
    /// literal directly instead.
    pub fn new(intent: impl Into<String>, start_url: impl Into<String>) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            context_id: None,
            intent: intent.into(),
            start_url: start_url.into(),
            config: TaskConfig::default(),
        }
    }
}

/// Perception/inference tier (glossary).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Tier {
    Tier1Ax,
    Tier2Vision,
    Tier3Scroll,
}

/// Why a step escalated past Tier-1 (spec.md §4.5).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EscalationReason {
    NoProgress,
    AxDeficient,
    LowConfidence,
    UnsafeAction,
}

impl EscalationReason {
    pub fn as_key_str(self) -> &'static str {
        match self {
            EscalationReason::NoProgress => "NO_PROGRESS",
            EscalationReason::AxDeficient => "AX_DEFICIENT",
            EscalationReason::LowConfidence => "LOW_CONFIDENCE",
            EscalationReason::UnsafeAction => "UNSAFE_ACTION",
        }
    }
}

/// Verification predicate kind attached to a subtask (spec.md §3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum VerificationType {
    UrlMatches,
    ElementPresent,
    DataExtracted,
    HumanReview,
    ActionConfirmed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verification {
    pub verification_type: VerificationType,
    pub condition: String,
}

/// Subtask status (spec.md §3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SubtaskStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub intent: String,
    pub verification: Verification,
    pub status: SubtaskStatus,
    pub attempt_count: u32,
    pub completed_step: Option<u32>,
    pub failed_step: Option<u32>,
    pub last_updated_at: DateTime<Utc>,
    pub implied_step_count: u32,
}

/// Artifact recorded when a subtask completes, or synthetically on `DONE`
/// (spec.md §3, §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskArtifact {
    pub subtask_id: String,
    pub step: u32,
    pub completion_url: String,
    pub resolved_tier: Tier,
    pub action: ActionKind,
    pub timestamp: DateTime<Utc>,
}

/// Checkpoint state (spec.md §3). `last_completed_subtask_index` starts at
/// -1 and is monotonically non-decreasing; represented as `i64` so the
/// initial "no subtask complete yet" value is expressible without an
/// `Option` at every call site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointState {
    pub last_completed_subtask_index: i64,
    pub current_subtask_attempt: u32,
    pub subtask_artifacts: Vec<SubtaskArtifact>,
}

impl Default for CheckpointState {
    fn default() -> Self {
        Self {
            last_completed_subtask_index: -1,
            current_subtask_attempt: 0,
            subtask_artifacts: Vec::new(),
        }
    }
}

/// Action kind the inference engine may decide on (spec.md §6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Click,
    Type,
    Scroll,
    Wait,
    Extract,
    PressKey,
    Done,
    Failed,
}

/// A 2D point, used for click targets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// The inference engine's decision for a step (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigatorActionDecision {
    pub action: ActionKind,
    pub target: Option<Point>,
    pub text: Option<String>,
    pub confidence: f64,
    pub reasoning: String,
}

/// Structured error taxonomy (spec.md §3, §7). Exactly four kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StructuredErrorKind {
    Network,
    Runtime,
    Cdp,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredError {
    pub kind: StructuredErrorKind,
    pub status: Option<i32>,
    pub url: String,
    pub message: String,
    pub retryable: bool,
}

/// Source of a decision, recorded when the error router applies its
/// retryable-fallback policy (spec.md §4.6 step 4).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DecisionSource {
    Navigator,
    PolicyFallback,
}

/// Perception payload cached per URL (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerceptionPayload {
    pub interactive_element_index: Vec<InteractiveElement>,
    pub normalized_tree_encoding: String,
    pub ax_deficiency_signals: AxDeficiencySignals,
    pub scroll_position: ScrollPositionSnapshot,
    pub ax_tree_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractiveElement {
    pub node_id: String,
    pub role: String,
    pub name: String,
    pub value: Option<String>,
    pub bounding_box: Option<BoundingBox>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn has_positive_area(&self) -> bool {
        self.width > 0.0 && self.height > 0.0
    }

    pub fn center(&self) -> Point {
        Point {
            x: round3(self.x + self.width / 2.0),
            y: round3(self.y + self.height / 2.0),
        }
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AxDeficiencySignals {
    pub ready_state: ReadyState,
    pub is_load_complete: bool,
    pub has_significant_visual_content: bool,
    pub visible_element_count: u32,
    pub text_char_count: u32,
    pub media_element_count: u32,
    pub dom_interactive_candidate_count: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReadyState {
    Loading,
    Interactive,
    Complete,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScrollPositionSnapshot {
    pub scroll_y: f64,
    pub viewport_height: f64,
    pub document_height: f64,
    pub remaining_scroll_px: f64,
}

/// A single action/observation pair retained by the context window
/// (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextHistoryPair {
    pub step: u32,
    pub action: NavigatorActionDecision,
    pub observation: String,
    pub url: String,
    pub resolved_tier: Tier,
    pub timestamp: DateTime<Utc>,
}

/// One step's full record, appended to `TaskResult::history` (spec.md §8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopStepRecord {
    pub step: u32,
    pub url: String,
    pub resolved_tier: Tier,
    pub escalation_reason: Option<EscalationReason>,
    pub decision: NavigatorActionDecision,
    pub decision_source: DecisionSource,
    pub execution_status: String,
    pub no_progress_streak: u32,
    pub active_subtask_id: Option<String>,
    pub cache_hit: bool,
    pub timestamp: DateTime<Utc>,
}

/// Terminal status of a task run (spec.md §6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Done,
    Failed,
    MaxSteps,
}

/// Tier usage/cost counters surfaced in the result (spec.md §6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierUsage {
    pub tier1_calls: u32,
    pub tier2_calls: u32,
    pub tier3_scroll_calls: u32,
    pub dom_bypass_resolutions: u32,
    pub estimated_cost_usd: f64,
}

/// Observation-cache hit/miss counters (spec.md §6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservationCacheStats {
    pub perception_hits: u32,
    pub perception_misses: u32,
    pub decision_hits: u32,
    pub decision_misses: u32,
    pub screenshot_hits: u32,
    pub screenshot_misses: u32,
    pub invalidations: u32,
}

/// Everything the caller sees back (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub context_id: Option<String>,
    pub status: TaskStatus,
    pub intent: String,
    pub start_url: String,
    pub final_url: String,
    pub steps_taken: u32,
    pub history: Vec<LoopStepRecord>,
    pub decomposition: Vec<Subtask>,
    pub subtasks: Vec<Subtask>,
    pub checkpoint: CheckpointState,
    pub subtask_status_timeline: Vec<crate::events::SubtaskStatusEvent>,
    pub structured_errors: Vec<StructuredError>,
    pub escalations: Vec<crate::events::EscalationEvent>,
    pub ax_deficient_pages: Vec<AxDeficientPageLog>,
    pub tier_usage: TierUsage,
    pub context_window: crate::context_window::ContextWindowStats,
    pub observation_cache: ObservationCacheStats,
    pub final_action: Option<NavigatorActionDecision>,
    pub final_execution: Option<String>,
    pub error_detail: Option<String>,
    pub state_transitions: Vec<crate::events::TransitionEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxDeficientPageLog {
    pub step: u32,
    pub url: String,
    pub visible_element_count: u32,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_generates_a_distinct_task_id_per_call() {
        let a = Task::new("search for keyboards", "https://example.test");
        let b = Task::new("search for keyboards", "https://example.test");
        assert_ne!(a.task_id, b.task_id);
        assert!(a.context_id.is_none());
        assert_eq!(a.config, TaskConfig::default());
    }
}
