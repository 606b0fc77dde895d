//! External interfaces the core consumes (spec.md §6). Grounded on the
//! teacher's `shared/src/traits.rs` `BrowserService`/`LLMService`
//! async-trait collaborator shape: one async trait per external system,
//! with payload structs defined alongside it.

use async_trait::async_trait;

use crate::cache::Tier2Screenshot;
use crate::types::{
    AxDeficiencySignals, InteractiveElement, NavigatorActionDecision, ScrollPositionSnapshot,
    StructuredErrorKind,
};

#[derive(Debug, Clone)]
pub struct NavigationOutcome {
    pub requested_url: String,
    pub final_url: String,
    pub status: Option<i32>,
    pub status_text: String,
    pub error_text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InteractiveElementIndexOptions {
    pub include_bounding_boxes: bool,
    pub char_budget: usize,
}

#[derive(Debug, Clone)]
pub struct NormalizedAxTree {
    pub nodes: Vec<String>,
    pub json: String,
    pub char_count: usize,
}

#[derive(Debug, Clone)]
pub struct InteractiveElementIndex {
    pub elements: Vec<InteractiveElement>,
    pub element_count: usize,
    pub normalized_ax_tree: NormalizedAxTree,
    pub normalized_node_count: usize,
    pub normalized_char_count: usize,
}

#[derive(Debug, Clone)]
pub struct ScreenshotOptions {
    pub mode: ScreenshotMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenshotMode {
    Viewport,
}

#[derive(Debug, Clone)]
pub struct DomElement {
    pub tag: String,
    pub text: String,
    pub role: Option<String>,
    pub href: Option<String>,
    pub bounding_box: Option<crate::types::BoundingBox>,
}

#[derive(Debug, Clone)]
pub struct DomInteractiveElements {
    pub elements: Vec<DomElement>,
    pub element_count: usize,
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub current_url: String,
    pub navigation_observed: bool,
    pub dom_mutation_observed: bool,
    pub significant_dom_mutation_observed: bool,
    pub dom_mutation_summary: Option<String>,
    pub extracted_data: Option<serde_json::Value>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Acted,
    Done,
    Failed,
}

/// An exception surfaced by a collaborator call, mapped to a
/// [`StructuredErrorKind`] by [`crate::error_router`].
#[derive(Debug, Clone)]
pub struct CollaboratorException {
    pub kind: StructuredErrorKind,
    pub status: Option<i32>,
    pub message: String,
}

impl CollaboratorException {
    pub fn new(kind: StructuredErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(mut self, status: i32) -> Self {
        self.status = Some(status);
        self
    }
}

impl std::fmt::Display for CollaboratorException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for CollaboratorException {}

/// The headless-browser protocol client (spec.md §6). Each method is
/// callable once per step at most.
#[async_trait]
pub trait BrowserClient: Send + Sync {
    async fn navigate(&self, url: &str, timeout_ms: u64) -> Result<(), CollaboratorException>;

    async fn get_last_navigation_outcome(&self) -> NavigationOutcome;

    async fn get_current_url(&self) -> String;

    async fn extract_interactive_element_index(
        &self,
        options: InteractiveElementIndexOptions,
    ) -> Result<InteractiveElementIndex, CollaboratorException>;

    async fn get_ax_deficiency_signals(&self) -> AxDeficiencySignals;

    async fn get_scroll_position_snapshot(&self) -> ScrollPositionSnapshot;

    /// Scoped acquisition enabling visual assets for the duration of `f`,
    /// with guaranteed release on all exit paths (implementors wrap `f` in
    /// their own acquire/release guard; the default here is a passthrough
    /// for collaborators with nothing to acquire).
    async fn with_visual_render_pass<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut + Send,
        Fut: std::future::Future<Output = T> + Send,
        T: Send,
    {
        f().await
    }

    async fn capture_screenshot(
        &self,
        options: ScreenshotOptions,
    ) -> Result<Tier2Screenshot, CollaboratorException>;

    async fn extract_dom_interactive_elements(
        &self,
        max_elements: usize,
    ) -> Result<DomInteractiveElements, CollaboratorException>;

    async fn execute_action(
        &self,
        action: &NavigatorActionDecision,
    ) -> Result<ExecutionOutcome, CollaboratorException>;
}

#[derive(Debug, Clone)]
pub struct InferenceObservation {
    pub current_url: String,
    pub interactive_element_index: Vec<InteractiveElement>,
    pub normalized_ax_tree: String,
    pub previous_actions: Vec<String>,
    pub previous_observations: Vec<String>,
    pub history_summary: Option<String>,
    pub context_window_stats: crate::context_window::ContextWindowStats,
    pub task_subtasks: Vec<crate::types::Subtask>,
    pub active_subtask: Option<crate::types::Subtask>,
    pub checkpoint_state: crate::types::CheckpointState,
    pub structured_error: Option<crate::types::StructuredError>,
}

#[derive(Debug, Clone)]
pub struct PromptBudgetEstimate {
    pub prompt_char_count: u32,
    pub estimated_prompt_tokens: u64,
    pub alert_threshold: u64,
}

/// The inference engine (spec.md §6). Returning `Ok(None)` is permitted
/// only on structured-error paths.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    async fn decide_next_action(
        &self,
        intent: &str,
        tier: crate::types::Tier,
        escalation_reason: Option<crate::types::EscalationReason>,
        observation: &InferenceObservation,
    ) -> Option<NavigatorActionDecision>;

    async fn estimate_navigator_prompt_budget(
        &self,
        intent: &str,
        observation: &InferenceObservation,
        tier: crate::types::Tier,
        escalation_reason: Option<crate::types::EscalationReason>,
    ) -> PromptBudgetEstimate;
}
