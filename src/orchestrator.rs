//! C7 — Loop Orchestrator (spec.md §4.7). The public entry point of the
//! crate.
//!
//! Grounded on two sources: the teacher's `src/orchestrator.rs`
//! `WorkflowOrchestrator` (a struct owning collaborators, driving a
//! sequential `Result`-returning step sequence, with a recovery wrapper) for
//! its overall shape, and `other_examples/.../agent_loop_executor.rs`'s
//! `execute_agent_loop` (an explicit observe → think → act loop with a
//! per-step history vector and named break conditions) for the step-loop's
//! control flow. Neither teacher source has subtasks, an observation cache,
//! or a context window — those are built fresh against spec.md §4.2-§4.4,
//! composed into the same loop shape.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, instrument, warn};

use crate::cache::{ObservationCache, Tier2Screenshot};
use crate::collaborators::{
    BrowserClient, InferenceEngine, InferenceObservation, InteractiveElementIndexOptions,
    ScreenshotMode, ScreenshotOptions,
};
use crate::config::constants::INTERACTIVE_ELEMENT_CHAR_BUDGET;
use crate::context_window::{recent_actions_and_observations, ContextWindowManager};
use crate::decomposition::{decompose, CheckpointManager, RetryOutcome, VerificationInputs, VerifyOutcome};
use crate::error::{CoreError, Result as CoreResult};
use crate::error_router::{apply_retryable_fallback, structured_error_from_exception, structured_error_from_navigation};
use crate::events::{
    EscalationEvent, EscalationKind, NoopCallbacks, StructuredErrorEvent, SubtaskStatusEvent,
    SubtaskStatusReason, TaskCallbacks,
};
use crate::perception_policy::{
    assert_confidence_policy, evaluate_tier1, might_be_below_fold, run_tier3_scroll,
    select_initial_tier, should_trigger_tier3, try_dom_bypass, Tier3Outcome, TierSelection,
};
use crate::state_machine::TaskStateMachine;
use crate::types::{
    ActionKind, AxDeficientPageLog, ContextHistoryPair, DecisionSource, EscalationReason,
    LoopStepRecord, NavigatorActionDecision, PerceptionPayload, StructuredError, Subtask,
    SubtaskStatus, Task, TaskResult, TaskState, TaskStatus, Tier, TierUsage,
};

const TIER1_COST_USD: f64 = 0.00015;
const TIER2_COST_USD: f64 = 0.003;
const DOM_BYPASS_MAX_ELEMENTS: usize = 64;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefetchReason {
    Initial,
    UrlChanged,
    Navigation,
    SignificantDomMutation,
    ScrollAction,
    None,
}

/// Runs one task end to end (spec.md §4.7). Generic over the browser and
/// inference collaborators and the callback sink, avoiding the cost and
/// object-safety friction of trait objects since nothing here needs dynamic
/// dispatch.
pub async fn run_task<B, I, C>(task: Task, browser: B, engine: I, callbacks: C) -> CoreResult<TaskResult>
where
    B: BrowserClient,
    I: InferenceEngine,
    C: TaskCallbacks,
{
    validate_task(&task)?;
    let result = LoopOrchestrator::new(task, browser, engine, callbacks).run().await;
    Ok(result)
}

/// Convenience entry point for callers with no callback sink.
pub async fn run_task_default_callbacks<B, I>(task: Task, browser: B, engine: I) -> CoreResult<TaskResult>
where
    B: BrowserClient,
    I: InferenceEngine,
{
    run_task(task, browser, engine, NoopCallbacks).await
}

fn validate_task(task: &Task) -> CoreResult<()> {
    if task.intent.trim().is_empty() {
        return Err(CoreError::EmptyIntent);
    }
    if task.start_url.trim().is_empty() {
        return Err(CoreError::EmptyStartUrl);
    }
    task.config.validate()
}

struct Terminal {
    status: TaskStatus,
    error_detail: Option<String>,
    final_action: Option<NavigatorActionDecision>,
    final_execution: Option<String>,
    steps_taken: u32,
}

enum StepOutcome {
    Continue(RefetchReason),
    Terminal(Terminal),
}

struct LoopOrchestrator<B, I, C> {
    task: Task,
    browser: B,
    engine: I,
    callbacks: C,

    state: TaskStateMachine,
    checkpoint_mgr: CheckpointManager,
    context_window: ContextWindowManager,
    cache: ObservationCache,
    initial_decomposition: Vec<Subtask>,

    structured_errors: Vec<StructuredError>,
    escalations: Vec<EscalationEvent>,
    subtask_status_timeline: Vec<SubtaskStatusEvent>,
    ax_deficient_pages: Vec<AxDeficientPageLog>,
    tier_usage: TierUsage,
    history: Vec<LoopStepRecord>,

    no_progress_streak: u32,
    scroll_count: u32,
    current_url: String,
}

impl<B, I, C> LoopOrchestrator<B, I, C>
where
    B: BrowserClient,
    I: InferenceEngine,
    C: TaskCallbacks,
{
    fn new(task: Task, browser: B, engine: I, callbacks: C) -> Self {
        let subtasks = decompose(&task.intent, &task.task_id);
        let initial_decomposition = subtasks.clone();
        let max_retries = task.config.max_subtask_retries;
        let cache = ObservationCache::new(task.config.observation_cache_ttl_ms);
        let start_url = task.start_url.clone();
        Self {
            task,
            browser,
            engine,
            callbacks,
            state: TaskStateMachine::new(),
            checkpoint_mgr: CheckpointManager::new(subtasks, max_retries),
            context_window: ContextWindowManager::new(),
            cache,
            initial_decomposition,
            structured_errors: Vec::new(),
            escalations: Vec::new(),
            subtask_status_timeline: Vec::new(),
            ax_deficient_pages: Vec::new(),
            tier_usage: TierUsage::default(),
            history: Vec::new(),
            no_progress_streak: 0,
            scroll_count: 0,
            current_url: start_url,
        }
    }

    fn transition(&mut self, to: TaskState, step: u32, reason: &str, error_detail: Option<String>) {
        let url = self.current_url.clone();
        let event = self
            .state
            .transition(to, step, &url, reason, error_detail)
            .expect("orchestrator-issued transitions always follow the allowed DAG");
        self.callbacks.on_state_transition(&event);
    }

    fn emit_subtask_event(&mut self, subtask_id: &str, status: SubtaskStatus, reason: SubtaskStatusReason, step: u32) {
        let event = SubtaskStatusEvent {
            subtask_id: subtask_id.to_string(),
            status,
            reason,
            step,
            timestamp: chrono::Utc::now(),
        };
        self.callbacks.on_subtask_status(&event);
        self.subtask_status_timeline.push(event);
    }

    #[instrument(skip_all, fields(task_id = %self.task.task_id))]
    async fn run(mut self) -> TaskResult {
        self.transition(TaskState::Loading, 0, "task_started", None);

        if let Some(terminal) = self.do_navigation().await {
            return self.finalize(terminal).await;
        }

        self.transition(TaskState::Perceiving, 0, "navigated", None);

        let mut refetch_reason = RefetchReason::Initial;
        let mut step: u32 = 1;

        while step <= self.task.config.max_steps {
            match self.run_step(step, refetch_reason).await {
                StepOutcome::Continue(next_reason) => {
                    refetch_reason = next_reason;
                    step += 1;
                }
                StepOutcome::Terminal(terminal) => return self.finalize(terminal).await,
            }
        }

        let last_step = step.saturating_sub(1);
        self.checkpoint_mgr.mark_active_failed_terminal(last_step);
        if let Some(active) = self.checkpoint_mgr.active_subtask() {
            let id = active.id.clone();
            self.emit_subtask_event(&id, SubtaskStatus::Failed, SubtaskStatusReason::MaxStepsReached, last_step);
        }
        self.transition(TaskState::Failed, last_step, "MAX_STEPS_REACHED", Some("MAX_STEPS_REACHED".into()));
        self.finalize(Terminal {
            status: TaskStatus::MaxSteps,
            error_detail: Some("MAX_STEPS_REACHED".to_string()),
            final_action: None,
            final_execution: None,
            steps_taken: last_step,
        })
        .await
    }

    async fn do_navigation(&mut self) -> Option<Terminal> {
        let timeout = self.task.config.navigation_timeout_ms;
        let url = self.task.start_url.clone();

        if let Err(exc) = self.browser.navigate(&url, timeout).await {
            let error = structured_error_from_exception(&url, &exc);
            let (_decision, recovered) = self
                .route_structured_error(0, &error, "NAVIGATION_STRUCTURED_ERROR")
                .await;
            if !recovered {
                self.transition(
                    TaskState::Failed,
                    0,
                    "NAVIGATION_STRUCTURED_ERROR",
                    Some("NAVIGATION_STRUCTURED_ERROR".into()),
                );
                return Some(Terminal {
                    status: TaskStatus::Failed,
                    error_detail: Some("NAVIGATION_STRUCTURED_ERROR".into()),
                    final_action: None,
                    final_execution: None,
                    steps_taken: 0,
                });
            }
            return None;
        }

        let outcome = self.browser.get_last_navigation_outcome().await;
        self.current_url = outcome.final_url.clone();

        if let Some(error) = structured_error_from_navigation(&outcome) {
            let (_decision, recovered) = self
                .route_structured_error(0, &error, "NAVIGATION_STRUCTURED_ERROR")
                .await;
            if !recovered {
                self.transition(
                    TaskState::Failed,
                    0,
                    "NAVIGATION_STRUCTURED_ERROR",
                    Some("NAVIGATION_STRUCTURED_ERROR".into()),
                );
                return Some(Terminal {
                    status: TaskStatus::Failed,
                    error_detail: Some("NAVIGATION_STRUCTURED_ERROR".into()),
                    final_action: None,
                    final_execution: None,
                    steps_taken: 0,
                });
            }
        }
        None
    }

    /// Runs C6's recovery protocol (spec.md §4.6) and, if the error is
    /// retryable, immediately resumes the active subtask from checkpoint so
    /// the caller can continue the task. Returns the produced decision and
    /// whether the task may continue (retryable *and* a retry slot was
    /// available).
    async fn route_structured_error(
        &mut self,
        step: u32,
        error: &StructuredError,
        reason: &'static str,
    ) -> (Option<NavigatorActionDecision>, bool) {
        if let Some(active) = self.checkpoint_mgr.active_subtask() {
            let id = active.id.clone();
            self.emit_subtask_event(&id, SubtaskStatus::Failed, SubtaskStatusReason::StructuredErrorFailure, step);
        }

        let observation = self.build_inference_observation(None, Some(error.clone()), None);
        let engine_decision = self
            .engine
            .decide_next_action(&self.task.intent, Tier::Tier1Ax, None, &observation)
            .await;

        let prev_confidence = self.history.last().map(|h| h.decision.confidence).unwrap_or(0.0);
        let (decision, source) = apply_retryable_fallback(engine_decision, error, prev_confidence);

        if error.retryable {
            self.context_window.append(ContextHistoryPair {
                step,
                action: decision.clone(),
                observation: "structured_error_recovery".to_string(),
                url: self.current_url.clone(),
                resolved_tier: Tier::Tier1Ax,
                timestamp: chrono::Utc::now(),
            });
        }

        self.structured_errors.push(error.clone());
        let event = StructuredErrorEvent {
            step,
            error: error.clone(),
            reason,
            timestamp: chrono::Utc::now(),
        };
        self.callbacks.on_structured_error(&event);

        let recovered = error.retryable && matches!(self.checkpoint_mgr.retry_from_checkpoint(step), RetryOutcome::Retried);

        debug!(decision_source = ?source, recovered, "structured error routed");
        (Some(decision), recovered)
    }

    async fn run_step(&mut self, step: u32, refetch_reason: RefetchReason) -> StepOutcome {
        let perception = match self.obtain_perception(step, refetch_reason).await {
            Ok(p) => p,
            Err(terminal) => return StepOutcome::Terminal(terminal),
        };

        self.transition(TaskState::Inferring, step, "perceived", None);

        let (decision, resolved_tier, escalation_reason, cache_hit, decision_source) =
            match self.decide(step, &perception).await {
                Ok(v) => v,
                Err(terminal) => return StepOutcome::Terminal(terminal),
            };

        assert_confidence_policy(resolved_tier, &decision, self.task.config.confidence_threshold)
            .expect("confidence policy invariant must hold for a Tier-1 resolution");

        self.transition(TaskState::Acting, step, "decided", None);

        let execution = match self.browser.execute_action(&decision).await {
            Ok(outcome) => outcome,
            Err(exc) => {
                let error = structured_error_from_exception(&self.current_url.clone(), &exc);
                self.route_structured_error(step, &error, "ACTION_STRUCTURED_ERROR").await;
                self.transition(
                    TaskState::Failed,
                    step,
                    "ACTION_STRUCTURED_ERROR",
                    Some("ACTION_STRUCTURED_ERROR".into()),
                );
                return StepOutcome::Terminal(Terminal {
                    status: TaskStatus::Failed,
                    error_detail: Some("ACTION_STRUCTURED_ERROR".into()),
                    final_action: Some(decision),
                    final_execution: None,
                    steps_taken: step,
                });
            }
        };

        let url_before_action = self.current_url.clone();
        let url_changed = execution.current_url != url_before_action;
        self.current_url = execution.current_url.clone();

        let acted_no_progress = matches!(execution.status, crate::collaborators::ExecutionStatus::Acted)
            && !execution.navigation_observed
            && !execution.dom_mutation_observed
            && !url_changed;
        self.no_progress_streak = if acted_no_progress { self.no_progress_streak + 1 } else { 0 };

        let next_refetch_reason = if execution.navigation_observed {
            RefetchReason::Navigation
        } else if url_changed {
            RefetchReason::UrlChanged
        } else if execution.significant_dom_mutation_observed {
            RefetchReason::SignificantDomMutation
        } else if decision.action == ActionKind::Scroll {
            RefetchReason::ScrollAction
        } else {
            RefetchReason::None
        };

        if execution.navigation_observed
            || url_changed
            || decision.action == ActionKind::Scroll
            || execution.significant_dom_mutation_observed
        {
            self.cache.invalidate(&url_before_action);
            self.cache.invalidate(&self.current_url.clone());
        }

        let labels: Vec<String> = perception
            .interactive_element_index
            .iter()
            .map(|e| format!("{} {} {}", e.role, e.name, e.value.clone().unwrap_or_default()))
            .collect();
        let verify_inputs = VerificationInputs {
            normalized_current_url: &self.current_url,
            navigation_observed: execution.navigation_observed,
            interactive_labels: labels,
            dom_mutation_observed: execution.dom_mutation_observed,
            action: decision.action,
            extracted_data_present: execution.extracted_data.is_some(),
        };
        if let VerifyOutcome::Completed { index } =
            self.checkpoint_mgr
                .verify_active(&verify_inputs, step, &self.current_url, resolved_tier, decision.action)
        {
            let id = self.checkpoint_mgr.subtasks()[index].id.clone();
            self.emit_subtask_event(&id, SubtaskStatus::Complete, SubtaskStatusReason::Verified, step);
        }

        let execution_status_str = match execution.status {
            crate::collaborators::ExecutionStatus::Acted => "acted",
            crate::collaborators::ExecutionStatus::Done => "done",
            crate::collaborators::ExecutionStatus::Failed => "failed",
        };

        self.history.push(LoopStepRecord {
            step,
            url: self.current_url.clone(),
            resolved_tier,
            escalation_reason,
            decision: decision.clone(),
            decision_source,
            execution_status: execution_status_str.to_string(),
            no_progress_streak: self.no_progress_streak,
            active_subtask_id: self.checkpoint_mgr.active_subtask().map(|s| s.id.clone()),
            cache_hit,
            timestamp: chrono::Utc::now(),
        });

        self.context_window.append(ContextHistoryPair {
            step,
            action: decision.clone(),
            observation: execution
                .dom_mutation_summary
                .clone()
                .unwrap_or_else(|| execution.message.clone().unwrap_or_else(|| "no_observation".to_string())),
            url: self.current_url.clone(),
            resolved_tier,
            timestamp: chrono::Utc::now(),
        });

        if decision.action == ActionKind::Done || matches!(execution.status, crate::collaborators::ExecutionStatus::Done) {
            let synthesized_ids: Vec<String> = self
                .checkpoint_mgr
                .subtasks()
                .iter()
                .filter(|s| s.status != SubtaskStatus::Complete)
                .map(|s| s.id.clone())
                .collect();
            self.checkpoint_mgr.finalize_all_on_done(step, &self.current_url, resolved_tier);
            for id in synthesized_ids {
                self.emit_subtask_event(&id, SubtaskStatus::Complete, SubtaskStatusReason::SynthesizedOnDone, step);
            }
            self.transition(TaskState::Complete, step, "done", None);
            return StepOutcome::Terminal(Terminal {
                status: TaskStatus::Done,
                error_detail: None,
                final_action: Some(decision),
                final_execution: Some(execution_status_str.to_string()),
                steps_taken: step,
            });
        }

        if decision.action == ActionKind::Failed || matches!(execution.status, crate::collaborators::ExecutionStatus::Failed) {
            return self.handle_failure_or_no_progress(step, decision, execution_status_str, false);
        }

        if self.no_progress_streak >= self.task.config.max_no_progress_steps {
            return self.handle_failure_or_no_progress(step, decision, execution_status_str, true);
        }

        self.transition(TaskState::Perceiving, step, "acted", None);
        StepOutcome::Continue(next_refetch_reason)
    }

    fn handle_failure_or_no_progress(
        &mut self,
        step: u32,
        decision: NavigatorActionDecision,
        execution_status_str: &str,
        is_no_progress_guard: bool,
    ) -> StepOutcome {
        match self.checkpoint_mgr.retry_from_checkpoint(step) {
            RetryOutcome::Retried => {
                let retry_reason = if is_no_progress_guard {
                    SubtaskStatusReason::NoProgressLoopGuard
                } else {
                    SubtaskStatusReason::RetryFromCheckpoint
                };
                if let Some(active) = self.checkpoint_mgr.active_subtask() {
                    let id = active.id.clone();
                    self.emit_subtask_event(&id, SubtaskStatus::InProgress, retry_reason, step);
                }
                self.no_progress_streak = 0;
                self.cache.invalidate(&self.current_url);
                self.transition(TaskState::Perceiving, step, "retry_from_checkpoint", None);
                StepOutcome::Continue(RefetchReason::SignificantDomMutation)
            }
            RetryOutcome::Exhausted => {
                let reason = if is_no_progress_guard { "NO_PROGRESS_LOOP_GUARD" } else { "TASK_FAILED" };
                if let Some(active) = self.checkpoint_mgr.active_subtask() {
                    let id = active.id.clone();
                    self.emit_subtask_event(&id, SubtaskStatus::Failed, SubtaskStatusReason::RetriesExhausted, step);
                }
                self.transition(TaskState::Failed, step, reason, Some(reason.to_string()));
                StepOutcome::Terminal(Terminal {
                    status: TaskStatus::Failed,
                    error_detail: Some(reason.to_string()),
                    final_action: Some(decision),
                    final_execution: Some(execution_status_str.to_string()),
                    steps_taken: step,
                })
            }
        }
    }

    async fn obtain_perception(&mut self, step: u32, refetch_reason: RefetchReason) -> Result<PerceptionPayload, Terminal> {
        let url = self.current_url.clone();
        let now = now_ms();

        if refetch_reason == RefetchReason::None {
            if let Some(hit) = self.cache.get_perception(&url, now) {
                return Ok(hit.payload);
            }
        }

        let options = InteractiveElementIndexOptions {
            include_bounding_boxes: true,
            char_budget: INTERACTIVE_ELEMENT_CHAR_BUDGET,
        };
        let index = match self.browser.extract_interactive_element_index(options).await {
            Ok(i) => i,
            Err(exc) => {
                let error = structured_error_from_exception(&url, &exc);
                self.route_structured_error(step, &error, "PERCEPTION_STRUCTURED_ERROR").await;
                self.transition(
                    TaskState::Failed,
                    step,
                    "PERCEPTION_STRUCTURED_ERROR",
                    Some("PERCEPTION_STRUCTURED_ERROR".into()),
                );
                return Err(Terminal {
                    status: TaskStatus::Failed,
                    error_detail: Some("PERCEPTION_STRUCTURED_ERROR".into()),
                    final_action: None,
                    final_execution: None,
                    steps_taken: step,
                });
            }
        };
        let ax_signals = self.browser.get_ax_deficiency_signals().await;
        let scroll_position = self.browser.get_scroll_position_snapshot().await;
        let ax_tree_hash = ObservationCache::ax_tree_hash(&index.normalized_ax_tree.json);

        let payload = PerceptionPayload {
            interactive_element_index: index.elements,
            normalized_tree_encoding: index.normalized_ax_tree.json,
            ax_deficiency_signals: ax_signals,
            scroll_position,
            ax_tree_hash,
        };

        self.cache.set_perception(&url, payload.clone(), now);
        Ok(payload)
    }

    fn build_inference_observation(
        &mut self,
        escalation_reason: Option<EscalationReason>,
        structured_error: Option<StructuredError>,
        perception: Option<&PerceptionPayload>,
    ) -> InferenceObservation {
        let _ = escalation_reason;
        let snapshot = self.context_window.build_snapshot();
        let (actions, observations) = recent_actions_and_observations(&snapshot.recent);
        InferenceObservation {
            current_url: self.current_url.clone(),
            interactive_element_index: perception.map(|p| p.interactive_element_index.clone()).unwrap_or_default(),
            normalized_ax_tree: perception.map(|p| p.normalized_tree_encoding.clone()).unwrap_or_default(),
            previous_actions: actions,
            previous_observations: observations,
            history_summary: snapshot.archived_summary,
            context_window_stats: snapshot.stats,
            task_subtasks: self.checkpoint_mgr.subtasks().to_vec(),
            active_subtask: self.checkpoint_mgr.active_subtask().cloned(),
            checkpoint_state: self.checkpoint_mgr.checkpoint().clone(),
            structured_error,
        }
    }

    async fn decide(
        &mut self,
        step: u32,
        perception: &PerceptionPayload,
    ) -> Result<(NavigatorActionDecision, Tier, Option<EscalationReason>, bool, DecisionSource), Terminal> {
        let selection = select_initial_tier(
            self.no_progress_streak,
            &perception.ax_deficiency_signals,
            self.task.config.ax_deficient_interactive_threshold,
        );

        match selection {
            TierSelection::RunTier1 => {
                let (decision, cache_hit) = self.engine_decide(step, Tier::Tier1Ax, None, perception).await;
                self.tier_usage.tier1_calls += 1;
                if !cache_hit {
                    self.tier_usage.estimated_cost_usd += TIER1_COST_USD;
                }
                match evaluate_tier1(&decision, self.task.config.confidence_threshold) {
                    Ok(()) => Ok((decision, Tier::Tier1Ax, None, cache_hit, DecisionSource::Navigator)),
                    Err(reason) => Ok(self.escalate_to_tier2(step, perception, reason).await),
                }
            }
            TierSelection::RunTier2 { reason } => {
                if reason == EscalationReason::AxDeficient {
                    self.ax_deficient_pages.push(AxDeficientPageLog {
                        step,
                        url: self.current_url.clone(),
                        visible_element_count: perception.ax_deficiency_signals.visible_element_count,
                        timestamp: chrono::Utc::now(),
                    });
                }
                Ok(self.escalate_to_tier2(step, perception, reason).await)
            }
        }
    }

    async fn escalate_to_tier2(
        &mut self,
        step: u32,
        perception: &PerceptionPayload,
        reason: EscalationReason,
    ) -> (NavigatorActionDecision, Tier, Option<EscalationReason>, bool, DecisionSource) {
        self.escalations.push(EscalationEvent {
            step,
            url: self.current_url.clone(),
            kind: escalation_kind(reason),
            detail: format!("escalating to tier2: {reason:?}"),
            timestamp: chrono::Utc::now(),
        });

        if let Some(decision) = self.try_dom_bypass(step).await {
            self.tier_usage.dom_bypass_resolutions += 1;
            return (decision, Tier::Tier1Ax, Some(reason), false, DecisionSource::Navigator);
        }

        let _ = self.capture_or_reuse_screenshot().await;

        let (mut decision, cache_hit) = self.engine_decide(step, Tier::Tier2Vision, Some(reason), perception).await;
        self.tier_usage.tier2_calls += 1;
        if !cache_hit {
            self.tier_usage.estimated_cost_usd += TIER2_COST_USD;
        }
        let mut resolved_tier = Tier::Tier2Vision;

        if should_trigger_tier3(&decision, self.task.config.confidence_threshold, Some(reason), self.no_progress_streak)
            && might_be_below_fold(&perception.scroll_position, self.task.config.scroll_step_px)
        {
            self.escalations.push(EscalationEvent {
                step,
                url: self.current_url.clone(),
                kind: EscalationKind::Tier3Scroll,
                detail: "below-fold target, issuing scroll".to_string(),
                timestamp: chrono::Utc::now(),
            });
            match run_tier3_scroll(self.scroll_count, self.task.config.max_scroll_steps, self.task.config.scroll_step_px) {
                Tier3Outcome::Scrolled(d) => {
                    self.scroll_count += 1;
                    self.tier_usage.tier3_scroll_calls += 1;
                    decision = d;
                    resolved_tier = Tier::Tier3Scroll;
                }
                Tier3Outcome::Aborted(d) => {
                    decision = d;
                    resolved_tier = Tier::Tier3Scroll;
                }
            }
        }

        (decision, resolved_tier, Some(reason), cache_hit, DecisionSource::Navigator)
    }

    async fn try_dom_bypass(&mut self, step: u32) -> Option<NavigatorActionDecision> {
        let dom = self.browser.extract_dom_interactive_elements(DOM_BYPASS_MAX_ELEMENTS).await.ok()?;
        let decision = try_dom_bypass(&self.task.intent, &dom.elements)?;
        self.escalations.push(EscalationEvent {
            step,
            url: self.current_url.clone(),
            kind: EscalationKind::DomBypass,
            detail: "resolved via dom bypass".to_string(),
            timestamp: chrono::Utc::now(),
        });
        Some(decision)
    }

    /// Captures a Tier-2 viewport screenshot, reusing a cached one where
    /// present. The raw bytes aren't part of [`InferenceObservation`] — the
    /// engine contract doesn't carry pixels — but the cache instrumentation
    /// around this call still participates in the observation cache's hit
    /// and invalidation accounting.
    async fn capture_or_reuse_screenshot(&mut self) -> Option<Tier2Screenshot> {
        let url = self.current_url.clone();
        let now = now_ms();
        if let Some(shot) = self.cache.get_tier2_screenshot(&url, now) {
            return Some(shot);
        }
        let browser = &self.browser;
        let options = ScreenshotOptions { mode: ScreenshotMode::Viewport };
        let result = browser.with_visual_render_pass(|| browser.capture_screenshot(options)).await;
        match result {
            Ok(shot) => {
                self.cache.set_tier2_screenshot(&url, shot.clone(), now);
                Some(shot)
            }
            Err(_) => None,
        }
    }

    async fn engine_decide(
        &mut self,
        step: u32,
        tier: Tier,
        reason: Option<EscalationReason>,
        perception: &PerceptionPayload,
    ) -> (NavigatorActionDecision, bool) {
        let now = now_ms();
        let url = self.current_url.clone();
        if let Some(cached) = self.cache.get_decision(&url, tier, reason, now) {
            return (cached, true);
        }

        let observation = self.build_inference_observation(reason, None, Some(perception));
        let budget = self
            .engine
            .estimate_navigator_prompt_budget(&self.task.intent, &observation, tier, reason)
            .await;
        self.context_window.record_prompt_budget(
            step,
            tier,
            budget.prompt_char_count,
            budget.estimated_prompt_tokens,
            budget.alert_threshold,
        );

        let decision = self
            .engine
            .decide_next_action(&self.task.intent, tier, reason, &observation)
            .await
            .unwrap_or_else(|| NavigatorActionDecision {
                action: ActionKind::Failed,
                target: None,
                text: None,
                confidence: 0.0,
                reasoning: "engine returned no decision outside a structured-error path".to_string(),
            });

        self.cache.set_decision(&url, tier, reason, decision.clone(), now);
        (decision, false)
    }

    async fn finalize(mut self, terminal: Terminal) -> TaskResult {
        if self.state.can_transition(TaskState::Idle) {
            self.transition(TaskState::Idle, terminal.steps_taken, "cleanup", None);
        }

        let context_snapshot = self.context_window.build_snapshot();
        let result = TaskResult {
            task_id: self.task.task_id.clone(),
            context_id: self.task.context_id.clone(),
            status: terminal.status,
            intent: self.task.intent.clone(),
            start_url: self.task.start_url.clone(),
            final_url: self.current_url.clone(),
            steps_taken: terminal.steps_taken,
            history: self.history.clone(),
            decomposition: self.initial_decomposition.clone(),
            subtasks: self.checkpoint_mgr.subtasks().to_vec(),
            checkpoint: self.checkpoint_mgr.checkpoint().clone(),
            subtask_status_timeline: self.subtask_status_timeline.clone(),
            structured_errors: self.structured_errors.clone(),
            escalations: self.escalations.clone(),
            ax_deficient_pages: self.ax_deficient_pages.clone(),
            tier_usage: self.tier_usage.clone(),
            context_window: context_snapshot.stats,
            observation_cache: self.cache.stats.clone(),
            final_action: terminal.final_action.clone(),
            final_execution: terminal.final_execution.clone(),
            error_detail: terminal.error_detail.clone(),
            state_transitions: self.state.history().to_vec(),
        };

        match terminal.status {
            TaskStatus::Done => info!(task_id = %result.task_id, steps = result.steps_taken, "task done"),
            _ => warn!(task_id = %result.task_id, steps = result.steps_taken, error = ?result.error_detail, "task ended"),
        }

        self.callbacks.on_task_cleanup(&result);
        result
    }
}

fn escalation_kind(reason: EscalationReason) -> EscalationKind {
    match reason {
        EscalationReason::NoProgress => EscalationKind::NoProgress,
        EscalationReason::AxDeficient => EscalationKind::AxDeficient,
        EscalationReason::LowConfidence => EscalationKind::LowConfidence,
        EscalationReason::UnsafeAction => EscalationKind::UnsafeAction,
    }
}
