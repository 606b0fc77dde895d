//! End-to-end scenario tests against deterministic fakes, one per seeded
//! scenario. Fakes are scripted by queueing the exact decisions/outcomes a
//! step needs rather than modelling a real page, since the crate under test
//! never speaks CDP or an LLM wire protocol itself.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;

use pac_core::cache::Tier2Screenshot;
use pac_core::collaborators::{
    BrowserClient, CollaboratorException, DomInteractiveElements, ExecutionOutcome,
    ExecutionStatus, InferenceEngine, InferenceObservation, InteractiveElementIndex,
    InteractiveElementIndexOptions, NavigationOutcome, NormalizedAxTree, PromptBudgetEstimate,
    ScreenshotOptions,
};
use pac_core::config::TaskConfig;
use pac_core::events::NoopCallbacks;
use pac_core::orchestrator::run_task;
use pac_core::types::{
    ActionKind, AxDeficiencySignals, EscalationReason, InteractiveElement, NavigatorActionDecision,
    ReadyState, ScrollPositionSnapshot, Task, TaskStatus, Tier,
};

fn decision(action: ActionKind, confidence: f64) -> NavigatorActionDecision {
    NavigatorActionDecision {
        action,
        target: None,
        text: None,
        confidence,
        reasoning: format!("{action:?}"),
    }
}

fn acted(url: &str) -> ExecutionOutcome {
    ExecutionOutcome {
        status: ExecutionStatus::Acted,
        current_url: url.to_string(),
        navigation_observed: false,
        dom_mutation_observed: true,
        significant_dom_mutation_observed: true,
        dom_mutation_summary: Some("dom mutated".to_string()),
        extracted_data: None,
        message: None,
    }
}

fn done(url: &str) -> ExecutionOutcome {
    ExecutionOutcome {
        status: ExecutionStatus::Done,
        current_url: url.to_string(),
        navigation_observed: false,
        dom_mutation_observed: false,
        significant_dom_mutation_observed: false,
        dom_mutation_summary: None,
        extracted_data: None,
        message: Some("done".to_string()),
    }
}

fn healthy_signals() -> AxDeficiencySignals {
    AxDeficiencySignals {
        ready_state: ReadyState::Complete,
        is_load_complete: true,
        has_significant_visual_content: true,
        visible_element_count: 20,
        text_char_count: 400,
        media_element_count: 0,
        dom_interactive_candidate_count: 20,
    }
}

fn fixture_index() -> InteractiveElementIndex {
    let element = InteractiveElement {
        node_id: "n1".into(),
        role: "textbox".into(),
        name: "Search".into(),
        value: None,
        bounding_box: None,
    };
    InteractiveElementIndex {
        elements: vec![element],
        element_count: 1,
        normalized_ax_tree: NormalizedAxTree {
            nodes: vec!["textbox Search".to_string()],
            json: "{\"nodes\":[\"textbox Search\"]}".to_string(),
            char_count: 24,
        },
        normalized_node_count: 1,
        normalized_char_count: 24,
    }
}

fn no_scroll_remaining() -> ScrollPositionSnapshot {
    ScrollPositionSnapshot {
        scroll_y: 0.0,
        viewport_height: 800.0,
        document_height: 800.0,
        remaining_scroll_px: 0.0,
    }
}

/// A browser whose navigation outcome and per-step execution outcomes are
/// fully scripted in advance.
struct ScriptedBrowser {
    navigation_outcome: NavigationOutcome,
    executions: Mutex<VecDeque<ExecutionOutcome>>,
}

impl ScriptedBrowser {
    fn new(navigation_outcome: NavigationOutcome, executions: Vec<ExecutionOutcome>) -> Self {
        Self {
            navigation_outcome,
            executions: Mutex::new(executions.into()),
        }
    }
}

#[async_trait]
impl BrowserClient for ScriptedBrowser {
    async fn navigate(&self, _url: &str, _timeout_ms: u64) -> Result<(), CollaboratorException> {
        Ok(())
    }

    async fn get_last_navigation_outcome(&self) -> NavigationOutcome {
        self.navigation_outcome.clone()
    }

    async fn get_current_url(&self) -> String {
        self.navigation_outcome.final_url.clone()
    }

    async fn extract_interactive_element_index(
        &self,
        _options: InteractiveElementIndexOptions,
    ) -> Result<InteractiveElementIndex, CollaboratorException> {
        Ok(fixture_index())
    }

    async fn get_ax_deficiency_signals(&self) -> AxDeficiencySignals {
        healthy_signals()
    }

    async fn get_scroll_position_snapshot(&self) -> ScrollPositionSnapshot {
        no_scroll_remaining()
    }

    async fn capture_screenshot(
        &self,
        _options: ScreenshotOptions,
    ) -> Result<Tier2Screenshot, CollaboratorException> {
        Ok(Tier2Screenshot {
            base64: String::new(),
            mime_type: "image/png".into(),
            width: 1,
            height: 1,
        })
    }

    async fn extract_dom_interactive_elements(
        &self,
        _max_elements: usize,
    ) -> Result<DomInteractiveElements, CollaboratorException> {
        Ok(DomInteractiveElements {
            elements: vec![],
            element_count: 0,
        })
    }

    async fn execute_action(
        &self,
        _action: &NavigatorActionDecision,
    ) -> Result<ExecutionOutcome, CollaboratorException> {
        let mut q = self.executions.lock().unwrap();
        Ok(q.pop_front().unwrap_or_else(|| acted(&self.navigation_outcome.final_url)))
    }
}

/// An inference engine that replays a fixed queue of decisions, one per
/// call, regardless of tier or escalation reason.
struct ScriptedEngine {
    decisions: Mutex<VecDeque<NavigatorActionDecision>>,
}

impl ScriptedEngine {
    fn new(decisions: Vec<NavigatorActionDecision>) -> Self {
        Self {
            decisions: Mutex::new(decisions.into()),
        }
    }
}

#[async_trait]
impl InferenceEngine for ScriptedEngine {
    async fn decide_next_action(
        &self,
        _intent: &str,
        _tier: Tier,
        _escalation_reason: Option<EscalationReason>,
        _observation: &InferenceObservation,
    ) -> Option<NavigatorActionDecision> {
        let mut q = self.decisions.lock().unwrap();
        Some(q.pop_front().unwrap_or_else(|| decision(ActionKind::Wait, 0.8)))
    }

    async fn estimate_navigator_prompt_budget(
        &self,
        _intent: &str,
        observation: &InferenceObservation,
        _tier: Tier,
        _escalation_reason: Option<EscalationReason>,
    ) -> PromptBudgetEstimate {
        let char_count = observation.normalized_ax_tree.len()
            + observation.previous_actions.iter().map(|s| s.len()).sum::<usize>()
            + observation.previous_observations.iter().map(|s| s.len()).sum::<usize>()
            + observation.history_summary.as_ref().map(|s| s.len()).unwrap_or(0);
        PromptBudgetEstimate {
            prompt_char_count: char_count as u32,
            estimated_prompt_tokens: (char_count / 4) as u64,
            alert_threshold: pac_core::context_window::ContextWindowManager::default_prompt_token_threshold(),
        }
    }
}

fn clean_outcome(url: &str) -> NavigationOutcome {
    NavigationOutcome {
        requested_url: url.to_string(),
        final_url: url.to_string(),
        status: None,
        status_text: String::new(),
        error_text: None,
    }
}

fn task(intent: &str, start_url: &str) -> Task {
    Task {
        task_id: "t1".to_string(),
        context_id: None,
        intent: intent.to_string(),
        start_url: start_url.to_string(),
        config: TaskConfig::default(),
    }
}

/// S1: a bare single-subtask intent resolves at Tier 1 with high confidence
/// and terminates DONE well inside the step budget.
#[tokio::test]
async fn s1_search_task_completes_quickly_at_tier1() {
    let url = "https://www.google.com/";
    let browser = ScriptedBrowser::new(clean_outcome(url), vec![acted(url), done(url)]);
    let engine = ScriptedEngine::new(vec![decision(ActionKind::Click, 0.95), decision(ActionKind::Done, 1.0)]);

    let result = run_task(
        task("search for mechanical keyboards", url),
        browser,
        engine,
        NoopCallbacks,
    )
    .await
    .unwrap();

    assert_eq!(result.status, TaskStatus::Done);
    assert!(result.steps_taken <= 8);
    let first = &result.history[0];
    assert_eq!(first.resolved_tier, Tier::Tier1Ax);
    assert_eq!(first.decision.action, ActionKind::Click);
    assert!(first.decision.confidence >= 0.9);
}

/// S2: the observation cache is scoped per task — two independent task runs
/// against the same fixture URL both see a perception cache miss on their
/// first step.
#[tokio::test]
async fn s2_observation_cache_is_scoped_per_task() {
    let url = "https://fixture.test/page";

    for _ in 0..2 {
        let browser = ScriptedBrowser::new(clean_outcome(url), vec![done(url)]);
        let engine = ScriptedEngine::new(vec![decision(ActionKind::Done, 1.0)]);
        let result = run_task(task("confirm the checkout", url), browser, engine, NoopCallbacks)
            .await
            .unwrap();
        assert_eq!(result.status, TaskStatus::Done);
        assert!(result.observation_cache.perception_misses >= 1);
        assert_eq!(result.observation_cache.perception_hits, 0);
    }
}

/// S3: a long single-URL flow bounds the rolling context window at 5 recent
/// pairs, archives the rest into a running summary, and never escalates
/// tiers (confidence stays high, the page never goes AX-deficient).
#[tokio::test]
async fn s3_long_flow_bounds_context_window() {
    let url = "https://fixture.test/long-flow";
    let step_count = 9;

    let mut decisions: Vec<NavigatorActionDecision> =
        (0..step_count).map(|_| decision(ActionKind::Click, 0.9)).collect();
    decisions.push(decision(ActionKind::Done, 1.0));

    let mut executions: Vec<ExecutionOutcome> = (0..step_count).map(|_| acted(url)).collect();
    executions.push(done(url));

    let browser = ScriptedBrowser::new(clean_outcome(url), executions);
    let engine = ScriptedEngine::new(decisions);

    let result = run_task(task("click the button", url), browser, engine, NoopCallbacks)
        .await
        .unwrap();

    assert_eq!(result.status, TaskStatus::Done);
    assert_eq!(result.context_window.max_recent_pair_count, 5);
    assert!(result.context_window.summarized_pair_count >= 2);
    assert!(result.context_window.summary_refresh_count >= 1);
    assert!(result.tier_usage.tier2_calls == 0);
    assert!(result
        .context_window
        .token_alerts
        .iter()
        .all(|a| a.estimated_prompt_tokens <= 12_000));
}

/// S4: a retryable 503 on the initial navigation is routed through the
/// structured-error recovery path and the task proceeds without ever
/// escalating to Tier 2.
#[tokio::test]
async fn s4_retryable_navigation_error_recovers_without_tier2() {
    let url = "https://fixture.test/flaky";
    let mut outcome = clean_outcome(url);
    outcome.status = Some(503);
    outcome.status_text = "Service Unavailable".to_string();

    let browser = ScriptedBrowser::new(outcome, vec![done(url)]);
    let engine = ScriptedEngine::new(vec![decision(ActionKind::Click, 0.9), decision(ActionKind::Done, 1.0)]);

    let result = run_task(task("confirm the order", url), browser, engine, NoopCallbacks)
        .await
        .unwrap();

    assert_eq!(result.structured_errors.len(), 1);
    let err = &result.structured_errors[0];
    assert_eq!(err.status, Some(503));
    assert!(err.retryable);
    assert_eq!(result.tier_usage.tier2_calls, 0);
    assert_eq!(result.status, TaskStatus::Done);
}

/// S5: a non-retryable 404 on the initial navigation fails the task
/// immediately with the named structured-error reason.
#[tokio::test]
async fn s5_non_retryable_navigation_error_fails_task() {
    let url = "https://fixture.test/missing";
    let mut outcome = clean_outcome(url);
    outcome.status = Some(404);
    outcome.status_text = "Not Found".to_string();

    let browser = ScriptedBrowser::new(outcome, vec![]);
    let engine = ScriptedEngine::new(vec![]);

    let result = run_task(task("open the missing page", url), browser, engine, NoopCallbacks)
        .await
        .unwrap();

    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.error_detail.as_deref(), Some("NAVIGATION_STRUCTURED_ERROR"));
    assert_eq!(result.structured_errors.len(), 1);
    assert_eq!(result.structured_errors[0].status, Some(404));
    assert!(!result.structured_errors[0].retryable);
}

/// S6: a five-clause intent decomposes into five subtasks; the fourth one
/// fails once (a timed-out add-to-cart call), retries from checkpoint, and
/// the task still completes with every subtask verified exactly once.
#[tokio::test]
async fn s6_subtask_retry_then_done() {
    let url = "https://shop.test/";
    let intent = "go to the shop and then search for keyboards and then \
                  click add to cart and then extract the price and then confirm checkout";

    let nav_step = ExecutionOutcome {
        status: ExecutionStatus::Acted,
        current_url: url.to_string(),
        navigation_observed: true,
        dom_mutation_observed: false,
        significant_dom_mutation_observed: true,
        dom_mutation_summary: Some("navigated to shop".to_string()),
        extracted_data: None,
        message: None,
    };
    let failed_price_extraction = ExecutionOutcome {
        status: ExecutionStatus::Failed,
        current_url: url.to_string(),
        navigation_observed: false,
        dom_mutation_observed: false,
        significant_dom_mutation_observed: false,
        dom_mutation_summary: None,
        extracted_data: None,
        message: Some("price extraction endpoint timed out".to_string()),
    };
    let extract_price = ExecutionOutcome {
        status: ExecutionStatus::Acted,
        current_url: url.to_string(),
        navigation_observed: false,
        dom_mutation_observed: true,
        significant_dom_mutation_observed: true,
        dom_mutation_summary: Some("price extracted".to_string()),
        extracted_data: Some(json!({"price": 129.99})),
        message: None,
    };

    let executions = vec![
        nav_step,
        acted(url),               // search for keyboards
        acted(url),               // click add to cart
        failed_price_extraction,  // extract the price (fails first attempt)
        extract_price,            // extract the price (retry succeeds)
        done(url),
    ];
    let decisions = vec![
        decision(ActionKind::Click, 0.95),
        decision(ActionKind::Click, 0.95),
        decision(ActionKind::Click, 0.95),
        decision(ActionKind::Click, 0.95),
        decision(ActionKind::Extract, 0.95),
        decision(ActionKind::Done, 1.0),
    ];

    let browser = ScriptedBrowser::new(clean_outcome(url), executions);
    let engine = ScriptedEngine::new(decisions);

    let result = run_task(task(intent, url), browser, engine, NoopCallbacks)
        .await
        .unwrap();

    assert_eq!(result.status, TaskStatus::Done);
    assert_eq!(result.subtasks.len(), 5);
    assert_eq!(result.subtasks[3].attempt_count, 2);
    assert!(result.subtasks.iter().all(|s| s.status == pac_core::types::SubtaskStatus::Complete));

    let retry_events = result
        .subtask_status_timeline
        .iter()
        .filter(|e| matches!(e.reason, pac_core::events::SubtaskStatusReason::RetryFromCheckpoint))
        .count();
    assert_eq!(retry_events, 1);

    for idx in 0..3 {
        let verified = result
            .subtask_status_timeline
            .iter()
            .filter(|e| {
                e.subtask_id == result.subtasks[idx].id
                    && matches!(e.reason, pac_core::events::SubtaskStatusReason::Verified)
            })
            .count();
        assert_eq!(verified, 1, "subtask {idx} should verify exactly once");
    }
}
