//! C5 — Tiered Perception Policy (spec.md §4.5).
//!
//! Grounded on the teacher's `src/layered_perception/strategy.rs` (tier
//! selection via a small dispatch table rather than nested conditionals)
//! and `src/layered_perception/adaptive.rs` (a deterministic function over
//! task context that picks a mode), adapted from the teacher's four-tier
//! Lightning/Quick/Standard/Deep ladder into the spec's three-tier +
//! DOM-bypass ladder with escalation reasons instead of heuristic mode
//! selection.

use crate::config::constants::{
    BELOW_FOLD_MARGIN_FLOOR_PX, BELOW_FOLD_MARGIN_RATIO, DOM_BYPASS_MIN_SCORE,
    DOM_BYPASS_MIN_SCORE_GAP,
};
use crate::text::{mentions, significant_tokens};
use crate::types::{
    ActionKind, AxDeficiencySignals, BoundingBox, EscalationReason, InteractiveElement,
    NavigatorActionDecision, ReadyState, ScrollPositionSnapshot, Tier,
};

/// Decision reached by tier selection before the inference engine is
/// consulted.
#[derive(Debug, Clone)]
pub enum TierSelection {
    /// Run Tier 1 against the inference engine.
    RunTier1,
    /// Run Tier 2 directly, skipping Tier 1 (no-progress or AX-deficient
    /// escalation). DOM bypass (step 4) is attempted first, inside the
    /// Tier-2 path, per spec.md §4.5's "before T2, attempt DOM bypass".
    RunTier2 { reason: EscalationReason },
}

/// Step 1-2 of spec.md §4.5's ordered tier selection.
pub fn select_initial_tier(
    no_progress_streak: u32,
    ax_signals: &AxDeficiencySignals,
    ax_deficient_threshold: u32,
) -> TierSelection {
    if no_progress_streak > 0 && !is_ax_deficient(ax_signals, ax_deficient_threshold) {
        return TierSelection::RunTier2 {
            reason: EscalationReason::NoProgress,
        };
    }
    if is_ax_deficient(ax_signals, ax_deficient_threshold) {
        return TierSelection::RunTier2 {
            reason: EscalationReason::AxDeficient,
        };
    }
    TierSelection::RunTier1
}

pub fn is_ax_deficient(signals: &AxDeficiencySignals, threshold: u32) -> bool {
    signals.dom_interactive_candidate_count < threshold
        && signals.is_load_complete
        && signals.has_significant_visual_content
        && signals.ready_state == ReadyState::Complete
}

/// Step 3 of spec.md §4.5: accept Tier 1 iff confidence >= threshold and
/// the action isn't FAILED; otherwise pick the escalation reason.
pub fn evaluate_tier1(
    decision: &NavigatorActionDecision,
    confidence_threshold: f64,
) -> Result<(), EscalationReason> {
    if decision.action == ActionKind::Failed {
        return Err(EscalationReason::UnsafeAction);
    }
    if decision.confidence >= confidence_threshold {
        Ok(())
    } else {
        Err(EscalationReason::LowConfidence)
    }
}

/// One candidate scored by the DOM-bypass heuristic (spec.md §4.5 step 4).
struct ScoredElement<'a> {
    element: &'a crate::collaborators::DomElement,
    score: i32,
}

/// Attempts the deterministic DOM-bypass shortcut before escalating to
/// Tier 2. Returns `Some` iff the top-scoring element clears the min-score
/// and min-gap thresholds and has a positive-area bounding box.
pub fn try_dom_bypass(
    intent: &str,
    dom_elements: &[crate::collaborators::DomElement],
) -> Option<NavigatorActionDecision> {
    let intent_tokens = significant_tokens(intent);
    let intent_mentions_link = mentions(intent, "link");
    let intent_mentions_search = mentions(intent, "search") || mentions(intent, "find");

    let mut scored: Vec<ScoredElement> = dom_elements
        .iter()
        .map(|el| {
            let label = format!("{} {}", el.text, el.role.clone().unwrap_or_default());
            let label_tokens = significant_tokens(&label);
            let mut score = intent_tokens
                .iter()
                .filter(|t| label_tokens.contains(t))
                .count() as i32;
            if el.tag.eq_ignore_ascii_case("a") && intent_mentions_link {
                score += 1;
            }
            let is_input = el.tag.eq_ignore_ascii_case("input")
                || el
                    .role
                    .as_deref()
                    .map(|r| r.eq_ignore_ascii_case("textbox"))
                    .unwrap_or(false);
            if is_input && intent_mentions_search {
                score += 1;
            }
            ScoredElement { element: el, score }
        })
        .collect();

    scored.sort_by(|a, b| b.score.cmp(&a.score));

    let top = scored.first()?;
    let runner_up_score = scored.get(1).map(|e| e.score).unwrap_or(i32::MIN);

    if top.score < DOM_BYPASS_MIN_SCORE {
        return None;
    }
    if top.score - runner_up_score < DOM_BYPASS_MIN_SCORE_GAP {
        return None;
    }
    let bbox: &BoundingBox = top.element.bounding_box.as_ref()?;
    if !bbox.has_positive_area() {
        return None;
    }

    Some(NavigatorActionDecision {
        action: ActionKind::Click,
        target: Some(bbox.center()),
        text: None,
        confidence: 0.9,
        reasoning: "dom_bypass".to_string(),
    })
}

/// Whether the target "might be below the fold" (spec.md §4.5's Tier-3
/// trigger precondition).
pub fn might_be_below_fold(scroll: &ScrollPositionSnapshot, scroll_step_px: u32) -> bool {
    let margin = (scroll_step_px as f64 * BELOW_FOLD_MARGIN_RATIO).max(BELOW_FOLD_MARGIN_FLOOR_PX);
    scroll.remaining_scroll_px > margin
}

/// Whether Tier-3 scroll should trigger, given a Tier-2-resolved action
/// (spec.md §4.5).
pub fn should_trigger_tier3(
    action: &NavigatorActionDecision,
    confidence_threshold: f64,
    escalation_reason: Option<EscalationReason>,
    no_progress_streak: u32,
) -> bool {
    action.action == ActionKind::Scroll
        || action.action == ActionKind::Failed
        || action.confidence < confidence_threshold
        || (escalation_reason == Some(EscalationReason::NoProgress) && no_progress_streak >= 2)
}

/// Outcome of running the Tier-3 scroll step.
pub enum Tier3Outcome {
    Scrolled(NavigatorActionDecision),
    Aborted(NavigatorActionDecision),
}

/// spec.md §4.5's Tier-3 scroll fallback: abort with a deterministic FAILED
/// once `scroll_count >= max_scroll_steps`, else override with a
/// deterministic SCROLL.
pub fn run_tier3_scroll(scroll_count: u32, max_scroll_steps: u32, scroll_step_px: u32) -> Tier3Outcome {
    if scroll_count >= max_scroll_steps {
        Tier3Outcome::Aborted(NavigatorActionDecision {
            action: ActionKind::Failed,
            target: None,
            text: Some(format!("aborted after {scroll_count} scroll steps")),
            confidence: 1.0,
            reasoning: "tier3_scroll_budget_exhausted".to_string(),
        })
    } else {
        Tier3Outcome::Scrolled(NavigatorActionDecision {
            action: ActionKind::Scroll,
            target: None,
            text: Some(scroll_step_px.to_string()),
            confidence: 1.0,
            reasoning: "tier3_scroll".to_string(),
        })
    }
}

/// Confidence policy invariant (spec.md §4.5, §8 property 6): a Tier-1
/// resolution must carry confidence >= threshold. Violating this is a
/// programming error.
pub fn assert_confidence_policy(
    resolved_tier: Tier,
    decision: &NavigatorActionDecision,
    confidence_threshold: f64,
) -> crate::error::Result<()> {
    if resolved_tier == Tier::Tier1Ax && decision.confidence < confidence_threshold {
        return Err(crate::error::CoreError::ProgrammerError(format!(
            "Tier-1 resolution accepted confidence {} below threshold {}",
            decision.confidence, confidence_threshold
        )));
    }
    Ok(())
}
