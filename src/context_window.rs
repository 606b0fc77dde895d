//! C3 — Context Window Manager (spec.md §4.3).
//!
//! Grounded on the teacher's `src/layered_perception/mod.rs` `PerceptionCache`
//! bounded-collection-with-eviction shape, adapted from a size-bounded cache
//! into a size-bounded rolling history with deterministic archival
//! summarization rather than plain eviction.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::constants::{
    ARCHIVED_SUMMARY_OBSERVATION_TRUNCATE, ALERT_RING_BUFFER_LEN, PROMPT_TOKEN_ALERT_THRESHOLD,
    RECENT_PAIR_LIMIT, SUMMARY_CHAR_BUDGET,
};
use crate::events::PromptBudgetAlertEvent;
use crate::types::{ContextHistoryPair, Tier};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextWindowStats {
    pub recent_pair_count: usize,
    pub summarized_pair_count: usize,
    pub total_pair_count: usize,
    pub summary_char_count: usize,
    pub max_recent_pair_count: usize,
    pub summary_refresh_count: u32,
    pub max_prompt_char_count: u32,
    pub max_estimated_prompt_tokens: u64,
    pub token_alerts: Vec<PromptBudgetAlertEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub recent: Vec<ContextHistoryPair>,
    pub archived_summary: Option<String>,
    pub stats: ContextWindowStats,
}

pub struct ContextWindowManager {
    all_pairs: Vec<ContextHistoryPair>,
    archived_summary: Option<String>,
    last_summarized_count: usize,
    stats: ContextWindowStats,
}

impl ContextWindowManager {
    pub fn new() -> Self {
        Self {
            all_pairs: Vec::new(),
            archived_summary: None,
            last_summarized_count: 0,
            stats: ContextWindowStats::default(),
        }
    }

    pub fn append(&mut self, pair: ContextHistoryPair) {
        self.all_pairs.push(pair);
        self.refresh_summary_if_needed();
    }

    fn archived_count(&self) -> usize {
        self.all_pairs.len().saturating_sub(RECENT_PAIR_LIMIT)
    }

    fn refresh_summary_if_needed(&mut self) {
        let archived = self.archived_count();
        if archived == 0 {
            self.archived_summary = None;
            self.last_summarized_count = 0;
            return;
        }
        if archived == self.last_summarized_count {
            return;
        }
        self.archived_summary = Some(build_summary(&self.all_pairs[..archived]));
        self.last_summarized_count = archived;
        self.stats.summary_refresh_count += 1;
    }

    pub fn build_snapshot(&mut self) -> ContextSnapshot {
        self.refresh_summary_if_needed();
        let archived = self.archived_count();
        let recent: Vec<ContextHistoryPair> = self.all_pairs[archived..].to_vec();

        self.stats.recent_pair_count = recent.len();
        self.stats.summarized_pair_count = archived;
        self.stats.total_pair_count = self.all_pairs.len();
        self.stats.summary_char_count =
            self.archived_summary.as_ref().map(|s| s.len()).unwrap_or(0);
        self.stats.max_recent_pair_count = self.stats.max_recent_pair_count.max(recent.len());

        ContextSnapshot {
            recent,
            archived_summary: self.archived_summary.clone(),
            stats: self.stats.clone(),
        }
    }

    /// Records a prompt-budget sample and appends a ring-buffered token
    /// alert if `estimated_prompt_tokens` exceeds `threshold` (spec.md §4.3).
    pub fn record_prompt_budget(
        &mut self,
        step: u32,
        tier: Tier,
        prompt_char_count: u32,
        estimated_prompt_tokens: u64,
        threshold: u64,
    ) {
        self.stats.max_prompt_char_count = self.stats.max_prompt_char_count.max(prompt_char_count);
        self.stats.max_estimated_prompt_tokens =
            self.stats.max_estimated_prompt_tokens.max(estimated_prompt_tokens);

        if estimated_prompt_tokens > threshold {
            self.stats.token_alerts.push(PromptBudgetAlertEvent {
                step,
                tier,
                prompt_char_count,
                estimated_prompt_tokens,
                threshold,
                timestamp: chrono::Utc::now(),
            });
            if self.stats.token_alerts.len() > ALERT_RING_BUFFER_LEN {
                let drop = self.stats.token_alerts.len() - ALERT_RING_BUFFER_LEN;
                self.stats.token_alerts.drain(0..drop);
            }
        }
    }

    pub fn default_prompt_token_threshold() -> u64 {
        PROMPT_TOKEN_ALERT_THRESHOLD
    }
}

impl Default for ContextWindowManager {
    fn default() -> Self {
        Self::new()
    }
}

fn host_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_else(|| url.to_string())
}

/// Three-sentence deterministic summary of archived pairs (spec.md §4.3):
/// (a) archived step range + distinct hosts, (b) action-mix histogram
/// sorted by frequency, (c) latest archived observation (truncated).
fn build_summary(archived: &[ContextHistoryPair]) -> String {
    let first_step = archived.first().map(|p| p.step).unwrap_or(0);
    let last_step = archived.last().map(|p| p.step).unwrap_or(0);

    let mut hosts: Vec<String> = Vec::new();
    for p in archived {
        let h = host_of(&p.url);
        if !hosts.contains(&h) {
            hosts.push(h);
        }
    }
    let sentence_a = format!(
        "Steps {}-{} covered {} distinct host{}: {}.",
        first_step,
        last_step,
        hosts.len(),
        if hosts.len() == 1 { "" } else { "s" },
        hosts.join(", ")
    );

    let mut counts: HashMap<&'static str, u32> = HashMap::new();
    for p in archived {
        *counts.entry(action_label(p.action.action)).or_insert(0) += 1;
    }
    let mut histogram: Vec<(&'static str, u32)> = counts.into_iter().collect();
    histogram.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    let histogram_str = histogram
        .iter()
        .map(|(name, count)| format!("{name}={count}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sentence_b = format!("Action mix: {histogram_str}.");

    let latest_observation = archived
        .last()
        .map(|p| truncate(&p.observation, ARCHIVED_SUMMARY_OBSERVATION_TRUNCATE))
        .unwrap_or_default();
    let sentence_c = format!("Latest archived observation: {latest_observation}");

    let full = format!("{sentence_a} {sentence_b} {sentence_c}");
    truncate(&full, SUMMARY_CHAR_BUDGET)
}

fn action_label(action: crate::types::ActionKind) -> &'static str {
    use crate::types::ActionKind::*;
    match action {
        Click => "CLICK",
        Type => "TYPE",
        Scroll => "SCROLL",
        Wait => "WAIT",
        Extract => "EXTRACT",
        PressKey => "PRESS_KEY",
        Done => "DONE",
        Failed => "FAILED",
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}

/// Recent window contents formatted into `(actions, observations)` for the
/// observation sent to the inference engine, in order.
pub fn recent_actions_and_observations(
    recent: &[ContextHistoryPair],
) -> (Vec<String>, Vec<String>) {
    let actions = recent
        .iter()
        .map(|p| format!("{:?}", p.action.action))
        .collect();
    let observations = recent.iter().map(|p| p.observation.clone()).collect();
    (actions, observations)
}
