//! C2 — Decomposition & Checkpoint Manager (spec.md §4.2).
//!
//! The splitting heuristic is grounded on the teacher's
//! `src/intelligent_action/command.rs` verb-keyed command dispatch (reused
//! here to classify each clause's leading verb) and
//! `src/layered_perception/adaptive.rs`'s `TaskType` taxonomy (reused to
//! pick a verification kind per clause).

use chrono::Utc;

use crate::text::{mentions, significant_tokens};
use crate::types::{
    ActionKind, CheckpointState, Subtask, SubtaskArtifact, SubtaskStatus, Tier, Verification,
    VerificationType,
};

/// Splits `intent` into an ordered, non-empty subtask list (spec.md §4.2).
/// A bare intent with no coordinating conjunction yields exactly one
/// subtask covering the whole intent.
pub fn decompose(intent: &str, task_id: &str) -> Vec<Subtask> {
    let clauses = split_clauses(intent);
    let now = Utc::now();
    clauses
        .iter()
        .enumerate()
        .map(|(i, clause)| {
            let verification = infer_verification(clause);
            let tokens = significant_tokens(clause);
            Subtask {
                id: format!("{task_id}-sub{i}"),
                intent: clause.trim().to_string(),
                verification,
                status: if i == 0 {
                    SubtaskStatus::InProgress
                } else {
                    SubtaskStatus::Pending
                },
                attempt_count: if i == 0 { 1 } else { 0 },
                completed_step: None,
                failed_step: None,
                last_updated_at: now,
                implied_step_count: (tokens.len() as u32 / 3).max(1),
            }
        })
        .collect()
}

fn split_clauses(intent: &str) -> Vec<String> {
    let normalized = intent
        .replace("and then", "\u{1}")
        .replace(", then", "\u{1}")
        .replace("then ", "\u{1}")
        .replace(';', "\u{1}");
    let clauses: Vec<String> = normalized
        .split('\u{1}')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if clauses.is_empty() {
        vec![intent.trim().to_string()]
    } else {
        clauses
    }
}

fn infer_verification(clause: &str) -> Verification {
    let lower = clause.to_lowercase();
    let leading_verb = lower.split_whitespace().next().unwrap_or("");

    let verification_type = if mentions(&lower, "go") || mentions(&lower, "navigate") || mentions(&lower, "open") {
        VerificationType::UrlMatches
    } else if mentions(&lower, "search")
        || mentions(&lower, "find")
        || mentions(&lower, "click")
        || mentions(&lower, "select")
    {
        VerificationType::ElementPresent
    } else if mentions(&lower, "extract") || mentions(&lower, "get") || mentions(&lower, "read") {
        VerificationType::DataExtracted
    } else if mentions(&lower, "confirm") || mentions(&lower, "submit") || mentions(&lower, "review") {
        if mentions(&lower, "review") {
            VerificationType::HumanReview
        } else {
            VerificationType::ActionConfirmed
        }
    } else {
        let _ = leading_verb;
        VerificationType::ActionConfirmed
    };

    let condition = match verification_type {
        VerificationType::UrlMatches => trailing_target(clause),
        VerificationType::ElementPresent => significant_tokens(clause).join(" "),
        _ => clause.trim().to_string(),
    };

    Verification {
        verification_type,
        condition,
    }
}

fn trailing_target(clause: &str) -> String {
    clause
        .split_whitespace()
        .last()
        .unwrap_or(clause)
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '.')
        .to_string()
}

/// Result of evaluating a subtask's verification predicate against a step's
/// observed action/execution (spec.md §4.2).
pub struct VerificationInputs<'a> {
    pub normalized_current_url: &'a str,
    pub navigation_observed: bool,
    pub interactive_labels: Vec<String>,
    pub dom_mutation_observed: bool,
    pub action: ActionKind,
    pub extracted_data_present: bool,
}

pub fn is_verified(verification: &Verification, inputs: &VerificationInputs) -> bool {
    match verification.verification_type {
        VerificationType::UrlMatches => {
            let cond = verification.condition.to_lowercase();
            inputs.normalized_current_url.to_lowercase().contains(&cond) || inputs.navigation_observed
        }
        VerificationType::ElementPresent => {
            let required = significant_tokens(&verification.condition);
            let satisfied_by_label = !required.is_empty()
                && inputs.interactive_labels.iter().any(|label| {
                    let label_tokens = significant_tokens(label);
                    required.iter().all(|t| label_tokens.contains(t))
                });
            satisfied_by_label || inputs.dom_mutation_observed
        }
        VerificationType::DataExtracted => {
            inputs.extracted_data_present || inputs.action == ActionKind::Extract
        }
        VerificationType::ActionConfirmed => {
            // Conservative reading (spec.md §9 open question): when the
            // step's action is WAIT, treat the predicate as unsatisfied
            // even if navigation or a DOM mutation also occurred.
            inputs.action != ActionKind::Wait
        }
        VerificationType::HumanReview => false,
    }
}

/// Manages subtask list + checkpoint together, matching spec.md §3's
/// invariants (at most one IN_PROGRESS, monotonically non-decreasing
/// checkpoint index, completed subtasks never re-run).
pub struct CheckpointManager {
    subtasks: Vec<Subtask>,
    checkpoint: CheckpointState,
    max_subtask_retries: u32,
}

pub enum VerifyOutcome {
    NotYet,
    Completed { index: usize },
}

pub enum RetryOutcome {
    Retried,
    Exhausted,
}

impl CheckpointManager {
    pub fn new(subtasks: Vec<Subtask>, max_subtask_retries: u32) -> Self {
        Self {
            subtasks,
            checkpoint: CheckpointState::default(),
            max_subtask_retries,
        }
    }

    pub fn subtasks(&self) -> &[Subtask] {
        &self.subtasks
    }

    pub fn checkpoint(&self) -> &CheckpointState {
        &self.checkpoint
    }

    pub fn active_index(&self) -> Option<usize> {
        self.subtasks
            .iter()
            .position(|s| s.status == SubtaskStatus::InProgress)
    }

    pub fn active_subtask(&self) -> Option<&Subtask> {
        self.active_index().map(|i| &self.subtasks[i])
    }

    /// Evaluates the active subtask's verification predicate; on
    /// satisfaction marks it COMPLETE, advances the checkpoint, resets the
    /// attempt counter, appends an artifact, and activates the next
    /// PENDING subtask (spec.md §4.2).
    pub fn verify_active(
        &mut self,
        inputs: &VerificationInputs,
        step: u32,
        completion_url: &str,
        resolved_tier: Tier,
        action: ActionKind,
    ) -> VerifyOutcome {
        let Some(idx) = self.active_index() else {
            return VerifyOutcome::NotYet;
        };
        if !is_verified(&self.subtasks[idx].verification, inputs) {
            return VerifyOutcome::NotYet;
        }

        self.subtasks[idx].status = SubtaskStatus::Complete;
        self.subtasks[idx].completed_step = Some(step);
        self.subtasks[idx].last_updated_at = Utc::now();

        self.checkpoint.last_completed_subtask_index =
            self.checkpoint.last_completed_subtask_index.max(idx as i64);
        self.checkpoint.current_subtask_attempt = 0;
        self.checkpoint.subtask_artifacts.push(SubtaskArtifact {
            subtask_id: self.subtasks[idx].id.clone(),
            step,
            completion_url: completion_url.to_string(),
            resolved_tier,
            action,
            timestamp: Utc::now(),
        });

        if let Some(next) = self.subtasks.iter_mut().find(|s| s.status == SubtaskStatus::Pending) {
            next.status = SubtaskStatus::InProgress;
            next.attempt_count += 1;
        }

        VerifyOutcome::Completed { index: idx }
    }

    /// On a step failure while a subtask is IN_PROGRESS: mark it FAILED,
    /// and if `attempt_count - 1 < max_subtask_retries`, flip it back to
    /// IN_PROGRESS with an incremented attempt count (spec.md §4.2).
    pub fn retry_from_checkpoint(&mut self, step: u32) -> RetryOutcome {
        let Some(idx) = self.active_index() else {
            return RetryOutcome::Exhausted;
        };
        self.subtasks[idx].status = SubtaskStatus::Failed;
        self.subtasks[idx].failed_step = Some(step);
        self.subtasks[idx].last_updated_at = Utc::now();

        if self.subtasks[idx].attempt_count - 1 < self.max_subtask_retries {
            self.subtasks[idx].attempt_count += 1;
            self.subtasks[idx].status = SubtaskStatus::InProgress;
            self.checkpoint.current_subtask_attempt = self.subtasks[idx].attempt_count;
            RetryOutcome::Retried
        } else {
            RetryOutcome::Exhausted
        }
    }

    /// On DONE: every non-complete subtask is marked COMPLETE with a
    /// synthetic artifact for the terminal step (spec.md §4.2).
    pub fn finalize_all_on_done(&mut self, step: u32, completion_url: &str, resolved_tier: Tier) {
        for s in self.subtasks.iter_mut() {
            if s.status != SubtaskStatus::Complete {
                s.status = SubtaskStatus::Complete;
                s.completed_step = Some(step);
                s.last_updated_at = Utc::now();
                self.checkpoint.subtask_artifacts.push(SubtaskArtifact {
                    subtask_id: s.id.clone(),
                    step,
                    completion_url: completion_url.to_string(),
                    resolved_tier,
                    action: ActionKind::Done,
                    timestamp: Utc::now(),
                });
            }
        }
        if !self.subtasks.is_empty() {
            self.checkpoint.last_completed_subtask_index =
                (self.subtasks.len() as i64 - 1).max(self.checkpoint.last_completed_subtask_index);
        }
    }

    pub fn mark_active_failed_terminal(&mut self, step: u32) {
        if let Some(idx) = self.active_index() {
            self.subtasks[idx].status = SubtaskStatus::Failed;
            self.subtasks[idx].failed_step = Some(step);
            self.subtasks[idx].last_updated_at = Utc::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_intent_yields_one_subtask_in_progress() {
        let subs = decompose("search for mechanical keyboards", "t1");
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].status, SubtaskStatus::InProgress);
    }

    #[test]
    fn conjunction_splits_into_ordered_subtasks() {
        let subs = decompose("go to the shop and then search for keyboards and then extract the price", "t1");
        assert!(subs.len() >= 2);
        assert_eq!(subs[0].status, SubtaskStatus::InProgress);
        assert!(subs[1..].iter().all(|s| s.status == SubtaskStatus::Pending));
    }

    #[test]
    fn wait_never_satisfies_action_confirmed() {
        let v = Verification {
            verification_type: VerificationType::ActionConfirmed,
            condition: "x".into(),
        };
        let inputs = VerificationInputs {
            normalized_current_url: "https://a",
            navigation_observed: true,
            interactive_labels: vec![],
            dom_mutation_observed: true,
            action: ActionKind::Wait,
            extracted_data_present: false,
        };
        assert!(!is_verified(&v, &inputs));
    }

    #[test]
    fn retry_bound_respects_max_subtask_retries() {
        let subs = decompose("click the button", "t1");
        let mut mgr = CheckpointManager::new(subs, 2);
        assert!(matches!(mgr.retry_from_checkpoint(1), RetryOutcome::Retried));
        assert_eq!(mgr.subtasks()[0].attempt_count, 2);
        assert!(matches!(mgr.retry_from_checkpoint(2), RetryOutcome::Retried));
        assert_eq!(mgr.subtasks()[0].attempt_count, 3);
        assert!(matches!(mgr.retry_from_checkpoint(3), RetryOutcome::Exhausted));
    }
}
