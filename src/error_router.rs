//! C6 — Structured Error Router (spec.md §4.6, §7).
//!
//! Grounded on the teacher's `src/error.rs` `BrowserError` taxonomy
//! (adapted here into a data struct rather than a Rust error type, since
//! `StructuredError` crosses into the inference engine as a payload) and
//! `src/events.rs`'s observer-pattern event dispatch for the timeline
//! append + callback invocation.

use crate::collaborators::{CollaboratorException, NavigationOutcome};
use crate::types::{ActionKind, DecisionSource, NavigatorActionDecision, StructuredError, StructuredErrorKind};

/// Builds the `StructuredError` for a navigation outcome (spec.md §4.6):
/// status >= 400 is NETWORK with retryable iff status >= 500; a transport
/// failure (no status, `error_text` present) is NETWORK with
/// retryable = true.
pub fn structured_error_from_navigation(outcome: &NavigationOutcome) -> Option<StructuredError> {
    if let Some(status) = outcome.status {
        if status >= 400 {
            return Some(StructuredError {
                kind: StructuredErrorKind::Network,
                status: Some(status),
                url: outcome.requested_url.clone(),
                message: outcome.status_text.clone(),
                retryable: status >= 500,
            });
        }
        return None;
    }
    if outcome.error_text.is_some() {
        return Some(StructuredError {
            kind: StructuredErrorKind::Network,
            status: None,
            url: outcome.requested_url.clone(),
            message: outcome
                .error_text
                .clone()
                .unwrap_or_else(|| "transport failure".to_string()),
            retryable: true,
        });
    }
    None
}

/// Maps a perception/action collaborator exception to a `StructuredError`
/// (spec.md §4.6): the underlying kind is used directly, defaulting to CDP.
pub fn structured_error_from_exception(url: &str, exc: &CollaboratorException) -> StructuredError {
    StructuredError {
        kind: exc.kind,
        status: exc.status,
        url: url.to_string(),
        message: exc.message.clone(),
        retryable: matches!(exc.kind, StructuredErrorKind::Network | StructuredErrorKind::Timeout),
    }
}

/// spec.md §4.6 step 4: the retryable-fallback policy. Given the engine's
/// decision (`None` is permitted on structured-error paths) and the error,
/// produce the decision to act on plus its source.
pub fn apply_retryable_fallback(
    engine_decision: Option<NavigatorActionDecision>,
    error: &StructuredError,
    prev_confidence: f64,
) -> (NavigatorActionDecision, DecisionSource) {
    let needs_fallback = match &engine_decision {
        None => error.retryable,
        Some(d) => error.retryable && d.action == ActionKind::Failed,
    };

    if needs_fallback {
        let decision = NavigatorActionDecision {
            action: ActionKind::Wait,
            target: None,
            text: Some("1000".to_string()),
            confidence: prev_confidence.max(0.5),
            reasoning: "policy_fallback_wait".to_string(),
        };
        (decision, DecisionSource::PolicyFallback)
    } else {
        let decision = engine_decision.unwrap_or(NavigatorActionDecision {
            action: ActionKind::Failed,
            target: None,
            text: None,
            confidence: 0.0,
            reasoning: "no_decision_non_retryable".to_string(),
        });
        (decision, DecisionSource::Navigator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(status: Option<i32>, error_text: Option<&str>) -> NavigationOutcome {
        NavigationOutcome {
            requested_url: "https://x.test".into(),
            final_url: "https://x.test".into(),
            status,
            status_text: "err".into(),
            error_text: error_text.map(|s| s.to_string()),
        }
    }

    #[test]
    fn status_503_is_retryable_network() {
        let err = structured_error_from_navigation(&outcome(Some(503), None)).unwrap();
        assert_eq!(err.kind, StructuredErrorKind::Network);
        assert!(err.retryable);
    }

    #[test]
    fn status_404_is_not_retryable() {
        let err = structured_error_from_navigation(&outcome(Some(404), None)).unwrap();
        assert_eq!(err.kind, StructuredErrorKind::Network);
        assert!(!err.retryable);
    }

    #[test]
    fn transport_failure_is_retryable() {
        let err = structured_error_from_navigation(&outcome(None, Some("dns failure"))).unwrap();
        assert!(err.retryable);
    }

    #[test]
    fn fallback_kicks_in_when_engine_returns_none_and_retryable() {
        let err = StructuredError {
            kind: StructuredErrorKind::Network,
            status: Some(503),
            url: "u".into(),
            message: "m".into(),
            retryable: true,
        };
        let (decision, source) = apply_retryable_fallback(None, &err, 0.3);
        assert_eq!(decision.action, ActionKind::Wait);
        assert_eq!(decision.confidence, 0.5);
        assert_eq!(source, DecisionSource::PolicyFallback);
    }

    #[test]
    fn no_fallback_when_not_retryable() {
        let err = StructuredError {
            kind: StructuredErrorKind::Network,
            status: Some(404),
            url: "u".into(),
            message: "m".into(),
            retryable: false,
        };
        let (decision, source) = apply_retryable_fallback(None, &err, 0.3);
        assert_eq!(decision.action, ActionKind::Failed);
        assert_eq!(source, DecisionSource::Navigator);
    }
}
