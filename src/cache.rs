//! C4 — Observation Cache (spec.md §4.4).
//!
//! Grounded directly on the teacher's `src/layered_perception/mod.rs`
//! `PerceptionCache`: a single-TTL, insertion-timestamped map with lazy
//! eviction on lookup. Adapted from a size-bounded LRU-ish cache keyed by
//! `"url:mode"` into the spec's three parallel cache kinds (perception,
//! decision, tier-2 screenshot) keyed by URL or `(url, tier|reason)`, with
//! eager invalidation added per §4.4's trigger contract.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::types::PerceptionPayload;

#[derive(Debug, Clone)]
struct Entry<T> {
    value: T,
    inserted_at_ms: u64,
}

#[derive(Clone)]
pub struct Tier2Screenshot {
    pub base64: String,
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
}

pub struct ObservationCache {
    ttl_ms: u64,
    perception: HashMap<String, Entry<PerceptionPayload>>,
    decisions: HashMap<String, Entry<crate::types::NavigatorActionDecision>>,
    screenshots: HashMap<String, Entry<Tier2Screenshot>>,
    pub stats: crate::types::ObservationCacheStats,
}

pub struct PerceptionHit {
    pub payload: PerceptionPayload,
    pub age_ms: u64,
}

fn decision_key(url: &str, tier: crate::types::Tier, reason: Option<crate::types::EscalationReason>) -> String {
    let reason_str = reason.map(|r| r.as_key_str()).unwrap_or("NONE");
    format!("{url}\u{0}{tier:?}|{reason_str}")
}

impl ObservationCache {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            ttl_ms,
            perception: HashMap::new(),
            decisions: HashMap::new(),
            screenshots: HashMap::new(),
            stats: Default::default(),
        }
    }

    pub fn ax_tree_hash(tree_json: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(tree_json.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn get_perception(&mut self, url: &str, now_ms: u64) -> Option<PerceptionHit> {
        let expired = self
            .perception
            .get(url)
            .map(|e| now_ms.saturating_sub(e.inserted_at_ms) > self.ttl_ms)
            .unwrap_or(false);
        if expired {
            self.perception.remove(url);
        }
        let hit = self.perception.get(url).map(|e| PerceptionHit {
            payload: e.value.clone(),
            age_ms: now_ms.saturating_sub(e.inserted_at_ms),
        });
        if hit.is_some() {
            self.stats.perception_hits += 1;
        } else {
            self.stats.perception_misses += 1;
        }
        hit
    }

    pub fn set_perception(&mut self, url: &str, payload: PerceptionPayload, now_ms: u64) {
        self.perception.insert(
            url.to_string(),
            Entry {
                value: payload,
                inserted_at_ms: now_ms,
            },
        );
    }

    pub fn get_decision(
        &mut self,
        url: &str,
        tier: crate::types::Tier,
        reason: Option<crate::types::EscalationReason>,
        now_ms: u64,
    ) -> Option<crate::types::NavigatorActionDecision> {
        let key = decision_key(url, tier, reason);
        let expired = self
            .decisions
            .get(&key)
            .map(|e| now_ms.saturating_sub(e.inserted_at_ms) > self.ttl_ms)
            .unwrap_or(false);
        if expired {
            self.decisions.remove(&key);
        }
        let hit = self.decisions.get(&key).map(|e| e.value.clone());
        if hit.is_some() {
            self.stats.decision_hits += 1;
        } else {
            self.stats.decision_misses += 1;
        }
        hit
    }

    pub fn set_decision(
        &mut self,
        url: &str,
        tier: crate::types::Tier,
        reason: Option<crate::types::EscalationReason>,
        decision: crate::types::NavigatorActionDecision,
        now_ms: u64,
    ) {
        let key = decision_key(url, tier, reason);
        self.decisions.insert(
            key,
            Entry {
                value: decision,
                inserted_at_ms: now_ms,
            },
        );
    }

    pub fn get_tier2_screenshot(&mut self, url: &str, now_ms: u64) -> Option<Tier2Screenshot> {
        let expired = self
            .screenshots
            .get(url)
            .map(|e| now_ms.saturating_sub(e.inserted_at_ms) > self.ttl_ms)
            .unwrap_or(false);
        if expired {
            self.screenshots.remove(url);
        }
        let hit = self.screenshots.get(url).cloned().map(|e| e.value);
        if hit.is_some() {
            self.stats.screenshot_hits += 1;
        } else {
            self.stats.screenshot_misses += 1;
        }
        hit
    }

    pub fn set_tier2_screenshot(&mut self, url: &str, shot: Tier2Screenshot, now_ms: u64) {
        self.screenshots.insert(
            url.to_string(),
            Entry {
                value: shot,
                inserted_at_ms: now_ms,
            },
        );
    }

    /// Lazily evicts every stale entry across all three maps.
    pub fn prune_expired(&mut self, now_ms: u64) {
        self.perception
            .retain(|_, e| now_ms.saturating_sub(e.inserted_at_ms) <= self.ttl_ms);
        self.decisions
            .retain(|_, e| now_ms.saturating_sub(e.inserted_at_ms) <= self.ttl_ms);
        self.screenshots
            .retain(|_, e| now_ms.saturating_sub(e.inserted_at_ms) <= self.ttl_ms);
    }

    /// Removes perception, every decision, and the screenshot for `url`
    /// (spec.md §4.4).
    pub fn invalidate(&mut self, url: &str) {
        let had_any = self.perception.remove(url).is_some();
        let prefix = format!("{url}\u{0}");
        let before = self.decisions.len();
        self.decisions.retain(|k, _| !k.starts_with(&prefix));
        let removed_decisions = before != self.decisions.len();
        let had_screenshot = self.screenshots.remove(url).is_some();
        if had_any || removed_decisions || had_screenshot {
            self.stats.invalidations += 1;
        }
    }
}

impl std::fmt::Debug for Tier2Screenshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tier2Screenshot")
            .field("mime_type", &self.mime_type)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AxDeficiencySignals, PerceptionPayload, ReadyState, ScrollPositionSnapshot};

    fn sample_payload() -> PerceptionPayload {
        PerceptionPayload {
            interactive_element_index: vec![],
            normalized_tree_encoding: "{}".into(),
            ax_deficiency_signals: AxDeficiencySignals {
                ready_state: ReadyState::Complete,
                is_load_complete: true,
                has_significant_visual_content: true,
                visible_element_count: 10,
                text_char_count: 100,
                media_element_count: 0,
                dom_interactive_candidate_count: 10,
            },
            scroll_position: ScrollPositionSnapshot {
                scroll_y: 0.0,
                viewport_height: 800.0,
                document_height: 800.0,
                remaining_scroll_px: 0.0,
            },
            ax_tree_hash: "abc".into(),
        }
    }

    #[test]
    fn perception_ttl_expiry() {
        let mut cache = ObservationCache::new(1_000);
        cache.set_perception("https://a", sample_payload(), 0);
        assert!(cache.get_perception("https://a", 500).is_some());
        assert!(cache.get_perception("https://a", 1_001).is_none());
    }

    #[test]
    fn prune_expired_sweeps_all_three_kinds() {
        let mut cache = ObservationCache::new(1_000);
        cache.set_perception("https://a", sample_payload(), 0);
        cache.set_decision(
            "https://a",
            crate::types::Tier::Tier1Ax,
            None,
            crate::types::NavigatorActionDecision {
                action: crate::types::ActionKind::Wait,
                target: None,
                text: None,
                confidence: 0.9,
                reasoning: "x".into(),
            },
            0,
        );
        cache.set_tier2_screenshot(
            "https://a",
            Tier2Screenshot {
                base64: "x".into(),
                mime_type: "image/png".into(),
                width: 10,
                height: 10,
            },
            0,
        );
        cache.set_perception("https://b", sample_payload(), 5_000);

        cache.prune_expired(5_000);

        assert_eq!(cache.perception.len(), 1);
        assert!(cache.decisions.is_empty());
        assert!(cache.screenshots.is_empty());
    }

    #[test]
    fn invalidate_clears_all_three_kinds() {
        let mut cache = ObservationCache::new(60_000);
        cache.set_perception("https://a", sample_payload(), 0);
        cache.set_decision(
            "https://a",
            crate::types::Tier::Tier1Ax,
            None,
            crate::types::NavigatorActionDecision {
                action: crate::types::ActionKind::Wait,
                target: None,
                text: None,
                confidence: 0.9,
                reasoning: "x".into(),
            },
            0,
        );
        cache.set_tier2_screenshot(
            "https://a",
            Tier2Screenshot {
                base64: "x".into(),
                mime_type: "image/png".into(),
                width: 10,
                height: 10,
            },
            0,
        );
        cache.invalidate("https://a");
        assert!(cache.get_perception("https://a", 0).is_none());
        assert!(cache
            .get_decision("https://a", crate::types::Tier::Tier1Ax, None, 0)
            .is_none());
        assert!(cache.get_tier2_screenshot("https://a", 0).is_none());
    }
}
