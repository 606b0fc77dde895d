//! Tokenization and stopword helpers shared by subtask verification, the
//! decomposition heuristic, and DOM-bypass scoring.

use once_cell::sync::Lazy;
use std::collections::HashSet;

static STOPWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "the", "a", "an", "and", "or", "of", "to", "in", "on", "for", "with",
        "that", "this", "is", "are", "was", "were", "be", "been", "it",
        "its", "as", "at", "by", "from", "into", "then", "than", "but",
        "not", "you", "your", "my", "me", "i",
    ]
    .into_iter()
    .collect()
});

/// Lowercased, alphanumeric-run tokens with length >= 3 that are not
/// stopwords (spec.md §4.2, §4.5: "every >=3-character non-stopword
/// token").
pub fn significant_tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .filter(|t| t.len() >= 3 && !STOPWORDS.contains(t.as_str()))
        .collect()
}

/// All tokens (any length), lowercased, alphanumeric runs only — used to
/// detect keyword mentions such as "link" or "search" regardless of their
/// length.
pub fn all_tokens_lower(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

pub fn mentions(text: &str, word: &str) -> bool {
    all_tokens_lower(text).iter().any(|t| t == word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_stopwords_and_short_tokens() {
        let toks = significant_tokens("Click the big red button for checkout");
        assert_eq!(toks, vec!["click", "big", "red", "button", "checkout"]);
    }

    #[test]
    fn drops_tokens_under_three_chars() {
        let toks = significant_tokens("go to ui hub now");
        assert_eq!(toks, vec!["hub", "now"]);
    }

    #[test]
    fn detects_mentions() {
        assert!(mentions("click the search link", "search"));
        assert!(mentions("click the search link", "link"));
        assert!(!mentions("click the button", "search"));
    }
}
