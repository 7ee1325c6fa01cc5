//! # Insight Matcher
//!
//! Reconciles free-text candidate labels produced by an unreliable AI
//! classifier against the closed, authoritative insight vocabulary. Pure
//! and total: the same inputs always yield the same output, which keeps
//! the surrounding validation pipeline replay-safe.

/// Reserved token meaning "no applicable category".
///
/// Protocol constant, never user data; it must not collide with a real
/// vocabulary entry.
pub const NO_INSIGHT: &str = "No insight";

/// Resolve a candidate label against the vocabulary.
///
/// Rules applied in strict order, first match wins:
/// 1. the [`NO_INSIGHT`] sentinel passes through unchanged;
/// 2. exact membership returns the candidate unchanged;
/// 3. case/whitespace-normalized equality returns the original-cased
///    vocabulary entry (first in vocabulary order);
/// 4. bidirectional normalized substring match, first in vocabulary
///    order;
/// 5. otherwise `None` - the candidate is dropped, never guessed at.
pub fn resolve(candidate: &str, vocabulary: &[String]) -> Option<String> {
    if candidate == NO_INSIGHT {
        return Some(NO_INSIGHT.to_string());
    }

    if vocabulary.iter().any(|entry| entry == candidate) {
        return Some(candidate.to_string());
    }

    let needle = normalize(candidate);
    if needle.is_empty() {
        // An empty needle would substring-match every entry
        return None;
    }

    if let Some(entry) = vocabulary.iter().find(|entry| normalize(entry) == needle) {
        return Some(entry.clone());
    }

    if let Some(entry) = vocabulary.iter().find(|entry| {
        let hay = normalize(entry);
        hay.contains(&needle) || needle.contains(&hay)
    }) {
        return Some(entry.clone());
    }

    tracing::debug!(candidate, "candidate label did not resolve, dropping");
    None
}

/// Map candidates through [`resolve`], discarding misses and the
/// sentinel. The result is the clean list of vocabulary-resolved labels
/// the rest of the system treats as ground truth.
pub fn sanitize(candidates: &[String], vocabulary: &[String]) -> Vec<String> {
    candidates
        .iter()
        .filter_map(|candidate| resolve(candidate, vocabulary))
        .filter(|label| label != NO_INSIGHT)
        .collect()
}

fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab() -> Vec<String> {
        vec![
            "Cannot schedule appointment".to_string(),
            "App crashes frequently".to_string(),
        ]
    }

    #[test]
    fn test_sentinel_passes_through() {
        assert_eq!(resolve(NO_INSIGHT, &vocab()).as_deref(), Some(NO_INSIGHT));
        assert_eq!(resolve(NO_INSIGHT, &[]).as_deref(), Some(NO_INSIGHT));
    }

    #[test]
    fn test_exact_membership_wins() {
        assert_eq!(
            resolve("App crashes frequently", &vocab()).as_deref(),
            Some("App crashes frequently")
        );
    }

    #[test]
    fn test_case_insensitive_match_returns_original_casing() {
        assert_eq!(
            resolve("cannot schedule appointment", &vocab()).as_deref(),
            Some("Cannot schedule appointment")
        );
    }

    #[test]
    fn test_whitespace_normalized_match() {
        assert_eq!(
            resolve("  App crashes frequently  ", &vocab()).as_deref(),
            Some("App crashes frequently")
        );
    }

    #[test]
    fn test_substring_fallback() {
        assert_eq!(
            resolve("App crashes", &vocab()).as_deref(),
            Some("App crashes frequently")
        );
    }

    #[test]
    fn test_reverse_substring_fallback() {
        assert_eq!(
            resolve("The App crashes frequently on startup", &vocab()).as_deref(),
            Some("App crashes frequently")
        );
    }

    #[test]
    fn test_unrelated_candidate_misses() {
        assert_eq!(resolve("Unrelated topic", &vocab()), None);
    }

    #[test]
    fn test_empty_candidate_does_not_match_everything() {
        assert_eq!(resolve("", &vocab()), None);
        assert_eq!(resolve("   ", &vocab()), None);
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let first = resolve("app CRASHES", &vocab());
        for _ in 0..10 {
            assert_eq!(resolve("app CRASHES", &vocab()), first);
        }
    }

    #[test]
    fn test_sanitize_drops_misses_and_sentinel() {
        let candidates = vec![
            "cannot schedule appointment".to_string(),
            NO_INSIGHT.to_string(),
            "Unrelated topic".to_string(),
            "App crashes".to_string(),
        ];
        assert_eq!(
            sanitize(&candidates, &vocab()),
            vec![
                "Cannot schedule appointment".to_string(),
                "App crashes frequently".to_string(),
            ]
        );
    }
}
