use std::collections::BTreeSet;

/// Lowercases, strips punctuation, and collapses whitespace so that
/// "TESCO STORES 123" and "tesco  stores, 123" compare equal.
pub fn normalize_description(s: &str) -> String {
    s.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn token_set(s: &str) -> BTreeSet<String> {
    normalize_description(s)
        .split_whitespace()
        .map(|w| w.to_string())
        .collect()
}

/// Token-set Jaccard similarity scaled to 0-100. Two empty sets score 0.
pub fn jaccard_score(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    100.0 * intersection as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_case_punctuation_whitespace() {
        assert_eq!(
            normalize_description("  TESCO  STORES, 123! "),
            "tesco stores 123"
        );
        assert_eq!(normalize_description("Tesco Stores"), "tesco stores");
    }

    #[test]
    fn normalize_empty_and_punctuation_only() {
        assert_eq!(normalize_description(""), "");
        assert_eq!(normalize_description("***"), "");
    }

    #[test]
    fn jaccard_identical_nonempty_is_100() {
        let a = token_set("tesco stores 123");
        assert_eq!(jaccard_score(&a, &a), 100.0);
    }

    #[test]
    fn jaccard_disjoint_is_0() {
        let a = token_set("tesco");
        let b = token_set("starbucks");
        assert_eq!(jaccard_score(&a, &b), 0.0);
    }

    #[test]
    fn jaccard_within_bounds() {
        let a = token_set("amazon marketplace eu");
        let b = token_set("amazon prime");
        let s = jaccard_score(&a, &b);
        assert!(s > 0.0 && s < 100.0, "score was {s}");
        // |{amazon}| / |{amazon, marketplace, eu, prime}| = 1/4
        assert_eq!(s, 25.0);
    }

    #[test]
    fn jaccard_empty_sets_is_0() {
        let e = token_set("");
        assert_eq!(jaccard_score(&e, &e), 0.0);
    }

    #[test]
    fn token_set_deduplicates() {
        let a = token_set("uber uber trip");
        assert_eq!(a.len(), 2);
    }
}
