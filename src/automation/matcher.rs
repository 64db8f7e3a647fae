//! Rule matching predicates and reply-variant rotation.

use rand::Rng;
use regex::RegexBuilder;

use crate::shared::models::{AutomationRule, MatchStrategy};

/// Evaluates a rule's keyword list against event text. An empty keyword
/// list matches unconditionally (catch-all rules). Comparison is
/// lowercase; a regex that fails to compile counts as no match.
pub fn keywords_match(keywords: &[String], strategy: MatchStrategy, text: &str) -> bool {
    if keywords.is_empty() {
        return true;
    }
    let lowered = text.trim().to_lowercase();
    keywords.iter().any(|keyword| {
        let needle = keyword.trim().to_lowercase();
        match strategy {
            MatchStrategy::Exact => lowered == needle,
            MatchStrategy::Contains => lowered.contains(&needle),
            MatchStrategy::StartsWith => lowered.starts_with(&needle),
            MatchStrategy::Regex => RegexBuilder::new(keyword)
                .case_insensitive(true)
                .build()
                .map(|re| re.is_match(text))
                .unwrap_or(false),
        }
    })
}

pub fn rule_matches(rule: &AutomationRule, text: &str) -> bool {
    let strategy = rule
        .match_strategy
        .parse()
        .unwrap_or(MatchStrategy::Contains);
    keywords_match(&rule.keywords, strategy, text)
}

/// Picks a reply variant index, never repeating the previous one when more
/// than one variant exists. Returns the chosen index together with the
/// text so the caller can persist the rotation state.
pub fn pick_variant(variants: &[String], last_index: Option<i32>) -> Option<(i32, String)> {
    if variants.is_empty() {
        return None;
    }
    if variants.len() == 1 {
        return Some((0, variants[0].clone()));
    }

    let last = last_index
        .map(|i| i as usize)
        .filter(|i| *i < variants.len());
    let candidates: Vec<usize> = (0..variants.len())
        .filter(|i| Some(*i) != last)
        .collect();

    let mut rng = rand::rng();
    let index = candidates[rng.random_range(0..candidates.len())];
    Some((index as i32, variants[index].clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn rule(keywords: &[&str], strategy: &str, priority: i32) -> AutomationRule {
        AutomationRule {
            id: Uuid::new_v4(),
            creator_id: Uuid::new_v4(),
            trigger_type: "dm_keyword".into(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            match_strategy: strategy.into(),
            priority,
            reply_text: Some("reply".into()),
            reply_variants: serde_json::json!([]),
            last_variant_index: None,
            follow_required: false,
            follow_prompt: None,
            follow_expiry_hours: 24,
            dedup_window: "never".into(),
            is_active: true,
            trigger_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn empty_keywords_match_anything() {
        let r = rule(&[], "exact", 0);
        assert!(rule_matches(&r, "whatever"));
        assert!(rule_matches(&r, ""));
    }

    #[test]
    fn exact_is_case_insensitive_equality() {
        let r = rule(&["price"], "exact", 0);
        assert!(rule_matches(&r, "PRICE"));
        assert!(rule_matches(&r, "  price "));
        assert!(!rule_matches(&r, "price please"));
    }

    #[test]
    fn contains_and_starts_with() {
        let contains = rule(&["link"], "contains", 0);
        assert!(rule_matches(&contains, "send me the LINK please"));
        assert!(!rule_matches(&contains, "nothing here"));

        let prefix = rule(&["hey"], "starts_with", 0);
        assert!(rule_matches(&prefix, "Hey there"));
        assert!(!rule_matches(&prefix, "oh hey"));
    }

    #[test]
    fn regex_strategy_matches_case_insensitively() {
        let r = rule(&[r"pric(e|ing)\b"], "regex", 0);
        assert!(rule_matches(&r, "What's your PRICING?"));
        assert!(!rule_matches(&r, "priceless"));
    }

    #[test]
    fn broken_regex_never_matches_and_never_panics() {
        let r = rule(&["(unclosed"], "regex", 0);
        assert!(!rule_matches(&r, "(unclosed"));
    }

    #[test]
    fn priority_order_is_preserved_by_scan() {
        // The service scans rules pre-sorted by priority descending and
        // fires the first match; verify the scan picks the head.
        let high = rule(&["deal"], "contains", 50);
        let low = rule(&["deal"], "contains", 1);
        let sorted = vec![high.clone(), low];
        let winner = sorted.iter().find(|r| rule_matches(r, "deal me in"));
        assert_eq!(winner.map(|r| r.id), Some(high.id));
    }

    #[test]
    fn single_variant_is_stable() {
        let variants = vec!["only".to_string()];
        for _ in 0..5 {
            assert_eq!(pick_variant(&variants, Some(0)), Some((0, "only".into())));
        }
    }

    #[test]
    fn rotation_never_repeats_previous_index() {
        let variants: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
        let mut last = None;
        for _ in 0..100 {
            let (index, _) = pick_variant(&variants, last).unwrap();
            assert_ne!(Some(index), last);
            last = Some(index);
        }
    }

    #[test]
    fn stale_last_index_is_ignored() {
        let variants: Vec<String> = vec!["a".into(), "b".into()];
        // Out-of-range bookkeeping (variant list shrank) must not panic.
        let (index, _) = pick_variant(&variants, Some(9)).unwrap();
        assert!(index == 0 || index == 1);
    }
}
