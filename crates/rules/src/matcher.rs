//! Single rule against single transaction.
//!
//! A rule applies when both gates pass: the amount gate (inclusive, signed,
//! each bound optional) and the pattern gate for its [`Pattern`] variant.
//! Text patterns compare case-insensitively by lowercasing both sides.
//! Regex patterns search the raw description and are case-sensitive unless
//! the expression opts in with `(?i)`.

use tally_core::{Money, Transaction};

use crate::rule::{Pattern, Rule};

/// True when `rule` applies to `tx`. Disabled rules never apply.
pub fn matches(rule: &Rule, tx: &Transaction) -> bool {
    if !rule.enabled() {
        return false;
    }
    amount_in_range(rule, tx.amount) && rule.pattern().is_match(&tx.description)
}

/// Like [`matches`], but returns the text that satisfied the pattern gate.
/// Contains rules report their pattern as written rather than the folded needle.
pub fn match_text(rule: &Rule, tx: &Transaction) -> Option<String> {
    if !rule.enabled() || !amount_in_range(rule, tx.amount) {
        return None;
    }
    match rule.pattern() {
        Pattern::Contains(needle) => contains_match(needle, &tx.description)
            .then(|| rule.pattern_value().to_string()),
        pattern => pattern.find(&tx.description),
    }
}

pub fn amount_in_range(rule: &Rule, amount: Money) -> bool {
    if let Some(min) = rule.amount_min() {
        if amount < min {
            return false;
        }
    }
    if let Some(max) = rule.amount_max() {
        if amount > max {
            return false;
        }
    }
    true
}

impl Pattern {
    pub fn is_match(&self, description: &str) -> bool {
        match self {
            Pattern::Contains(needle) => contains_match(needle, description),
            Pattern::Regex(re) => re.is_match(description),
            Pattern::Exact(value) => exact_match(value, description),
        }
    }

    /// The contains needle, the trimmed description for exact patterns, or the
    /// leftmost regex match.
    pub fn find(&self, description: &str) -> Option<String> {
        match self {
            Pattern::Contains(needle) => {
                contains_match(needle, description).then(|| needle.clone())
            }
            Pattern::Regex(re) => re.find(description).map(|m| m.as_str().to_string()),
            Pattern::Exact(value) => {
                exact_match(value, description).then(|| description.trim().to_string())
            }
        }
    }
}

fn contains_match(needle: &str, description: &str) -> bool {
    description.to_lowercase().contains(needle)
}

fn exact_match(value: &str, description: &str) -> bool {
    description.trim().to_lowercase() == value
}
