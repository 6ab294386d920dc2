use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tally_core::{CategoryId, Transaction};
use tracing::{debug, trace};

use crate::matcher;
use crate::rule::{Rule, RuleDraft, RuleError, RuleId};
use crate::vendor::{VendorMapping, VendorMappings};

/// Outcome of categorizing one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Decision {
    /// The first rule in evaluation order matched.
    Rule {
        rule_id: RuleId,
        category: CategoryId,
        matched_text: String,
    },
    /// No rule matched; the transaction's vendor has a default category.
    Vendor {
        vendor_key: String,
        category: CategoryId,
    },
    NoMatch,
}

impl Decision {
    pub fn category(&self) -> Option<&CategoryId> {
        match self {
            Decision::Rule { category, .. } | Decision::Vendor { category, .. } => Some(category),
            Decision::NoMatch => None,
        }
    }

    pub fn is_match(&self) -> bool {
        !matches!(self, Decision::NoMatch)
    }

    /// Short provenance label: `rule:<id>`, `vendor` or `none`.
    pub fn source_label(&self) -> String {
        match self {
            Decision::Rule { rule_id, .. } => format!("rule:{rule_id}"),
            Decision::Vendor { .. } => "vendor".to_string(),
            Decision::NoMatch => "none".to_string(),
        }
    }

    /// Writes the decided category into `tx`. A no-match leaves it untouched.
    pub fn apply_to(&self, tx: &mut Transaction) {
        if let Some(category) = self.category() {
            tx.category = Some(category.clone());
        }
    }
}

/// One matching rule, as reported by [`RuleSet::find_all_matches`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleMatch {
    pub rule_id: RuleId,
    pub rule_name: String,
    pub priority: i32,
    pub category: CategoryId,
    pub matched_text: String,
}

/// Evaluation order: priority ascending, then rule id ascending.
fn evaluation_key(rule: &Rule) -> (i32, RuleId) {
    (rule.priority(), rule.id())
}

fn first_match<'a, I>(rules: I, tx: &Transaction) -> Option<Decision>
where
    I: IntoIterator<Item = &'a Rule>,
{
    rules.into_iter().find_map(|rule| {
        matcher::match_text(rule, tx).map(|matched_text| Decision::Rule {
            rule_id: rule.id(),
            category: rule.category().clone(),
            matched_text,
        })
    })
}

fn vendor_fallback(vendors: &VendorMappings, tx: &Transaction) -> Decision {
    tx.vendor
        .as_deref()
        .and_then(|vendor| {
            vendors.get(vendor).map(|category| Decision::Vendor {
                vendor_key: vendor.to_string(),
                category: category.clone(),
            })
        })
        .unwrap_or(Decision::NoMatch)
}

/// Resolves a category directly from caller-owned slices without building a
/// [`RuleSet`]. Same ordering and fallback as [`RuleSet::categorize`].
pub fn categorize(tx: &Transaction, rules: &[Rule], vendors: &VendorMappings) -> Decision {
    let mut enabled: Vec<&Rule> = rules.iter().filter(|r| r.enabled()).collect();
    enabled.sort_by_key(|r| evaluation_key(r));
    first_match(enabled, tx).unwrap_or_else(|| vendor_fallback(vendors, tx))
}

/// Immutable snapshot of rules and vendor mappings, ready for categorization.
///
/// Disabled rules are dropped at construction and the remainder is kept in
/// evaluation order, so categorizing is a linear scan that stops at the first
/// matching rule. First match wins; there is no notion of a better match.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
    vendors: VendorMappings,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>, vendors: VendorMappings) -> Result<Self, RuleError> {
        let mut seen = HashSet::with_capacity(rules.len());
        for rule in &rules {
            if !seen.insert(rule.id()) {
                return Err(RuleError::DuplicateRuleId(rule.id()));
            }
        }

        let total = rules.len();
        let mut active: Vec<Rule> = rules.into_iter().filter(Rule::enabled).collect();
        active.sort_by_key(evaluation_key);

        debug!(
            rules = active.len(),
            disabled = total - active.len(),
            vendors = vendors.len(),
            "Built rule set"
        );
        Ok(Self {
            rules: active,
            vendors,
        })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Parses a TOML rules file (see [`RuleFile`]) into a validated set.
    pub fn from_toml(toml_content: &str) -> Result<Self, RuleError> {
        RuleFile::from_toml(toml_content)?.into_rule_set()
    }

    /// Enabled rules in evaluation order.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn vendors(&self) -> &VendorMappings {
        &self.vendors
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.vendors.is_empty()
    }

    pub fn categorize(&self, tx: &Transaction) -> Decision {
        debug_assert!(
            self.rules.iter().all(Rule::enabled),
            "disabled rule inside a built RuleSet"
        );
        let decision =
            first_match(&self.rules, tx).unwrap_or_else(|| vendor_fallback(&self.vendors, tx));
        trace!(
            description = %tx.description,
            source = %decision.source_label(),
            "Categorized transaction"
        );
        decision
    }

    /// Decisions for each transaction, index-aligned with the input.
    pub fn categorize_all(&self, transactions: &[Transaction]) -> Vec<Decision> {
        transactions.iter().map(|tx| self.categorize(tx)).collect()
    }

    /// Every rule that matches `tx`, in evaluation order. The first entry is the
    /// rule [`RuleSet::categorize`] would pick.
    pub fn find_all_matches(&self, tx: &Transaction) -> Vec<RuleMatch> {
        self.rules
            .iter()
            .filter_map(|rule| {
                matcher::match_text(rule, tx).map(|matched_text| RuleMatch {
                    rule_id: rule.id(),
                    rule_name: rule.name().to_string(),
                    priority: rule.priority(),
                    category: rule.category().clone(),
                    matched_text,
                })
            })
            .collect()
    }
}

/// On-disk rules file.
///
/// ```toml
/// [[rules]]
/// id = 1
/// pattern_type = "contains"
/// pattern_value = "uber"
/// category = "Travel"
/// priority = 10
///
/// [[vendors]]
/// vendor_key = "ACME"
/// category = "Office Supplies"
/// ```
///
/// Rules without an `id` keep `None` after parsing so storage can assign one.
/// [`RuleFile::into_rule_set`] numbers them in file order with the lowest ids
/// not claimed by an explicit `id`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleFile {
    #[serde(default)]
    pub rules: Vec<RuleDraft>,
    #[serde(default)]
    pub vendors: Vec<VendorMapping>,
}

impl RuleFile {
    pub fn from_toml(toml_content: &str) -> Result<Self, RuleError> {
        toml::from_str(toml_content).map_err(|e| RuleError::Parse(e.to_string()))
    }

    /// Fills in missing ids, skipping every id written explicitly in the file.
    fn assign_ids(&mut self) {
        let taken: HashSet<RuleId> = self.rules.iter().filter_map(|d| d.id).collect();
        let mut next = 1;
        for draft in self.rules.iter_mut().filter(|d| d.id.is_none()) {
            while taken.contains(&RuleId(next)) {
                next += 1;
            }
            draft.id = Some(RuleId(next));
            next += 1;
        }
    }

    pub fn into_rule_set(mut self) -> Result<RuleSet, RuleError> {
        self.assign_ids();
        let rules = self
            .rules
            .into_iter()
            .map(Rule::validate)
            .collect::<Result<Vec<_>, _>>()?;
        let vendors = VendorMappings::from_mappings(self.vendors)?;
        RuleSet::new(rules, vendors)
    }
}
