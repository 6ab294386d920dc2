use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tally_core::{CategoryId, Money, Transaction};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub i64);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("Pattern must not be empty")]
    EmptyPattern,
    #[error("Invalid regex '{pattern}': {source}")]
    InvalidRegex {
        pattern: String,
        source: regex::Error,
    },
    #[error("Invalid amount range: min {min} is greater than max {max}")]
    InvalidAmountRange { min: Money, max: Money },
    #[error("Unknown pattern type: '{0}'")]
    UnknownPatternType(String),
    #[error("Rule has no id")]
    MissingId,
    #[error("Duplicate rule id: {0}")]
    DuplicateRuleId(RuleId),
    #[error("Vendor key must not be empty")]
    EmptyVendorKey,
    #[error("Transaction has no category to seed a rule from")]
    Uncategorized,
    #[error("Failed to parse rules file: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PatternType {
    #[default]
    Contains,
    Regex,
    Exact,
}

impl PatternType {
    pub fn as_str(self) -> &'static str {
        match self {
            PatternType::Contains => "contains",
            PatternType::Regex => "regex",
            PatternType::Exact => "exact",
        }
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PatternType {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "contains" => Ok(PatternType::Contains),
            "regex" => Ok(PatternType::Regex),
            "exact" => Ok(PatternType::Exact),
            other => Err(RuleError::UnknownPatternType(other.to_string())),
        }
    }
}

/// Compiled matching strategy. Text variants hold the pattern already folded
/// to lowercase; the regex variant holds the compiled expression, so a
/// `Pattern` can always be evaluated.
#[derive(Debug, Clone)]
pub enum Pattern {
    Contains(String),
    Regex(Regex),
    Exact(String),
}

impl Pattern {
    pub fn compile(pattern_type: PatternType, value: &str) -> Result<Pattern, RuleError> {
        if value.trim().is_empty() {
            return Err(RuleError::EmptyPattern);
        }
        match pattern_type {
            PatternType::Contains => Ok(Pattern::Contains(value.to_lowercase())),
            PatternType::Exact => Ok(Pattern::Exact(value.trim().to_lowercase())),
            PatternType::Regex => Regex::new(value)
                .map(Pattern::Regex)
                .map_err(|source| RuleError::InvalidRegex {
                    pattern: value.to_string(),
                    source,
                }),
        }
    }

    pub fn pattern_type(&self) -> PatternType {
        match self {
            Pattern::Contains(_) => PatternType::Contains,
            Pattern::Regex(_) => PatternType::Regex,
            Pattern::Exact(_) => PatternType::Exact,
        }
    }
}

/// Unvalidated rule in its interchange shape. This is what rule files,
/// storage rows and user input deserialize into; [`Rule::validate`] turns it
/// into a [`Rule`] or rejects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDraft {
    #[serde(default)]
    pub id: Option<RuleId>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub pattern_type: PatternType,
    pub pattern_value: String,
    #[serde(default)]
    pub amount_min: Option<Money>,
    #[serde(default)]
    pub amount_max: Option<Money>,
    pub category: CategoryId,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl RuleDraft {
    pub fn new(pattern_type: PatternType, pattern_value: &str, category: &str) -> Self {
        RuleDraft {
            id: None,
            name: String::new(),
            pattern_type,
            pattern_value: pattern_value.to_string(),
            amount_min: None,
            amount_max: None,
            category: CategoryId::new(category),
            priority: 0,
            enabled: true,
        }
    }

    /// Seeds a draft from a transaction the user has already categorized. The
    /// trimmed description becomes both the pattern and the name; regex
    /// patterns match it literally.
    pub fn from_transaction(
        tx: &Transaction,
        pattern_type: PatternType,
    ) -> Result<RuleDraft, RuleError> {
        let category = tx.category.clone().ok_or(RuleError::Uncategorized)?;
        let description = tx.description.trim();
        let pattern_value = match pattern_type {
            PatternType::Regex => regex::escape(description),
            PatternType::Contains | PatternType::Exact => description.to_string(),
        };
        Ok(RuleDraft {
            id: None,
            name: description.to_string(),
            pattern_type,
            pattern_value,
            amount_min: None,
            amount_max: None,
            category,
            priority: 0,
            enabled: true,
        })
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(RuleId(id));
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_amount_range(mut self, min: Option<Money>, max: Option<Money>) -> Self {
        self.amount_min = min;
        self.amount_max = max;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Checks every invariant except the id and returns the compiled pattern.
    /// Storage calls this before assigning an id.
    pub fn compile(&self) -> Result<Pattern, RuleError> {
        if let (Some(min), Some(max)) = (self.amount_min, self.amount_max) {
            if min > max {
                return Err(RuleError::InvalidAmountRange { min, max });
            }
        }
        Pattern::compile(self.pattern_type, &self.pattern_value)
    }
}

/// A validated categorization rule. Only constructible through
/// [`Rule::validate`], so every `Rule` has a non-empty, compiled pattern and
/// an ordered amount range.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RuleDraft", into = "RuleDraft")]
pub struct Rule {
    id: RuleId,
    name: String,
    pattern_value: String,
    pattern: Pattern,
    amount_min: Option<Money>,
    amount_max: Option<Money>,
    category: CategoryId,
    priority: i32,
    enabled: bool,
}

impl Rule {
    pub fn validate(draft: RuleDraft) -> Result<Rule, RuleError> {
        let id = draft.id.ok_or(RuleError::MissingId)?;
        let pattern = draft.compile()?;
        Ok(Rule {
            id,
            name: draft.name,
            pattern_value: draft.pattern_value,
            pattern,
            amount_min: draft.amount_min,
            amount_max: draft.amount_max,
            category: draft.category,
            priority: draft.priority,
            enabled: draft.enabled,
        })
    }

    pub fn id(&self) -> RuleId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    pub fn pattern_type(&self) -> PatternType {
        self.pattern.pattern_type()
    }

    /// The pattern as the user wrote it.
    pub fn pattern_value(&self) -> &str {
        &self.pattern_value
    }

    pub fn amount_min(&self) -> Option<Money> {
        self.amount_min
    }

    pub fn amount_max(&self) -> Option<Money> {
        self.amount_max
    }

    pub fn category(&self) -> &CategoryId {
        &self.category
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn to_draft(&self) -> RuleDraft {
        RuleDraft {
            id: Some(self.id),
            name: self.name.clone(),
            pattern_type: self.pattern_type(),
            pattern_value: self.pattern_value.clone(),
            amount_min: self.amount_min,
            amount_max: self.amount_max,
            category: self.category.clone(),
            priority: self.priority,
            enabled: self.enabled,
        }
    }
}

impl TryFrom<RuleDraft> for Rule {
    type Error = RuleError;

    fn try_from(draft: RuleDraft) -> Result<Self, Self::Error> {
        Rule::validate(draft)
    }
}

impl From<Rule> for RuleDraft {
    fn from(rule: Rule) -> Self {
        rule.to_draft()
    }
}
