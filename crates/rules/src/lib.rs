pub mod book;
pub mod engine;
pub mod matcher;
pub mod rule;
pub mod vendor;

pub use book::RuleBook;
pub use engine::{categorize, Decision, RuleFile, RuleMatch, RuleSet};
pub use matcher::matches;
pub use rule::{Pattern, PatternType, Rule, RuleDraft, RuleError, RuleId};
pub use vendor::{VendorMapping, VendorMappings};
