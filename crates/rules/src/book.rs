use std::sync::{Arc, PoisonError, RwLock};
use tally_core::Transaction;
use tracing::info;

use crate::engine::{Decision, RuleSet};

struct Current {
    version: u64,
    rules: Arc<RuleSet>,
}

/// Versioned handle to the active [`RuleSet`].
///
/// Editors publish a whole new snapshot with [`RuleBook::replace`]; readers
/// take an `Arc` to the current one and keep using it even if a newer set is
/// published mid-batch. The book never hands out mutable access to a snapshot.
pub struct RuleBook {
    current: RwLock<Current>,
}

impl RuleBook {
    pub fn new(rules: RuleSet) -> Self {
        RuleBook {
            current: RwLock::new(Current {
                version: 1,
                rules: Arc::new(rules),
            }),
        }
    }

    /// The current snapshot and its version.
    pub fn snapshot(&self) -> (u64, Arc<RuleSet>) {
        let current = self.current.read().unwrap_or_else(PoisonError::into_inner);
        (current.version, Arc::clone(&current.rules))
    }

    pub fn version(&self) -> u64 {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .version
    }

    /// Publishes `rules` as the new snapshot and returns its version.
    pub fn replace(&self, rules: RuleSet) -> u64 {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        current.version += 1;
        current.rules = Arc::new(rules);
        info!(version = current.version, rules = current.rules.len(), "Published rule set");
        current.version
    }

    pub fn categorize(&self, tx: &Transaction) -> Decision {
        self.snapshot().1.categorize(tx)
    }
}

impl Default for RuleBook {
    fn default() -> Self {
        Self::new(RuleSet::empty())
    }
}
