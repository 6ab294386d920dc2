use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::category::CategoryId;
use super::money::Money;

/// A bank-feed transaction as seen by the categorizer.
///
/// `category` is the only field written after import, and only by the caller
/// applying a decision; the rule engine reads transactions and never mutates them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub description: String,
    pub amount: Money,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub category: Option<CategoryId>,
}

impl Transaction {
    pub fn new(description: impl Into<String>, amount: Money) -> Self {
        Transaction {
            description: description.into(),
            amount,
            vendor: None,
            date: None,
            category: None,
        }
    }

    pub fn with_vendor(mut self, vendor: impl Into<String>) -> Self {
        let vendor = vendor.into();
        self.vendor = if vendor.trim().is_empty() { None } else { Some(vendor) };
        self
    }

    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }

    pub fn is_categorized(&self) -> bool {
        self.category.is_some()
    }
}
