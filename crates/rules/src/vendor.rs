use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tally_core::CategoryId;

use crate::rule::RuleError;

/// Default category for a vendor, consulted only when no rule matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorMapping {
    pub vendor_key: String,
    pub category: CategoryId,
}

impl VendorMapping {
    pub fn new(vendor_key: &str, category: &str) -> Self {
        VendorMapping {
            vendor_key: vendor_key.to_string(),
            category: CategoryId::new(category),
        }
    }
}

/// Vendor mappings keyed by exact vendor text. A key appears at most once;
/// inserting an existing key replaces its category (last write wins).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VendorMappings {
    by_key: BTreeMap<String, CategoryId>,
}

impl VendorMappings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from mappings in order; later duplicates overwrite earlier ones.
    pub fn from_mappings<I>(mappings: I) -> Result<Self, RuleError>
    where
        I: IntoIterator<Item = VendorMapping>,
    {
        let mut set = VendorMappings::new();
        for mapping in mappings {
            set.insert(mapping)?;
        }
        Ok(set)
    }

    /// Inserts or replaces a mapping, returning the one it replaced.
    pub fn insert(&mut self, mapping: VendorMapping) -> Result<Option<VendorMapping>, RuleError> {
        if mapping.vendor_key.trim().is_empty() {
            return Err(RuleError::EmptyVendorKey);
        }
        let previous = self
            .by_key
            .insert(mapping.vendor_key.clone(), mapping.category);
        Ok(previous.map(|category| VendorMapping {
            vendor_key: mapping.vendor_key,
            category,
        }))
    }

    pub fn remove(&mut self, vendor_key: &str) -> Option<VendorMapping> {
        self.by_key
            .remove_entry(vendor_key)
            .map(|(vendor_key, category)| VendorMapping { vendor_key, category })
    }

    pub fn get(&self, vendor_key: &str) -> Option<&CategoryId> {
        self.by_key.get(vendor_key)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Mappings sorted by vendor key.
    pub fn iter(&self) -> impl Iterator<Item = VendorMapping> + '_ {
        self.by_key.iter().map(|(k, c)| VendorMapping {
            vendor_key: k.clone(),
            category: c.clone(),
        })
    }
}
