use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Opaque category key. Rules and vendor mappings carry it as a foreign key;
/// nothing in the rule engine checks that it exists.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CategoryId(pub String);

impl CategoryId {
    pub fn new(id: impl Into<String>) -> Self {
        CategoryId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CategoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CategoryId {
    fn from(s: &str) -> Self {
        CategoryId(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: CategoryId,
    pub name: String,
    #[serde(default)]
    pub parent: Option<CategoryId>,
    #[serde(default = "default_visible")]
    pub visible: bool,
}

fn default_visible() -> bool {
    true
}

impl Category {
    pub fn new(id: &str, name: &str) -> Self {
        Category {
            id: CategoryId::new(id),
            name: name.to_string(),
            parent: None,
            visible: true,
        }
    }

    pub fn with_parent(mut self, parent: &str) -> Self {
        self.parent = Some(CategoryId::new(parent));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CategoryError {
    #[error("Category already exists: {0}")]
    Duplicate(CategoryId),
    #[error("Parent category not found: {0}")]
    UnknownParent(CategoryId),
    #[error("Category not found: {0}")]
    NotFound(CategoryId),
    #[error("Category id must not be empty")]
    EmptyId,
}

/// Single source of truth for the category list.
///
/// Every mutation bumps `version`; consumers that cache derived views (pickers,
/// name lookups) compare the version they built from and re-read on mismatch.
#[derive(Debug, Clone, Default)]
pub struct CategoryStore {
    categories: BTreeMap<CategoryId, Category>,
    version: u64,
}

impl CategoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    /// Adds a category and returns the new store version.
    /// A parent must be added before its children.
    pub fn add(&mut self, category: Category) -> Result<u64, CategoryError> {
        if category.id.as_str().trim().is_empty() {
            return Err(CategoryError::EmptyId);
        }
        if self.categories.contains_key(&category.id) {
            return Err(CategoryError::Duplicate(category.id));
        }
        if let Some(parent) = &category.parent {
            if !self.categories.contains_key(parent) {
                return Err(CategoryError::UnknownParent(parent.clone()));
            }
        }
        self.categories.insert(category.id.clone(), category);
        self.version += 1;
        Ok(self.version)
    }

    pub fn set_visible(&mut self, id: &CategoryId, visible: bool) -> Result<u64, CategoryError> {
        let category = self
            .categories
            .get_mut(id)
            .ok_or_else(|| CategoryError::NotFound(id.clone()))?;
        if category.visible != visible {
            category.visible = visible;
            self.version += 1;
        }
        Ok(self.version)
    }

    pub fn get(&self, id: &CategoryId) -> Option<&Category> {
        self.categories.get(id)
    }

    pub fn contains(&self, id: &CategoryId) -> bool {
        self.categories.contains_key(id)
    }

    pub fn all(&self) -> impl Iterator<Item = &Category> {
        self.categories.values()
    }

    pub fn visible(&self) -> impl Iterator<Item = &Category> {
        self.categories.values().filter(|c| c.visible)
    }

    pub fn children<'a>(&'a self, parent: &'a CategoryId) -> impl Iterator<Item = &'a Category> {
        self.categories
            .values()
            .filter(move |c| c.parent.as_ref() == Some(parent))
    }

    /// Colon-separated path from the root, e.g. `Travel:Rideshare`.
    pub fn full_name(&self, id: &CategoryId) -> Option<String> {
        let mut parts = Vec::new();
        let mut current = self.categories.get(id)?;
        loop {
            parts.push(current.name.as_str());
            match current.parent.as_ref().and_then(|p| self.categories.get(p)) {
                // Parents are inserted first, so the chain always terminates.
                Some(parent) => current = parent,
                None => break,
            }
        }
        parts.reverse();
        Some(parts.join(":"))
    }
}

impl FromIterator<Category> for CategoryStore {
    /// Builds a store from categories in any order; entries whose parent is
    /// missing are kept as roots.
    fn from_iter<I: IntoIterator<Item = Category>>(iter: I) -> Self {
        let mut pending: Vec<Category> = iter.into_iter().collect();
        let mut store = CategoryStore::new();
        loop {
            let before = pending.len();
            pending.retain(|c| match store.add(c.clone()) {
                Ok(_) => false,
                Err(CategoryError::UnknownParent(_)) => true,
                Err(_) => false,
            });
            if pending.is_empty() || pending.len() == before {
                break;
            }
        }
        for mut orphan in pending {
            orphan.parent = None;
            let _ = store.add(orphan);
        }
        store
    }
}
