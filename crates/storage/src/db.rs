use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use tally_core::{Category, CategoryError, CategoryId, CategoryStore, Money};
use tally_rules::{
    PatternType, Rule, RuleDraft, RuleError, RuleId, RuleSet, VendorMapping, VendorMappings,
};
use thiserror::Error;
use tracing::{debug, info};

pub type DbPool = Pool<Sqlite>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Invalid rule: {0}")]
    Rule(#[from] RuleError),
    #[error("Invalid category: {0}")]
    Category(#[from] CategoryError),
    #[error("Corrupt {table} row {key}: {reason}")]
    CorruptRow {
        table: &'static str,
        key: String,
        reason: String,
    },
    #[error("Rule not found: {0}")]
    RuleNotFound(RuleId),
}

pub async fn create_db(path: &Path) -> Result<DbPool, StorageError> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&pool)
        .await?;

    run_migrations(&pool).await?;
    debug!("Opened database at {}", path.display());

    Ok(pool)
}

/// Private in-memory database. The single connection is never recycled, since
/// closing it would drop the data.
pub async fn create_memory_db() -> Result<DbPool, StorageError> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS categories (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            parent_id TEXT,
            is_visible INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Category ids are foreign keys by convention only; rules may reference
    // categories that have not been synced yet.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL DEFAULT '',
            pattern_type TEXT NOT NULL,
            pattern_value TEXT NOT NULL,
            amount_min TEXT,
            amount_max TEXT,
            category_id TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            is_enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_rules_enabled_priority ON rules(is_enabled, priority, id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vendor_mappings (
            vendor_key TEXT PRIMARY KEY,
            category_id TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

// ── Rules ─────────────────────────────────────────────────────────────────────

type RuleRow = (
    i64,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    i32,
    bool,
);

const RULE_COLUMNS: &str = "id, name, pattern_type, pattern_value, amount_min, amount_max, category_id, priority, is_enabled";

fn parse_amount(id: i64, raw: Option<String>) -> Result<Option<Money>, StorageError> {
    raw.map(|s| {
        s.parse::<Money>().map_err(|e| StorageError::CorruptRow {
            table: "rules",
            key: id.to_string(),
            reason: e.to_string(),
        })
    })
    .transpose()
}

fn row_to_rule(r: RuleRow) -> Result<Rule, StorageError> {
    let id = r.0;
    let pattern_type = PatternType::from_str(&r.2).map_err(|e| StorageError::CorruptRow {
        table: "rules",
        key: id.to_string(),
        reason: e.to_string(),
    })?;
    let draft = RuleDraft {
        id: Some(RuleId(id)),
        name: r.1,
        pattern_type,
        pattern_value: r.3,
        amount_min: parse_amount(id, r.4)?,
        amount_max: parse_amount(id, r.5)?,
        category: CategoryId(r.6),
        priority: r.7,
        enabled: r.8,
    };
    Ok(Rule::validate(draft)?)
}

fn amount_text(amount: Option<Money>) -> Option<String> {
    amount.map(|m| m.as_decimal().to_string())
}

/// Inserts the draft when it has no id, otherwise inserts or replaces the row
/// with that id. The draft is validated before anything is written.
pub async fn save_rule(pool: &DbPool, draft: &RuleDraft) -> Result<Rule, StorageError> {
    draft.compile()?;

    let id = match draft.id {
        None => {
            sqlx::query_scalar::<_, i64>(
                r#"
                INSERT INTO rules (name, pattern_type, pattern_value, amount_min, amount_max,
                                   category_id, priority, is_enabled)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                RETURNING id
                "#,
            )
            .bind(&draft.name)
            .bind(draft.pattern_type.as_str())
            .bind(&draft.pattern_value)
            .bind(amount_text(draft.amount_min))
            .bind(amount_text(draft.amount_max))
            .bind(draft.category.as_str())
            .bind(draft.priority)
            .bind(draft.enabled)
            .fetch_one(pool)
            .await?
        }
        Some(RuleId(id)) => {
            sqlx::query(
                r#"
                INSERT INTO rules (id, name, pattern_type, pattern_value, amount_min, amount_max,
                                   category_id, priority, is_enabled)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    pattern_type = excluded.pattern_type,
                    pattern_value = excluded.pattern_value,
                    amount_min = excluded.amount_min,
                    amount_max = excluded.amount_max,
                    category_id = excluded.category_id,
                    priority = excluded.priority,
                    is_enabled = excluded.is_enabled
                "#,
            )
            .bind(id)
            .bind(&draft.name)
            .bind(draft.pattern_type.as_str())
            .bind(&draft.pattern_value)
            .bind(amount_text(draft.amount_min))
            .bind(amount_text(draft.amount_max))
            .bind(draft.category.as_str())
            .bind(draft.priority)
            .bind(draft.enabled)
            .execute(pool)
            .await?;
            id
        }
    };

    get_rule_by_id(pool, RuleId(id))
        .await?
        .ok_or(StorageError::RuleNotFound(RuleId(id)))
}

pub async fn get_rule_by_id(pool: &DbPool, id: RuleId) -> Result<Option<Rule>, StorageError> {
    let row = sqlx::query_as::<_, RuleRow>(&format!("SELECT {RULE_COLUMNS} FROM rules WHERE id = ?"))
        .bind(id.0)
        .fetch_optional(pool)
        .await?;
    row.map(row_to_rule).transpose()
}

/// All rules, enabled or not, in evaluation order.
pub async fn get_all_rules(pool: &DbPool) -> Result<Vec<Rule>, StorageError> {
    let rows = sqlx::query_as::<_, RuleRow>(&format!(
        "SELECT {RULE_COLUMNS} FROM rules ORDER BY priority ASC, id ASC"
    ))
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(row_to_rule).collect()
}

pub async fn get_enabled_rules(pool: &DbPool) -> Result<Vec<Rule>, StorageError> {
    let rows = sqlx::query_as::<_, RuleRow>(&format!(
        "SELECT {RULE_COLUMNS} FROM rules WHERE is_enabled = 1 ORDER BY priority ASC, id ASC"
    ))
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(row_to_rule).collect()
}

/// Returns false when no rule has that id.
pub async fn set_rule_enabled(pool: &DbPool, id: RuleId, enabled: bool) -> Result<bool, StorageError> {
    let result = sqlx::query("UPDATE rules SET is_enabled = ? WHERE id = ?")
        .bind(enabled)
        .bind(id.0)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete_rule(pool: &DbPool, id: RuleId) -> Result<bool, StorageError> {
    let result = sqlx::query("DELETE FROM rules WHERE id = ?")
        .bind(id.0)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

// ── Vendor mappings ───────────────────────────────────────────────────────────

/// Upsert keyed by vendor text: saving an existing key replaces its category.
pub async fn save_vendor_mapping(pool: &DbPool, mapping: &VendorMapping) -> Result<(), StorageError> {
    if mapping.vendor_key.trim().is_empty() {
        return Err(RuleError::EmptyVendorKey.into());
    }
    sqlx::query(
        r#"
        INSERT INTO vendor_mappings (vendor_key, category_id) VALUES (?, ?)
        ON CONFLICT(vendor_key) DO UPDATE SET
            category_id = excluded.category_id,
            updated_at = datetime('now')
        "#,
    )
    .bind(&mapping.vendor_key)
    .bind(mapping.category.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_vendor_mapping(
    pool: &DbPool,
    vendor_key: &str,
) -> Result<Option<VendorMapping>, StorageError> {
    let row = sqlx::query_as::<_, (String, String)>(
        "SELECT vendor_key, category_id FROM vendor_mappings WHERE vendor_key = ?",
    )
    .bind(vendor_key)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| VendorMapping {
        vendor_key: r.0,
        category: CategoryId(r.1),
    }))
}

pub async fn get_all_vendor_mappings(pool: &DbPool) -> Result<Vec<VendorMapping>, StorageError> {
    let rows = sqlx::query_as::<_, (String, String)>(
        "SELECT vendor_key, category_id FROM vendor_mappings ORDER BY vendor_key",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|r| VendorMapping {
            vendor_key: r.0,
            category: CategoryId(r.1),
        })
        .collect())
}

pub async fn delete_vendor_mapping(pool: &DbPool, vendor_key: &str) -> Result<bool, StorageError> {
    let result = sqlx::query("DELETE FROM vendor_mappings WHERE vendor_key = ?")
        .bind(vendor_key)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

// ── Categories ────────────────────────────────────────────────────────────────

pub async fn save_category(pool: &DbPool, category: &Category) -> Result<(), StorageError> {
    if category.id.as_str().trim().is_empty() {
        return Err(CategoryError::EmptyId.into());
    }
    sqlx::query(
        r#"
        INSERT INTO categories (id, name, parent_id, is_visible) VALUES (?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            parent_id = excluded.parent_id,
            is_visible = excluded.is_visible
        "#,
    )
    .bind(category.id.as_str())
    .bind(&category.name)
    .bind(category.parent.as_ref().map(|p| p.as_str()))
    .bind(category.visible)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_all_categories(pool: &DbPool) -> Result<Vec<Category>, StorageError> {
    let rows = sqlx::query_as::<_, (String, String, Option<String>, bool)>(
        "SELECT id, name, parent_id, is_visible FROM categories ORDER BY id",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|r| Category {
            id: CategoryId(r.0),
            name: r.1,
            parent: r.2.map(CategoryId),
            visible: r.3,
        })
        .collect())
}

pub async fn set_category_visibility(
    pool: &DbPool,
    id: &CategoryId,
    visible: bool,
) -> Result<bool, StorageError> {
    let result = sqlx::query("UPDATE categories SET is_visible = ? WHERE id = ?")
        .bind(visible)
        .bind(id.as_str())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn load_category_store(pool: &DbPool) -> Result<CategoryStore, StorageError> {
    Ok(get_all_categories(pool).await?.into_iter().collect())
}

// ── Snapshot ──────────────────────────────────────────────────────────────────

/// Reads rules and vendor mappings into an immutable [`RuleSet`].
pub async fn load_rule_set(pool: &DbPool) -> Result<RuleSet, StorageError> {
    let rules = get_all_rules(pool).await?;
    let vendors = VendorMappings::from_mappings(get_all_vendor_mappings(pool).await?)?;
    info!(
        rules = rules.len(),
        vendors = vendors.len(),
        "Loaded rule set from database"
    );
    Ok(RuleSet::new(rules, vendors)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::Transaction;
    use tally_rules::RuleFile;

    fn contains(value: &str, category: &str, priority: i32) -> RuleDraft {
        RuleDraft::new(PatternType::Contains, value, category).with_priority(priority)
    }

    #[tokio::test]
    async fn save_rule_assigns_increasing_ids() {
        let db = create_memory_db().await.unwrap();
        let a = save_rule(&db, &contains("uber", "Travel", 1)).await.unwrap();
        let b = save_rule(&db, &contains("lyft", "Travel", 1)).await.unwrap();
        assert!(b.id() > a.id());
        assert_eq!(a.category().as_str(), "Travel");
    }

    #[tokio::test]
    async fn save_rule_rejects_invalid_drafts_without_writing() {
        let db = create_memory_db().await.unwrap();
        let bad = RuleDraft::new(PatternType::Regex, "[oops", "X");
        assert!(matches!(
            save_rule(&db, &bad).await,
            Err(StorageError::Rule(RuleError::InvalidRegex { .. }))
        ));
        let inverted = contains("x", "X", 0)
            .with_amount_range(Some(Money::from_cents(500)), Some(Money::from_cents(100)));
        assert!(save_rule(&db, &inverted).await.is_err());
        assert!(get_all_rules(&db).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_rule_with_id_updates_in_place() {
        let db = create_memory_db().await.unwrap();
        let saved = save_rule(&db, &contains("uber", "Travel", 1)).await.unwrap();

        let mut draft = saved.to_draft();
        draft.category = CategoryId::new("Rideshare");
        draft.amount_min = Some(Money::from_cents(-10_000));
        let updated = save_rule(&db, &draft).await.unwrap();

        assert_eq!(updated.id(), saved.id());
        assert_eq!(updated.category().as_str(), "Rideshare");
        assert_eq!(updated.amount_min(), Some(Money::from_cents(-10_000)));
        assert_eq!(get_all_rules(&db).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn saved_amount_bounds_match_the_parsed_draft() {
        let db = create_memory_db().await.unwrap();
        let file = RuleFile::from_toml(
            "[[rules]]\npattern_value = \"uber\"\ncategory = \"Travel\"\n\
             amount_min = \"10.005\"\namount_max = \"20.015\"\n",
        )
        .unwrap();
        let draft = &file.rules[0];
        assert_eq!(draft.amount_min, Some(Money::from_cents(1000)));
        assert_eq!(draft.amount_max, Some(Money::from_cents(2002)));

        let saved = save_rule(&db, draft).await.unwrap();
        assert_eq!(saved.amount_min(), draft.amount_min);
        assert_eq!(saved.amount_max(), draft.amount_max);
        let reloaded = get_rule_by_id(&db, saved.id()).await.unwrap().unwrap();
        assert_eq!(reloaded.amount_min(), draft.amount_min);
    }

    #[tokio::test]
    async fn save_rule_with_unknown_id_inserts_it() {
        let db = create_memory_db().await.unwrap();
        let rule = save_rule(&db, &contains("uber", "Travel", 1).with_id(42))
            .await
            .unwrap();
        assert_eq!(rule.id(), RuleId(42));
        assert!(get_rule_by_id(&db, RuleId(42)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rules_come_back_in_evaluation_order() {
        let db = create_memory_db().await.unwrap();
        save_rule(&db, &contains("c", "C", 5)).await.unwrap();
        save_rule(&db, &contains("a", "A", 1)).await.unwrap();
        save_rule(&db, &contains("b", "B", 1)).await.unwrap();
        let categories: Vec<String> = get_all_rules(&db)
            .await
            .unwrap()
            .iter()
            .map(|r| r.category().to_string())
            .collect();
        assert_eq!(categories, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn enable_disable_and_delete() {
        let db = create_memory_db().await.unwrap();
        let rule = save_rule(&db, &contains("uber", "Travel", 1)).await.unwrap();

        assert!(set_rule_enabled(&db, rule.id(), false).await.unwrap());
        assert!(get_enabled_rules(&db).await.unwrap().is_empty());
        assert_eq!(get_all_rules(&db).await.unwrap().len(), 1);

        assert!(delete_rule(&db, rule.id()).await.unwrap());
        assert!(!delete_rule(&db, rule.id()).await.unwrap());
        assert!(!set_rule_enabled(&db, rule.id(), true).await.unwrap());
    }

    #[tokio::test]
    async fn vendor_mapping_upsert_is_last_write_wins() {
        let db = create_memory_db().await.unwrap();
        save_vendor_mapping(&db, &VendorMapping::new("ACME", "Office Supplies"))
            .await
            .unwrap();
        save_vendor_mapping(&db, &VendorMapping::new("ACME", "Equipment"))
            .await
            .unwrap();

        let all = get_all_vendor_mappings(&db).await.unwrap();
        assert_eq!(all, vec![VendorMapping::new("ACME", "Equipment")]);
        assert_eq!(
            get_vendor_mapping(&db, "ACME").await.unwrap(),
            Some(VendorMapping::new("ACME", "Equipment"))
        );

        assert!(delete_vendor_mapping(&db, "ACME").await.unwrap());
        assert_eq!(get_vendor_mapping(&db, "ACME").await.unwrap(), None);
    }

    #[tokio::test]
    async fn vendor_mapping_rejects_empty_key() {
        let db = create_memory_db().await.unwrap();
        assert!(matches!(
            save_vendor_mapping(&db, &VendorMapping::new("", "X")).await,
            Err(StorageError::Rule(RuleError::EmptyVendorKey))
        ));
    }

    #[tokio::test]
    async fn categories_load_into_store() {
        let db = create_memory_db().await.unwrap();
        save_category(&db, &Category::new("travel", "Travel")).await.unwrap();
        save_category(&db, &Category::new("air", "Airfare").with_parent("travel"))
            .await
            .unwrap();
        assert!(set_category_visibility(&db, &CategoryId::new("air"), false)
            .await
            .unwrap());

        let store = load_category_store(&db).await.unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(
            store.full_name(&CategoryId::new("air")).as_deref(),
            Some("Travel:Airfare")
        );
        assert_eq!(store.visible().count(), 1);
    }

    #[tokio::test]
    async fn load_rule_set_categorizes() {
        let db = create_memory_db().await.unwrap();
        save_rule(&db, &contains("Amazon", "Supplies", 1)).await.unwrap();
        save_rule(&db, &RuleDraft::new(PatternType::Regex, "^AMZN.*", "Shopping").with_priority(2))
            .await
            .unwrap();
        save_rule(&db, &contains("amzn", "Disabled", 0).disabled())
            .await
            .unwrap();
        save_vendor_mapping(&db, &VendorMapping::new("ACME", "Office Supplies"))
            .await
            .unwrap();

        let set = load_rule_set(&db).await.unwrap();
        assert_eq!(set.len(), 2);

        let amzn = Transaction::new("AMZN Mktp US", Money::from_cents(-4200));
        assert_eq!(set.categorize(&amzn).category().unwrap().as_str(), "Shopping");

        let acme = Transaction::new("INVOICE 4411", Money::from_cents(-9900)).with_vendor("ACME");
        assert_eq!(
            set.categorize(&acme).category().unwrap().as_str(),
            "Office Supplies"
        );
    }

    #[tokio::test]
    async fn on_disk_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tally.db");
        {
            let db = create_db(&path).await.unwrap();
            save_rule(&db, &contains("uber", "Travel", 1)).await.unwrap();
            db.close().await;
        }
        let db = create_db(&path).await.unwrap();
        assert_eq!(get_all_rules(&db).await.unwrap().len(), 1);
    }
}
