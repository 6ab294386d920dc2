use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::path::Path;
use tally_core::{Category, CategoryId, CategoryStore, Money, Transaction};
use tally_rules::{Decision, RuleDraft, RuleFile, RuleId, RuleSet, VendorMapping};
use tally_storage::DbPool;
use tracing::{info, warn};

use crate::config::Config;
use crate::{OutputFormat, RuleArgs};

const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%m/%d/%Y"];

/// One input row. `vendor` and `date` columns are optional.
#[derive(Debug, Deserialize)]
struct InputRow {
    description: String,
    amount: String,
    #[serde(default)]
    vendor: Option<String>,
    #[serde(default)]
    date: Option<String>,
}

/// A transaction with its decision, as written by `categorize`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategorizedRow {
    pub date: Option<NaiveDate>,
    pub description: String,
    pub amount: Money,
    pub vendor: Option<String>,
    pub category: Option<CategoryId>,
    pub source: String,
    pub matched_text: Option<String>,
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    let s = s.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
        .with_context(|| format!("Invalid date '{s}'"))
}

/// Parses `description,amount[,vendor][,date]` CSV with a header row.
pub fn read_transactions<R: Read>(reader: R) -> Result<Vec<Transaction>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::Headers)
        .flexible(true)
        .from_reader(reader);

    let mut transactions = Vec::new();
    for (idx, result) in reader.deserialize::<InputRow>().enumerate() {
        // Header is line 1.
        let line = idx + 2;
        let row = result.with_context(|| format!("Malformed CSV at line {line}"))?;
        let amount: Money = row
            .amount
            .parse()
            .with_context(|| format!("Line {line}"))?;

        let mut tx = Transaction::new(row.description, amount);
        if let Some(vendor) = row.vendor {
            tx = tx.with_vendor(vendor);
        }
        if let Some(date) = row.date.filter(|d| !d.trim().is_empty()) {
            tx = tx.with_date(parse_date(&date).with_context(|| format!("Line {line}"))?);
        }
        transactions.push(tx);
    }
    Ok(transactions)
}

pub fn categorize_rows(rules: &RuleSet, transactions: Vec<Transaction>) -> Vec<CategorizedRow> {
    transactions
        .into_iter()
        .map(|mut tx| {
            let decision = rules.categorize(&tx);
            decision.apply_to(&mut tx);
            let matched_text = match &decision {
                Decision::Rule { matched_text, .. } => Some(matched_text.clone()),
                _ => None,
            };
            CategorizedRow {
                date: tx.date,
                description: tx.description,
                amount: tx.amount,
                vendor: tx.vendor,
                category: tx.category,
                source: decision.source_label(),
                matched_text,
            }
        })
        .collect()
}

/// Categories that decisions point at but the category list does not know.
/// An empty list means categories are not being tracked, so nothing is flagged.
pub fn unknown_categories(rows: &[CategorizedRow], categories: &CategoryStore) -> Vec<CategoryId> {
    if categories.is_empty() {
        return Vec::new();
    }
    let mut unknown: Vec<CategoryId> = rows
        .iter()
        .filter_map(|r| r.category.as_ref())
        .filter(|c| !categories.contains(c))
        .cloned()
        .collect();
    unknown.sort();
    unknown.dedup();
    unknown
}

pub fn write_rows<W: Write>(out: W, rows: &[CategorizedRow], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            serde_json::to_writer_pretty(out, rows)?;
        }
        OutputFormat::Csv => {
            let mut writer = csv::Writer::from_writer(out);
            writer.write_record([
                "date",
                "description",
                "amount",
                "vendor",
                "category",
                "source",
                "matched_text",
            ])?;
            for row in rows {
                let date = row.date.map(|d| d.to_string()).unwrap_or_default();
                let amount = row.amount.as_decimal().to_string();
                writer.write_record([
                    date.as_str(),
                    row.description.as_str(),
                    amount.as_str(),
                    row.vendor.as_deref().unwrap_or(""),
                    row.category.as_ref().map(CategoryId::as_str).unwrap_or(""),
                    row.source.as_str(),
                    row.matched_text.as_deref().unwrap_or(""),
                ])?;
            }
            writer.flush()?;
        }
    }
    Ok(())
}

pub async fn open_db(config: &Config) -> Result<DbPool> {
    if let Some(parent) = config.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    tally_storage::create_db(&config.db_path)
        .await
        .with_context(|| format!("Failed to open database {}", config.db_path.display()))
}

fn load_rule_file(path: &Path) -> Result<RuleFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    RuleFile::from_toml(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Rules from `rules_file` when given, otherwise from the database, plus the
/// category list used to flag unknown categories.
async fn load_rules(config: &Config, rules_file: Option<&Path>) -> Result<(RuleSet, CategoryStore)> {
    match rules_file {
        Some(path) => {
            let rules = load_rule_file(path)?
                .into_rule_set()
                .with_context(|| format!("Invalid rules in {}", path.display()))?;
            Ok((rules, CategoryStore::new()))
        }
        None => {
            let db = open_db(config).await?;
            let rules = tally_storage::load_rule_set(&db).await?;
            let categories = tally_storage::load_category_store(&db).await?;
            Ok((rules, categories))
        }
    }
}

pub async fn categorize(
    config: &Config,
    input: &Path,
    rules_file: Option<&Path>,
    format: OutputFormat,
) -> Result<()> {
    let (rules, categories) = load_rules(config, rules_file).await?;

    let transactions = if input == Path::new("-") {
        read_transactions(io::stdin().lock())?
    } else {
        let file = std::fs::File::open(input)
            .with_context(|| format!("Failed to open {}", input.display()))?;
        read_transactions(file)?
    };

    let rows = categorize_rows(&rules, transactions);
    for category in unknown_categories(&rows, &categories) {
        warn!(category = %category, "Decision references a category that is not defined");
    }
    let matched = rows.iter().filter(|r| r.category.is_some()).count();
    info!(
        rules = rules.len(),
        total = rows.len(),
        matched,
        "Categorized transactions"
    );

    write_rows(io::stdout().lock(), &rows, format)
}

pub async fn explain(
    config: &Config,
    description: String,
    amount: Money,
    vendor: Option<String>,
    rules_file: Option<&Path>,
) -> Result<()> {
    let (rules, _) = load_rules(config, rules_file).await?;
    let mut tx = Transaction::new(description, amount);
    if let Some(vendor) = vendor {
        tx = tx.with_vendor(vendor);
    }

    let matches = rules.find_all_matches(&tx);
    let mut out = io::stdout().lock();
    if matches.is_empty() {
        writeln!(out, "No rule matches")?;
    }
    for (idx, m) in matches.iter().enumerate() {
        let marker = if idx == 0 { "*" } else { " " };
        writeln!(
            out,
            "{marker} rule {} (priority {}) {} -> {} [matched '{}']",
            m.rule_id, m.priority, m.rule_name, m.category, m.matched_text
        )?;
    }
    let decision = rules.categorize(&tx);
    match decision.category() {
        Some(category) => writeln!(out, "Decision: {category} ({})", decision.source_label())?,
        None => writeln!(out, "Decision: uncategorized")?,
    }
    Ok(())
}

// ── Rules ─────────────────────────────────────────────────────────────────────

pub fn draft_from_args(args: RuleArgs) -> Result<RuleDraft> {
    let mut draft = if args.from_description {
        let mut tx = Transaction::new(args.pattern.as_str(), Money::zero());
        tx.category = Some(CategoryId::new(args.category.as_str()));
        RuleDraft::from_transaction(&tx, args.pattern_type)?
    } else {
        RuleDraft::new(args.pattern_type, &args.pattern, &args.category)
    };
    if !args.name.is_empty() {
        draft = draft.with_name(&args.name);
    }
    draft = draft
        .with_priority(args.priority)
        .with_amount_range(args.min, args.max);
    if args.disabled {
        draft = draft.disabled();
    }
    Ok(draft)
}

pub async fn list_rules(db: &DbPool) -> Result<()> {
    let rules = tally_storage::get_all_rules(db).await?;
    let mut out = io::stdout().lock();
    for rule in &rules {
        let range = match (rule.amount_min(), rule.amount_max()) {
            (None, None) => String::new(),
            (min, max) => format!(
                " amount {}..{}",
                min.map(|m| m.to_string()).unwrap_or_default(),
                max.map(|m| m.to_string()).unwrap_or_default()
            ),
        };
        writeln!(
            out,
            "{:>4} {:>5} {:<8} {:<30} -> {}{}{}",
            rule.id(),
            rule.priority(),
            rule.pattern_type(),
            rule.pattern_value(),
            rule.category(),
            range,
            if rule.enabled() { "" } else { " (disabled)" }
        )?;
    }
    Ok(())
}

pub async fn add_rule(db: &DbPool, args: RuleArgs) -> Result<()> {
    let rule = tally_storage::save_rule(db, &draft_from_args(args)?).await?;
    info!(rule_id = %rule.id(), "Added rule");
    println!("{}", rule.id());
    Ok(())
}

pub async fn remove_rule(db: &DbPool, id: i64) -> Result<()> {
    if !tally_storage::delete_rule(db, RuleId(id)).await? {
        bail!("Rule {id} not found");
    }
    info!(rule_id = id, "Removed rule");
    Ok(())
}

pub async fn set_rule_enabled(db: &DbPool, id: i64, enabled: bool) -> Result<()> {
    if !tally_storage::set_rule_enabled(db, RuleId(id), enabled).await? {
        bail!("Rule {id} not found");
    }
    info!(rule_id = id, enabled, "Updated rule");
    Ok(())
}

pub async fn import_rules(db: &DbPool, path: &Path) -> Result<()> {
    let file = load_rule_file(path)?;
    // Validate the whole file before writing anything. Rules without an id
    // are inserted as new rows; only explicit ids update existing ones.
    file.clone()
        .into_rule_set()
        .with_context(|| format!("Invalid rules in {}", path.display()))?;

    for draft in &file.rules {
        tally_storage::save_rule(db, draft).await?;
    }
    for mapping in &file.vendors {
        tally_storage::save_vendor_mapping(db, mapping).await?;
    }
    info!(
        rules = file.rules.len(),
        vendors = file.vendors.len(),
        "Imported {}",
        path.display()
    );
    Ok(())
}

// ── Vendors ───────────────────────────────────────────────────────────────────

pub async fn list_vendors(db: &DbPool) -> Result<()> {
    let mut out = io::stdout().lock();
    for mapping in tally_storage::get_all_vendor_mappings(db).await? {
        writeln!(out, "{} -> {}", mapping.vendor_key, mapping.category)?;
    }
    Ok(())
}

pub async fn set_vendor(db: &DbPool, vendor_key: String, category: String) -> Result<()> {
    let mapping = VendorMapping::new(&vendor_key, &category);
    tally_storage::save_vendor_mapping(db, &mapping).await?;
    info!(vendor = %vendor_key, category = %category, "Saved vendor mapping");
    Ok(())
}

pub async fn remove_vendor(db: &DbPool, vendor_key: &str) -> Result<()> {
    if !tally_storage::delete_vendor_mapping(db, vendor_key).await? {
        bail!("No mapping for vendor '{vendor_key}'");
    }
    Ok(())
}

// ── Categories ────────────────────────────────────────────────────────────────

pub async fn list_categories(db: &DbPool) -> Result<()> {
    let store = tally_storage::load_category_store(db).await?;
    let mut out = io::stdout().lock();
    for category in store.all() {
        let name = store
            .full_name(&category.id)
            .unwrap_or_else(|| category.name.clone());
        let hidden = if category.visible { "" } else { " (hidden)" };
        writeln!(out, "{:<20} {}{}", category.id, name, hidden)?;
    }
    Ok(())
}

pub async fn add_category(
    db: &DbPool,
    id: String,
    name: String,
    parent: Option<String>,
) -> Result<()> {
    let mut category = Category::new(&id, &name);
    if let Some(parent) = parent {
        category = category.with_parent(&parent);
    }
    let mut store = tally_storage::load_category_store(db).await?;
    store.add(category.clone())?;
    tally_storage::save_category(db, &category).await?;
    info!(category = %id, "Added category");
    Ok(())
}

pub async fn set_category_visible(db: &DbPool, id: String, visible: bool) -> Result<()> {
    if !tally_storage::set_category_visibility(db, &CategoryId::new(id.clone()), visible).await? {
        bail!("Category '{id}' not found");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_rules::PatternType;

    fn rules() -> RuleSet {
        RuleFile::from_toml(
            r#"
[[rules]]
pattern_type = "regex"
pattern_value = "^AMZN"
category = "Shopping"
priority = 1

[[rules]]
pattern_value = "amazon"
category = "Shopping"

[[vendors]]
vendor_key = "ACME"
category = "Office"
"#,
        )
        .unwrap()
        .into_rule_set()
        .unwrap()
    }

    #[test]
    fn reads_rows_with_optional_columns() {
        let csv = "description,amount,vendor,date\n\
                   AMZN Mktp US,-42.00,,2024-03-01\n\
                   Paper order,\"(1,250.00)\",ACME,03/02/2024\n";
        let txs = read_transactions(csv.as_bytes()).unwrap();
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[0].amount, Money::from_cents(-4200));
        assert_eq!(txs[0].vendor, None);
        assert_eq!(txs[0].date, NaiveDate::from_ymd_opt(2024, 3, 1));
        assert_eq!(txs[1].amount, Money::from_cents(-125_000));
        assert_eq!(txs[1].vendor.as_deref(), Some("ACME"));
        assert_eq!(txs[1].date, NaiveDate::from_ymd_opt(2024, 3, 2));
    }

    #[test]
    fn reads_rows_without_vendor_or_date_columns() {
        let txs = read_transactions("description,amount\nCoffee,-3.50\n".as_bytes()).unwrap();
        assert_eq!(txs[0].description, "Coffee");
        assert_eq!(txs[0].date, None);
    }

    #[test]
    fn bad_amount_is_an_error() {
        let err = read_transactions("description,amount\nCoffee,lots\n".as_bytes()).unwrap_err();
        assert!(format!("{err:#}").contains("Line 2"));
    }

    #[test]
    fn bad_date_is_an_error() {
        assert!(read_transactions("description,amount,date\nCoffee,-3.50,yesterday\n".as_bytes()).is_err());
    }

    #[test]
    fn categorize_rows_records_source() {
        let txs = vec![
            Transaction::new("AMZN Mktp US", Money::from_cents(-4200)),
            Transaction::new("Paper", Money::from_cents(-900)).with_vendor("ACME"),
            Transaction::new("Mystery", Money::from_cents(-100)),
        ];
        let rows = categorize_rows(&rules(), txs);

        assert_eq!(rows[0].source, "rule:1");
        assert_eq!(rows[0].category.as_ref().unwrap().as_str(), "Shopping");
        assert_eq!(rows[0].matched_text.as_deref(), Some("AMZN"));
        assert_eq!(rows[1].source, "vendor");
        assert_eq!(rows[1].category.as_ref().unwrap().as_str(), "Office");
        assert_eq!(rows[1].matched_text, None);
        assert_eq!(rows[2].source, "none");
        assert_eq!(rows[2].category, None);
    }

    #[test]
    fn unknown_categories_ignores_empty_store() {
        let rows = categorize_rows(&rules(), vec![Transaction::new("AMZN", Money::from_cents(-1))]);
        assert!(unknown_categories(&rows, &CategoryStore::new()).is_empty());

        let mut store = CategoryStore::new();
        store.add(Category::new("Office", "Office")).unwrap();
        assert_eq!(unknown_categories(&rows, &store), vec![CategoryId::from("Shopping")]);
    }

    #[test]
    fn writes_csv_output() {
        let rows = categorize_rows(
            &rules(),
            vec![Transaction::new("AMZN Mktp US", Money::from_cents(-4200))
                .with_date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())],
        );
        let mut buf = Vec::new();
        write_rows(&mut buf, &rows, OutputFormat::Csv).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "date,description,amount,vendor,category,source,matched_text");
        assert_eq!(lines[1], "2024-03-01,AMZN Mktp US,-42.00,,Shopping,rule:1,AMZN");
    }

    #[test]
    fn writes_json_output() {
        let rows = categorize_rows(&rules(), vec![Transaction::new("Mystery", Money::from_cents(-100))]);
        let mut buf = Vec::new();
        write_rows(&mut buf, &rows, OutputFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(value[0]["source"], "none");
        assert!(value[0]["category"].is_null());
    }

    #[test]
    fn draft_from_args_carries_every_field() {
        let draft = draft_from_args(RuleArgs {
            pattern_type: PatternType::Exact,
            pattern: "Netflix".to_string(),
            category: "Streaming".to_string(),
            from_description: false,
            name: "tv".to_string(),
            priority: 5,
            min: Some(Money::from_cents(-2000)),
            max: None,
            disabled: true,
        })
        .unwrap();
        assert_eq!(draft.id, None);
        assert_eq!(draft.name, "tv");
        assert_eq!(draft.priority, 5);
        assert_eq!(draft.amount_min, Some(Money::from_cents(-2000)));
        assert!(!draft.enabled);
    }

    #[test]
    fn draft_from_description_escapes_regex_and_keeps_overrides() {
        let draft = draft_from_args(RuleArgs {
            pattern_type: PatternType::Regex,
            pattern: "SQ *BLUE BOTTLE".to_string(),
            category: "Coffee".to_string(),
            from_description: true,
            name: String::new(),
            priority: 3,
            min: None,
            max: Some(Money::zero()),
            disabled: false,
        })
        .unwrap();
        assert_eq!(draft.pattern_value, r"SQ \*BLUE BOTTLE");
        assert_eq!(draft.name, "SQ *BLUE BOTTLE");
        assert_eq!(draft.category.as_str(), "Coffee");
        assert_eq!(draft.priority, 3);
        assert_eq!(draft.amount_max, Some(Money::zero()));
    }

    #[tokio::test]
    async fn import_keeps_existing_rules() {
        let dir = tempfile::tempdir().unwrap();
        let rules_path = dir.path().join("rules.toml");
        std::fs::write(
            &rules_path,
            "[[rules]]\npattern_value = \"uber\"\ncategory = \"Travel\"\n",
        )
        .unwrap();

        let db = tally_storage::create_memory_db().await.unwrap();
        let netflix = tally_storage::save_rule(
            &db,
            &RuleDraft::new(PatternType::Contains, "netflix", "Streaming"),
        )
        .await
        .unwrap();

        import_rules(&db, &rules_path).await.unwrap();
        import_rules(&db, &rules_path).await.unwrap();

        let kept = tally_storage::get_rule_by_id(&db, netflix.id()).await.unwrap().unwrap();
        assert_eq!(kept.pattern_value(), "netflix");
        assert_eq!(kept.category().as_str(), "Streaming");

        let all = tally_storage::get_all_rules(&db).await.unwrap();
        let uber: Vec<_> = all.iter().filter(|r| r.pattern_value() == "uber").collect();
        assert_eq!(all.len(), 3);
        assert_eq!(uber.len(), 2);
        assert!(uber.iter().all(|r| r.id() != netflix.id()));
    }

    #[tokio::test]
    async fn import_updates_rules_with_explicit_ids() {
        let dir = tempfile::tempdir().unwrap();
        let rules_path = dir.path().join("rules.toml");
        std::fs::write(
            &rules_path,
            "[[rules]]\nid = 7\npattern_value = \"uber\"\ncategory = \"Travel\"\n",
        )
        .unwrap();

        let db = tally_storage::create_memory_db().await.unwrap();
        import_rules(&db, &rules_path).await.unwrap();
        import_rules(&db, &rules_path).await.unwrap();

        let all = tally_storage::get_all_rules(&db).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id(), RuleId(7));
    }

    #[tokio::test]
    async fn import_then_categorize_from_database() {
        let dir = tempfile::tempdir().unwrap();
        let rules_path = dir.path().join("rules.toml");
        std::fs::write(
            &rules_path,
            "[[rules]]\npattern_value = \"uber\"\ncategory = \"Travel\"\n\n[[vendors]]\nvendor_key = \"ACME\"\ncategory = \"Office\"\n",
        )
        .unwrap();
        let config = Config {
            db_path: dir.path().join("nested").join("tally.db"),
            log_filter: "info".to_string(),
            source: None,
        };

        let db = open_db(&config).await.unwrap();
        import_rules(&db, &rules_path).await.unwrap();
        db.close().await;

        let (rules, _) = load_rules(&config, None).await.unwrap();
        let rows = categorize_rows(
            &rules,
            vec![
                Transaction::new("UBER TRIP", Money::from_cents(-1850)),
                Transaction::new("Paper", Money::from_cents(-900)).with_vendor("ACME"),
            ],
        );
        assert_eq!(rows[0].category.as_ref().unwrap().as_str(), "Travel");
        assert_eq!(rows[1].source, "vendor");
    }

    #[tokio::test]
    async fn add_category_rejects_unknown_parent() {
        let db = tally_storage::create_memory_db().await.unwrap();
        assert!(add_category(&db, "Coffee".into(), "Coffee".into(), Some("Food".into()))
            .await
            .is_err());
        add_category(&db, "Food".into(), "Food".into(), None).await.unwrap();
        add_category(&db, "Coffee".into(), "Coffee".into(), Some("Food".into()))
            .await
            .unwrap();
        let store = tally_storage::load_category_store(&db).await.unwrap();
        assert_eq!(store.full_name(&CategoryId::from("Coffee")).as_deref(), Some("Food:Coffee"));
    }
}
