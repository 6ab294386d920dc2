use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tally_core::Money;
use tally_rules::PatternType;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use config::Config;

#[derive(Debug, Parser)]
#[command(name = "tally", version, about = "Categorize bank transactions with ordered rules")]
struct Cli {
    /// Config file (defaults to ./tally.toml, then the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Categorize a CSV of transactions (description,amount[,vendor][,date]); `-` reads stdin
    Categorize {
        input: PathBuf,
        /// Use a TOML rules file instead of the database
        #[arg(long)]
        rules: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Csv)]
        format: OutputFormat,
    },
    /// Show every rule that matches a single transaction
    Explain {
        description: String,
        #[arg(allow_hyphen_values = true)]
        amount: Money,
        #[arg(long)]
        vendor: Option<String>,
        #[arg(long)]
        rules: Option<PathBuf>,
    },
    #[command(subcommand)]
    Rules(RulesCommand),
    #[command(subcommand)]
    Vendors(VendorsCommand),
    #[command(subcommand)]
    Categories(CategoriesCommand),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Csv,
    Json,
}

#[derive(Debug, Subcommand)]
enum RulesCommand {
    List,
    Add(RuleArgs),
    Remove { id: i64 },
    Enable { id: i64 },
    Disable { id: i64 },
    /// Save every rule and vendor mapping from a TOML rules file
    Import { file: PathBuf },
}

#[derive(Debug, Args)]
pub struct RuleArgs {
    /// contains, regex or exact
    #[arg(long = "type", default_value = "contains")]
    pub pattern_type: PatternType,
    /// Pattern text, or a transaction description with --from-description
    pub pattern: String,
    pub category: String,
    /// Seed the rule from a transaction description: it becomes the rule
    /// name, and regex rules match it literally
    #[arg(long)]
    pub from_description: bool,
    #[arg(long, default_value = "")]
    pub name: String,
    /// Lower runs first
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    pub priority: i32,
    #[arg(long, allow_hyphen_values = true)]
    pub min: Option<Money>,
    #[arg(long, allow_hyphen_values = true)]
    pub max: Option<Money>,
    #[arg(long)]
    pub disabled: bool,
}

#[derive(Debug, Subcommand)]
enum VendorsCommand {
    List,
    Set { vendor_key: String, category: String },
    Remove { vendor_key: String },
}

#[derive(Debug, Subcommand)]
enum CategoriesCommand {
    List,
    Add {
        id: String,
        name: String,
        #[arg(long)]
        parent: Option<String>,
    },
    Hide { id: String },
    Show { id: String },
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    // stdout carries command output; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    init_tracing(&config);

    if let Some(source) = &config.source {
        tracing::debug!("Using config {}", source.display());
    }

    match cli.command {
        Command::Categorize {
            input,
            rules,
            format,
        } => commands::categorize(&config, &input, rules.as_deref(), format).await,
        Command::Explain {
            description,
            amount,
            vendor,
            rules,
        } => commands::explain(&config, description, amount, vendor, rules.as_deref()).await,
        Command::Rules(cmd) => {
            let db = commands::open_db(&config).await?;
            match cmd {
                RulesCommand::List => commands::list_rules(&db).await,
                RulesCommand::Add(args) => commands::add_rule(&db, args).await,
                RulesCommand::Remove { id } => commands::remove_rule(&db, id).await,
                RulesCommand::Enable { id } => commands::set_rule_enabled(&db, id, true).await,
                RulesCommand::Disable { id } => commands::set_rule_enabled(&db, id, false).await,
                RulesCommand::Import { file } => commands::import_rules(&db, &file).await,
            }
        }
        Command::Vendors(cmd) => {
            let db = commands::open_db(&config).await?;
            match cmd {
                VendorsCommand::List => commands::list_vendors(&db).await,
                VendorsCommand::Set {
                    vendor_key,
                    category,
                } => commands::set_vendor(&db, vendor_key, category).await,
                VendorsCommand::Remove { vendor_key } => {
                    commands::remove_vendor(&db, &vendor_key).await
                }
            }
        }
        Command::Categories(cmd) => {
            let db = commands::open_db(&config).await?;
            match cmd {
                CategoriesCommand::List => commands::list_categories(&db).await,
                CategoriesCommand::Add { id, name, parent } => {
                    commands::add_category(&db, id, name, parent).await
                }
                CategoriesCommand::Hide { id } => commands::set_category_visible(&db, id, false).await,
                CategoriesCommand::Show { id } => commands::set_category_visible(&db, id, true).await,
            }
        }
    }
}
