use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "tally.toml";
pub const DEFAULT_DB_FILE: &str = "tally.db";
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Shape of `tally.toml`. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub database: DatabaseSection,
    pub log_filter: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseSection {
    pub path: Option<PathBuf>,
}

/// Resolved settings after applying file, environment and defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub db_path: PathBuf,
    pub log_filter: String,
    /// The file the settings came from, if any.
    pub source: Option<PathBuf>,
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "tally", "Tally")
}

/// `./tally.toml`, then `<config dir>/tally.toml`.
pub fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.exists() {
        return Some(local);
    }
    project_dirs()
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
        .filter(|p| p.exists())
}

impl Config {
    /// Loads `explicit` (which must exist) or the first config file found,
    /// then applies `TALLY_DB_PATH` / `TALLY_LOG` overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Config> {
        let path = match explicit {
            Some(p) if !p.exists() => bail!("Config file not found: {}", p.display()),
            Some(p) => Some(p.to_path_buf()),
            None => find_config_file(),
        };

        let file = match &path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read {}", p.display()))?;
                toml::from_str::<FileConfig>(&raw)
                    .with_context(|| format!("Failed to parse {}", p.display()))?
            }
            None => FileConfig::default(),
        };

        let data_dir = project_dirs().map(|dirs| dirs.data_dir().to_path_buf());
        Ok(Config::resolve(
            file,
            path,
            |key| std::env::var(key).ok().filter(|v| !v.is_empty()),
            data_dir,
        ))
    }

    /// Pure merge of the config sources, in increasing precedence:
    /// defaults, config file, environment.
    pub fn resolve(
        file: FileConfig,
        source: Option<PathBuf>,
        env: impl Fn(&str) -> Option<String>,
        data_dir: Option<PathBuf>,
    ) -> Config {
        let db_path = match env("TALLY_DB_PATH").map(PathBuf::from).or(file.database.path) {
            // Relative paths in the file are relative to the file, not the cwd.
            Some(p) if p.is_relative() => match source.as_deref().and_then(Path::parent) {
                Some(dir) => dir.join(p),
                None => p,
            },
            Some(p) => p,
            None => data_dir
                .map(|d| d.join(DEFAULT_DB_FILE))
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_FILE)),
        };

        let log_filter = env("TALLY_LOG")
            .or(file.log_filter)
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        Config {
            db_path,
            log_filter,
            source,
        }
    }
}
