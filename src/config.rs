use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use dms_search_core::analyzer::Analyzer;
use dms_search_core::engine::EngineSettings;
use dms_search_core::maintainer::MaintainerSettings;
use dms_search_core::projection::PropertyGroupDefinition;
use dms_search_core::read_filter::SecurityRoles;
use dms_search_core::strategy::{CountStrategy, CountThresholds};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub suggest: SuggestConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub import: ImportConfig,
    #[serde(default)]
    pub property_groups: Vec<PropertyGroupDefinition>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct IndexConfig {
    #[serde(default)]
    pub analyzer: Analyzer,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_max_search_results")]
    pub max_search_results: u64,
    #[serde(default = "default_more_extra")]
    pub more_extra: u64,
    #[serde(default = "default_window_factor")]
    pub window_factor: u64,
    #[serde(default = "default_fragment_len")]
    pub fragment_len: usize,
    #[serde(default = "default_fetch_page_min")]
    pub fetch_page_min: u64,
    #[serde(default = "default_count_page_size")]
    pub count_page_size: u64,
    #[serde(default)]
    pub cache_folders_in_depth: bool,
    #[serde(default)]
    pub native_sql_lookups: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            max_search_results: default_max_search_results(),
            more_extra: default_more_extra(),
            window_factor: default_window_factor(),
            fragment_len: default_fragment_len(),
            fetch_page_min: default_fetch_page_min(),
            count_page_size: default_count_page_size(),
            cache_folders_in_depth: false,
            native_sql_lookups: false,
        }
    }
}

fn default_strategy() -> String {
    "am_limited".to_string()
}
fn default_max_search_results() -> u64 {
    1000
}
fn default_more_extra() -> u64 {
    1
}
fn default_window_factor() -> u64 {
    2
}
fn default_fragment_len() -> usize {
    256
}
fn default_fetch_page_min() -> u64 {
    50
}
fn default_count_page_size() -> u64 {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexerConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default = "default_true")]
    pub rebuild_on_startup: bool,
    #[serde(default = "default_mlt_max_terms")]
    pub mlt_max_terms: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            threads: default_threads(),
            rebuild_on_startup: true,
            mlt_max_terms: default_mlt_max_terms(),
        }
    }
}

fn default_batch_size() -> usize {
    25
}
fn default_threads() -> usize {
    4
}
fn default_true() -> bool {
    true
}
fn default_mlt_max_terms() -> usize {
    25
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SuggestConfig {
    /// Defaults to `suggest.json` next to the database.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SecurityConfig {
    #[serde(default = "default_admin_role")]
    pub admin_role: String,
    #[serde(default = "default_admin_user")]
    pub admin_user: String,
    #[serde(default = "default_system_user")]
    pub system_user: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            admin_role: default_admin_role(),
            admin_user: default_admin_user(),
            system_user: default_system_user(),
        }
    }
}

fn default_admin_role() -> String {
    "ROLE_ADMIN".to_string()
}
fn default_admin_user() -> String {
    "okmAdmin".to_string()
}
fn default_system_user() -> String {
    "system".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MaintenanceConfig {
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImportConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}

impl Config {
    pub fn suggest_path(&self) -> PathBuf {
        match &self.suggest.path {
            Some(path) => path.clone(),
            None => self
                .db
                .path
                .parent()
                .map(|dir| dir.join("suggest.json"))
                .unwrap_or_else(|| PathBuf::from("suggest.json")),
        }
    }

    pub fn security_roles(&self) -> SecurityRoles {
        SecurityRoles {
            admin_role: self.security.admin_role.clone(),
            admin_user: self.security.admin_user.clone(),
            system_user: self.security.system_user.clone(),
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        let search = &self.search;
        EngineSettings {
            strategy: CountStrategy::from_config(&search.strategy),
            thresholds: CountThresholds {
                more_extra: search.more_extra,
                window_factor: search.window_factor,
                max_search_results: search.max_search_results,
            },
            fragment_len: search.fragment_len,
            fetch_page_min: search.fetch_page_min,
            count_page_size: search.count_page_size,
            mlt_max_terms: self.indexer.mlt_max_terms,
            cache_folders: search.cache_folders_in_depth,
            native_sql_lookups: search.native_sql_lookups,
        }
    }

    pub fn maintainer_settings(&self) -> MaintainerSettings {
        MaintainerSettings {
            batch_size: self.indexer.batch_size,
            threads: self.indexer.threads,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.search.max_search_results == 0 {
        anyhow::bail!("search.max_search_results must be > 0");
    }
    if config.search.window_factor == 0 {
        anyhow::bail!("search.window_factor must be >= 1");
    }
    if config.search.fragment_len == 0 {
        anyhow::bail!("search.fragment_len must be > 0");
    }
    if config.search.fetch_page_min == 0 || config.search.count_page_size == 0 {
        anyhow::bail!("search.fetch_page_min and search.count_page_size must be > 0");
    }
    if config.indexer.batch_size == 0 {
        anyhow::bail!("indexer.batch_size must be > 0");
    }
    if config.indexer.threads == 0 {
        anyhow::bail!("indexer.threads must be > 0");
    }
    if config.indexer.mlt_max_terms == 0 {
        anyhow::bail!("indexer.mlt_max_terms must be > 0");
    }
    if config.security.admin_role.trim().is_empty() {
        anyhow::bail!("security.admin_role must not be empty");
    }

    for group in &config.property_groups {
        for prop in &group.properties {
            match prop.kind.trim().to_ascii_lowercase().as_str() {
                "text" | "input" | "textarea" | "date" | "select" | "checkbox" => {}
                other => anyhow::bail!(
                    "Unknown type '{}' for property '{}' in group '{}'. Must be text, date, select, or checkbox.",
                    other,
                    prop.name,
                    group.name
                ),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_str)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = parse("[db]\npath = \"./data/dms.sqlite\"\n").unwrap();
        assert_eq!(cfg.index.analyzer, Analyzer::Standard);
        assert_eq!(cfg.search.strategy, "am_limited");
        assert_eq!(cfg.search.max_search_results, 1000);
        assert_eq!(cfg.indexer.batch_size, 25);
        assert!(cfg.indexer.rebuild_on_startup);
        assert!(!cfg.maintenance.read_only);
        assert_eq!(cfg.server.bind, "127.0.0.1:7340");
        assert_eq!(cfg.suggest_path(), PathBuf::from("./data/suggest.json"));
        assert_eq!(cfg.security_roles(), SecurityRoles::default());
    }

    #[test]
    fn engine_settings_follow_search_section() {
        let cfg = parse(
            r#"
            [db]
            path = "dms.sqlite"

            [search]
            strategy = "window"
            window_factor = 3
            native_sql_lookups = true

            [indexer]
            mlt_max_terms = 10
            "#,
        )
        .unwrap();
        let settings = cfg.engine_settings();
        assert_eq!(settings.strategy, CountStrategy::Window);
        assert_eq!(settings.thresholds.window_factor, 3);
        assert_eq!(settings.mlt_max_terms, 10);
        assert!(settings.native_sql_lookups);
    }

    #[test]
    fn unknown_strategy_falls_back_to_limited() {
        let cfg = parse("[db]\npath = \"x\"\n[search]\nstrategy = \"bogus\"\n").unwrap();
        assert_eq!(cfg.engine_settings().strategy, CountStrategy::Limited);
    }

    #[test]
    fn unknown_analyzer_is_rejected() {
        assert!(parse("[db]\npath = \"x\"\n[index]\nanalyzer = \"klingon\"\n").is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(parse("[db]\npath = \"x\"\n[indexer]\nbatch_size = 0\n").is_err());
        assert!(parse("[db]\npath = \"x\"\n[search]\nwindow_factor = 0\n").is_err());

        let err = parse(
            r#"
            [db]
            path = "x"

            [[property_groups]]
            name = "okg:consulting"
            properties = [{ name = "okp:consulting.size", type = "slider" }]
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("slider"));
    }
}
