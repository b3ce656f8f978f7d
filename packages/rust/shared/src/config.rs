//! Application configuration for PatchScout.
//!
//! User config lives at `~/.patchscout/patchscout.toml`.
//! CLI flags override config file values, which override defaults.
//! Every threshold is tuning data; nothing here is a canonical constant.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PatchScoutError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "patchscout.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".patchscout";

// ---------------------------------------------------------------------------
// Config structs (matching patchscout.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub defaults: DefaultsConfig,

    #[serde(default)]
    pub guards: GuardConfig,

    #[serde(default)]
    pub relevance: RelevanceConfig,

    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub extract: ExtractConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// libSQL database file.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Wall-clock budget for one crawl run.
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,

    /// Maximum candidates processed in one crawl run.
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            duration_secs: default_duration_secs(),
            max_candidates: default_max_candidates(),
        }
    }
}

fn default_database_path() -> String {
    "~/.patchscout/patchscout.db".into()
}
fn default_duration_secs() -> u64 {
    300
}
fn default_max_candidates() -> usize {
    200
}

/// `[guards]` section: per-run fairness policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Accepted candidates allowed in one run.
    #[serde(default = "default_run_cap")]
    pub run_cap: usize,

    /// Accepted candidates allowed per host in one run.
    #[serde(default = "default_host_cap")]
    pub host_cap: usize,

    /// Domain family throttled by the source-share guard.
    #[serde(default = "default_source_domains")]
    pub source_share_domains: Vec<String>,

    /// Maximum share (0..=1) of the window the source family may hold.
    #[serde(default = "default_source_share_threshold")]
    pub source_share_threshold: f64,

    /// Seconds the source-share guard stays armed after tripping.
    #[serde(default = "default_source_cooldown_secs")]
    pub source_share_cooldown_secs: u64,

    /// Maximum share (0..=1) of contested candidates in the window.
    #[serde(default = "default_contested_threshold")]
    pub contested_threshold: f64,

    /// Number of recent accepted candidates the share guards look at.
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Share guards are not enforced until the window holds this many entries.
    #[serde(default = "default_min_window_samples")]
    pub min_window_samples: usize,

    /// Distinct hosts to reach before any host is accepted twice.
    #[serde(default = "default_min_distinct_hosts")]
    pub min_distinct_hosts: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            run_cap: default_run_cap(),
            host_cap: default_host_cap(),
            source_share_domains: default_source_domains(),
            source_share_threshold: default_source_share_threshold(),
            source_share_cooldown_secs: default_source_cooldown_secs(),
            contested_threshold: default_contested_threshold(),
            window_size: default_window_size(),
            min_window_samples: default_min_window_samples(),
            min_distinct_hosts: default_min_distinct_hosts(),
        }
    }
}

impl GuardConfig {
    pub fn source_share_cooldown(&self) -> Duration {
        Duration::from_secs(self.source_share_cooldown_secs)
    }
}

fn default_run_cap() -> usize {
    200
}
fn default_host_cap() -> usize {
    3
}
fn default_source_domains() -> Vec<String> {
    vec!["wikipedia.org".into()]
}
fn default_source_share_threshold() -> f64 {
    0.4
}
fn default_source_cooldown_secs() -> u64 {
    60
}
fn default_contested_threshold() -> f64 {
    0.3
}
fn default_window_size() -> usize {
    20
}
fn default_min_window_samples() -> usize {
    5
}
fn default_min_distinct_hosts() -> usize {
    2
}

/// `[relevance]` section: save-decision tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelevanceConfig {
    /// Score (0..=100) at or above which a citation is saved.
    #[serde(default = "default_save_threshold")]
    pub save_threshold: u8,

    /// Extracted text shorter than this is denied without scoring.
    #[serde(default = "default_min_content_chars")]
    pub min_content_chars: usize,

    /// Also create a memory entry for saved content.
    #[serde(default)]
    pub save_as_memory: bool,

    /// Fetch attempts before a citation is finalized as `denied_verify`.
    #[serde(default = "default_max_fetch_attempts")]
    pub max_fetch_attempts: u32,
}

impl Default for RelevanceConfig {
    fn default() -> Self {
        Self {
            save_threshold: default_save_threshold(),
            min_content_chars: default_min_content_chars(),
            save_as_memory: false,
            max_fetch_attempts: default_max_fetch_attempts(),
        }
    }
}

fn default_save_threshold() -> u8 {
    60
}
fn default_min_content_chars() -> usize {
    500
}
fn default_max_fetch_attempts() -> u32 {
    3
}

/// `[fetch]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Maximum in-flight fetch/score/save operations.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Client identifier sent with every request.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            concurrency: default_concurrency(),
            user_agent: default_user_agent(),
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_timeout_secs() -> u64 {
    15
}
fn default_concurrency() -> usize {
    5
}
fn default_user_agent() -> String {
    concat!(
        "PatchScout/",
        env!("CARGO_PKG_VERSION"),
        " (citation discovery crawler)"
    )
    .into()
}

/// `[extract]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractConfig {
    /// Domain family treated as internal to the source encyclopedia.
    #[serde(default = "default_internal_domains")]
    pub internal_domains: Vec<String>,

    /// Maximum characters of surrounding text kept per citation.
    #[serde(default = "default_context_chars")]
    pub max_context_chars: usize,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            internal_domains: default_internal_domains(),
            max_context_chars: default_context_chars(),
        }
    }
}

fn default_internal_domains() -> Vec<String> {
    [
        "wikipedia.org",
        "wikimedia.org",
        "wikidata.org",
        "wiktionary.org",
        "wikisource.org",
        "mediawiki.org",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_context_chars() -> usize {
    300
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Reject values that would make a run meaningless. Called before a run
    /// starts so configuration problems never surface mid-run.
    pub fn validate(&self) -> Result<()> {
        let g = &self.guards;
        if g.run_cap == 0 || g.host_cap == 0 {
            return Err(PatchScoutError::config("guards.run_cap and guards.host_cap must be > 0"));
        }
        for (name, ratio) in [
            ("guards.source_share_threshold", g.source_share_threshold),
            ("guards.contested_threshold", g.contested_threshold),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(PatchScoutError::config(format!(
                    "{name} must be within 0..=1, got {ratio}"
                )));
            }
        }
        if g.window_size == 0 {
            return Err(PatchScoutError::config("guards.window_size must be > 0"));
        }
        if self.relevance.save_threshold > 100 {
            return Err(PatchScoutError::config(format!(
                "relevance.save_threshold must be <= 100, got {}",
                self.relevance.save_threshold
            )));
        }
        if self.relevance.max_fetch_attempts == 0 {
            return Err(PatchScoutError::config("relevance.max_fetch_attempts must be > 0"));
        }
        if self.fetch.concurrency == 0 || self.fetch.timeout_secs == 0 {
            return Err(PatchScoutError::config(
                "fetch.concurrency and fetch.timeout_secs must be > 0",
            ));
        }
        if self.fetch.user_agent.trim().is_empty() {
            return Err(PatchScoutError::config("fetch.user_agent must not be empty"));
        }
        Ok(())
    }

    /// Database path with a leading `~` expanded to the home directory.
    pub fn database_path(&self) -> Result<PathBuf> {
        expand_home(&self.defaults.database_path)
    }
}

fn expand_home(raw: &str) -> Result<PathBuf> {
    match raw.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| PatchScoutError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(raw)),
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.patchscout/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| PatchScoutError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.patchscout/patchscout.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| PatchScoutError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| PatchScoutError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| PatchScoutError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| PatchScoutError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| PatchScoutError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("database_path"));
        assert!(toml_str.contains("source_share_threshold"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.guards.host_cap, 3);
        assert_eq!(parsed.relevance.save_threshold, 60);
        assert_eq!(parsed.fetch.concurrency, 5);
    }

    #[test]
    fn partial_sections_fill_defaults() {
        let toml_str = r#"
[guards]
host_cap = 7
source_share_domains = ["britannica.com"]

[relevance]
save_threshold = 75
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.guards.host_cap, 7);
        assert_eq!(config.guards.run_cap, 200);
        assert_eq!(config.guards.source_share_domains, vec!["britannica.com"]);
        assert_eq!(config.relevance.save_threshold, 75);
        assert_eq!(config.relevance.min_content_chars, 500);
        config.validate().expect("valid");
    }

    #[test]
    fn validation_rejects_bad_ratios_and_caps() {
        let mut config = AppConfig::default();
        config.guards.contested_threshold = 1.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("contested_threshold"));

        let mut config = AppConfig::default();
        config.guards.host_cap = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.relevance.save_threshold = 101;
        assert!(config.validate().is_err());
    }

    #[test]
    fn absolute_database_path_is_kept() {
        let mut config = AppConfig::default();
        config.defaults.database_path = "/tmp/ps.db".into();
        assert_eq!(config.database_path().unwrap(), PathBuf::from("/tmp/ps.db"));
    }
}
