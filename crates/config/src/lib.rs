//! Layered configuration for pagesync.
//!
//! Sources, lowest priority first: built-in defaults, the configuration file
//! (YAML, TOML or JSON, chosen by extension), then `PAGESYNC_` environment
//! variables with `__` separating nested keys (`PAGESYNC_API__TOKEN`). The API
//! token may also be supplied as `NOTION_TOKEN` when nothing else sets it.

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "PAGESYNC_";
pub const TOKEN_ENV: &str = "NOTION_TOKEN";
pub const MIN_CONCURRENCY: usize = 1;
pub const MAX_CONCURRENCY: usize = 20;
const DEFAULT_STATE_FILE: &str = ".pagesync/state.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub sync: SyncConfig,
    pub output: OutputConfig,
    pub state: StateConfig,
    pub options: OptionsConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub version: String,
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.notion.com/v1".to_string(),
            token: None,
            version: "2022-06-28".to_string(),
            timeout_secs: 60,
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// A page or collection to sync, given as a share URL or a bare ID.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub roots: Vec<Root>,
    pub concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            concurrency: 5,
        }
    }
}

impl SyncConfig {
    pub fn concurrency(&self) -> usize {
        self.concurrency.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub path: PathBuf,
    pub attachment_folder: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            attachment_folder: "attachments".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionsConfig {
    pub download_attachments: bool,
    pub cleanup_orphans: bool,
}

impl Default for OptionsConfig {
    fn default() -> Self {
        Self {
            download_attachments: true,
            cleanup_orphans: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 3.0,
            burst: 10,
        }
    }
}

/// `<config dir>/config.yaml` for the current user, if a home directory exists.
pub fn default_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "pagesync").map(|dirs| dirs.config_dir().join("config.yaml"))
}

impl Config {
    /// Load and validate configuration.
    ///
    /// An explicitly given file must exist; the default file is optional so a
    /// purely environment-driven setup works.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = Self::load_unchecked(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`load`](Self::load) without validation, for read-only commands
    /// that do not talk to the API.
    pub fn load_unchecked(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => {
                if !path.is_file() {
                    exn::bail!(ErrorKind::Load(format!("{} does not exist", path.display())));
                }
                Some(path.to_path_buf())
            },
            None => default_path().filter(|p| p.is_file()),
        };
        match &file {
            Some(file) => tracing::debug!(path = %file.display(), "Loading configuration file"),
            None => tracing::debug!("No configuration file, using defaults and environment"),
        }
        Self::from_figment(Self::figment(file.as_deref()))
    }

    /// The layered sources without extracting or validating them.
    pub fn figment(file: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(file) = file {
            figment = match file.extension().and_then(|e| e.to_str()) {
                Some("toml") => figment.merge(Toml::file(file)),
                Some("json") => figment.merge(Json::file(file)),
                _ => figment.merge(Yaml::file(file)),
            };
        }
        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .join(Env::raw().only(&[TOKEN_ENV]).map(|_| "api.token".into()))
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        figment
            .extract()
            .map_err(|e| ErrorKind::Load(e.to_string()).into())
    }

    /// Report every problem at once rather than one per attempt.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.sync.roots.is_empty() {
            problems.push("sync.roots must list at least one page or collection".to_string());
        }
        for (i, root) in self.sync.roots.iter().enumerate() {
            if root.url.trim().is_empty() {
                problems.push(format!("sync.roots[{i}]: url is required"));
            }
        }
        if self.output.path.as_os_str().is_empty() {
            problems.push("output.path is required".to_string());
        }
        if self.output.attachment_folder.trim().is_empty() {
            problems.push("output.attachment_folder must not be empty".to_string());
        }
        if self.api.token.as_deref().is_none_or(|t| t.trim().is_empty()) {
            problems.push(format!("api.token is required (or set {TOKEN_ENV})"));
        }
        if !self.rate_limit.requests_per_second.is_finite() || self.rate_limit.requests_per_second <= 0.0 {
            problems.push("rate_limit.requests_per_second must be positive".to_string());
        }
        if self.rate_limit.burst == 0 {
            problems.push("rate_limit.burst must be at least 1".to_string());
        }
        if !problems.is_empty() {
            exn::bail!(ErrorKind::Invalid(problems));
        }
        Ok(())
    }

    /// Explicit `state.file`, otherwise inside the output directory. Relative
    /// paths are resolved against the output directory.
    pub fn state_file(&self) -> PathBuf {
        match &self.state.file {
            Some(file) if file.is_absolute() => file.clone(),
            Some(file) => self.output.path.join(file),
            None => self.output.path.join(DEFAULT_STATE_FILE),
        }
    }
}
