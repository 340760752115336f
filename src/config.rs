//! Typed configuration with layered loading and upfront validation.
//!
//! Precedence is defaults < file < environment < CLI, the same contract the
//! figment stack documents. Validation runs before any network or disk work
//! so a bad configuration never produces a partial crawl.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{CrawlError, Result};

/// Environment variable prefix; nested keys are separated with `__`,
/// e.g. `GLCRAWL_GITLAB__HOST`.
const ENV_PREFIX: &str = "GLCRAWL_";

/// Full crawler configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub gitlab: GitlabConfig,
    pub output: OutputConfig,
    pub database: DatabaseConfig,
    pub progress: ProgressConfig,
    pub resume: ResumeConfig,
    pub callbacks: CallbackConfig,
    pub oauth2: Oauth2Config,
}

/// Host connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GitlabConfig {
    /// Base URL of the forge; required.
    pub host: String,
    /// Access token override; normally tokens come from the account store.
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    /// Account selection hint passed to the token manager.
    pub account: Option<String>,
    /// Per-request timeout in milliseconds.
    pub timeout: u64,
    /// Project-parallel workers for the resource and repository steps.
    pub max_concurrency: usize,
    /// Requests-per-second ceiling; unset disables the gate.
    pub rate_limit: Option<u32>,
    /// Records requested per page.
    pub per_page: u32,
    /// Hard safety cap on page-numbered pagination.
    pub max_pages: u32,
    /// Wire protocol selection per resource type.
    pub strategy: Strategy,
}

impl Default for GitlabConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            access_token: None,
            refresh_token: None,
            account: None,
            timeout: 30_000,
            max_concurrency: 1,
            rate_limit: None,
            per_page: 100,
            max_pages: 100,
            strategy: Strategy::Hybrid,
        }
    }
}

impl GitlabConfig {
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }
}

/// Which protocol enumerates a resource type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Graphql,
    Rest,
    /// GraphQL for enumeration, REST for resources with no GraphQL
    /// equivalent (artifacts, traces, blobs, dependencies, packages).
    #[default]
    Hybrid,
}

/// JSONL output tree settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutputConfig {
    pub root_dir: PathBuf,
    pub file_naming: FileNaming,
    /// When false, files land flat in `root_dir` instead of under the
    /// sanitized area path.
    pub hierarchical: bool,
    /// Affects `index.json` only; JSONL records are always compact.
    pub pretty_print: bool,
    /// Emit a per-area `index.json` alongside the record files.
    pub write_index: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("crawl-output"),
            file_naming: FileNaming::SnakeCase,
            hierarchical: true,
            pretty_print: false,
            write_index: false,
        }
    }
}

/// Normalization applied to resource-type file stems.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum FileNaming {
    #[serde(rename = "lowercase")]
    Lowercase,
    #[serde(rename = "kebab-case")]
    KebabCase,
    #[default]
    #[serde(rename = "snake_case")]
    SnakeCase,
}

/// Account store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("accounts.json"),
        }
    }
}

/// Progress reporter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProgressConfig {
    pub enabled: bool,
    pub file: PathBuf,
    /// Write interval in milliseconds.
    pub interval: u64,
    /// Advisory-lock acquisition timeout in milliseconds.
    pub lock_timeout: u64,
    /// Include per-resource counters in the report.
    pub detailed: bool,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            file: PathBuf::from("progress.yaml"),
            interval: 1_000,
            lock_timeout: 5_000,
            detailed: true,
        }
    }
}

/// Resume store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResumeConfig {
    pub enabled: bool,
    pub state_file: PathBuf,
    /// Maximum lag between in-memory updates and disk, in milliseconds.
    pub auto_save_interval: u64,
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            state_file: PathBuf::from("resume.yaml"),
            auto_save_interval: 5_000,
        }
    }
}

/// Transform pipeline settings.
///
/// Inline callbacks are registered programmatically on the crawler builder;
/// configuration can only point at a subprocess module.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CallbackConfig {
    pub enabled: bool,
    /// Executable spoken to over newline-delimited JSON on stdio.
    pub module_path: Option<PathBuf>,
}

/// OAuth2 provider registry keyed by provider name.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Oauth2Config {
    pub providers: BTreeMap<String, Oauth2Provider>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Oauth2Provider {
    pub client_id: String,
    pub client_secret: String,
    pub authorization_url: Option<String>,
    pub token_url: String,
    pub redirect_uri: Option<String>,
    pub scopes: Vec<String>,
}

impl Config {
    /// Load configuration, layering an optional YAML file and the
    /// environment over built-in defaults.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = file {
            figment = figment.merge(Yaml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        figment
            .extract()
            .map_err(|e| CrawlError::Config(e.to_string()))
    }

    /// Reject configurations that cannot produce a meaningful crawl.
    ///
    /// Surfaced before any work begins; failures here are fatal.
    pub fn validate(&self) -> Result<()> {
        if self.gitlab.host.is_empty() {
            return Err(CrawlError::Config("gitlab.host is required".into()));
        }
        let url = Url::parse(&self.gitlab.host)
            .map_err(|e| CrawlError::Config(format!("gitlab.host is not a URL: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CrawlError::Config(format!(
                "gitlab.host must be http(s), got {}",
                url.scheme()
            )));
        }
        if self.gitlab.timeout == 0 {
            return Err(CrawlError::Config("gitlab.timeout must be > 0".into()));
        }
        if self.gitlab.max_concurrency == 0 {
            return Err(CrawlError::Config(
                "gitlab.maxConcurrency must be >= 1".into(),
            ));
        }
        if self.gitlab.rate_limit == Some(0) {
            return Err(CrawlError::Config("gitlab.rateLimit must be > 0".into()));
        }
        if self.gitlab.per_page == 0 || self.gitlab.max_pages == 0 {
            return Err(CrawlError::Config(
                "gitlab.perPage and gitlab.maxPages must be > 0".into(),
            ));
        }
        if self.resume.auto_save_interval == 0 {
            return Err(CrawlError::Config(
                "resume.autoSaveInterval must be a positive integer".into(),
            ));
        }
        if self.callbacks.enabled
            && let Some(path) = &self.callbacks.module_path
            && path.as_os_str().is_empty()
        {
            return Err(CrawlError::Config(
                "callbacks.modulePath must not be empty when set".into(),
            ));
        }
        Ok(())
    }

    /// Host base URL; call after [`Config::validate`].
    pub fn host_url(&self) -> Result<Url> {
        Url::parse(&self.gitlab.host)
            .map_err(|e| CrawlError::Config(format!("gitlab.host is not a URL: {e}")))
    }
}
