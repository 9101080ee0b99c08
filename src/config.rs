//! Configuration loader and validator for the content admin.
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::model::ContentKind;

/// Matches values nobody filled in: `<PROJECT-ID>`, `<ANON_KEY>`, `YOUR_...`.
static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<[A-Za-z0-9_-]+>|^YOUR_[A-Z0-9_]*$").expect("valid placeholder regex"));

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub supabase: Supabase,
    pub auth: Auth,
    #[serde(default)]
    pub store: Store,
    #[serde(default)]
    pub tables: Tables,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// Hosted backend connection parameters. Both are required at startup.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Supabase {
    pub url: String,
    pub anon_key: String,
}

impl std::fmt::Debug for Supabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supabase")
            .field("url", &self.url)
            .field("anon_key", &"[REDACTED]")
            .finish()
    }
}

/// Federated sign-in settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Auth {
    pub provider: String,
    pub redirect_to: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Remote,
    Sqlite,
}

/// Which content store implementation serves the tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Store {
    #[serde(default)]
    pub backend: Backend,
    #[serde(default)]
    pub database_url: Option<String>,
}

/// Table names in the hosted backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Tables {
    pub projects: String,
    pub case_studies: String,
    pub blog_posts: String,
    pub podcast_episodes: String,
    pub resources: String,
    pub admin_users: String,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            projects: "projects_ap2024".into(),
            case_studies: "case_studies_ap2024".into(),
            blog_posts: "blog_posts_ap2024".into(),
            podcast_episodes: "podcast_episodes_ap2024".into(),
            resources: "resources_ap2024".into(),
            admin_users: "admin_users_ap2024".into(),
        }
    }
}

impl Tables {
    pub fn name(&self, kind: ContentKind) -> &str {
        match kind {
            ContentKind::Project => &self.projects,
            ContentKind::CaseStudy => &self.case_studies,
            ContentKind::BlogPost => &self.blog_posts,
            ContentKind::PodcastEpisode => &self.podcast_episodes,
            ContentKind::Resource => &self.resources,
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.resolved_data_dir())
    }

    /// `app.data_dir` with a leading `~/` expanded to `$HOME`.
    pub fn resolved_data_dir(&self) -> PathBuf {
        let raw = self.app.data_dir.trim();
        if let Some(rest) = raw.strip_prefix("~/") {
            if let Ok(home) = std::env::var("HOME") {
                return Path::new(&home).join(rest);
            }
        }
        PathBuf::from(raw)
    }

    pub fn session_file(&self) -> PathBuf {
        self.resolved_data_dir().join("session.json")
    }

    pub fn supabase_url(&self) -> Result<Url, ConfigError> {
        Url::parse(self.supabase.url.trim())
            .map_err(|_| ConfigError::Invalid("supabase.url must be a valid URL"))
    }

    pub fn redirect_to(&self) -> Result<Url, ConfigError> {
        Url::parse(self.auth.redirect_to.trim())
            .map_err(|_| ConfigError::Invalid("auth.redirect_to must be a valid URL"))
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn is_placeholder(value: &str) -> bool {
    PLACEHOLDER.is_match(value.trim())
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    if cfg.supabase.url.trim().is_empty() {
        return Err(ConfigError::Invalid("supabase.url must be non-empty"));
    }
    if is_placeholder(&cfg.supabase.url) {
        return Err(ConfigError::Invalid("supabase.url is still a placeholder"));
    }
    let url = cfg.supabase_url()?;
    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(ConfigError::Invalid("supabase.url must be http(s)"));
    }
    if cfg.supabase.anon_key.trim().is_empty() {
        return Err(ConfigError::Invalid("supabase.anon_key must be non-empty"));
    }
    if is_placeholder(&cfg.supabase.anon_key) {
        return Err(ConfigError::Invalid("supabase.anon_key is still a placeholder"));
    }

    if cfg.auth.provider.trim().is_empty() {
        return Err(ConfigError::Invalid("auth.provider must be non-empty"));
    }
    cfg.redirect_to()?;

    let t = &cfg.tables;
    if t.projects.trim().is_empty() {
        return Err(ConfigError::Invalid("tables.projects must be non-empty"));
    }
    if t.case_studies.trim().is_empty() {
        return Err(ConfigError::Invalid("tables.case_studies must be non-empty"));
    }
    if t.blog_posts.trim().is_empty() {
        return Err(ConfigError::Invalid("tables.blog_posts must be non-empty"));
    }
    if t.podcast_episodes.trim().is_empty() {
        return Err(ConfigError::Invalid("tables.podcast_episodes must be non-empty"));
    }
    if t.resources.trim().is_empty() {
        return Err(ConfigError::Invalid("tables.resources must be non-empty"));
    }
    if t.admin_users.trim().is_empty() {
        return Err(ConfigError::Invalid("tables.admin_users must be non-empty"));
    }

    if cfg.store.backend == Backend::Sqlite
        && cfg
            .store
            .database_url
            .as_deref()
            .is_some_and(|u| u.trim().is_empty())
    {
        return Err(ConfigError::Invalid("store.database_url must be non-empty when set"));
    }

    Ok(())
}

/// Example configuration. The connection values are placeholders and must be
/// replaced before `load` accepts the file.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

supabase:
  url: "https://<PROJECT-ID>.supabase.co"
  anon_key: "<ANON_KEY>"

auth:
  provider: "google"
  redirect_to: "http://localhost:5173/admin"

store:
  backend: "remote"

tables:
  projects: "projects_ap2024"
  case_studies: "case_studies_ap2024"
  blog_posts: "blog_posts_ap2024"
  podcast_episodes: "podcast_episodes_ap2024"
  resources: "resources_ap2024"
  admin_users: "admin_users_ap2024"
"#
}
