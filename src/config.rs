//! Configuration loading for voxqueue.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Get the voxqueue home directory (~/.voxqueue).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".voxqueue"))
}

/// Get the settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Load settings from ~/.voxqueue/settings.json
pub fn load_settings() -> Result<Settings> {
    load_settings_from(&get_settings_path()?)
}

/// Load settings from an explicit file, then apply environment overrides.
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Err(Error::Config(format!(
            "Settings file not found at {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(path)?;
    let mut settings: Settings = serde_json::from_str(&content)?;
    apply_env_overrides(&mut settings)?;
    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Load settings or fall back to defaults (still honouring the environment).
pub fn load_settings_or_default(path: Option<&Path>) -> Settings {
    let loaded = match path {
        Some(path) => load_settings_from(path),
        None => load_settings(),
    };
    loaded.unwrap_or_else(|e| {
        tracing::warn!("Failed to load settings: {}, using defaults", e);
        let mut settings = Settings::default();
        if let Err(e) = apply_env_overrides(&mut settings).and_then(|_| validate_settings(&settings)) {
            tracing::warn!("Ignoring environment overrides: {}", e);
            settings = Settings::default();
        }
        settings
    })
}

/// Apply the process environment on top of file settings.
pub fn apply_env_overrides(settings: &mut Settings) -> Result<()> {
    apply_overrides(settings, |key| std::env::var(key).ok())
}

fn apply_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
    fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
        raw.trim()
            .parse()
            .map_err(|_| Error::Config(format!("{} has an invalid value: '{}'", key, raw)))
    }

    if let Some(raw) = lookup("QUEUE_MAX_SIZE") {
        settings.queue.max_size = parse("QUEUE_MAX_SIZE", &raw)?;
    }
    if let Some(raw) = lookup("CONCURRENT_PROCESSORS") {
        settings.worker.concurrency = parse("CONCURRENT_PROCESSORS", &raw)?;
    }
    if let Some(url) = lookup("AUTH_URL") {
        settings.auth.url = url;
    }
    if let Some(email) = lookup("AUTH_EMAIL") {
        settings.auth.email = email;
    }
    if let Some(password) = lookup("AUTH_PASSWORD") {
        settings.auth.password = password;
    }
    if let Some(raw) = lookup("AUTH_TOKEN_REFRESH_MARGIN") {
        settings.auth.refresh_margin_secs = parse("AUTH_TOKEN_REFRESH_MARGIN", &raw)?;
    }
    Ok(())
}

fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.worker.concurrency == 0 {
        return Err(Error::Config(
            "worker.concurrency must be at least 1".to_string(),
        ));
    }
    let validation = &settings.validation;
    if validation.min_text_length > validation.max_text_length {
        return Err(Error::Config(format!(
            "validation.min_text_length ({}) exceeds validation.max_text_length ({})",
            validation.min_text_length, validation.max_text_length
        )));
    }
    if !settings.worker.priority.marker_path.is_empty()
        && !settings.worker.priority.marker_path.starts_with('/')
    {
        return Err(Error::Config(format!(
            "worker.priority.marker_path must be a JSON pointer, got '{}'",
            settings.worker.priority.marker_path
        )));
    }
    Ok(())
}

/// Queue configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct QueueSettings {
    /// 0 disables the capacity limit
    #[serde(default = "default_queue_max_size")]
    pub max_size: usize,
}

fn default_queue_max_size() -> usize {
    1000
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_size: default_queue_max_size(),
        }
    }
}

/// When a delivery is acknowledged to the broker.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Right after the message is queued
    #[default]
    OnEnqueue,
    /// After the pipeline reaches a final outcome
    OnCompletion,
}

/// Which messages jump the queue.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PriorityRule {
    /// JSON pointer into the payload
    #[serde(default = "default_marker_path")]
    pub marker_path: String,
    /// Substring that marks the message as privileged
    #[serde(default = "default_marker")]
    pub marker: String,
}

fn default_marker_path() -> String {
    "/speechDto/user_uuid".to_string()
}

fn default_marker() -> String {
    "premium".to_string()
}

impl Default for PriorityRule {
    fn default() -> Self {
        Self {
            marker_path: default_marker_path(),
            marker: default_marker(),
        }
    }
}

/// Worker pool configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct WorkerSettings {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub ack_mode: AckMode,
    /// 0 disables periodic stats logging
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
    #[serde(default)]
    pub priority: PriorityRule,
}

fn default_concurrency() -> usize {
    3
}

fn default_drain_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_stats_interval_secs() -> u64 {
    30
}

impl WorkerSettings {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            drain_timeout_secs: default_drain_timeout_secs(),
            max_retries: default_max_retries(),
            ack_mode: AckMode::default(),
            stats_interval_secs: default_stats_interval_secs(),
            priority: PriorityRule::default(),
        }
    }
}

/// Backend login configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AuthSettings {
    #[serde(default = "default_auth_url")]
    pub url: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_refresh_margin_secs")]
    pub refresh_margin_secs: u64,
    #[serde(default = "default_auth_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_auth_url() -> String {
    "http://localhost:3000/auth/login".to_string()
}

fn default_refresh_margin_secs() -> u64 {
    300
}

fn default_auth_timeout_secs() -> u64 {
    30
}

impl AuthSettings {
    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_margin_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn has_credentials(&self) -> bool {
        !self.email.is_empty() && !self.password.is_empty()
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            url: default_auth_url(),
            email: String::new(),
            password: String::new(),
            refresh_margin_secs: default_refresh_margin_secs(),
            timeout_secs: default_auth_timeout_secs(),
        }
    }
}

/// Limits for the validation stage.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ValidationSettings {
    #[serde(default = "default_min_text_length")]
    pub min_text_length: usize,
    #[serde(default = "default_max_text_length")]
    pub max_text_length: usize,
    #[serde(default = "default_languages")]
    pub languages: Vec<String>,
}

fn default_min_text_length() -> usize {
    1
}

fn default_max_text_length() -> usize {
    10_000
}

fn default_languages() -> Vec<String> {
    ["en", "es", "pt", "fr", "de", "it", "ja", "ko", "zh"]
        .iter()
        .map(|l| l.to_string())
        .collect()
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            min_text_length: default_min_text_length(),
            max_text_length: default_max_text_length(),
            languages: default_languages(),
        }
    }
}

/// voxqueue settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Settings {
    #[serde(default)]
    pub queue: QueueSettings,

    #[serde(default)]
    pub worker: WorkerSettings,

    #[serde(default)]
    pub auth: AuthSettings,

    /// Strategy name -> enabled; unlisted strategies are enabled
    #[serde(default)]
    pub strategies: HashMap<String, bool>,

    #[serde(default)]
    pub validation: ValidationSettings,
}

impl Settings {
    /// Copy safe to print: the password is masked.
    pub fn redacted(&self) -> Settings {
        let mut copy = self.clone();
        if !copy.auth.password.is_empty() {
            copy.auth.password = "********".to_string();
        }
        copy
    }
}
