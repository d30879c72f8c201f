use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::target::{self, Target};

const DEFAULT_ENV_PREFIX: &str = "FSUB";
const LEGACY_TARGET_PREFIX: &str = "FORCE_SUB";

pub const MAX_BUTTONS_PER_ROW: usize = 8;
pub const MAX_JOIN_BUTTONS: usize = 12;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("telegram.bot_token is required")]
    MissingBotToken,
    #[error("storage.sqlite_path could not be resolved")]
    MissingStoragePath,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub messages: MessagesConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_poll_timeout", with = "humantime_serde")]
    pub poll_timeout: Duration,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            api_base: default_api_base(),
            poll_timeout: default_poll_timeout(),
            workers: default_workers(),
        }
    }
}

fn default_api_base() -> String {
    "https://api.telegram.org".into()
}

fn default_poll_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_workers() -> usize {
    4
}

/// Which entry points may open a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EntryPolicy {
    /// Only `/start <code>` is gated.
    #[default]
    Redeem,
    /// A bare `/start` is gated too whenever targets are configured.
    Start,
}

impl EntryPolicy {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "redeem" => Some(EntryPolicy::Redeem),
            "start" => Some(EntryPolicy::Start),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateConfig {
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default = "default_buttons_per_row")]
    pub buttons_per_row: usize,
    #[serde(default = "default_max_join_buttons")]
    pub max_join_buttons: usize,
    #[serde(default = "default_join_text")]
    pub join_text: String,
    #[serde(default = "default_rotate_seconds")]
    pub rotate_seconds: u64,
    #[serde(default)]
    pub rotate_button: bool,
    #[serde(default)]
    pub entry: EntryPolicy,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            buttons_per_row: default_buttons_per_row(),
            max_join_buttons: default_max_join_buttons(),
            join_text: default_join_text(),
            rotate_seconds: default_rotate_seconds(),
            rotate_button: false,
            entry: EntryPolicy::default(),
        }
    }
}

impl GateConfig {
    pub fn parsed_targets(&self) -> Vec<Target> {
        target::parse_all(&self.targets)
    }
}

fn default_buttons_per_row() -> usize {
    3
}

fn default_max_join_buttons() -> usize {
    4
}

fn default_join_text() -> String {
    "ᴊᴏɪɴ".into()
}

fn default_rotate_seconds() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessagesConfig {
    #[serde(default = "default_start_message")]
    pub start: String,
    #[serde(default = "default_force_sub_message")]
    pub force_sub: String,
    #[serde(default = "default_done_button")]
    pub done_button: String,
    #[serde(default = "default_rotate_button")]
    pub rotate_button: String,
    #[serde(default = "default_not_joined")]
    pub not_joined: String,
    #[serde(default = "default_rotate_too_soon")]
    pub rotate_too_soon: String,
    #[serde(default = "default_access_granted")]
    pub access_granted: String,
    #[serde(default = "default_invalid_link")]
    pub invalid_link: String,
    #[serde(default = "default_file_missing")]
    pub file_missing: String,
    #[serde(default = "default_delivery_failed")]
    pub delivery_failed: String,
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            start: default_start_message(),
            force_sub: default_force_sub_message(),
            done_button: default_done_button(),
            rotate_button: default_rotate_button(),
            not_joined: default_not_joined(),
            rotate_too_soon: default_rotate_too_soon(),
            access_granted: default_access_granted(),
            invalid_link: default_invalid_link(),
            file_missing: default_file_missing(),
            delivery_failed: default_delivery_failed(),
        }
    }
}

fn default_start_message() -> String {
    "<b>Hi {mention}</b>".into()
}

fn default_force_sub_message() -> String {
    "<b>Join the channels below first</b>".into()
}

fn default_done_button() -> String {
    "✅ Joined".into()
}

fn default_rotate_button() -> String {
    "🔄 Other channels".into()
}

fn default_not_joined() -> String {
    "You have not joined every channel yet.".into()
}

fn default_rotate_too_soon() -> String {
    "Please wait {seconds}s before switching channels.".into()
}

fn default_access_granted() -> String {
    "✅ Access granted.".into()
}

fn default_invalid_link() -> String {
    "This link is invalid or has expired.".into()
}

fn default_file_missing() -> String {
    "File not found or already removed.".into()
}

fn default_delivery_failed() -> String {
    "Could not fetch the file right now. Please try again later.".into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

impl StorageBackend {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Some(StorageBackend::Sqlite),
            "memory" => Some(StorageBackend::Memory),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            sqlite_path: default_sqlite_path(),
        }
    }
}

fn default_sqlite_path() -> Option<PathBuf> {
    crate::storage::sqlite_default_path()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Clamps layout knobs into their supported ranges and rejects settings
    /// the bot cannot start without.
    pub fn validate(mut self) -> std::result::Result<Self, ConfigError> {
        if self.telegram.bot_token.trim().is_empty() {
            return Err(ConfigError::MissingBotToken);
        }
        if self.storage.backend == StorageBackend::Sqlite && self.storage.sqlite_path.is_none() {
            return Err(ConfigError::MissingStoragePath);
        }
        self.gate.buttons_per_row = self.gate.buttons_per_row.clamp(1, MAX_BUTTONS_PER_ROW);
        self.gate.max_join_buttons = self.gate.max_join_buttons.clamp(1, MAX_JOIN_BUTTONS);
        if self.telegram.workers == 0 {
            self.telegram.workers = default_workers();
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

/// Builds the config from compiled defaults, then the YAML file, then
/// `<PREFIX>_<SECTION>__<KEY>` variables. Each layer only touches the keys it
/// actually sets, so a later layer can put any value back, defaults included.
pub fn load(options: LoadOptions) -> Result<Config> {
    let path = options.config_file.or_else(default_config_path);
    let mut cfg = match path {
        Some(path) if path.exists() => read_config_file(&path)?,
        _ => Config::default(),
    };

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    let vars: Vec<(String, String)> = env::vars().collect();
    apply_env(&mut cfg, prefix, &vars);

    if cfg.gate.targets.is_empty() {
        cfg.gate.targets = legacy_targets(&vars);
    }

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn apply_env(cfg: &mut Config, prefix: &str, vars: &[(String, String)]) {
    let mut map: HashMap<String, String> = HashMap::new();
    let upper_prefix = format!("{}_", prefix.to_uppercase());

    for (key, value) in vars {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            map.insert(normalized, value.clone());
        }
    }

    for (key, value) in map {
        apply_env_value(cfg, &key, value);
    }
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "telegram.bot_token" => cfg.telegram.bot_token = value.trim().to_string(),
        "telegram.api_base" => cfg.telegram.api_base = value,
        "telegram.poll_timeout" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.telegram.poll_timeout = duration;
            }
        }
        "telegram.workers" => {
            if let Ok(parsed) = value.trim().parse::<usize>() {
                cfg.telegram.workers = parsed;
            }
        }
        "gate.targets" => {
            cfg.gate.targets = value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        "gate.buttons_per_row" => {
            if let Ok(parsed) = value.trim().parse::<usize>() {
                cfg.gate.buttons_per_row = parsed;
            }
        }
        "gate.max_join_buttons" => {
            if let Ok(parsed) = value.trim().parse::<usize>() {
                cfg.gate.max_join_buttons = parsed;
            }
        }
        "gate.join_text" => cfg.gate.join_text = value,
        "gate.rotate_seconds" => {
            if let Ok(parsed) = value.trim().parse::<u64>() {
                cfg.gate.rotate_seconds = parsed;
            }
        }
        "gate.rotate_button" => {
            cfg.gate.rotate_button = matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        "gate.entry" => {
            if let Some(entry) = EntryPolicy::parse(&value) {
                cfg.gate.entry = entry;
            }
        }
        "messages.start" => cfg.messages.start = value,
        "messages.force_sub" => cfg.messages.force_sub = value,
        "messages.done_button" => cfg.messages.done_button = value,
        "messages.rotate_button" => cfg.messages.rotate_button = value,
        "messages.not_joined" => cfg.messages.not_joined = value,
        "messages.rotate_too_soon" => cfg.messages.rotate_too_soon = value,
        "messages.access_granted" => cfg.messages.access_granted = value,
        "messages.invalid_link" => cfg.messages.invalid_link = value,
        "messages.file_missing" => cfg.messages.file_missing = value,
        "messages.delivery_failed" => cfg.messages.delivery_failed = value,
        "storage.backend" => {
            if let Some(backend) = StorageBackend::parse(&value) {
                cfg.storage.backend = backend;
            }
        }
        "storage.sqlite_path" => cfg.storage.sqlite_path = Some(PathBuf::from(value.trim())),
        "log.level" => cfg.log.level = value.trim().to_string(),
        _ => {}
    }
}

/// Collects `FORCE_SUB1`, `FORCE_SUB2`, ... until the first gap.
fn legacy_targets(vars: &[(String, String)]) -> Vec<String> {
    let lookup: HashMap<&str, &str> = vars
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    let mut targets = Vec::new();
    for i in 1.. {
        let key = format!("{LEGACY_TARGET_PREFIX}{i}");
        match lookup.get(key.as_str()).map(|v| v.trim()) {
            Some(value) if !value.is_empty() => targets.push(value.to_string()),
            _ => break,
        }
    }
    targets
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("fsub-gate").join("config.yaml"))
}
