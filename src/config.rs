use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Google,
    Sqlite,
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreBackend::Google => write!(f, "google"),
            StoreBackend::Sqlite => write!(f, "sqlite"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub google: Option<GoogleConfig>,
    #[serde(default = "default_sqlite_config")]
    pub sqlite: SqliteConfig,
    #[serde(default = "default_conversation_config")]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub general: GeneralConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Usernames allowed to run /export, /dashboard and /manager
    #[serde(default)]
    pub admin_usernames: Vec<String>,
    /// Chats that receive a copy of every recorded request.
    /// Numeric chat ids or `@channel` usernames.
    #[serde(default)]
    pub notify: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Overrides the link returned by /dashboard
    #[serde(default)]
    pub dashboard_url: Option<String>,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GoogleConfig {
    pub spreadsheet_id: String,
    #[serde(default = "default_worksheet")]
    pub worksheet: String,
    /// Path to the service account key JSON
    pub credentials_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SqliteConfig {
    #[serde(default = "default_db_path")]
    pub database_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConversationConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_sweep_cron")]
    pub sweep_cron: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    /// Zone for submission timestamps: an IANA name or a fixed "+08:00"
    #[serde(default = "default_time_zone")]
    pub time_zone: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            time_zone: default_time_zone(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_worksheet() -> String {
    "Requests".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("requests.db")
}

fn default_timeout_secs() -> u64 {
    30 * 60
}

fn default_sweep_cron() -> String {
    "0 * * * * *".to_string()
}

fn default_time_zone() -> String {
    "Asia/Manila".to_string()
}

fn default_sqlite_config() -> SqliteConfig {
    SqliteConfig {
        database_path: default_db_path(),
    }
}

fn default_conversation_config() -> ConversationConfig {
    ConversationConfig {
        timeout_secs: default_timeout_secs(),
        sweep_cron: default_sweep_cron(),
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            anyhow::bail!("[telegram] bot_token must not be empty");
        }

        if self.store.backend == StoreBackend::Google {
            let google = self
                .google
                .as_ref()
                .context("[google] section is required when store.backend = \"google\"")?;
            if google.spreadsheet_id.trim().is_empty() {
                anyhow::bail!("[google] spreadsheet_id must not be empty");
            }
            if !google.credentials_path.exists() {
                anyhow::bail!(
                    "[google] credentials_path not found: {}",
                    google.credentials_path.display()
                );
            }
        }

        if self.conversation.timeout_secs == 0 {
            anyhow::bail!("[conversation] timeout_secs must be greater than zero");
        }

        self.time_zone()?;
        Ok(())
    }

    /// Time zone for submission timestamps
    pub fn time_zone(&self) -> Result<Zone> {
        self.general.time_zone.parse::<Zone>().with_context(|| {
            format!(
                "[general] time_zone must be an IANA zone like Asia/Manila or an offset like +08:00, got '{}'",
                self.general.time_zone
            )
        })
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.conversation.timeout_secs)
    }

    pub fn access(&self) -> AccessControl {
        AccessControl::new(&self.telegram.admin_usernames, &self.telegram.notify)
    }
}

/// Zone submissions are stamped in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    Named(Tz),
    Fixed(FixedOffset),
}

impl Zone {
    pub fn now(&self) -> DateTime<FixedOffset> {
        self.localize(Utc::now())
    }

    /// `at` as wall-clock time in this zone, keeping the offset in effect then
    pub fn localize(&self, at: DateTime<Utc>) -> DateTime<FixedOffset> {
        match self {
            Zone::Named(tz) => at.with_timezone(tz).fixed_offset(),
            Zone::Fixed(offset) => at.with_timezone(offset),
        }
    }
}

impl FromStr for Zone {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let value = value.trim();
        if let Ok(tz) = value.parse::<Tz>() {
            return Ok(Zone::Named(tz));
        }
        value
            .parse::<FixedOffset>()
            .map(Zone::Fixed)
            .map_err(|e| anyhow::anyhow!("unknown time zone '{}': {}", value, e))
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Zone::Named(tz) => write!(f, "{}", tz.name()),
            Zone::Fixed(offset) => write!(f, "UTC{}", offset),
        }
    }
}

/// Where to deliver a copy of each recorded request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyTarget {
    Chat(i64),
    Channel(String),
}

/// Admin and notify lists, normalized once at startup
#[derive(Debug, Clone, Default)]
pub struct AccessControl {
    admins: HashSet<String>,
    notify: Vec<NotifyTarget>,
}

impl AccessControl {
    pub fn new(admin_usernames: &[String], notify: &[String]) -> Self {
        let admins = admin_usernames
            .iter()
            .map(|u| normalize_username(u))
            .filter(|u| !u.is_empty())
            .collect();

        let notify = notify
            .iter()
            .map(|entry| entry.trim())
            .filter(|entry| !entry.is_empty())
            .map(|entry| match entry.parse::<i64>() {
                Ok(id) => NotifyTarget::Chat(id),
                Err(_) => NotifyTarget::Channel(format!("@{}", entry.trim_start_matches('@'))),
            })
            .collect();

        Self { admins, notify }
    }

    /// Admin checks go by username; users without one are never admins.
    pub fn is_admin(&self, username: Option<&str>) -> bool {
        match username {
            Some(name) => {
                let name = normalize_username(name);
                !name.is_empty() && self.admins.contains(&name)
            }
            None => false,
        }
    }

    pub fn notify_targets(&self) -> &[NotifyTarget] {
        &self.notify
    }
}

fn normalize_username(name: &str) -> String {
    name.trim().trim_start_matches('@').to_lowercase()
}
