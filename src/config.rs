use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const BOT_TOKEN_VAR: &str = "SLACK_BOT_TOKEN";
pub const APP_TOKEN_VAR: &str = "SLACK_APP_TOKEN";
pub const SECRET_KEY_VAR: &str = "SECRET_KEY";

/// Dotenv file read from the working directory at startup
pub const ENV_FILE: &str = ".env";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub usage: UsageConfig,
    #[serde(default)]
    pub totp: TotpConfig,
    #[serde(default)]
    pub slack: SlackConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BotConfig {
    /// Exact, case-sensitive text that triggers a code reply
    #[serde(default = "default_trigger")]
    pub trigger: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UsageConfig {
    #[serde(default = "default_usage_enabled")]
    pub enabled: bool,
    #[serde(default = "default_data_file")]
    pub data_file: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TotpConfig {
    #[serde(default = "default_digits")]
    pub digits: u32,
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SlackConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

fn default_trigger() -> String {
    "!shopify".to_string()
}

fn default_usage_enabled() -> bool {
    true
}

fn default_data_file() -> PathBuf {
    PathBuf::from("/app/data/user_usage.json")
}

fn default_digits() -> u32 {
    6
}

fn default_period_secs() -> u64 {
    30
}

fn default_api_base_url() -> String {
    "https://slack.com/api".to_string()
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            trigger: default_trigger(),
        }
    }
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            enabled: default_usage_enabled(),
            data_file: default_data_file(),
        }
    }
}

impl Default for TotpConfig {
    fn default() -> Self {
        Self {
            digits: default_digits(),
            period_secs: default_period_secs(),
        }
    }
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
        }
    }
}

impl Config {
    /// Load settings from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;

        if config.bot.trigger.is_empty() {
            anyhow::bail!("[bot] trigger must not be empty");
        }
        if config.totp.period_secs == 0 {
            anyhow::bail!("[totp] period_secs must be greater than zero");
        }
        if !(1..=9).contains(&config.totp.digits) {
            anyhow::bail!("[totp] digits must be between 1 and 9");
        }

        Ok(config)
    }
}

/// Read `KEY=value` pairs from a dotenv file without touching the process
/// environment. A missing file yields nothing; an unreadable one is logged
/// and ignored.
pub fn read_env_file(path: &Path) -> HashMap<String, String> {
    let entries = match dotenvy::from_path_iter(path) {
        Ok(iter) => iter.collect::<std::result::Result<HashMap<_, _>, _>>(),
        Err(e) if e.not_found() => return HashMap::new(),
        Err(e) => Err(e),
    };

    match entries {
        Ok(vars) => {
            info!("Loaded {} variable(s) from {}", vars.len(), path.display());
            vars
        }
        Err(e) => {
            warn!("Error loading {}: {}", path.display(), e);
            HashMap::new()
        }
    }
}

/// Credentials that must be present before the bot connects anywhere.
#[derive(Clone)]
pub struct Secrets {
    pub bot_token: String,
    pub app_token: String,
    pub totp_secret: String,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets").finish_non_exhaustive()
    }
}

impl Secrets {
    /// Secrets from the process environment, falling back to `.env`.
    pub fn from_env() -> Result<Self> {
        let file_vars = read_env_file(Path::new(ENV_FILE));
        Self::from_sources(|name| std::env::var(name).ok(), &file_vars)
    }

    /// A non-empty value from `env` wins over the dotenv file.
    pub fn from_sources<F>(env: F, file_vars: &HashMap<String, String>) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::from_lookup(|name| {
            env(name)
                .filter(|value| !value.trim().is_empty())
                .or_else(|| file_vars.get(name).cloned())
        })
    }

    /// Resolve every secret through `lookup`, failing with the full list of
    /// variables that are unset or empty.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut missing = Vec::new();
        let mut fetch = |name: &'static str| {
            match lookup(name).filter(|value| !value.trim().is_empty()) {
                Some(value) => value,
                None => {
                    missing.push(name);
                    String::new()
                }
            }
        };

        let bot_token = fetch(BOT_TOKEN_VAR);
        let app_token = fetch(APP_TOKEN_VAR);
        let totp_secret = fetch(SECRET_KEY_VAR);

        if !missing.is_empty() {
            anyhow::bail!(
                "Missing environment variables: {}. Ensure {}, {} and {} are set.",
                missing.join(", "),
                BOT_TOKEN_VAR,
                APP_TOKEN_VAR,
                SECRET_KEY_VAR
            );
        }

        Ok(Self {
            bot_token,
            app_token,
            totp_secret,
        })
    }
}
