use std::{
    collections::BTreeSet,
    env, fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::{domain::UserId, errors::Error, Result};

/// Default config location when none is given on the command line.
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

pub const DEFAULT_JOIN_CONFIRM_TEMPLATE: &str =
    "新加群的用户 {name} ({user_id}) 请用 Reaction {reaction} 回复本条消息";

/// Typed configuration, read once at startup from a YAML document.
#[derive(Clone, Debug)]
pub struct Config {
    pub matrix: MatrixConfig,
    pub logging: LoggingConfig,
    pub allowed_servers: BTreeSet<String>,
    pub dry_run: bool,
    pub join_confirm_template: String,
}

#[derive(Clone, Debug)]
pub struct MatrixConfig {
    pub user_id: UserId,
    pub homeserver_url: String,
    pub credentials: Credentials,
    pub device_id: Option<String>,
    pub device_name: String,
}

/// How the bot authenticates. An access token wins over a password.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credentials {
    Token(String),
    Password(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub file_logging: FileLogging,
    #[serde(default)]
    pub console_logging: ConsoleLogging,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            file_logging: FileLogging::default(),
            console_logging: ConsoleLogging::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct FileLogging {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_log_filepath")]
    pub filepath: PathBuf,
}

impl Default for FileLogging {
    fn default() -> Self {
        Self {
            enabled: false,
            filepath: default_log_filepath(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ConsoleLogging {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ConsoleLogging {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_log_filepath() -> PathBuf {
    PathBuf::from("bot.log")
}

fn default_true() -> bool {
    true
}

// On-disk shape. Kept separate so validation produces typed values (UserId, Credentials).
#[derive(Debug, Deserialize)]
struct RawConfig {
    matrix: RawMatrix,
    #[serde(default)]
    logging: LoggingConfig,
    #[serde(default)]
    allowed_servers: Vec<String>,
    #[serde(default)]
    dry_run: bool,
    #[serde(default)]
    messages: RawMessages,
}

#[derive(Debug, Deserialize)]
struct RawMatrix {
    user_id: Option<String>,
    user_password: Option<String>,
    user_token: Option<String>,
    homeserver_url: Option<String>,
    device_id: Option<String>,
    device_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawMessages {
    join_confirm: Option<String>,
}

impl Config {
    /// Read and validate the YAML config at `path`, then apply env overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        let mut raw: RawConfig = serde_yaml::from_str(&text)?;
        apply_env_overrides(&mut raw);
        Self::from_raw(raw)
    }

    /// Parse a YAML document without touching the environment.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let raw: RawConfig = serde_yaml::from_str(text)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        let user_id = raw
            .matrix
            .user_id
            .and_then(non_empty)
            .ok_or_else(|| Error::Config("matrix.user_id is required".to_string()))?;
        let user_id = UserId::parse(&user_id)
            .map_err(|e| Error::Config(format!("matrix.user_id: {e}")))?;

        let homeserver_url = raw
            .matrix
            .homeserver_url
            .and_then(non_empty)
            .ok_or_else(|| Error::Config("matrix.homeserver_url is required".to_string()))?;
        if !(homeserver_url.starts_with("http://") || homeserver_url.starts_with("https://")) {
            return Err(Error::Config(format!(
                "matrix.homeserver_url must be an http(s) URL, got {homeserver_url}"
            )));
        }
        let homeserver_url = homeserver_url.trim_end_matches('/').to_string();

        let credentials = match (
            raw.matrix.user_token.and_then(non_empty),
            raw.matrix.user_password.and_then(non_empty),
        ) {
            (Some(token), _) => Credentials::Token(token),
            (None, Some(password)) => Credentials::Password(password),
            (None, None) => {
                return Err(Error::Config(
                    "one of matrix.user_token or matrix.user_password is required".to_string(),
                ))
            }
        };

        let allowed_servers = raw
            .allowed_servers
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        if raw.logging.file_logging.enabled
            && raw.logging.file_logging.filepath.as_os_str().is_empty()
        {
            return Err(Error::Config(
                "logging.file_logging.filepath is required when file logging is enabled"
                    .to_string(),
            ));
        }

        Ok(Self {
            matrix: MatrixConfig {
                user_id,
                homeserver_url,
                credentials,
                device_id: raw.matrix.device_id.and_then(non_empty),
                device_name: raw
                    .matrix
                    .device_name
                    .and_then(non_empty)
                    .unwrap_or_else(|| "jose-bot".to_string()),
            },
            logging: raw.logging,
            allowed_servers,
            dry_run: raw.dry_run,
            join_confirm_template: raw
                .messages
                .join_confirm
                .and_then(non_empty)
                .unwrap_or_else(|| DEFAULT_JOIN_CONFIRM_TEMPLATE.to_string()),
        })
    }
}

/// Secrets and the dry-run switch may come from the environment instead of the file.
fn apply_env_overrides(raw: &mut RawConfig) {
    if let Some(pw) = env_str("JOSE_USER_PASSWORD").and_then(non_empty) {
        raw.matrix.user_password = Some(pw);
    }
    if let Some(token) = env_str("JOSE_USER_TOKEN").and_then(non_empty) {
        raw.matrix.user_token = Some(token);
    }
    if let Some(dry_run) = env_bool("JOSE_DRY_RUN") {
        raw.dry_run = dry_run;
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
