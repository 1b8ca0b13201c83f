//! Configuration module for watched accounts and relay settings
//!
//! Configuration is read from a JSON document with an `accounts` map
//! (account name to mailbox settings) and an `app` section. Missing numeric
//! fields fall back to defaults; missing credentials are a load-time error.
//! Passwords may be left out of the file and supplied through
//! `MAIL_NOTIFY_<ACCOUNT>_PASS` instead.

use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::errors::{AppError, AppResult};

const DEFAULT_PORT: u16 = 993;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
const DEFAULT_IDLE_TIMEOUT_MINUTES: u64 = 20;
const DEFAULT_FOLDER: &str = "INBOX";
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 60;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY_SECS: u64 = 30;
/// Servers may drop an IDLE connection after 30 minutes (RFC 2177)
const IDLE_TIMEOUT_WARN_MINUTES: u64 = 29;

/// Watched account configuration
///
/// Immutable after load. Shared read-only with the account's monitor task.
/// Passwords are stored using `SecretString` to prevent accidental logging.
#[derive(Debug, Clone)]
pub struct AccountConfig {
    /// Account name as written in the config file
    pub name: String,
    /// IMAP server hostname
    pub host: String,
    /// IMAP server port (implicit TLS)
    pub port: u16,
    /// Username for authentication
    pub user: String,
    /// Password stored in a type that prevents accidental logging
    pub pass: SecretString,
    /// Folder to watch (first configured folder only)
    pub folder: String,
    /// Re-check interval when the server lacks IDLE
    pub poll_interval: Duration,
    /// How long a single IDLE may run before the connection is recycled
    pub idle_timeout: Duration,
    /// Webhook endpoint; `None` disables delivery for this account
    pub webhook_url: Option<String>,
}

/// Timeouts applied to every IMAP network step
#[derive(Debug, Clone, Copy)]
pub struct ImapTimeouts {
    /// TCP connect
    pub connect: Duration,
    /// TLS handshake, greeting and LOGIN
    pub greeting: Duration,
    /// Any other IMAP command round-trip
    pub socket: Duration,
}

/// Process-wide settings
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Liveness URL hit with a GET on every heartbeat; `None` disables it
    pub heartbeat_url: Option<String>,
    /// Interval between heartbeats
    pub heartbeat_interval: Duration,
    /// Consecutive connection failures tolerated before an account is fatal
    pub max_retries: u32,
    /// Fixed delay between a failed attempt and the next one
    pub retry_delay: Duration,
    /// IMAP timeouts shared by all accounts
    pub timeouts: ImapTimeouts,
}

/// Complete relay configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// All configured accounts, keyed by name
    pub accounts: BTreeMap<String, Arc<AccountConfig>>,
    /// Application settings
    pub app: AppConfig,
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    #[serde(default)]
    accounts: BTreeMap<String, FileAccount>,
    #[serde(default)]
    app: FileApp,
}

#[derive(Debug, Default, Deserialize)]
struct FileAccount {
    #[serde(default)]
    server: String,
    #[serde(default)]
    port: u16,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default, alias = "pollinterval")]
    poll_interval: u64,
    #[serde(default, alias = "sendpush")]
    webhook_url: String,
    #[serde(default)]
    folders: Vec<String>,
    /// Minutes
    #[serde(default, alias = "idletimeout")]
    idle_timeout: u64,
}

#[derive(Debug, Default, Deserialize)]
struct FileApp {
    #[serde(default)]
    heartbeat_url: String,
    #[serde(default)]
    heartbeat_interval: u64,
    #[serde(default)]
    max_retries: u32,
    #[serde(default)]
    retry_delay_secs: u64,
    #[serde(default)]
    connect_timeout_ms: u64,
    #[serde(default)]
    greeting_timeout_ms: u64,
    #[serde(default)]
    socket_timeout_ms: u64,
}

impl Config {
    /// Load configuration from a JSON file
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the file cannot be read, is not valid JSON,
    /// lacks required account fields, or defines no accounts.
    pub fn load_from_path(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::InvalidInput(format!("cannot read config file {}: {e}", path.display()))
        })?;
        Self::from_json_str(&raw, |key| env::var(key).ok())
    }

    /// Parse configuration from JSON text
    ///
    /// `lookup_env` resolves fallback environment variables (account
    /// passwords); injected so tests do not touch the process environment.
    pub fn from_json_str<F>(raw: &str, lookup_env: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file: FileConfig = serde_json::from_str(raw)
            .map_err(|e| AppError::InvalidInput(format!("invalid config file: {e}")))?;

        if file.accounts.is_empty() {
            return Err(AppError::invalid("no accounts configured"));
        }

        let mut accounts = BTreeMap::new();
        for (name, raw_account) in file.accounts {
            let account = load_account(&name, raw_account, &lookup_env)?;
            accounts.insert(name, Arc::new(account));
        }

        Ok(Self {
            accounts,
            app: load_app(file.app),
        })
    }
}

/// Validate one account entry and apply defaults
fn load_account<F>(name: &str, raw: FileAccount, lookup_env: &F) -> AppResult<AccountConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let host = required_field(name, "server", raw.server)?;
    let user = required_field(name, "username", raw.username)?;
    let pass_env = format!("MAIL_NOTIFY_{}_PASS", sanitize_segment(name));
    let pass = if raw.password.trim().is_empty() {
        lookup_env(&pass_env).unwrap_or_default()
    } else {
        raw.password
    };
    let pass = required_field(name, &format!("password (or {pass_env})"), pass)?;

    let idle_minutes = non_zero_or(raw.idle_timeout, DEFAULT_IDLE_TIMEOUT_MINUTES);
    if idle_minutes > IDLE_TIMEOUT_WARN_MINUTES {
        tracing::warn!(
            account = %name,
            idle_timeout_minutes = idle_minutes,
            "idle timeout exceeds {IDLE_TIMEOUT_WARN_MINUTES} minutes; servers may drop the connection first"
        );
    }

    let folder = raw
        .folders
        .into_iter()
        .find(|f| !f.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_FOLDER.to_owned());

    Ok(AccountConfig {
        name: name.to_owned(),
        host,
        port: if raw.port == 0 { DEFAULT_PORT } else { raw.port },
        user,
        pass: SecretString::new(pass.into()),
        folder,
        poll_interval: Duration::from_secs(non_zero_or(
            raw.poll_interval,
            DEFAULT_POLL_INTERVAL_SECS,
        )),
        idle_timeout: Duration::from_secs(idle_minutes.saturating_mul(60)),
        webhook_url: non_empty(raw.webhook_url),
    })
}

fn load_app(raw: FileApp) -> AppConfig {
    AppConfig {
        heartbeat_url: non_empty(raw.heartbeat_url),
        heartbeat_interval: Duration::from_secs(non_zero_or(
            raw.heartbeat_interval,
            DEFAULT_HEARTBEAT_INTERVAL_SECS,
        )),
        max_retries: if raw.max_retries == 0 {
            DEFAULT_MAX_RETRIES
        } else {
            raw.max_retries
        },
        retry_delay: Duration::from_secs(non_zero_or(
            raw.retry_delay_secs,
            DEFAULT_RETRY_DELAY_SECS,
        )),
        timeouts: ImapTimeouts {
            connect: Duration::from_millis(non_zero_or(raw.connect_timeout_ms, 30_000)),
            greeting: Duration::from_millis(non_zero_or(raw.greeting_timeout_ms, 15_000)),
            socket: Duration::from_millis(non_zero_or(raw.socket_timeout_ms, 300_000)),
        },
    }
}

/// Require a non-blank string field on an account
fn required_field(account: &str, field: &str, value: String) -> AppResult<String> {
    if value.trim().is_empty() {
        return Err(AppError::InvalidInput(format!(
            "account '{account}' is missing required field {field}"
        )));
    }
    Ok(value)
}

fn non_zero_or(value: u64, default: u64) -> u64 {
    if value == 0 { default } else { value }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

/// Sanitize an account name to uppercase alphanumeric/underscore
///
/// Non-alphanumeric characters are replaced with underscores, and leading/
/// trailing underscores are trimmed.
fn sanitize_segment(seg: &str) -> String {
    let mut out = String::with_capacity(seg.len());
    for ch in seg.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_uppercase());
        } else {
            out.push('_');
        }
    }
    out.trim_matches('_').to_owned()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use secrecy::ExposeSecret;

    use super::{Config, sanitize_segment};

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn applies_defaults_for_missing_numeric_fields() {
        let raw = r#"{
            "accounts": {
                "home": { "server": "imap.example.com", "username": "me", "password": "pw" }
            }
        }"#;
        let config = Config::from_json_str(raw, no_env).expect("config should load");
        let account = &config.accounts["home"];

        assert_eq!(account.port, 993);
        assert_eq!(account.poll_interval, Duration::from_secs(60));
        assert_eq!(account.idle_timeout, Duration::from_secs(20 * 60));
        assert_eq!(account.folder, "INBOX");
        assert!(account.webhook_url.is_none());
        assert_eq!(config.app.max_retries, 3);
        assert_eq!(config.app.retry_delay, Duration::from_secs(30));
        assert_eq!(config.app.heartbeat_interval, Duration::from_secs(60));
        assert!(config.app.heartbeat_url.is_none());
    }

    #[test]
    fn accepts_legacy_key_names_and_honors_first_folder_only() {
        let raw = r#"{
            "accounts": {
                "work": {
                    "server": "imap.example.com",
                    "port": 1993,
                    "username": "me",
                    "password": "pw",
                    "pollinterval": 15,
                    "sendpush": "https://push.example.com/send",
                    "folders": ["Alerts", "INBOX"],
                    "idletimeout": 5
                }
            },
            "app": { "heartbeat_url": "https://status.example.com", "heartbeat_interval": 30 }
        }"#;
        let config = Config::from_json_str(raw, no_env).expect("config should load");
        let account = &config.accounts["work"];

        assert_eq!(account.port, 1993);
        assert_eq!(account.poll_interval, Duration::from_secs(15));
        assert_eq!(account.idle_timeout, Duration::from_secs(5 * 60));
        assert_eq!(account.folder, "Alerts");
        assert_eq!(
            account.webhook_url.as_deref(),
            Some("https://push.example.com/send")
        );
        assert_eq!(
            config.app.heartbeat_url.as_deref(),
            Some("https://status.example.com")
        );
        assert_eq!(config.app.heartbeat_interval, Duration::from_secs(30));
    }

    #[test]
    fn oversized_idle_timeout_saturates() {
        let raw = r#"{
            "accounts": {
                "home": {
                    "server": "imap.example.com",
                    "username": "me",
                    "password": "pw",
                    "idle_timeout": 18446744073709551615
                }
            }
        }"#;
        let config = Config::from_json_str(raw, no_env).expect("config should load");
        assert_eq!(
            config.accounts["home"].idle_timeout,
            Duration::from_secs(u64::MAX)
        );
    }

    #[test]
    fn rejects_account_without_server() {
        let raw = r#"{ "accounts": { "home": { "username": "me", "password": "pw" } } }"#;
        let err = Config::from_json_str(raw, no_env).expect_err("must fail");
        assert!(err.to_string().contains("server"));
    }

    #[test]
    fn rejects_account_without_password_in_file_or_env() {
        let raw = r#"{ "accounts": { "home": { "server": "imap.example.com", "username": "me" } } }"#;
        let err = Config::from_json_str(raw, no_env).expect_err("must fail");
        assert!(err.to_string().contains("MAIL_NOTIFY_HOME_PASS"));
    }

    #[test]
    fn falls_back_to_password_from_environment() {
        let raw = r#"{ "accounts": { "my-box": { "server": "imap.example.com", "username": "me" } } }"#;
        let config = Config::from_json_str(raw, |key| {
            (key == "MAIL_NOTIFY_MY_BOX_PASS").then(|| "from-env".to_owned())
        })
        .expect("config should load");
        assert_eq!(config.accounts["my-box"].pass.expose_secret(), "from-env");
    }

    #[test]
    fn rejects_empty_account_map() {
        let err = Config::from_json_str(r#"{ "accounts": {} }"#, no_env).expect_err("must fail");
        assert!(err.to_string().contains("no accounts"));
    }

    #[test]
    fn sanitize_segment_uppercases_and_replaces_symbols() {
        assert_eq!(sanitize_segment("my-box"), "MY_BOX");
        assert_eq!(sanitize_segment("-work.mail-"), "WORK_MAIL");
    }
}
