//! Configuration module for mail accounts and server settings
//!
//! All configuration is loaded from environment variables. IMAP settings follow
//! `MAIL_IMAP_<SEGMENT>_<KEY>` and outbound SMTP settings follow
//! `MAIL_SMTP_<SEGMENT>_<KEY>`. Account segments are discovered by scanning for
//! `MAIL_IMAP_*_HOST` variables.

use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use regex::Regex;
use secrecy::SecretString;

use crate::errors::{AppError, AppResult};
use crate::transport::WindowBasis;

/// Snapshot of the process environment used for configuration lookups
type EnvMap = BTreeMap<String, String>;

/// Mail account configuration
///
/// Holds IMAP connection details and credentials for a single account, plus
/// optional SMTP settings for outbound mail. Passwords are stored using
/// `SecretString` to prevent accidental logging.
#[derive(Debug, Clone)]
pub struct AccountConfig {
    /// Account identifier (lowercase, used as default `account_id` parameter)
    pub account_id: String,
    /// IMAP server hostname
    pub host: String,
    /// IMAP server port (typically 993 for TLS)
    pub port: u16,
    /// Whether to use TLS (currently enforced to `true`)
    pub secure: bool,
    /// Skip server certificate verification (self-signed local bridges)
    pub accept_invalid_certs: bool,
    /// How the fetch window for `read_emails` is sized
    pub window: WindowBasis,
    /// Username for authentication
    pub user: String,
    /// Password stored in a type that prevents accidental logging
    pub pass: SecretString,
    /// Outbound SMTP settings, if configured
    pub smtp: Option<SmtpConfig>,
}

/// Outbound SMTP configuration for one account
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    /// SMTP port (465 for implicit TLS, 587 for STARTTLS)
    pub port: u16,
    /// Upgrade a plain connection with STARTTLS instead of implicit TLS
    pub starttls: bool,
    pub user: String,
    pub pass: SecretString,
    /// Envelope and header sender address
    pub from: String,
}

/// Server-wide configuration
///
/// Wraps all account configs and global server settings. Cloned into MCP tool
/// handlers via `Arc` for thread-safe shared access.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// All configured accounts, keyed by `account_id`
    pub accounts: BTreeMap<String, AccountConfig>,
    /// TCP connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// IMAP greeting/TLS handshake timeout in milliseconds
    pub greeting_timeout_ms: u64,
    /// Socket I/O timeout in milliseconds
    pub socket_timeout_ms: u64,
    /// Deadline for a whole `read_emails` retrieval in milliseconds
    pub retrieve_timeout_ms: u64,
}

impl ServerConfig {
    /// Load all configuration from environment variables
    ///
    /// Discovers accounts by scanning for `MAIL_IMAP_*_HOST` patterns.
    /// If no accounts are explicitly defined, a `default` account is required
    /// via `MAIL_IMAP_DEFAULT_HOST`, `MAIL_IMAP_DEFAULT_USER`, and
    /// `MAIL_IMAP_DEFAULT_PASS`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if required environment variables are missing
    /// or malformed.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// MAIL_IMAP_DEFAULT_HOST=imap.gmail.com
    /// MAIL_IMAP_DEFAULT_USER=user@gmail.com
    /// MAIL_IMAP_DEFAULT_PASS=app-password
    /// MAIL_SMTP_DEFAULT_HOST=smtp.gmail.com
    /// MAIL_IMAP_WORK_HOST=outlook.office365.com
    /// MAIL_IMAP_WORK_USER=user@company.com
    /// MAIL_IMAP_WORK_PASS=work-pass
    /// MAIL_IMAP_WORK_WINDOW=folder
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        let vars: EnvMap = env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        Self::load_from_vars(&vars)
    }

    fn load_from_vars(vars: &EnvMap) -> AppResult<Self> {
        let account_pattern = Regex::new(r"^MAIL_IMAP_([A-Z0-9_]+)_HOST$")
            .map_err(|e| AppError::Internal(format!("invalid account regex: {e}")))?;

        let mut account_segments: Vec<String> = vars
            .keys()
            .filter_map(|k| {
                account_pattern
                    .captures(k)
                    .and_then(|c| c.get(1).map(|m| m.as_str().to_owned()))
            })
            .collect();

        if account_segments.is_empty() {
            account_segments.push("DEFAULT".to_owned());
        }

        account_segments.sort();
        account_segments.dedup();

        let mut accounts = BTreeMap::new();
        for seg in account_segments {
            let account = load_account(vars, &seg)?;
            accounts.insert(account.account_id.clone(), account);
        }

        Ok(Self {
            accounts,
            connect_timeout_ms: parse_u64_env(vars, "MAIL_IMAP_CONNECT_TIMEOUT_MS", 30_000)?,
            greeting_timeout_ms: parse_u64_env(vars, "MAIL_IMAP_GREETING_TIMEOUT_MS", 15_000)?,
            socket_timeout_ms: parse_u64_env(vars, "MAIL_IMAP_SOCKET_TIMEOUT_MS", 300_000)?,
            retrieve_timeout_ms: parse_u64_env(vars, "MAIL_IMAP_RETRIEVE_TIMEOUT_MS", 120_000)?,
        })
    }

    /// Get account configuration by ID
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the account ID is not configured.
    pub fn get_account(&self, account_id: &str) -> AppResult<&AccountConfig> {
        self.accounts
            .get(account_id)
            .ok_or_else(|| AppError::NotFound(format!("account '{account_id}' is not configured")))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn greeting_timeout(&self) -> Duration {
        Duration::from_millis(self.greeting_timeout_ms)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    pub fn retrieve_timeout(&self) -> Duration {
        Duration::from_millis(self.retrieve_timeout_ms)
    }
}

/// Load a single account configuration from environment
///
/// Reads `MAIL_IMAP_<SEGMENT>_HOST`, `_USER`, `_PASS`, `_PORT`, `_SECURE`,
/// `_ACCEPT_INVALID_CERTS` and `_WINDOW`, then the optional SMTP block.
/// Normalizes the segment name to lowercase for `account_id` (except `DEFAULT`
/// becomes `default`).
fn load_account(vars: &EnvMap, segment: &str) -> AppResult<AccountConfig> {
    let segment = sanitize_segment(segment);
    let prefix = format!("MAIL_IMAP_{segment}_");
    let host = required_env(vars, &format!("{prefix}HOST"))?;
    let user = required_env(vars, &format!("{prefix}USER"))?;
    let pass = required_env(vars, &format!("{prefix}PASS"))?;
    let window = match vars.get(&format!("{prefix}WINDOW")) {
        Some(v) => v.parse::<WindowBasis>()?,
        None => WindowBasis::default(),
    };
    let smtp = load_smtp(vars, &segment, &user, &pass)?;

    Ok(AccountConfig {
        account_id: if segment == "DEFAULT" {
            "default".to_owned()
        } else {
            segment.to_ascii_lowercase()
        },
        host,
        port: parse_u16_env(vars, &format!("{prefix}PORT"), 993)?,
        secure: parse_bool_env(vars, &format!("{prefix}SECURE"), true)?,
        accept_invalid_certs: parse_bool_env(
            vars,
            &format!("{prefix}ACCEPT_INVALID_CERTS"),
            false,
        )?,
        window,
        user,
        pass: SecretString::new(pass.into()),
        smtp,
    })
}

/// Load the optional SMTP block for an account
///
/// SMTP is enabled when `MAIL_SMTP_<SEGMENT>_HOST` is set. Credentials fall
/// back to the IMAP ones, which is how most providers issue app passwords.
fn load_smtp(
    vars: &EnvMap,
    segment: &str,
    imap_user: &str,
    imap_pass: &str,
) -> AppResult<Option<SmtpConfig>> {
    let prefix = format!("MAIL_SMTP_{segment}_");
    let Some(host) = optional_env(vars, &format!("{prefix}HOST")) else {
        return Ok(None);
    };
    let user = optional_env(vars, &format!("{prefix}USER")).unwrap_or_else(|| imap_user.to_owned());
    let pass = optional_env(vars, &format!("{prefix}PASS")).unwrap_or_else(|| imap_pass.to_owned());
    let from = optional_env(vars, &format!("{prefix}FROM")).unwrap_or_else(|| user.clone());

    Ok(Some(SmtpConfig {
        host,
        port: parse_u16_env(vars, &format!("{prefix}PORT"), 465)?,
        starttls: parse_bool_env(vars, &format!("{prefix}STARTTLS"), false)?,
        user,
        pass: SecretString::new(pass.into()),
        from,
    }))
}

/// Read a required environment variable, returning error if missing or empty
fn required_env(vars: &EnvMap, key: &str) -> AppResult<String> {
    optional_env(vars, key).ok_or_else(|| {
        AppError::InvalidInput(format!("missing required environment variable {key}"))
    })
}

fn optional_env(vars: &EnvMap, key: &str) -> Option<String> {
    vars.get(key).filter(|v| !v.trim().is_empty()).cloned()
}

/// Sanitize an account segment to uppercase alphanumeric/underscore
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

/// Parse a boolean environment variable with flexible values
///
/// Accepts: `1`, `true`, `yes`, `y`, `on` (truthy) or `0`, `false`, `no`,
/// `n`, `off` (falsy). Case-insensitive. Returns `default` if unset.
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set to an unrecognized value.
fn parse_bool_env(vars: &EnvMap, key: &str, default: bool) -> AppResult<bool> {
    match vars.get(key) {
        Some(v) => parse_bool_value(v).ok_or_else(|| {
            AppError::InvalidInput(format!("invalid boolean environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a `u16` environment variable with default fallback
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set but not a valid `u16`.
fn parse_u16_env(vars: &EnvMap, key: &str, default: u16) -> AppResult<u16> {
    match vars.get(key) {
        Some(v) => v.trim().parse::<u16>().map_err(|_| {
            AppError::InvalidInput(format!("invalid u16 environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

/// Parse a `u64` environment variable with default fallback
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set but not a valid `u64`.
fn parse_u64_env(vars: &EnvMap, key: &str, default: u64) -> AppResult<u64> {
    match vars.get(key) {
        Some(v) => v.trim().parse::<u64>().map_err(|_| {
            AppError::InvalidInput(format!("invalid u64 environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}
