//! Input/output DTOs and schema-bearing types
//!
//! Defines all data structures used in MCP tool contracts. Each type is
//! annotated with `JsonSchema` for automatic schema generation.

use chrono::{SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::mime::ParsedMessage;

/// Metadata included in all tool responses
///
/// Provides timing information and current UTC timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Meta {
    /// Current UTC timestamp in RFC 3339 format with milliseconds
    pub now_utc: String,
    /// Tool execution duration in milliseconds
    pub duration_ms: u64,
}

impl Meta {
    /// Create metadata populated with current time and elapsed duration
    pub fn now(duration_ms: u64) -> Self {
        Self {
            now_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            duration_ms,
        }
    }
}

/// Standard response envelope for all tools
///
/// Wraps tool-specific data with human-readable summary and execution metadata.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolEnvelope<T>
where
    T: JsonSchema,
{
    /// Human-readable summary of the operation outcome
    pub summary: String,
    /// Tool-specific data payload
    pub data: T,
    /// Execution metadata (timestamp, duration)
    pub meta: Meta,
}

/// Account metadata (no credentials)
///
/// Returned by `list_accounts`. Password is intentionally excluded.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AccountInfo {
    /// Account identifier
    pub account_id: String,
    /// IMAP server hostname
    pub host: String,
    /// IMAP server port
    pub port: u16,
    /// Whether TLS is enabled (always true in this implementation)
    pub secure: bool,
    /// Whether `send_email` is available for this account
    pub smtp_enabled: bool,
}

/// Payload of `verify_account`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VerifyInfo {
    pub account_id: String,
    pub ok: bool,
    /// Time to connect and authenticate
    pub latency_ms: u64,
}

/// One mailbox address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MailAddress {
    /// Display name, if present
    pub name: Option<String>,
    /// Address in `local@domain` form
    pub address: String,
}

/// One retrieved message as reported by `read_emails`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EmailRecord {
    /// Sequence number within the folder at fetch time
    pub seq: u32,
    pub from: Vec<MailAddress>,
    /// Date header, RFC 3339 UTC when parseable
    pub date: Option<String>,
    /// Message-ID this message replies to
    pub in_reply_to: Option<String>,
    pub reply_to: Vec<MailAddress>,
    pub to: Vec<MailAddress>,
    pub subject: Option<String>,
    /// Plain text body
    pub text: Option<String>,
}

impl From<ParsedMessage> for EmailRecord {
    fn from(msg: ParsedMessage) -> Self {
        Self {
            seq: msg.seq,
            from: msg.from,
            date: msg.date,
            in_reply_to: msg.in_reply_to,
            reply_to: msg.reply_to,
            to: msg.to,
            subject: msg.subject,
            text: msg.text,
        }
    }
}

/// Payload of `read_emails`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReadEmailsData {
    pub account_id: String,
    pub folder: String,
    /// Parsed messages in arrival order; fetch order is not preserved
    pub emails: Vec<EmailRecord>,
}

/// Payload of `send_email`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DeliveryInfo {
    pub receiver: String,
    /// Whether the SMTP server accepted the message
    pub accepted: bool,
    /// SMTP reply code (e.g. `250`)
    pub response_code: String,
    /// SMTP reply text lines
    pub response_message: Vec<String>,
}

/// Input: account_id only
///
/// Used by `verify_account`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct AccountOnlyInput {
    /// Account identifier (defaults to `"default"`)
    #[serde(default = "default_account_id")]
    pub account_id: String,
}

/// Input: read unread emails from a folder
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ReadEmailsInput {
    /// Account identifier (defaults to `"default"`)
    #[serde(default = "default_account_id")]
    pub account_id: String,
    /// The email folder to read from (e.g. `INBOX`)
    pub folder: String,
    /// The number of emails to read; values above 100 are clamped
    #[serde(rename = "noEmails")]
    pub no_emails: u32,
}

/// Input: send an email
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SendEmailInput {
    /// Account identifier (defaults to `"default"`)
    #[serde(default = "default_account_id", rename = "account_id")]
    pub account_id: String,
    /// The receiver's email address
    pub receiver: String,
    /// The subject of the email
    pub subject: String,
    /// The text content of the email
    pub text_content: String,
    /// The html content of the email
    pub html_content: String,
}

/// Default value for `account_id` field
pub fn default_account_id() -> String {
    "default".to_owned()
}
