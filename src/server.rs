//! MCP server implementation with tool handlers
//!
//! Implements the `ServerHandler` trait and registers the email tools. Handles
//! input validation, business logic orchestration, and response formatting.

use std::sync::Arc;
use std::time::Instant;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{ErrorData, ServerCapabilities, ServerInfo};
use rmcp::{Json, ServerHandler, tool, tool_handler, tool_router};
use schemars::JsonSchema;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::ServerConfig;
use crate::errors::{AppError, AppResult};
use crate::imap::ImapTransport;
use crate::models::{
    AccountInfo, AccountOnlyInput, DeliveryInfo, EmailRecord, Meta, ReadEmailsData,
    ReadEmailsInput, SendEmailInput, ToolEnvelope, VerifyInfo,
};
use crate::retrieval::{self, RetrievalRequest};
use crate::smtp::{self, OutgoingEmail};
use crate::transport::{MailSession, MailTransport};

/// Most messages fetched by one `read_emails` call; larger requests are clamped
const MAX_READ_EMAILS: u32 = 100;

/// Email MCP server
///
/// Holds shared configuration and the shutdown token. Implements MCP tool
/// handlers via `#[tool]` attribute macro and `ServerHandler` trait.
#[derive(Clone)]
pub struct EmailServer {
    /// Server config (accounts, timeouts)
    config: Arc<ServerConfig>,
    /// Cancelled on shutdown; aborts in-flight retrievals
    shutdown: CancellationToken,
    /// Tool router for dispatching MCP tool calls
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl EmailServer {
    /// Create a new MCP server instance
    pub fn new(config: ServerConfig, shutdown: CancellationToken) -> Self {
        Self {
            config: Arc::new(config),
            shutdown,
            tool_router: Self::tool_router(),
        }
    }

    /// Tool: List configured mail accounts
    ///
    /// Returns account metadata (host, port, secure, SMTP availability)
    /// without exposing credentials.
    #[tool(name = "list_accounts", description = "List configured mail accounts")]
    async fn list_accounts(&self) -> Result<Json<ToolEnvelope<Vec<AccountInfo>>>, ErrorData> {
        let started = Instant::now();
        let data = self
            .config
            .accounts
            .values()
            .map(|a| AccountInfo {
                account_id: a.account_id.clone(),
                host: a.host.clone(),
                port: a.port,
                secure: a.secure,
                smtp_enabled: a.smtp.is_some(),
            })
            .collect::<Vec<_>>();
        finalize_tool(
            started,
            Ok((format!("{} account(s) configured", data.len()), data)),
        )
    }

    /// Tool: Verify account connectivity
    ///
    /// Opens an authenticated IMAP session and logs out again.
    #[tool(
        name = "verify_account",
        description = "Verify that an account can connect and log in"
    )]
    async fn verify_account(
        &self,
        Parameters(input): Parameters<AccountOnlyInput>,
    ) -> Result<Json<ToolEnvelope<VerifyInfo>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.verify_account_impl(input)
                .await
                .map(|data| ("Account verification succeeded".to_owned(), data)),
        )
    }

    /// Tool: Read unread emails from a folder
    ///
    /// Fetches up to `noEmails` unread messages and returns them parsed.
    /// Messages that fail to parse are left out.
    #[tool(name = "read_emails", description = "Read the emails from the account.")]
    async fn read_emails(
        &self,
        Parameters(input): Parameters<ReadEmailsInput>,
    ) -> Result<Json<ToolEnvelope<ReadEmailsData>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.read_emails_impl(input)
                .await
                .map(|data| {
                    (
                        format!("{} email(s) read from {}", data.emails.len(), data.folder),
                        data,
                    )
                }),
        )
    }

    /// Tool: Send an email
    ///
    /// Sends a `multipart/alternative` message with text and HTML bodies
    /// through the account's SMTP relay.
    #[tool(
        name = "send_email",
        description = "Send an email to the given email address."
    )]
    async fn send_email(
        &self,
        Parameters(input): Parameters<SendEmailInput>,
    ) -> Result<Json<ToolEnvelope<DeliveryInfo>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.send_email_impl(input).await.map(|data| {
                let summary = if data.accepted {
                    format!("Email sent to {}", data.receiver)
                } else {
                    format!("Email to {} was not accepted", data.receiver)
                };
                (summary, data)
            }),
        )
    }
}

/// MCP server handler implementation
///
/// Provides server info and capabilities to MCP client.
#[tool_handler(router = self.tool_router)]
impl ServerHandler for EmailServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo::new(ServerCapabilities::builder().enable_tools().build()).with_instructions(
            "Email MCP server. read_emails returns unread messages from an IMAP folder; send_email requires MAIL_SMTP_<ACCOUNT>_HOST.",
        )
    }
}

/// Tool implementation methods
///
/// Private methods handle the actual business logic for each tool, separated
/// from the public `#[tool]` methods that handle response formatting.
impl EmailServer {
    async fn verify_account_impl(&self, input: AccountOnlyInput) -> AppResult<VerifyInfo> {
        validate_account_id(&input.account_id)?;
        let account = self.config.get_account(&input.account_id)?;
        let transport = ImapTransport::new(Arc::clone(&self.config), account.clone());

        let started = Instant::now();
        let session = transport.open().await?;
        let latency_ms = duration_ms(started);
        session.close().await;

        Ok(VerifyInfo {
            account_id: account.account_id.clone(),
            ok: true,
            latency_ms,
        })
    }

    async fn read_emails_impl(&self, input: ReadEmailsInput) -> AppResult<ReadEmailsData> {
        validate_account_id(&input.account_id)?;
        validate_folder(&input.folder)?;
        let count = clamp_count(input.no_emails);
        let account = self.config.get_account(&input.account_id)?;

        let transport = ImapTransport::new(Arc::clone(&self.config), account.clone());
        let request = RetrievalRequest {
            folder: input.folder,
            count,
            window: account.window,
            timeout: self.config.retrieve_timeout(),
        };
        let messages = retrieval::retrieve(&transport, &request, &self.shutdown).await?;

        Ok(ReadEmailsData {
            account_id: account.account_id.clone(),
            folder: request.folder,
            emails: messages.into_iter().map(EmailRecord::from).collect(),
        })
    }

    async fn send_email_impl(&self, input: SendEmailInput) -> AppResult<DeliveryInfo> {
        validate_account_id(&input.account_id)?;
        validate_header_text(&input.receiver, "receiver")?;
        validate_header_text(&input.subject, "subject")?;
        let account = self.config.get_account(&input.account_id)?;
        let smtp_config = account.smtp.as_ref().ok_or_else(|| {
            AppError::InvalidInput(format!(
                "SMTP is not configured for account '{}'; set MAIL_SMTP_<ACCOUNT>_HOST",
                account.account_id
            ))
        })?;

        let email = OutgoingEmail {
            receiver: input.receiver,
            subject: input.subject,
            text: input.text_content,
            html: input.html_content,
        };
        smtp::send_email(smtp_config, &email, self.config.socket_timeout()).await
    }
}

/// Milliseconds elapsed since `started`
fn duration_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Wrap a tool result in the response envelope or map its error
fn finalize_tool<T>(
    started: Instant,
    result: AppResult<(String, T)>,
) -> Result<Json<ToolEnvelope<T>>, ErrorData>
where
    T: JsonSchema,
{
    match result {
        Ok((summary, data)) => Ok(Json(ToolEnvelope {
            summary,
            data,
            meta: Meta::now(duration_ms(started)),
        })),
        Err(e) => {
            error!("tool failed: {e}");
            Err(e.to_error_data())
        }
    }
}

/// Validate account ID format
fn validate_account_id(account_id: &str) -> AppResult<()> {
    if account_id.is_empty() || account_id.len() > 64 {
        return Err(AppError::InvalidInput(
            "account_id must be 1..64 characters".to_owned(),
        ));
    }
    if !account_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(AppError::InvalidInput(
            "account_id must only contain letters, digits, '_' or '-'".to_owned(),
        ));
    }
    Ok(())
}

/// Validate folder name length and characters
fn validate_folder(folder: &str) -> AppResult<()> {
    if folder.trim().is_empty() || folder.len() > 256 {
        return Err(AppError::InvalidInput(
            "folder must be 1..256 characters".to_owned(),
        ));
    }
    validate_no_controls(folder, "folder")
}

fn clamp_count(requested: u32) -> u32 {
    if requested > MAX_READ_EMAILS {
        debug!(requested, max = MAX_READ_EMAILS, "clamping noEmails");
    }
    requested.min(MAX_READ_EMAILS)
}

/// Reject values that would break a header line
fn validate_header_text(value: &str, field: &str) -> AppResult<()> {
    if value.len() > 998 {
        return Err(AppError::InvalidInput(format!(
            "{field} must be at most 998 characters"
        )));
    }
    validate_no_controls(value, field)
}

fn validate_no_controls(value: &str, field: &str) -> AppResult<()> {
    if value.chars().any(char::is_control) {
        return Err(AppError::InvalidInput(format!(
            "{field} must not contain control characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{clamp_count, validate_account_id, validate_folder, validate_header_text};

    #[test]
    fn rejects_control_chars_in_folder() {
        let err = validate_folder("INBOX\r").expect_err("must fail");
        assert!(err.to_string().contains("control characters"));
    }

    #[test]
    fn rejects_empty_or_oversized_folder() {
        assert!(validate_folder("  ").is_err());
        assert!(validate_folder(&"a".repeat(257)).is_err());
        validate_folder("Archive/2024").expect("nested folder is valid");
    }

    #[test]
    fn large_counts_are_clamped_not_rejected() {
        assert_eq!(clamp_count(0), 0);
        assert_eq!(clamp_count(100), 100);
        assert_eq!(clamp_count(150), 100);
        assert_eq!(clamp_count(u32::MAX), 100);
    }

    #[test]
    fn account_id_must_be_simple_token() {
        validate_account_id("default").expect("valid");
        validate_account_id("work-2").expect("valid");
        assert!(validate_account_id("").is_err());
        assert!(validate_account_id("a b").is_err());
    }

    #[test]
    fn header_text_rejects_line_breaks() {
        let err =
            validate_header_text("Hi\r\nBcc: x@example.com", "subject").expect_err("must fail");
        assert!(err.to_string().contains("subject"));
    }
}
