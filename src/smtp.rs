//! Outbound mail over SMTP
//!
//! One stateless send per call with `lettre`. Implicit TLS relay by default,
//! STARTTLS when the account asks for it.

use std::time::Duration;

use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use secrecy::ExposeSecret;
use tracing::info;

use crate::config::SmtpConfig;
use crate::errors::{AppError, AppResult};
use crate::models::DeliveryInfo;

/// Message content for one send
#[derive(Debug, Clone)]
pub struct OutgoingEmail {
    pub receiver: String,
    pub subject: String,
    pub text: String,
    pub html: String,
}

/// Send `email` through the account's SMTP relay
///
/// # Errors
///
/// - `InvalidInput` for malformed addresses or relay host
/// - `Delivery` if the relay rejects the message or the connection fails
pub async fn send_email(
    smtp: &SmtpConfig,
    email: &OutgoingEmail,
    timeout: Duration,
) -> AppResult<DeliveryInfo> {
    let message = build_message(&smtp.from, email)?;

    let builder = if smtp.starttls {
        AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.host)
    } else {
        AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.host)
    }
    .map_err(|e| AppError::InvalidInput(format!("invalid SMTP host '{}': {e}", smtp.host)))?;

    let transport = builder
        .port(smtp.port)
        .credentials(Credentials::new(
            smtp.user.clone(),
            smtp.pass.expose_secret().to_owned(),
        ))
        .timeout(Some(timeout))
        .build();

    let response = transport
        .send(message)
        .await
        .map_err(|e| AppError::Delivery(format!("SMTP send to '{}' failed: {e}", email.receiver)))?;

    info!(receiver = %email.receiver, code = %response.code(), "message handed to SMTP relay");
    Ok(DeliveryInfo {
        receiver: email.receiver.clone(),
        accepted: response.is_positive(),
        response_code: response.code().to_string(),
        response_message: response.message().map(str::to_owned).collect(),
    })
}

/// Build a `multipart/alternative` message with text and HTML bodies
fn build_message(from: &str, email: &OutgoingEmail) -> AppResult<Message> {
    let from: Mailbox = from
        .parse()
        .map_err(|e| AppError::InvalidInput(format!("invalid sender address '{from}': {e}")))?;
    let to: Mailbox = email.receiver.parse().map_err(|e| {
        AppError::InvalidInput(format!("invalid receiver address '{}': {e}", email.receiver))
    })?;

    Message::builder()
        .from(from)
        .to(to)
        .subject(email.subject.as_str())
        .multipart(MultiPart::alternative_plain_html(
            email.text.clone(),
            email.html.clone(),
        ))
        .map_err(|e| AppError::Internal(format!("failed to build message: {e}")))
}
