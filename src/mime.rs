//! Message parsing
//!
//! Parses a fetched RFC822 message with `mailparse` into the fields the
//! `read_emails` tool reports: addresses, threading headers, subject,
//! normalized date and a plain-text body. HTML-only messages are rendered to
//! text with `html2text`.

use chrono::{DateTime, SecondsFormat, Utc};
use mailparse::{DispositionType, MailAddr, MailHeaderMap, ParsedMail};

use crate::errors::{AppError, AppResult};
use crate::models::MailAddress;

/// Column width used when rendering HTML bodies to text
const HTML_RENDER_WIDTH: usize = 100;

/// Parsed message representation
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMessage {
    /// Sequence number the message was fetched at
    pub seq: u32,
    pub from: Vec<MailAddress>,
    pub to: Vec<MailAddress>,
    pub reply_to: Vec<MailAddress>,
    pub in_reply_to: Option<String>,
    pub subject: Option<String>,
    /// RFC 3339 UTC when the Date header parses, raw header text otherwise
    pub date: Option<String>,
    /// Plain text body
    pub text: Option<String>,
}

/// Parse RFC822 message bytes into a [`ParsedMessage`]
///
/// # Errors
///
/// - `Parse` if `mailparse` rejects the input or the message has no headers
pub fn parse_message(seq: u32, raw: &[u8]) -> AppResult<ParsedMessage> {
    let parsed = mailparse::parse_mail(raw).map_err(|e| AppError::Parse {
        seq,
        cause: e.to_string(),
    })?;
    if parsed.headers.is_empty() {
        return Err(AppError::Parse {
            seq,
            cause: "message has no headers".to_owned(),
        });
    }

    let mut body_text = None;
    let mut body_html = None;
    walk_parts(&parsed, &mut body_text, &mut body_html);

    let text = body_text.or_else(|| body_html.as_deref().and_then(html_to_text));

    Ok(ParsedMessage {
        seq,
        from: address_header(&parsed, "From"),
        to: address_header(&parsed, "To"),
        reply_to: address_header(&parsed, "Reply-To"),
        in_reply_to: non_empty(parsed.headers.get_first_value("In-Reply-To")),
        subject: non_empty(parsed.headers.get_first_value("Subject")),
        date: parsed
            .headers
            .get_first_value("Date")
            .map(|raw| normalize_date(&raw)),
        text,
    })
}

/// Walk MIME part tree recursively
///
/// Keeps the first inline text/plain and text/html bodies; attachments are
/// skipped.
fn walk_parts(
    part: &ParsedMail<'_>,
    body_text: &mut Option<String>,
    body_html: &mut Option<String>,
) {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            walk_parts(sub, body_text, body_html);
        }
        return;
    }

    let disp = part.get_content_disposition();
    let is_attachment = disp.disposition == DispositionType::Attachment
        || disp.params.contains_key("filename");
    if is_attachment {
        return;
    }

    let ctype = part.ctype.mimetype.to_ascii_lowercase();
    if ctype == "text/plain"
        && body_text.is_none()
        && let Ok(text) = part.get_body()
    {
        *body_text = Some(text);
    }

    if ctype == "text/html"
        && body_html.is_none()
        && let Ok(html) = part.get_body()
    {
        *body_html = Some(html);
    }
}

/// Parse an address-list header, flattening groups into their members
fn address_header(parsed: &ParsedMail<'_>, key: &str) -> Vec<MailAddress> {
    let Some(header) = parsed.headers.get_first_header(key) else {
        return Vec::new();
    };
    let Ok(list) = mailparse::addrparse_header(header) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for addr in list.into_inner() {
        match addr {
            MailAddr::Single(single) => out.push(MailAddress {
                name: single.display_name,
                address: single.addr,
            }),
            MailAddr::Group(group) => {
                out.extend(group.addrs.into_iter().map(|single| MailAddress {
                    name: single.display_name,
                    address: single.addr,
                }));
            }
        }
    }
    out
}

/// RFC 3339 UTC form of a `Date` header, or the trimmed header text when it
/// is not a valid RFC 2822 date
fn normalize_date(raw: &str) -> String {
    let trimmed = raw.trim();
    // Trailing zone comments such as "(PDT)" are not part of the grammar chrono accepts.
    let without_comment = match trimmed.rfind('(') {
        Some(idx) if trimmed.ends_with(')') => trimmed[..idx].trim_end(),
        _ => trimmed,
    };
    DateTime::parse_from_rfc2822(without_comment).map_or_else(
        |_| trimmed.to_owned(),
        |dt| dt.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::Secs, true),
    )
}

fn html_to_text(html: &str) -> Option<String> {
    html2text::from_read(html.as_bytes(), HTML_RENDER_WIDTH).ok()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}
