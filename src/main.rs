//! email-mcp-rs: Email MCP server over stdio
//!
//! Reads unread messages from IMAP folders and sends mail over SMTP for
//! clients speaking the Model Context Protocol (MCP). Connections are TLS
//! only, and every retrieval runs under a deadline.
//!
//! # Architecture
//!
//! - [`main`]: Process entry point with env loading and stdio serving
//! - [`config`]: Environment-driven configuration for accounts and server settings
//! - [`errors`]: Application error model with MCP error mapping
//! - [`transport`]: Session transport traits and sequence-set arithmetic
//! - [`imap`]: `async-imap` implementation of the transport with timeout wrappers
//! - [`barrier`]: Completion barrier for a dynamically sized set of parse jobs
//! - [`retrieval`]: Connect/select/search/fetch/close state machine
//! - [`mime`]: Message parsing and header/body extraction
//! - [`smtp`]: Outbound delivery via `lettre`
//! - [`server`]: MCP tool handlers with validation and business orchestration
//! - [`models`]: Input/output DTOs and schema-bearing types

mod barrier;
mod config;
mod errors;
mod imap;
mod mime;
mod models;
mod retrieval;
mod server;
mod smtp;
mod transport;

use std::time::Duration;

use config::ServerConfig;
use rmcp::ServiceExt;
use rmcp::transport::stdio;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How long in-flight tool calls get to wind down after Ctrl-C
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Application entry point
///
/// Initializes tracing from environment, loads config, and serves the MCP
/// server over stdio. Ctrl-C cancels in-flight retrievals before the process
/// exits.
///
/// # Environment Variables
///
/// See [`ServerConfig::load_from_env`] for full configuration options.
///
/// # Example
///
/// ```no_run
/// MAIL_IMAP_DEFAULT_HOST=imap.example.com \
/// MAIL_IMAP_DEFAULT_USER=user@example.com \
/// MAIL_IMAP_DEFAULT_PASS=secret \
/// MAIL_SMTP_DEFAULT_HOST=smtp.example.com \
/// cargo run
/// ```
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = ServerConfig::load_from_env()?;
    info!(accounts = config.accounts.len(), "configuration loaded");

    let shutdown = CancellationToken::new();
    let service = server::EmailServer::new(config, shutdown.clone())
        .serve(stdio())
        .await?;

    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, cancelling in-flight operations");
                ctrl_c.cancel();
            }
            Err(e) => warn!("cannot listen for interrupt: {e}"),
        }
    });

    let waiting = service.waiting();
    tokio::pin!(waiting);
    tokio::select! {
        result = &mut waiting => {
            result?;
            return Ok(());
        }
        () = shutdown.cancelled() => {}
    }

    // Cancelled retrievals log out within their forced-close grace.
    if let Ok(result) = tokio::time::timeout(SHUTDOWN_GRACE, &mut waiting).await {
        result?;
    }
    info!("shutdown complete");
    Ok(())
}
