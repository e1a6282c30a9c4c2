//! IMAP transport and session operations
//!
//! Implements [`MailTransport`] and [`MailSession`] on top of `async-imap`.
//! Every network step is bounded by a timeout derived from server config, and
//! all connections use TLS.

use std::sync::Arc;
use std::time::Duration;

use async_imap::types::Fetch;
use async_imap::{Client, Session};
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::config::{AccountConfig, ServerConfig};
use crate::errors::{AppError, AppResult};
use crate::transport::{FetchedMessage, FolderHandle, MailSession, MailTransport, SequenceSet};

/// Type alias for authenticated IMAP session over TLS
pub type ImapSession = Session<tokio_rustls::client::TlsStream<TcpStream>>;

/// Fetch query for full message bodies without setting `\Seen`
const BODY_QUERY: &str = "BODY.PEEK[]";

/// Session factory for one configured account
pub struct ImapTransport {
    server: Arc<ServerConfig>,
    account: AccountConfig,
}

impl ImapTransport {
    pub fn new(server: Arc<ServerConfig>, account: AccountConfig) -> Self {
        Self { server, account }
    }
}

impl MailTransport for ImapTransport {
    type Session = ImapMailSession;

    async fn open(&self) -> AppResult<ImapMailSession> {
        let session = connect_authenticated(&self.server, &self.account).await?;
        info!(account = %self.account.account_id, host = %self.account.host, "IMAP session opened");
        Ok(ImapMailSession {
            session,
            socket_timeout: self.server.socket_timeout(),
            selected: None,
        })
    }
}

/// Authenticated session plus the folder it has selected
pub struct ImapMailSession {
    session: ImapSession,
    socket_timeout: Duration,
    selected: Option<String>,
}

impl MailSession for ImapMailSession {
    async fn select_folder(&mut self, folder: &str) -> AppResult<FolderHandle> {
        let name = folder.to_uppercase();
        let encoded = utf7_imap::encode_utf7_imap(name.clone());
        let mailbox = timeout(self.socket_timeout, self.session.select(&encoded))
            .await
            .map_err(|_| AppError::Timeout(format!("SELECT timed out for folder '{name}'")))
            .and_then(|r| {
                r.map_err(|e| AppError::Folder(format!("cannot select folder '{name}': {e}")))
            })?;

        debug!(folder = %name, exists = mailbox.exists, "folder selected");
        self.selected = Some(name.clone());
        Ok(FolderHandle {
            name,
            total: mailbox.exists,
        })
    }

    async fn search_unseen(&mut self) -> AppResult<Vec<u32>> {
        if self.selected.is_none() {
            return Err(AppError::Search("no folder selected".to_owned()));
        }
        let set = timeout(self.socket_timeout, self.session.search("UNSEEN"))
            .await
            .map_err(|_| AppError::Timeout("SEARCH timed out".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Search(format!("search failed: {e}"))))?;
        let mut seqs: Vec<u32> = set.into_iter().collect();
        seqs.sort_unstable();
        Ok(seqs)
    }

    async fn fetch(
        &mut self,
        set: SequenceSet,
    ) -> AppResult<BoxStream<'_, AppResult<FetchedMessage>>> {
        let set = set.to_string();
        let socket_timeout = self.socket_timeout;
        let fetches = timeout(socket_timeout, self.session.fetch(set.clone(), BODY_QUERY))
            .await
            .map_err(|_| AppError::Timeout("FETCH timed out".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Fetch(format!("fetch {set} failed: {e}"))))?;

        // Bound the wait for each message rather than the whole batch.
        let messages = stream::unfold(Box::pin(fetches), move |mut inner| async move {
            loop {
                let item = match timeout(socket_timeout, inner.next()).await {
                    Err(_) => Err(AppError::Timeout("FETCH stream timed out".to_owned())),
                    Ok(None) => return None,
                    Ok(Some(Err(e))) => Err(AppError::Fetch(format!("fetch stream failed: {e}"))),
                    Ok(Some(Ok(fetch))) => match to_fetched(&fetch) {
                        Some(message) => Ok(message),
                        None => {
                            debug!(seq = fetch.message, "skipping FETCH response without a body");
                            continue;
                        }
                    },
                };
                return Some((item, inner));
            }
        });
        Ok(messages.boxed())
    }

    async fn close(mut self) {
        match timeout(self.socket_timeout, self.session.logout()).await {
            Ok(Ok(())) => debug!("IMAP session logged out"),
            Ok(Err(e)) => warn!("IMAP logout failed: {e}"),
            Err(_) => warn!("IMAP logout timed out"),
        }
    }
}

/// Copy a FETCH response into an owned message
///
/// Unsolicited responses such as FLAGS updates carry no body and yield `None`.
fn to_fetched(fetch: &Fetch) -> Option<FetchedMessage> {
    fetched_message(fetch.message, fetch.body())
}

fn fetched_message(seq: u32, body: Option<&[u8]>) -> Option<FetchedMessage> {
    body.map(|body| FetchedMessage {
        seq,
        body: body.to_vec(),
    })
}

/// Connect to IMAP server and authenticate
///
/// Performs full connection sequence with timeouts:
/// 1. TCP connect
/// 2. TLS handshake
/// 3. Read IMAP greeting
/// 4. LOGIN authentication
///
/// # Security
///
/// Rejects insecure connections (`secure: false`) to prevent password exposure.
/// Certificates are checked against the webpki roots unless the account opts
/// into `accept_invalid_certs`.
///
/// # Errors
///
/// - `InvalidInput` if `secure` is false or hostname is invalid for TLS SNI
/// - `Timeout` if any connection phase times out
/// - `AuthFailed` if authentication fails
/// - `Connection` for TCP, TLS, or greeting failures
pub async fn connect_authenticated(
    server: &ServerConfig,
    account: &AccountConfig,
) -> AppResult<ImapSession> {
    if !account.secure {
        return Err(AppError::InvalidInput(
            "insecure IMAP is not supported; set MAIL_IMAP_<ACCOUNT>_SECURE=true".to_owned(),
        ));
    }

    let greeting_duration = server.greeting_timeout();

    let tcp = timeout(
        server.connect_timeout(),
        TcpStream::connect((account.host.as_str(), account.port)),
    )
    .await
    .map_err(|_| AppError::Timeout("tcp connect timeout".to_owned()))
    .and_then(|r| r.map_err(|e| AppError::Connection(format!("tcp connect failed: {e}"))))?;

    let connector = tls_connector(account.accept_invalid_certs);
    let server_name = ServerName::try_from(account.host.clone())
        .map_err(|_| AppError::InvalidInput("invalid IMAP host for TLS SNI".to_owned()))?;
    let tls_stream = timeout(greeting_duration, connector.connect(server_name, tcp))
        .await
        .map_err(|_| AppError::Timeout("TLS handshake timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Connection(format!("TLS handshake failed: {e}"))))?;

    let mut client = Client::new(tls_stream);
    let greeting = timeout(greeting_duration, client.read_response())
        .await
        .map_err(|_| AppError::Timeout("IMAP greeting timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Connection(format!("IMAP greeting failed: {e}"))))?;

    if greeting.is_none() {
        return Err(AppError::Connection(
            "IMAP server closed connection before greeting".to_owned(),
        ));
    }

    let pass = account.pass.expose_secret();
    let session = timeout(greeting_duration, client.login(account.user.as_str(), pass))
        .await
        .map_err(|_| AppError::Timeout("IMAP login timeout".to_owned()))
        .and_then(|r| {
            r.map_err(|(e, _)| {
                let msg = e.to_string();
                if msg.to_ascii_lowercase().contains("auth") || msg.contains("LOGIN") {
                    AppError::AuthFailed(msg)
                } else {
                    AppError::Connection(msg)
                }
            })
        })?;

    Ok(session)
}

fn tls_connector(accept_invalid_certs: bool) -> TlsConnector {
    let tls_config = if accept_invalid_certs {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    TlsConnector::from(Arc::new(tls_config))
}

/// Certificate verifier for servers with self-signed certificates
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
