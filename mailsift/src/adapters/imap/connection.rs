use async_imap::types::{Fetch, Mailbox};
use async_imap::Session;
use async_native_tls::TlsStream;
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info, warn};

use crate::error::MailsiftError;

// An IMAP session is generic over the stream type. Ours is TLS-encrypted
// TCP wrapped in a tokio compat layer.
pub type ImapSession = Session<TlsStream<Compat<TcpStream>>>;

pub struct ImapConnection {
    pub session: ImapSession,
    pub selected: Option<String>,
}

/// Map a protocol error to the sync taxonomy. Lost connections are
/// transient; server refusals are not.
pub fn classify(e: async_imap::error::Error, context: &str) -> MailsiftError {
    match e {
        async_imap::error::Error::Io(e) => MailsiftError::TransientIo(format!("{}: {}", context, e)),
        async_imap::error::Error::ConnectionLost => {
            MailsiftError::TransientIo(format!("{}: connection lost", context))
        }
        other => MailsiftError::Backend(format!("{}: {}", context, other)),
    }
}

impl ImapConnection {
    /// EXAMINE the folder (read-only, never touches \Seen).
    pub async fn examine(&mut self, folder: &str) -> Result<Mailbox, MailsiftError> {
        let mailbox = self
            .session
            .examine(folder)
            .await
            .map_err(|e| classify(e, "EXAMINE failed"))?;
        self.selected = Some(folder.to_string());
        Ok(mailbox)
    }

    pub async fn logout(mut self) {
        if let Err(e) = self.session.logout().await {
            debug!("IMAP logout failed: {}", e);
        }
    }
}

/// Collect a FETCH stream, skipping responses the parser rejects.
pub async fn collect_tolerant<E: std::fmt::Display>(
    stream: impl futures::Stream<Item = Result<Fetch, E>>,
    context: &str,
) -> Vec<Fetch> {
    futures::pin_mut!(stream);
    let mut items = Vec::new();
    while let Some(result) = stream.next().await {
        match result {
            Ok(fetch) => items.push(fetch),
            Err(e) => {
                warn!("Skipping unparseable IMAP response ({}): {}", context, e);
            }
        }
    }
    items
}

pub async fn connect(
    host: &str,
    port: u16,
    username: &str,
    password: &str,
) -> Result<ImapConnection, MailsiftError> {
    info!(host = %host, port = port, "Connecting to IMAP server");

    let tcp = TcpStream::connect((host, port))
        .await
        .map_err(|e| MailsiftError::TransientIo(format!("TCP connection failed: {}", e)))?;

    let tcp = tcp.compat();
    let tls = async_native_tls::TlsConnector::new();
    let tls_stream = tls
        .connect(host, tcp)
        .await
        .map_err(|e| MailsiftError::TransientIo(format!("TLS handshake failed: {}", e)))?;

    let client = async_imap::Client::new(tls_stream);

    let session = client
        .login(username, password)
        .await
        .map_err(|(e, _)| MailsiftError::Auth(format!("Login failed: {}", e)))?;

    Ok(ImapConnection {
        session,
        selected: None,
    })
}
