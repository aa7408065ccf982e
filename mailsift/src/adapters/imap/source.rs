use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::connection::{collect_tolerant, connect, classify, ImapConnection};
use crate::backend::MailSource;
use crate::config::ResolvedImap;
use crate::error::MailsiftError;
use crate::types::RemoteId;

/// `MailSource` over a single IMAP folder.
///
/// The connection is opened lazily and dropped after any transient error,
/// so the next call (usually a chunk retry) reconnects.
pub struct ImapMailSource {
    settings: ResolvedImap,
    conn: Mutex<Option<ImapConnection>>,
}

impl ImapMailSource {
    pub fn new(settings: ResolvedImap) -> Self {
        Self {
            settings,
            conn: Mutex::new(None),
        }
    }

    /// Lock the connection slot, connecting and examining the folder if
    /// it is empty.
    async fn connection(&self) -> Result<MutexGuard<'_, Option<ImapConnection>>, MailsiftError> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            let s = &self.settings;
            let mut conn = connect(&s.host, s.port, &s.user, &s.password).await?;
            conn.examine(&s.folder).await?;
            *guard = Some(conn);
        }
        Ok(guard)
    }

    pub async fn close(&self) {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.logout().await;
        }
    }
}

/// Drop the connection after a transient error so the next call reconnects.
fn settle<T>(
    slot: &mut Option<ImapConnection>,
    result: Result<T, MailsiftError>,
) -> Result<T, MailsiftError> {
    if let Err(e) = &result {
        if e.is_retryable() {
            debug!("Dropping IMAP connection after transient error: {}", e);
            *slot = None;
        }
    }
    result
}

fn uid_of(remote_id: RemoteId) -> Result<u32, MailsiftError> {
    u32::try_from(remote_id)
        .map_err(|_| MailsiftError::InvalidInput(format!("{} is not a valid IMAP UID", remote_id)))
}

async fn search_after(
    conn: &mut ImapConnection,
    start: u32,
    highest: RemoteId,
) -> Result<Vec<RemoteId>, MailsiftError> {
    let uid_set = conn
        .session
        .uid_search(format!("UID {}:*", start))
        .await
        .map_err(|e| classify(e, "SEARCH failed"))?;

    // "n:*" always matches the last message, even below n
    let mut uids: Vec<RemoteId> = uid_set
        .into_iter()
        .map(RemoteId::from)
        .filter(|&uid| uid > highest)
        .collect();
    uids.sort_unstable();
    Ok(uids)
}

async fn fetch_body(
    conn: &mut ImapConnection,
    uid: u32,
    folder: &str,
) -> Result<Option<Vec<u8>>, MailsiftError> {
    let stream = conn
        .session
        .uid_fetch(uid.to_string(), "(UID BODY.PEEK[])")
        .await
        .map_err(|e| classify(e, "FETCH failed"))?;
    let fetches = collect_tolerant(stream, &format!("body in {}", folder)).await;

    // No FETCH response means the UID was expunged
    Ok(fetches
        .iter()
        .find(|f| f.uid == Some(uid))
        .and_then(|f| f.body())
        .map(|b| b.to_vec()))
}

#[async_trait]
impl MailSource for ImapMailSource {
    async fn epoch(&self) -> Result<String, MailsiftError> {
        let mut guard = self.connection().await?;
        let folder = self.settings.folder.as_str();
        let result = match guard.as_mut() {
            // Re-examine so a UIDVALIDITY change during a long run is seen
            Some(conn) => conn.examine(folder).await.and_then(|mailbox| {
                let validity = mailbox.uid_validity.ok_or_else(|| {
                    MailsiftError::Backend(format!("{} did not report UIDVALIDITY", folder))
                })?;
                info!(folder = %folder, uid_validity = validity, exists = mailbox.exists, "Examined folder");
                Ok(validity.to_string())
            }),
            None => Err(MailsiftError::Backend("IMAP connection unavailable".into())),
        };
        settle(&mut guard, result)
    }

    async fn list_identifiers(&self) -> Result<Vec<RemoteId>, MailsiftError> {
        self.list_identifiers_after(0).await
    }

    async fn list_identifiers_after(&self, highest: RemoteId) -> Result<Vec<RemoteId>, MailsiftError> {
        let start = uid_of(highest.saturating_add(1).min(u64::from(u32::MAX)))?;
        let mut guard = self.connection().await?;
        let result = match guard.as_mut() {
            Some(conn) => search_after(conn, start, highest).await,
            None => Err(MailsiftError::Backend("IMAP connection unavailable".into())),
        };
        settle(&mut guard, result)
    }

    async fn fetch_raw(&self, remote_id: RemoteId) -> Result<Option<Vec<u8>>, MailsiftError> {
        let uid = uid_of(remote_id)?;
        let mut guard = self.connection().await?;
        let result = match guard.as_mut() {
            Some(conn) => fetch_body(conn, uid, &self.settings.folder).await,
            None => Err(MailsiftError::Backend("IMAP connection unavailable".into())),
        };
        settle(&mut guard, result)
    }

    fn describe(&self) -> String {
        format!(
            "imap://{}@{}:{}/{}",
            self.settings.user, self.settings.host, self.settings.port, self.settings.folder
        )
    }
}
