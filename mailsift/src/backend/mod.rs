//! Mail retrieval seam
//!
//! The sync engine only talks to a `MailSource`. The IMAP adapter in
//! `adapters::imap` is the production implementation; `memory` backs tests
//! and offline runs.

pub mod memory;

use async_trait::async_trait;

use crate::error::MailsiftError;
use crate::types::RemoteId;
pub use memory::MemoryMailSource;

#[async_trait]
pub trait MailSource: Send + Sync {
    /// Current identity token of the mailbox (IMAP UIDVALIDITY).
    async fn epoch(&self) -> Result<String, MailsiftError>;

    /// Every identifier in the mailbox, ascending.
    async fn list_identifiers(&self) -> Result<Vec<RemoteId>, MailsiftError>;

    /// Identifiers strictly above `highest`, ascending. Sources that can
    /// search server-side override this.
    async fn list_identifiers_after(&self, highest: RemoteId) -> Result<Vec<RemoteId>, MailsiftError> {
        let all = self.list_identifiers().await?;
        Ok(all.into_iter().filter(|&id| id > highest).collect())
    }

    /// Raw RFC 5322 bytes, or None if the message no longer exists.
    async fn fetch_raw(&self, remote_id: RemoteId) -> Result<Option<Vec<u8>>, MailsiftError>;

    /// Short human-readable name for logs.
    fn describe(&self) -> String;
}
