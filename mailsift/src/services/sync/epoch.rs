//! Mailbox identity tracking
//!
//! A changed epoch (IMAP UIDVALIDITY) invalidates every identifier issued
//! before it, so the only safe response is a full local purge.

use std::time::Duration;
use tracing::{info, warn};

use crate::backend::MailSource;
use crate::error::MailsiftError;
use crate::types::SyncState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EpochCheck {
    Unchanged,
    /// `previous` is None on the very first sync.
    Reset { previous: Option<String> },
}

impl EpochCheck {
    pub fn is_reset(&self) -> bool {
        matches!(self, EpochCheck::Reset { .. })
    }
}

pub fn check_epoch(state: &SyncState, remote_epoch: &str) -> EpochCheck {
    match state.epoch() {
        Some(current) if current == remote_epoch => EpochCheck::Unchanged,
        previous => EpochCheck::Reset {
            previous: previous.map(str::to_string),
        },
    }
}

/// Read the remote epoch. Any failure aborts the cycle before it mutates
/// local state.
pub async fn read_epoch(source: &dyn MailSource, timeout: Duration) -> Result<String, MailsiftError> {
    let epoch = tokio::time::timeout(timeout, source.epoch())
        .await
        .map_err(|_| MailsiftError::Timeout(format!("reading epoch exceeded {:?}", timeout)))?
        .map_err(|e| {
            warn!("Cannot read mailbox epoch, aborting sync: {}", e);
            e
        })?;

    if epoch.trim().is_empty() {
        return Err(MailsiftError::Backend("remote reported an empty epoch".into()));
    }
    info!(epoch = %epoch, "Read mailbox epoch");
    Ok(epoch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Watermark;

    fn state_at(epoch: &str, highest: u64) -> SyncState {
        SyncState {
            watermark: Some(Watermark::new(epoch, highest)),
            index_generation: 3,
            last_sync: None,
        }
    }

    #[test]
    fn test_unchanged() {
        assert_eq!(check_epoch(&state_at("E1", 102), "E1"), EpochCheck::Unchanged);
    }

    #[test]
    fn test_changed_epoch_is_reset() {
        assert_eq!(
            check_epoch(&state_at("E1", 102), "E2"),
            EpochCheck::Reset {
                previous: Some("E1".into())
            }
        );
    }

    #[test]
    fn test_first_sync_is_reset() {
        let check = check_epoch(&SyncState::default(), "E1");
        assert_eq!(check, EpochCheck::Reset { previous: None });
        assert!(check.is_reset());
    }
}
