use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

use crate::backend::MailSource;
use crate::error::MailsiftError;
use crate::types::{RemoteId, Watermark};

/// Identifiers strictly above `highest`, ascending and without duplicates.
pub fn resolve_from(listing: Vec<RemoteId>, highest: RemoteId) -> Vec<RemoteId> {
    let mut ids: Vec<RemoteId> = listing.into_iter().filter(|&id| id > highest).collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

/// Everything the remote holds above the watermark.
pub async fn resolve(
    source: &dyn MailSource,
    watermark: &Watermark,
    timeout: Duration,
) -> Result<Vec<RemoteId>, MailsiftError> {
    let listing = tokio::time::timeout(timeout, source.list_identifiers_after(watermark.highest_remote_id))
        .await
        .map_err(|_| MailsiftError::Timeout(format!("listing identifiers exceeded {:?}", timeout)))??;

    let ids = resolve_from(listing, watermark.highest_remote_id);
    debug!(
        epoch = %watermark.epoch,
        watermark = watermark.highest_remote_id,
        pending = ids.len(),
        "Resolved change set"
    );
    Ok(ids)
}

/// Stored identifiers at or below `highest` that the remote no longer lists,
/// ascending. Identifiers above the watermark belong to the change set.
pub fn vanished_from(stored: &[RemoteId], listing: &[RemoteId], highest: RemoteId) -> Vec<RemoteId> {
    let remote: HashSet<RemoteId> = listing.iter().copied().collect();
    let mut ids: Vec<RemoteId> = stored
        .iter()
        .copied()
        .filter(|id| *id <= highest && !remote.contains(id))
        .collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

/// Stored messages deleted on the server since they were synced.
pub async fn vanished(
    source: &dyn MailSource,
    stored: &[RemoteId],
    watermark: &Watermark,
    timeout: Duration,
) -> Result<Vec<RemoteId>, MailsiftError> {
    if stored.is_empty() {
        return Ok(Vec::new());
    }
    let listing = tokio::time::timeout(timeout, source.list_identifiers())
        .await
        .map_err(|_| MailsiftError::Timeout(format!("listing identifiers exceeded {:?}", timeout)))??;

    let ids = vanished_from(stored, &listing, watermark.highest_remote_id);
    debug!(
        epoch = %watermark.epoch,
        stored = stored.len(),
        vanished = ids.len(),
        "Compared stored messages with the remote listing"
    );
    Ok(ids)
}

/// Consecutive chunks of at most `batch_size` identifiers.
pub fn partition(ids: &[RemoteId], batch_size: usize) -> Vec<Vec<RemoteId>> {
    ids.chunks(batch_size.max(1)).map(|c| c.to_vec()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filters_sorts_and_dedups() {
        assert_eq!(resolve_from(vec![103, 90, 101, 102, 101], 100), vec![101, 102, 103]);
    }

    #[test]
    fn test_nothing_new() {
        assert!(resolve_from(vec![5, 7], 7).is_empty());
        assert!(resolve_from(Vec::new(), 0).is_empty());
    }

    #[test]
    fn test_deterministic() {
        let a = resolve_from(vec![3, 1, 2], 0);
        let b = resolve_from(vec![2, 3, 1], 0);
        assert_eq!(a, b);
    }

    #[test]
    fn test_vanished_only_below_watermark() {
        let stored = [101, 102, 103, 110];
        assert_eq!(vanished_from(&stored, &[101, 103], 105), vec![102]);
        assert!(vanished_from(&stored, &[101, 102, 103, 110], 110).is_empty());
        assert_eq!(vanished_from(&[1, 2], &[], 2), vec![1, 2]);
    }

    #[test]
    fn test_partition() {
        assert_eq!(partition(&[101, 102, 103], 2), vec![vec![101, 102], vec![103]]);
        assert!(partition(&[], 2).is_empty());
    }
}
