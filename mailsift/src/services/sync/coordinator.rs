//! Persistence coordinator
//!
//! The only writer of sync-originated data. A batch moves the metadata
//! rows, the vector index and the watermark together: the SQLite
//! transaction and the index undo journal either both commit or both roll
//! back, and readers are held off by the index write lock until the pair is
//! settled.

use rusqlite::Transaction;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::adapters::sqlite;
use crate::error::MailsiftError;
use crate::index::{persist, IndexTxn, VectorIndex};
use crate::logging::fmt_ms;
use crate::state::{verify_bijection, LocalState, OpenMode};
use crate::types::{Batch, RemoteId, Slot, SyncState, Watermark};

#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub slots: Vec<(RemoteId, Slot)>,
    pub state: SyncState,
    /// Messages that replaced an existing row under the same id
    pub replaced: usize,
    /// False when the index files could not be written; the next open
    /// rebuilds from metadata.
    pub persisted: bool,
}

fn require_writable(local: &LocalState) -> Result<(), MailsiftError> {
    if local.mode() != OpenMode::ReadWrite {
        return Err(MailsiftError::InvalidInput("state is open read-only".into()));
    }
    Ok(())
}

/// Atomically apply a batch. Replaying a batch that already committed
/// replaces each message's entry and never grows the slot count.
pub fn commit(local: &LocalState, batch: &Batch) -> Result<CommitOutcome, MailsiftError> {
    require_writable(local)?;
    let start = Instant::now();

    let mut index = local.write_index()?;
    let mut conn = local.pool().get()?;
    let current = sqlite::sync_state::load_sync_state(&conn)?;

    match current.epoch() {
        Some(epoch) if epoch == batch.epoch => {}
        other => {
            return Err(MailsiftError::Consistency(format!(
                "batch for epoch {} but store is at {:?}",
                batch.epoch, other
            )))
        }
    }
    if current.index_generation != index.generation() {
        return Err(MailsiftError::Consistency(format!(
            "index generation {} does not match store generation {}",
            index.generation(),
            current.index_generation
        )));
    }

    let tx = conn.transaction()?;
    let mut txn = index.begin();

    let (slots, next, replaced) = match apply(&tx, &mut txn, batch, &current) {
        Ok(applied) => applied,
        Err(e) => {
            txn.rollback();
            return Err(e);
        }
    };

    // Dropping the journal unfinished undoes the index if this fails
    tx.commit()?;
    txn.commit();
    index.set_generation(next.index_generation);
    drop(conn);
    let persisted = settle(local, &mut index, next.index_generation)?;

    info!(
        epoch = %batch.epoch,
        messages = batch.messages.len(),
        skipped = batch.skipped.len(),
        watermark = next.highest_remote_id(),
        generation = next.index_generation,
        "Committed batch in {}",
        fmt_ms(start.elapsed())
    );

    Ok(CommitOutcome {
        slots,
        state: next,
        replaced,
        persisted,
    })
}

/// Check the bijection after a commit and write the index files. A broken
/// bijection is repaired from metadata before the write lock is released.
fn settle(local: &LocalState, index: &mut VectorIndex, generation: u64) -> Result<bool, MailsiftError> {
    let conn = local.pool().get()?;
    let verified = verify_bijection(&conn, index);
    drop(conn);
    if let Err(e) = verified {
        error!(generation, "Invariant broken after commit, rebuilding index: {}", e);
        local.rebuild_locked(index)?;
        return Ok(true);
    }

    match persist::save(&local.index_dir(), index) {
        Ok(()) => Ok(true),
        Err(e) => {
            warn!(generation, "Failed to persist index: {}", e);
            Ok(false)
        }
    }
}

/// Result of dropping messages the server no longer holds.
#[derive(Debug, Clone)]
pub struct RemovalOutcome {
    pub removed: Vec<RemoteId>,
    pub state: SyncState,
    pub persisted: bool,
}

/// Atomically drop the rows, skip markers and index entries of messages
/// deleted on the server. The watermark does not move.
pub fn remove(local: &LocalState, epoch: &str, ids: &[RemoteId]) -> Result<RemovalOutcome, MailsiftError> {
    require_writable(local)?;

    let mut index = local.write_index()?;
    let mut conn = local.pool().get()?;
    let current = sqlite::sync_state::load_sync_state(&conn)?;

    if current.epoch() != Some(epoch) {
        return Err(MailsiftError::Consistency(format!(
            "removal for epoch {} but store is at {:?}",
            epoch,
            current.epoch()
        )));
    }
    if current.index_generation != index.generation() {
        return Err(MailsiftError::Consistency(format!(
            "index generation {} does not match store generation {}",
            index.generation(),
            current.index_generation
        )));
    }
    if ids.is_empty() {
        return Ok(RemovalOutcome {
            removed: Vec::new(),
            state: current,
            persisted: true,
        });
    }

    let tx = conn.transaction()?;
    let mut txn = index.begin();

    let (removed, next) = match apply_removal(&tx, &mut txn, ids, &current) {
        Ok(applied) => applied,
        Err(e) => {
            txn.rollback();
            return Err(e);
        }
    };

    tx.commit()?;
    txn.commit();
    index.set_generation(next.index_generation);
    drop(conn);
    let persisted = settle(local, &mut index, next.index_generation)?;

    info!(
        epoch = %epoch,
        removed = removed.len(),
        generation = next.index_generation,
        "Removed messages deleted on the server"
    );
    Ok(RemovalOutcome {
        removed,
        state: next,
        persisted,
    })
}

fn apply(
    tx: &Transaction,
    txn: &mut IndexTxn<'_>,
    batch: &Batch,
    current: &SyncState,
) -> Result<(Vec<(RemoteId, Slot)>, SyncState, usize), MailsiftError> {
    let mut slots = Vec::with_capacity(batch.messages.len());
    let mut replaced = 0;

    for message in &batch.messages {
        let record = &message.record;
        if record.epoch != batch.epoch {
            return Err(MailsiftError::Consistency(format!(
                "message {} is from epoch {}, batch is {}",
                record.remote_id, record.epoch, batch.epoch
            )));
        }

        if let Some(previous_hash) = sqlite::messages::content_hash(tx, record.remote_id)? {
            replaced += 1;
            if previous_hash != record.content_hash {
                debug!(remote_id = record.remote_id, "Content changed under the same id, replacing");
            }
        }
        if let Some(old_slot) = txn.remove_remote(record.remote_id) {
            debug!(remote_id = record.remote_id, slot = old_slot, "Freed previous slot");
        }

        sqlite::messages::upsert_message(tx, record, &message.embedding)?;
        let slot = txn.insert(record.remote_id, &message.embedding)?;
        sqlite::messages::set_slot(tx, record.remote_id, slot)?;
        sqlite::skipped::clear_skipped(tx, record.remote_id)?;
        slots.push((record.remote_id, slot));
    }

    for skipped in &batch.skipped {
        sqlite::skipped::record_skipped(tx, &batch.epoch, skipped)?;
    }

    let highest = current.highest_remote_id().max(batch.covers_up_to);
    let next = SyncState {
        watermark: Some(Watermark::new(batch.epoch.clone(), highest)),
        index_generation: current.index_generation + 1,
        last_sync: Some(chrono::Utc::now().timestamp_millis()),
    };
    sqlite::sync_state::write_sync_state(tx, &next)?;

    Ok((slots, next, replaced))
}

fn apply_removal(
    tx: &Transaction,
    txn: &mut IndexTxn<'_>,
    ids: &[RemoteId],
    current: &SyncState,
) -> Result<(Vec<RemoteId>, SyncState), MailsiftError> {
    let mut removed = Vec::with_capacity(ids.len());
    for &remote_id in ids {
        let had_row = sqlite::messages::delete_message(tx, remote_id)?;
        let had_slot = txn.remove_remote(remote_id).is_some();
        sqlite::skipped::clear_skipped(tx, remote_id)?;
        if had_row || had_slot {
            removed.push(remote_id);
        }
    }

    let next = SyncState {
        watermark: current.watermark.clone(),
        index_generation: current.index_generation + 1,
        last_sync: Some(chrono::Utc::now().timestamp_millis()),
    };
    sqlite::sync_state::write_sync_state(tx, &next)?;
    Ok((removed, next))
}

/// Drop every record, skip marker and index entry and start `new_epoch`
/// from zero. Safe to re-run; a purge onto an already-empty state at the
/// same epoch changes nothing.
pub fn purge(local: &LocalState, new_epoch: &str) -> Result<SyncState, MailsiftError> {
    require_writable(local)?;

    let mut index = local.write_index()?;
    let mut conn = local.pool().get()?;
    let current = sqlite::sync_state::load_sync_state(&conn)?;

    let already_empty = current.epoch() == Some(new_epoch)
        && current.highest_remote_id() == 0
        && index.is_empty()
        && sqlite::messages::all_slots(&conn)?.is_empty();
    if already_empty {
        debug!(epoch = %new_epoch, "Purge: state already empty");
        return Ok(current);
    }

    let tx = conn.transaction()?;
    let removed = sqlite::messages::delete_all(&tx)?;
    let unskipped = sqlite::skipped::delete_all(&tx)?;
    let next = SyncState {
        watermark: Some(Watermark::reset(new_epoch)),
        index_generation: current.index_generation + 1,
        last_sync: current.last_sync,
    };
    sqlite::sync_state::write_sync_state(&tx, &next)?;
    tx.commit()?;
    drop(conn);

    index.clear();
    index.set_generation(next.index_generation);

    if let Err(e) = persist::save(&local.index_dir(), &index) {
        warn!(generation = next.index_generation, "Failed to persist purged index: {}", e);
    }

    info!(
        previous = ?current.epoch(),
        epoch = %new_epoch,
        removed,
        skipped = unskipped,
        "Purged local state for new epoch"
    );
    Ok(next)
}

/// Re-drive the index to the metadata store after a consistency failure.
pub fn recover(local: &LocalState) -> Result<usize, MailsiftError> {
    require_writable(local)?;
    warn!("Recovering index from metadata store");
    local.rebuild_index()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::hnsw::HnswParams;
    use crate::state::StateOptions;
    use crate::types::{MessageRecord, PreparedMessage, SkippedMessage};
    use std::time::Duration;
    use tempfile::TempDir;

    const DIM: usize = 8;

    fn open(dir: &TempDir) -> LocalState {
        LocalState::open(
            dir.path(),
            StateOptions {
                dimension: DIM,
                index: HnswParams::default(),
                busy_timeout: Duration::from_millis(500),
                mode: OpenMode::ReadWrite,
            },
        )
        .unwrap()
    }

    fn vector(seed: u64) -> Vec<f32> {
        (0..DIM).map(|i| ((seed as usize * 7 + i * 3) % 11) as f32 + 1.0).collect()
    }

    fn message(epoch: &str, remote_id: RemoteId, body: &str) -> PreparedMessage {
        PreparedMessage {
            record: MessageRecord {
                remote_id,
                epoch: epoch.into(),
                subject: format!("subject {}", remote_id),
                sender: "a@example.com".into(),
                timestamp: 1_700_000_000 + remote_id as i64,
                body_excerpt: body.into(),
                has_verification_code: false,
                content_hash: crate::services::sync::helpers::normalization::content_hash(body),
                slot: None,
            },
            embedding: vector(remote_id),
        }
    }

    fn batch(epoch: &str, ids: &[RemoteId]) -> Batch {
        Batch {
            epoch: epoch.into(),
            messages: ids.iter().map(|&id| message(epoch, id, "body")).collect(),
            skipped: Vec::new(),
            covers_up_to: *ids.iter().max().unwrap_or(&0),
        }
    }

    #[test]
    fn test_commit_assigns_slots_and_advances_watermark() {
        let dir = TempDir::new().unwrap();
        let local = open(&dir);
        purge(&local, "E1").unwrap();

        let outcome = commit(&local, &batch("E1", &[101, 102])).unwrap();
        assert_eq!(outcome.slots.len(), 2);
        assert_eq!(outcome.state.highest_remote_id(), 102);
        assert!(outcome.persisted);
        local.check_invariants().unwrap();

        let state = local.load_sync_state().unwrap();
        assert_eq!(state, outcome.state);
        assert_eq!(local.read_index().unwrap().generation(), state.index_generation);
    }

    #[test]
    fn test_replay_does_not_grow_slots() {
        let dir = TempDir::new().unwrap();
        let local = open(&dir);
        purge(&local, "E1").unwrap();

        commit(&local, &batch("E1", &[1, 2, 3])).unwrap();
        let replay = commit(&local, &batch("E1", &[1, 2, 3])).unwrap();
        assert_eq!(replay.replaced, 3);
        assert_eq!(local.read_index().unwrap().len(), 3);
        assert_eq!(sqlite::messages::slotted_count(local.pool()).unwrap(), 3);
        local.check_invariants().unwrap();
    }

    #[test]
    fn test_wrong_epoch_is_consistency_error() {
        let dir = TempDir::new().unwrap();
        let local = open(&dir);
        purge(&local, "E1").unwrap();

        let err = commit(&local, &batch("E2", &[1])).unwrap_err();
        assert!(matches!(err, MailsiftError::Consistency(_)));
        assert_eq!(local.read_index().unwrap().len(), 0);
    }

    #[test]
    fn test_failed_commit_rolls_back_both_stores() {
        let dir = TempDir::new().unwrap();
        let local = open(&dir);
        purge(&local, "E1").unwrap();
        commit(&local, &batch("E1", &[1])).unwrap();

        // Second message has a zero vector, which the index rejects
        let mut bad = batch("E1", &[2, 3]);
        bad.messages[1].embedding = vec![0.0; DIM];
        assert!(commit(&local, &bad).is_err());

        assert_eq!(local.read_index().unwrap().len(), 1);
        assert_eq!(sqlite::messages::message_count(local.pool()).unwrap(), 1);
        assert_eq!(local.load_sync_state().unwrap().highest_remote_id(), 1);
        local.check_invariants().unwrap();
    }

    #[test]
    fn test_skipped_only_batch_advances_watermark() {
        let dir = TempDir::new().unwrap();
        let local = open(&dir);
        purge(&local, "E1").unwrap();

        let skipped = Batch {
            epoch: "E1".into(),
            messages: Vec::new(),
            skipped: vec![SkippedMessage {
                remote_id: 7,
                reason: "missing on server".into(),
            }],
            covers_up_to: 7,
        };
        let outcome = commit(&local, &skipped).unwrap();
        assert_eq!(outcome.state.highest_remote_id(), 7);
        assert_eq!(sqlite::skipped::skipped_count(local.pool()).unwrap(), 1);
    }

    #[test]
    fn test_purge_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let local = open(&dir);
        purge(&local, "E1").unwrap();
        commit(&local, &batch("E1", &[101, 102, 103])).unwrap();

        let once = purge(&local, "E2").unwrap();
        let twice = purge(&local, "E2").unwrap();
        assert_eq!(once, twice);
        assert_eq!(twice.watermark, Some(Watermark::reset("E2")));
        assert_eq!(sqlite::messages::message_count(local.pool()).unwrap(), 0);
        assert!(local.read_index().unwrap().is_empty());
        local.check_invariants().unwrap();
    }

    #[test]
    fn test_remove_drops_rows_and_slots_but_keeps_watermark() {
        let dir = TempDir::new().unwrap();
        let local = open(&dir);
        purge(&local, "E1").unwrap();
        let committed = commit(&local, &batch("E1", &[1, 2, 3])).unwrap();

        let outcome = remove(&local, "E1", &[2, 9]).unwrap();
        assert_eq!(outcome.removed, vec![2]);
        assert_eq!(outcome.state.highest_remote_id(), 3);
        assert_eq!(outcome.state.index_generation, committed.state.index_generation + 1);
        assert_eq!(sqlite::messages::message_count(local.pool()).unwrap(), 2);
        assert_eq!(local.read_index().unwrap().len(), 2);
        assert!(local.read_index().unwrap().slot_of(2).is_none());
        local.check_invariants().unwrap();
    }

    #[test]
    fn test_remove_under_wrong_epoch_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let local = open(&dir);
        purge(&local, "E1").unwrap();
        commit(&local, &batch("E1", &[1, 2])).unwrap();

        let err = remove(&local, "E2", &[1]).unwrap_err();
        assert!(matches!(err, MailsiftError::Consistency(_)));
        assert_eq!(local.read_index().unwrap().len(), 2);
        local.check_invariants().unwrap();
    }

    #[test]
    fn test_commit_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let local = open(&dir);
            purge(&local, "E1").unwrap();
            commit(&local, &batch("E1", &[5, 6])).unwrap();
        }
        let local = open(&dir);
        assert_eq!(local.read_index().unwrap().len(), 2);
        local.check_invariants().unwrap();
    }
}
