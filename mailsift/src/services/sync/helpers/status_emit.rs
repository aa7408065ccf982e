use serde::Serialize;

use crate::types::RemoteId;

/// Progress notifications from a running sync cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    Started { source: String },
    EpochReset { previous: Option<String>, current: String },
    ChangeSet { pending: usize, watermark: RemoteId },
    ChunkCommitted { chunk: usize, messages: usize, skipped: usize, watermark: RemoteId },
    ChunkFailed { chunk: usize, first: RemoteId, last: RemoteId, error: String },
    Completed { processed: usize, failed_chunks: usize },
}

pub type EventSender = flume::Sender<SyncEvent>;

// Receivers may hang up at any time; a dropped listener never fails a sync.
fn emit(tx: Option<&EventSender>, event: SyncEvent) {
    if let Some(tx) = tx {
        let _ = tx.send(event);
    }
}

pub fn emit_started(tx: Option<&EventSender>, source: &str) {
    emit(tx, SyncEvent::Started {
        source: source.to_string(),
    });
}

pub fn emit_epoch_reset(tx: Option<&EventSender>, previous: Option<&str>, current: &str) {
    emit(tx, SyncEvent::EpochReset {
        previous: previous.map(str::to_string),
        current: current.to_string(),
    });
}

pub fn emit_change_set(tx: Option<&EventSender>, pending: usize, watermark: RemoteId) {
    emit(tx, SyncEvent::ChangeSet { pending, watermark });
}

pub fn emit_chunk_committed(
    tx: Option<&EventSender>,
    chunk: usize,
    messages: usize,
    skipped: usize,
    watermark: RemoteId,
) {
    emit(tx, SyncEvent::ChunkCommitted {
        chunk,
        messages,
        skipped,
        watermark,
    });
}

pub fn emit_chunk_failed(tx: Option<&EventSender>, chunk: usize, first: RemoteId, last: RemoteId, error: &str) {
    emit(tx, SyncEvent::ChunkFailed {
        chunk,
        first,
        last,
        error: error.to_string(),
    });
}

pub fn emit_completed(tx: Option<&EventSender>, processed: usize, failed_chunks: usize) {
    emit(tx, SyncEvent::Completed {
        processed,
        failed_chunks,
    });
}
