//! Core data structures shared by the sync engine, the stores and the services

use serde::{Deserialize, Serialize};

/// Identifier assigned by the remote store, unique within one epoch (an IMAP UID).
pub type RemoteId = u64;

/// Dense position of an entry inside the vector index.
pub type Slot = u32;

/// Highest remote identifier known to be fully synced under an epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub epoch: String,
    pub highest_remote_id: RemoteId,
}

impl Watermark {
    pub fn new(epoch: impl Into<String>, highest_remote_id: RemoteId) -> Self {
        Self {
            epoch: epoch.into(),
            highest_remote_id,
        }
    }

    /// Fresh watermark for an epoch nothing has been synced under yet.
    pub fn reset(epoch: impl Into<String>) -> Self {
        Self::new(epoch, 0)
    }
}

/// Persisted sync state, passed into and returned from every sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    /// None until the first cycle has recorded an epoch.
    pub watermark: Option<Watermark>,
    /// Generation of the last successful commit; the persisted index must match it.
    pub index_generation: u64,
    /// Unix millis of the last successful commit.
    pub last_sync: Option<i64>,
}

impl SyncState {
    pub fn epoch(&self) -> Option<&str> {
        self.watermark.as_ref().map(|w| w.epoch.as_str())
    }

    pub fn highest_remote_id(&self) -> RemoteId {
        self.watermark
            .as_ref()
            .map(|w| w.highest_remote_id)
            .unwrap_or(0)
    }
}

/// Message metadata as stored in the relational store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub remote_id: RemoteId,
    pub epoch: String,
    pub subject: String,
    pub sender: String,
    /// Unix seconds from the Date header, 0 when absent or unparseable.
    pub timestamp: i64,
    pub body_excerpt: String,
    pub has_verification_code: bool,
    /// SHA-256 hex of the embedded text
    pub content_hash: String,
    pub slot: Option<Slot>,
}

/// A message prepared by the pipeline, ready to be committed.
#[derive(Debug, Clone)]
pub struct PreparedMessage {
    pub record: MessageRecord,
    pub embedding: Vec<f32>,
}

/// A remote identifier that was deliberately not stored, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedMessage {
    pub remote_id: RemoteId,
    pub reason: String,
}

/// One chunk of the change set, committed atomically.
///
/// `covers_up_to` is the highest identifier the chunk was built from, so a
/// chunk whose every message was skipped still advances the watermark.
#[derive(Debug, Clone)]
pub struct Batch {
    pub epoch: String,
    pub messages: Vec<PreparedMessage>,
    pub skipped: Vec<SkippedMessage>,
    pub covers_up_to: RemoteId,
}

impl Batch {
    pub fn remote_ids(&self) -> Vec<RemoteId> {
        self.messages.iter().map(|m| m.record.remote_id).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.skipped.is_empty()
    }
}
