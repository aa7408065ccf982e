#![allow(dead_code)]

use std::time::Duration;
use tempfile::TempDir;

use mailsift::adapters::sqlite;
use mailsift::backend::MemoryMailSource;
use mailsift::embedding::HashingEmbedder;
use mailsift::index::hnsw::HnswParams;
use mailsift::services::sync::SyncOptions;
use mailsift::state::{LocalState, OpenMode, StateOptions};
use mailsift::types::{RemoteId, Slot};

pub const DIM: usize = 1024;

pub fn raw(subject: &str, body: &str) -> Vec<u8> {
    format!(
        "From: sender@example.com\r\nSubject: {}\r\nDate: Tue, 1 Oct 2024 10:00:00 +0000\r\n\r\n{}\r\n",
        subject, body
    )
    .into_bytes()
}

pub fn state_options(mode: OpenMode) -> StateOptions {
    StateOptions {
        dimension: DIM,
        index: HnswParams::default(),
        busy_timeout: Duration::from_millis(500),
        mode,
    }
}

pub fn open(dir: &TempDir) -> LocalState {
    LocalState::open(dir.path(), state_options(OpenMode::ReadWrite)).unwrap()
}

pub fn open_read_only(dir: &TempDir) -> LocalState {
    LocalState::open(dir.path(), state_options(OpenMode::ReadOnly)).unwrap()
}

pub fn sync_options(batch_size: usize) -> SyncOptions {
    SyncOptions {
        batch_size,
        max_chunk_retries: 2,
        retry_backoff: Duration::from_millis(1),
        ..SyncOptions::default()
    }
}

pub fn embedder() -> HashingEmbedder {
    HashingEmbedder::new(DIM)
}

/// Source under epoch E1 holding ids 101..=103 with distinct bodies.
pub fn three_messages() -> MemoryMailSource {
    let source = MemoryMailSource::new("E1");
    source.insert(101, raw("Quarterly report", "The quarterly report is attached for review"));
    source.insert(102, raw("Team lunch", "Lunch on Friday at the usual place"));
    source.insert(103, raw("Your verification code", "Your code is 482913"));
    source
}

/// (remote_id, slot, content_hash) of every stored row, ascending.
pub fn snapshot(local: &LocalState) -> Vec<(RemoteId, Option<Slot>, String)> {
    sqlite::messages::scan_messages(local.pool())
        .unwrap()
        .into_iter()
        .map(|r| (r.remote_id, r.slot, r.content_hash))
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn slot_count(local: &LocalState) -> usize {
    local.read_index().unwrap().len()
}
