use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::helpers::status_emit::{self, EventSender};
use super::pipeline::{BatchPipeline, ChunkFailure, ChunkOutcome};
use super::{change_set, coordinator, epoch};
use crate::backend::MailSource;
use crate::adapters::sqlite;
use crate::config::AppConfig;
use crate::embedding::Embedder;
use crate::error::MailsiftError;
use crate::logging::fmt_ms;
use crate::state::{LocalState, OpenMode};
use crate::types::{RemoteId, SyncState};

/// Tuning for one sync cycle.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub batch_size: usize,
    pub max_chunk_retries: u32,
    pub retry_backoff: Duration,
    /// Bounds every call to the mail source
    pub fetch_timeout: Duration,
    pub embed_timeout: Duration,
    pub max_text_chars: usize,
    pub patterns: code_detector::PatternSet,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: 64,
            max_chunk_retries: 3,
            retry_backoff: Duration::from_millis(500),
            fetch_timeout: Duration::from_secs(30),
            embed_timeout: Duration::from_secs(120),
            max_text_chars: 2000,
            patterns: code_detector::PatternSet::default(),
        }
    }
}

impl SyncOptions {
    pub fn from_config(config: &AppConfig) -> Result<Self, MailsiftError> {
        let sync = &config.sync;
        Ok(Self {
            batch_size: sync.batch_size,
            max_chunk_retries: sync.max_chunk_retries,
            retry_backoff: Duration::from_millis(sync.retry_backoff_ms),
            fetch_timeout: Duration::from_secs(sync.fetch_timeout_secs),
            embed_timeout: Duration::from_secs(sync.embed_timeout_secs),
            max_text_chars: sync.max_text_chars,
            patterns: config.codes.pattern_set()?,
        })
    }
}

/// Collaborators and knobs for `run_sync`.
pub struct SyncContext<'a> {
    pub source: &'a dyn MailSource,
    pub embedder: &'a dyn Embedder,
    pub options: SyncOptions,
    pub events: Option<EventSender>,
    pub cancel: Arc<AtomicBool>,
}

impl<'a> SyncContext<'a> {
    pub fn new(source: &'a dyn MailSource, embedder: &'a dyn Embedder, options: SyncOptions) -> Self {
        Self {
            source,
            embedder,
            options,
            events: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub epoch: String,
    pub reset: bool,
    pub previous_epoch: Option<String>,
    pub pending: usize,
    /// Stored messages dropped because the server deleted them
    pub removed: usize,
    pub processed: usize,
    pub skipped: usize,
    pub committed_chunks: usize,
    pub failed_chunks: Vec<ChunkFailure>,
    pub watermark: RemoteId,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl SyncReport {
    pub fn is_complete(&self) -> bool {
        self.failed_chunks.is_empty() && !self.cancelled
    }
}

/// Run one sync cycle under the state-directory lock.
///
/// The persisted state is authoritative; `state` is what the caller last
/// saw and is only compared against it. The returned state is the one
/// durably recorded when the cycle ended.
pub async fn run_sync(
    local: &LocalState,
    state: SyncState,
    ctx: &SyncContext<'_>,
) -> Result<(SyncState, SyncReport), MailsiftError> {
    if local.mode() != OpenMode::ReadWrite {
        return Err(MailsiftError::InvalidInput("sync requires a read-write state".into()));
    }
    let _lock = local.lock()?;
    let start = Instant::now();
    let events = ctx.events.as_ref();

    let mut state = {
        let persisted = local.load_sync_state()?;
        if persisted != state {
            debug!("Caller sync state is stale, using persisted state");
        }
        persisted
    };

    status_emit::emit_started(events, &ctx.source.describe());
    info!(source = %ctx.source.describe(), embedder = %ctx.embedder.describe(), "Starting sync");

    // Step 1: Epoch, fail-closed
    let remote_epoch = epoch::read_epoch(ctx.source, ctx.options.fetch_timeout).await?;

    let mut report = SyncReport {
        epoch: remote_epoch.clone(),
        reset: false,
        previous_epoch: state.epoch().map(str::to_string),
        pending: 0,
        removed: 0,
        processed: 0,
        skipped: 0,
        committed_chunks: 0,
        failed_chunks: Vec::new(),
        watermark: state.highest_remote_id(),
        cancelled: false,
        elapsed: Duration::ZERO,
    };

    if let epoch::EpochCheck::Reset { previous } = epoch::check_epoch(&state, &remote_epoch) {
        if previous.is_some() {
            warn!(previous = ?previous, epoch = %remote_epoch, "Mailbox epoch changed, purging local state");
        }
        state = coordinator::purge(local, &remote_epoch)?;
        report.reset = previous.is_some();
        status_emit::emit_epoch_reset(events, previous.as_deref(), &remote_epoch);
    }

    let watermark = state
        .watermark
        .clone()
        .ok_or_else(|| MailsiftError::Consistency("no watermark after epoch check".into()))?;

    // Step 2: Server-side deletions at or below the watermark
    let stored: Vec<RemoteId> = {
        let conn = local.pool().get()?;
        sqlite::messages::all_slots(&conn)?.into_iter().map(|(id, _)| id).collect()
    };
    let gone = change_set::vanished(ctx.source, &stored, &watermark, ctx.options.fetch_timeout).await?;
    if !gone.is_empty() {
        info!(count = gone.len(), "Removing messages deleted on the server");
        let outcome = coordinator::remove(local, &remote_epoch, &gone)?;
        report.removed = outcome.removed.len();
        state = outcome.state;
    }

    // Step 3: Change set
    let change_set = change_set::resolve(ctx.source, &watermark, ctx.options.fetch_timeout).await?;
    report.pending = change_set.len();
    status_emit::emit_change_set(events, change_set.len(), watermark.highest_remote_id);

    if change_set.is_empty() {
        info!(watermark = watermark.highest_remote_id, "Nothing new to sync");
        report.elapsed = start.elapsed();
        status_emit::emit_completed(events, 0, 0);
        return Ok((state, report));
    }

    // Step 4: Chunks
    let mut pipeline = BatchPipeline::new(
        ctx.source,
        ctx.embedder,
        &ctx.options,
        &remote_epoch,
        &change_set,
    )
    .with_cancel(Arc::clone(&ctx.cancel));

    loop {
        if ctx.cancel.load(Ordering::SeqCst) {
            info!("Sync cancelled between chunks");
            report.cancelled = true;
            break;
        }

        match pipeline.next_chunk(local).await {
            Ok(None) => break,
            Ok(Some(ChunkOutcome::Committed(commit))) => {
                report.processed += commit.messages;
                report.skipped += commit.skipped;
                report.committed_chunks += 1;
                report.watermark = commit.watermark;
                status_emit::emit_chunk_committed(
                    events,
                    commit.chunk,
                    commit.messages,
                    commit.skipped,
                    commit.watermark,
                );
            }
            Ok(Some(ChunkOutcome::Failed(failure))) => {
                status_emit::emit_chunk_failed(
                    events,
                    failure.chunk,
                    failure.first,
                    failure.last,
                    &failure.error.to_string(),
                );
                report.failed_chunks.push(failure);
            }
            Err(MailsiftError::Cancelled) => {
                info!("Sync cancelled mid-chunk");
                report.cancelled = true;
                break;
            }
            Err(e) => return Err(e),
        }
    }

    let state = local.load_sync_state()?;
    report.watermark = state.highest_remote_id();
    report.elapsed = start.elapsed();
    status_emit::emit_completed(events, report.processed, report.failed_chunks.len());

    info!(
        processed = report.processed,
        removed = report.removed,
        skipped = report.skipped,
        committed_chunks = report.committed_chunks,
        failed_chunks = report.failed_chunks.len(),
        watermark = report.watermark,
        "Sync finished in {}",
        fmt_ms(report.elapsed)
    );
    Ok((state, report))
}
