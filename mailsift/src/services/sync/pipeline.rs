//! Batch pipeline: fetch → normalize → detect codes → embed → commit
//!
//! The change set is cut into consecutive chunks that are driven one at a
//! time. A chunk either commits whole or is reported failed, after which
//! the pipeline stops so the watermark never skips past it.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::change_set::partition;
use super::coordinator::{self, CommitOutcome};
use super::helpers::normalization;
use super::worker::SyncOptions;
use crate::backend::MailSource;
use crate::embedding::{validate_vectors, Embedder};
use crate::error::MailsiftError;
use crate::state::LocalState;
use crate::types::{Batch, MessageRecord, PreparedMessage, RemoteId, SkippedMessage};

const MISSING_ON_SERVER: &str = "missing on server";

#[derive(Debug, Clone, Serialize)]
pub struct ChunkCommit {
    pub chunk: usize,
    pub messages: usize,
    pub skipped: usize,
    pub watermark: RemoteId,
    pub persisted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkFailure {
    pub chunk: usize,
    pub first: RemoteId,
    pub last: RemoteId,
    pub attempts: u32,
    pub error: MailsiftError,
}

#[derive(Debug, Clone, Serialize)]
pub enum ChunkOutcome {
    Committed(ChunkCommit),
    Failed(ChunkFailure),
}

pub struct BatchPipeline<'a> {
    source: &'a dyn MailSource,
    embedder: &'a dyn Embedder,
    options: &'a SyncOptions,
    epoch: String,
    chunks: VecDeque<Vec<RemoteId>>,
    chunk_no: usize,
    halted: bool,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'a> BatchPipeline<'a> {
    pub fn new(
        source: &'a dyn MailSource,
        embedder: &'a dyn Embedder,
        options: &'a SyncOptions,
        epoch: &str,
        change_set: &[RemoteId],
    ) -> Self {
        Self {
            source,
            embedder,
            options,
            epoch: epoch.to_string(),
            chunks: partition(change_set, options.batch_size).into(),
            chunk_no: 0,
            halted: false,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn remaining_chunks(&self) -> usize {
        if self.halted {
            0
        } else {
            self.chunks.len()
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Drive the next chunk to a commit or a reported failure. Returns
    /// `Ok(None)` once the change set is exhausted or a chunk has failed;
    /// `Err` only for errors that abort the whole cycle.
    pub async fn next_chunk(&mut self, local: &LocalState) -> Result<Option<ChunkOutcome>, MailsiftError> {
        if self.halted {
            return Ok(None);
        }
        let Some(ids) = self.chunks.pop_front() else {
            return Ok(None);
        };
        self.chunk_no += 1;
        let chunk = self.chunk_no;
        let (first, last) = (ids[0], ids[ids.len() - 1]);
        debug!(chunk, first, last, size = ids.len(), "Processing chunk");

        let prepared = self.prepare_with_retry(chunk, &ids).await;
        let (batch, prep_attempts) = match prepared {
            Ok(ok) => ok,
            Err((e, _)) if e.is_fatal() => return Err(e),
            Err((e, attempts)) => return Ok(Some(self.fail(chunk, first, last, attempts, e))),
        };

        match self.commit_with_retry(local, chunk, &batch).await {
            Ok(outcome) => Ok(Some(ChunkOutcome::Committed(ChunkCommit {
                chunk,
                messages: batch.messages.len(),
                skipped: batch.skipped.len(),
                watermark: outcome.state.highest_remote_id(),
                persisted: outcome.persisted,
            }))),
            Err((e, _)) if e.is_fatal() => Err(e),
            Err((e, attempts)) => Ok(Some(self.fail(chunk, first, last, prep_attempts + attempts, e))),
        }
    }

    fn fail(&mut self, chunk: usize, first: RemoteId, last: RemoteId, attempts: u32, error: MailsiftError) -> ChunkOutcome {
        warn!(chunk, first, last, attempts, "Chunk failed, stopping cycle: {}", error);
        self.halted = true;
        ChunkOutcome::Failed(ChunkFailure {
            chunk,
            first,
            last,
            attempts,
            error,
        })
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.options.retry_backoff * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    async fn prepare_with_retry(&self, chunk: usize, ids: &[RemoteId]) -> Result<(Batch, u32), (MailsiftError, u32)> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.prepare(ids).await {
                Ok(batch) => return Ok((batch, attempt)),
                Err(e) if e.is_retryable() && attempt <= self.options.max_chunk_retries => {
                    let delay = self.backoff(attempt);
                    warn!(chunk, attempt, "Transient failure preparing chunk, retrying in {:?}: {}", delay, e);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err((e, attempt)),
            }
        }
    }

    async fn commit_with_retry(
        &self,
        local: &LocalState,
        chunk: usize,
        batch: &Batch,
    ) -> Result<CommitOutcome, (MailsiftError, u32)> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if self.cancelled() {
                return Err((MailsiftError::Cancelled, attempt));
            }
            match coordinator::commit(local, batch) {
                Ok(outcome) => return Ok(outcome),
                Err(e) if attempt > self.options.max_chunk_retries => return Err((e, attempt)),
                Err(MailsiftError::Consistency(msg)) => {
                    error!(chunk, attempt, "Consistency failure on commit, replaying: {}", msg);
                    if let Err(e) = coordinator::recover(local) {
                        return Err((e, attempt));
                    }
                }
                Err(e) if e.is_retryable() => {
                    let delay = self.backoff(attempt);
                    warn!(chunk, attempt, "Commit failed, replaying in {:?}: {}", delay, e);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err((e, attempt)),
            }
        }
    }

    /// Fetch, normalize and embed one chunk. Nothing is written.
    pub async fn prepare(&self, ids: &[RemoteId]) -> Result<Batch, MailsiftError> {
        let mut records: Vec<MessageRecord> = Vec::with_capacity(ids.len());
        let mut texts: Vec<String> = Vec::with_capacity(ids.len());
        let mut skipped: Vec<SkippedMessage> = Vec::new();

        for &remote_id in ids {
            if self.cancelled() {
                return Err(MailsiftError::Cancelled);
            }

            let raw = tokio::time::timeout(self.options.fetch_timeout, self.source.fetch_raw(remote_id))
                .await
                .map_err(|_| {
                    MailsiftError::Timeout(format!(
                        "fetching {} exceeded {:?}",
                        remote_id, self.options.fetch_timeout
                    ))
                })??;

            let Some(raw) = raw else {
                debug!(remote_id, "Message vanished before fetch");
                skipped.push(SkippedMessage {
                    remote_id,
                    reason: MISSING_ON_SERVER.to_string(),
                });
                continue;
            };

            let normalized = match normalization::normalize(&raw, self.options.max_text_chars) {
                Ok(n) => n,
                Err(e) => {
                    warn!(remote_id, "Skipping unparseable message: {}", e);
                    skipped.push(SkippedMessage {
                        remote_id,
                        reason: format!("unparseable: {}", e),
                    });
                    continue;
                }
            };

            let has_verification_code = self
                .options
                .patterns
                .detect(&format!("{}\n{}", normalized.subject, normalized.body));

            records.push(MessageRecord {
                remote_id,
                epoch: self.epoch.clone(),
                subject: normalized.subject,
                sender: normalized.sender,
                timestamp: normalized.timestamp,
                body_excerpt: normalized.body,
                has_verification_code,
                content_hash: normalized.content_hash,
                slot: None,
            });
            texts.push(normalized.embedding_text);
        }

        let vectors = if texts.is_empty() {
            Vec::new()
        } else {
            let vectors = tokio::time::timeout(self.options.embed_timeout, self.embedder.embed_batch(&texts))
                .await
                .map_err(|_| {
                    MailsiftError::Timeout(format!(
                        "embedding {} texts exceeded {:?}",
                        texts.len(),
                        self.options.embed_timeout
                    ))
                })??;
            validate_vectors(&vectors, texts.len(), self.embedder.dimension())?;
            vectors
        };

        let mut messages = Vec::with_capacity(records.len());
        for (record, embedding) in records.into_iter().zip(vectors) {
            if embedding.iter().all(|v| *v == 0.0) {
                warn!(remote_id = record.remote_id, "Embedder returned a zero vector, skipping");
                skipped.push(SkippedMessage {
                    remote_id: record.remote_id,
                    reason: "empty embedding".to_string(),
                });
                continue;
            }
            messages.push(PreparedMessage { record, embedding });
        }

        let covers_up_to = ids.iter().copied().max().unwrap_or(0);
        if !skipped.is_empty() {
            info!(skipped = skipped.len(), covers_up_to, "Chunk has skipped messages");
        }

        Ok(Batch {
            epoch: self.epoch.clone(),
            messages,
            skipped,
            covers_up_to,
        })
    }
}
