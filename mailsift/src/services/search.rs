//! Semantic search over the local index
//!
//! The query is embedded before any lock is taken. Neighbour lookup and
//! record resolution then run under one index read lock, so a search sees
//! the state as of the last completed commit and never half a batch.

use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

use crate::adapters::sqlite;
use crate::embedding::Embedder;
use crate::error::MailsiftError;
use crate::state::LocalState;
use crate::types::MessageRecord;

/// Candidates fetched per requested result when filters are present
const FILTER_OVERSAMPLE: usize = 4;

#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    /// Unix seconds, inclusive
    pub after: Option<i64>,
    /// Unix seconds, exclusive
    pub before: Option<i64>,
    /// Case-insensitive substring of the sender
    pub sender: Option<String>,
    pub body_regex: Option<Regex>,
    pub verification_only: bool,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.after.is_none()
            && self.before.is_none()
            && self.sender.is_none()
            && self.body_regex.is_none()
            && !self.verification_only
    }

    pub fn matches(&self, record: &MessageRecord) -> bool {
        if let Some(after) = self.after {
            if record.timestamp < after {
                return false;
            }
        }
        if let Some(before) = self.before {
            if record.timestamp >= before {
                return false;
            }
        }
        if let Some(sender) = &self.sender {
            if !record.sender.to_lowercase().contains(&sender.to_lowercase()) {
                return false;
            }
        }
        if let Some(re) = &self.body_regex {
            if !re.is_match(&record.body_excerpt) && !re.is_match(&record.subject) {
                return false;
            }
        }
        if self.verification_only && !record.has_verification_code {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub record: MessageRecord,
    pub distance: f32,
    pub similarity: f32,
}

pub struct SearchService<'a> {
    local: &'a LocalState,
    embedder: &'a dyn Embedder,
    timeout: Duration,
}

impl<'a> SearchService<'a> {
    pub fn new(local: &'a LocalState, embedder: &'a dyn Embedder) -> Self {
        Self {
            local,
            embedder,
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Up to `k` records, ascending by distance, each remote id at most once.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchHit>, MailsiftError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(MailsiftError::InvalidInput("query is empty".into()));
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let vector = tokio::time::timeout(self.timeout, self.embedder.embed(query))
            .await
            .map_err(|_| MailsiftError::Timeout(format!("embedding query exceeded {:?}", self.timeout)))??;

        let candidates = if filters.is_empty() {
            k
        } else {
            k.saturating_mul(FILTER_OVERSAMPLE)
        };

        let index = self.local.read_index()?;
        let neighbours = index.search(&vector, candidates)?;
        let conn = self.local.pool().get()?;
        let ids: Vec<_> = neighbours.iter().map(|h| h.remote_id).collect();
        let mut records = sqlite::messages::get_messages(&conn, &ids)?;
        drop(conn);
        drop(index);

        let mut seen = HashSet::new();
        let mut hits = Vec::with_capacity(k);
        for neighbour in neighbours {
            let Some(record) = records.remove(&neighbour.remote_id) else {
                debug!(slot = neighbour.slot, remote_id = neighbour.remote_id, "Dropping dangling slot");
                continue;
            };
            if !seen.insert(record.remote_id) || !filters.matches(&record) {
                continue;
            }
            hits.push(SearchHit {
                record,
                distance: neighbour.distance,
                similarity: 1.0 - neighbour.distance,
            });
            if hits.len() == k {
                break;
            }
        }
        Ok(hits)
    }
}
