//! Read-side message operations
//!
//! Listing, lookup, status and the non-semantic searches. Nothing here
//! writes to the state directory.

use serde::Serialize;

use super::search::{SearchFilters, SearchHit};
use crate::adapters::sqlite;
use crate::error::MailsiftError;
use crate::index::persist;
use crate::state::{verify_bijection, LocalState};
use crate::types::{MessageRecord, RemoteId};
use code_detector::PatternSet;

const SUBJECT_WEIGHT: f32 = 2.0;
const BODY_WEIGHT: f32 = 1.0;

pub fn list(local: &LocalState, limit: usize) -> Result<Vec<MessageRecord>, MailsiftError> {
    sqlite::messages::list_messages(local.pool(), limit)
}

pub fn get(local: &LocalState, remote_id: RemoteId) -> Result<MessageRecord, MailsiftError> {
    sqlite::messages::get_message(local.pool(), remote_id)?
        .ok_or_else(|| MailsiftError::MessageNotFound(remote_id.to_string()))
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub epoch: Option<String>,
    pub watermark: RemoteId,
    pub messages: usize,
    pub slots: usize,
    pub skipped: usize,
    pub generation: u64,
    pub index_in_sync: bool,
    pub date_range: Option<(i64, i64)>,
    pub last_sync: Option<i64>,
    pub db_bytes: u64,
    pub index_bytes: u64,
}

pub fn status(local: &LocalState) -> Result<StatusReport, MailsiftError> {
    let state = local.load_sync_state()?;
    let messages = sqlite::messages::message_count(local.pool())?;
    let skipped = sqlite::skipped::skipped_count(local.pool())?;
    let date_range = sqlite::messages::date_range(local.pool())?;

    let (slots, generation, index_in_sync) = {
        let index = local.read_index()?;
        let conn = local.pool().get()?;
        let in_sync = index.generation() == state.index_generation
            && index.len() == messages
            && verify_bijection(&conn, &index).is_ok();
        (index.len(), index.generation(), in_sync)
    };

    let db_bytes = std::fs::metadata(local.db_path()).map(|m| m.len()).unwrap_or(0);
    let index_bytes = persist::on_disk_bytes(&local.index_dir());

    Ok(StatusReport {
        epoch: state.epoch().map(str::to_string),
        watermark: state.highest_remote_id(),
        messages,
        slots,
        skipped,
        generation,
        index_in_sync,
        date_range,
        last_sync: state.last_sync,
        db_bytes,
        index_bytes,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct CodeMatch {
    pub record: MessageRecord,
    pub codes: Vec<String>,
}

/// Every stored message whose subject or excerpt contains a code under
/// `patterns`, newest first.
pub fn search_by_pattern(local: &LocalState, patterns: &PatternSet) -> Result<Vec<CodeMatch>, MailsiftError> {
    let mut matches: Vec<CodeMatch> = sqlite::messages::scan_messages(local.pool())?
        .into_iter()
        .filter_map(|record| {
            let codes = patterns.extract(&format!("{}\n{}", record.subject, record.body_excerpt));
            if codes.is_empty() {
                None
            } else {
                Some(CodeMatch { record, codes })
            }
        })
        .collect();
    matches.sort_by(|a, b| {
        b.record
            .timestamp
            .cmp(&a.record.timestamp)
            .then(b.record.remote_id.cmp(&a.record.remote_id))
    });
    Ok(matches)
}

/// Keyword relevance: 2 per keyword found in the subject, 1 per keyword
/// found in the body, divided by the number of keywords.
pub fn keyword_score(keywords: &[String], subject: &str, body: &str) -> f32 {
    if keywords.is_empty() {
        return 0.0;
    }
    let subject = subject.to_lowercase();
    let body = body.to_lowercase();
    let mut score = 0.0;
    for keyword in keywords {
        if subject.contains(keyword.as_str()) {
            score += SUBJECT_WEIGHT;
        }
        if body.contains(keyword.as_str()) {
            score += BODY_WEIGHT;
        }
    }
    score / keywords.len() as f32
}

/// Substring search used when semantic search finds nothing. Hits carry
/// the keyword score as `similarity` and `1 - similarity / 3` as distance.
pub fn keyword_search(
    local: &LocalState,
    query: &str,
    filters: &SearchFilters,
    limit: usize,
) -> Result<Vec<SearchHit>, MailsiftError> {
    let keywords: Vec<String> = query.split_whitespace().map(|k| k.to_lowercase()).collect();
    if keywords.is_empty() || limit == 0 {
        return Ok(Vec::new());
    }

    // Filters apply after the SQL match, so ask for more rows than needed
    let fetch = if filters.is_empty() { limit } else { limit.saturating_mul(4) };
    let candidates = sqlite::messages::keyword_search(local.pool(), &keywords, fetch)?;

    let mut scored: Vec<(f32, MessageRecord)> = candidates
        .into_iter()
        .filter(|r| filters.matches(r))
        .map(|r| (keyword_score(&keywords, &r.subject, &r.body_excerpt), r))
        .collect();
    scored.sort_by(|a, b| {
        b.0.total_cmp(&a.0)
            .then(b.1.timestamp.cmp(&a.1.timestamp))
            .then(a.1.remote_id.cmp(&b.1.remote_id))
    });
    scored.truncate(limit);

    let max_score = SUBJECT_WEIGHT + BODY_WEIGHT;
    Ok(scored
        .into_iter()
        .map(|(score, record)| SearchHit {
            record,
            distance: 1.0 - score / max_score,
            similarity: score,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::hnsw::HnswParams;
    use crate::services::sync::coordinator;
    use crate::state::{OpenMode, StateOptions};
    use crate::types::{Batch, PreparedMessage};
    use std::time::Duration;
    use tempfile::TempDir;

    const DIM: usize = 4;

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

    fn prepared(remote_id: RemoteId, subject: &str, body: &str, sender: &str) -> PreparedMessage {
        PreparedMessage {
            record: MessageRecord {
                remote_id,
                epoch: "E1".into(),
                subject: subject.into(),
                sender: sender.into(),
                timestamp: 1_700_000_000 + remote_id as i64,
                body_excerpt: body.into(),
                has_verification_code: false,
                content_hash: String::new(),
                slot: None,
            },
            embedding: vec![1.0, remote_id as f32, 0.5, 0.25],
        }
    }

    fn seeded(dir: &TempDir) -> LocalState {
        let local = open(dir);
        coordinator::purge(&local, "E1").unwrap();
        coordinator::commit(
            &local,
            &Batch {
                epoch: "E1".into(),
                messages: vec![
                    prepared(1, "Invoice October", "Please pay the invoice", "billing@shop.com"),
                    prepared(2, "Login", "Your code is 482913", "no-reply@bank.com"),
                    prepared(3, "Lunch", "Friday invoice talk over lunch", "friend@example.com"),
                ],
                skipped: Vec::new(),
                covers_up_to: 3,
            },
        )
        .unwrap();
        local
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let local = seeded(&dir);
        assert_eq!(get(&local, 2).unwrap().subject, "Login");
        assert!(matches!(get(&local, 42), Err(MailsiftError::MessageNotFound(_))));
        assert_eq!(list(&local, 10).unwrap().len(), 3);
    }

    #[test]
    fn test_status() {
        let dir = TempDir::new().unwrap();
        let local = seeded(&dir);
        let report = status(&local).unwrap();
        assert_eq!(report.epoch.as_deref(), Some("E1"));
        assert_eq!(report.watermark, 3);
        assert_eq!(report.messages, 3);
        assert_eq!(report.slots, 3);
        assert!(report.index_in_sync);
        assert!(report.db_bytes > 0);
        assert!(report.index_bytes > 0);
    }

    #[test]
    fn test_search_by_pattern() {
        let dir = TempDir::new().unwrap();
        let local = seeded(&dir);
        let found = search_by_pattern(&local, &PatternSet::Default).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].record.remote_id, 2);
        assert_eq!(found[0].codes, vec!["482913".to_string()]);
    }

    #[test]
    fn test_keyword_scoring_prefers_subject() {
        let keywords = vec!["invoice".to_string()];
        assert_eq!(keyword_score(&keywords, "Invoice", "invoice"), 3.0);
        assert_eq!(keyword_score(&keywords, "Lunch", "invoice"), 1.0);
        assert_eq!(keyword_score(&[], "a", "b"), 0.0);
    }

    #[test]
    fn test_keyword_search_ranks_subject_match_first() {
        let dir = TempDir::new().unwrap();
        let local = seeded(&dir);
        let hits = keyword_search(&local, "invoice", &SearchFilters::default(), 10).unwrap();
        let ids: Vec<RemoteId> = hits.iter().map(|h| h.record.remote_id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert!(hits[0].distance < hits[1].distance);
    }
}
