mod common;

use std::collections::HashSet;
use tempfile::TempDir;

use common::*;
use mailsift::adapters::sqlite;
use mailsift::error::MailsiftError;
use mailsift::services::message_service;
use mailsift::services::search::{SearchFilters, SearchService};
use mailsift::services::sync::{run_sync, SyncContext};
use mailsift::state::LocalState;
use mailsift::types::SyncState;

async fn synced(dir: &TempDir) -> LocalState {
    let local = open(dir);
    let source = three_messages();
    source.insert(104, raw("Shipping update", "Your parcel has shipped and arrives Monday"));
    source.insert(105, raw("Newsletter", "This week in gardening: tomatoes and basil"));
    source.insert(106, raw("Invoice October", "Please find the invoice for October attached"));
    let embedder = embedder();
    let ctx = SyncContext::new(&source, &embedder, sync_options(2));
    run_sync(&local, SyncState::default(), &ctx).await.unwrap();
    local
}

#[tokio::test]
async fn test_verification_query_ranks_code_message_first() {
    let dir = TempDir::new().unwrap();
    let local = synced(&dir).await;
    let embedder = embedder();
    let service = SearchService::new(&local, &embedder);

    let hits = service
        .search("verification code", 3, &SearchFilters::default())
        .await
        .unwrap();

    assert_eq!(hits[0].record.remote_id, 103);
    assert!(hits[0].record.has_verification_code);
}

#[tokio::test]
async fn test_results_bounded_ascending_and_unique() {
    let dir = TempDir::new().unwrap();
    let local = synced(&dir).await;
    let embedder = embedder();
    let service = SearchService::new(&local, &embedder);

    for k in [1, 3, 6, 20] {
        let hits = service.search("report lunch invoice", k, &SearchFilters::default()).await.unwrap();
        assert!(hits.len() <= k);
        assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
        let ids: HashSet<_> = hits.iter().map(|h| h.record.remote_id).collect();
        assert_eq!(ids.len(), hits.len());
    }
}

#[tokio::test]
async fn test_search_is_deterministic() {
    let dir = TempDir::new().unwrap();
    let local = synced(&dir).await;
    let embedder = embedder();
    let service = SearchService::new(&local, &embedder);

    let first = service.search("parcel shipped", 4, &SearchFilters::default()).await.unwrap();
    let second = service.search("parcel shipped", 4, &SearchFilters::default()).await.unwrap();
    let ids = |hits: &[mailsift::services::search::SearchHit]| {
        hits.iter().map(|h| h.record.remote_id).collect::<Vec<_>>()
    };
    assert_eq!(ids(&first), ids(&second));
}

#[tokio::test]
async fn test_filters_change_membership_not_order() {
    let dir = TempDir::new().unwrap();
    let local = synced(&dir).await;
    let embedder = embedder();
    let service = SearchService::new(&local, &embedder);

    let all = service.search("update", 6, &SearchFilters::default()).await.unwrap();
    let filters = SearchFilters {
        verification_only: true,
        ..Default::default()
    };
    let codes = service.search("update", 6, &filters).await.unwrap();

    assert!(codes.iter().all(|h| h.record.has_verification_code));
    let order: Vec<_> = all
        .iter()
        .map(|h| h.record.remote_id)
        .filter(|id| codes.iter().any(|c| c.record.remote_id == *id))
        .collect();
    assert_eq!(order, codes.iter().map(|h| h.record.remote_id).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_dangling_slot_is_not_returned() {
    let dir = TempDir::new().unwrap();
    let local = synced(&dir).await;
    {
        // Simulate a row lost outside the coordinator
        let conn = local.pool().get().unwrap();
        conn.execute("DELETE FROM messages WHERE remote_id = 103", []).unwrap();
    }
    let embedder = embedder();
    let service = SearchService::new(&local, &embedder);

    let hits = service.search("verification code", 6, &SearchFilters::default()).await.unwrap();

    assert!(hits.iter().all(|h| h.record.remote_id != 103));
    assert!(!hits.is_empty());
}

#[tokio::test]
async fn test_empty_query_is_rejected() {
    let dir = TempDir::new().unwrap();
    let local = synced(&dir).await;
    let embedder = embedder();
    let service = SearchService::new(&local, &embedder);

    let err = service.search("   ", 5, &SearchFilters::default()).await.unwrap_err();
    assert!(matches!(err, MailsiftError::InvalidInput(_)));
}

#[tokio::test]
async fn test_read_only_reader_sees_committed_state() {
    let dir = TempDir::new().unwrap();
    drop(synced(&dir).await);
    let reader = open_read_only(&dir);
    let embedder = embedder();
    let service = SearchService::new(&reader, &embedder);

    let hits = service.search("invoice october", 1, &SearchFilters::default()).await.unwrap();
    assert_eq!(hits[0].record.remote_id, 106);
}

#[tokio::test]
async fn test_code_and_keyword_searches() {
    let dir = TempDir::new().unwrap();
    let local = synced(&dir).await;

    let codes = message_service::search_by_pattern(&local, &code_detector::PatternSet::Default).unwrap();
    assert_eq!(codes.len(), 1);
    assert_eq!(codes[0].codes, vec!["482913".to_string()]);

    let hits = message_service::keyword_search(&local, "invoice", &SearchFilters::default(), 5).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].record.remote_id, 106);

    let status = message_service::status(&local).unwrap();
    assert_eq!(status.messages, 6);
    assert_eq!(status.slots, 6);
    assert!(status.index_in_sync);
    assert_eq!(sqlite::messages::message_count(local.pool()).unwrap(), 6);
}
