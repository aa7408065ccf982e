use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;

use super::DbPool;
use crate::error::MailsiftError;
use crate::types::{MessageRecord, RemoteId, Slot};

const RECORD_COLUMNS: &str = "remote_id, epoch, subject, sender, timestamp, body_excerpt,
     has_verification_code, content_hash, slot";

fn row_to_record(row: &Row) -> Result<MessageRecord, rusqlite::Error> {
    Ok(MessageRecord {
        remote_id: row.get::<_, i64>(0)? as RemoteId,
        epoch: row.get(1)?,
        subject: row.get(2)?,
        sender: row.get(3)?,
        timestamp: row.get(4)?,
        body_excerpt: row.get(5)?,
        has_verification_code: row.get::<_, i32>(6)? != 0,
        content_hash: row.get(7)?,
        slot: row.get(8)?,
    })
}

pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode_embedding(bytes: &[u8]) -> Result<Vec<f32>, MailsiftError> {
    if bytes.len() % 4 != 0 {
        return Err(MailsiftError::Database(format!(
            "embedding blob has {} bytes, not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

// ---------------------------------------------------------------------------
// Writes (only called inside a coordinator transaction)
// ---------------------------------------------------------------------------

/// Insert or replace a message row. The slot is cleared; the caller writes
/// the new slot with `set_slot` once the index has assigned one.
pub fn upsert_message(
    conn: &Connection,
    record: &MessageRecord,
    embedding: &[f32],
) -> Result<(), MailsiftError> {
    let now = chrono::Utc::now().timestamp_millis();
    conn.execute(
        "INSERT INTO messages (
            remote_id, epoch, subject, sender, timestamp, body_excerpt,
            has_verification_code, content_hash, embedding, slot, synced_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, ?10)
        ON CONFLICT(remote_id) DO UPDATE SET
            epoch = excluded.epoch,
            subject = excluded.subject,
            sender = excluded.sender,
            timestamp = excluded.timestamp,
            body_excerpt = excluded.body_excerpt,
            has_verification_code = excluded.has_verification_code,
            content_hash = excluded.content_hash,
            embedding = excluded.embedding,
            slot = NULL,
            synced_at = excluded.synced_at",
        params![
            record.remote_id as i64,
            record.epoch,
            record.subject,
            record.sender,
            record.timestamp,
            record.body_excerpt,
            record.has_verification_code as i32,
            record.content_hash,
            encode_embedding(embedding),
            now,
        ],
    )?;
    Ok(())
}

pub fn set_slot(conn: &Connection, remote_id: RemoteId, slot: Slot) -> Result<(), MailsiftError> {
    let updated = conn.execute(
        "UPDATE messages SET slot = ?1 WHERE remote_id = ?2",
        params![slot, remote_id as i64],
    )?;
    if updated != 1 {
        return Err(MailsiftError::Consistency(format!(
            "slot {} written for missing message {}",
            slot, remote_id
        )));
    }
    Ok(())
}

pub fn delete_all(conn: &Connection) -> Result<usize, MailsiftError> {
    Ok(conn.execute("DELETE FROM messages", [])?)
}

/// Returns false when no row existed.
pub fn delete_message(conn: &Connection, remote_id: RemoteId) -> Result<bool, MailsiftError> {
    let deleted = conn.execute(
        "DELETE FROM messages WHERE remote_id = ?1",
        params![remote_id as i64],
    )?;
    Ok(deleted == 1)
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

pub fn get_message(pool: &DbPool, remote_id: RemoteId) -> Result<Option<MessageRecord>, MailsiftError> {
    let conn = pool.get()?;
    let record = conn
        .query_row(
            &format!("SELECT {} FROM messages WHERE remote_id = ?1", RECORD_COLUMNS),
            params![remote_id as i64],
            row_to_record,
        )
        .optional()?;
    Ok(record)
}

/// Load several records over one connection so they come from the same snapshot.
pub fn get_messages(
    conn: &Connection,
    remote_ids: &[RemoteId],
) -> Result<HashMap<RemoteId, MessageRecord>, MailsiftError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM messages WHERE remote_id = ?1",
        RECORD_COLUMNS
    ))?;
    let mut found = HashMap::with_capacity(remote_ids.len());
    for &remote_id in remote_ids {
        if let Some(record) = stmt
            .query_row(params![remote_id as i64], row_to_record)
            .optional()?
        {
            found.insert(remote_id, record);
        }
    }
    Ok(found)
}

/// Most recent messages first.
pub fn list_messages(pool: &DbPool, limit: usize) -> Result<Vec<MessageRecord>, MailsiftError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM messages ORDER BY timestamp DESC, remote_id DESC LIMIT ?1",
        RECORD_COLUMNS
    ))?;
    let rows = stmt
        .query_map(params![limit as i64], row_to_record)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Every record in remote id order, for pattern and keyword scans.
pub fn scan_messages(pool: &DbPool) -> Result<Vec<MessageRecord>, MailsiftError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM messages ORDER BY remote_id ASC",
        RECORD_COLUMNS
    ))?;
    let rows = stmt
        .query_map([], row_to_record)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Records whose subject or excerpt contains every one of `keywords`
/// (case-insensitive), newest first.
pub fn keyword_search(
    pool: &DbPool,
    keywords: &[String],
    limit: usize,
) -> Result<Vec<MessageRecord>, MailsiftError> {
    if keywords.is_empty() {
        return Ok(Vec::new());
    }
    let clauses: Vec<String> = (1..=keywords.len())
        .map(|i| format!("(lower(subject) LIKE ?{i} OR lower(body_excerpt) LIKE ?{i})"))
        .collect();
    let sql = format!(
        "SELECT {} FROM messages WHERE {} ORDER BY timestamp DESC, remote_id DESC LIMIT {}",
        RECORD_COLUMNS,
        clauses.join(" AND "),
        limit
    );
    let patterns: Vec<String> = keywords
        .iter()
        .map(|k| format!("%{}%", k.to_lowercase()))
        .collect();

    let conn = pool.get()?;
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(patterns.iter()), row_to_record)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn content_hash(conn: &Connection, remote_id: RemoteId) -> Result<Option<String>, MailsiftError> {
    let hash = conn
        .query_row(
            "SELECT content_hash FROM messages WHERE remote_id = ?1",
            params![remote_id as i64],
            |row| row.get(0),
        )
        .optional()?;
    Ok(hash)
}

/// (remote_id, slot) for every row, slot None for rows never assigned one.
pub fn all_slots(conn: &Connection) -> Result<Vec<(RemoteId, Option<Slot>)>, MailsiftError> {
    let mut stmt = conn.prepare("SELECT remote_id, slot FROM messages ORDER BY remote_id")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, i64>(0)? as RemoteId, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub struct StoredEmbedding {
    pub remote_id: RemoteId,
    pub slot: Option<Slot>,
    pub embedding: Vec<f32>,
}

/// Embeddings of every row, ordered by slot so rebuilds claim slots in order.
pub fn all_embeddings(conn: &Connection) -> Result<Vec<StoredEmbedding>, MailsiftError> {
    let mut stmt = conn.prepare(
        "SELECT remote_id, slot, embedding FROM messages
         ORDER BY slot IS NULL, slot, remote_id",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)? as RemoteId,
                row.get::<_, Option<Slot>>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(remote_id, slot, blob)| {
            Ok(StoredEmbedding {
                remote_id,
                slot,
                embedding: decode_embedding(&blob)?,
            })
        })
        .collect()
}

/// Dimension of the stored embeddings, None when the store is empty.
pub fn embedding_dimension(conn: &Connection) -> Result<Option<usize>, MailsiftError> {
    let bytes: Option<i64> = conn
        .query_row("SELECT length(embedding) FROM messages LIMIT 1", [], |row| row.get(0))
        .optional()?;
    Ok(bytes.map(|b| b as usize / 4))
}

pub fn message_count(pool: &DbPool) -> Result<usize, MailsiftError> {
    let conn = pool.get()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
    Ok(count as usize)
}

pub fn slotted_count(pool: &DbPool) -> Result<usize, MailsiftError> {
    let conn = pool.get()?;
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE slot IS NOT NULL",
        [],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

/// Oldest and newest message timestamps, ignoring undated messages.
pub fn date_range(pool: &DbPool) -> Result<Option<(i64, i64)>, MailsiftError> {
    let conn = pool.get()?;
    let range: (Option<i64>, Option<i64>) = conn.query_row(
        "SELECT MIN(timestamp), MAX(timestamp) FROM messages WHERE timestamp > 0",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(match range {
        (Some(min), Some(max)) => Some((min, max)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::pool;

    fn record(remote_id: RemoteId) -> MessageRecord {
        MessageRecord {
            remote_id,
            epoch: "E1".into(),
            subject: format!("subject {}", remote_id),
            sender: "alice@example.com".into(),
            timestamp: 1_700_000_000 + remote_id as i64,
            body_excerpt: "hello".into(),
            has_verification_code: false,
            content_hash: "abc".into(),
            slot: None,
        }
    }

    #[test]
    fn test_embedding_blob_round_trip() {
        let v = vec![0.5_f32, -1.25, 3.0];
        assert_eq!(decode_embedding(&encode_embedding(&v)).unwrap(), v);
        assert!(decode_embedding(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_upsert_clears_slot() {
        let pool = pool::in_memory().unwrap();
        {
            let conn = pool.get().unwrap();
            upsert_message(&conn, &record(7), &[1.0, 0.0]).unwrap();
            set_slot(&conn, 7, 3).unwrap();
        }
        assert_eq!(get_message(&pool, 7).unwrap().unwrap().slot, Some(3));

        {
            let conn = pool.get().unwrap();
            upsert_message(&conn, &record(7), &[0.0, 1.0]).unwrap();
        }
        let stored = get_message(&pool, 7).unwrap().unwrap();
        assert_eq!(stored.slot, None);
        assert_eq!(message_count(&pool).unwrap(), 1);
    }

    #[test]
    fn test_set_slot_for_missing_row_is_consistency_error() {
        let pool = pool::in_memory().unwrap();
        let conn = pool.get().unwrap();
        let err = set_slot(&conn, 99, 0).unwrap_err();
        assert!(matches!(err, MailsiftError::Consistency(_)));
    }

    #[test]
    fn test_slot_is_unique() {
        let pool = pool::in_memory().unwrap();
        let conn = pool.get().unwrap();
        upsert_message(&conn, &record(1), &[1.0]).unwrap();
        upsert_message(&conn, &record(2), &[1.0]).unwrap();
        set_slot(&conn, 1, 0).unwrap();
        assert!(set_slot(&conn, 2, 0).is_err());
    }

    #[test]
    fn test_list_orders_newest_first() {
        let pool = pool::in_memory().unwrap();
        {
            let conn = pool.get().unwrap();
            for id in [3, 1, 2] {
                upsert_message(&conn, &record(id), &[1.0]).unwrap();
            }
        }
        let ids: Vec<RemoteId> = list_messages(&pool, 2)
            .unwrap()
            .into_iter()
            .map(|r| r.remote_id)
            .collect();
        assert_eq!(ids, vec![3, 2]);
        assert_eq!(date_range(&pool).unwrap(), Some((1_700_000_001, 1_700_000_003)));
    }

    #[test]
    fn test_keyword_search_matches_subject_or_body() {
        let pool = pool::in_memory().unwrap();
        {
            let conn = pool.get().unwrap();
            let mut invoice = record(1);
            invoice.subject = "Invoice for October".into();
            upsert_message(&conn, &invoice, &[1.0]).unwrap();
            let mut shipped = record(2);
            shipped.body_excerpt = "Your parcel has SHIPPED".into();
            upsert_message(&conn, &shipped, &[1.0]).unwrap();
            upsert_message(&conn, &record(3), &[1.0]).unwrap();
        }
        let ids = |keywords: &[&str]| -> Vec<RemoteId> {
            let keywords: Vec<String> = keywords.iter().map(|k| k.to_string()).collect();
            keyword_search(&pool, &keywords, 10)
                .unwrap()
                .into_iter()
                .map(|r| r.remote_id)
                .collect()
        };
        assert_eq!(ids(&["invoice"]), vec![1]);
        assert_eq!(ids(&["parcel", "shipped"]), vec![2]);
        assert!(ids(&["invoice", "shipped"]).is_empty());
        assert!(keyword_search(&pool, &[], 10).unwrap().is_empty());
    }

    #[test]
    fn test_all_embeddings_orders_by_slot() {
        let pool = pool::in_memory().unwrap();
        let conn = pool.get().unwrap();
        upsert_message(&conn, &record(1), &[1.0, 0.0]).unwrap();
        upsert_message(&conn, &record(2), &[0.0, 1.0]).unwrap();
        upsert_message(&conn, &record(3), &[0.5, 0.5]).unwrap();
        set_slot(&conn, 1, 5).unwrap();
        set_slot(&conn, 2, 0).unwrap();

        let stored = all_embeddings(&conn).unwrap();
        let order: Vec<(RemoteId, Option<Slot>)> =
            stored.iter().map(|s| (s.remote_id, s.slot)).collect();
        assert_eq!(order, vec![(2, Some(0)), (1, Some(5)), (3, None)]);
        assert_eq!(stored[0].embedding, vec![0.0, 1.0]);
    }
}
