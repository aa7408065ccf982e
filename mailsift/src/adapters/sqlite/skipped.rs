use rusqlite::{params, Connection};

use super::DbPool;
use crate::error::MailsiftError;
use crate::types::{RemoteId, SkippedMessage};

pub fn record_skipped(
    conn: &Connection,
    epoch: &str,
    skipped: &SkippedMessage,
) -> Result<(), MailsiftError> {
    let now = chrono::Utc::now().timestamp_millis();
    conn.execute(
        "INSERT INTO skipped_messages (remote_id, epoch, reason, skipped_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(remote_id) DO UPDATE SET
            epoch = excluded.epoch,
            reason = excluded.reason,
            skipped_at = excluded.skipped_at",
        params![skipped.remote_id as i64, epoch, skipped.reason, now],
    )?;
    Ok(())
}

/// A message that later commits normally is no longer skipped.
pub fn clear_skipped(conn: &Connection, remote_id: RemoteId) -> Result<(), MailsiftError> {
    conn.execute(
        "DELETE FROM skipped_messages WHERE remote_id = ?1",
        params![remote_id as i64],
    )?;
    Ok(())
}

pub fn delete_all(conn: &Connection) -> Result<usize, MailsiftError> {
    Ok(conn.execute("DELETE FROM skipped_messages", [])?)
}

pub fn list_skipped(pool: &DbPool) -> Result<Vec<SkippedMessage>, MailsiftError> {
    let conn = pool.get()?;
    let mut stmt =
        conn.prepare("SELECT remote_id, reason FROM skipped_messages ORDER BY remote_id")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(SkippedMessage {
                remote_id: row.get::<_, i64>(0)? as RemoteId,
                reason: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn skipped_count(pool: &DbPool) -> Result<usize, MailsiftError> {
    let conn = pool.get()?;
    let count: i64 =
        conn.query_row("SELECT COUNT(*) FROM skipped_messages", [], |row| row.get(0))?;
    Ok(count as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::pool;

    #[test]
    fn test_record_and_clear() {
        let pool = pool::in_memory().unwrap();
        {
            let conn = pool.get().unwrap();
            let skipped = SkippedMessage {
                remote_id: 12,
                reason: "missing on server".into(),
            };
            record_skipped(&conn, "E1", &skipped).unwrap();
            // Recording twice keeps one row
            record_skipped(&conn, "E1", &skipped).unwrap();
        }
        assert_eq!(skipped_count(&pool).unwrap(), 1);
        assert_eq!(list_skipped(&pool).unwrap()[0].reason, "missing on server");

        {
            let conn = pool.get().unwrap();
            clear_skipped(&conn, 12).unwrap();
        }
        assert_eq!(skipped_count(&pool).unwrap(), 0);
    }
}
