use rusqlite::Connection;

use crate::error::MailsiftError;

pub fn initialize_schema(conn: &Connection) -> Result<(), MailsiftError> {
    conn.execute_batch("
        -- One row per message synced under the current epoch
        CREATE TABLE IF NOT EXISTS messages (
            remote_id       INTEGER PRIMARY KEY,  -- IMAP UID
            epoch           TEXT NOT NULL,        -- UIDVALIDITY the UID was issued under
            subject         TEXT NOT NULL DEFAULT '',
            sender          TEXT NOT NULL DEFAULT '',
            timestamp       INTEGER NOT NULL DEFAULT 0,  -- unix epoch seconds
            body_excerpt    TEXT NOT NULL DEFAULT '',
            has_verification_code INTEGER NOT NULL DEFAULT 0,
            content_hash    TEXT NOT NULL,
            embedding       BLOB NOT NULL,        -- little-endian f32, kept for index rebuilds
            slot            INTEGER UNIQUE,       -- vector index slot, NULL only inside a commit
            synced_at       INTEGER NOT NULL      -- unix epoch ms
        );

        CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp DESC);
        CREATE INDEX IF NOT EXISTS idx_messages_code      ON messages(has_verification_code);

        -- Single-row sync state
        CREATE TABLE IF NOT EXISTS sync_state (
            id               INTEGER PRIMARY KEY CHECK (id = 1),
            epoch            TEXT,
            watermark        INTEGER NOT NULL DEFAULT 0,
            index_generation INTEGER NOT NULL DEFAULT 0,
            last_sync        INTEGER              -- unix epoch ms
        );

        -- Identifiers at or below the watermark that were deliberately not stored
        CREATE TABLE IF NOT EXISTS skipped_messages (
            remote_id   INTEGER PRIMARY KEY,
            epoch       TEXT NOT NULL,
            reason      TEXT NOT NULL,
            skipped_at  INTEGER NOT NULL          -- unix epoch ms
        );
    ")?;

    Ok(())
}
