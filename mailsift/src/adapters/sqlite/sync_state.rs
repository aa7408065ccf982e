use rusqlite::{params, Connection, OptionalExtension};

use crate::error::MailsiftError;
use crate::types::{RemoteId, SyncState, Watermark};

pub fn load_sync_state(conn: &Connection) -> Result<SyncState, MailsiftError> {
    let row = conn
        .query_row(
            "SELECT epoch, watermark, index_generation, last_sync FROM sync_state WHERE id = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                ))
            },
        )
        .optional()?;

    let Some((epoch, watermark, generation, last_sync)) = row else {
        return Ok(SyncState::default());
    };

    Ok(SyncState {
        watermark: epoch.map(|epoch| Watermark::new(epoch, watermark as RemoteId)),
        index_generation: generation as u64,
        last_sync,
    })
}

pub fn write_sync_state(conn: &Connection, state: &SyncState) -> Result<(), MailsiftError> {
    conn.execute(
        "INSERT INTO sync_state (id, epoch, watermark, index_generation, last_sync)
         VALUES (1, ?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET
            epoch = excluded.epoch,
            watermark = excluded.watermark,
            index_generation = excluded.index_generation,
            last_sync = excluded.last_sync",
        params![
            state.epoch(),
            state.highest_remote_id() as i64,
            state.index_generation as i64,
            state.last_sync,
        ],
    )?;
    Ok(())
}
