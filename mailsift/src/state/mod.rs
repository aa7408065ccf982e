//! Local state directory: metadata database, vector index and sync lock
//!
//! Layout under the state root:
//! - `mailsift.db`: the metadata store
//! - `index/`: persisted vector index generations
//! - `sync.lock`: held for the duration of a sync cycle

pub mod lock;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::adapters::sqlite::{self, DbPool};
use crate::error::MailsiftError;
use crate::index::hnsw::HnswParams;
use crate::index::{persist, VectorIndex};
use crate::logging::fmt_ms;
use crate::types::{RemoteId, Slot, SyncState};
pub use lock::SyncLock;

pub type SharedIndex = Arc<RwLock<VectorIndex>>;

const DB_FILE: &str = "mailsift.db";
const INDEX_DIR: &str = "index";
const LOCK_FILE: &str = "sync.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Sync and rebuild may write the state directory
    ReadWrite,
    /// Readers (search, list, status) never write; a broken index is rebuilt in memory only
    ReadOnly,
}

/// Settings needed to open the state directory.
#[derive(Debug, Clone)]
pub struct StateOptions {
    pub dimension: usize,
    pub index: HnswParams,
    pub busy_timeout: Duration,
    pub mode: OpenMode,
}

pub struct LocalState {
    root: PathBuf,
    pool: DbPool,
    index: SharedIndex,
    options: StateOptions,
}

impl LocalState {
    /// Open the state directory, loading the persisted index or rebuilding
    /// it from the metadata store when it is missing or unusable.
    pub fn open(root: &Path, options: StateOptions) -> Result<Self, MailsiftError> {
        std::fs::create_dir_all(root)
            .map_err(|e| MailsiftError::Io(format!("Failed to create state dir {}: {}", root.display(), e)))?;

        let pool = sqlite::pool::create_pool(&root.join(DB_FILE), options.busy_timeout)?;

        let (state, stored_dimension) = {
            let conn = pool.get()?;
            (
                sqlite::sync_state::load_sync_state(&conn)?,
                sqlite::messages::embedding_dimension(&conn)?,
            )
        };

        if let Some(stored) = stored_dimension {
            if stored != options.dimension {
                return Err(MailsiftError::Config(format!(
                    "stored embeddings have dimension {}, embedder produces {}; \
                     use a new state_dir or the original embedding model",
                    stored, options.dimension
                )));
            }
        }

        let empty = VectorIndex::new(options.dimension, options.index);
        let local = Self {
            root: root.to_path_buf(),
            pool,
            index: Arc::new(RwLock::new(empty)),
            options,
        };

        let index_dir = local.index_dir();
        let nothing_stored = stored_dimension.is_none() && !persist::exists(&index_dir);
        if nothing_stored {
            if let Ok(mut index) = local.index.write() {
                index.set_generation(state.index_generation);
            }
            return Ok(local);
        }

        match persist::load(&index_dir, state.index_generation, local.options.dimension)
            .and_then(|index| local.check_against_store(index))
        {
            Ok(index) => {
                *local.write_index()? = index;
            }
            Err(MailsiftError::CorruptIndex(reason)) => {
                warn!("Persisted index unusable ({}), rebuilding from metadata", reason);
                local.rebuild_index()?;
            }
            Err(e) => return Err(e),
        }

        Ok(local)
    }

    /// Reject a loaded index whose mapping disagrees with the metadata store.
    fn check_against_store(&self, index: VectorIndex) -> Result<VectorIndex, MailsiftError> {
        let conn = self.pool.get()?;
        verify_bijection(&conn, &index).map_err(|e| match e {
            MailsiftError::Consistency(msg) => MailsiftError::CorruptIndex(msg),
            other => other,
        })?;
        Ok(index)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn options(&self) -> &StateOptions {
        &self.options
    }

    pub fn mode(&self) -> OpenMode {
        self.options.mode
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join(DB_FILE)
    }

    pub fn index_dir(&self) -> PathBuf {
        self.root.join(INDEX_DIR)
    }

    pub fn lock(&self) -> Result<SyncLock, MailsiftError> {
        SyncLock::acquire(&self.root.join(LOCK_FILE))
    }

    pub fn load_sync_state(&self) -> Result<SyncState, MailsiftError> {
        let conn = self.pool.get()?;
        sqlite::sync_state::load_sync_state(&conn)
    }

    pub fn read_index(&self) -> Result<RwLockReadGuard<'_, VectorIndex>, MailsiftError> {
        self.index
            .read()
            .map_err(|_| MailsiftError::Consistency("index lock poisoned".into()))
    }

    pub fn write_index(&self) -> Result<RwLockWriteGuard<'_, VectorIndex>, MailsiftError> {
        self.index
            .write()
            .map_err(|_| MailsiftError::Consistency("index lock poisoned".into()))
    }

    /// Rebuild the index from stored embeddings and, in read-write mode,
    /// write back reassigned slots and persist it. Returns the entry count.
    pub fn rebuild_index(&self) -> Result<usize, MailsiftError> {
        let mut guard = self.write_index()?;
        self.rebuild_locked(&mut guard)
    }

    /// Rebuild while the caller already holds the index write lock.
    pub(crate) fn rebuild_locked(&self, index: &mut VectorIndex) -> Result<usize, MailsiftError> {
        let start = Instant::now();
        let mut conn = self.pool.get()?;
        let state = sqlite::sync_state::load_sync_state(&conn)?;
        let rows = sqlite::messages::all_embeddings(&conn)?;

        let (mut rebuilt, reassigned) = VectorIndex::rebuild(
            self.options.dimension,
            self.options.index,
            rows.into_iter().map(|r| (r.remote_id, r.slot, r.embedding)),
        )?;
        rebuilt.set_generation(state.index_generation);

        if self.options.mode == OpenMode::ReadWrite {
            if !reassigned.is_empty() {
                let tx = conn.transaction()?;
                // Clear first so reassigned slots never collide with stale values
                for (remote_id, _) in &reassigned {
                    tx.execute(
                        "UPDATE messages SET slot = NULL WHERE remote_id = ?1",
                        [*remote_id as i64],
                    )?;
                }
                for (remote_id, slot) in &reassigned {
                    sqlite::messages::set_slot(&tx, *remote_id, *slot)?;
                }
                tx.commit()?;
            }
            persist::save(&self.index_dir(), &rebuilt)?;
        }
        drop(conn);

        let count = rebuilt.len();
        *index = rebuilt;
        info!(
            entries = count,
            reassigned = reassigned.len(),
            "Rebuilt vector index from metadata in {}",
            fmt_ms(start.elapsed())
        );
        Ok(count)
    }

    /// Bijection check between message rows and index mapping.
    pub fn check_invariants(&self) -> Result<(), MailsiftError> {
        let index = self.read_index()?;
        let conn = self.pool.get()?;
        verify_bijection(&conn, &index)
    }
}

/// Every row holds a slot, every live slot maps to exactly that row, and
/// nothing else is live in the index.
pub fn verify_bijection(conn: &rusqlite::Connection, index: &VectorIndex) -> Result<(), MailsiftError> {
    let rows = sqlite::messages::all_slots(conn)?;
    let mut expected: BTreeMap<Slot, RemoteId> = BTreeMap::new();

    for (remote_id, slot) in rows {
        let Some(slot) = slot else {
            return Err(MailsiftError::Consistency(format!(
                "message {} has no slot",
                remote_id
            )));
        };
        expected.insert(slot, remote_id);
        match index.remote_id(slot) {
            Some(mapped) if mapped == remote_id => {}
            Some(mapped) => {
                return Err(MailsiftError::Consistency(format!(
                    "slot {} belongs to message {} in the store but {} in the index",
                    slot, remote_id, mapped
                )))
            }
            None => {
                return Err(MailsiftError::Consistency(format!(
                    "slot {} of message {} is not in the index",
                    slot, remote_id
                )))
            }
        }
    }

    if let Some((slot, remote_id)) = index.mappings().find(|(s, _)| !expected.contains_key(s)) {
        return Err(MailsiftError::Consistency(format!(
            "index slot {} (message {}) has no row in the store",
            slot, remote_id
        )));
    }
    Ok(())
}
