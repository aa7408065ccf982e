//! In-memory mail source for tests and offline demos

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::MailSource;
use crate::error::MailsiftError;
use crate::types::RemoteId;

#[derive(Default)]
struct Inner {
    epoch: String,
    messages: BTreeMap<RemoteId, Vec<u8>>,
    /// Remaining fetches that fail with a transient error
    transient_failures: usize,
    auth_failure: bool,
    epoch_unreadable: bool,
}

#[derive(Default)]
pub struct MemoryMailSource {
    inner: Mutex<Inner>,
    fetches: AtomicUsize,
}

impl MemoryMailSource {
    pub fn new(epoch: &str) -> Self {
        let source = Self::default();
        source.set_epoch(epoch);
        source
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panicking test thread must not hide the state from the others
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_epoch(&self, epoch: &str) {
        self.inner().epoch = epoch.to_string();
    }

    pub fn insert(&self, remote_id: RemoteId, raw: impl Into<Vec<u8>>) {
        self.inner().messages.insert(remote_id, raw.into());
    }

    pub fn remove(&self, remote_id: RemoteId) {
        self.inner().messages.remove(&remote_id);
    }

    pub fn clear(&self) {
        self.inner().messages.clear();
    }

    pub fn fail_next_fetches(&self, count: usize) {
        self.inner().transient_failures = count;
    }

    pub fn set_auth_failure(&self, failing: bool) {
        self.inner().auth_failure = failing;
    }

    pub fn set_epoch_unreadable(&self, unreadable: bool) {
        self.inner().epoch_unreadable = unreadable;
    }

    /// Number of `fetch_raw` calls so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailSource for MemoryMailSource {
    async fn epoch(&self) -> Result<String, MailsiftError> {
        let inner = self.inner();
        if inner.auth_failure {
            return Err(MailsiftError::Auth("invalid credentials".into()));
        }
        if inner.epoch_unreadable {
            return Err(MailsiftError::TransientIo("connection reset".into()));
        }
        Ok(inner.epoch.clone())
    }

    async fn list_identifiers(&self) -> Result<Vec<RemoteId>, MailsiftError> {
        Ok(self.inner().messages.keys().copied().collect())
    }

    async fn fetch_raw(&self, remote_id: RemoteId) -> Result<Option<Vec<u8>>, MailsiftError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner();
        if inner.auth_failure {
            return Err(MailsiftError::Auth("session expired".into()));
        }
        if inner.transient_failures > 0 {
            inner.transient_failures -= 1;
            return Err(MailsiftError::TransientIo("connection reset".into()));
        }
        Ok(inner.messages.get(&remote_id).cloned())
    }

    fn describe(&self) -> String {
        format!("memory ({} messages)", self.inner().messages.len())
    }
}
