//! Durable backends for swapped-out sessions.
//!
//! The manager is decoupled from any particular storage medium through the
//! [`Store`] trait. Every operation may fail with a store error; a missing
//! key is not an error (`load` returns `Ok(None)`, `remove` is a no-op).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::session::SessionSnapshot;

/// Trait for durable session storage.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Ids of every persisted session.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Load a persisted session, or `None` if nothing is stored under `id`.
    ///
    /// Data that cannot be decoded is reported as [`Error::Deserialization`].
    async fn load(&self, id: &str) -> Result<Option<SessionSnapshot>>;

    /// Persist a session, replacing any previous snapshot with the same id.
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<()>;

    /// Delete a persisted session. Removing an absent id succeeds.
    async fn remove(&self, id: &str) -> Result<()>;

    /// Delete every persisted session.
    async fn clear(&self) -> Result<()>;

    /// Number of persisted sessions.
    async fn size(&self) -> Result<usize> {
        Ok(self.keys().await?.len())
    }

    /// Whether saved sessions actually survive.
    ///
    /// A non-durable store turns swapping and backup into no-ops, since
    /// releasing a session into it would lose the session.
    fn is_durable(&self) -> bool {
        true
    }
}

/// The absent store: nothing is persisted and nothing is ever found.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoStore;

#[async_trait]
impl Store for NoStore {
    async fn keys(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn load(&self, _id: &str) -> Result<Option<SessionSnapshot>> {
        Ok(None)
    }

    async fn save(&self, _snapshot: &SessionSnapshot) -> Result<()> {
        Ok(())
    }

    async fn remove(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }
}

/// In-process store holding each session as encoded JSON bytes.
///
/// Sessions go through the same encode/decode path as a disk store, so a
/// snapshot read back is a fresh copy and corrupted bytes are detectable.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store raw bytes under `id`, bypassing encoding.
    pub fn insert_raw(&self, id: impl Into<String>, bytes: Vec<u8>) {
        self.entries.lock().insert(id.into(), bytes);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.lock().contains_key(id)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn load(&self, id: &str) -> Result<Option<SessionSnapshot>> {
        let bytes = match self.entries.lock().get(id) {
            Some(bytes) => bytes.clone(),
            None => return Ok(None),
        };
        decode_snapshot(id, &bytes).map(Some)
    }

    async fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let bytes = encode_snapshot(snapshot)?;
        self.entries.lock().insert(snapshot.id.clone(), bytes);
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.entries.lock().remove(id);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.lock().clear();
        Ok(())
    }

    async fn size(&self) -> Result<usize> {
        Ok(self.entries.lock().len())
    }
}

/// Shared stores, so callers can keep a handle to the store a manager owns.
#[async_trait]
impl<T: Store> Store for Arc<T> {
    async fn keys(&self) -> Result<Vec<String>> {
        (**self).keys().await
    }

    async fn load(&self, id: &str) -> Result<Option<SessionSnapshot>> {
        (**self).load(id).await
    }

    async fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        (**self).save(snapshot).await
    }

    async fn remove(&self, id: &str) -> Result<()> {
        (**self).remove(id).await
    }

    async fn clear(&self) -> Result<()> {
        (**self).clear().await
    }

    async fn size(&self) -> Result<usize> {
        (**self).size().await
    }

    fn is_durable(&self) -> bool {
        (**self).is_durable()
    }
}

pub(crate) fn encode_snapshot(snapshot: &SessionSnapshot) -> Result<Vec<u8>> {
    serde_json::to_vec(snapshot).map_err(|e| Error::Serialization {
        id: snapshot.id.clone(),
        message: e.to_string(),
    })
}

/// Decode a snapshot, rejecting data whose embedded id does not match the key.
pub(crate) fn decode_snapshot(id: &str, bytes: &[u8]) -> Result<SessionSnapshot> {
    let snapshot: SessionSnapshot =
        serde_json::from_slice(bytes).map_err(|e| Error::Deserialization {
            id: id.to_string(),
            message: e.to_string(),
        })?;

    if snapshot.id != id {
        return Err(Error::Deserialization {
            id: id.to_string(),
            message: format!("stored snapshot belongs to session {}", snapshot.id),
        });
    }
    Ok(snapshot)
}
