//! Directory-backed session store.
//!
//! Each session lives in its own `<id>.session` file holding the JSON
//! snapshot. Writes go to a hidden temp file first and are renamed into
//! place, so a crash mid-write never leaves a truncated session behind.
//! Every write gets its own temp file, so concurrent saves of one id never
//! rename each other's data away.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::session::SessionSnapshot;
use crate::store::{Store, decode_snapshot, encode_snapshot};

const SESSION_EXTENSION: &str = "session";

/// Session store writing one file per session into a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    directory: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `directory`. The directory is created lazily.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self.directory.join(format!("{id}.{SESSION_EXTENSION}")))
    }

    fn temp_path_for(&self, id: &str) -> PathBuf {
        let nonce = Uuid::new_v4().simple();
        self.directory.join(format!(".{id}.{nonce}.{SESSION_EXTENSION}.tmp"))
    }
}

/// Reject ids that cannot safely be used as a file name.
///
/// Leading dots are reserved for temp files, which `keys` never reports.
fn validate_id(id: &str) -> Result<()> {
    let bad = id.is_empty() || id.starts_with('.') || id.contains(['/', '\\', '\0']);
    if bad {
        return Err(Error::InvalidId(id.to_string()));
    }
    Ok(())
}

#[async_trait]
impl Store for FileStore {
    async fn keys(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SESSION_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                && !stem.starts_with('.')
            {
                keys.push(stem.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn load(&self, id: &str) -> Result<Option<SessionSnapshot>> {
        let path = self.path_for(id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        trace!(session_id = %id, path = %path.display(), "Read session file");
        decode_snapshot(id, &bytes).map(Some)
    }

    async fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let path = self.path_for(&snapshot.id)?;
        let bytes = encode_snapshot(snapshot)?;

        tokio::fs::create_dir_all(&self.directory).await?;
        let temp = self.temp_path_for(&snapshot.id);
        tokio::fs::write(&temp, &bytes).await?;
        tokio::fs::rename(&temp, &path).await?;

        debug!(
            session_id = %snapshot.id,
            bytes = bytes.len(),
            "Session written to store"
        );
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let path = self.path_for(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self) -> Result<()> {
        for id in self.keys().await? {
            self.remove(&id).await?;
        }
        Ok(())
    }
}
