//! Content store collaborator.
//!
//! The orchestration core never interprets content: archive lookups,
//! processors, and responders exchange [`ContentId`]s, and the only core
//! operations are fetching bytes by ID and storing new bytes with
//! provenance. Concrete backends (object storage, a raw-storage service)
//! live outside this crate; [`MemoryContentStore`] covers tests.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::{ContentId, JobId};

/// Provenance recorded alongside a stored content entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    /// The job that produced the content.
    pub job_id: JobId,
    /// The construct that produced the content (e.g. a responder type name).
    pub produced_by: String,
    /// When the content was stored.
    pub stored_at: DateTime<Utc>,
}

impl Provenance {
    /// Creates provenance for a producing job and construct.
    #[must_use]
    pub fn new(job_id: JobId, produced_by: impl Into<String>) -> Self {
        Self {
            job_id,
            produced_by: produced_by.into(),
            stored_at: Utc::now(),
        }
    }
}

/// Raw content storage abstraction.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from
/// multiple worker tasks.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Fetches the content bytes for an entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ContentNotFound`] if no entry exists for the ID.
    async fn get(&self, content_id: &ContentId) -> Result<Bytes>;

    /// Stores content bytes with provenance, returning the new entry's ID.
    async fn put(&self, bytes: Bytes, provenance: Provenance) -> Result<ContentId>;
}

/// In-memory content store for testing.
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    entries: RwLock<HashMap<ContentId, (Bytes, Provenance)>>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

impl MemoryContentStore {
    /// Creates a new empty content store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores bytes under a caller-chosen ID.
    ///
    /// Tests use this to seed content that other components reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn insert(&self, content_id: ContentId, bytes: Bytes, provenance: Provenance) -> Result<()> {
        let mut entries = self.entries.write().map_err(poison_err)?;
        entries.insert(content_id, (bytes, provenance));
        Ok(())
    }

    /// Returns the number of stored entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        let entries = self.entries.read().map_err(poison_err)?;
        Ok(entries.len())
    }

    /// Returns true if the store holds no entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn get(&self, content_id: &ContentId) -> Result<Bytes> {
        let entries = self.entries.read().map_err(poison_err)?;
        entries
            .get(content_id)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| Error::ContentNotFound {
                content_id: content_id.to_string(),
            })
    }

    async fn put(&self, bytes: Bytes, provenance: Provenance) -> Result<ContentId> {
        let content_id = ContentId::generate();
        let mut entries = self.entries.write().map_err(poison_err)?;
        entries.insert(content_id, (bytes, provenance));
        Ok(content_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_roundtrip() -> Result<()> {
        let store = MemoryContentStore::new();
        let provenance = Provenance::new(JobId::generate(), "test-responder");

        let id = store.put(Bytes::from_static(b"hello"), provenance).await?;
        let fetched = store.get(&id).await?;

        assert_eq!(fetched, Bytes::from_static(b"hello"));
        assert_eq!(store.len()?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn get_missing_entry_errors() {
        let store = MemoryContentStore::new();
        let result = store.get(&ContentId::generate()).await;
        assert!(matches!(result, Err(Error::ContentNotFound { .. })));
    }

    #[tokio::test]
    async fn insert_seeds_known_id() -> Result<()> {
        let store = MemoryContentStore::new();
        let id = ContentId::generate();
        store.insert(
            id,
            Bytes::from_static(b"seeded"),
            Provenance::new(JobId::generate(), "seed"),
        )?;

        assert_eq!(store.get(&id).await?, Bytes::from_static(b"seeded"));
        Ok(())
    }
}
