//! # Object Store
//!
//! Where the application's own syncable objects live.
//!
//! The engine never owns domain data. It reads objects to upload them and
//! hands back replacements after downloads, always through [`ObjectStore`].
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  RecordContext::save (root)                                             │
//! │       │                                                                 │
//! │       ├──► BEGIN  (bookkeeping rows)                                    │
//! │       ├──► ObjectStore::apply_changes(upserts, deletes)                 │
//! │       │         │                                                       │
//! │       │         ├── Ok  → COMMIT                                        │
//! │       │         └── Err → ROLLBACK, save fails                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use harmony_core::{RecordID, Syncable};

use crate::error::{DbError, DbResult};

/// Object writes collected by a context and applied on save.
#[derive(Debug, Clone, Default)]
pub struct ObjectChanges {
    /// New or replaced objects (keyed by their own record id).
    pub upserts: Vec<Arc<dyn Syncable>>,

    /// Objects to remove.
    pub deletes: Vec<RecordID>,
}

impl ObjectChanges {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }
}

/// Storage for the application's syncable objects.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Looks up the object recorded under `record_id`.
    async fn fetch_object(&self, record_id: &RecordID) -> DbResult<Option<Arc<dyn Syncable>>>;

    /// Every stored object; used to seed records on first launch.
    async fn fetch_all_objects(&self) -> DbResult<Vec<Arc<dyn Syncable>>>;

    /// Applies a batch of writes atomically: either all land or none do.
    async fn apply_changes(&self, changes: ObjectChanges) -> DbResult<()>;
}

// =============================================================================
// Memory Object Store
// =============================================================================

/// In-memory [`ObjectStore`], for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<RecordID, Arc<dyn Syncable>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an object directly, outside of any context.
    pub async fn insert(&self, object: Arc<dyn Syncable>) -> DbResult<()> {
        let record_id = object_record_id(object.as_ref())?;
        self.objects.write().await.insert(record_id, object);
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn fetch_object(&self, record_id: &RecordID) -> DbResult<Option<Arc<dyn Syncable>>> {
        Ok(self.objects.read().await.get(record_id).cloned())
    }

    async fn fetch_all_objects(&self) -> DbResult<Vec<Arc<dyn Syncable>>> {
        Ok(self.objects.read().await.values().cloned().collect())
    }

    async fn apply_changes(&self, changes: ObjectChanges) -> DbResult<()> {
        // Validate everything before touching the map so a bad object
        // leaves the store untouched.
        let upserts = changes
            .upserts
            .into_iter()
            .map(|object| Ok((object_record_id(object.as_ref())?, object)))
            .collect::<DbResult<Vec<_>>>()?;

        let mut objects = self.objects.write().await;
        for record_id in &changes.deletes {
            objects.remove(record_id);
        }
        for (record_id, object) in upserts {
            objects.insert(record_id, object);
        }

        debug!(
            deletes = changes.deletes.len(),
            total = objects.len(),
            "Applied object changes"
        );
        Ok(())
    }
}

fn object_record_id(object: &dyn Syncable) -> DbResult<RecordID> {
    object.record_id().ok_or_else(|| {
        DbError::ObjectStore(format!(
            "{} object has no primary key",
            object.syncable_type()
        ))
    })
}
