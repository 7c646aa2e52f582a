//! # Record Controller
//!
//! Entry point into the bookkeeping store.
//!
//! ## Local Change Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Local Change → Managed Record                        │
//! │                                                                         │
//! │  app edits an object                                                   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  controller.update_record(object)  ← queued, returns immediately       │
//! │       │                                                                 │
//! │       ▼  (next sync pass, after the remote fetch)                      │
//! │  controller.process_pending_updates()                                  │
//! │       │   local.status = updated | deleted                             │
//! │       │   local.modification_date = now                                │
//! │       │   local.content_hash = object.content_hash()                   │
//! │       ▼                                                                 │
//! │  one context save                                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Updates are queued rather than applied immediately so they can never
//! interleave with a remote fetch that is rewriting the same records.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use harmony_core::{
    ChangeToken, ConflictAction, ConflictResolution, LocalRecord, ManagedRecord, RecordID,
    RecordPredicate, RecordStatus, Syncable,
};

use crate::context::RecordContext;
use crate::error::DbResult;
use crate::pool::Database;
use crate::record::Record;
use crate::store::ObjectStore;

/// A local change waiting to be applied to its managed record.
#[derive(Debug, Clone)]
enum PendingUpdate {
    Updated(Arc<dyn Syncable>),
    Deleted(Arc<dyn Syncable>),
}

impl PendingUpdate {
    fn object(&self) -> &Arc<dyn Syncable> {
        match self {
            PendingUpdate::Updated(object) | PendingUpdate::Deleted(object) => object,
        }
    }
}

/// Owns the bookkeeping database and the application's object store.
pub struct RecordController {
    db: Database,
    objects: Arc<dyn ObjectStore>,
    pending_updates: Mutex<Vec<PendingUpdate>>,
}

impl RecordController {
    pub fn new(db: Database, objects: Arc<dyn ObjectStore>) -> Self {
        RecordController {
            db,
            objects,
            pending_updates: Mutex::new(Vec::new()),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.objects
    }

    /// Creates a fresh root context.
    pub fn new_context(&self) -> RecordContext {
        RecordContext::new(self.db.clone(), Arc::clone(&self.objects))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Records matching `predicate`, read in a fresh context.
    pub async fn fetch_records(&self, predicate: RecordPredicate) -> DbResult<Vec<Record>> {
        self.new_context().fetch_records(predicate).await
    }

    /// Records awaiting an external conflict decision.
    pub async fn fetch_conflicted_records(&self) -> DbResult<Vec<Record>> {
        self.fetch_records(RecordPredicate::Conflicted).await
    }

    /// Records with the given ids; unknown ids are skipped.
    pub async fn fetch_records_for(&self, record_ids: &[RecordID]) -> DbResult<Vec<Record>> {
        let context = self.new_context();
        let mut records = Vec::with_capacity(record_ids.len());
        for record_id in record_ids {
            if let Some(record) = context.fetch_record(record_id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    // =========================================================================
    // Seeding
    // =========================================================================

    /// Creates `normal` local records for every syncing-enabled object that
    /// has no managed record yet, then marks the store as seeded.
    ///
    /// Returns the number of records created.
    pub async fn seed(&self) -> DbResult<usize> {
        let context = self.new_context();
        let objects = self.objects.fetch_all_objects().await?;
        let mut created = 0;

        for object in objects {
            let Some(record_id) = object.record_id() else {
                warn!(object_type = object.syncable_type(), "Skipping object without primary key");
                continue;
            };
            if !object.is_syncing_enabled() || context.fetch_record(&record_id).await?.is_some() {
                continue;
            }

            let mut local = LocalRecord::new(RecordStatus::Normal, Utc::now());
            local.content_hash = Some(object.content_hash());
            context.insert(ManagedRecord::new(record_id).with_local(local));
            created += 1;
        }

        context.save().await?;
        self.db.state().set_seeded(true).await?;

        info!(created, "Seeded managed records from local objects");
        Ok(created)
    }

    pub async fn is_seeded(&self) -> DbResult<bool> {
        self.db.state().is_seeded().await
    }

    // =========================================================================
    // Local Changes
    // =========================================================================

    /// Queues an object that was inserted or modified locally.
    pub async fn update_record(&self, object: Arc<dyn Syncable>) {
        self.pending_updates
            .lock()
            .await
            .push(PendingUpdate::Updated(object));
    }

    /// Queues an object that was deleted locally.
    pub async fn delete_record(&self, object: Arc<dyn Syncable>) {
        self.pending_updates
            .lock()
            .await
            .push(PendingUpdate::Deleted(object));
    }

    /// Number of queued local changes.
    pub async fn pending_update_count(&self) -> usize {
        self.pending_updates.lock().await.len()
    }

    /// Applies every queued local change in one context save.
    ///
    /// On failure the changes are put back at the front of the queue.
    /// Returns the number of records touched.
    pub async fn process_pending_updates(&self) -> DbResult<usize> {
        let updates = std::mem::take(&mut *self.pending_updates.lock().await);
        if updates.is_empty() {
            return Ok(0);
        }

        match self.apply_updates(&updates).await {
            Ok(count) => {
                debug!(count, "Processed pending updates");
                Ok(count)
            }
            Err(err) => {
                warn!(error = %err, "Failed to process pending updates; re-queueing");
                let mut queue = self.pending_updates.lock().await;
                let newer = std::mem::replace(&mut *queue, updates);
                queue.extend(newer);
                Err(err)
            }
        }
    }

    async fn apply_updates(&self, updates: &[PendingUpdate]) -> DbResult<usize> {
        let context = self.new_context();
        let mut touched = 0;

        for update in updates {
            let object = update.object();
            let Some(record_id) = object.record_id() else {
                warn!(object_type = object.syncable_type(), "Ignoring change to object without primary key");
                continue;
            };
            let now = Utc::now();

            match (update, context.fetch_record(&record_id).await?) {
                (PendingUpdate::Updated(object), Some(record)) => {
                    let hash = object.content_hash();
                    let enabled = object.is_syncing_enabled();
                    record.perform_mut(|r| {
                        let local = r
                            .local
                            .get_or_insert_with(|| LocalRecord::new(RecordStatus::Updated, now));
                        local.status = RecordStatus::Updated;
                        local.modification_date = now;
                        local.content_hash = Some(hash);
                        r.is_syncing_enabled = enabled;
                    });
                }
                (PendingUpdate::Updated(object), None) => {
                    if !object.is_syncing_enabled() {
                        continue;
                    }
                    let mut local = LocalRecord::new(RecordStatus::Updated, now);
                    local.content_hash = Some(object.content_hash());
                    context.insert(ManagedRecord::new(record_id).with_local(local));
                }
                (PendingUpdate::Deleted(_), Some(record)) => {
                    record.perform_mut(|r| {
                        let local = r
                            .local
                            .get_or_insert_with(|| LocalRecord::new(RecordStatus::Deleted, now));
                        local.status = RecordStatus::Deleted;
                        local.modification_date = now;
                    });
                }
                (PendingUpdate::Deleted(_), None) => continue,
            }
            touched += 1;
        }

        context.save().await?;
        Ok(touched)
    }

    // =========================================================================
    // Record Flags
    // =========================================================================

    /// Turns syncing on or off for a record.
    pub async fn set_syncing_enabled(&self, record: &Record, enabled: bool) -> DbResult<()> {
        let context = self.new_context();
        record.perform_in(&context, |r| r.is_syncing_enabled = enabled);
        context.save().await
    }

    /// Settles a conflicted record.
    ///
    /// `Local` marks the local copy for upload over the current remote
    /// version; `Remote` marks the remote copy for download. `Newest` and
    /// `Oldest` pick one of the two by date. `Conflict` leaves the record
    /// untouched.
    pub async fn resolve_conflict(
        &self,
        record: &Record,
        resolution: ConflictResolution,
    ) -> DbResult<()> {
        let context = self.new_context();

        record.perform_in(&context, |r| {
            let (Some(local), Some(remote)) = (r.local.as_mut(), r.remote.as_mut()) else {
                r.is_conflicted = false;
                return;
            };

            match resolution.action(local.modification_date, remote.version.date) {
                ConflictAction::Upload => {
                    local.status = RecordStatus::Updated;
                    local.version = Some(remote.version.clone());
                    remote.status = RecordStatus::Normal;
                    r.is_conflicted = false;
                }
                ConflictAction::Download => {
                    local.status = RecordStatus::Normal;
                    remote.status = RecordStatus::Updated;
                    r.is_conflicted = false;
                }
                ConflictAction::Conflict => {}
            }
        });

        context.save().await?;
        info!(record = %record.record_id(), ?resolution, "Resolved conflict");
        Ok(())
    }

    // =========================================================================
    // State
    // =========================================================================

    pub async fn change_token(&self) -> DbResult<Option<ChangeToken>> {
        self.db.state().change_token().await
    }

    pub async fn set_change_token(&self, token: Option<&ChangeToken>) -> DbResult<()> {
        self.db.state().set_change_token(token).await
    }

    /// Logs every managed record at debug level.
    pub async fn print_records(&self) -> DbResult<Vec<ManagedRecord>> {
        let records = self.db.records().fetch_all().await?;
        for record in &records {
            debug!(
                record = %record.record_id,
                local = ?record.local_status(),
                remote = ?record.remote_status(),
                action = ?record.sync_action(),
                conflicted = record.is_conflicted,
                syncing = record.is_syncing_enabled,
                "Managed record"
            );
        }
        Ok(records)
    }

    /// Forgets every managed record, the change token and the seeded flag.
    pub async fn reset(&self) -> DbResult<()> {
        self.pending_updates.lock().await.clear();
        let removed = self.db.records().delete_all().await?;
        self.db.state().clear().await?;
        info!(removed, "Reset record bookkeeping");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::DbConfig;
    use crate::store::MemoryObjectStore;
    use harmony_core::{RemoteRecord, Version};
    use serde_json::Value;

    #[derive(Debug)]
    struct Game {
        id: String,
        plays: i64,
        syncing: bool,
    }

    impl Syncable for Game {
        fn syncable_type(&self) -> &str {
            "Game"
        }
        fn primary_key(&self) -> Option<&str> {
            Some(&self.id)
        }
        fn syncable_keys(&self) -> Vec<String> {
            vec!["plays".into()]
        }
        fn syncable_value(&self, key: &str) -> Option<Value> {
            (key == "plays").then(|| Value::from(self.plays))
        }
        fn is_syncing_enabled(&self) -> bool {
            self.syncing
        }
    }

    fn game(id: &str, plays: i64) -> Arc<dyn Syncable> {
        Arc::new(Game {
            id: id.into(),
            plays,
            syncing: true,
        })
    }

    async fn controller() -> (RecordController, Arc<MemoryObjectStore>) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let objects = Arc::new(MemoryObjectStore::new());
        (RecordController::new(db, objects.clone()), objects)
    }

    #[tokio::test]
    async fn test_seed_creates_upload_records_once() {
        let (controller, objects) = controller().await;
        objects.insert(game("1", 0)).await.unwrap();
        objects.insert(game("2", 0)).await.unwrap();
        objects
            .insert(Arc::new(Game {
                id: "3".into(),
                plays: 0,
                syncing: false,
            }))
            .await
            .unwrap();

        assert_eq!(controller.seed().await.unwrap(), 2);
        assert!(controller.is_seeded().await.unwrap());
        assert_eq!(controller.seed().await.unwrap(), 0);

        let uploads = controller.fetch_records(RecordPredicate::Upload).await.unwrap();
        assert_eq!(uploads.len(), 2);
    }

    #[tokio::test]
    async fn test_pending_updates_are_applied_in_batch() {
        let (controller, _) = controller().await;

        controller.update_record(game("1", 1)).await;
        controller.update_record(game("2", 1)).await;
        assert_eq!(controller.pending_update_count().await, 2);

        assert_eq!(controller.process_pending_updates().await.unwrap(), 2);
        assert_eq!(controller.pending_update_count().await, 0);

        controller.delete_record(game("1", 1)).await;
        controller.process_pending_updates().await.unwrap();

        let records = controller
            .fetch_records_for(&[RecordID::new("Game", "1"), RecordID::new("Game", "2")])
            .await
            .unwrap();
        assert_eq!(records[0].local_status(), Some(RecordStatus::Deleted));
        assert_eq!(records[1].local_status(), Some(RecordStatus::Updated));
        assert_eq!(
            records[1].perform(|r| r.local.as_ref().and_then(|l| l.content_hash.clone())).flatten(),
            Some(game("2", 1).content_hash())
        );
    }

    #[tokio::test]
    async fn test_delete_of_unknown_object_is_ignored() {
        let (controller, _) = controller().await;
        controller.delete_record(game("9", 0)).await;
        assert_eq!(controller.process_pending_updates().await.unwrap(), 0);
        assert!(controller.fetch_records(RecordPredicate::All).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_conflict_with_local_copy() {
        let (controller, _) = controller().await;
        let record_id = RecordID::new("Game", "1");

        let mut record = ManagedRecord::new(record_id.clone())
            .with_local(LocalRecord::new(RecordStatus::Updated, Utc::now()))
            .with_remote(RemoteRecord::new("r-1", record_id.clone(), Version::new("v2", Utc::now())));
        record.is_conflicted = true;

        let context = controller.new_context();
        context.insert(record);
        context.save().await.unwrap();

        let conflicted = controller.fetch_conflicted_records().await.unwrap();
        assert_eq!(conflicted.len(), 1);

        controller
            .resolve_conflict(&conflicted[0], ConflictResolution::Local)
            .await
            .unwrap();

        assert!(controller.fetch_conflicted_records().await.unwrap().is_empty());
        let uploads = controller.fetch_records(RecordPredicate::Upload).await.unwrap();
        assert_eq!(uploads.len(), 1);
        assert!(!uploads[0].perform(|r| r.matches(RecordPredicate::Conflict)).unwrap());
    }

    #[tokio::test]
    async fn test_set_syncing_enabled_and_reset() {
        let (controller, _) = controller().await;
        controller.update_record(game("1", 1)).await;
        controller.process_pending_updates().await.unwrap();
        controller
            .set_change_token(Some(&ChangeToken::from(vec![7])))
            .await
            .unwrap();

        let record = controller.fetch_records(RecordPredicate::All).await.unwrap().remove(0);
        controller.set_syncing_enabled(&record, false).await.unwrap();
        assert!(controller.fetch_records(RecordPredicate::Upload).await.unwrap().is_empty());

        assert_eq!(controller.print_records().await.unwrap().len(), 1);

        controller.reset().await.unwrap();
        assert!(controller.fetch_records(RecordPredicate::All).await.unwrap().is_empty());
        assert_eq!(controller.change_token().await.unwrap(), None);
    }
}
