//! # Record Context
//!
//! Unit of work over managed records and their recorded objects.
//!
//! ## Context Tree
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Context Hierarchy                                │
//! │                                                                         │
//! │  root context ──────────────── save() ──► SQLite transaction           │
//! │       ▲                                   + ObjectStore::apply_changes │
//! │       │ merge                                                           │
//! │  child context ─────────────── save() ──► parent's pending changes     │
//! │                                                                         │
//! │  Reads fall through: child → parent → database / object store.         │
//! │  Writes stay local until save().                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Serial Access
//! All state sits behind one mutex; every read or write is a short
//! synchronous critical section. The guard is never held across an
//! `.await`, so concurrent operations sharing a context interleave at
//! whole-closure granularity.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::{BoxFuture, FutureExt};
use tracing::{debug, warn};

use harmony_core::{ManagedRecord, RecordID, RecordPredicate, Syncable, ValidationError};

use crate::error::DbResult;
use crate::pool::Database;
use crate::record::Record;
use crate::repository::records::RecordRepository;
use crate::store::{ObjectChanges, ObjectStore};

// =============================================================================
// Context State
// =============================================================================

#[derive(Default)]
struct ContextState {
    /// Every record this context has seen, including deleted ones so that
    /// façades bound here can still read their last state.
    records: HashMap<RecordID, ManagedRecord>,

    /// Records written in this context and not yet saved.
    changed: HashSet<RecordID>,

    /// Records deleted in this context; hidden from fetches.
    deleted: HashSet<RecordID>,

    /// Deletions not yet saved.
    unsaved_deletes: HashSet<RecordID>,

    object_upserts: HashMap<RecordID, Arc<dyn Syncable>>,
    object_deletes: HashSet<RecordID>,
}

/// Where a lookup found a record.
enum Lookup {
    Present,
    Deleted,
    Unknown,
}

impl ContextState {
    fn lookup(&self, record_id: &RecordID) -> Lookup {
        if self.deleted.contains(record_id) {
            Lookup::Deleted
        } else if self.records.contains_key(record_id) {
            Lookup::Present
        } else {
            Lookup::Unknown
        }
    }

    /// Adds a record read from below without marking it changed. The copy
    /// already held here wins.
    fn register(&mut self, record: ManagedRecord) {
        if !self.deleted.contains(&record.record_id) {
            self.records.entry(record.record_id.clone()).or_insert(record);
        }
    }

    fn mark_changed(&mut self, record_id: &RecordID) {
        self.changed.insert(record_id.clone());
        self.deleted.remove(record_id);
        self.unsaved_deletes.remove(record_id);
    }

    fn mark_deleted(&mut self, record_id: &RecordID) {
        self.changed.remove(record_id);
        self.deleted.insert(record_id.clone());
        self.unsaved_deletes.insert(record_id.clone());
    }
}

/// Changes taken out of a context for saving.
struct PendingChanges {
    records: Vec<ManagedRecord>,
    deletes: Vec<RecordID>,
    objects: ObjectChanges,
}

impl PendingChanges {
    fn is_empty(&self) -> bool {
        self.records.is_empty() && self.deletes.is_empty() && self.objects.is_empty()
    }
}

// =============================================================================
// Record Context
// =============================================================================

struct ContextInner {
    db: Database,
    objects: Arc<dyn ObjectStore>,
    parent: Option<RecordContext>,
    state: Mutex<ContextState>,
}

/// Handle to a unit of work. Clones share the same context.
#[derive(Clone)]
pub struct RecordContext {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for RecordContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("RecordContext")
            .field("is_root", &self.inner.parent.is_none())
            .field("records", &state.records.len())
            .field("changed", &state.changed.len())
            .field("deleted", &state.unsaved_deletes.len())
            .finish()
    }
}

impl RecordContext {
    /// Creates a root context saving straight to the database.
    pub fn new(db: Database, objects: Arc<dyn ObjectStore>) -> Self {
        RecordContext {
            inner: Arc::new(ContextInner {
                db,
                objects,
                parent: None,
                state: Mutex::new(ContextState::default()),
            }),
        }
    }

    /// Creates a child context whose `save` merges into this one.
    pub fn new_child(&self) -> Self {
        RecordContext {
            inner: Arc::new(ContextInner {
                db: self.inner.db.clone(),
                objects: Arc::clone(&self.inner.objects),
                parent: Some(self.clone()),
                state: Mutex::new(ContextState::default()),
            }),
        }
    }

    pub fn is_root(&self) -> bool {
        self.inner.parent.is_none()
    }

    /// True when both handles refer to the same context.
    pub fn same_context(&self, other: &RecordContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn database(&self) -> &Database {
        &self.inner.db
    }

    fn state(&self) -> MutexGuard<'_, ContextState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Record Access (synchronous)
    // =========================================================================

    /// Runs `f` against the record as this context currently sees it.
    ///
    /// Returns `None` if the record isn't registered here or was deleted
    /// before this context saw it.
    pub fn with_record<R>(
        &self,
        record_id: &RecordID,
        f: impl FnOnce(&ManagedRecord) -> R,
    ) -> Option<R> {
        let state = self.state();
        state.records.get(record_id).map(f)
    }

    /// Runs `f` with mutable access and marks the record changed.
    pub fn with_record_mut<R>(
        &self,
        record_id: &RecordID,
        f: impl FnOnce(&mut ManagedRecord) -> R,
    ) -> Option<R> {
        let mut state = self.state();
        if state.deleted.contains(record_id) {
            return None;
        }
        let result = state.records.get_mut(record_id).map(f)?;
        state.mark_changed(record_id);
        Some(result)
    }

    /// Copy of the record as this context sees it.
    pub fn snapshot(&self, record_id: &RecordID) -> Option<ManagedRecord> {
        self.with_record(record_id, ManagedRecord::clone)
    }

    /// Whether the record is registered here and not deleted.
    pub fn contains(&self, record_id: &RecordID) -> bool {
        matches!(self.state().lookup(record_id), Lookup::Present)
    }

    /// Inserts (or replaces) a record and marks it changed.
    pub fn insert(&self, record: ManagedRecord) -> Record {
        let record_id = record.record_id.clone();
        {
            let mut state = self.state();
            state.records.insert(record_id.clone(), record);
            state.mark_changed(&record_id);
        }
        Record::new(record_id, self.clone())
    }

    /// Registers a copy of a record without marking it changed, unless this
    /// context already holds one.
    pub fn adopt(&self, record: ManagedRecord) -> Record {
        let record_id = record.record_id.clone();
        self.state().register(record);
        Record::new(record_id, self.clone())
    }

    /// Deletes a managed record (both halves) on save.
    pub fn delete(&self, record_id: &RecordID) {
        self.state().mark_deleted(record_id);
    }

    /// Whether anything was written since the last save.
    pub fn has_changes(&self) -> bool {
        let state = self.state();
        !state.changed.is_empty()
            || !state.unsaved_deletes.is_empty()
            || !state.object_upserts.is_empty()
            || !state.object_deletes.is_empty()
    }

    // =========================================================================
    // Record Fetches
    // =========================================================================

    /// Returns the records matching `predicate`, ordered by record id.
    ///
    /// Pending changes in this context (and its ancestors) take precedence
    /// over stored rows.
    pub fn fetch_records(
        &self,
        predicate: RecordPredicate,
    ) -> BoxFuture<'_, DbResult<Vec<Record>>> {
        async move {
            let base = match &self.inner.parent {
                Some(parent) => parent
                    .fetch_records(RecordPredicate::All)
                    .await?
                    .iter()
                    .filter_map(Record::snapshot)
                    .collect(),
                None => self.inner.db.records().fetch_all().await?,
            };

            let mut state = self.state();
            for record in base {
                state.register(record);
            }

            let mut ids: Vec<RecordID> = state
                .records
                .iter()
                .filter(|(id, record)| !state.deleted.contains(*id) && record.matches(predicate))
                .map(|(id, _)| id.clone())
                .collect();
            ids.sort();
            drop(state);

            Ok(ids
                .into_iter()
                .map(|id| Record::new(id, self.clone()))
                .collect())
        }
        .boxed()
    }

    /// Returns the record with the given id, loading it into this context.
    pub fn fetch_record<'a>(
        &'a self,
        record_id: &'a RecordID,
    ) -> BoxFuture<'a, DbResult<Option<Record>>> {
        async move {
            let lookup = self.state().lookup(record_id);
            match lookup {
                Lookup::Present => return Ok(Some(Record::new(record_id.clone(), self.clone()))),
                Lookup::Deleted => return Ok(None),
                Lookup::Unknown => {}
            }

            let loaded = match &self.inner.parent {
                Some(parent) => parent
                    .fetch_record(record_id)
                    .await?
                    .and_then(|record| record.snapshot()),
                None => self.inner.db.records().fetch(record_id).await?,
            };

            Ok(loaded.map(|record| self.adopt(record)))
        }
        .boxed()
    }

    /// Finds the record whose remote half has the given backend identifier.
    pub fn fetch_record_by_remote_identifier<'a>(
        &'a self,
        remote_identifier: &'a str,
    ) -> BoxFuture<'a, DbResult<Option<Record>>> {
        async move {
            let local_match = {
                let state = self.state();
                state
                    .records
                    .values()
                    .filter(|record| !state.deleted.contains(&record.record_id))
                    .find(|record| {
                        record
                            .remote
                            .as_ref()
                            .is_some_and(|remote| remote.identifier == remote_identifier)
                    })
                    .map(|record| record.record_id.clone())
            };
            if let Some(record_id) = local_match {
                return Ok(Some(Record::new(record_id, self.clone())));
            }

            let loaded = match &self.inner.parent {
                Some(parent) => parent
                    .fetch_record_by_remote_identifier(remote_identifier)
                    .await?
                    .and_then(|record| record.snapshot()),
                None => {
                    self.inner
                        .db
                        .records()
                        .fetch_by_remote_identifier(remote_identifier)
                        .await?
                }
            };

            Ok(loaded
                .filter(|record| !self.state().deleted.contains(&record.record_id))
                .map(|record| self.adopt(record)))
        }
        .boxed()
    }

    // =========================================================================
    // Recorded Objects
    // =========================================================================

    /// Stores an object on save, replacing any object with the same id.
    pub fn insert_object(&self, object: Arc<dyn Syncable>) -> Result<RecordID, ValidationError> {
        let record_id = object
            .record_id()
            .ok_or(ValidationError::InvalidSyncableIdentifier)?;

        let mut state = self.state();
        state.object_deletes.remove(&record_id);
        state.object_upserts.insert(record_id.clone(), object);
        Ok(record_id)
    }

    /// Removes an object on save.
    pub fn delete_object(&self, record_id: &RecordID) {
        let mut state = self.state();
        state.object_upserts.remove(record_id);
        state.object_deletes.insert(record_id.clone());
    }

    /// Drops an unsaved object write without scheduling a delete.
    pub fn discard_object(&self, record_id: &RecordID) {
        self.state().object_upserts.remove(record_id);
    }

    /// Looks up an object, seeing unsaved writes of this context first.
    pub fn fetch_object<'a>(
        &'a self,
        record_id: &'a RecordID,
    ) -> BoxFuture<'a, DbResult<Option<Arc<dyn Syncable>>>> {
        async move {
            {
                let state = self.state();
                if state.object_deletes.contains(record_id) {
                    return Ok(None);
                }
                if let Some(object) = state.object_upserts.get(record_id) {
                    return Ok(Some(Arc::clone(object)));
                }
            }

            match &self.inner.parent {
                Some(parent) => parent.fetch_object(record_id).await,
                None => self.inner.objects.fetch_object(record_id).await,
            }
        }
        .boxed()
    }

    // =========================================================================
    // Save
    // =========================================================================

    /// Persists pending changes.
    ///
    /// A child merges into its parent. A root writes every record in one
    /// SQLite transaction, then applies object changes; if the object store
    /// fails the transaction is rolled back and the changes stay pending.
    pub async fn save(&self) -> DbResult<()> {
        let pending = self.pending_changes();
        if pending.is_empty() {
            return Ok(());
        }

        match &self.inner.parent {
            Some(parent) => {
                parent.merge(&pending);
                debug!(
                    records = pending.records.len(),
                    deletes = pending.deletes.len(),
                    "Merged child context into parent"
                );
            }
            None => self.write(&pending).await?,
        }

        self.clear_saved(&pending);
        Ok(())
    }

    fn pending_changes(&self) -> PendingChanges {
        let state = self.state();

        let mut records: Vec<ManagedRecord> = state
            .changed
            .iter()
            .filter_map(|id| state.records.get(id).cloned())
            .collect();
        records.sort_by(|a, b| a.record_id.cmp(&b.record_id));

        let mut deletes: Vec<RecordID> = state.unsaved_deletes.iter().cloned().collect();
        deletes.sort();

        PendingChanges {
            records,
            deletes,
            objects: ObjectChanges {
                upserts: state.object_upserts.values().cloned().collect(),
                deletes: state.object_deletes.iter().cloned().collect(),
            },
        }
    }

    fn merge(&self, pending: &PendingChanges) {
        let mut state = self.state();

        for record in &pending.records {
            state.records.insert(record.record_id.clone(), record.clone());
            state.mark_changed(&record.record_id);
        }
        for record_id in &pending.deletes {
            state.mark_deleted(record_id);
        }
        for object in &pending.objects.upserts {
            if let Some(record_id) = object.record_id() {
                state.object_deletes.remove(&record_id);
                state.object_upserts.insert(record_id, Arc::clone(object));
            }
        }
        for record_id in &pending.objects.deletes {
            state.object_upserts.remove(record_id);
            state.object_deletes.insert(record_id.clone());
        }
    }

    async fn write(&self, pending: &PendingChanges) -> DbResult<()> {
        let mut tx = self.inner.db.pool().begin().await?;

        for record in &pending.records {
            if record.has_records() {
                RecordRepository::upsert(&mut tx, record).await?;
            } else {
                RecordRepository::delete(&mut tx, &record.record_id).await?;
            }
        }
        for record_id in &pending.deletes {
            RecordRepository::delete(&mut tx, record_id).await?;
        }

        if !pending.objects.is_empty() {
            if let Err(err) = self.inner.objects.apply_changes(pending.objects.clone()).await {
                warn!(error = %err, "Object store rejected changes; rolling back");
                tx.rollback().await?;
                return Err(err);
            }
        }

        tx.commit().await?;

        debug!(
            records = pending.records.len(),
            deletes = pending.deletes.len(),
            object_upserts = pending.objects.upserts.len(),
            object_deletes = pending.objects.deletes.len(),
            "Saved record context"
        );
        Ok(())
    }

    fn clear_saved(&self, pending: &PendingChanges) {
        let mut state = self.state();

        for record in &pending.records {
            // Untouched since the snapshot: nothing left to save.
            if state.records.get(&record.record_id) == Some(record) {
                state.changed.remove(&record.record_id);
                if !record.has_records() && self.is_root() {
                    state.deleted.insert(record.record_id.clone());
                }
            }
        }
        for record_id in &pending.deletes {
            state.unsaved_deletes.remove(record_id);
        }
        for record_id in &pending.objects.deletes {
            state.object_deletes.remove(record_id);
        }
        for object in &pending.objects.upserts {
            if let Some(record_id) = object.record_id() {
                let unchanged = state
                    .object_upserts
                    .get(&record_id)
                    .is_some_and(|current| Arc::ptr_eq(current, object));
                if unchanged {
                    state.object_upserts.remove(&record_id);
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
