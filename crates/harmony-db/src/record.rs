//! # Record Façade
//!
//! Thread-safe handle to one managed record inside a [`RecordContext`].
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Record { record_id, context, lock_when_uploading }                    │
//! │       │                                                                 │
//! │       ├── accessors     → short read under the context lock            │
//! │       ├── perform(f)    → f(&ManagedRecord) under the context lock     │
//! │       ├── perform_mut(f)→ f(&mut ManagedRecord), marks it changed      │
//! │       └── perform_in(ctx, f)                                           │
//! │              copies the record into `ctx` if needed, then mutates it   │
//! │              there; nothing changes in the original context            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A façade never holds a `ManagedRecord` itself; every access goes through
//! its context, so concurrent operations observe each other's writes.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use harmony_core::{ManagedRecord, Metadata, RecordID, RecordStatus, Version};

use crate::context::RecordContext;

/// Handle to a managed record bound to a context.
#[derive(Clone)]
pub struct Record {
    record_id: RecordID,
    context: RecordContext,
    /// Shared by clones and rebinds of this handle.
    lock_when_uploading: Arc<AtomicBool>,
}

impl Record {
    pub(crate) fn new(record_id: RecordID, context: RecordContext) -> Self {
        Record {
            record_id,
            context,
            lock_when_uploading: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn record_id(&self) -> &RecordID {
        &self.record_id
    }

    /// The context this façade reads from.
    pub fn context(&self) -> &RecordContext {
        &self.context
    }

    /// Runs `f` against the record. `None` if the record vanished from the
    /// context.
    pub fn perform<R>(&self, f: impl FnOnce(&ManagedRecord) -> R) -> Option<R> {
        self.context.with_record(&self.record_id, f)
    }

    /// Runs `f` with mutable access, marking the record changed.
    pub fn perform_mut<R>(&self, f: impl FnOnce(&mut ManagedRecord) -> R) -> Option<R> {
        self.context.with_record_mut(&self.record_id, f)
    }

    /// Runs `f` against this record's copy in `context`, copying the current
    /// state over first if `context` doesn't hold it yet.
    pub fn perform_in<R>(
        &self,
        context: &RecordContext,
        f: impl FnOnce(&mut ManagedRecord) -> R,
    ) -> Option<R> {
        self.in_context(context)
            .and_then(|record| record.perform_mut(f))
    }

    /// Rebinds this façade to `context`, copying the record there if absent.
    pub fn in_context(&self, context: &RecordContext) -> Option<Record> {
        let record = if self.context.same_context(context) || context.contains(&self.record_id) {
            Record::new(self.record_id.clone(), context.clone())
        } else {
            context.adopt(self.snapshot()?)
        };
        Some(Record {
            lock_when_uploading: Arc::clone(&self.lock_when_uploading),
            ..record
        })
    }

    /// Whether the next upload should mark the remote version as locked.
    pub fn should_lock_when_uploading(&self) -> bool {
        self.lock_when_uploading.load(Ordering::SeqCst)
    }

    pub fn set_lock_when_uploading(&self, lock: bool) {
        self.lock_when_uploading.store(lock, Ordering::SeqCst);
    }

    /// Copy of the managed record.
    pub fn snapshot(&self) -> Option<ManagedRecord> {
        self.context.snapshot(&self.record_id)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn local_status(&self) -> Option<RecordStatus> {
        self.perform(ManagedRecord::local_status).flatten()
    }

    pub fn remote_status(&self) -> Option<RecordStatus> {
        self.perform(ManagedRecord::remote_status).flatten()
    }

    pub fn remote_version(&self) -> Option<Version> {
        self.perform(|r| r.remote.as_ref().map(|remote| remote.version.clone()))
            .flatten()
    }

    pub fn remote_author(&self) -> Option<String> {
        self.perform(|r| r.remote.as_ref().and_then(|remote| remote.author.clone()))
            .flatten()
    }

    pub fn remote_identifier(&self) -> Option<String> {
        self.perform(|r| r.remote.as_ref().map(|remote| remote.identifier.clone()))
            .flatten()
    }

    pub fn local_modification_date(&self) -> Option<DateTime<Utc>> {
        self.perform(|r| r.local.as_ref().map(|local| local.modification_date))
            .flatten()
    }

    pub fn is_conflicted(&self) -> bool {
        self.perform(|r| r.is_conflicted).unwrap_or(false)
    }

    pub fn is_syncing_enabled(&self) -> bool {
        self.perform(|r| r.is_syncing_enabled).unwrap_or(false)
    }

    /// Name from the remote record, for conflict and error listings.
    pub fn localized_name(&self) -> Option<String> {
        self.perform(|r| r.remote.as_ref().and_then(|remote| remote.localized_name.clone()))
            .flatten()
    }

    pub fn remote_metadata(&self) -> Metadata {
        self.perform(|r| r.remote.as_ref().map(|remote| remote.metadata.clone()))
            .flatten()
            .unwrap_or_default()
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.record_id == other.record_id
    }
}

impl Eq for Record {}

impl Hash for Record {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.record_id.hash(state);
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("record_id", &self.record_id)
            .field("local_status", &self.local_status())
            .field("remote_status", &self.remote_status())
            .field("is_conflicted", &self.is_conflicted())
            .finish()
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.record_id)
    }
}
