//! # Remote Fetch
//!
//! Pulls remote changes into the bookkeeping store.
//!
//! ## Reconciliation
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  no token → fetch_all_remote_records()                                 │
//! │  token    → fetch_changed_remote_records(token)                        │
//! │                 (updated, deleted identifiers, new token)              │
//! │                                                                         │
//! │  child context:                                                         │
//! │    tombstone of a cached record                                         │
//! │      ├── same record updated, same remote identifier → update wins     │
//! │      ├── same record updated, other remote identifier → stale remote   │
//! │      │                                                  dropped         │
//! │      └── not updated → remote.status = deleted                         │
//! │    updated remote record                                                │
//! │      ├── cached → remote replaced; normal if the local copy already    │
//! │      │            has this version, updated otherwise                  │
//! │      └── new    → inserted, remote.status = updated                    │
//! │                                                                         │
//! │  child.save() → parent.save()                                          │
//! │  controller.process_pending_updates()   ← always, even on failure      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use harmony_core::{
    ChangeToken, FetchError, GeneralError, ManagedRecord, RecordID, RecordStatus, RemoteRecord,
};
use harmony_db::{Record, RecordContext};

use crate::environment::SyncEnvironment;
use crate::operation::{Operation, Progress};
use crate::service::RemoteChanges;

/// Records touched by a fetch and the token to resume from.
#[derive(Debug, Clone)]
pub struct FetchedChanges {
    /// Updated and deleted records, bound to the fetch's saved context.
    pub records: Vec<Record>,
    pub change_token: ChangeToken,
}

pub struct FetchRemoteRecordsOperation {
    environment: SyncEnvironment,
    change_token: Option<ChangeToken>,
    progress: Progress,
}

impl FetchRemoteRecordsOperation {
    /// Fetches every remote record when `change_token` is `None`, otherwise
    /// only the changes since it.
    pub fn new(environment: SyncEnvironment, change_token: Option<ChangeToken>) -> Self {
        FetchRemoteRecordsOperation {
            environment,
            change_token,
            progress: Progress::new(2),
        }
    }

    async fn fetch_changes(&self) -> Result<RemoteChanges, FetchError> {
        let progress = Progress::new(1);
        self.progress.add_child(&progress, 1);

        let token = self.change_token.as_ref();
        let result = self
            .environment
            .service
            .call(&(), &progress, |service| async move {
                match token {
                    Some(token) => service.fetch_changed_remote_records(token).await,
                    None => service.fetch_all_remote_records().await,
                }
            })
            .await;
        progress.complete();
        result
    }

    async fn fetch(&self) -> Result<FetchedChanges, FetchError> {
        let changes = self.fetch_changes().await?;
        info!(
            updated = changes.updated.len(),
            deleted = changes.deleted.len(),
            incremental = self.change_token.is_some(),
            "Fetched remote changes"
        );

        let context = self.environment.controller.new_context();
        let child = context.new_child();

        let mut touched = BTreeSet::new();
        touched.extend(reconcile_tombstones(&child, &changes).await?);
        touched.extend(apply_updates(&child, changes.updated).await?);

        child.save().await?;
        context.save().await?;
        self.progress.advance(1);

        let mut records = Vec::with_capacity(touched.len());
        for record_id in &touched {
            if let Some(record) = context.fetch_record(record_id).await? {
                records.push(record);
            }
        }

        Ok(FetchedChanges {
            records,
            change_token: changes.change_token,
        })
    }
}

/// Applies tombstones, returning the records now marked deleted.
async fn reconcile_tombstones(
    context: &RecordContext,
    changes: &RemoteChanges,
) -> Result<Vec<RecordID>, FetchError> {
    let updated: HashMap<&RecordID, &RemoteRecord> = changes
        .updated
        .iter()
        .map(|remote| (&remote.record_id, remote))
        .collect();

    let mut deleted = Vec::new();
    for remote_identifier in &changes.deleted {
        let Some(record) = context
            .fetch_record_by_remote_identifier(remote_identifier)
            .await?
        else {
            debug!(remote = %remote_identifier, "Tombstone for unknown record");
            continue;
        };

        match updated.get(record.record_id()) {
            Some(update) if update.identifier == *remote_identifier => {
                debug!(record = %record, "Record deleted and re-created; keeping update");
            }
            Some(_) => {
                debug!(record = %record, "Dropping stale remote record");
                record.perform_mut(|r| r.remote = None);
            }
            None => {
                record.perform_mut(|r| {
                    if let Some(remote) = r.remote.as_mut() {
                        remote.status = RecordStatus::Deleted;
                    }
                });
                deleted.push(record.record_id().clone());
            }
        }
    }

    Ok(deleted)
}

/// Stores updated remote records, returning their ids.
async fn apply_updates(
    context: &RecordContext,
    updated: Vec<RemoteRecord>,
) -> Result<Vec<RecordID>, FetchError> {
    let mut record_ids = Vec::with_capacity(updated.len());

    for mut remote in updated {
        let record_id = remote.record_id.clone();

        match context.fetch_record(&record_id).await? {
            Some(record) => {
                record.perform_mut(move |r| {
                    let synced = r
                        .local
                        .as_ref()
                        .and_then(|local| local.version.as_ref())
                        .is_some_and(|version| version.identifier == remote.version.identifier);
                    remote.status = if synced {
                        RecordStatus::Normal
                    } else {
                        RecordStatus::Updated
                    };
                    r.remote = Some(remote);
                });
            }
            None => {
                remote.status = RecordStatus::Updated;
                context.insert(ManagedRecord::new(record_id.clone()).with_remote(remote));
            }
        }

        record_ids.push(record_id);
    }

    Ok(record_ids)
}

#[async_trait]
impl Operation for FetchRemoteRecordsOperation {
    type Output = FetchedChanges;
    type Error = FetchError;

    fn progress(&self) -> &Progress {
        &self.progress
    }

    async fn execute(&self) -> Result<FetchedChanges, FetchError> {
        self.fetch().await
    }

    fn cancelled_error(&self) -> FetchError {
        FetchError::General(GeneralError::Cancelled)
    }

    /// Local changes queued while the fetch ran are applied only now, so
    /// they land on top of the fetched state.
    async fn finished(&self) {
        if let Err(err) = self.environment.controller.process_pending_updates().await {
            warn!(error = %err, "Failed to apply pending local updates");
        }
    }
}
