//! # Record Deletion
//!
//! Removes a record everywhere once either side deleted it.
//!
//! ## Phases
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    DeleteRecordOperation (3 units)                      │
//! │                                                                         │
//! │  1. remote files   (2 units)  concurrently; "does not exist" is fine   │
//! │          │ any other failure → filesFailed, stop                       │
//! │          ▼                                                              │
//! │  2. remote record  (1 unit)   "does not exist" is fine                 │
//! │          │ failure → stop                                               │
//! │          ▼                                                              │
//! │  3. local          (0 units)  delete object + managed record           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`DeleteRecordsOperation`] additionally removes the local copies of each
//! successfully deleted record's files, once the batch has saved.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::future::join_all;
use tracing::{debug, warn};

use harmony_core::{
    File, FileError, RecordError, RecordErrorKind, RecordID, RecordPredicate, RemoteFile,
    RemoteRecord, ValidationError,
};
use harmony_db::{Record, RecordContext};

use crate::batch::{BatchHooks, BatchRecordOperation, BatchResults};
use crate::environment::SyncEnvironment;
use crate::operation::record::validate_record;
use crate::operation::{Operation, Progress, RecordOperation};

/// Deletes every record matching [`RecordPredicate::Delete`].
pub type DeleteRecordsOperation = BatchRecordOperation<DeleteRecordOperation, DeleteHooks>;

// =============================================================================
// Delete Record Operation
// =============================================================================

pub struct DeleteRecordOperation {
    record: Record,
    environment: SyncEnvironment,
    save_context: RecordContext,
    progress: Progress,
}

impl DeleteRecordOperation {
    /// Phase 1.
    async fn delete_remote_files(&self, remote_files: &[RemoteFile]) -> Result<(), RecordError> {
        let progress = Progress::new(remote_files.len() as u64);
        self.progress.add_child(&progress, 2);

        let deletions = remote_files.iter().map(|remote_file| {
            let progress = &progress;
            async move {
                let result = self
                    .environment
                    .service
                    .call(remote_file.identifier.as_str(), progress, |service| async move {
                        service.delete_file(remote_file).await
                    })
                    .await;
                progress.advance(1);

                match result {
                    Err(err) if err.is_does_not_exist() => {
                        debug!(file = %remote_file.identifier, "Remote file already deleted");
                        Ok(())
                    }
                    result => result,
                }
            }
        });

        let errors: Vec<FileError> = join_all(deletions)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();
        progress.complete();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RecordError::files_failed(self.record_id().clone(), errors))
        }
    }

    /// Phase 2.
    async fn delete_remote_record(&self, remote: Option<&RemoteRecord>) -> Result<(), RecordError> {
        let progress = Progress::new(1);
        self.progress.add_child(&progress, 1);

        let Some(remote) = remote else {
            progress.complete();
            return Ok(());
        };

        let result = self
            .environment
            .service
            .call(self.record_id(), &progress, |service| async move {
                service.delete_record(remote).await
            })
            .await;
        progress.complete();

        match result {
            Err(err) if err.is_does_not_exist() => {
                debug!(record = %self.record, "Remote record already deleted");
                Ok(())
            }
            result => result,
        }
    }

    /// Phase 3.
    fn delete_local(&self) {
        self.save_context.delete_object(self.record_id());
        self.save_context.delete(self.record_id());
    }
}

impl RecordOperation for DeleteRecordOperation {
    const PREDICATE: RecordPredicate = RecordPredicate::Delete;

    fn new(
        record: Record,
        environment: SyncEnvironment,
        save_context: RecordContext,
    ) -> Result<Self, RecordError> {
        validate_record(&record)?;
        Ok(DeleteRecordOperation {
            record,
            environment,
            save_context,
            progress: Progress::new(3),
        })
    }

    fn record(&self) -> &Record {
        &self.record
    }
}

#[async_trait]
impl Operation for DeleteRecordOperation {
    type Output = ();
    type Error = RecordError;

    fn progress(&self) -> &Progress {
        &self.progress
    }

    async fn execute(&self) -> Result<(), RecordError> {
        let managed = self.record.snapshot().ok_or_else(|| {
            RecordError::new(self.record_id().clone(), ValidationError::NilManagedRecord)
        })?;

        let remote_files = managed
            .local
            .as_ref()
            .map(|local| local.remote_files.clone())
            .unwrap_or_default();

        self.delete_remote_files(&remote_files).await?;
        self.delete_remote_record(managed.remote.as_ref()).await?;
        self.delete_local();

        debug!(record = %self.record, "Deleted record");
        Ok(())
    }

    fn cancelled_error(&self) -> RecordError {
        RecordError::cancelled(self.record_id().clone())
    }
}

// =============================================================================
// Delete Hooks
// =============================================================================

/// Removes local files of deleted records.
///
/// Files are looked up before the batch runs because the objects are gone
/// afterwards.
#[derive(Default)]
pub struct DeleteHooks {
    files: Mutex<HashMap<RecordID, Vec<File>>>,
}

impl DeleteHooks {
    fn files(&self) -> std::sync::MutexGuard<'_, HashMap<RecordID, Vec<File>>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BatchHooks<DeleteRecordOperation> for DeleteHooks {
    async fn process_records(
        &self,
        records: Vec<Record>,
        _environment: &SyncEnvironment,
    ) -> Result<Vec<Record>, RecordErrorKind> {
        let mut snapshot = HashMap::new();
        for record in &records {
            if let Some(object) = record.context().fetch_object(record.record_id()).await? {
                snapshot.insert(record.record_id().clone(), object.syncable_files());
            }
        }

        *self.files() = snapshot;
        Ok(records)
    }

    async fn finish(&self, results: &BatchResults<()>) {
        let files: Vec<File> = {
            let mut snapshot = self.files();
            results
                .iter()
                .filter(|(_, result)| result.is_ok())
                .filter_map(|(record_id, _)| snapshot.remove(record_id))
                .flatten()
                .collect()
        };

        for file in files {
            match tokio::fs::remove_file(&file.local_path).await {
                Ok(()) => debug!(path = %file.local_path.display(), "Removed local file"),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!(
                    path = %file.local_path.display(),
                    error = %err,
                    "Failed to remove local file"
                ),
            }
        }
    }
}
