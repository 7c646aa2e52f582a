//! # Record Download
//!
//! Replaces the local copy of a record with the remote version.
//!
//! ## Download Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                   DownloadRecordOperation (2 units)                     │
//! │                                                                         │
//! │  version = requested version, else remote.version                      │
//! │            locked → previous unlocked version, none → locked error     │
//! │                                                                         │
//! │  record (1 unit)  service.download_record(remote, version)             │
//! │  files  (1 unit)  each remote file → matching syncable file            │
//! │                     no match          → unknownFile                    │
//! │                     same version here → skip                           │
//! │                   any failure → filesFailed, stop                      │
//! │                                                                         │
//! │  save_context.insert_object(object)                                    │
//! │  local = normal (date = version date)        remote = normal           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`DownloadRecordsOperation`] checks relationships once every record of
//! the batch is in: an object pointing at a record that is neither part of
//! the batch nor stored locally is discarded and retried on the next pass.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use tracing::{debug, warn};

use harmony_core::{
    File, FileError, LocalRecord, RecordError, RecordErrorKind, RecordID, RecordPredicate,
    RecordStatus, RemoteFile, RemoteRecord, Syncable, ValidationError, Version,
};
use harmony_db::{Record, RecordContext};

use crate::batch::{BatchHooks, BatchRecordOperation, BatchResults};
use crate::environment::SyncEnvironment;
use crate::operation::record::{update_record, validate_record};
use crate::operation::{Operation, Progress, RecordOperation};

/// Downloads every record matching [`RecordPredicate::Download`].
pub type DownloadRecordsOperation = BatchRecordOperation<DownloadRecordOperation, DownloadHooks>;

// =============================================================================
// Download Record Operation
// =============================================================================

pub struct DownloadRecordOperation {
    record: Record,
    environment: SyncEnvironment,
    save_context: RecordContext,
    version: Option<Version>,
    progress: Progress,
}

impl DownloadRecordOperation {
    /// Downloads `version` instead of the current remote version.
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// Version to download: the requested one, the current one, or the last
    /// unlocked one while another device is mid-upload.
    fn version(&self, remote: &RemoteRecord) -> Result<Version, RecordError> {
        if let Some(version) = &self.version {
            return Ok(version.clone());
        }
        if !remote.is_locked {
            return Ok(remote.version.clone());
        }

        remote
            .previous_unlocked_version
            .clone()
            .ok_or_else(|| RecordError::new(self.record_id().clone(), RecordErrorKind::Locked))
    }

    async fn download_files(
        &self,
        object: &dyn Syncable,
        remote_files: &[RemoteFile],
        local: Option<&LocalRecord>,
    ) -> Result<(), RecordError> {
        let progress = Progress::new(remote_files.len() as u64);
        self.progress.add_child(&progress, 1);

        let files: BTreeMap<String, File> = object
            .syncable_files()
            .into_iter()
            .map(|file| (file.identifier.clone(), file))
            .collect();

        let downloads = remote_files.iter().map(|remote_file| {
            let progress = &progress;
            let destination = files.get(&remote_file.identifier);
            async move {
                let result = match destination {
                    Some(destination) => {
                        self.download_file(remote_file, destination, local, progress)
                            .await
                    }
                    None => Err(FileError::UnknownFile(remote_file.identifier.clone())),
                };
                progress.advance(1);
                result
            }
        });

        let errors: Vec<FileError> = join_all(downloads)
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

    async fn download_file(
        &self,
        remote_file: &RemoteFile,
        destination: &File,
        local: Option<&LocalRecord>,
        progress: &Progress,
    ) -> Result<(), FileError> {
        let unchanged = local
            .and_then(|local| local.remote_file(&remote_file.identifier))
            .is_some_and(|known| known.version_identifier == remote_file.version_identifier);
        let present = tokio::fs::try_exists(&destination.local_path)
            .await
            .unwrap_or(false);

        if unchanged && present {
            debug!(file = %remote_file.identifier, "File unchanged; skipping download");
            return Ok(());
        }

        self.environment
            .service
            .call(remote_file.identifier.as_str(), progress, |service| async move {
                service.download_file(remote_file, destination).await
            })
            .await
    }
}

impl RecordOperation for DownloadRecordOperation {
    const PREDICATE: RecordPredicate = RecordPredicate::Download;

    fn new(
        record: Record,
        environment: SyncEnvironment,
        save_context: RecordContext,
    ) -> Result<Self, RecordError> {
        validate_record(&record)?;
        if record.remote_status().is_none() {
            return Err(RecordError::new(
                record.record_id().clone(),
                ValidationError::NilRemoteRecord,
            ));
        }

        Ok(DownloadRecordOperation {
            record,
            environment,
            save_context,
            version: None,
            progress: Progress::new(2),
        })
    }

    fn record(&self) -> &Record {
        &self.record
    }
}

#[async_trait]
impl Operation for DownloadRecordOperation {
    type Output = Arc<dyn Syncable>;
    type Error = RecordError;

    fn progress(&self) -> &Progress {
        &self.progress
    }

    async fn execute(&self) -> Result<Arc<dyn Syncable>, RecordError> {
        let record_id = self.record_id().clone();
        let managed = self.record.snapshot().ok_or_else(|| {
            RecordError::new(record_id.clone(), ValidationError::NilManagedRecord)
        })?;
        let remote = managed.remote.clone().ok_or_else(|| {
            RecordError::new(record_id.clone(), ValidationError::NilRemoteRecord)
        })?;
        let version = self.version(&remote)?;

        let record_progress = Progress::new(1);
        self.progress.add_child(&record_progress, 1);
        let (remote_ref, version_ref) = (&remote, &version);
        let downloaded = self
            .environment
            .service
            .call(&record_id, &record_progress, |service| async move {
                service.download_record(remote_ref, version_ref).await
            })
            .await;
        record_progress.complete();
        let downloaded = downloaded?;

        self.download_files(
            downloaded.object.as_ref(),
            &downloaded.remote_files,
            managed.local.as_ref(),
        )
        .await?;

        self.save_context
            .insert_object(Arc::clone(&downloaded.object))
            .map_err(|err| RecordError::new(record_id.clone(), err))?;

        let local = LocalRecord {
            status: RecordStatus::Normal,
            modification_date: version.date,
            version: Some(version.clone()),
            remote_files: downloaded.remote_files,
            content_hash: remote.content_hash.clone(),
        };
        update_record(&self.record, &self.save_context, move |r| {
            r.local = Some(local);
            if let Some(remote) = r.remote.as_mut() {
                remote.status = RecordStatus::Normal;
            }
        })?;

        debug!(record = %self.record, version = %version.identifier, "Downloaded record");
        Ok(downloaded.object)
    }

    fn cancelled_error(&self) -> RecordError {
        RecordError::cancelled(self.record_id().clone())
    }
}

// =============================================================================
// Download Hooks
// =============================================================================

/// Rejects downloads whose relationships point nowhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct DownloadHooks;

#[async_trait]
impl BatchHooks<DownloadRecordOperation> for DownloadHooks {
    async fn process_results(
        &self,
        results: &mut BatchResults<Arc<dyn Syncable>>,
        save_context: &RecordContext,
        _environment: &SyncEnvironment,
    ) -> Result<(), RecordErrorKind> {
        let downloaded: Vec<(RecordID, Arc<dyn Syncable>)> = results
            .iter()
            .filter_map(|(record_id, result)| {
                result
                    .as_ref()
                    .ok()
                    .map(|object| (record_id.clone(), Arc::clone(object)))
            })
            .collect();

        for (record_id, object) in downloaded {
            let mut missing = Vec::new();
            for (key, target) in object.syncable_relationships() {
                // Objects downloaded in this batch are already in the save
                // context.
                if save_context.fetch_object(&target).await?.is_none() {
                    missing.push(key);
                }
            }
            if missing.is_empty() {
                continue;
            }

            warn!(record = %record_id, keys = ?missing, "Downloaded record has missing relationships");
            save_context.discard_object(&record_id);
            save_context.with_record_mut(&record_id, |r| {
                if let Some(remote) = r.remote.as_mut() {
                    remote.status = RecordStatus::Updated;
                }
            });
            results.insert(
                record_id.clone(),
                Err(RecordError::new(
                    record_id,
                    ValidationError::NilRelationshipObjects { keys: missing },
                )),
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::run;
    use crate::test_support::{temp_dir, Failure, MockCall, TestEnvironment, TestObject};
    use harmony_core::{ManagedRecord, ServiceError};

    /// Tracks a remote-only record the way a fetch would.
    async fn remote_only(env: &TestEnvironment, object: &TestObject) -> RecordID {
        let remote = env.service.put_remote(object);
        env.insert(ManagedRecord::new(object.record_id()).with_remote(remote))
            .await;
        object.record_id()
    }

    async fn download(env: &TestEnvironment) -> BatchResults<Arc<dyn Syncable>> {
        run(&DownloadRecordsOperation::new(env.env.clone())).await.unwrap()
    }

    #[tokio::test]
    async fn test_downloads_new_record() {
        let env = TestEnvironment::new().await;
        let object = TestObject::new("1").with_plays(7);
        let record_id = remote_only(&env, &object).await;

        let results = download(&env).await;
        assert!(results[&record_id].is_ok());

        let stored = env.object(&record_id).await.unwrap();
        assert_eq!(stored.content_hash(), object.content_hash());

        let managed = env.managed(&record_id).await.unwrap();
        let remote = managed.remote.clone().unwrap();
        let local = managed.local.clone().unwrap();
        assert_eq!(local.status, RecordStatus::Normal);
        assert_eq!(remote.status, RecordStatus::Normal);
        assert_eq!(local.modification_date, remote.version.date);
        assert_eq!(local.version, Some(remote.version));
        assert_eq!(local.content_hash, Some(object.content_hash()));
    }

    #[tokio::test]
    async fn test_locked_record_uses_previous_unlocked_version() {
        let env = TestEnvironment::new().await;
        let object = TestObject::new("1");
        let previous = env.service.put_remote(&object).version;
        env.service.put_remote(&TestObject::new("1").with_plays(2));
        env.service.lock(&object.record_id(), Some(previous.clone()));
        let remote = env.service.remote(&object.record_id()).unwrap();
        env.insert(ManagedRecord::new(object.record_id()).with_remote(remote))
            .await;

        let results = download(&env).await;
        assert!(results[&object.record_id()].is_ok());

        let local = env.managed(&object.record_id()).await.unwrap().local.unwrap();
        assert_eq!(local.version, Some(previous));
    }

    #[tokio::test]
    async fn test_locked_record_without_fallback_fails() {
        let env = TestEnvironment::new().await;
        let object = TestObject::new("1");
        env.service.put_remote(&object);
        env.service.lock(&object.record_id(), None);
        let remote = env.service.remote(&object.record_id()).unwrap();
        env.insert(ManagedRecord::new(object.record_id()).with_remote(remote))
            .await;

        let results = download(&env).await;

        assert_eq!(
            results[&object.record_id()].as_ref().unwrap_err().kind,
            RecordErrorKind::Locked
        );
        assert_eq!(env.service.call_count(MockCall::DownloadRecord), 0);
    }

    #[tokio::test]
    async fn test_downloads_files_to_object_paths() {
        let dir = temp_dir();
        let path = dir.path().join("save.sav");
        let env = TestEnvironment::new().await;
        let object = TestObject::new("1").with_file(File::new("save", &path));
        let record_id = remote_only(&env, &object).await;

        let results = download(&env).await;
        assert!(results[&record_id].is_ok());

        let contents = tokio::fs::read(&path).await.unwrap();
        assert!(contents.starts_with(b"save:"));
        let local = env.managed(&record_id).await.unwrap().local.unwrap();
        assert_eq!(local.remote_files, env.service.remote_files(&record_id));
    }

    #[tokio::test]
    async fn test_file_failure_keeps_record_pending() {
        let env = TestEnvironment::new().await;
        let object = TestObject::new("1").with_file(File::new("save", temp_dir().path().join("s")));
        let record_id = remote_only(&env, &object).await;
        env.service.fail_next(
            MockCall::DownloadFile,
            Failure::Service(ServiceError::ItemDoesNotExist),
        );

        let results = download(&env).await;

        assert_eq!(
            results[&record_id].as_ref().unwrap_err().kind,
            RecordErrorKind::FilesFailed(vec![FileError::DoesNotExist("save".into())])
        );
        assert!(env.object(&record_id).await.is_none());
        assert_eq!(
            env.managed(&record_id).await.unwrap().remote_status(),
            Some(RecordStatus::Updated)
        );
    }

    #[tokio::test]
    async fn test_missing_remote_record_fails_with_does_not_exist() {
        let env = TestEnvironment::new().await;
        let object = TestObject::new("1");
        let record_id = remote_only(&env, &object).await;
        env.service.fail_record(
            MockCall::DownloadRecord,
            &record_id,
            Failure::Service(ServiceError::ItemDoesNotExist),
        );

        let results = download(&env).await;
        assert!(results[&record_id].as_ref().unwrap_err().is_does_not_exist());
    }

    #[tokio::test]
    async fn test_relationship_within_batch_is_accepted() {
        let env = TestEnvironment::new().await;
        let console = TestObject::new("console");
        let game = TestObject::new("game").with_relationship("console", console.record_id());
        let console_id = remote_only(&env, &console).await;
        let game_id = remote_only(&env, &game).await;

        let results = download(&env).await;

        assert!(results[&console_id].is_ok());
        assert!(results[&game_id].is_ok());
        assert!(env.object(&game_id).await.is_some());
    }

    #[tokio::test]
    async fn test_relationship_to_stored_object_is_accepted() {
        let env = TestEnvironment::new().await;
        let console = TestObject::new("console");
        env.objects.insert(console.shared()).await.unwrap();
        let game = TestObject::new("game").with_relationship("console", console.record_id());
        let game_id = remote_only(&env, &game).await;

        let results = download(&env).await;
        assert!(results[&game_id].is_ok());
    }

    #[tokio::test]
    async fn test_dangling_relationship_is_rejected_and_retried() {
        let env = TestEnvironment::new().await;
        let game = TestObject::new("game")
            .with_relationship("console", RecordID::new("Game", "missing"));
        let game_id = remote_only(&env, &game).await;

        let results = download(&env).await;

        assert_eq!(
            results[&game_id].as_ref().unwrap_err().kind,
            RecordErrorKind::Validation(ValidationError::NilRelationshipObjects {
                keys: vec!["console".into()]
            })
        );
        assert!(env.object(&game_id).await.is_none());
        assert_eq!(
            env.managed(&game_id).await.unwrap().remote_status(),
            Some(RecordStatus::Updated)
        );
    }
}
