//! # Record Upload
//!
//! Sends a locally changed record, and whichever of its files changed, to
//! the backend.
//!
//! ## Upload Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    UploadRecordOperation (2 units)                      │
//! │                                                                         │
//! │  object = save_context.fetch_object(id)     missing → nilRecordedObject│
//! │                                                                         │
//! │  files  (1 unit)  hash each local file                                 │
//! │                     hash == known remote file → reuse it               │
//! │                     otherwise               → upload                   │
//! │                   any failure → filesFailed, stop                      │
//! │                                                                         │
//! │  record (1 unit)  content hash == remote hash, nothing re-uploaded     │
//! │                     → keep the remote record                           │
//! │                   otherwise → upload with reserved metadata            │
//! │                                                                         │
//! │  local = normal (version = remote version)   remote = normal           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Locking
//!
//! A record whose relationships point at records the backend doesn't have
//! yet is uploaded locked, so other devices keep downloading its previous
//! unlocked version. [`UploadHooks`] decides which records to lock before
//! the batch starts and unlocks them once the whole batch is up:
//!
//! ```text
//!   prepare   relationship target without remote record → lock
//!   upload    harmony_locked = "true", previous version keys kept unless
//!             the replaced version was itself locked
//!   finish    still missing  → nilRelationshipObjects, local = updated
//!             otherwise      → metadata update without the lock
//!                              failure → error, local = updated
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::future::join_all;
use tracing::{debug, info, warn};

use harmony_core::{
    hash_bytes, metadata_keys, File, FileError, LocalRecord, ManagedRecord, Metadata, RecordError,
    RecordErrorKind, RecordID, RecordPredicate, RecordStatus, RemoteFile, RemoteRecord, Syncable,
    ValidationError,
};
use harmony_db::{DbResult, Record, RecordContext};

use crate::batch::{BatchHooks, BatchRecordOperation, BatchResults};
use crate::environment::SyncEnvironment;
use crate::metadata::UpdateRecordMetadataOperation;
use crate::operation::record::{update_record, validate_record};
use crate::operation::{run, Operation, Progress, RecordOperation};
use crate::service::RecordUpload;

/// Uploads every record matching [`RecordPredicate::Upload`].
pub type UploadRecordsOperation = BatchRecordOperation<UploadRecordOperation, UploadHooks>;

// =============================================================================
// Upload Record Operation
// =============================================================================

/// Remote files of the new version, and how many had to be uploaded.
struct UploadedFiles {
    remote_files: Vec<RemoteFile>,
    uploaded: usize,
}

pub struct UploadRecordOperation {
    record: Record,
    environment: SyncEnvironment,
    save_context: RecordContext,
    progress: Progress,
}

impl UploadRecordOperation {
    async fn upload_files(
        &self,
        files: &[File],
        local: &LocalRecord,
    ) -> Result<UploadedFiles, RecordError> {
        let progress = Progress::new(files.len() as u64);
        self.progress.add_child(&progress, 1);

        let uploads = files.iter().map(|file| {
            let progress = &progress;
            async move {
                let result = self.upload_file(file, local, progress).await;
                progress.advance(1);
                result
            }
        });
        let outcomes = join_all(uploads).await;
        progress.complete();

        let mut remote_files = Vec::with_capacity(outcomes.len());
        let mut errors = Vec::new();
        let mut uploaded = 0;
        for outcome in outcomes {
            match outcome {
                Ok((remote_file, was_uploaded)) => {
                    uploaded += usize::from(was_uploaded);
                    remote_files.push(remote_file);
                }
                Err(err) => errors.push(err),
            }
        }

        if !errors.is_empty() {
            return Err(RecordError::files_failed(self.record_id().clone(), errors));
        }
        Ok(UploadedFiles {
            remote_files,
            uploaded,
        })
    }

    /// Returns the remote file for `file` and whether it was uploaded.
    async fn upload_file(
        &self,
        file: &File,
        local: &LocalRecord,
        progress: &Progress,
    ) -> Result<(RemoteFile, bool), FileError> {
        let bytes = tokio::fs::read(&file.local_path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                FileError::DoesNotExist(file.identifier.clone())
            } else {
                FileError::Io {
                    file_identifier: file.identifier.clone(),
                    message: err.to_string(),
                }
            }
        })?;
        let hash = hash_bytes(&bytes);

        if let Some(known) = local.remote_file(&file.identifier) {
            if known.content_hash == hash {
                debug!(file = %file.identifier, "File unchanged; reusing remote file");
                return Ok((known.clone(), false));
            }
        }

        let record_id = self.record_id();
        let remote_file = self
            .environment
            .service
            .call(file.identifier.as_str(), progress, |service| async move {
                service.upload_file(file, record_id).await
            })
            .await?;
        Ok((remote_file, true))
    }

    async fn upload_record(
        &self,
        object: Arc<dyn Syncable>,
        managed: &ManagedRecord,
        content_hash: &str,
        files: &UploadedFiles,
    ) -> Result<RemoteRecord, RecordError> {
        let progress = Progress::new(1);
        self.progress.add_child(&progress, 1);

        // An unchanged object with unchanged files needs no new version.
        let current = managed
            .remote
            .as_ref()
            .filter(|remote| remote.status != RecordStatus::Deleted);
        if let Some(remote) = current {
            if files.uploaded == 0 && remote.content_hash.as_deref() == Some(content_hash) {
                debug!(record = %self.record, "Content unchanged; skipping record upload");
                progress.complete();
                return Ok(remote.clone());
            }
        }

        let upload = RecordUpload {
            record_id: self.record_id().clone(),
            metadata: upload_metadata(
                &self.environment,
                self.record_id(),
                object.as_ref(),
                content_hash,
                managed.remote.as_ref(),
                self.record.should_lock_when_uploading(),
            ),
            object,
            files: files.remote_files.clone(),
            previous: managed.remote.clone(),
        };

        let upload = &upload;
        let result = self
            .environment
            .service
            .call(self.record_id(), &progress, |service| async move {
                service.upload_record(upload).await
            })
            .await;
        progress.complete();
        result
    }
}

impl RecordOperation for UploadRecordOperation {
    const PREDICATE: RecordPredicate = RecordPredicate::Upload;

    fn new(
        record: Record,
        environment: SyncEnvironment,
        save_context: RecordContext,
    ) -> Result<Self, RecordError> {
        validate_record(&record)?;
        if record.local_status().is_none() {
            return Err(RecordError::new(
                record.record_id().clone(),
                ValidationError::NilLocalRecord,
            ));
        }

        Ok(UploadRecordOperation {
            record,
            environment,
            save_context,
            progress: Progress::new(2),
        })
    }

    fn record(&self) -> &Record {
        &self.record
    }
}

#[async_trait]
impl Operation for UploadRecordOperation {
    type Output = RemoteRecord;
    type Error = RecordError;

    fn progress(&self) -> &Progress {
        &self.progress
    }

    async fn execute(&self) -> Result<RemoteRecord, RecordError> {
        let record_id = self.record_id().clone();
        let error = |kind: ValidationError| RecordError::new(record_id.clone(), kind);

        let managed = self
            .record
            .snapshot()
            .ok_or_else(|| error(ValidationError::NilManagedRecord))?;
        let local = managed
            .local
            .clone()
            .ok_or_else(|| error(ValidationError::NilLocalRecord))?;
        let object = self
            .record
            .context()
            .fetch_object(&record_id)
            .await
            .map_err(|err| RecordError::new(record_id.clone(), err))?
            .ok_or_else(|| error(ValidationError::NilRecordedObject))?;

        let content_hash = object.content_hash();
        let files = self.upload_files(&object.syncable_files(), &local).await?;
        let mut remote = self
            .upload_record(object, &managed, &content_hash, &files)
            .await?;
        remote.status = RecordStatus::Normal;

        let uploaded = remote.clone();
        update_record(&self.record, &self.save_context, move |r| {
            if let Some(local) = r.local.as_mut() {
                local.status = RecordStatus::Normal;
                local.version = Some(uploaded.version.clone());
                local.remote_files = files.remote_files;
                local.content_hash = Some(content_hash);
            }
            r.remote = Some(uploaded);
        })?;

        debug!(record = %self.record, version = %remote.version.identifier, "Uploaded record");
        Ok(remote)
    }

    fn cancelled_error(&self) -> RecordError {
        RecordError::cancelled(self.record_id().clone())
    }
}

/// Object metadata plus the reserved keys.
fn upload_metadata(
    environment: &SyncEnvironment,
    record_id: &RecordID,
    object: &dyn Syncable,
    content_hash: &str,
    previous: Option<&RemoteRecord>,
    lock: bool,
) -> Metadata {
    let mut metadata = object.syncable_metadata();
    metadata.retain(|key, _| !metadata_keys::is_reserved(key));

    metadata.insert(
        metadata_keys::RECORDED_OBJECT_TYPE.into(),
        record_id.record_type.clone(),
    );
    metadata.insert(
        metadata_keys::RECORDED_OBJECT_IDENTIFIER.into(),
        record_id.identifier.clone(),
    );
    metadata.insert(
        metadata_keys::AUTHOR.into(),
        environment.config.author_name().to_string(),
    );
    if let Some(name) = object.localized_name() {
        metadata.insert(metadata_keys::LOCALIZED_NAME.into(), name);
    }
    if lock {
        metadata.insert(metadata_keys::IS_LOCKED.into(), "true".into());
    }
    // A locked version is never a fallback for readers.
    if let Some(previous) = previous.filter(|previous| !previous.is_locked) {
        metadata.insert(
            metadata_keys::PREVIOUS_VERSION_IDENTIFIER.into(),
            previous.version.identifier.clone(),
        );
        metadata.insert(
            metadata_keys::PREVIOUS_VERSION_DATE.into(),
            previous.version.date.to_rfc3339(),
        );
    }
    metadata.insert(metadata_keys::CONTENT_HASH.into(), content_hash.to_string());

    metadata
}

/// Relationship keys of `object` whose target has no remote record in
/// `context`.
async fn missing_relationships(
    object: &dyn Syncable,
    context: &RecordContext,
) -> DbResult<Vec<String>> {
    let mut missing = Vec::new();
    for (key, target) in object.syncable_relationships() {
        let uploaded = context
            .fetch_record(&target)
            .await?
            .and_then(|record| record.perform(|r| r.remote.is_some()))
            .unwrap_or(false);
        if !uploaded {
            missing.push(key);
        }
    }
    Ok(missing)
}

// =============================================================================
// Upload Hooks
// =============================================================================

/// A record uploaded locked, and the remote version it replaced.
#[derive(Clone)]
struct LockedUpload {
    record: Record,
    previous: Option<RemoteRecord>,
}

/// Locks records whose relationships aren't on the backend yet, and unlocks
/// them once the batch uploaded their targets.
#[derive(Default)]
pub struct UploadHooks {
    locked: Mutex<HashMap<RecordID, LockedUpload>>,
}

impl UploadHooks {
    fn locked(&self) -> std::sync::MutexGuard<'_, HashMap<RecordID, LockedUpload>> {
        self.locked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the batch uploaded locked.
    pub fn locked_records(&self) -> Vec<RecordID> {
        self.locked().keys().cloned().collect()
    }

    /// Clears the lock of one uploaded record.
    async fn unlock(
        &self,
        locked: &LockedUpload,
        remote: &RemoteRecord,
        save_context: &RecordContext,
        environment: &SyncEnvironment,
    ) -> Result<(), RecordError> {
        let record_id = locked.record.record_id();
        let object = save_context
            .fetch_object(record_id)
            .await
            .map_err(|err| RecordError::new(record_id.clone(), err))?
            .ok_or_else(|| RecordError::new(record_id.clone(), ValidationError::NilRecordedObject))?;

        let missing = missing_relationships(object.as_ref(), save_context)
            .await
            .map_err(|err| RecordError::new(record_id.clone(), err))?;
        if !missing.is_empty() {
            return Err(RecordError::new(
                record_id.clone(),
                ValidationError::NilRelationshipObjects { keys: missing },
            ));
        }

        let content_hash = remote
            .content_hash
            .clone()
            .unwrap_or_else(|| object.content_hash());
        let metadata = upload_metadata(
            environment,
            record_id,
            object.as_ref(),
            &content_hash,
            locked.previous.as_ref(),
            false,
        );
        let record = locked
            .record
            .in_context(save_context)
            .ok_or_else(|| RecordError::new(record_id.clone(), ValidationError::NilManagedRecord))?;
        run(&UpdateRecordMetadataOperation::new(
            record.clone(),
            metadata,
            environment.clone(),
        ))
        .await?;

        record.perform_mut(|r| {
            if let Some(remote) = r.remote.as_mut() {
                remote.is_locked = false;
            }
        });
        Ok(())
    }
}

#[async_trait]
impl BatchHooks<UploadRecordOperation> for UploadHooks {
    async fn process_records(
        &self,
        records: Vec<Record>,
        _environment: &SyncEnvironment,
    ) -> Result<Vec<Record>, RecordErrorKind> {
        for record in &records {
            let context = record.context();
            let Some(object) = context.fetch_object(record.record_id()).await? else {
                continue;
            };

            let missing = missing_relationships(object.as_ref(), context).await?;
            if missing.is_empty() {
                continue;
            }

            debug!(record = %record, keys = ?missing, "Relationships not uploaded yet; locking");
            record.set_lock_when_uploading(true);
            self.locked().insert(
                record.record_id().clone(),
                LockedUpload {
                    record: record.clone(),
                    previous: record.perform(|r| r.remote.clone()).flatten(),
                },
            );
        }

        Ok(records)
    }

    async fn process_results(
        &self,
        results: &mut BatchResults<RemoteRecord>,
        save_context: &RecordContext,
        environment: &SyncEnvironment,
    ) -> Result<(), RecordErrorKind> {
        let locked: Vec<LockedUpload> = self.locked().values().cloned().collect();
        if locked.is_empty() {
            return Ok(());
        }
        info!(count = locked.len(), "Unlocking uploaded records");

        for locked in locked {
            let record_id = locked.record.record_id().clone();
            let Some(Ok(remote)) = results.get(&record_id).cloned() else {
                continue;
            };

            match self.unlock(&locked, &remote, save_context, environment).await {
                Ok(()) => {
                    if let Some(Ok(remote)) = results.get_mut(&record_id) {
                        remote.is_locked = false;
                    }
                }
                Err(err) => {
                    warn!(record = %record_id, error = %err, "Failed to unlock uploaded record");
                    // Uploaded again, and unlocked, on the next pass.
                    update_record(&locked.record, save_context, |r| {
                        if let Some(local) = r.local.as_mut() {
                            local.status = RecordStatus::Updated;
                        }
                    })
                    .map_err(|err| err.kind)?;
                    results.insert(record_id, Err(err));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::run;
    use crate::test_support::{temp_dir, Failure, MockCall, TestEnvironment, TestObject};
    use harmony_core::{RecordErrorKind, RecordID, ServiceError};

    async fn upload(env: &TestEnvironment) -> crate::batch::BatchResults<RemoteRecord> {
        run(&UploadRecordsOperation::new(env.env.clone())).await.unwrap()
    }

    async fn mark_updated(env: &TestEnvironment, record_id: &RecordID) {
        env.update(record_id, |r| {
            if let Some(local) = r.local.as_mut() {
                local.status = RecordStatus::Updated;
            }
        })
        .await;
    }

    #[tokio::test]
    async fn test_uploads_new_record() {
        let env = TestEnvironment::new().await;
        let record_id = env.add_local(TestObject::new("1").with_plays(3)).await;

        let results = upload(&env).await;
        let remote = results[&record_id].clone().unwrap();

        assert_eq!(remote.record_id, record_id);
        assert_eq!(remote.author.as_deref(), Some("Tester"));
        assert_eq!(remote.localized_name.as_deref(), Some("Game 1"));
        assert_eq!(remote.metadata.get("plays").map(String::as_str), Some("3"));
        assert_eq!(
            remote.content_hash,
            Some(TestObject::new("1").with_plays(3).content_hash())
        );

        let managed = env.managed(&record_id).await.unwrap();
        assert_eq!(managed.local_status(), Some(RecordStatus::Normal));
        assert_eq!(managed.remote_status(), Some(RecordStatus::Normal));
        assert_eq!(managed.local.unwrap().version, Some(remote.version));
        assert_eq!(env.service.remote_count(), 1);
    }

    #[tokio::test]
    async fn test_unchanged_record_is_not_uploaded_again() {
        let env = TestEnvironment::new().await;
        let (record_id, remote) = env.add_synced(TestObject::new("1")).await;
        mark_updated(&env, &record_id).await;

        let results = upload(&env).await;

        assert_eq!(results[&record_id].as_ref().unwrap().version, remote.version);
        assert_eq!(env.service.call_count(MockCall::UploadRecord), 0);
        assert_eq!(
            env.managed(&record_id).await.unwrap().local_status(),
            Some(RecordStatus::Normal)
        );
    }

    #[tokio::test]
    async fn test_changed_record_replaces_remote_version() {
        let env = TestEnvironment::new().await;
        let (record_id, remote) = env.add_synced(TestObject::new("1")).await;
        env.objects
            .insert(TestObject::new("1").with_plays(9).shared())
            .await
            .unwrap();
        mark_updated(&env, &record_id).await;

        let results = upload(&env).await;
        let uploaded = results[&record_id].clone().unwrap();

        assert_eq!(uploaded.identifier, remote.identifier);
        assert_ne!(uploaded.version, remote.version);
        assert_eq!(env.service.remote(&record_id).unwrap().version, uploaded.version);
    }

    #[tokio::test]
    async fn test_only_changed_files_are_uploaded() {
        let dir = temp_dir();
        let save = dir.path().join("save.sav");
        let art = dir.path().join("art.png");
        tokio::fs::write(&save, b"level 1").await.unwrap();
        tokio::fs::write(&art, b"pixels").await.unwrap();

        let env = TestEnvironment::new().await;
        let object = TestObject::new("1")
            .with_file(File::new("save", &save))
            .with_file(File::new("art", &art));
        let record_id = env.add_local(object).await;

        upload(&env).await[&record_id].as_ref().unwrap();
        assert_eq!(env.service.call_count(MockCall::UploadFile), 2);

        tokio::fs::write(&save, b"level 2").await.unwrap();
        mark_updated(&env, &record_id).await;
        upload(&env).await[&record_id].as_ref().unwrap();

        assert_eq!(env.service.call_count(MockCall::UploadFile), 3);
        assert_eq!(env.service.call_count(MockCall::UploadRecord), 2);

        let local = env.managed(&record_id).await.unwrap().local.unwrap();
        assert_eq!(local.remote_files.len(), 2);
        assert_eq!(
            local.remote_file("save").unwrap().content_hash,
            hash_bytes(b"level 2")
        );
    }

    #[tokio::test]
    async fn test_file_failure_skips_record_upload() {
        let dir = temp_dir();
        let save = dir.path().join("save.sav");
        tokio::fs::write(&save, b"level 1").await.unwrap();

        let env = TestEnvironment::new().await;
        let record_id = env
            .add_local(TestObject::new("1").with_file(File::new("save", &save)))
            .await;
        env.service.fail_next(
            MockCall::UploadFile,
            Failure::Service(ServiceError::ConnectionFailed("offline".into())),
        );

        let results = upload(&env).await;

        let err = results[&record_id].as_ref().unwrap_err();
        assert!(matches!(&err.kind, RecordErrorKind::FilesFailed(errors) if errors.len() == 1));
        assert_eq!(env.service.call_count(MockCall::UploadRecord), 0);
        assert_eq!(
            env.managed(&record_id).await.unwrap().local_status(),
            Some(RecordStatus::Updated)
        );
    }

    #[tokio::test]
    async fn test_missing_local_file_fails_record() {
        let env = TestEnvironment::new().await;
        let record_id = env
            .add_local(TestObject::new("1").with_file(File::new("save", temp_dir().path().join("x"))))
            .await;

        let results = upload(&env).await;
        assert_eq!(
            results[&record_id].as_ref().unwrap_err().kind,
            RecordErrorKind::FilesFailed(vec![FileError::DoesNotExist("save".into())])
        );
    }

    #[tokio::test]
    async fn test_missing_object_fails_record() {
        let env = TestEnvironment::new().await;
        let record_id = RecordID::new("Game", "ghost");
        env.insert(
            ManagedRecord::new(record_id.clone())
                .with_local(LocalRecord::new(RecordStatus::Updated, chrono::Utc::now())),
        )
        .await;

        let results = upload(&env).await;
        assert_eq!(
            results[&record_id].as_ref().unwrap_err().kind,
            RecordErrorKind::Validation(ValidationError::NilRecordedObject)
        );
    }

    #[tokio::test]
    async fn test_rate_limited_upload_is_retried() {
        let env = TestEnvironment::new().await;
        let record_id = env.add_local(TestObject::new("1")).await;
        env.service.fail_next(
            MockCall::UploadRecord,
            Failure::Service(ServiceError::RateLimitExceeded),
        );

        let results = upload(&env).await;

        assert!(results[&record_id].is_ok());
        assert_eq!(env.service.call_count(MockCall::UploadRecord), 2);
    }

    #[tokio::test]
    async fn test_record_is_locked_until_relationship_is_uploaded() {
        let env = TestEnvironment::new().await;
        let console = env.add_local(TestObject::new("console")).await;
        let record_id = env
            .add_local(TestObject::new("1").with_relationship("console", console.clone()))
            .await;

        let batch = UploadRecordsOperation::new(env.env.clone());
        let results = run(&batch).await.unwrap();

        assert_eq!(batch.hooks().locked_records(), vec![record_id.clone()]);
        assert!(results[&console].is_ok());
        assert!(!results[&record_id].as_ref().unwrap().is_locked);

        let remote = env.service.remote(&record_id).unwrap();
        assert!(!remote.is_locked);
        let unlock = env.service.metadata_update(&remote.identifier).unwrap();
        assert!(!unlock.contains_key(metadata_keys::IS_LOCKED));
        assert_eq!(env.service.call_count(MockCall::UpdateMetadata), 1);

        let managed = env.managed(&record_id).await.unwrap();
        assert_eq!(managed.local_status(), Some(RecordStatus::Normal));
        assert!(!managed.remote.unwrap().is_locked);
    }

    #[tokio::test]
    async fn test_uploaded_relationship_needs_no_lock() {
        let env = TestEnvironment::new().await;
        let (console, _) = env.add_synced(TestObject::new("console")).await;
        let record_id = env
            .add_local(TestObject::new("1").with_relationship("console", console))
            .await;

        let batch = UploadRecordsOperation::new(env.env.clone());
        let results = run(&batch).await.unwrap();

        assert!(results[&record_id].is_ok());
        assert!(batch.hooks().locked_records().is_empty());
        assert_eq!(env.service.call_count(MockCall::UpdateMetadata), 0);
    }

    #[tokio::test]
    async fn test_missing_relationship_keeps_record_locked() {
        let env = TestEnvironment::new().await;
        let record_id = env
            .add_local(TestObject::new("1").with_relationship("console", RecordID::new("Game", "ghost")))
            .await;

        let results = upload(&env).await;

        assert_eq!(
            results[&record_id].as_ref().unwrap_err().kind,
            RecordErrorKind::Validation(ValidationError::NilRelationshipObjects {
                keys: vec!["console".into()]
            })
        );
        assert!(env.service.remote(&record_id).unwrap().is_locked);
        assert_eq!(env.service.call_count(MockCall::UpdateMetadata), 0);
        assert_eq!(
            env.managed(&record_id).await.unwrap().local_status(),
            Some(RecordStatus::Updated)
        );
    }

    #[tokio::test]
    async fn test_failed_unlock_marks_record_for_upload() {
        let env = TestEnvironment::new().await;
        let console = env.add_local(TestObject::new("console")).await;
        let record_id = env
            .add_local(TestObject::new("1").with_relationship("console", console.clone()))
            .await;
        env.service.fail_next(
            MockCall::UpdateMetadata,
            Failure::Service(ServiceError::RestrictedContent),
        );

        let results = upload(&env).await;

        assert_eq!(
            results[&record_id].as_ref().unwrap_err().kind,
            RecordErrorKind::Service(ServiceError::RestrictedContent)
        );
        assert!(env.service.remote(&record_id).unwrap().is_locked);
        assert_eq!(
            env.managed(&record_id).await.unwrap().local_status(),
            Some(RecordStatus::Updated)
        );
        assert_eq!(
            env.managed(&console).await.unwrap().local_status(),
            Some(RecordStatus::Normal)
        );
    }

    #[tokio::test]
    async fn test_locked_previous_version_is_not_a_fallback() {
        let env = TestEnvironment::new().await;
        let object = TestObject::new("1");
        let mut previous = env.service.put_remote(&object);

        let metadata = upload_metadata(&env.env, &object.record_id(), &object, "hash", Some(&previous), false);
        assert_eq!(
            metadata.get(metadata_keys::PREVIOUS_VERSION_IDENTIFIER),
            Some(&previous.version.identifier)
        );
        assert!(!metadata.contains_key(metadata_keys::IS_LOCKED));

        previous.is_locked = true;
        let metadata = upload_metadata(&env.env, &object.record_id(), &object, "hash", Some(&previous), true);
        assert!(!metadata.contains_key(metadata_keys::PREVIOUS_VERSION_IDENTIFIER));
        assert!(!metadata.contains_key(metadata_keys::PREVIOUS_VERSION_DATE));
        assert_eq!(metadata.get(metadata_keys::IS_LOCKED).map(String::as_str), Some("true"));
    }
}
