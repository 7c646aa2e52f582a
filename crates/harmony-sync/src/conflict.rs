//! # Conflict Resolution
//!
//! Decides, per record changed on both sides, whether to upload, download
//! or flag it for the user.
//!
//! ## Decision
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  local + remote present, object found                                   │
//! │      └─► object.resolve_conflict(record).action(local date, version)   │
//! │  anything missing                                                       │
//! │      └─► Conflict                                                       │
//! │                                                                         │
//! │  Upload    local = updated, remote = normal                            │
//! │  Download  local = normal,  remote = updated                           │
//! │  Conflict  is_conflicted = true                                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Equal dates resolve to `Download` under both `Newest` and `Oldest`.

use async_trait::async_trait;
use tracing::debug;

use harmony_core::{ConflictAction, RecordError, RecordPredicate, RecordStatus, ValidationError};
use harmony_db::{Record, RecordContext};

use crate::batch::{BatchRecordOperation, NoHooks};
use crate::environment::SyncEnvironment;
use crate::operation::record::{update_record, validate_record};
use crate::operation::{Operation, Progress, RecordOperation};

/// Resolves every record matching [`RecordPredicate::Conflict`].
pub type ConflictRecordsOperation = BatchRecordOperation<ConflictRecordOperation, NoHooks>;

pub struct ConflictRecordOperation {
    record: Record,
    save_context: RecordContext,
    progress: Progress,
}

impl ConflictRecordOperation {
    async fn decide(&self) -> Result<ConflictAction, RecordError> {
        let record_id = self.record_id().clone();
        let managed = self
            .record
            .snapshot()
            .ok_or_else(|| RecordError::new(record_id.clone(), ValidationError::NilManagedRecord))?;

        let (Some(local), Some(remote)) = (&managed.local, &managed.remote) else {
            return Ok(ConflictAction::Conflict);
        };

        let object = self
            .record
            .context()
            .fetch_object(&record_id)
            .await
            .map_err(|err| RecordError::new(record_id.clone(), err))?;

        Ok(match object {
            Some(object) => object
                .resolve_conflict(&managed)
                .action(local.modification_date, remote.version.date),
            None => ConflictAction::Conflict,
        })
    }
}

impl RecordOperation for ConflictRecordOperation {
    const PREDICATE: RecordPredicate = RecordPredicate::Conflict;

    fn new(
        record: Record,
        _environment: SyncEnvironment,
        save_context: RecordContext,
    ) -> Result<Self, RecordError> {
        validate_record(&record)?;
        Ok(ConflictRecordOperation {
            record,
            save_context,
            progress: Progress::new(1),
        })
    }

    fn record(&self) -> &Record {
        &self.record
    }
}

#[async_trait]
impl Operation for ConflictRecordOperation {
    type Output = ConflictAction;
    type Error = RecordError;

    fn progress(&self) -> &Progress {
        &self.progress
    }

    async fn execute(&self) -> Result<ConflictAction, RecordError> {
        let action = self.decide().await?;

        update_record(&self.record, &self.save_context, |r| match action {
            ConflictAction::Upload => {
                if let Some(local) = r.local.as_mut() {
                    local.status = RecordStatus::Updated;
                }
                if let Some(remote) = r.remote.as_mut() {
                    remote.status = RecordStatus::Normal;
                }
            }
            ConflictAction::Download => {
                if let Some(local) = r.local.as_mut() {
                    local.status = RecordStatus::Normal;
                }
                if let Some(remote) = r.remote.as_mut() {
                    remote.status = RecordStatus::Updated;
                }
            }
            ConflictAction::Conflict => r.is_conflicted = true,
        })?;

        debug!(record = %self.record, ?action, "Resolved conflict");
        Ok(action)
    }

    fn cancelled_error(&self) -> RecordError {
        RecordError::cancelled(self.record_id().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::run;
    use crate::test_support::{Failure, MockCall, TestEnvironment, TestObject};
    use crate::upload::UploadRecordsOperation;
    use chrono::{DateTime, Duration, Utc};
    use harmony_core::{ConflictResolution, LocalRecord, ManagedRecord, RecordID, ServiceError};

    /// Stores a record changed on both sides with the given dates.
    async fn conflicting(
        env: &TestEnvironment,
        object: TestObject,
        local_date: DateTime<Utc>,
        remote_date: DateTime<Utc>,
    ) -> RecordID {
        env.objects.insert(object.shared()).await.unwrap();
        let mut remote = env.service.put_remote(&object);
        remote.version.date = remote_date;
        remote.status = RecordStatus::Updated;

        let mut local = LocalRecord::new(RecordStatus::Updated, local_date);
        local.content_hash = Some("local-hash".into());
        env.insert(ManagedRecord::new(object.record_id()).with_local(local).with_remote(remote))
            .await;
        object.record_id()
    }

    async fn resolve(env: &TestEnvironment) -> std::collections::HashMap<RecordID, ConflictAction> {
        run(&ConflictRecordsOperation::new(env.env.clone()))
            .await
            .unwrap()
            .into_iter()
            .map(|(id, result)| (id, result.unwrap()))
            .collect()
    }

    #[tokio::test]
    async fn test_newest_uploads_only_when_local_is_strictly_newer() {
        let env = TestEnvironment::new().await;
        let now = Utc::now();
        let newer = conflicting(
            &env,
            TestObject::new("newer").with_resolution(ConflictResolution::Newest),
            now,
            now - Duration::hours(1),
        )
        .await;
        let tie = conflicting(
            &env,
            TestObject::new("tie").with_resolution(ConflictResolution::Newest),
            now,
            now,
        )
        .await;

        let actions = resolve(&env).await;
        assert_eq!(actions[&newer], ConflictAction::Upload);
        assert_eq!(actions[&tie], ConflictAction::Download);

        let uploaded = env.managed(&newer).await.unwrap();
        assert_eq!(uploaded.local_status(), Some(RecordStatus::Updated));
        assert_eq!(uploaded.remote_status(), Some(RecordStatus::Normal));
        assert_eq!(uploaded.local.as_ref().unwrap().version, None);
        assert!(uploaded.matches(RecordPredicate::Upload));

        let downloaded = env.managed(&tie).await.unwrap();
        assert_eq!(downloaded.local_status(), Some(RecordStatus::Normal));
        assert_eq!(downloaded.remote_status(), Some(RecordStatus::Updated));
    }

    #[tokio::test]
    async fn test_oldest_tie_also_downloads() {
        let env = TestEnvironment::new().await;
        let now = Utc::now();
        let older = conflicting(
            &env,
            TestObject::new("older").with_resolution(ConflictResolution::Oldest),
            now - Duration::hours(1),
            now,
        )
        .await;
        let tie = conflicting(
            &env,
            TestObject::new("tie").with_resolution(ConflictResolution::Oldest),
            now,
            now,
        )
        .await;

        let actions = resolve(&env).await;
        assert_eq!(actions[&older], ConflictAction::Upload);
        assert_eq!(actions[&tie], ConflictAction::Download);
    }

    #[tokio::test]
    async fn test_unresolvable_record_is_flagged() {
        let env = TestEnvironment::new().await;
        let now = Utc::now();
        let flagged = conflicting(&env, TestObject::new("1"), now, now).await;

        let actions = resolve(&env).await;
        assert_eq!(actions[&flagged], ConflictAction::Conflict);
        assert!(env.managed(&flagged).await.unwrap().is_conflicted);

        // Flagged records are no longer conflict candidates.
        assert!(resolve(&env).await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_object_is_flagged() {
        let env = TestEnvironment::new().await;
        let object = TestObject::new("ghost").with_resolution(ConflictResolution::Local);
        let now = Utc::now();
        let record_id = conflicting(&env, object, now, now).await;
        let context = env.controller().new_context();
        context.delete_object(&record_id);
        context.save().await.unwrap();

        let actions = resolve(&env).await;
        assert_eq!(actions[&record_id], ConflictAction::Conflict);
    }

    #[tokio::test]
    async fn test_local_and_remote_policies() {
        let env = TestEnvironment::new().await;
        let now = Utc::now();
        let local = conflicting(
            &env,
            TestObject::new("l").with_resolution(ConflictResolution::Local),
            now - Duration::hours(1),
            now,
        )
        .await;
        let remote = conflicting(
            &env,
            TestObject::new("r").with_resolution(ConflictResolution::Remote),
            now,
            now - Duration::hours(1),
        )
        .await;

        let actions = resolve(&env).await;
        assert_eq!(actions[&local], ConflictAction::Upload);
        assert_eq!(actions[&remote], ConflictAction::Download);
    }

    #[tokio::test]
    async fn test_failed_upload_after_resolution_is_rechecked() {
        let env = TestEnvironment::new().await;
        let now = Utc::now();
        let record_id = conflicting(
            &env,
            TestObject::new("1").with_resolution(ConflictResolution::Local),
            now,
            now,
        )
        .await;
        assert_eq!(resolve(&env).await[&record_id], ConflictAction::Upload);

        env.service.fail_next(
            MockCall::UploadRecord,
            Failure::Service(ServiceError::ConnectionFailed("offline".into())),
        );
        let results = run(&UploadRecordsOperation::new(env.env.clone())).await.unwrap();
        assert!(results[&record_id].is_err());

        // The remote copy may have moved on meanwhile, so the record goes
        // back through conflict resolution on the next pass.
        let record = env.managed(&record_id).await.unwrap();
        assert!(record.matches(RecordPredicate::Conflict));
        assert_eq!(resolve(&env).await[&record_id], ConflictAction::Upload);
    }
}
