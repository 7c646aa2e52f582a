//! Remote metadata updates for a single record.

use async_trait::async_trait;
use tracing::debug;

use harmony_core::{metadata_keys, Metadata, RecordError, ValidationError};
use harmony_db::Record;

use crate::environment::SyncEnvironment;
use crate::operation::{Operation, Progress};

/// Replaces the metadata of a record's current remote version.
///
/// The recorded object keys are always written so the remote record stays
/// attributable. Local bookkeeping is left untouched.
pub struct UpdateRecordMetadataOperation {
    record: Record,
    metadata: Metadata,
    environment: SyncEnvironment,
    progress: Progress,
}

impl UpdateRecordMetadataOperation {
    pub fn new(record: Record, metadata: Metadata, environment: SyncEnvironment) -> Self {
        UpdateRecordMetadataOperation {
            record,
            metadata,
            environment,
            progress: Progress::new(1),
        }
    }

    fn merged_metadata(&self) -> Metadata {
        let record_id = self.record.record_id();
        let mut metadata = self.metadata.clone();
        metadata.insert(
            metadata_keys::RECORDED_OBJECT_TYPE.into(),
            record_id.record_type.clone(),
        );
        metadata.insert(
            metadata_keys::RECORDED_OBJECT_IDENTIFIER.into(),
            record_id.identifier.clone(),
        );
        metadata
    }
}

#[async_trait]
impl Operation for UpdateRecordMetadataOperation {
    type Output = ();
    type Error = RecordError;

    fn progress(&self) -> &Progress {
        &self.progress
    }

    async fn execute(&self) -> Result<(), RecordError> {
        let record_id = self.record.record_id();
        let remote = self
            .record
            .perform(|r| r.remote.clone())
            .flatten()
            .ok_or_else(|| RecordError::new(record_id.clone(), ValidationError::NilRemoteRecord))?;

        let metadata = self.merged_metadata();
        let (remote, metadata) = (&remote, &metadata);
        self.environment
            .service
            .call(record_id, &self.progress, |service| async move {
                service.update_metadata(remote, metadata).await
            })
            .await?;

        debug!(record = %self.record, "Updated remote metadata");
        Ok(())
    }

    fn cancelled_error(&self) -> RecordError {
        RecordError::cancelled(self.record.record_id().clone())
    }
}
