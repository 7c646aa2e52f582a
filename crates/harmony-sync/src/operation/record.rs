//! # Record Operations
//!
//! The shape shared by every per-record operation a batch runs.
//!
//! ```text
//!   fetch context (read)          save context (write, shared by batch)
//!   ┌──────────────────┐          ┌──────────────────────────────────┐
//!   │ Record façade    │ ──op──►  │ record.perform_in(save_context)  │
//!   │ snapshot of the  │          │ object inserts / deletes         │
//!   │ managed record   │          └──────────────────────────────────┘
//!   └──────────────────┘                  saved once by the batch
//! ```

use harmony_core::{ManagedRecord, RecordError, RecordID, RecordPredicate, ValidationError};
use harmony_db::{Record, RecordContext};

use crate::environment::SyncEnvironment;
use crate::operation::Operation;

/// An operation over a single managed record, run inside a batch.
pub trait RecordOperation: Operation<Error = RecordError> + Sized {
    /// Records the batch hands to this operation.
    const PREDICATE: RecordPredicate;

    /// Creates the operation.
    ///
    /// ## Errors
    /// - `Conflicted` if the record is flagged as conflicted
    /// - Validation errors if the record lacks what the operation needs
    fn new(
        record: Record,
        environment: SyncEnvironment,
        save_context: RecordContext,
    ) -> Result<Self, RecordError>;

    fn record(&self) -> &Record;

    fn record_id(&self) -> &RecordID {
        self.record().record_id()
    }
}

/// Rejects records no operation may touch.
pub(crate) fn validate_record(record: &Record) -> Result<(), RecordError> {
    let record_id = record.record_id().clone();

    match record.perform(|r| r.is_conflicted) {
        None => Err(RecordError::new(record_id, ValidationError::NilManagedRecord)),
        Some(true) => Err(RecordError::conflicted(record_id)),
        Some(false) => Ok(()),
    }
}

/// Applies `f` to the record's copy in `save_context`.
pub(crate) fn update_record<R>(
    record: &Record,
    save_context: &RecordContext,
    f: impl FnOnce(&mut ManagedRecord) -> R,
) -> Result<R, RecordError> {
    record
        .perform_in(save_context, f)
        .ok_or_else(|| RecordError::new(record.record_id().clone(), ValidationError::NilManagedRecord))
}
