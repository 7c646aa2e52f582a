//! # Batch Record Operation
//!
//! Runs one per-record operation for every record matching a predicate and
//! saves all their writes at once.
//!
//! ## Batch Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     BatchRecordOperation<Op, Hooks>                     │
//! │                                                                         │
//! │  1. fetch records matching Op::PREDICATE     results[id] = unknown     │
//! │  2. hooks.process_records(records)                                     │
//! │  3. Op::new(record, env, save_context)       failure → results[id]     │
//! │  4. run ops, at most 5 at a time             results[id] = op result   │
//! │  5. hooks.process_results(results)                                     │
//! │  6. save_context.save()                      failure → every result    │
//! │                                                         fails          │
//! │  7. hooks.finish(results)                                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The result map always has exactly one entry per fetched record. A
//! cancelled batch still saves and reports: in-flight operations resolve as
//! cancelled and their records say so.

use std::collections::HashMap;
use std::marker::PhantomData;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tracing::{debug, error, info};

use harmony_core::{RecordError, RecordErrorKind, RecordID};
use harmony_db::{Record, RecordContext};

use crate::environment::SyncEnvironment;
use crate::error::SyncError;
use crate::operation::{run, Operation, Progress, RecordOperation};

/// Per-record outcome of a batch.
pub type BatchResults<T> = HashMap<RecordID, Result<T, RecordError>>;

// =============================================================================
// Hooks
// =============================================================================

/// Extension points around a batch.
///
/// Errors returned by `process_records` and `process_results` are
/// infrastructural: they fail every record of the batch.
#[async_trait]
pub trait BatchHooks<Op: RecordOperation>: Send + Sync + 'static {
    /// Runs before operations are created.
    async fn process_records(
        &self,
        records: Vec<Record>,
        _environment: &SyncEnvironment,
    ) -> Result<Vec<Record>, RecordErrorKind> {
        Ok(records)
    }

    /// Runs once every operation finished, before the save.
    async fn process_results(
        &self,
        _results: &mut BatchResults<Op::Output>,
        _save_context: &RecordContext,
        _environment: &SyncEnvironment,
    ) -> Result<(), RecordErrorKind> {
        Ok(())
    }

    /// Runs after the save, with the final results.
    async fn finish(&self, _results: &BatchResults<Op::Output>) {}
}

/// Batch without extra steps.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl<Op: RecordOperation> BatchHooks<Op> for NoHooks {}

// =============================================================================
// Batch Record Operation
// =============================================================================

pub struct BatchRecordOperation<Op, H = NoHooks> {
    environment: SyncEnvironment,
    hooks: H,
    progress: Progress,
    _operation: PhantomData<fn() -> Op>,
}

impl<Op, H> BatchRecordOperation<Op, H>
where
    Op: RecordOperation,
    H: BatchHooks<Op> + Default,
{
    pub fn new(environment: SyncEnvironment) -> Self {
        Self::with_hooks(environment, H::default())
    }
}

impl<Op, H> BatchRecordOperation<Op, H>
where
    Op: RecordOperation,
    H: BatchHooks<Op>,
{
    pub fn with_hooks(environment: SyncEnvironment, hooks: H) -> Self {
        BatchRecordOperation {
            environment,
            hooks,
            progress: Progress::new(0),
            _operation: PhantomData,
        }
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Steps 2 to 6. Any error fails the whole batch.
    async fn process(
        &self,
        records: Vec<Record>,
        save_context: &RecordContext,
        results: &mut BatchResults<Op::Output>,
    ) -> Result<(), RecordErrorKind> {
        let records = self
            .hooks
            .process_records(records, &self.environment)
            .await?;

        let mut operations = Vec::with_capacity(records.len());
        for record in records {
            match Op::new(record.clone(), self.environment.clone(), save_context.clone()) {
                Ok(operation) => {
                    self.progress.add_child(operation.progress(), 1);
                    operations.push(operation);
                }
                Err(err) => {
                    debug!(record = %record, error = %err, "Skipping record");
                    self.progress.advance(1);
                    results.insert(record.record_id().clone(), Err(err));
                }
            }
        }

        let outcomes: Vec<(RecordID, Result<Op::Output, RecordError>)> =
            stream::iter(operations)
                .map(|operation| async move {
                    let result = run(&operation).await;
                    (operation.record_id().clone(), result)
                })
                .buffer_unordered(self.environment.max_concurrent_operations())
                .collect()
                .await;
        results.extend(outcomes);

        self.hooks
            .process_results(results, save_context, &self.environment)
            .await?;

        save_context.save().await?;
        Ok(())
    }
}

#[async_trait]
impl<Op, H> Operation for BatchRecordOperation<Op, H>
where
    Op: RecordOperation,
    H: BatchHooks<Op>,
{
    type Output = BatchResults<Op::Output>;
    type Error = SyncError;

    fn progress(&self) -> &Progress {
        &self.progress
    }

    async fn execute(&self) -> Result<Self::Output, SyncError> {
        let records = self.environment.controller.fetch_records(Op::PREDICATE).await?;

        let mut results: Self::Output = records
            .iter()
            .map(|record| {
                let record_id = record.record_id().clone();
                (record_id.clone(), Err(RecordError::unknown(record_id)))
            })
            .collect();
        if records.is_empty() {
            return Ok(results);
        }

        info!(predicate = ?Op::PREDICATE, count = records.len(), "Running batch");
        self.progress.set_total_unit_count(records.len() as u64);

        let save_context = self.environment.controller.new_context();
        if let Err(kind) = self.process(records, &save_context, &mut results).await {
            error!(predicate = ?Op::PREDICATE, error = %kind, "Batch failed; failing every record");
            for (record_id, result) in results.iter_mut() {
                *result = Err(RecordError::new(record_id.clone(), kind.clone()));
            }
        }

        self.hooks.finish(&results).await;
        Ok(results)
    }

    fn cancelled_error(&self) -> SyncError {
        SyncError::Cancelled
    }

    /// Results are reported even when cancelled.
    fn finish(&self, result: Result<Self::Output, SyncError>) -> Result<Self::Output, SyncError> {
        result
    }
}
