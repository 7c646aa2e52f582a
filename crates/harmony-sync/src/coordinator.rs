//! # Sync Coordinator
//!
//! Entry point of the engine: owns the environment, the account, and runs
//! sync passes.
//!
//! ## Sync Pass
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    SyncRecordsOperation (5 units)                       │
//! │                                                                         │
//! │  FetchingChanges  fetch since stored token                   (1 unit)  │
//! │                   invalid token → clear it, full fetch once  (0 units) │
//! │                   store new token                                       │
//! │  Resolving        ConflictRecordsOperation                   (1 unit)  │
//! │  Deleting         DeleteRecordsOperation                     (1 unit)  │
//! │  Uploading        UploadRecordsOperation                     (1 unit)  │
//! │  Downloading      DownloadRecordsOperation                   (1 unit)  │
//! │  Finished         + conflicted error for every flagged record          │
//! │                                                                         │
//! │  any failed record → SyncError::Partial(results)                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Stages run strictly one after another, and a coordinator runs at most one
//! pass at a time. The current stage is published over a
//! `tokio::sync::watch` channel.

use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use harmony_core::{
    Account, FetchError, GeneralError, Metadata, RecordError, RecordID, RecordStatus,
    ValidationError, Version,
};
use harmony_db::{
    Database, DbConfig, DbError, ObjectStore, Record, RecordContext, RecordController,
};

use crate::batch::{BatchHooks, BatchRecordOperation, BatchResults};
use crate::config::SyncConfig;
use crate::conflict::ConflictRecordsOperation;
use crate::delete::DeleteRecordsOperation;
use crate::download::{DownloadRecordOperation, DownloadRecordsOperation};
use crate::environment::SyncEnvironment;
use crate::error::{SyncError, SyncResult, SyncResults};
use crate::fetch::{FetchRemoteRecordsOperation, FetchedChanges};
use crate::metadata::UpdateRecordMetadataOperation;
use crate::operation::record::update_record;
use crate::operation::{run, spawn, Operation, OperationHandle, Progress, RecordOperation};
use crate::service::Service;
use crate::upload::{UploadRecordOperation, UploadRecordsOperation};

// =============================================================================
// Sync Progress
// =============================================================================

/// Stage of the running (or last) sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncProgress {
    #[default]
    Idle,
    FetchingChanges,
    Resolving,
    Deleting,
    Uploading,
    Downloading,
    Finished,
}

impl fmt::Display for SyncProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            SyncProgress::Idle => "idle",
            SyncProgress::FetchingChanges => "fetching changes",
            SyncProgress::Resolving => "resolving conflicts",
            SyncProgress::Deleting => "deleting",
            SyncProgress::Uploading => "uploading",
            SyncProgress::Downloading => "downloading",
            SyncProgress::Finished => "finished",
        };
        f.write_str(stage)
    }
}

/// Which side of a conflicted record to keep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordResolution {
    /// Upload the local copy over the remote one.
    Local,
    /// Restore this remote version locally.
    Remote(Version),
}

// =============================================================================
// Sync Records Operation
// =============================================================================

/// Clears the coordinator's running flag when the pass is dropped, whether
/// it finished, failed, or its task panicked.
struct RunningPass(Arc<AtomicBool>);

impl Drop for RunningPass {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One full sync pass.
pub struct SyncRecordsOperation {
    environment: SyncEnvironment,
    stage: Arc<watch::Sender<SyncProgress>>,
    progress: Progress,
    _running: Option<RunningPass>,
}

impl SyncRecordsOperation {
    pub fn new(environment: SyncEnvironment, stage: Arc<watch::Sender<SyncProgress>>) -> Self {
        SyncRecordsOperation {
            environment,
            stage,
            progress: Progress::new(5),
            _running: None,
        }
    }

    fn set_stage(&self, stage: SyncProgress) {
        debug!(%stage, "Sync stage");
        self.stage.send_replace(stage);
    }

    async fn fetch_changes(&self) -> SyncResult<FetchedChanges> {
        let controller = &self.environment.controller;
        let token = controller.change_token().await?;

        let fetch = FetchRemoteRecordsOperation::new(self.environment.clone(), token.clone());
        self.progress.add_child(fetch.progress(), 1);

        match run(&fetch).await {
            Err(FetchError::InvalidChangeToken) if token.is_some() => {
                warn!("Change token rejected; fetching every remote record");
                controller.set_change_token(None).await?;

                let refetch = FetchRemoteRecordsOperation::new(self.environment.clone(), None);
                self.progress.add_child(refetch.progress(), 0);
                run(&refetch).await.map_err(fetch_error)
            }
            result => result.map_err(fetch_error),
        }
    }

    async fn run_batch<Op, H>(
        &self,
        stage: SyncProgress,
        batch: BatchRecordOperation<Op, H>,
        results: &mut SyncResults,
    ) -> SyncResult<()>
    where
        Op: RecordOperation,
        H: BatchHooks<Op>,
    {
        if self.progress.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        self.set_stage(stage);
        self.progress.add_child(batch.progress(), 1);
        merge(results, run(&batch).await?);
        Ok(())
    }
}

fn fetch_error(err: FetchError) -> SyncError {
    match err {
        FetchError::General(GeneralError::Cancelled) => SyncError::Cancelled,
        other => SyncError::Fetch(other),
    }
}

/// Adds batch results; a failure already recorded for a record is kept.
fn merge<T>(results: &mut SyncResults, batch: BatchResults<T>) {
    for (record_id, result) in batch {
        let result = result.map(|_| ());
        match results.entry(record_id) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_ok() {
                    entry.insert(result);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(result);
            }
        }
    }
}

#[async_trait]
impl Operation for SyncRecordsOperation {
    type Output = SyncResults;
    type Error = SyncError;

    fn progress(&self) -> &Progress {
        &self.progress
    }

    async fn execute(&self) -> SyncResult<SyncResults> {
        let env = &self.environment;
        info!("Starting sync");

        self.set_stage(SyncProgress::FetchingChanges);
        let changes = self.fetch_changes().await?;
        env.controller
            .set_change_token(Some(&changes.change_token))
            .await?;
        debug!(records = changes.records.len(), "Stored remote changes");

        let mut results = SyncResults::new();
        self.run_batch(
            SyncProgress::Resolving,
            ConflictRecordsOperation::new(env.clone()),
            &mut results,
        )
        .await?;
        self.run_batch(
            SyncProgress::Deleting,
            DeleteRecordsOperation::new(env.clone()),
            &mut results,
        )
        .await?;
        self.run_batch(
            SyncProgress::Uploading,
            UploadRecordsOperation::new(env.clone()),
            &mut results,
        )
        .await?;
        self.run_batch(
            SyncProgress::Downloading,
            DownloadRecordsOperation::new(env.clone()),
            &mut results,
        )
        .await?;

        for record in env.controller.fetch_conflicted_records().await? {
            let record_id = record.record_id().clone();
            let conflicted = Err(RecordError::conflicted(record_id.clone()));
            merge(&mut results, BatchResults::<()>::from([(record_id, conflicted)]));
        }

        self.set_stage(SyncProgress::Finished);

        let failed = results.values().filter(|result| result.is_err()).count();
        if failed > 0 {
            warn!(failed, total = results.len(), "Sync finished with failures");
            return Err(SyncError::Partial(results));
        }

        info!(synced = results.len(), "Sync finished");
        Ok(results)
    }

    fn cancelled_error(&self) -> SyncError {
        SyncError::Cancelled
    }
}

// =============================================================================
// Sync Coordinator
// =============================================================================

/// Runs sync passes against one backend.
pub struct SyncCoordinator {
    environment: SyncEnvironment,
    stage: Arc<watch::Sender<SyncProgress>>,
    syncing: Arc<AtomicBool>,
}

impl SyncCoordinator {
    pub fn new(
        controller: Arc<RecordController>,
        service: Arc<dyn Service>,
        config: SyncConfig,
    ) -> Self {
        Self::with_environment(SyncEnvironment::new(controller, service, Arc::new(config)))
    }

    pub fn with_environment(environment: SyncEnvironment) -> Self {
        let (stage, _) = watch::channel(SyncProgress::Idle);
        SyncCoordinator {
            environment,
            stage: Arc::new(stage),
            syncing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn environment(&self) -> &SyncEnvironment {
        &self.environment
    }

    pub fn controller(&self) -> &Arc<RecordController> {
        &self.environment.controller
    }

    pub fn config(&self) -> &SyncConfig {
        &self.environment.config
    }

    /// Restores the saved account and seeds managed records on first use.
    pub async fn start(&self) -> SyncResult<()> {
        let controller = self.controller();

        if let Some(account) = controller.database().state().account().await? {
            debug!(account = %account.name, "Restored saved account");
            self.environment.service.set_account(Some(account)).await;
        }

        if !controller.is_seeded().await? {
            let created = controller.seed().await?;
            info!(created, "Seeded record store");
        }

        Ok(())
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    /// Signs in interactively and remembers the account.
    pub async fn authenticate(&self) -> SyncResult<Account> {
        let account = self.environment.service.service().authenticate().await?;
        self.controller()
            .database()
            .state()
            .set_account(Some(&account))
            .await?;
        self.environment.service.set_account(Some(account.clone())).await;

        info!(account = %account.name, "Authenticated");
        Ok(account)
    }

    /// Signs out, forgetting the account and the change token.
    pub async fn deauthenticate(&self) -> SyncResult<()> {
        self.environment.service.service().deauthenticate().await?;
        self.environment.service.set_account(None).await;

        let state = self.controller().database().state();
        state.set_account(None).await?;
        state.set_change_token(None).await?;

        info!("Deauthenticated");
        Ok(())
    }

    pub async fn account(&self) -> Option<Account> {
        self.environment.service.account().await
    }

    // =========================================================================
    // Syncing
    // =========================================================================

    /// Starts a sync pass in the background.
    ///
    /// Returns `None` while another pass is still running.
    pub fn sync(&self) -> Option<OperationHandle<SyncResults, SyncError>> {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Sync already in progress");
            return None;
        }

        let mut operation =
            SyncRecordsOperation::new(self.environment.clone(), Arc::clone(&self.stage));
        operation._running = Some(RunningPass(Arc::clone(&self.syncing)));
        Some(spawn(operation))
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    /// Receiver of the current sync stage.
    pub fn subscribe(&self) -> watch::Receiver<SyncProgress> {
        self.stage.subscribe()
    }

    // =========================================================================
    // Single Records
    // =========================================================================

    /// Replaces the remote metadata of `record`.
    pub async fn update_metadata(
        &self,
        record: Record,
        metadata: Metadata,
    ) -> Result<(), RecordError> {
        run(&UpdateRecordMetadataOperation::new(
            record,
            metadata,
            self.environment.clone(),
        ))
        .await
    }

    /// Uploads `record` outside of a sync pass.
    ///
    /// Returns the record as stored after the upload.
    pub async fn upload(&self, record: &Record) -> Result<Record, RecordError> {
        let save_context = self.controller().new_context();
        let operation =
            UploadRecordOperation::new(record.clone(), self.environment.clone(), save_context.clone())?;
        run(&operation).await?;

        self.save(record.record_id(), &save_context).await
    }

    /// Replaces the local copy of `record` with a stored remote `version`.
    ///
    /// The restored copy is marked for upload on the next pass, on top of the
    /// current remote version.
    pub async fn restore(&self, record: &Record, version: Version) -> Result<Record, RecordError> {
        let save_context = self.controller().new_context();
        let operation =
            DownloadRecordOperation::new(record.clone(), self.environment.clone(), save_context.clone())?
                .with_version(version);
        let object = run(&operation).await?;

        update_record(record, &save_context, |r| {
            let current = r.remote.as_ref().map(|remote| remote.version.clone());
            if let Some(local) = r.local.as_mut() {
                local.status = RecordStatus::Updated;
                local.content_hash = Some(object.content_hash());
                if current.is_some() {
                    local.version = current;
                }
            }
        })?;

        self.save(record.record_id(), &save_context).await
    }

    /// Settles a conflicted record by keeping one side.
    ///
    /// On failure the record stays conflicted.
    pub async fn resolve_conflicted_record(
        &self,
        record: &Record,
        resolution: RecordResolution,
    ) -> Result<Record, RecordError> {
        record.perform_mut(|r| r.is_conflicted = false);

        let result = match resolution.clone() {
            RecordResolution::Local => self.upload(record).await,
            RecordResolution::Remote(version) => self.restore(record, version).await,
        };

        match result {
            Ok(resolved) => {
                resolved.perform_mut(|r| r.is_conflicted = false);
                resolved
                    .context()
                    .save()
                    .await
                    .map_err(|err| RecordError::new(record.record_id().clone(), err))?;
                info!(record = %record, ?resolution, "Resolved conflicted record");
                Ok(resolved)
            }
            Err(err) => {
                record.perform_mut(|r| r.is_conflicted = true);
                warn!(record = %record, error = %err, "Failed to resolve conflicted record");
                Err(err)
            }
        }
    }

    /// Saves a one-off context and returns the stored record.
    async fn save(
        &self,
        record_id: &RecordID,
        save_context: &RecordContext,
    ) -> Result<Record, RecordError> {
        let error = |err: DbError| RecordError::new(record_id.clone(), err);
        save_context.save().await.map_err(error)?;

        self.controller()
            .new_context()
            .fetch_record(record_id)
            .await
            .map_err(error)?
            .ok_or_else(|| RecordError::new(record_id.clone(), ValidationError::NilManagedRecord))
    }

    /// Every stored remote version of `record`, oldest first.
    pub async fn fetch_versions(&self, record: &Record) -> Result<Vec<Version>, RecordError> {
        let record_id = record.record_id();
        let remote = record
            .perform(|r| r.remote.clone())
            .flatten()
            .ok_or_else(|| RecordError::new(record_id.clone(), ValidationError::NilRemoteRecord))?;

        let (remote, progress) = (&remote, Progress::new(1));
        let versions = self
            .environment
            .service
            .call(record_id, &progress, |service| async move {
                service.fetch_versions(remote).await
            })
            .await?;
        Ok(versions)
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for a [`SyncCoordinator`] backed by an on-disk database.
pub struct SyncCoordinatorBuilder {
    config: SyncConfig,
    service: Option<Arc<dyn Service>>,
    objects: Option<Arc<dyn ObjectStore>>,
    database: Option<Database>,
}

impl SyncCoordinatorBuilder {
    pub fn new(config: SyncConfig) -> Self {
        SyncCoordinatorBuilder {
            config,
            service: None,
            objects: None,
            database: None,
        }
    }

    pub fn with_service(mut self, service: Arc<dyn Service>) -> Self {
        self.service = Some(service);
        self
    }

    pub fn with_object_store(mut self, objects: Arc<dyn ObjectStore>) -> Self {
        self.objects = Some(objects);
        self
    }

    /// Uses an open database instead of the configured path.
    pub fn with_database(mut self, database: Database) -> Self {
        self.database = Some(database);
        self
    }

    pub async fn build(self) -> SyncResult<SyncCoordinator> {
        self.config.validate()?;

        let service = self
            .service
            .ok_or_else(|| SyncError::InvalidConfig("Service required".into()))?;
        let objects = self
            .objects
            .ok_or_else(|| SyncError::InvalidConfig("Object store required".into()))?;

        let database = match self.database {
            Some(database) => database,
            None => {
                let path = self.config.database.resolved_path().ok_or_else(|| {
                    SyncError::InvalidConfig("No database path available".into())
                })?;
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|err| SyncError::DatabaseError(err.to_string()))?;
                }
                Database::new(DbConfig::new(path)).await?
            }
        };

        let controller = Arc::new(RecordController::new(database, objects));
        Ok(SyncCoordinator::new(controller, service, self.config))
    }
}
