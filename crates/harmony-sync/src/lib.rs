//! # harmony-sync: Sync Engine for Harmony
//!
//! This crate runs sync passes: it fetches remote changes, resolves
//! conflicts, and pushes deletions, uploads and downloads through a
//! pluggable [`Service`].
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Harmony Sync Pass                                │
//! │                                                                         │
//! │   SyncCoordinator::sync()                                               │
//! │        │                                                                │
//! │        ▼                                                                │
//! │   ┌─────────────────────────────────────────────────────────────────┐  │
//! │   │                    SyncRecordsOperation                         │  │
//! │   │                                                                 │  │
//! │   │  1. FetchRemoteRecordsOperation  (change token, tombstones)     │  │
//! │   │  2. ConflictRecordsOperation     (newest / oldest / keep)       │  │
//! │   │  3. DeleteRecordsOperation       (remote files, record, local)  │  │
//! │   │  4. UploadRecordsOperation       (changed files, metadata)      │  │
//! │   │  5. DownloadRecordsOperation     (versions, files, relations)   │  │
//! │   └──────────────────────────────┬──────────────────────────────────┘  │
//! │                                  │                                      │
//! │            each batch: one child context, ≤ N records in flight,        │
//! │            one save, per-record Result map                              │
//! │                                  │                                      │
//! │   ┌──────────────────────────────▼──────────────────────────────────┐  │
//! │   │  ServiceRetry ──► dyn Service (backend supplied by the app)     │  │
//! │   │  rate limit → backoff │ token expired → re-authenticate once    │  │
//! │   └─────────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! ### Framework
//! - [`operation`] - Cancellable operations, progress trees, service retry
//! - [`batch`] - Bounded fan-out of per-record operations over one context
//! - [`environment`] - What every operation needs: controller, service, config
//! - [`service`] - The backend seam
//! - [`config`] - TOML configuration with environment overrides
//! - [`error`] - Sync-level errors
//!
//! ### Operations
//! - [`fetch`] - Incremental remote change fetch
//! - [`conflict`] - Automatic conflict resolution
//! - [`delete`] - Local and remote deletion
//! - [`upload`] - Record and file upload
//! - [`download`] - Record and file download, relationship checks
//! - [`metadata`] - Remote metadata updates
//! - [`coordinator`] - The full sync pass and its entry point
//!
//! ## Usage
//!
//! ```rust,ignore
//! use harmony_sync::{SyncConfig, SyncCoordinatorBuilder};
//!
//! let config = SyncConfig::load_or_default(None);
//! let coordinator = SyncCoordinatorBuilder::new(config)
//!     .with_service(backend)
//!     .with_object_store(store)
//!     .build()
//!     .await?;
//!
//! coordinator.start().await?;
//!
//! let stage = coordinator.subscribe();
//! if let Some(pass) = coordinator.sync() {
//!     let results = pass.result().await?;
//!     println!("Synced {} records", results.len());
//! }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

// Framework
pub mod batch;
pub mod config;
pub mod environment;
pub mod error;
pub mod operation;
pub mod service;

// Operations
pub mod conflict;
pub mod coordinator;
pub mod delete;
pub mod download;
pub mod fetch;
pub mod metadata;
pub mod upload;

#[cfg(test)]
mod test_support;

// =============================================================================
// Re-exports
// =============================================================================

// Framework types
pub use batch::{BatchHooks, BatchRecordOperation, BatchResults, NoHooks};
pub use config::SyncConfig;
pub use environment::SyncEnvironment;
pub use error::{SyncError, SyncResult, SyncResults};
pub use operation::{
    run, spawn, start, Operation, OperationHandle, Progress, RecordOperation, RetryPolicy,
    ServiceRetry,
};
pub use service::{DownloadedRecord, RecordUpload, RemoteChanges, Service};

// Operations
pub use conflict::{ConflictRecordOperation, ConflictRecordsOperation};
pub use coordinator::{
    RecordResolution, SyncCoordinator, SyncCoordinatorBuilder, SyncProgress, SyncRecordsOperation,
};
pub use delete::{DeleteHooks, DeleteRecordOperation, DeleteRecordsOperation};
pub use download::{DownloadHooks, DownloadRecordOperation, DownloadRecordsOperation};
pub use fetch::{FetchRemoteRecordsOperation, FetchedChanges};
pub use metadata::UpdateRecordMetadataOperation;
pub use upload::{UploadHooks, UploadRecordOperation, UploadRecordsOperation};
