//! # Service Boundary
//!
//! What a remote backend must provide for Harmony to sync against it.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Service                                         │
//! │                                                                         │
//! │  accounts   authenticate / authenticate_in_background / deauthenticate │
//! │  changes    fetch_all_remote_records / fetch_changed_remote_records    │
//! │  records    upload_record / download_record / delete_record            │
//! │  files      upload_file / download_file / delete_file                  │
//! │  extras     update_metadata / fetch_versions                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Implementations report failures with the engine's error taxonomy:
//! record calls return [`RecordError`], file calls [`FileError`], fetches
//! [`FetchError`]. Rate limits (`ServiceError::RateLimitExceeded`) and
//! expired tokens (`AuthenticationError::TokenExpired`) are retried by the
//! engine, so implementations should surface them rather than retry
//! themselves.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use harmony_core::{
    Account, AuthenticationError, ChangeToken, FetchError, File, FileError, Metadata,
    RecordError, RecordID, RemoteFile, RemoteRecord, Syncable, Version,
};

/// Remote records changed since a change token.
#[derive(Debug, Clone)]
pub struct RemoteChanges {
    /// New or modified remote records.
    pub updated: Vec<RemoteRecord>,

    /// Backend identifiers of remote records deleted since the token.
    /// Always empty for a full fetch.
    pub deleted: Vec<String>,

    /// Token to pass to the next incremental fetch.
    pub change_token: ChangeToken,
}

/// Everything the backend needs to store one record.
#[derive(Debug, Clone)]
pub struct RecordUpload {
    pub record_id: RecordID,

    /// Object whose syncable values are uploaded.
    pub object: Arc<dyn Syncable>,

    /// Object metadata plus the reserved `harmony_` keys.
    pub metadata: Metadata,

    /// Remote files the new version references.
    pub files: Vec<RemoteFile>,

    /// Remote record being replaced, if the record was uploaded before.
    pub previous: Option<RemoteRecord>,
}

/// A downloaded record version.
pub struct DownloadedRecord {
    /// Freshly decoded object, replacing the local one on save.
    pub object: Arc<dyn Syncable>,

    /// Remote files referenced by this version.
    pub remote_files: Vec<RemoteFile>,
}

impl fmt::Debug for DownloadedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadedRecord")
            .field("record_id", &self.object.record_id())
            .field("remote_files", &self.remote_files.len())
            .finish()
    }
}

/// A remote backend.
#[async_trait]
pub trait Service: Send + Sync {
    /// Stable identifier (e.g. `"com.example.drive"`).
    fn identifier(&self) -> &str;

    /// Name shown to the user.
    fn localized_name(&self) -> &str;

    // =========================================================================
    // Accounts
    // =========================================================================

    /// Interactive sign-in.
    async fn authenticate(&self) -> Result<Account, AuthenticationError>;

    /// Sign-in with saved credentials; never prompts.
    async fn authenticate_in_background(&self) -> Result<Account, AuthenticationError>;

    async fn deauthenticate(&self) -> Result<(), AuthenticationError>;

    // =========================================================================
    // Changes
    // =========================================================================

    /// Every remote record.
    async fn fetch_all_remote_records(&self) -> Result<RemoteChanges, FetchError>;

    /// Remote records changed since `change_token`.
    ///
    /// Returns `FetchError::InvalidChangeToken` when the backend can no
    /// longer answer incrementally.
    async fn fetch_changed_remote_records(
        &self,
        change_token: &ChangeToken,
    ) -> Result<RemoteChanges, FetchError>;

    // =========================================================================
    // Records
    // =========================================================================

    /// Stores a new version and returns the resulting remote record.
    async fn upload_record(&self, upload: &RecordUpload) -> Result<RemoteRecord, RecordError>;

    /// Downloads `version` of a remote record.
    async fn download_record(
        &self,
        remote: &RemoteRecord,
        version: &Version,
    ) -> Result<DownloadedRecord, RecordError>;

    /// Deletes a remote record and all its versions.
    async fn delete_record(&self, remote: &RemoteRecord) -> Result<(), RecordError>;

    // =========================================================================
    // Files
    // =========================================================================

    /// Uploads the file at `file.local_path`.
    async fn upload_file(&self, file: &File, record_id: &RecordID) -> Result<RemoteFile, FileError>;

    /// Writes the remote file's contents to `destination.local_path`.
    async fn download_file(
        &self,
        remote_file: &RemoteFile,
        destination: &File,
    ) -> Result<(), FileError>;

    async fn delete_file(&self, remote_file: &RemoteFile) -> Result<(), FileError>;

    // =========================================================================
    // Extras
    // =========================================================================

    /// Replaces the metadata of the current remote version.
    async fn update_metadata(
        &self,
        remote: &RemoteRecord,
        metadata: &Metadata,
    ) -> Result<(), RecordError>;

    /// Every stored version of a remote record, oldest first.
    async fn fetch_versions(&self, remote: &RemoteRecord) -> Result<Vec<Version>, RecordError>;
}
