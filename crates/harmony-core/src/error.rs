//! # Error Types
//!
//! The sync engine's error taxonomy.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  harmony-core errors (this file)                                       │
//! │  ├── GeneralError        - cancelled / unknown                         │
//! │  ├── ServiceError        - what a backend reports                      │
//! │  ├── AuthenticationError - account / token problems                    │
//! │  ├── ValidationError     - bookkeeping is missing a required piece     │
//! │  ├── FileError           - one file of one record                      │
//! │  ├── RecordError         - one record (record_id + RecordErrorKind)    │
//! │  └── FetchError          - fetching remote changes                     │
//! │                                                                         │
//! │  harmony-db errors (separate crate)                                    │
//! │  └── DbError             - SQLite failures                             │
//! │                                                                         │
//! │  harmony-sync errors (separate crate)                                  │
//! │  └── SyncError           - what a whole sync pass reports              │
//! │                                                                         │
//! │  Flow: ServiceError → RecordError → batch results → SyncError          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Principles
//! 1. Use `thiserror` for derive macros (not manual impl)
//! 2. Errors are `Clone`: a batch-level failure is copied into every
//!    record's result
//! 3. "Already gone" is a distinct variant (`DoesNotExist`) so deletion can
//!    treat it as success

use thiserror::Error;

use crate::types::RecordID;

// =============================================================================
// General Error
// =============================================================================

/// Errors that can happen to any operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeneralError {
    /// The operation was cancelled before it completed.
    #[error("The operation was cancelled.")]
    Cancelled,

    /// The operation finished without producing a result.
    #[error("An unknown error occurred.")]
    Unknown,
}

// =============================================================================
// Service Error
// =============================================================================

/// Failures reported by a remote backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The backend answered with something that could not be interpreted.
    #[error("The server returned an invalid response.")]
    InvalidResponse,

    /// Too many requests; the call may be retried after a delay.
    #[error("The rate limit has been exceeded.")]
    RateLimitExceeded,

    /// The requested record or file is not stored remotely.
    #[error("The item does not exist.")]
    ItemDoesNotExist,

    /// The backend refuses to serve the content.
    #[error("The content is restricted.")]
    RestrictedContent,

    /// The backend could not be reached.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Service error: {0}")]
    Other(String),
}

// =============================================================================
// Authentication Error
// =============================================================================

/// Account and credential failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthenticationError {
    #[error("Not authenticated.")]
    NotAuthenticated,

    #[error("No saved credentials.")]
    NoSavedCredentials,

    /// The access token is no longer valid.
    ///
    /// ## When This Occurs
    /// - Long-running sync outlives the token lifetime
    /// - The user revoked access from another device
    ///
    /// A service call failing with this error is retried once after a
    /// background re-authentication.
    #[error("The access token has expired.")]
    TokenExpired,

    #[error("Authentication failed: {0}")]
    Other(String),
}

// =============================================================================
// Validation Error
// =============================================================================

/// The bookkeeping for a record is missing something an operation needs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("The managed record is no longer available.")]
    NilManagedRecord,

    #[error("The record has no local record.")]
    NilLocalRecord,

    #[error("The record has no remote record.")]
    NilRemoteRecord,

    #[error("The recorded object could not be found.")]
    NilRecordedObject,

    /// A downloaded object references records that do not exist locally.
    #[error("Missing relationship objects for keys: {keys:?}")]
    NilRelationshipObjects { keys: Vec<String> },

    #[error("The recorded object has no syncable identifier.")]
    InvalidSyncableIdentifier,

    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),
}

// =============================================================================
// File Error
// =============================================================================

/// Failure affecting a single file of a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FileError {
    /// The record does not declare a file with this identifier.
    #[error("Unknown file: {0}")]
    UnknownFile(String),

    /// The file is not stored remotely (or locally, for reads).
    #[error("File does not exist: {0}")]
    DoesNotExist(String),

    #[error("File is restricted: {0}")]
    Restricted(String),

    #[error("File {file_identifier}: {source}")]
    Service {
        file_identifier: String,
        source: ServiceError,
    },

    #[error("File {file_identifier}: {source}")]
    Authentication {
        file_identifier: String,
        source: AuthenticationError,
    },

    /// Reading or writing the local copy failed.
    #[error("File {file_identifier}: {message}")]
    Io {
        file_identifier: String,
        message: String,
    },

    #[error("File {file_identifier} was cancelled")]
    Cancelled { file_identifier: String },
}

impl FileError {
    /// Wraps a backend failure, mapping "item does not exist" and
    /// "restricted" to their dedicated variants.
    pub fn from_service(file_identifier: impl Into<String>, error: ServiceError) -> Self {
        let file_identifier = file_identifier.into();
        match error {
            ServiceError::ItemDoesNotExist => FileError::DoesNotExist(file_identifier),
            ServiceError::RestrictedContent => FileError::Restricted(file_identifier),
            source => FileError::Service {
                file_identifier,
                source,
            },
        }
    }

    /// Identifier of the file this error concerns.
    pub fn file_identifier(&self) -> &str {
        match self {
            FileError::UnknownFile(id)
            | FileError::DoesNotExist(id)
            | FileError::Restricted(id) => id,
            FileError::Service {
                file_identifier, ..
            }
            | FileError::Authentication {
                file_identifier, ..
            }
            | FileError::Io {
                file_identifier, ..
            }
            | FileError::Cancelled { file_identifier } => file_identifier,
        }
    }

    pub fn is_does_not_exist(&self) -> bool {
        matches!(self, FileError::DoesNotExist(_))
    }
}

// =============================================================================
// Record Error
// =============================================================================

/// Why a record failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordErrorKind {
    /// The remote record is locked and has no unlocked version to fall back to.
    #[error("The record is locked.")]
    Locked,

    /// The record is not stored remotely.
    #[error("The record does not exist.")]
    DoesNotExist,

    #[error("Syncing is disabled for this record.")]
    SyncingDisabled,

    /// The record is flagged as conflicted and awaits an external decision.
    ///
    /// ## When This Occurs
    /// - An operation was constructed for a record with `is_conflicted` set
    /// - A sync pass finished while the record was still conflicted
    #[error("The record is conflicted.")]
    Conflicted,

    /// One or more files of the record failed.
    #[error("{} file(s) failed.", .0.len())]
    FilesFailed(Vec<FileError>),

    #[error(transparent)]
    Service(ServiceError),

    #[error(transparent)]
    Authentication(AuthenticationError),

    #[error(transparent)]
    Validation(ValidationError),

    #[error(transparent)]
    General(GeneralError),

    /// The bookkeeping store failed (batch save, fetch of the candidate set).
    #[error("Database error: {0}")]
    Database(String),

    #[error("{0}")]
    Other(String),
}

impl From<ServiceError> for RecordErrorKind {
    fn from(error: ServiceError) -> Self {
        match error {
            ServiceError::ItemDoesNotExist => RecordErrorKind::DoesNotExist,
            other => RecordErrorKind::Service(other),
        }
    }
}

impl From<AuthenticationError> for RecordErrorKind {
    fn from(error: AuthenticationError) -> Self {
        RecordErrorKind::Authentication(error)
    }
}

impl From<ValidationError> for RecordErrorKind {
    fn from(error: ValidationError) -> Self {
        RecordErrorKind::Validation(error)
    }
}

impl From<GeneralError> for RecordErrorKind {
    fn from(error: GeneralError) -> Self {
        RecordErrorKind::General(error)
    }
}

/// Failure of one record, carrying the record it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{record_id}: {kind}")]
pub struct RecordError {
    pub record_id: RecordID,

    #[source]
    pub kind: RecordErrorKind,
}

impl RecordError {
    pub fn new(record_id: RecordID, kind: impl Into<RecordErrorKind>) -> Self {
        RecordError {
            record_id,
            kind: kind.into(),
        }
    }

    /// Wraps a backend failure; "item does not exist" becomes `DoesNotExist`.
    pub fn from_service(record_id: RecordID, error: ServiceError) -> Self {
        RecordError::new(record_id, error)
    }

    pub fn cancelled(record_id: RecordID) -> Self {
        RecordError::new(record_id, GeneralError::Cancelled)
    }

    pub fn unknown(record_id: RecordID) -> Self {
        RecordError::new(record_id, GeneralError::Unknown)
    }

    pub fn conflicted(record_id: RecordID) -> Self {
        RecordError::new(record_id, RecordErrorKind::Conflicted)
    }

    pub fn files_failed(record_id: RecordID, errors: Vec<FileError>) -> Self {
        RecordError::new(record_id, RecordErrorKind::FilesFailed(errors))
    }

    pub fn is_does_not_exist(&self) -> bool {
        matches!(self.kind, RecordErrorKind::DoesNotExist)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, RecordErrorKind::General(GeneralError::Cancelled))
    }

    pub fn is_conflicted(&self) -> bool {
        matches!(self.kind, RecordErrorKind::Conflicted)
    }
}

/// Result of processing one record.
pub type RecordResult<T> = Result<T, RecordError>;

// =============================================================================
// Fetch Error
// =============================================================================

/// Failure fetching remote changes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The backend no longer recognises the change token; a full fetch is
    /// required.
    #[error("The change token is no longer valid.")]
    InvalidChangeToken,

    #[error(transparent)]
    Service(ServiceError),

    #[error(transparent)]
    Authentication(AuthenticationError),

    #[error(transparent)]
    General(GeneralError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("{0}")]
    Other(String),
}

impl From<ServiceError> for FetchError {
    fn from(error: ServiceError) -> Self {
        FetchError::Service(error)
    }
}

impl From<AuthenticationError> for FetchError {
    fn from(error: AuthenticationError) -> Self {
        FetchError::Authentication(error)
    }
}

impl From<GeneralError> for FetchError {
    fn from(error: GeneralError) -> Self {
        FetchError::General(error)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
