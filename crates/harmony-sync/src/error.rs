//! # Sync Error Types
//!
//! Error types for sync passes and the coordinator.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Remote        │  │     Records             │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Authentication │  │  Partial (per-record    │ │
//! │  │  ConfigLoad     │  │  Fetch          │  │  results, at least one  │ │
//! │  │  ConfigSave     │  │                 │  │  failure)               │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────────────────────────────────┐  │
//! │  │    Database     │  │  Internal: Cancelled, Internal               │  │
//! │  └─────────────────┘  └─────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Per-record failures never surface as their own `SyncError`; they are
//! collected into [`SyncError::Partial`] once the whole pass has run.

use std::collections::HashMap;

use thiserror::Error;

use harmony_core::{AuthenticationError, FetchError, GeneralError, RecordError, RecordID};
use harmony_db::DbError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Per-record outcome of a sync pass.
pub type SyncResults = HashMap<RecordID, Result<(), RecordError>>;

/// Sync error type covering every failure of a sync pass.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Remote Errors
    // =========================================================================
    /// Signing in to the backend failed.
    #[error(transparent)]
    Authentication(#[from] AuthenticationError),

    /// Fetching remote changes failed; nothing else ran.
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    // =========================================================================
    // Record Errors
    // =========================================================================
    /// The pass ran to completion but some records failed.
    ///
    /// ## When This Occurs
    /// - Any per-record operation failed
    /// - A record is still conflicted after the pass
    /// - A batch save failed (every record of that batch fails)
    #[error("{} record(s) failed to sync", failure_count(.0))]
    Partial(SyncResults),

    // =========================================================================
    // Database Errors
    // =========================================================================
    /// Reading candidate records or engine state failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// The pass was cancelled.
    #[error("Sync was cancelled")]
    Cancelled,

    /// Internal engine error (e.g. a panicked task).
    #[error("Internal error: {0}")]
    Internal(String),
}

fn failure_count(results: &SyncResults) -> usize {
    results.values().filter(|result| result.is_err()).count()
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<DbError> for SyncError {
    fn from(err: DbError) -> Self {
        SyncError::DatabaseError(err.to_string())
    }
}

impl From<GeneralError> for SyncError {
    fn from(err: GeneralError) -> Self {
        match err {
            GeneralError::Cancelled => SyncError::Cancelled,
            GeneralError::Unknown => SyncError::Internal(err.to_string()),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if running the pass again may succeed.
    ///
    /// ## Retryable Errors
    /// - Partial failures (failed records are picked up again)
    /// - Fetch failures other than an invalid token
    /// - Database hiccups
    ///
    /// ## Non-Retryable Errors
    /// - Configuration errors
    /// - Authentication errors (the user must sign in)
    /// - Cancellation
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Partial(_) | SyncError::DatabaseError(_) => true,
            SyncError::Fetch(err) => !matches!(err, FetchError::Authentication(_)),
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Per-record results, if the pass got that far.
    pub fn results(&self) -> Option<&SyncResults> {
        match self {
            SyncError::Partial(results) => Some(results),
            _ => None,
        }
    }
}
