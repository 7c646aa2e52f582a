//! # Identity & Value Types
//!
//! Immutable value types shared by every layer of the sync engine.
//!
//! ## Type Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Value Types                                     │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    RecordID     │   │     Version     │   │      File       │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  record_type    │   │  identifier     │   │  identifier     │       │
//! │  │  identifier     │   │  date           │   │  local_path     │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │   RemoteFile    │   │     Account     │   │  RecordStatus   │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  identifier     │   │  name           │   │  Normal         │       │
//! │  │  remote_id      │   │  email_address  │   │  Updated        │       │
//! │  │  version_id     │   │                 │   │  Deleted        │       │
//! │  │  size, hash     │   └─────────────────┘   └─────────────────┘       │
//! │  └─────────────────┘                                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Dual-Key Identity Pattern
//! A synced entity is addressed two ways:
//! - `RecordID`: the natural key (type + primary key), identical on every device
//! - remote identifier: whatever opaque key the backend assigned to its copy

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Free-form key/value metadata attached to remote records.
pub type Metadata = HashMap<String, String>;

// =============================================================================
// Record ID
// =============================================================================

/// Composite natural key identifying a syncable entity across local and
/// remote stores.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordID {
    /// Entity type name (e.g. "Game").
    pub record_type: String,

    /// Primary key value of the entity.
    pub identifier: String,
}

impl RecordID {
    /// Creates a record ID from a type name and primary key.
    pub fn new(record_type: impl Into<String>, identifier: impl Into<String>) -> Self {
        RecordID {
            record_type: record_type.into(),
            identifier: identifier.into(),
        }
    }
}

impl fmt::Display for RecordID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.record_type, self.identifier)
    }
}

// =============================================================================
// Version
// =============================================================================

/// Immutable snapshot marker for a remote record's history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub identifier: String,
    pub date: DateTime<Utc>,
}

impl Version {
    pub fn new(identifier: impl Into<String>, date: DateTime<Utc>) -> Self {
        Version {
            identifier: identifier.into(),
            date,
        }
    }
}

// =============================================================================
// Files
// =============================================================================

/// A named file owned by a record (save file, artwork, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct File {
    /// Stable identifier of the file within its record.
    pub identifier: String,

    /// Location of the file on local disk.
    pub local_path: PathBuf,
}

impl File {
    pub fn new(identifier: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        File {
            identifier: identifier.into(),
            local_path: local_path.into(),
        }
    }
}

/// A file as known by the remote backend.
///
/// Local records keep the set of remote files they expect to exist so that
/// deletion can remove them and uploads can skip unchanged content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteFile {
    /// Identifier of the owning `File` within its record.
    pub identifier: String,

    /// Backend-assigned identifier.
    pub remote_identifier: String,

    /// Backend version of the file contents.
    pub version_identifier: String,

    /// Size in bytes.
    pub size: i64,

    /// Hex-encoded content hash of the uploaded bytes.
    pub content_hash: String,
}

// =============================================================================
// Account
// =============================================================================

/// An authenticated user of a remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub name: String,

    #[serde(default)]
    pub email_address: Option<String>,
}

impl Account {
    pub fn new(name: impl Into<String>) -> Self {
        Account {
            name: name.into(),
            email_address: None,
        }
    }
}

// =============================================================================
// Change Token
// =============================================================================

/// Opaque cursor enabling incremental remote fetches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeToken(pub Vec<u8>);

impl ChangeToken {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for ChangeToken {
    fn from(bytes: Vec<u8>) -> Self {
        ChangeToken(bytes)
    }
}

// =============================================================================
// Record Status
// =============================================================================

/// Sync status of one side (local or remote) of a managed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// In sync with the last known state of the other side.
    #[default]
    Normal,

    /// Changed since the last sync.
    Updated,

    /// Deleted since the last sync.
    Deleted,
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordStatus::Normal => write!(f, "normal"),
            RecordStatus::Updated => write!(f, "updated"),
            RecordStatus::Deleted => write!(f, "deleted"),
        }
    }
}

// =============================================================================
// Conflict Resolution
// =============================================================================

/// Policy a syncable object chooses when both sides changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Flag the record and wait for an external decision.
    #[default]
    Conflict,

    /// Keep the local copy (upload it).
    Local,

    /// Keep the remote copy (download it).
    Remote,

    /// Keep whichever side changed most recently.
    Newest,

    /// Keep whichever side changed least recently.
    Oldest,
}

/// Outcome of applying a [`ConflictResolution`] to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictAction {
    Upload,
    Download,
    Conflict,
}

impl ConflictResolution {
    /// Decides what to do with a record whose local and remote sides both
    /// exist.
    ///
    /// ## Tie Handling
    /// `Newest` and `Oldest` use strict comparisons, so equal dates fall
    /// through to `Download` under both policies.
    ///
    /// ```text
    /// policy   local > remote   local == remote   local < remote
    /// ───────  ──────────────   ───────────────   ──────────────
    /// Newest   Upload           Download          Download
    /// Oldest   Download         Download          Upload
    /// ```
    pub fn action(
        self,
        local_modification_date: DateTime<Utc>,
        remote_version_date: DateTime<Utc>,
    ) -> ConflictAction {
        match self {
            ConflictResolution::Conflict => ConflictAction::Conflict,
            ConflictResolution::Local => ConflictAction::Upload,
            ConflictResolution::Remote => ConflictAction::Download,
            ConflictResolution::Newest => {
                if local_modification_date > remote_version_date {
                    ConflictAction::Upload
                } else {
                    ConflictAction::Download
                }
            }
            ConflictResolution::Oldest => {
                if local_modification_date < remote_version_date {
                    ConflictAction::Upload
                } else {
                    ConflictAction::Download
                }
            }
        }
    }
}

// =============================================================================
// Metadata Keys
// =============================================================================

/// Reserved remote metadata keys written and read by the engine.
///
/// Keys share the `harmony_` prefix so they can be stripped from the
/// user-visible metadata of a remote record.
pub mod metadata_keys {
    pub const PREFIX: &str = "harmony_";

    pub const RECORDED_OBJECT_TYPE: &str = "harmony_recordedObjectType";
    pub const RECORDED_OBJECT_IDENTIFIER: &str = "harmony_recordedObjectIdentifier";
    pub const RELATIONSHIP_IDENTIFIER: &str = "harmony_relationshipIdentifier";
    pub const IS_LOCKED: &str = "harmony_locked";
    pub const PREVIOUS_VERSION_IDENTIFIER: &str = "harmony_previousVersionIdentifier";
    pub const PREVIOUS_VERSION_DATE: &str = "harmony_previousVersionDate";
    pub const CONTENT_HASH: &str = "harmony_sha1Hash";
    pub const AUTHOR: &str = "harmony_author";
    pub const LOCALIZED_NAME: &str = "harmony_localizedName";

    /// Returns true if `key` is reserved for engine bookkeeping.
    pub fn is_reserved(key: &str) -> bool {
        key.starts_with(PREFIX)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
