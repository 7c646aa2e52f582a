//! # Record Bookkeeping Model
//!
//! The engine's own shadow state for every synced entity.
//!
//! ## Structure
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        ManagedRecord                                    │
//! │  record_id: RecordID          is_conflicted      is_syncing_enabled    │
//! │                                                                         │
//! │   ┌──────────────────────────┐      ┌──────────────────────────────┐   │
//! │   │ LocalRecord (optional)   │      │ RemoteRecord (optional)      │   │
//! │   │  status                  │      │  status                      │   │
//! │   │  modification_date       │      │  identifier (backend key)    │   │
//! │   │  version (last synced)   │      │  version, author, metadata   │   │
//! │   │  remote_files            │      │  is_locked                   │   │
//! │   │  content_hash            │      │  content_hash                │   │
//! │   └──────────────────────────┘      └──────────────────────────────┘   │
//! │                                                                         │
//! │  Missing local  → exists only remotely (download candidate)            │
//! │  Missing remote → exists only locally (upload candidate)               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Sync Action Table
//! ```text
//! local \ remote   normal     updated    deleted    none
//! ──────────────   ────────   ────────   ────────   ────────
//! normal           none       download   delete     upload
//! updated          upload     conflict   upload     upload
//! deleted          delete     download   delete     delete
//! none             download   download   delete     delete
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::types::{metadata_keys, Metadata, RecordID, RecordStatus, RemoteFile, Version};

// =============================================================================
// Local Record
// =============================================================================

/// Local half of a managed record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRecord {
    pub status: RecordStatus,

    /// When the recorded object last changed locally.
    pub modification_date: DateTime<Utc>,

    /// Remote version this local copy was last synced with.
    pub version: Option<Version>,

    /// Remote files the local copy expects to exist.
    pub remote_files: Vec<RemoteFile>,

    /// Content hash of the recorded object at the last change.
    pub content_hash: Option<String>,
}

impl LocalRecord {
    pub fn new(status: RecordStatus, modification_date: DateTime<Utc>) -> Self {
        LocalRecord {
            status,
            modification_date,
            version: None,
            remote_files: Vec::new(),
            content_hash: None,
        }
    }

    /// Returns the known remote file with the given file identifier.
    pub fn remote_file(&self, identifier: &str) -> Option<&RemoteFile> {
        self.remote_files.iter().find(|f| f.identifier == identifier)
    }
}

// =============================================================================
// Remote Record
// =============================================================================

/// Remote half of a managed record, as reported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Backend-assigned identifier of the stored record.
    pub identifier: String,

    /// Natural key of the recorded object.
    pub record_id: RecordID,

    pub status: RecordStatus,

    /// Current version.
    pub version: Version,

    /// Most recent version that was not locked, if any.
    pub previous_unlocked_version: Option<Version>,

    /// Locked records are mid-upload on another device.
    pub is_locked: bool,

    pub author: Option<String>,

    pub localized_name: Option<String>,

    /// User-visible metadata (reserved `harmony_` keys removed).
    pub metadata: Metadata,

    /// Content hash the uploader recorded.
    pub content_hash: Option<String>,
}

impl RemoteRecord {
    pub fn new(identifier: impl Into<String>, record_id: RecordID, version: Version) -> Self {
        RemoteRecord {
            identifier: identifier.into(),
            record_id,
            status: RecordStatus::Updated,
            version,
            previous_unlocked_version: None,
            is_locked: false,
            author: None,
            localized_name: None,
            metadata: Metadata::new(),
            content_hash: None,
        }
    }

    /// Builds a remote record from backend metadata.
    ///
    /// The recorded object type and identifier keys are required; the other
    /// reserved keys are optional. Reserved keys are stripped from
    /// [`RemoteRecord::metadata`].
    ///
    /// ## Errors
    /// `ValidationError::InvalidMetadata` if the recorded object keys are
    /// missing.
    pub fn from_metadata(
        identifier: impl Into<String>,
        version: Version,
        metadata: &Metadata,
    ) -> Result<Self, ValidationError> {
        let record_type = metadata
            .get(metadata_keys::RECORDED_OBJECT_TYPE)
            .ok_or_else(|| ValidationError::InvalidMetadata("missing recorded object type".into()))?;
        let record_identifier = metadata
            .get(metadata_keys::RECORDED_OBJECT_IDENTIFIER)
            .ok_or_else(|| {
                ValidationError::InvalidMetadata("missing recorded object identifier".into())
            })?;

        let mut record = RemoteRecord::new(
            identifier,
            RecordID::new(record_type.clone(), record_identifier.clone()),
            version,
        );
        record.is_locked = metadata.get(metadata_keys::IS_LOCKED).map(String::as_str) == Some("true");
        record.previous_unlocked_version = previous_version(metadata);
        record.author = metadata.get(metadata_keys::AUTHOR).cloned();
        record.localized_name = metadata.get(metadata_keys::LOCALIZED_NAME).cloned();
        record.content_hash = metadata.get(metadata_keys::CONTENT_HASH).cloned();
        record.metadata = metadata
            .iter()
            .filter(|(key, _)| !metadata_keys::is_reserved(key))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(record)
    }
}

/// The last unlocked version an uploader recorded, when both keys parse.
fn previous_version(metadata: &Metadata) -> Option<Version> {
    let identifier = metadata.get(metadata_keys::PREVIOUS_VERSION_IDENTIFIER)?;
    let date = metadata.get(metadata_keys::PREVIOUS_VERSION_DATE)?;
    let date = DateTime::parse_from_rfc3339(date).ok()?;
    Some(Version::new(identifier.clone(), date.with_timezone(&Utc)))
}

// =============================================================================
// Sync Action
// =============================================================================

/// What a sync pass should do with a record, derived from both statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    None,
    Upload,
    Download,
    Delete,
    Conflict,
}

impl SyncAction {
    /// Looks up the action for a `(local, remote)` status pair.
    pub fn new(local: Option<RecordStatus>, remote: Option<RecordStatus>) -> Self {
        use RecordStatus::{Deleted, Normal, Updated};

        match (local, remote) {
            (Some(Normal), Some(Normal)) => SyncAction::None,
            (Some(Normal), Some(Updated)) => SyncAction::Download,
            (Some(Normal), Some(Deleted)) => SyncAction::Delete,
            (Some(Normal), None) => SyncAction::Upload,

            (Some(Updated), Some(Normal)) => SyncAction::Upload,
            (Some(Updated), Some(Updated)) => SyncAction::Conflict,
            (Some(Updated), Some(Deleted)) => SyncAction::Upload,
            (Some(Updated), None) => SyncAction::Upload,

            (Some(Deleted), Some(Normal)) => SyncAction::Delete,
            (Some(Deleted), Some(Updated)) => SyncAction::Download,
            (Some(Deleted), Some(Deleted)) => SyncAction::Delete,
            (Some(Deleted), None) => SyncAction::Delete,

            (None, Some(Normal)) => SyncAction::Download,
            (None, Some(Updated)) => SyncAction::Download,
            (None, Some(Deleted)) => SyncAction::Delete,
            (None, None) => SyncAction::Delete,
        }
    }
}

// =============================================================================
// Record Predicate
// =============================================================================

/// Named record filters used to select the records of each sync stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordPredicate {
    /// Every managed record.
    All,

    /// Not conflicted and syncing enabled.
    Syncable,

    /// Flagged as conflicted.
    Conflicted,

    /// Needs a conflict decision.
    Conflict,

    Upload,
    Download,
    Delete,
}

// =============================================================================
// Managed Record
// =============================================================================

/// Bookkeeping row owning the local and remote halves of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedRecord {
    pub record_id: RecordID,
    pub local: Option<LocalRecord>,
    pub remote: Option<RemoteRecord>,
    pub is_conflicted: bool,
    pub is_syncing_enabled: bool,
}

impl ManagedRecord {
    /// Creates an empty record; at least one side must be attached before
    /// it is saved.
    pub fn new(record_id: RecordID) -> Self {
        ManagedRecord {
            record_id,
            local: None,
            remote: None,
            is_conflicted: false,
            is_syncing_enabled: true,
        }
    }

    pub fn with_local(mut self, local: LocalRecord) -> Self {
        self.local = Some(local);
        self
    }

    pub fn with_remote(mut self, remote: RemoteRecord) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn local_status(&self) -> Option<RecordStatus> {
        self.local.as_ref().map(|l| l.status)
    }

    pub fn remote_status(&self) -> Option<RecordStatus> {
        self.remote.as_ref().map(|r| r.status)
    }

    /// Returns false once both halves are gone; such records are removed on
    /// save.
    pub fn has_records(&self) -> bool {
        self.local.is_some() || self.remote.is_some()
    }

    pub fn sync_action(&self) -> SyncAction {
        SyncAction::new(self.local_status(), self.remote_status())
    }

    pub fn is_syncable(&self) -> bool {
        !self.is_conflicted && self.is_syncing_enabled
    }

    fn local_version_identifier(&self) -> Option<&str> {
        self.local
            .as_ref()
            .and_then(|l| l.version.as_ref())
            .map(|v| v.identifier.as_str())
    }

    fn remote_version_identifier(&self) -> Option<&str> {
        self.remote.as_ref().map(|r| r.version.identifier.as_str())
    }

    fn local_hash(&self) -> Option<&str> {
        self.local.as_ref().and_then(|l| l.content_hash.as_deref())
    }

    fn remote_hash(&self) -> Option<&str> {
        self.remote.as_ref().and_then(|r| r.content_hash.as_deref())
    }

    /// Evaluates a stage predicate against this record.
    ///
    /// An upload whose local version differs from the remote version, or an
    /// in-sync pair whose content hashes disagree, also counts as a conflict:
    /// someone else changed the remote copy since we last saw it.
    pub fn matches(&self, predicate: RecordPredicate) -> bool {
        let action = self.sync_action();

        match predicate {
            RecordPredicate::All => true,
            RecordPredicate::Syncable => self.is_syncable(),
            RecordPredicate::Conflicted => self.is_conflicted,
            RecordPredicate::Upload => action == SyncAction::Upload && self.is_syncable(),
            RecordPredicate::Download => action == SyncAction::Download && self.is_syncable(),
            RecordPredicate::Delete => action == SyncAction::Delete && self.is_syncable(),
            RecordPredicate::Conflict => {
                let mismatched_versions = action == SyncAction::Upload
                    && self.local_version_identifier() != self.remote_version_identifier();
                let mismatched_hashes =
                    action == SyncAction::None && self.local_hash() != self.remote_hash();

                (action == SyncAction::Conflict || mismatched_versions || mismatched_hashes)
                    && self.is_syncable()
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
