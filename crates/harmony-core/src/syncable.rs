//! # Syncable Capability
//!
//! The contract a domain object implements to take part in sync.
//!
//! ## What the Engine Asks of an Object
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Syncable                                                               │
//! │                                                                         │
//! │  identity         syncable_type() + primary_key()  → RecordID          │
//! │  change detection syncable_keys() / syncable_value(key) → content_hash │
//! │  graph            syncable_relationships()  key → RecordID             │
//! │  attachments      syncable_files()                                      │
//! │  remote metadata  syncable_metadata(), localized_name()                │
//! │  policy           is_syncing_enabled(), resolve_conflict(record)       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Objects are shared as `Arc<dyn Syncable>`; the engine never mutates them.
//! New versions of an object (downloads) are produced by the `Service` and
//! handed to the object store as whole replacements.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::record::ManagedRecord;
use crate::types::{ConflictResolution, File, Metadata, RecordID};

/// A domain object that can be synchronised.
pub trait Syncable: fmt::Debug + Send + Sync {
    /// Entity type name, stable across devices.
    fn syncable_type(&self) -> &str;

    /// Primary key value. Must not change for the lifetime of the object.
    fn primary_key(&self) -> Option<&str>;

    /// Field names considered for change detection.
    fn syncable_keys(&self) -> Vec<String>;

    /// Current value of a syncable field.
    fn syncable_value(&self, key: &str) -> Option<Value>;

    /// Related objects, keyed by relationship name.
    fn syncable_relationships(&self) -> BTreeMap<String, RecordID> {
        BTreeMap::new()
    }

    /// Files owned by this object.
    fn syncable_files(&self) -> Vec<File> {
        Vec::new()
    }

    /// Extra metadata to store alongside the remote record.
    fn syncable_metadata(&self) -> Metadata {
        Metadata::new()
    }

    /// Human-readable name shown in conflict and error listings.
    fn localized_name(&self) -> Option<String> {
        None
    }

    fn is_syncing_enabled(&self) -> bool {
        true
    }

    /// Chooses how to settle a record changed on both sides.
    fn resolve_conflict(&self, _record: &ManagedRecord) -> ConflictResolution {
        ConflictResolution::Conflict
    }

    /// Natural key of this object, if it has a primary key.
    fn record_id(&self) -> Option<RecordID> {
        self.primary_key()
            .map(|key| RecordID::new(self.syncable_type(), key))
    }

    /// Hex-encoded SHA-256 over the sorted syncable values and relationships.
    ///
    /// Equal hashes mean nothing the remote side cares about has changed.
    fn content_hash(&self) -> String {
        let values: BTreeMap<String, Value> = self
            .syncable_keys()
            .into_iter()
            .map(|key| {
                let value = self.syncable_value(&key).unwrap_or(Value::Null);
                (key, value)
            })
            .collect();

        let relationships: BTreeMap<String, String> = self
            .syncable_relationships()
            .into_iter()
            .map(|(key, id)| (key, id.to_string()))
            .collect();

        let mut hasher = Sha256::new();
        hasher.update(self.syncable_type().as_bytes());
        hasher.update(Value::Object(values.into_iter().collect()).to_string());
        for (key, id) in relationships {
            hasher.update(key.as_bytes());
            hasher.update(id.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Hex-encoded SHA-256 of raw bytes (file contents).
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Game {
        id: String,
        name: String,
        plays: i64,
    }

    impl Syncable for Game {
        fn syncable_type(&self) -> &str {
            "Game"
        }

        fn primary_key(&self) -> Option<&str> {
            Some(&self.id)
        }

        fn syncable_keys(&self) -> Vec<String> {
            vec!["name".into(), "plays".into()]
        }

        fn syncable_value(&self, key: &str) -> Option<Value> {
            match key {
                "name" => Some(Value::from(self.name.clone())),
                "plays" => Some(Value::from(self.plays)),
                _ => None,
            }
        }
    }

    fn game(plays: i64) -> Game {
        Game {
            id: "1".into(),
            name: "Zelda".into(),
            plays,
        }
    }

    #[test]
    fn test_record_id_from_primary_key() {
        assert_eq!(game(0).record_id(), Some(RecordID::new("Game", "1")));
    }

    #[test]
    fn test_content_hash_tracks_values() {
        assert_eq!(game(1).content_hash(), game(1).content_hash());
        assert_ne!(game(1).content_hash(), game(2).content_hash());
    }

    #[test]
    fn test_default_policy_is_conflict() {
        let record = ManagedRecord::new(RecordID::new("Game", "1"));
        assert_eq!(game(0).resolve_conflict(&record), ConflictResolution::Conflict);
        assert!(game(0).is_syncing_enabled());
    }

    #[test]
    fn test_hash_bytes() {
        assert_eq!(
            hash_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
