//! # harmony-core: Pure Record Model for Harmony
//!
//! This crate is the **heart** of the Harmony sync engine. It contains the
//! bookkeeping model and every sync decision as pure functions with zero I/O
//! dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Harmony Architecture                             │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    harmony-sync                                 │   │
//! │  │   SyncCoordinator ──► batches ──► per-record operations        │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    harmony-db                                   │   │
//! │  │   RecordController, RecordContext, Record façade, SQLite        │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │              ★ harmony-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌────────────────┐  ┌──────────┐  ┌────────┐  │   │
//! │  │   │   types   │  │     record     │  │ syncable │  │ error  │  │   │
//! │  │   │ RecordID  │  │ ManagedRecord  │  │ Syncable │  │ Record │  │   │
//! │  │   │ Version   │  │ SyncAction     │  │  trait   │  │ File   │  │   │
//! │  │   │ File      │  │ RecordPredicate│  │          │  │ Fetch  │  │   │
//! │  │   └───────────┘  └────────────────┘  └──────────┘  └────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Identity and value types (RecordID, Version, File, Account)
//! - [`record`] - LocalRecord / RemoteRecord / ManagedRecord and predicates
//! - [`syncable`] - The capability domain objects implement
//! - [`error`] - The error taxonomy
//!
//! ## Example Usage
//!
//! ```rust
//! use harmony_core::{LocalRecord, ManagedRecord, RecordID, RecordPredicate, RecordStatus};
//! use chrono::Utc;
//!
//! let record = ManagedRecord::new(RecordID::new("Game", "1"))
//!     .with_local(LocalRecord::new(RecordStatus::Updated, Utc::now()));
//!
//! // Only exists locally and has changed: it needs uploading.
//! assert!(record.matches(RecordPredicate::Upload));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod record;
pub mod syncable;
pub mod types;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{
    AuthenticationError, FetchError, FileError, GeneralError, RecordError, RecordErrorKind,
    RecordResult, ServiceError, ValidationError,
};
pub use record::{LocalRecord, ManagedRecord, RecordPredicate, RemoteRecord, SyncAction};
pub use syncable::{hash_bytes, Syncable};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Maximum number of per-record operations a batch runs at once.
///
/// ## Why 5?
/// Enough to overlap network latency across many small records without
/// overwhelming the backend or local disk.
pub const MAX_CONCURRENT_OPERATIONS: usize = 5;
