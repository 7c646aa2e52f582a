//! # harmony-db: Bookkeeping Store for Harmony
//!
//! This crate keeps the engine's shadow state: one managed record per
//! synced object, with its local and remote halves, stored in SQLite via
//! sqlx. Domain objects themselves live behind the [`ObjectStore`] trait.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Harmony Data Flow                                │
//! │                                                                         │
//! │  harmony-sync operations                                               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     harmony-db (THIS CRATE)                     │   │
//! │  │                                                                 │   │
//! │  │   ┌────────────────┐   ┌───────────────┐   ┌────────────────┐  │   │
//! │  │   │RecordController│   │ RecordContext │   │  Repositories  │  │   │
//! │  │   │ seed, pending  │──►│ unit of work  │──►│ records, state │  │   │
//! │  │   │ updates, reset │   │ Record façade │   │                │  │   │
//! │  │   └────────────────┘   └───────┬───────┘   └───────┬────────┘  │   │
//! │  │                                │                   │           │   │
//! │  │                        ObjectStore trait      Database (pool)  │   │
//! │  └────────────────────────────────┼───────────────────┼───────────┘   │
//! │                                   ▼                   ▼               │
//! │                          application objects    SQLite (WAL)          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Opening the database and its repositories
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - SQL for records and engine state
//! - [`store`] - The object store seam
//! - [`context`] - Units of work over records and objects
//! - [`record`] - The record façade
//! - [`controller`] - Entry point: seeding, local changes, conflicts
//!
//! ## Usage
//!
//! ```rust,ignore
//! use harmony_db::{Database, DbConfig, MemoryObjectStore, RecordController};
//!
//! let db = Database::new(DbConfig::new("harmony.db")).await?;
//! let controller = RecordController::new(db, Arc::new(MemoryObjectStore::new()));
//!
//! controller.seed().await?;
//! let uploads = controller.fetch_records(RecordPredicate::Upload).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod context;
pub mod controller;
pub mod error;
pub mod migrations;
pub mod pool;
pub mod record;
pub mod repository;
pub mod store;

// =============================================================================
// Re-exports
// =============================================================================

pub use context::RecordContext;
pub use controller::RecordController;
pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};
pub use record::Record;
pub use store::{MemoryObjectStore, ObjectChanges, ObjectStore};

// Repository re-exports for convenience
pub use repository::records::RecordRepository;
pub use repository::state::StateRepository;
