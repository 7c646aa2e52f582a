//! # Repository Module
//!
//! SQL access for the bookkeeping store.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Who Talks to SQLite                                  │
//! │                                                                         │
//! │  RecordContext::save ──► one transaction                               │
//! │       │                    RecordRepository::upsert / delete           │
//! │       │                                                                 │
//! │  RecordController ──► db.records().fetch_all()                         │
//! │                   └─► db.state().change_token()                        │
//! │                                                                         │
//! │  Nothing above this module writes SQL.                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`records::RecordRepository`] - Managed/local/remote record rows
//! - [`state::StateRepository`] - Change token, seeded flag, cached account

pub mod records;
pub mod state;
