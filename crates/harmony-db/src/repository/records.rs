//! # Record Repository
//!
//! Persistence for managed records and their local/remote halves.
//!
//! ## Table Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    One Managed Record, Four Tables                      │
//! │                                                                         │
//! │  managed_records (record_type, identifier)                             │
//! │       │  is_conflicted, is_syncing_enabled                             │
//! │       │                                                                 │
//! │       ├──► local_records   (0..1)  status, modification_date, version  │
//! │       │         │                                                       │
//! │       │         └──► remote_files (0..n)  per-file remote version      │
//! │       │                                                                 │
//! │       └──► remote_records  (0..1)  remote_identifier, version, lock,   │
//! │                                    author, metadata JSON               │
//! │                                                                         │
//! │  Deleting the managed row cascades to every child row.                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Reads go through the pool. Writes take a `&mut SqliteConnection` so a
//! context save can put every record of a batch into one transaction.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::debug;

use harmony_core::{
    LocalRecord, ManagedRecord, Metadata, RecordID, RecordStatus, RemoteFile, RemoteRecord,
    Version,
};

use crate::error::DbResult;

/// Narrows a load to a single record.
const BY_RECORD_ID: &str = " WHERE record_type = ?1 AND identifier = ?2";

/// Repository for managed record bookkeeping.
///
/// ## Usage
/// ```rust,ignore
/// let repo = db.records();
///
/// let all = repo.fetch_all().await?;
/// let one = repo.fetch(&RecordID::new("Game", "1")).await?;
///
/// let mut tx = db.pool().begin().await?;
/// RecordRepository::upsert(&mut tx, &record).await?;
/// tx.commit().await?;
/// ```
#[derive(Debug, Clone)]
pub struct RecordRepository {
    pool: SqlitePool,
}

impl RecordRepository {
    /// Creates a new RecordRepository.
    pub fn new(pool: SqlitePool) -> Self {
        RecordRepository { pool }
    }

    /// Loads every managed record, ordered by record id.
    pub async fn fetch_all(&self) -> DbResult<Vec<ManagedRecord>> {
        let records = self.load(None).await?;
        debug!(count = records.len(), "Fetched managed records");
        Ok(records)
    }

    /// Loads one managed record with both halves, if it exists.
    pub async fn fetch(&self, record_id: &RecordID) -> DbResult<Option<ManagedRecord>> {
        Ok(self.load(Some(record_id)).await?.into_iter().next())
    }

    /// Finds the managed record whose remote half has the given backend
    /// identifier. Used to match tombstones from an incremental fetch.
    pub async fn fetch_by_remote_identifier(
        &self,
        remote_identifier: &str,
    ) -> DbResult<Option<ManagedRecord>> {
        let row = sqlx::query(
            "SELECT record_type, identifier FROM remote_records WHERE remote_identifier = ?1",
        )
        .bind(remote_identifier)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let record_id = RecordID::new(
                    row.try_get::<String, _>("record_type")?,
                    row.try_get::<String, _>("identifier")?,
                );
                self.fetch(&record_id).await
            }
            None => Ok(None),
        }
    }

    /// Number of managed records.
    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM managed_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Inserts or replaces a managed record and both of its halves.
    ///
    /// A missing half deletes the corresponding row, so a record that lost
    /// its remote side (tombstone) is written back without it.
    pub async fn upsert(conn: &mut SqliteConnection, record: &ManagedRecord) -> DbResult<()> {
        let RecordID {
            record_type,
            identifier,
        } = &record.record_id;

        sqlx::query(
            r#"
            INSERT INTO managed_records (record_type, identifier, is_conflicted, is_syncing_enabled)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (record_type, identifier) DO UPDATE SET
                is_conflicted = excluded.is_conflicted,
                is_syncing_enabled = excluded.is_syncing_enabled
            "#,
        )
        .bind(record_type)
        .bind(identifier)
        .bind(record.is_conflicted)
        .bind(record.is_syncing_enabled)
        .execute(&mut *conn)
        .await?;

        match &record.local {
            Some(local) => Self::upsert_local(conn, &record.record_id, local).await?,
            None => {
                sqlx::query(&format!("DELETE FROM local_records{BY_RECORD_ID}"))
                    .bind(record_type)
                    .bind(identifier)
                    .execute(&mut *conn)
                    .await?;
            }
        }

        match &record.remote {
            Some(remote) => Self::upsert_remote(conn, &record.record_id, remote).await?,
            None => {
                sqlx::query(&format!("DELETE FROM remote_records{BY_RECORD_ID}"))
                    .bind(record_type)
                    .bind(identifier)
                    .execute(&mut *conn)
                    .await?;
            }
        }

        debug!(record = %record.record_id, "Upserted managed record");
        Ok(())
    }

    /// Deletes a managed record; child rows cascade.
    pub async fn delete(conn: &mut SqliteConnection, record_id: &RecordID) -> DbResult<()> {
        sqlx::query(&format!("DELETE FROM managed_records{BY_RECORD_ID}"))
            .bind(&record_id.record_type)
            .bind(&record_id.identifier)
            .execute(&mut *conn)
            .await?;

        debug!(record = %record_id, "Deleted managed record");
        Ok(())
    }

    /// Deletes every managed record.
    pub async fn delete_all(&self) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM managed_records")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    async fn upsert_local(
        conn: &mut SqliteConnection,
        record_id: &RecordID,
        local: &LocalRecord,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO local_records (
                record_type, identifier, status, modification_date,
                version_identifier, version_date, content_hash
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (record_type, identifier) DO UPDATE SET
                status = excluded.status,
                modification_date = excluded.modification_date,
                version_identifier = excluded.version_identifier,
                version_date = excluded.version_date,
                content_hash = excluded.content_hash
            "#,
        )
        .bind(&record_id.record_type)
        .bind(&record_id.identifier)
        .bind(local.status)
        .bind(local.modification_date)
        .bind(local.version.as_ref().map(|v| v.identifier.as_str()))
        .bind(local.version.as_ref().map(|v| v.date))
        .bind(local.content_hash.as_deref())
        .execute(&mut *conn)
        .await?;

        // Remote files are replaced wholesale: the set is small and the
        // local half always carries the complete list.
        sqlx::query(&format!("DELETE FROM remote_files{BY_RECORD_ID}"))
            .bind(&record_id.record_type)
            .bind(&record_id.identifier)
            .execute(&mut *conn)
            .await?;

        for file in &local.remote_files {
            sqlx::query(
                r#"
                INSERT INTO remote_files (
                    record_type, identifier, file_identifier, remote_identifier,
                    version_identifier, size, content_hash
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(&record_id.record_type)
            .bind(&record_id.identifier)
            .bind(&file.identifier)
            .bind(&file.remote_identifier)
            .bind(&file.version_identifier)
            .bind(file.size)
            .bind(&file.content_hash)
            .execute(&mut *conn)
            .await?;
        }

        Ok(())
    }

    async fn upsert_remote(
        conn: &mut SqliteConnection,
        record_id: &RecordID,
        remote: &RemoteRecord,
    ) -> DbResult<()> {
        let metadata = serde_json::to_string(&remote.metadata)?;

        sqlx::query(
            r#"
            INSERT INTO remote_records (
                record_type, identifier, remote_identifier, status,
                version_identifier, version_date,
                previous_version_identifier, previous_version_date,
                is_locked, author, localized_name, metadata, content_hash
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT (record_type, identifier) DO UPDATE SET
                remote_identifier = excluded.remote_identifier,
                status = excluded.status,
                version_identifier = excluded.version_identifier,
                version_date = excluded.version_date,
                previous_version_identifier = excluded.previous_version_identifier,
                previous_version_date = excluded.previous_version_date,
                is_locked = excluded.is_locked,
                author = excluded.author,
                localized_name = excluded.localized_name,
                metadata = excluded.metadata,
                content_hash = excluded.content_hash
            "#,
        )
        .bind(&record_id.record_type)
        .bind(&record_id.identifier)
        .bind(&remote.identifier)
        .bind(remote.status)
        .bind(&remote.version.identifier)
        .bind(remote.version.date)
        .bind(
            remote
                .previous_unlocked_version
                .as_ref()
                .map(|v| v.identifier.as_str()),
        )
        .bind(remote.previous_unlocked_version.as_ref().map(|v| v.date))
        .bind(remote.is_locked)
        .bind(remote.author.as_deref())
        .bind(remote.localized_name.as_deref())
        .bind(metadata)
        .bind(remote.content_hash.as_deref())
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Loads managed records and stitches their child rows together.
    async fn load(&self, filter: Option<&RecordID>) -> DbResult<Vec<ManagedRecord>> {
        let clause = if filter.is_some() { BY_RECORD_ID } else { "" };

        let managed_sql = format!(
            "SELECT record_type, identifier, is_conflicted, is_syncing_enabled \
             FROM managed_records{clause} ORDER BY record_type, identifier"
        );
        let local_sql = format!("SELECT * FROM local_records{clause}");
        let remote_sql = format!("SELECT * FROM remote_records{clause}");
        let files_sql = format!("SELECT * FROM remote_files{clause} ORDER BY file_identifier");

        let managed_rows = self.rows(&managed_sql, filter).await?;
        let local_rows = self.rows(&local_sql, filter).await?;
        let remote_rows = self.rows(&remote_sql, filter).await?;
        let file_rows = self.rows(&files_sql, filter).await?;

        let mut files: HashMap<RecordID, Vec<RemoteFile>> = HashMap::new();
        for row in &file_rows {
            files
                .entry(row_record_id(row)?)
                .or_default()
                .push(remote_file_from_row(row)?);
        }

        let mut locals: HashMap<RecordID, LocalRecord> = HashMap::new();
        for row in &local_rows {
            let record_id = row_record_id(row)?;
            let mut local = local_from_row(row)?;
            local.remote_files = files.remove(&record_id).unwrap_or_default();
            locals.insert(record_id, local);
        }

        let mut remotes: HashMap<RecordID, RemoteRecord> = HashMap::new();
        for row in &remote_rows {
            let record_id = row_record_id(row)?;
            let remote = remote_from_row(row, record_id.clone())?;
            remotes.insert(record_id, remote);
        }

        let mut records = Vec::with_capacity(managed_rows.len());
        for row in &managed_rows {
            let record_id = row_record_id(row)?;
            let mut record = ManagedRecord::new(record_id.clone());
            record.is_conflicted = row.try_get("is_conflicted")?;
            record.is_syncing_enabled = row.try_get("is_syncing_enabled")?;
            record.local = locals.remove(&record_id);
            record.remote = remotes.remove(&record_id);
            records.push(record);
        }

        Ok(records)
    }

    async fn rows(&self, sql: &str, filter: Option<&RecordID>) -> DbResult<Vec<SqliteRow>> {
        let mut query = sqlx::query(sql);
        if let Some(record_id) = filter {
            query = query
                .bind(&record_id.record_type)
                .bind(&record_id.identifier);
        }
        Ok(query.fetch_all(&self.pool).await?)
    }
}

// =============================================================================
// Row Mapping
// =============================================================================

fn row_record_id(row: &SqliteRow) -> DbResult<RecordID> {
    Ok(RecordID::new(
        row.try_get::<String, _>("record_type")?,
        row.try_get::<String, _>("identifier")?,
    ))
}

fn optional_version(
    identifier: Option<String>,
    date: Option<DateTime<Utc>>,
) -> Option<Version> {
    match (identifier, date) {
        (Some(identifier), Some(date)) => Some(Version::new(identifier, date)),
        _ => None,
    }
}

fn local_from_row(row: &SqliteRow) -> DbResult<LocalRecord> {
    let status: RecordStatus = row.try_get("status")?;
    let modification_date: DateTime<Utc> = row.try_get("modification_date")?;

    let mut local = LocalRecord::new(status, modification_date);
    local.version = optional_version(
        row.try_get("version_identifier")?,
        row.try_get("version_date")?,
    );
    local.content_hash = row.try_get("content_hash")?;
    Ok(local)
}

fn remote_from_row(row: &SqliteRow, record_id: RecordID) -> DbResult<RemoteRecord> {
    let version = Version::new(
        row.try_get::<String, _>("version_identifier")?,
        row.try_get::<DateTime<Utc>, _>("version_date")?,
    );
    let metadata: Metadata = serde_json::from_str(&row.try_get::<String, _>("metadata")?)?;

    let mut remote = RemoteRecord::new(
        row.try_get::<String, _>("remote_identifier")?,
        record_id,
        version,
    );
    remote.status = row.try_get("status")?;
    remote.previous_unlocked_version = optional_version(
        row.try_get("previous_version_identifier")?,
        row.try_get("previous_version_date")?,
    );
    remote.is_locked = row.try_get("is_locked")?;
    remote.author = row.try_get("author")?;
    remote.localized_name = row.try_get("localized_name")?;
    remote.metadata = metadata;
    remote.content_hash = row.try_get("content_hash")?;
    Ok(remote)
}

fn remote_file_from_row(row: &SqliteRow) -> DbResult<RemoteFile> {
    Ok(RemoteFile {
        identifier: row.try_get("file_identifier")?,
        remote_identifier: row.try_get("remote_identifier")?,
        version_identifier: row.try_get("version_identifier")?,
        size: row.try_get("size")?,
        content_hash: row.try_get("content_hash")?,
    })
}

// =============================================================================
// Tests
// =============================================================================
