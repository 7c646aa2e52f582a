//! # State Repository
//!
//! Small key/value table for engine state that outlives a sync pass.
//!
//! ```text
//! key             value
//! ─────────────   ──────────────────────────────────────
//! change_token    opaque bytes from the last remote fetch
//! seeded          b"1" once local objects were imported
//! account         JSON of the last authenticated account
//! ```

use sqlx::SqlitePool;
use tracing::debug;

use harmony_core::{Account, ChangeToken};

use crate::error::DbResult;

const CHANGE_TOKEN: &str = "change_token";
const SEEDED: &str = "seeded";
const ACCOUNT: &str = "account";

/// Repository for persisted engine state.
#[derive(Debug, Clone)]
pub struct StateRepository {
    pool: SqlitePool,
}

impl StateRepository {
    /// Creates a new StateRepository.
    pub fn new(pool: SqlitePool) -> Self {
        StateRepository { pool }
    }

    /// Token of the last successful remote fetch, if any.
    pub async fn change_token(&self) -> DbResult<Option<ChangeToken>> {
        Ok(self.get(CHANGE_TOKEN).await?.map(ChangeToken::from))
    }

    /// Stores (or with `None`, forgets) the change token.
    pub async fn set_change_token(&self, token: Option<&ChangeToken>) -> DbResult<()> {
        match token {
            Some(token) => self.put(CHANGE_TOKEN, token.as_bytes()).await,
            None => self.remove(CHANGE_TOKEN).await,
        }
    }

    /// Whether existing local objects were already imported as records.
    pub async fn is_seeded(&self) -> DbResult<bool> {
        Ok(self.get(SEEDED).await?.is_some())
    }

    pub async fn set_seeded(&self, seeded: bool) -> DbResult<()> {
        if seeded {
            self.put(SEEDED, b"1").await
        } else {
            self.remove(SEEDED).await
        }
    }

    /// Last authenticated account, cached so a restart needn't re-prompt.
    pub async fn account(&self) -> DbResult<Option<Account>> {
        match self.get(ACCOUNT).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn set_account(&self, account: Option<&Account>) -> DbResult<()> {
        match account {
            Some(account) => self.put(ACCOUNT, &serde_json::to_vec(account)?).await,
            None => self.remove(ACCOUNT).await,
        }
    }

    /// Removes every stored state value.
    pub async fn clear(&self) -> DbResult<()> {
        sqlx::query("DELETE FROM harmony_state")
            .execute(&self.pool)
            .await?;
        debug!("Cleared engine state");
        Ok(())
    }

    async fn get(&self, key: &str) -> DbResult<Option<Vec<u8>>> {
        let value: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT value FROM harmony_state WHERE key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: &[u8]) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO harmony_state (key, value) VALUES (?1, ?2) \
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        debug!(key, "Stored engine state");
        Ok(())
    }

    async fn remove(&self, key: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM harmony_state WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
