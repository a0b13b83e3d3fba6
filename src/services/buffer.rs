//! Durable buffer — per-board append-only log in front of the archive.
//!
//! DESIGN
//! ======
//! Each board owns one stream keyed `canvas:{board_id}`. Entries get a
//! monotonically increasing id at append time and are read back oldest
//! first. The sync worker drains a stream by reading it, archiving what it
//! read, and deleting exactly those ids, so entries appended during a drain
//! survive until the next tick.
//!
//! STORAGE
//! =======
//! `PgBuffer` keeps the log in Postgres: `canvas_streams` holds one row per
//! live stream key and `canvas_buffer` holds the entries. The entry table is
//! `UNLOGGED`: it is a staging area, and losing it on a database crash costs
//! at most one sync interval of strokes.
//!
//! Appends upsert the key row in the same statement as the entry insert.
//! `delete_key` locks that row before re-counting, so an append racing a key
//! delete either lands before the count (and the key survives) or waits for
//! the delete and recreates the key.

use async_trait::async_trait;
use sqlx::PgPool;

/// Key namespace shared by every board stream.
pub const STREAM_PREFIX: &str = "canvas:";

#[must_use]
pub fn stream_key(board_id: &str) -> String {
    format!("{STREAM_PREFIX}{board_id}")
}

#[must_use]
pub fn board_id_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(STREAM_PREFIX)
}

// =============================================================================
// TYPES
// =============================================================================

/// Fields stored per buffered event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedRecord {
    pub user_id: String,
    pub action: String,
    /// The raw inbound frame, verbatim.
    pub data: String,
}

/// A record together with its buffer-assigned id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferEntry {
    pub id: i64,
    pub record: BufferedRecord,
}

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("buffer database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Storage contract for the durable buffer.
#[async_trait]
pub trait BufferStore: Send + Sync {
    /// Append a record to the board's stream and return its id.
    async fn append(&self, board_id: &str, record: &BufferedRecord) -> Result<i64, BufferError>;

    /// Every entry currently in the board's stream, oldest first.
    async fn range_read(&self, board_id: &str) -> Result<Vec<BufferEntry>, BufferError>;

    /// Delete the given ids from the board's stream. Returns how many existed.
    async fn delete_by_ids(&self, board_id: &str, ids: &[i64]) -> Result<u64, BufferError>;

    async fn length(&self, board_id: &str) -> Result<u64, BufferError>;

    /// Drop the board's stream key. Entries appended after the caller saw an
    /// empty stream are kept, and so is the key. Returns whether it was dropped.
    async fn delete_key(&self, board_id: &str) -> Result<bool, BufferError>;

    /// Board ids of every stream under `STREAM_PREFIX`.
    async fn board_ids(&self) -> Result<Vec<String>, BufferError>;

    /// Remove every stream and its entries. Returns the number of streams
    /// cleared. Meant for resetting non-production environments.
    async fn clear_all(&self) -> Result<u64, BufferError>;
}

// =============================================================================
// POSTGRES
// =============================================================================

pub struct PgBuffer {
    pool: PgPool,
}

impl PgBuffer {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BufferStore for PgBuffer {
    async fn append(&self, board_id: &str, record: &BufferedRecord) -> Result<i64, BufferError> {
        let id = sqlx::query_scalar::<_, i64>(
            "WITH stream AS (
                 INSERT INTO canvas_streams (stream_key) VALUES ($1)
                 ON CONFLICT (stream_key) DO UPDATE SET last_append_at = now()
                 RETURNING stream_key
             )
             INSERT INTO canvas_buffer (stream_key, user_id, action, data)
             SELECT stream_key, $2, $3, $4 FROM stream
             RETURNING id",
        )
        .bind(stream_key(board_id))
        .bind(&record.user_id)
        .bind(&record.action)
        .bind(&record.data)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn range_read(&self, board_id: &str) -> Result<Vec<BufferEntry>, BufferError> {
        let rows = sqlx::query_as::<_, (i64, String, String, String)>(
            "SELECT id, user_id, action, data FROM canvas_buffer WHERE stream_key = $1 ORDER BY id ASC",
        )
        .bind(stream_key(board_id))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, user_id, action, data)| BufferEntry { id, record: BufferedRecord { user_id, action, data } })
            .collect())
    }

    async fn delete_by_ids(&self, board_id: &str, ids: &[i64]) -> Result<u64, BufferError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM canvas_buffer WHERE stream_key = $1 AND id = ANY($2)")
            .bind(stream_key(board_id))
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn length(&self, board_id: &str) -> Result<u64, BufferError> {
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM canvas_buffer WHERE stream_key = $1")
            .bind(stream_key(board_id))
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn delete_key(&self, board_id: &str) -> Result<bool, BufferError> {
        let key = stream_key(board_id);
        let mut tx = self.pool.begin().await?;

        // PHASE: LOCK THE KEY ROW
        // WHY: concurrent appends upsert this row and must wait behind us.
        let locked: Option<String> =
            sqlx::query_scalar("SELECT stream_key FROM canvas_streams WHERE stream_key = $1 FOR UPDATE")
                .bind(&key)
                .fetch_optional(&mut *tx)
                .await?;
        if locked.is_none() {
            tx.commit().await?;
            return Ok(false);
        }

        let remaining: i64 = sqlx::query_scalar("SELECT count(*) FROM canvas_buffer WHERE stream_key = $1")
            .bind(&key)
            .fetch_one(&mut *tx)
            .await?;
        if remaining > 0 {
            tx.commit().await?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM canvas_streams WHERE stream_key = $1")
            .bind(&key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn board_ids(&self) -> Result<Vec<String>, BufferError> {
        let keys: Vec<String> =
            sqlx::query_scalar("SELECT stream_key FROM canvas_streams WHERE stream_key LIKE $1 ORDER BY stream_key")
                .bind(format!("{STREAM_PREFIX}%"))
                .fetch_all(&self.pool)
                .await?;
        Ok(keys
            .iter()
            .filter_map(|key| board_id_from_key(key))
            .map(str::to_owned)
            .collect())
    }

    async fn clear_all(&self) -> Result<u64, BufferError> {
        let pattern = format!("{STREAM_PREFIX}%");
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM canvas_buffer WHERE stream_key LIKE $1")
            .bind(&pattern)
            .execute(&mut *tx)
            .await?;
        let streams = sqlx::query("DELETE FROM canvas_streams WHERE stream_key LIKE $1")
            .bind(&pattern)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(streams.rows_affected())
    }
}

#[cfg(test)]
#[path = "buffer_test.rs"]
mod tests;
