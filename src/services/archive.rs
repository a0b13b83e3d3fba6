//! Archive store — permanent, per-board event history.
//!
//! DESIGN
//! ======
//! The sync worker moves buffered records here in batches. A batch is one
//! transaction: either every row commits or none does, so a failed insert
//! leaves the caller free to retry the same batch later.
//!
//! Rows remember the buffer id they came from. A unique
//! `(board_id, buffer_id)` index with `ON CONFLICT DO NOTHING` makes a
//! re-archived batch (crash between commit and buffer delete) a no-op.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};
use time::OffsetDateTime;

/// Rows per INSERT statement. Five binds per row keeps each statement well
/// under the Postgres limit of 65535 parameters.
const INSERT_CHUNK_ROWS: usize = 1000;

// =============================================================================
// TYPES
// =============================================================================

/// A row to be archived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewArchivedEvent {
    pub board_id: String,
    pub user_id: String,
    pub action: String,
    /// Raw JSON frame.
    pub data: String,
    /// Buffer entry this row was migrated from.
    pub buffer_id: Option<i64>,
}

/// An archived row as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedEvent {
    pub id: i64,
    pub board_id: String,
    pub user_id: String,
    pub action: String,
    pub data: String,
    pub buffer_id: Option<i64>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("archive database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Insert every event or none. Returns the number of new rows; rows
    /// already archived under the same buffer id are skipped.
    async fn batch_insert(&self, events: &[NewArchivedEvent]) -> Result<u64, ArchiveError>;

    /// All rows for a board, oldest first.
    async fn query_by_board(&self, board_id: &str) -> Result<Vec<ArchivedEvent>, ArchiveError>;
}

// =============================================================================
// POSTGRES
// =============================================================================

pub struct PgArchive {
    pool: PgPool,
}

impl PgArchive {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ArchiveStore for PgArchive {
    async fn batch_insert(&self, events: &[NewArchivedEvent]) -> Result<u64, ArchiveError> {
        if events.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for chunk in events.chunks(INSERT_CHUNK_ROWS) {
            let mut builder: QueryBuilder<'_, Postgres> =
                QueryBuilder::new("INSERT INTO canvas_events (board_id, user_id, action, data, buffer_id) ");
            builder.push_values(chunk, |mut row, event| {
                row.push_bind(&event.board_id)
                    .push_bind(&event.user_id)
                    .push_bind(&event.action)
                    .push_bind(&event.data)
                    .push_unseparated("::json")
                    .push_bind(event.buffer_id);
            });
            builder.push(" ON CONFLICT (board_id, buffer_id) DO NOTHING");
            inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn query_by_board(&self, board_id: &str) -> Result<Vec<ArchivedEvent>, ArchiveError> {
        let rows = sqlx::query_as::<_, (i64, String, String, String, String, Option<i64>, OffsetDateTime)>(
            "SELECT id, board_id, user_id, action, data::text, buffer_id, created_at
             FROM canvas_events
             WHERE board_id = $1
             ORDER BY created_at ASC, id ASC",
        )
        .bind(board_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, board_id, user_id, action, data, buffer_id, created_at)| ArchivedEvent {
                id,
                board_id,
                user_id,
                action,
                data,
                buffer_id,
                created_at,
            })
            .collect())
    }
}

#[cfg(test)]
#[path = "archive_test.rs"]
mod tests;
