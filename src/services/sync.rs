//! Sync worker — periodic migration from the durable buffer to the archive.
//!
//! DESIGN
//! ======
//! A background task wakes every `SYNC_INTERVAL` and drains each board
//! stream in turn: read the whole stream, archive the archival entries in
//! one transaction, then delete exactly the ids it archived. Entries that
//! arrive mid-drain have ids the worker never read, so they stay for the
//! next tick. An emptied stream has its key dropped.
//!
//! ERROR HANDLING
//! ==============
//! A failed read or archive insert aborts only that board's cycle and leaves
//! its buffer untouched; the next tick retries. A failed delete after a
//! committed insert is harmless: the archive skips rows whose buffer id it
//! already holds.

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::event::is_archival_action;
use crate::services::archive::{ArchiveError, ArchiveStore, NewArchivedEvent};
use crate::services::buffer::{BufferError, BufferStore};
use crate::state::AppState;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

/// Outcome of one tick across every board.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub boards: usize,
    pub archived: u64,
    pub failed: usize,
}

/// Spawn the background sync task. Returns a handle for shutdown.
pub fn spawn_sync_worker(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(state.config.sync_interval);
        // The first tick completes immediately; consume it so the first
        // drain happens one full interval after startup.
        interval.tick().await;

        info!(interval = ?state.config.sync_interval, "sync: worker started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = sync_all_boards(&state).await;
                    if report.archived > 0 || report.failed > 0 {
                        info!(boards = report.boards, archived = report.archived, failed = report.failed, "sync: tick complete");
                    }
                }
                () = state.shutdown.wait() => break,
            }
        }
        info!("sync: worker stopped");
    })
}

/// Drain every board stream once.
pub async fn sync_all_boards(state: &AppState) -> SyncReport {
    let board_ids = match state.buffer.board_ids().await {
        Ok(ids) => ids,
        Err(e) => {
            error!(error = %e, "sync: failed to list buffer streams");
            return SyncReport { failed: 1, ..SyncReport::default() };
        }
    };

    let mut report = SyncReport { boards: board_ids.len(), ..SyncReport::default() };
    for board_id in &board_ids {
        match sync_board(state.buffer.as_ref(), state.archive.as_ref(), board_id).await {
            Ok(archived) => report.archived += archived,
            Err(e) => {
                report.failed += 1;
                error!(%board_id, error = %e, "sync: board cycle aborted, buffer kept");
            }
        }
    }
    report
}

/// Drain one board stream. Returns the number of rows newly archived.
pub async fn sync_board(buffer: &dyn BufferStore, archive: &dyn ArchiveStore, board_id: &str) -> Result<u64, SyncError> {
    let entries = buffer.range_read(board_id).await?;
    if entries.is_empty() {
        drop_key_if_empty(buffer, board_id).await;
        return Ok(0);
    }

    // PHASE: SELECT ARCHIVAL ENTRIES
    // WHY: only allow-listed actions should ever be buffered, but anything
    // else found here is left alone rather than archived.
    let (ids, rows): (Vec<i64>, Vec<NewArchivedEvent>) = entries
        .into_iter()
        .filter(|entry| is_archival_action(&entry.record.action))
        .map(|entry| {
            let row = NewArchivedEvent {
                board_id: board_id.to_owned(),
                user_id: entry.record.user_id,
                action: entry.record.action,
                data: entry.record.data,
                buffer_id: Some(entry.id),
            };
            (entry.id, row)
        })
        .unzip();
    if rows.is_empty() {
        return Ok(0);
    }

    // PHASE: ARCHIVE
    let archived = archive.batch_insert(&rows).await?;

    // PHASE: DELETE WHAT WAS ARCHIVED
    // WHY: deleting by id, not by range, keeps entries appended mid-drain.
    match buffer.delete_by_ids(board_id, &ids).await {
        Ok(deleted) => debug!(%board_id, archived, deleted, "sync: board drained"),
        Err(e) => {
            warn!(%board_id, error = %e, "sync: delete after archive failed, retrying next tick");
            return Ok(archived);
        }
    }

    drop_key_if_empty(buffer, board_id).await;
    Ok(archived)
}

async fn drop_key_if_empty(buffer: &dyn BufferStore, board_id: &str) {
    match buffer.length(board_id).await {
        Ok(0) => {
            if let Err(e) = buffer.delete_key(board_id).await {
                warn!(%board_id, error = %e, "sync: failed to drop empty stream key");
            }
        }
        Ok(_) => {}
        Err(e) => warn!(%board_id, error = %e, "sync: failed to read stream length"),
    }
}

#[cfg(test)]
#[path = "sync_test.rs"]
mod tests;
