//! Partial sync: a small, recent slice of each table first, the rest in the
//! background.
//!
//! The slice is `floor(count * percentage)` capped by the table's row cap,
//! where `count` is the local row count or, for an empty local table, the
//! remote one. Slices never advance checkpoints, so the background pull that
//! follows fetches everything since the last full pull and the table ends up
//! complete whichever finishes first.

use futures_util::future::join_all;

use crate::local_db::RecordQuery;
use crate::shared::error::SyncError;
use crate::sync::pull::{PullEngine, PullOptions, PullOutcome, PullStatus};

/// Rows fetched by the first slice of a table
pub fn slice_size(row_cap: usize, count: u64, percentage: f64) -> usize {
    let slice = (count as f64 * percentage).floor() as usize;
    slice.min(row_cap)
}

impl PullEngine {
    /// Pull a recent slice of every table, then start a background pull that
    /// completes them.
    ///
    /// `percentage` is a fraction in `(0, 1]`.
    pub async fn partial_sync(
        &self,
        tables: &[String],
        percentage: f64,
    ) -> Result<Vec<PullOutcome>, SyncError> {
        if !(percentage > 0.0 && percentage <= 1.0) {
            return Err(SyncError::validation(
                "<partial_sync>",
                "percentage",
                format!("{} is not in (0, 1]", percentage),
            ));
        }

        let slices = join_all(tables.iter().map(|table| self.pull_slice(table, percentage))).await;
        let mut outcomes = Vec::with_capacity(slices.len());
        for slice in slices {
            outcomes.push(slice?);
        }

        self.background_sync(tables.to_vec());
        Ok(outcomes)
    }

    async fn pull_slice(&self, table: &str, percentage: f64) -> Result<PullOutcome, SyncError> {
        let ctx = self.context();
        let policy = ctx
            .config
            .table(table)
            .ok_or_else(|| SyncError::validation(table, "<table>", "table is not syncable"))?;

        let local = ctx.store.count(table, &RecordQuery::all()).await?;
        let count = if local > 0 {
            local
        } else {
            ctx.backend.count(table, &ctx.config.tenant_id).await?
        };
        let limit = slice_size(policy.row_cap, count, percentage);
        tracing::info!(
            "[Pull] Partial sync of {}: {} of {} rows",
            table,
            limit,
            count
        );

        if limit == 0 {
            return Ok(PullOutcome {
                table: table.to_string(),
                status: PullStatus::Completed,
                fetched: 0,
                stats: Default::default(),
                checkpoint: None,
            });
        }

        self.pull_table(
            table,
            PullOptions {
                limit: Some(limit),
                ..PullOptions::default()
            },
        )
        .await
    }

    /// Start a full incremental pull of `tables` on a tracked task.
    ///
    /// Waits for any in-progress pull of the same table and never uses the
    /// fast-import path.
    pub fn background_sync(&self, tables: Vec<String>) {
        let engine = self.clone();
        self.spawn_tracked(async move {
            let pulls = tables.iter().map(|table| {
                engine.pull_table(
                    table,
                    PullOptions {
                        wait_for_lock: true,
                        ..PullOptions::default()
                    },
                )
            });
            for (table, result) in tables.iter().zip(join_all(pulls).await) {
                match result {
                    Ok(outcome) => tracing::info!(
                        "[Pull] Background sync of {} finished: {} fetched, {} written",
                        table,
                        outcome.fetched,
                        outcome.stats.written()
                    ),
                    Err(e) => tracing::error!("[Pull] Background sync of {} failed: {}", table, e),
                }
            }
        });
    }
}
