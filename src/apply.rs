//! Log applier — drains captured DML into the shadow table.
//!
//! The row-capture trigger appends every committed mutation of the target
//! to its log table. `refit.refit_apply` replays up to `limit` log rows, in
//! log order, against the shadow: each row is re-executed as the recorded
//! operation using the five prebuilt DML fragments, then popped. The whole
//! batch is one server call, so calling this concurrently with writers is
//! safe — they only ever append.

use crate::catalog::TargetTable;
use crate::error::RefitError;
use crate::session::Session;

/// Log rows replayed per catch-up iteration.
pub const APPLY_BATCH: i32 = 1000;

/// Drain everything available in one call.
pub const APPLY_ALL: i32 = 0;

/// Replay up to `limit` log rows into the shadow table; `0` drains
/// everything available. Returns the number of rows the server applied.
pub async fn apply_log(
    session: &Session,
    table: &TargetTable,
    limit: i32,
) -> Result<i64, RefitError> {
    let rows = session
        .execute(
            "SELECT refit.refit_apply($1, $2, $3, $4, $5, $6)",
            &[
                &table.sql_peek,
                &table.sql_insert,
                &table.sql_delete,
                &table.sql_update,
                &table.sql_pop,
                &limit,
            ],
        )
        .await?;

    let applied: i32 = rows
        .first()
        .map(|row| row.get(0))
        .ok_or_else(|| RefitError::Server("refit_apply returned no result".into()))?;
    Ok(applied as i64)
}
