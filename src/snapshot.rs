//! Snapshot waiter — detects when pre-copy transactions have drained.
//!
//! The copy phase materializes the shadow table under a serializable
//! snapshot. Transactions that were already running at that moment may
//! still commit changes the trigger never saw, so catch-up must not end
//! while any of them is alive. The token captured here is the set of
//! concurrent transaction identifiers observed in `pg_locks`; its only
//! operation is asking the server whether any member still holds its lock.
//!
//! Servers since 8.3 expose lightweight virtual transaction identifiers;
//! older servers only take `transactionid` locks once a real xid is
//! assigned. Both variants are normalized to text arrays on the server so
//! the token is one type on the client, and the branching stays inside
//! this module — the driver is version-agnostic.

use crate::error::RefitError;
use crate::session::Session;

/// Lowest server version with `virtualxid` lock entries.
const VIRTUAL_XID_VERSION: i32 = 80300;

const SNAPSHOT_VIRTUAL: &str = "SELECT refit.array_accum(virtualtransaction) FROM pg_locks \
     WHERE locktype = 'virtualxid' AND pid <> pg_backend_pid()";
const SNAPSHOT_XID: &str = "SELECT refit.array_accum(transactionid::text) FROM pg_locks \
     WHERE locktype = 'transactionid' AND pid <> pg_backend_pid()";

const ALIVE_VIRTUAL: &str = "SELECT 1 FROM pg_locks WHERE locktype = 'virtualxid' \
     AND pid <> pg_backend_pid() AND virtualtransaction = ANY($1) LIMIT 1";
const ALIVE_XID: &str = "SELECT 1 FROM pg_locks WHERE locktype = 'transactionid' \
     AND pid <> pg_backend_pid() AND transactionid::text = ANY($1) LIMIT 1";

fn snapshot_sql(server_version: i32) -> &'static str {
    if server_version >= VIRTUAL_XID_VERSION {
        SNAPSHOT_VIRTUAL
    } else {
        SNAPSHOT_XID
    }
}

fn alive_sql(server_version: i32) -> &'static str {
    if server_version >= VIRTUAL_XID_VERSION {
        ALIVE_VIRTUAL
    } else {
        ALIVE_XID
    }
}

/// The set of transactions concurrent with the copy snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotToken {
    xids: Vec<String>,
}

impl SnapshotToken {
    pub fn is_empty(&self) -> bool {
        self.xids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.xids.len()
    }
}

/// Record the concurrent transactions visible right now.
///
/// Must run inside the copy phase's serializable transaction, before any
/// write, so the token and the shadow snapshot describe the same instant.
pub async fn capture(session: &Session) -> Result<SnapshotToken, RefitError> {
    let rows = session
        .execute(snapshot_sql(session.server_version()), &[])
        .await?;
    let xids: Vec<String> = rows
        .first()
        .and_then(|row| row.get::<_, Option<Vec<String>>>(0))
        .unwrap_or_default();
    Ok(SnapshotToken { xids })
}

/// Whether any transaction recorded in the token is still running.
/// A single indexed probe of `pg_locks`.
pub async fn any_alive(session: &Session, token: &SnapshotToken) -> Result<bool, RefitError> {
    if token.is_empty() {
        return Ok(false);
    }
    let rows = session
        .execute(alive_sql(session.server_version()), &[&token.xids])
        .await?;
    Ok(!rows.is_empty())
}
