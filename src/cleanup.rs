//! Cleanup handler — transient objects never outlive a failed run.
//!
//! From the moment the setup transaction commits until the drop transaction
//! commits, the server holds a set of transient objects (PK type, log
//! table, row-capture trigger, shadow table). The driver registers the
//! table under reorganization in a [`CurrentTable`] cell shared with the
//! exit paths; whoever observes a failure afterwards calls
//! [`drop_transients`].
//!
//! Two exit paths, with very different powers:
//! - **graceful** — a caught error. The session is rolled back, reconnected
//!   if it broke, and `refit.refit_drop` removes everything the run
//!   created. The server-side drop encodes the reverse creation order
//!   (trigger before log, log before type).
//! - **fatal** — a signal. No further server I/O is attempted; a
//!   manual-intervention notice tells the operator what remains.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::session::Session;

/// The table currently being reorganized, if any.
///
/// Written only by the driver: registered after the setup transaction
/// commits (so cleanup never drops objects that were never created) and
/// cleared after the drop transaction commits. OID zero means idle.
#[derive(Debug, Clone, Default)]
pub struct CurrentTable(Arc<AtomicU32>);

impl CurrentTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, target_oid: u32) {
        self.0.store(target_oid, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(0, Ordering::SeqCst);
    }

    pub fn get(&self) -> Option<u32> {
        match self.0.load(Ordering::SeqCst) {
            0 => None,
            oid => Some(oid),
        }
    }
}

/// Graceful path: drop the registered table's transient objects.
///
/// Best-effort by contract — a cleanup failure is reported but never
/// propagated, because the caller is already on an error path.
pub async fn drop_transients(session: &mut Session, current: &CurrentTable) {
    let Some(oid) = current.get() else { return };

    // An aborted phase may have left a transaction open.
    let _ = session.command_lenient("ROLLBACK").await;

    if session.is_closed() {
        if let Err(e) = session.reconnect().await {
            tracing::warn!("cleanup could not reconnect: {e}");
            fatal_notice(current);
            return;
        }
    }

    match session
        .execute("SELECT refit.refit_drop($1)", &[&oid])
        .await
    {
        Ok(_) => {
            tracing::debug!("dropped transient objects for table OID {oid}");
            current.clear();
        }
        Err(e) => {
            tracing::warn!("cleanup failed for table OID {oid}: {e}");
            fatal_notice(current);
        }
    }
}

/// Fatal path: no server I/O, just tell the operator what remains.
pub fn fatal_notice(current: &CurrentTable) {
    if let Some(oid) = current.get() {
        eprintln!(
            "!!!FATAL ERROR!!! transient objects for table OID {oid} may remain; \
             remove them with \"SELECT refit.refit_drop({oid})\"."
        );
    }
}
