//! Error types for pg_refit.
//!
//! Every failure the orchestrator can observe is represented by [`RefitError`].
//! Errors are propagated via `Result<T, RefitError>` throughout the crate and
//! rendered once, at the binary's top level.
//!
//! # Error Classification
//!
//! Errors are classified into four categories that determine control flow:
//! - **Skip** — the `refit` extension is not installed in the current
//!   database. Under `--all` the database is skipped; for a single named
//!   database this is fatal.
//! - **Reject** — the target table cannot be reorganized (no primary key, no
//!   cluster key in cluster mode, conflicting user trigger). The run aborts
//!   after dropping any transient objects already created.
//! - **Usage** — the command line asked for something contradictory. Nothing
//!   has touched the server yet.
//! - **Fatal** — any other server or connection failure. The server's message
//!   is preserved verbatim, transient objects are dropped, and the process
//!   exits non-zero.
//!
//! Lock-not-available during the swap phase is *not* an error kind: it is
//! classified at the session layer ([`crate::session::SqlClass`]) and consumed
//! by the swap retry loop before it ever becomes a `RefitError`.

use std::fmt;

/// Primary error type for the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum RefitError {
    // ── Skip — extension missing ─────────────────────────────────────────
    /// The `refit.tables` metadata view does not exist (SQLSTATE 3F000).
    #[error("refit extension is not installed in this database")]
    ExtensionAbsent,

    // ── Reject — this table cannot be reorganized ────────────────────────
    /// The target table has no primary key.
    #[error("relation \"{0}\" has no primary key")]
    NoPrimaryKey(String),

    /// Cluster mode was requested but the target declares no cluster key.
    #[error("relation \"{0}\" has no cluster key")]
    NoClusterKey(String),

    /// A user trigger would fire after the row-capture trigger.
    #[error("trigger \"{trigger}\" conflicts with the reorganization trigger on \"{table}\"")]
    TriggerConflict { trigger: String, table: String },

    // ── Usage — contradictory command line ───────────────────────────────
    /// Invalid option combination.
    #[error("{0}")]
    Usage(String),

    // ── Fatal — everything else surfaces ─────────────────────────────────
    /// A server-side error, message preserved verbatim.
    #[error("{0}")]
    Server(String),

    /// The connection could not be established or was lost.
    #[error("could not connect to database \"{dbname}\": {message}")]
    Connect { dbname: String, message: String },
}

/// Classification of an error for control-flow decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Skip,
    Reject,
    Usage,
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Skip => write!(f, "SKIP"),
            ErrorKind::Reject => write!(f, "REJECT"),
            ErrorKind::Usage => write!(f, "USAGE"),
            ErrorKind::Fatal => write!(f, "FATAL"),
        }
    }
}

impl RefitError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RefitError::ExtensionAbsent => ErrorKind::Skip,

            RefitError::NoPrimaryKey(_)
            | RefitError::NoClusterKey(_)
            | RefitError::TriggerConflict { .. } => ErrorKind::Reject,

            RefitError::Usage(_) => ErrorKind::Usage,

            RefitError::Server(_) | RefitError::Connect { .. } => ErrorKind::Fatal,
        }
    }

    /// Build a [`RefitError::Server`] from a driver error, keeping the
    /// server's own message when one is available.
    pub fn server(err: tokio_postgres::Error) -> Self {
        match err.as_db_error() {
            Some(db) => RefitError::Server(db.to_string()),
            None => RefitError::Server(err.to_string()),
        }
    }
}

impl From<tokio_postgres::Error> for RefitError {
    fn from(err: tokio_postgres::Error) -> Self {
        RefitError::server(err)
    }
}
