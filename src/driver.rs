//! Reorg driver — the seven-phase per-table state machine.
//!
//! Each phase is one short server-side transaction (the swap holds its
//! transaction open only for the final drain and the catalog exchange).
//! Phases advance linearly; any failure after setup moves the machine to
//! [`Phase::Aborted`], and the caller is expected to invoke
//! [`crate::cleanup::drop_transients`] before surfacing the error.
//!
//! ## Epoch boundary
//!
//! The copy phase captures the snapshot token *before* clearing the log and
//! *before* materializing the shadow, all inside one serializable
//! transaction. Rows committed before that boundary are in the shadow copy;
//! rows committed after appear in the log. Catch-up therefore terminates
//! only when (a) the log was empty at a moment of observation and (b) no
//! pre-boundary transaction can still append to it.
//!
//! ## Why the loops never give up
//!
//! Both waiting loops — catch-up and swap — are gated by external
//! transaction completion, not by contention, so they retry forever on a
//! constant 1 s backoff. Reorganization should not abandon a busy table.

use std::fmt;
use std::time::Duration;

use crate::apply::{apply_log, APPLY_ALL, APPLY_BATCH};
use crate::catalog::{target_indexes, TargetTable};
use crate::cleanup::CurrentTable;
use crate::config::{Options, OrderMode};
use crate::error::RefitError;
use crate::session::{classify, Session, SqlClass};
use crate::snapshot::{self, SnapshotToken};

/// Lowest server version with the `synchronize_seqscans` setting.
const SYNC_SEQSCAN_VERSION: i32 = 80300;

/// Per-table progress of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    SetupDone,
    CopyDone,
    IndexesDone,
    CaughtUp,
    Swapped,
    Dropped,
    Aborted,
}

impl Phase {
    /// Whether transient server objects exist in this phase.
    pub fn has_transients(self) -> bool {
        matches!(
            self,
            Phase::SetupDone
                | Phase::CopyDone
                | Phase::IndexesDone
                | Phase::CaughtUp
                | Phase::Swapped
                | Phase::Aborted
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::SetupDone => "setup_done",
            Phase::CopyDone => "copy_done",
            Phase::IndexesDone => "indexes_done",
            Phase::CaughtUp => "caught_up",
            Phase::Swapped => "swapped",
            Phase::Dropped => "dropped",
            Phase::Aborted => "aborted",
        };
        write!(f, "{name}")
    }
}

/// Drives the reorganization of one table at a time.
pub struct Reorg {
    mode: OrderMode,
    analyze: bool,
    verbose: bool,
    current: CurrentTable,
    poll_interval: Duration,
    phase: Phase,
}

impl Reorg {
    pub fn new(mode: OrderMode, current: CurrentTable) -> Self {
        Reorg {
            mode,
            analyze: true,
            verbose: false,
            current,
            poll_interval: Duration::from_secs(1),
            phase: Phase::Idle,
        }
    }

    pub fn from_options(opts: &Options, current: CurrentTable) -> Self {
        Self::new(opts.mode(), current)
            .with_analyze(!opts.no_analyze)
            .with_verbose(opts.verbose)
    }

    pub fn with_analyze(mut self, analyze: bool) -> Self {
        self.analyze = analyze;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Shorten the catch-up/swap poll interval (tests use milliseconds).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Run all seven phases for one table.
    pub async fn run(&mut self, session: &Session, table: &TargetTable) -> Result<(), RefitError> {
        tracing::debug!("---- reorganize {} (OID {}) ----", table.target_name, table.target_oid);
        tracing::debug!("descriptor: {table:#?}");

        let result = self.run_phases(session, table).await;
        if result.is_err() {
            self.phase = Phase::Aborted;
        }
        result
    }

    async fn run_phases(
        &mut self,
        session: &Session,
        table: &TargetTable,
    ) -> Result<(), RefitError> {
        self.setup(session, table).await?;
        let token = self.copy(session, table).await?;
        self.build_indexes(session, table).await?;
        self.catch_up(session, table, &token).await?;
        self.swap(session, table).await?;
        self.drop_objects(session, table).await?;
        self.analyze_target(session, table).await;
        Ok(())
    }

    /// Phase 1 — create the PK type, the log table, and the row-capture
    /// trigger, then register the table for cleanup.
    ///
    /// The trigger must be the last row trigger to fire, so any user
    /// trigger sorting after it rejects the table before anything is
    /// created. Registration happens only after the commit: cleanup must
    /// never try to drop objects that were never created.
    pub async fn setup(&mut self, session: &Session, table: &TargetTable) -> Result<(), RefitError> {
        tracing::debug!("---- setup ----");
        session.command("BEGIN ISOLATION LEVEL READ COMMITTED").await?;

        let conflicted = session
            .execute(
                "SELECT refit.conflicted_triggers($1)",
                &[&table.target_oid],
            )
            .await?;
        if let Some(row) = conflicted.first() {
            let _ = session.command_lenient("ROLLBACK").await;
            return Err(RefitError::TriggerConflict {
                trigger: row.get(0),
                table: table.target_name.clone(),
            });
        }

        // The log must exist before the trigger that writes into it.
        session.command(&table.create_pktype).await?;
        session.command(&table.create_log).await?;
        session.command(&table.create_trigger).await?;
        session
            .command(&format!(
                "SELECT refit.disable_autovacuum('refit.log_{}')",
                table.target_oid
            ))
            .await?;
        session.command("COMMIT").await?;

        self.current.register(table.target_oid);
        self.phase = Phase::SetupDone;
        Ok(())
    }

    /// Phase 2 — materialize the shadow table under a serializable
    /// snapshot, capturing the concurrent-transaction token first.
    ///
    /// The capture-then-truncate-then-copy order inside one transaction is
    /// the epoch boundary everything else relies on.
    pub async fn copy(
        &mut self,
        session: &Session,
        table: &TargetTable,
    ) -> Result<SnapshotToken, RefitError> {
        tracing::debug!("---- copy ----");
        session.command("BEGIN ISOLATION LEVEL SERIALIZABLE").await?;
        session
            .command("SELECT set_config('work_mem', current_setting('maintenance_work_mem'), true)")
            .await?;
        if session.server_version() >= SYNC_SEQSCAN_VERSION && self.mode == OrderMode::NoOrder {
            // A synchronized scan could start mid-heap and defeat the compaction.
            session.command("SET LOCAL synchronize_seqscans = off").await?;
        }

        let token = snapshot::capture(session).await?;
        tracing::debug!("snapshot captured: {} concurrent transaction(s)", token.len());

        session.command(&table.delete_log).await?;
        session.command(&table.create_table).await?;
        session
            .command(&format!(
                "SELECT refit.disable_autovacuum('refit.table_{}')",
                table.target_oid
            ))
            .await?;
        session.command("COMMIT").await?;

        self.phase = Phase::CopyDone;
        Ok(token)
    }

    /// Phase 3 — rebuild every index of the target against the shadow.
    /// Serial by design: parallel builds would need one session each.
    pub async fn build_indexes(
        &mut self,
        session: &Session,
        table: &TargetTable,
    ) -> Result<(), RefitError> {
        tracing::debug!("---- create indexes ----");
        for index in target_indexes(session, table.target_oid).await? {
            tracing::debug!("index OID {}: {}", index.index_oid, index.create_index);
            session.command(&index.create_index).await?;
        }
        self.phase = Phase::IndexesDone;
        Ok(())
    }

    /// Phase 4 — drain the log until it is empty *and* every pre-boundary
    /// transaction has finished.
    pub async fn catch_up(
        &mut self,
        session: &Session,
        table: &TargetTable,
        token: &SnapshotToken,
    ) -> Result<(), RefitError> {
        tracing::debug!("---- catch up ----");
        loop {
            let applied = apply_log(session, table, APPLY_BATCH).await?;
            if applied > 0 {
                // More may be pending, and more may have arrived meanwhile.
                continue;
            }

            if !snapshot::any_alive(session, token).await? {
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        self.phase = Phase::CaughtUp;
        Ok(())
    }

    /// Phase 5 — take the exclusive lock without waiting, retrying on a
    /// constant backoff, then drain the last log rows and exchange the
    /// storage while still holding the lock.
    pub async fn swap(&mut self, session: &Session, table: &TargetTable) -> Result<(), RefitError> {
        tracing::debug!("---- swap ----");
        loop {
            session.command("BEGIN ISOLATION LEVEL READ COMMITTED").await?;
            match session.command_lenient(&table.lock_table).await {
                Ok(()) => break,
                Err(e) if classify(&e) == SqlClass::LockUnavailable => {
                    session.command("ROLLBACK").await?;
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(e) => return Err(RefitError::server(e)),
            }
        }

        // No writer can enter now, so this returns quickly.
        apply_log(session, table, APPLY_ALL).await?;
        session
            .execute("SELECT refit.refit_swap($1)", &[&table.target_oid])
            .await?;
        session.command("COMMIT").await?;

        self.phase = Phase::Swapped;
        Ok(())
    }

    /// Phase 6 — remove all transient objects and release the
    /// registration.
    pub async fn drop_objects(
        &mut self,
        session: &Session,
        table: &TargetTable,
    ) -> Result<(), RefitError> {
        tracing::debug!("---- drop ----");
        session.command("BEGIN ISOLATION LEVEL READ COMMITTED").await?;
        session
            .execute("SELECT refit.refit_drop($1)", &[&table.target_oid])
            .await?;
        session.command("COMMIT").await?;

        self.current.clear();
        self.phase = Phase::Dropped;
        Ok(())
    }

    /// Phase 7 — best-effort ANALYZE. The reorganization has already
    /// succeeded and the registration is cleared, so a failure here is
    /// reported and swallowed.
    pub async fn analyze_target(&mut self, session: &Session, table: &TargetTable) {
        if !self.analyze {
            return;
        }
        tracing::debug!("---- analyze ----");
        let sql = format!(
            "ANALYZE {}{}",
            if self.verbose { "VERBOSE " } else { "" },
            table.target_name
        );

        let result = async {
            session.command_lenient("BEGIN ISOLATION LEVEL READ COMMITTED").await?;
            session.command_lenient(&sql).await?;
            session.command_lenient("COMMIT").await
        }
        .await;

        if let Err(e) = result {
            tracing::warn!("ANALYZE of {} failed: {e}", table.target_name);
            let _ = session.command_lenient("ROLLBACK").await;
        }
    }
}
