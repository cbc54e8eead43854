//! Multi-database dispatcher.
//!
//! `--all` enumerates connectable databases through the administrative
//! database and reorganizes each in turn. Databases without the `refit`
//! extension are skipped, not failed: installing the extension everywhere
//! is not a precondition for running the tool cluster-wide.

use std::io::Write;

use crate::catalog;
use crate::cleanup::{self, CurrentTable};
use crate::config::Options;
use crate::driver::Reorg;
use crate::error::RefitError;
use crate::session::Session;

/// Reorganize every candidate table of one connected database.
///
/// Returns `Ok(false)` when the extension is absent (the caller decides
/// whether that means "skip" or "fail"). On any per-table failure the
/// transient objects are dropped before the error surfaces.
pub async fn run_database(
    session: &mut Session,
    opts: &Options,
    current: &CurrentTable,
) -> Result<bool, RefitError> {
    let mode = opts.mode();
    let tables = match catalog::target_tables(session, opts.table.as_deref(), &mode).await {
        Ok(tables) => tables,
        Err(RefitError::ExtensionAbsent) => return Ok(false),
        // Probe/decode failures happen before setup, so there is nothing
        // to clean up yet.
        Err(e) => return Err(e),
    };

    tracing::debug!(
        "database \"{}\": {} candidate table(s)",
        session.dbname(),
        tables.len()
    );

    for table in &tables {
        let mut driver = Reorg::from_options(opts, current.clone());
        if let Err(e) = driver.run(session, table).await {
            cleanup::drop_transients(session, current).await;
            return Err(e);
        }
    }
    Ok(true)
}

/// Connect to one database and reorganize it.
pub async fn run_one(
    opts: &Options,
    dbname: &str,
    current: &CurrentTable,
) -> Result<bool, RefitError> {
    let mut session = Session::connect(opts.conn_config(dbname)).await?;
    run_database(&mut session, opts, current).await
}

/// Reorganize every connectable database in the cluster.
pub async fn run_all(opts: &Options, current: &CurrentTable) -> Result<(), RefitError> {
    if opts.table.is_some() {
        return Err(RefitError::Usage(
            "cannot reorganize a specific table in all databases".into(),
        ));
    }

    let databases = {
        let admin = Session::connect(opts.conn_config("postgres")).await?;
        catalog::list_databases(&admin).await?
    };

    for dbname in databases {
        if !opts.quiet {
            print!("{}: refit database \"{dbname}\"", crate::PROGRAM_NAME);
            let _ = std::io::stdout().flush();
        }

        let done = run_one(opts, &dbname, current).await?;

        if !opts.quiet {
            if done {
                println!();
            } else {
                println!(" ... skipped");
            }
        }
    }
    Ok(())
}
