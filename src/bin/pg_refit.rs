//! `pg_refit` — reorganize PostgreSQL tables online.

use std::process::ExitCode;

use clap::Parser;

use pg_refit::cleanup::{self, CurrentTable};
use pg_refit::config::Options;
use pg_refit::dispatch;
use pg_refit::error::RefitError;
use pg_refit::PROGRAM_NAME;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let opts = Options::parse();
    init_tracing(&opts);

    if let Err(e) = opts.validate() {
        eprintln!("{PROGRAM_NAME}: {e}");
        return ExitCode::FAILURE;
    }

    let current = CurrentTable::new();

    // A signal is the fatal path: the graceful drop may itself be unsafe
    // while the condition that raised it is in flight, so print the
    // manual-intervention notice and stop.
    let result = tokio::select! {
        result = run(&opts, &current) => result,
        _ = shutdown_signal() => {
            cleanup::fatal_notice(&current);
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{PROGRAM_NAME}: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(opts: &Options, current: &CurrentTable) -> Result<(), RefitError> {
    if opts.all {
        dispatch::run_all(opts, current).await
    } else {
        let dbname = opts.database();
        if dispatch::run_one(opts, &dbname, current).await? {
            Ok(())
        } else {
            // A single named database without the extension is an error,
            // unlike the skip under --all.
            Err(RefitError::ExtensionAbsent)
        }
    }
}

fn init_tracing(opts: &Options) {
    let default_filter = if opts.verbose {
        "pg_refit=debug"
    } else if opts.quiet {
        "pg_refit=error"
    } else {
        "pg_refit=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
