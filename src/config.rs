//! Command-line options and connection configuration.
//!
//! The surface mirrors the classic reorganization tools: a handful of mode
//! switches plus the usual libpq-style connection options, each of which
//! falls back to its conventional `PG*` environment variable.
//!
//! `-h` is the server host, as every PostgreSQL client expects, so the
//! automatic short help flag is disabled and `--help` is declared explicitly.

use clap::{ArgAction, Parser};

use crate::error::RefitError;

/// How the shadow table is ordered when it is materialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderMode {
    /// `ORDER BY` the table's declared cluster key (the default).
    ClusterKey,
    /// No ordering at all — physical compaction only (VACUUM FULL analogue).
    NoOrder,
    /// `ORDER BY` a user-supplied column list.
    Columns(String),
}

/// Command-line options for `pg_refit`.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "pg_refit",
    version,
    disable_help_flag = true,
    about = "Reorganizes PostgreSQL tables online, without long exclusive locks.",
    after_help = "Connection environment: PGHOST, PGPORT, PGUSER, PGDATABASE, PGPASSWORD."
)]
pub struct Options {
    /// Reorganize every connectable database.
    #[arg(short = 'a', long = "all")]
    pub all: bool,

    /// Reorganize this table only.
    #[arg(short = 't', long = "table", value_name = "TABLE")]
    pub table: Option<String>,

    /// Rewrite without any ordering (physical compaction only).
    #[arg(short = 'n', long = "no-order", conflicts_with = "order_by")]
    pub no_order: bool,

    /// Rewrite ordered by these columns instead of the cluster key.
    #[arg(short = 'o', long = "order-by", value_name = "COLUMNS")]
    pub order_by: Option<String>,

    /// Skip the final ANALYZE.
    #[arg(short = 'Z', long = "no-analyze")]
    pub no_analyze: bool,

    /// Suppress progress output.
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,

    /// Print detailed information (descriptors, phase headers) to stderr.
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Database server host or socket directory.
    #[arg(short = 'h', long = "host", value_name = "HOST", env = "PGHOST")]
    pub host: Option<String>,

    /// Database server port.
    #[arg(short = 'p', long = "port", value_name = "PORT", env = "PGPORT")]
    pub port: Option<u16>,

    /// User name to connect as.
    #[arg(short = 'U', long = "username", value_name = "USER", env = "PGUSER")]
    pub username: Option<String>,

    /// Database to reorganize (ignored with --all).
    #[arg(value_name = "DBNAME", env = "PGDATABASE")]
    pub dbname: Option<String>,

    /// Print help.
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,
}

impl Options {
    /// Resolve the ordering mode from `-n` / `-o`.
    pub fn mode(&self) -> OrderMode {
        if self.no_order {
            OrderMode::NoOrder
        } else if let Some(cols) = &self.order_by {
            OrderMode::Columns(cols.clone())
        } else {
            OrderMode::ClusterKey
        }
    }

    /// The user name to connect as, after environment fallbacks.
    pub fn effective_user(&self) -> String {
        self.username
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "postgres".to_string())
    }

    /// The database to operate on when `--all` is not given. Like libpq,
    /// an unspecified database defaults to the user name.
    pub fn database(&self) -> String {
        self.dbname.clone().unwrap_or_else(|| self.effective_user())
    }

    /// Build the connection configuration for one database.
    pub fn conn_config(&self, dbname: &str) -> tokio_postgres::Config {
        let mut cfg = tokio_postgres::Config::new();
        cfg.application_name("pg_refit");
        cfg.dbname(dbname);
        cfg.host(self.host.as_deref().unwrap_or("localhost"));
        if let Some(port) = self.port {
            cfg.port(port);
        }
        cfg.user(&self.effective_user());
        if let Ok(password) = std::env::var("PGPASSWORD") {
            cfg.password(&password);
        }
        cfg
    }

    /// Reject option combinations that clap cannot express.
    pub fn validate(&self) -> Result<(), RefitError> {
        if self.all && self.table.is_some() {
            return Err(RefitError::Usage(
                "cannot reorganize a specific table in all databases".into(),
            ));
        }
        Ok(())
    }
}
