//! Session adapter — owns one logical database session.
//!
//! The orchestrator talks to exactly one server connection at a time. This
//! module wraps a [`tokio_postgres::Client`] together with everything needed
//! to re-establish it: the connection configuration is retained so the
//! cleanup path can reconnect after a dropped session and still remove
//! transient objects.
//!
//! Two execution flavors are exposed, mirroring the two ways the driver
//! consumes results:
//! - `command` / `execute` treat any server error as fatal and convert it to
//!   [`RefitError::Server`] with the message preserved verbatim;
//! - `command_lenient` / `execute_lenient` hand the raw error back so the
//!   caller can classify the SQLSTATE and recover (extension probing, the
//!   non-blocking swap lock).
//!
//! On every (re)connect the session is hardened the same way: the search
//! path is pinned to the system catalog and chatter below WARNING is
//! silenced, so the opaque scripts from the server extension always resolve
//! identifiers the same way regardless of per-database settings.

use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Config, NoTls, Row};

use crate::error::RefitError;

/// Classification of a server error by SQLSTATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlClass {
    /// `3F000` — the schema named in the query does not exist. The probe
    /// uses this to detect databases without the extension.
    InvalidSchema,
    /// `55P03` — a `NOWAIT` lock acquisition would have had to wait.
    LockUnavailable,
    /// Anything else.
    Other,
}

/// Classify a SQLSTATE code.
pub fn classify_code(code: Option<&SqlState>) -> SqlClass {
    match code {
        Some(c) if *c == SqlState::INVALID_SCHEMA_NAME => SqlClass::InvalidSchema,
        Some(c) if *c == SqlState::LOCK_NOT_AVAILABLE => SqlClass::LockUnavailable,
        _ => SqlClass::Other,
    }
}

/// Classify a server error by its SQLSTATE.
pub fn classify(err: &tokio_postgres::Error) -> SqlClass {
    classify_code(err.code())
}

/// One logical database session.
pub struct Session {
    config: Config,
    dbname: String,
    client: Client,
    conn_task: tokio::task::JoinHandle<()>,
    server_version: i32,
}

impl Session {
    /// Connect and harden the session.
    pub async fn connect(config: Config) -> Result<Self, RefitError> {
        let dbname = config.get_dbname().unwrap_or("postgres").to_string();
        let (client, conn_task) = open(&config, &dbname).await?;

        let mut session = Session {
            config,
            dbname,
            client,
            conn_task,
            server_version: 0,
        };
        session.harden().await?;
        Ok(session)
    }

    /// Tear down the current connection and establish a fresh one.
    pub async fn reconnect(&mut self) -> Result<(), RefitError> {
        self.conn_task.abort();
        let (client, conn_task) = open(&self.config, &self.dbname).await?;
        self.client = client;
        self.conn_task = conn_task;
        self.harden().await
    }

    /// Whether the underlying connection has been lost.
    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    /// The database this session is connected to.
    pub fn dbname(&self) -> &str {
        &self.dbname
    }

    /// Server version as reported by `server_version_num` (e.g. 180001).
    pub fn server_version(&self) -> i32 {
        self.server_version
    }

    /// Run a parameterless statement over the simple-query protocol.
    /// Any failure is fatal.
    pub async fn command(&self, sql: &str) -> Result<(), RefitError> {
        self.client
            .batch_execute(sql)
            .await
            .map_err(RefitError::server)
    }

    /// Like [`Session::command`], but the raw error is handed back for
    /// SQLSTATE classification.
    pub async fn command_lenient(&self, sql: &str) -> Result<(), tokio_postgres::Error> {
        self.client.batch_execute(sql).await
    }

    /// Run a parameterized query. Any failure is fatal.
    pub async fn execute(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>, RefitError> {
        self.client
            .query(sql, params)
            .await
            .map_err(RefitError::server)
    }

    /// Like [`Session::execute`], but the raw error is handed back for
    /// SQLSTATE classification.
    pub async fn execute_lenient(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>, tokio_postgres::Error> {
        self.client.query(sql, params).await
    }

    /// Pin the search path, silence sub-warning chatter, and probe the
    /// server version. Runs after every (re)connect.
    async fn harden(&mut self) -> Result<(), RefitError> {
        self.command("SET search_path = pg_catalog, pg_temp, public")
            .await?;
        self.command("SET client_min_messages = warning").await?;

        let row = self
            .client
            .query_one("SHOW server_version_num", &[])
            .await
            .map_err(RefitError::server)?;
        let version: String = row.get(0);
        self.server_version = version.parse::<i32>().unwrap_or(0);
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.conn_task.abort();
    }
}

/// Open a connection and spawn its I/O task.
async fn open(
    config: &Config,
    dbname: &str,
) -> Result<(Client, tokio::task::JoinHandle<()>), RefitError> {
    let (client, connection) = config.connect(NoTls).await.map_err(|e| RefitError::Connect {
        dbname: dbname.to_string(),
        message: e.to_string(),
    })?;

    let task = tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!("connection task ended: {e}");
        }
    });

    Ok((client, task))
}
