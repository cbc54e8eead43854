//! Catalog probe — typed descriptors from the server extension's metadata.
//!
//! The server-resident `refit` schema exposes a `tables` view that returns,
//! per candidate table, every OID the swap needs plus a bundle of prebuilt
//! DDL/DML scripts. The client treats those scripts as opaque; the single
//! edit it ever performs is appending the `ORDER BY` suffix to the
//! shadow-table creation statement, which happens here at decode time.

use tokio_postgres::Row;

use crate::config::OrderMode;
use crate::error::RefitError;
use crate::session::{classify, Session, SqlClass};

/// Everything the driver needs to reorganize one table.
///
/// One row of `refit.tables`, decoded. `create_table` is already finished
/// for the requested mode (base statement plus `ORDER BY` suffix where one
/// applies).
#[derive(Debug, Clone)]
pub struct TargetTable {
    pub target_name: String,
    pub target_oid: u32,
    pub target_toast: u32,
    pub target_tidx: u32,
    pub pkid: u32,
    pub ckid: u32,
    pub create_pktype: String,
    pub create_log: String,
    pub create_trigger: String,
    pub create_table: String,
    pub delete_log: String,
    pub lock_table: String,
    pub sql_peek: String,
    pub sql_insert: String,
    pub sql_delete: String,
    pub sql_update: String,
    pub sql_pop: String,
}

/// One index of the target, with its CREATE INDEX statement rewritten
/// against the shadow table by `refit.refit_indexdef`.
#[derive(Debug, Clone)]
pub struct TargetIndex {
    pub index_oid: u32,
    pub create_index: String,
}

/// Finish the shadow-table creation statement for the requested mode.
///
/// Cluster mode requires a cluster key; its absence rejects the table.
pub fn shadow_create_sql(
    base: &str,
    ckey: Option<&str>,
    mode: &OrderMode,
    relname: &str,
) -> Result<String, RefitError> {
    match mode {
        OrderMode::ClusterKey => match ckey {
            Some(key) => Ok(format!("{base} ORDER BY {key}")),
            None => Err(RefitError::NoClusterKey(relname.to_string())),
        },
        OrderMode::NoOrder => Ok(base.to_string()),
        OrderMode::Columns(cols) => Ok(format!("{base} ORDER BY {cols}")),
    }
}

impl TargetTable {
    fn from_row(row: &Row, mode: &OrderMode) -> Result<Self, RefitError> {
        let target_name: String = row.try_get("relname")?;
        let target_oid: u32 = row.try_get("relid")?;
        let pkid: u32 = row.try_get::<_, Option<u32>>("pkid")?.unwrap_or(0);
        if pkid == 0 {
            return Err(RefitError::NoPrimaryKey(target_name));
        }

        let base: String = row.try_get("create_table")?;
        let ckey: Option<String> = row.try_get("ckey")?;
        let create_table = shadow_create_sql(&base, ckey.as_deref(), mode, &target_name)?;

        Ok(TargetTable {
            target_oid,
            target_toast: row.try_get::<_, Option<u32>>("reltoastrelid")?.unwrap_or(0),
            target_tidx: row.try_get::<_, Option<u32>>("reltoastidxid")?.unwrap_or(0),
            pkid,
            ckid: row.try_get::<_, Option<u32>>("ckid")?.unwrap_or(0),
            create_pktype: row.try_get("create_pktype")?,
            create_log: row.try_get("create_log")?,
            create_trigger: row.try_get("create_trigger")?,
            create_table,
            delete_log: row.try_get("delete_log")?,
            lock_table: row.try_get("lock_table")?,
            sql_peek: row.try_get("sql_peek")?,
            sql_insert: row.try_get("sql_insert")?,
            sql_delete: row.try_get("sql_delete")?,
            sql_update: row.try_get("sql_update")?,
            sql_pop: row.try_get("sql_pop")?,
            target_name,
        })
    }
}

/// Connectable databases, in name order.
pub async fn list_databases(session: &Session) -> Result<Vec<String>, RefitError> {
    let rows = session
        .execute(
            "SELECT datname FROM pg_database WHERE datallowconn ORDER BY 1",
            &[],
        )
        .await?;
    Ok(rows.iter().map(|r| r.get(0)).collect())
}

/// Query the extension's metadata view for target tables.
///
/// With a `selector`, only that relation is considered (and a missing
/// primary key is reported as a reject). Without one, the view is filtered
/// to tables with a primary key — and, in cluster mode, a cluster key too.
///
/// Returns [`RefitError::ExtensionAbsent`] when the `refit` schema does not
/// exist in this database.
pub async fn target_tables(
    session: &Session,
    selector: Option<&str>,
    mode: &OrderMode,
) -> Result<Vec<TargetTable>, RefitError> {
    let result = match selector {
        Some(table) => {
            session
                .execute_lenient(
                    "SELECT * FROM refit.tables WHERE relid = $1::regclass",
                    &[&table],
                )
                .await
        }
        None => {
            let sql = match mode {
                OrderMode::ClusterKey => {
                    "SELECT * FROM refit.tables WHERE pkid IS NOT NULL AND ckid IS NOT NULL"
                }
                _ => "SELECT * FROM refit.tables WHERE pkid IS NOT NULL",
            };
            session.execute_lenient(sql, &[]).await
        }
    };

    let rows = match result {
        Ok(rows) => rows,
        Err(e) if classify(&e) == SqlClass::InvalidSchema => {
            return Err(RefitError::ExtensionAbsent);
        }
        Err(e) => return Err(RefitError::server(e)),
    };

    rows.iter().map(|row| TargetTable::from_row(row, mode)).collect()
}

/// The target's indexes, each with its shadow-side CREATE INDEX statement.
/// Queried fresh so indexes added since the descriptor was fetched are
/// still rebuilt.
pub async fn target_indexes(
    session: &Session,
    target_oid: u32,
) -> Result<Vec<TargetIndex>, RefitError> {
    let rows = session
        .execute(
            "SELECT indexrelid, refit.refit_indexdef(indexrelid, indrelid) \
             FROM pg_index WHERE indrelid = $1",
            &[&target_oid],
        )
        .await?;

    rows.iter()
        .map(|row| {
            Ok(TargetIndex {
                index_oid: row.try_get(0)?,
                create_index: row.try_get(1)?,
            })
        })
        .collect()
}
