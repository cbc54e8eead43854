//! Shared test helpers for integration tests using Testcontainers.
//!
//! `EXTENSION_DDL` is a plain-SQL rendition of the server-resident `refit`
//! extension contract (metadata view plus helper routines), so the
//! orchestrator can be driven end-to-end against a disposable PostgreSQL
//! container. The production extension implements `refit_swap` as a
//! relfilenode exchange in C; the rendition below exchanges table *content*
//! under the same access-exclusive lock, which is observationally
//! equivalent for these tests and keeps the target's OID, constraints, and
//! triggers stable across runs.

use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio_postgres::types::FromSqlOwned;
use tokio_postgres::{Client, NoTls};

use pg_refit::session::Session;

/// SQL rendition of the `refit` extension contract.
#[allow(dead_code)]
pub const EXTENSION_DDL: &str = r#"
CREATE SCHEMA refit;

CREATE AGGREGATE refit.array_accum(anycompatible) (
    SFUNC = array_append,
    STYPE = anycompatiblearray,
    INITCOND = '{}'
);

-- Key columns of an index, in key order.
CREATE FUNCTION refit.index_columns(idx oid) RETURNS text LANGUAGE sql STABLE AS $$
    SELECT string_agg(quote_ident(a.attname), ', ' ORDER BY k.ord)
    FROM pg_index i
         CROSS JOIN LATERAL unnest(i.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
         JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = k.attnum
    WHERE i.indexrelid = idx
$$;

-- "name type, name type" of the primary key, for the composite PK type.
CREATE FUNCTION refit.pk_typedef(rel oid) RETURNS text LANGUAGE sql STABLE AS $$
    SELECT string_agg(quote_ident(a.attname) || ' ' || format_type(a.atttypid, a.atttypmod),
                      ', ' ORDER BY k.ord)
    FROM pg_index i
         CROSS JOIN LATERAL unnest(i.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
         JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = k.attnum
    WHERE i.indrelid = rel AND i.indisprimary
$$;

-- Comma-separated PK column names (unquoted), passed to the trigger.
CREATE FUNCTION refit.pk_names(rel oid) RETURNS text LANGUAGE sql STABLE AS $$
    SELECT string_agg(a.attname, ',' ORDER BY k.ord)
    FROM pg_index i
         CROSS JOIN LATERAL unnest(i.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
         JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = k.attnum
    WHERE i.indrelid = rel AND i.indisprimary
$$;

-- "(pk_cols) = ((param).pk_cols)" predicate against a composite parameter.
CREATE FUNCTION refit.pk_where(rel oid, param text) RETURNS text LANGUAGE sql STABLE AS $$
    SELECT format('(%s) = (%s)',
                  string_agg(quote_ident(a.attname), ', ' ORDER BY k.ord),
                  string_agg(format('(%s).%I', param, a.attname), ', ' ORDER BY k.ord))
    FROM pg_index i
         CROSS JOIN LATERAL unnest(i.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
         JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = k.attnum
    WHERE i.indrelid = rel AND i.indisprimary
$$;

CREATE FUNCTION refit.column_list(rel oid) RETURNS text LANGUAGE sql STABLE AS $$
    SELECT string_agg(quote_ident(attname), ', ' ORDER BY attnum)
    FROM pg_attribute
    WHERE attrelid = rel AND attnum > 0 AND NOT attisdropped
$$;

CREATE FUNCTION refit.set_list(rel oid, param text) RETURNS text LANGUAGE sql STABLE AS $$
    SELECT string_agg(format('%I = (%s).%I', attname, param, attname), ', ' ORDER BY attnum)
    FROM pg_attribute
    WHERE attrelid = rel AND attnum > 0 AND NOT attisdropped
$$;

-- Per-candidate-table descriptor: OIDs plus the prebuilt script bundle.
CREATE VIEW refit.tables AS
SELECT r.oid::regclass::text AS relname,
       r.oid                 AS relid,
       r.reltoastrelid       AS reltoastrelid,
       (SELECT indexrelid FROM pg_index WHERE indrelid = r.reltoastrelid) AS reltoastidxid,
       pk.indexrelid         AS pkid,
       ck.indexrelid         AS ckid,
       'CREATE TYPE refit.pk_' || r.oid || ' AS (' || refit.pk_typedef(r.oid) || ')'
           AS create_pktype,
       'CREATE TABLE refit.log_' || r.oid ||
           ' (id bigserial PRIMARY KEY, pk refit.pk_' || r.oid ||
           ', row_data ' || r.oid::regclass || ')'
           AS create_log,
       format('CREATE TRIGGER z_refit_trigger BEFORE INSERT OR DELETE OR UPDATE ON %s'
              || ' FOR EACH ROW EXECUTE FUNCTION refit.log_change(%L, %L)',
              r.oid::regclass, r.oid::text, refit.pk_names(r.oid))
           AS create_trigger,
       'CREATE TABLE refit.table_' || r.oid || ' AS SELECT ' || refit.column_list(r.oid) ||
           ' FROM ONLY ' || r.oid::regclass
           AS create_table,
       'DELETE FROM refit.log_' || r.oid AS delete_log,
       'LOCK TABLE ' || r.oid::regclass || ' IN ACCESS EXCLUSIVE MODE NOWAIT' AS lock_table,
       CASE WHEN ck.indexrelid IS NOT NULL
            THEN refit.index_columns(ck.indexrelid)
       END AS ckey,
       'SELECT id, pk, row_data FROM refit.log_' || r.oid || ' ORDER BY id LIMIT $1'
           AS sql_peek,
       'INSERT INTO refit.table_' || r.oid || ' SELECT ($1).*' AS sql_insert,
       'DELETE FROM refit.table_' || r.oid || ' WHERE ' || refit.pk_where(r.oid, '$1')
           AS sql_delete,
       'UPDATE refit.table_' || r.oid || ' SET ' || refit.set_list(r.oid, '$1') ||
           ' WHERE ' || refit.pk_where(r.oid, '$2')
           AS sql_update,
       'DELETE FROM refit.log_' || r.oid || ' WHERE id = $1' AS sql_pop
FROM pg_class r
     JOIN pg_namespace n ON n.oid = r.relnamespace
     LEFT JOIN pg_index pk ON pk.indrelid = r.oid AND pk.indisprimary
     LEFT JOIN pg_index ck ON ck.indrelid = r.oid AND ck.indisclustered
WHERE r.relkind = 'r'
  AND r.relpersistence = 'p'
  AND n.nspname NOT IN ('pg_catalog', 'information_schema', 'refit');

-- Row-capture trigger: INSERT logs (NULL, NEW); DELETE logs (old pk, NULL);
-- UPDATE logs (old pk, NEW).
CREATE FUNCTION refit.log_change() RETURNS trigger LANGUAGE plpgsql AS $body$
DECLARE
    tbl    oid := TG_ARGV[0]::oid;
    pkexpr text;
BEGIN
    IF TG_OP = 'INSERT' THEN
        EXECUTE format('INSERT INTO refit.log_%s (pk, row_data) VALUES (NULL, $1)', tbl)
            USING NEW;
        RETURN NEW;
    END IF;

    SELECT string_agg(format('($1).%I', c), ', ')
      INTO pkexpr
      FROM unnest(string_to_array(TG_ARGV[1], ',')) AS c;

    IF TG_OP = 'DELETE' THEN
        EXECUTE format('INSERT INTO refit.log_%s (pk, row_data) SELECT ROW(%s)::refit.pk_%s, NULL',
                       tbl, pkexpr, tbl)
            USING OLD;
        RETURN OLD;
    ELSE
        EXECUTE format('INSERT INTO refit.log_%s (pk, row_data) SELECT ROW(%s)::refit.pk_%s, $2',
                       tbl, pkexpr, tbl)
            USING OLD, NEW;
        RETURN NEW;
    END IF;
END
$body$;

-- User triggers that would fire after the row-capture trigger.
CREATE FUNCTION refit.conflicted_triggers(rel oid) RETURNS SETOF name LANGUAGE sql STABLE AS $$
    SELECT tgname FROM pg_trigger
    WHERE tgrelid = rel AND NOT tgisinternal AND tgname > 'z_refit_trigger'
    ORDER BY tgname
$$;

CREATE FUNCTION refit.disable_autovacuum(rel regclass) RETURNS void LANGUAGE plpgsql AS $$
BEGIN
    EXECUTE format('ALTER TABLE %s SET (autovacuum_enabled = off)', rel);
END
$$;

-- CREATE INDEX statement for idx, rewritten against the shadow of rel.
CREATE FUNCTION refit.refit_indexdef(idx oid, rel oid) RETURNS text LANGUAGE sql STABLE AS $$
    SELECT regexp_replace(pg_get_indexdef(idx),
                          ' INDEX \S+ ON \S+',
                          format(' INDEX index_%s ON refit.table_%s', idx, rel))
$$;

-- Replay up to batch log rows (0 = all) in log order, popping each.
CREATE FUNCTION refit.refit_apply(
    sql_peek text, sql_insert text, sql_delete text,
    sql_update text, sql_pop text, batch integer
) RETURNS integer LANGUAGE plpgsql AS $body$
DECLARE
    lim     integer := NULLIF(batch, 0);
    rec     record;
    applied integer := 0;
BEGIN
    FOR rec IN EXECUTE sql_peek USING lim LOOP
        IF rec.pk IS NULL THEN
            EXECUTE sql_insert USING rec.row_data;
        ELSIF rec.row_data IS NULL THEN
            EXECUTE sql_delete USING rec.pk;
        ELSE
            EXECUTE sql_update USING rec.row_data, rec.pk;
        END IF;
        EXECUTE sql_pop USING rec.id;
        applied := applied + 1;
    END LOOP;
    RETURN applied;
END
$body$;

-- Content-exchange rendition of the storage swap (see module comment).
-- Runs under the access-exclusive lock the caller already holds.
CREATE FUNCTION refit.refit_swap(rel oid) RETURNS void LANGUAGE plpgsql AS $body$
BEGIN
    EXECUTE format('ALTER TABLE %s DISABLE TRIGGER z_refit_trigger', rel::regclass);
    EXECUTE format('TRUNCATE ONLY %s', rel::regclass);
    EXECUTE format('INSERT INTO %s SELECT * FROM refit.table_%s', rel::regclass, rel);
    EXECUTE format('ALTER TABLE %s ENABLE TRIGGER z_refit_trigger', rel::regclass);
END
$body$;

-- Transient-object removal, reverse of creation order:
-- trigger, then log, then shadow, then the PK type.
CREATE FUNCTION refit.refit_drop(rel oid) RETURNS void LANGUAGE plpgsql AS $body$
BEGIN
    IF EXISTS (SELECT 1 FROM pg_trigger
               WHERE tgrelid = rel AND tgname = 'z_refit_trigger') THEN
        EXECUTE format('DROP TRIGGER z_refit_trigger ON %s', rel::regclass);
    END IF;
    EXECUTE format('DROP TABLE IF EXISTS refit.log_%s', rel);
    EXECUTE format('DROP TABLE IF EXISTS refit.table_%s', rel);
    EXECUTE format('DROP TYPE IF EXISTS refit.pk_%s CASCADE', rel);
END
$body$;
"#;

/// A test database backed by a Testcontainers PostgreSQL instance with the
/// `refit` contract pre-installed. The container is cleaned up on drop.
pub struct TestDb {
    pub client: Client,
    port: u16,
    _container: ContainerAsync<Postgres>,
}

#[allow(dead_code)]
impl TestDb {
    /// Start a fresh container, connect a side-channel client, and install
    /// the `refit` contract.
    pub async fn new() -> Self {
        let container = Postgres::default()
            .with_tag("18.1-alpine")
            .start()
            .await
            .expect("failed to start PostgreSQL container");

        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("failed to get mapped port");

        let client = connect_client(port, "postgres").await;
        client
            .batch_execute(EXTENSION_DDL)
            .await
            .expect("failed to install refit contract");

        TestDb {
            client,
            port,
            _container: container,
        }
    }

    /// Connection configuration for the orchestrator's own session.
    pub fn config(&self) -> tokio_postgres::Config {
        self.config_for("postgres")
    }

    pub fn config_for(&self, dbname: &str) -> tokio_postgres::Config {
        let mut cfg = tokio_postgres::Config::new();
        cfg.application_name("pg_refit")
            .host("127.0.0.1")
            .port(self.port)
            .user("postgres")
            .password("postgres")
            .dbname(dbname);
        cfg
    }

    /// Open an orchestrator session against the container.
    pub async fn session(&self) -> Session {
        Session::connect(self.config())
            .await
            .expect("failed to open session")
    }

    /// Open an extra raw client (concurrent writer, lock holder, ...).
    pub async fn extra_client(&self) -> Client {
        connect_client(self.port, "postgres").await
    }

    /// Execute a SQL statement on the side channel.
    pub async fn execute(&self, sql: &str) {
        self.client
            .batch_execute(sql)
            .await
            .unwrap_or_else(|e| panic!("SQL execution failed: {e}\nSQL: {sql}"));
    }

    /// Get a single scalar value from a query.
    pub async fn scalar<T: FromSqlOwned>(&self, sql: &str) -> T {
        self.client
            .query_one(sql, &[])
            .await
            .unwrap_or_else(|e| panic!("scalar query failed: {e}\nSQL: {sql}"))
            .get(0)
    }

    /// Count rows in a table.
    pub async fn count(&self, table: &str) -> i64 {
        self.scalar(&format!("SELECT count(*) FROM {table}")).await
    }

    /// The OID of a relation.
    pub async fn oid_of(&self, relation: &str) -> u32 {
        self.scalar(&format!("SELECT '{relation}'::regclass::oid")).await
    }

    /// Whether a relation exists in the `refit` schema.
    pub async fn refit_relation_exists(&self, relname: &str) -> bool {
        self.client
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM pg_class c \
                 JOIN pg_namespace n ON n.oid = c.relnamespace \
                 WHERE n.nspname = 'refit' AND c.relname = $1)",
                &[&relname],
            )
            .await
            .expect("existence query failed")
            .get(0)
    }

    /// Whether the row-capture trigger exists on the given table.
    pub async fn capture_trigger_exists(&self, target_oid: u32) -> bool {
        self.client
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM pg_trigger \
                 WHERE tgrelid = $1 AND tgname = 'z_refit_trigger')",
                &[&target_oid],
            )
            .await
            .expect("existence query failed")
            .get(0)
    }

    /// Whether the composite PK type for the given table exists.
    pub async fn pk_type_exists(&self, target_oid: u32) -> bool {
        let typname = format!("pk_{target_oid}");
        self.client
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM pg_type t \
                 JOIN pg_namespace n ON n.oid = t.typnamespace \
                 WHERE n.nspname = 'refit' AND t.typname = $1)",
                &[&typname],
            )
            .await
            .expect("existence query failed")
            .get(0)
    }

    /// Assert that no transient objects remain for the given table.
    pub async fn assert_no_transients(&self, target_oid: u32) {
        assert!(
            !self.refit_relation_exists(&format!("log_{target_oid}")).await,
            "log table should be gone"
        );
        assert!(
            !self.refit_relation_exists(&format!("table_{target_oid}")).await,
            "shadow table should be gone"
        );
        assert!(
            !self.capture_trigger_exists(target_oid).await,
            "capture trigger should be gone"
        );
        assert!(
            !self.pk_type_exists(target_oid).await,
            "PK type should be gone"
        );
    }
}

async fn connect_client(port: u16, dbname: &str) -> Client {
    let (client, connection) = tokio_postgres::Config::new()
        .host("127.0.0.1")
        .port(port)
        .user("postgres")
        .password("postgres")
        .dbname(dbname)
        .connect(NoTls)
        .await
        .expect("failed to connect to test database");

    tokio::spawn(async move {
        let _ = connection.await;
    });

    client
}
