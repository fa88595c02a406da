//! Live PostgreSQL catalog and orphan probes over diesel.

use std::time::{Duration, Instant};

use diesel::connection::SimpleConnection;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sql_types::{Array, BigInt, Bool, Nullable, Text};
use tracing::{debug, info};

use crate::audit::integrity::{orphan_count_sql, OrphanProbe, ProbeFactory};
use crate::audit::{run_audit, run_audit_pooled, AuditOutcome};
use crate::catalog::introspect::{introspect, CatalogSource, SnapshotRequest, TableEntry};
use crate::catalog::snapshot::{
    ColumnDescriptor, ForeignKeyEdge, IndexDescriptor, PolicyCommand, PolicyDescriptor,
    PolicyMode, ReferentialAction, Snapshot, TableRef,
};
use crate::classifier::classification::ClassificationMap;
use crate::config::AuditSettings;
use crate::error::{AuditError, CatalogError, ProbeError};

const TABLES_SQL: &str = "\
SELECT n.nspname::text AS schema_name, c.relname::text AS table_name,
       c.relrowsecurity AS rls_enabled, c.relforcerowsecurity AS rls_forced
FROM pg_class c
JOIN pg_namespace n ON n.oid = c.relnamespace
WHERE n.nspname = $1 AND c.relkind IN ('r', 'p') AND NOT c.relispartition
ORDER BY c.relname";

const DESCRIBE_TABLE_SQL: &str = "\
SELECT n.nspname::text AS schema_name, c.relname::text AS table_name,
       c.relrowsecurity AS rls_enabled, c.relforcerowsecurity AS rls_forced
FROM pg_class c
JOIN pg_namespace n ON n.oid = c.relnamespace
WHERE n.nspname = $1 AND c.relname = $2 AND c.relkind IN ('r', 'p')";

const COLUMNS_SQL: &str = "\
SELECT column_name::text AS column_name, data_type::text AS data_type,
       (is_nullable = 'YES') AS nullable, column_default::text AS column_default
FROM information_schema.columns
WHERE table_schema = $1 AND table_name = $2
ORDER BY ordinal_position";

const FOREIGN_KEYS_SQL: &str = "\
SELECT con.conname::text AS constraint_name,
       cn.nspname::text AS child_schema, cc.relname::text AS child_table,
       ARRAY(SELECT a.attname::text
             FROM unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
             JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
             ORDER BY k.ord) AS child_columns,
       pn.nspname::text AS parent_schema, pc.relname::text AS parent_table,
       ARRAY(SELECT a.attname::text
             FROM unnest(con.confkey) WITH ORDINALITY AS k(attnum, ord)
             JOIN pg_attribute a ON a.attrelid = con.confrelid AND a.attnum = k.attnum
             ORDER BY k.ord) AS parent_columns,
       con.confupdtype::text AS on_update, con.confdeltype::text AS on_delete
FROM pg_constraint con
JOIN pg_class cc ON cc.oid = con.conrelid
JOIN pg_namespace cn ON cn.oid = cc.relnamespace
JOIN pg_class pc ON pc.oid = con.confrelid
JOIN pg_namespace pn ON pn.oid = pc.relnamespace
WHERE con.contype = 'f' AND cn.nspname = $1 AND con.conparentid = 0
ORDER BY cc.relname, con.conname";

const INDEXES_SQL: &str = "\
SELECT n.nspname::text AS schema_name, t.relname::text AS table_name,
       i.relname::text AS index_name, ix.indisunique AS is_unique, ix.indisprimary AS is_primary,
       (ix.indpred IS NOT NULL) AS is_partial,
       ARRAY(SELECT COALESCE(a.attname::text, '<expr>')
             FROM unnest(ix.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
             LEFT JOIN pg_attribute a
               ON a.attrelid = ix.indrelid AND a.attnum = k.attnum AND k.attnum > 0
             WHERE k.ord <= ix.indnkeyatts
             ORDER BY k.ord) AS columns
FROM pg_index ix
JOIN pg_class t ON t.oid = ix.indrelid
JOIN pg_class i ON i.oid = ix.indexrelid
JOIN pg_namespace n ON n.oid = t.relnamespace
WHERE n.nspname = $1 AND ix.indisvalid AND NOT t.relispartition
ORDER BY t.relname, i.relname";

const POLICIES_SQL: &str = "\
SELECT schemaname::text AS schema_name, tablename::text AS table_name,
       policyname::text AS policy_name, permissive::text AS permissive,
       roles::text[] AS roles, cmd::text AS command,
       qual AS using_expr, with_check AS check_expr
FROM pg_policies
WHERE schemaname = $1
  AND (schemaname, tablename) NOT IN (
      SELECT n.nspname, c.relname
      FROM pg_class c
      JOIN pg_namespace n ON n.oid = c.relnamespace
      WHERE c.relispartition)
ORDER BY tablename, policyname";

const FUNCTIONS_SQL: &str = "\
SELECT DISTINCT p.proname::text AS function_name
FROM pg_proc p
JOIN pg_namespace n ON n.oid = p.pronamespace
WHERE n.nspname = $1 AND p.proname = ANY($2)";

#[derive(QueryableByName)]
struct TableRow {
    #[diesel(sql_type = Text)]
    schema_name: String,
    #[diesel(sql_type = Text)]
    table_name: String,
    #[diesel(sql_type = Bool)]
    rls_enabled: bool,
    #[diesel(sql_type = Bool)]
    rls_forced: bool,
}

impl From<TableRow> for TableEntry {
    fn from(row: TableRow) -> Self {
        TableEntry {
            table: TableRef::new(row.schema_name, row.table_name),
            rls_enabled: row.rls_enabled,
            rls_forced: row.rls_forced,
        }
    }
}

#[derive(QueryableByName)]
struct ColumnRow {
    #[diesel(sql_type = Text)]
    column_name: String,
    #[diesel(sql_type = Text)]
    data_type: String,
    #[diesel(sql_type = Bool)]
    nullable: bool,
    #[diesel(sql_type = Nullable<Text>)]
    column_default: Option<String>,
}

#[derive(QueryableByName)]
struct ForeignKeyRow {
    #[diesel(sql_type = Text)]
    constraint_name: String,
    #[diesel(sql_type = Text)]
    child_schema: String,
    #[diesel(sql_type = Text)]
    child_table: String,
    #[diesel(sql_type = Array<Text>)]
    child_columns: Vec<String>,
    #[diesel(sql_type = Text)]
    parent_schema: String,
    #[diesel(sql_type = Text)]
    parent_table: String,
    #[diesel(sql_type = Array<Text>)]
    parent_columns: Vec<String>,
    #[diesel(sql_type = Text)]
    on_update: String,
    #[diesel(sql_type = Text)]
    on_delete: String,
}

#[derive(QueryableByName)]
struct IndexRow {
    #[diesel(sql_type = Text)]
    schema_name: String,
    #[diesel(sql_type = Text)]
    table_name: String,
    #[diesel(sql_type = Text)]
    index_name: String,
    #[diesel(sql_type = Bool)]
    is_unique: bool,
    #[diesel(sql_type = Bool)]
    is_primary: bool,
    #[diesel(sql_type = Bool)]
    is_partial: bool,
    #[diesel(sql_type = Array<Text>)]
    columns: Vec<String>,
}

#[derive(QueryableByName)]
struct PolicyRow {
    #[diesel(sql_type = Text)]
    schema_name: String,
    #[diesel(sql_type = Text)]
    table_name: String,
    #[diesel(sql_type = Text)]
    policy_name: String,
    #[diesel(sql_type = Text)]
    permissive: String,
    #[diesel(sql_type = Array<Text>)]
    roles: Vec<String>,
    #[diesel(sql_type = Text)]
    command: String,
    #[diesel(sql_type = Nullable<Text>)]
    using_expr: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    check_expr: Option<String>,
}

#[derive(QueryableByName)]
struct FunctionRow {
    #[diesel(sql_type = Text)]
    function_name: String,
}

#[derive(QueryableByName)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    orphans: i64,
}

fn query_error(operation: &'static str) -> impl Fn(DieselError) -> CatalogError {
    move |error| CatalogError::Query {
        operation,
        message: error.to_string(),
    }
}

/// [`CatalogSource`] over a borrowed connection. Run it inside one
/// transaction (see [`snapshot`]) for a point-in-time view.
pub struct PgCatalog<'c> {
    conn: &'c mut PgConnection,
}

impl<'c> PgCatalog<'c> {
    /// Wrap a connection.
    pub fn new(conn: &'c mut PgConnection) -> Self {
        Self { conn }
    }
}

impl CatalogSource for PgCatalog<'_> {
    fn list_tables(&mut self, schema: &str) -> Result<Vec<TableEntry>, CatalogError> {
        let rows: Vec<TableRow> = diesel::sql_query(TABLES_SQL)
            .bind::<Text, _>(schema)
            .load(&mut *self.conn)
            .map_err(query_error("list_tables"))?;
        Ok(rows.into_iter().map(TableEntry::from).collect())
    }

    fn describe_table(&mut self, table: &TableRef) -> Result<Option<TableEntry>, CatalogError> {
        let rows: Vec<TableRow> = diesel::sql_query(DESCRIBE_TABLE_SQL)
            .bind::<Text, _>(&table.schema)
            .bind::<Text, _>(&table.name)
            .load(&mut *self.conn)
            .map_err(query_error("describe_table"))?;
        Ok(rows.into_iter().next().map(TableEntry::from))
    }

    fn list_columns(&mut self, table: &TableRef) -> Result<Vec<ColumnDescriptor>, CatalogError> {
        let rows: Vec<ColumnRow> = diesel::sql_query(COLUMNS_SQL)
            .bind::<Text, _>(&table.schema)
            .bind::<Text, _>(&table.name)
            .load(&mut *self.conn)
            .map_err(query_error("list_columns"))?;
        Ok(rows
            .into_iter()
            .map(|row| ColumnDescriptor {
                name: row.column_name,
                data_type: row.data_type,
                nullable: row.nullable,
                default: row.column_default,
            })
            .collect())
    }

    fn list_foreign_keys(&mut self, schema: &str) -> Result<Vec<ForeignKeyEdge>, CatalogError> {
        let rows: Vec<ForeignKeyRow> = diesel::sql_query(FOREIGN_KEYS_SQL)
            .bind::<Text, _>(schema)
            .load(&mut *self.conn)
            .map_err(query_error("list_foreign_keys"))?;
        rows.into_iter()
            .map(|row| {
                let action = |code: &str| {
                    ReferentialAction::from_pg_code(code).ok_or_else(|| {
                        CatalogError::Inconsistent(format!(
                            "constraint {} has unknown referential action '{code}'",
                            row.constraint_name
                        ))
                    })
                };
                Ok(ForeignKeyEdge {
                    on_update: action(&row.on_update)?,
                    on_delete: action(&row.on_delete)?,
                    constraint_name: row.constraint_name.clone(),
                    child: TableRef::new(row.child_schema.clone(), row.child_table.clone()),
                    child_columns: row.child_columns.clone(),
                    parent: TableRef::new(row.parent_schema.clone(), row.parent_table.clone()),
                    parent_columns: row.parent_columns.clone(),
                })
            })
            .collect()
    }

    fn list_indexes(&mut self, schema: &str) -> Result<Vec<IndexDescriptor>, CatalogError> {
        let rows: Vec<IndexRow> = diesel::sql_query(INDEXES_SQL)
            .bind::<Text, _>(schema)
            .load(&mut *self.conn)
            .map_err(query_error("list_indexes"))?;
        Ok(rows
            .into_iter()
            .map(|row| IndexDescriptor {
                table: TableRef::new(row.schema_name, row.table_name),
                name: row.index_name,
                columns: row.columns,
                unique: row.is_unique,
                primary: row.is_primary,
                partial: row.is_partial,
            })
            .collect())
    }

    fn list_policies(&mut self, schema: &str) -> Result<Vec<PolicyDescriptor>, CatalogError> {
        let rows: Vec<PolicyRow> = diesel::sql_query(POLICIES_SQL)
            .bind::<Text, _>(schema)
            .load(&mut *self.conn)
            .map_err(query_error("list_policies"))?;
        rows.into_iter()
            .map(|row| {
                let command: PolicyCommand = row
                    .command
                    .parse()
                    .map_err(CatalogError::Inconsistent)?;
                let mode: PolicyMode = row
                    .permissive
                    .parse()
                    .map_err(CatalogError::Inconsistent)?;
                Ok(PolicyDescriptor {
                    table: TableRef::new(row.schema_name, row.table_name),
                    name: row.policy_name,
                    command,
                    roles: row.roles,
                    using: row.using_expr,
                    with_check: row.check_expr,
                    mode,
                })
            })
            .collect()
    }

    fn list_functions(
        &mut self,
        schema: &str,
        names: &[String],
    ) -> Result<Vec<String>, CatalogError> {
        let rows: Vec<FunctionRow> = diesel::sql_query(FUNCTIONS_SQL)
            .bind::<Text, _>(schema)
            .bind::<Array<Text>, _>(names)
            .load(&mut *self.conn)
            .map_err(query_error("list_functions"))?;
        Ok(rows.into_iter().map(|row| row.function_name).collect())
    }
}

/// Introspect inside one `READ ONLY REPEATABLE READ` transaction.
pub fn snapshot(
    conn: &mut PgConnection,
    request: &SnapshotRequest,
) -> Result<Snapshot, CatalogError> {
    conn.build_transaction()
        .read_only()
        .repeatable_read()
        .run(|conn| introspect(&mut PgCatalog::new(conn), request))
}

fn classify_probe_error(error: DieselError, elapsed: Duration, timeout: Duration) -> ProbeError {
    match error {
        DieselError::DatabaseError(
            DatabaseErrorKind::ClosedConnection | DatabaseErrorKind::UnableToSendCommand,
            info,
        ) => ProbeError::ConnectionLost(info.message().to_string()),
        _ if elapsed >= timeout => ProbeError::Timeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        },
        other => ProbeError::Failed(other.to_string()),
    }
}

/// Orphan probe on its own read-only session.
pub struct PgOrphanProbe {
    conn: PgConnection,
    timeout: Duration,
}

impl PgOrphanProbe {
    /// Turn `conn` into a probe session: read-only, bounded statements.
    pub fn new(mut conn: PgConnection, timeout: Duration) -> Result<Self, ProbeError> {
        conn.batch_execute(&format!(
            "SET statement_timeout = {}; SET default_transaction_read_only = on;",
            timeout.as_millis()
        ))
        .map_err(|e| ProbeError::Failed(e.to_string()))?;
        Ok(Self { conn, timeout })
    }
}

impl OrphanProbe for PgOrphanProbe {
    fn count_orphans(&mut self, edge: &ForeignKeyEdge) -> Result<u64, ProbeError> {
        let started = Instant::now();
        let row: CountRow = diesel::sql_query(orphan_count_sql(edge))
            .get_result(&mut self.conn)
            .map_err(|e| classify_probe_error(e, started.elapsed(), self.timeout))?;
        debug!(constraint = %edge.constraint_name, elapsed_ms = started.elapsed().as_millis() as u64, "orphan probe finished");
        Ok(u64::try_from(row.orphans).unwrap_or_default())
    }
}

/// Opens one connection per probe worker.
#[derive(Debug, Clone)]
pub struct PgProbeFactory {
    url: String,
    timeout: Duration,
}

impl PgProbeFactory {
    /// Probes connecting to `url` with per-statement `timeout`.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }
}

impl ProbeFactory for PgProbeFactory {
    type Probe = PgOrphanProbe;

    fn open_probe(&self) -> Result<Self::Probe, ProbeError> {
        let conn = PgConnection::establish(&self.url)
            .map_err(|e| ProbeError::ConnectionLost(e.to_string()))?;
        PgOrphanProbe::new(conn, self.timeout)
    }
}

/// Connect, snapshot and audit a live database.
pub fn audit_database(
    url: &str,
    settings: &AuditSettings,
    map: &ClassificationMap,
) -> Result<(Snapshot, AuditOutcome), AuditError> {
    let mut conn =
        PgConnection::establish(url).map_err(|e| AuditError::Connection(e.to_string()))?;
    let request = SnapshotRequest {
        schema: settings.schema.clone(),
        helper_names: map.helpers.all_names(),
    };
    let snapshot = snapshot(&mut conn, &request)?;

    let outcome = if settings.workers > 1 {
        info!(workers = settings.workers, "probing on a worker pool");
        drop(conn);
        let factory = PgProbeFactory::new(url, settings.query_timeout);
        run_audit_pooled(&snapshot, map, &factory, settings.workers)
    } else {
        let mut probe = PgOrphanProbe::new(conn, settings.query_timeout)
            .map_err(|e| AuditError::Connection(e.to_string()))?;
        run_audit(&snapshot, map, &mut probe)
    };
    Ok((snapshot, outcome))
}
