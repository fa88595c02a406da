use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{debug, info};

use crate::catalog::snapshot::{
    ColumnDescriptor, ForeignKeyEdge, HelperFunction, IndexDescriptor, PolicyDescriptor, Snapshot,
    TableDescriptor, TableRef,
};
use crate::error::CatalogError;

/// A table as listed by the catalog, before its columns are read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry {
    /// Table identity.
    pub table: TableRef,
    /// Row-level security enabled.
    pub rls_enabled: bool,
    /// Row-level security forced for the table owner.
    pub rls_forced: bool,
}

/// Read-only catalog contract. Implementations are driver specific; the
/// auditor only ever sees the [`Snapshot`] assembled from these calls.
pub trait CatalogSource {
    /// Base tables of `schema`.
    fn list_tables(&mut self, schema: &str) -> Result<Vec<TableEntry>, CatalogError>;

    /// Describe a single table, typically one outside the audited schema.
    fn describe_table(&mut self, table: &TableRef) -> Result<Option<TableEntry>, CatalogError>;

    /// Columns of `table` in ordinal order.
    fn list_columns(&mut self, table: &TableRef) -> Result<Vec<ColumnDescriptor>, CatalogError>;

    /// Foreign keys whose referencing table lives in `schema`.
    fn list_foreign_keys(&mut self, schema: &str) -> Result<Vec<ForeignKeyEdge>, CatalogError>;

    /// Indexes of tables in `schema`.
    fn list_indexes(&mut self, schema: &str) -> Result<Vec<IndexDescriptor>, CatalogError>;

    /// RLS policies of tables in `schema`.
    fn list_policies(&mut self, schema: &str) -> Result<Vec<PolicyDescriptor>, CatalogError>;

    /// Which of `names` exist as functions in `schema`. Existence only.
    fn list_functions(&mut self, schema: &str, names: &[String])
        -> Result<Vec<String>, CatalogError>;
}

/// What to capture in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRequest {
    /// Schema whose tables are audited.
    pub schema: String,
    /// Helper functions whose existence is checked.
    pub helper_names: Vec<String>,
}

/// Read the whole catalog into one immutable [`Snapshot`].
///
/// Any failing call aborts the introspection; no partial snapshot is returned.
pub fn introspect<S>(source: &mut S, request: &SnapshotRequest) -> Result<Snapshot, CatalogError>
where
    S: CatalogSource + ?Sized,
{
    let taken_at = Utc::now();
    let schema = request.schema.as_str();

    let entries = source.list_tables(schema)?;
    let indexes = source.list_indexes(schema)?;
    let foreign_keys = source.list_foreign_keys(schema)?;
    let policies = source.list_policies(schema)?;
    let present = source.list_functions(schema, &request.helper_names)?;

    let mut tables: BTreeMap<TableRef, TableDescriptor> = BTreeMap::new();
    for entry in entries {
        let descriptor = describe(source, entry, &indexes, false)?;
        tables.insert(descriptor.table.clone(), descriptor);
    }

    for edge in &foreign_keys {
        if tables.contains_key(&edge.parent) {
            continue;
        }
        let Some(entry) = source.describe_table(&edge.parent)? else {
            return Err(CatalogError::Inconsistent(format!(
                "constraint {} references missing table {}",
                edge.constraint_name, edge.parent
            )));
        };
        debug!(table = %edge.parent, "describing external parent table");
        let descriptor = describe(source, entry, &indexes, true)?;
        tables.insert(descriptor.table.clone(), descriptor);
    }

    let functions = request
        .helper_names
        .iter()
        .map(|name| HelperFunction {
            name: name.clone(),
            present: present.iter().any(|p| p == name),
        })
        .collect();

    info!(
        schema,
        tables = tables.len(),
        foreign_keys = foreign_keys.len(),
        indexes = indexes.len(),
        policies = policies.len(),
        "catalog snapshot taken"
    );

    Snapshot::new(
        schema,
        taken_at,
        tables.into_values().collect(),
        foreign_keys,
        indexes,
        policies,
        functions,
    )
}

fn describe<S>(
    source: &mut S,
    entry: TableEntry,
    indexes: &[IndexDescriptor],
    external: bool,
) -> Result<TableDescriptor, CatalogError>
where
    S: CatalogSource + ?Sized,
{
    let columns = source.list_columns(&entry.table)?;
    let primary_key = indexes
        .iter()
        .find(|i| i.primary && i.table == entry.table)
        .map(|i| i.columns.clone())
        .unwrap_or_default();
    Ok(TableDescriptor {
        table: entry.table,
        columns,
        primary_key,
        rls_enabled: entry.rls_enabled,
        rls_forced: entry.rls_forced,
        external,
    })
}
