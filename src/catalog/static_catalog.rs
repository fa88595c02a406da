use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::audit::integrity::{OrphanProbe, ProbeFactory};
use crate::catalog::introspect::{CatalogSource, TableEntry};
use crate::catalog::snapshot::{
    ColumnDescriptor, ForeignKeyEdge, IndexDescriptor, PolicyCommand, PolicyDescriptor,
    PolicyMode, ReferentialAction, TableRef,
};
use crate::error::{CatalogError, ProbeError};
use crate::generator::remediation::{RemediationAction, RemediationPlan};

fn default_schema() -> String {
    "public".to_string()
}

fn default_roles() -> Vec<String> {
    vec!["public".to_string()]
}

fn default_command() -> PolicyCommand {
    PolicyCommand::All
}

/// Serialized catalog export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CatalogDocument {
    /// Schema bare names resolve against.
    #[serde(default = "default_schema")]
    pub schema: String,
    /// Tables, including any external parents.
    #[serde(default)]
    pub tables: Vec<TableDocument>,
    /// Foreign-key constraints.
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyDocument>,
    /// Indexes.
    #[serde(default)]
    pub indexes: Vec<IndexDocument>,
    /// RLS policies.
    #[serde(default)]
    pub policies: Vec<PolicyDocument>,
    /// Existing function names (bare names live in `schema`).
    #[serde(default)]
    pub functions: Vec<String>,
}

/// One table of a [`CatalogDocument`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TableDocument {
    /// Table name, optionally `schema.name`.
    pub name: String,
    /// Explicit schema; overrides any qualification in `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    /// Row-level security enabled.
    #[serde(default)]
    pub rls_enabled: bool,
    /// Row-level security forced.
    #[serde(default)]
    pub rls_forced: bool,
    /// Columns in ordinal order.
    #[serde(default)]
    pub columns: Vec<ColumnDescriptor>,
    /// Row data for orphan probes; absent means unknown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<Map<String, Value>>>,
}

/// One foreign key of a [`CatalogDocument`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ForeignKeyDocument {
    /// Constraint name.
    pub name: String,
    /// Referencing table.
    pub table: String,
    /// Referencing columns.
    pub columns: Vec<String>,
    /// Referenced table.
    pub references: String,
    /// Referenced columns.
    pub referenced_columns: Vec<String>,
    /// `ON UPDATE` action.
    #[serde(default)]
    pub on_update: ReferentialAction,
    /// `ON DELETE` action.
    #[serde(default)]
    pub on_delete: ReferentialAction,
}

/// One index of a [`CatalogDocument`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IndexDocument {
    /// Indexed table.
    pub table: String,
    /// Index name.
    pub name: String,
    /// Key columns.
    pub columns: Vec<String>,
    /// Unique index.
    #[serde(default)]
    pub unique: bool,
    /// Primary-key index.
    #[serde(default)]
    pub primary: bool,
    /// The index has a `WHERE` predicate.
    #[serde(default)]
    pub partial: bool,
}

/// One policy of a [`CatalogDocument`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PolicyDocument {
    /// Table the policy is attached to.
    pub table: String,
    /// Policy name.
    pub name: String,
    /// Governed command.
    #[serde(default = "default_command")]
    pub command: PolicyCommand,
    /// Roles.
    #[serde(default = "default_roles")]
    pub roles: Vec<String>,
    /// `USING` predicate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub using: Option<String>,
    /// `WITH CHECK` predicate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with_check: Option<String>,
    /// Permissive or restrictive.
    #[serde(default)]
    pub mode: PolicyMode,
}

/// Catalog backed by a JSON export instead of a live connection.
#[derive(Debug, Clone, PartialEq)]
pub struct StaticCatalog {
    document: CatalogDocument,
}

impl StaticCatalog {
    /// Wrap an already decoded document.
    pub fn new(document: CatalogDocument) -> Self {
        Self { document }
    }

    /// Decode a catalog export.
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        serde_json::from_str(json)
            .map(Self::new)
            .map_err(|e| CatalogError::Document(e.to_string()))
    }

    /// Read and decode a catalog export file.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CatalogError::Document(format!("{}: {e}", path.display())))?;
        Self::from_json(&content)
    }

    /// The underlying document.
    pub fn document(&self) -> &CatalogDocument {
        &self.document
    }

    fn resolve(&self, name: &str) -> TableRef {
        TableRef::parse(name, &self.document.schema)
    }

    fn table_ref(&self, table: &TableDocument) -> TableRef {
        match &table.schema {
            Some(schema) => TableRef::new(schema.clone(), table.name.clone()),
            None => self.resolve(&table.name),
        }
    }

    fn find_table(&self, table: &TableRef) -> Option<&TableDocument> {
        self.document
            .tables
            .iter()
            .find(|t| &self.table_ref(t) == table)
    }

    /// Simulate running the remediation script against this catalog.
    ///
    /// Follows the script's guards: existing helpers, indexes and policies of
    /// the same name are left alone, so applying twice equals applying once.
    pub fn apply(&mut self, plan: &RemediationPlan) {
        for statement in &plan.statements {
            match &statement.action {
                RemediationAction::DefineHelper { name, .. } => {
                    let function = TableRef::new(plan.schema.clone(), name.clone());
                    let exists = self
                        .document
                        .functions
                        .iter()
                        .any(|f| self.resolve(f) == function);
                    if !exists {
                        self.document.functions.push(function.to_string());
                    }
                }
                RemediationAction::CreateIndex {
                    table,
                    name,
                    columns,
                } => {
                    let exists = self.document.indexes.iter().any(|i| {
                        &i.name == name && self.resolve(&i.table).schema == table.schema
                    });
                    if !exists {
                        self.document.indexes.push(IndexDocument {
                            table: table.to_string(),
                            name: name.clone(),
                            columns: columns.clone(),
                            unique: false,
                            primary: false,
                            partial: false,
                        });
                    }
                }
                RemediationAction::EnableRls { table } => {
                    let schema = self.document.schema.clone();
                    if let Some(doc) = self.document.tables.iter_mut().find(|t| {
                        let reference = match &t.schema {
                            Some(s) => TableRef::new(s.clone(), t.name.clone()),
                            None => TableRef::parse(&t.name, &schema),
                        };
                        &reference == table
                    }) {
                        doc.rls_enabled = true;
                    }
                }
                RemediationAction::CreatePolicy { table, policy } => {
                    let exists = self
                        .document
                        .policies
                        .iter()
                        .any(|p| p.name == policy.name && &self.resolve(&p.table) == table);
                    if !exists {
                        self.document.policies.push(PolicyDocument {
                            table: table.to_string(),
                            name: policy.name.clone(),
                            command: policy.command,
                            roles: default_roles(),
                            using: policy.using.clone(),
                            with_check: policy.with_check.clone(),
                            mode: PolicyMode::Permissive,
                        });
                    }
                }
                RemediationAction::Advisory { .. } => {}
            }
        }
    }

    fn entry(&self, table: &TableDocument) -> TableEntry {
        TableEntry {
            table: self.table_ref(table),
            rls_enabled: table.rls_enabled,
            rls_forced: table.rls_forced,
        }
    }
}

impl CatalogSource for StaticCatalog {
    fn list_tables(&mut self, schema: &str) -> Result<Vec<TableEntry>, CatalogError> {
        Ok(self
            .document
            .tables
            .iter()
            .map(|t| self.entry(t))
            .filter(|e| e.table.schema == schema)
            .collect())
    }

    fn describe_table(&mut self, table: &TableRef) -> Result<Option<TableEntry>, CatalogError> {
        Ok(self.find_table(table).map(|t| self.entry(t)))
    }

    fn list_columns(&mut self, table: &TableRef) -> Result<Vec<ColumnDescriptor>, CatalogError> {
        self.find_table(table)
            .map(|t| t.columns.clone())
            .ok_or_else(|| CatalogError::Query {
                operation: "list_columns",
                message: format!("relation {table} does not exist"),
            })
    }

    fn list_foreign_keys(&mut self, schema: &str) -> Result<Vec<ForeignKeyEdge>, CatalogError> {
        Ok(self
            .document
            .foreign_keys
            .iter()
            .map(|fk| ForeignKeyEdge {
                constraint_name: fk.name.clone(),
                child: self.resolve(&fk.table),
                child_columns: fk.columns.clone(),
                parent: self.resolve(&fk.references),
                parent_columns: fk.referenced_columns.clone(),
                on_update: fk.on_update,
                on_delete: fk.on_delete,
            })
            .filter(|edge| edge.child.schema == schema)
            .collect())
    }

    fn list_indexes(&mut self, schema: &str) -> Result<Vec<IndexDescriptor>, CatalogError> {
        Ok(self
            .document
            .indexes
            .iter()
            .map(|i| IndexDescriptor {
                table: self.resolve(&i.table),
                name: i.name.clone(),
                columns: i.columns.clone(),
                unique: i.unique,
                primary: i.primary,
                partial: i.partial,
            })
            .filter(|i| i.table.schema == schema)
            .collect())
    }

    fn list_policies(&mut self, schema: &str) -> Result<Vec<PolicyDescriptor>, CatalogError> {
        Ok(self
            .document
            .policies
            .iter()
            .map(|p| PolicyDescriptor {
                table: self.resolve(&p.table),
                name: p.name.clone(),
                command: p.command,
                roles: p.roles.clone(),
                using: p.using.clone(),
                with_check: p.with_check.clone(),
                mode: p.mode,
            })
            .filter(|p| p.table.schema == schema)
            .collect())
    }

    fn list_functions(
        &mut self,
        schema: &str,
        names: &[String],
    ) -> Result<Vec<String>, CatalogError> {
        Ok(names
            .iter()
            .filter(|name| {
                self.document.functions.iter().any(|f| {
                    let function = self.resolve(f);
                    function.schema == schema && &function.name == *name
                })
            })
            .cloned()
            .collect())
    }
}

/// Orphan probe evaluating the anti-join over a document's row data.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe<'c> {
    catalog: &'c StaticCatalog,
}

impl StaticProbe<'_> {
    fn rows(&self, table: &TableRef) -> Result<&[Map<String, Value>], ProbeError> {
        self.catalog
            .find_table(table)
            .and_then(|t| t.rows.as_deref())
            .ok_or_else(|| ProbeError::NoData(table.to_string()))
    }
}

impl OrphanProbe for StaticProbe<'_> {
    fn count_orphans(&mut self, edge: &ForeignKeyEdge) -> Result<u64, ProbeError> {
        let children = self.rows(&edge.child)?;
        let parents = self.rows(&edge.parent)?;

        let key = |row: &Map<String, Value>, columns: &[String]| -> Option<Vec<Value>> {
            columns
                .iter()
                .map(|c| row.get(c).filter(|v| !v.is_null()).cloned())
                .collect()
        };
        let parent_keys: Vec<Vec<Value>> = parents
            .iter()
            .filter_map(|row| key(row, &edge.parent_columns))
            .collect();

        let orphans = children
            .iter()
            .filter_map(|row| key(row, &edge.child_columns))
            .filter(|child| !parent_keys.contains(child))
            .count();
        debug!(constraint = %edge.constraint_name, orphans, "static orphan probe");
        Ok(orphans as u64)
    }
}

impl<'c> ProbeFactory for &'c StaticCatalog {
    type Probe = StaticProbe<'c>;

    fn open_probe(&self) -> Result<Self::Probe, ProbeError> {
        Ok(StaticProbe { catalog: *self })
    }
}

impl StaticCatalog {
    /// A probe over this catalog's row data.
    pub fn probe(&self) -> StaticProbe<'_> {
        StaticProbe { catalog: self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::introspect::{introspect, SnapshotRequest};

    const DOC: &str = r#"{
        "schema": "public",
        "tables": [
            {"name": "customers", "rlsEnabled": true,
             "columns": [{"name": "id", "type": "integer", "nullable": false}],
             "rows": [{"id": 1}, {"id": 2}]},
            {"name": "orders",
             "columns": [{"name": "id", "type": "integer", "nullable": false},
                         {"name": "customer_id", "type": "integer"}],
             "rows": [{"id": 10, "customer_id": 1}, {"id": 11, "customer_id": 9},
                      {"id": 12, "customer_id": null}, {"id": 13}]},
            {"name": "users", "schema": "auth",
             "columns": [{"name": "id", "type": "uuid", "nullable": false}]}
        ],
        "foreignKeys": [
            {"name": "orders_customer_id_fkey", "table": "orders", "columns": ["customer_id"],
             "references": "customers", "referencedColumns": ["id"], "onDelete": "cascade"}
        ],
        "indexes": [
            {"table": "customers", "name": "customers_pkey", "columns": ["id"], "unique": true, "primary": true},
            {"table": "orders", "name": "orders_open_customer_idx", "columns": ["customer_id"], "partial": true}
        ],
        "functions": ["is_admin", "auth.uid"]
    }"#;

    #[test]
    fn introspects_into_a_consistent_snapshot() {
        let mut catalog = StaticCatalog::from_json(DOC).unwrap();
        let snapshot = introspect(
            &mut catalog,
            &SnapshotRequest {
                schema: "public".to_string(),
                helper_names: vec!["is_admin".to_string(), "uid".to_string()],
            },
        )
        .unwrap();

        assert_eq!(snapshot.audited_tables().count(), 2);
        assert_eq!(snapshot.foreign_keys()[0].on_delete, ReferentialAction::Cascade);
        assert_eq!(
            snapshot.table(&TableRef::new("public", "customers")).unwrap().primary_key,
            vec!["id".to_string()]
        );
        assert!(snapshot.function_present("is_admin"));
        assert!(!snapshot.function_present("uid"));

        let orders = TableRef::new("public", "orders");
        let partial: Vec<_> = snapshot.indexes_on(&orders).collect();
        assert_eq!(partial.len(), 1);
        assert!(partial[0].partial);
        assert!(!partial[0].covers_prefix(&["customer_id".to_string()]));
    }

    #[test]
    fn probe_ignores_null_keys_and_counts_dangling_ones() {
        let catalog = StaticCatalog::from_json(DOC).unwrap();
        let mut source = catalog.clone();
        let edges = source.list_foreign_keys("public").unwrap();
        assert_eq!(catalog.probe().count_orphans(&edges[0]), Ok(1));
    }

    #[test]
    fn probe_without_rows_reports_no_data() {
        let catalog = StaticCatalog::from_json(DOC).unwrap();
        let edge = ForeignKeyEdge {
            constraint_name: "orders_owner_fkey".to_string(),
            child: TableRef::new("public", "orders"),
            child_columns: vec!["customer_id".to_string()],
            parent: TableRef::new("auth", "users"),
            parent_columns: vec!["id".to_string()],
            on_update: ReferentialAction::NoAction,
            on_delete: ReferentialAction::NoAction,
        };
        assert_eq!(
            catalog.probe().count_orphans(&edge),
            Err(ProbeError::NoData("auth.users".to_string()))
        );
    }

    #[test]
    fn unknown_document_fields_are_rejected() {
        let err = StaticCatalog::from_json(r#"{"tabels": []}"#).unwrap_err();
        assert!(matches!(err, CatalogError::Document(_)));
    }
}
