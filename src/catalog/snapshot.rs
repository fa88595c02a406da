use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CatalogError;
use crate::parser::names::{quote_ident, table_lookup_candidates};

/// Schema-qualified table identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableRef {
    /// Schema (namespace) name.
    pub schema: String,
    /// Relation name.
    pub name: String,
}

impl TableRef {
    /// Build a table reference from its parts.
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Parse `schema.name`, falling back to `default_schema` for bare names.
    pub fn parse(name: &str, default_schema: &str) -> Self {
        let (schema, relation) = table_lookup_candidates(name, default_schema)
            .into_iter()
            .next()
            .unwrap_or_else(|| (default_schema.to_string(), name.to_string()));
        Self::new(schema, relation)
    }

    /// Quoted `"schema"."name"` form for generated DDL.
    pub fn quoted(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// One column of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDescriptor {
    /// Column name.
    pub name: String,
    /// Declared type as reported by the catalog.
    #[serde(rename = "type")]
    pub data_type: String,
    /// Whether the column accepts NULL.
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    /// Column default expression, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

fn default_nullable() -> bool {
    true
}

/// One audited (or referenced) table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    /// Table identity.
    pub table: TableRef,
    /// Columns in ordinal order.
    pub columns: Vec<ColumnDescriptor>,
    /// Primary key columns in key order (empty when unknown or absent).
    pub primary_key: Vec<String>,
    /// `relrowsecurity`.
    pub rls_enabled: bool,
    /// `relforcerowsecurity`.
    pub rls_forced: bool,
    /// Lives outside the audited schema; only present because an edge points at it.
    pub external: bool,
}

impl TableDescriptor {
    /// Find a column by exact name.
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Returns true when the table has a column named `name`.
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }
}

/// Referential action of a foreign key (`ON UPDATE` / `ON DELETE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReferentialAction {
    /// `NO ACTION`
    #[default]
    NoAction,
    /// `RESTRICT`
    Restrict,
    /// `CASCADE`
    Cascade,
    /// `SET NULL`
    SetNull,
    /// `SET DEFAULT`
    SetDefault,
}

impl ReferentialAction {
    /// Decode `pg_constraint.confupdtype` / `confdeltype`.
    pub fn from_pg_code(code: &str) -> Option<Self> {
        match code {
            "a" => Some(ReferentialAction::NoAction),
            "r" => Some(ReferentialAction::Restrict),
            "c" => Some(ReferentialAction::Cascade),
            "n" => Some(ReferentialAction::SetNull),
            "d" => Some(ReferentialAction::SetDefault),
            _ => None,
        }
    }
}

impl fmt::Display for ReferentialAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferentialAction::NoAction => write!(f, "NO ACTION"),
            ReferentialAction::Restrict => write!(f, "RESTRICT"),
            ReferentialAction::Cascade => write!(f, "CASCADE"),
            ReferentialAction::SetNull => write!(f, "SET NULL"),
            ReferentialAction::SetDefault => write!(f, "SET DEFAULT"),
        }
    }
}

/// One foreign-key constraint. Multi-edges between the same table pair are
/// kept distinct; composite keys are one edge with ordered column lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyEdge {
    /// Constraint name.
    pub constraint_name: String,
    /// Referencing table.
    pub child: TableRef,
    /// Referencing columns, in key order.
    pub child_columns: Vec<String>,
    /// Referenced table.
    pub parent: TableRef,
    /// Referenced columns, aligned with `child_columns`.
    pub parent_columns: Vec<String>,
    /// `ON UPDATE` action.
    pub on_update: ReferentialAction,
    /// `ON DELETE` action.
    pub on_delete: ReferentialAction,
}

impl ForeignKeyEdge {
    /// True when the constraint references its own table.
    pub fn is_self_reference(&self) -> bool {
        self.child == self.parent
    }

    /// `a, b` rendering of the child columns.
    pub fn child_columns_label(&self) -> String {
        self.child_columns.join(", ")
    }

    /// `a, b` rendering of the parent columns.
    pub fn parent_columns_label(&self) -> String {
        self.parent_columns.join(", ")
    }
}

impl fmt::Display for ForeignKeyEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}) -> {}({})",
            self.child,
            self.child_columns_label(),
            self.parent,
            self.parent_columns_label()
        )
    }
}

/// One index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDescriptor {
    /// Indexed table.
    pub table: TableRef,
    /// Index name.
    pub name: String,
    /// Key columns in index order; expression keys are reported as
    /// [`IndexDescriptor::EXPRESSION_KEY`].
    pub columns: Vec<String>,
    /// `indisunique`.
    pub unique: bool,
    /// `indisprimary`.
    pub primary: bool,
    /// The index has a `WHERE` predicate.
    pub partial: bool,
}

impl IndexDescriptor {
    /// Placeholder for an expression key column.
    pub const EXPRESSION_KEY: &'static str = "<expr>";

    /// True when `columns` are exactly the leading key columns, in any order.
    ///
    /// Partial indexes and prefixes holding an expression key never cover.
    pub fn covers_prefix(&self, columns: &[String]) -> bool {
        if self.partial || columns.is_empty() || self.columns.len() < columns.len() {
            return false;
        }
        let prefix = &self.columns[..columns.len()];
        !prefix.iter().any(|c| c == Self::EXPRESSION_KEY) && columns.iter().all(|c| prefix.contains(c))
    }
}

/// The command a policy applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PolicyCommand {
    /// Policy applies to SELECT queries only.
    Select,
    /// Policy applies to INSERT queries only.
    Insert,
    /// Policy applies to UPDATE queries only.
    Update,
    /// Policy applies to DELETE queries only.
    Delete,
    /// Policy applies to all DML commands.
    All,
}

impl PolicyCommand {
    /// True when a policy for `self` also governs `other`.
    pub fn covers(self, other: PolicyCommand) -> bool {
        self == PolicyCommand::All || self == other
    }
}

impl fmt::Display for PolicyCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyCommand::Select => write!(f, "SELECT"),
            PolicyCommand::Insert => write!(f, "INSERT"),
            PolicyCommand::Update => write!(f, "UPDATE"),
            PolicyCommand::Delete => write!(f, "DELETE"),
            PolicyCommand::All => write!(f, "ALL"),
        }
    }
}

impl std::str::FromStr for PolicyCommand {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "SELECT" | "R" => Ok(PolicyCommand::Select),
            "INSERT" | "A" => Ok(PolicyCommand::Insert),
            "UPDATE" | "W" => Ok(PolicyCommand::Update),
            "DELETE" | "D" => Ok(PolicyCommand::Delete),
            "ALL" | "*" => Ok(PolicyCommand::All),
            _ => Err(format!("Invalid policy command: {s}")),
        }
    }
}

/// Policy combination mode in `PostgreSQL` RLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PolicyMode {
    /// OR-combined policy branch.
    #[default]
    Permissive,
    /// AND-combined policy branch.
    Restrictive,
}

impl fmt::Display for PolicyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyMode::Permissive => write!(f, "PERMISSIVE"),
            PolicyMode::Restrictive => write!(f, "RESTRICTIVE"),
        }
    }
}

impl std::str::FromStr for PolicyMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "PERMISSIVE" => Ok(PolicyMode::Permissive),
            "RESTRICTIVE" => Ok(PolicyMode::Restrictive),
            _ => Err(format!("Invalid policy mode: {s}")),
        }
    }
}

/// One row-level-security policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDescriptor {
    /// Table the policy is attached to.
    pub table: TableRef,
    /// Policy name.
    pub name: String,
    /// Command the policy governs.
    pub command: PolicyCommand,
    /// Roles the policy applies to (`public` when unrestricted).
    pub roles: Vec<String>,
    /// `USING` predicate text.
    pub using: Option<String>,
    /// `WITH CHECK` predicate text.
    pub with_check: Option<String>,
    /// Permissive or restrictive.
    pub mode: PolicyMode,
}

impl PolicyDescriptor {
    /// Restrictive policies narrow access and never satisfy an expected grant.
    pub fn is_permissive(&self) -> bool {
        self.mode == PolicyMode::Permissive
    }
}

/// Existence of a named predicate function. The body is never inspected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HelperFunction {
    /// Function name (unqualified, in the audited schema).
    pub name: String,
    /// Whether a function of that name exists.
    pub present: bool,
}

/// Point-in-time, immutable view of the catalog. Every component reads it by
/// reference; nothing mutates it after construction.
#[derive(Debug, Clone)]
pub struct Snapshot {
    schema: String,
    taken_at: DateTime<Utc>,
    tables: BTreeMap<TableRef, TableDescriptor>,
    foreign_keys: Vec<ForeignKeyEdge>,
    indexes: Vec<IndexDescriptor>,
    policies: Vec<PolicyDescriptor>,
    functions: Vec<HelperFunction>,
}

impl Snapshot {
    /// Assemble a snapshot, rejecting edges, indexes or policies that do not
    /// resolve to a described table and column.
    pub fn new(
        schema: impl Into<String>,
        taken_at: DateTime<Utc>,
        tables: Vec<TableDescriptor>,
        foreign_keys: Vec<ForeignKeyEdge>,
        indexes: Vec<IndexDescriptor>,
        policies: Vec<PolicyDescriptor>,
        functions: Vec<HelperFunction>,
    ) -> Result<Self, CatalogError> {
        let tables: BTreeMap<TableRef, TableDescriptor> = tables
            .into_iter()
            .map(|t| (t.table.clone(), t))
            .collect();

        for edge in &foreign_keys {
            if edge.child_columns.is_empty() || edge.child_columns.len() != edge.parent_columns.len()
            {
                return Err(CatalogError::Inconsistent(format!(
                    "constraint {} has mismatched column lists",
                    edge.constraint_name
                )));
            }
            for (table, columns) in [
                (&edge.child, &edge.child_columns),
                (&edge.parent, &edge.parent_columns),
            ] {
                let Some(descriptor) = tables.get(table) else {
                    return Err(CatalogError::Inconsistent(format!(
                        "constraint {} references undescribed table {table}",
                        edge.constraint_name
                    )));
                };
                if let Some(missing) = columns.iter().find(|c| !descriptor.has_column(c)) {
                    return Err(CatalogError::Inconsistent(format!(
                        "constraint {} references unknown column {table}.{missing}",
                        edge.constraint_name
                    )));
                }
            }
        }

        if let Some(index) = indexes.iter().find(|i| !tables.contains_key(&i.table)) {
            return Err(CatalogError::Inconsistent(format!(
                "index {} is attached to undescribed table {}",
                index.name, index.table
            )));
        }
        if let Some(policy) = policies.iter().find(|p| !tables.contains_key(&p.table)) {
            return Err(CatalogError::Inconsistent(format!(
                "policy {} is attached to undescribed table {}",
                policy.name, policy.table
            )));
        }

        Ok(Self {
            schema: schema.into(),
            taken_at,
            tables,
            foreign_keys,
            indexes,
            policies,
            functions,
        })
    }

    /// Audited schema.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// When the snapshot was taken.
    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    /// All described tables, external ones included, in name order.
    pub fn tables(&self) -> impl Iterator<Item = &TableDescriptor> {
        self.tables.values()
    }

    /// Tables of the audited schema, in name order.
    pub fn audited_tables(&self) -> impl Iterator<Item = &TableDescriptor> {
        self.tables.values().filter(|t| !t.external)
    }

    /// Look up a table by identity.
    pub fn table(&self, table: &TableRef) -> Option<&TableDescriptor> {
        self.tables.get(table)
    }

    /// Resolve a configured (possibly unqualified) table name.
    pub fn resolve_table(&self, name: &str) -> Option<&TableDescriptor> {
        table_lookup_candidates(name, &self.schema)
            .into_iter()
            .find_map(|(schema, relation)| self.tables.get(&TableRef::new(schema, relation)))
    }

    /// All foreign-key edges in catalog order.
    pub fn foreign_keys(&self) -> &[ForeignKeyEdge] {
        &self.foreign_keys
    }

    /// All indexes in catalog order.
    pub fn indexes(&self) -> &[IndexDescriptor] {
        &self.indexes
    }

    /// Indexes attached to `table`.
    pub fn indexes_on<'a>(
        &'a self,
        table: &'a TableRef,
    ) -> impl Iterator<Item = &'a IndexDescriptor> + 'a {
        self.indexes.iter().filter(move |i| &i.table == table)
    }

    /// All policies in catalog order.
    pub fn policies(&self) -> &[PolicyDescriptor] {
        &self.policies
    }

    /// Policies attached to `table`.
    pub fn policies_on<'a>(
        &'a self,
        table: &'a TableRef,
    ) -> impl Iterator<Item = &'a PolicyDescriptor> + 'a {
        self.policies.iter().filter(move |p| &p.table == table)
    }

    /// Helper-function existence results.
    pub fn functions(&self) -> &[HelperFunction] {
        &self.functions
    }

    /// Whether the named helper exists in the audited schema.
    pub fn function_present(&self, name: &str) -> bool {
        self.functions.iter().any(|f| f.name == name && f.present)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str) -> ColumnDescriptor {
        ColumnDescriptor {
            name: name.to_string(),
            data_type: "uuid".to_string(),
            nullable: true,
            default: None,
        }
    }

    fn table(name: &str, columns: &[&str]) -> TableDescriptor {
        TableDescriptor {
            table: TableRef::new("public", name),
            columns: columns.iter().map(|c| column(c)).collect(),
            primary_key: vec!["id".to_string()],
            rls_enabled: false,
            rls_forced: false,
            external: false,
        }
    }

    fn edge(child_column: &str) -> ForeignKeyEdge {
        ForeignKeyEdge {
            constraint_name: "orders_customer_id_fkey".to_string(),
            child: TableRef::new("public", "orders"),
            child_columns: vec![child_column.to_string()],
            parent: TableRef::new("public", "customers"),
            parent_columns: vec!["id".to_string()],
            on_update: ReferentialAction::NoAction,
            on_delete: ReferentialAction::Cascade,
        }
    }

    #[test]
    fn snapshot_rejects_edges_to_unknown_columns() {
        let err = Snapshot::new(
            "public",
            Utc::now(),
            vec![
                table("orders", &["id", "customer_id"]),
                table("customers", &["id"]),
            ],
            vec![edge("buyer_id")],
            Vec::new(),
            Vec::new(),
            Vec::new(),
        )
        .expect_err("edge to unknown column should be rejected");
        assert!(err.to_string().contains("public.orders.buyer_id"));
    }

    #[test]
    fn snapshot_resolves_bare_and_qualified_names() {
        let snapshot = Snapshot::new(
            "public",
            Utc::now(),
            vec![
                table("orders", &["id", "customer_id"]),
                table("customers", &["id"]),
            ],
            vec![edge("customer_id")],
            Vec::new(),
            Vec::new(),
            Vec::new(),
        )
        .unwrap();

        assert!(snapshot.resolve_table("orders").is_some());
        assert!(snapshot.resolve_table("public.customers").is_some());
        assert!(snapshot.resolve_table("auth.users").is_none());
    }

    #[test]
    fn index_prefix_coverage_ignores_order_within_prefix() {
        let index = IndexDescriptor {
            table: TableRef::new("public", "trips"),
            name: "trips_route_driver_idx".to_string(),
            columns: vec!["route_id".to_string(), "driver_id".to_string()],
            unique: false,
            primary: false,
            partial: false,
        };
        assert!(index.covers_prefix(&["route_id".to_string()]));
        assert!(index.covers_prefix(&["driver_id".to_string(), "route_id".to_string()]));
        assert!(!index.covers_prefix(&["driver_id".to_string()]));
    }

    #[test]
    fn partial_and_expression_indexes_never_cover() {
        let partial = IndexDescriptor {
            table: TableRef::new("public", "trips"),
            name: "trips_open_driver_idx".to_string(),
            columns: vec!["driver_id".to_string()],
            unique: false,
            primary: false,
            partial: true,
        };
        assert!(!partial.covers_prefix(&["driver_id".to_string()]));

        let expression = IndexDescriptor {
            columns: vec![
                IndexDescriptor::EXPRESSION_KEY.to_string(),
                "driver_id".to_string(),
            ],
            partial: false,
            ..partial
        };
        assert!(!expression.covers_prefix(&["driver_id".to_string()]));
        assert!(!expression.covers_prefix(&[
            "driver_id".to_string(),
            IndexDescriptor::EXPRESSION_KEY.to_string()
        ]));
    }

    #[test]
    fn policy_command_parses_catalog_spellings() {
        assert_eq!("select".parse::<PolicyCommand>(), Ok(PolicyCommand::Select));
        assert_eq!("*".parse::<PolicyCommand>(), Ok(PolicyCommand::All));
        assert!(PolicyCommand::All.covers(PolicyCommand::Update));
        assert!(!PolicyCommand::Select.covers(PolicyCommand::Update));
    }
}
