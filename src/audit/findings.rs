use std::fmt;

use serde::{Deserialize, Serialize};

use crate::catalog::snapshot::{ForeignKeyEdge, PolicyCommand, TableRef};
use crate::classifier::classification::{HelperRole, Profile};
use crate::classifier::purpose::PolicyPurpose;

/// Category of an audit finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FindingKind {
    /// Child rows reference a parent row that does not exist.
    OrphanedRows,
    /// A foreign key has no supporting index on the child table.
    MissingIndex,
    /// A table lacks a policy for one of its profile's purposes.
    MissingPolicy,
    /// Row-level security is disabled on a table that needs it.
    #[serde(rename = "RLSDisabled")]
    RlsDisabled,
    /// A helper predicate function does not exist.
    MissingHelper,
    /// A table named by the classification map does not exist.
    MissingTable,
    /// A column named by the classification map does not exist.
    MissingColumn,
    /// An orphan probe could not complete.
    AuditorError,
}

impl FindingKind {
    /// Every kind, in report order.
    pub const ALL: [FindingKind; 8] = [
        FindingKind::OrphanedRows,
        FindingKind::MissingIndex,
        FindingKind::MissingPolicy,
        FindingKind::RlsDisabled,
        FindingKind::MissingHelper,
        FindingKind::MissingTable,
        FindingKind::MissingColumn,
        FindingKind::AuditorError,
    ];

    /// Fixed severity of this kind.
    pub fn severity(self) -> Severity {
        match self {
            FindingKind::MissingIndex => Severity::Low,
            FindingKind::OrphanedRows | FindingKind::MissingTable | FindingKind::AuditorError => {
                Severity::Medium
            }
            FindingKind::MissingPolicy | FindingKind::MissingHelper | FindingKind::MissingColumn => {
                Severity::High
            }
            FindingKind::RlsDisabled => Severity::Critical,
        }
    }
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FindingKind::OrphanedRows => "OrphanedRows",
            FindingKind::MissingIndex => "MissingIndex",
            FindingKind::MissingPolicy => "MissingPolicy",
            FindingKind::RlsDisabled => "RLSDisabled",
            FindingKind::MissingHelper => "MissingHelper",
            FindingKind::MissingTable => "MissingTable",
            FindingKind::MissingColumn => "MissingColumn",
            FindingKind::AuditorError => "AuditorError",
        };
        f.write_str(label)
    }
}

/// How urgently a finding needs attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Performance or hygiene.
    Low,
    /// Data quality or incomplete audit.
    Medium,
    /// Access-control gap.
    High,
    /// Table exposed without row-level security.
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Why an orphan probe did not produce a count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeFailure {
    /// The statement hit the per-query timeout.
    Timeout,
    /// The probe connection dropped.
    ConnectionLost,
    /// The catalog source has no row data for the edge's tables.
    NoData,
    /// Any other query failure (permissions, missing objects).
    QueryFailed,
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeFailure::Timeout => write!(f, "timeout"),
            ProbeFailure::ConnectionLost => write!(f, "connection lost"),
            ProbeFailure::NoData => write!(f, "no row data"),
            ProbeFailure::QueryFailed => write!(f, "query failed"),
        }
    }
}

/// Structured, kind-specific payload of a finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all_fields = "camelCase")]
pub enum FindingDetail {
    /// `count` child rows have no parent.
    OrphanedRows {
        /// Number of orphaned child rows.
        count: u64,
        /// Violated constraint.
        constraint: String,
        /// Referenced table.
        parent_table: String,
        /// Referenced columns.
        parent_columns: Vec<String>,
    },
    /// No index leads with the foreign-key columns.
    MissingIndex {
        /// Key columns of the suggested index, in constraint order.
        columns: Vec<String>,
        /// Every constraint served by the suggested index.
        constraints: Vec<String>,
        /// Deterministic name of the suggested index.
        suggested_name: String,
    },
    /// No existing policy serves `purpose`.
    MissingPolicy {
        /// The uncovered purpose.
        purpose: PolicyPurpose,
        /// Profile of the table.
        profile: Profile,
        /// Name the remediation policy will carry.
        policy_name: String,
        /// Command the remediation policy will govern.
        command: PolicyCommand,
        /// Existing policy that holds `policy_name` without serving the purpose.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conflicting_policy: Option<String>,
    },
    /// Row-level security is off.
    #[serde(rename = "RLSDisabled")]
    RlsDisabled {
        /// Profile of the table.
        profile: Profile,
    },
    /// A helper function is absent.
    MissingHelper {
        /// Configured function name.
        function: String,
        /// Helper role it plays.
        role: HelperRole,
    },
    /// The classification map expects a table the schema lacks.
    MissingTable {
        /// Map entry naming the table.
        entry: String,
        /// Map setting the entry comes from (`tables`, `identity.table`).
        setting: String,
    },
    /// The classification map expects a column the table lacks.
    MissingColumn {
        /// Map setting naming the column (`tenantColumn`, `identity.roleColumn`, ...).
        setting: String,
    },
    /// The orphan probe for `constraint` failed.
    AuditorError {
        /// Constraint whose probe failed.
        constraint: String,
        /// Failure category.
        reason: ProbeFailure,
        /// Driver message.
        message: String,
    },
}

impl FindingDetail {
    /// Kind of this payload.
    pub fn kind(&self) -> FindingKind {
        match self {
            FindingDetail::OrphanedRows { .. } => FindingKind::OrphanedRows,
            FindingDetail::MissingIndex { .. } => FindingKind::MissingIndex,
            FindingDetail::MissingPolicy { .. } => FindingKind::MissingPolicy,
            FindingDetail::RlsDisabled { .. } => FindingKind::RlsDisabled,
            FindingDetail::MissingHelper { .. } => FindingKind::MissingHelper,
            FindingDetail::MissingTable { .. } => FindingKind::MissingTable,
            FindingDetail::MissingColumn { .. } => FindingKind::MissingColumn,
            FindingDetail::AuditorError { .. } => FindingKind::AuditorError,
        }
    }
}

/// One detected gap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditFinding {
    /// Table the finding is about (`None` for helper findings).
    pub table: Option<TableRef>,
    /// Column(s) involved, comma separated.
    pub column: Option<String>,
    /// Severity derived from the kind.
    pub severity: Severity,
    /// Kind-specific payload.
    pub detail: FindingDetail,
}

impl AuditFinding {
    fn new(table: Option<TableRef>, column: Option<String>, detail: FindingDetail) -> Self {
        Self {
            table,
            column,
            severity: detail.kind().severity(),
            detail,
        }
    }

    /// `count` orphans on `edge`.
    pub fn orphaned_rows(edge: &ForeignKeyEdge, count: u64) -> Self {
        Self::new(
            Some(edge.child.clone()),
            Some(edge.child_columns_label()),
            FindingDetail::OrphanedRows {
                count,
                constraint: edge.constraint_name.clone(),
                parent_table: edge.parent.to_string(),
                parent_columns: edge.parent_columns.clone(),
            },
        )
    }

    /// The probe of `edge` failed.
    pub fn auditor_error(edge: &ForeignKeyEdge, reason: ProbeFailure, message: String) -> Self {
        Self::new(
            Some(edge.child.clone()),
            Some(edge.child_columns_label()),
            FindingDetail::AuditorError {
                constraint: edge.constraint_name.clone(),
                reason,
                message,
            },
        )
    }

    /// `columns` of `table` need an index.
    pub fn missing_index(
        table: &TableRef,
        columns: &[String],
        constraints: Vec<String>,
        suggested_name: String,
    ) -> Self {
        Self::new(
            Some(table.clone()),
            Some(columns.join(", ")),
            FindingDetail::MissingIndex {
                columns: columns.to_vec(),
                constraints,
                suggested_name,
            },
        )
    }

    /// `table` lacks a policy for `purpose`.
    pub fn missing_policy(
        table: &TableRef,
        profile: Profile,
        purpose: PolicyPurpose,
        column: Option<String>,
        conflicting_policy: Option<String>,
    ) -> Self {
        Self::new(
            Some(table.clone()),
            column,
            FindingDetail::MissingPolicy {
                purpose,
                profile,
                policy_name: purpose.policy_name(table),
                command: purpose.command(),
                conflicting_policy,
            },
        )
    }

    /// `table` has row-level security disabled.
    pub fn rls_disabled(table: &TableRef, profile: Profile) -> Self {
        Self::new(
            Some(table.clone()),
            None,
            FindingDetail::RlsDisabled { profile },
        )
    }

    /// Helper `function` playing `role` is missing.
    pub fn missing_helper(function: &str, role: HelperRole) -> Self {
        Self::new(
            None,
            None,
            FindingDetail::MissingHelper {
                function: function.to_string(),
                role,
            },
        )
    }

    /// The map's `setting` names `entry`, which resolves to the absent `table`.
    pub fn missing_table(table: &TableRef, entry: &str, setting: &str) -> Self {
        Self::new(
            Some(table.clone()),
            None,
            FindingDetail::MissingTable {
                entry: entry.to_string(),
                setting: setting.to_string(),
            },
        )
    }

    /// The map's `setting` names `column`, which `table` lacks.
    pub fn missing_column(table: &TableRef, column: &str, setting: &str) -> Self {
        Self::new(
            Some(table.clone()),
            Some(column.to_string()),
            FindingDetail::MissingColumn {
                setting: setting.to_string(),
            },
        )
    }

    /// Kind of the finding.
    pub fn kind(&self) -> FindingKind {
        self.detail.kind()
    }

    /// One-line human description.
    pub fn describe(&self) -> String {
        let table = self
            .table
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        match &self.detail {
            FindingDetail::OrphanedRows {
                count,
                constraint,
                parent_table,
                ..
            } => format!("{count} row(s) of {table} violate {constraint} (parent {parent_table})"),
            FindingDetail::MissingIndex {
                columns,
                suggested_name,
                ..
            } => format!(
                "{table}({}) has no index; suggested {suggested_name}",
                columns.join(", ")
            ),
            FindingDetail::MissingPolicy {
                purpose,
                policy_name,
                conflicting_policy: None,
                ..
            } => format!("{table} has no {purpose} policy; suggested {policy_name}"),
            FindingDetail::MissingPolicy {
                purpose,
                command,
                conflicting_policy: Some(existing),
                ..
            } => format!(
                "{table} has no {purpose} policy; {existing} holds its name but is not a permissive {command} policy"
            ),
            FindingDetail::RlsDisabled { profile } => {
                format!("{table} is {profile} but row level security is disabled")
            }
            FindingDetail::MissingHelper { function, role } => {
                format!("helper function {function} ({role}) is missing")
            }
            FindingDetail::MissingTable { entry, setting } => {
                format!("{setting} entry {entry} names {table}, which does not exist")
            }
            FindingDetail::MissingColumn { setting } => format!(
                "{table} has no column {} named by {setting}",
                self.column.as_deref().unwrap_or_default()
            ),
            FindingDetail::AuditorError {
                constraint,
                reason,
                message,
            } => format!("probe of {constraint} on {table} failed ({reason}): {message}"),
        }
    }
}

/// Append-only, ordered log of findings. A finding's id is its position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FindingLog {
    findings: Vec<AuditFinding>,
}

impl FindingLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a finding and return its id.
    pub fn push(&mut self, finding: AuditFinding) -> usize {
        self.findings.push(finding);
        self.findings.len() - 1
    }

    /// Append several findings in order.
    pub fn extend(&mut self, findings: impl IntoIterator<Item = AuditFinding>) {
        self.findings.extend(findings);
    }

    /// All findings in emission order.
    pub fn findings(&self) -> &[AuditFinding] {
        &self.findings
    }

    /// `(id, finding)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &AuditFinding)> {
        self.findings.iter().enumerate()
    }

    /// Number of findings.
    pub fn len(&self) -> usize {
        self.findings.len()
    }

    /// True when the audit found nothing.
    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }

    /// Findings of one kind.
    pub fn of_kind(&self, kind: FindingKind) -> impl Iterator<Item = &AuditFinding> {
        self.findings.iter().filter(move |f| f.kind() == kind)
    }

    /// Findings about `table`.
    pub fn on_table<'a>(
        &'a self,
        table: &'a TableRef,
    ) -> impl Iterator<Item = (usize, &'a AuditFinding)> + 'a {
        self.iter().filter(move |(_, f)| f.table.as_ref() == Some(table))
    }
}
