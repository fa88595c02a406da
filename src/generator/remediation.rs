use std::collections::BTreeSet;
use std::fmt;

use tracing::{info, warn};

use crate::audit::findings::{FindingDetail, FindingKind};
use crate::audit::index_advisor::qualified_index_name;
use crate::audit::integrity::orphan_predicate;
use crate::audit::policy_auditor::TableAudit;
use crate::audit::AuditOutcome;
use crate::catalog::snapshot::{Snapshot, TableRef};
use crate::classifier::classification::{ClassificationMap, HelperRole};
use crate::error::RemediationError;
use crate::generator::templates::{
    create_index, enable_rls, guarded_create_policy, helper_definition, policy_template,
    PolicyTemplate, TemplateContext,
};
use crate::parser::names::quote_ident;

/// Default current-user expression when the map has no identity section.
const DEFAULT_CURRENT_USER: &str = "auth.uid()";

/// Script section, in emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Section {
    /// Helper function definitions.
    Helpers = 1,
    /// Foreign-key indexes.
    Indexes = 2,
    /// RLS enablement with its policies, table by table.
    AccessControl = 3,
    /// Commented-out orphan cleanup candidates.
    OrphanAdvisory = 4,
}

impl Section {
    /// Every section, in order.
    pub const ALL: [Section; 4] = [
        Section::Helpers,
        Section::Indexes,
        Section::AccessControl,
        Section::OrphanAdvisory,
    ];

    fn title(self) -> &'static str {
        match self {
            Section::Helpers => "Helper functions",
            Section::Indexes => "Foreign-key indexes",
            Section::AccessControl => "Row level security",
            Section::OrphanAdvisory => "Orphaned rows (advisory, not executed)",
        }
    }
}

/// What a statement does, in structured form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemediationAction {
    /// Define a missing helper function.
    DefineHelper {
        /// Helper role.
        role: HelperRole,
        /// Function name.
        name: String,
    },
    /// Create an index.
    CreateIndex {
        /// Indexed table.
        table: TableRef,
        /// Index name.
        name: String,
        /// Key columns.
        columns: Vec<String>,
    },
    /// Enable row-level security.
    EnableRls {
        /// Target table.
        table: TableRef,
    },
    /// Create a policy unless one of that name exists.
    CreatePolicy {
        /// Target table.
        table: TableRef,
        /// Policy to create.
        policy: PolicyTemplate,
    },
    /// Commented-out cleanup of orphaned rows.
    Advisory {
        /// Constraint with orphans.
        constraint: String,
    },
}

impl RemediationAction {
    /// Table the action touches.
    pub fn table(&self) -> Option<&TableRef> {
        match self {
            RemediationAction::CreateIndex { table, .. }
            | RemediationAction::EnableRls { table }
            | RemediationAction::CreatePolicy { table, .. } => Some(table),
            RemediationAction::DefineHelper { .. } | RemediationAction::Advisory { .. } => None,
        }
    }
}

impl fmt::Display for RemediationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemediationAction::DefineHelper { name, .. } => write!(f, "define function {name}"),
            RemediationAction::CreateIndex { table, name, .. } => {
                write!(f, "create index {name} on {table}")
            }
            RemediationAction::EnableRls { table } => {
                write!(f, "enable row level security on {table}")
            }
            RemediationAction::CreatePolicy { table, policy } => {
                write!(f, "create policy {} on {table}", policy.name)
            }
            RemediationAction::Advisory { constraint } => {
                write!(f, "review orphaned rows of {constraint}")
            }
        }
    }
}

/// One DDL unit of the script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemediationStatement {
    /// Section the statement belongs to.
    pub section: Section,
    /// Structured action.
    pub action: RemediationAction,
    /// SQL text (fully commented out for advisories).
    pub sql: String,
    /// Comment naming the findings addressed.
    pub rationale: String,
    /// Ids of the findings addressed.
    pub finding_ids: Vec<usize>,
}

/// A table or helper whose remediation could not be synthesized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRemediation {
    /// Table or function name.
    pub subject: String,
    /// Findings left without remediation.
    pub finding_ids: Vec<usize>,
    /// Why.
    pub error: RemediationError,
}

/// Ordered, idempotent remediation script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemediationPlan {
    /// Target schema.
    pub schema: String,
    /// Statements in section order.
    pub statements: Vec<RemediationStatement>,
    /// Skipped tables and helpers.
    pub skipped: Vec<SkippedRemediation>,
}

impl RemediationPlan {
    /// True when there is nothing executable or advisory to emit.
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Statements of one section.
    pub fn section(&self, section: Section) -> impl Iterator<Item = &RemediationStatement> {
        self.statements.iter().filter(move |s| s.section == section)
    }

    /// Short description of what addresses `finding_id`, if anything.
    pub fn remediation_for(&self, finding_id: usize) -> Option<String> {
        let actions: Vec<String> = self
            .statements
            .iter()
            .filter(|s| s.finding_ids.contains(&finding_id))
            .map(|s| s.action.to_string())
            .collect();
        if actions.is_empty() {
            None
        } else {
            Some(actions.join("; "))
        }
    }

    /// Whether remediation for `finding_id` was skipped.
    pub fn is_skipped(&self, finding_id: usize) -> bool {
        self.skipped
            .iter()
            .any(|s| s.finding_ids.contains(&finding_id))
    }

    /// Render the script: one transaction, sections in order, no timestamps.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "-- rls-audit remediation for schema {}\n",
            quote_ident(&self.schema)
        ));
        out.push_str("-- Every statement is guarded and safe to re-run.\n");

        if self.is_empty() {
            out.push_str("-- Nothing to remediate.\n");
            self.render_skipped(&mut out);
            return out;
        }

        out.push_str("\nBEGIN;\n");
        for section in Section::ALL {
            let statements: Vec<&RemediationStatement> = self.section(section).collect();
            if statements.is_empty() {
                continue;
            }
            out.push_str(&format!(
                "\n-- ============================================================\n\
                 -- {}. {}\n\
                 -- ============================================================\n",
                section as u8,
                section.title()
            ));
            let mut current_table: Option<&TableRef> = None;
            for statement in statements {
                if section == Section::AccessControl {
                    let table = statement.action.table();
                    if table != current_table {
                        if let Some(table) = table {
                            out.push_str(&format!("\n-- Table {table}\n"));
                        }
                        current_table = table;
                    }
                }
                out.push('\n');
                out.push_str(&statement.rationale);
                out.push('\n');
                out.push_str(&statement.sql);
                out.push('\n');
            }
        }

        self.render_skipped(&mut out);
        out.push_str("\nCOMMIT;\n");
        out
    }

    fn render_skipped(&self, out: &mut String) {
        if self.skipped.is_empty() {
            return;
        }
        out.push_str("\n-- Skipped:\n");
        for skipped in &self.skipped {
            out.push_str(&format!("--   {}: {}\n", skipped.subject, skipped.error));
        }
    }
}

fn rationale(outcome: &AuditOutcome, ids: &[usize]) -> String {
    ids.iter()
        .filter_map(|id| {
            outcome
                .findings
                .findings()
                .get(*id)
                .map(|f| format!("-- addresses #{id} {}: {}", f.kind(), f.describe()))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Build the remediation plan for an audit outcome.
pub fn synthesize(
    snapshot: &Snapshot,
    map: &ClassificationMap,
    outcome: &AuditOutcome,
) -> RemediationPlan {
    let mut plan = RemediationPlan {
        schema: snapshot.schema().to_string(),
        statements: Vec::new(),
        skipped: Vec::new(),
    };

    let available = synthesize_helpers(snapshot, map, outcome, &mut plan);
    synthesize_indexes(outcome, &mut plan);
    let ctx = TemplateContext {
        schema: snapshot.schema(),
        helpers: &map.helpers,
        current_user: map
            .identity
            .as_ref()
            .map_or(DEFAULT_CURRENT_USER, |i| i.current_user.as_str()),
    };
    for audit in &outcome.tables {
        synthesize_table(snapshot, audit, &ctx, &available, outcome, &mut plan);
    }
    synthesize_advisories(snapshot, outcome, &mut plan);

    info!(
        statements = plan.statements.len(),
        skipped = plan.skipped.len(),
        "remediation synthesized"
    );
    plan
}

/// Define missing helpers in dependency order; returns every helper usable
/// once the script has run.
fn synthesize_helpers(
    snapshot: &Snapshot,
    map: &ClassificationMap,
    outcome: &AuditOutcome,
    plan: &mut RemediationPlan,
) -> BTreeSet<HelperRole> {
    let mut available = BTreeSet::new();
    for role in HelperRole::ALL {
        let name = map.helpers.name(role);
        if snapshot.function_present(name) {
            available.insert(role);
            continue;
        }
        let ids: Vec<usize> = outcome
            .findings
            .iter()
            .filter(|(_, f)| {
                matches!(&f.detail, FindingDetail::MissingHelper { role: r, .. } if *r == role)
            })
            .map(|(id, _)| id)
            .collect();

        let definition = match role
            .depends_on()
            .iter()
            .find(|dependency| !available.contains(*dependency))
        {
            Some(dependency) => Err(RemediationError::HelperUnavailable {
                function: map.helpers.name(*dependency).to_string(),
            }),
            None => helper_definition(role, snapshot.schema(), map),
        };

        match definition {
            Ok(definition) => {
                available.insert(role);
                plan.statements.push(RemediationStatement {
                    section: Section::Helpers,
                    action: RemediationAction::DefineHelper {
                        role,
                        name: definition.name,
                    },
                    sql: definition.sql,
                    rationale: rationale(outcome, &ids),
                    finding_ids: ids,
                });
            }
            Err(error) => {
                warn!(function = name, %error, "helper remediation skipped");
                plan.skipped.push(SkippedRemediation {
                    subject: name.to_string(),
                    finding_ids: ids,
                    error,
                });
            }
        }
    }
    available
}

/// One `CREATE INDEX` per finding. Index names share the schema namespace, so a
/// name already emitted falls back to its qualified form.
fn synthesize_indexes(outcome: &AuditOutcome, plan: &mut RemediationPlan) {
    let mut emitted: BTreeSet<String> = BTreeSet::new();
    for (id, finding) in outcome.findings.iter() {
        let (
            Some(table),
            FindingDetail::MissingIndex {
                columns,
                suggested_name,
                ..
            },
        ) = (&finding.table, &finding.detail)
        else {
            continue;
        };
        let mut name = suggested_name.clone();
        if emitted.contains(&name) {
            name = qualified_index_name(table, columns);
            warn!(table = %table, suggested = %suggested_name, %name, "index name already emitted");
        }
        emitted.insert(name.clone());
        plan.statements.push(RemediationStatement {
            section: Section::Indexes,
            sql: create_index(table, &name, columns),
            action: RemediationAction::CreateIndex {
                table: table.clone(),
                name,
                columns: columns.clone(),
            },
            rationale: rationale(outcome, &[id]),
            finding_ids: vec![id],
        });
    }
}

/// ENABLE RLS and every missing policy of one table, or nothing at all.
fn synthesize_table(
    snapshot: &Snapshot,
    audit: &TableAudit,
    ctx: &TemplateContext<'_>,
    available: &BTreeSet<HelperRole>,
    outcome: &AuditOutcome,
    plan: &mut RemediationPlan,
) {
    if !audit.needs_rls_enable() && audit.missing.is_empty() {
        return;
    }
    let ids: Vec<usize> = outcome
        .findings
        .on_table(&audit.table)
        .filter(|(_, f)| matches!(f.kind(), FindingKind::RlsDisabled | FindingKind::MissingPolicy))
        .map(|(id, _)| id)
        .collect();

    let Some(descriptor) = snapshot.table(&audit.table) else {
        return;
    };

    let templates: Result<Vec<PolicyTemplate>, RemediationError> = audit
        .missing
        .iter()
        .map(|purpose| {
            if let Some(existing) = audit.conflict(*purpose) {
                return Err(RemediationError::PolicyNameTaken {
                    table: audit.table.to_string(),
                    policy: existing.to_string(),
                });
            }
            let template = policy_template(descriptor, &audit.classification, *purpose, ctx)?;
            if let Some(role) = template.helpers.iter().find(|r| !available.contains(*r)) {
                return Err(RemediationError::HelperUnavailable {
                    function: ctx.helpers.name(*role).to_string(),
                });
            }
            Ok(template)
        })
        .collect();

    let templates = match templates {
        Ok(templates) => templates,
        Err(error) => {
            warn!(table = %audit.table, %error, "table remediation skipped");
            plan.skipped.push(SkippedRemediation {
                subject: audit.table.to_string(),
                finding_ids: ids,
                error,
            });
            return;
        }
    };

    if audit.needs_rls_enable() {
        let rls_ids: Vec<usize> = ids
            .iter()
            .copied()
            .filter(|id| {
                outcome.findings.findings()[*id].kind() == FindingKind::RlsDisabled
            })
            .collect();
        plan.statements.push(RemediationStatement {
            section: Section::AccessControl,
            action: RemediationAction::EnableRls {
                table: audit.table.clone(),
            },
            sql: enable_rls(&audit.table),
            rationale: rationale(outcome, &rls_ids),
            finding_ids: rls_ids,
        });
    }

    for template in templates {
        let policy_ids: Vec<usize> = ids
            .iter()
            .copied()
            .filter(|id| {
                matches!(
                    &outcome.findings.findings()[*id].detail,
                    FindingDetail::MissingPolicy { purpose, .. } if *purpose == template.purpose
                )
            })
            .collect();
        plan.statements.push(RemediationStatement {
            section: Section::AccessControl,
            sql: guarded_create_policy(&audit.table, &template),
            action: RemediationAction::CreatePolicy {
                table: audit.table.clone(),
                policy: template,
            },
            rationale: rationale(outcome, &policy_ids),
            finding_ids: policy_ids,
        });
    }
}

fn synthesize_advisories(snapshot: &Snapshot, outcome: &AuditOutcome, plan: &mut RemediationPlan) {
    for (id, finding) in outcome.findings.iter() {
        let FindingDetail::OrphanedRows { constraint, .. } = &finding.detail else {
            continue;
        };
        let Some(edge) = snapshot
            .foreign_keys()
            .iter()
            .find(|e| &e.constraint_name == constraint && finding.table.as_ref() == Some(&e.child))
        else {
            continue;
        };
        let predicate = orphan_predicate(edge);
        let nullable = snapshot.table(&edge.child).is_some_and(|t| {
            edge.child_columns
                .iter()
                .all(|c| t.column(c).is_some_and(|c| c.nullable))
        });

        let mut lines = Vec::new();
        if nullable {
            let assignments = edge
                .child_columns
                .iter()
                .map(|c| format!("{} = NULL", quote_ident(c)))
                .collect::<Vec<_>>()
                .join(", ");
            lines.push(format!(
                "-- UPDATE {} AS c SET {assignments} WHERE {predicate};",
                edge.child.quoted()
            ));
        }
        lines.push(format!(
            "-- DELETE FROM {} AS c WHERE {predicate};",
            edge.child.quoted()
        ));

        plan.statements.push(RemediationStatement {
            section: Section::OrphanAdvisory,
            action: RemediationAction::Advisory {
                constraint: constraint.clone(),
            },
            sql: lines.join("\n"),
            rationale: rationale(outcome, &[id]),
            finding_ids: vec![id],
        });
    }
}
