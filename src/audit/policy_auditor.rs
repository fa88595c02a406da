use tracing::{debug, warn};

use crate::audit::findings::AuditFinding;
use crate::catalog::snapshot::{PolicyDescriptor, Snapshot, TableDescriptor, TableRef};
use crate::classifier::classification::{ClassificationMap, Profile, TableClassification};
use crate::classifier::purpose::{expected_purposes, PolicyPurpose};
use crate::classifier::recognizers::{conflicting_policy, find_policy_for, PurposeContext};

/// Default current-user expression when the map has no identity section.
const DEFAULT_CURRENT_USER: &str = "auth.uid()";

/// Result of auditing one classified table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableAudit {
    /// Audited table.
    pub table: TableRef,
    /// Its classification.
    pub classification: TableClassification,
    /// Row-level security enabled at snapshot time.
    pub rls_enabled: bool,
    /// Purposes the profile requires, in emission order.
    pub expected: Vec<PolicyPurpose>,
    /// Required purposes with no serving policy.
    pub missing: Vec<PolicyPurpose>,
    /// Required purposes and the existing policy serving each.
    pub satisfied: Vec<(PolicyPurpose, String)>,
    /// Missing purposes whose derived name is held by a policy that does not
    /// serve them.
    pub conflicts: Vec<(PolicyPurpose, String)>,
}

impl TableAudit {
    /// Profile of the table.
    pub fn profile(&self) -> Profile {
        self.classification.profile
    }

    /// Name of the policy blocking the derived name of `purpose`, if any.
    pub fn conflict(&self, purpose: PolicyPurpose) -> Option<&str> {
        self.conflicts
            .iter()
            .find(|(p, _)| *p == purpose)
            .map(|(_, name)| name.as_str())
    }

    /// Whether remediation must enable row-level security.
    pub fn needs_rls_enable(&self) -> bool {
        !self.rls_enabled && self.profile() != Profile::AdminOnly
    }
}

/// Per-table audit state: `Unclassified → Classified → Audited`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableAuditState<'s> {
    /// No classification entry; the table is skipped.
    Unclassified(&'s TableDescriptor),
    /// Classified but policies not yet matched.
    Classified(&'s TableDescriptor, &'s TableClassification),
    /// Policies matched against the profile.
    Audited(TableAudit),
}

impl<'s> TableAuditState<'s> {
    /// Look the table up in the classification map.
    pub fn classify(
        table: &'s TableDescriptor,
        map: &'s ClassificationMap,
        default_schema: &str,
    ) -> Self {
        match map.classification_for(&table.table, default_schema) {
            Some(classification) => TableAuditState::Classified(table, classification),
            None => TableAuditState::Unclassified(table),
        }
    }

    /// Match existing policies; a no-op for unclassified or audited tables.
    pub fn audit(self, policies: &[&PolicyDescriptor], map: &ClassificationMap) -> Self {
        let TableAuditState::Classified(table, classification) = self else {
            return self;
        };
        let ctx = PurposeContext {
            classification,
            helpers: &map.helpers,
            current_user: map
                .identity
                .as_ref()
                .map_or(DEFAULT_CURRENT_USER, |i| i.current_user.as_str()),
        };

        let expected = expected_purposes(classification);
        let mut missing = Vec::new();
        let mut satisfied = Vec::new();
        let mut conflicts = Vec::new();
        for purpose in &expected {
            match find_policy_for(policies, &table.table, *purpose, &ctx) {
                Some(policy) => {
                    debug!(table = %table.table, %purpose, policy = %policy.name, "purpose served");
                    satisfied.push((*purpose, policy.name.clone()));
                }
                None => {
                    if let Some(policy) = conflicting_policy(policies, &table.table, *purpose) {
                        warn!(
                            table = %table.table,
                            %purpose,
                            policy = %policy.name,
                            command = %policy.command,
                            "policy holds the derived name but does not serve its purpose"
                        );
                        conflicts.push((*purpose, policy.name.clone()));
                    }
                    missing.push(*purpose);
                }
            }
        }

        TableAuditState::Audited(TableAudit {
            table: table.table.clone(),
            classification: classification.clone(),
            rls_enabled: table.rls_enabled,
            expected,
            missing,
            satisfied,
            conflicts,
        })
    }
}

/// Policy audit over every table of the audited schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyAudit {
    /// `RLSDisabled` and `MissingPolicy` findings, table by table.
    pub findings: Vec<AuditFinding>,
    /// Audited (classified) tables.
    pub tables: Vec<TableAudit>,
    /// Tables without a classification entry.
    pub unclassified: Vec<TableRef>,
}

/// Drive every audited table through the state machine.
pub fn audit_policies(snapshot: &Snapshot, map: &ClassificationMap) -> PolicyAudit {
    let mut result = PolicyAudit::default();

    for table in snapshot.audited_tables() {
        let policies: Vec<&PolicyDescriptor> = snapshot.policies_on(&table.table).collect();
        match TableAuditState::classify(table, map, snapshot.schema()).audit(&policies, map) {
            TableAuditState::Unclassified(table) => {
                warn!(table = %table.table, "table has no classification; policies not audited");
                result.unclassified.push(table.table.clone());
            }
            TableAuditState::Classified(..) => {}
            TableAuditState::Audited(audit) => {
                if audit.needs_rls_enable() {
                    result
                        .findings
                        .push(AuditFinding::rls_disabled(&audit.table, audit.profile()));
                }
                for purpose in &audit.missing {
                    result.findings.push(AuditFinding::missing_policy(
                        &audit.table,
                        audit.profile(),
                        *purpose,
                        purpose_column(&audit.classification, *purpose),
                        audit.conflict(*purpose).map(ToString::to_string),
                    ));
                }
                result.tables.push(audit);
            }
        }
    }

    result
}

fn purpose_column(classification: &TableClassification, purpose: PolicyPurpose) -> Option<String> {
    match purpose {
        PolicyPurpose::AdminAll => None,
        PolicyPurpose::TenantRead | PolicyPurpose::TenantWrite => classification.tenant_column.clone(),
        PolicyPurpose::SelfRead | PolicyPurpose::SelfUpdate => classification.owner_column.clone(),
        PolicyPurpose::PublicRead => classification.activity_column.clone(),
    }
}
