use std::fmt;

use serde::{Deserialize, Serialize};

use crate::catalog::snapshot::{PolicyCommand, TableRef};
use crate::classifier::classification::{Profile, TableClassification};
use crate::parser::names::{bounded_identifier, identifier_fragment};

/// What a policy is for, independent of its exact predicate text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyPurpose {
    /// Administrators bypass every other rule.
    AdminAll,
    /// Tenant members read their tenant's rows.
    TenantRead,
    /// Tenant members write their tenant's rows.
    TenantWrite,
    /// Users read their own rows.
    SelfRead,
    /// Users update their own rows.
    SelfUpdate,
    /// Anyone reads active rows.
    PublicRead,
}

impl PolicyPurpose {
    /// Suffix used in derived policy names.
    pub fn slug(self) -> &'static str {
        match self {
            PolicyPurpose::AdminAll => "admin_all",
            PolicyPurpose::TenantRead => "tenant_read",
            PolicyPurpose::TenantWrite => "tenant_write",
            PolicyPurpose::SelfRead => "self_read",
            PolicyPurpose::SelfUpdate => "self_update",
            PolicyPurpose::PublicRead => "public_read",
        }
    }

    /// Command a policy for this purpose is created for.
    pub fn command(self) -> PolicyCommand {
        match self {
            PolicyPurpose::AdminAll | PolicyPurpose::TenantWrite => PolicyCommand::All,
            PolicyPurpose::TenantRead | PolicyPurpose::SelfRead | PolicyPurpose::PublicRead => {
                PolicyCommand::Select
            }
            PolicyPurpose::SelfUpdate => PolicyCommand::Update,
        }
    }

    /// Whether the purpose grants writes (and so may be expressed through `WITH CHECK`).
    pub fn is_write(self) -> bool {
        matches!(
            self,
            PolicyPurpose::AdminAll | PolicyPurpose::TenantWrite | PolicyPurpose::SelfUpdate
        )
    }

    /// Deterministic policy name for this purpose on `table`.
    ///
    /// Re-running remediation finds the same name, which is what makes the
    /// guarded `CREATE POLICY` idempotent. Names of distinct purposes stay
    /// distinct when the table name forces truncation.
    pub fn policy_name(self, table: &TableRef) -> String {
        bounded_identifier(&format!(
            "{}_{}",
            identifier_fragment(&table.name),
            self.slug()
        ))
    }
}

impl fmt::Display for PolicyPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.slug().replace('_', "-"))
    }
}

/// Purposes a table of this classification must have policies for, in
/// emission order.
pub fn expected_purposes(classification: &TableClassification) -> Vec<PolicyPurpose> {
    let mut purposes = vec![PolicyPurpose::AdminAll];
    match classification.profile {
        Profile::AdminOnly => {}
        Profile::TenantScoped => {
            purposes.push(PolicyPurpose::TenantRead);
            if classification.require_tenant_write {
                purposes.push(PolicyPurpose::TenantWrite);
            }
        }
        Profile::SelfScoped => {
            purposes.push(PolicyPurpose::SelfRead);
            purposes.push(PolicyPurpose::SelfUpdate);
        }
        Profile::PublicRead => purposes.push(PolicyPurpose::PublicRead),
    }
    purposes
}
