use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::catalog::snapshot::{Snapshot, TableRef};
use crate::error::AuditError;

/// Access-control profile of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Profile {
    /// Only administrators reach the rows.
    AdminOnly,
    /// Rows belong to a tenant (company) and are filtered by a tenant column.
    TenantScoped,
    /// Rows belong to a user and are filtered by an owner column.
    SelfScoped,
    /// Active rows are world-readable.
    PublicRead,
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Profile::AdminOnly => write!(f, "admin-only"),
            Profile::TenantScoped => write!(f, "tenant-scoped"),
            Profile::SelfScoped => write!(f, "self-scoped"),
            Profile::PublicRead => write!(f, "public-read"),
        }
    }
}

/// Classification of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TableClassification {
    /// Access profile.
    pub profile: Profile,
    /// Column holding the tenant id (`tenant-scoped`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_column: Option<String>,
    /// Column holding the owning user id (`self-scoped`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_column: Option<String>,
    /// Boolean column gating public visibility (`public-read`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_column: Option<String>,
    /// Whether a tenant-write policy is required in addition to tenant-read.
    #[serde(default)]
    pub require_tenant_write: bool,
    /// Skip orphan probes for edges that reference this table.
    #[serde(default)]
    pub exclude_as_parent: bool,
    /// Skip FK index advice for this table's outgoing edges.
    #[serde(default)]
    pub skip_index_advice: bool,
}

impl TableClassification {
    /// Minimal classification with every optional setting unset.
    pub fn new(profile: Profile) -> Self {
        Self {
            profile,
            tenant_column: None,
            owner_column: None,
            activity_column: None,
            require_tenant_write: false,
            exclude_as_parent: false,
            skip_index_advice: false,
        }
    }
}

/// The helper predicate functions policy templates call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HelperRole {
    /// Role of the current user.
    RoleLookup,
    /// Tenant id of the current user.
    TenantLookup,
    /// Whether the current user is an administrator.
    AdminPredicate,
    /// Whether the current user may access a given tenant's data.
    AccessPredicate,
}

impl HelperRole {
    /// Every helper, in definition (dependency) order.
    pub const ALL: [HelperRole; 4] = [
        HelperRole::RoleLookup,
        HelperRole::TenantLookup,
        HelperRole::AdminPredicate,
        HelperRole::AccessPredicate,
    ];

    /// Helpers whose bodies call this one's dependencies.
    pub fn depends_on(self) -> &'static [HelperRole] {
        match self {
            HelperRole::RoleLookup | HelperRole::TenantLookup => &[],
            HelperRole::AdminPredicate => &[HelperRole::RoleLookup],
            HelperRole::AccessPredicate => &[HelperRole::AdminPredicate, HelperRole::TenantLookup],
        }
    }
}

impl fmt::Display for HelperRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HelperRole::RoleLookup => write!(f, "role lookup"),
            HelperRole::TenantLookup => write!(f, "tenant lookup"),
            HelperRole::AdminPredicate => write!(f, "admin predicate"),
            HelperRole::AccessPredicate => write!(f, "access predicate"),
        }
    }
}

/// Function names used for each helper role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct HelperNames {
    /// Role lookup function.
    pub role_lookup: String,
    /// Tenant-id lookup function.
    pub tenant_lookup: String,
    /// Admin predicate function.
    pub admin_predicate: String,
    /// Tenant access predicate function.
    pub access_predicate: String,
}

impl Default for HelperNames {
    fn default() -> Self {
        Self {
            role_lookup: "current_user_role".to_string(),
            tenant_lookup: "current_tenant_id".to_string(),
            admin_predicate: "is_admin".to_string(),
            access_predicate: "can_access_tenant_data".to_string(),
        }
    }
}

impl HelperNames {
    /// Function name configured for `role`.
    pub fn name(&self, role: HelperRole) -> &str {
        match role {
            HelperRole::RoleLookup => &self.role_lookup,
            HelperRole::TenantLookup => &self.tenant_lookup,
            HelperRole::AdminPredicate => &self.admin_predicate,
            HelperRole::AccessPredicate => &self.access_predicate,
        }
    }

    /// All configured names, in dependency order.
    pub fn all_names(&self) -> Vec<String> {
        HelperRole::ALL
            .iter()
            .map(|role| self.name(*role).to_string())
            .collect()
    }
}

/// Where helper functions look up the current user's role and tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IdentityConfig {
    /// Table holding one row per application user.
    pub table: String,
    /// Column matched against the current user expression.
    #[serde(default = "default_id_column")]
    pub id_column: String,
    /// Column holding the user's role.
    #[serde(default = "default_role_column")]
    pub role_column: String,
    /// Column holding the user's tenant id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_column: Option<String>,
    /// SQL type of tenant ids.
    #[serde(default = "default_tenant_type")]
    pub tenant_type: String,
    /// SQL expression yielding the current user's id.
    #[serde(default = "default_current_user")]
    pub current_user: String,
    /// Role values treated as administrators.
    #[serde(default = "default_admin_roles")]
    pub admin_roles: Vec<String>,
}

fn default_id_column() -> String {
    "id".to_string()
}

fn default_role_column() -> String {
    "role".to_string()
}

fn default_tenant_type() -> String {
    "uuid".to_string()
}

fn default_current_user() -> String {
    "auth.uid()".to_string()
}

fn default_admin_roles() -> Vec<String> {
    vec!["admin".to_string()]
}

/// Explicit, versioned table classification map. Profiles are never inferred
/// from table names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClassificationMap {
    /// Document format version.
    pub version: u32,
    /// Parent tables whose incoming edges are never probed for orphans.
    #[serde(default)]
    pub excluded_parents: Vec<String>,
    /// Helper function names.
    #[serde(default)]
    pub helpers: HelperNames,
    /// Identity lookup used by helper definitions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<IdentityConfig>,
    /// Table name (optionally schema-qualified) → classification.
    #[serde(default)]
    pub tables: BTreeMap<String, TableClassification>,
}

impl ClassificationMap {
    /// Highest document version this build understands.
    pub const SUPPORTED_VERSION: u32 = 1;

    /// Parse a classification map from JSON.
    pub fn from_json(json: &str) -> Result<Self, String> {
        let map: ClassificationMap = serde_json::from_str(json)
            .map_err(|e| format!("Invalid classification map JSON: {e}"))?;
        if map.version == 0 || map.version > Self::SUPPORTED_VERSION {
            return Err(format!(
                "Unsupported classification map version {} (supported: {})",
                map.version,
                Self::SUPPORTED_VERSION
            ));
        }
        map.reject_duplicate_entries()?;
        Ok(map)
    }

    /// Table keys are matched case-insensitively, so two keys differing only in
    /// case would shadow each other.
    fn reject_duplicate_entries(&self) -> Result<(), String> {
        let mut seen: BTreeMap<(String, String), &str> = BTreeMap::new();
        for name in self.tables.keys() {
            let table = TableRef::parse(name, "");
            let key = (
                table.schema.to_ascii_lowercase(),
                table.name.to_ascii_lowercase(),
            );
            if let Some(previous) = seen.insert(key, name) {
                return Err(format!(
                    "Duplicate classification entries '{previous}' and '{name}' name the same table"
                ));
            }
        }
        Ok(())
    }

    /// Read and parse a classification map file.
    pub fn load(path: &Path) -> Result<Self, AuditError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AuditError::Classification(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_json(&content).map_err(AuditError::Classification)
    }

    /// Classification for `table`, if any entry resolves to it.
    pub fn classification_for(
        &self,
        table: &TableRef,
        default_schema: &str,
    ) -> Option<&TableClassification> {
        self.tables
            .iter()
            .find(|(name, _)| names_table(name, table, default_schema))
            .map(|(_, classification)| classification)
    }

    /// True when orphan probes must skip edges pointing at `parent`.
    pub fn is_excluded_parent(&self, parent: &TableRef, default_schema: &str) -> bool {
        self.excluded_parents
            .iter()
            .any(|name| names_table(name, parent, default_schema))
            || self
                .classification_for(parent, default_schema)
                .is_some_and(|c| c.exclude_as_parent)
    }

    /// Classified names that resolve to no audited table of the snapshot.
    pub fn unmatched_tables(&self, snapshot: &Snapshot) -> Vec<String> {
        self.tables
            .keys()
            .filter(|name| {
                !snapshot
                    .audited_tables()
                    .any(|t| names_table(name, &t.table, snapshot.schema()))
            })
            .cloned()
            .collect()
    }

    /// Configuration gaps that will block remediation for some tables.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for (name, classification) in &self.tables {
            let required = match classification.profile {
                Profile::AdminOnly => None,
                Profile::TenantScoped => Some(("tenantColumn", &classification.tenant_column)),
                Profile::SelfScoped => Some(("ownerColumn", &classification.owner_column)),
                Profile::PublicRead => Some(("activityColumn", &classification.activity_column)),
            };
            if let Some((setting, None)) = required {
                warnings.push(format!(
                    "table '{name}' is {} but has no {setting}; its policies cannot be synthesized",
                    classification.profile
                ));
            }
        }
        if self.identity.is_none() {
            warnings.push(
                "no identity section; missing helper functions cannot be synthesized".to_string(),
            );
        }
        warnings
    }
}

fn names_table(name: &str, table: &TableRef, default_schema: &str) -> bool {
    let candidate = TableRef::parse(name, default_schema);
    candidate.schema.eq_ignore_ascii_case(&table.schema)
        && candidate.name.eq_ignore_ascii_case(&table.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAP: &str = r#"{
        "version": 1,
        "excludedParents": ["auth.users"],
        "identity": {"table": "users", "tenantColumn": "company_id"},
        "tables": {
            "invoices": {"profile": "tenant-scoped", "tenantColumn": "company_id"},
            "public.profiles": {"profile": "self-scoped"},
            "audit_log": {"profile": "admin-only", "excludeAsParent": true}
        }
    }"#;

    #[test]
    fn map_parses_with_defaults() {
        let map = ClassificationMap::from_json(MAP).unwrap();
        assert_eq!(map.helpers.tenant_lookup, "current_tenant_id");
        let identity = map.identity.as_ref().unwrap();
        assert_eq!(identity.current_user, "auth.uid()");
        assert_eq!(identity.admin_roles, vec!["admin".to_string()]);
        assert_eq!(
            map.classification_for(&TableRef::new("public", "invoices"), "public")
                .map(|c| c.profile),
            Some(Profile::TenantScoped)
        );
        assert!(map
            .classification_for(&TableRef::new("public", "profiles"), "public")
            .is_some());
    }

    #[test]
    fn unknown_profiles_and_versions_are_rejected() {
        let err = ClassificationMap::from_json(
            r#"{"version": 1, "tables": {"x": {"profile": "everyone"}}}"#,
        )
        .unwrap_err();
        assert!(err.contains("Invalid classification map JSON"));

        let err = ClassificationMap::from_json(r#"{"version": 7}"#).unwrap_err();
        assert!(err.contains("Unsupported classification map version 7"));
    }

    #[test]
    fn keys_differing_only_in_case_are_rejected() {
        let err = ClassificationMap::from_json(
            r#"{"version": 1, "tables": {
                "Users": {"profile": "admin-only"},
                "users": {"profile": "self-scoped", "ownerColumn": "id"}
            }}"#,
        )
        .unwrap_err();
        assert!(err.contains("Duplicate classification entries 'Users' and 'users'"));

        let err = ClassificationMap::from_json(
            r#"{"version": 1, "tables": {
                "app.Orders": {"profile": "admin-only"},
                "\"app\".\"orders\"": {"profile": "admin-only"}
            }}"#,
        )
        .unwrap_err();
        assert!(err.contains("name the same table"));

        assert!(ClassificationMap::from_json(
            r#"{"version": 1, "tables": {
                "app.orders": {"profile": "admin-only"},
                "orders": {"profile": "admin-only"}
            }}"#,
        )
        .is_ok());
    }

    #[test]
    fn exclusions_come_only_from_configuration() {
        let map = ClassificationMap::from_json(MAP).unwrap();
        assert!(map.is_excluded_parent(&TableRef::new("auth", "users"), "public"));
        assert!(map.is_excluded_parent(&TableRef::new("public", "audit_log"), "public"));
        assert!(!map.is_excluded_parent(&TableRef::new("public", "users"), "public"));
    }

    #[test]
    fn warnings_name_missing_template_columns() {
        let map = ClassificationMap::from_json(MAP).unwrap();
        let warnings = map.warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("'public.profiles' is self-scoped but has no ownerColumn"));
    }

    #[test]
    fn helper_dependencies_precede_dependents() {
        for (position, role) in HelperRole::ALL.iter().enumerate() {
            for dependency in role.depends_on() {
                let dep_position = HelperRole::ALL.iter().position(|r| r == dependency).unwrap();
                assert!(dep_position < position);
            }
        }
    }
}
