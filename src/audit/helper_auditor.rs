use tracing::debug;

use crate::audit::findings::AuditFinding;
use crate::catalog::snapshot::Snapshot;
use crate::classifier::classification::{HelperNames, HelperRole};

/// One `MissingHelper` per absent helper function, in dependency order.
pub fn audit_helpers(snapshot: &Snapshot, helpers: &HelperNames) -> Vec<AuditFinding> {
    HelperRole::ALL
        .iter()
        .filter_map(|role| {
            let name = helpers.name(*role);
            if snapshot.function_present(name) {
                debug!(function = name, "helper present");
                None
            } else {
                Some(AuditFinding::missing_helper(name, *role))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::audit::findings::FindingDetail;
    use crate::catalog::snapshot::HelperFunction;

    #[test]
    fn only_absent_helpers_are_reported() {
        let helpers = HelperNames::default();
        let functions = helpers
            .all_names()
            .into_iter()
            .map(|name| HelperFunction {
                present: name != "current_tenant_id",
                name,
            })
            .collect();
        let snapshot = Snapshot::new(
            "public",
            Utc::now(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            functions,
        )
        .unwrap();

        let findings = audit_helpers(&snapshot, &helpers);
        assert_eq!(findings.len(), 1);
        assert_eq!(
            findings[0].detail,
            FindingDetail::MissingHelper {
                function: "current_tenant_id".to_string(),
                role: HelperRole::TenantLookup,
            }
        );
        assert!(findings[0].table.is_none());
    }
}
