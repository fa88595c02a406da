use tracing::debug;

use crate::audit::findings::AuditFinding;
use crate::catalog::snapshot::{Snapshot, TableDescriptor, TableRef};
use crate::classifier::classification::{ClassificationMap, IdentityConfig};

/// Check that the tables and columns the classification map relies on exist.
///
/// Every `tables` entry must resolve to a table of the audited schema, and the
/// tenant, owner and activity columns it declares must exist on it. The
/// identity table and its id, role and tenant columns are checked the same
/// way. Entries resolving to another schema are outside the run and skipped.
pub fn audit_expected_schema(snapshot: &Snapshot, map: &ClassificationMap) -> Vec<AuditFinding> {
    let mut findings = Vec::new();

    for (entry, classification) in &map.tables {
        let Some(table) = expect_table(snapshot, entry, "tables", &mut findings) else {
            continue;
        };
        for (setting, column) in [
            ("tenantColumn", &classification.tenant_column),
            ("ownerColumn", &classification.owner_column),
            ("activityColumn", &classification.activity_column),
        ] {
            if let Some(column) = column {
                expect_column(table, column, setting, &mut findings);
            }
        }
    }

    if let Some(identity) = &map.identity {
        audit_identity(snapshot, identity, &mut findings);
    }
    findings
}

fn audit_identity(snapshot: &Snapshot, identity: &IdentityConfig, findings: &mut Vec<AuditFinding>) {
    let Some(table) = expect_table(snapshot, &identity.table, "identity.table", findings) else {
        return;
    };
    expect_column(table, &identity.id_column, "identity.idColumn", findings);
    expect_column(table, &identity.role_column, "identity.roleColumn", findings);
    if let Some(column) = &identity.tenant_column {
        expect_column(table, column, "identity.tenantColumn", findings);
    }
}

fn expect_table<'s>(
    snapshot: &'s Snapshot,
    entry: &str,
    setting: &str,
    findings: &mut Vec<AuditFinding>,
) -> Option<&'s TableDescriptor> {
    let expected = TableRef::parse(entry, snapshot.schema());
    if !expected.schema.eq_ignore_ascii_case(snapshot.schema()) {
        debug!(%entry, setting, "entry outside the audited schema");
        return None;
    }
    let found = snapshot.audited_tables().find(|t| {
        t.table.schema.eq_ignore_ascii_case(&expected.schema)
            && t.table.name.eq_ignore_ascii_case(&expected.name)
    });
    if found.is_none() {
        findings.push(AuditFinding::missing_table(&expected, entry, setting));
    }
    found
}

fn expect_column(
    table: &TableDescriptor,
    column: &str,
    setting: &str,
    findings: &mut Vec<AuditFinding>,
) {
    if !table.has_column(column) {
        findings.push(AuditFinding::missing_column(&table.table, column, setting));
    }
}
