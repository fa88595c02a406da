use std::collections::BTreeSet;

use rls_audit::audit::findings::FindingKind;
use rls_audit::catalog::snapshot::{PolicyCommand, TableRef};
use rls_audit::catalog::static_catalog::StaticCatalog;
use rls_audit::classifier::classification::ClassificationMap;
use rls_audit::classifier::purpose::PolicyPurpose;
use rls_audit::classifier::recognizers::{serves_purpose, PurposeContext};
use rls_audit::generator::remediation::{RemediationAction, Section};

mod support;

#[test]
fn applying_the_plan_twice_equals_applying_it_once() {
    let mut catalog = support::load_fixture_catalog("fleet");
    let map = support::load_fixture_map("fleet");
    let (_, _, plan) = support::audit_and_plan(&mut catalog, &map);

    let mut once = catalog.clone();
    once.apply(&plan);
    let mut twice = catalog.clone();
    twice.apply(&plan);
    twice.apply(&plan);

    assert_eq!(once, twice);
    assert_ne!(once, catalog);
}

#[test]
fn re_audit_after_remediation_leaves_only_data_findings() {
    let mut catalog = support::load_fixture_catalog("fleet");
    let map = support::load_fixture_map("fleet");
    let (_, _, plan) = support::audit_and_plan(&mut catalog, &map);

    catalog.apply(&plan);
    let (_, after, second_plan) = support::audit_and_plan(&mut catalog, &map);

    for kind in [
        FindingKind::RlsDisabled,
        FindingKind::MissingPolicy,
        FindingKind::MissingIndex,
        FindingKind::MissingHelper,
    ] {
        assert_eq!(after.findings.of_kind(kind).count(), 0, "{kind} survived");
    }
    // Orphans are advisory only; the script never deletes data.
    assert_eq!(after.findings.of_kind(FindingKind::OrphanedRows).count(), 1);
    assert!(second_plan
        .statements
        .iter()
        .all(|s| s.section == Section::OrphanAdvisory));
}

#[test]
fn synthesis_is_deterministic() {
    let map = support::load_fixture_map("fleet");
    let mut first = support::load_fixture_catalog("fleet");
    let mut second = support::load_fixture_catalog("fleet");
    let (_, _, a) = support::audit_and_plan(&mut first, &map);
    let (_, _, b) = support::audit_and_plan(&mut second, &map);

    assert_eq!(a, b);
    assert_eq!(a.render(), b.render());
}

#[test]
fn every_executable_statement_is_guarded() {
    let mut catalog = support::load_fixture_catalog("fleet");
    let map = support::load_fixture_map("fleet");
    let (_, _, plan) = support::audit_and_plan(&mut catalog, &map);

    for statement in &plan.statements {
        let guarded = match statement.section {
            Section::Helpers => statement.sql.starts_with("CREATE OR REPLACE FUNCTION"),
            Section::Indexes => statement.sql.starts_with("CREATE INDEX IF NOT EXISTS"),
            Section::AccessControl => {
                statement.sql.ends_with("ENABLE ROW LEVEL SECURITY;")
                    || statement.sql.contains("IF NOT EXISTS (\n    SELECT 1 FROM pg_policies")
            }
            Section::OrphanAdvisory => statement.sql.lines().all(|l| l.starts_with("-- ")),
        };
        assert!(guarded, "unguarded statement:\n{}", statement.sql);
        assert!(!statement.finding_ids.is_empty());
        assert!(statement.rationale.starts_with("-- addresses #"));
    }
}

const ALL_HELPERS: &str =
    r#"["current_user_role", "current_tenant_id", "is_admin", "can_access_tenant_data"]"#;

#[test]
fn long_table_names_keep_one_policy_per_purpose() {
    let name = "vehicle_maintenance_inspection_schedule_records_archives";
    assert_eq!(name.len(), 56);
    let mut catalog = StaticCatalog::from_json(&format!(
        r#"{{
            "schema": "public",
            "tables": [
                {{"name": "{name}",
                  "columns": [{{"name": "id", "type": "uuid", "nullable": false}},
                              {{"name": "company_id", "type": "uuid", "nullable": false}}],
                  "rows": []}}
            ],
            "functions": {ALL_HELPERS}
        }}"#
    ))
    .unwrap();
    let map = ClassificationMap::from_json(&format!(
        r#"{{"version": 1, "tables": {{
            "{name}": {{"profile": "tenant-scoped", "tenantColumn": "company_id", "requireTenantWrite": true}}
        }}}}"#
    ))
    .unwrap();

    let (_, before, plan) = support::audit_and_plan(&mut catalog, &map);
    assert_eq!(before.findings.of_kind(FindingKind::MissingPolicy).count(), 3);
    catalog.apply(&plan);
    let (snapshot, after) = support::audit_catalog(&mut catalog, &map);

    assert!(after.is_clean(), "{:?}", after.findings);
    let table = TableRef::new("public", name);
    let policies: Vec<_> = snapshot.policies_on(&table).collect();
    let names: BTreeSet<&str> = policies.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names.len(), 3);
    assert!(names.iter().all(|n| n.len() <= 63));

    let write_name = PolicyPurpose::TenantWrite.policy_name(&table);
    let write = policies.iter().find(|p| p.name == write_name).unwrap();
    assert_eq!(write.command, PolicyCommand::All);
    assert!(after.tables[0]
        .satisfied
        .contains(&(PolicyPurpose::TenantWrite, write_name.clone())));
}

#[test]
fn indexes_with_colliding_plain_names_are_all_created() {
    let mut catalog = StaticCatalog::from_json(&format!(
        r#"{{
            "schema": "public",
            "tables": [
                {{"name": "drivers", "columns": [{{"name": "id", "type": "integer"}}], "rows": []}},
                {{"name": "a_b", "columns": [{{"name": "id", "type": "integer"}},
                                            {{"name": "c", "type": "integer"}}], "rows": []}},
                {{"name": "a", "columns": [{{"name": "id", "type": "integer"}},
                                          {{"name": "b_c", "type": "integer"}}], "rows": []}}
            ],
            "foreignKeys": [
                {{"name": "a_b_c_fkey", "table": "a_b", "columns": ["c"],
                  "references": "drivers", "referencedColumns": ["id"]}},
                {{"name": "a_b_c_fkey1", "table": "a", "columns": ["b_c"],
                  "references": "drivers", "referencedColumns": ["id"]}}
            ],
            "functions": {ALL_HELPERS}
        }}"#
    ))
    .unwrap();
    let map = ClassificationMap::from_json(r#"{"version": 1}"#).unwrap();

    let (_, before, plan) = support::audit_and_plan(&mut catalog, &map);
    assert_eq!(before.findings.of_kind(FindingKind::MissingIndex).count(), 2);
    let index_names: BTreeSet<&str> = plan
        .statements
        .iter()
        .filter_map(|s| match &s.action {
            RemediationAction::CreateIndex { name, .. } => Some(name.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(index_names.len(), 2);

    catalog.apply(&plan);
    let (_, after) = support::audit_catalog(&mut catalog, &map);
    assert_eq!(after.findings.of_kind(FindingKind::MissingIndex).count(), 0);
}

#[test]
fn every_purpose_is_synthesized_and_recognized_by_shape() {
    let mut catalog = StaticCatalog::from_json(
        r#"{
            "schema": "public",
            "tables": [
                {"name": "users",
                 "columns": [{"name": "id", "type": "uuid", "nullable": false},
                             {"name": "company_id", "type": "uuid"},
                             {"name": "role", "type": "text"}],
                 "rows": []},
                {"name": "invoices",
                 "columns": [{"name": "id", "type": "uuid", "nullable": false},
                             {"name": "company_id", "type": "uuid", "nullable": false}],
                 "rows": []},
                {"name": "vehicles",
                 "columns": [{"name": "id", "type": "uuid", "nullable": false},
                             {"name": "active", "type": "boolean", "nullable": false}],
                 "rows": []},
                {"name": "settings",
                 "columns": [{"name": "id", "type": "uuid", "nullable": false}],
                 "rows": []}
            ]
        }"#,
    )
    .unwrap();
    let map = ClassificationMap::from_json(
        r#"{
            "version": 1,
            "identity": {"table": "users", "tenantColumn": "company_id"},
            "tables": {
                "users": {"profile": "self-scoped", "ownerColumn": "id"},
                "invoices": {"profile": "tenant-scoped", "tenantColumn": "company_id",
                             "requireTenantWrite": true},
                "vehicles": {"profile": "public-read", "activityColumn": "active"},
                "settings": {"profile": "admin-only"}
            }
        }"#,
    )
    .unwrap();

    let (_, before, plan) = support::audit_and_plan(&mut catalog, &map);
    assert_eq!(before.findings.of_kind(FindingKind::MissingHelper).count(), 4);
    assert_eq!(before.findings.of_kind(FindingKind::MissingPolicy).count(), 9);
    assert!(plan.skipped.is_empty(), "{:?}", plan.skipped);

    catalog.apply(&plan);
    let (snapshot, after) = support::audit_catalog(&mut catalog, &map);
    assert!(after.is_clean(), "{:?}", after.findings);

    let mut recognized = BTreeSet::new();
    for audit in &after.tables {
        let ctx = PurposeContext {
            classification: &audit.classification,
            helpers: &map.helpers,
            current_user: "auth.uid()",
        };
        for (purpose, name) in &audit.satisfied {
            assert_eq!(name, &purpose.policy_name(&audit.table));
            let policy = snapshot
                .policies_on(&audit.table)
                .find(|p| &p.name == name)
                .unwrap();
            assert!(
                serves_purpose(policy, *purpose, &ctx),
                "{name} does not have the {purpose} shape"
            );
            recognized.insert(*purpose);
        }
    }
    assert_eq!(
        recognized,
        BTreeSet::from([
            PolicyPurpose::AdminAll,
            PolicyPurpose::TenantRead,
            PolicyPurpose::TenantWrite,
            PolicyPurpose::SelfRead,
            PolicyPurpose::SelfUpdate,
            PolicyPurpose::PublicRead,
        ])
    );
}
