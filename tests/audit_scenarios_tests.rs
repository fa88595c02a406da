use rls_audit::audit::findings::{FindingDetail, FindingKind, ProbeFailure};
use rls_audit::audit::integrity::OrphanProbe;
use rls_audit::audit::{run_audit, run_audit_pooled};
use rls_audit::catalog::snapshot::{ForeignKeyEdge, TableRef};
use rls_audit::classifier::classification::{HelperRole, Profile, TableClassification};
use rls_audit::classifier::purpose::PolicyPurpose;
use rls_audit::error::ProbeError;
use rls_audit::generator::remediation::{RemediationAction, Section};

mod support;

fn table(name: &str) -> TableRef {
    TableRef::new("public", name)
}

#[test]
fn fleet_findings_are_ordered_by_stage() {
    let mut catalog = support::load_fixture_catalog("fleet");
    let map = support::load_fixture_map("fleet");
    let (_, outcome) = support::audit_catalog(&mut catalog, &map);

    let kinds: Vec<FindingKind> = outcome.findings.findings().iter().map(|f| f.kind()).collect();
    assert_eq!(
        kinds,
        vec![
            FindingKind::OrphanedRows,
            FindingKind::MissingIndex,
            FindingKind::RlsDisabled,
            FindingKind::MissingPolicy,
            FindingKind::MissingPolicy,
            FindingKind::MissingHelper,
        ]
    );
    assert_eq!(outcome.tables_audited, 9);
    assert!(outcome.unmatched_classifications.is_empty());
}

#[test]
fn scenario_a_orphaned_orders_are_counted() {
    let mut catalog = support::load_fixture_catalog("fleet");
    let map = support::load_fixture_map("fleet");
    let (_, outcome) = support::audit_catalog(&mut catalog, &map);

    let orphans: Vec<_> = outcome.findings.of_kind(FindingKind::OrphanedRows).collect();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].table, Some(table("orders")));
    assert_eq!(orphans[0].column.as_deref(), Some("customer_id"));
    match &orphans[0].detail {
        FindingDetail::OrphanedRows {
            count,
            constraint,
            parent_table,
            ..
        } => {
            assert_eq!(*count, 3);
            assert_eq!(constraint, "orders_customer_id_fkey");
            assert_eq!(parent_table, "public.customers");
        }
        other => panic!("unexpected detail {other:?}"),
    }
}

#[test]
fn scenario_b_invoices_without_rls_are_flagged_then_fixed() {
    let mut catalog = support::load_fixture_catalog("fleet");
    let map = support::load_fixture_map("fleet");
    let (_, outcome, plan) = support::audit_and_plan(&mut catalog, &map);

    let invoices = table("invoices");
    let on_invoices: Vec<FindingKind> = outcome
        .findings
        .on_table(&invoices)
        .map(|(_, f)| f.kind())
        .collect();
    assert_eq!(
        on_invoices,
        vec![
            FindingKind::RlsDisabled,
            FindingKind::MissingPolicy,
            FindingKind::MissingPolicy
        ]
    );

    catalog.apply(&plan);
    let (_, after) = support::audit_catalog(&mut catalog, &map);
    assert_eq!(after.findings.on_table(&invoices).count(), 0);
}

#[test]
fn scenario_c_unindexed_driver_fk_gets_an_index() {
    let mut catalog = support::load_fixture_catalog("fleet");
    let map = support::load_fixture_map("fleet");
    let (_, outcome, plan) = support::audit_and_plan(&mut catalog, &map);

    let missing: Vec<_> = outcome.findings.of_kind(FindingKind::MissingIndex).collect();
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].table, Some(table("trips")));
    assert_eq!(missing[0].column.as_deref(), Some("driver_id"));

    let sql = plan.render();
    assert!(
        sql.contains(
            r#"CREATE INDEX IF NOT EXISTS "idx_trips_driver_id" ON "public"."trips" ("driver_id");"#
        ),
        "index statement missing from:\n{sql}"
    );
}

#[test]
fn scenario_d_missing_helper_is_defined_before_any_policy() {
    let mut catalog = support::load_fixture_catalog("fleet");
    let map = support::load_fixture_map("fleet");
    let (_, outcome, plan) = support::audit_and_plan(&mut catalog, &map);

    let helpers: Vec<_> = outcome
        .findings
        .of_kind(FindingKind::MissingHelper)
        .map(|f| f.detail.clone())
        .collect();
    assert_eq!(
        helpers,
        vec![FindingDetail::MissingHelper {
            function: "current_tenant_id".to_string(),
            role: HelperRole::TenantLookup,
        }]
    );

    assert!(matches!(
        &plan.statements[0].action,
        RemediationAction::DefineHelper { name, .. } if name == "current_tenant_id"
    ));
    let sql = plan.render();
    let definition = sql
        .find(r#"CREATE OR REPLACE FUNCTION "public"."current_tenant_id"()"#)
        .expect("helper definition should be rendered");
    let first_use = sql
        .find(r#""public"."current_tenant_id"()"#)
        .expect("helper should be referenced");
    let first_policy = sql.find("CREATE POLICY").expect("policies should be rendered");
    assert!(definition < first_policy);
    assert!(definition <= first_use);
}

#[test]
fn every_rls_enable_is_followed_by_its_policies() {
    let mut catalog = support::load_fixture_catalog("fleet");
    let map = support::load_fixture_map("fleet");
    let (_, _, plan) = support::audit_and_plan(&mut catalog, &map);

    let block: Vec<&RemediationAction> = plan
        .section(Section::AccessControl)
        .map(|s| &s.action)
        .collect();
    assert_eq!(block.len(), 3);
    assert!(matches!(block[0], RemediationAction::EnableRls { table } if table.name == "invoices"));
    let purposes: Vec<PolicyPurpose> = block[1..]
        .iter()
        .map(|action| match action {
            RemediationAction::CreatePolicy { table, policy } => {
                assert_eq!(table.name, "invoices");
                policy.purpose
            }
            other => panic!("expected a policy after ENABLE, got {other}"),
        })
        .collect();
    assert_eq!(purposes, vec![PolicyPurpose::AdminAll, PolicyPurpose::TenantRead]);
}

#[test]
fn tenant_tables_with_full_policy_sets_are_clean() {
    let mut catalog = support::load_fixture_catalog("fleet");
    let map = support::load_fixture_map("fleet");
    let (_, outcome) = support::audit_catalog(&mut catalog, &map);

    for name in ["customers", "orders", "drivers", "trips"] {
        let policy_findings = outcome
            .findings
            .on_table(&table(name))
            .filter(|(_, f)| {
                matches!(f.kind(), FindingKind::MissingPolicy | FindingKind::RlsDisabled)
            })
            .count();
        assert_eq!(policy_findings, 0, "{name} should be clean");
    }
    let trips = outcome
        .tables
        .iter()
        .find(|t| t.table.name == "trips")
        .expect("trips should be audited");
    assert_eq!(
        trips.satisfied,
        vec![
            (PolicyPurpose::AdminAll, "trips_admin".to_string()),
            (PolicyPurpose::TenantRead, "trips_members".to_string()),
        ]
    );
}

#[test]
fn unclassified_tables_are_listed_but_never_audited() {
    let mut catalog = support::load_fixture_catalog("fleet");
    let map = support::load_fixture_map("fleet");
    let (_, outcome) = support::audit_catalog(&mut catalog, &map);

    assert_eq!(outcome.unclassified, vec![table("audit_log")]);
    assert_eq!(outcome.findings.on_table(&table("audit_log")).count(), 0);
    assert!(outcome.tables.iter().all(|t| t.table.name != "audit_log"));
}

/// Delegates to the fixture's row data but times out on one constraint.
struct SlowOnOrders<P> {
    inner: P,
}

impl<P: OrphanProbe> OrphanProbe for SlowOnOrders<P> {
    fn count_orphans(&mut self, edge: &ForeignKeyEdge) -> Result<u64, ProbeError> {
        if edge.constraint_name == "orders_customer_id_fkey" {
            return Err(ProbeError::Timeout { timeout_ms: 50 });
        }
        self.inner.count_orphans(edge)
    }
}

#[test]
fn probe_timeout_becomes_an_auditor_error_and_other_edges_continue() {
    let mut catalog = support::load_fixture_catalog("fleet");
    let map = support::load_fixture_map("fleet");
    let snapshot = support::snapshot_of(&mut catalog, &map);

    let mut probe = SlowOnOrders {
        inner: catalog.probe(),
    };
    let outcome = run_audit(&snapshot, &map, &mut probe);

    let errors: Vec<_> = outcome.findings.of_kind(FindingKind::AuditorError).collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].table, Some(table("orders")));
    assert!(matches!(
        &errors[0].detail,
        FindingDetail::AuditorError { reason: ProbeFailure::Timeout, constraint, .. }
            if constraint == "orders_customer_id_fkey"
    ));
    assert_eq!(outcome.findings.of_kind(FindingKind::OrphanedRows).count(), 0);
    assert_eq!(outcome.findings.of_kind(FindingKind::MissingIndex).count(), 1);
}

#[test]
fn pooled_probes_match_sequential_results() {
    let mut catalog = support::load_fixture_catalog("fleet");
    let map = support::load_fixture_map("fleet");
    let snapshot = support::snapshot_of(&mut catalog, &map);

    let sequential = run_audit(&snapshot, &map, &mut catalog.probe());
    let pooled = run_audit_pooled(&snapshot, &map, &&catalog, 4);
    assert_eq!(sequential.findings, pooled.findings);
}

#[test]
fn classification_entries_missing_from_the_schema_are_findings() {
    let mut catalog = support::load_fixture_catalog("fleet");
    let mut map = support::load_fixture_map("fleet");
    map.tables.insert(
        "ghosts".to_string(),
        TableClassification::new(Profile::AdminOnly),
    );
    if let Some(identity) = map.identity.as_mut() {
        identity.role_column = "user_role".to_string();
    }
    let (_, outcome) = support::audit_catalog(&mut catalog, &map);

    let tail: Vec<(FindingKind, Option<TableRef>, Option<&str>)> = outcome
        .findings
        .iter()
        .skip(6)
        .map(|(_, f)| f)
        .map(|f| (f.kind(), f.table.clone(), f.column.as_deref()))
        .collect();
    assert_eq!(
        tail,
        vec![
            (FindingKind::MissingTable, Some(table("ghosts")), None),
            (FindingKind::MissingColumn, Some(table("users")), Some("user_role")),
        ]
    );
    assert_eq!(outcome.unmatched_classifications, vec!["ghosts".to_string()]);
    assert!(!outcome.is_clean());
}
