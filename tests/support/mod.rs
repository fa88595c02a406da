#![allow(dead_code)]

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use rls_audit::audit::{run_audit, AuditOutcome};
use rls_audit::catalog::introspect::{introspect, SnapshotRequest};
use rls_audit::catalog::snapshot::Snapshot;
use rls_audit::catalog::static_catalog::StaticCatalog;
use rls_audit::classifier::classification::ClassificationMap;
use rls_audit::generator::remediation::{self, RemediationPlan};

pub(crate) fn fixture_dir(fixture: &str) -> PathBuf {
    PathBuf::from("tests/fixtures").join(fixture)
}

pub(crate) fn read_fixture_sql(fixture: &str) -> String {
    let path = fixture_dir(fixture).join("schema.sql");
    std::fs::read_to_string(path).expect("fixture SQL should be readable")
}

pub(crate) fn load_fixture_catalog(fixture: &str) -> StaticCatalog {
    StaticCatalog::load(&fixture_dir(fixture).join("catalog.json"))
        .expect("fixture catalog should parse")
}

pub(crate) fn load_fixture_map(fixture: &str) -> ClassificationMap {
    ClassificationMap::load(&fixture_dir(fixture).join("classification.json"))
        .expect("fixture classification map should parse")
}

pub(crate) fn snapshot_of(catalog: &mut StaticCatalog, map: &ClassificationMap) -> Snapshot {
    let request = SnapshotRequest {
        schema: "public".to_string(),
        helper_names: map.helpers.all_names(),
    };
    introspect(catalog, &request).expect("fixture catalog should introspect")
}

/// Snapshot and sequential audit of a static catalog.
pub(crate) fn audit_catalog(
    catalog: &mut StaticCatalog,
    map: &ClassificationMap,
) -> (Snapshot, AuditOutcome) {
    let snapshot = snapshot_of(catalog, map);
    let outcome = run_audit(&snapshot, map, &mut catalog.probe());
    (snapshot, outcome)
}

/// Audit a catalog and synthesize its remediation plan.
pub(crate) fn audit_and_plan(
    catalog: &mut StaticCatalog,
    map: &ClassificationMap,
) -> (Snapshot, AuditOutcome, RemediationPlan) {
    let (snapshot, outcome) = audit_catalog(catalog, map);
    let plan = remediation::synthesize(&snapshot, map, &outcome);
    (snapshot, outcome, plan)
}

pub(crate) fn unique_temp_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock should be after epoch")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}_{nanos}"));
    std::fs::create_dir_all(&dir).expect("should create temp dir");
    dir
}
