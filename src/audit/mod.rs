//! Audit pipeline over one immutable [`Snapshot`].
//!
//! Findings are emitted in a fixed stage order: integrity, index advice,
//! policies, helpers, expected schema.

/// Finding kinds, severities and the append-only finding log.
pub mod findings;
/// Child/parent adjacency over foreign-key edges.
pub mod graph;
/// Helper-function existence checks.
pub mod helper_auditor;
/// Foreign-key index coverage.
pub mod index_advisor;
/// Orphan probes, sequential or on a bounded worker pool.
pub mod integrity;
/// Per-table policy state machine.
pub mod policy_auditor;
/// Tables and columns the classification map expects.
pub mod schema_auditor;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::catalog::snapshot::{Snapshot, TableRef};
use crate::classifier::classification::ClassificationMap;
use findings::{AuditFinding, FindingLog};
use graph::ReferentialGraph;
use integrity::{OrphanProbe, ProbeFactory};
use policy_auditor::TableAudit;

/// Everything one audit run produced.
#[derive(Debug, Clone)]
pub struct AuditOutcome {
    /// Audited schema.
    pub schema: String,
    /// Snapshot time.
    pub taken_at: DateTime<Utc>,
    /// Number of tables of the audited schema.
    pub tables_audited: usize,
    /// Ordered findings.
    pub findings: FindingLog,
    /// Classified tables with their policy match results.
    pub tables: Vec<TableAudit>,
    /// Tables skipped for lack of a classification.
    pub unclassified: Vec<TableRef>,
    /// Classification entries naming no table of the snapshot.
    pub unmatched_classifications: Vec<String>,
}

impl AuditOutcome {
    /// True when the run found nothing.
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Audit `snapshot`, probing orphans sequentially on `probe`.
pub fn run_audit<P>(snapshot: &Snapshot, map: &ClassificationMap, probe: &mut P) -> AuditOutcome
where
    P: OrphanProbe + ?Sized,
{
    let graph = build_graph(snapshot);
    let orphans = integrity::audit_sequential(&graph, map, probe);
    assemble(snapshot, &graph, map, orphans)
}

/// Audit `snapshot`, probing orphans on `workers` threads, one probe each.
pub fn run_audit_pooled<F>(
    snapshot: &Snapshot,
    map: &ClassificationMap,
    factory: &F,
    workers: usize,
) -> AuditOutcome
where
    F: ProbeFactory,
{
    let graph = build_graph(snapshot);
    let orphans = integrity::audit_pooled(&graph, map, factory, workers);
    assemble(snapshot, &graph, map, orphans)
}

fn build_graph(snapshot: &Snapshot) -> ReferentialGraph<'_> {
    let graph = ReferentialGraph::build(snapshot);
    info!(
        edges = graph.edge_count(),
        self_referencing = graph.self_referencing_tables().len(),
        "referential graph built"
    );
    graph
}

fn assemble(
    snapshot: &Snapshot,
    graph: &ReferentialGraph<'_>,
    map: &ClassificationMap,
    orphans: Vec<AuditFinding>,
) -> AuditOutcome {
    let mut log = FindingLog::new();
    log.extend(orphans);
    log.extend(index_advisor::advise_indexes(snapshot, graph, map));

    let policies = policy_auditor::audit_policies(snapshot, map);
    log.extend(policies.findings);
    log.extend(helper_auditor::audit_helpers(snapshot, &map.helpers));
    log.extend(schema_auditor::audit_expected_schema(snapshot, map));

    let unmatched = map.unmatched_tables(snapshot);
    for name in &unmatched {
        warn!(table = %name, "classification entry matches no table");
    }

    let outcome = AuditOutcome {
        schema: snapshot.schema().to_string(),
        taken_at: snapshot.taken_at(),
        tables_audited: snapshot.audited_tables().count(),
        findings: log,
        tables: policies.tables,
        unclassified: policies.unclassified,
        unmatched_classifications: unmatched,
    };
    info!(
        findings = outcome.findings.len(),
        unclassified = outcome.unclassified.len(),
        "audit complete"
    );
    outcome
}
