use std::collections::BTreeMap;
use std::fmt::Write;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::audit::findings::{FindingDetail, FindingKind, Severity};
use crate::audit::AuditOutcome;
use crate::generator::remediation::RemediationPlan;

/// Machine-readable audit report.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    /// Snapshot time, RFC 3339.
    pub timestamp: String,
    /// Audited schema.
    pub schema: String,
    /// Number of tables in the audited schema.
    pub tables_audited: usize,
    /// Findings in emission order.
    pub findings: Vec<ReportFinding>,
    /// Counts per kind and severity.
    pub summary: ReportSummary,
    /// Tables without a classification, never audited.
    pub unclassified_tables: Vec<String>,
    /// Classification entries naming no table.
    pub unmatched_classifications: Vec<String>,
    /// Tables and helpers whose remediation could not be synthesized.
    pub remediation_skipped: Vec<ReportSkipped>,
}

/// One finding as reported.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportFinding {
    /// Position in the finding log.
    pub id: usize,
    /// `kind` tag and `detail` payload.
    #[serde(flatten)]
    pub detail: FindingDetail,
    /// Affected table, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    /// Affected column(s), if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    /// Severity of the kind.
    pub severity: Severity,
    /// What the script does about it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
    /// Set when remediation was attempted and skipped.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub remediation_skipped: bool,
}

/// Aggregate counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    /// Number of findings.
    pub total: usize,
    /// Findings per kind, every kind listed.
    pub by_kind: BTreeMap<String, usize>,
    /// Findings per severity, every severity listed.
    pub by_severity: BTreeMap<String, usize>,
}

/// A skipped remediation unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSkipped {
    /// Table or helper name.
    pub subject: String,
    /// Findings left unremediated.
    pub finding_ids: Vec<usize>,
    /// Why synthesis failed.
    pub reason: String,
}

/// Assemble the report from an audit outcome and its remediation plan.
pub fn build_report(outcome: &AuditOutcome, plan: &RemediationPlan) -> AuditReport {
    let findings: Vec<ReportFinding> = outcome
        .findings
        .iter()
        .map(|(id, finding)| ReportFinding {
            id,
            detail: finding.detail.clone(),
            table: finding.table.as_ref().map(ToString::to_string),
            column: finding.column.clone(),
            severity: finding.severity,
            remediation: plan.remediation_for(id),
            remediation_skipped: plan.is_skipped(id),
        })
        .collect();

    AuditReport {
        timestamp: format_timestamp(outcome.taken_at),
        schema: outcome.schema.clone(),
        tables_audited: outcome.tables_audited,
        summary: summarize(&findings),
        findings,
        unclassified_tables: outcome.unclassified.iter().map(ToString::to_string).collect(),
        unmatched_classifications: outcome.unmatched_classifications.clone(),
        remediation_skipped: plan
            .skipped
            .iter()
            .map(|s| ReportSkipped {
                subject: s.subject.clone(),
                finding_ids: s.finding_ids.clone(),
                reason: s.error.to_string(),
            })
            .collect(),
    }
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn summarize(findings: &[ReportFinding]) -> ReportSummary {
    let mut by_kind: BTreeMap<String, usize> = FindingKind::ALL
        .iter()
        .map(|k| (k.to_string(), 0))
        .collect();
    let mut by_severity: BTreeMap<String, usize> =
        [Severity::Low, Severity::Medium, Severity::High, Severity::Critical]
            .iter()
            .map(|s| (s.to_string(), 0))
            .collect();
    for finding in findings {
        *by_kind.entry(finding.detail.kind().to_string()).or_default() += 1;
        *by_severity.entry(finding.severity.to_string()).or_default() += 1;
    }
    ReportSummary {
        total: findings.len(),
        by_kind,
        by_severity,
    }
}

/// Build the Markdown summary for human review.
pub fn build_summary_markdown(report: &AuditReport) -> String {
    let mut md = String::new();

    let _ = writeln!(md, "# rls-audit Summary");
    let _ = writeln!(md);
    let _ = writeln!(md, "- Schema: `{}`", report.schema);
    let _ = writeln!(md, "- Snapshot: {}", report.timestamp);
    let _ = writeln!(md, "- Tables audited: {}", report.tables_audited);
    let _ = writeln!(md, "- Findings: {}", report.summary.total);

    let _ = writeln!(md);
    let _ = writeln!(md, "## Findings by Kind");
    let _ = writeln!(md);
    let _ = writeln!(md, "| Kind | Count |");
    let _ = writeln!(md, "|------|-------|");
    for (kind, count) in &report.summary.by_kind {
        let _ = writeln!(md, "| {kind} | {count} |");
    }

    if !report.findings.is_empty() {
        let _ = writeln!(md);
        let _ = writeln!(md, "## Findings");
        let _ = writeln!(md);
        let _ = writeln!(md, "| # | Severity | Kind | Table | Column | Remediation |");
        let _ = writeln!(md, "|---|----------|------|-------|--------|-------------|");
        for finding in &report.findings {
            let remediation = if finding.remediation_skipped {
                "skipped".to_string()
            } else {
                finding.remediation.clone().unwrap_or_else(|| "-".to_string())
            };
            let _ = writeln!(
                md,
                "| {} | {} | {} | {} | {} | {} |",
                finding.id,
                finding.severity,
                finding.detail.kind(),
                finding.table.as_deref().unwrap_or("-"),
                finding.column.as_deref().unwrap_or("-"),
                remediation
            );
        }
    }

    if !report.unclassified_tables.is_empty() {
        let _ = writeln!(md);
        let _ = writeln!(md, "## Unclassified Tables");
        let _ = writeln!(md);
        for table in &report.unclassified_tables {
            let _ = writeln!(md, "- `{table}` (not audited)");
        }
    }

    if !report.unmatched_classifications.is_empty() {
        let _ = writeln!(md);
        let _ = writeln!(md, "## Unmatched Classification Entries");
        let _ = writeln!(md);
        for name in &report.unmatched_classifications {
            let _ = writeln!(md, "- `{name}`");
        }
    }

    if !report.remediation_skipped.is_empty() {
        let _ = writeln!(md);
        let _ = writeln!(md, "## Remediation Skipped");
        let _ = writeln!(md);
        for skipped in &report.remediation_skipped {
            let _ = writeln!(md, "- **{}**: {}", skipped.subject, skipped.reason);
        }
    }

    md
}
