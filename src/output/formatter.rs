use std::path::{Component, Path, PathBuf};

use tracing::info;

use crate::error::AuditError;
use crate::generator::remediation::RemediationPlan;
use crate::output::report::{self, AuditReport};

/// Paths of the written artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenArtifacts {
    /// `{name}_report.json`.
    pub report: PathBuf,
    /// `{name}_remediation.sql`.
    pub remediation: PathBuf,
    /// `{name}_summary.md`.
    pub summary: PathBuf,
}

/// Write the report, remediation script and summary to `output_dir`.
pub fn write_output(
    output_dir: &Path,
    name: &str,
    report: &AuditReport,
    plan: &RemediationPlan,
) -> Result<WrittenArtifacts, AuditError> {
    validate_output_name(name)?;

    std::fs::create_dir_all(output_dir)
        .map_err(|e| AuditError::Output(format!("Failed to create output directory: {e}")))?;

    let report_path = output_dir.join(format!("{name}_report.json"));
    let json = serde_json::to_string_pretty(report)
        .map_err(|e| AuditError::Output(format!("Failed to serialize report: {e}")))?;
    write_file(&report_path, &format!("{json}\n"))?;

    let remediation_path = output_dir.join(format!("{name}_remediation.sql"));
    write_file(&remediation_path, &plan.render())?;

    let summary_path = output_dir.join(format!("{name}_summary.md"));
    write_file(&summary_path, &report::build_summary_markdown(report))?;

    info!(dir = %output_dir.display(), name, "artifacts written");
    Ok(WrittenArtifacts {
        report: report_path,
        remediation: remediation_path,
        summary: summary_path,
    })
}

fn write_file(path: &Path, content: &str) -> Result<(), AuditError> {
    std::fs::write(path, content)
        .map_err(|e| AuditError::Output(format!("Failed to write {}: {e}", path.display())))
}

fn validate_output_name(name: &str) -> Result<(), AuditError> {
    let invalid = |why: &str| AuditError::Output(format!("Invalid output name '{name}': {why}"));
    if name.trim().is_empty() {
        return Err(AuditError::Output(
            "Output name must not be empty".to_string(),
        ));
    }
    let candidate = Path::new(name);
    if candidate.is_absolute() {
        return Err(invalid("absolute paths are not allowed"));
    }
    if candidate.components().any(|component| {
        matches!(
            component,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    }) {
        return Err(invalid("traversal segments are not allowed"));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(invalid("path separators are not allowed"));
    }
    Ok(())
}
