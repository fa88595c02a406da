/// Artifact writing with output-name validation.
pub mod formatter;
/// JSON report model and Markdown summary.
pub mod report;
