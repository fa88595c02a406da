/// SQL expression helpers used to recognize policy predicate shapes.
pub mod expr;
/// Identifier and table-name normalization helpers (schema-qualified names, quoting, truncation).
pub mod names;
