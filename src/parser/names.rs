use sha2::{Digest, Sha256};
use sqlparser::ast::Function;

/// PostgreSQL truncates identifiers longer than this many bytes (`NAMEDATALEN - 1`).
pub const MAX_IDENTIFIER_BYTES: usize = 63;

/// Return the identifier without surrounding double quotes.
pub fn unquote_identifier(ident: &str) -> &str {
    ident
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(ident)
}

/// Normalize an identifier for case-insensitive matching.
///
/// Trims whitespace, removes surrounding double quotes on a single identifier,
/// and lowercases the result.
pub fn normalize_identifier(ident: &str) -> String {
    unquote_identifier(ident.trim()).to_ascii_lowercase()
}

/// Split a potentially schema-qualified name into `(schema, relation)`.
///
/// Handles dots inside quoted identifiers, e.g. `"my.schema"."table.name"`.
pub fn split_schema_and_relation(name: &str) -> Option<(String, String)> {
    let mut in_quotes = false;
    let mut start = 0usize;
    let mut parts: Vec<&str> = Vec::new();

    for (idx, ch) in name.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '.' if !in_quotes => {
                parts.push(name[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(name[start..].trim());

    if parts.len() < 2 {
        return None;
    }

    let schema = unquote_identifier(parts[parts.len() - 2]).to_string();
    let relation = unquote_identifier(parts[parts.len() - 1]).to_string();
    Some((schema, relation))
}

/// Normalize an object name to its terminal relation/function identifier.
///
/// Examples:
/// - `"public.invoices"` -> `"invoices"`
/// - `"\"auth\".\"uid\""` -> `"uid"`
/// - `"CURRENT_USER"` -> `"current_user"`
pub fn normalize_relation_name(name: &str) -> String {
    if let Some((_, relation)) = split_schema_and_relation(name.trim()) {
        return normalize_identifier(&relation);
    }
    normalize_identifier(name)
}

/// Normalized terminal name of a called function (`public.is_admin` -> `is_admin`).
pub fn normalized_function_name(func: &Function) -> String {
    normalize_relation_name(&func.name.to_string())
}

/// Build `(schema, relation)` lookup candidates for a configured table name.
///
/// Unqualified names resolve against `default_schema`. Ordered from most
/// specific to least specific, without duplicates.
pub fn table_lookup_candidates(name: &str, default_schema: &str) -> Vec<(String, String)> {
    let mut candidates = Vec::new();

    if let Some((schema, relation)) = split_schema_and_relation(name) {
        candidates.push((schema, relation));
    } else {
        let relation = unquote_identifier(name.trim()).to_string();
        candidates.push((default_schema.to_string(), relation.clone()));
        candidates.push((default_schema.to_ascii_lowercase(), relation.to_ascii_lowercase()));
    }

    let mut deduped = Vec::new();
    for candidate in candidates {
        if !deduped.contains(&candidate) {
            deduped.push(candidate);
        }
    }
    deduped
}

/// Quote an identifier for DDL output, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote a string literal for DDL output, doubling embedded single quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Canonicalize an object name into a fragment usable inside a derived identifier.
///
/// Rules:
/// - keep the terminal relation when schema-qualified
/// - lowercase ASCII
/// - replace non `[a-z0-9_]` with `_`
/// - collapse repeated `_`
/// - trim leading/trailing `_`
/// - if empty, return `"t"`
pub fn identifier_fragment(name: &str) -> String {
    let relation = if let Some((_, relation)) = split_schema_and_relation(name.trim()) {
        relation
    } else {
        unquote_identifier(name.trim()).to_string()
    };

    let mut normalized = String::with_capacity(relation.len());
    let mut previous_was_underscore = false;

    for ch in relation.chars() {
        let lower = ch.to_ascii_lowercase();
        if lower.is_ascii_alphanumeric() || lower == '_' {
            if lower == '_' {
                if previous_was_underscore {
                    continue;
                }
                previous_was_underscore = true;
            } else {
                previous_was_underscore = false;
            }
            normalized.push(lower);
        } else if !previous_was_underscore {
            normalized.push('_');
            previous_was_underscore = true;
        }
    }

    let trimmed = normalized.trim_matches('_').to_string();
    if trimmed.is_empty() {
        "t".to_string()
    } else {
        trimmed
    }
}

/// Short stable digest of `parts`, eight hex digits.
pub fn name_digest<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(&hasher.finalize()[..4])
}

/// `{prefix}_{suffix}`, cutting `prefix` so the result fits in
/// [`MAX_IDENTIFIER_BYTES`].
pub fn suffixed_identifier(prefix: &str, suffix: &str) -> String {
    let budget = MAX_IDENTIFIER_BYTES.saturating_sub(suffix.len() + 1);
    let mut end = prefix.len().min(budget);
    while !prefix.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}_{suffix}", prefix[..end].trim_end_matches('_'))
}

/// Fit a derived identifier into the length PostgreSQL actually stores.
///
/// Names that fit are returned unchanged. Longer names keep a prefix and end in
/// a digest of the full name, so two long names sharing their first 63 bytes
/// still differ.
pub fn bounded_identifier(name: &str) -> String {
    if name.len() <= MAX_IDENTIFIER_BYTES {
        return name.to_string();
    }
    suffixed_identifier(name, &name_digest([name]))
}
