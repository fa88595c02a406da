use sqlparser::ast::{BinaryOperator, Expr};
use tracing::debug;

use crate::catalog::snapshot::{PolicyDescriptor, TableRef};
use crate::classifier::classification::{HelperNames, TableClassification};
use crate::classifier::purpose::PolicyPurpose;
use crate::parser::expr::{
    call_arguments, extract_column_name_through_coalesce, is_true_literal, parse_predicate,
    predicate_atoms,
};
use crate::parser::names::{normalize_identifier, normalize_relation_name, normalized_function_name};

/// Everything needed to decide whether a predicate has a purpose's shape.
#[derive(Debug, Clone, Copy)]
pub struct PurposeContext<'a> {
    /// Classification of the table the policy belongs to.
    pub classification: &'a TableClassification,
    /// Configured helper function names.
    pub helpers: &'a HelperNames,
    /// SQL expression yielding the current user id (e.g. `auth.uid()`).
    pub current_user: &'a str,
}

/// Find the existing policy that serves `purpose` on `table`, if any.
///
/// The deterministic name wins when that policy is permissive and its command
/// covers the purpose; otherwise any such policy whose predicate has the
/// purpose's shape matches. Predicate text is never compared verbatim.
pub fn find_policy_for<'p>(
    policies: &[&'p PolicyDescriptor],
    table: &TableRef,
    purpose: PolicyPurpose,
    ctx: &PurposeContext<'_>,
) -> Option<&'p PolicyDescriptor> {
    let derived = purpose.policy_name(table);
    policies
        .iter()
        .find(|p| p.name == derived && grants(p, purpose))
        .or_else(|| policies.iter().find(|p| serves_purpose(p, purpose, ctx)))
        .copied()
}

/// A policy carrying the derived name of `purpose` that does not serve it.
///
/// Remediation cannot create the purpose's policy while this one holds the name.
pub fn conflicting_policy<'p>(
    policies: &[&'p PolicyDescriptor],
    table: &TableRef,
    purpose: PolicyPurpose,
) -> Option<&'p PolicyDescriptor> {
    let derived = purpose.policy_name(table);
    policies
        .iter()
        .find(|p| p.name == derived && !grants(p, purpose))
        .copied()
}

fn grants(policy: &PolicyDescriptor, purpose: PolicyPurpose) -> bool {
    policy.is_permissive() && policy.command.covers(purpose.command())
}

/// Shape-based match of one policy against one purpose.
pub fn serves_purpose(
    policy: &PolicyDescriptor,
    purpose: PolicyPurpose,
    ctx: &PurposeContext<'_>,
) -> bool {
    if !grants(policy, purpose) {
        return false;
    }

    let mut predicates = vec![policy.using.as_deref()];
    if purpose.is_write() {
        predicates.push(policy.with_check.as_deref());
    }

    predicates.into_iter().flatten().any(|sql| match parse_predicate(sql) {
        Ok(expr) => predicate_atoms(&expr)
            .into_iter()
            .any(|atom| atom_serves(atom, purpose, ctx)),
        Err(error) => {
            debug!(policy = %policy.name, %error, "policy predicate did not parse");
            false
        }
    })
}

fn atom_serves(atom: &Expr, purpose: PolicyPurpose, ctx: &PurposeContext<'_>) -> bool {
    let classification = ctx.classification;
    match purpose {
        PolicyPurpose::AdminAll => calls_function(atom, &ctx.helpers.admin_predicate),
        PolicyPurpose::TenantRead | PolicyPurpose::TenantWrite => classification
            .tenant_column
            .as_deref()
            .is_some_and(|col| is_tenant_filter(atom, col, ctx.helpers)),
        PolicyPurpose::SelfRead | PolicyPurpose::SelfUpdate => classification
            .owner_column
            .as_deref()
            .is_some_and(|col| is_owner_filter(atom, col, ctx.current_user)),
        PolicyPurpose::PublicRead => classification
            .activity_column
            .as_deref()
            .is_some_and(|col| is_activity_filter(atom, col)),
    }
}

/// `tenant_col = tenant_lookup()` (either side) or `access_predicate(tenant_col)`.
fn is_tenant_filter(atom: &Expr, tenant_column: &str, helpers: &HelperNames) -> bool {
    if let Some((left, right)) = equality_sides(atom) {
        return (is_column(left, tenant_column) && calls_function(right, &helpers.tenant_lookup))
            || (is_column(right, tenant_column) && calls_function(left, &helpers.tenant_lookup));
    }
    match unwrap_wrappers(atom) {
        Expr::Function(func) => {
            normalized_function_name(func) == normalize_relation_name(&helpers.access_predicate)
                && call_arguments(&func.args)
                    .into_iter()
                    .any(|arg| is_column(arg, tenant_column))
        }
        _ => false,
    }
}

/// `owner_col = <current user expression>` (either side).
fn is_owner_filter(atom: &Expr, owner_column: &str, current_user: &str) -> bool {
    let Some((left, right)) = equality_sides(atom) else {
        return false;
    };
    (is_column(left, owner_column) && is_current_user(right, current_user))
        || (is_column(right, owner_column) && is_current_user(left, current_user))
}

/// `col`, `col = true`, `true = col`, `col IS TRUE`.
fn is_activity_filter(atom: &Expr, activity_column: &str) -> bool {
    match atom {
        Expr::IsTrue(inner) => is_column(inner, activity_column),
        _ => {
            if let Some((left, right)) = equality_sides(atom) {
                return (is_column(left, activity_column) && is_true_literal(right))
                    || (is_column(right, activity_column) && is_true_literal(left));
            }
            is_column(atom, activity_column)
        }
    }
}

fn equality_sides(expr: &Expr) -> Option<(&Expr, &Expr)> {
    match unwrap_wrappers(expr) {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => Some((left.as_ref(), right.as_ref())),
        _ => None,
    }
}

fn unwrap_wrappers(expr: &Expr) -> &Expr {
    match expr {
        Expr::Nested(inner) => unwrap_wrappers(inner),
        Expr::Cast { expr, .. } => unwrap_wrappers(expr),
        other => other,
    }
}

fn is_column(expr: &Expr, column: &str) -> bool {
    extract_column_name_through_coalesce(unwrap_wrappers(expr))
        .is_some_and(|name| normalize_identifier(&name) == normalize_identifier(column))
}

/// Extract the normalized name of a called function, seeing through casts.
pub fn extract_function_name(expr: &Expr) -> Option<String> {
    match unwrap_wrappers(expr) {
        Expr::Function(func) => Some(normalized_function_name(func)),
        _ => None,
    }
}

/// `f()`, `f() = true`, `f() IS TRUE`.
fn calls_function(expr: &Expr, name: &str) -> bool {
    let wanted = normalize_relation_name(name);
    match unwrap_wrappers(expr) {
        Expr::IsTrue(inner) => calls_function(inner, name),
        inner => {
            if let Some((left, right)) = equality_sides(inner) {
                return (calls_function(left, name) && is_true_literal(right))
                    || (calls_function(right, name) && is_true_literal(left));
            }
            extract_function_name(inner).is_some_and(|found| found == wanted)
        }
    }
}

fn is_current_user(expr: &Expr, current_user: &str) -> bool {
    match parse_predicate(current_user) {
        Ok(configured) => match extract_function_name(&configured) {
            Some(function) => extract_function_name(expr).is_some_and(|found| found == function),
            None => {
                normalize_identifier(&unwrap_wrappers(expr).to_string())
                    == normalize_identifier(&configured.to_string())
            }
        },
        Err(_) => normalize_identifier(&expr.to_string()) == normalize_identifier(current_user),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::snapshot::{PolicyCommand, PolicyMode};
    use crate::classifier::classification::Profile;

    fn policy(name: &str, command: PolicyCommand, using: Option<&str>) -> PolicyDescriptor {
        PolicyDescriptor {
            table: TableRef::new("public", "invoices"),
            name: name.to_string(),
            command,
            roles: vec!["public".to_string()],
            using: using.map(ToString::to_string),
            with_check: None,
            mode: PolicyMode::Permissive,
        }
    }

    fn tenant() -> TableClassification {
        TableClassification {
            tenant_column: Some("company_id".to_string()),
            ..TableClassification::new(Profile::TenantScoped)
        }
    }

    #[test]
    fn tenant_read_matches_catalog_deparsed_predicates() {
        let classification = tenant();
        let helpers = HelperNames::default();
        let ctx = PurposeContext {
            classification: &classification,
            helpers: &helpers,
            current_user: "auth.uid()",
        };

        for using in [
            "(company_id = current_tenant_id())",
            "(current_tenant_id() = invoices.company_id)",
            "(public.can_access_tenant_data(company_id))",
            "((company_id)::uuid = \"public\".\"current_tenant_id\"())",
            "(is_admin() OR (company_id = current_tenant_id()))",
        ] {
            let p = policy("anything", PolicyCommand::Select, Some(using));
            assert!(
                serves_purpose(&p, PolicyPurpose::TenantRead, &ctx),
                "expected tenant-read shape in {using}"
            );
        }

        let other_column = policy(
            "x",
            PolicyCommand::Select,
            Some("(route_id = current_tenant_id())"),
        );
        assert!(!serves_purpose(&other_column, PolicyPurpose::TenantRead, &ctx));
    }

    #[test]
    fn command_and_mode_gate_shape_matches() {
        let classification = tenant();
        let helpers = HelperNames::default();
        let ctx = PurposeContext {
            classification: &classification,
            helpers: &helpers,
            current_user: "auth.uid()",
        };

        let select_admin = policy("a", PolicyCommand::Select, Some("is_admin()"));
        assert!(!serves_purpose(&select_admin, PolicyPurpose::AdminAll, &ctx));

        let mut restrictive = policy("b", PolicyCommand::All, Some("is_admin()"));
        restrictive.mode = PolicyMode::Restrictive;
        assert!(!serves_purpose(&restrictive, PolicyPurpose::AdminAll, &ctx));

        let all_admin = policy("c", PolicyCommand::All, Some("(is_admin() = true)"));
        assert!(serves_purpose(&all_admin, PolicyPurpose::AdminAll, &ctx));
    }

    #[test]
    fn derived_name_matches_regardless_of_predicate() {
        let classification = tenant();
        let helpers = HelperNames::default();
        let ctx = PurposeContext {
            classification: &classification,
            helpers: &helpers,
            current_user: "auth.uid()",
        };
        let table = TableRef::new("public", "invoices");
        let named = policy("invoices_tenant_read", PolicyCommand::Select, Some("true"));
        let policies = vec![&named];
        assert_eq!(
            find_policy_for(&policies, &table, PolicyPurpose::TenantRead, &ctx)
                .map(|p| p.name.as_str()),
            Some("invoices_tenant_read")
        );
        assert!(find_policy_for(&policies, &table, PolicyPurpose::AdminAll, &ctx).is_none());
    }

    #[test]
    fn derived_name_with_narrower_command_does_not_match() {
        let classification = TableClassification {
            require_tenant_write: true,
            ..tenant()
        };
        let helpers = HelperNames::default();
        let ctx = PurposeContext {
            classification: &classification,
            helpers: &helpers,
            current_user: "auth.uid()",
        };
        let table = TableRef::new("public", "invoices");
        let select_only = policy(
            "invoices_tenant_write",
            PolicyCommand::Select,
            Some("(company_id = current_tenant_id())"),
        );
        let policies = vec![&select_only];

        assert!(find_policy_for(&policies, &table, PolicyPurpose::TenantWrite, &ctx).is_none());
        assert_eq!(
            conflicting_policy(&policies, &table, PolicyPurpose::TenantWrite)
                .map(|p| p.name.as_str()),
            Some("invoices_tenant_write")
        );
        assert!(find_policy_for(&policies, &table, PolicyPurpose::TenantRead, &ctx).is_some());
        assert!(conflicting_policy(&policies, &table, PolicyPurpose::TenantRead).is_none());
    }

    #[test]
    fn owner_and_activity_shapes() {
        let classification = TableClassification {
            owner_column: Some("user_id".to_string()),
            activity_column: Some("is_active".to_string()),
            ..TableClassification::new(Profile::SelfScoped)
        };
        let helpers = HelperNames::default();
        let ctx = PurposeContext {
            classification: &classification,
            helpers: &helpers,
            current_user: "auth.uid()",
        };

        let mut update = policy("u", PolicyCommand::Update, None);
        update.with_check = Some("(user_id = auth.uid())".to_string());
        assert!(serves_purpose(&update, PolicyPurpose::SelfUpdate, &ctx));
        assert!(!serves_purpose(&update, PolicyPurpose::SelfRead, &ctx));

        let public = policy("p", PolicyCommand::Select, Some("is_active"));
        assert!(serves_purpose(&public, PolicyPurpose::PublicRead, &ctx));
        let public_eq = policy("p", PolicyCommand::Select, Some("(is_active = true)"));
        assert!(serves_purpose(&public_eq, PolicyPurpose::PublicRead, &ctx));
    }

    #[test]
    fn unparseable_predicates_never_match_by_shape() {
        let classification = tenant();
        let helpers = HelperNames::default();
        let ctx = PurposeContext {
            classification: &classification,
            helpers: &helpers,
            current_user: "auth.uid()",
        };
        let broken = policy("b", PolicyCommand::All, Some("is_admin( AND"));
        assert!(!serves_purpose(&broken, PolicyPurpose::AdminAll, &ctx));
    }
}
