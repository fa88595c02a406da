use sqlparser::ast::{BinaryOperator, Expr, FunctionArg, FunctionArgExpr, FunctionArguments, Value};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

/// Parse a policy predicate as reported by `pg_policies.qual` / `with_check`.
pub fn parse_predicate(sql: &str) -> Result<Expr, String> {
    Parser::new(&PostgreSqlDialect {})
        .try_with_sql(sql)
        .and_then(|mut parser| parser.parse_expr())
        .map_err(|e| e.to_string())
}

/// Extract a simple column name from an expression.
///
/// Supports plain identifiers (`company_id`) and qualified identifiers
/// (`public.invoices.company_id`), returning only the terminal column component.
pub fn extract_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.clone()),
        Expr::CompoundIdentifier(parts) => Some(parts.last()?.value.clone()),
        Expr::Nested(inner) => extract_column_name(inner),
        Expr::Cast { expr, .. } => extract_column_name(expr),
        _ => None,
    }
}

/// Like [`extract_column_name`] but also unwraps `COALESCE(col, default)` and
/// `NULLIF(col, sentinel)`, extracting the column name from the first argument.
pub fn extract_column_name_through_coalesce(expr: &Expr) -> Option<String> {
    if let Some(col) = extract_column_name(expr) {
        return Some(col);
    }
    if let Expr::Function(func) = expr {
        let name = crate::parser::names::normalized_function_name(func);
        if name == "coalesce" || name == "nullif" {
            if let FunctionArguments::List(arg_list) = &func.args {
                if let Some(first_arg) = arg_list.args.first() {
                    if let Some(inner) = function_arg_expr(first_arg) {
                        return extract_column_name(inner);
                    }
                }
            }
        }
    }
    None
}

/// Extract the expression payload from a SQL function argument.
pub fn function_arg_expr(arg: &FunctionArg) -> Option<&Expr> {
    match arg {
        FunctionArg::Unnamed(FunctionArgExpr::Expr(expr))
        | FunctionArg::Named {
            arg: FunctionArgExpr::Expr(expr),
            ..
        }
        | FunctionArg::ExprNamed {
            arg: FunctionArgExpr::Expr(expr),
            ..
        } => Some(expr),
        _ => None,
    }
}

/// Positional argument expressions of a function call (empty for `f()`).
pub fn call_arguments(args: &FunctionArguments) -> Vec<&Expr> {
    match args {
        FunctionArguments::List(arg_list) => {
            arg_list.args.iter().filter_map(function_arg_expr).collect()
        }
        _ => Vec::new(),
    }
}

/// True for the literal `TRUE`, possibly parenthesized.
pub fn is_true_literal(expr: &Expr) -> bool {
    match expr {
        Expr::Value(v) => matches!(v.value, Value::Boolean(true)),
        Expr::Nested(inner) => is_true_literal(inner),
        _ => false,
    }
}

/// Flatten an `AND`/`OR` tree (through parentheses) into its leaf predicates.
///
/// Purpose matching is about coverage, not exact shape, so a purpose counts as
/// present when any leaf carries it.
pub fn predicate_atoms(expr: &Expr) -> Vec<&Expr> {
    let mut atoms = Vec::new();
    collect_atoms(expr, &mut atoms);
    atoms
}

fn collect_atoms<'e>(expr: &'e Expr, atoms: &mut Vec<&'e Expr>) {
    match expr {
        Expr::Nested(inner) => collect_atoms(inner, atoms),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And | BinaryOperator::Or,
            right,
        } => {
            collect_atoms(left, atoms);
            collect_atoms(right, atoms);
        }
        other => atoms.push(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlparser::ast::Ident;

    fn parse_expr(sql: &str) -> Expr {
        parse_predicate(sql).unwrap()
    }

    #[test]
    fn extract_column_name_handles_simple_and_qualified_identifiers() {
        let simple = Expr::Identifier(Ident::new("company_id"));
        let qualified = Expr::CompoundIdentifier(vec![
            Ident::new("public"),
            Ident::new("invoices"),
            Ident::new("company_id"),
        ]);
        let nested = Expr::Nested(Box::new(Expr::Identifier(Ident::new("company_id"))));

        assert_eq!(extract_column_name(&simple).as_deref(), Some("company_id"));
        assert_eq!(extract_column_name(&qualified).as_deref(), Some("company_id"));
        assert_eq!(extract_column_name(&nested).as_deref(), Some("company_id"));
        assert_eq!(
            extract_column_name(&parse_expr("company_id::uuid")).as_deref(),
            Some("company_id")
        );
    }

    #[test]
    fn extract_column_name_through_coalesce_unwraps_coalesce() {
        let expr = parse_expr("COALESCE(owner_id, '00000000-0000-0000-0000-000000000000')");
        assert_eq!(
            extract_column_name_through_coalesce(&expr).as_deref(),
            Some("owner_id"),
        );
    }

    #[test]
    fn predicate_atoms_flattens_nested_boolean_trees() {
        let expr = parse_expr("(is_admin() OR (company_id = current_tenant_id() AND is_active))");
        let atoms = predicate_atoms(&expr);
        assert_eq!(atoms.len(), 3);
        assert_eq!(atoms[2].to_string(), "is_active");
    }

    #[test]
    fn is_true_literal_sees_through_parentheses() {
        assert!(is_true_literal(&parse_expr("(true)")));
        assert!(!is_true_literal(&parse_expr("false")));
    }

    #[test]
    fn parse_predicate_reports_garbage() {
        assert!(parse_predicate("= = =").is_err());
    }
}
