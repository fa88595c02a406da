use crate::catalog::snapshot::{PolicyCommand, TableDescriptor, TableRef};
use crate::classifier::classification::{
    ClassificationMap, HelperNames, HelperRole, IdentityConfig, TableClassification,
};
use crate::classifier::purpose::PolicyPurpose;
use crate::error::RemediationError;
use crate::parser::names::{quote_ident, quote_literal};

/// `CREATE OR REPLACE FUNCTION` for one helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperDefinition {
    /// Helper role.
    pub role: HelperRole,
    /// Function name.
    pub name: String,
    /// Complete DDL statement.
    pub sql: String,
}

/// Schema-qualified, quoted call target for a helper.
pub fn helper_call(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

/// Build the definition of `role` from the map's identity section.
pub fn helper_definition(
    role: HelperRole,
    schema: &str,
    map: &ClassificationMap,
) -> Result<HelperDefinition, RemediationError> {
    let helpers = &map.helpers;
    let name = helpers.name(role).to_string();
    let undefinable = |reason: &str| RemediationError::HelperUndefinable {
        function: name.clone(),
        reason: reason.to_string(),
    };
    let identity = map
        .identity
        .as_ref()
        .ok_or_else(|| undefinable("no identity section in the classification map"))?;
    let users = TableRef::parse(&identity.table, schema).quoted();

    let (arguments, returns, body) = match role {
        HelperRole::RoleLookup => (
            String::new(),
            "text".to_string(),
            lookup_body(identity, &identity.role_column, &users, "::text"),
        ),
        HelperRole::TenantLookup => {
            let tenant_column = identity
                .tenant_column
                .as_deref()
                .ok_or_else(|| undefinable("identity.tenantColumn is not configured"))?;
            (
                String::new(),
                identity.tenant_type.clone(),
                lookup_body(identity, tenant_column, &users, ""),
            )
        }
        HelperRole::AdminPredicate => {
            let roles = identity
                .admin_roles
                .iter()
                .map(|r| quote_literal(r))
                .collect::<Vec<_>>()
                .join(", ");
            if roles.is_empty() {
                return Err(undefinable("identity.adminRoles is empty"));
            }
            (
                String::new(),
                "boolean".to_string(),
                format!(
                    "SELECT coalesce({}() IN ({roles}), false)",
                    helper_call(schema, &helpers.role_lookup)
                ),
            )
        }
        HelperRole::AccessPredicate => (
            format!("target_tenant {}", identity.tenant_type),
            "boolean".to_string(),
            format!(
                "SELECT {}() OR coalesce($1 = {}(), false)",
                helper_call(schema, &helpers.admin_predicate),
                helper_call(schema, &helpers.tenant_lookup)
            ),
        ),
    };

    let sql = format!(
        "CREATE OR REPLACE FUNCTION {call}({arguments})\n\
         RETURNS {returns}\n\
         LANGUAGE sql\n\
         STABLE\n\
         SECURITY DEFINER\n\
         SET search_path = {search_path}\n\
         AS $fn$\n  {body}\n$fn$;",
        call = helper_call(schema, &name),
        search_path = quote_ident(schema),
    );
    Ok(HelperDefinition { role, name, sql })
}

fn lookup_body(identity: &IdentityConfig, column: &str, users: &str, cast: &str) -> String {
    format!(
        "SELECT {}{cast} FROM {users} WHERE {} = {} LIMIT 1",
        quote_ident(column),
        quote_ident(&identity.id_column),
        identity.current_user
    )
}

/// One policy to create for a purpose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyTemplate {
    /// Purpose served.
    pub purpose: PolicyPurpose,
    /// Deterministic policy name.
    pub name: String,
    /// Governed command.
    pub command: PolicyCommand,
    /// `USING` predicate.
    pub using: Option<String>,
    /// `WITH CHECK` predicate.
    pub with_check: Option<String>,
    /// Helpers the predicates call.
    pub helpers: Vec<HelperRole>,
}

/// Inputs shared by every policy template of a run.
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    /// Schema holding the helper functions.
    pub schema: &'a str,
    /// Helper names.
    pub helpers: &'a HelperNames,
    /// Current-user SQL expression.
    pub current_user: &'a str,
}

fn required_column<'t>(
    table: &TableDescriptor,
    classification: &'t TableClassification,
    setting: &'static str,
    value: &'t Option<String>,
) -> Result<&'t str, RemediationError> {
    let column = value
        .as_deref()
        .ok_or_else(|| RemediationError::MissingTemplateSetting {
            table: table.table.to_string(),
            profile: classification.profile.to_string(),
            setting,
        })?;
    if !table.has_column(column) {
        return Err(RemediationError::UnknownColumn {
            table: table.table.to_string(),
            column: column.to_string(),
        });
    }
    Ok(column)
}

/// Build the policy serving `purpose` on `table`.
pub fn policy_template(
    table: &TableDescriptor,
    classification: &TableClassification,
    purpose: PolicyPurpose,
    ctx: &TemplateContext<'_>,
) -> Result<PolicyTemplate, RemediationError> {
    let call = |role: HelperRole| helper_call(ctx.schema, ctx.helpers.name(role));

    let (using, with_check, helpers) = match purpose {
        PolicyPurpose::AdminAll => {
            let predicate = format!("{}()", call(HelperRole::AdminPredicate));
            (
                Some(predicate.clone()),
                Some(predicate),
                vec![HelperRole::AdminPredicate],
            )
        }
        PolicyPurpose::TenantRead => {
            let column = required_column(
                table,
                classification,
                "tenantColumn",
                &classification.tenant_column,
            )?;
            (
                Some(format!(
                    "{} = {}()",
                    quote_ident(column),
                    call(HelperRole::TenantLookup)
                )),
                None,
                vec![HelperRole::TenantLookup],
            )
        }
        PolicyPurpose::TenantWrite => {
            let column = required_column(
                table,
                classification,
                "tenantColumn",
                &classification.tenant_column,
            )?;
            let predicate = format!(
                "{}({})",
                call(HelperRole::AccessPredicate),
                quote_ident(column)
            );
            (
                Some(predicate.clone()),
                Some(predicate),
                vec![HelperRole::AccessPredicate],
            )
        }
        PolicyPurpose::SelfRead | PolicyPurpose::SelfUpdate => {
            let column = required_column(
                table,
                classification,
                "ownerColumn",
                &classification.owner_column,
            )?;
            let predicate = format!("{} = {}", quote_ident(column), ctx.current_user);
            let with_check = (purpose == PolicyPurpose::SelfUpdate).then(|| predicate.clone());
            (Some(predicate), with_check, Vec::new())
        }
        PolicyPurpose::PublicRead => {
            let column = required_column(
                table,
                classification,
                "activityColumn",
                &classification.activity_column,
            )?;
            (
                Some(format!("{} = true", quote_ident(column))),
                None,
                Vec::new(),
            )
        }
    };

    Ok(PolicyTemplate {
        purpose,
        name: purpose.policy_name(&table.table),
        command: purpose.command(),
        using,
        with_check,
        helpers,
    })
}

/// `CREATE POLICY` guarded by a `pg_policies` existence check.
pub fn guarded_create_policy(table: &TableRef, template: &PolicyTemplate) -> String {
    let mut create = format!(
        "CREATE POLICY {} ON {}\n      AS PERMISSIVE FOR {} TO public",
        quote_ident(&template.name),
        table.quoted(),
        template.command
    );
    if let Some(using) = &template.using {
        create.push_str(&format!("\n      USING ({using})"));
    }
    if let Some(check) = &template.with_check {
        create.push_str(&format!("\n      WITH CHECK ({check})"));
    }
    format!(
        "DO $$\n\
         BEGIN\n  \
         IF NOT EXISTS (\n    \
         SELECT 1 FROM pg_policies\n    \
         WHERE schemaname = {} AND tablename = {} AND policyname = {}\n  \
         ) THEN\n    \
         {create};\n  \
         END IF;\n\
         END\n\
         $$;",
        quote_literal(&table.schema),
        quote_literal(&table.name),
        quote_literal(&template.name),
    )
}

/// `ALTER TABLE … ENABLE ROW LEVEL SECURITY`.
pub fn enable_rls(table: &TableRef) -> String {
    format!("ALTER TABLE {} ENABLE ROW LEVEL SECURITY;", table.quoted())
}

/// `CREATE INDEX IF NOT EXISTS`.
pub fn create_index(table: &TableRef, name: &str, columns: &[String]) -> String {
    let columns = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} ({columns});",
        quote_ident(name),
        table.quoted()
    )
}
