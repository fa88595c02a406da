/// Section-ordered, idempotent remediation plan and its SQL rendering.
pub mod remediation;
/// DDL templates for helpers, indexes, RLS enablement and guarded policies.
pub mod templates;
