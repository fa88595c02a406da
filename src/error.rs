use thiserror::Error;

use crate::audit::findings::ProbeFailure;

/// Failure while reading the catalog. Always fatal: a partial snapshot would
/// produce a meaningless graph.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// A catalog query failed.
    #[error("{operation} failed: {message}")]
    Query {
        /// Catalog operation that was running (`list_tables`, `list_policies`, ...).
        operation: &'static str,
        /// Driver-reported failure.
        message: String,
    },
    /// The collected rows do not form a consistent snapshot.
    #[error("inconsistent catalog snapshot: {0}")]
    Inconsistent(String),
    /// The static catalog document could not be read or decoded.
    #[error("invalid catalog document: {0}")]
    Document(String),
}

#[cfg(feature = "db")]
impl From<diesel::result::Error> for CatalogError {
    fn from(error: diesel::result::Error) -> Self {
        CatalogError::Query {
            operation: "catalog transaction",
            message: error.to_string(),
        }
    }
}

/// Failure of a single orphan probe. Never fatal: the edge is reported as an
/// `AuditorError` finding and the remaining edges are still probed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    /// The probe query ran into the statement timeout.
    #[error("probe exceeded the {timeout_ms} ms statement timeout")]
    Timeout {
        /// Configured per-query budget.
        timeout_ms: u64,
    },
    /// The probe connection was lost or could not be opened.
    #[error("probe connection lost: {0}")]
    ConnectionLost(String),
    /// The catalog source holds no row data for the edge's tables.
    #[error("no row data for {0}")]
    NoData(String),
    /// Any other query failure.
    #[error("probe query failed: {0}")]
    Failed(String),
}

impl ProbeError {
    /// Category reported in the finding.
    pub fn failure(&self) -> ProbeFailure {
        match self {
            ProbeError::Timeout { .. } => ProbeFailure::Timeout,
            ProbeError::ConnectionLost(_) => ProbeFailure::ConnectionLost,
            ProbeError::NoData(_) => ProbeFailure::NoData,
            ProbeError::Failed(_) => ProbeFailure::QueryFailed,
        }
    }
}

/// Why remediation for one table or helper could not be synthesized.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemediationError {
    /// The classification lacks a setting the policy template needs.
    #[error("{profile} table {table} has no {setting} configured")]
    MissingTemplateSetting {
        /// Table being remediated.
        table: String,
        /// Its profile.
        profile: String,
        /// Missing classification key (`tenantColumn`, `ownerColumn`, ...).
        setting: &'static str,
    },
    /// The configured column does not exist on the table.
    #[error("column {column} does not exist on {table}")]
    UnknownColumn {
        /// Table being remediated.
        table: String,
        /// Configured column.
        column: String,
    },
    /// A missing helper cannot be defined from the identity configuration.
    #[error("helper {function} cannot be defined: {reason}")]
    HelperUndefinable {
        /// Helper function name.
        function: String,
        /// What is missing.
        reason: String,
    },
    /// A policy needs a helper that neither exists nor can be defined.
    #[error("helper {function} is neither present nor definable")]
    HelperUnavailable {
        /// Helper function name.
        function: String,
    },
    /// A policy that serves another purpose already carries the derived name.
    #[error("policy {policy} on {table} holds the derived name; rename or drop it first")]
    PolicyNameTaken {
        /// Table being remediated.
        table: String,
        /// Existing policy name.
        policy: String,
    },
}

/// Run-level failure. Every variant aborts the audit before a report is written.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The database could not be reached.
    #[error("connection error: {0}")]
    Connection(String),
    /// Catalog introspection failed.
    #[error("catalog read error: {0}")]
    CatalogRead(#[from] CatalogError),
    /// The classification map is unreadable or invalid.
    #[error("classification error: {0}")]
    Classification(String),
    /// Connection settings or CLI arguments are invalid.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Writing the report or remediation script failed.
    #[error("output error: {0}")]
    Output(String),
}

impl AuditError {
    /// Process exit status for this failure (findings use 0/1, failures 2).
    pub fn exit_code(&self) -> i32 {
        2
    }
}
