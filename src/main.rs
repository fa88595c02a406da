//! CLI entry point for `rls-audit`.

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::Parser;
use rls_audit::audit::{run_audit, run_audit_pooled, AuditOutcome};
use rls_audit::catalog::introspect::{introspect, SnapshotRequest};
use rls_audit::catalog::snapshot::Snapshot;
use rls_audit::catalog::static_catalog::StaticCatalog;
use rls_audit::classifier::classification::ClassificationMap;
use rls_audit::config::{AuditSettings, ConnectionDescriptor};
use rls_audit::error::AuditError;
use rls_audit::generator::remediation;
use rls_audit::output::{formatter, report};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "rls-audit",
    about = "Audit PostgreSQL integrity, FK indexing and row-level security, and emit remediation DDL"
)]
struct Cli {
    /// Classification map (JSON)
    #[arg(long)]
    classification: PathBuf,

    /// Audit a JSON catalog export instead of a live database
    #[arg(long)]
    catalog_json: Option<PathBuf>,

    /// Full connection URL
    #[arg(long, env = "DATABASE_URL")]
    db_url: Option<String>,

    /// Database host
    #[arg(long, env = "PGHOST")]
    host: Option<String>,

    /// Database port
    #[arg(long, env = "PGPORT")]
    port: Option<u16>,

    /// Login role
    #[arg(long, env = "PGUSER")]
    user: Option<String>,

    /// Password
    #[arg(long, env = "PGPASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Database name
    #[arg(long, env = "PGDATABASE")]
    dbname: Option<String>,

    /// libpq sslmode
    #[arg(long, env = "PGSSLMODE")]
    sslmode: Option<String>,

    /// Schema to audit
    #[arg(long, default_value = "public")]
    schema: String,

    /// Orphan probe workers (1 = sequential)
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..=64))]
    workers: u16,

    /// Per-probe statement timeout in milliseconds
    #[arg(long, default_value_t = 30_000)]
    query_timeout_ms: u64,

    /// Output directory
    #[arg(long, default_value = "rls-audit-output")]
    output_dir: PathBuf,

    /// Base name of the written artifacts
    #[arg(long, default_value = "audit")]
    name: String,

    /// Print verbose diagnostics
    #[arg(long)]
    verbose: bool,
}

impl Cli {
    fn connection(&self) -> ConnectionDescriptor {
        ConnectionDescriptor {
            url: self.db_url.clone(),
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            database: self.dbname.clone(),
            sslmode: self.sslmode.clone(),
        }
    }

    fn settings(&self) -> AuditSettings {
        AuditSettings {
            schema: self.schema.clone(),
            workers: usize::from(self.workers),
            query_timeout: Duration::from_millis(self.query_timeout_ms),
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(&cli) {
        Ok(outcome) if outcome.is_clean() => {}
        Ok(_) => process::exit(1),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(e.exit_code());
        }
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_env("RLS_AUDIT_LOG").unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: &Cli) -> Result<AuditOutcome, AuditError> {
    let map = ClassificationMap::load(&cli.classification)?;
    for warning in map.warnings() {
        warn!("{warning}");
    }
    let settings = cli.settings();

    let (snapshot, outcome) = match &cli.catalog_json {
        Some(path) => audit_static(path, &settings, &map)?,
        None => {
            let connection = cli.connection();
            if connection.is_empty() {
                return Err(AuditError::Configuration(
                    "no catalog source: pass --catalog-json or connection settings".to_string(),
                ));
            }
            audit_live(&connection, &settings, &map)?
        }
    };

    let plan = remediation::synthesize(&snapshot, &map, &outcome);
    let report = report::build_report(&outcome, &plan);
    let written = formatter::write_output(&cli.output_dir, &cli.name, &report, &plan)?;

    if cli.verbose {
        eprintln!(
            "Audited {} tables in schema {}: {} finding(s), {} remediation statement(s)",
            outcome.tables_audited,
            outcome.schema,
            outcome.findings.len(),
            plan.statements.len()
        );
        eprintln!("Report: {}", written.report.display());
    }
    Ok(outcome)
}

fn audit_static(
    path: &std::path::Path,
    settings: &AuditSettings,
    map: &ClassificationMap,
) -> Result<(Snapshot, AuditOutcome), AuditError> {
    let mut catalog = StaticCatalog::load(path)?;
    let request = SnapshotRequest {
        schema: settings.schema.clone(),
        helper_names: map.helpers.all_names(),
    };
    let snapshot = introspect(&mut catalog, &request)?;
    info!(path = %path.display(), "auditing static catalog");

    let outcome = if settings.workers > 1 {
        run_audit_pooled(&snapshot, map, &&catalog, settings.workers)
    } else {
        run_audit(&snapshot, map, &mut catalog.probe())
    };
    Ok((snapshot, outcome))
}

#[cfg(feature = "db")]
fn audit_live(
    connection: &ConnectionDescriptor,
    settings: &AuditSettings,
    map: &ClassificationMap,
) -> Result<(Snapshot, AuditOutcome), AuditError> {
    let url = connection.to_url()?;
    info!(target_db = %connection.redacted(), "auditing live database");
    rls_audit::catalog::postgres::audit_database(url.as_str(), settings, map)
}

#[cfg(not(feature = "db"))]
fn audit_live(
    connection: &ConnectionDescriptor,
    _settings: &AuditSettings,
    _map: &ClassificationMap,
) -> Result<(Snapshot, AuditOutcome), AuditError> {
    connection.to_url()?;
    Err(AuditError::Configuration(
        "live database auditing requires the `db` feature; use --catalog-json".to_string(),
    ))
}
