use std::time::Duration;

use url::Url;

use crate::error::AuditError;

/// How to reach the audited database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    /// Full connection URL; overrides every other field.
    pub url: Option<String>,
    /// Server host.
    pub host: Option<String>,
    /// Server port.
    pub port: Option<u16>,
    /// Login role.
    pub user: Option<String>,
    /// Password.
    pub password: Option<String>,
    /// Database name.
    pub database: Option<String>,
    /// libpq `sslmode`.
    pub sslmode: Option<String>,
}

impl ConnectionDescriptor {
    /// True when no connection setting was given at all.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// `postgres://` URL for the driver.
    pub fn to_url(&self) -> Result<Url, AuditError> {
        if let Some(url) = &self.url {
            let parsed = Url::parse(url)
                .map_err(|e| AuditError::Configuration(format!("invalid database URL: {e}")))?;
            if !matches!(parsed.scheme(), "postgres" | "postgresql") {
                return Err(AuditError::Configuration(format!(
                    "unsupported database URL scheme '{}'",
                    parsed.scheme()
                )));
            }
            return Ok(parsed);
        }

        let invalid = |what: &str| AuditError::Configuration(format!("invalid {what}"));
        let mut url = Url::parse("postgres://localhost")
            .map_err(|e| AuditError::Configuration(e.to_string()))?;
        url.set_host(Some(self.host.as_deref().unwrap_or("localhost")))
            .map_err(|_| invalid("host"))?;
        url.set_port(Some(self.port.unwrap_or(5432)))
            .map_err(|()| invalid("port"))?;
        if let Some(user) = &self.user {
            url.set_username(user).map_err(|()| invalid("user"))?;
        }
        if let Some(password) = &self.password {
            url.set_password(Some(password))
                .map_err(|()| invalid("password"))?;
        }
        if let Some(database) = &self.database {
            url.set_path(&format!("/{database}"));
        }
        if let Some(sslmode) = &self.sslmode {
            url.query_pairs_mut().append_pair("sslmode", sslmode);
        }
        Ok(url)
    }

    /// The URL with any password masked, for logs.
    pub fn redacted(&self) -> String {
        match self.to_url() {
            Ok(mut url) => {
                if url.password().is_some() {
                    let _ = url.set_password(Some("***"));
                }
                url.to_string()
            }
            Err(_) => "<invalid connection settings>".to_string(),
        }
    }
}

/// Run settings shared by every audit stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditSettings {
    /// Audited schema.
    pub schema: String,
    /// Orphan probe workers (1 = sequential on the catalog connection).
    pub workers: usize,
    /// Per-probe statement timeout.
    pub query_timeout: Duration,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            workers: 1,
            query_timeout: Duration::from_secs(30),
        }
    }
}
