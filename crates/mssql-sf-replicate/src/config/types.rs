//! Connection and run configuration types.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Source database (MSSQL) connection parameters.
#[derive(Clone)]
pub struct SourceConfig {
    /// Server host.
    pub host: String,

    /// Server port (default: 1433).
    pub port: u16,

    /// Username.
    pub user: String,

    /// Password.
    pub password: String,

    /// Application name reported to the server.
    pub app_name: String,

    /// Encrypt connection (default: true).
    pub encrypt: bool,

    /// Trust server certificate (default: false).
    pub trust_server_cert: bool,
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("app_name", &self.app_name)
            .field("encrypt", &self.encrypt)
            .field("trust_server_cert", &self.trust_server_cert)
            .finish()
    }
}

/// Destination warehouse (Snowflake) connection parameters.
#[derive(Clone)]
pub struct TargetConfig {
    /// Account identifier (e.g. "myorg-account123").
    pub account: String,

    /// Username.
    pub user: String,

    /// Password.
    pub password: String,

    /// Authenticator (default: "snowflake", plain password login).
    pub authenticator: String,

    /// Role to assume for the session.
    pub role: Option<String>,

    /// Compute warehouse.
    pub warehouse: Option<String>,

    /// Target database.
    pub database: Option<String>,

    /// Target schema.
    pub schema: Option<String>,

    /// Host override; derived from the account when unset.
    pub host: Option<String>,
}

impl TargetConfig {
    /// Base URL of the account's endpoint.
    pub fn base_url(&self) -> String {
        match &self.host {
            Some(host) if host.starts_with("http://") || host.starts_with("https://") => {
                host.trim_end_matches('/').to_string()
            }
            Some(host) => format!("https://{}", host.trim_end_matches('/')),
            None => format!("https://{}.snowflakecomputing.com", self.account),
        }
    }
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConfig")
            .field("account", &self.account)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("authenticator", &self.authenticator)
            .field("role", &self.role)
            .field("warehouse", &self.warehouse)
            .field("database", &self.database)
            .field("schema", &self.schema)
            .field("host", &self.host)
            .finish()
    }
}

/// Run behavior for the setup and load flows.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Tables replicated concurrently; 1 keeps the run strictly sequential.
    pub workers: usize,

    /// Timezone stamped onto naive timestamp columns.
    pub timezone: String,

    /// Emit the primary key constraint in generated DDL.
    pub use_pk: bool,

    /// Upper bound on a single batch fetch.
    pub query_timeout: Option<Duration>,

    /// Upper bound on a single batch load.
    pub load_timeout: Option<Duration>,

    /// Retries for transient destination failures.
    pub load_retries: u32,

    /// Where the setup flow writes the DDL artifact.
    pub ddl_path: PathBuf,

    /// Where the setup flow writes the rules artifact.
    pub rules_path: PathBuf,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            timezone: DEFAULT_TIMEZONE.to_string(),
            use_pk: true,
            query_timeout: None,
            load_timeout: None,
            load_retries: DEFAULT_LOAD_RETRIES,
            ddl_path: PathBuf::from(DEFAULT_DDL_PATH),
            rules_path: PathBuf::from(DEFAULT_RULES_PATH),
        }
    }
}

pub const DEFAULT_TIMEZONE: &str = "UTC";
pub const DEFAULT_LOAD_RETRIES: u32 = 3;
pub const DEFAULT_DDL_PATH: &str = "./table_ddl.sql";
pub const DEFAULT_RULES_PATH: &str = "./table_rules.json";

// Defaults for unset environment keys
pub(crate) fn default_mssql_port() -> u16 {
    1433
}

pub(crate) fn default_app_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

pub(crate) fn default_authenticator() -> String {
    "snowflake".to_string()
}
