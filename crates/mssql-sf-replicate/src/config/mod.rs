//! Connection configuration sourced from the environment.

mod types;
mod validation;

pub use types::*;

use crate::error::{ReplicateError, Result};

/// Source connection keys.
pub const ENV_SQL_SERVER: &str = "FN_SQL_SERVER";
pub const ENV_SQL_USER: &str = "FN_SQL_USER";
pub const ENV_SQL_PASSWORD: &str = "FN_SQL_PASSWORD";
pub const ENV_SQL_PORT: &str = "FN_SQL_PORT";
pub const ENV_SQL_APP_NAME: &str = "FN_SQL_APP_NAME";
pub const ENV_SQL_ENCRYPT: &str = "FN_SQL_ENCRYPT";
pub const ENV_SQL_TRUST_CERT: &str = "FN_SQL_TRUST_CERT";

/// Destination connection keys.
pub const ENV_SF_ACCOUNT: &str = "FN_SF_ACCOUNT";
pub const ENV_SF_USER: &str = "FN_SF_USER";
pub const ENV_SF_PASSWORD: &str = "FN_SF_PASSWORD";
pub const ENV_SF_AUTHENTICATOR: &str = "FN_SF_AUTHENTICATOR";
pub const ENV_SF_ROLE: &str = "FN_SF_ROLE";
pub const ENV_SF_WAREHOUSE: &str = "FN_SF_WAREHOUSE";
pub const ENV_SF_DATABASE: &str = "FN_SF_DATABASE";
pub const ENV_SF_SCHEMA: &str = "FN_SF_SCHEMA";
pub const ENV_SF_HOST: &str = "FN_SF_HOST";

impl SourceConfig {
    /// Read the source connection from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the source connection from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = match non_empty(&lookup, ENV_SQL_PORT) {
            Some(raw) => raw.parse::<u16>().map_err(|_| {
                ReplicateError::Config(format!("{} must be a port number, got '{}'", ENV_SQL_PORT, raw))
            })?,
            None => default_mssql_port(),
        };

        let config = Self {
            host: required(&lookup, ENV_SQL_SERVER)?,
            port,
            user: required(&lookup, ENV_SQL_USER)?,
            password: lookup(ENV_SQL_PASSWORD).unwrap_or_default(),
            app_name: non_empty(&lookup, ENV_SQL_APP_NAME).unwrap_or_else(default_app_name),
            encrypt: parse_flag(&lookup, ENV_SQL_ENCRYPT, true)?,
            trust_server_cert: parse_flag(&lookup, ENV_SQL_TRUST_CERT, false)?,
        };
        validation::validate_source(&config)?;
        Ok(config)
    }
}

impl TargetConfig {
    /// Read the destination connection from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the destination connection from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self {
            account: required(&lookup, ENV_SF_ACCOUNT)?,
            user: required(&lookup, ENV_SF_USER)?,
            password: lookup(ENV_SF_PASSWORD).unwrap_or_default(),
            authenticator: non_empty(&lookup, ENV_SF_AUTHENTICATOR)
                .unwrap_or_else(default_authenticator),
            role: non_empty(&lookup, ENV_SF_ROLE),
            warehouse: non_empty(&lookup, ENV_SF_WAREHOUSE),
            database: non_empty(&lookup, ENV_SF_DATABASE),
            schema: non_empty(&lookup, ENV_SF_SCHEMA),
            host: non_empty(&lookup, ENV_SF_HOST),
        };
        validation::validate_target(&config)?;
        Ok(config)
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required<F>(lookup: &F, key: &str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    non_empty(lookup, key)
        .ok_or_else(|| ReplicateError::Config(format!("environment variable {} is required", key)))
}

fn parse_flag<F>(lookup: &F, key: &str, default: bool) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    match non_empty(lookup, key) {
        None => Ok(default),
        Some(raw) => match raw.to_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(true),
            "false" | "no" | "0" | "disable" => Ok(false),
            _ => Err(ReplicateError::Config(format!(
                "{} must be true or false, got '{}'",
                key, raw
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_source_defaults() {
        let config = SourceConfig::from_lookup(lookup(&[
            (ENV_SQL_SERVER, "sql.internal"),
            (ENV_SQL_USER, "etl"),
            (ENV_SQL_PASSWORD, "pw"),
        ]))
        .unwrap();

        assert_eq!(config.port, 1433);
        assert_eq!(config.app_name, "mssql-sf-replicate");
        assert!(config.encrypt);
        assert!(!config.trust_server_cert);
    }

    #[test]
    fn test_source_missing_server() {
        let err = SourceConfig::from_lookup(lookup(&[(ENV_SQL_USER, "etl")])).unwrap_err();
        assert!(err.to_string().contains(ENV_SQL_SERVER));
    }

    #[test]
    fn test_source_bad_port() {
        let result = SourceConfig::from_lookup(lookup(&[
            (ENV_SQL_SERVER, "sql.internal"),
            (ENV_SQL_USER, "etl"),
            (ENV_SQL_PORT, "not-a-port"),
        ]));
        assert!(matches!(result, Err(ReplicateError::Config(_))));
    }

    #[test]
    fn test_target_defaults_and_base_url() {
        let config = TargetConfig::from_lookup(lookup(&[
            (ENV_SF_ACCOUNT, "acme-xy123"),
            (ENV_SF_USER, "loader"),
            (ENV_SF_PASSWORD, "pw"),
            (ENV_SF_WAREHOUSE, "LOAD_WH"),
        ]))
        .unwrap();

        assert_eq!(config.authenticator, "snowflake");
        assert_eq!(config.warehouse.as_deref(), Some("LOAD_WH"));
        assert!(config.role.is_none());
        assert_eq!(config.base_url(), "https://acme-xy123.snowflakecomputing.com");
    }

    #[test]
    fn test_target_host_override() {
        let config = TargetConfig::from_lookup(lookup(&[
            (ENV_SF_ACCOUNT, "acme"),
            (ENV_SF_USER, "loader"),
            (ENV_SF_PASSWORD, "pw"),
            (ENV_SF_HOST, "http://localhost:8080/"),
        ]))
        .unwrap();
        assert_eq!(config.base_url(), "http://localhost:8080");
    }
}
