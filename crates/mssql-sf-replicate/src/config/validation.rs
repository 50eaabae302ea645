//! Configuration validation.

use super::{ReplicationConfig, SourceConfig, TargetConfig};
use crate::error::{ReplicateError, Result};

/// Validate the source connection.
pub fn validate_source(config: &SourceConfig) -> Result<()> {
    if config.host.is_empty() {
        return Err(ReplicateError::Config("source host is required".into()));
    }
    if config.user.is_empty() {
        return Err(ReplicateError::Config("source user is required".into()));
    }
    if config.port == 0 {
        return Err(ReplicateError::Config("source port must be non-zero".into()));
    }
    Ok(())
}

/// Validate the destination connection.
pub fn validate_target(config: &TargetConfig) -> Result<()> {
    if config.account.is_empty() {
        return Err(ReplicateError::Config("destination account is required".into()));
    }
    if config.user.is_empty() {
        return Err(ReplicateError::Config("destination user is required".into()));
    }
    if config.authenticator.eq_ignore_ascii_case("snowflake") && config.password.is_empty() {
        return Err(ReplicateError::Config(
            "destination password is required for the snowflake authenticator".into(),
        ));
    }
    Ok(())
}

impl ReplicationConfig {
    /// Validate run settings.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(ReplicateError::Config("workers must be at least 1".into()));
        }
        crate::columnar::parse_timezone(&self.timezone)?;
        Ok(())
    }
}
