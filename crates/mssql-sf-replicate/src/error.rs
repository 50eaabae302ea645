//! Error types for the replication library.

use thiserror::Error;

/// Main error type for replication operations.
#[derive(Error, Debug)]
pub enum ReplicateError {
    /// Configuration error (malformed manifest, missing environment keys, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Mutually exclusive or required options violated.
    #[error("Usage error: {0}")]
    Usage(String),

    /// Manifest tables that could not be matched against the source catalog.
    #[error("Discovery failed: {0}")]
    Discovery(String),

    /// DDL was requested for a table whose columns were never populated.
    #[error("Destination DDL has not been generated for table {0}")]
    DdlPrecondition(String),

    /// Source database connection or query error
    #[error("Source database error: {0}")]
    Source(#[from] tiberius::error::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Destination warehouse error (login, statement execution).
    #[error("Destination error: {0}")]
    Destination(String),

    /// Row extraction failed for a specific table
    #[error("Extraction failed for table {table}: {message}")]
    Extract { table: String, message: String },

    /// Batch load failed for a specific table
    #[error("Load failed for table {table}: {message}")]
    Load { table: String, message: String },

    /// Columnar batch construction error
    #[error("Columnar batch error: {0}")]
    Columnar(#[from] arrow::error::ArrowError),

    /// Parquet file write error
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// A query or load call exceeded its configured timeout
    #[error("Timed out after {seconds}s while {operation}")]
    Timeout { operation: String, seconds: u64 },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Replication was cancelled (SIGINT, etc.)
    #[error("Replication cancelled")]
    Cancelled,
}

impl ReplicateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        ReplicateError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create an Extract error
    pub fn extract(table: impl Into<String>, message: impl Into<String>) -> Self {
        ReplicateError::Extract {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a Load error
    pub fn load(table: impl Into<String>, message: impl Into<String>) -> Self {
        ReplicateError::Load {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Process exit code for this error.
    ///
    /// Usage, configuration, and document I/O or parse failures exit with 1.
    pub fn exit_code(&self) -> u8 {
        match self {
            ReplicateError::Config(_)
            | ReplicateError::Usage(_)
            | ReplicateError::Io(_)
            | ReplicateError::Yaml(_)
            | ReplicateError::Json(_) => 1,
            ReplicateError::Cancelled => 130,
            _ => 2,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ReplicateError::Usage("both flags".into()).exit_code(), 1);
        assert_eq!(ReplicateError::Config("bad yaml".into()).exit_code(), 1);
        assert_eq!(ReplicateError::Cancelled.exit_code(), 130);
        assert_eq!(ReplicateError::load("orders", "boom").exit_code(), 2);
    }

    #[test]
    fn test_format_detailed_includes_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "table_rules.json");
        let err = ReplicateError::from(io);
        let detailed = err.format_detailed();
        assert!(detailed.starts_with("Error: IO error: table_rules.json"));
    }
}
