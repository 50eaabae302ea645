//! # mssql-sf-replicate
//!
//! Metadata-driven replication of MSSQL tables into Snowflake.
//!
//! A table manifest names the tables to copy. The library provides:
//!
//! - **Schema discovery** against the source catalog, producing destination DDL
//!   and an enriched rules document
//! - **Batched extraction** that streams rows in fixed-size batches
//! - **Columnar batches** built on Apache Arrow
//! - **Loading** into Snowflake, or into local GZIP parquet files
//! - **Parallel tables** with a configurable worker pool
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mssql_sf_replicate::{
//!     MssqlPool, ReplicationConfig, Replicator, SnowflakeSinkFactory, SourceConfig, TargetConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> mssql_sf_replicate::Result<()> {
//!     let config = ReplicationConfig::default();
//!     let pool = MssqlPool::new(SourceConfig::from_env()?, 4).await?;
//!     let replicator = Replicator::new(config.clone(), Arc::new(pool))?;
//!
//!     replicator.setup("table_config.yaml").await?;
//!
//!     let sink = SnowflakeSinkFactory::new(TargetConfig::from_env()?, config.load_retries)?;
//!     let summary = replicator.load("table_rules.json", Arc::new(sink)).await?;
//!     println!("Replicated {} rows", summary.rows_transferred);
//!     Ok(())
//! }
//! ```

pub mod columnar;
pub mod config;
pub mod discovery;
pub mod error;
pub mod extract;
pub mod manifest;
pub mod orchestrator;
pub mod sink;
pub mod source;
pub mod typemap;

// Re-exports for convenient access
pub use columnar::ColumnarBatch;
pub use config::{ReplicationConfig, SourceConfig, TargetConfig};
pub use discovery::DiscoveryReport;
pub use error::{ReplicateError, Result};
pub use manifest::{Column, Manifest, Table};
pub use orchestrator::{ReplicationSummary, Replicator, SetupOutcome};
pub use sink::{BatchSink, ConnectSink, ParquetSinkFactory, SnowflakeSinkFactory};
pub use source::{ConnectSource, MssqlPool, SourceConnection, SqlValue};
