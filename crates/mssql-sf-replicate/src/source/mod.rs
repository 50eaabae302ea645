//! Source database access.
//!
//! The replication core talks to the source only through [`SourceConnection`]:
//! two catalog queries used by discovery and one streaming query used by the
//! extractor. [`MssqlPool`] is the production implementation.

mod mssql;
mod value;

pub use mssql::MssqlPool;
pub use value::{SqlNullType, SqlRow, SqlValue};

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// One row of the primary key catalog query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKeyRow {
    pub table_catalog: String,
    pub table_schema: String,
    pub table_name: String,
    /// Comma-separated key column names in key order.
    pub primary_key_columns: String,
}

/// One row of the column catalog query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRow {
    pub table_catalog: String,
    pub table_schema: String,
    pub table_name: String,
    pub column_name: String,
    pub ordinal_position: i32,
    pub data_type: String,
    pub numeric_precision: Option<i32>,
    pub numeric_scale: Option<i32>,
}

/// Pull-based stream of source rows.
pub type RowStream<'a> = BoxStream<'a, Result<SqlRow>>;

/// A single live source connection.
#[async_trait]
pub trait SourceConnection: Send {
    /// Run the primary key catalog query.
    async fn primary_key_rows(&mut self, sql: &str) -> Result<Vec<PrimaryKeyRow>>;

    /// Run the column catalog query.
    async fn column_rows(&mut self, sql: &str) -> Result<Vec<ColumnRow>>;

    /// Run a select and stream its rows, decoding each cell by the
    /// corresponding source type name.
    async fn stream_rows<'a>(
        &'a mut self,
        sql: &str,
        column_types: &[String],
    ) -> Result<RowStream<'a>>;
}

/// Hands out independent source connections.
#[async_trait]
pub trait ConnectSource: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn SourceConnection>>;
}
