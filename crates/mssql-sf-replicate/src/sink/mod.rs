//! Batch destinations.
//!
//! A [`BatchSink`] receives columnar batches one at a time, in source read
//! order, and either lands a whole batch or fails it.

mod parquet;
mod snowflake;

pub use self::parquet::{ParquetSink, ParquetSinkFactory};
pub use self::snowflake::{SnowflakeSink, SnowflakeSinkFactory};

use crate::columnar::ColumnarBatch;
use crate::error::Result;
use crate::manifest::TableRef;
use async_trait::async_trait;
use serde::Serialize;

/// What a sink did with one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadOutcome {
    /// Rows written.
    pub rows: usize,
    /// Attempts it took, 1 when nothing was retried.
    pub attempts: u32,
    /// Where the batch landed (destination table or file path).
    pub location: String,
}

/// Receives the columnar batches of one flow or worker.
#[async_trait]
pub trait BatchSink: Send {
    /// Write one batch for `target`. The batch lands entirely or not at all.
    async fn write_batch(
        &mut self,
        target: TableRef<'_>,
        batch: &ColumnarBatch,
    ) -> Result<LoadOutcome>;

    /// Release the sink's resources.
    async fn finish(&mut self) -> Result<()>;
}

/// Hands out independent sinks.
#[async_trait]
pub trait ConnectSink: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn BatchSink>>;
}
