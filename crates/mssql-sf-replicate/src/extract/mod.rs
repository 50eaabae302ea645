//! Batch extraction.
//!
//! One `select` per table with the manifest's columns listed explicitly in
//! stored order. Rows are then pulled off the stream `row_split_size` at a
//! time; nothing beyond the current batch is buffered.

use std::time::Duration;

use futures::StreamExt;
use tracing::debug;

use crate::error::{ReplicateError, Result};
use crate::manifest::Table;
use crate::source::{RowStream, SourceConnection, SqlRow};

/// Bracket-quote an MSSQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// `select [c1],[c2] from [db].[schema].[table]`
pub fn select_sql(database: &str, schema: &str, table: &Table) -> String {
    let cols = table
        .columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "select {} from {}.{}.{}",
        cols,
        quote_ident(database),
        quote_ident(schema),
        quote_ident(&table.name)
    )
}

/// One fetched batch.
#[derive(Debug, Clone, PartialEq)]
pub struct RawBatch {
    pub rows: Vec<SqlRow>,
    /// Cumulative offset after this batch: a multiple of the batch size,
    /// used only to name the batch.
    pub offset: usize,
}

/// Pull-based batch reader over one table's row stream.
pub struct BatchExtractor<'a> {
    table: String,
    rows: RowStream<'a>,
    batch_size: usize,
    offset: usize,
    timeout: Option<Duration>,
    exhausted: bool,
}

impl<'a> BatchExtractor<'a> {
    /// Issue the table's select and prepare to read it in batches.
    pub async fn open(
        conn: &'a mut dyn SourceConnection,
        database: &str,
        schema: &str,
        table: &Table,
        timeout: Option<Duration>,
    ) -> Result<BatchExtractor<'a>> {
        if table.columns.is_empty() {
            return Err(ReplicateError::extract(
                &table.name,
                "table has no columns to select",
            ));
        }

        let sql = select_sql(database, schema, table);
        debug!("{}", sql);
        let column_types = table.column_types();

        let open = conn.stream_rows(&sql, &column_types);
        let rows = match timeout {
            Some(limit) => tokio::time::timeout(limit, open).await.map_err(|_| {
                ReplicateError::Timeout {
                    operation: format!("querying {}", table.name),
                    seconds: limit.as_secs(),
                }
            })??,
            None => open.await?,
        };

        Ok(Self::from_stream(&table.name, rows, table.row_split_size, timeout))
    }

    /// Wrap an already-open row stream.
    pub fn from_stream(
        table: &str,
        rows: RowStream<'a>,
        batch_size: usize,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            table: table.to_string(),
            rows,
            batch_size: batch_size.max(1),
            offset: 0,
            timeout,
            exhausted: false,
        }
    }

    /// Cumulative offset of the last batch returned.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Fetch the next batch, or `None` once a fetch comes back empty.
    pub async fn next_batch(&mut self) -> Result<Option<RawBatch>> {
        if self.exhausted {
            return Ok(None);
        }

        let rows = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.fetch())
                .await
                .map_err(|_| ReplicateError::Timeout {
                    operation: format!("fetching a batch from {}", self.table),
                    seconds: limit.as_secs(),
                })??,
            None => self.fetch().await?,
        };

        if rows.is_empty() {
            self.exhausted = true;
            return Ok(None);
        }
        if rows.len() < self.batch_size {
            self.exhausted = true;
        }

        self.offset += self.batch_size;
        Ok(Some(RawBatch {
            rows,
            offset: self.offset,
        }))
    }

    async fn fetch(&mut self) -> Result<Vec<SqlRow>> {
        let mut rows = Vec::with_capacity(self.batch_size.min(8192));
        while rows.len() < self.batch_size {
            match self.rows.next().await {
                Some(row) => rows.push(row.map_err(|e| match e {
                    ReplicateError::Extract { message, .. } => {
                        ReplicateError::extract(&self.table, message)
                    }
                    other => other,
                })?),
                None => break,
            }
        }
        Ok(rows)
    }
}
