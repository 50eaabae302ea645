//! Local parquet file sink.
//!
//! Each batch becomes `<dir>/<database>/<schema>/<table>_<offset>.parquet.gzip`
//! so same-named tables of different namespaces never share a file. Files are
//! neither uploaded nor cleaned up.

use std::fs::File;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, GzipLevel};
use parquet::file::properties::WriterProperties;
use tracing::debug;

use super::{BatchSink, ConnectSink, LoadOutcome};
use crate::columnar::ColumnarBatch;
use crate::error::{ReplicateError, Result};
use crate::manifest::TableRef;

pub const PARQUET_EXTENSION: &str = "parquet.gzip";

/// Creates [`ParquetSink`]s that share one output directory.
#[derive(Debug, Clone)]
pub struct ParquetSinkFactory {
    dir: PathBuf,
}

impl ParquetSinkFactory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ConnectSink for ParquetSinkFactory {
    async fn connect(&self) -> Result<Box<dyn BatchSink>> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(Box::new(ParquetSink::new(self.dir.clone())))
    }
}

/// Writes each batch to its own GZIP-compressed parquet file.
#[derive(Debug)]
pub struct ParquetSink {
    dir: PathBuf,
    files_written: usize,
}

impl ParquetSink {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            files_written: 0,
        }
    }

    /// Path for one batch of `target`.
    pub fn batch_path(&self, target: TableRef<'_>, batch: &ColumnarBatch) -> PathBuf {
        self.dir
            .join(target.database)
            .join(target.schema)
            .join(format!("{}.{}", batch.batch_id, PARQUET_EXTENSION))
    }
}

fn write_file(path: &Path, batch: &ColumnarBatch) -> Result<()> {
    let props = WriterProperties::builder()
        .set_compression(Compression::GZIP(GzipLevel::default()))
        .build();

    let temp_path = path.with_extension("tmp");
    let file = File::create(&temp_path)?;
    let mut writer = ArrowWriter::try_new(file, batch.record_batch.schema(), Some(props))?;
    writer.write(&batch.record_batch)?;
    writer.close()?;
    std::fs::rename(&temp_path, path)?;
    Ok(())
}

#[async_trait]
impl BatchSink for ParquetSink {
    async fn write_batch(
        &mut self,
        target: TableRef<'_>,
        batch: &ColumnarBatch,
    ) -> Result<LoadOutcome> {
        let path = self.batch_path(target, batch);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let owned = batch.clone();
        let file_path = path.clone();

        tokio::task::spawn_blocking(move || write_file(&file_path, &owned))
            .await
            .map_err(|e| {
                ReplicateError::load(target.qualified_name(), format!("parquet writer task failed: {}", e))
            })??;

        self.files_written += 1;
        debug!("Wrote {} rows to {}", batch.num_rows(), path.display());

        Ok(LoadOutcome {
            rows: batch.num_rows(),
            attempts: 1,
            location: path.display().to_string(),
        })
    }

    async fn finish(&mut self) -> Result<()> {
        debug!("Parquet sink wrote {} files to {}", self.files_written, self.dir.display());
        Ok(())
    }
}
