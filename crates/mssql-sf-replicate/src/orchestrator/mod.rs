//! Replication driver: the setup, load and file-sink flows.

use crate::columnar;
use crate::config::ReplicationConfig;
use crate::discovery::{discover, DiscoveryReport};
use crate::error::{ReplicateError, Result};
use crate::extract::BatchExtractor;
use crate::manifest::{Manifest, Table, TableRef};
use crate::sink::{BatchSink, ConnectSink, ParquetSinkFactory};
use crate::source::{ConnectSource, SourceConnection};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of the setup flow.
#[derive(Debug, Clone)]
pub struct SetupOutcome {
    /// The enriched manifest that was written as rules.
    pub manifest: Manifest,
    pub report: DiscoveryReport,
    pub ddl_path: PathBuf,
    pub rules_path: PathBuf,
}

/// Final state of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TableStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Per-table replication statistics.
#[derive(Debug, Clone, Serialize)]
pub struct TableSummary {
    /// `database.schema.table`
    pub table: String,
    pub batches: usize,
    pub rows: usize,
    /// Load attempts beyond the first, summed over batches.
    pub retries: u32,
    pub status: TableStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_seconds: f64,
}

/// Result of a load or file-sink run.
#[derive(Debug, Clone, Serialize)]
pub struct ReplicationSummary {
    /// Unique run identifier.
    pub run_id: String,

    /// "completed", "failed" or "cancelled".
    pub status: String,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,

    pub tables_total: usize,
    pub tables_completed: usize,
    pub tables_failed: usize,
    pub batches: usize,
    pub rows_transferred: usize,

    /// Per-table results in manifest order; tables never started are absent.
    pub tables: Vec<TableSummary>,
}

impl ReplicationSummary {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// One unit of work: a table and its namespace.
#[derive(Debug, Clone)]
struct TableJob {
    database: String,
    schema: String,
    table: Table,
}

impl TableJob {
    fn qualified_name(&self) -> String {
        format!("{}.{}.{}", self.database, self.schema, self.table.name)
    }
}

/// Drives replication flows against a source and a sink.
pub struct Replicator {
    config: ReplicationConfig,
    source: Arc<dyn ConnectSource>,
    cancel: CancellationToken,
}

impl Replicator {
    pub fn new(config: ReplicationConfig, source: Arc<dyn ConnectSource>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            source,
            cancel: CancellationToken::new(),
        })
    }

    /// Use an external cancellation token (e.g. wired to SIGINT).
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Setup flow: discover metadata for a configuration document, then write
    /// the DDL and rules artifacts.
    pub async fn setup<P: AsRef<Path>>(&self, config_path: P) -> Result<SetupOutcome> {
        let manifest = Manifest::from_config_file(config_path)?;
        self.setup_manifest(manifest).await
    }

    /// Setup flow over an already-loaded manifest.
    pub async fn setup_manifest(&self, mut manifest: Manifest) -> Result<SetupOutcome> {
        if self.cancel.is_cancelled() {
            return Err(ReplicateError::Cancelled);
        }

        info!("Discovering metadata for {} tables", manifest.table_count());
        let report = {
            let mut conn = self.source.connect().await?;
            discover(&mut manifest, conn.as_mut(), self.config.use_pk).await?
        };

        // nothing is written unless every table has DDL
        manifest.write_ddl(&self.config.ddl_path)?;
        info!("Wrote DDL to {}", self.config.ddl_path.display());
        manifest.write_rules(&self.config.rules_path)?;
        info!("Wrote rules to {}", self.config.rules_path.display());

        Ok(SetupOutcome {
            manifest,
            report,
            ddl_path: self.config.ddl_path.clone(),
            rules_path: self.config.rules_path.clone(),
        })
    }

    /// Load flow: replicate every table of a rules document into `sink`.
    pub async fn load<P: AsRef<Path>>(
        &self,
        rules_path: P,
        sink: Arc<dyn ConnectSink>,
    ) -> Result<ReplicationSummary> {
        let manifest = Manifest::from_rules_file(rules_path)?;
        self.replicate(&manifest, sink).await
    }

    /// File-sink flow: write every batch as a local parquet file under `dir`.
    pub async fn write_files<P: AsRef<Path>, D: Into<PathBuf>>(
        &self,
        rules_path: P,
        dir: D,
    ) -> Result<ReplicationSummary> {
        let sink: Arc<dyn ConnectSink> = Arc::new(ParquetSinkFactory::new(dir));
        self.load(rules_path, sink).await
    }

    /// Replicate every table of an enriched manifest.
    ///
    /// Tables run on at most `workers` concurrent tasks, each with its own
    /// source connection and sink; batches within a table are sequential. The
    /// first failing table stops the run.
    pub async fn replicate(
        &self,
        manifest: &Manifest,
        sink: Arc<dyn ConnectSink>,
    ) -> Result<ReplicationSummary> {
        let started_at = Utc::now();
        let timer = Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let workers = self.config.workers.max(1);

        let jobs: Vec<TableJob> = manifest
            .tables()
            .map(|t| TableJob {
                database: t.database.to_string(),
                schema: t.schema.to_string(),
                table: t.table.clone(),
            })
            .collect();

        info!(
            "Starting run {}: {} tables with {} workers",
            run_id,
            jobs.len(),
            workers
        );

        // stops remaining tables after a failure without touching the caller's token
        let run_cancel = self.cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(workers));
        let config = Arc::new(self.config.clone());
        let mut handles = Vec::with_capacity(jobs.len());

        for job in jobs {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| ReplicateError::pool(e, "acquiring worker slot"))?;

            if run_cancel.is_cancelled() {
                info!("Stopping before {}", job.qualified_name());
                break;
            }

            let name = job.qualified_name();
            let source = self.source.clone();
            let sink = sink.clone();
            let config = config.clone();
            let cancel = run_cancel.clone();

            let handle = tokio::spawn(async move {
                let result = replicate_table(job, source, sink, &config, &cancel).await;
                if result.is_err() {
                    cancel.cancel();
                }
                drop(permit);
                result
            });
            handles.push((name, handle));
        }

        let mut tables = Vec::with_capacity(handles.len());
        let mut first_error: Option<ReplicateError> = None;

        for (name, handle) in handles {
            let (summary, err) = match handle.await {
                Ok(Ok(summary)) => (summary, None),
                Ok(Err((summary, e))) => (summary, Some(e)),
                Err(e) => {
                    error!("{}: task panicked - {}", name, e);
                    let e = ReplicateError::load(&name, format!("task panicked: {}", e));
                    (failed_summary(&name, &e), Some(e))
                }
            };
            tables.push(summary);

            if let Some(e) = err {
                // a real failure outranks the cancellations it caused
                let replace = match &first_error {
                    None => true,
                    Some(ReplicateError::Cancelled) => !matches!(e, ReplicateError::Cancelled),
                    Some(_) => false,
                };
                if replace {
                    first_error = Some(e);
                }
            }
        }

        let completed_at = Utc::now();
        let tables_completed = tables
            .iter()
            .filter(|t| t.status == TableStatus::Completed)
            .count();
        let tables_failed = tables
            .iter()
            .filter(|t| t.status == TableStatus::Failed)
            .count();
        let cancelled = self.cancel.is_cancelled()
            || matches!(first_error, Some(ReplicateError::Cancelled));

        let status = if tables_failed > 0 {
            "failed"
        } else if cancelled {
            "cancelled"
        } else {
            "completed"
        };

        let summary = ReplicationSummary {
            run_id,
            status: status.to_string(),
            started_at,
            completed_at,
            duration_seconds: timer.elapsed().as_secs_f64(),
            tables_total: manifest.table_count(),
            tables_completed,
            tables_failed,
            batches: tables.iter().map(|t| t.batches).sum(),
            rows_transferred: tables.iter().map(|t| t.rows).sum(),
            tables,
        };

        info!(
            "Run {}: {}/{} tables, {} rows in {} batches ({:.1}s)",
            summary.status,
            summary.tables_completed,
            summary.tables_total,
            summary.rows_transferred,
            summary.batches,
            summary.duration_seconds
        );

        match first_error {
            Some(e) => Err(e),
            None if cancelled => Err(ReplicateError::Cancelled),
            None => Ok(summary),
        }
    }
}

fn failed_summary(name: &str, e: &ReplicateError) -> TableSummary {
    TableSummary {
        table: name.to_string(),
        batches: 0,
        rows: 0,
        retries: 0,
        status: TableStatus::Failed,
        error: Some(e.to_string()),
        duration_seconds: 0.0,
    }
}

/// Run `fut` under an optional time limit.
async fn with_timeout<T, F>(limit: Option<Duration>, operation: String, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| ReplicateError::Timeout {
                operation,
                seconds: limit.as_secs(),
            })?,
        None => fut.await,
    }
}

/// Replicate one table on its own connection and sink.
///
/// On failure the partial statistics are returned alongside the error.
async fn replicate_table(
    job: TableJob,
    source: Arc<dyn ConnectSource>,
    sink: Arc<dyn ConnectSink>,
    config: &ReplicationConfig,
    cancel: &CancellationToken,
) -> std::result::Result<TableSummary, (TableSummary, ReplicateError)> {
    let timer = Instant::now();
    let mut summary = TableSummary {
        table: job.qualified_name(),
        batches: 0,
        rows: 0,
        retries: 0,
        status: TableStatus::Completed,
        error: None,
        duration_seconds: 0.0,
    };

    let result = connect_and_copy(&job, source, sink, config, cancel, &mut summary).await;

    summary.duration_seconds = timer.elapsed().as_secs_f64();
    match result {
        Ok(()) => {
            info!(
                "{}: completed ({} rows, {} batches)",
                summary.table, summary.rows, summary.batches
            );
            Ok(summary)
        }
        Err(ReplicateError::Cancelled) => {
            warn!("{}: cancelled after {} batches", summary.table, summary.batches);
            summary.status = TableStatus::Cancelled;
            Err((summary, ReplicateError::Cancelled))
        }
        Err(e) => {
            error!("{}: failed - {}", summary.table, e);
            summary.status = TableStatus::Failed;
            summary.error = Some(e.to_string());
            Err((summary, e))
        }
    }
}

async fn connect_and_copy(
    job: &TableJob,
    source: Arc<dyn ConnectSource>,
    sink: Arc<dyn ConnectSink>,
    config: &ReplicationConfig,
    cancel: &CancellationToken,
    summary: &mut TableSummary,
) -> Result<()> {
    let mut conn = source.connect().await?;
    let mut sink = sink.connect().await?;
    let copied = copy_table(job, conn.as_mut(), sink.as_mut(), config, cancel, summary).await;
    // the sink is released on every exit path
    let finished = sink.finish().await;
    copied.and(finished)
}

async fn copy_table(
    job: &TableJob,
    conn: &mut dyn SourceConnection,
    sink: &mut dyn BatchSink,
    config: &ReplicationConfig,
    cancel: &CancellationToken,
    summary: &mut TableSummary,
) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(ReplicateError::Cancelled);
    }

    let table = &job.table;
    let target = TableRef {
        database: &job.database,
        schema: &job.schema,
        table,
    };
    info!("{}: replicating", summary.table);
    let mut extractor =
        BatchExtractor::open(conn, &job.database, &job.schema, table, config.query_timeout)
            .await?;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ReplicateError::Cancelled),
            next = extractor.next_batch() => next?,
        };
        let Some(raw) = next else { break };

        let batch = columnar::build(&raw, table, &config.timezone)?;
        // a batch handed to the sink runs to completion
        let outcome = with_timeout(
            config.load_timeout,
            format!("loading {}", batch.batch_id),
            sink.write_batch(target, &batch),
        )
        .await?;

        summary.batches += 1;
        summary.rows += outcome.rows;
        summary.retries += outcome.attempts.saturating_sub(1);
        debug!(
            "{}: batch {} ({} rows) -> {}",
            summary.table, batch.batch_id, outcome.rows, outcome.location
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columnar::ColumnarBatch;
    use crate::discovery::tests::{col, pk, MockSource};
    use crate::manifest::Column;
    use crate::sink::LoadOutcome;
    use crate::source::{SqlRow, SqlValue};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct MockPool(MockSource);

    #[async_trait]
    impl ConnectSource for MockPool {
        async fn connect(&self) -> Result<Box<dyn SourceConnection>> {
            Ok(Box::new(self.0.clone()))
        }
    }

    /// Records every batch; fails batches of `fail_table`.
    #[derive(Default)]
    struct RecordingSink {
        batches: Arc<Mutex<Vec<(String, String, usize)>>>,
        finished: Arc<Mutex<usize>>,
        fail_table: Option<String>,
    }

    struct RecordingBatchSink {
        batches: Arc<Mutex<Vec<(String, String, usize)>>>,
        finished: Arc<Mutex<usize>>,
        fail_table: Option<String>,
    }

    #[async_trait]
    impl ConnectSink for RecordingSink {
        async fn connect(&self) -> Result<Box<dyn BatchSink>> {
            Ok(Box::new(RecordingBatchSink {
                batches: self.batches.clone(),
                finished: self.finished.clone(),
                fail_table: self.fail_table.clone(),
            }))
        }
    }

    #[async_trait]
    impl BatchSink for RecordingBatchSink {
        async fn write_batch(
            &mut self,
            target: TableRef<'_>,
            batch: &ColumnarBatch,
        ) -> Result<LoadOutcome> {
            let table = target.table;
            if self.fail_table.as_deref() == Some(table.name.as_str()) {
                return Err(ReplicateError::load(&table.name, "rejected"));
            }
            self.batches.lock().unwrap().push((
                table.name.clone(),
                batch.batch_id.clone(),
                batch.num_rows(),
            ));
            Ok(LoadOutcome {
                rows: batch.num_rows(),
                attempts: 1,
                location: table.destination_name(),
            })
        }

        async fn finish(&mut self) -> Result<()> {
            *self.finished.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn rows(n: i32) -> Vec<SqlRow> {
        (0..n).map(|i| vec![SqlValue::I32(i)]).collect()
    }

    fn enriched(tables: &[&str], batch_size: usize) -> Manifest {
        let mut yaml = String::from("databases:\n  - name: db1\n    schemas:\n      - name: dbo\n        tables:\n");
        for t in tables {
            yaml.push_str(&format!("          - name: {}\n            row_split_size: {}\n", t, batch_size));
        }
        let mut manifest = Manifest::from_config_yaml(&yaml).unwrap();
        for entry in manifest.tables_mut() {
            entry.table.columns = vec![Column::new("id", 1, "int", None, None)];
        }
        manifest.generate_ddl(true);
        manifest
    }

    fn source_with(data: &[(&str, i32)]) -> Arc<dyn ConnectSource> {
        let table_data: HashMap<String, Vec<SqlRow>> =
            data.iter().map(|(t, n)| (t.to_string(), rows(*n))).collect();
        Arc::new(MockPool(MockSource {
            table_data,
            ..Default::default()
        }))
    }

    fn config_in(dir: &Path) -> ReplicationConfig {
        ReplicationConfig {
            ddl_path: dir.join("table_ddl.sql"),
            rules_path: dir.join("table_rules.json"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_sequential_load_in_manifest_order() {
        let manifest = enriched(&["a", "b"], 10);
        let source = source_with(&[("a", 25), ("b", 10)]);
        let sink = Arc::new(RecordingSink::default());

        let replicator = Replicator::new(ReplicationConfig::default(), source).unwrap();
        let summary = replicator.replicate(&manifest, sink.clone()).await.unwrap();

        let batches = sink.batches.lock().unwrap().clone();
        let ids: Vec<&str> = batches.iter().map(|(_, id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a_10", "a_20", "a_30", "b_10"]);

        assert_eq!(summary.status, "completed");
        assert_eq!(summary.tables_completed, 2);
        assert_eq!(summary.rows_transferred, 35);
        assert_eq!(summary.batches, 4);
        assert_eq!(summary.tables[0].table, "db1.dbo.a");
        assert_eq!(*sink.finished.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_parallel_workers_keep_batch_order_per_table() {
        let manifest = enriched(&["a", "b", "c"], 5);
        let source = source_with(&[("a", 12), ("b", 7), ("c", 0)]);
        let sink = Arc::new(RecordingSink::default());
        let config = ReplicationConfig {
            workers: 3,
            ..Default::default()
        };

        let summary = Replicator::new(config, source)
            .unwrap()
            .replicate(&manifest, sink.clone())
            .await
            .unwrap();

        let batches = sink.batches.lock().unwrap().clone();
        let a: Vec<&str> = batches
            .iter()
            .filter(|(t, _, _)| t == "a")
            .map(|(_, id, _)| id.as_str())
            .collect();
        assert_eq!(a, vec!["a_5", "a_10", "a_15"]);
        assert_eq!(summary.rows_transferred, 19);
        assert_eq!(summary.tables[2].batches, 0);
    }

    #[tokio::test]
    async fn test_failure_stops_later_tables() {
        let manifest = enriched(&["a", "b", "c"], 10);
        let source = source_with(&[("a", 5), ("b", 5), ("c", 5)]);
        let sink = Arc::new(RecordingSink {
            fail_table: Some("b".into()),
            ..Default::default()
        });

        let result = Replicator::new(ReplicationConfig::default(), source)
            .unwrap()
            .replicate(&manifest, sink.clone())
            .await;

        match result {
            Err(ReplicateError::Load { table, .. }) => assert_eq!(table, "b"),
            other => panic!("expected load error, got {:?}", other),
        }
        let loaded: Vec<String> = sink.batches.lock().unwrap().iter().map(|b| b.0.clone()).collect();
        assert_eq!(loaded, vec!["a"]);
    }

    #[tokio::test]
    async fn test_cancelled_run_loads_nothing() {
        let manifest = enriched(&["a"], 10);
        let source = source_with(&[("a", 5)]);
        let sink = Arc::new(RecordingSink::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = Replicator::new(ReplicationConfig::default(), source)
            .unwrap()
            .with_cancel(cancel)
            .replicate(&manifest, sink.clone())
            .await;

        assert!(matches!(result, Err(ReplicateError::Cancelled)));
        assert!(sink.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_setup_writes_ddl_and_rules() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        std::fs::write(
            &config_path,
            "databases:\n  - name: db1\n    schemas:\n      - name: dbo\n        tables:\n          - name: orders\n",
        )
        .unwrap();
        let source = Arc::new(MockPool(MockSource {
            pk_rows: vec![pk("db1", "dbo", "orders", "id")],
            col_rows: vec![
                col("db1", "dbo", "orders", "id", 1, "int", Some(0), Some(0)),
                col("db1", "dbo", "orders", "amt", 2, "decimal", Some(10), Some(2)),
            ],
            ..Default::default()
        }));

        let outcome = Replicator::new(config_in(dir.path()), source)
            .unwrap()
            .setup(&config_path)
            .await
            .unwrap();

        assert!(outcome.report.is_clean());
        let ddl = std::fs::read_to_string(&outcome.ddl_path).unwrap();
        assert_eq!(
            ddl,
            "create or replace table orders (\n    id number\n    , amt number(10, 2)\n    , constraint pk_orders primary key (id)\n);\n\n"
        );
        let rules = Manifest::from_rules_file(&outcome.rules_path).unwrap();
        assert_eq!(rules, outcome.manifest);
    }

    #[tokio::test]
    async fn test_setup_with_missing_table_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest::from_config_yaml(
            "databases:\n  - name: db1\n    schemas:\n      - name: dbo\n        tables:\n          - name: orders\n          - name: ghosts\n",
        )
        .unwrap();
        let source = Arc::new(MockPool(MockSource {
            col_rows: vec![col("db1", "dbo", "orders", "id", 1, "int", None, None)],
            ..Default::default()
        }));
        let config = config_in(dir.path());

        let result = Replicator::new(config.clone(), source)
            .unwrap()
            .setup_manifest(manifest)
            .await;

        match result {
            Err(ReplicateError::DdlPrecondition(table)) => assert_eq!(table, "db1.dbo.ghosts"),
            other => panic!("expected DdlPrecondition, got {:?}", other),
        }
        assert!(!config.ddl_path.exists());
        assert!(!config.rules_path.exists());
    }

    #[tokio::test]
    async fn test_load_and_write_files_from_rules() {
        let dir = tempfile::tempdir().unwrap();
        let rules_path = dir.path().join("table_rules.json");
        enriched(&["orders"], 4).write_rules(&rules_path).unwrap();
        let source = source_with(&[("orders", 6)]);
        let replicator = Replicator::new(ReplicationConfig::default(), source).unwrap();

        let sink = Arc::new(RecordingSink::default());
        let summary = replicator.load(&rules_path, sink.clone()).await.unwrap();
        assert_eq!(summary.rows_transferred, 6);

        let out = dir.path().join("temp");
        let summary = replicator.write_files(&rules_path, &out).await.unwrap();
        assert_eq!(summary.batches, 2);
        assert!(out.join("db1/dbo/orders_4.parquet.gzip").exists());
        assert!(out.join("db1/dbo/orders_8.parquet.gzip").exists());
    }

    #[tokio::test]
    async fn test_write_files_keeps_same_named_tables_apart() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = Manifest::from_config_yaml(
            "databases:\n  - name: db1\n    schemas:\n      - name: dbo\n        tables:\n          - name: orders\n  - name: db2\n    schemas:\n      - name: dbo\n        tables:\n          - name: orders\n",
        )
        .unwrap();
        for entry in manifest.tables_mut() {
            entry.table.columns = vec![Column::new("id", 1, "int", None, None)];
        }
        manifest.generate_ddl(true);
        let rules_path = dir.path().join("table_rules.json");
        manifest.write_rules(&rules_path).unwrap();

        let config = ReplicationConfig {
            workers: 2,
            ..Default::default()
        };
        let replicator = Replicator::new(config, source_with(&[("orders", 3)])).unwrap();
        let out = dir.path().join("temp");
        let summary = replicator.write_files(&rules_path, &out).await.unwrap();

        assert_eq!(summary.batches, 2);
        assert!(out.join("db1/dbo/orders_500000.parquet.gzip").exists());
        assert!(out.join("db2/dbo/orders_500000.parquet.gzip").exists());
    }

    #[tokio::test]
    async fn test_setup_then_load_with_dropped_column_gap() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest::from_config_yaml(
            "databases:\n  - name: db1\n    schemas:\n      - name: dbo\n        tables:\n          - name: orders\n",
        )
        .unwrap();
        let mut table_data = HashMap::new();
        table_data.insert(
            "orders".to_string(),
            vec![vec![SqlValue::I32(1), SqlValue::Text("first".into())]],
        );
        let source = Arc::new(MockPool(MockSource {
            col_rows: vec![
                col("db1", "dbo", "orders", "id", 1, "int", None, None),
                col("db1", "dbo", "orders", "note", 3, "varchar", None, None),
            ],
            table_data,
            ..Default::default()
        }));

        let replicator = Replicator::new(config_in(dir.path()), source).unwrap();
        let outcome = replicator.setup_manifest(manifest).await.unwrap();
        assert!(outcome.report.is_clean());

        let sink = Arc::new(RecordingSink::default());
        let summary = replicator.load(&outcome.rules_path, sink.clone()).await.unwrap();
        assert_eq!(summary.rows_transferred, 1);
    }

    #[tokio::test]
    async fn test_load_timeout() {
        struct SlowSink;
        struct SlowBatchSink;

        #[async_trait]
        impl ConnectSink for SlowSink {
            async fn connect(&self) -> Result<Box<dyn BatchSink>> {
                Ok(Box::new(SlowBatchSink))
            }
        }

        #[async_trait]
        impl BatchSink for SlowBatchSink {
            async fn write_batch(&mut self, _: TableRef<'_>, _: &ColumnarBatch) -> Result<LoadOutcome> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(LoadOutcome::default())
            }
            async fn finish(&mut self) -> Result<()> {
                Ok(())
            }
        }

        let config = ReplicationConfig {
            load_timeout: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        let result = Replicator::new(config, source_with(&[("a", 1)]))
            .unwrap()
            .replicate(&enriched(&["a"], 10), Arc::new(SlowSink))
            .await;
        assert!(matches!(result, Err(ReplicateError::Timeout { .. })));
    }
}
