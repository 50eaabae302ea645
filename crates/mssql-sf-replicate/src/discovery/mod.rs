//! Schema discovery: enrich a manifest with column and primary key metadata
//! read from the source catalog.
//!
//! Two catalog queries are issued, each a `union all` over every database in
//! the manifest:
//!
//! - primary keys: one row per table with its key columns comma-joined in key
//!   order,
//! - columns: one row per column ordered by catalog, schema, table and
//!   ordinal position.
//!
//! Every identifier is lowercased by the query itself so matching against the
//! (also case-folded) manifest does not depend on server collation. Column
//! rows are appended in arrival order, which the `order by` makes equal to
//! ordinal order.

use crate::error::{ReplicateError, Result};
use crate::extract::quote_ident;
use crate::manifest::{fold_identifier, Column, Manifest};
use crate::source::SourceConnection;
use tracing::{debug, info, warn};

/// Header line of the mismatch diagnostic.
pub const MISMATCH_HEADER: &str = "Check your config or SQL Server permissions";

/// Outcome of a discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Qualified names of tables with no columns in the catalog.
    pub missing_tables: Vec<String>,
    /// Qualified names of tables whose columns did not arrive in ascending ordinal order.
    pub out_of_order_tables: Vec<String>,
    /// Tables that received columns.
    pub tables_found: usize,
}

impl DiscoveryReport {
    /// True when every manifest table was found.
    pub fn is_clean(&self) -> bool {
        self.missing_tables.is_empty() && self.out_of_order_tables.is_empty()
    }

    /// One diagnostic covering every missing table, or `None` if none.
    pub fn message(&self) -> Option<String> {
        if self.missing_tables.is_empty() {
            return None;
        }
        let mut msg = format!("\n{}\n", MISMATCH_HEADER);
        for name in &self.missing_tables {
            msg.push_str(&format!("\nTable not found, or no permission: {}", name));
        }
        Some(msg)
    }
}

/// Build the primary key catalog query for every manifest database.
pub fn primary_key_sql(manifest: &Manifest) -> String {
    let parts = manifest
        .database_names()
        .into_iter()
        .map(|db| {
            let db = quote_ident(db);
            format!(
                "
    select
        lower(constr.constraint_catalog) collate sql_latin1_general_cp1_ci_as as table_catalog
        , lower(constr.constraint_schema) collate sql_latin1_general_cp1_ci_as as table_schema
        , lower(kcu.table_name) collate sql_latin1_general_cp1_ci_as as table_name
        , lower(kcu.column_name) collate sql_latin1_general_cp1_ci_as as column_name
        , kcu.ordinal_position
    from {db}.[information_schema].[table_constraints] as constr
    join {db}.[information_schema].[key_column_usage] as kcu
        on constr.constraint_name = kcu.constraint_name
        and constr.constraint_schema = kcu.constraint_schema
        and constr.table_name = kcu.table_name
    where constr.constraint_type = 'primary key'",
                db = db
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n    union all\n");

    format!(
        ";with pks as ({parts}
)
select
    table_catalog
    , table_schema
    , table_name
    , stuff(
        (select
            ',' + pk1.column_name
        from pks as pk1
        where pk1.table_catalog = pk2.table_catalog
            and pk1.table_schema = pk2.table_schema
            and pk1.table_name = pk2.table_name
        order by pk1.ordinal_position
        for xml path(''), type
        ).value('.', 'varchar(max)'), 1, 1, ''
    ) as primary_key_columns
from pks as pk2
group by
    pk2.table_catalog
    , pk2.table_schema
    , pk2.table_name
",
        parts = parts
    )
}

/// Build the column catalog query for every manifest database.
pub fn columns_sql(manifest: &Manifest) -> String {
    let parts = manifest
        .database_names()
        .into_iter()
        .map(|db| {
            format!(
                "
    select
        lower(table_catalog) collate sql_latin1_general_cp1_ci_as as table_catalog
        , lower(table_schema) collate sql_latin1_general_cp1_ci_as as table_schema
        , lower(table_name) collate sql_latin1_general_cp1_ci_as as table_name
        , lower(column_name) collate sql_latin1_general_cp1_ci_as as column_name
        , cast(ordinal_position as int) as ordinal_position
        , lower(data_type) collate sql_latin1_general_cp1_ci_as as data_type
        , cast(numeric_precision as int) as numeric_precision
        , cast(numeric_scale as int) as numeric_scale
    from {}.[information_schema].[columns]",
                quote_ident(db)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n    union all\n");

    format!(
        ";with cols as ({}
)
select
    table_catalog
    , table_schema
    , table_name
    , column_name
    , ordinal_position
    , data_type
    , numeric_precision
    , numeric_scale
from cols
order by table_catalog, table_schema, table_name, ordinal_position
",
        parts
    )
}

/// Enrich `manifest` in place from the source catalog, then generate DDL for
/// every table that received columns.
///
/// Existing columns and keys are replaced. Missing tables do not fail the
/// pass; they are listed in the returned report and logged.
pub async fn discover(
    manifest: &mut Manifest,
    conn: &mut dyn SourceConnection,
    use_pk: bool,
) -> Result<DiscoveryReport> {
    for entry in manifest.tables_mut() {
        entry.table.columns.clear();
        entry.table.primary_key.clear();
    }

    let pk_sql = primary_key_sql(manifest);
    let pk_rows = conn
        .primary_key_rows(&pk_sql)
        .await
        .map_err(|e| ReplicateError::Discovery(format!("primary key query failed: {}", e)))?;
    debug!("Primary key query returned {} rows", pk_rows.len());

    for row in &pk_rows {
        let (db, sch, tbl) = (
            fold_identifier(&row.table_catalog),
            fold_identifier(&row.table_schema),
            fold_identifier(&row.table_name),
        );
        if let Some(entry) = manifest
            .tables_mut()
            .find(|t| t.matches(&db, &sch, &tbl))
        {
            // one aggregated row per table; keep the first
            if entry.table.primary_key.is_empty() {
                entry.table.primary_key = row
                    .primary_key_columns
                    .split(',')
                    .map(fold_identifier)
                    .filter(|c| !c.is_empty())
                    .collect();
            }
        }
    }

    let cols_sql = columns_sql(manifest);
    let col_rows = conn
        .column_rows(&cols_sql)
        .await
        .map_err(|e| ReplicateError::Discovery(format!("column query failed: {}", e)))?;
    debug!("Column query returned {} rows", col_rows.len());

    for row in col_rows {
        let (db, sch, tbl) = (
            fold_identifier(&row.table_catalog),
            fold_identifier(&row.table_schema),
            fold_identifier(&row.table_name),
        );
        if let Some(entry) = manifest
            .tables_mut()
            .find(|t| t.matches(&db, &sch, &tbl))
        {
            entry.table.columns.push(Column::new(
                fold_identifier(&row.column_name),
                row.ordinal_position,
                fold_identifier(&row.data_type),
                row.numeric_precision,
                row.numeric_scale,
            ));
        }
    }

    let mut report = DiscoveryReport::default();
    for entry in manifest.tables() {
        if entry.table.columns.is_empty() {
            report.missing_tables.push(entry.qualified_name());
        } else {
            report.tables_found += 1;
            if !entry.table.has_ascending_ordinals() {
                report.out_of_order_tables.push(entry.qualified_name());
            }
        }
    }

    if let Some(msg) = report.message() {
        warn!("{}", msg);
    }
    for name in &report.out_of_order_tables {
        warn!("Columns of {} did not arrive in ordinal order", name);
    }

    manifest.generate_ddl(use_pk);

    info!(
        "Discovered {} of {} tables",
        report.tables_found,
        manifest.table_count()
    );
    Ok(report)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::source::{ColumnRow, PrimaryKeyRow, RowStream, SqlRow};
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::collections::HashMap;

    /// In-memory catalog and table data.
    #[derive(Default, Clone)]
    pub(crate) struct MockSource {
        pub pk_rows: Vec<PrimaryKeyRow>,
        pub col_rows: Vec<ColumnRow>,
        pub data: Vec<SqlRow>,
        /// Rows served to selects on a specific table name.
        pub table_data: HashMap<String, Vec<SqlRow>>,
        pub queries: Vec<String>,
        /// Fail catalog queries with this message.
        pub catalog_error: Option<String>,
    }

    pub(crate) fn pk(db: &str, sch: &str, tbl: &str, cols: &str) -> PrimaryKeyRow {
        PrimaryKeyRow {
            table_catalog: db.into(),
            table_schema: sch.into(),
            table_name: tbl.into(),
            primary_key_columns: cols.into(),
        }
    }

    pub(crate) fn col(
        db: &str,
        sch: &str,
        tbl: &str,
        name: &str,
        ordinal: i32,
        data_type: &str,
        precision: Option<i32>,
        scale: Option<i32>,
    ) -> ColumnRow {
        ColumnRow {
            table_catalog: db.into(),
            table_schema: sch.into(),
            table_name: tbl.into(),
            column_name: name.into(),
            ordinal_position: ordinal,
            data_type: data_type.into(),
            numeric_precision: precision,
            numeric_scale: scale,
        }
    }

    #[async_trait]
    impl SourceConnection for MockSource {
        async fn primary_key_rows(&mut self, sql: &str) -> Result<Vec<PrimaryKeyRow>> {
            self.queries.push(sql.to_string());
            if let Some(message) = &self.catalog_error {
                return Err(ReplicateError::pool(message, "catalog query"));
            }
            Ok(self.pk_rows.clone())
        }

        async fn column_rows(&mut self, sql: &str) -> Result<Vec<ColumnRow>> {
            self.queries.push(sql.to_string());
            if let Some(message) = &self.catalog_error {
                return Err(ReplicateError::pool(message, "catalog query"));
            }
            Ok(self.col_rows.clone())
        }

        async fn stream_rows<'a>(
            &'a mut self,
            sql: &str,
            _column_types: &[String],
        ) -> Result<RowStream<'a>> {
            self.queries.push(sql.to_string());
            let rows = self
                .table_data
                .iter()
                .find(|(name, _)| sql.ends_with(&format!(".[{}]", name)))
                .map(|(_, rows)| rows.clone())
                .unwrap_or_else(|| self.data.clone());
            Ok(futures::stream::iter(rows.into_iter().map(Ok)).boxed())
        }
    }

    fn orders_manifest() -> Manifest {
        Manifest::from_config_yaml(
            "databases:\n  - name: db1\n    schemas:\n      - name: dbo\n        tables:\n          - name: orders\n",
        )
        .unwrap()
    }

    fn orders_source() -> MockSource {
        MockSource {
            pk_rows: vec![pk("db1", "dbo", "orders", "id")],
            col_rows: vec![
                col("db1", "dbo", "orders", "id", 1, "int", Some(0), Some(0)),
                col("db1", "dbo", "orders", "amt", 2, "decimal", Some(10), Some(2)),
            ],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_discover_orders() {
        let mut manifest = orders_manifest();
        let mut source = orders_source();

        let report = discover(&mut manifest, &mut source, true).await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.tables_found, 1);

        let table = manifest.find_table("db1", "dbo", "orders").unwrap();
        let names: Vec<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "amt"]);
        assert_eq!(table.primary_key, vec!["id"]);
        assert_eq!(
            table.destination_ddl,
            "create or replace table orders (\n    id number\n    , amt number(10, 2)\n    , constraint pk_orders primary key (id)\n);"
        );
        assert_eq!(source.queries.len(), 2);
    }

    #[tokio::test]
    async fn test_discover_matches_case_insensitively() {
        let mut manifest = orders_manifest();
        let mut source = MockSource {
            pk_rows: vec![pk("DB1", "DBO", "Orders", "ID")],
            col_rows: vec![col("DB1", "dbo", "ORDERS", "ID", 1, "INT", None, None)],
            ..Default::default()
        };

        discover(&mut manifest, &mut source, true).await.unwrap();
        let table = manifest.find_table("db1", "dbo", "orders").unwrap();
        assert_eq!(table.columns[0].name, "id");
        assert_eq!(table.columns[0].data_type, "int");
        assert_eq!(table.primary_key, vec!["id"]);
    }

    #[tokio::test]
    async fn test_discover_reports_every_missing_table() {
        let mut manifest = Manifest::from_config_yaml(
            "databases:\n  - name: db1\n    schemas:\n      - name: dbo\n        tables:\n          - name: orders\n          - name: ghosts\n          - name: secrets\n",
        )
        .unwrap();
        let mut source = orders_source();

        let report = discover(&mut manifest, &mut source, true).await.unwrap();
        assert_eq!(
            report.missing_tables,
            vec!["db1.dbo.ghosts", "db1.dbo.secrets"]
        );
        let msg = report.message().unwrap();
        assert!(msg.contains(MISMATCH_HEADER));
        assert!(msg.contains("Table not found, or no permission: db1.dbo.ghosts"));
        assert!(msg.contains("Table not found, or no permission: db1.dbo.secrets"));

        // found table is still enriched, missing ones block DDL output
        assert!(!manifest.find_table("db1", "dbo", "orders").unwrap().destination_ddl.is_empty());
        assert!(manifest.render_ddl().is_err());
    }

    #[tokio::test]
    async fn test_discover_keeps_first_pk_row() {
        let mut manifest = orders_manifest();
        let mut source = orders_source();
        source.pk_rows = vec![
            pk("db1", "dbo", "orders", "id,amt"),
            pk("db1", "dbo", "orders", "other"),
        ];

        discover(&mut manifest, &mut source, false).await.unwrap();
        let table = manifest.find_table("db1", "dbo", "orders").unwrap();
        assert_eq!(table.primary_key, vec!["id", "amt"]);
        assert!(!table.destination_ddl.contains("constraint"));
    }

    #[tokio::test]
    async fn test_discover_ordinals_follow_arrival_order() {
        let mut manifest = orders_manifest();
        let mut source = MockSource {
            col_rows: (1..=5)
                .map(|i| col("db1", "dbo", "orders", &format!("c{}", i), i, "int", None, None))
                .collect(),
            ..Default::default()
        };

        let report = discover(&mut manifest, &mut source, true).await.unwrap();
        assert!(report.is_clean());
        let table = manifest.find_table("db1", "dbo", "orders").unwrap();
        for (i, c) in table.columns.iter().enumerate() {
            assert_eq!(c.ordinal_position, i as i32 + 1);
        }
        assert!(!table.has_pk());
    }

    #[tokio::test]
    async fn test_discover_flags_out_of_order_columns() {
        let mut manifest = orders_manifest();
        let mut source = MockSource {
            col_rows: vec![
                col("db1", "dbo", "orders", "b", 2, "int", None, None),
                col("db1", "dbo", "orders", "a", 1, "int", None, None),
            ],
            ..Default::default()
        };

        let report = discover(&mut manifest, &mut source, true).await.unwrap();
        assert_eq!(report.out_of_order_tables, vec!["db1.dbo.orders"]);
    }

    #[tokio::test]
    async fn test_discover_accepts_ordinal_gaps() {
        let mut manifest = orders_manifest();
        let mut source = MockSource {
            col_rows: vec![
                col("db1", "dbo", "orders", "id", 1, "int", None, None),
                col("db1", "dbo", "orders", "amt", 2, "decimal", Some(10), Some(2)),
                col("db1", "dbo", "orders", "note", 4, "varchar", None, None),
            ],
            ..Default::default()
        };

        let report = discover(&mut manifest, &mut source, true).await.unwrap();
        assert!(report.is_clean());
        let table = manifest.find_table("db1", "dbo", "orders").unwrap();
        assert_eq!(table.columns[2].ordinal_position, 4);
        assert!(manifest.validate_enriched().is_ok());
    }

    #[tokio::test]
    async fn test_catalog_failure_is_a_discovery_error() {
        let mut manifest = orders_manifest();
        let mut source = MockSource {
            catalog_error: Some("connection reset".into()),
            ..Default::default()
        };

        match discover(&mut manifest, &mut source, true).await {
            Err(e @ ReplicateError::Discovery(_)) => {
                assert!(e.to_string().contains("primary key query failed"));
                assert!(e.to_string().contains("connection reset"));
                assert_eq!(e.exit_code(), 2);
            }
            other => panic!("expected discovery error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rediscovery_replaces_columns() {
        let mut manifest = orders_manifest();
        discover(&mut manifest, &mut orders_source(), true).await.unwrap();
        discover(&mut manifest, &mut orders_source(), true).await.unwrap();
        assert_eq!(manifest.find_table("db1", "dbo", "orders").unwrap().columns.len(), 2);
    }

    #[tokio::test]
    async fn test_enriched_manifest_round_trips_through_rules() {
        let mut manifest = orders_manifest();
        discover(&mut manifest, &mut orders_source(), true).await.unwrap();

        let reloaded = Manifest::from_rules_json(&manifest.to_rules_json().unwrap()).unwrap();
        assert_eq!(reloaded, manifest);
    }

    #[test]
    fn test_catalog_queries_union_every_database() {
        let manifest = Manifest::from_config_yaml(
            "databases:\n  - name: db1\n    schemas: []\n  - name: db2\n    schemas: []\n",
        )
        .unwrap();

        let pk_sql = primary_key_sql(&manifest);
        assert!(pk_sql.contains("from [db1].[information_schema].[table_constraints]"));
        assert!(pk_sql.contains("from [db2].[information_schema].[table_constraints]"));
        assert_eq!(pk_sql.matches("union all").count(), 1);
        assert!(pk_sql.contains("for xml path('')"));

        let cols_sql = columns_sql(&manifest);
        assert!(cols_sql.contains("from [db1].[information_schema].[columns]"));
        assert!(cols_sql.contains("from [db2].[information_schema].[columns]"));
        assert!(cols_sql
            .contains("order by table_catalog, table_schema, table_name, ordinal_position"));
    }
}
