//! Database / Schema / Table / Column tree.

use serde::{Deserialize, Serialize};

/// Default rows per extraction batch.
pub const DEFAULT_ROW_SPLIT_SIZE: usize = 500_000;

/// Column metadata discovered from the source catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Source column name.
    pub name: String,

    /// Ordinal position (1-based).
    pub ordinal_position: i32,

    /// Source data type, lowercased (e.g. "int", "nvarchar", "datetime2").
    pub data_type: String,

    /// Numeric precision; only meaningful for fixed-point types.
    #[serde(default)]
    pub numeric_precision: Option<i32>,

    /// Numeric scale; only meaningful for fixed-point types.
    #[serde(default)]
    pub numeric_scale: Option<i32>,
}

impl Column {
    pub fn new(
        name: impl Into<String>,
        ordinal_position: i32,
        data_type: impl Into<String>,
        numeric_precision: Option<i32>,
        numeric_scale: Option<i32>,
    ) -> Self {
        Self {
            name: name.into(),
            ordinal_position,
            data_type: data_type.into(),
            numeric_precision,
            numeric_scale,
        }
    }

    /// Destination-safe identifier: spaces replaced with underscores.
    pub fn clean_name(&self) -> String {
        self.name.replace(' ', "_")
    }

    /// Uppercased clean name, used as the columnar field label.
    pub fn destination_name(&self) -> String {
        self.clean_name().to_uppercase()
    }
}

/// A replicated table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    /// Table name.
    pub name: String,

    /// Columns in source ordinal order.
    #[serde(default, rename = "cols")]
    pub columns: Vec<Column>,

    /// Primary key column names in key order.
    #[serde(default, rename = "pk")]
    pub primary_key: Vec<String>,

    /// Rows per extraction batch.
    #[serde(default = "default_row_split_size")]
    pub row_split_size: usize,

    /// Generated `create or replace table` statement; empty until generated.
    #[serde(default, rename = "sf_ddl")]
    pub destination_ddl: String,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            row_split_size: DEFAULT_ROW_SPLIT_SIZE,
            destination_ddl: String::new(),
        }
    }

    /// Check if the table has a primary key.
    pub fn has_pk(&self) -> bool {
        !self.primary_key.is_empty()
    }

    /// Unquoted destination identifier. Snowflake folds it to
    /// [`Table::destination_name`].
    pub fn clean_name(&self) -> String {
        self.name.replace(' ', "_")
    }

    /// Name of the table at the destination.
    pub fn destination_name(&self) -> String {
        self.clean_name().to_uppercase()
    }

    /// Source data types in column order.
    pub fn column_types(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.data_type.clone()).collect()
    }

    /// Destination column labels in column order.
    pub fn destination_column_names(&self) -> Vec<String> {
        self.columns.iter().map(Column::destination_name).collect()
    }

    /// True when stored ordinals strictly increase. Gaps left by dropped
    /// source columns are allowed.
    pub fn has_ascending_ordinals(&self) -> bool {
        self.columns
            .windows(2)
            .all(|pair| pair[0].ordinal_position < pair[1].ordinal_position)
            && self.columns.first().map_or(true, |c| c.ordinal_position >= 1)
    }
}

/// A schema within a database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    pub tables: Vec<Table>,
}

/// A source database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Database {
    pub name: String,
    pub schemas: Vec<Schema>,
}

fn default_row_split_size() -> usize {
    DEFAULT_ROW_SPLIT_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_names() {
        let col = Column::new("order date", 3, "datetime", None, None);
        assert_eq!(col.clean_name(), "order_date");
        assert_eq!(col.destination_name(), "ORDER_DATE");
    }

    #[test]
    fn test_table_defaults() {
        let table = Table::new("orders");
        assert_eq!(table.row_split_size, 500_000);
        assert!(table.destination_ddl.is_empty());
        assert!(!table.has_pk());
        assert_eq!(table.destination_name(), "ORDERS");
    }

    #[test]
    fn test_ascending_ordinals() {
        let mut table = Table::new("orders");
        table.columns = vec![
            Column::new("id", 1, "int", Some(10), Some(0)),
            Column::new("amt", 2, "decimal", Some(10), Some(2)),
        ];
        assert!(table.has_ascending_ordinals());

        // a dropped column leaves a gap
        table.columns[1].ordinal_position = 3;
        assert!(table.has_ascending_ordinals());

        table.columns[1].ordinal_position = 1;
        assert!(!table.has_ascending_ordinals());

        table.columns[0].ordinal_position = 4;
        assert!(!table.has_ascending_ordinals());
    }

    #[test]
    fn test_minimal_table_deserializes_with_defaults() {
        let table: Table = serde_json::from_str(r#"{"name": "orders"}"#).unwrap();
        assert_eq!(table, Table::new("orders"));
    }
}
