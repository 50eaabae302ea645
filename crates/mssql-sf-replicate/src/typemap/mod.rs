//! Type mapping between MSSQL and Snowflake.

use crate::manifest::Column;

/// Catch-all destination type for anything without a direct equivalent.
pub const FALLBACK_TYPE: &str = "variant";

/// Source types with a fixed entry in the mapping table.
pub const KNOWN_TYPES: &[&str] = &[
    "varchar",
    "char",
    "nvarchar",
    "nchar",
    "ntext",
    "text",
    "uniqueidentifier",
    "bigint",
    "int",
    "smallint",
    "tinyint",
    "float",
    "real",
    "numeric",
    "decimal",
    "money",
    "smallmoney",
    "bit",
    "datetime",
    "datetime2",
    "smalldatetime",
    "time",
    "date",
    "varbinary",
    "binary",
    "rowversion",
    "image",
];

/// Map a column's MSSQL type to its Snowflake type. Never fails.
pub fn mssql_to_snowflake(col: &Column) -> String {
    map_type(
        &col.data_type,
        col.numeric_precision.unwrap_or(0),
        col.numeric_scale.unwrap_or(0),
    )
}

/// Map an MSSQL data type name to Snowflake.
pub fn map_type(data_type: &str, precision: i32, scale: i32) -> String {
    let data_type = data_type.to_lowercase();
    match data_type.as_str() {
        // String and identifier types
        "varchar" | "char" | "nvarchar" | "nchar" | "ntext" | "text" | "uniqueidentifier" => {
            "varchar".to_string()
        }

        // Integer types
        "bigint" | "int" | "smallint" | "tinyint" => "number".to_string(),

        // Floating point
        "float" => data_type,
        "real" => "float".to_string(),

        // Fixed point
        "numeric" | "decimal" | "money" | "smallmoney" => {
            format!("number({}, {})", precision, scale)
        }

        // Boolean
        "bit" => "boolean".to_string(),

        // Date/time types
        "datetime" | "datetime2" | "smalldatetime" => "timestamp".to_string(),
        "time" | "date" => data_type,

        // Binary types. Only varbinary has a native mapping; the rest land as
        // variant because the columnar load path cannot carry them as binary.
        "varbinary" => "binary".to_string(),
        "binary" | "rowversion" | "image" => FALLBACK_TYPE.to_string(),

        _ => FALLBACK_TYPE.to_string(),
    }
}
