//! Destination DDL generation.

use super::Table;
use crate::typemap::mssql_to_snowflake;

/// Build the `create or replace table` statement for a table.
///
/// The primary key constraint is appended only when `use_pk` is set and the
/// table has a key. Identifiers are unquoted clean names so the created table
/// resolves to the name batches are loaded into.
pub fn create_table_ddl(table: &Table, use_pk: bool) -> String {
    let name = table.clean_name();
    let columns = table
        .columns
        .iter()
        .map(|col| format!("{} {}\n", col.clean_name(), mssql_to_snowflake(col)))
        .collect::<Vec<_>>()
        .join("    , ");

    let pk = if use_pk && table.has_pk() {
        format!(
            "    , constraint pk_{} primary key ({})\n",
            name,
            table
                .primary_key
                .iter()
                .map(|k| k.replace(' ', "_"))
                .collect::<Vec<_>>()
                .join(", ")
        )
    } else {
        String::new()
    };

    format!("create or replace table {} (\n    {}{});", name, columns, pk)
}
