//! The replication manifest: which tables to copy and, once enriched, their
//! full column metadata and destination DDL.
//!
//! A manifest is loaded in one of two forms:
//!
//! - **config** (YAML): database, schema and table names only, with an
//!   optional per-table `row_split_size`.
//! - **rules** (JSON): the same tree with `cols`, `pk` and `sf_ddl` filled in
//!   by discovery. The setup flow writes this form and the load flow reads it.
//!
//! Identifiers are case-folded once on load so that matching against the
//! source catalog never depends on collation settings.

mod ddl;
mod types;

pub use ddl::create_table_ddl;
pub use types::*;

use crate::error::{ReplicateError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

/// Top-level manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub databases: Vec<Database>,
}

/// Shared view of one table together with its namespace.
#[derive(Debug, Clone, Copy)]
pub struct TableRef<'a> {
    pub database: &'a str,
    pub schema: &'a str,
    pub table: &'a Table,
}

impl TableRef<'_> {
    /// `database.schema.table`
    pub fn qualified_name(&self) -> String {
        format!("{}.{}.{}", self.database, self.schema, self.table.name)
    }
}

/// Mutable view of one table together with its namespace.
#[derive(Debug)]
pub struct TableRefMut<'a> {
    pub database: &'a str,
    pub schema: &'a str,
    pub table: &'a mut Table,
}

impl TableRefMut<'_> {
    /// Exact match on the (database, schema, table) triple.
    pub fn matches(&self, database: &str, schema: &str, table: &str) -> bool {
        self.database == database && self.schema == schema && self.table.name == table
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}.{}", self.database, self.schema, self.table.name)
    }
}

/// Case-fold an identifier for comparison.
pub fn fold_identifier(name: &str) -> String {
    name.trim().to_lowercase()
}

impl Manifest {
    /// Load a minimal manifest from a YAML configuration file.
    pub fn from_config_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_config_yaml(&content)
    }

    /// Parse a minimal manifest from a YAML configuration document.
    pub fn from_config_yaml(yaml: &str) -> Result<Self> {
        let mut manifest: Manifest = serde_yaml::from_str(yaml)?;
        manifest.normalize();
        manifest.validate()?;
        debug!("Loaded config manifest with {} tables", manifest.table_count());
        Ok(manifest)
    }

    /// Load an enriched manifest from a JSON rules file.
    pub fn from_rules_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_rules_json(&content)
    }

    /// Parse an enriched manifest from a JSON rules document.
    pub fn from_rules_json(json: &str) -> Result<Self> {
        let mut manifest: Manifest = serde_json::from_str(json)?;
        manifest.normalize();
        manifest.validate()?;
        manifest.validate_enriched()?;
        debug!("Loaded rules manifest with {} tables", manifest.table_count());
        Ok(manifest)
    }

    /// Serialize to the rules document format.
    pub fn to_rules_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the rules document.
    pub fn write_rules<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.to_rules_json()?;
        write_atomic(path.as_ref(), &content)
    }

    /// Render every table's DDL, blank-line separated, in manifest order.
    ///
    /// Fails without producing anything if any table has no DDL yet.
    pub fn render_ddl(&self) -> Result<String> {
        let mut out = String::new();
        for entry in self.tables() {
            if entry.table.destination_ddl.is_empty() {
                return Err(ReplicateError::DdlPrecondition(entry.qualified_name()));
            }
            out.push_str(&entry.table.destination_ddl);
            out.push_str("\n\n");
        }
        Ok(out)
    }

    /// Write the DDL artifact. Nothing is written if rendering fails.
    pub fn write_ddl<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.render_ddl()?;
        write_atomic(path.as_ref(), &content)
    }

    /// Generate DDL for every table that has columns.
    ///
    /// Tables without columns keep an empty DDL, which `render_ddl` rejects.
    pub fn generate_ddl(&mut self, use_pk: bool) {
        for entry in self.tables_mut() {
            entry.table.destination_ddl = if entry.table.columns.is_empty() {
                String::new()
            } else {
                create_table_ddl(entry.table, use_pk)
            };
        }
    }

    /// Iterate all tables in manifest order.
    pub fn tables(&self) -> impl Iterator<Item = TableRef<'_>> {
        self.databases.iter().flat_map(|db| {
            db.schemas.iter().flat_map(move |sch| {
                sch.tables.iter().map(move |table| TableRef {
                    database: &db.name,
                    schema: &sch.name,
                    table,
                })
            })
        })
    }

    /// Iterate all tables mutably in manifest order.
    pub fn tables_mut(&mut self) -> impl Iterator<Item = TableRefMut<'_>> {
        self.databases.iter_mut().flat_map(|db| {
            let Database { name, schemas } = db;
            let database: &str = name;
            schemas.iter_mut().flat_map(move |sch| {
                let Schema { name, tables } = sch;
                let schema: &str = name;
                tables.iter_mut().map(move |table| TableRefMut {
                    database,
                    schema,
                    table,
                })
            })
        })
    }

    /// Find a table by its identity triple (compared case-folded).
    pub fn find_table(&self, database: &str, schema: &str, table: &str) -> Option<&Table> {
        let (database, schema, table) = (
            fold_identifier(database),
            fold_identifier(schema),
            fold_identifier(table),
        );
        self.tables()
            .find(|t| t.database == database && t.schema == schema && t.table.name == table)
            .map(|t| t.table)
    }

    /// Number of tables in the manifest.
    pub fn table_count(&self) -> usize {
        self.tables().count()
    }

    /// Database names in manifest order.
    pub fn database_names(&self) -> Vec<&str> {
        self.databases.iter().map(|db| db.name.as_str()).collect()
    }

    /// Case-fold every identifier in the tree.
    pub fn normalize(&mut self) {
        for db in &mut self.databases {
            db.name = fold_identifier(&db.name);
            for sch in &mut db.schemas {
                sch.name = fold_identifier(&sch.name);
                for table in &mut sch.tables {
                    table.name = fold_identifier(&table.name);
                    for col in &mut table.columns {
                        col.name = fold_identifier(&col.name);
                        col.data_type = fold_identifier(&col.data_type);
                    }
                    for key in &mut table.primary_key {
                        *key = fold_identifier(key);
                    }
                }
            }
        }
    }

    /// Structural checks shared by both document forms.
    pub fn validate(&self) -> Result<()> {
        if self.databases.is_empty() {
            return Err(ReplicateError::Config("manifest lists no databases".into()));
        }

        let mut seen = HashSet::new();
        for db in &self.databases {
            if db.name.is_empty() {
                return Err(ReplicateError::Config("database name must not be empty".into()));
            }
            for sch in &db.schemas {
                if sch.name.is_empty() {
                    return Err(ReplicateError::Config(format!(
                        "schema name must not be empty in database {}",
                        db.name
                    )));
                }
                for table in &sch.tables {
                    let qualified = format!("{}.{}.{}", db.name, sch.name, table.name);
                    if table.name.is_empty() {
                        return Err(ReplicateError::Config(format!(
                            "table name must not be empty in {}.{}",
                            db.name, sch.name
                        )));
                    }
                    if table.row_split_size == 0 {
                        return Err(ReplicateError::Config(format!(
                            "row_split_size must be at least 1 for {}",
                            qualified
                        )));
                    }
                    if !seen.insert(qualified.clone()) {
                        return Err(ReplicateError::Config(format!(
                            "table {} is listed more than once",
                            qualified
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Checks that only hold for an enriched (rules) manifest.
    pub fn validate_enriched(&self) -> Result<()> {
        for entry in self.tables() {
            let table = entry.table;
            if table.columns.is_empty() {
                return Err(ReplicateError::Config(format!(
                    "table {} has no columns; rerun setup",
                    entry.qualified_name()
                )));
            }
            if !table.has_ascending_ordinals() {
                return Err(ReplicateError::Config(format!(
                    "table {} has out-of-order column ordinals",
                    entry.qualified_name()
                )));
            }
            if table.destination_ddl.is_empty() {
                return Err(ReplicateError::DdlPrecondition(entry.qualified_name()));
            }
        }
        Ok(())
    }
}

/// Write to a sibling temp file, then rename into place.
fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    std::fs::write(&temp_path, content)?;
    std::fs::rename(&temp_path, path)?;
    Ok(())
}
