//! Table schemas as declared by plugins.

use serde::{Deserialize, Serialize};

use crate::value::ColumnType;
use crate::{PlugError, Result};

/// Metadata a plugin reports about itself, fixed for the life of the
/// subprocess. The protocol version and cookie pair exist only to reject an
/// incompatible counterpart at connect time, never to negotiate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub protocol_version: u32,
    pub cookie_key: String,
    pub cookie_value: String,
    /// Table indices this plugin serves.
    pub tables: Vec<usize>,
}

/// One column of a table schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
    /// Parameter columns are hidden from `SELECT *` and can be passed as
    /// table arguments; the plugin does not return them in rows.
    #[serde(default)]
    pub is_parameter: bool,
    /// A required column must appear as an equality constraint in every
    /// query, otherwise the statement fails to plan.
    #[serde(default)]
    pub is_required: bool,
    #[serde(default)]
    pub description: String,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            is_parameter: false,
            is_required: false,
            description: String::new(),
        }
    }

    pub fn parameter(mut self) -> Self {
        self.is_parameter = true;
        self
    }

    pub fn required(mut self) -> Self {
        self.is_required = true;
        self
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = text.into();
        self
    }
}

/// Schema and capabilities of one table, returned once by `Initialize` and
/// immutable for the life of the table connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub columns: Vec<ColumnSpec>,

    /// Index of the column whose value is unique for each row. `None` means
    /// the engine assigns rowids itself, and the table cannot be written.
    pub primary_key: Option<usize>,

    /// Capability record, decided once at schema negotiation. The host never
    /// issues a write call for a capability that is not set here.
    #[serde(default)]
    pub handles_insert: bool,
    #[serde(default)]
    pub handles_update: bool,
    #[serde(default)]
    pub handles_delete: bool,

    /// Whether the plugin honors LIMIT/OFFSET itself. When false the host
    /// keeps the offset and skips rows locally.
    #[serde(default)]
    pub handles_offset: bool,

    /// Write-buffer thresholds; 0 means every row is forwarded immediately.
    #[serde(default)]
    pub buffer_insert: u32,
    #[serde(default)]
    pub buffer_update: u32,
    #[serde(default)]
    pub buffer_delete: u32,
}

impl TableDescriptor {
    pub fn new(columns: Vec<ColumnSpec>) -> Self {
        Self {
            columns,
            primary_key: None,
            handles_insert: false,
            handles_update: false,
            handles_delete: false,
            handles_offset: false,
            buffer_insert: 0,
            buffer_update: 0,
            buffer_delete: 0,
        }
    }

    pub fn supports_writes(&self) -> bool {
        self.handles_insert || self.handles_update || self.handles_delete
    }

    /// Check the descriptor for shapes the bridge cannot serve.
    pub fn validate(&self) -> Result<()> {
        if self.columns.is_empty() {
            return Err(PlugError::Config("table schema has no columns".into()));
        }
        if let Some(pk) = self.primary_key {
            let spec = self.columns.get(pk).ok_or_else(|| {
                PlugError::Config(format!(
                    "primary key column {pk} is out of range ({} columns)",
                    self.columns.len()
                ))
            })?;
            if !matches!(spec.column_type, ColumnType::Int | ColumnType::String) {
                return Err(PlugError::Config(format!(
                    "primary key column '{}' must be an int or string column",
                    spec.name
                )));
            }
        } else if self.supports_writes() {
            return Err(PlugError::Config(
                "a table without a primary key cannot declare write capabilities".into(),
            ));
        }
        Ok(())
    }

    /// Build the `CREATE TABLE` declaration the host engine needs to
    /// register the virtual table. The table name is a placeholder; the
    /// engine substitutes its own.
    pub fn create_table_sql(&self) -> String {
        let mut sql = String::from("CREATE TABLE x(");
        for (i, col) in self.columns.iter().enumerate() {
            if i > 0 {
                sql.push_str(", ");
            }
            // Double any quote inside the column name to keep it escaped.
            sql.push('"');
            sql.push_str(&col.name.replace('"', "\"\""));
            sql.push('"');
            sql.push(' ');
            sql.push_str(col.column_type.sql_name());
            if col.is_parameter {
                sql.push_str(" HIDDEN");
            }
            if self.primary_key == Some(i) {
                sql.push_str(" PRIMARY KEY");
            }
        }
        sql.push(')');
        if self.primary_key.is_some() {
            sql.push_str(" WITHOUT ROWID");
        }
        sql.push(';');
        sql
    }
}
