//! Sink definition model, as read from the definition repository.
//!
//! Storage only consumes these values: a table sink's column mapping is
//! snapshotted into every new file, and an optional config patch overrides
//! the global level configuration for that sink.

use serde::{Deserialize, Serialize};

use crate::config::LevelConfigPatch;
use crate::keys::SinkKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkType {
    Table,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableType {
    Keboola,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Uuid,
    Datetime,
    Ip,
    Headers,
    Body,
    Path,
    Template,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub language: String,
    pub content: String,
}

/// One output column of a table mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    pub name: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub primary_key: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub raw_string: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateConfig>,
}

impl Column {
    pub fn new(column_type: ColumnType, name: impl Into<String>) -> Self {
        Self {
            column_type,
            name: name.into(),
            primary_key: false,
            path: None,
            default_value: None,
            raw_string: false,
            template: None,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMapping {
    pub columns: Vec<Column>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSink {
    #[serde(rename = "type")]
    pub table_type: TableType,
    pub table_id: String,
    pub mapping: TableMapping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sink {
    #[serde(flatten)]
    pub key: SinkKey,
    #[serde(rename = "type")]
    pub sink_type: SinkType,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<TableSink>,
    /// Sink-level overrides of the global storage level configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<LevelConfigPatch>,
}

impl Sink {
    /// A table sink writing `columns` into `table_id`.
    pub fn new_table(key: SinkKey, table_id: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            name: key.sink_id.to_string(),
            key,
            sink_type: SinkType::Table,
            description: String::new(),
            table: Some(TableSink {
                table_type: TableType::Keboola,
                table_id: table_id.into(),
                mapping: TableMapping { columns },
            }),
            config: None,
        }
    }

    pub fn is_table(&self) -> bool {
        self.sink_type == SinkType::Table && self.table.is_some()
    }

    pub fn columns(&self) -> &[Column] {
        self.table
            .as_ref()
            .map(|t| t.mapping.columns.as_slice())
            .unwrap_or(&[])
    }
}
