//! Read-only view of the table catalog needed by the TTL processor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::keys::{ColumnType, Direction, IndexId, TableId};

/// One column of the primary index key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyColumn {
    pub name: String,
    pub column_type: ColumnType,
    #[serde(default)]
    pub direction: Direction,
}

impl KeyColumn {
    pub fn new(name: impl Into<String>, column_type: ColumnType, direction: Direction) -> Self {
        Self {
            name: name.into(),
            column_type,
            direction,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub id: IndexId,
    pub key_columns: Vec<KeyColumn>,
}

impl IndexDescriptor {
    pub fn column_types(&self) -> Vec<ColumnType> {
        self.key_columns.iter().map(|c| c.column_type).collect()
    }

    pub fn column_directions(&self) -> Vec<Direction> {
        self.key_columns.iter().map(|c| c.direction).collect()
    }

    /// Key column names, quoted for use in SQL text.
    pub fn quoted_column_names(&self) -> Vec<String> {
        self.key_columns.iter().map(|c| quote_ident(&c.name)).collect()
    }
}

/// Row-level TTL settings stored on the table.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RowLevelTtl {
    /// Label TTL metrics with the table's relation name.
    #[serde(default)]
    pub label_metrics: bool,
    /// Expression computing a row's expiration; the hidden expiration column when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_expr: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub id: TableId,
    pub database: String,
    pub schema: String,
    pub name: String,
    /// Bumped by every schema change.
    pub version: u64,
    pub modified_at: DateTime<Utc>,
    pub primary_index: IndexDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_level_ttl: Option<RowLevelTtl>,
}

impl TableDescriptor {
    /// Fully-qualified, quoted relation name, e.g. `defaultdb.public."Events"`.
    pub fn relation_name(&self) -> String {
        format!(
            "{}.{}.{}",
            quote_ident(&self.database),
            quote_ident(&self.schema),
            quote_ident(&self.name)
        )
    }

    pub fn has_row_level_ttl(&self) -> bool {
        self.row_level_ttl.is_some()
    }
}

/// Quote an identifier unless it is a plain lowercase word.
pub fn quote_ident(ident: &str) -> String {
    let plain = ident
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && ident
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if plain {
        ident.to_string()
    } else {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }
}

/// Catalog lookup of table descriptors.
#[async_trait]
pub trait DescriptorCatalog: Send + Sync {
    /// Fetch the current descriptor, or `None` when the table does not exist.
    async fn table_descriptor(&self, table_id: TableId) -> anyhow::Result<Option<TableDescriptor>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("events"), "events");
        assert_eq!(quote_ident("_crdb_2"), "_crdb_2");
        assert_eq!(quote_ident("Events"), "\"Events\"");
        assert_eq!(quote_ident("1st"), "\"1st\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
        assert_eq!(quote_ident(""), "\"\"");
    }

    #[test]
    fn test_relation_name_and_index_layout() {
        let desc = TableDescriptor {
            id: 104,
            database: "defaultdb".to_string(),
            schema: "public".to_string(),
            name: "Sessions".to_string(),
            version: 1,
            modified_at: Utc::now(),
            primary_index: IndexDescriptor {
                id: 1,
                key_columns: vec![
                    KeyColumn::new("tenant", ColumnType::String, Direction::Asc),
                    KeyColumn::new("Created", ColumnType::Timestamp, Direction::Desc),
                ],
            },
            row_level_ttl: Some(RowLevelTtl::default()),
        };

        assert_eq!(desc.relation_name(), "defaultdb.public.\"Sessions\"");
        assert!(desc.has_row_level_ttl());
        assert_eq!(
            desc.primary_index.column_types(),
            vec![ColumnType::String, ColumnType::Timestamp]
        );
        assert_eq!(
            desc.primary_index.column_directions(),
            vec![Direction::Asc, Direction::Desc]
        );
        assert_eq!(
            desc.primary_index.quoted_column_names(),
            vec!["tenant".to_string(), "\"Created\"".to_string()]
        );
    }
}
