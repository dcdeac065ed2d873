use crate::MetaError;
use crate::Result;
use crate::model::ActionType;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;

/// Online schema-change state of a job or a schema object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaState {
    None,
    DeleteOnly,
    WriteOnly,
    WriteReorganization,
    DeleteReorganization,
    Public,
}

impl SchemaState {
    pub const fn as_str(self) -> &'static str {
        match self {
            SchemaState::None => "none",
            SchemaState::DeleteOnly => "delete_only",
            SchemaState::WriteOnly => "write_only",
            SchemaState::WriteReorganization => "write_reorganization",
            SchemaState::DeleteReorganization => "delete_reorganization",
            SchemaState::Public => "public",
        }
    }

    /// New writes must maintain objects in these states.
    pub const fn is_writable(self) -> bool {
        matches!(
            self,
            SchemaState::WriteOnly | SchemaState::WriteReorganization | SchemaState::Public
        )
    }

    /// Deletes must clean up objects in these states.
    pub const fn is_deletable(self) -> bool {
        !matches!(self, SchemaState::None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Int,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Datum {
    Null,
    Int(i64),
    Text(String),
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    /// `NULL` fits every column type.
    pub fn fits(&self, ty: ColumnType) -> bool {
        matches!(
            (self, ty),
            (Datum::Null, _) | (Datum::Int(_), ColumnType::Int) | (Datum::Text(_), ColumnType::Text)
        )
    }
}

impl std::fmt::Display for Datum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Datum::Null => f.write_str("NULL"),
            Datum::Int(value) => write!(f, "{value}"),
            Datum::Text(value) => write!(f, "'{value}'"),
        }
    }
}

/// Column as requested by a create-table or add-column statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub ty: ColumnType,
    #[serde(default)]
    pub not_null: bool,
    #[serde(default)]
    pub default: Option<Datum>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub primary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
    #[serde(default)]
    pub indices: Vec<IndexSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub id: i64,
    pub name: String,
    pub offset: usize,
    pub ty: ColumnType,
    pub not_null: bool,
    /// Value written for new rows that omit the column.
    pub default: Option<Datum>,
    /// Value read for rows stored before the column existed.
    pub origin_default: Option<Datum>,
    pub state: SchemaState,
}

impl ColumnInfo {
    pub fn default_datum(&self) -> Datum {
        self.default.clone().unwrap_or(Datum::Null)
    }

    pub fn origin_default_datum(&self) -> Datum {
        self.origin_default.clone().unwrap_or(Datum::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub id: i64,
    pub name: String,
    /// Column ids, in index order.
    pub columns: Vec<i64>,
    pub unique: bool,
    pub primary: bool,
    pub state: SchemaState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub id: i64,
    pub schema_id: i64,
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub indices: Vec<IndexInfo>,
    pub state: SchemaState,
}

impl TableInfo {
    pub fn find_column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns
            .iter()
            .find(|column| column.name.eq_ignore_ascii_case(name))
    }

    pub fn column_by_id(&self, id: i64) -> Option<&ColumnInfo> {
        self.columns.iter().find(|column| column.id == id)
    }

    pub fn find_index(&self, name: &str) -> Option<&IndexInfo> {
        self.indices
            .iter()
            .find(|index| index.name.eq_ignore_ascii_case(name))
    }

    pub fn index_by_id(&self, id: i64) -> Option<&IndexInfo> {
        self.indices.iter().find(|index| index.id == id)
    }

    pub fn primary_index(&self) -> Option<&IndexInfo> {
        self.indices.iter().find(|index| index.primary)
    }

    /// Columns visible to statements.
    pub fn public_columns(&self) -> impl Iterator<Item = &ColumnInfo> {
        self.columns
            .iter()
            .filter(|column| column.state == SchemaState::Public)
    }

    pub fn writable_columns(&self) -> impl Iterator<Item = &ColumnInfo> {
        self.columns.iter().filter(|column| column.state.is_writable())
    }

    pub fn writable_indices(&self) -> impl Iterator<Item = &IndexInfo> {
        self.indices.iter().filter(|index| index.state.is_writable())
    }

    pub fn deletable_indices(&self) -> impl Iterator<Item = &IndexInfo> {
        self.indices.iter().filter(|index| index.state.is_deletable())
    }

    /// Recomputes column offsets after columns were added or removed.
    pub fn reindex_columns(&mut self) {
        for (offset, column) in self.columns.iter_mut().enumerate() {
            column.offset = offset;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbInfo {
    pub id: i64,
    pub name: String,
    pub state: SchemaState,
}

/// What changed at one schema version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDiff {
    pub version: i64,
    pub action: ActionType,
    pub schema_id: i64,
    pub table_id: i64,
    #[serde(default)]
    pub old_schema_id: Option<i64>,
}

/// Full schema at one version, read in a single transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoSchemaSnapshot {
    pub version: i64,
    pub databases: Vec<DbInfo>,
    pub tables: Vec<TableInfo>,
}

/// Objects touched by the diffs in `(from_version, version]`. `None` marks a
/// removed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaDelta {
    pub version: i64,
    pub diffs: Vec<SchemaDiff>,
    pub databases: HashMap<i64, Option<DbInfo>>,
    pub tables: HashMap<i64, Option<TableInfo>>,
}

pub(crate) fn encode_info<T: Serialize>(what: &'static str, value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|source| MetaError::Encode { what, source })
}

pub(crate) fn decode_info<T: DeserializeOwned>(
    what: &'static str,
    id: i64,
    json: &str,
) -> Result<T> {
    serde_json::from_str(json).map_err(|source| MetaError::Corrupt { what, id, source })
}
