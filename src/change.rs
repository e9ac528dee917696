use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Row operation carried by a change.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
    Truncate,
    /// Any other kind reported by the output plugin, lowercased
    Other(String),
}

impl ChangeOperation {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Truncate => "truncate",
            Self::Other(kind) => kind,
        }
    }

    /// Operations forwarded when no filter is configured.
    pub fn defaults() -> [ChangeOperation; 4] {
        [Self::Insert, Self::Update, Self::Delete, Self::Truncate]
    }
}

impl From<&str> for ChangeOperation {
    fn from(kind: &str) -> Self {
        match kind.trim().to_ascii_lowercase().as_str() {
            "insert" => Self::Insert,
            "update" => Self::Update,
            "delete" => Self::Delete,
            "truncate" => Self::Truncate,
            other => Self::Other(other.to_string()),
        }
    }
}

impl FromStr for ChangeOperation {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ChangeOperation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ChangeOperation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let kind = String::deserialize(deserializer)?;
        Ok(Self::from(kind.as_str()))
    }
}

/// Column identifying the rows of a table, used as the partition key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryKeyColumn {
    pub column_name: String,
    /// Type name as printed by `format_type` (e.g. `integer`, `uuid`)
    pub column_type: String,
}

impl PrimaryKeyColumn {
    pub fn new(column_name: impl Into<String>, column_type: impl Into<String>) -> Self {
        Self {
            column_name: column_name.into(),
            column_type: column_type.into(),
        }
    }
}

/// Schema-qualified table name to primary key column.
pub type PrimaryKeyMap = HashMap<String, PrimaryKeyColumn>;

/// A row change reduced to the fields needed for partitioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Transaction the change committed in
    pub xid: String,
    /// Schema-qualified table name
    pub table: String,
    pub operation: ChangeOperation,
    #[serde(rename = "pkey")]
    pub primary_key: String,
}

/// A change carried with its complete column set, as emitted by wal2json.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullChangeRecord {
    pub xid: String,
    pub change: Value,
}

impl FullChangeRecord {
    fn field(&self, name: &str) -> Option<&str> {
        self.change.get(name).and_then(Value::as_str)
    }
}

/// One parsed change, in either primary-key or full-capture form.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Row(ChangeRecord),
    Full(FullChangeRecord),
}

impl Change {
    pub fn xid(&self) -> &str {
        match self {
            Change::Row(record) => &record.xid,
            Change::Full(record) => &record.xid,
        }
    }

    /// Schema-qualified table name
    pub fn table(&self) -> String {
        match self {
            Change::Row(record) => record.table.clone(),
            Change::Full(record) => match (record.field("schema"), record.field("table")) {
                (Some(schema), Some(table)) => format!("{}.{}", schema, table),
                (None, Some(table)) => table.to_string(),
                _ => String::new(),
            },
        }
    }

    pub fn operation(&self) -> ChangeOperation {
        match self {
            Change::Row(record) => record.operation.clone(),
            Change::Full(record) => ChangeOperation::from(record.field("kind").unwrap_or_default()),
        }
    }

    /// Key used to route the change to a stream partition.
    ///
    /// Full changes carry no extracted key and are routed by table.
    pub fn partition_key(&self) -> String {
        match self {
            Change::Row(record) => record.primary_key.clone(),
            Change::Full(_) => self.table(),
        }
    }
}

impl Serialize for Change {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Change::Row(record) => record.serialize(serializer),
            Change::Full(record) => record.serialize(serializer),
        }
    }
}

impl From<ChangeRecord> for Change {
    fn from(record: ChangeRecord) -> Self {
        Change::Row(record)
    }
}

impl From<FullChangeRecord> for Change {
    fn from(record: FullChangeRecord) -> Self {
        Change::Full(record)
    }
}

/// A change paired with its wire representation.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedMessage {
    pub change: Change,
    pub wire_text: String,
}
