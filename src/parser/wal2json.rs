use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error};

use super::compile_table_filter;
use crate::change::{Change, ChangeOperation, ChangeRecord, FullChangeRecord, PrimaryKeyMap};
use crate::error::{RelayError, RelayResult};

/// One wal2json (format v1) transaction document.
#[derive(Debug, Deserialize)]
struct Wal2JsonTransaction {
    #[serde(default)]
    xid: Value,
    #[serde(default)]
    change: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct Wal2JsonEntry {
    kind: String,
    schema: String,
    table: String,
    #[serde(default)]
    columnnames: Vec<String>,
    #[serde(default)]
    columnvalues: Vec<Value>,
    #[serde(default)]
    oldkeys: Option<Wal2JsonOldKeys>,
}

/// Replica identity columns, the only column data wal2json emits for deletes.
#[derive(Debug, Deserialize)]
struct Wal2JsonOldKeys {
    #[serde(default)]
    keynames: Vec<String>,
    #[serde(default)]
    keyvalues: Vec<Value>,
}

impl Wal2JsonEntry {
    fn key_value(&self, column: &str) -> Option<&Value> {
        if let Some(index) = self.columnnames.iter().position(|name| name == column) {
            return self.columnvalues.get(index);
        }

        let oldkeys = self.oldkeys.as_ref()?;
        let index = oldkeys.keynames.iter().position(|name| name == column)?;
        oldkeys.keyvalues.get(index)
    }
}

/// Parser for the JSON `wal2json` plugin.
///
/// ```json
/// {"xid": 1234, "change": [{"kind": "insert", "schema": "public", "table": "users",
///   "columnnames": ["id"], "columntypes": ["integer"], "columnvalues": [42]}]}
/// ```
#[derive(Debug)]
pub struct Wal2JsonParser {
    current_xid: String,
    full_change: bool,
    table_filter: Regex,
    primary_key_map: PrimaryKeyMap,
}

impl Wal2JsonParser {
    pub fn new(
        primary_key_map: PrimaryKeyMap,
        full_change: bool,
        table_pattern: Option<&str>,
    ) -> RelayResult<Self> {
        Ok(Self {
            current_xid: String::new(),
            full_change,
            table_filter: compile_table_filter(table_pattern)?,
            primary_key_map,
        })
    }

    pub fn current_xid(&self) -> &str {
        &self.current_xid
    }

    pub fn parse(&mut self, payload: &str) -> RelayResult<Vec<Change>> {
        if payload.trim().is_empty() {
            return Ok(Vec::new());
        }

        let document: Value = serde_json::from_str(payload).map_err(|e| {
            error!(error = %e, "Failed to decode wal2json payload");
            RelayError::MalformedPayload(e)
        })?;
        if document.is_null() || document.as_object().is_some_and(|o| o.is_empty()) {
            return Ok(Vec::new());
        }

        let transaction = Wal2JsonTransaction::deserialize(&document)?;
        self.current_xid = match &transaction.xid {
            Value::String(xid) => xid.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };

        let mut changes = Vec::with_capacity(transaction.change.len());
        for raw in transaction.change {
            let entry = Wal2JsonEntry::deserialize(&raw)?;
            if !self.table_filter.is_match(&entry.table) {
                debug!(table = %entry.table, "Table excluded by filter");
                continue;
            }

            if self.full_change {
                changes.push(Change::Full(FullChangeRecord {
                    xid: self.current_xid.clone(),
                    change: raw,
                }));
                continue;
            }

            changes.push(Change::Row(self.row_change(&entry)?));
        }

        Ok(changes)
    }

    fn row_change(&self, entry: &Wal2JsonEntry) -> RelayResult<ChangeRecord> {
        let table = format!("{}.{}", entry.schema, entry.table);

        let Some(key) = self.primary_key_map.get(&table) else {
            let err = RelayError::MissingTable(table);
            error!(xid = %self.current_xid, "{}", err);
            return Err(err);
        };

        let Some(value) = entry.key_value(&key.column_name) else {
            let err = RelayError::MissingPrimaryKey(table);
            error!(xid = %self.current_xid, column = %key.column_name, "{}", err);
            return Err(err);
        };

        let primary_key = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        Ok(ChangeRecord {
            xid: self.current_xid.clone(),
            table,
            operation: ChangeOperation::from(entry.kind.as_str()),
            primary_key,
        })
    }
}
