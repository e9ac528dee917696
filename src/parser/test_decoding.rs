use std::collections::HashMap;

use regex::Regex;
use tracing::{debug, error, trace};

use super::compile_table_filter;
use crate::change::{Change, ChangeOperation, ChangeRecord, PrimaryKeyMap};
use crate::error::{RelayError, RelayResult};

/// Where the parser is in the BEGIN/COMMIT cycle of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionState {
    /// Between transactions; keeps the id of the last committed one
    Awaiting { last_xid: String },
    InTransaction { xid: String },
}

impl TransactionState {
    pub fn xid(&self) -> &str {
        match self {
            Self::Awaiting { last_xid } => last_xid,
            Self::InTransaction { xid } => xid,
        }
    }
}

impl Default for TransactionState {
    fn default() -> Self {
        Self::Awaiting {
            last_xid: String::new(),
        }
    }
}

/// Parser for the line-oriented `test_decoding` plugin.
///
/// Payloads look like:
///
/// ```text
/// BEGIN 529
/// table public.users: UPDATE: id[integer]:12 name[text]:'alice'
/// COMMIT 529
/// ```
#[derive(Debug)]
pub struct TestDecodingParser {
    state: TransactionState,
    table_filter: Regex,
    primary_key_patterns: HashMap<String, Regex>,
}

impl TestDecodingParser {
    pub fn new(primary_key_map: &PrimaryKeyMap, table_pattern: Option<&str>) -> RelayResult<Self> {
        let mut primary_key_patterns = HashMap::with_capacity(primary_key_map.len());
        for (table, key) in primary_key_map {
            let pattern = format!(
                r"(?:^|\s){}\[{}\]:'?([\w\-]+)'?",
                regex::escape(&key.column_name),
                regex::escape(&key.column_type)
            );
            primary_key_patterns.insert(table.clone(), Regex::new(&pattern)?);
        }

        Ok(Self {
            state: TransactionState::default(),
            table_filter: compile_table_filter(table_pattern)?,
            primary_key_patterns,
        })
    }

    pub fn state(&self) -> &TransactionState {
        &self.state
    }

    pub fn current_xid(&self) -> &str {
        self.state.xid()
    }

    pub fn parse(&mut self, payload: &str) -> RelayResult<Vec<Change>> {
        let mut tokens = payload.splitn(4, ' ');

        match tokens.next().unwrap_or_default() {
            "BEGIN" => {
                let xid = tokens
                    .next()
                    .filter(|xid| !xid.is_empty())
                    .ok_or_else(|| unknown_change(payload))?;
                trace!(xid = %xid, "Transaction started");
                self.state = TransactionState::InTransaction {
                    xid: xid.to_string(),
                };
                Ok(Vec::new())
            }
            "COMMIT" => {
                let last_xid = self.state.xid().to_string();
                trace!(xid = %last_xid, "Transaction committed");
                self.state = TransactionState::Awaiting { last_xid };
                Ok(Vec::new())
            }
            "table" => {
                let (Some(table), Some(operation), Some(columns)) =
                    (tokens.next(), tokens.next(), tokens.next())
                else {
                    return Err(unknown_change(payload));
                };
                let table = table.strip_suffix(':').unwrap_or(table);
                let operation = operation.strip_suffix(':').unwrap_or(operation);

                if !self.table_filter.is_match(table) {
                    debug!(table = %table, "Table excluded by filter");
                    return Ok(Vec::new());
                }

                let pattern = self.primary_key_patterns.get(table).ok_or_else(|| {
                    let err = RelayError::MissingTable(table.to_string());
                    error!(xid = %self.state.xid(), "{}", err);
                    err
                })?;

                let primary_key = pattern
                    .captures(columns)
                    .and_then(|captures| captures.get(1))
                    .ok_or_else(|| {
                        let err = RelayError::MissingPrimaryKey(table.to_string());
                        error!(xid = %self.state.xid(), "{}", err);
                        err
                    })?;

                Ok(vec![Change::Row(ChangeRecord {
                    xid: self.state.xid().to_string(),
                    table: table.to_string(),
                    operation: ChangeOperation::from(operation),
                    primary_key: primary_key.as_str().to_string(),
                })])
            }
            _ => Err(unknown_change(payload)),
        }
    }
}

fn unknown_change(payload: &str) -> RelayError {
    let err = RelayError::UnknownChange(payload.to_string());
    error!("{}", err);
    err
}
