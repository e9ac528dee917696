//! Wire formats for change messages.
//!
//! Every message starts with `<VERSION>,<TYPE>,` so downstream consumers can
//! tell payload versions apart without out-of-band schema information.

use std::fmt;
use std::str::FromStr;

use crate::change::{Change, ChangeOperation, ChangeRecord, EncodedMessage};
use crate::error::{RelayError, RelayResult};

pub const VERSION: u32 = 0;
pub const TYPE: &str = "CDC";

/// Message formatter, selected once per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Formatter {
    /// `0,CDC,<xid>,<table>,<operation>,<pkey>`
    ///
    /// Values are not escaped; table names and keys are assumed to be free
    /// of commas.
    Csv,
    /// `0,CDC,<json>` with the record serialized as a JSON object
    CsvPayload,
}

impl Formatter {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Csv => "CSV",
            Self::CsvPayload => "CSVPayload",
        }
    }

    /// Whether full column sets (nested data) can be carried.
    pub fn supports_full_change(&self) -> bool {
        matches!(self, Self::CsvPayload)
    }

    pub fn encode(&self, change: Change) -> RelayResult<EncodedMessage> {
        let wire_text = match (self, &change) {
            (Self::Csv, Change::Row(record)) => format!(
                "{},{},{},{},{},{}",
                VERSION, TYPE, record.xid, record.table, record.operation, record.primary_key
            ),
            (Self::Csv, Change::Full(_)) => {
                return Err(RelayError::UnsupportedChange {
                    formatter: self.name(),
                    reason: "full changes carry nested data".to_string(),
                })
            }
            (Self::CsvPayload, change) => {
                format!("{},{},{}", VERSION, TYPE, serde_json::to_string(change)?)
            }
        };

        Ok(EncodedMessage { change, wire_text })
    }
}

impl FromStr for Formatter {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" | "compact" => Ok(Self::Csv),
            "csvpayload" | "json" => Ok(Self::CsvPayload),
            other => Err(RelayError::Config(format!("unknown formatter: {}", other))),
        }
    }
}

impl fmt::Display for Formatter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Recover the fixed fields of a compact (`CSV`) message.
pub fn decode_compact(wire_text: &str) -> RelayResult<ChangeRecord> {
    let invalid = || RelayError::InvalidWireFormat(wire_text.to_string());

    let fields: Vec<&str> = wire_text.splitn(6, ',').collect();
    let [version, kind, xid, table, operation, primary_key] = fields.as_slice() else {
        return Err(invalid());
    };
    if *version != VERSION.to_string() || *kind != TYPE {
        return Err(invalid());
    }

    Ok(ChangeRecord {
        xid: xid.to_string(),
        table: table.to_string(),
        operation: ChangeOperation::from(*operation),
        primary_key: primary_key.to_string(),
    })
}
