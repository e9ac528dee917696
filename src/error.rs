//! Error types for the relay.

use thiserror::Error;

/// Result type alias for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

/// Errors that can occur while relaying replication changes.
///
/// Every variant returned from the parse path is fatal for the current
/// consume cycle: the driver stops instead of skipping the event. A payload
/// that simply carries no row change is not an error and yields an empty
/// record list instead.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Table passed the table filter but has no registered primary key
    #[error("Unable to locate table: \"{0}\"")]
    MissingTable(String),

    /// Primary key column could not be found in the change payload
    #[error("Unable to locate primary key for table \"{0}\"")]
    MissingPrimaryKey(String),

    /// Payload with an unrecognized leading token
    #[error("Unknown change: \"{0}\"")]
    UnknownChange(String),

    /// Structured payload that is not valid JSON of the expected shape
    #[error("Malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    /// Table filter or primary key pattern failed to compile
    #[error("Invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// Change cannot be represented by the selected formatter
    #[error("Unsupported change for formatter {formatter}: {reason}")]
    UnsupportedChange {
        formatter: &'static str,
        reason: String,
    },

    /// Wire text that does not follow the compact message layout
    #[error("Invalid wire format: {0}")]
    InvalidWireFormat(String),

    /// Textual log position that cannot be parsed
    #[error("Invalid LSN: {0}")]
    InvalidLsn(String),

    /// Configuration value missing or inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Replication progress could not be reported
    #[error("Acknowledge failed: {0}")]
    Acknowledge(String),
}

impl RelayError {
    /// Whether this error means the deployed key map or table filter is out
    /// of sync with the database schema.
    pub fn is_fatal_mapping(&self) -> bool {
        matches!(self, Self::MissingTable(_) | Self::MissingPrimaryKey(_))
    }
}
