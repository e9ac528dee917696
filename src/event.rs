use std::fmt;
use std::str::FromStr;

use crate::error::RelayError;

/// Position in the write-ahead log.
///
/// Textual form is two hex halves separated by a slash, e.g. `16/B374D848`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl FromStr for Lsn {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s
            .split_once('/')
            .ok_or_else(|| RelayError::InvalidLsn(s.to_string()))?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| RelayError::InvalidLsn(s.to_string()))?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| RelayError::InvalidLsn(s.to_string()))?;
        Ok(Lsn((u64::from(hi) << 32) | u64::from(lo)))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

/// One raw message delivered by the replication source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationEvent {
    /// Log position of the message, reported back on acknowledgment
    pub data_start: Lsn,
    /// Size of the raw payload in bytes
    pub data_size: u64,
    pub payload: String,
}

impl ReplicationEvent {
    pub fn new(data_start: impl Into<Lsn>, payload: impl Into<String>) -> Self {
        let payload = payload.into();
        Self {
            data_start: data_start.into(),
            data_size: payload.len() as u64,
            payload,
        }
    }
}
