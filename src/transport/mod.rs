//! Delta transports
//!
//! A [`DeltaSource`] yields raw delta records one at a time. Each record must
//! be acknowledged before the next one is requested; the stream does not run
//! ahead of the indexer.
//!
//! - [`WebSocketSource`] follows a live delta stream and reconnects on failure.
//! - [`ReplaySource`] reads recorded deltas from a newline-delimited JSON file.

mod replay;
mod websocket;

pub use replay::ReplaySource;
pub use websocket::{StreamRequest, WebSocketConfig, WebSocketSource};

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use crate::delta::DeltaEnvelope;
use crate::error::{IndexerError, Result};

#[async_trait]
pub trait DeltaSource: Send {
    /// Next record, or `None` once the source is exhausted
    async fn next(&mut self) -> Result<Option<DeltaEnvelope>>;

    /// Acknowledge the record returned by the last `next`
    async fn ack(&mut self) -> Result<()>;
}

/// Enforces one outstanding record at a time
#[derive(Debug, Default)]
pub struct AckGate {
    outstanding: Option<u64>,
    last_acked: Option<u64>,
}

impl AckGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails if the previous record was not acknowledged
    pub fn ready(&self) -> Result<()> {
        match self.outstanding {
            Some(block) => Err(IndexerError::Transport(format!(
                "record from block {} was not acknowledged",
                block
            ))),
            None => Ok(()),
        }
    }

    pub fn deliver(&mut self, block_num: u64) -> Result<()> {
        self.ready()?;
        self.outstanding = Some(block_num);
        Ok(())
    }

    pub fn ack(&mut self) -> Result<u64> {
        let block = self
            .outstanding
            .take()
            .ok_or_else(|| IndexerError::Transport("nothing to acknowledge".into()))?;
        self.last_acked = Some(block);
        Ok(block)
    }

    /// Block of the last acknowledged record
    pub fn last_acked(&self) -> Option<u64> {
        self.last_acked
    }
}

/// Stream position to start from when no checkpoint exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFrom {
    Block(u64),
    Time(DateTime<Utc>),
}

impl Default for StartFrom {
    fn default() -> Self {
        StartFrom::Block(0)
    }
}

impl StartFrom {
    /// Request encoding: block numbers as numbers, times as ISO-8601 strings
    pub fn to_json(&self) -> JsonValue {
        match self {
            StartFrom::Block(block) => JsonValue::from(*block),
            StartFrom::Time(time) => JsonValue::String(time.to_rfc3339()),
        }
    }

    /// Lowest block a replay should deliver
    pub fn min_block(&self) -> u64 {
        match self {
            StartFrom::Block(block) => *block,
            StartFrom::Time(_) => 0,
        }
    }
}

impl fmt::Display for StartFrom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartFrom::Block(block) => write!(f, "block {}", block),
            StartFrom::Time(time) => write!(f, "{}", time.to_rfc3339()),
        }
    }
}

impl FromStr for StartFrom {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(StartFrom::default());
        }
        if let Ok(block) = s.parse::<u64>() {
            return Ok(StartFrom::Block(block));
        }

        DateTime::parse_from_rfc3339(s)
            .map(|time| StartFrom::Time(time.with_timezone(&Utc)))
            .or_else(|_| {
                chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                    .map(|naive| StartFrom::Time(naive.and_utc()))
            })
            .map_err(|_| {
                IndexerError::Config(format!(
                    "START_FROM must be a block number or ISO-8601 timestamp, got {:?}",
                    s
                ))
            })
    }
}
