//! File replay source
//!
//! Reads one delta record per line. Blank lines are skipped, undecodable lines
//! are logged and skipped, and records before the start block or after the
//! end block are not delivered.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tracing::{debug, info, warn};

use super::{AckGate, DeltaSource};
use crate::delta::DeltaEnvelope;
use crate::error::Result;
use crate::metrics;

pub struct ReplaySource {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    line_number: usize,
    start_block: u64,
    read_until: u64,
    gate: AckGate,
}

impl ReplaySource {
    /// Open a replay file delivering blocks `start_block..=read_until`
    /// (`read_until` 0 means to the end of the file)
    pub async fn open<P: AsRef<Path>>(path: P, start_block: u64, read_until: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;
        info!(path = %path.display(), start_block, "Opened replay file");

        Ok(Self {
            path,
            lines: BufReader::new(file).lines(),
            line_number: 0,
            start_block,
            read_until,
            gate: AckGate::new(),
        })
    }
}

#[async_trait]
impl DeltaSource for ReplaySource {
    async fn next(&mut self) -> Result<Option<DeltaEnvelope>> {
        self.gate.ready()?;

        while let Some(line) = self.lines.next_line().await? {
            self.line_number += 1;
            if line.trim().is_empty() {
                continue;
            }

            let envelope = match DeltaEnvelope::from_json(&line) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(path = %self.path.display(), line = self.line_number, error = %e, "Skipping record");
                    metrics::delta_error("decode");
                    continue;
                }
            };

            let block_num = envelope.block_num();
            if block_num < self.start_block {
                continue;
            }
            if self.read_until > 0 && block_num > self.read_until {
                debug!(block = block_num, "Replay reached its end block");
                return Ok(None);
            }

            self.gate.deliver(block_num)?;
            return Ok(Some(envelope));
        }

        info!(path = %self.path.display(), records = self.line_number, "Replay file exhausted");
        Ok(None)
    }

    async fn ack(&mut self) -> Result<()> {
        self.gate.ack()?;
        Ok(())
    }
}
