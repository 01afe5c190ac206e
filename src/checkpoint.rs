//! Checkpoint persistence
//!
//! The checkpoint is the last block whose deltas were handled. It is read
//! once at startup to pick the stream's replay position and overwritten after
//! every delta. A checkpoint held back at a failed block is marked `pinned`.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::Db;
use tracing::{debug, info};

use crate::error::{IndexerError, Result};

const CHECKPOINT_KEY: &[u8] = b"last_processed_block";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub block_num: u64,
    pub updated_at: DateTime<Utc>,
    /// Held at a block whose handling failed
    #[serde(default)]
    pub pinned: bool,
}

impl Checkpoint {
    pub fn new(block_num: u64) -> Self {
        Self {
            block_num,
            updated_at: Utc::now(),
            pinned: false,
        }
    }

    pub fn pinned_at(block_num: u64) -> Self {
        Self {
            pinned: true,
            ..Self::new(block_num)
        }
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self) -> Result<Option<Checkpoint>>;

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Make every saved checkpoint durable
    async fn flush(&self) -> Result<()>;
}

/// Checkpoint kept in a local sled database
pub struct SledCheckpointStore {
    db: Db,
}

impl SledCheckpointStore {
    /// Open or create the checkpoint database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), "Opened checkpoint store");
        Ok(Self { db })
    }
}

#[async_trait]
impl CheckpointStore for SledCheckpointStore {
    async fn load(&self) -> Result<Option<Checkpoint>> {
        let Some(value) = self.db.get(CHECKPOINT_KEY)? else {
            return Ok(None);
        };
        let checkpoint: Checkpoint = rmp_serde::from_slice(&value)
            .map_err(|e| IndexerError::Checkpoint(format!("Deserialization error: {}", e)))?;
        Ok(Some(checkpoint))
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let value = rmp_serde::to_vec(checkpoint)
            .map_err(|e| IndexerError::Checkpoint(format!("Serialization error: {}", e)))?;
        self.db.insert(CHECKPOINT_KEY, value)?;
        debug!(block = checkpoint.block_num, "Saved checkpoint");
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

/// Checkpoint held in memory, lost on exit
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoint: Mutex<Option<Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last saved block, if any
    pub fn block_num(&self) -> Option<u64> {
        self.checkpoint
            .lock()
            .ok()
            .and_then(|c| c.map(|checkpoint| checkpoint.block_num))
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self) -> Result<Option<Checkpoint>> {
        let checkpoint = self
            .checkpoint
            .lock()
            .map_err(|e| IndexerError::Checkpoint(format!("Lock poisoned: {}", e)))?;
        Ok(*checkpoint)
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut stored = self
            .checkpoint
            .lock()
            .map_err(|e| IndexerError::Checkpoint(format!("Lock poisoned: {}", e)))?;
        *stored = Some(*checkpoint);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
