//! Configuration for docgraph-indexer
//!
//! CLI arguments and environment variable handling using clap. The binary
//! parses [`Args`] and converts them into an [`IndexerConfig`], which is all
//! the library sees.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::batcher::BatcherConfig;
use crate::delta::TableNames;
use crate::error::{IndexerError, Result};
use crate::graph::DgraphConfig;
use crate::transport::{StartFrom, WebSocketConfig};

/// Default directory for local state
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("docgraph-indexer")
}

/// docgraph-indexer - mirrors on-chain documents and edges into a graph database
#[derive(Parser, Debug, Clone)]
#[command(name = "docgraph-indexer")]
#[command(about = "Indexes contract document and edge tables into Dgraph")]
pub struct Args {
    /// Delta stream WebSocket endpoint
    #[arg(long, env = "STREAM_URL")]
    pub stream_url: Option<String>,

    /// Read deltas from a newline-delimited JSON file instead of the stream
    #[arg(long, env = "REPLAY_FILE")]
    pub replay_file: Option<PathBuf>,

    /// Contract account whose tables are indexed
    #[arg(long, env = "CONTRACT_NAME", default_value = "")]
    pub contract_name: String,

    /// Table holding documents
    #[arg(long, env = "DOC_TABLE_NAME", default_value = "documents")]
    pub doc_table_name: String,

    /// Table holding edges
    #[arg(long, env = "EDGE_TABLE_NAME", default_value = "edges")]
    pub edge_table_name: String,

    /// Dgraph alpha HTTP endpoint
    #[arg(long, env = "DGRAPH_URL", default_value = "http://localhost:8080")]
    pub dgraph_url: String,

    /// Per-request timeout for Dgraph calls, in milliseconds
    #[arg(long, env = "GRAPH_TIMEOUT_MS", default_value = "30000")]
    pub graph_timeout_ms: u64,

    /// Flush queued operations after this long without a delta, in milliseconds
    #[arg(long, env = "BLOCK_END_TIMEOUT_MS", default_value = "2000")]
    pub block_end_timeout_ms: u64,

    /// Block number or ISO-8601 time to start from when no checkpoint exists
    #[arg(long, env = "START_FROM", default_value = "0")]
    pub start_from: String,

    /// Last block to read (0 = follow indefinitely)
    #[arg(long, env = "READ_UNTIL", default_value = "0")]
    pub read_until: u64,

    /// Directory for the checkpoint store
    #[arg(long, env = "DATA_PATH")]
    pub data_path: Option<PathBuf>,

    /// Checkpoint store name inside DATA_PATH
    #[arg(long, env = "STORE_NAME", default_value = "checkpoint.sled")]
    pub store_name: String,

    /// Address for the Prometheus scrape endpoint (disabled if unset)
    #[arg(long, env = "METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,

    /// Delay before reconnecting to the delta stream, in seconds
    #[arg(long, env = "RECONNECT_DELAY_SECS", default_value = "5")]
    pub reconnect_delay_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Keep the checkpoint at the first block whose handling failed
    #[arg(long, env = "PIN_CHECKPOINT_ON_ERROR", default_value = "true", action = clap::ArgAction::Set)]
    pub pin_checkpoint_on_error: bool,

    /// Index into an in-memory graph instead of Dgraph
    #[arg(long, env = "DRY_RUN", default_value = "false")]
    pub dry_run: bool,
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.contract_name.trim().is_empty() {
            return Err("CONTRACT_NAME is required".to_string());
        }

        if self.doc_table_name == self.edge_table_name {
            return Err("DOC_TABLE_NAME and EDGE_TABLE_NAME must differ".to_string());
        }

        if self.block_end_timeout_ms == 0 {
            return Err("BLOCK_END_TIMEOUT_MS must be greater than 0".to_string());
        }

        if self.graph_timeout_ms == 0 {
            return Err("GRAPH_TIMEOUT_MS must be greater than 0".to_string());
        }

        if self.stream_url.is_none() && self.replay_file.is_none() {
            return Err("STREAM_URL is required unless REPLAY_FILE is set".to_string());
        }

        if let Err(e) = self.start_from.parse::<StartFrom>() {
            return Err(e.to_string());
        }

        Ok(())
    }

    pub fn into_config(self) -> Result<IndexerConfig> {
        let start_from = self.start_from.parse()?;

        Ok(IndexerConfig {
            contract_name: self.contract_name,
            tables: TableNames {
                documents: self.doc_table_name,
                edges: self.edge_table_name,
            },
            stream_url: self.stream_url,
            replay_file: self.replay_file,
            dgraph: DgraphConfig {
                url: self.dgraph_url,
                timeout_ms: self.graph_timeout_ms,
            },
            block_end_timeout: Duration::from_millis(self.block_end_timeout_ms),
            start_from,
            read_until: self.read_until,
            data_path: self.data_path.unwrap_or_else(default_data_dir),
            store_name: self.store_name,
            metrics_addr: self.metrics_addr,
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
            pin_checkpoint_on_error: self.pin_checkpoint_on_error,
            dry_run: self.dry_run,
        })
    }
}

/// Runtime configuration of the indexer
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub contract_name: String,
    pub tables: TableNames,
    pub stream_url: Option<String>,
    pub replay_file: Option<PathBuf>,
    pub dgraph: DgraphConfig,
    pub block_end_timeout: Duration,
    pub start_from: StartFrom,
    pub read_until: u64,
    pub data_path: PathBuf,
    pub store_name: String,
    pub metrics_addr: Option<SocketAddr>,
    pub reconnect_delay: Duration,
    pub pin_checkpoint_on_error: bool,
    pub dry_run: bool,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            contract_name: String::new(),
            tables: TableNames::default(),
            stream_url: None,
            replay_file: None,
            dgraph: DgraphConfig::default(),
            block_end_timeout: Duration::from_millis(2000),
            start_from: StartFrom::default(),
            read_until: 0,
            data_path: default_data_dir(),
            store_name: "checkpoint.sled".to_string(),
            metrics_addr: None,
            reconnect_delay: Duration::from_secs(5),
            pin_checkpoint_on_error: true,
            dry_run: false,
        }
    }
}

impl IndexerConfig {
    pub fn checkpoint_path(&self) -> PathBuf {
        self.data_path.join(&self.store_name)
    }

    pub fn batcher(&self) -> BatcherConfig {
        BatcherConfig {
            block_end_timeout: self.block_end_timeout,
            pin_checkpoint_on_error: self.pin_checkpoint_on_error,
        }
    }

    /// Stream settings starting at `start_from`
    pub fn websocket(&self, start_from: StartFrom) -> Result<WebSocketConfig> {
        let url = self
            .stream_url
            .clone()
            .ok_or_else(|| IndexerError::Config("STREAM_URL is not set".into()))?;

        Ok(WebSocketConfig {
            url,
            contract: self.contract_name.clone(),
            start_from,
            read_until: self.read_until,
            reconnect_delay: self.reconnect_delay,
        })
    }
}
