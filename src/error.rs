//! Error types for docgraph-indexer

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("Graph store error: {0}")]
    Graph(String),

    #[error("Graph store rejected request: {0}")]
    GraphResponse(String),

    #[error("Invalid delta: {0}")]
    InvalidDelta(String),

    #[error("Invalid edge name: {0:?}")]
    InvalidEdgeName(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, IndexerError>;
