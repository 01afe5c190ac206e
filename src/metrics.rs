//! Prometheus metrics
//!
//! # Metrics
//!
//! ## Counters
//! - `docgraph_documents_created_total`
//! - `docgraph_documents_updated_total`
//! - `docgraph_documents_deleted_total`
//! - `docgraph_documents_invalid_total` - Records rejected for having no content groups
//! - `docgraph_documents_queued_total` - Deletions deferred to block end
//! - `docgraph_edges_created_total`
//! - `docgraph_edges_deleted_total`
//! - `docgraph_edges_unresolved_total` - Edges dropped because an endpoint did not resolve
//! - `docgraph_edges_queued_total` - Edge creations deferred to block end
//! - `docgraph_delta_errors_total` - Deltas whose handling failed, by stage
//!
//! ## Gauges
//! - `docgraph_block_number` - Block number of the last handled delta
//!
//! Without an installed recorder every call is a no-op.

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::error::{IndexerError, Result};

/// Install the Prometheus recorder with an HTTP scrape listener on `addr`
pub fn install_exporter(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| IndexerError::Config(format!("Failed to install metrics exporter: {}", e)))?;

    tracing::info!(%addr, "Metrics exporter listening");
    Ok(())
}

pub fn document_created() {
    counter!("docgraph_documents_created_total").increment(1);
}

pub fn document_updated() {
    counter!("docgraph_documents_updated_total").increment(1);
}

pub fn document_deleted() {
    counter!("docgraph_documents_deleted_total").increment(1);
}

pub fn document_invalid() {
    counter!("docgraph_documents_invalid_total").increment(1);
}

pub fn document_queued() {
    counter!("docgraph_documents_queued_total").increment(1);
}

pub fn edge_created() {
    counter!("docgraph_edges_created_total").increment(1);
}

pub fn edge_deleted() {
    counter!("docgraph_edges_deleted_total").increment(1);
}

pub fn edge_unresolved() {
    counter!("docgraph_edges_unresolved_total").increment(1);
}

pub fn edge_queued() {
    counter!("docgraph_edges_queued_total").increment(1);
}

/// Record a failed delta; `stage` is `dispatch`, `flush` or `decode`
pub fn delta_error(stage: &'static str) {
    counter!("docgraph_delta_errors_total", "stage" => stage).increment(1);
}

pub fn set_block_number(block_num: u64) {
    gauge!("docgraph_block_number").set(block_num as f64);
}
