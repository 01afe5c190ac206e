//! WebSocket delta stream
//!
//! After connecting, the client sends one stream request:
//!
//! ```json
//! { "type": "delta_stream_request",
//!   "data": { "code": "...", "table": "*", "account": "...", "scope": "", "payer": "",
//!             "start_from": 1200, "read_until": 0 } }
//! ```
//!
//! and then receives `{ "type": "delta", "message": <record> }` frames, where
//! the record is either an object or a JSON string of one. A dropped
//! connection is re-established after `reconnect_delay`, resuming at the last
//! acknowledged block.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::Message,
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use super::{AckGate, DeltaSource, StartFrom};
use crate::delta::DeltaEnvelope;
use crate::error::{IndexerError, Result};
use crate::metrics;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    pub url: String,
    /// Contract account whose tables are streamed
    pub contract: String,
    pub start_from: StartFrom,
    /// Last block to stream, 0 to follow indefinitely
    pub read_until: u64,
    pub reconnect_delay: Duration,
}

/// Body of the stream request frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamRequest {
    pub code: String,
    pub table: String,
    pub account: String,
    pub scope: String,
    pub payer: String,
    pub start_from: JsonValue,
    pub read_until: u64,
}

impl StreamRequest {
    pub fn new(contract: &str, start_from: &StartFrom, read_until: u64) -> Self {
        Self {
            code: contract.to_string(),
            table: "*".to_string(),
            account: contract.to_string(),
            scope: String::new(),
            payer: String::new(),
            start_from: start_from.to_json(),
            read_until,
        }
    }

    fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(&serde_json::json!({
            "type": "delta_stream_request",
            "data": self,
        }))?)
    }
}

#[derive(Debug, Deserialize)]
struct ServerFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: JsonValue,
}

/// Extract the delta carried by a text frame, if any
fn parse_frame(text: &str) -> Result<Option<DeltaEnvelope>> {
    let frame: ServerFrame = serde_json::from_str(text)
        .map_err(|e| IndexerError::InvalidDelta(format!("Unreadable frame: {}", e)))?;

    if frame.kind != "delta" {
        debug!(kind = %frame.kind, "Skipping stream frame");
        return Ok(None);
    }

    let envelope = match frame.message {
        JsonValue::String(record) => DeltaEnvelope::from_json(&record)?,
        record => serde_json::from_value(record)
            .map_err(|e| IndexerError::InvalidDelta(format!("Unreadable delta: {}", e)))?,
    };
    Ok(Some(envelope))
}

struct Connection {
    sink: WsSink,
    stream: WsStream,
}

pub struct WebSocketSource {
    config: WebSocketConfig,
    connection: Option<Connection>,
    gate: AckGate,
}

impl WebSocketSource {
    pub fn new(config: WebSocketConfig) -> Self {
        Self {
            config,
            connection: None,
            gate: AckGate::new(),
        }
    }

    /// Position to request: resume at the last acknowledged block, inclusive
    fn resume_position(&self) -> StartFrom {
        match self.gate.last_acked() {
            Some(block) => StartFrom::Block(block),
            None => self.config.start_from,
        }
    }

    fn finished(&self) -> bool {
        self.config.read_until > 0
            && self
                .gate
                .last_acked()
                .is_some_and(|block| block >= self.config.read_until)
    }

    async fn connect(&self) -> Result<Connection> {
        let url = self.config.url.as_str();
        debug!(url = %url, "Connecting to delta stream");

        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| IndexerError::Transport(format!("WebSocket connect failed: {}", e)))?;
        let (mut sink, stream) = ws.split();

        let position = self.resume_position();
        let request = StreamRequest::new(&self.config.contract, &position, self.config.read_until);
        sink.send(Message::Text(request.to_frame()?))
            .await
            .map_err(|e| IndexerError::Transport(format!("Failed to send stream request: {}", e)))?;

        info!(url = %url, start_from = %position, "Delta stream connected");
        Ok(Connection { sink, stream })
    }

    /// Read frames until one carries a delta. `Ok(None)` means the connection closed.
    async fn read_delta(connection: &mut Connection) -> Result<Option<DeltaEnvelope>> {
        loop {
            match connection.stream.next().await {
                Some(Ok(Message::Text(text))) => match parse_frame(&text) {
                    Ok(Some(envelope)) => return Ok(Some(envelope)),
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(error = %e, "Skipping undecodable frame");
                        metrics::delta_error("decode");
                        continue;
                    }
                },
                Some(Ok(Message::Ping(payload))) => {
                    connection
                        .sink
                        .send(Message::Pong(payload))
                        .await
                        .map_err(|e| IndexerError::Transport(format!("Failed to send pong: {}", e)))?;
                }
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(IndexerError::Transport(format!("WebSocket error: {}", e)))
                }
                None => return Ok(None),
            }
        }
    }
}

#[async_trait]
impl DeltaSource for WebSocketSource {
    async fn next(&mut self) -> Result<Option<DeltaEnvelope>> {
        self.gate.ready()?;

        loop {
            if self.finished() {
                info!(read_until = self.config.read_until, "Delta stream reached its end block");
                return Ok(None);
            }

            let mut connection = match self.connection.take() {
                Some(connection) => connection,
                None => match self.connect().await {
                    Ok(connection) => connection,
                    Err(e) => {
                        warn!(error = %e, delay = ?self.config.reconnect_delay, "Connect failed, retrying");
                        tokio::time::sleep(self.config.reconnect_delay).await;
                        continue;
                    }
                },
            };

            match Self::read_delta(&mut connection).await {
                Ok(Some(envelope)) => {
                    self.connection = Some(connection);
                    self.gate.deliver(envelope.block_num())?;
                    return Ok(Some(envelope));
                }
                Ok(None) => {
                    warn!(delay = ?self.config.reconnect_delay, "Delta stream closed, reconnecting");
                }
                Err(e) => {
                    warn!(error = %e, delay = ?self.config.reconnect_delay, "Delta stream failed, reconnecting");
                }
            }

            tokio::time::sleep(self.config.reconnect_delay).await;
        }
    }

    async fn ack(&mut self) -> Result<()> {
        self.gate.ack()?;
        Ok(())
    }
}
