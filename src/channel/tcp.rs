//! TCP transport: one JSON document per line.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tracing::debug;

use crate::channel::{Channel, Connector, SlaveMessage};
use crate::error::ChannelError;

/// Connects to slaves over plain TCP.
#[derive(Debug, Default, Clone)]
pub struct TcpConnector;

impl TcpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<Arc<dyn Channel>, ChannelError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| ChannelError::ConnectFailed {
                host: host.to_string(),
                reason: e.to_string(),
            })?;
        let _ = stream.set_nodelay(true);
        debug!(host = %host, port, "TCP connection established");
        Ok(Arc::new(TcpChannel::new(host, stream)))
    }
}

/// Newline-delimited JSON over a TCP stream.
///
/// Reader and writer halves sit behind separate locks so a pending `recv`
/// never blocks a `send`.
pub struct TcpChannel {
    host: String,
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
}

impl TcpChannel {
    pub fn new(host: impl Into<String>, stream: TcpStream) -> Self {
        let (read, write) = stream.into_split();
        Self {
            host: host.into(),
            reader: Mutex::new(BufReader::new(read)),
            writer: Mutex::new(Some(write)),
        }
    }
}

#[async_trait]
impl Channel for TcpChannel {
    fn peer(&self) -> &str {
        &self.host
    }

    async fn send(&self, message: SlaveMessage) -> Result<(), ChannelError> {
        let mut line = serde_json::to_string(&message).map_err(|e| ChannelError::SendFailed {
            host: self.host.clone(),
            reason: e.to_string(),
        })?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or_else(|| ChannelError::Closed {
            host: self.host.clone(),
        })?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ChannelError::SendFailed {
                host: self.host.clone(),
                reason: e.to_string(),
            })?;
        writer.flush().await.map_err(|e| ChannelError::SendFailed {
            host: self.host.clone(),
            reason: e.to_string(),
        })
    }

    async fn recv(&self) -> Result<Option<SlaveMessage>, ChannelError> {
        let mut reader = self.reader.lock().await;
        let mut line = String::new();
        loop {
            line.clear();
            let read = reader
                .read_line(&mut line)
                .await
                .map_err(|e| ChannelError::ReceiveFailed {
                    host: self.host.clone(),
                    reason: e.to_string(),
                })?;
            if read == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return serde_json::from_str(trimmed)
                .map(Some)
                .map_err(|e| ChannelError::Protocol {
                    host: self.host.clone(),
                    reason: format!("malformed message: {e}"),
                });
        }
    }

    async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
            debug!(host = %self.host, "TCP channel closed");
        }
    }
}
