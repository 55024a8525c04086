//! Channel abstraction for talking to compilation slaves.
//!
//! The orchestrator only sends and receives [`SlaveMessage`]s; framing and
//! transport belong to the [`Channel`] implementation.

pub mod mock;
pub mod protocol;
pub mod tcp;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ChannelError;

pub use mock::{MockBehavior, MockConnector, MockSlave};
pub use protocol::{CompileRequest, JobOutcome, PROTOCOL_VERSION, SlaveMessage};
pub use tcp::{TcpChannel, TcpConnector};

/// Bidirectional message transport to one slave.
///
/// `send` and `recv` may be called concurrently from different tasks: jobs
/// are multiplexed over a single channel.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Host this channel talks to.
    fn peer(&self) -> &str;

    /// Send one message.
    async fn send(&self, message: SlaveMessage) -> Result<(), ChannelError>;

    /// Receive the next message. `Ok(None)` means the slave closed the stream.
    async fn recv(&self) -> Result<Option<SlaveMessage>, ChannelError>;

    /// Release the transport. Safe to call more than once.
    async fn close(&self);
}

/// Opens channels to slaves.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> Result<Arc<dyn Channel>, ChannelError>;
}
