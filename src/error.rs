//! Error types for distbuild.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for a build session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Slave declaration error: {0}")]
    Declaration(#[from] DeclarationError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Malformed slave declarations. Always fatal, raised before any worker exists.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeclarationError {
    #[error("Empty slave list")]
    Empty,

    #[error("Empty entry in slave list: {list:?}")]
    EmptyEntry { list: String },

    #[error("Missing host name in slave entry {entry:?}")]
    MissingHost { entry: String },

    #[error("Invalid slot count {value:?} in slave entry {entry:?}")]
    InvalidSlots { entry: String, value: String },

    #[error("Invalid port {value:?} in slave entry {entry:?}")]
    InvalidPort { entry: String, value: String },

    #[error("Too many fields in slave entry {entry:?}, expected host[:slots[:port]]")]
    TooManyFields { entry: String },

    #[error("Slave {host} declared more than once")]
    DuplicateHost { host: String },
}

/// Errors raised by a channel to one slave.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to connect to {host}: {reason}")]
    ConnectFailed { host: String, reason: String },

    #[error("Failed to send to {host}: {reason}")]
    SendFailed { host: String, reason: String },

    #[error("Failed to receive from {host}: {reason}")]
    ReceiveFailed { host: String, reason: String },

    #[error("Channel to {host} is closed")]
    Closed { host: String },

    #[error("Protocol violation from {host}: {reason}")]
    Protocol { host: String, reason: String },

    #[error("Handshake rejected by {host}: {reason}")]
    HandshakeRejected { host: String, reason: String },

    #[error("Timed out talking to {host} after {timeout:?}")]
    Timeout { host: String, timeout: Duration },
}

/// Session-fatal conditions.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("No execution slot available: local parallelism is 0 and no slave registered")]
    NoCapacity,

    #[error("Session {id} has already been torn down")]
    TornDown { id: Uuid },
}

/// Errors from remote job dispatch.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Slaves must be registered before dispatching jobs")]
    NotRegistered,

    #[error("Session is shutting down, dispatch rejected")]
    SessionClosed,

    #[error("No remote slot free among {active} active slaves (admission control fault)")]
    NoFreeSlot { active: usize },

    #[error("Job {job_id} could not be sent to {host}: {source}")]
    SendFailed {
        host: String,
        job_id: Uuid,
        #[source]
        source: ChannelError,
    },
}

/// Job-related errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },
}

/// Result type alias for distbuild.
pub type Result<T> = std::result::Result<T, Error>;
