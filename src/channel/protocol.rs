//! Messages exchanged with a compilation slave.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::paths::DirKind;

/// Protocol revision announced in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Everything a slave needs to compile one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileRequest {
    /// Project the unit belongs to.
    pub project: String,
    /// Source language, e.g. `"c"` or `"ada"`.
    pub language: String,
    /// Compiler command-line options, source file included.
    pub options: Vec<String>,
    /// Object file the compiler produces.
    pub obj_name: String,
    /// Dependency file the compiler produces.
    pub dep_name: String,
    /// Environment overrides for the compiler process.
    pub env: Vec<(String, String)>,
}

impl CompileRequest {
    pub fn new(
        project: impl Into<String>,
        language: impl Into<String>,
        obj_name: impl Into<String>,
        dep_name: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            language: language.into(),
            options: Vec::new(),
            obj_name: obj_name.into(),
            dep_name: dep_name.into(),
            env: Vec::new(),
        }
    }

    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Result of a remote compilation as reported by the slave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded {
        /// Artifacts written back (object and dependency files).
        artifacts: Vec<String>,
        /// Compiler output.
        #[serde(default)]
        output: String,
    },
    Failed {
        reason: String,
        #[serde(default)]
        output: String,
    },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    pub(crate) fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
            output: String::new(),
        }
    }
}

/// A message on a slave channel, in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SlaveMessage {
    Handshake {
        session_id: Uuid,
        project: String,
        protocol_version: u32,
        slots: usize,
    },
    HandshakeAck {
        accepted: bool,
        #[serde(default)]
        reason: Option<String>,
    },
    SyncDirectory {
        project: String,
        path: PathBuf,
        kind: DirKind,
    },
    SyncComplete {
        project: String,
        count: usize,
    },
    SyncAck,
    CompileRequest {
        job_id: Uuid,
        request: CompileRequest,
    },
    CompileResult {
        job_id: Uuid,
        outcome: JobOutcome,
    },
    CleanUp {
        project: String,
    },
    Disconnect,
}

impl SlaveMessage {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => "handshake",
            Self::HandshakeAck { .. } => "handshake_ack",
            Self::SyncDirectory { .. } => "sync_directory",
            Self::SyncComplete { .. } => "sync_complete",
            Self::SyncAck => "sync_ack",
            Self::CompileRequest { .. } => "compile_request",
            Self::CompileResult { .. } => "compile_result",
            Self::CleanUp { .. } => "clean_up",
            Self::Disconnect => "disconnect",
        }
    }
}
