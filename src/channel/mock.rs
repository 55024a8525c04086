//! In-memory slaves with scripted behaviour, for tests and dry runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

use crate::channel::{Channel, Connector, JobOutcome, SlaveMessage};
use crate::error::ChannelError;

/// How a mock slave reacts to the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    /// Fail the connect outright.
    pub refuse_connect: bool,
    /// Answer the handshake with `accepted: false`.
    pub reject_handshake: bool,
    /// Answer every compile request with a successful result.
    pub auto_complete: bool,
    /// Delay before the connect resolves.
    pub connect_delay: Option<Duration>,
    /// Message kinds (see [`SlaveMessage::kind`]) whose `send` never returns.
    pub hang_on: Vec<&'static str>,
}

impl MockBehavior {
    pub fn healthy() -> Self {
        Self::default()
    }

    pub fn refusing() -> Self {
        Self {
            refuse_connect: true,
            ..Self::default()
        }
    }

    pub fn rejecting() -> Self {
        Self {
            reject_handshake: true,
            ..Self::default()
        }
    }

    pub fn auto_completing(mut self) -> Self {
        self.auto_complete = true;
        self
    }

    pub fn hanging_on(mut self, kind: &'static str) -> Self {
        self.hang_on.push(kind);
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }
}

enum Inbound {
    Message(SlaveMessage),
    Hangup,
    Error(String),
}

struct SlaveShared {
    host: String,
    behavior: MockBehavior,
    sent: StdMutex<Vec<SlaveMessage>>,
    inbox: StdMutex<Option<mpsc::UnboundedSender<Inbound>>>,
    connects: AtomicUsize,
    closed: AtomicBool,
}

impl SlaveShared {
    fn push(&self, inbound: Inbound) -> bool {
        self.inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|tx| tx.send(inbound).is_ok())
    }
}

/// Test-side handle on one mock slave.
#[derive(Clone)]
pub struct MockSlave {
    shared: Arc<SlaveShared>,
}

impl MockSlave {
    pub fn host(&self) -> &str {
        &self.shared.host
    }

    /// Every message the orchestrator sent, in order.
    pub fn sent(&self) -> Vec<SlaveMessage> {
        self.shared
            .sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of sent messages of the given kind.
    pub fn count(&self, kind: &str) -> usize {
        self.sent().iter().filter(|m| m.kind() == kind).count()
    }

    /// Job ids of every compile request received.
    pub fn compile_requests(&self) -> Vec<Uuid> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m {
                SlaveMessage::CompileRequest { job_id, .. } => Some(job_id),
                _ => None,
            })
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Whether the orchestrator closed the channel.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Push a message to the orchestrator. Returns false when no channel is open.
    pub fn deliver(&self, message: SlaveMessage) -> bool {
        self.shared.push(Inbound::Message(message))
    }

    /// Report a compile result for `job_id`.
    pub fn complete(&self, job_id: Uuid, outcome: JobOutcome) -> bool {
        self.deliver(SlaveMessage::CompileResult { job_id, outcome })
    }

    /// Simulate the slave hanging up.
    pub fn drop_connection(&self) -> bool {
        self.shared.push(Inbound::Hangup)
    }

    /// Simulate a transport error on the receive side.
    pub fn break_connection(&self, reason: impl Into<String>) -> bool {
        self.shared.push(Inbound::Error(reason.into()))
    }
}

/// Connector handing out channels to scripted in-memory slaves.
#[derive(Default, Clone)]
pub struct MockConnector {
    slaves: Arc<StdMutex<HashMap<String, MockSlave>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the slave answering on `host`.
    pub fn slave(&self, host: &str, behavior: MockBehavior) -> MockSlave {
        let slave = MockSlave {
            shared: Arc::new(SlaveShared {
                host: host.to_string(),
                behavior,
                sent: StdMutex::new(Vec::new()),
                inbox: StdMutex::new(None),
                connects: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        };
        self.slaves
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host.to_string(), slave.clone());
        slave
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, host: &str, _port: u16) -> Result<Arc<dyn Channel>, ChannelError> {
        let slave = self
            .slaves
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(host)
            .cloned()
            .ok_or_else(|| ChannelError::ConnectFailed {
                host: host.to_string(),
                reason: "unknown host".to_string(),
            })?;

        if let Some(delay) = slave.shared.behavior.connect_delay {
            tokio::time::sleep(delay).await;
        }
        let generation = slave.shared.connects.fetch_add(1, Ordering::SeqCst) + 1;
        if slave.shared.behavior.refuse_connect {
            return Err(ChannelError::ConnectFailed {
                host: host.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *slave
            .shared
            .inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx.clone());
        slave.shared.closed.store(false, Ordering::SeqCst);

        Ok(Arc::new(MockChannel {
            shared: Arc::clone(&slave.shared),
            generation,
            tx,
            inbox: Mutex::new(rx),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MockChannel {
    shared: Arc<SlaveShared>,
    /// Connect count when this channel was opened; a reconnect supersedes it.
    generation: usize,
    tx: mpsc::UnboundedSender<Inbound>,
    inbox: Mutex<mpsc::UnboundedReceiver<Inbound>>,
    closed: AtomicBool,
}

impl MockChannel {
    fn reply_to(&self, message: &SlaveMessage) {
        let behavior = &self.shared.behavior;
        let reply = match message {
            SlaveMessage::Handshake { .. } => Some(SlaveMessage::HandshakeAck {
                accepted: !behavior.reject_handshake,
                reason: behavior
                    .reject_handshake
                    .then(|| "protocol mismatch".to_string()),
            }),
            SlaveMessage::SyncComplete { .. } => Some(SlaveMessage::SyncAck),
            SlaveMessage::CompileRequest { job_id, request } if behavior.auto_complete => {
                Some(SlaveMessage::CompileResult {
                    job_id: *job_id,
                    outcome: JobOutcome::Succeeded {
                        artifacts: vec![request.obj_name.clone(), request.dep_name.clone()],
                        output: String::new(),
                    },
                })
            }
            _ => None,
        };
        if let Some(reply) = reply {
            let _ = self.tx.send(Inbound::Message(reply));
        }
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn peer(&self) -> &str {
        &self.shared.host
    }

    async fn send(&self, message: SlaveMessage) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed {
                host: self.shared.host.clone(),
            });
        }
        if self.shared.behavior.hang_on.contains(&message.kind()) {
            std::future::pending::<()>().await;
        }
        self.shared
            .sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());
        self.reply_to(&message);
        Ok(())
    }

    async fn recv(&self) -> Result<Option<SlaveMessage>, ChannelError> {
        match self.inbox.lock().await.recv().await {
            Some(Inbound::Message(message)) => Ok(Some(message)),
            Some(Inbound::Error(reason)) => Err(ChannelError::ReceiveFailed {
                host: self.shared.host.clone(),
                reason,
            }),
            Some(Inbound::Hangup) | None => Ok(None),
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(Inbound::Hangup);
        if self.shared.connects.load(Ordering::SeqCst) == self.generation {
            self.shared.closed.store(true, Ordering::SeqCst);
        }
    }
}
