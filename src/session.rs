//! Build session: the context object every orchestration operation goes through.
//!
//! A session owns its slave registry, the channel connector, the project
//! path collaborator and a cancellation token. Nothing here is process-wide,
//! so several sessions can coexist (tests do this).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::capacity::CapacitySnapshot;
use crate::channel::{Channel, Connector, SlaveMessage};
use crate::config::{SLAVES_ENV, SessionConfig};
use crate::error::{Result, SessionError};
use crate::job::{Job, JobEvent};
use crate::paths::ProjectPaths;
use crate::slave::handshake::{close_within, register_slave};
use crate::slave::{WorkerInfo, WorkerRegistry, parse_slave_attribute, parse_slave_list};

/// Outcome of [`Session::register_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationReport {
    /// Slaves that became Active.
    pub activated: Vec<String>,
    /// Slaves left Unregistered, with the reason.
    pub failed: Vec<(String, String)>,
    /// Capacity after registration, local slots included.
    pub total_capacity: usize,
}

/// One build invocation's view of its slave pool.
pub struct Session {
    pub(crate) id: Uuid,
    pub(crate) project: String,
    pub(crate) config: SessionConfig,
    pub(crate) registry: Arc<WorkerRegistry>,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) paths: Arc<dyn ProjectPaths>,
    pub(crate) cancel: CancellationToken,
    pub(crate) torn_down: AtomicBool,
    events: Mutex<Option<mpsc::UnboundedReceiver<JobEvent>>>,
    pub(crate) listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Create a session for `project` with an empty registry.
    pub fn new(
        project: impl Into<String>,
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        paths: Arc<dyn ProjectPaths>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        let project = project.into();
        info!(session_id = %id, project = %project, local = config.local_parallelism, "Build session created");
        Self {
            id,
            project,
            registry: Arc::new(WorkerRegistry::new(config.local_parallelism, events_tx)),
            config,
            connector,
            paths,
            cancel: CancellationToken::new(),
            torn_down: AtomicBool::new(false),
            events: Mutex::new(Some(events_rx)),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Tie the session to a process shutdown token: cancelling it cancels the session.
    pub fn with_shutdown(mut self, shutdown: &CancellationToken) -> Self {
        self.cancel = shutdown.child_token();
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_torn_down() {
            return Err(SessionError::TornDown { id: self.id }.into());
        }
        Ok(())
    }

    // ── Declaration ─────────────────────────────────────────────────────

    /// Declare slaves from a `host[:slots[:port]],...` list.
    pub fn declare(&self, list: &str) -> Result<usize> {
        self.ensure_open()?;
        let decls = parse_slave_list(list, &self.config)?;
        Ok(self.registry.declare(decls)?)
    }

    /// Declare slaves from the project's remote slaves attribute.
    pub fn declare_attribute<S: AsRef<str>>(&self, values: &[S]) -> Result<usize> {
        self.ensure_open()?;
        let decls = parse_slave_attribute(values, &self.config)?;
        Ok(self.registry.declare(decls)?)
    }

    /// Declare slaves from `DISTBUILD_SLAVES`, if set.
    pub fn declare_from_env(&self) -> Result<usize> {
        match std::env::var(SLAVES_ENV) {
            Ok(list) => self.declare(&list),
            Err(_) => Ok(0),
        }
    }

    // ── Registration ────────────────────────────────────────────────────

    /// Connect every Unregistered slave, concurrently.
    ///
    /// A slave that fails to connect, handshake or sync is logged and left
    /// out. Fails only if the resulting total capacity is zero.
    pub async fn register_all(&self) -> Result<RegistrationReport> {
        self.ensure_open()?;
        let targets = self.registry.begin_registration();
        info!(slaves = targets.len(), "Registering slaves");

        let attempts = targets.into_iter().map(|target| {
            let dirs = self.paths.sync_dirs(&self.project);
            async move {
                let result = register_slave(
                    self.connector.as_ref(),
                    &target,
                    self.id,
                    &self.project,
                    dirs,
                    self.config.connect_timeout,
                    &self.cancel,
                )
                .await;
                let result = match result {
                    Ok(channel) => {
                        if self.registry.activate(&target.host, Arc::clone(&channel)) {
                            self.spawn_listener(target.host.clone(), channel);
                            Ok(())
                        } else {
                            close_within(channel.as_ref(), self.config.disconnect_timeout).await;
                            Err("session closing".to_string())
                        }
                    }
                    Err(e) => Err(e.to_string()),
                };
                if let Err(reason) = &result {
                    warn!(host = %target.host, error = %reason, "Slave registration failed, continuing without it");
                    self.registry.registration_failed(&target.host, reason);
                }
                (target.host, result)
            }
        });

        let mut report = RegistrationReport::default();
        for (host, result) in join_all(attempts).await {
            match result {
                Ok(()) => report.activated.push(host),
                Err(reason) => report.failed.push((host, reason)),
            }
        }

        let capacity = self.registry.capacity();
        report.total_capacity = capacity.total();
        info!(
            active = capacity.workers.len(),
            failed = report.failed.len(),
            total_capacity = report.total_capacity,
            "Slave registration finished"
        );
        if report.total_capacity == 0 {
            error!("No local or remote execution slot available, aborting session");
            return Err(SessionError::NoCapacity.into());
        }
        Ok(report)
    }

    fn spawn_listener(&self, host: String, channel: Arc<dyn Channel>) {
        let handle = tokio::spawn(listen(
            host,
            channel,
            Arc::clone(&self.registry),
            self.cancel.clone(),
            self.config.disconnect_timeout,
        ));
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|h| !h.is_finished());
        listeners.push(handle);
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// Channel of an Active slave; `None` for unknown or non-Active hosts.
    pub fn lookup_channel(&self, host: &str) -> Option<Arc<dyn Channel>> {
        self.registry.lookup_channel(host)
    }

    /// Local parallelism plus the slots of every Active slave.
    pub fn total_capacity(&self) -> usize {
        self.registry.capacity().total()
    }

    pub fn capacity(&self) -> CapacitySnapshot {
        self.registry.capacity()
    }

    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.registry.workers()
    }

    pub fn worker(&self, host: &str) -> Option<WorkerInfo> {
        self.registry.worker(host)
    }

    pub fn job(&self, job_id: Uuid) -> Option<Job> {
        self.registry.job(job_id)
    }

    /// Receiver of terminal job transitions. Available once.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<JobEvent>> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
        if !self.is_torn_down() {
            warn!(session_id = %self.id, "Session dropped without tearing down its slaves");
        }
    }
}

/// Read results from one slave until its channel ends or the session stops.
async fn listen(
    host: String,
    channel: Arc<dyn Channel>,
    registry: Arc<WorkerRegistry>,
    cancel: CancellationToken,
    close_limit: Duration,
) {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return,
            r = channel.recv() => r,
        };
        let reason = match received {
            Ok(Some(SlaveMessage::CompileResult { job_id, outcome })) => {
                match registry.finish_job(&host, job_id, outcome) {
                    Ok(event) => {
                        info!(host = %host, job_id = %job_id, state = %event.state, "Compile result received");
                    }
                    Err(e) => warn!(host = %host, error = %e, "Ignoring compile result"),
                }
                continue;
            }
            Ok(Some(other)) => format!("protocol violation: unexpected {}", other.kind()),
            Ok(None) => "connection closed by slave".to_string(),
            Err(e) => e.to_string(),
        };
        if let Some(channel) = registry.channel_lost(&host, &reason) {
            close_within(channel.as_ref(), close_limit).await;
        }
        return;
    }
}
