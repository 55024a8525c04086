//! Session-scoped registry of slaves and the jobs dispatched to them.
//!
//! All mutable state sits behind one lock so that the capacity check and the
//! slot increment of a dispatch happen atomically. The lock is never held
//! across an await point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capacity::{CapacitySnapshot, WorkerCapacity};
use crate::channel::{Channel, CompileRequest, JobOutcome};
use crate::dispatch::select_least_loaded;
use crate::error::{DeclarationError, DispatchError, JobError};
use crate::job::{Job, JobEvent, JobState};
use crate::slave::declare::SlaveDecl;
use crate::slave::state::WorkerState;
use crate::slave::worker::{Worker, WorkerInfo};

/// A slave picked for registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationTarget {
    pub host: String,
    pub port: u16,
    pub slots: usize,
}

/// A slot reserved on a slave by [`WorkerRegistry::reserve`].
pub struct Reservation {
    pub job_id: Uuid,
    pub host: String,
    pub channel: Arc<dyn Channel>,
}

#[derive(Default)]
struct RegistryState {
    /// Declaration order; used as the dispatch tie-break.
    workers: Vec<Worker>,
    index: HashMap<String, usize>,
    jobs: HashMap<Uuid, Job>,
    registered: bool,
    closing: bool,
}

impl RegistryState {
    fn worker_mut(&mut self, host: &str) -> Option<&mut Worker> {
        let idx = *self.index.get(host)?;
        self.workers.get_mut(idx)
    }

    fn worker(&self, host: &str) -> Option<&Worker> {
        self.workers.get(*self.index.get(host)?)
    }

    /// Fail every unfinished job on `host`; returns the events to publish.
    fn fail_jobs_on(&mut self, host: &str, reason: &str) -> Vec<JobEvent> {
        let mut events = Vec::new();
        for job in self.jobs.values_mut() {
            if job.host == host && !job.state.is_terminal() {
                if let Err(e) = job.finish(JobOutcome::failed(reason)) {
                    warn!(job_id = %job.id, error = %e, "Failed to fail job");
                    continue;
                }
                events.extend(JobEvent::from_job(job));
            }
        }
        events
    }
}

/// Declared and connected slaves for one build session.
pub struct WorkerRegistry {
    local_parallelism: usize,
    state: Mutex<RegistryState>,
    events: mpsc::UnboundedSender<JobEvent>,
}

impl WorkerRegistry {
    /// Create an empty registry publishing terminal job transitions on `events`.
    pub fn new(local_parallelism: usize, events: mpsc::UnboundedSender<JobEvent>) -> Self {
        Self {
            local_parallelism,
            state: Mutex::new(RegistryState::default()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, events: Vec<JobEvent>) {
        for event in events {
            // The driver may have dropped its receiver; job state stays queryable.
            let _ = self.events.send(event);
        }
    }

    pub fn local_parallelism(&self) -> usize {
        self.local_parallelism
    }

    /// Add declared slaves in state Unregistered. All-or-nothing.
    pub fn declare(&self, decls: Vec<SlaveDecl>) -> Result<usize, DeclarationError> {
        let mut state = self.lock();
        if let Some(dup) = decls.iter().find(|d| state.index.contains_key(&d.host)) {
            return Err(DeclarationError::DuplicateHost {
                host: dup.host.clone(),
            });
        }
        let count = decls.len();
        for decl in decls {
            info!(host = %decl.host, slots = decl.slots, port = decl.port, "Slave declared");
            let idx = state.workers.len();
            state.index.insert(decl.host.clone(), idx);
            state.workers.push(Worker::new(decl));
        }
        Ok(count)
    }

    /// Move every Unregistered slave to Registering and return them.
    pub fn begin_registration(&self) -> Vec<RegistrationTarget> {
        let mut state = self.lock();
        state.registered = true;
        if state.closing {
            return Vec::new();
        }
        let mut targets = Vec::new();
        for worker in state
            .workers
            .iter_mut()
            .filter(|w| w.state == WorkerState::Unregistered)
        {
            if worker.transition_to(WorkerState::Registering, None).is_ok() {
                targets.push(RegistrationTarget {
                    host: worker.host.clone(),
                    port: worker.port,
                    slots: worker.slots,
                });
            }
        }
        targets
    }

    /// Registering → Active. Returns false when the session started closing
    /// meanwhile; the caller then owns and must close `channel`.
    pub fn activate(&self, host: &str, channel: Arc<dyn Channel>) -> bool {
        let mut state = self.lock();
        if state.closing {
            return false;
        }
        let Some(worker) = state.worker_mut(host) else {
            return false;
        };
        if worker.transition_to(WorkerState::Active, None).is_err() {
            return false;
        }
        worker.channel = Some(channel);
        worker.last_error = None;
        info!(host = %host, slots = worker.slots, "Slave active");
        true
    }

    /// Registering → Unregistered after a failed connect or handshake.
    pub fn registration_failed(&self, host: &str, reason: &str) {
        let mut state = self.lock();
        if let Some(worker) = state.worker_mut(host)
            && worker.state == WorkerState::Registering
        {
            let _ = worker.transition_to(WorkerState::Unregistered, Some(reason.to_string()));
            worker.last_error = Some(reason.to_string());
        }
    }

    /// Channel of an Active slave; `None` for unknown or non-Active hosts.
    pub fn lookup_channel(&self, host: &str) -> Option<Arc<dyn Channel>> {
        let state = self.lock();
        state
            .worker(host)
            .filter(|w| w.state.is_active())
            .and_then(|w| w.channel.clone())
    }

    /// Channels of all Active slaves, in declaration order.
    pub fn active_channels(&self) -> Vec<(String, Arc<dyn Channel>)> {
        let state = self.lock();
        state
            .workers
            .iter()
            .filter(|w| w.state.is_active())
            .filter_map(|w| Some((w.host.clone(), w.channel.clone()?)))
            .collect()
    }

    pub fn is_registered(&self) -> bool {
        self.lock().registered
    }

    pub fn capacity(&self) -> CapacitySnapshot {
        let state = self.lock();
        CapacitySnapshot {
            local: self.local_parallelism,
            workers: state
                .workers
                .iter()
                .filter(|w| w.state.is_active())
                .map(|w| WorkerCapacity {
                    host: w.host.clone(),
                    slots: w.slots,
                    outstanding: w.outstanding,
                })
                .collect(),
        }
    }

    pub fn worker(&self, host: &str) -> Option<WorkerInfo> {
        self.lock().worker(host).map(Worker::info)
    }

    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.lock().workers.iter().map(Worker::info).collect()
    }

    pub fn job(&self, job_id: Uuid) -> Option<Job> {
        self.lock().jobs.get(&job_id).cloned()
    }

    /// Pick a slave with a free slot, take the slot and create a Queued job.
    pub fn reserve(&self, request: CompileRequest) -> Result<Reservation, DispatchError> {
        let mut state = self.lock();
        if state.closing {
            return Err(DispatchError::SessionClosed);
        }
        if !state.registered {
            return Err(DispatchError::NotRegistered);
        }

        let active: Vec<(usize, WorkerCapacity)> = state
            .workers
            .iter()
            .enumerate()
            .filter(|(_, w)| w.state.is_active() && w.channel.is_some())
            .map(|(idx, w)| {
                (
                    idx,
                    WorkerCapacity {
                        host: w.host.clone(),
                        slots: w.slots,
                        outstanding: w.outstanding,
                    },
                )
            })
            .collect();
        let candidates: Vec<WorkerCapacity> = active.iter().map(|(_, c)| c.clone()).collect();
        let Some(pick) = select_least_loaded(&candidates) else {
            return Err(DispatchError::NoFreeSlot {
                active: active.len(),
            });
        };

        let worker = &mut state.workers[active[pick].0];
        let Some(channel) = worker.channel.clone() else {
            return Err(DispatchError::NoFreeSlot {
                active: active.len(),
            });
        };
        debug_assert!(
            worker.outstanding < worker.slots,
            "dispatch would overcommit slave {}",
            worker.host
        );
        worker.outstanding += 1;
        let host = worker.host.clone();
        let outstanding = worker.outstanding;

        let job = Job::new(host.clone(), request);
        let job_id = job.id;
        state.jobs.insert(job_id, job);
        debug!(host = %host, job_id = %job_id, outstanding, "Slot reserved");

        Ok(Reservation {
            job_id,
            host,
            channel,
        })
    }

    /// Queued → Running once the request has been handed to the channel.
    pub fn mark_running(&self, job_id: Uuid) {
        let mut state = self.lock();
        if let Some(job) = state.jobs.get_mut(&job_id)
            && job.state == JobState::Queued
        {
            let _ = job.transition_to(JobState::Running);
        }
    }

    /// Record the result reported by `host` for `job_id` and release its slot.
    pub fn finish_job(
        &self,
        host: &str,
        job_id: Uuid,
        outcome: JobOutcome,
    ) -> Result<JobEvent, JobError> {
        let event = self.finish(Some(host), job_id, outcome)?;
        self.publish(vec![event.clone()]);
        Ok(event)
    }

    /// Fail a job whose request never reached its slave. Not published: the
    /// caller reports it through its own return value.
    pub fn abandon_job(&self, job_id: Uuid, reason: &str) -> Result<(), JobError> {
        self.finish(None, job_id, JobOutcome::failed(reason))
            .map(|_| ())
    }

    fn finish(
        &self,
        host: Option<&str>,
        job_id: Uuid,
        outcome: JobOutcome,
    ) -> Result<JobEvent, JobError> {
        let mut state = self.lock();
        let job = state
            .jobs
            .get_mut(&job_id)
            .filter(|j| host.is_none_or(|h| j.host == h))
            .ok_or(JobError::NotFound { id: job_id })?;

        let from = job.state;
        job.finish(outcome).map_err(|_| JobError::InvalidTransition {
            id: job_id,
            state: from.to_string(),
            target: "finished".to_string(),
        })?;
        let event = JobEvent::from_job(job).ok_or(JobError::NotFound { id: job_id })?;
        let job_host = job.host.clone();

        if let Some(worker) = state.worker_mut(&job_host)
            && worker.state.is_active()
        {
            worker.outstanding = worker.outstanding.saturating_sub(1);
        }
        debug!(host = %job_host, job_id = %job_id, state = %event.state, "Job finished");
        Ok(event)
    }

    /// Active → Unregistered after a channel failure. Fails the slave's
    /// unfinished jobs and returns the channel for the caller to close.
    pub fn channel_lost(&self, host: &str, reason: &str) -> Option<Arc<dyn Channel>> {
        let (channel, events) = {
            let mut state = self.lock();
            let worker = state.worker_mut(host)?;
            if !worker.state.is_active() {
                return None;
            }
            let _ = worker.transition_to(WorkerState::Unregistered, Some(reason.to_string()));
            worker.last_error = Some(reason.to_string());
            let channel = worker.channel.take();
            let events = state.fail_jobs_on(host, reason);
            (channel, events)
        };
        warn!(host = %host, reason = %reason, failed_jobs = events.len(), "Slave lost");
        self.publish(events);
        channel
    }

    /// Start teardown: refuse further dispatch and registration, move Active
    /// slaves to Draining and everything else straight to Closed.
    ///
    /// Returns the Draining slaves with their channels.
    pub fn begin_teardown(&self) -> Vec<(String, Option<Arc<dyn Channel>>)> {
        let (draining, events) = {
            let mut state = self.lock();
            state.closing = true;
            let mut draining = Vec::new();
            let mut hosts_with_jobs = Vec::new();
            for worker in state.workers.iter_mut() {
                match worker.state {
                    WorkerState::Active => {
                        if worker.outstanding > 0 {
                            hosts_with_jobs.push(worker.host.clone());
                        }
                        let _ = worker.transition_to(
                            WorkerState::Draining,
                            Some("session teardown".to_string()),
                        );
                        draining.push((worker.host.clone(), worker.channel.take()));
                    }
                    WorkerState::Unregistered | WorkerState::Registering => {
                        let _ = worker.transition_to(
                            WorkerState::Closed,
                            Some("session teardown".to_string()),
                        );
                    }
                    WorkerState::Draining | WorkerState::Closed => {}
                }
            }
            let mut events = Vec::new();
            for host in hosts_with_jobs {
                events.extend(state.fail_jobs_on(&host, "session torn down"));
            }
            (draining, events)
        };
        self.publish(events);
        draining
    }

    /// Draining → Closed.
    pub fn finish_teardown(&self, host: &str) {
        let mut state = self.lock();
        if let Some(worker) = state.worker_mut(host)
            && worker.state == WorkerState::Draining
        {
            let _ = worker.transition_to(WorkerState::Closed, None);
        }
    }
}
