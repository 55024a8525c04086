//! End-of-session cleanup and slave disconnection.

use std::sync::PoisonError;
use std::sync::atomic::Ordering;

use futures::future::join_all;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::channel::SlaveMessage;
use crate::session::Session;
use crate::slave::handshake::close_within;

/// Outcome of [`Session::clean_up`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub delivered: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Outcome of [`Session::unregister_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Slaves moved to Closed by this call.
    pub closed: Vec<String>,
    /// Subset of `closed` that missed the disconnect deadline.
    pub forced: Vec<String>,
    /// The session had already been torn down; nothing was done.
    pub already_torn_down: bool,
}

impl Session {
    /// Ask every Active slave to delete the artifacts and synchronized
    /// sources of `project`. Connection states are left untouched.
    pub async fn clean_up(&self, project: &str) -> CleanupReport {
        let targets = self.registry.active_channels();
        let limit = self.config.cleanup_timeout;

        let requests = targets.into_iter().map(|(host, channel)| async move {
            let result = match timeout(
                limit,
                channel.send(SlaveMessage::CleanUp {
                    project: project.to_string(),
                }),
            )
            .await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("timed out after {limit:?}")),
            };
            (host, result)
        });

        let mut report = CleanupReport::default();
        for (host, result) in join_all(requests).await {
            match result {
                Ok(()) => {
                    debug!(host = %host, project = %project, "Cleanup requested");
                    report.delivered.push(host);
                }
                Err(reason) => {
                    warn!(host = %host, project = %project, error = %reason, "Cleanup request failed");
                    report.failed.push((host, reason));
                }
            }
        }
        info!(
            project = %project,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "Remote cleanup finished"
        );
        report
    }

    /// Disconnect and close every slave. Only the first call does any work.
    ///
    /// Each disconnect is bounded by the configured timeout (the shorter
    /// signal timeout when `from_signal`). A slave that misses it is closed
    /// locally under the same bound, so one slave never takes longer than
    /// twice the timeout. Slaves are handled concurrently.
    pub async fn unregister_all(&self, from_signal: bool) -> TeardownReport {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            debug!(session_id = %self.id, "Slaves already unregistered");
            return TeardownReport {
                already_torn_down: true,
                ..TeardownReport::default()
            };
        }

        // Stops listeners and in-flight registrations, rejects new dispatch.
        self.cancel.cancel();
        let draining = self.registry.begin_teardown();
        let limit = self.config.teardown_timeout(from_signal);
        info!(slaves = draining.len(), from_signal, timeout = ?limit, "Unregistering slaves");

        let disconnects = draining.into_iter().map(|(host, channel)| async move {
            let Some(channel) = channel else {
                return (host, true);
            };
            let graceful = timeout(limit, async {
                if let Err(e) = channel.send(SlaveMessage::Disconnect).await {
                    debug!(host = %channel.peer(), error = %e, "Disconnect notification not delivered");
                }
                channel.close().await;
            })
            .await
            .is_ok();
            if !graceful && !close_within(channel.as_ref(), limit).await {
                warn!(host = %host, "Forced close did not complete, dropping channel");
            }
            (host, graceful)
        });

        let mut report = TeardownReport::default();
        for (host, graceful) in join_all(disconnects).await {
            if !graceful {
                warn!(host = %host, timeout = ?limit, "Slave unresponsive, closed locally");
                report.forced.push(host.clone());
            }
            self.registry.finish_teardown(&host);
            report.closed.push(host);
        }

        for handle in self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            handle.abort();
        }

        info!(
            closed = report.closed.len(),
            forced = report.forced.len(),
            "Slaves unregistered"
        );
        report
    }
}
