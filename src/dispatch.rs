//! Remote job dispatch.
//!
//! The caller's admission control guarantees a free slot before calling
//! [`Session::run`]; dispatch itself never waits for one.

use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::capacity::WorkerCapacity;
use crate::channel::{CompileRequest, SlaveMessage};
use crate::error::{ChannelError, DispatchError};
use crate::session::Session;
use crate::slave::Reservation;
use crate::slave::handshake::close_within;

/// Index of the candidate with a free slot and the fewest outstanding jobs.
/// Ties go to the earliest candidate (declaration order).
pub fn select_least_loaded(candidates: &[WorkerCapacity]) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .filter(|(_, w)| w.free() > 0)
        .min_by_key(|(idx, w)| (w.outstanding, *idx))
        .map(|(idx, _)| idx)
}

impl Session {
    /// Send `request` to the least-loaded Active slave with a free slot.
    ///
    /// Returns as soon as the request is on the wire; the result arrives
    /// later as a [`crate::job::JobEvent`].
    pub async fn run(&self, request: CompileRequest) -> Result<Uuid, DispatchError> {
        if self.cancel.is_cancelled() {
            return Err(DispatchError::SessionClosed);
        }

        let Reservation {
            job_id,
            host,
            channel,
        } = match self.registry.reserve(request.clone()) {
            Ok(reservation) => reservation,
            Err(e @ DispatchError::NoFreeSlot { .. }) => {
                error!(error = %e, obj = %request.obj_name, "Dispatch without a free remote slot");
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let obj_name = request.obj_name.clone();
        let limit = self.config.send_timeout;
        let sent = match timeout(
            limit,
            channel.send(SlaveMessage::CompileRequest { job_id, request }),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout {
                host: host.clone(),
                timeout: limit,
            }),
        };

        match sent {
            Ok(()) => {
                self.registry.mark_running(job_id);
                info!(host = %host, job_id = %job_id, obj = %obj_name, "Job dispatched");
                Ok(job_id)
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(host = %host, job_id = %job_id, error = %reason, "Failed to send compile request");
                if let Err(err) = self.registry.abandon_job(job_id, &reason) {
                    warn!(job_id = %job_id, error = %err, "Could not mark job failed");
                }
                if let Some(lost) = self.registry.channel_lost(&host, &reason) {
                    close_within(lost.as_ref(), self.config.disconnect_timeout).await;
                }
                Err(DispatchError::SendFailed {
                    host,
                    job_id,
                    source: e,
                })
            }
        }
    }
}
