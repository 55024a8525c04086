//! Per-slave registration protocol: connect, handshake, push source
//! directories.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::channel::{Channel, Connector, PROTOCOL_VERSION, SlaveMessage};
use crate::error::ChannelError;
use crate::paths::SyncDirs;
use crate::slave::registry::RegistrationTarget;

/// Connect to `target` and bring it to the point where it accepts jobs.
///
/// The whole exchange is bounded by `limit` and abandoned when `cancel`
/// fires. On any failure after the connect, the channel is closed before
/// returning.
pub async fn register_slave(
    connector: &dyn Connector,
    target: &RegistrationTarget,
    session_id: Uuid,
    project: &str,
    dirs: SyncDirs,
    limit: Duration,
    cancel: &CancellationToken,
) -> Result<Arc<dyn Channel>, ChannelError> {
    let deadline = Instant::now() + limit;
    let timed_out = || ChannelError::Timeout {
        host: target.host.clone(),
        timeout: limit,
    };
    let cancelled = || ChannelError::Closed {
        host: target.host.clone(),
    };

    let connected = tokio::select! {
        r = timeout_at(deadline, connector.connect(&target.host, target.port)) => {
            r.map_err(|_| timed_out())
        }
        _ = cancel.cancelled() => Err(cancelled()),
    };
    let channel = connected??;

    let outcome = tokio::select! {
        r = timeout_at(
            deadline,
            handshake(channel.as_ref(), target, session_id, project, dirs),
        ) => r.unwrap_or_else(|_| Err(timed_out())),
        _ = cancel.cancelled() => Err(cancelled()),
    };
    match outcome {
        Ok(()) => Ok(channel),
        Err(e) => {
            close_within(channel.as_ref(), limit).await;
            Err(e)
        }
    }
}

async fn handshake(
    channel: &dyn Channel,
    target: &RegistrationTarget,
    session_id: Uuid,
    project: &str,
    dirs: SyncDirs,
) -> Result<(), ChannelError> {
    channel
        .send(SlaveMessage::Handshake {
            session_id,
            project: project.to_string(),
            protocol_version: PROTOCOL_VERSION,
            slots: target.slots,
        })
        .await?;

    match channel.recv().await? {
        Some(SlaveMessage::HandshakeAck { accepted: true, .. }) => {}
        Some(SlaveMessage::HandshakeAck {
            accepted: false,
            reason,
        }) => {
            return Err(ChannelError::HandshakeRejected {
                host: target.host.clone(),
                reason: reason.unwrap_or_else(|| "no reason given".to_string()),
            });
        }
        Some(other) => return Err(unexpected(&target.host, "handshake_ack", &other)),
        None => {
            return Err(ChannelError::Closed {
                host: target.host.clone(),
            });
        }
    }

    let mut count = 0;
    for entry in dirs {
        channel
            .send(SlaveMessage::SyncDirectory {
                project: project.to_string(),
                path: entry.path,
                kind: entry.kind,
            })
            .await?;
        count += 1;
    }
    channel
        .send(SlaveMessage::SyncComplete {
            project: project.to_string(),
            count,
        })
        .await?;

    match channel.recv().await? {
        Some(SlaveMessage::SyncAck) => {
            debug!(host = %target.host, directories = count, "Sources synchronized");
            Ok(())
        }
        Some(other) => Err(unexpected(&target.host, "sync_ack", &other)),
        None => Err(ChannelError::Closed {
            host: target.host.clone(),
        }),
    }
}

fn unexpected(host: &str, expected: &str, got: &SlaveMessage) -> ChannelError {
    ChannelError::Protocol {
        host: host.to_string(),
        reason: format!("expected {expected}, got {}", got.kind()),
    }
}

/// Close `channel`, giving up after `limit`. Returns false on timeout.
pub(crate) async fn close_within(channel: &dyn Channel, limit: Duration) -> bool {
    tokio::time::timeout(limit, channel.close()).await.is_ok()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::channel::{MockBehavior, MockConnector};
    use crate::paths::DirSpec;

    fn target(host: &str) -> RegistrationTarget {
        RegistrationTarget {
            host: host.to_string(),
            port: 8484,
            slots: 2,
        }
    }

    fn dirs() -> SyncDirs {
        SyncDirs::new(vec![
            DirSpec::source("src"),
            DirSpec::object(PathBuf::from("obj")),
        ])
    }

    #[tokio::test]
    async fn pushes_every_directory_then_completes() {
        let connector = MockConnector::new();
        let slave = connector.slave("alpha", MockBehavior::healthy());

        let channel = register_slave(
            &connector,
            &target("alpha"),
            Uuid::new_v4(),
            "demo",
            dirs(),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(channel.peer(), "alpha");

        let kinds: Vec<&str> = slave.sent().iter().map(SlaveMessage::kind).collect();
        assert_eq!(
            kinds,
            vec!["handshake", "sync_directory", "sync_directory", "sync_complete"]
        );
        assert!(matches!(
            slave.sent().last(),
            Some(SlaveMessage::SyncComplete { count: 2, .. })
        ));
    }

    #[tokio::test]
    async fn rejected_handshake_closes_channel() {
        let connector = MockConnector::new();
        let slave = connector.slave("alpha", MockBehavior::rejecting());

        let err = register_slave(
            &connector,
            &target("alpha"),
            Uuid::new_v4(),
            "demo",
            dirs(),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, ChannelError::HandshakeRejected { .. }));
        assert!(slave.is_closed());
        assert_eq!(slave.count("sync_directory"), 0);
    }

    #[tokio::test]
    async fn slow_connect_times_out() {
        let connector = MockConnector::new();
        connector.slave(
            "slow",
            MockBehavior::healthy().with_connect_delay(Duration::from_secs(5)),
        );

        let started = std::time::Instant::now();
        let err = register_slave(
            &connector,
            &target("slow"),
            Uuid::new_v4(),
            "demo",
            SyncDirs::empty(),
            Duration::from_millis(50),
            &CancellationToken::new(),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, ChannelError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn cancelled_mid_handshake_closes_channel() {
        let connector = MockConnector::new();
        let slave = connector.slave("stuck", MockBehavior::healthy().hanging_on("sync_complete"));
        let cancel = CancellationToken::new();

        let registration = {
            let connector = connector.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                register_slave(
                    &connector,
                    &target("stuck"),
                    Uuid::new_v4(),
                    "demo",
                    SyncDirs::empty(),
                    Duration::from_secs(5),
                    &cancel,
                )
                .await
                .map(|_| ())
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(slave.connects(), 1);
        assert!(!slave.is_closed());

        cancel.cancel();
        let err = tokio::time::timeout(Duration::from_secs(1), registration)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ChannelError::Closed { .. }));
        assert!(slave.is_closed());
    }
}
