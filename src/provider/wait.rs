//! Bounded polling until a provider resource reaches a target state.
//!
//! Every waiter takes the sleeper so tests can run timeout scenarios
//! without real waiting. Terminal provider states (`error`, an unexpected
//! `terminated`) fail fast instead of burning the whole deadline.

use std::time::{Duration, Instant};

use log::{debug, info};
use thiserror::Error;

use crate::retry::Sleeper;

use super::{
    CloudProvider, DiskState, ImageState, InstanceInfo, InstanceState, ProviderError,
    SnapshotState,
};

/// Interval between instance state checks.
pub const INSTANCE_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Interval between snapshot/image state checks.
pub const SNAPSHOT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Default budget for any single wait.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(600);

/// Errors raised while waiting on resource state.
#[derive(Debug, Error)]
pub enum WaitError {
    /// Raised when the deadline passes before the target state is reached.
    #[error("timed out waiting for {resource_id} to reach state {target}")]
    Timeout {
        /// Resource being waited on.
        resource_id: String,
        /// State that was never reached.
        target: String,
    },
    /// Raised when the resource enters a state it cannot leave.
    #[error("{resource_id} entered terminal state {state}, cannot proceed")]
    TerminalState {
        /// Resource being waited on.
        resource_id: String,
        /// The dead-end state observed.
        state: String,
    },
    /// Raised when the provider call itself fails.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Polls until the instance reaches `target`.
///
/// # Errors
///
/// Returns [`WaitError::TerminalState`] when the instance lands in `error`,
/// or in `terminated` while some other state was wanted;
/// [`WaitError::Timeout`] when the budget expires.
pub async fn wait_for_instance(
    provider: &dyn CloudProvider,
    sleeper: &dyn Sleeper,
    instance_id: &str,
    target: InstanceState,
    timeout: Duration,
) -> Result<InstanceInfo, WaitError> {
    debug!("waiting for {instance_id} to reach {target}, timeout {timeout:?}");
    let deadline = Instant::now() + timeout;
    while Instant::now() <= deadline {
        let instance = provider.get_instance(instance_id).await?;
        debug!("instance {instance_id} state={}", instance.state);
        if instance.state == target {
            return Ok(instance);
        }
        if instance.state == InstanceState::Error {
            return Err(WaitError::TerminalState {
                resource_id: instance_id.to_owned(),
                state: instance.state.to_string(),
            });
        }
        if target != InstanceState::Terminated && instance.state == InstanceState::Terminated {
            return Err(WaitError::TerminalState {
                resource_id: instance_id.to_owned(),
                state: instance.state.to_string(),
            });
        }
        sleeper.sleep(INSTANCE_POLL_INTERVAL).await;
    }
    Err(WaitError::Timeout {
        resource_id: instance_id.to_owned(),
        target: target.to_string(),
    })
}

/// Polls until every snapshot completes.
///
/// Progress is logged periodically so long copies do not look hung.
///
/// # Errors
///
/// Returns [`WaitError::TerminalState`] when any snapshot errors and
/// [`WaitError::Timeout`] when the budget expires first.
pub async fn wait_for_snapshots(
    provider: &dyn CloudProvider,
    sleeper: &dyn Sleeper,
    snapshot_ids: &[String],
    timeout: Duration,
) -> Result<(), WaitError> {
    debug!("waiting for snapshots {snapshot_ids:?}");
    let deadline = Instant::now() + timeout;
    let mut polls: u32 = 0;
    while Instant::now() <= deadline {
        let mut done = true;
        let mut progress = Vec::with_capacity(snapshot_ids.len());
        for id in snapshot_ids {
            let snapshot = provider.get_snapshot(id).await?;
            if snapshot.state == SnapshotState::Error {
                return Err(WaitError::TerminalState {
                    resource_id: id.clone(),
                    state: String::from("error"),
                });
            }
            if snapshot.state != SnapshotState::Completed {
                done = false;
            }
            progress.push(format!("{id}: {}%", snapshot.progress));
        }
        if done {
            return Ok(());
        }
        polls = polls.saturating_add(1);
        if polls.is_multiple_of(12) {
            info!("snapshot progress: {}", progress.join(", "));
        }
        sleeper.sleep(SNAPSHOT_POLL_INTERVAL).await;
    }
    Err(WaitError::Timeout {
        resource_id: snapshot_ids.join(", "),
        target: String::from("completed"),
    })
}

/// Polls until the image becomes available.
///
/// A `NotFound` immediately after registration is eventual consistency and
/// is tolerated until the deadline.
///
/// # Errors
///
/// Returns [`WaitError::TerminalState`] when registration fails and
/// [`WaitError::Timeout`] when the budget expires first.
pub async fn wait_for_image(
    provider: &dyn CloudProvider,
    sleeper: &dyn Sleeper,
    image_id: &str,
    timeout: Duration,
) -> Result<(), WaitError> {
    debug!("waiting for image {image_id} to become available");
    let deadline = Instant::now() + timeout;
    while Instant::now() <= deadline {
        match provider.get_image(image_id).await {
            Ok(image) => match image.state {
                ImageState::Available => return Ok(()),
                ImageState::Failed => {
                    return Err(WaitError::TerminalState {
                        resource_id: image_id.to_owned(),
                        state: String::from("failed"),
                    });
                }
                ImageState::Pending => {}
            },
            Err(err) if err.is_not_found() => {
                debug!("image {image_id} not visible yet, ignoring");
            }
            Err(err) => return Err(err.into()),
        }
        sleeper.sleep(SNAPSHOT_POLL_INTERVAL).await;
    }
    Err(WaitError::Timeout {
        resource_id: image_id.to_owned(),
        target: String::from("available"),
    })
}

/// Polls until the disk is detached and available again.
///
/// # Errors
///
/// Returns [`WaitError::Timeout`] when the budget expires and
/// [`WaitError::TerminalState`] when the disk errors.
pub async fn wait_for_disk_available(
    provider: &dyn CloudProvider,
    sleeper: &dyn Sleeper,
    disk_id: &str,
    timeout: Duration,
) -> Result<(), WaitError> {
    let deadline = Instant::now() + timeout;
    while Instant::now() <= deadline {
        let disk = provider.get_disk(disk_id).await?;
        match disk.state {
            DiskState::Available => return Ok(()),
            DiskState::Error => {
                return Err(WaitError::TerminalState {
                    resource_id: disk_id.to_owned(),
                    state: String::from("error"),
                });
            }
            _ => {}
        }
        sleeper.sleep(INSTANCE_POLL_INTERVAL).await;
    }
    Err(WaitError::Timeout {
        resource_id: disk_id.to_owned(),
        target: String::from("available"),
    })
}
