//! Shared machinery for the encrypt and update workflows.
//!
//! Both workflows walk the same linear state machine and share the
//! provisioning idioms: a temporary security group scoped to the status
//! port, an instance launch wrapped against eventual consistency, and the
//! metavisor boot-volume snapshot set taken after the agent finishes.

use std::time::Duration;

use log::{error, info, warn};
use thiserror::Error;

use crate::instance_config::InstanceConfigError;
use crate::provider::{
    CloudProvider, InstanceInfo, LaunchSpec, ProviderError, SnapshotInfo, wait::WaitError,
};
use crate::retry::{RetryPolicy, Sleeper, retry};
use crate::session::Session;
use crate::status::EncryptionError;
use crate::tracker::{ResourceKind, ResourceTracker};
use crate::validation::ValidationError;

/// Bootloader volume of the metavisor; the final image boots from it.
pub const DEVICE_MV_GRUB: &str = "/dev/sda1";
/// Metavisor system root volume.
pub const DEVICE_MV_ROOT: &str = "/dev/sda2";
/// Metavisor log volume.
pub const DEVICE_MV_LOG: &str = "/dev/sda3";
/// Encrypted guest volume in the final image layout.
pub const DEVICE_GUEST_ROOT: &str = "/dev/sda5";
/// Device the unencrypted source volume is presented at while encrypting.
pub const DEVICE_SOURCE: &str = "/dev/sdf";
/// Device the encrypted target volume is presented at while encrypting.
pub const DEVICE_TARGET: &str = "/dev/sdg";

/// Display name for the encryptor instance.
pub const NAME_ENCRYPTOR: &str = "Bracket volume encryptor";
/// Display name for the updater instance.
pub const NAME_METAVISOR_UPDATER: &str = "Bracket Updater";
/// Display name for the metavisor grub snapshot.
pub const NAME_METAVISOR_GRUB_SNAPSHOT: &str = "Bracket system grub";
/// Display name for the metavisor root snapshot.
pub const NAME_METAVISOR_ROOT_SNAPSHOT: &str = "Bracket system root";
/// Display name for the metavisor log snapshot.
pub const NAME_METAVISOR_LOG_SNAPSHOT: &str = "Bracket system log";
/// Display name for the encrypted guest root snapshot.
pub const NAME_ENCRYPTED_ROOT_SNAPSHOT: &str = "Bracket encrypted root volume";
/// Display name for log snapshots captured on failure.
pub const NAME_LOG_SNAPSHOT_PREFIX: &str = "Bracket logs from";

/// States of the encrypt/update workflow state machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkflowState {
    /// Nothing has happened yet.
    Init,
    /// Preconditions passed; still no resources.
    Validated,
    /// The encryptor instance exists.
    EncryptorLaunched,
    /// The guest volumes are presented to the encryptor.
    GuestAttached,
    /// The agent is encrypting.
    Encrypting,
    /// Result volumes are snapshotted.
    SnapshotTaken,
    /// The output image is registered.
    ImageRegistered,
    /// Terminal: transient resources are gone (or retained).
    CleanedUp,
    /// A step failed; cleanup still runs.
    Failed,
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Init => "init",
            Self::Validated => "validated",
            Self::EncryptorLaunched => "encryptor-launched",
            Self::GuestAttached => "guest-attached",
            Self::Encrypting => "encrypting",
            Self::SnapshotTaken => "snapshot-taken",
            Self::ImageRegistered => "image-registered",
            Self::CleanedUp => "cleaned-up",
            Self::Failed => "failed",
        };
        f.write_str(text)
    }
}

/// Errors surfaced by the encrypt and update workflows.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// A precondition failed before any resource was created.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// A provider call failed fatally (or exhausted its retry budget).
    #[error("provider call failed while {state}: {source}")]
    Provider {
        /// Workflow state at the time of failure.
        state: WorkflowState,
        /// Underlying provider error.
        #[source]
        source: ProviderError,
    },
    /// A resource never reached the awaited state.
    #[error("while {state}: {source}")]
    Wait {
        /// Workflow state at the time of failure.
        state: WorkflowState,
        /// Underlying wait error.
        #[source]
        source: WaitError,
    },
    /// The encryption agent failed or its budget elapsed.
    #[error("while {state}: {source}")]
    Encryption {
        /// Workflow state at the time of failure.
        state: WorkflowState,
        /// Underlying encryption error.
        #[source]
        source: EncryptionError,
    },
    /// The boot configuration could not be assembled.
    #[error(transparent)]
    UserData(#[from] InstanceConfigError),
}

impl WorkflowError {
    /// Whether the failure is a timeout classification (as opposed to an
    /// explicit failure reported by the agent or provider).
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Encryption {
                source: EncryptionError::Timeout { .. },
                ..
            } | Self::Wait {
                source: WaitError::Timeout { .. },
                ..
            }
        )
    }
}

/// Time budgets applied across a workflow run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WorkflowTimeouts {
    /// Budget for any single resource-state wait.
    pub resource_wait: Duration,
    /// Budget for the agent to answer its first status poll.
    pub encryptor_up: Duration,
    /// Budget for the encryption itself.
    pub encryption: Duration,
}

impl Default for WorkflowTimeouts {
    fn default() -> Self {
        Self {
            resource_wait: crate::provider::wait::DEFAULT_WAIT_TIMEOUT,
            encryptor_up: crate::status::ENCRYPTOR_UP_TIMEOUT,
            encryption: Duration::from_secs(7200),
        }
    }
}

/// Tracks and logs state transitions for one workflow run.
#[derive(Debug)]
pub struct Progress {
    session_id: String,
    state: WorkflowState,
}

impl Progress {
    /// Starts a progress record in the `Init` state.
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            state: WorkflowState::Init,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> WorkflowState {
        self.state
    }

    /// Moves to the next state, logging the transition.
    pub fn advance(&mut self, next: WorkflowState) {
        info!("session {}: {} -> {next}", self.session_id, self.state);
        self.state = next;
    }

    /// Marks the run failed, logging the cause.
    pub fn fail(&mut self, cause: &WorkflowError) {
        error!(
            "session {}: {} -> {} ({cause})",
            self.session_id,
            self.state,
            WorkflowState::Failed
        );
        self.state = WorkflowState::Failed;
    }

    /// Wraps a provider error with the current state.
    #[must_use]
    pub fn provider_err(&self, source: ProviderError) -> WorkflowError {
        WorkflowError::Provider {
            state: self.state,
            source,
        }
    }

    /// Wraps a wait error with the current state.
    #[must_use]
    pub fn wait_err(&self, source: WaitError) -> WorkflowError {
        WorkflowError::Wait {
            state: self.state,
            source,
        }
    }

    /// Wraps an encryption error with the current state.
    #[must_use]
    pub fn encryption_err(&self, source: EncryptionError) -> WorkflowError {
        WorkflowError::Encryption {
            state: self.state,
            source,
        }
    }
}

/// Security groups to apply to the encryptor, creating a temporary one when
/// the caller supplied none.
pub struct SecurityGroups {
    /// Group ids to launch with.
    pub ids: Vec<String>,
    /// Whether a temporary group was created (and must be retried against).
    pub temporary: bool,
}

/// Resolves the security groups for an encryptor launch.
///
/// When no groups are given, a session-scoped group opening only the status
/// port is created in the launch's network scope (the subnet's network
/// when a subnet is given, the explicit network otherwise) and registered
/// for cleanup.
///
/// # Errors
///
/// Returns the provider error from subnet resolution or group creation.
pub async fn ensure_security_groups(
    provider: &dyn CloudProvider,
    session: &Session,
    tracker: &mut ResourceTracker,
    network_id: Option<&str>,
    subnet_id: Option<&str>,
    explicit: &[String],
    status_port: u16,
) -> Result<SecurityGroups, ProviderError> {
    if !explicit.is_empty() {
        return Ok(SecurityGroups {
            ids: explicit.to_vec(),
            temporary: false,
        });
    }
    let network_id = match subnet_id {
        Some(id) => Some(provider.get_subnet(id).await?.network_id),
        None => network_id.map(str::to_owned),
    };
    let name = format!("Bracket Encryptor {}", session.id);
    let group = provider
        .create_security_group(
            &name,
            "Allows access to the encryption service.",
            network_id.as_deref(),
            status_port,
        )
        .await?;
    tracker.register(ResourceKind::SecurityGroup, &group.id);
    info!("created temporary security group {}", group.id);
    provider.create_tags(&group.id, &session.default_tags()).await?;
    Ok(SecurityGroups {
        ids: vec![group.id],
        temporary: true,
    })
}

/// Launches the encryptor instance and registers it for cleanup.
///
/// A launch straight after creating the temporary security group can race
/// the provider's read path, so those launches retry on not-found in
/// addition to the usual transient kinds.
///
/// # Errors
///
/// Returns the launch error once retries are exhausted.
pub async fn launch_tracked_instance(
    provider: &dyn CloudProvider,
    sleeper: &dyn Sleeper,
    session: &Session,
    tracker: &mut ResourceTracker,
    spec: &LaunchSpec,
    display_name: &str,
    retry_not_found: bool,
) -> Result<InstanceInfo, ProviderError> {
    let policy = RetryPolicy::with_max_elapsed(Duration::from_secs(300));
    let instance = if retry_not_found {
        retry(
            &policy,
            sleeper,
            "run_instance",
            |err: &ProviderError| err.is_retryable() || err.is_not_found(),
            || provider.run_instance(spec),
        )
        .await
        .map_err(|(err, _)| err)?
    } else {
        provider.run_instance(spec).await?
    };
    tracker.register(ResourceKind::Instance, &instance.id);
    let mut tags = session.default_tags();
    tags.insert(String::from("Name"), display_name.to_owned());
    provider.create_tags(&instance.id, &tags).await?;
    Ok(instance)
}

/// Snapshots of the metavisor boot volumes, taken after a successful run.
pub struct MetavisorSnapshots {
    /// Bootloader volume snapshot.
    pub grub: SnapshotInfo,
    /// System root snapshot.
    pub root: SnapshotInfo,
    /// Log volume snapshot.
    pub log: SnapshotInfo,
}

impl MetavisorSnapshots {
    /// Ids of all three snapshots.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        vec![self.grub.id.clone(), self.root.id.clone(), self.log.id.clone()]
    }
}

fn disk_for_device(instance: &InstanceInfo, device: &str) -> Result<String, ProviderError> {
    instance
        .mapping_for(device)
        .and_then(|mapping| mapping.disk_id.clone())
        .ok_or_else(|| {
            ProviderError::new(
                crate::provider::ProviderErrorKind::Other,
                format!("instance {} has no disk at {device}", instance.id),
            )
        })
}

/// Snapshots the metavisor grub, root, and log volumes of a stopped
/// encryptor, registering each snapshot for cleanup.
///
/// # Errors
///
/// Returns the provider error from any snapshot creation.
pub async fn snapshot_metavisor_volumes(
    provider: &dyn CloudProvider,
    tracker: &mut ResourceTracker,
    instance: &InstanceInfo,
    description: &str,
) -> Result<MetavisorSnapshots, ProviderError> {
    let grub_disk = disk_for_device(instance, DEVICE_MV_GRUB)?;
    let root_disk = disk_for_device(instance, DEVICE_MV_ROOT)?;
    let log_disk = disk_for_device(instance, DEVICE_MV_LOG)?;

    let grub = provider
        .create_snapshot(&grub_disk, NAME_METAVISOR_GRUB_SNAPSHOT, description)
        .await?;
    tracker.register(ResourceKind::Snapshot, &grub.id);
    let root = provider
        .create_snapshot(&root_disk, NAME_METAVISOR_ROOT_SNAPSHOT, description)
        .await?;
    tracker.register(ResourceKind::Snapshot, &root.id);
    let log = provider
        .create_snapshot(&log_disk, NAME_METAVISOR_LOG_SNAPSHOT, description)
        .await?;
    tracker.register(ResourceKind::Snapshot, &log.id);

    Ok(MetavisorSnapshots { grub, root, log })
}

/// Captures the encryptor's log volume into a snapshot that deliberately
/// survives cleanup, so it can be shared with support.
///
/// Best-effort: failures are logged and swallowed, since this runs on a
/// path that is already failing.
pub async fn save_log_snapshot(
    provider: &dyn CloudProvider,
    instance: &InstanceInfo,
) -> Option<SnapshotInfo> {
    let log_disk = match disk_for_device(instance, DEVICE_MV_LOG) {
        Ok(disk) => disk,
        Err(err) => {
            warn!("cannot locate log volume on {}: {err}", instance.id);
            return None;
        }
    };
    let name = format!("{NAME_LOG_SNAPSHOT_PREFIX} {}", instance.id);
    match provider
        .create_snapshot(&log_disk, &name, "Encryptor logs for support diagnosis")
        .await
    {
        Ok(snapshot) => {
            info!(
                "encryptor logs saved in snapshot {}; share it with support for diagnosis",
                snapshot.id
            );
            Some(snapshot)
        }
        Err(err) => {
            warn!("unable to snapshot encryptor logs: {err}");
            None
        }
    }
}

/// Logs where to find the encryptor console output after a failure.
pub async fn report_console_output(provider: &dyn CloudProvider, instance_id: &str) {
    error!(
        "encryption failed; check console output of instance {instance_id} for details"
    );
    match provider.get_console_output(instance_id).await {
        Ok(console) if !console.content.is_empty() => {
            log::debug!("console output for {instance_id}:\n{}", console.content);
        }
        Ok(_) => {
            error!(
                "console output for {instance_id} is not available yet; retry from the provider console in a minute"
            );
        }
        Err(err) => warn!("unable to fetch console output for {instance_id}: {err}"),
    }
}
