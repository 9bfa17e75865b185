//! Ledger of transient resources and the cleanup pass that empties it.
//!
//! Every provisioning step registers the resource id in the same statement
//! group that created it; there is no suspension point between creation and
//! registration that could lose track of a resource. Cleanup is
//! unconditional, idempotent, and never raises past the workflow boundary.

use std::collections::BTreeSet;
use std::time::Duration;

use log::{info, warn};

use crate::provider::{CloudProvider, InstanceState, ProviderError, wait};
use crate::retry::Sleeper;

/// Kind of a transient cloud resource.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum ResourceKind {
    /// A launched instance.
    Instance,
    /// A created disk.
    Disk,
    /// A created snapshot.
    Snapshot,
    /// A temporary image.
    Image,
    /// A security group created solely for this session.
    SecurityGroup,
}

/// One tracked resource.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TrackedResource {
    /// Resource kind, drives deletion ordering.
    pub kind: ResourceKind,
    /// Provider-native id.
    pub id: String,
    /// Creation order within the session.
    pub order: usize,
}

/// One failed deletion recorded during cleanup.
#[derive(Clone, Debug)]
pub struct CleanupFailure {
    /// Resource that could not be deleted.
    pub resource: TrackedResource,
    /// Error returned by the provider.
    pub error: ProviderError,
}

/// Outcome of a cleanup pass.
#[derive(Clone, Debug, Default)]
pub struct CleanupReport {
    /// Resources confirmed gone (deleted now, or already absent).
    pub deleted: Vec<TrackedResource>,
    /// Resources deliberately kept.
    pub retained: Vec<TrackedResource>,
    /// Deletions that failed; these are logged, never raised.
    pub failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    /// Whether every non-retained resource was removed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// In-memory ledger of every transient resource a session created.
#[derive(Debug, Default)]
pub struct ResourceTracker {
    session_id: String,
    resources: Vec<TrackedResource>,
    retained: BTreeSet<(ResourceKind, String)>,
}

impl ResourceTracker {
    /// Creates a tracker for the given session.
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            resources: Vec::new(),
            retained: BTreeSet::new(),
        }
    }

    /// Session id this tracker belongs to.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Records a freshly created resource. Call this in the same statement
    /// group as the creating provider call.
    pub fn register(&mut self, kind: ResourceKind, id: impl Into<String>) {
        let id = id.into();
        info!("session {}: tracking {kind:?} {id}", self.session_id);
        let order = self.resources.len();
        self.resources.push(TrackedResource { kind, id, order });
    }

    /// Marks a resource to survive cleanup (e.g. `--keep-encryptor`).
    pub fn retain(&mut self, kind: ResourceKind, id: impl Into<String>) {
        self.retained.insert((kind, id.into()));
    }

    /// Marks every tracked resource of `kind` to survive cleanup.
    pub fn retain_all(&mut self, kind: ResourceKind) {
        let ids: Vec<String> = self
            .resources
            .iter()
            .filter(|resource| resource.kind == kind)
            .map(|resource| resource.id.clone())
            .collect();
        for id in ids {
            self.retained.insert((kind, id));
        }
    }

    /// Stops tracking a resource that has been promoted to an output (the
    /// registered encrypted image on success).
    pub fn release(&mut self, kind: ResourceKind, id: &str) {
        self.resources
            .retain(|resource| !(resource.kind == kind && resource.id == id));
    }

    /// Resources currently tracked, in creation order.
    #[must_use]
    pub fn tracked(&self) -> &[TrackedResource] {
        &self.resources
    }

    fn of_kind(&self, kind: ResourceKind) -> Vec<TrackedResource> {
        self.resources
            .iter()
            .filter(|resource| resource.kind == kind)
            .cloned()
            .collect()
    }

    /// Deletes every tracked resource, instances first so their disks are
    /// released, then disks, snapshots, temporary images, and finally
    /// security groups.
    ///
    /// "Already deleted" responses count as success. Sub-failures are logged
    /// and collected in the report; the pass always visits every resource.
    /// The tracker is drained afterwards so a second call is a no-op.
    pub async fn cleanup(
        &mut self,
        provider: &dyn CloudProvider,
        sleeper: &dyn Sleeper,
    ) -> CleanupReport {
        let mut report = CleanupReport::default();

        let instances = self.of_kind(ResourceKind::Instance);
        let mut terminated = Vec::new();
        for resource in instances {
            if self.is_retained(&resource) {
                info!("session {}: keeping instance {}", self.session_id, resource.id);
                report.retained.push(resource);
                continue;
            }
            info!("terminating instance {}", resource.id);
            match provider.delete_instance(&resource.id).await {
                Ok(()) => {
                    terminated.push(resource.id.clone());
                    report.deleted.push(resource);
                }
                Err(err) if err.is_not_found() => report.deleted.push(resource),
                Err(error) => {
                    warn!("unable to terminate instance {}: {error}", resource.id);
                    report.failures.push(CleanupFailure { resource, error });
                }
            }
        }

        // Instances must be fully gone before their disks and security
        // groups can be removed without dependency errors.
        for instance_id in &terminated {
            let wait_result = wait::wait_for_instance(
                provider,
                sleeper,
                instance_id,
                InstanceState::Terminated,
                Duration::from_secs(300),
            )
            .await;
            match wait_result {
                Ok(_) => {}
                Err(wait::WaitError::Provider(err)) if err.is_not_found() => {}
                Err(err) => {
                    warn!("error while waiting for instance {instance_id} to terminate: {err}");
                }
            }
        }

        for kind in [
            ResourceKind::Disk,
            ResourceKind::Snapshot,
            ResourceKind::Image,
            ResourceKind::SecurityGroup,
        ] {
            for resource in self.of_kind(kind) {
                if self.is_retained(&resource) {
                    info!("session {}: keeping {kind:?} {}", self.session_id, resource.id);
                    report.retained.push(resource);
                    continue;
                }
                info!("deleting {kind:?} {}", resource.id);
                let result = match kind {
                    ResourceKind::Disk => provider.delete_disk(&resource.id).await,
                    ResourceKind::Snapshot => provider.delete_snapshot(&resource.id).await,
                    ResourceKind::Image => provider.delete_image(&resource.id).await,
                    ResourceKind::SecurityGroup => {
                        provider.delete_security_group(&resource.id).await
                    }
                    ResourceKind::Instance => Ok(()),
                };
                match result {
                    Ok(()) => report.deleted.push(resource),
                    Err(err) if err.is_not_found() => report.deleted.push(resource),
                    Err(error) => {
                        warn!("unable to delete {kind:?} {}: {error}", resource.id);
                        report.failures.push(CleanupFailure { resource, error });
                    }
                }
            }
        }

        self.resources.clear();
        if report.is_clean() {
            info!("session {}: cleanup complete", self.session_id);
        } else {
            warn!(
                "session {}: cleanup left {} resources behind",
                self.session_id,
                report.failures.len()
            );
        }
        report
    }

    fn is_retained(&self, resource: &TrackedResource) -> bool {
        self.retained
            .contains(&(resource.kind, resource.id.clone()))
    }
}
