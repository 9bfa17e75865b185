//! Cloud provider capability contract consumed by the orchestration engine.
//!
//! The engine is written only against [`CloudProvider`]; concrete SDK
//! bindings live out of tree and implement this surface per cloud. Errors
//! carry a structured [`ProviderErrorKind`] so retry decisions never depend
//! on provider-specific message text.

mod fake;
mod retrying;
pub mod wait;

pub use fake::FakeProvider;
pub use retrying::RetryingProvider;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;

use thiserror::Error;

/// Future returned by provider operations.
pub type ProviderFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Structured classification of a provider failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProviderErrorKind {
    /// The referenced resource does not exist (or not yet, see
    /// [`ProviderErrorKind::EventuallyConsistent`]).
    NotFound,
    /// The provider asked us to slow down.
    Throttled,
    /// A freshly created resource is not yet visible to reads.
    EventuallyConsistent,
    /// Credentials were rejected.
    AuthFailure,
    /// Credentials are valid but the operation is not permitted.
    Unauthorized,
    /// The request itself is malformed.
    InvalidParameter,
    /// The operation conflicts with the resource's current state.
    Conflict,
    /// The provider endpoint could not be reached.
    Transport,
    /// Anything the adapter could not classify.
    Other,
}

impl ProviderErrorKind {
    /// Whether an error of this kind is worth retrying.
    ///
    /// Auth failures, authorization denials, and invalid parameters never
    /// heal on retry and must propagate immediately.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Throttled | Self::EventuallyConsistent | Self::Transport
        )
    }
}

/// Error surfaced by a [`CloudProvider`] implementation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{kind:?}: {message}")]
pub struct ProviderError {
    /// Structured classification used by the retry policy.
    pub kind: ProviderErrorKind,
    /// Provider-supplied message, for humans only.
    pub message: String,
}

impl ProviderError {
    /// Creates an error with the given kind and message.
    #[must_use]
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for a `NotFound` error about `resource_id`.
    #[must_use]
    pub fn not_found(resource_id: &str) -> Self {
        Self::new(
            ProviderErrorKind::NotFound,
            format!("{resource_id} not found"),
        )
    }

    /// Whether the retry policy should re-attempt the operation.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Whether the error reports a missing resource.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.kind, ProviderErrorKind::NotFound)
    }
}

/// Lifecycle state of an instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InstanceState {
    /// Requested but not yet running.
    Pending,
    /// Booted and schedulable.
    Running,
    /// Shutting down towards `Stopped`.
    Stopping,
    /// Halted with volumes intact.
    Stopped,
    /// Gone for good.
    Terminated,
    /// The provider flagged the instance as broken.
    Error,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Terminated => "terminated",
            Self::Error => "error",
        };
        f.write_str(text)
    }
}

/// Lifecycle state of a disk.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DiskState {
    /// Allocation in progress.
    Creating,
    /// Ready and unattached.
    Available,
    /// Attached to an instance.
    InUse,
    /// Deletion in progress.
    Deleting,
    /// The provider flagged the disk as broken.
    Error,
}

/// Lifecycle state of a snapshot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SnapshotState {
    /// Data copy in progress.
    Pending,
    /// Fully captured.
    Completed,
    /// The provider flagged the snapshot as broken.
    Error,
}

/// Lifecycle state of an image.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ImageState {
    /// Registration in progress.
    Pending,
    /// Usable for launches.
    Available,
    /// Registration failed.
    Failed,
}

/// Backing store of an image's root device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StorageBackend {
    /// Root device backed by a provider block volume. The only backend the
    /// encryptor can work with.
    Volume,
    /// Root device streamed from object storage.
    Streamed,
}

/// Virtualization type of an image.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Virtualization {
    /// Hardware-assisted. Required by the encryptor.
    Hvm,
    /// Legacy paravirtual.
    Paravirtual,
}

/// One entry of an image's or instance's block device layout.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceMapping {
    /// Device name, e.g. `/dev/sda1`.
    pub device: String,
    /// Backing disk, when the mapping is materialised on an instance.
    pub disk_id: Option<String>,
    /// Backing snapshot, when the mapping belongs to an image.
    pub snapshot_id: Option<String>,
    /// Size in GB.
    pub size_gb: u64,
    /// Whether this is an ephemeral (instance-store) mapping.
    pub ephemeral: bool,
    /// Whether the backing disk dies with the instance.
    pub delete_on_termination: bool,
}

impl DeviceMapping {
    /// Creates a snapshot-backed mapping, the form used when registering an
    /// image.
    #[must_use]
    pub fn from_snapshot(device: impl Into<String>, snapshot_id: impl Into<String>, size_gb: u64) -> Self {
        Self {
            device: device.into(),
            disk_id: None,
            snapshot_id: Some(snapshot_id.into()),
            size_gb,
            ephemeral: false,
            delete_on_termination: true,
        }
    }

    /// Creates an ephemeral mapping carried over from a guest image.
    #[must_use]
    pub fn ephemeral(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            disk_id: None,
            snapshot_id: None,
            size_gb: 0,
            ephemeral: true,
            delete_on_termination: true,
        }
    }
}

/// Description of a machine image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageInfo {
    /// Provider-native image id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Free-form description.
    pub description: Option<String>,
    /// Registration state.
    pub state: ImageState,
    /// Tags attached to the image.
    pub tags: BTreeMap<String, String>,
    /// Root device backing store.
    pub storage: StorageBackend,
    /// Virtualization type.
    pub virtualization: Virtualization,
    /// Root device name.
    pub root_device: String,
    /// Block device layout.
    pub mappings: Vec<DeviceMapping>,
}

impl ImageInfo {
    /// Looks up the mapping for a device name.
    #[must_use]
    pub fn mapping_for(&self, device: &str) -> Option<&DeviceMapping> {
        self.mappings.iter().find(|m| m.device == device)
    }
}

/// Description of an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceInfo {
    /// Provider-native instance id.
    pub id: String,
    /// Lifecycle state.
    pub state: InstanceState,
    /// Zone the instance runs in.
    pub zone: String,
    /// Public IPv4 address, when assigned.
    pub public_ip: Option<IpAddr>,
    /// Private address inside the network scope.
    pub private_ip: Option<IpAddr>,
    /// Materialised block device layout.
    pub mappings: Vec<DeviceMapping>,
}

impl InstanceInfo {
    /// Looks up the mapping for a device name.
    #[must_use]
    pub fn mapping_for(&self, device: &str) -> Option<&DeviceMapping> {
        self.mappings.iter().find(|m| m.device == device)
    }

    /// Addresses to try when contacting the encryption agent, public first.
    #[must_use]
    pub fn candidate_ips(&self) -> Vec<IpAddr> {
        self.public_ip.into_iter().chain(self.private_ip).collect()
    }
}

/// Description of a disk.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiskInfo {
    /// Provider-native disk id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Zone the disk lives in.
    pub zone: String,
    /// Size in GB.
    pub size_gb: u64,
    /// Lifecycle state.
    pub state: DiskState,
    /// Instance the disk is attached to, if any.
    pub attached_to: Option<String>,
}

/// Description of a snapshot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SnapshotInfo {
    /// Provider-native snapshot id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Lifecycle state.
    pub state: SnapshotState,
    /// Copy progress, 0–100.
    pub progress: u8,
    /// Size of the source disk in GB.
    pub size_gb: u64,
}

/// Description of a security group.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SecurityGroupInfo {
    /// Provider-native group id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Network/VPC scope the group belongs to, when the provider has one.
    pub network_id: Option<String>,
}

/// Description of a subnet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubnetInfo {
    /// Provider-native subnet id.
    pub id: String,
    /// Network/VPC the subnet belongs to.
    pub network_id: String,
    /// Zone the subnet serves.
    pub zone: String,
}

/// Description of a network/VPC.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NetworkInfo {
    /// Provider-native network id.
    pub id: String,
    /// Display name.
    pub name: String,
}

/// Source a new disk is populated from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DiskSource {
    /// Empty disk; `size_gb` on the spec is required.
    Blank,
    /// Clone of an image's root volume.
    Image(String),
    /// Restore of a snapshot.
    Snapshot(String),
}

/// Parameters for creating a disk.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiskSpec {
    /// Display name.
    pub name: String,
    /// Target zone.
    pub zone: String,
    /// Requested size; ignored for sources that imply one.
    pub size_gb: Option<u64>,
    /// Content source.
    pub source: DiskSource,
}

/// A disk presented to an instance at launch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiskAttachment {
    /// Disk to attach.
    pub disk_id: String,
    /// Device name to present it at.
    pub device: String,
}

/// Parameters for launching an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaunchSpec {
    /// Image to boot from.
    pub image_id: String,
    /// Instance display name.
    pub name: String,
    /// Machine type / flavour.
    pub instance_type: String,
    /// Target zone.
    pub zone: String,
    /// Network/VPC to place the instance in, if any.
    pub network_id: Option<String>,
    /// Subnet to place the primary interface in, if any.
    pub subnet_id: Option<String>,
    /// Security groups applied to the instance.
    pub security_group_ids: Vec<String>,
    /// Boot-time user-data payload (already compressed when applicable).
    pub user_data: Option<Vec<u8>>,
    /// Extra disks presented at launch.
    pub disks: Vec<DiskAttachment>,
    /// Whether the boot volume should be discarded on termination.
    pub delete_boot: bool,
}

impl LaunchSpec {
    /// Creates a minimal launch spec; optional fields start empty.
    #[must_use]
    pub fn new(
        image_id: impl Into<String>,
        name: impl Into<String>,
        instance_type: impl Into<String>,
        zone: impl Into<String>,
    ) -> Self {
        Self {
            image_id: image_id.into(),
            name: name.into(),
            instance_type: instance_type.into(),
            zone: zone.into(),
            network_id: None,
            subnet_id: None,
            security_group_ids: Vec::new(),
            user_data: None,
            disks: Vec::new(),
            delete_boot: true,
        }
    }
}

/// Parameters for registering an image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageSpec {
    /// Display name; must already satisfy provider naming rules.
    pub name: String,
    /// Free-form description.
    pub description: Option<String>,
    /// Root device name.
    pub root_device: String,
    /// Snapshot-backed block device layout.
    pub mappings: Vec<DeviceMapping>,
    /// Tags to stamp onto the image.
    pub tags: BTreeMap<String, String>,
}

/// Serial console text fetched for post-mortem diagnostics.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConsoleOutput {
    /// Instance the output belongs to.
    pub instance_id: String,
    /// Raw console text; may be empty while the provider buffers.
    pub content: String,
}

/// Capability surface over one cloud's compute API.
///
/// All methods are region/zone scoped by construction of the adapter.
/// Mutating calls are expected to be idempotent enough that the retry
/// wrapper can safely re-issue them on transient failures.
pub trait CloudProvider: Send + Sync {
    /// Fetches an image by id.
    fn get_image<'a>(&'a self, image_id: &'a str) -> ProviderFuture<'a, ImageInfo>;

    /// Lists images matching an exact name, optionally restricted to images
    /// owned by the calling account.
    fn find_images<'a>(
        &'a self,
        name: &'a str,
        owned_by_self: bool,
    ) -> ProviderFuture<'a, Vec<ImageInfo>>;

    /// Launches an instance.
    fn run_instance<'a>(&'a self, spec: &'a LaunchSpec) -> ProviderFuture<'a, InstanceInfo>;

    /// Fetches an instance by id.
    fn get_instance<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, InstanceInfo>;

    /// Requests a clean stop of an instance.
    fn stop_instance<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, ()>;

    /// Terminates an instance.
    fn delete_instance<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, ()>;

    /// Creates a disk.
    fn create_disk<'a>(&'a self, spec: &'a DiskSpec) -> ProviderFuture<'a, DiskInfo>;

    /// Fetches a disk by id.
    fn get_disk<'a>(&'a self, disk_id: &'a str) -> ProviderFuture<'a, DiskInfo>;

    /// Deletes a disk.
    fn delete_disk<'a>(&'a self, disk_id: &'a str) -> ProviderFuture<'a, ()>;

    /// Attaches a disk to a running or stopped instance.
    fn attach_disk<'a>(
        &'a self,
        instance_id: &'a str,
        disk_id: &'a str,
        device: &'a str,
    ) -> ProviderFuture<'a, ()>;

    /// Detaches a disk from an instance.
    fn detach_disk<'a>(&'a self, instance_id: &'a str, disk_id: &'a str)
    -> ProviderFuture<'a, ()>;

    /// Snapshots a disk.
    fn create_snapshot<'a>(
        &'a self,
        disk_id: &'a str,
        name: &'a str,
        description: &'a str,
    ) -> ProviderFuture<'a, SnapshotInfo>;

    /// Fetches a snapshot by id.
    fn get_snapshot<'a>(&'a self, snapshot_id: &'a str) -> ProviderFuture<'a, SnapshotInfo>;

    /// Deletes a snapshot.
    fn delete_snapshot<'a>(&'a self, snapshot_id: &'a str) -> ProviderFuture<'a, ()>;

    /// Registers an image from snapshots.
    fn register_image<'a>(&'a self, spec: &'a ImageSpec) -> ProviderFuture<'a, ImageInfo>;

    /// Deregisters an image.
    fn delete_image<'a>(&'a self, image_id: &'a str) -> ProviderFuture<'a, ()>;

    /// Creates a security group opening exactly `open_port` to the world.
    fn create_security_group<'a>(
        &'a self,
        name: &'a str,
        description: &'a str,
        network_id: Option<&'a str>,
        open_port: u16,
    ) -> ProviderFuture<'a, SecurityGroupInfo>;

    /// Deletes a security group.
    fn delete_security_group<'a>(&'a self, group_id: &'a str) -> ProviderFuture<'a, ()>;

    /// Fetches a subnet by id.
    fn get_subnet<'a>(&'a self, subnet_id: &'a str) -> ProviderFuture<'a, SubnetInfo>;

    /// Fetches a network/VPC by id.
    fn get_network<'a>(&'a self, network_id: &'a str) -> ProviderFuture<'a, NetworkInfo>;

    /// Fetches a security group by id.
    fn get_security_group<'a>(&'a self, group_id: &'a str)
    -> ProviderFuture<'a, SecurityGroupInfo>;

    /// Applies tags to any resource.
    fn create_tags<'a>(
        &'a self,
        resource_id: &'a str,
        tags: &'a BTreeMap<String, String>,
    ) -> ProviderFuture<'a, ()>;

    /// Fetches serial console output for diagnostics.
    fn get_console_output<'a>(&'a self, instance_id: &'a str)
    -> ProviderFuture<'a, ConsoleOutput>;
}
