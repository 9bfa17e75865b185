//! Deterministic in-memory provider.
//!
//! Backs the test suite and the binary's `--provider fake` dry-run path.
//! Resources move to their steady state instantly (instances run, snapshots
//! complete, images become available) so workflows can be exercised without
//! a cloud account. Failures are injected per operation name to drive the
//! cleanup paths.

use std::collections::{BTreeMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Mutex;

use super::{
    CloudProvider, ConsoleOutput, DeviceMapping, DiskInfo, DiskSource, DiskSpec, DiskState,
    ImageInfo, ImageSpec, ImageState, InstanceInfo, InstanceState, LaunchSpec, NetworkInfo,
    ProviderError, ProviderErrorKind, ProviderFuture, SecurityGroupInfo, SnapshotInfo,
    SnapshotState, StorageBackend, SubnetInfo, Virtualization,
};

#[derive(Debug, Default)]
struct FakeState {
    images: BTreeMap<String, ImageInfo>,
    instances: BTreeMap<String, InstanceInfo>,
    disks: BTreeMap<String, DiskInfo>,
    snapshots: BTreeMap<String, SnapshotInfo>,
    security_groups: BTreeMap<String, SecurityGroupInfo>,
    subnets: BTreeMap<String, SubnetInfo>,
    networks: BTreeMap<String, NetworkInfo>,
    tags: BTreeMap<String, BTreeMap<String, String>>,
    failures: BTreeMap<String, VecDeque<ProviderError>>,
    counter: u64,
}

impl FakeState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.counter += 1;
        format!("{prefix}-{:04}", self.counter)
    }

    fn take_failure(&mut self, operation: &str) -> Option<ProviderError> {
        let queue = self.failures.get_mut(operation)?;
        let failure = queue.pop_front();
        if queue.is_empty() {
            self.failures.remove(operation);
        }
        failure
    }
}

/// In-memory [`CloudProvider`] with instant state transitions and failure
/// injection.
#[derive(Debug, Default)]
pub struct FakeProvider {
    state: Mutex<FakeState>,
}

impl FakeProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Queues an error to be returned by the next call to `operation`.
    pub fn fail_next(&self, operation: &str, error: ProviderError) {
        self.lock()
            .failures
            .entry(operation.to_owned())
            .or_default()
            .push_back(error);
    }

    /// Seeds an image with the given layout.
    pub fn seed_image(&self, image: ImageInfo) {
        self.lock().images.insert(image.id.clone(), image);
    }

    /// Seeds a completed snapshot, e.g. one backing a seeded image.
    pub fn seed_snapshot(&self, snapshot_id: &str, size_gb: u64) {
        self.lock().snapshots.insert(
            snapshot_id.to_owned(),
            SnapshotInfo {
                id: snapshot_id.to_owned(),
                name: snapshot_id.to_owned(),
                state: SnapshotState::Completed,
                progress: 100,
                size_gb,
            },
        );
    }

    /// Seeds a subnet belonging to `network_id`. The network is seeded
    /// alongside so lookups against either resolve.
    pub fn seed_subnet(&self, subnet_id: &str, network_id: &str, zone: &str) {
        let mut state = self.lock();
        state.subnets.insert(
            subnet_id.to_owned(),
            SubnetInfo {
                id: subnet_id.to_owned(),
                network_id: network_id.to_owned(),
                zone: zone.to_owned(),
            },
        );
        state.networks.insert(
            network_id.to_owned(),
            NetworkInfo {
                id: network_id.to_owned(),
                name: network_id.to_owned(),
            },
        );
    }

    /// Seeds a standalone network/VPC.
    pub fn seed_network(&self, network_id: &str) {
        self.lock().networks.insert(
            network_id.to_owned(),
            NetworkInfo {
                id: network_id.to_owned(),
                name: network_id.to_owned(),
            },
        );
    }

    /// Seeds a security group in the given network scope.
    pub fn seed_security_group(&self, group_id: &str, network_id: Option<&str>) {
        self.lock().security_groups.insert(
            group_id.to_owned(),
            SecurityGroupInfo {
                id: group_id.to_owned(),
                name: group_id.to_owned(),
                network_id: network_id.map(str::to_owned),
            },
        );
    }

    /// Number of instances currently alive.
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.lock().instances.len()
    }

    /// Number of disks currently alive.
    #[must_use]
    pub fn disk_count(&self) -> usize {
        self.lock().disks.len()
    }

    /// Number of snapshots currently alive.
    #[must_use]
    pub fn snapshot_count(&self) -> usize {
        self.lock().snapshots.len()
    }

    /// Number of security groups currently alive.
    #[must_use]
    pub fn security_group_count(&self) -> usize {
        self.lock().security_groups.len()
    }

    /// Ids of images currently registered.
    #[must_use]
    pub fn image_ids(&self) -> Vec<String> {
        self.lock().images.keys().cloned().collect()
    }

    /// Tags recorded for a resource, merged from `create_tags` calls.
    #[must_use]
    pub fn tags_for(&self, resource_id: &str) -> BTreeMap<String, String> {
        let state = self.lock();
        let mut tags = state
            .images
            .get(resource_id)
            .map(|image| image.tags.clone())
            .unwrap_or_default();
        if let Some(extra) = state.tags.get(resource_id) {
            for (key, value) in extra {
                tags.insert(key.clone(), value.clone());
            }
        }
        tags
    }

    /// Ids of live resources (any kind) carrying the given tag value.
    #[must_use]
    pub fn live_resources_tagged(&self, key: &str, value: &str) -> Vec<String> {
        let state = self.lock();
        let mut matches = Vec::new();
        for (resource_id, tags) in &state.tags {
            let alive = state.instances.contains_key(resource_id)
                || state.disks.contains_key(resource_id)
                || state.snapshots.contains_key(resource_id)
                || state.security_groups.contains_key(resource_id);
            if alive && tags.get(key).is_some_and(|v| v == value) {
                matches.push(resource_id.clone());
            }
        }
        matches
    }

    fn fail_or(&self, operation: &str) -> Result<(), ProviderError> {
        match self.lock().take_failure(operation) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn materialise_boot_disks(state: &mut FakeState, image_id: &str, zone: &str) -> Result<Vec<DeviceMapping>, ProviderError> {
    let image = state
        .images
        .get(image_id)
        .ok_or_else(|| ProviderError::not_found(image_id))?
        .clone();
    let mut mappings = Vec::new();
    for mapping in &image.mappings {
        if mapping.ephemeral {
            mappings.push(mapping.clone());
            continue;
        }
        let disk_id = state.next_id("disk");
        state.disks.insert(
            disk_id.clone(),
            DiskInfo {
                id: disk_id.clone(),
                name: format!("boot-{}", mapping.device),
                zone: zone.to_owned(),
                size_gb: mapping.size_gb,
                state: DiskState::InUse,
                attached_to: None,
            },
        );
        mappings.push(DeviceMapping {
            device: mapping.device.clone(),
            disk_id: Some(disk_id),
            snapshot_id: mapping.snapshot_id.clone(),
            size_gb: mapping.size_gb,
            ephemeral: false,
            delete_on_termination: mapping.delete_on_termination,
        });
    }
    Ok(mappings)
}

impl CloudProvider for FakeProvider {
    fn get_image<'a>(&'a self, image_id: &'a str) -> ProviderFuture<'a, ImageInfo> {
        Box::pin(async move {
            self.fail_or("get_image")?;
            let state = self.lock();
            let mut image = state
                .images
                .get(image_id)
                .cloned()
                .ok_or_else(|| ProviderError::not_found(image_id))?;
            if let Some(extra) = state.tags.get(image_id) {
                for (key, value) in extra {
                    image.tags.insert(key.clone(), value.clone());
                }
            }
            Ok(image)
        })
    }

    fn find_images<'a>(
        &'a self,
        name: &'a str,
        _owned_by_self: bool,
    ) -> ProviderFuture<'a, Vec<ImageInfo>> {
        Box::pin(async move {
            self.fail_or("find_images")?;
            let state = self.lock();
            Ok(state
                .images
                .values()
                .filter(|image| image.name == name)
                .cloned()
                .collect())
        })
    }

    fn run_instance<'a>(&'a self, spec: &'a LaunchSpec) -> ProviderFuture<'a, InstanceInfo> {
        Box::pin(async move {
            self.fail_or("run_instance")?;
            let mut state = self.lock();
            for group_id in &spec.security_group_ids {
                if !state.security_groups.contains_key(group_id) {
                    return Err(ProviderError::not_found(group_id));
                }
            }
            let mut mappings = materialise_boot_disks(&mut state, &spec.image_id, &spec.zone)?;
            for attachment in &spec.disks {
                let disk = state
                    .disks
                    .get_mut(&attachment.disk_id)
                    .ok_or_else(|| ProviderError::not_found(&attachment.disk_id))?;
                disk.state = DiskState::InUse;
                let size_gb = disk.size_gb;
                mappings.push(DeviceMapping {
                    device: attachment.device.clone(),
                    disk_id: Some(attachment.disk_id.clone()),
                    snapshot_id: None,
                    size_gb,
                    ephemeral: false,
                    delete_on_termination: false,
                });
            }
            let instance_id = state.next_id("i");
            for attachment in &spec.disks {
                if let Some(disk) = state.disks.get_mut(&attachment.disk_id) {
                    disk.attached_to = Some(instance_id.clone());
                }
            }
            let instance = InstanceInfo {
                id: instance_id.clone(),
                state: InstanceState::Running,
                zone: spec.zone.clone(),
                public_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
                private_ip: None,
                mappings,
            };
            state.instances.insert(instance_id, instance.clone());
            Ok(instance)
        })
    }

    fn get_instance<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, InstanceInfo> {
        Box::pin(async move {
            self.fail_or("get_instance")?;
            self.lock()
                .instances
                .get(instance_id)
                .cloned()
                .ok_or_else(|| ProviderError::not_found(instance_id))
        })
    }

    fn stop_instance<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.fail_or("stop_instance")?;
            let mut state = self.lock();
            let instance = state
                .instances
                .get_mut(instance_id)
                .ok_or_else(|| ProviderError::not_found(instance_id))?;
            instance.state = InstanceState::Stopped;
            Ok(())
        })
    }

    fn delete_instance<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.fail_or("delete_instance")?;
            let mut state = self.lock();
            let instance = state
                .instances
                .remove(instance_id)
                .ok_or_else(|| ProviderError::not_found(instance_id))?;
            for mapping in &instance.mappings {
                let Some(disk_id) = &mapping.disk_id else {
                    continue;
                };
                if mapping.delete_on_termination {
                    state.disks.remove(disk_id);
                } else if let Some(disk) = state.disks.get_mut(disk_id) {
                    disk.state = DiskState::Available;
                    disk.attached_to = None;
                }
            }
            Ok(())
        })
    }

    fn create_disk<'a>(&'a self, spec: &'a DiskSpec) -> ProviderFuture<'a, DiskInfo> {
        Box::pin(async move {
            self.fail_or("create_disk")?;
            let mut state = self.lock();
            let size_gb = match &spec.source {
                DiskSource::Blank => spec.size_gb.ok_or_else(|| {
                    ProviderError::new(
                        ProviderErrorKind::InvalidParameter,
                        "blank disk requires a size",
                    )
                })?,
                DiskSource::Image(image_id) => {
                    let image = state
                        .images
                        .get(image_id)
                        .ok_or_else(|| ProviderError::not_found(image_id))?;
                    image
                        .mapping_for(&image.root_device)
                        .map_or(10, |mapping| mapping.size_gb)
                }
                DiskSource::Snapshot(snapshot_id) => state
                    .snapshots
                    .get(snapshot_id)
                    .ok_or_else(|| ProviderError::not_found(snapshot_id))?
                    .size_gb,
            };
            let disk_id = state.next_id("disk");
            let disk = DiskInfo {
                id: disk_id.clone(),
                name: spec.name.clone(),
                zone: spec.zone.clone(),
                size_gb,
                state: DiskState::Available,
                attached_to: None,
            };
            state.disks.insert(disk_id, disk.clone());
            Ok(disk)
        })
    }

    fn get_disk<'a>(&'a self, disk_id: &'a str) -> ProviderFuture<'a, DiskInfo> {
        Box::pin(async move {
            self.fail_or("get_disk")?;
            self.lock()
                .disks
                .get(disk_id)
                .cloned()
                .ok_or_else(|| ProviderError::not_found(disk_id))
        })
    }

    fn delete_disk<'a>(&'a self, disk_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.fail_or("delete_disk")?;
            self.lock()
                .disks
                .remove(disk_id)
                .map(|_| ())
                .ok_or_else(|| ProviderError::not_found(disk_id))
        })
    }

    fn attach_disk<'a>(
        &'a self,
        instance_id: &'a str,
        disk_id: &'a str,
        device: &'a str,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.fail_or("attach_disk")?;
            let mut state = self.lock();
            let size_gb = {
                let disk = state
                    .disks
                    .get_mut(disk_id)
                    .ok_or_else(|| ProviderError::not_found(disk_id))?;
                disk.state = DiskState::InUse;
                disk.attached_to = Some(instance_id.to_owned());
                disk.size_gb
            };
            let instance = state
                .instances
                .get_mut(instance_id)
                .ok_or_else(|| ProviderError::not_found(instance_id))?;
            instance.mappings.push(DeviceMapping {
                device: device.to_owned(),
                disk_id: Some(disk_id.to_owned()),
                snapshot_id: None,
                size_gb,
                ephemeral: false,
                delete_on_termination: false,
            });
            Ok(())
        })
    }

    fn detach_disk<'a>(
        &'a self,
        instance_id: &'a str,
        disk_id: &'a str,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.fail_or("detach_disk")?;
            let mut state = self.lock();
            if let Some(disk) = state.disks.get_mut(disk_id) {
                disk.state = DiskState::Available;
                disk.attached_to = None;
            }
            if let Some(instance) = state.instances.get_mut(instance_id) {
                instance
                    .mappings
                    .retain(|mapping| mapping.disk_id.as_deref() != Some(disk_id));
            }
            Ok(())
        })
    }

    fn create_snapshot<'a>(
        &'a self,
        disk_id: &'a str,
        name: &'a str,
        _description: &'a str,
    ) -> ProviderFuture<'a, SnapshotInfo> {
        Box::pin(async move {
            self.fail_or("create_snapshot")?;
            let mut state = self.lock();
            let size_gb = state
                .disks
                .get(disk_id)
                .ok_or_else(|| ProviderError::not_found(disk_id))?
                .size_gb;
            let snapshot_id = state.next_id("snap");
            let snapshot = SnapshotInfo {
                id: snapshot_id.clone(),
                name: name.to_owned(),
                state: SnapshotState::Completed,
                progress: 100,
                size_gb,
            };
            state.snapshots.insert(snapshot_id, snapshot.clone());
            Ok(snapshot)
        })
    }

    fn get_snapshot<'a>(&'a self, snapshot_id: &'a str) -> ProviderFuture<'a, SnapshotInfo> {
        Box::pin(async move {
            self.fail_or("get_snapshot")?;
            self.lock()
                .snapshots
                .get(snapshot_id)
                .cloned()
                .ok_or_else(|| ProviderError::not_found(snapshot_id))
        })
    }

    fn delete_snapshot<'a>(&'a self, snapshot_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.fail_or("delete_snapshot")?;
            self.lock()
                .snapshots
                .remove(snapshot_id)
                .map(|_| ())
                .ok_or_else(|| ProviderError::not_found(snapshot_id))
        })
    }

    fn register_image<'a>(&'a self, spec: &'a ImageSpec) -> ProviderFuture<'a, ImageInfo> {
        Box::pin(async move {
            self.fail_or("register_image")?;
            let mut state = self.lock();
            let image_id = state.next_id("img");
            let image = ImageInfo {
                id: image_id.clone(),
                name: spec.name.clone(),
                description: spec.description.clone(),
                state: ImageState::Available,
                tags: spec.tags.clone(),
                storage: StorageBackend::Volume,
                virtualization: Virtualization::Hvm,
                root_device: spec.root_device.clone(),
                mappings: spec.mappings.clone(),
            };
            state.images.insert(image_id, image.clone());
            Ok(image)
        })
    }

    fn delete_image<'a>(&'a self, image_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.fail_or("delete_image")?;
            self.lock()
                .images
                .remove(image_id)
                .map(|_| ())
                .ok_or_else(|| ProviderError::not_found(image_id))
        })
    }

    fn create_security_group<'a>(
        &'a self,
        name: &'a str,
        _description: &'a str,
        network_id: Option<&'a str>,
        _open_port: u16,
    ) -> ProviderFuture<'a, SecurityGroupInfo> {
        Box::pin(async move {
            self.fail_or("create_security_group")?;
            let mut state = self.lock();
            let group_id = state.next_id("sg");
            let group = SecurityGroupInfo {
                id: group_id.clone(),
                name: name.to_owned(),
                network_id: network_id.map(str::to_owned),
            };
            state.security_groups.insert(group_id, group.clone());
            Ok(group)
        })
    }

    fn delete_security_group<'a>(&'a self, group_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.fail_or("delete_security_group")?;
            self.lock()
                .security_groups
                .remove(group_id)
                .map(|_| ())
                .ok_or_else(|| ProviderError::not_found(group_id))
        })
    }

    fn get_subnet<'a>(&'a self, subnet_id: &'a str) -> ProviderFuture<'a, SubnetInfo> {
        Box::pin(async move {
            self.fail_or("get_subnet")?;
            self.lock()
                .subnets
                .get(subnet_id)
                .cloned()
                .ok_or_else(|| ProviderError::not_found(subnet_id))
        })
    }

    fn get_network<'a>(&'a self, network_id: &'a str) -> ProviderFuture<'a, NetworkInfo> {
        Box::pin(async move {
            self.fail_or("get_network")?;
            self.lock()
                .networks
                .get(network_id)
                .cloned()
                .ok_or_else(|| ProviderError::not_found(network_id))
        })
    }

    fn get_security_group<'a>(
        &'a self,
        group_id: &'a str,
    ) -> ProviderFuture<'a, SecurityGroupInfo> {
        Box::pin(async move {
            self.fail_or("get_security_group")?;
            self.lock()
                .security_groups
                .get(group_id)
                .cloned()
                .ok_or_else(|| ProviderError::not_found(group_id))
        })
    }

    fn create_tags<'a>(
        &'a self,
        resource_id: &'a str,
        tags: &'a BTreeMap<String, String>,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.fail_or("create_tags")?;
            let mut state = self.lock();
            let entry = state.tags.entry(resource_id.to_owned()).or_default();
            for (key, value) in tags {
                entry.insert(key.clone(), value.clone());
            }
            Ok(())
        })
    }

    fn get_console_output<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> ProviderFuture<'a, ConsoleOutput> {
        Box::pin(async move {
            self.fail_or("get_console_output")?;
            let state = self.lock();
            if !state.instances.contains_key(instance_id) {
                return Err(ProviderError::not_found(instance_id));
            }
            Ok(ConsoleOutput {
                instance_id: instance_id.to_owned(),
                content: format!("console output for {instance_id}"),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_image(id: &str, name: &str) -> ImageInfo {
        ImageInfo {
            id: id.to_owned(),
            name: name.to_owned(),
            description: None,
            state: ImageState::Available,
            tags: BTreeMap::new(),
            storage: StorageBackend::Volume,
            virtualization: Virtualization::Hvm,
            root_device: String::from("/dev/sda1"),
            mappings: vec![DeviceMapping::from_snapshot("/dev/sda1", "snap-base", 10)],
        }
    }

    #[tokio::test]
    async fn run_instance_materialises_boot_disks() {
        let fake = FakeProvider::new();
        fake.seed_image(simple_image("img-1", "base"));
        let spec = LaunchSpec::new("img-1", "vm", "n1-standard-4", "zone-a");
        let instance = fake.run_instance(&spec).await.expect("launch");
        assert_eq!(instance.state, InstanceState::Running);
        assert_eq!(fake.disk_count(), 1);
        fake.delete_instance(&instance.id).await.expect("delete");
        assert_eq!(fake.disk_count(), 0);
        assert_eq!(fake.instance_count(), 0);
    }

    #[tokio::test]
    async fn injected_failure_fires_once() {
        let fake = FakeProvider::new();
        fake.seed_image(simple_image("img-1", "base"));
        fake.fail_next(
            "get_image",
            ProviderError::new(ProviderErrorKind::Throttled, "rate"),
        );
        let first = fake.get_image("img-1").await;
        assert!(first.is_err());
        let second = fake.get_image("img-1").await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn deleting_missing_resources_reports_not_found() {
        let fake = FakeProvider::new();
        let err = fake.delete_disk("disk-nope").await.expect_err("missing");
        assert!(err.is_not_found());
    }
}
