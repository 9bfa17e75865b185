//! Metavisor refresh of an already-encrypted guest image.
//!
//! The update workflow reuses the encrypt skeleton but starts from an
//! encrypted image: it verifies the Bracket tags, boots the *new* encryptor
//! in updater mode against a working copy of the guest's encrypted volume,
//! and re-registers the image under a name whose `(encrypted <session>)`
//! suffix carries the new session id.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::info;

use crate::instance_config::{InstanceConfig, InstanceMode};
use crate::naming::{self, updated_image_name};
use crate::provider::{
    CloudProvider, DeviceMapping, DiskAttachment, DiskSource, DiskSpec, ImageInfo, ImageSpec,
    InstanceState, LaunchSpec, wait,
};
use crate::retry::{Sleeper, TokioSleeper};
use crate::session::{CryptoPolicy, Session};
use crate::status::{
    DEFAULT_STATUS_PORT, StatusClientFactory, wait_for_encryption, wait_for_encryptor_up,
};
use crate::tracker::{ResourceKind, ResourceTracker};
use crate::validation::{
    ValidationError, validate_encrypted_guest, validate_encryptor_image, validate_network_scope,
    validate_status_port, validate_target_name,
};
use crate::workflow::{
    DEVICE_GUEST_ROOT, DEVICE_MV_GRUB, DEVICE_MV_LOG, DEVICE_MV_ROOT, NAME_METAVISOR_UPDATER,
    Progress, WorkflowError, WorkflowState, WorkflowTimeouts, ensure_security_groups,
    launch_tracked_instance, report_console_output, save_log_snapshot,
    snapshot_metavisor_volumes,
};

/// Default machine type for the updater instance.
pub const DEFAULT_UPDATER_INSTANCE_TYPE: &str = "n1-standard-4";

/// Parameters of one update run.
#[derive(Clone, Debug)]
pub struct UpdateRequest {
    /// Encrypted image to refresh.
    pub encrypted_image_id: String,
    /// New encryptor image carrying the metavisor release.
    pub encryptor_image_id: String,
    /// Explicit name for the refreshed image; rewritten from the existing
    /// name when absent.
    pub updated_image_name: Option<String>,
    /// Target zone.
    pub zone: String,
    /// Network/VPC the updater launches into, if any.
    pub network_id: Option<String>,
    /// Subnet the updater launches into, if any.
    pub subnet_id: Option<String>,
    /// Security groups for the updater; a temporary one is created when
    /// empty.
    pub security_group_ids: Vec<String>,
    /// Machine type for the updater.
    pub instance_type: String,
    /// Port the status endpoint listens on.
    pub status_port: u16,
    /// JWT passed through to the agent.
    pub identity_token: Option<String>,
    /// NTP servers for the metavisor clock.
    pub ntp_servers: Vec<String>,
    /// Whether the optional preconditions are checked. Tag validation on
    /// the encrypted guest always runs.
    pub validate: bool,
    /// Keep the updater instance (and its disks) when the run fails.
    pub keep_encryptor: bool,
    /// Snapshot the updater's log volume when the agent fails.
    pub save_encryptor_logs: bool,
    /// Extra tags merged over the session defaults.
    pub extra_tags: BTreeMap<String, String>,
}

impl UpdateRequest {
    /// Creates a request with defaults for the optional knobs.
    #[must_use]
    pub fn new(
        encrypted_image_id: impl Into<String>,
        encryptor_image_id: impl Into<String>,
        zone: impl Into<String>,
    ) -> Self {
        Self {
            encrypted_image_id: encrypted_image_id.into(),
            encryptor_image_id: encryptor_image_id.into(),
            updated_image_name: None,
            zone: zone.into(),
            network_id: None,
            subnet_id: None,
            security_group_ids: Vec::new(),
            instance_type: DEFAULT_UPDATER_INSTANCE_TYPE.to_owned(),
            status_port: DEFAULT_STATUS_PORT,
            identity_token: None,
            ntp_servers: Vec::new(),
            validate: true,
            keep_encryptor: false,
            save_encryptor_logs: true,
            extra_tags: BTreeMap::new(),
        }
    }
}

/// Orchestrates update runs against a provider and a status endpoint.
pub struct UpdateWorkflow {
    provider: Arc<dyn CloudProvider>,
    status_factory: StatusClientFactory,
    sleeper: Arc<dyn Sleeper>,
    timeouts: WorkflowTimeouts,
}

impl UpdateWorkflow {
    /// Creates a workflow using the real tokio sleeper.
    #[must_use]
    pub fn new(provider: Arc<dyn CloudProvider>, status_factory: StatusClientFactory) -> Self {
        Self {
            provider,
            status_factory,
            sleeper: Arc::new(TokioSleeper),
            timeouts: WorkflowTimeouts::default(),
        }
    }

    /// Replaces the sleeper. Tests use this to skip real waiting.
    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Overrides the workflow time budgets.
    #[must_use]
    pub const fn with_timeouts(mut self, timeouts: WorkflowTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Runs the workflow and returns the refreshed image's id.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError`]; as with encrypt, cleanup has already run
    /// when the error surfaces, and tag validation failures occur before
    /// any instance is launched.
    pub async fn run(&self, request: &UpdateRequest) -> Result<String, WorkflowError> {
        let provider = self.provider.as_ref();
        validate_status_port(request.status_port)?;

        // Tag validation is not optional: updating a non-Bracket image
        // would produce garbage with convincing tags.
        let guest = validate_encrypted_guest(
            provider,
            &request.encrypted_image_id,
            &request.encryptor_image_id,
        )
        .await?;
        let old_session = guest
            .tags
            .get(crate::session::TAG_ENCRYPTOR_SESSION_ID)
            .cloned()
            .unwrap_or_default();

        let session = Session::new(
            &request.zone,
            &request.encrypted_image_id,
            &request.encryptor_image_id,
            CryptoPolicy::Gcm,
        )
        .with_extra_tags(request.extra_tags.clone());
        info!(
            "starting updater session {} (previous session {old_session})",
            session.id
        );
        let mut progress = Progress::new(&session.id);

        if request.validate {
            validate_encryptor_image(provider, &request.encryptor_image_id).await?;
            validate_network_scope(
                provider,
                request.network_id.as_deref(),
                request.subnet_id.as_deref(),
                &request.security_group_ids,
            )
            .await?;
        }
        let name = match &request.updated_image_name {
            Some(explicit) => {
                if request.validate {
                    validate_target_name(provider, explicit).await?;
                } else {
                    naming::validate_image_name(explicit).map_err(ValidationError::from)?;
                }
                explicit.clone()
            }
            None => {
                let rewritten = updated_image_name(&guest.name, &session.id);
                naming::validate_image_name(&rewritten).map_err(ValidationError::from)?;
                rewritten
            }
        };
        info!(
            "updating {} with new metavisor {}",
            request.encrypted_image_id, request.encryptor_image_id
        );
        progress.advance(WorkflowState::Validated);

        let mut tracker = ResourceTracker::new(&session.id);
        let outcome = self
            .provision(request, &session, &guest, &name, &mut tracker, &mut progress)
            .await;

        if let Err(err) = &outcome {
            progress.fail(err);
            if request.keep_encryptor {
                info!("keeping updater resources for debugging as requested");
                tracker.retain_all(ResourceKind::Instance);
                tracker.retain_all(ResourceKind::Disk);
            }
        }
        let report = tracker
            .cleanup(self.provider.as_ref(), self.sleeper.as_ref())
            .await;
        if !report.is_clean() {
            log::warn!(
                "cleanup could not remove {} resources; they remain tagged with session {}",
                report.failures.len(),
                session.id
            );
        }
        progress.advance(WorkflowState::CleanedUp);
        outcome
    }

    async fn provision(
        &self,
        request: &UpdateRequest,
        session: &Session,
        guest: &ImageInfo,
        name: &str,
        tracker: &mut ResourceTracker,
        progress: &mut Progress,
    ) -> Result<String, WorkflowError> {
        let provider = self.provider.as_ref();
        let sleeper = self.sleeper.as_ref();
        let tags = session.default_tags();

        let guest_mapping = guest
            .mapping_for(DEVICE_GUEST_ROOT)
            .and_then(|mapping| mapping.snapshot_id.clone())
            .ok_or_else(|| {
                WorkflowError::Validation(ValidationError::MissingGuestVolume {
                    image_id: guest.id.clone(),
                    device: DEVICE_GUEST_ROOT.to_owned(),
                })
            })?;

        // Working copy of the encrypted guest volume.
        let guest_disk = provider
            .create_disk(&DiskSpec {
                name: session.resource_name("guest"),
                zone: session.zone.clone(),
                size_gb: None,
                source: DiskSource::Snapshot(guest_mapping),
            })
            .await
            .map_err(|err| progress.provider_err(err))?;
        tracker.register(ResourceKind::Disk, &guest_disk.id);
        provider
            .create_tags(&guest_disk.id, &tags)
            .await
            .map_err(|err| progress.provider_err(err))?;

        let groups = ensure_security_groups(
            provider,
            session,
            tracker,
            request.network_id.as_deref(),
            request.subnet_id.as_deref(),
            &request.security_group_ids,
            request.status_port,
        )
        .await
        .map_err(|err| progress.provider_err(err))?;

        let config = InstanceConfig::new(InstanceMode::Updater, &session.id, CryptoPolicy::Gcm)
            .with_identity_token(request.identity_token.clone())
            .with_ntp_servers(request.ntp_servers.clone());
        let user_data = config.make_gzipped_userdata()?;

        let mut launch = LaunchSpec::new(
            &request.encryptor_image_id,
            session.resource_name("updater"),
            &request.instance_type,
            &session.zone,
        );
        launch.network_id = request.network_id.clone();
        launch.subnet_id = request.subnet_id.clone();
        launch.security_group_ids = groups.ids.clone();
        launch.user_data = Some(user_data);
        launch.disks = vec![DiskAttachment {
            disk_id: guest_disk.id.clone(),
            device: DEVICE_GUEST_ROOT.to_owned(),
        }];
        info!(
            "launching metavisor updater from {}",
            request.encryptor_image_id
        );
        let launched = launch_tracked_instance(
            provider,
            sleeper,
            session,
            tracker,
            &launch,
            NAME_METAVISOR_UPDATER,
            groups.temporary,
        )
        .await
        .map_err(|err| progress.provider_err(err))?;
        progress.advance(WorkflowState::EncryptorLaunched);

        let instance = wait::wait_for_instance(
            provider,
            sleeper,
            &launched.id,
            InstanceState::Running,
            self.timeouts.resource_wait,
        )
        .await
        .map_err(|err| progress.wait_err(err))?;
        progress.advance(WorkflowState::GuestAttached);
        progress.advance(WorkflowState::Encrypting);

        let status_client = (self.status_factory)(instance.candidate_ips(), request.status_port);
        info!(
            "waiting for update service on {} (port {})",
            instance.id, request.status_port
        );
        let updated = match wait_for_encryptor_up(
            status_client.as_ref(),
            sleeper,
            self.timeouts.encryptor_up,
        )
        .await
        {
            Ok(_) => {
                wait_for_encryption(status_client.as_ref(), sleeper, self.timeouts.encryption)
                    .await
            }
            Err(err) => Err(err),
        };
        if let Err(err) = updated {
            report_console_output(provider, &instance.id).await;
            if request.save_encryptor_logs {
                save_log_snapshot(provider, &instance).await;
            }
            return Err(progress.encryption_err(err));
        }

        provider
            .stop_instance(&instance.id)
            .await
            .map_err(|err| progress.provider_err(err))?;
        wait::wait_for_instance(
            provider,
            sleeper,
            &instance.id,
            InstanceState::Stopped,
            self.timeouts.resource_wait,
        )
        .await
        .map_err(|err| progress.wait_err(err))?;
        let stopped = provider
            .get_instance(&instance.id)
            .await
            .map_err(|err| progress.provider_err(err))?;

        let description = format!("Based on {}", guest.id);
        let mv = snapshot_metavisor_volumes(provider, tracker, &stopped, &description)
            .await
            .map_err(|err| progress.provider_err(err))?;
        let guest_snap = provider
            .create_snapshot(
                &guest_disk.id,
                crate::workflow::NAME_ENCRYPTED_ROOT_SNAPSHOT,
                &description,
            )
            .await
            .map_err(|err| progress.provider_err(err))?;
        tracker.register(ResourceKind::Snapshot, &guest_snap.id);
        let mut snapshot_ids = mv.ids();
        snapshot_ids.push(guest_snap.id.clone());
        wait::wait_for_snapshots(provider, sleeper, &snapshot_ids, self.timeouts.resource_wait)
            .await
            .map_err(|err| progress.wait_err(err))?;
        progress.advance(WorkflowState::SnapshotTaken);

        let mappings = vec![
            DeviceMapping::from_snapshot(DEVICE_MV_GRUB, &mv.grub.id, mv.grub.size_gb),
            DeviceMapping::from_snapshot(DEVICE_MV_ROOT, &mv.root.id, mv.root.size_gb),
            DeviceMapping::from_snapshot(DEVICE_MV_LOG, &mv.log.id, mv.log.size_gb),
            DeviceMapping::from_snapshot(DEVICE_GUEST_ROOT, &guest_snap.id, guest_snap.size_gb),
        ];
        let image = provider
            .register_image(&ImageSpec {
                name: name.to_owned(),
                description: guest.description.clone(),
                root_device: DEVICE_MV_GRUB.to_owned(),
                mappings,
                tags: tags.clone(),
            })
            .await
            .map_err(|err| progress.provider_err(err))?;
        tracker.register(ResourceKind::Image, &image.id);
        wait::wait_for_image(provider, sleeper, &image.id, self.timeouts.resource_wait)
            .await
            .map_err(|err| progress.wait_err(err))?;
        provider
            .create_tags(&image.id, &tags)
            .await
            .map_err(|err| progress.provider_err(err))?;
        progress.advance(WorkflowState::ImageRegistered);

        tracker.release(ResourceKind::Image, &image.id);
        for snapshot_id in &snapshot_ids {
            tracker.release(ResourceKind::Snapshot, snapshot_id);
        }

        info!(
            "updated encrypted image {} -> {} ({name})",
            guest.id, image.id
        );
        Ok(image.id)
    }
}
