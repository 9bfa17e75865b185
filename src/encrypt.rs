//! First-time encryption of a guest image.
//!
//! The workflow launches a Bracket encryptor instance with two extra
//! volumes: a working copy of the guest's root and an empty target sized
//! for the crypto policy. The in-guest agent copies and encrypts the data,
//! the workflow snapshots the result together with the metavisor boot
//! volumes, and registers the final image. Every transient resource is
//! registered with the tracker the moment it exists, and cleanup runs on
//! every exit path.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::info;

use crate::instance_config::{InstanceConfig, InstanceMode};
use crate::naming::{self, generate_image_name};
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
    validate_encryptor_image, validate_guest_image, validate_network_scope, validate_status_port,
    validate_target_name,
};
use crate::workflow::{
    DEVICE_GUEST_ROOT, DEVICE_MV_GRUB, DEVICE_MV_LOG, DEVICE_MV_ROOT, DEVICE_SOURCE,
    DEVICE_TARGET, NAME_ENCRYPTED_ROOT_SNAPSHOT, NAME_ENCRYPTOR, Progress, WorkflowError,
    WorkflowState, WorkflowTimeouts, ensure_security_groups, launch_tracked_instance,
    report_console_output, save_log_snapshot, snapshot_metavisor_volumes,
};

/// Default machine type for the encryptor instance.
pub const DEFAULT_INSTANCE_TYPE: &str = "n1-standard-4";

/// Parameters of one encrypt run.
#[derive(Clone, Debug)]
pub struct EncryptRequest {
    /// Image to encrypt.
    pub guest_image_id: String,
    /// Encryptor image to do the work.
    pub encryptor_image_id: String,
    /// Explicit name for the output image; derived from the guest name when
    /// absent.
    pub encrypted_image_name: Option<String>,
    /// Target zone.
    pub zone: String,
    /// Network/VPC the encryptor launches into, if any.
    pub network_id: Option<String>,
    /// Subnet the encryptor launches into, if any.
    pub subnet_id: Option<String>,
    /// Security groups for the encryptor; a temporary one is created when
    /// empty.
    pub security_group_ids: Vec<String>,
    /// Machine type for the encryptor.
    pub instance_type: String,
    /// Port the status endpoint listens on.
    pub status_port: u16,
    /// Encryption algorithm selector.
    pub crypto_policy: CryptoPolicy,
    /// JWT passed through to the agent.
    pub identity_token: Option<String>,
    /// NTP servers for the metavisor clock.
    pub ntp_servers: Vec<String>,
    /// Proxy configuration document, already loaded.
    pub proxy_config: Option<String>,
    /// CA certificate PEM, already loaded.
    pub ca_cert: Option<String>,
    /// Whether preconditions are checked before provisioning.
    pub validate: bool,
    /// Keep the encryptor instance (and its disks) when the run fails, for
    /// interactive debugging.
    pub keep_encryptor: bool,
    /// Snapshot the encryptor's log volume when the agent fails.
    pub save_encryptor_logs: bool,
    /// Extra tags merged over the session defaults.
    pub extra_tags: BTreeMap<String, String>,
}

impl EncryptRequest {
    /// Creates a request with defaults for the optional knobs.
    #[must_use]
    pub fn new(
        guest_image_id: impl Into<String>,
        encryptor_image_id: impl Into<String>,
        zone: impl Into<String>,
    ) -> Self {
        Self {
            guest_image_id: guest_image_id.into(),
            encryptor_image_id: encryptor_image_id.into(),
            encrypted_image_name: None,
            zone: zone.into(),
            network_id: None,
            subnet_id: None,
            security_group_ids: Vec::new(),
            instance_type: DEFAULT_INSTANCE_TYPE.to_owned(),
            status_port: DEFAULT_STATUS_PORT,
            crypto_policy: CryptoPolicy::Gcm,
            identity_token: None,
            ntp_servers: Vec::new(),
            proxy_config: None,
            ca_cert: None,
            validate: true,
            keep_encryptor: false,
            save_encryptor_logs: true,
            extra_tags: BTreeMap::new(),
        }
    }
}

/// Orchestrates encrypt runs against a provider and a status endpoint.
pub struct EncryptWorkflow {
    provider: Arc<dyn CloudProvider>,
    status_factory: StatusClientFactory,
    sleeper: Arc<dyn Sleeper>,
    timeouts: WorkflowTimeouts,
}

impl EncryptWorkflow {
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

    /// Runs the workflow and returns the new image's id.
    ///
    /// Cleanup of transient resources runs on every exit path after
    /// validation; on success exactly one image survives, on failure none.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError`] describing the step that failed; cleanup
    /// has already run by the time the error is returned.
    pub async fn run(&self, request: &EncryptRequest) -> Result<String, WorkflowError> {
        let session = Session::new(
            &request.zone,
            &request.guest_image_id,
            &request.encryptor_image_id,
            request.crypto_policy,
        )
        .with_extra_tags(request.extra_tags.clone());
        info!("starting encryptor session {}", session.id);
        let mut progress = Progress::new(&session.id);

        let (guest, name) = self.validate(request, &session, &progress).await?;
        progress.advance(WorkflowState::Validated);

        let mut tracker = ResourceTracker::new(&session.id);
        let outcome = self
            .provision(request, &session, &guest, &name, &mut tracker, &mut progress)
            .await;

        if let Err(err) = &outcome {
            progress.fail(err);
            if request.keep_encryptor {
                info!("keeping encryptor resources for debugging as requested");
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

    async fn validate(
        &self,
        request: &EncryptRequest,
        session: &Session,
        progress: &Progress,
    ) -> Result<(ImageInfo, String), WorkflowError> {
        let provider = self.provider.as_ref();
        validate_status_port(request.status_port)?;
        let guest = if request.validate {
            let guest = validate_guest_image(provider, &request.guest_image_id).await?;
            validate_encryptor_image(provider, &request.encryptor_image_id).await?;
            validate_network_scope(
                provider,
                request.network_id.as_deref(),
                request.subnet_id.as_deref(),
                &request.security_group_ids,
            )
            .await?;
            guest
        } else {
            info!("skipping image validation");
            provider
                .get_image(&request.guest_image_id)
                .await
                .map_err(|err| progress.provider_err(err))?
        };
        let name = match &request.encrypted_image_name {
            Some(explicit) => {
                if request.validate {
                    validate_target_name(provider, explicit).await?;
                } else {
                    naming::validate_image_name(explicit)
                        .map_err(crate::validation::ValidationError::from)?;
                }
                explicit.clone()
            }
            None => generate_image_name(None, &guest.name, &session.id),
        };
        Ok((guest, name))
    }

    #[expect(
        clippy::too_many_lines,
        reason = "the provisioning sequence reads best as one linear story"
    )]
    async fn provision(
        &self,
        request: &EncryptRequest,
        session: &Session,
        guest: &ImageInfo,
        name: &str,
        tracker: &mut ResourceTracker,
        progress: &mut Progress,
    ) -> Result<String, WorkflowError> {
        let provider = self.provider.as_ref();
        let sleeper = self.sleeper.as_ref();
        let tags = session.default_tags();

        // Working copy of the guest root plus the empty encrypted target.
        let source_disk = provider
            .create_disk(&DiskSpec {
                name: session.resource_name("guest"),
                zone: session.zone.clone(),
                size_gb: None,
                source: DiskSource::Image(guest.id.clone()),
            })
            .await
            .map_err(|err| progress.provider_err(err))?;
        tracker.register(ResourceKind::Disk, &source_disk.id);
        provider
            .create_tags(&source_disk.id, &tags)
            .await
            .map_err(|err| progress.provider_err(err))?;

        let target_size = request
            .crypto_policy
            .encrypted_disk_size_gb(source_disk.size_gb);
        let target_disk = provider
            .create_disk(&DiskSpec {
                name: session.resource_name("encrypted"),
                zone: session.zone.clone(),
                size_gb: Some(target_size),
                source: DiskSource::Blank,
            })
            .await
            .map_err(|err| progress.provider_err(err))?;
        tracker.register(ResourceKind::Disk, &target_disk.id);
        provider
            .create_tags(&target_disk.id, &tags)
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

        let mut config = InstanceConfig::new(
            InstanceMode::Creator,
            &session.id,
            request.crypto_policy,
        )
        .with_identity_token(request.identity_token.clone())
        .with_ntp_servers(request.ntp_servers.clone());
        config.proxy_config = request.proxy_config.clone();
        config.ca_cert = request.ca_cert.clone();
        let user_data = config.make_gzipped_userdata()?;

        let mut launch = LaunchSpec::new(
            &request.encryptor_image_id,
            session.resource_name("encryptor"),
            &request.instance_type,
            &session.zone,
        );
        launch.network_id = request.network_id.clone();
        launch.subnet_id = request.subnet_id.clone();
        launch.security_group_ids = groups.ids.clone();
        launch.user_data = Some(user_data);
        launch.disks = vec![
            DiskAttachment {
                disk_id: source_disk.id.clone(),
                device: DEVICE_SOURCE.to_owned(),
            },
            DiskAttachment {
                disk_id: target_disk.id.clone(),
                device: DEVICE_TARGET.to_owned(),
            },
        ];
        info!(
            "launching encryptor instance from {} with source {}",
            request.encryptor_image_id, source_disk.id
        );
        let launched = launch_tracked_instance(
            provider,
            sleeper,
            session,
            tracker,
            &launch,
            NAME_ENCRYPTOR,
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
            "waiting for encryption service on {} (port {})",
            instance.id, request.status_port
        );
        let encrypted = match wait_for_encryptor_up(
            status_client.as_ref(),
            sleeper,
            self.timeouts.encryptor_up,
        )
        .await
        {
            Ok(_) => {
                info!("creating encrypted root drive");
                wait_for_encryption(status_client.as_ref(), sleeper, self.timeouts.encryption)
                    .await
            }
            Err(err) => Err(err),
        };
        if let Err(err) = encrypted {
            report_console_output(provider, &instance.id).await;
            if request.save_encryptor_logs {
                save_log_snapshot(provider, &instance).await;
            }
            return Err(progress.encryption_err(err));
        }
        info!("encrypted root drive is ready");

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
        // The agent may rearrange attachments while running; re-read them.
        let stopped = provider
            .get_instance(&instance.id)
            .await
            .map_err(|err| progress.provider_err(err))?;

        let description = format!("Based on {}", guest.id);
        let encrypted_snap = provider
            .create_snapshot(&target_disk.id, NAME_ENCRYPTED_ROOT_SNAPSHOT, &description)
            .await
            .map_err(|err| progress.provider_err(err))?;
        tracker.register(ResourceKind::Snapshot, &encrypted_snap.id);
        let mv = snapshot_metavisor_volumes(provider, tracker, &stopped, &description)
            .await
            .map_err(|err| progress.provider_err(err))?;
        let mut snapshot_ids = mv.ids();
        snapshot_ids.push(encrypted_snap.id.clone());
        wait::wait_for_snapshots(provider, sleeper, &snapshot_ids, self.timeouts.resource_wait)
            .await
            .map_err(|err| progress.wait_err(err))?;
        progress.advance(WorkflowState::SnapshotTaken);

        let mut mappings = vec![
            DeviceMapping::from_snapshot(DEVICE_MV_GRUB, &mv.grub.id, mv.grub.size_gb),
            DeviceMapping::from_snapshot(DEVICE_MV_ROOT, &mv.root.id, mv.root.size_gb),
            DeviceMapping::from_snapshot(DEVICE_MV_LOG, &mv.log.id, mv.log.size_gb),
            DeviceMapping::from_snapshot(
                DEVICE_GUEST_ROOT,
                &encrypted_snap.id,
                encrypted_snap.size_gb,
            ),
        ];
        for mapping in &guest.mappings {
            if mapping.ephemeral {
                info!("carrying forward ephemeral mapping at {}", mapping.device);
                mappings.push(mapping.clone());
            }
        }
        let image = provider
            .register_image(&ImageSpec {
                name: name.to_owned(),
                description: Some(description_from_image(guest)),
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

        // The image and its backing snapshots are the product now; they
        // must not be swept with the transient resources.
        tracker.release(ResourceKind::Image, &image.id);
        for snapshot_id in &snapshot_ids {
            tracker.release(ResourceKind::Snapshot, snapshot_id);
        }

        info!("created encrypted image {} based on {}", image.id, guest.id);
        Ok(image.id)
    }
}

/// Derives the output image description from the guest image.
#[must_use]
pub fn description_from_image(guest: &ImageInfo) -> String {
    guest.description.as_ref().map_or_else(
        || format!("Based on {}, encrypted by Bracket Computing", guest.id),
        |existing| {
            naming::append_suffix(
                existing,
                &format!(" - based on {}, encrypted by Bracket Computing", guest.id),
                255,
            )
        },
    )
}
