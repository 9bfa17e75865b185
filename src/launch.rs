//! Boots an encrypted image as a regular metavisor instance.
//!
//! Unlike encrypt and update, the launched instance *is* the product, so
//! nothing is tracked for cleanup beyond the launch failing before the
//! instance reaches its running state.

use std::sync::Arc;

use log::info;

use crate::instance_config::{InstanceConfig, InstanceMode};
use crate::naming;
use crate::provider::{
    CloudProvider, DiskSource, DiskSpec, DiskAttachment, InstanceState, LaunchSpec, wait,
};
use crate::retry::{Sleeper, TokioSleeper};
use crate::session::{CryptoPolicy, make_nonce};
use crate::validation::ValidationError;
use crate::workflow::{WorkflowError, WorkflowState, WorkflowTimeouts, Progress};

/// Default machine type for launched metavisor instances.
pub const DEFAULT_LAUNCH_INSTANCE_TYPE: &str = "n1-standard-4";
/// Most scratch disks a single instance may request.
pub const MAX_SCRATCH_DISKS: usize = 8;

/// Device names scratch disks are presented at, in order.
const SCRATCH_DEVICES: [&str; MAX_SCRATCH_DISKS] = [
    "/dev/sdh", "/dev/sdi", "/dev/sdj", "/dev/sdk", "/dev/sdl", "/dev/sdm", "/dev/sdn",
    "/dev/sdo",
];

/// Parameters of one launch run.
#[derive(Clone, Debug)]
pub struct LaunchRequest {
    /// Encrypted image to boot.
    pub image_id: String,
    /// Explicit instance name; generated when absent.
    pub instance_name: Option<String>,
    /// Target zone.
    pub zone: String,
    /// Network/VPC the instance launches into, if any.
    pub network_id: Option<String>,
    /// Subnet the instance launches into, if any.
    pub subnet_id: Option<String>,
    /// Security groups for the instance.
    pub security_group_ids: Vec<String>,
    /// Machine type.
    pub instance_type: String,
    /// JWT passed through to the metavisor.
    pub identity_token: Option<String>,
    /// Scratch disks to create and attach.
    pub scratch_disks: usize,
    /// Whether the boot volume is discarded on termination.
    pub delete_boot: bool,
}

impl LaunchRequest {
    /// Creates a request with defaults for the optional knobs.
    #[must_use]
    pub fn new(image_id: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            image_id: image_id.into(),
            instance_name: None,
            zone: zone.into(),
            network_id: None,
            subnet_id: None,
            security_group_ids: Vec::new(),
            instance_type: DEFAULT_LAUNCH_INSTANCE_TYPE.to_owned(),
            identity_token: None,
            scratch_disks: 0,
            delete_boot: false,
        }
    }
}

/// Orchestrates launch runs.
pub struct LaunchWorkflow {
    provider: Arc<dyn CloudProvider>,
    sleeper: Arc<dyn Sleeper>,
    timeouts: WorkflowTimeouts,
}

impl LaunchWorkflow {
    /// Creates a workflow using the real tokio sleeper.
    #[must_use]
    pub fn new(provider: Arc<dyn CloudProvider>) -> Self {
        Self {
            provider,
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

    /// Runs the workflow and returns the new instance's id.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError`] when validation fails, the launch fails,
    /// or the instance never reaches its running state.
    pub async fn run(&self, request: &LaunchRequest) -> Result<String, WorkflowError> {
        let provider = self.provider.as_ref();
        if request.scratch_disks > MAX_SCRATCH_DISKS {
            return Err(WorkflowError::Validation(ValidationError::Provider(
                format!("a maximum of {MAX_SCRATCH_DISKS} scratch disks are supported"),
            )));
        }
        let nonce = make_nonce();
        let name = match &request.instance_name {
            Some(explicit) => {
                naming::validate_image_name(explicit).map_err(ValidationError::from)?;
                explicit.clone()
            }
            None => format!("brkt-metavisor-{nonce}"),
        };
        let mut progress = Progress::new(&nonce);
        progress.advance(WorkflowState::Validated);

        let config = InstanceConfig::new(InstanceMode::Metavisor, &nonce, CryptoPolicy::Gcm)
            .with_identity_token(request.identity_token.clone());
        let user_data = config.make_gzipped_userdata()?;

        let mut scratch = Vec::new();
        for (index, device) in SCRATCH_DEVICES
            .iter()
            .take(request.scratch_disks)
            .enumerate()
        {
            let disk = provider
                .create_disk(&DiskSpec {
                    name: format!("{name}-scratch-{index}"),
                    zone: request.zone.clone(),
                    size_gb: Some(375),
                    source: DiskSource::Blank,
                })
                .await
                .map_err(|err| progress.provider_err(err))?;
            scratch.push(DiskAttachment {
                disk_id: disk.id,
                device: (*device).to_owned(),
            });
        }

        let mut launch = LaunchSpec::new(
            &request.image_id,
            &name,
            &request.instance_type,
            &request.zone,
        );
        launch.network_id = request.network_id.clone();
        launch.subnet_id = request.subnet_id.clone();
        launch.security_group_ids = request.security_group_ids.clone();
        launch.user_data = Some(user_data);
        launch.disks = scratch;
        launch.delete_boot = request.delete_boot;

        info!("launching metavisor instance {name} from {}", request.image_id);
        let instance = provider
            .run_instance(&launch)
            .await
            .map_err(|err| progress.provider_err(err))?;
        progress.advance(WorkflowState::EncryptorLaunched);
        wait::wait_for_instance(
            provider,
            self.sleeper.as_ref(),
            &instance.id,
            InstanceState::Running,
            self.timeouts.resource_wait,
        )
        .await
        .map_err(|err| progress.wait_err(err))?;
        info!("launched metavisor instance {}", instance.id);
        Ok(instance.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::FakeProvider;
    use crate::retry::NoopSleeper;
    use crate::test_support::encrypted_guest_image;

    fn seeded() -> Arc<FakeProvider> {
        let fake = Arc::new(FakeProvider::new());
        fake.seed_image(encrypted_guest_image(
            "img-enc",
            "ubuntu (encrypted 1a2b3c4d)",
            "1a2b3c4d",
            "enc-1",
        ));
        fake
    }

    #[tokio::test]
    async fn launch_boots_the_image_and_returns_the_instance_id() {
        let fake = seeded();
        let provider: Arc<dyn crate::provider::CloudProvider> = fake.clone();
        let wf = LaunchWorkflow::new(provider).with_sleeper(Arc::new(NoopSleeper));
        let mut request = LaunchRequest::new("img-enc", "us-central1-a");
        request.scratch_disks = 2;

        let instance_id = wf.run(&request).await.expect("launch should succeed");
        assert!(instance_id.starts_with("i-"));
        assert_eq!(fake.instance_count(), 1);
    }

    #[tokio::test]
    async fn too_many_scratch_disks_are_rejected() {
        let fake = seeded();
        let provider: Arc<dyn crate::provider::CloudProvider> = fake.clone();
        let wf = LaunchWorkflow::new(provider).with_sleeper(Arc::new(NoopSleeper));
        let mut request = LaunchRequest::new("img-enc", "us-central1-a");
        request.scratch_disks = MAX_SCRATCH_DISKS + 1;

        let err = wf.run(&request).await.expect_err("limit exceeded");
        assert!(matches!(err, WorkflowError::Validation(_)));
        assert_eq!(fake.instance_count(), 0);
        assert_eq!(fake.disk_count(), 0);
    }

    #[tokio::test]
    async fn bad_instance_name_is_rejected() {
        let fake = seeded();
        let provider: Arc<dyn crate::provider::CloudProvider> = fake.clone();
        let wf = LaunchWorkflow::new(provider).with_sleeper(Arc::new(NoopSleeper));
        let mut request = LaunchRequest::new("img-enc", "us-central1-a");
        request.instance_name = Some(String::from("bad*name"));

        let err = wf.run(&request).await.expect_err("bad name");
        assert!(matches!(err, WorkflowError::Validation(_)));
    }
}
