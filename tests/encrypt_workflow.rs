//! End-to-end tests of the encrypt workflow against the in-memory provider.

use std::sync::Arc;

use brkt_imager::provider::{FakeProvider, ProviderError, ProviderErrorKind};
use brkt_imager::test_support::{ScriptedStatusClient, encryptor_image, guest_image};
use brkt_imager::{
    CloudProvider, EncryptRequest, EncryptWorkflow, NoopSleeper, TAG_ENCRYPTOR,
    TAG_ENCRYPTOR_IMAGE, TAG_ENCRYPTOR_SESSION_ID, WorkflowError,
};

const ZONE: &str = "us-central1-a";

fn seeded_provider() -> Arc<FakeProvider> {
    let fake = Arc::new(FakeProvider::new());
    fake.seed_image(guest_image("guest-1", "ubuntu", 10));
    fake.seed_image(encryptor_image("enc-1"));
    fake
}

fn workflow(
    fake: &Arc<FakeProvider>,
    factory: brkt_imager::StatusClientFactory,
) -> EncryptWorkflow {
    let provider: Arc<dyn CloudProvider> = fake.clone();
    EncryptWorkflow::new(provider, factory).with_sleeper(Arc::new(NoopSleeper))
}

#[tokio::test]
async fn successful_run_registers_exactly_one_tagged_image() {
    let fake = seeded_provider();
    let wf = workflow(&fake, ScriptedStatusClient::success_factory());
    let request = EncryptRequest::new("guest-1", "enc-1", ZONE);

    let image_id = wf.run(&request).await.expect("encrypt should succeed");

    // Exactly one new image beyond the two seeded inputs.
    assert_eq!(fake.image_ids().len(), 3);
    let image = fake.get_image(&image_id).await.expect("image exists");
    assert!(
        image.name.starts_with("ubuntu (encrypted "),
        "unexpected name: {}",
        image.name
    );
    let tags = fake.tags_for(&image_id);
    assert_eq!(tags.get(TAG_ENCRYPTOR).map(String::as_str), Some("True"));
    assert_eq!(
        tags.get(TAG_ENCRYPTOR_IMAGE).map(String::as_str),
        Some("enc-1")
    );
    assert!(tags.contains_key(TAG_ENCRYPTOR_SESSION_ID));

    // No transient resources survive: no instances, disks, or groups. The
    // four snapshots that back the image remain by design.
    assert_eq!(fake.instance_count(), 0);
    assert_eq!(fake.disk_count(), 0);
    assert_eq!(fake.security_group_count(), 0);
    assert_eq!(fake.snapshot_count(), 4);
}

#[tokio::test]
async fn output_layout_carries_metavisor_and_guest_volumes() {
    let fake = seeded_provider();
    let wf = workflow(&fake, ScriptedStatusClient::success_factory());
    let request = EncryptRequest::new("guest-1", "enc-1", ZONE);

    let image_id = wf.run(&request).await.expect("encrypt should succeed");
    let image = fake.get_image(&image_id).await.expect("image exists");

    for device in ["/dev/sda1", "/dev/sda2", "/dev/sda3", "/dev/sda5"] {
        let mapping = image
            .mapping_for(device)
            .unwrap_or_else(|| panic!("missing mapping for {device}"));
        assert!(mapping.snapshot_id.is_some(), "{device} not snapshot-backed");
    }
    // GCM target disk: guest 10 GB -> 21 GB.
    let guest_mapping = image.mapping_for("/dev/sda5").expect("guest mapping");
    assert_eq!(guest_mapping.size_gb, 21);
}

#[tokio::test]
async fn agent_failure_cleans_up_everything() {
    let fake = seeded_provider();
    let wf = workflow(&fake, ScriptedStatusClient::failure_factory("policy_violation"));
    let mut request = EncryptRequest::new("guest-1", "enc-1", ZONE);
    request.save_encryptor_logs = false;

    let err = wf.run(&request).await.expect_err("agent failure");
    assert!(
        matches!(err, WorkflowError::Encryption { .. }),
        "unexpected error: {err}"
    );
    assert!(!err.is_timeout());

    assert_eq!(fake.image_ids().len(), 2, "no image may survive a failure");
    assert_eq!(fake.instance_count(), 0);
    assert_eq!(fake.disk_count(), 0);
    assert_eq!(fake.snapshot_count(), 0);
    assert_eq!(fake.security_group_count(), 0);
}

#[tokio::test]
async fn agent_failure_keeps_log_snapshot_when_requested() {
    let fake = seeded_provider();
    let wf = workflow(&fake, ScriptedStatusClient::failure_factory("policy_violation"));
    let request = EncryptRequest::new("guest-1", "enc-1", ZONE);

    wf.run(&request).await.expect_err("agent failure");

    // Only the deliberately preserved log snapshot remains.
    assert_eq!(fake.snapshot_count(), 1);
    assert_eq!(fake.instance_count(), 0);
    assert_eq!(fake.disk_count(), 0);
}

#[tokio::test]
async fn stuck_status_endpoint_fails_with_timeout_classification() {
    let fake = seeded_provider();
    let wf = workflow(&fake, ScriptedStatusClient::stuck_factory()).with_timeouts(
        brkt_imager::WorkflowTimeouts {
            resource_wait: std::time::Duration::from_secs(5),
            encryptor_up: std::time::Duration::from_secs(5),
            encryption: std::time::Duration::from_millis(0),
        },
    );
    let mut request = EncryptRequest::new("guest-1", "enc-1", ZONE);
    request.save_encryptor_logs = false;

    let err = wf.run(&request).await.expect_err("should time out");
    assert!(err.is_timeout(), "expected timeout classification: {err}");
    assert_eq!(fake.instance_count(), 0);
    assert_eq!(fake.disk_count(), 0);
}

#[tokio::test]
async fn provider_failure_mid_flow_still_cleans_up() {
    let fake = seeded_provider();
    fake.fail_next(
        "create_snapshot",
        ProviderError::new(ProviderErrorKind::Unauthorized, "denied"),
    );
    let wf = workflow(&fake, ScriptedStatusClient::success_factory());
    let mut request = EncryptRequest::new("guest-1", "enc-1", ZONE);
    request.save_encryptor_logs = false;

    let err = wf.run(&request).await.expect_err("snapshot denied");
    assert!(matches!(err, WorkflowError::Provider { .. }));
    assert_eq!(fake.image_ids().len(), 2);
    assert_eq!(fake.instance_count(), 0);
    assert_eq!(fake.disk_count(), 0);
    assert_eq!(fake.snapshot_count(), 0);
    assert_eq!(fake.security_group_count(), 0);
}

#[tokio::test]
async fn keep_encryptor_retains_instance_and_disks_on_failure() {
    let fake = seeded_provider();
    let wf = workflow(&fake, ScriptedStatusClient::failure_factory("boom"));
    let mut request = EncryptRequest::new("guest-1", "enc-1", ZONE);
    request.keep_encryptor = true;
    request.save_encryptor_logs = false;

    wf.run(&request).await.expect_err("agent failure");

    assert_eq!(fake.instance_count(), 1, "encryptor should be retained");
    assert!(fake.disk_count() > 0, "encryptor disks should be retained");
    // The temporary security group is still transient.
    assert_eq!(fake.security_group_count(), 0);
}

#[tokio::test]
async fn already_encrypted_guest_fails_before_any_resource_is_created() {
    let fake = Arc::new(FakeProvider::new());
    let mut image = guest_image("guest-1", "ubuntu", 10);
    image
        .tags
        .insert(TAG_ENCRYPTOR.to_owned(), String::from("True"));
    fake.seed_image(image);
    fake.seed_image(encryptor_image("enc-1"));

    let wf = workflow(&fake, ScriptedStatusClient::success_factory());
    let err = wf
        .run(&EncryptRequest::new("guest-1", "enc-1", ZONE))
        .await
        .expect_err("validation failure");
    assert!(matches!(err, WorkflowError::Validation(_)));
    assert_eq!(fake.instance_count(), 0);
    assert_eq!(fake.disk_count(), 0);
    assert_eq!(fake.snapshot_count(), 0);
    assert_eq!(fake.security_group_count(), 0);
}

#[tokio::test]
async fn explicit_name_collision_is_rejected() {
    let fake = seeded_provider();
    fake.seed_image(guest_image("img-existing", "taken-name", 5));
    let wf = workflow(&fake, ScriptedStatusClient::success_factory());
    let mut request = EncryptRequest::new("guest-1", "enc-1", ZONE);
    request.encrypted_image_name = Some(String::from("taken-name"));

    let err = wf.run(&request).await.expect_err("name collision");
    assert!(matches!(err, WorkflowError::Validation(_)));
}

#[tokio::test]
async fn explicit_security_groups_are_not_deleted() {
    let fake = seeded_provider();
    fake.seed_security_group("sg-mine", Some("vpc-1"));
    fake.seed_subnet("subnet-1", "vpc-1", ZONE);
    let wf = workflow(&fake, ScriptedStatusClient::success_factory());
    let mut request = EncryptRequest::new("guest-1", "enc-1", ZONE);
    request.subnet_id = Some(String::from("subnet-1"));
    request.security_group_ids = vec![String::from("sg-mine")];

    wf.run(&request).await.expect("encrypt should succeed");
    assert_eq!(fake.security_group_count(), 1, "caller's group must survive");
}

#[tokio::test]
async fn session_tagged_resources_are_all_released() {
    let fake = seeded_provider();
    let wf = workflow(&fake, ScriptedStatusClient::success_factory());
    let request = EncryptRequest::new("guest-1", "enc-1", ZONE);

    let image_id = wf.run(&request).await.expect("encrypt should succeed");
    let session_id = fake
        .tags_for(&image_id)
        .get(TAG_ENCRYPTOR_SESSION_ID)
        .cloned()
        .expect("session tag");
    let leftovers = fake.live_resources_tagged(TAG_ENCRYPTOR_SESSION_ID, &session_id);
    assert!(
        leftovers.is_empty(),
        "transient resources still tagged with the session: {leftovers:?}"
    );
}
