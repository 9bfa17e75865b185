//! End-to-end tests of the update workflow against the in-memory provider.

use std::sync::Arc;

use brkt_imager::provider::FakeProvider;
use brkt_imager::test_support::{
    ScriptedStatusClient, encryptor_image, guest_image, seed_encrypted_guest,
};
use brkt_imager::validation::ValidationError;
use brkt_imager::{
    CloudProvider, NoopSleeper, TAG_ENCRYPTOR_IMAGE, TAG_ENCRYPTOR_SESSION_ID, UpdateRequest,
    UpdateWorkflow, WorkflowError,
};

const ZONE: &str = "us-central1-a";

fn workflow(
    fake: &Arc<FakeProvider>,
    factory: brkt_imager::StatusClientFactory,
) -> UpdateWorkflow {
    let provider: Arc<dyn CloudProvider> = fake.clone();
    UpdateWorkflow::new(provider, factory).with_sleeper(Arc::new(NoopSleeper))
}

#[tokio::test]
async fn update_rewrites_the_session_suffix_and_retags() {
    let fake = Arc::new(FakeProvider::new());
    seed_encrypted_guest(
        &fake,
        "guest-enc",
        "ubuntu (encrypted 11112222)",
        "11112222",
        "enc-old",
    );
    fake.seed_image(encryptor_image("enc-new"));

    let wf = workflow(&fake, ScriptedStatusClient::success_factory());
    let request = UpdateRequest::new("guest-enc", "enc-new", ZONE);
    let image_id = wf.run(&request).await.expect("update should succeed");

    let image = fake.get_image(&image_id).await.expect("image exists");
    assert!(
        image.name.starts_with("ubuntu (encrypted "),
        "unexpected name: {}",
        image.name
    );
    assert_ne!(image.name, "ubuntu (encrypted 11112222)");
    let tags = fake.tags_for(&image_id);
    assert_eq!(
        tags.get(TAG_ENCRYPTOR_IMAGE).map(String::as_str),
        Some("enc-new")
    );
    assert_ne!(
        tags.get(TAG_ENCRYPTOR_SESSION_ID).map(String::as_str),
        Some("11112222")
    );

    assert_eq!(fake.instance_count(), 0);
    assert_eq!(fake.disk_count(), 0);
    assert_eq!(fake.security_group_count(), 0);
}

#[tokio::test]
async fn unconventional_names_get_a_plain_suffix_append() {
    let fake = Arc::new(FakeProvider::new());
    seed_encrypted_guest(
        &fake,
        "guest-enc",
        "hand-renamed-image",
        "11112222",
        "enc-old",
    );
    fake.seed_image(encryptor_image("enc-new"));

    let wf = workflow(&fake, ScriptedStatusClient::success_factory());
    let image_id = wf
        .run(&UpdateRequest::new("guest-enc", "enc-new", ZONE))
        .await
        .expect("update should succeed");
    let image = fake.get_image(&image_id).await.expect("image exists");
    assert!(
        image.name.starts_with("hand-renamed-image (encrypted "),
        "unexpected name: {}",
        image.name
    );
}

#[tokio::test]
async fn missing_tags_fail_before_any_instance_is_launched() {
    let fake = Arc::new(FakeProvider::new());
    // A plain guest image without the Brkt* tags.
    fake.seed_image(guest_image("guest-1", "ubuntu", 10));
    fake.seed_image(encryptor_image("enc-new"));

    let wf = workflow(&fake, ScriptedStatusClient::success_factory());
    let err = wf
        .run(&UpdateRequest::new("guest-1", "enc-new", ZONE))
        .await
        .expect_err("tag validation failure");
    assert!(
        matches!(
            err,
            WorkflowError::Validation(ValidationError::MissingEncryptorTags { .. })
        ),
        "unexpected error: {err}"
    );
    assert_eq!(fake.instance_count(), 0);
    assert_eq!(fake.disk_count(), 0);
    assert_eq!(fake.snapshot_count(), 0);
}

#[tokio::test]
async fn updating_with_the_same_encryptor_is_rejected() {
    let fake = Arc::new(FakeProvider::new());
    seed_encrypted_guest(
        &fake,
        "guest-enc",
        "ubuntu (encrypted 11112222)",
        "11112222",
        "enc-same",
    );
    fake.seed_image(encryptor_image("enc-same"));

    let wf = workflow(&fake, ScriptedStatusClient::success_factory());
    let err = wf
        .run(&UpdateRequest::new("guest-enc", "enc-same", ZONE))
        .await
        .expect_err("same encryptor");
    assert!(matches!(
        err,
        WorkflowError::Validation(ValidationError::SameEncryptor { .. })
    ));
}

#[tokio::test]
async fn agent_failure_during_update_cleans_up() {
    let fake = Arc::new(FakeProvider::new());
    seed_encrypted_guest(
        &fake,
        "guest-enc",
        "ubuntu (encrypted 11112222)",
        "11112222",
        "enc-old",
    );
    fake.seed_image(encryptor_image("enc-new"));

    let wf = workflow(&fake, ScriptedStatusClient::failure_factory("update_failed"));
    let mut request = UpdateRequest::new("guest-enc", "enc-new", ZONE);
    request.save_encryptor_logs = false;

    let err = wf.run(&request).await.expect_err("agent failure");
    assert!(matches!(err, WorkflowError::Encryption { .. }));
    assert_eq!(fake.image_ids().len(), 2, "no image may survive a failure");
    assert_eq!(fake.instance_count(), 0);
    assert_eq!(fake.disk_count(), 0);
    // Only the pre-existing snapshots backing the guest image remain.
    assert_eq!(fake.snapshot_count(), 4);
    assert_eq!(fake.security_group_count(), 0);
}

#[tokio::test]
async fn guest_without_encrypted_volume_mapping_is_rejected() {
    let fake = Arc::new(FakeProvider::new());
    // Tags present, but the /dev/sda5 mapping is missing.
    let mut image = guest_image("guest-enc", "ubuntu (encrypted 11112222)", 10);
    image.tags.insert(
        brkt_imager::TAG_ENCRYPTOR.to_owned(),
        String::from("True"),
    );
    image.tags.insert(
        TAG_ENCRYPTOR_SESSION_ID.to_owned(),
        String::from("11112222"),
    );
    image
        .tags
        .insert(TAG_ENCRYPTOR_IMAGE.to_owned(), String::from("enc-old"));
    fake.seed_image(image);
    fake.seed_image(encryptor_image("enc-new"));

    let wf = workflow(&fake, ScriptedStatusClient::success_factory());
    let err = wf
        .run(&UpdateRequest::new("guest-enc", "enc-new", ZONE))
        .await
        .expect_err("missing mapping");
    assert!(matches!(
        err,
        WorkflowError::Validation(ValidationError::MissingGuestVolume { .. })
    ));
    assert_eq!(fake.instance_count(), 0);
}
