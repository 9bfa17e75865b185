//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use crate::provider::{
    DeviceMapping, ImageInfo, ImageState, StorageBackend, Virtualization,
};
use crate::session::{TAG_ENCRYPTOR, TAG_ENCRYPTOR_IMAGE, TAG_ENCRYPTOR_SESSION_ID};
use crate::status::{
    EncryptState, StatusClient, StatusClientFactory, StatusFetchError, StatusFuture, StatusReport,
};
use crate::workflow::{DEVICE_GUEST_ROOT, DEVICE_MV_GRUB, DEVICE_MV_LOG, DEVICE_MV_ROOT};

/// Builds an unencrypted, volume-backed, hvm guest image for tests.
#[must_use]
pub fn guest_image(id: &str, name: &str, root_size_gb: u64) -> ImageInfo {
    ImageInfo {
        id: id.to_owned(),
        name: name.to_owned(),
        description: None,
        state: ImageState::Available,
        tags: BTreeMap::new(),
        storage: StorageBackend::Volume,
        virtualization: Virtualization::Hvm,
        root_device: String::from("/dev/sda1"),
        mappings: vec![DeviceMapping::from_snapshot(
            "/dev/sda1",
            format!("snap-{id}"),
            root_size_gb,
        )],
    }
}

/// Builds an encryptor image carrying the metavisor boot volume layout.
#[must_use]
pub fn encryptor_image(id: &str) -> ImageInfo {
    ImageInfo {
        id: id.to_owned(),
        name: format!("brkt-avatar-{id}"),
        description: Some(String::from("Bracket encryptor")),
        state: ImageState::Available,
        tags: BTreeMap::new(),
        storage: StorageBackend::Volume,
        virtualization: Virtualization::Hvm,
        root_device: DEVICE_MV_GRUB.to_owned(),
        mappings: vec![
            DeviceMapping::from_snapshot(DEVICE_MV_GRUB, format!("snap-{id}-grub"), 1),
            DeviceMapping::from_snapshot(DEVICE_MV_ROOT, format!("snap-{id}-root"), 4),
            DeviceMapping::from_snapshot(DEVICE_MV_LOG, format!("snap-{id}-log"), 2),
        ],
    }
}

/// Builds an encrypted guest image the way a previous encrypt run would
/// have left it: metavisor layout plus the guest volume, and the full tag
/// set for `session_id` and `encryptor_image_id`.
#[must_use]
pub fn encrypted_guest_image(
    id: &str,
    name: &str,
    session_id: &str,
    encryptor_image_id: &str,
) -> ImageInfo {
    let mut tags = BTreeMap::new();
    tags.insert(TAG_ENCRYPTOR.to_owned(), String::from("True"));
    tags.insert(TAG_ENCRYPTOR_SESSION_ID.to_owned(), session_id.to_owned());
    tags.insert(TAG_ENCRYPTOR_IMAGE.to_owned(), encryptor_image_id.to_owned());
    ImageInfo {
        id: id.to_owned(),
        name: name.to_owned(),
        description: None,
        state: ImageState::Available,
        tags,
        storage: StorageBackend::Volume,
        virtualization: Virtualization::Hvm,
        root_device: DEVICE_MV_GRUB.to_owned(),
        mappings: vec![
            DeviceMapping::from_snapshot(DEVICE_MV_GRUB, format!("snap-{id}-grub"), 1),
            DeviceMapping::from_snapshot(DEVICE_MV_ROOT, format!("snap-{id}-root"), 4),
            DeviceMapping::from_snapshot(DEVICE_MV_LOG, format!("snap-{id}-log"), 2),
            DeviceMapping::from_snapshot(DEVICE_GUEST_ROOT, format!("snap-{id}-guest"), 21),
        ],
    }
}

/// Seeds an encrypted guest image into `fake` together with the snapshots
/// backing its device mappings, so disks can be restored from them.
pub fn seed_encrypted_guest(
    fake: &crate::provider::FakeProvider,
    id: &str,
    name: &str,
    session_id: &str,
    encryptor_image_id: &str,
) {
    let image = encrypted_guest_image(id, name, session_id, encryptor_image_id);
    for mapping in &image.mappings {
        if let Some(snapshot_id) = &mapping.snapshot_id {
            fake.seed_snapshot(snapshot_id, mapping.size_gb);
        }
    }
    fake.seed_image(image);
}

/// Status client returning a scripted sequence of reports, then repeating
/// the final entry forever.
pub struct ScriptedStatusClient {
    reports: Mutex<VecDeque<Result<StatusReport, StatusFetchError>>>,
    fallback: Result<StatusReport, StatusFetchError>,
}

impl ScriptedStatusClient {
    /// Creates a client that replays `reports` and then `fallback`.
    #[must_use]
    pub fn new(
        reports: Vec<Result<StatusReport, StatusFetchError>>,
        fallback: Result<StatusReport, StatusFetchError>,
    ) -> Self {
        Self {
            reports: Mutex::new(reports.into()),
            fallback,
        }
    }

    /// Factory producing a client that immediately reports success.
    #[must_use]
    pub fn success_factory() -> StatusClientFactory {
        Box::new(|_, _| {
            Box::new(Self::new(
                vec![Ok(StatusReport {
                    state: EncryptState::Encrypting,
                    percent_complete: Some(50),
                    failure_code: None,
                })],
                Ok(StatusReport {
                    state: EncryptState::Successful,
                    percent_complete: Some(100),
                    failure_code: None,
                }),
            ))
        })
    }

    /// Factory producing a client whose agent reports failure.
    #[must_use]
    pub fn failure_factory(failure_code: &str) -> StatusClientFactory {
        let code = failure_code.to_owned();
        Box::new(move |_, _| {
            Box::new(Self::new(
                Vec::new(),
                Ok(StatusReport {
                    state: EncryptState::Failed,
                    percent_complete: None,
                    failure_code: Some(code.clone()),
                }),
            ))
        })
    }

    /// Factory producing a client that never reaches a terminal phase.
    #[must_use]
    pub fn stuck_factory() -> StatusClientFactory {
        Box::new(|_, _| {
            Box::new(Self::new(
                Vec::new(),
                Ok(StatusReport {
                    state: EncryptState::Encrypting,
                    percent_complete: Some(42),
                    failure_code: None,
                }),
            ))
        })
    }
}

impl StatusClient for ScriptedStatusClient {
    fn fetch_status(&self) -> StatusFuture<'_> {
        let next = self
            .reports
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        Box::pin(async move { next })
    }
}
