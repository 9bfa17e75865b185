//! Precondition checks run before any resource is created.
//!
//! Failures here are user errors: they are reported immediately and need no
//! cleanup, because validation never provisions anything.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::naming::{self, NameError};
use crate::provider::{
    CloudProvider, ImageInfo, ProviderError, StorageBackend, Virtualization,
};
use crate::session::{TAG_ENCRYPTOR, TAG_ENCRYPTOR_IMAGE, TAG_ENCRYPTOR_SESSION_ID};
use crate::status::RESERVED_STATUS_PORT;

/// Marker substring identifying Bracket encryptor images by name.
const ENCRYPTOR_NAME_MARKER: &str = "brkt-avatar";

/// Errors raised by precondition checks.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ValidationError {
    /// Raised when a referenced image does not exist.
    #[error("could not find image {0}")]
    ImageNotFound(String),
    /// Raised when the guest image is already encrypted.
    #[error("{0} is already an encrypted image")]
    AlreadyEncrypted(String),
    /// Raised when the guest image's root is not volume-backed.
    #[error("{0} does not use volume-backed storage")]
    UnsupportedStorage(String),
    /// Raised when the guest image's virtualization type is unsupported.
    #[error("{image_id} uses {virtualization} virtualization, only hvm is supported")]
    UnsupportedVirtualization {
        /// Image that failed the check.
        image_id: String,
        /// Virtualization type found.
        virtualization: String,
    },
    /// Raised when the encryptor image is not recognisably a Bracket
    /// encryptor.
    #[error("{image_id} ({name}) is not a Bracket encryptor image")]
    NotAnEncryptorImage {
        /// Image that failed the check.
        image_id: String,
        /// Its display name.
        name: String,
    },
    /// Raised when an encrypted guest is missing required tags.
    #[error("{image_id} is missing tags: {missing}")]
    MissingEncryptorTags {
        /// Image that failed the check.
        image_id: String,
        /// Comma-joined missing tag keys.
        missing: String,
    },
    /// Raised when the guest was already produced by the same encryptor.
    #[error("{image_id} was already encrypted with Bracket encryptor {encryptor_image_id}")]
    SameEncryptor {
        /// Image that failed the check.
        image_id: String,
        /// Encryptor image both runs would use.
        encryptor_image_id: String,
    },
    /// Raised when an encrypted guest lacks the expected guest volume
    /// mapping.
    #[error("invalid block device mapping: {device} not present on {image_id}")]
    MissingGuestVolume {
        /// Image that failed the check.
        image_id: String,
        /// Device that was expected.
        device: String,
    },
    /// Raised when the requested name is already taken by a self-owned
    /// image.
    #[error("you already own an image named {0}")]
    NameCollision(String),
    /// Raised when the requested name breaks provider naming rules.
    #[error(transparent)]
    BadName(#[from] NameError),
    /// Raised when the referenced network does not exist.
    #[error("network {0} does not exist")]
    NetworkNotFound(String),
    /// Raised when the network, subnet, and security groups span network
    /// scopes.
    #[error("network, subnet, and security groups must be in the same network")]
    MixedNetworkScopes,
    /// Raised when the status port is outside the usable range.
    #[error("status port {0} is reserved")]
    ReservedStatusPort(u16),
    /// Raised when a provider lookup fails for reasons other than absence.
    #[error("validation query failed: {0}")]
    Provider(String),
}

impl ValidationError {
    fn from_lookup(image_id: &str, err: &ProviderError) -> Self {
        if err.is_not_found() {
            Self::ImageNotFound(image_id.to_owned())
        } else {
            Self::Provider(err.to_string())
        }
    }
}

/// Validates the status port choice.
///
/// # Errors
///
/// Returns [`ValidationError::ReservedStatusPort`] for the reserved port.
pub const fn validate_status_port(port: u16) -> Result<(), ValidationError> {
    if port == RESERVED_STATUS_PORT {
        return Err(ValidationError::ReservedStatusPort(port));
    }
    Ok(())
}

/// Fetches and validates a guest image for first-time encryption.
///
/// # Errors
///
/// Returns [`ValidationError`] when the image is absent, already encrypted,
/// store-backed, or not hvm.
pub async fn validate_guest_image(
    provider: &dyn CloudProvider,
    image_id: &str,
) -> Result<ImageInfo, ValidationError> {
    let image = provider
        .get_image(image_id)
        .await
        .map_err(|err| ValidationError::from_lookup(image_id, &err))?;
    if image.tags.contains_key(TAG_ENCRYPTOR) {
        return Err(ValidationError::AlreadyEncrypted(image_id.to_owned()));
    }
    if image.storage != StorageBackend::Volume {
        return Err(ValidationError::UnsupportedStorage(image_id.to_owned()));
    }
    if image.virtualization != Virtualization::Hvm {
        return Err(ValidationError::UnsupportedVirtualization {
            image_id: image_id.to_owned(),
            virtualization: String::from("paravirtual"),
        });
    }
    Ok(image)
}

/// Fetches and validates the encryptor image.
///
/// # Errors
///
/// Returns [`ValidationError`] when the image is absent or its name lacks
/// the encryptor marker.
pub async fn validate_encryptor_image(
    provider: &dyn CloudProvider,
    image_id: &str,
) -> Result<ImageInfo, ValidationError> {
    let image = provider
        .get_image(image_id)
        .await
        .map_err(|err| ValidationError::from_lookup(image_id, &err))?;
    if !image.name.contains(ENCRYPTOR_NAME_MARKER) {
        return Err(ValidationError::NotAnEncryptorImage {
            image_id: image_id.to_owned(),
            name: image.name,
        });
    }
    Ok(image)
}

/// Fetches and validates an encrypted guest for the update workflow: all
/// encryptor tags present, and not already produced by `encryptor_image_id`.
///
/// # Errors
///
/// Returns [`ValidationError`] when tags are missing or the encryptor is
/// unchanged.
pub async fn validate_encrypted_guest(
    provider: &dyn CloudProvider,
    image_id: &str,
    encryptor_image_id: &str,
) -> Result<ImageInfo, ValidationError> {
    let image = provider
        .get_image(image_id)
        .await
        .map_err(|err| ValidationError::from_lookup(image_id, &err))?;
    let expected = [TAG_ENCRYPTOR, TAG_ENCRYPTOR_SESSION_ID, TAG_ENCRYPTOR_IMAGE];
    let missing: Vec<&str> = expected
        .iter()
        .copied()
        .filter(|key| !image.tags.contains_key(*key))
        .collect();
    if !missing.is_empty() {
        return Err(ValidationError::MissingEncryptorTags {
            image_id: image_id.to_owned(),
            missing: missing.join(", "),
        });
    }
    if image.tags.get(TAG_ENCRYPTOR_IMAGE).map(String::as_str) == Some(encryptor_image_id) {
        return Err(ValidationError::SameEncryptor {
            image_id: image_id.to_owned(),
            encryptor_image_id: encryptor_image_id.to_owned(),
        });
    }
    Ok(image)
}

/// Checks an explicit target name for charset rules and collisions with
/// self-owned images.
///
/// # Errors
///
/// Returns [`ValidationError`] on a malformed or already-taken name.
pub async fn validate_target_name(
    provider: &dyn CloudProvider,
    name: &str,
) -> Result<(), ValidationError> {
    naming::validate_image_name(name)?;
    let existing = provider
        .find_images(name, true)
        .await
        .map_err(|err| ValidationError::Provider(err.to_string()))?;
    if existing.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::NameCollision(name.to_owned()))
    }
}

/// Verifies that the network, subnet, and security groups resolve and
/// share one network scope.
///
/// # Errors
///
/// Returns [`ValidationError::MixedNetworkScopes`] when the referenced
/// resources span more than one network, or a lookup failure otherwise.
pub async fn validate_network_scope(
    provider: &dyn CloudProvider,
    network_id: Option<&str>,
    subnet_id: Option<&str>,
    security_group_ids: &[String],
) -> Result<(), ValidationError> {
    let mut network_ids: BTreeSet<String> = BTreeSet::new();
    if let Some(explicit) = network_id {
        let network = provider.get_network(explicit).await.map_err(|err| {
            if err.is_not_found() {
                ValidationError::NetworkNotFound(explicit.to_owned())
            } else {
                ValidationError::Provider(err.to_string())
            }
        })?;
        network_ids.insert(network.id);
    }
    if let Some(subnet_id) = subnet_id {
        let subnet = provider
            .get_subnet(subnet_id)
            .await
            .map_err(|err| ValidationError::Provider(err.to_string()))?;
        network_ids.insert(subnet.network_id);
    }
    for group_id in security_group_ids {
        let group = provider
            .get_security_group(group_id)
            .await
            .map_err(|err| ValidationError::Provider(err.to_string()))?;
        if let Some(network_id) = group.network_id {
            network_ids.insert(network_id);
        }
    }
    if network_ids.len() > 1 {
        return Err(ValidationError::MixedNetworkScopes);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::FakeProvider;
    use crate::test_support::{encryptor_image, guest_image};

    #[tokio::test]
    async fn guest_validation_rejects_encrypted_images() {
        let fake = FakeProvider::new();
        let mut image = guest_image("guest-1", "ubuntu", 10);
        image
            .tags
            .insert(TAG_ENCRYPTOR.to_owned(), String::from("True"));
        fake.seed_image(image);
        let err = validate_guest_image(&fake, "guest-1")
            .await
            .expect_err("should reject");
        assert_eq!(err, ValidationError::AlreadyEncrypted(String::from("guest-1")));
    }

    #[tokio::test]
    async fn guest_validation_rejects_missing_images() {
        let fake = FakeProvider::new();
        let err = validate_guest_image(&fake, "guest-nope")
            .await
            .expect_err("should reject");
        assert_eq!(err, ValidationError::ImageNotFound(String::from("guest-nope")));
    }

    #[tokio::test]
    async fn encryptor_validation_requires_marker_name() {
        let fake = FakeProvider::new();
        fake.seed_image(guest_image("enc-1", "random-image", 4));
        let err = validate_encryptor_image(&fake, "enc-1")
            .await
            .expect_err("should reject");
        assert!(matches!(err, ValidationError::NotAnEncryptorImage { .. }));
        fake.seed_image(encryptor_image("enc-2"));
        assert!(validate_encryptor_image(&fake, "enc-2").await.is_ok());
    }

    #[tokio::test]
    async fn network_scope_check_rejects_mixed_vpcs() {
        let fake = FakeProvider::new();
        fake.seed_subnet("subnet-1", "vpc-1", "zone-a");
        fake.seed_security_group("sg-other", Some("vpc-2"));
        let err = validate_network_scope(
            &fake,
            None,
            Some("subnet-1"),
            &[String::from("sg-other")],
        )
        .await
        .expect_err("should reject");
        assert_eq!(err, ValidationError::MixedNetworkScopes);
    }

    #[tokio::test]
    async fn network_scope_check_resolves_explicit_networks() {
        let fake = FakeProvider::new();
        fake.seed_network("vpc-1");
        fake.seed_subnet("subnet-1", "vpc-1", "zone-a");
        assert!(
            validate_network_scope(&fake, Some("vpc-1"), Some("subnet-1"), &[])
                .await
                .is_ok()
        );
        let err = validate_network_scope(&fake, Some("vpc-missing"), None, &[])
            .await
            .expect_err("unknown network");
        assert_eq!(
            err,
            ValidationError::NetworkNotFound(String::from("vpc-missing"))
        );
    }

    #[tokio::test]
    async fn name_collision_is_rejected() {
        let fake = FakeProvider::new();
        fake.seed_image(guest_image("img-1", "taken", 10));
        let err = validate_target_name(&fake, "taken")
            .await
            .expect_err("should reject");
        assert_eq!(err, ValidationError::NameCollision(String::from("taken")));
        assert!(validate_target_name(&fake, "free-name").await.is_ok());
    }

    #[test]
    fn reserved_status_port_is_rejected() {
        assert!(validate_status_port(81).is_err());
        assert!(validate_status_port(80).is_ok());
        assert!(validate_status_port(8000).is_ok());
    }
}
