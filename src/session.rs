//! Per-run session identity, crypto policy, and resource tag conventions.
//!
//! Every encrypt or update run owns exactly one [`Session`]. The session id
//! is stamped onto every transient resource the run creates, which is what
//! makes unconditional cleanup and cross-tool auditing possible.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use uuid::Uuid;

/// Tag key marking an image as a Bracket encryptor output.
pub const TAG_ENCRYPTOR: &str = "BrktEncryptor";
/// Tag key carrying the session id that produced a resource.
pub const TAG_ENCRYPTOR_SESSION_ID: &str = "BrktEncryptorSessionID";
/// Tag key carrying the encryptor image id used for a run.
pub const TAG_ENCRYPTOR_IMAGE: &str = "BrktEncryptorAMI";

/// Encryption algorithm selector passed through to the encryptor agent.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CryptoPolicy {
    /// AES-GCM. The default, and the policy assumed when none is given.
    #[default]
    Gcm,
    /// AES-XTS. Produces an encrypted volume close to the guest's size.
    Xts,
}

impl CryptoPolicy {
    /// Returns the wire name the encryptor agent expects.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gcm => "gcm",
            Self::Xts => "xts",
        }
    }

    /// Size in GB of the encrypted target disk for a guest root of
    /// `guest_size_gb`. XTS encrypts in place and only needs headroom for
    /// metadata; GCM stores authentication data alongside every block.
    #[must_use]
    pub const fn encrypted_disk_size_gb(self, guest_size_gb: u64) -> u64 {
        match self {
            Self::Xts => guest_size_gb + 1,
            Self::Gcm => guest_size_gb * 2 + 1,
        }
    }
}

impl fmt::Display for CryptoPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown crypto policy name.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("unknown crypto policy '{0}', expected 'gcm' or 'xts'")]
pub struct UnknownCryptoPolicy(pub String);

impl FromStr for CryptoPolicy {
    type Err = UnknownCryptoPolicy;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "gcm" => Ok(Self::Gcm),
            "xts" => Ok(Self::Xts),
            other => Err(UnknownCryptoPolicy(other.to_owned())),
        }
    }
}

/// Generates a short nonce suitable for session ids and resource names.
///
/// Eight hex characters is enough to keep concurrent runs from colliding
/// while staying readable in provider consoles.
#[must_use]
pub fn make_nonce() -> String {
    let simple = Uuid::new_v4().simple().to_string();
    simple.chars().take(8).collect()
}

/// Identity of a single encrypt or update run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Session {
    /// Unique per-run token stamped onto every transient resource.
    pub id: String,
    /// Availability zone the run provisions into.
    pub zone: String,
    /// Image being encrypted or updated.
    pub guest_image_id: String,
    /// Encryptor image used to perform the work.
    pub encryptor_image_id: String,
    /// Encryption algorithm selector.
    pub crypto_policy: CryptoPolicy,
    /// Extra tags merged over the session defaults.
    pub extra_tags: BTreeMap<String, String>,
}

impl Session {
    /// Creates a session with a fresh nonce id.
    #[must_use]
    pub fn new(
        zone: impl Into<String>,
        guest_image_id: impl Into<String>,
        encryptor_image_id: impl Into<String>,
        crypto_policy: CryptoPolicy,
    ) -> Self {
        Self {
            id: make_nonce(),
            zone: zone.into(),
            guest_image_id: guest_image_id.into(),
            encryptor_image_id: encryptor_image_id.into(),
            crypto_policy,
            extra_tags: BTreeMap::new(),
        }
    }

    /// Replaces the generated session id. Used by tests and by callers that
    /// coordinate ids externally.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Merges user-supplied tags over the session defaults.
    #[must_use]
    pub fn with_extra_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.extra_tags = tags;
        self
    }

    /// Default tags applied to every resource created during the run.
    ///
    /// The key set is relied upon by interoperating tooling and must not
    /// change: [`TAG_ENCRYPTOR`], [`TAG_ENCRYPTOR_SESSION_ID`] and
    /// [`TAG_ENCRYPTOR_IMAGE`].
    #[must_use]
    pub fn default_tags(&self) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        tags.insert(TAG_ENCRYPTOR.to_owned(), "True".to_owned());
        tags.insert(TAG_ENCRYPTOR_SESSION_ID.to_owned(), self.id.clone());
        tags.insert(
            TAG_ENCRYPTOR_IMAGE.to_owned(),
            self.encryptor_image_id.clone(),
        );
        for (key, value) in &self.extra_tags {
            tags.insert(key.clone(), value.clone());
        }
        tags
    }

    /// Name for a resource owned by this session, e.g. `brkt-guest-1a2b3c4d`.
    #[must_use]
    pub fn resource_name(&self, role: &str) -> String {
        format!("brkt-{role}-{}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn nonce_is_short_hex() {
        let nonce = make_nonce();
        assert_eq!(nonce.len(), 8);
        assert!(nonce.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn nonces_differ_between_calls() {
        assert_ne!(make_nonce(), make_nonce());
    }

    #[rstest]
    #[case("gcm", CryptoPolicy::Gcm)]
    #[case("GCM", CryptoPolicy::Gcm)]
    #[case("xts", CryptoPolicy::Xts)]
    #[case("XtS", CryptoPolicy::Xts)]
    fn crypto_policy_parses_case_insensitively(
        #[case] input: &str,
        #[case] expected: CryptoPolicy,
    ) {
        assert_eq!(input.parse::<CryptoPolicy>(), Ok(expected));
    }

    #[test]
    fn crypto_policy_rejects_unknown_names() {
        let err = "cbc".parse::<CryptoPolicy>().expect_err("should reject");
        assert_eq!(err, UnknownCryptoPolicy(String::from("cbc")));
    }

    #[rstest]
    #[case(CryptoPolicy::Gcm, 10, 21)]
    #[case(CryptoPolicy::Xts, 10, 11)]
    fn encrypted_disk_sizing_follows_policy(
        #[case] policy: CryptoPolicy,
        #[case] guest_gb: u64,
        #[case] expected_gb: u64,
    ) {
        assert_eq!(policy.encrypted_disk_size_gb(guest_gb), expected_gb);
    }

    #[test]
    fn default_tags_carry_session_identity() {
        let session = Session::new("us-central1-a", "guest-1", "encryptor-9", CryptoPolicy::Gcm)
            .with_id("deadbeef");
        let tags = session.default_tags();
        assert_eq!(tags.get(TAG_ENCRYPTOR).map(String::as_str), Some("True"));
        assert_eq!(
            tags.get(TAG_ENCRYPTOR_SESSION_ID).map(String::as_str),
            Some("deadbeef")
        );
        assert_eq!(
            tags.get(TAG_ENCRYPTOR_IMAGE).map(String::as_str),
            Some("encryptor-9")
        );
    }

    #[test]
    fn extra_tags_merge_over_defaults() {
        let mut extra = BTreeMap::new();
        extra.insert(String::from("team"), String::from("infra"));
        let session = Session::new("zone", "guest", "enc", CryptoPolicy::Gcm)
            .with_extra_tags(extra);
        let tags = session.default_tags();
        assert_eq!(tags.get("team").map(String::as_str), Some("infra"));
        assert!(tags.contains_key(TAG_ENCRYPTOR));
    }
}
