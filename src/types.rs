//! Common types for the GDS push-management data model (`spec.md` §3).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr};

/// An opaque DER-encoded X.509 certificate. Immutable, compared by
/// exact byte equality per `spec.md` §3/§4.1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate(pub Vec<u8>);

impl Certificate {
    /// Wrap raw DER bytes.
    pub fn new(der: Vec<u8>) -> Self {
        Self(der)
    }

    /// The DER bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// 20-byte SHA-1 thumbprint rendered as 40-character uppercase hex.
    pub fn thumbprint(&self) -> Thumbprint {
        let digest = ring::digest::digest(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY, &self.0);
        Thumbprint(hex::encode_upper(digest.as_ref()))
    }
}

/// A 40-character uppercase-hex SHA-1 thumbprint, per `spec.md` §3.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Thumbprint(pub String);

impl fmt::Display for Thumbprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An opaque DER-encoded Certificate Revocation List.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Crl(pub Vec<u8>);

impl Crl {
    /// Wrap raw DER bytes.
    pub fn new(der: Vec<u8>) -> Self {
        Self(der)
    }

    /// The DER bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Bitmask selecting which of a [`TrustList`]'s four sub-lists are
/// meaningful on a given carrier (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustListMask(pub u32);

impl TrustListMask {
    pub const NONE: TrustListMask = TrustListMask(0);
    pub const TRUSTED_CERTIFICATES: TrustListMask = TrustListMask(0x01);
    pub const TRUSTED_CRLS: TrustListMask = TrustListMask(0x02);
    pub const ISSUER_CERTIFICATES: TrustListMask = TrustListMask(0x04);
    pub const ISSUER_CRLS: TrustListMask = TrustListMask(0x08);
    pub const ALL: TrustListMask = TrustListMask(0x0f);

    /// Whether this mask selects the given sub-list.
    pub fn contains(self, part: TrustListMask) -> bool {
        self.0 & part.0 == part.0
    }
}

impl BitOr for TrustListMask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        TrustListMask(self.0 | rhs.0)
    }
}

impl BitAnd for TrustListMask {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        TrustListMask(self.0 & rhs.0)
    }
}

/// The four parallel certificate/CRL sets plus selector mask
/// (`spec.md` §3). Sets are unordered; de-duplication is by byte
/// equality.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrustList {
    pub specified_lists: Option<TrustListMask>,
    pub trusted_certificates: Vec<Certificate>,
    pub trusted_crls: Vec<Crl>,
    pub issuer_certificates: Vec<Certificate>,
    pub issuer_crls: Vec<Crl>,
}

impl TrustList {
    /// An empty trust list with no sub-list selected.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The mask this value carries, defaulting to ALL when unset.
    pub fn mask(&self) -> TrustListMask {
        self.specified_lists.unwrap_or(TrustListMask::ALL)
    }

    /// True when none of the four sets has any entries.
    pub fn is_empty(&self) -> bool {
        self.trusted_certificates.is_empty()
            && self.trusted_crls.is_empty()
            && self.issuer_certificates.is_empty()
            && self.issuer_crls.is_empty()
    }
}

impl Default for TrustListMask {
    fn default() -> Self {
        TrustListMask::NONE
    }
}

/// Identity scope: the application (TLS/secure-channel) group or the
/// user-token (session-token validation) group are the two first-class
/// groups named by `spec.md` §3; `Http` and `Custom` exist for parity
/// with the source's group-tag scheme but are not first-class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupId {
    Application,
    UserToken,
    Http,
    Custom(String),
}

impl GroupId {
    /// The `<groupTag>` path component under `<pkiRoot>/pki/` (`spec.md` §4.1).
    pub fn tag(&self) -> String {
        match self {
            GroupId::Application => "ApplCerts".to_string(),
            GroupId::UserToken => "UserTokenCerts".to_string(),
            GroupId::Http => "HttpCerts".to_string(),
            GroupId::Custom(id) => id.clone(),
        }
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Certificate type accepted by `UpdateCertificate`/`CreateSigningRequest`
/// (`spec.md` §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CertificateTypeId {
    RsaMin,
    RsaSha256,
}

/// Private-key wire format accepted by `UpdateCertificate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyFormat {
    Pem,
    Pfx,
}

/// A private key held only in memory for the duration of a staged
/// update; never serialized with its bytes exposed via `Debug`.
pub struct PrivateKey(secrecy::SecretBox<Vec<u8>>);

impl PrivateKey {
    /// Wrap raw key bytes (PEM or PKCS#12, per the accompanying [`KeyFormat`]).
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(secrecy::SecretBox::new(Box::new(bytes)))
    }

    /// Access the raw key bytes.
    pub fn expose_secret(&self) -> &[u8] {
        use secrecy::ExposeSecret;
        self.0.expose_secret()
    }

    /// True if no key bytes are held (caller wants to reuse the stored key).
    pub fn is_empty(&self) -> bool {
        use secrecy::ExposeSecret;
        self.0.expose_secret().is_empty()
    }
}

impl Clone for PrivateKey {
    fn clone(&self) -> Self {
        PrivateKey::new(self.expose_secret().to_vec())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey(***)")
    }
}

/// Non-zero 32-bit handle, unique within one [`FileInfo`] at OPEN time
/// (`spec.md` §3/§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileHandle(pub u32);

/// The mode a trust-list virtual file was opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenMode {
    Read,
    WriteEraseExisting,
}

impl OpenMode {
    /// Decode the OPC UA `OpenFileMode` bitmask from `spec.md` §4.3.
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0x01 => Some(OpenMode::Read),
            0x06 => Some(OpenMode::WriteEraseExisting),
            _ => None,
        }
    }
}

/// One live OPEN on a group's trust list (`spec.md` §3).
#[derive(Debug, Clone)]
pub struct FileContext {
    pub file_handle: FileHandle,
    pub session_id: SessionId,
    pub open_mode: OpenMode,
    pub cursor: u64,
    pub snapshot: Vec<u8>,
}

/// `{openCount, lastUpdateTime, fileContexts[]}` for one group (`spec.md` §3).
#[derive(Debug, Clone, Default)]
pub struct FileInfo {
    pub file_contexts: Vec<FileContext>,
    pub last_update_time: Option<chrono::DateTime<chrono::Utc>>,
}

impl FileInfo {
    /// Number of currently open handles, which must equal `|fileContexts|`
    /// at rest (`spec.md` §8 invariant 1).
    pub fn open_count(&self) -> usize {
        self.file_contexts.len()
    }

    /// Locate a live context by handle.
    pub fn find(&self, handle: FileHandle) -> Option<&FileContext> {
        self.file_contexts.iter().find(|c| c.file_handle == handle)
    }

    /// Locate a live context by handle, mutably.
    pub fn find_mut(&mut self, handle: FileHandle) -> Option<&mut FileContext> {
        self.file_contexts
            .iter_mut()
            .find(|c| c.file_handle == handle)
    }

    /// Allocate the lowest free non-zero handle for a new OPEN.
    pub fn allocate_handle(&self) -> FileHandle {
        let mut candidate: u32 = 1;
        loop {
            if !self
                .file_contexts
                .iter()
                .any(|c| c.file_handle.0 == candidate)
            {
                return FileHandle(candidate);
            }
            candidate += 1;
        }
    }
}

/// Opaque session identifier, supplied by the OPC UA session layer
/// (an external collaborator, `spec.md` §1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub uuid::Uuid);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a file-verb call requires a subsequent `ApplyChanges`
/// (`spec.md` §4.3 `CloseAndUpdate`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyChangesRequired(pub bool);
