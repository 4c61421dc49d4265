//! Error types for the GDS push-management core.

use thiserror::Error;

/// Result type alias for push-management operations.
pub type Result<T> = std::result::Result<T, GdsError>;

/// The externally observable return codes from `spec.md` §6.
///
/// A handler's `GdsError` always maps to exactly one of these; nothing
/// in the dispatcher surfaces a raw Rust error to a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Good,
    BadTypeMismatch,
    BadInvalidArgument,
    BadInvalidState,
    BadTransactionPending,
    BadUserAccessDenied,
    BadNothingToDo,
    BadNotWritable,
    BadNotReadable,
    BadCertificateInvalid,
    BadCertificateUriInvalid,
    BadCertificateUntrusted,
    BadCertificateTimeInvalid,
    BadCertificateRevoked,
    BadCertificateRevocationUnknown,
    BadCertificateIssuerRevocationUnknown,
    BadCertificateUseNotAllowed,
    BadSecurityChecksFailed,
    BadNotSupported,
    BadOutOfMemory,
    BadInternalError,
}

/// Main error type for push-management operations.
#[derive(Error, Debug)]
pub enum GdsError {
    /// X.509/CRL parsing or structural errors.
    #[error("X.509 error: {0}")]
    X509(String),

    /// Certificate generation errors (CSR / self-signed issuance).
    #[error("certificate generation error: {0}")]
    CertGen(#[from] rcgen::Error),

    /// RSA key-pair validation errors (UpdateCertificate's key check).
    #[error("RSA error: {0}")]
    Rsa(#[from] rsa::Error),

    /// IO errors from the filesystem certificate store.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors (config, encoded trust lists).
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// PEM parsing errors.
    #[error("PEM error: {0}")]
    Pem(#[from] pem::PemError),

    /// A requested file/certificate/identity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Method arguments did not have the expected OPC UA type.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// Method arguments were the right type but structurally invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The file/transaction state machine rejected the call.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A PENDING transaction is owned by a different session.
    #[error("transaction pending, owned by another session")]
    TransactionPending,

    /// Caller is not the owner of the resource it is operating on.
    #[error("user access denied: {0}")]
    UserAccessDenied(String),

    /// ApplyChanges called with no staged transaction.
    #[error("nothing to do")]
    NothingToDo,

    /// Write attempted on a READ-mode handle.
    #[error("not writable")]
    NotWritable,

    /// Read attempted on a WRITE-mode handle, or while a WRITE is open.
    #[error("not readable")]
    NotReadable,

    /// Certificate is malformed or otherwise structurally invalid.
    #[error("certificate invalid: {0}")]
    CertificateInvalid(String),

    /// ApplicationUri extension check failed.
    #[error("certificate URI invalid")]
    CertificateUriInvalid,

    /// Certificate does not chain to a trusted anchor.
    #[error("certificate untrusted")]
    CertificateUntrusted,

    /// Certificate is expired or not yet valid.
    #[error("certificate time invalid")]
    CertificateTimeInvalid,

    /// Certificate appears on a CRL.
    #[error("certificate revoked")]
    CertificateRevoked,

    /// No CRL is present for the certificate's issuer.
    #[error("certificate revocation unknown")]
    CertificateRevocationUnknown,

    /// No CRL is present for a self-trusted certificate's issuer.
    #[error("certificate issuer revocation unknown")]
    CertificateIssuerRevocationUnknown,

    /// Certificate key usage forbids the attempted role (e.g. CA-as-leaf).
    #[error("certificate use not allowed")]
    CertificateUseNotAllowed,

    /// Chain built but failed a non-revocation security check.
    #[error("security checks failed")]
    SecurityChecksFailed,

    /// Operation, group, type, or key format is not supported.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Allocation/resource exhaustion.
    #[error("out of memory")]
    OutOfMemory,

    /// Any other fabric-level failure (treated as fatal to the call).
    #[error("internal error: {0}")]
    Internal(String),
}

impl GdsError {
    /// Map this error to its externally observable [`StatusCode`].
    pub fn status_code(&self) -> StatusCode {
        match self {
            GdsError::X509(_) => StatusCode::BadCertificateInvalid,
            GdsError::CertGen(_) => StatusCode::BadInternalError,
            GdsError::Rsa(_) => StatusCode::BadCertificateInvalid,
            GdsError::Io(_) => StatusCode::BadInternalError,
            GdsError::Serialization(_) => StatusCode::BadInternalError,
            GdsError::Pem(_) => StatusCode::BadInvalidArgument,
            GdsError::NotFound(_) => StatusCode::BadInvalidArgument,
            GdsError::TypeMismatch(_) => StatusCode::BadTypeMismatch,
            GdsError::InvalidArgument(_) => StatusCode::BadInvalidArgument,
            GdsError::InvalidState(_) => StatusCode::BadInvalidState,
            GdsError::TransactionPending => StatusCode::BadTransactionPending,
            GdsError::UserAccessDenied(_) => StatusCode::BadUserAccessDenied,
            GdsError::NothingToDo => StatusCode::BadNothingToDo,
            GdsError::NotWritable => StatusCode::BadNotWritable,
            GdsError::NotReadable => StatusCode::BadNotReadable,
            GdsError::CertificateInvalid(_) => StatusCode::BadCertificateInvalid,
            GdsError::CertificateUriInvalid => StatusCode::BadCertificateUriInvalid,
            GdsError::CertificateUntrusted => StatusCode::BadCertificateUntrusted,
            GdsError::CertificateTimeInvalid => StatusCode::BadCertificateTimeInvalid,
            GdsError::CertificateRevoked => StatusCode::BadCertificateRevoked,
            GdsError::CertificateRevocationUnknown => StatusCode::BadCertificateRevocationUnknown,
            GdsError::CertificateIssuerRevocationUnknown => {
                StatusCode::BadCertificateIssuerRevocationUnknown
            }
            GdsError::CertificateUseNotAllowed => StatusCode::BadCertificateUseNotAllowed,
            GdsError::SecurityChecksFailed => StatusCode::BadSecurityChecksFailed,
            GdsError::NotSupported(_) => StatusCode::BadNotSupported,
            GdsError::OutOfMemory => StatusCode::BadOutOfMemory,
            GdsError::Internal(_) => StatusCode::BadInternalError,
        }
    }

    /// True for the "certificate semantics" taxonomy class of `spec.md` §7,
    /// whose offending certificate must be appended to the rejected list
    /// before the error is returned.
    pub fn is_certificate_rejection(&self) -> bool {
        matches!(
            self,
            GdsError::CertificateInvalid(_)
                | GdsError::CertificateUriInvalid
                | GdsError::CertificateUntrusted
                | GdsError::CertificateTimeInvalid
                | GdsError::CertificateRevoked
                | GdsError::CertificateRevocationUnknown
                | GdsError::CertificateIssuerRevocationUnknown
                | GdsError::CertificateUseNotAllowed
                | GdsError::SecurityChecksFailed
        )
    }
}
