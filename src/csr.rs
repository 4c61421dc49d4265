//! PKCS#10 Certificate Signing Request generation, the collaborator
//! `spec.md` §1 calls out as "external" but `spec.md` §4.5's
//! `CreateSigningRequest` method still needs a concrete implementation
//! to be testable end to end. Grounded in
//! `examples/TheCowboyAI-cim-keys/src/certificate_service.rs`'s
//! `rcgen` 0.14 usage (`CertificateParams::new`, `KeyPair::generate`,
//! `DistinguishedName::push`).

use crate::error::{GdsError, Result};
use crate::types::PrivateKey;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

/// The output of a signing-request build: the DER-encoded PKCS#10
/// request, and — when a key was freshly generated — the PEM key
/// bytes so the caller can stage it (`SPEC_FULL.md` §2.6).
pub struct SigningRequest {
    pub der: Vec<u8>,
    pub generated_key: Option<PrivateKey>,
}

/// Build a CSR for `subject` over an existing key, or generate a fresh
/// key first when `regenerate_key` is true (`spec.md` §4.5
/// `CreateSigningRequest`).
pub fn create_signing_request(
    subject: &str,
    regenerate_key: bool,
    existing_key_pem: Option<&[u8]>,
) -> Result<SigningRequest> {
    let (key_pair, generated_key) = if regenerate_key || existing_key_pem.is_none() {
        let key_pair =
            KeyPair::generate().map_err(|e| GdsError::CertGen(e))?;
        let pem = key_pair.serialize_pem();
        (key_pair, Some(PrivateKey::new(pem.into_bytes())))
    } else {
        let pem = existing_key_pem.expect("checked above");
        let pem_str = std::str::from_utf8(pem)
            .map_err(|_| GdsError::InvalidArgument("existing key is not valid UTF-8 PEM".to_string()))?;
        let key_pair = KeyPair::from_pem(pem_str).map_err(|e| GdsError::CertGen(e))?;
        (key_pair, None)
    };

    let mut params = CertificateParams::new(Vec::new()).map_err(|e| GdsError::CertGen(e))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, subject);
    params.distinguished_name = dn;

    let csr = params
        .serialize_request(&key_pair)
        .map_err(|e| GdsError::CertGen(e))?;

    Ok(SigningRequest {
        der: csr.der().to_vec(),
        generated_key,
    })
}
