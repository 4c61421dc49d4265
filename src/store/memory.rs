//! In-memory Certificate Store backend.
//!
//! Backs staged transaction clones (`spec.md` §4.4) and is a full
//! alternate backend in its own right, mirroring the
//! `MemoryKeyStorage`/`FileKeyStorage` pairing the teacher crate uses
//! for key storage.

use super::{dedup_certs, dedup_crls, CertificateStore};
use crate::error::{GdsError, Result};
use crate::types::{Certificate, PrivateKey, TrustList, TrustListMask};
use async_trait::async_trait;
use std::sync::{Arc, RwLock};

#[derive(Default)]
struct Lists {
    trusted_certificates: Vec<Certificate>,
    trusted_crls: Vec<crate::types::Crl>,
    issuer_certificates: Vec<Certificate>,
    issuer_crls: Vec<crate::types::Crl>,
    rejected: Vec<Certificate>,
    own_certificate: Option<Certificate>,
    own_private_key: Option<PrivateKey>,
}

/// In-memory certificate store.
#[derive(Clone)]
pub struct MemoryCertificateStore {
    lists: Arc<RwLock<Lists>>,
    max_rejected_list_size: usize,
}

impl MemoryCertificateStore {
    /// Create an empty store with the given rejected-list bound
    /// (0 = unbounded).
    pub fn new(max_rejected_list_size: usize) -> Self {
        Self {
            lists: Arc::new(RwLock::new(Lists::default())),
            max_rejected_list_size,
        }
    }
}

impl Default for MemoryCertificateStore {
    fn default() -> Self {
        Self::new(0)
    }
}

#[async_trait]
impl CertificateStore for MemoryCertificateStore {
    async fn get_trust_list(&self, mask: TrustListMask) -> Result<TrustList> {
        let lists = self.lists.read().unwrap();
        Ok(TrustList {
            specified_lists: Some(mask),
            trusted_certificates: if mask.contains(TrustListMask::TRUSTED_CERTIFICATES) {
                lists.trusted_certificates.clone()
            } else {
                Vec::new()
            },
            trusted_crls: if mask.contains(TrustListMask::TRUSTED_CRLS) {
                lists.trusted_crls.clone()
            } else {
                Vec::new()
            },
            issuer_certificates: if mask.contains(TrustListMask::ISSUER_CERTIFICATES) {
                lists.issuer_certificates.clone()
            } else {
                Vec::new()
            },
            issuer_crls: if mask.contains(TrustListMask::ISSUER_CRLS) {
                lists.issuer_crls.clone()
            } else {
                Vec::new()
            },
        })
    }

    async fn set_trust_list(&self, tl: &TrustList) -> Result<()> {
        let mask = tl.mask();
        let mut lists = self.lists.write().unwrap();
        if mask.contains(TrustListMask::TRUSTED_CERTIFICATES) {
            lists.trusted_certificates = dedup_certs(&tl.trusted_certificates);
        }
        if mask.contains(TrustListMask::TRUSTED_CRLS) {
            lists.trusted_crls = dedup_crls(&tl.trusted_crls);
        }
        if mask.contains(TrustListMask::ISSUER_CERTIFICATES) {
            lists.issuer_certificates = dedup_certs(&tl.issuer_certificates);
        }
        if mask.contains(TrustListMask::ISSUER_CRLS) {
            lists.issuer_crls = dedup_crls(&tl.issuer_crls);
        }
        Ok(())
    }

    async fn add_to_trust_list(&self, tl: &TrustList) -> Result<()> {
        let mask = tl.mask();
        let mut lists = self.lists.write().unwrap();
        if mask.contains(TrustListMask::TRUSTED_CERTIFICATES) {
            for cert in &tl.trusted_certificates {
                if !lists.trusted_certificates.contains(cert) {
                    lists.trusted_certificates.push(cert.clone());
                }
            }
        }
        if mask.contains(TrustListMask::TRUSTED_CRLS) {
            for crl in &tl.trusted_crls {
                if !lists.trusted_crls.contains(crl) {
                    lists.trusted_crls.push(crl.clone());
                }
            }
        }
        if mask.contains(TrustListMask::ISSUER_CERTIFICATES) {
            for cert in &tl.issuer_certificates {
                if !lists.issuer_certificates.contains(cert) {
                    lists.issuer_certificates.push(cert.clone());
                }
            }
        }
        if mask.contains(TrustListMask::ISSUER_CRLS) {
            for crl in &tl.issuer_crls {
                if !lists.issuer_crls.contains(crl) {
                    lists.issuer_crls.push(crl.clone());
                }
            }
        }
        Ok(())
    }

    async fn remove_from_trust_list(&self, tl: &TrustList) -> Result<()> {
        let mask = tl.mask();
        let mut lists = self.lists.write().unwrap();
        if mask.contains(TrustListMask::TRUSTED_CERTIFICATES) {
            lists
                .trusted_certificates
                .retain(|c| !tl.trusted_certificates.contains(c));
        }
        if mask.contains(TrustListMask::TRUSTED_CRLS) {
            lists.trusted_crls.retain(|c| !tl.trusted_crls.contains(c));
        }
        if mask.contains(TrustListMask::ISSUER_CERTIFICATES) {
            lists
                .issuer_certificates
                .retain(|c| !tl.issuer_certificates.contains(c));
        }
        if mask.contains(TrustListMask::ISSUER_CRLS) {
            lists.issuer_crls.retain(|c| !tl.issuer_crls.contains(c));
        }
        Ok(())
    }

    async fn get_rejected_list(&self) -> Result<Vec<Certificate>> {
        Ok(self.lists.read().unwrap().rejected.clone())
    }

    async fn add_to_rejected_list(&self, cert: Certificate) -> Result<()> {
        let mut lists = self.lists.write().unwrap();
        if lists.rejected.contains(&cert) {
            return Ok(());
        }
        if self.max_rejected_list_size > 0 && lists.rejected.len() >= self.max_rejected_list_size {
            lists.rejected.remove(0); // oldest (FIFO) is at the front
        }
        lists.rejected.push(cert);
        Ok(())
    }

    async fn write_identity(
        &self,
        old_cert: Option<&Certificate>,
        new_cert: &Certificate,
        new_key: &PrivateKey,
    ) -> Result<()> {
        let mut lists = self.lists.write().unwrap();
        if let (Some(old), Some(current)) = (old_cert, &lists.own_certificate) {
            if old != current {
                return Err(GdsError::NotFound(
                    "old_cert does not match the currently stored identity".to_string(),
                ));
            }
        }
        lists.own_certificate = Some(new_cert.clone());
        if !new_key.is_empty() {
            lists.own_private_key = Some(new_key.clone());
        }
        Ok(())
    }

    async fn own_certificate(&self) -> Result<Option<Certificate>> {
        Ok(self.lists.read().unwrap().own_certificate.clone())
    }

    async fn own_private_key(&self) -> Result<Option<PrivateKey>> {
        Ok(self.lists.read().unwrap().own_private_key.clone())
    }

    async fn snapshot_clone(&self) -> Result<MemoryCertificateStore> {
        let lists = self.lists.read().unwrap();
        let cloned = Lists {
            trusted_certificates: lists.trusted_certificates.clone(),
            trusted_crls: lists.trusted_crls.clone(),
            issuer_certificates: lists.issuer_certificates.clone(),
            issuer_crls: lists.issuer_crls.clone(),
            rejected: lists.rejected.clone(),
            own_certificate: lists.own_certificate.clone(),
            own_private_key: lists.own_private_key.clone(),
        };
        Ok(MemoryCertificateStore {
            lists: Arc::new(RwLock::new(cloned)),
            max_rejected_list_size: self.max_rejected_list_size,
        })
    }
}
