//! Certificate Store (C1, `spec.md` §4.1)
//!
//! Persists and serves four named lists for one group (trusted
//! certificates, trusted CRLs, issuer certificates, issuer CRLs) plus a
//! rejected list, and the group's own application certificate/key.
//! Polymorphic over backend per `spec.md` §9 "Dynamic dispatch":
//! [`filesystem::FilesystemCertificateStore`] is the persisted profile,
//! [`memory::MemoryCertificateStore`] backs staged transaction clones
//! and tests.

pub mod filesystem;
pub mod memory;

use crate::error::Result;
use crate::types::{Certificate, TrustList, TrustListMask};
use async_trait::async_trait;

/// The capability set a Certificate Store backend must provide
/// (`spec.md` §9 "Dynamic dispatch").
#[async_trait]
pub trait CertificateStore: Send + Sync {
    /// Return all four sub-lists masked by `mask`.
    async fn get_trust_list(&self, mask: TrustListMask) -> Result<TrustList>;

    /// For each sub-list selected by `tl.specified_lists` (default ALL),
    /// atomically replace the stored set with the given set.
    /// De-duplicates the input by byte equality.
    async fn set_trust_list(&self, tl: &TrustList) -> Result<()>;

    /// For each selected sub-list, union the given items with the
    /// existing set (skip items already present by byte equality).
    /// Idempotent.
    async fn add_to_trust_list(&self, tl: &TrustList) -> Result<()>;

    /// For each selected sub-list, subtract the given items (by byte
    /// equality). Items not present are silently ignored. Does not
    /// cascade CRL removal; callers remove associated CRLs themselves.
    async fn remove_from_trust_list(&self, tl: &TrustList) -> Result<()>;

    /// Return all certificates in the rejected list.
    async fn get_rejected_list(&self) -> Result<Vec<Certificate>>;

    /// Append to the rejected list. A byte-equal duplicate is a no-op
    /// success. If the list is bounded, evicts the oldest (FIFO by
    /// insertion/mtime) before inserting.
    async fn add_to_rejected_list(&self, cert: Certificate) -> Result<()>;

    /// Replace the group's own certificate+key pair, matching the
    /// existing identity by byte equality of `old_cert`. If `new_key`
    /// is empty, the previously stored key is reused.
    async fn write_identity(
        &self,
        old_cert: Option<&Certificate>,
        new_cert: &Certificate,
        new_key: &crate::types::PrivateKey,
    ) -> Result<()>;

    /// The group's current own certificate, if one has been written.
    async fn own_certificate(&self) -> Result<Option<Certificate>>;

    /// The group's current own private key, if one has been written.
    async fn own_private_key(&self) -> Result<Option<crate::types::PrivateKey>>;

    /// Produce an independent copy-on-write clone of this store's
    /// current state, used by the Transaction Manager to stage changes
    /// (`spec.md` §4.4 `stageTrustListChange`, §9 "Ownership of staged
    /// trust stores").
    async fn snapshot_clone(&self) -> Result<memory::MemoryCertificateStore>;
}

fn dedup_certs(items: &[Certificate]) -> Vec<Certificate> {
    let mut out: Vec<Certificate> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}

fn dedup_crls(items: &[crate::types::Crl]) -> Vec<crate::types::Crl> {
    let mut out: Vec<crate::types::Crl> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}
