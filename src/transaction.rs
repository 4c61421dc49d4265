//! Transaction Manager (C4, `spec.md` §4.4).
//!
//! Stages multi-resource changes — trust-list clones per group plus
//! certificate/key identity updates — and commits them atomically.
//! Grounded in `examples/TheCowboyAI-cim-keys/src/pki/mod.rs`'s
//! `Arc<RwLock<HashMap<...>>>`-guarded mutable state, generalized from
//! single create/revoke operations to the two-phase commit this spec
//! requires.

use crate::channel::{ChannelState, SecureChannelRegistry};
use crate::error::{GdsError, Result};
use crate::eventloop::EventLoop;
use crate::store::CertificateStore;
use crate::trustfile::TransactionGate;
use crate::types::{ApplyChangesRequired, CertificateTypeId, Certificate, GroupId, PrivateKey, SessionId, TrustList};
use crate::verifier::CertificateVerifier;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// A staged certificate/key identity update (`spec.md` §4.4 `stageCertificateUpdate`).
#[derive(Clone)]
pub struct StagedCertUpdate {
    pub group_id: GroupId,
    pub type_id: CertificateTypeId,
    pub cert: Certificate,
    pub key: Option<PrivateKey>,
}

/// The seam §4.4's `commit()` uses to reach "every endpoint whose
/// security policy matches typeId" — an external collaborator this
/// crate does not own the lifecycle of.
#[async_trait]
pub trait EndpointPolicyRegistry: Send + Sync {
    /// Push a new certificate/key pair to every endpoint using `type_id`.
    async fn update_certificate_and_private_key(
        &self,
        type_id: CertificateTypeId,
        cert: &Certificate,
        key: &PrivateKey,
    ) -> Result<()>;
}

/// A no-op registry for hosts with no endpoint layer wired up yet
/// (standalone use, tests).
#[derive(Default)]
pub struct NullEndpointPolicyRegistry;

#[async_trait]
impl EndpointPolicyRegistry for NullEndpointPolicyRegistry {
    async fn update_certificate_and_private_key(
        &self,
        _type_id: CertificateTypeId,
        _cert: &Certificate,
        _key: &PrivateKey,
    ) -> Result<()> {
        Ok(())
    }
}

enum TxState {
    Fresh,
    Pending { owner: SessionId },
}

struct Inner {
    state: TxState,
    staged_trust_lists: HashMap<GroupId, TrustList>,
    staged_cert_updates: Vec<StagedCertUpdate>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            state: TxState::Fresh,
            staged_trust_lists: HashMap::new(),
            staged_cert_updates: Vec::new(),
        }
    }
}

/// Coordinates FRESH/PENDING across the whole server (`spec.md` §8
/// invariant 2: "at most one transaction is PENDING globally").
pub struct TransactionManager {
    inner: RwLock<Inner>,
    stores: HashMap<GroupId, Arc<dyn CertificateStore>>,
    endpoints: Arc<dyn EndpointPolicyRegistry>,
    channels: Arc<dyn SecureChannelRegistry>,
    verifier: CertificateVerifier,
    event_loop: EventLoop,
}

impl TransactionManager {
    pub fn new(
        stores: HashMap<GroupId, Arc<dyn CertificateStore>>,
        endpoints: Arc<dyn EndpointPolicyRegistry>,
        channels: Arc<dyn SecureChannelRegistry>,
        verifier: CertificateVerifier,
        event_loop: EventLoop,
    ) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            stores,
            endpoints,
            channels,
            verifier,
            event_loop,
        }
    }

    /// `stageCertificateUpdate` (`spec.md` §4.4). If `key` is non-empty,
    /// requires it to match `cert`'s public key, delegating the match
    /// check to the certificate-verification machinery.
    pub async fn stage_certificate_update(
        &self,
        session_id: SessionId,
        group_id: GroupId,
        type_id: CertificateTypeId,
        cert: Certificate,
        key: Option<PrivateKey>,
    ) -> Result<()> {
        self.require_owner_or_begin(session_id).await?;

        if let Some(ref k) = key {
            if !k.is_empty() && !keys_match(&cert, k)? {
                return Err(GdsError::NotSupported(
                    "private key does not match certificate".to_string(),
                ));
            }
        }

        let mut inner = self.inner.write().await;
        inner.staged_cert_updates.push(StagedCertUpdate {
            group_id,
            type_id,
            cert,
            key,
        });
        Ok(())
    }

    /// The groups touched by the currently staged transaction — trust-list
    /// groups plus the groups of any staged certificate updates. `ApplyChanges`
    /// (`spec.md` §4.5) only requires these groups to have no open file
    /// handles, not every registered group.
    pub async fn affected_groups(&self) -> Vec<GroupId> {
        let inner = self.inner.read().await;
        let mut groups: Vec<GroupId> = inner.staged_trust_lists.keys().cloned().collect();
        for update in &inner.staged_cert_updates {
            if !groups.contains(&update.group_id) {
                groups.push(update.group_id.clone());
            }
        }
        groups
    }

    /// `commit()` (`spec.md` §4.4). Applies staged trust lists and
    /// certificate updates, then schedules the post-commit sweep.
    pub async fn commit(&self, session_id: SessionId) -> Result<()> {
        let (staged_trust_lists, staged_cert_updates) = {
            let inner = self.inner.read().await;
            match inner.state {
                TxState::Fresh => return Err(GdsError::NothingToDo),
                TxState::Pending { owner } if owner != session_id => {
                    return Err(GdsError::UserAccessDenied(
                        "caller is not the transaction owner".to_string(),
                    ))
                }
                TxState::Pending { .. } => {}
            }
            (
                inner.staged_trust_lists.clone(),
                inner.staged_cert_updates.clone(),
            )
        };

        for (group, tl) in &staged_trust_lists {
            let store = self
                .stores
                .get(group)
                .ok_or_else(|| GdsError::NotSupported(format!("unsupported group {group}")))?;
            if let Err(e) = store.set_trust_list(tl).await {
                warn!(%group, error = %e, "commit failed applying staged trust list; aborting");
                self.abort(session_id).await?;
                return Err(e);
            }
        }

        for update in &staged_cert_updates {
            let store = match self.stores.get(&update.group_id) {
                Some(store) => store,
                None => {
                    let e = GdsError::NotSupported(format!("unsupported group {}", update.group_id));
                    self.abort(session_id).await?;
                    return Err(e);
                }
            };

            let old_cert = match store.own_certificate().await {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "commit failed reading current identity; aborting");
                    self.abort(session_id).await?;
                    return Err(e);
                }
            };
            let new_key = update.key.clone().unwrap_or_else(|| PrivateKey::new(Vec::new()));
            if let Err(e) = store.write_identity(old_cert.as_ref(), &update.cert, &new_key).await {
                warn!(error = %e, "commit failed writing own identity; aborting");
                self.abort(session_id).await?;
                return Err(e);
            }

            // `write_identity` reuses the previously stored key when `new_key`
            // is empty, so read back whatever key is now on record before
            // pushing the pair to endpoints.
            let resolved_key = match store.own_private_key().await {
                Ok(Some(k)) => k,
                Ok(None) => {
                    warn!("own identity written with no resolvable private key; skipping endpoint push");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "commit failed reading resolved identity; aborting");
                    self.abort(session_id).await?;
                    return Err(e);
                }
            };
            if let Err(e) = self
                .endpoints
                .update_certificate_and_private_key(update.type_id, &update.cert, &resolved_key)
                .await
            {
                warn!(error = %e, "commit failed pushing certificate to endpoints; aborting");
                self.abort(session_id).await?;
                return Err(e);
            }
        }

        let trust_lists_changed = !staged_trust_lists.is_empty();
        let certs_changed = !staged_cert_updates.is_empty();

        {
            let mut inner = self.inner.write().await;
            *inner = Inner::default();
        }

        self.schedule_post_commit_sweep(staged_trust_lists, trust_lists_changed, certs_changed);
        info!("transaction committed");
        Ok(())
    }

    /// `abort()` (`spec.md` §4.4): drop staged state, return to FRESH.
    pub async fn abort(&self, session_id: SessionId) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.state {
            TxState::Pending { owner } if owner == session_id => {
                *inner = Inner::default();
                Ok(())
            }
            TxState::Pending { .. } => Err(GdsError::UserAccessDenied(
                "caller is not the transaction owner".to_string(),
            )),
            TxState::Fresh => Ok(()),
        }
    }

    /// Used by the Session Janitor (`spec.md` §4.6 point 1): force an
    /// abort regardless of caller identity because the owning session
    /// is gone.
    pub async fn abort_unconditionally(&self) {
        let mut inner = self.inner.write().await;
        *inner = Inner::default();
    }

    pub async fn current_owner(&self) -> Option<SessionId> {
        match self.inner.read().await.state {
            TxState::Pending { owner } => Some(owner),
            TxState::Fresh => None,
        }
    }

    async fn require_owner_or_begin(&self, session_id: SessionId) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.state {
            TxState::Fresh => {
                inner.state = TxState::Pending { owner: session_id };
                Ok(())
            }
            TxState::Pending { owner } if owner == session_id => Ok(()),
            TxState::Pending { .. } => Err(GdsError::TransactionPending),
        }
    }

    fn schedule_post_commit_sweep(
        &self,
        changed_trust_lists: HashMap<GroupId, TrustList>,
        trust_lists_changed: bool,
        certs_changed: bool,
    ) {
        let channels = self.channels.clone();
        let verifier_accept_when_empty = self.verifier.accept_when_store_empty;
        self.event_loop.schedule_delayed(Duration::from_millis(0), async move {
            let verifier = CertificateVerifier {
                accept_when_store_empty: verifier_accept_when_empty,
            };
            for channel in channels.live_channels().await {
                if channel.state == ChannelState::Closed {
                    continue;
                }
                if certs_changed {
                    channels.begin_shutdown(channel.id).await;
                    continue;
                }
                if trust_lists_changed {
                    if let Some(tl) = changed_trust_lists.get(&channel.group) {
                        if let Some(peer_cert) = &channel.peer_certificate {
                            if verifier.verify(tl, peer_cert, &[]).is_err() {
                                channels.begin_shutdown(channel.id).await;
                            }
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl TransactionGate for TransactionManager {
    async fn begin_write(&self, session_id: SessionId) -> Result<()> {
        self.require_owner_or_begin(session_id).await
    }

    async fn stage_trust_list(&self, group: &GroupId, tl: TrustList) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.staged_trust_lists.insert(group.clone(), tl);
        Ok(())
    }

    async fn abort_owned_by(&self, session_id: SessionId) -> Result<()> {
        self.abort(session_id).await
    }

    async fn mark_apply_required(&self, session_id: SessionId) -> Result<ApplyChangesRequired> {
        let inner = self.inner.read().await;
        match inner.state {
            TxState::Pending { owner } if owner == session_id => Ok(ApplyChangesRequired(true)),
            _ => Err(GdsError::InvalidState(
                "no pending transaction owned by this session".to_string(),
            )),
        }
    }
}

/// Checks that `key` is the private counterpart of `cert`'s RSA public
/// key, per `spec.md` §4.4's "delegated" key-pair match requirement.
fn keys_match(cert: &Certificate, key: &PrivateKey) -> Result<bool> {
    use rsa::pkcs1::DecodeRsaPrivateKey as _;
    use rsa::pkcs8::DecodePrivateKey as _;
    use secrecy::ExposeSecret as _;

    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_bytes())
        .map_err(|e| GdsError::CertificateInvalid(format!("failed to parse certificate: {e}")))?;
    let cert_modulus = match parsed.public_key().parsed() {
        Ok(x509_parser::public_key::PublicKey::RSA(rsa)) => rsa.modulus.to_vec(),
        _ => return Err(GdsError::NotSupported("non-RSA certificate key".to_string())),
    };

    let key_bytes = key.expose_secret();
    let private_key = rsa::RsaPrivateKey::from_pkcs8_pem(
        std::str::from_utf8(key_bytes)
            .map_err(|_| GdsError::InvalidArgument("private key is not valid UTF-8 PEM".to_string()))?,
    )
    .or_else(|_| {
        rsa::RsaPrivateKey::from_pkcs1_pem(
            std::str::from_utf8(key_bytes).unwrap_or_default(),
        )
    })
    .map_err(|e| GdsError::InvalidArgument(format!("unparsable private key: {e}")))?;

    use rsa::traits::PublicKeyParts;
    let key_modulus = private_key.n().to_bytes_be();
    Ok(trim_leading_zero(&cert_modulus) == trim_leading_zero(&key_modulus))
}

fn trim_leading_zero(bytes: &[u8]) -> &[u8] {
    match bytes.split_first() {
        Some((0, rest)) => rest,
        _ => bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::InMemorySecureChannelRegistry;
    use crate::store::memory::MemoryCertificateStore;
    use crate::types::Crl;

    fn manager() -> TransactionManager {
        let mut stores: HashMap<GroupId, Arc<dyn CertificateStore>> = HashMap::new();
        stores.insert(GroupId::Application, Arc::new(MemoryCertificateStore::new(0)));
        TransactionManager::new(
            stores,
            Arc::new(NullEndpointPolicyRegistry),
            Arc::new(InMemorySecureChannelRegistry::new()),
            CertificateVerifier::default(),
            EventLoop::new(),
        )
    }

    fn session() -> SessionId {
        SessionId(uuid::Uuid::new_v4())
    }

    #[tokio::test]
    async fn second_session_is_rejected_while_pending() {
        let tx = manager();
        let s1 = session();
        let s2 = session();
        tx.begin_write(s1).await.unwrap();
        let result = tx.begin_write(s2).await;
        assert!(matches!(result, Err(GdsError::TransactionPending)));
    }

    #[tokio::test]
    async fn commit_with_fresh_state_is_nothing_to_do() {
        let tx = manager();
        let result = tx.commit(session()).await;
        assert!(matches!(result, Err(GdsError::NothingToDo)));
    }

    #[tokio::test]
    async fn commit_by_non_owner_is_access_denied() {
        let tx = manager();
        let owner = session();
        let other = session();
        tx.begin_write(owner).await.unwrap();
        let result = tx.commit(other).await;
        assert!(matches!(result, Err(GdsError::UserAccessDenied(_))));
    }

    #[tokio::test]
    async fn commit_applies_staged_trust_list_to_live_store() {
        let tx = manager();
        let session_id = session();
        tx.begin_write(session_id).await.unwrap();
        let mut tl = TrustList::empty();
        tl.trusted_certificates.push(Certificate::new(vec![1, 2, 3]));
        tx.stage_trust_list(&GroupId::Application, tl.clone())
            .await
            .unwrap();
        tx.commit(session_id).await.unwrap();

        let live = tx.stores[&GroupId::Application]
            .get_trust_list(crate::types::TrustListMask::ALL)
            .await
            .unwrap();
        assert_eq!(live.trusted_certificates, tl.trusted_certificates);
        assert!(tx.current_owner().await.is_none());
    }

    #[tokio::test]
    async fn commit_persists_staged_certificate_update_via_write_identity() {
        let tx = manager();
        let session_id = session();
        tx.begin_write(session_id).await.unwrap();
        let new_cert = Certificate::new(vec![7, 7, 7]);
        tx.stage_certificate_update(session_id, GroupId::Application, CertificateTypeId::RsaMin, new_cert.clone(), None)
            .await
            .unwrap();
        tx.commit(session_id).await.unwrap();

        let stored = tx.stores[&GroupId::Application].own_certificate().await.unwrap();
        assert_eq!(stored, Some(new_cert));
    }

    #[tokio::test]
    async fn affected_groups_reports_only_staged_groups() {
        let tx = manager();
        let session_id = session();
        tx.begin_write(session_id).await.unwrap();
        assert!(tx.affected_groups().await.is_empty());

        tx.stage_trust_list(&GroupId::Application, TrustList::empty())
            .await
            .unwrap();
        assert_eq!(tx.affected_groups().await, vec![GroupId::Application]);
    }

    #[tokio::test]
    async fn abort_clears_staged_state_without_touching_live_store() {
        let tx = manager();
        let session_id = session();
        tx.begin_write(session_id).await.unwrap();
        let mut tl = TrustList::empty();
        tl.trusted_crls.push(Crl::new(vec![9]));
        tx.stage_trust_list(&GroupId::Application, tl).await.unwrap();
        tx.abort(session_id).await.unwrap();

        let live = tx.stores[&GroupId::Application]
            .get_trust_list(crate::types::TrustListMask::ALL)
            .await
            .unwrap();
        assert!(live.is_empty());
        assert!(tx.current_owner().await.is_none());
    }
}
