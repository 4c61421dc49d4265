//! Push-Management Dispatcher (C5, `spec.md` §4.5).
//!
//! Binds inbound method invocations to the Certificate Store (C1),
//! Certificate Verifier (C2), Trust-List Virtual File (C3), and
//! Transaction Manager (C4), enforcing the pre-conditions in the
//! method table. Grounded in
//! `examples/TheCowboyAI-cim-keys/src/traits.rs`'s `async_trait`
//! method shapes, generalized from a single `CertificateManager` to
//! the multi-group dispatch this spec requires.

use crate::config::Config;
use crate::csr::create_signing_request;
use crate::error::{GdsError, Result};
use crate::eventloop::EventLoop;
use crate::store::memory::MemoryCertificateStore;
use crate::store::CertificateStore;
use crate::transaction::{EndpointPolicyRegistry, TransactionManager};
use crate::trustfile::TrustListFile;
use crate::types::{
    ApplyChangesRequired, Certificate, CertificateTypeId, FileHandle, GroupId, KeyFormat,
    PrivateKey, SessionId, Thumbprint, TrustListMask,
};
use crate::verifier::CertificateVerifier;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// One registered identity scope: its store, its virtual file, and the
/// certificate types it accepts.
struct CertificateGroup {
    id: GroupId,
    store: Arc<dyn CertificateStore>,
    trust_file: TrustListFile,
    supported_types: Vec<CertificateTypeId>,
}

/// The entry point method calls are bound to.
pub struct PushManagementDispatcher {
    groups: Vec<CertificateGroup>,
    transaction: Arc<TransactionManager>,
    verifier: CertificateVerifier,
}

impl PushManagementDispatcher {
    /// Build a dispatcher from configuration, registering groups in the
    /// order `config.groups` lists them (`SPEC_FULL.md` §2.5:
    /// `GetRejectedList` iterates in registration order).
    pub fn new(
        config: &Config,
        stores: HashMap<GroupId, Arc<dyn CertificateStore>>,
        endpoints: Arc<dyn EndpointPolicyRegistry>,
        channels: Arc<dyn crate::channel::SecureChannelRegistry>,
        event_loop: EventLoop,
    ) -> Self {
        let verifier = CertificateVerifier {
            accept_when_store_empty: config.accept_when_store_empty,
        };
        let transaction = Arc::new(TransactionManager::new(
            stores.clone(),
            endpoints,
            channels,
            CertificateVerifier {
                accept_when_store_empty: config.accept_when_store_empty,
            },
            event_loop,
        ));

        let groups = config
            .groups
            .iter()
            .filter_map(|group_config| {
                let store = stores.get(&group_config.group)?.clone();
                Some(CertificateGroup {
                    id: group_config.group.clone(),
                    trust_file: TrustListFile::new(group_config.group.clone(), store.clone()),
                    store,
                    supported_types: group_config.supported_types.clone(),
                })
            })
            .collect();

        Self {
            groups,
            transaction,
            verifier,
        }
    }

    fn group(&self, id: &GroupId) -> Result<&CertificateGroup> {
        self.groups
            .iter()
            .find(|g| &g.id == id)
            .ok_or_else(|| GdsError::NotSupported(format!("unsupported group {id}")))
    }

    /// `UpdateCertificate` (`spec.md` §4.5).
    pub async fn update_certificate(
        &self,
        session_id: SessionId,
        group_id: GroupId,
        type_id: CertificateTypeId,
        cert: Certificate,
        issuers: Vec<Certificate>,
        key_format: Option<KeyFormat>,
        key: Option<Vec<u8>>,
    ) -> Result<ApplyChangesRequired> {
        if group_id != GroupId::Application {
            return Err(GdsError::NotSupported(
                "UpdateCertificate only applies to the Application group".to_string(),
            ));
        }
        let group = self.group(&group_id)?;
        if !group.supported_types.contains(&type_id) {
            return Err(GdsError::NotSupported(format!(
                "group {group_id} does not support {type_id:?}"
            )));
        }
        if let Some(ref bytes) = key {
            let format = key_format.ok_or_else(|| {
                GdsError::InvalidArgument("key supplied without a format".to_string())
            })?;
            if format != KeyFormat::Pem {
                return Err(GdsError::NotSupported(
                    "only PEM private keys are supported".to_string(),
                ));
            }
            let _ = bytes;
        }

        let candidate_trust = group.store.get_trust_list(TrustListMask::ALL).await?;
        if let Err(e) = self.verifier.verify(&candidate_trust, &cert, &issuers) {
            group.store.add_to_rejected_list(cert).await.ok();
            return Err(e);
        }

        let private_key = key.map(PrivateKey::new);
        self.transaction
            .stage_certificate_update(session_id, group_id, type_id, cert, private_key)
            .await?;
        Ok(ApplyChangesRequired(true))
    }

    /// `CreateSigningRequest` (`spec.md` §4.5; `SPEC_FULL.md` §2.6 for
    /// the `regenerate_key` interaction).
    pub async fn create_signing_request(
        &self,
        session_id: SessionId,
        group_id: GroupId,
        type_id: CertificateTypeId,
        subject: &str,
        regenerate_key: bool,
        _nonce: &[u8],
    ) -> Result<Vec<u8>> {
        let group = self.group(&group_id)?;
        if !group.supported_types.contains(&type_id) {
            return Err(GdsError::NotSupported(format!(
                "group {group_id} does not support {type_id:?}"
            )));
        }

        let existing_key = group.store.own_private_key().await?;
        let existing_pem = existing_key.as_ref().map(|k| k.expose_secret().to_vec());
        let result = create_signing_request(subject, regenerate_key, existing_pem.as_deref())?;

        if let Some(generated_key) = result.generated_key {
            let own_cert = group.store.own_certificate().await?.unwrap_or_else(|| Certificate::new(Vec::new()));
            self.transaction
                .stage_certificate_update(session_id, group_id, type_id, own_cert, Some(generated_key))
                .await?;
        }

        Ok(result.der)
    }

    /// `GetRejectedList` (`spec.md` §4.5): concatenated across groups
    /// in registration order.
    pub async fn get_rejected_list(&self) -> Result<Vec<Certificate>> {
        let mut out = Vec::new();
        for group in &self.groups {
            out.extend(group.store.get_rejected_list().await?);
        }
        Ok(out)
    }

    /// `AddCertificate` (`spec.md` §4.5): no-CA rule, requires `openCount == 0`.
    pub async fn add_certificate(
        &self,
        group_id: GroupId,
        cert: Certificate,
        is_trusted: bool,
    ) -> Result<()> {
        if !is_trusted {
            return Err(GdsError::InvalidArgument(
                "AddCertificate requires isTrusted=true".to_string(),
            ));
        }
        if cert.as_bytes().is_empty() {
            return Err(GdsError::InvalidArgument("certificate is empty".to_string()));
        }
        let group = self.group(&group_id)?;
        if group.trust_file.open_count().await != 0 {
            return Err(GdsError::InvalidState(
                "group has an open file handle".to_string(),
            ));
        }
        if is_ca_certificate(&cert)? {
            return Err(GdsError::InvalidArgument(
                "CA certificates must be added via the file verbs".to_string(),
            ));
        }

        let mut tl = crate::types::TrustList::empty();
        tl.specified_lists = Some(TrustListMask::TRUSTED_CERTIFICATES);
        tl.trusted_certificates.push(cert);
        group.store.add_to_trust_list(&tl).await?;
        info!(group = %group_id, "certificate added to trusted set");
        Ok(())
    }

    /// `RemoveCertificate` (`spec.md` §4.5): cascades to associated CRLs,
    /// commits immediately without a separate `ApplyChanges`.
    pub async fn remove_certificate(
        &self,
        group_id: GroupId,
        thumbprint: &Thumbprint,
        is_trusted: bool,
    ) -> Result<()> {
        let group = self.group(&group_id)?;
        if group.trust_file.open_count().await != 0 {
            return Err(GdsError::InvalidState(
                "group has an open file handle".to_string(),
            ));
        }

        let mask = if is_trusted {
            TrustListMask::TRUSTED_CERTIFICATES
        } else {
            TrustListMask::ISSUER_CERTIFICATES
        };
        let current = group.store.get_trust_list(mask).await?;
        let certs = if is_trusted {
            &current.trusted_certificates
        } else {
            &current.issuer_certificates
        };
        let target = certs
            .iter()
            .find(|c| c.thumbprint() == *thumbprint)
            .cloned()
            .ok_or_else(|| GdsError::NotFound(format!("no certificate with thumbprint {thumbprint}")))?;

        let target_subject = common_name_or_subject(&target);
        let crl_mask = if is_trusted {
            TrustListMask::TRUSTED_CRLS
        } else {
            TrustListMask::ISSUER_CRLS
        };
        let crl_state = group.store.get_trust_list(crl_mask).await?;
        let crls = if is_trusted {
            crl_state.trusted_crls
        } else {
            crl_state.issuer_crls
        };
        let matching_crls: Vec<_> = crls
            .into_iter()
            .filter(|crl| crl_issuer(crl).as_deref() == Some(target_subject.as_str()))
            .collect();

        let mut removal = crate::types::TrustList::empty();
        removal.specified_lists = Some(mask);
        removal.trusted_certificates = if is_trusted { vec![target.clone()] } else { vec![] };
        removal.issuer_certificates = if !is_trusted { vec![target.clone()] } else { vec![] };
        group.store.remove_from_trust_list(&removal).await?;

        if !matching_crls.is_empty() {
            let mut crl_removal = crate::types::TrustList::empty();
            crl_removal.specified_lists = Some(crl_mask);
            if is_trusted {
                crl_removal.trusted_crls = matching_crls;
            } else {
                crl_removal.issuer_crls = matching_crls;
            }
            group.store.remove_from_trust_list(&crl_removal).await?;
        }

        info!(group = %group_id, %thumbprint, "certificate and associated CRLs removed");
        Ok(())
    }

    /// `ApplyChanges` (`spec.md` §4.5): only the groups actually staged in
    /// the pending transaction must have zero open file handles — an
    /// unrelated open handle on another group does not block this commit.
    pub async fn apply_changes(&self, session_id: SessionId) -> Result<()> {
        for group_id in self.transaction.affected_groups().await {
            let group = self.group(&group_id)?;
            if group.trust_file.open_count().await != 0 {
                return Err(GdsError::InvalidState(
                    "a file handle is still open for an affected group".to_string(),
                ));
            }
        }
        self.transaction.commit(session_id).await
    }

    pub async fn open(&self, group_id: GroupId, session_id: SessionId, mode_bits: u8) -> Result<FileHandle> {
        let group = self.group(&group_id)?;
        group.trust_file.open(session_id, mode_bits, self.transaction.as_ref()).await
    }

    pub async fn open_with_masks(
        &self,
        group_id: GroupId,
        session_id: SessionId,
        mask: TrustListMask,
    ) -> Result<FileHandle> {
        let group = self.group(&group_id)?;
        group.trust_file.open_with_masks(session_id, mask).await
    }

    pub async fn read(&self, group_id: GroupId, handle: FileHandle, length: u32) -> Result<Vec<u8>> {
        self.group(&group_id)?.trust_file.read(handle, length).await
    }

    pub async fn write(&self, group_id: GroupId, handle: FileHandle, data: &[u8]) -> Result<()> {
        let group = self.group(&group_id)?;
        group.trust_file.write(handle, data, self.transaction.as_ref()).await
    }

    pub async fn get_position(&self, group_id: GroupId, handle: FileHandle) -> Result<u64> {
        self.group(&group_id)?.trust_file.get_position(handle).await
    }

    pub async fn set_position(&self, group_id: GroupId, handle: FileHandle, position: u64) -> Result<()> {
        self.group(&group_id)?.trust_file.set_position(handle, position).await
    }

    pub async fn close(&self, group_id: GroupId, handle: FileHandle) -> Result<()> {
        let group = self.group(&group_id)?;
        group.trust_file.close(handle, self.transaction.as_ref()).await
    }

    pub async fn close_and_update(
        &self,
        group_id: GroupId,
        handle: FileHandle,
    ) -> Result<ApplyChangesRequired> {
        let group = self.group(&group_id)?;
        group
            .trust_file
            .close_and_update(handle, self.transaction.as_ref())
            .await
    }

    /// Snapshot-stage a group's trust list as a fresh `MemoryCertificateStore`
    /// clone, used internally by the Session Janitor's reclamation path
    /// and available for host-level diagnostics.
    pub async fn stage_clone(&self, group_id: &GroupId) -> Result<MemoryCertificateStore> {
        self.group(group_id)?.store.snapshot_clone().await
    }

    pub fn transaction_manager(&self) -> Arc<TransactionManager> {
        self.transaction.clone()
    }

    pub fn group_ids(&self) -> Vec<GroupId> {
        self.groups.iter().map(|g| g.id.clone()).collect()
    }

    pub async fn open_count(&self, group_id: &GroupId) -> Result<usize> {
        Ok(self.group(group_id)?.trust_file.open_count().await)
    }

    /// Used by the Session Janitor (`spec.md` §4.6 point 2).
    pub async fn reap_dead_sessions(
        &self,
        group_id: &GroupId,
        registry: &dyn crate::session::SessionRegistry,
    ) -> Result<Vec<FileHandle>> {
        Ok(self.group(group_id)?.trust_file.reap_dead_sessions(registry).await)
    }
}

fn is_ca_certificate(cert: &Certificate) -> Result<bool> {
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_bytes())
        .map_err(|e| GdsError::CertificateInvalid(format!("failed to parse certificate: {e}")))?;
    Ok(parsed.basic_constraints().ok().flatten().map(|bc| bc.value.ca).unwrap_or(false))
}

fn common_name_or_subject(cert: &Certificate) -> String {
    x509_parser::parse_x509_certificate(cert.as_bytes())
        .map(|(_, parsed)| parsed.subject().to_string())
        .unwrap_or_default()
}

fn crl_issuer(crl: &crate::types::Crl) -> Option<String> {
    x509_parser::parse_x509_crl(crl.as_bytes())
        .ok()
        .map(|(_, parsed)| parsed.issuer().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::InMemorySecureChannelRegistry;
    use crate::config::{Config, GroupConfig};
    use crate::store::memory::MemoryCertificateStore;
    use crate::transaction::NullEndpointPolicyRegistry;
    use rcgen::{CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};

    fn self_signed(cn: &str) -> Certificate {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![]).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        let cert = params.self_signed(&key).unwrap();
        Certificate::new(cert.der().to_vec())
    }

    fn dispatcher() -> PushManagementDispatcher {
        let config = Config {
            groups: vec![GroupConfig::new(
                GroupId::Application,
                vec![CertificateTypeId::RsaMin, CertificateTypeId::RsaSha256],
            )],
            ..Config::default()
        };
        let mut stores: HashMap<GroupId, Arc<dyn CertificateStore>> = HashMap::new();
        stores.insert(GroupId::Application, Arc::new(MemoryCertificateStore::new(0)));
        PushManagementDispatcher::new(
            &config,
            stores,
            Arc::new(NullEndpointPolicyRegistry),
            Arc::new(InMemorySecureChannelRegistry::new()),
            EventLoop::new(),
        )
    }

    #[tokio::test]
    async fn add_certificate_then_get_trust_list_round_trips() {
        let dispatcher = dispatcher();
        let cert = self_signed("trusted-leaf");
        dispatcher
            .add_certificate(GroupId::Application, cert.clone(), true)
            .await
            .unwrap();
        let group = dispatcher.group(&GroupId::Application).unwrap();
        let tl = group.store.get_trust_list(TrustListMask::ALL).await.unwrap();
        assert_eq!(tl.trusted_certificates, vec![cert]);
    }

    #[tokio::test]
    async fn add_certificate_rejects_untrusted_flag() {
        let dispatcher = dispatcher();
        let cert = self_signed("leaf");
        let result = dispatcher.add_certificate(GroupId::Application, cert, false).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn remove_certificate_requires_existing_thumbprint() {
        let dispatcher = dispatcher();
        let bogus = Thumbprint("0000000000000000000000000000000000000000".to_string());
        let result = dispatcher
            .remove_certificate(GroupId::Application, &bogus, true)
            .await;
        assert!(matches!(result, Err(GdsError::NotFound(_))));
    }

    #[tokio::test]
    async fn apply_changes_with_fresh_transaction_is_nothing_to_do() {
        let dispatcher = dispatcher();
        let result = dispatcher.apply_changes(SessionId(uuid::Uuid::new_v4())).await;
        assert!(matches!(result, Err(GdsError::NothingToDo)));
    }

    #[tokio::test]
    async fn apply_changes_ignores_open_handles_on_unrelated_groups() {
        let config = Config {
            groups: vec![
                GroupConfig::new(GroupId::Application, vec![CertificateTypeId::RsaMin]),
                GroupConfig::new(GroupId::UserToken, vec![CertificateTypeId::RsaMin]),
            ],
            ..Config::default()
        };
        let mut stores: HashMap<GroupId, Arc<dyn CertificateStore>> = HashMap::new();
        stores.insert(GroupId::Application, Arc::new(MemoryCertificateStore::new(0)));
        stores.insert(GroupId::UserToken, Arc::new(MemoryCertificateStore::new(0)));
        let dispatcher = PushManagementDispatcher::new(
            &config,
            stores,
            Arc::new(NullEndpointPolicyRegistry),
            Arc::new(InMemorySecureChannelRegistry::new()),
            EventLoop::new(),
        );

        let session_x = SessionId(uuid::Uuid::new_v4());
        let session_y = SessionId(uuid::Uuid::new_v4());

        // Unrelated open READ handle on UserToken; never part of this transaction.
        let _read_handle = dispatcher.open(GroupId::UserToken, session_y, 0x01).await.unwrap();

        let handle = dispatcher.open(GroupId::Application, session_x, 0x06).await.unwrap();
        let encoded = crate::trustfile::codec::encode_trust_list(&crate::types::TrustList::empty());
        dispatcher.write(GroupId::Application, handle, &encoded).await.unwrap();
        dispatcher.close_and_update(GroupId::Application, handle).await.unwrap();

        dispatcher.apply_changes(session_x).await.unwrap();
    }

    #[tokio::test]
    async fn get_rejected_list_is_empty_initially() {
        let dispatcher = dispatcher();
        let rejected = dispatcher.get_rejected_list().await.unwrap();
        assert!(rejected.is_empty());
    }
}
