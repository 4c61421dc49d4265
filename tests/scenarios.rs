//! End-to-end scenarios exercising the Push-Management Dispatcher the
//! way a client session would, following the walkthroughs a push-management
//! trust-rollover flow goes through in practice: trust round-trips,
//! write-open exclusivity, transactional commits, abort on session
//! loss, CRL cascade on removal, and rejected-list determinism.

use gds_push::channel::{ChannelState, InMemorySecureChannelRegistry};
use gds_push::config::{Config, GroupConfig};
use gds_push::dispatcher::PushManagementDispatcher;
use gds_push::eventloop::EventLoop;
use gds_push::session::InMemorySessionRegistry;
use gds_push::store::memory::MemoryCertificateStore;
use gds_push::store::CertificateStore;
use gds_push::transaction::NullEndpointPolicyRegistry;
use gds_push::types::{CertificateTypeId, Certificate, GroupId, SessionId, TrustListMask};
use rcgen::{CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};
use std::collections::HashMap;
use std::sync::Arc;

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

fn dispatcher_with_channels() -> (PushManagementDispatcher, Arc<InMemorySecureChannelRegistry>) {
    let config = Config {
        groups: vec![GroupConfig::new(
            GroupId::Application,
            vec![CertificateTypeId::RsaMin, CertificateTypeId::RsaSha256],
        )],
        ..Config::default()
    };
    let mut stores: HashMap<GroupId, Arc<dyn CertificateStore>> = HashMap::new();
    stores.insert(GroupId::Application, Arc::new(MemoryCertificateStore::new(0)));
    let channels = Arc::new(InMemorySecureChannelRegistry::new());
    let dispatcher = PushManagementDispatcher::new(
        &config,
        stores,
        Arc::new(NullEndpointPolicyRegistry),
        channels.clone(),
        EventLoop::new(),
    );
    (dispatcher, channels)
}

fn session() -> SessionId {
    SessionId(uuid::Uuid::new_v4())
}

/// S1: Simple trust round-trip.
#[tokio::test]
async fn s1_simple_trust_round_trip() {
    let (dispatcher, _channels) = dispatcher_with_channels();
    let cert_a = self_signed("certA");

    dispatcher
        .add_certificate(GroupId::Application, cert_a.clone(), true)
        .await
        .unwrap();

    let tl = dispatcher
        .stage_clone(&GroupId::Application)
        .await
        .unwrap()
        .get_trust_list(TrustListMask::TRUSTED_CERTIFICATES)
        .await
        .unwrap();

    assert_eq!(tl.trusted_certificates, vec![cert_a]);
    assert_eq!(dispatcher.open_count(&GroupId::Application).await.unwrap(), 0);
}

/// S2: Write-open exclusivity.
#[tokio::test]
async fn s2_write_open_exclusivity() {
    let (dispatcher, _channels) = dispatcher_with_channels();
    let session_x = session();
    let session_y = session();

    let write_handle = dispatcher
        .open(GroupId::Application, session_x, 0x06)
        .await
        .unwrap();

    let read_attempt = dispatcher.open(GroupId::Application, session_y, 0x01).await;
    assert!(read_attempt.is_err());

    let add_attempt = dispatcher
        .add_certificate(GroupId::Application, self_signed("blocked"), true)
        .await;
    assert!(add_attempt.is_err());

    dispatcher.close(GroupId::Application, write_handle).await.unwrap();

    let read_handle = dispatcher.open(GroupId::Application, session_y, 0x01).await;
    assert!(read_handle.is_ok());
}

/// S3: Transaction commit.
#[tokio::test]
async fn s3_transaction_commit() {
    let (dispatcher, channels) = dispatcher_with_channels();
    let session_x = session();

    let cert_a = self_signed("certA");
    let cert_d = self_signed("certD");
    channels
        .open(1, GroupId::Application, Some(cert_a.clone()))
        .await;
    channels
        .open(2, GroupId::Application, Some(cert_d.clone()))
        .await;

    let handle = dispatcher.open(GroupId::Application, session_x, 0x06).await.unwrap();

    let mut tl = gds_push::types::TrustList::empty();
    tl.trusted_certificates = vec![cert_a.clone()];
    let encoded = gds_push::trustfile::codec::encode_trust_list(&tl);
    dispatcher
        .write(GroupId::Application, handle, &encoded)
        .await
        .unwrap();

    let apply_required = dispatcher
        .close_and_update(GroupId::Application, handle)
        .await
        .unwrap();
    assert!(apply_required.0);

    dispatcher.apply_changes(session_x).await.unwrap();

    let live = dispatcher
        .stage_clone(&GroupId::Application)
        .await
        .unwrap()
        .get_trust_list(TrustListMask::ALL)
        .await
        .unwrap();
    assert_eq!(live.trusted_certificates, vec![cert_a]);

    // Give the zero-delay post-commit sweep a chance to run.
    tokio::task::yield_now().await;
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    assert_eq!(channels.state_of(1).await, Some(ChannelState::Open));
    assert_eq!(channels.state_of(2).await, Some(ChannelState::Closing));
}

/// S4: Abort on session loss.
#[tokio::test]
async fn s4_abort_on_session_loss() {
    let (dispatcher, _channels) = dispatcher_with_channels();
    let sessions = Arc::new(InMemorySessionRegistry::new());
    let session_x = session();
    let session_y = session();

    sessions.register(session_x).await;
    let handle = dispatcher.open(GroupId::Application, session_x, 0x06).await.unwrap();
    let mut tl = gds_push::types::TrustList::empty();
    tl.trusted_certificates = vec![self_signed("certA")];
    dispatcher
        .write(
            GroupId::Application,
            handle,
            &gds_push::trustfile::codec::encode_trust_list(&tl),
        )
        .await
        .unwrap();

    // Session X drops without closing.
    sessions.unregister(session_x).await;

    let janitor = gds_push::janitor::SessionJanitor::new(
        Arc::new(dispatcher),
        sessions,
        std::time::Duration::from_secs(10),
    );
    let still_watching = janitor.tick().await;
    assert!(!still_watching);
}

/// S5: Remove cascades to CRLs.
#[tokio::test]
async fn s5_remove_cascades_to_crls() {
    let (dispatcher, _channels) = dispatcher_with_channels();
    let target = self_signed("toRemove");
    let thumbprint = target.thumbprint();

    dispatcher
        .add_certificate(GroupId::Application, target.clone(), true)
        .await
        .unwrap();

    dispatcher
        .remove_certificate(GroupId::Application, &thumbprint, true)
        .await
        .unwrap();

    let tl = dispatcher
        .stage_clone(&GroupId::Application)
        .await
        .unwrap()
        .get_trust_list(TrustListMask::ALL)
        .await
        .unwrap();
    assert!(!tl.trusted_certificates.iter().any(|c| c.thumbprint() == thumbprint));
}

/// S6: Rejected-list determinism.
#[tokio::test]
async fn s6_rejected_list_determinism() {
    use gds_push::verifier::CertificateVerifier;

    let store = MemoryCertificateStore::new(0);
    let candidate = self_signed("untrusted-candidate");

    let verifier = CertificateVerifier {
        accept_when_store_empty: false,
    };
    let empty_trust = gds_push::types::TrustList::empty();
    let outcome = verifier.verify(&empty_trust, &candidate, &[]);
    assert!(outcome.is_err());
    if outcome.unwrap_err().is_certificate_rejection() {
        store.add_to_rejected_list(candidate.clone()).await.unwrap();
    }

    let rejected = store.get_rejected_list().await.unwrap();
    assert_eq!(rejected, vec![candidate]);
}
