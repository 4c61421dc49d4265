//! Secure-channel collaborator seam (`spec.md` §4.4 "post-commit sweep", §5).
//!
//! The transport layer owns real secure channels; this crate only needs
//! to enumerate peer certificates and signal cooperative shutdown.
//! Grounded in the same registry idiom as [`crate::session`].

use crate::types::{Certificate, GroupId};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Lifecycle state of a secure channel (`spec.md` §4.4 "Shutdown is cooperative").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Closing,
    Closed,
}

/// A channel's identity for the purposes of the post-commit sweep.
#[derive(Debug, Clone)]
pub struct SecureChannel {
    pub id: u32,
    pub group: GroupId,
    pub peer_certificate: Option<Certificate>,
    pub state: ChannelState,
}

/// What the post-commit sweep (C4) needs from the transport layer.
#[async_trait]
pub trait SecureChannelRegistry: Send + Sync {
    /// Snapshot of all channels not already `Closed`.
    async fn live_channels(&self) -> Vec<SecureChannel>;

    /// Cooperatively begin shutdown of `channel_id`: transition to
    /// `Closing` and let in-flight traffic drain. Never forcibly
    /// truncates an in-flight RPC.
    async fn begin_shutdown(&self, channel_id: u32);
}

/// A minimal in-process registry for standalone use/testing.
#[derive(Default, Clone)]
pub struct InMemorySecureChannelRegistry {
    channels: Arc<RwLock<Vec<SecureChannel>>>,
}

impl InMemorySecureChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn open(&self, id: u32, group: GroupId, peer_certificate: Option<Certificate>) {
        self.channels.write().await.push(SecureChannel {
            id,
            group,
            peer_certificate,
            state: ChannelState::Open,
        });
    }

    pub async fn state_of(&self, id: u32) -> Option<ChannelState> {
        self.channels
            .read()
            .await
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.state)
    }
}

#[async_trait]
impl SecureChannelRegistry for InMemorySecureChannelRegistry {
    async fn live_channels(&self) -> Vec<SecureChannel> {
        self.channels
            .read()
            .await
            .iter()
            .filter(|c| c.state != ChannelState::Closed)
            .cloned()
            .collect()
    }

    async fn begin_shutdown(&self, channel_id: u32) {
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.iter_mut().find(|c| c.id == channel_id) {
            channel.state = ChannelState::Closing;
        }
    }
}
