//! Session collaborator seam (`spec.md` §1, §4.6).
//!
//! The OPC UA session layer lives outside this crate; the Session
//! Janitor only needs to ask "is this session still live". Grounded in
//! the teacher's registry idiom (`examples/TheCowboyAI-cim-keys/src/storage/mod.rs`'s
//! `Arc<RwLock<HashMap<...>>>` index) applied to a `HashSet` of live ids.

use crate::types::SessionId;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

/// What the Session Janitor (C6) needs from the session layer.
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    /// True if `session_id` is still an active OPC UA session.
    async fn is_live(&self, session_id: SessionId) -> bool;
}

/// A minimal in-process registry, used when this crate is exercised
/// standalone (tests) or embedded in a host that has no richer session
/// tracking of its own.
#[derive(Default, Clone)]
pub struct InMemorySessionRegistry {
    live: Arc<RwLock<HashSet<SessionId>>>,
}

impl InMemorySessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, session_id: SessionId) {
        self.live.write().await.insert(session_id);
    }

    pub async fn unregister(&self, session_id: SessionId) {
        self.live.write().await.remove(&session_id);
    }
}

#[async_trait]
impl SessionRegistry for InMemorySessionRegistry {
    async fn is_live(&self, session_id: SessionId) -> bool {
        self.live.read().await.contains(&session_id)
    }
}
