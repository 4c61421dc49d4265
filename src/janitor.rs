//! Session Janitor (C6, `spec.md` §4.6).
//!
//! A periodic task firing every ~10 seconds while any PENDING
//! transaction or any open FileContext exists: aborts transactions
//! whose owning session died, reclaims file handles whose session
//! died, and de-schedules itself once there is nothing left to watch.
//! Grounded in the teacher's background-task style
//! (`examples/TheCowboyAI-cim-keys/src/storage/mod.rs`), expressed
//! with `tokio::time::interval` the way the teacher's `tokio` "full"
//! feature set already supports.

use crate::dispatcher::PushManagementDispatcher;
use crate::session::SessionRegistry;
use crate::trustfile::TransactionGate as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Bounded resource reclamation, decoupled from session-close events.
pub struct SessionJanitor {
    dispatcher: Arc<PushManagementDispatcher>,
    sessions: Arc<dyn SessionRegistry>,
    tick_interval: Duration,
}

impl SessionJanitor {
    pub fn new(
        dispatcher: Arc<PushManagementDispatcher>,
        sessions: Arc<dyn SessionRegistry>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            dispatcher,
            sessions,
            tick_interval,
        }
    }

    /// Run one tick. Returns `true` if there is still something to
    /// watch (so the caller should keep ticking), `false` if the
    /// janitor should de-schedule itself (`spec.md` §4.6 point 3).
    pub async fn tick(&self) -> bool {
        let transaction = self.dispatcher.transaction_manager();

        if let Some(owner) = transaction.current_owner().await {
            if !self.sessions.is_live(owner).await {
                transaction.abort_unconditionally().await;
                warn!(session = %owner, "aborted transaction owned by a dead session");
            }
        }

        let mut anything_open = false;
        for group_id in self.dispatcher.group_ids() {
            let removed = self
                .dispatcher
                .reap_dead_sessions(&group_id, self.sessions.as_ref())
                .await
                .unwrap_or_default();
            for handle in &removed {
                info!(group = %group_id, handle = handle.0, "reclaimed file handle from a dead session");
            }
            if self.dispatcher.open_count(&group_id).await.unwrap_or(0) > 0 {
                anything_open = true;
            }
        }

        let pending = transaction.current_owner().await.is_some();
        pending || anything_open
    }

    /// Spawn the periodic task on the event loop. The returned handle
    /// completes on its own once `tick` reports nothing left to watch.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.tick_interval);
            loop {
                ticker.tick().await;
                if !self.tick().await {
                    info!("session janitor has nothing left to watch; stopping");
                    break;
                }
            }
        })
    }
}
