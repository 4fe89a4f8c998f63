//! Participant registry
//!
//! Authoritative list of who is in the room. Every remote participant added
//! here gets a connection attempt in the [`PeerConnectionPool`], and every
//! removal closes that connection, so the two stay in 1:1 correspondence.

use crate::identity::{ParticipantId, ParticipantInfo};
use crate::peer::PeerConnectionPool;
use crate::types::{ConnectionState, Participant};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Room membership, in join order
pub struct ParticipantRegistry {
    local: ParticipantInfo,
    pool: Arc<PeerConnectionPool>,
    remotes: Mutex<Vec<Participant>>,
}

impl ParticipantRegistry {
    /// Create a registry containing only the local participant
    pub fn new(local: ParticipantInfo, pool: Arc<PeerConnectionPool>) -> Self {
        Self {
            local,
            pool,
            remotes: Mutex::new(Vec::new()),
        }
    }

    /// Local participant
    pub fn local(&self) -> &ParticipantInfo {
        &self.local
    }

    /// Record a participant announced by join, update or roster
    ///
    /// A newcomer gets a connection attempt. A known participant only has
    /// its name and role refreshed. Returns whether the participant is new.
    pub fn on_presence(&self, info: ParticipantInfo) -> bool {
        if info.id == self.local.id {
            return false;
        }

        {
            let mut remotes = self.remotes.lock();
            if let Some(existing) = remotes.iter_mut().find(|p| p.info.id == info.id) {
                if existing.info != info {
                    tracing::debug!(participant = %info.id, "Participant details updated");
                    existing.info = info;
                }
                return false;
            }
            remotes.push(Participant {
                info: info.clone(),
                connection_state: ConnectionState::New,
                is_local: false,
            });
        }

        tracing::info!(participant = %info.id, role = %info.role, "Participant joined");
        self.pool.connect(&info.id);
        true
    }

    /// Remove a participant and close its connection
    ///
    /// Returns the connection state the participant was in, or `None` if it
    /// was not known.
    pub async fn on_leave(&self, id: &ParticipantId) -> Option<ConnectionState> {
        let removed = {
            let mut remotes = self.remotes.lock();
            let index = remotes.iter().position(|p| &p.info.id == id)?;
            remotes.remove(index).connection_state
        };
        tracing::info!(participant = %id, "Participant left");
        self.pool.close_peer(id).await;
        Some(removed)
    }

    /// Record the connection state of a remote participant
    pub fn set_connection_state(&self, id: &ParticipantId, state: ConnectionState) -> bool {
        let mut remotes = self.remotes.lock();
        match remotes.iter_mut().find(|p| &p.info.id == id) {
            Some(p) => {
                p.connection_state = state;
                true
            }
            None => false,
        }
    }

    /// Local participant first, then remotes in join order
    pub fn snapshot(&self) -> Vec<Participant> {
        let remotes = self.remotes.lock();
        let mut all = Vec::with_capacity(remotes.len() + 1);
        all.push(Participant {
            info: self.local.clone(),
            connection_state: ConnectionState::Connected,
            is_local: true,
        });
        all.extend(remotes.iter().cloned());
        all
    }

    /// Whether `id` is a known remote participant
    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.remotes.lock().iter().any(|p| &p.info.id == id)
    }

    /// Number of remote participants
    pub fn remote_count(&self) -> usize {
        self.remotes.lock().len()
    }

    /// Remote participant ids in join order
    pub fn remote_ids(&self) -> Vec<ParticipantId> {
        self.remotes.lock().iter().map(|p| p.info.id.clone()).collect()
    }

    /// Drop every remote participant not in `keep`
    ///
    /// Used to reconcile against a fresh roster. Returns the removed ids with
    /// the connection state each was in.
    pub async fn retain_only(
        &self,
        keep: &HashSet<ParticipantId>,
    ) -> Vec<(ParticipantId, ConnectionState)> {
        let stale: Vec<ParticipantId> = self
            .remote_ids()
            .into_iter()
            .filter(|id| !keep.contains(id))
            .collect();
        let mut removed = Vec::with_capacity(stale.len());
        for id in stale {
            if let Some(state) = self.on_leave(&id).await {
                removed.push((id, state));
            }
        }
        removed
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;
    use crate::identity::Role;
    use crate::media::MediaCaptureManager;
    use crate::signaling::{SignalPublisher, SignalingError, SignalingMessage};
    use crate::sim::{LoopbackNetwork, SyntheticMediaSource};
    use crate::types::MediaConstraints;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tokio::sync::watch;

    struct Offline(watch::Sender<bool>);

    #[async_trait]
    impl SignalPublisher for Offline {
        async fn publish(&self, _message: SignalingMessage) -> Result<(), SignalingError> {
            Err(SignalingError::Disconnected)
        }

        fn availability(&self) -> watch::Receiver<bool> {
            self.0.subscribe()
        }
    }

    async fn registry() -> (MediaCaptureManager, ParticipantRegistry, Arc<PeerConnectionPool>) {
        let manager = MediaCaptureManager::new(Arc::new(SyntheticMediaSource::new()));
        let media = manager.acquire(&MediaConstraints::audio_only()).await.unwrap();
        let net = LoopbackNetwork::new();
        let (pool, _events) = PeerConnectionPool::new(
            "alice".into(),
            net.factory_for(&"alice".into()),
            Arc::new(Offline(watch::channel(false).0)),
            media,
            PeerConfig::default(),
        );
        let pool = Arc::new(pool);
        let local = ParticipantInfo::new("alice", "Alice", Role::Teacher);
        (manager, ParticipantRegistry::new(local, pool.clone()), pool)
    }

    fn student(id: &str) -> ParticipantInfo {
        ParticipantInfo::new(id, id.to_uppercase(), Role::Student)
    }

    #[tokio::test]
    async fn test_snapshot_starts_with_local() {
        let (_m, registry, _pool) = registry().await;
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].is_local);
        assert_eq!(snapshot[0].id().as_str(), "alice");
    }

    #[tokio::test]
    async fn test_presence_creates_connection_once() {
        let (_m, registry, pool) = registry().await;
        assert!(registry.on_presence(student("bob")));
        assert!(!registry.on_presence(student("bob")));
        assert!(!registry.on_presence(ParticipantInfo::new("alice", "Me", Role::Teacher)));

        assert_eq!(registry.remote_count(), 1);
        assert_eq!(pool.peer_ids(), vec![ParticipantId::new("bob")]);
        pool.close_all().await;
    }

    #[tokio::test]
    async fn test_presence_refreshes_details() {
        let (_m, registry, pool) = registry().await;
        registry.on_presence(ParticipantInfo::placeholder("bob".into()));
        registry.on_presence(student("bob"));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot[1].info.display_name, "BOB");
        pool.close_all().await;
    }

    #[tokio::test]
    async fn test_leave_closes_connection() {
        let (_m, registry, pool) = registry().await;
        registry.on_presence(student("bob"));
        registry.on_presence(student("carol"));

        assert_eq!(
            registry.on_leave(&"bob".into()).await,
            Some(ConnectionState::New)
        );
        assert_eq!(registry.on_leave(&"bob".into()).await, None);
        assert_eq!(registry.remote_ids(), vec![ParticipantId::new("carol")]);
        assert_eq!(pool.peer_ids(), vec![ParticipantId::new("carol")]);
        pool.close_all().await;
    }

    #[tokio::test]
    async fn test_join_order_preserved() {
        let (_m, registry, pool) = registry().await;
        for id in ["zed", "bob", "mia"] {
            registry.on_presence(student(id));
        }
        let ids: Vec<String> = registry
            .snapshot()
            .iter()
            .map(|p| p.id().to_string())
            .collect();
        assert_eq!(ids, vec!["alice", "zed", "bob", "mia"]);
        pool.close_all().await;
    }

    #[tokio::test]
    async fn test_retain_only_reconciles() {
        let (_m, registry, pool) = registry().await;
        registry.on_presence(student("bob"));
        registry.on_presence(student("carol"));

        let keep: HashSet<ParticipantId> = [ParticipantId::new("carol")].into_iter().collect();
        let removed = registry.retain_only(&keep).await;
        assert_eq!(removed, vec![(ParticipantId::new("bob"), ConnectionState::New)]);
        assert!(!registry.contains(&"bob".into()));
        assert_eq!(pool.peer_ids(), vec![ParticipantId::new("carol")]);
        pool.close_all().await;
    }

    #[tokio::test]
    async fn test_set_connection_state() {
        let (_m, registry, pool) = registry().await;
        registry.on_presence(student("bob"));
        assert!(registry.set_connection_state(&"bob".into(), ConnectionState::Negotiating));
        assert!(!registry.set_connection_state(&"nobody".into(), ConnectionState::Connected));
        assert_eq!(registry.snapshot()[1].connection_state, ConnectionState::Negotiating);
        pool.close_all().await;
    }
}
