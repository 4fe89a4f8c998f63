//! Conference orchestration
//!
//! [`ConferenceController`] is the single entry point a UI talks to. It owns
//! the media capture manager and, while joined, one session made of a
//! signaling channel, a peer connection pool, the participant registry and a
//! quality monitor. A coordinator task serializes every mutation of the
//! registry: signaling messages, peer state changes and quality updates are
//! processed one at a time in arrival order.

use crate::config::{ConferenceConfig, ConfigError};
use crate::identity::{ParticipantId, ParticipantInfo, RoomId};
use crate::media::{MediaCaptureManager, MediaError, MediaSource};
use crate::peer::{CloseReason, PeerConnectionPool, PeerEvent};
use crate::quality::{ConnectionQualityMonitor, QualityUpdate};
use crate::registry::ParticipantRegistry;
use crate::signaling::{
    SignalingChannel, SignalingError, SignalingEvent, SignalingMessage, SignalingTransport,
};
use crate::transport::PeerTransportFactory;
use crate::types::{
    ConferenceEvent, ConnectionQualityMetrics, ConnectionState, Participant, SessionId,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// Errors that reject [`ConferenceController::join`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    /// User or platform denied camera/microphone access
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Capture device missing or busy
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Signaling relay unreachable
    #[error("Signaling failed: {0}")]
    Signaling(#[from] SignalingError),
}

impl From<MediaError> for JoinError {
    fn from(e: MediaError) -> Self {
        match e {
            MediaError::PermissionDenied(msg) => Self::PermissionDenied(msg),
            MediaError::DeviceUnavailable(msg) => Self::DeviceUnavailable(msg),
            MediaError::AlreadyAcquired => {
                Self::DeviceUnavailable("capture already in use".to_string())
            }
        }
    }
}

/// Handle returned by callback registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type ParticipantsCallback = Arc<dyn Fn(&[Participant]) + Send + Sync>;
type QualityCallback = Arc<dyn Fn(&ParticipantId, &ConnectionQualityMetrics) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    next_id: AtomicU64,
    participants: Mutex<Vec<(SubscriptionId, ParticipantsCallback)>>,
    quality: Mutex<Vec<(SubscriptionId, Option<ParticipantId>, QualityCallback)>>,
}

impl Subscribers {
    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// Fan-out to callbacks and the event broadcast
#[derive(Clone)]
struct Notifier {
    subscribers: Arc<Subscribers>,
    events: broadcast::Sender<ConferenceEvent>,
}

impl Notifier {
    fn participants(&self, participants: Vec<Participant>) {
        // Callbacks run outside the lock so they may (un)subscribe
        let callbacks: Vec<ParticipantsCallback> = self
            .subscribers
            .participants
            .lock()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(&participants);
        }
        let _ = self
            .events
            .send(ConferenceEvent::ParticipantsChanged { participants });
    }

    fn quality(&self, update: QualityUpdate) {
        let callbacks: Vec<QualityCallback> = self
            .subscribers
            .quality
            .lock()
            .iter()
            .filter(|(_, filter, _)| filter.as_ref().map_or(true, |id| id == &update.peer_id))
            .map(|(_, _, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(&update.peer_id, &update.metrics);
        }
        let _ = self.events.send(ConferenceEvent::QualityChanged {
            peer_id: update.peer_id,
            metrics: update.metrics,
        });
    }

    fn event(&self, event: ConferenceEvent) {
        let _ = self.events.send(event);
    }
}

#[derive(Clone)]
struct SessionView {
    id: SessionId,
    registry: Arc<ParticipantRegistry>,
    pool: Arc<PeerConnectionPool>,
    monitor: Arc<ConnectionQualityMonitor>,
}

struct ActiveSession<T: SignalingTransport> {
    room: RoomId,
    channel: Arc<SignalingChannel<T>>,
    view: SessionView,
    shutdown: watch::Sender<bool>,
    coordinator: JoinHandle<()>,
}

/// Releases media and signaling if `join` does not complete
///
/// Signaling teardown needs an await, so it runs on a task that the next
/// `join` waits for before touching the shared transport.
struct JoinRollback<'a, T: SignalingTransport> {
    media: &'a MediaCaptureManager,
    channel: Option<Arc<SignalingChannel<T>>>,
    cleanup: &'a Mutex<Option<JoinHandle<()>>>,
    armed: bool,
}

impl<T: SignalingTransport> JoinRollback<'_, T> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<T: SignalingTransport> Drop for JoinRollback<'_, T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::debug!("Rolling back partial join");
        self.media.release();
        if let Some(channel) = self.channel.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let task = handle.spawn(async move { channel.disconnect().await });
                *self.cleanup.lock() = Some(task);
            }
        }
    }
}

/// Live-classroom conference façade
///
/// One instance per user session. Callbacks registered on it survive
/// join/leave cycles.
pub struct ConferenceController<T: SignalingTransport> {
    config: ConferenceConfig,
    media: MediaCaptureManager,
    signaling: Arc<T>,
    peers: Arc<dyn PeerTransportFactory>,
    notifier: Notifier,
    session: tokio::sync::Mutex<Option<ActiveSession<T>>>,
    view: RwLock<Option<SessionView>>,
    rollback: Mutex<Option<JoinHandle<()>>>,
}

impl<T: SignalingTransport> ConferenceController<T> {
    /// Create a controller over the given platform seams
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if `config` is unusable, for
    /// example a zero sampling interval.
    pub fn new(
        config: ConferenceConfig,
        media_source: Arc<dyn MediaSource>,
        signaling: Arc<T>,
        peers: Arc<dyn PeerTransportFactory>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (events, _) = broadcast::channel(1000);
        Ok(Self {
            config,
            media: MediaCaptureManager::new(media_source),
            signaling,
            peers,
            notifier: Notifier {
                subscribers: Arc::new(Subscribers::default()),
                events,
            },
            session: tokio::sync::Mutex::new(None),
            view: RwLock::new(None),
            rollback: Mutex::new(None),
        })
    }

    /// Join `room` as `local`
    ///
    /// Acquires local media, connects signaling and announces presence, then
    /// starts a connection to every participant already in the room. Joining
    /// while already joined is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`JoinError::PermissionDenied`] or
    /// [`JoinError::DeviceUnavailable`] if media capture fails, and
    /// [`JoinError::Signaling`] if the relay is unreachable. Nothing acquired
    /// during the attempt is left behind.
    #[tracing::instrument(skip(self, local), fields(room = %room, participant = %local.id))]
    pub async fn join(&self, room: RoomId, local: ParticipantInfo) -> Result<(), JoinError> {
        let mut session = self.session.lock().await;
        if let Some(active) = session.as_ref() {
            if active.room != room {
                tracing::warn!(current = %active.room, "Already in another room; leave first");
            } else {
                tracing::debug!("Already joined");
            }
            return Ok(());
        }

        let unfinished = self.rollback.lock().take();
        if let Some(task) = unfinished {
            tracing::debug!("Waiting for an interrupted join to unwind");
            let _ = task.await;
        }

        tracing::info!("Joining room");

        let media = self.media.acquire(&self.config.media).await?;
        let mut rollback = JoinRollback {
            media: &self.media,
            channel: None,
            cleanup: &self.rollback,
            armed: true,
        };

        let channel = Arc::new(SignalingChannel::new(
            self.signaling.clone(),
            self.config.signaling.reconnect.clone(),
        ));
        let signaling_events = channel.subscribe();
        rollback.channel = Some(channel.clone());
        let roster = channel.connect(&room, &local).await?;

        let (pool, peer_events) = PeerConnectionPool::new(
            local.id.clone(),
            self.peers.clone(),
            channel.clone(),
            media,
            self.config.peer.clone(),
        );
        let pool = Arc::new(pool);
        let registry = Arc::new(ParticipantRegistry::new(local.clone(), pool.clone()));
        let (monitor, quality_updates) = ConnectionQualityMonitor::new(self.config.quality.clone());
        let view = SessionView {
            id: SessionId::new(),
            registry,
            pool,
            monitor: Arc::new(monitor),
        };

        let existing = roster.len();
        for info in roster {
            view.registry.on_presence(info);
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let coordinator = Coordinator {
            view: view.clone(),
            notifier: self.notifier.clone(),
        };
        let coordinator = tokio::spawn(coordinator.run(
            signaling_events,
            peer_events,
            quality_updates,
            shutdown_rx,
        ));
        rollback.disarm();

        let snapshot = view.registry.snapshot();
        let session_id = view.id;
        *self.view.write() = Some(view.clone());
        *session = Some(ActiveSession {
            room,
            channel,
            view,
            shutdown,
            coordinator,
        });
        drop(session);

        tracing::info!(session_id = %session_id, existing, "Joined room");
        self.notifier.participants(snapshot);
        Ok(())
    }

    /// Leave the current room
    ///
    /// Stops quality sampling, closes every peer connection, announces the
    /// departure and disconnects signaling, then releases local media. Every
    /// step is best-effort. No-op when not joined.
    #[tracing::instrument(skip(self))]
    pub async fn leave(&self) {
        let mut session = self.session.lock().await;
        let Some(active) = session.take() else {
            tracing::debug!("Not in a room");
            return;
        };
        tracing::info!(room = %active.room, "Leaving room");

        let _ = active.shutdown.send(true);
        if let Err(e) = active.coordinator.await {
            if !e.is_cancelled() {
                tracing::warn!(error = %e, "Coordinator task failed");
            }
        }

        active.view.monitor.stop().await;
        active.view.pool.close_all().await;
        active.channel.disconnect().await;
        self.media.release();
        *self.view.write() = None;
        drop(session);

        tracing::info!(room = %active.room, "Left room");
        self.notifier.participants(Vec::new());
    }

    /// Flip the microphone; returns the new muted state
    pub fn toggle_microphone(&self) -> bool {
        self.media.toggle_muted()
    }

    /// Flip the camera; returns the new camera-off state
    pub fn toggle_camera(&self) -> bool {
        self.media.toggle_camera_off()
    }

    /// Called with the full participant list after every change
    pub fn on_participants_changed<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&[Participant]) + Send + Sync + 'static,
    {
        let id = self.notifier.subscribers.next_id();
        self.notifier
            .subscribers
            .participants
            .lock()
            .push((id, Arc::new(callback)));
        id
    }

    /// Called with every peer's quality updates
    pub fn on_quality_changed<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ParticipantId, &ConnectionQualityMetrics) + Send + Sync + 'static,
    {
        self.add_quality_callback(None, Arc::new(callback))
    }

    /// Called with quality updates for `peer_id` only
    pub fn on_peer_quality_changed<F>(&self, peer_id: ParticipantId, callback: F) -> SubscriptionId
    where
        F: Fn(&ParticipantId, &ConnectionQualityMetrics) + Send + Sync + 'static,
    {
        self.add_quality_callback(Some(peer_id), Arc::new(callback))
    }

    fn add_quality_callback(
        &self,
        filter: Option<ParticipantId>,
        callback: QualityCallback,
    ) -> SubscriptionId {
        let id = self.notifier.subscribers.next_id();
        self.notifier
            .subscribers
            .quality
            .lock()
            .push((id, filter, callback));
        id
    }

    /// Remove a callback; returns whether it was registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let subscribers = &self.notifier.subscribers;
        let mut participants = subscribers.participants.lock();
        let before = participants.len();
        participants.retain(|(sid, _)| *sid != id);
        if participants.len() != before {
            return true;
        }
        drop(participants);

        let mut quality = subscribers.quality.lock();
        let before = quality.len();
        quality.retain(|(sid, _, _)| *sid != id);
        quality.len() != before
    }

    /// Subscribe to conference events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConferenceEvent> {
        self.notifier.events.subscribe()
    }

    /// Identifier of the current session, fresh on every join
    pub fn session_id(&self) -> Option<SessionId> {
        self.view.read().as_ref().map(|v| v.id)
    }

    /// Whether a room is currently joined
    pub fn is_joined(&self) -> bool {
        self.view.read().is_some()
    }

    /// Current participants, local first; empty when not joined
    pub fn participants(&self) -> Vec<Participant> {
        self.view
            .read()
            .as_ref()
            .map(|v| v.registry.snapshot())
            .unwrap_or_default()
    }

    /// Last quality metrics reported for `peer_id`
    pub fn quality_of(&self, peer_id: &ParticipantId) -> Option<ConnectionQualityMetrics> {
        self.view
            .read()
            .as_ref()
            .and_then(|v| v.monitor.latest(peer_id))
    }

    /// Connection state towards `peer_id`
    pub fn peer_state(&self, peer_id: &ParticipantId) -> Option<ConnectionState> {
        self.view
            .read()
            .as_ref()
            .and_then(|v| v.pool.state_of(peer_id))
    }

    /// Number of peer connections not in `closed`
    pub fn active_connections(&self) -> usize {
        self.view
            .read()
            .as_ref()
            .map_or(0, |v| v.pool.active_count())
    }

    /// Number of live quality sampling tasks
    pub fn active_quality_timers(&self) -> usize {
        self.view
            .read()
            .as_ref()
            .map_or(0, |v| v.monitor.active_timers())
    }

    /// Whether the microphone is muted
    pub fn is_muted(&self) -> bool {
        self.media.is_muted()
    }

    /// Whether the camera is off
    pub fn is_camera_off(&self) -> bool {
        self.media.is_camera_off()
    }

    /// Whether local capture is currently held
    pub fn is_capturing(&self) -> bool {
        self.media.is_active()
    }

    /// Configuration in use
    pub fn config(&self) -> &ConferenceConfig {
        &self.config
    }
}

impl<T: SignalingTransport> Drop for ConferenceController<T> {
    fn drop(&mut self) {
        if let Some(active) = self.session.get_mut().take() {
            let _ = active.shutdown.send(true);
            active.coordinator.abort();
        }
    }
}

// ============================================================================
// Coordinator
// ============================================================================

struct Coordinator {
    view: SessionView,
    notifier: Notifier,
}

impl Coordinator {
    async fn run(
        self,
        mut signaling: mpsc::UnboundedReceiver<SignalingEvent>,
        mut peers: mpsc::UnboundedReceiver<PeerEvent>,
        mut quality: mpsc::UnboundedReceiver<QualityUpdate>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some(event) = signaling.recv() => self.on_signaling(event).await,
                Some(event) = peers.recv() => self.on_peer(event).await,
                Some(update) = quality.recv() => self.notifier.quality(update),
                else => break,
            }
        }
        tracing::debug!("Coordinator stopped");
    }

    fn publish_participants(&self) {
        self.notifier.participants(self.view.registry.snapshot());
    }

    async fn on_signaling(&self, event: SignalingEvent) {
        let registry = &self.view.registry;
        match event {
            SignalingEvent::Message(message) => match message {
                SignalingMessage::Join { .. } | SignalingMessage::ParticipantUpdate { .. } => {
                    if let Some(info) = message.participant_info() {
                        let before = registry.snapshot();
                        registry.on_presence(info);
                        if registry.snapshot() != before {
                            self.publish_participants();
                        }
                    }
                }
                SignalingMessage::Leave { participant_id } => {
                    if self.remove_participant(&participant_id).await {
                        self.publish_participants();
                    } else {
                        tracing::debug!(participant = %participant_id, "Leave for unknown participant");
                    }
                }
                SignalingMessage::Offer { .. } => {
                    let from = message.sender().clone();
                    if !registry.contains(&from) {
                        tracing::debug!(participant = %from, "Offer from unannounced participant");
                        registry.on_presence(ParticipantInfo::placeholder(from));
                        self.publish_participants();
                    }
                    self.view.pool.deliver(message);
                }
                SignalingMessage::Answer { .. } | SignalingMessage::IceCandidate { .. } => {
                    // Only meaningful for a negotiation this side is part of
                    if registry.contains(message.sender()) {
                        self.view.pool.deliver(message);
                    } else {
                        tracing::debug!(participant = %message.sender(), "Dropping peer message from unknown participant");
                    }
                }
            },
            SignalingEvent::Disconnected => {
                tracing::warn!("Signaling disconnected; existing connections kept");
                self.notifier.event(ConferenceEvent::SignalingDisconnected);
            }
            SignalingEvent::Reconnected { roster } => {
                let keep: HashSet<ParticipantId> = roster.iter().map(|p| p.id.clone()).collect();
                for (id, old_state) in registry.retain_only(&keep).await {
                    tracing::info!(participant = %id, "Participant missing after reconnect");
                    self.view.monitor.stop_peer(&id);
                    self.surface_closed(id, old_state);
                }
                for info in roster {
                    registry.on_presence(info);
                }
                tracing::info!(participants = registry.remote_count(), "Signaling reconnected");
                self.notifier.event(ConferenceEvent::SignalingReconnected);
                self.publish_participants();
            }
            SignalingEvent::Lost => {
                tracing::error!("Signaling lost; no further negotiations possible");
                self.notifier.event(ConferenceEvent::SignalingLost);
            }
        }
    }

    /// Forget a remote participant and its connection
    async fn remove_participant(&self, id: &ParticipantId) -> bool {
        self.view.monitor.stop_peer(id);
        match self.view.registry.on_leave(id).await {
            Some(old_state) => {
                self.surface_closed(id.clone(), old_state);
                true
            }
            None => false,
        }
    }

    /// The pool forgets a removed peer before its task winds down, so the
    /// final transition is reported from here
    fn surface_closed(&self, peer_id: ParticipantId, old_state: ConnectionState) {
        if old_state != ConnectionState::Closed {
            self.notifier.event(ConferenceEvent::PeerStateChanged {
                peer_id,
                old_state,
                new_state: ConnectionState::Closed,
            });
        }
    }

    async fn on_peer(&self, event: PeerEvent) {
        match event {
            PeerEvent::StateChanged {
                peer_id,
                connection_id,
                old_state,
                new_state,
            } => {
                if !self.view.pool.is_current(&peer_id, connection_id) {
                    return;
                }
                if new_state != ConnectionState::Connected {
                    self.view.monitor.stop_peer(&peer_id);
                }
                if self.view.registry.set_connection_state(&peer_id, new_state) {
                    self.notifier.event(ConferenceEvent::PeerStateChanged {
                        peer_id,
                        old_state,
                        new_state,
                    });
                    self.publish_participants();
                }
            }
            PeerEvent::Connected {
                peer_id,
                connection_id,
                transport,
            } => {
                if self.view.pool.is_current(&peer_id, connection_id)
                    && self.view.registry.contains(&peer_id)
                {
                    self.view.monitor.start_peer(peer_id, transport);
                }
            }
            PeerEvent::Closed {
                peer_id,
                connection_id,
                reason,
                attempts,
            } => {
                if reason != CloseReason::RetriesExhausted
                    || !self.view.pool.is_current(&peer_id, connection_id)
                {
                    return;
                }
                tracing::warn!(participant = %peer_id, attempts, "Participant unreachable");
                self.view.monitor.stop_peer(&peer_id);
                self.view.registry.on_leave(&peer_id).await;
                self.notifier
                    .event(ConferenceEvent::PeerUnreachable { peer_id, attempts });
                self.publish_participants();
            }
        }
    }
}
