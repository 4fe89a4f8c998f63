//! Peer connection pool
//!
//! One connection per remote participant, each driven by its own task that
//! owns the connection state machine:
//!
//! ```text
//! new → negotiating → connected → disconnected → negotiating (retry)
//!           │                          │
//!           └──────── disconnected ────┴──→ closed
//! ```
//!
//! # Glare
//!
//! When two participants discover each other at the same time, both would
//! naturally send an offer. Only the participant with the lexicographically
//! smaller id (byte-wise) sends one; the other side waits for it and ignores
//! any offer it would otherwise have produced. Offers received by the
//! initiating side are dropped.
//!
//! # Cancellation
//!
//! Closing a peer flips its cancel watch. Every suspension point in the task
//! races against it, and the task re-checks it before committing any state,
//! so a negotiation that completes after cancellation is discarded.

use crate::config::PeerConfig;
use crate::identity::ParticipantId;
use crate::media::LocalMedia;
use crate::signaling::{SignalPublisher, SignalingMessage};
use crate::transport::{LinkState, PeerTransport, PeerTransportFactory, TransportEvent};
use crate::types::{is_valid_transition, ConnectionState, IceCandidate};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Why a peer connection reached `closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Participant left or the room was left
    Requested,
    /// Negotiation kept failing
    RetriesExhausted,
}

/// Event emitted by the pool
#[derive(Clone)]
pub enum PeerEvent {
    /// Connection changed state
    StateChanged {
        /// Remote participant
        peer_id: ParticipantId,
        /// Connection instance
        connection_id: u64,
        /// Previous state
        old_state: ConnectionState,
        /// New state
        new_state: ConnectionState,
    },
    /// Media path established
    Connected {
        /// Remote participant
        peer_id: ParticipantId,
        /// Connection instance
        connection_id: u64,
        /// Transport to sample statistics from
        transport: Arc<dyn PeerTransport>,
    },
    /// Connection reached `closed`
    Closed {
        /// Remote participant
        peer_id: ParticipantId,
        /// Connection instance
        connection_id: u64,
        /// Why it closed
        reason: CloseReason,
        /// Failed attempts in the last retry streak
        attempts: u32,
    },
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StateChanged {
                peer_id,
                connection_id,
                old_state,
                new_state,
            } => f
                .debug_struct("StateChanged")
                .field("peer_id", peer_id)
                .field("connection_id", connection_id)
                .field("old_state", old_state)
                .field("new_state", new_state)
                .finish(),
            Self::Connected {
                peer_id,
                connection_id,
                transport,
            } => f
                .debug_struct("Connected")
                .field("peer_id", peer_id)
                .field("connection_id", connection_id)
                .field("transport", &transport.transport_type())
                .finish(),
            Self::Closed {
                peer_id,
                connection_id,
                reason,
                attempts,
            } => f
                .debug_struct("Closed")
                .field("peer_id", peer_id)
                .field("connection_id", connection_id)
                .field("reason", reason)
                .field("attempts", attempts)
                .finish(),
        }
    }
}

/// Remote SDP with the offer it belongs to
#[derive(Debug)]
struct RemoteDescription {
    sdp: String,
    negotiation_id: Option<u64>,
}

#[derive(Debug)]
enum PeerCommand {
    RemoteOffer(RemoteDescription),
    RemoteAnswer(RemoteDescription),
    RemoteCandidate(IceCandidate),
}

struct PeerHandle {
    connection_id: u64,
    commands: mpsc::UnboundedSender<PeerCommand>,
    cancel: watch::Sender<bool>,
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

/// Owner of every peer connection of a session
pub struct PeerConnectionPool {
    local: ParticipantId,
    factory: Arc<dyn PeerTransportFactory>,
    signaling: Arc<dyn SignalPublisher>,
    media: Arc<LocalMedia>,
    config: PeerConfig,
    peers: Mutex<HashMap<ParticipantId, PeerHandle>>,
    next_connection_id: AtomicU64,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerConnectionPool {
    /// Create a pool and the receiver its events are published on
    pub fn new(
        local: ParticipantId,
        factory: Arc<dyn PeerTransportFactory>,
        signaling: Arc<dyn SignalPublisher>,
        media: Arc<LocalMedia>,
        config: PeerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                local,
                factory,
                signaling,
                media,
                config,
                peers: Mutex::new(HashMap::new()),
                next_connection_id: AtomicU64::new(1),
                events,
            },
            rx,
        )
    }

    /// Local participant
    pub fn local_id(&self) -> &ParticipantId {
        &self.local
    }

    /// Start a connection to `remote` unless a live one exists
    ///
    /// Returns whether a new connection was created.
    pub fn connect(&self, remote: &ParticipantId) -> bool {
        if remote == &self.local {
            tracing::warn!(peer_id = %remote, "Refusing connection to self");
            return false;
        }

        let mut peers = self.peers.lock();
        if let Some(existing) = peers.get(remote) {
            if !existing.state.borrow().is_terminal() {
                return false;
            }
        }

        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ConnectionState::New);
        let initiator = self.local.initiates_with(remote);

        let actor = PeerActor {
            local: self.local.clone(),
            remote: remote.clone(),
            connection_id,
            initiator,
            factory: self.factory.clone(),
            signaling: self.signaling.clone(),
            media: self.media.clone(),
            config: self.config.clone(),
            commands: commands_rx,
            cancel: cancel_rx,
            state: state_tx,
            events: self.events.clone(),
            attempts: 0,
            offers_sent: 0,
        };
        let task = tokio::spawn(actor.run());

        let previous = peers.insert(
            remote.clone(),
            PeerHandle {
                connection_id,
                commands: commands_tx,
                cancel: cancel_tx,
                state: state_rx,
                task,
            },
        );
        drop(peers);
        if let Some(previous) = previous {
            let _ = previous.cancel.send(true);
        }

        tracing::debug!(peer_id = %remote, connection_id, initiator, "Peer connection created");
        true
    }

    /// Route a directed signaling message to the connection for its sender
    ///
    /// Returns whether a live connection accepted it.
    pub fn deliver(&self, message: SignalingMessage) -> bool {
        let (from, command) = match message {
            SignalingMessage::Offer {
                from_id,
                sdp,
                negotiation_id,
                ..
            } => (
                from_id,
                PeerCommand::RemoteOffer(RemoteDescription {
                    sdp,
                    negotiation_id,
                }),
            ),
            SignalingMessage::Answer {
                from_id,
                sdp,
                negotiation_id,
                ..
            } => (
                from_id,
                PeerCommand::RemoteAnswer(RemoteDescription {
                    sdp,
                    negotiation_id,
                }),
            ),
            SignalingMessage::IceCandidate {
                from_id, candidate, ..
            } => (from_id, PeerCommand::RemoteCandidate(candidate)),
            other => {
                tracing::trace!(message_type = crate::signaling::message_type(&other), "Not a peer message");
                return false;
            }
        };

        let peers = self.peers.lock();
        match peers.get(&from) {
            Some(handle) if !handle.state.borrow().is_terminal() => {
                handle.commands.send(command).is_ok()
            }
            _ => {
                tracing::debug!(peer_id = %from, "No live connection for peer message");
                false
            }
        }
    }

    /// Close and forget the connection to `remote`
    ///
    /// Aborts an in-flight negotiation. Returns whether a connection existed.
    pub async fn close_peer(&self, remote: &ParticipantId) -> bool {
        let Some(handle) = self.peers.lock().remove(remote) else {
            return false;
        };
        let _ = handle.cancel.send(true);
        if let Err(e) = handle.task.await {
            if !e.is_cancelled() {
                tracing::warn!(peer_id = %remote, error = %e, "Peer task failed");
            }
        }
        tracing::debug!(peer_id = %remote, connection_id = handle.connection_id, "Peer connection removed");
        true
    }

    /// Close every connection and wait for their tasks
    pub async fn close_all(&self) {
        let handles: Vec<(ParticipantId, PeerHandle)> = self.peers.lock().drain().collect();
        for (_, handle) in &handles {
            let _ = handle.cancel.send(true);
        }
        let count = handles.len();
        let results = futures::future::join_all(
            handles.into_iter().map(|(peer_id, handle)| async move {
                (peer_id, handle.task.await)
            }),
        )
        .await;
        for (peer_id, result) in results {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    tracing::warn!(peer_id = %peer_id, error = %e, "Peer task failed");
                }
            }
        }
        if count > 0 {
            tracing::info!(count, "All peer connections closed");
        }
    }

    /// Current state of the connection to `remote`
    pub fn state_of(&self, remote: &ParticipantId) -> Option<ConnectionState> {
        self.peers.lock().get(remote).map(|h| *h.state.borrow())
    }

    /// Number of connections not in `closed`
    pub fn active_count(&self) -> usize {
        self.peers
            .lock()
            .values()
            .filter(|h| !h.state.borrow().is_terminal())
            .count()
    }

    /// Participants with a connection entry
    pub fn peer_ids(&self) -> Vec<ParticipantId> {
        self.peers.lock().keys().cloned().collect()
    }

    /// Whether `connection_id` is the current connection to `remote`
    pub fn is_current(&self, remote: &ParticipantId, connection_id: u64) -> bool {
        self.peers
            .lock()
            .get(remote)
            .is_some_and(|h| h.connection_id == connection_id)
    }
}

impl Drop for PeerConnectionPool {
    fn drop(&mut self) {
        for (_, handle) in self.peers.lock().drain() {
            let _ = handle.cancel.send(true);
            handle.task.abort();
        }
    }
}

// ============================================================================
// Per-peer task
// ============================================================================

enum Negotiation {
    Connected(
        Arc<dyn PeerTransport>,
        mpsc::UnboundedReceiver<TransportEvent>,
    ),
    Failed(String),
    Cancelled,
}

enum Supervision {
    Lost,
    Restart(RemoteDescription),
    Cancelled,
}

struct PeerActor {
    local: ParticipantId,
    remote: ParticipantId,
    connection_id: u64,
    initiator: bool,
    factory: Arc<dyn PeerTransportFactory>,
    signaling: Arc<dyn SignalPublisher>,
    media: Arc<LocalMedia>,
    config: PeerConfig,
    commands: mpsc::UnboundedReceiver<PeerCommand>,
    cancel: watch::Receiver<bool>,
    state: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<PeerEvent>,
    attempts: u32,
    offers_sent: u64,
}

/// Resolves once cancellation is requested or the pool is gone
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

/// Run `fut` unless cancellation wins the race
async fn guarded<F: Future>(cancel: &mut watch::Receiver<bool>, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancelled(cancel) => None,
        out = fut => Some(out),
    }
}

impl PeerActor {
    async fn run(mut self) {
        let mut pending_offer: Option<RemoteDescription> = None;

        loop {
            if !self.wait_for_signaling().await {
                return self.finish(CloseReason::Requested);
            }
            if self.is_cancelled() {
                return self.finish(CloseReason::Requested);
            }
            self.transition(ConnectionState::Negotiating);

            match self.negotiate(pending_offer.take()).await {
                Negotiation::Cancelled => return self.finish(CloseReason::Requested),
                Negotiation::Connected(transport, mut transport_events) => {
                    if self.is_cancelled() {
                        transport.close().await;
                        return self.finish(CloseReason::Requested);
                    }
                    self.attempts = 0;
                    self.transition(ConnectionState::Connected);
                    tracing::info!(peer_id = %self.remote, connection_id = self.connection_id, "Peer connected");
                    let _ = self.events.send(PeerEvent::Connected {
                        peer_id: self.remote.clone(),
                        connection_id: self.connection_id,
                        transport: transport.clone(),
                    });

                    let outcome = self.supervise(&transport, &mut transport_events).await;
                    transport.close().await;
                    match outcome {
                        Supervision::Cancelled => return self.finish(CloseReason::Requested),
                        Supervision::Lost => {
                            tracing::info!(peer_id = %self.remote, "Peer connection lost");
                            self.transition(ConnectionState::Disconnected);
                        }
                        Supervision::Restart(offer) => {
                            tracing::debug!(peer_id = %self.remote, "Remote restarted negotiation");
                            self.transition(ConnectionState::Disconnected);
                            pending_offer = Some(offer);
                            continue;
                        }
                    }
                }
                Negotiation::Failed(reason) => {
                    tracing::warn!(
                        peer_id = %self.remote,
                        attempt = self.attempts + 1,
                        reason = %reason,
                        "Negotiation failed"
                    );
                    self.transition(ConnectionState::Disconnected);
                }
            }

            self.attempts += 1;
            if !self.config.retry.allows(self.attempts) {
                tracing::warn!(
                    peer_id = %self.remote,
                    attempts = self.attempts,
                    "Retries exhausted, closing peer connection"
                );
                return self.finish(CloseReason::RetriesExhausted);
            }

            let delay = self.config.retry.delay_for(self.attempts);
            tracing::debug!(peer_id = %self.remote, attempt = self.attempts, delay_ms = delay.as_millis() as u64, "Backing off before renegotiation");
            if guarded(&mut self.cancel, tokio::time::sleep(delay)).await.is_none() {
                return self.finish(CloseReason::Requested);
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    async fn wait_for_signaling(&mut self) -> bool {
        let mut available = self.signaling.availability();
        loop {
            if *available.borrow_and_update() {
                return true;
            }
            tracing::debug!(peer_id = %self.remote, "Waiting for signaling before negotiating");
            match guarded(&mut self.cancel, available.changed()).await {
                None | Some(Err(_)) => return false,
                Some(Ok(())) => {}
            }
        }
    }

    fn transition(&mut self, to: ConnectionState) {
        let from = *self.state.borrow();
        if from == to {
            return;
        }
        if !is_valid_transition(from, to) {
            tracing::warn!(
                peer_id = %self.remote,
                old_state = ?from,
                new_state = ?to,
                "Ignoring invalid peer state transition"
            );
            return;
        }
        let _ = self.state.send(to);
        tracing::debug!(
            peer_id = %self.remote,
            connection_id = self.connection_id,
            old_state = ?from,
            new_state = ?to,
            "Peer state transition"
        );
        let _ = self.events.send(PeerEvent::StateChanged {
            peer_id: self.remote.clone(),
            connection_id: self.connection_id,
            old_state: from,
            new_state: to,
        });
    }

    fn finish(mut self, reason: CloseReason) {
        self.transition(ConnectionState::Closed);
        let _ = self.events.send(PeerEvent::Closed {
            peer_id: self.remote.clone(),
            connection_id: self.connection_id,
            reason,
            attempts: self.attempts,
        });
    }

    async fn publish(&mut self, message: SignalingMessage) -> Option<Result<(), String>> {
        let signaling = self.signaling.clone();
        guarded(&mut self.cancel, async move { signaling.publish(message).await })
            .await
            .map(|r| r.map_err(|e| e.to_string()))
    }

    async fn negotiate(&mut self, initial_offer: Option<RemoteDescription>) -> Negotiation {
        let (events_tx, mut transport_events) = mpsc::unbounded_channel();
        let factory = self.factory.clone();
        let remote = self.remote.clone();
        let media = self.media.clone();
        let created = guarded(&mut self.cancel, async move {
            factory.create(&remote, media, events_tx).await
        })
        .await;
        let transport = match created {
            None => return Negotiation::Cancelled,
            Some(Err(e)) => return Negotiation::Failed(e.to_string()),
            Some(Ok(t)) => t,
        };

        let outcome = self
            .exchange(&transport, &mut transport_events, initial_offer)
            .await;
        match outcome {
            Ok(true) => Negotiation::Connected(transport, transport_events),
            Ok(false) => {
                transport.close().await;
                Negotiation::Cancelled
            }
            Err(reason) => {
                transport.close().await;
                Negotiation::Failed(reason)
            }
        }
    }

    /// Offer/answer and candidate exchange until the link connects
    ///
    /// `Ok(true)` when connected, `Ok(false)` when cancelled.
    async fn exchange(
        &mut self,
        transport: &Arc<dyn PeerTransport>,
        transport_events: &mut mpsc::UnboundedReceiver<TransportEvent>,
        initial_offer: Option<RemoteDescription>,
    ) -> Result<bool, String> {
        let deadline = Instant::now() + self.config.negotiation_timeout;
        let mut remote_description_set = false;
        let mut pending_candidates: Vec<IceCandidate> = Vec::new();
        let mut events_open = true;

        if self.initiator {
            let t = transport.clone();
            let sdp = match guarded(&mut self.cancel, async move { t.create_offer().await }).await {
                None => return Ok(false),
                Some(r) => r.map_err(|e| e.to_string())?,
            };
            self.offers_sent += 1;
            let negotiation_id = self.negotiation_id();
            let offer = SignalingMessage::Offer {
                from_id: self.local.clone(),
                to_id: self.remote.clone(),
                sdp,
                negotiation_id: Some(negotiation_id),
            };
            match self.publish(offer).await {
                None => return Ok(false),
                Some(r) => r?,
            }
            tracing::debug!(peer_id = %self.remote, negotiation_id, "Offer sent");
        } else if let Some(offer) = initial_offer {
            match self.answer(transport, offer).await {
                None => return Ok(false),
                Some(r) => r?,
            }
            remote_description_set = true;
        }

        loop {
            let mut cancel = self.cancel.clone();
            tokio::select! {
                _ = cancelled(&mut cancel) => return Ok(false),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(format!(
                        "no connection within {}ms",
                        self.config.negotiation_timeout.as_millis()
                    ));
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return Ok(false);
                    };
                    match command {
                        PeerCommand::RemoteOffer(offer) => {
                            if self.initiator {
                                tracing::debug!(peer_id = %self.remote, "Ignoring offer: local side initiates");
                            } else if remote_description_set {
                                tracing::debug!(peer_id = %self.remote, "Ignoring repeated offer during negotiation");
                            } else {
                                match self.answer(transport, offer).await {
                                    None => return Ok(false),
                                    Some(r) => r?,
                                }
                                remote_description_set = true;
                                if !self.flush_candidates(transport, &mut pending_candidates).await {
                                    return Ok(false);
                                }
                            }
                        }
                        PeerCommand::RemoteAnswer(answer) => {
                            if !self.initiator || remote_description_set {
                                tracing::debug!(peer_id = %self.remote, "Ignoring unexpected answer");
                            } else if answer.negotiation_id.is_some_and(|id| id != self.negotiation_id()) {
                                tracing::debug!(
                                    peer_id = %self.remote,
                                    negotiation_id = ?answer.negotiation_id,
                                    "Ignoring answer to a superseded offer"
                                );
                            } else {
                                let sdp = answer.sdp;
                                let t = transport.clone();
                                match guarded(&mut self.cancel, async move { t.accept_answer(&sdp).await }).await {
                                    None => return Ok(false),
                                    Some(r) => r.map_err(|e| e.to_string())?,
                                }
                                remote_description_set = true;
                                if !self.flush_candidates(transport, &mut pending_candidates).await {
                                    return Ok(false);
                                }
                            }
                        }
                        PeerCommand::RemoteCandidate(candidate) => {
                            if remote_description_set {
                                if !self.apply_candidate(transport, candidate).await {
                                    return Ok(false);
                                }
                            } else {
                                tracing::trace!(peer_id = %self.remote, "Buffering remote candidate");
                                pending_candidates.push(candidate);
                            }
                        }
                    }
                }
                event = transport_events.recv(), if events_open => {
                    match event {
                        Some(TransportEvent::LocalCandidate(candidate)) => {
                            let message = SignalingMessage::IceCandidate {
                                from_id: self.local.clone(),
                                to_id: self.remote.clone(),
                                candidate,
                            };
                            match self.publish(message).await {
                                None => return Ok(false),
                                Some(Err(e)) => tracing::warn!(peer_id = %self.remote, error = %e, "Failed to send candidate"),
                                Some(Ok(())) => {}
                            }
                        }
                        Some(TransportEvent::LinkStateChanged(state)) => {
                            if state == LinkState::Connected {
                                return Ok(!self.is_cancelled());
                            }
                            if state.is_lost() {
                                return Err(format!("link {state:?} during negotiation"));
                            }
                        }
                        None => events_open = false,
                    }
                }
            }
        }
    }

    /// Tag of the latest offer: connection id in the high half, offer count in the low
    fn negotiation_id(&self) -> u64 {
        (self.connection_id << 32) | (self.offers_sent & 0xffff_ffff)
    }

    async fn answer(
        &mut self,
        transport: &Arc<dyn PeerTransport>,
        offer: RemoteDescription,
    ) -> Option<Result<(), String>> {
        let RemoteDescription {
            sdp: offer,
            negotiation_id,
        } = offer;
        let t = transport.clone();
        let sdp = match guarded(&mut self.cancel, async move { t.create_answer(&offer).await }).await? {
            Ok(sdp) => sdp,
            Err(e) => return Some(Err(e.to_string())),
        };
        let answer = SignalingMessage::Answer {
            from_id: self.local.clone(),
            to_id: self.remote.clone(),
            sdp,
            negotiation_id,
        };
        let sent = self.publish(answer).await?;
        if sent.is_ok() {
            tracing::debug!(peer_id = %self.remote, "Answer sent");
        }
        Some(sent)
    }

    /// Returns `false` if cancelled
    async fn apply_candidate(
        &mut self,
        transport: &Arc<dyn PeerTransport>,
        candidate: IceCandidate,
    ) -> bool {
        let t = transport.clone();
        match guarded(&mut self.cancel, async move { t.add_ice_candidate(candidate).await }).await {
            None => false,
            Some(Err(e)) => {
                tracing::warn!(peer_id = %self.remote, error = %e, "Remote candidate rejected");
                true
            }
            Some(Ok(())) => true,
        }
    }

    async fn flush_candidates(
        &mut self,
        transport: &Arc<dyn PeerTransport>,
        pending: &mut Vec<IceCandidate>,
    ) -> bool {
        for candidate in std::mem::take(pending) {
            if !self.apply_candidate(transport, candidate).await {
                return false;
            }
        }
        true
    }

    async fn supervise(
        &mut self,
        transport: &Arc<dyn PeerTransport>,
        transport_events: &mut mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Supervision {
        loop {
            let mut cancel = self.cancel.clone();
            tokio::select! {
                _ = cancelled(&mut cancel) => return Supervision::Cancelled,
                command = self.commands.recv() => match command {
                    None => return Supervision::Cancelled,
                    Some(PeerCommand::RemoteOffer(offer)) => {
                        if self.initiator {
                            tracing::debug!(peer_id = %self.remote, "Ignoring offer: local side initiates");
                        } else {
                            return Supervision::Restart(offer);
                        }
                    }
                    Some(PeerCommand::RemoteAnswer(_)) => {
                        tracing::debug!(peer_id = %self.remote, "Ignoring answer while connected");
                    }
                    Some(PeerCommand::RemoteCandidate(candidate)) => {
                        if !self.apply_candidate(transport, candidate).await {
                            return Supervision::Cancelled;
                        }
                    }
                },
                event = transport_events.recv() => match event {
                    None => return Supervision::Lost,
                    Some(TransportEvent::LinkStateChanged(state)) if state.is_lost() => {
                        return Supervision::Lost;
                    }
                    Some(TransportEvent::LocalCandidate(candidate)) => {
                        let message = SignalingMessage::IceCandidate {
                            from_id: self.local.clone(),
                            to_id: self.remote.clone(),
                            candidate,
                        };
                        if let Some(Err(e)) = self.publish(message).await {
                            tracing::debug!(peer_id = %self.remote, error = %e, "Late candidate not sent");
                        }
                    }
                    Some(_) => {}
                },
            }
        }
    }
}
