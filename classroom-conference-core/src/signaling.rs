//! Room signaling protocol
//!
//! Carries presence (`join`, `leave`, `participant-update`) and the
//! offer/answer/ICE exchange between participants of one room through an
//! external relay. The relay itself sits behind [`SignalingTransport`];
//! [`SignalingChannel`] adds validation, self-filtering, fan-out to
//! subscribers and reconnect with backoff.

use crate::config::RetryPolicy;
use crate::identity::{ParticipantId, ParticipantInfo, RoomId, Role};
use crate::types::IceCandidate;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Maximum encoded signaling message size (64KB)
pub const MAX_SIGNALING_MESSAGE_SIZE: usize = 64 * 1024;

/// Maximum participant ID length
const MAX_PARTICIPANT_ID_LENGTH: usize = 256;

/// Maximum display name length
const MAX_DISPLAY_NAME_LENGTH: usize = 256;

/// Maximum SDP string length
const MAX_SDP_LENGTH: usize = 32 * 1024;

/// Maximum ICE candidate line length
const MAX_CANDIDATE_LENGTH: usize = 1024;

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Relay connection is down
    #[error("Signaling disconnected")]
    Disconnected,

    /// Message failed validation
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Relay transport failure
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Signaling message types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// Participant entered the room
    #[serde(rename_all = "camelCase")]
    Join {
        /// Joining participant
        participant_id: ParticipantId,
        /// Name shown to others
        display_name: String,
        /// Classroom role
        role: Role,
    },

    /// Participant left the room
    #[serde(rename_all = "camelCase")]
    Leave {
        /// Departing participant
        participant_id: ParticipantId,
    },

    /// SDP offer
    #[serde(rename_all = "camelCase")]
    Offer {
        /// Sender
        from_id: ParticipantId,
        /// Recipient
        to_id: ParticipantId,
        /// SDP content
        sdp: String,
        /// Identifies this offer; echoed by the answer
        #[serde(default, skip_serializing_if = "Option::is_none")]
        negotiation_id: Option<u64>,
    },

    /// SDP answer
    #[serde(rename_all = "camelCase")]
    Answer {
        /// Sender
        from_id: ParticipantId,
        /// Recipient
        to_id: ParticipantId,
        /// SDP content
        sdp: String,
        /// Offer being answered, when the offer carried one
        #[serde(default, skip_serializing_if = "Option::is_none")]
        negotiation_id: Option<u64>,
    },

    /// Trickled ICE candidate
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        /// Sender
        from_id: ParticipantId,
        /// Recipient
        to_id: ParticipantId,
        /// Candidate
        candidate: IceCandidate,
    },

    /// Display name or role changed
    #[serde(rename_all = "camelCase")]
    ParticipantUpdate {
        /// Updated participant
        participant_id: ParticipantId,
        /// New display name
        display_name: String,
        /// New role
        role: Role,
    },
}

impl SignalingMessage {
    /// Presence announcement for `info`
    pub fn join(info: &ParticipantInfo) -> Self {
        Self::Join {
            participant_id: info.id.clone(),
            display_name: info.display_name.clone(),
            role: info.role,
        }
    }

    /// Participant that sent the message
    #[must_use]
    pub fn sender(&self) -> &ParticipantId {
        match self {
            Self::Join { participant_id, .. }
            | Self::Leave { participant_id }
            | Self::ParticipantUpdate { participant_id, .. } => participant_id,
            Self::Offer { from_id, .. }
            | Self::Answer { from_id, .. }
            | Self::IceCandidate { from_id, .. } => from_id,
        }
    }

    /// Addressee of a directed message; `None` for room broadcasts
    #[must_use]
    pub fn recipient(&self) -> Option<&ParticipantId> {
        match self {
            Self::Offer { to_id, .. }
            | Self::Answer { to_id, .. }
            | Self::IceCandidate { to_id, .. } => Some(to_id),
            Self::Join { .. } | Self::Leave { .. } | Self::ParticipantUpdate { .. } => None,
        }
    }

    /// Announced identity carried by `join` and `participant-update`
    #[must_use]
    pub fn participant_info(&self) -> Option<ParticipantInfo> {
        match self {
            Self::Join {
                participant_id,
                display_name,
                role,
            }
            | Self::ParticipantUpdate {
                participant_id,
                display_name,
                role,
            } => Some(ParticipantInfo {
                id: participant_id.clone(),
                display_name: display_name.clone(),
                role: *role,
            }),
            _ => None,
        }
    }

    /// Check field limits
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::InvalidMessage`] naming the offending field
    pub fn validate(&self) -> Result<(), SignalingError> {
        check_id("sender", self.sender())?;
        if let Some(to) = self.recipient() {
            check_id("recipient", to)?;
            if to == self.sender() {
                return Err(SignalingError::InvalidMessage(
                    "message addressed to its own sender".to_string(),
                ));
            }
        }
        match self {
            Self::Join { display_name, .. } | Self::ParticipantUpdate { display_name, .. } => {
                if display_name.len() > MAX_DISPLAY_NAME_LENGTH {
                    return Err(SignalingError::InvalidMessage(format!(
                        "display name too long: {} bytes",
                        display_name.len()
                    )));
                }
            }
            Self::Offer { sdp, .. } | Self::Answer { sdp, .. } => {
                if sdp.is_empty() {
                    return Err(SignalingError::InvalidMessage("empty SDP".to_string()));
                }
                if sdp.len() > MAX_SDP_LENGTH {
                    return Err(SignalingError::InvalidMessage(format!(
                        "SDP too long: {} bytes",
                        sdp.len()
                    )));
                }
            }
            Self::IceCandidate { candidate, .. } => {
                if candidate.candidate.len() > MAX_CANDIDATE_LENGTH {
                    return Err(SignalingError::InvalidMessage(format!(
                        "candidate too long: {} bytes",
                        candidate.candidate.len()
                    )));
                }
            }
            Self::Leave { .. } => {}
        }
        Ok(())
    }

    /// Encode as a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails or the frame exceeds
    /// [`MAX_SIGNALING_MESSAGE_SIZE`]
    pub fn to_json(&self) -> Result<String, SignalingError> {
        let json = serde_json::to_string(self)
            .map_err(|e| SignalingError::InvalidMessage(e.to_string()))?;
        if json.len() > MAX_SIGNALING_MESSAGE_SIZE {
            return Err(SignalingError::InvalidMessage(format!(
                "message too large: {} bytes",
                json.len()
            )));
        }
        Ok(json)
    }

    /// Decode and validate a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::InvalidMessage`] for oversized, malformed or
    /// out-of-limit frames
    pub fn from_json(text: &str) -> Result<Self, SignalingError> {
        if text.len() > MAX_SIGNALING_MESSAGE_SIZE {
            return Err(SignalingError::InvalidMessage(format!(
                "message too large: {} bytes",
                text.len()
            )));
        }
        let message: Self = serde_json::from_str(text)
            .map_err(|e| SignalingError::InvalidMessage(e.to_string()))?;
        message.validate()?;
        Ok(message)
    }
}

fn check_id(field: &str, id: &ParticipantId) -> Result<(), SignalingError> {
    if id.as_str().is_empty() {
        return Err(SignalingError::InvalidMessage(format!("empty {field} id")));
    }
    if id.as_str().len() > MAX_PARTICIPANT_ID_LENGTH {
        return Err(SignalingError::InvalidMessage(format!(
            "{field} id too long: {} bytes",
            id.as_str().len()
        )));
    }
    Ok(())
}

/// Helper function to extract message type for tracing
pub(crate) fn message_type(msg: &SignalingMessage) -> &'static str {
    match msg {
        SignalingMessage::Join { .. } => "join",
        SignalingMessage::Leave { .. } => "leave",
        SignalingMessage::Offer { .. } => "offer",
        SignalingMessage::Answer { .. } => "answer",
        SignalingMessage::IceCandidate { .. } => "ice-candidate",
        SignalingMessage::ParticipantUpdate { .. } => "participant-update",
    }
}

/// Signaling relay transport trait
///
/// Implement this for your specific relay (WebSocket server, in-process hub,
/// etc.). A receive error means the relay connection is gone; the channel then
/// calls [`SignalingTransport::connect`] again to re-establish it.
#[async_trait]
pub trait SignalingTransport: Send + Sync + 'static {
    /// Transport error type
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open (or reopen) the relay connection for `room` as `local`
    ///
    /// Returns the members the relay reports as already present, excluding
    /// `local`.
    async fn connect(
        &self,
        room: &RoomId,
        local: &ParticipantInfo,
    ) -> Result<Vec<ParticipantInfo>, Self::Error>;

    /// Send a message to the room
    async fn send_message(&self, message: SignalingMessage) -> Result<(), Self::Error>;

    /// Receive the next message relayed to this participant
    ///
    /// Must be cancel-safe: the channel races it against shutdown.
    async fn receive_message(&self) -> Result<SignalingMessage, Self::Error>;

    /// Close the relay connection; idempotent
    async fn disconnect(&self);
}

/// Event delivered to channel subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// Validated message from another participant
    Message(SignalingMessage),
    /// Relay connection dropped; reconnecting
    Disconnected,
    /// Relay connection restored, with the relay's current member list
    Reconnected {
        /// Members present after reconnect, excluding the local participant
        roster: Vec<ParticipantInfo>,
    },
    /// Reconnect attempts exhausted
    Lost,
}

/// Object-safe publishing side of a signaling channel
///
/// Lets per-peer tasks send without knowing the relay transport type.
#[async_trait]
pub trait SignalPublisher: Send + Sync {
    /// Best-effort send to the room
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::Disconnected`] while the relay is down
    async fn publish(&self, message: SignalingMessage) -> Result<(), SignalingError>;

    /// Watch that is `true` while the relay connection is up
    fn availability(&self) -> watch::Receiver<bool>;
}

struct Session {
    room: RoomId,
    local: ParticipantInfo,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

type Subscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<SignalingEvent>>>>;

/// Room-scoped signaling channel over a relay transport
pub struct SignalingChannel<T: SignalingTransport> {
    transport: Arc<T>,
    reconnect: RetryPolicy,
    subscribers: Subscribers,
    available: Arc<watch::Sender<bool>>,
    session: Mutex<Option<Session>>,
    /// Set while `connect` runs and no session exists yet
    connecting: Mutex<Option<ParticipantId>>,
}

impl<T: SignalingTransport> SignalingChannel<T> {
    /// Create a channel over a relay transport
    #[must_use]
    pub fn new(transport: Arc<T>, reconnect: RetryPolicy) -> Self {
        let (available, _) = watch::channel(false);
        Self {
            transport,
            reconnect,
            subscribers: Arc::new(Mutex::new(Vec::new())),
            available: Arc::new(available),
            session: Mutex::new(None),
            connecting: Mutex::new(None),
        }
    }

    /// Register a subscriber
    ///
    /// Messages are delivered in arrival order. Subscribe before
    /// [`SignalingChannel::connect`] to observe every message of the session.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SignalingEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Connect to the relay, announce presence and start dispatching
    ///
    /// Returns the members already present in the room.
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::TransportError`] if the relay is unreachable
    /// or the announcement cannot be sent
    #[tracing::instrument(skip(self, local), fields(room = %room, local = %local.id))]
    pub async fn connect(
        &self,
        room: &RoomId,
        local: &ParticipantInfo,
    ) -> Result<Vec<ParticipantInfo>, SignalingError> {
        if self.session.lock().is_some() {
            tracing::debug!("Signaling already connected");
            return Ok(Vec::new());
        }

        *self.connecting.lock() = Some(local.id.clone());
        let roster = match self.transport.connect(room, local).await {
            Ok(roster) => roster,
            Err(e) => {
                self.connecting.lock().take();
                return Err(SignalingError::TransportError(e.to_string()));
            }
        };

        if let Err(e) = self
            .transport
            .send_message(SignalingMessage::join(local))
            .await
        {
            self.connecting.lock().take();
            self.transport.disconnect().await;
            return Err(SignalingError::TransportError(e.to_string()));
        }

        let roster: Vec<ParticipantInfo> =
            roster.into_iter().filter(|p| p.id != local.id).collect();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let _ = self.available.send(true);
        let task = tokio::spawn(dispatch_loop(
            self.transport.clone(),
            room.clone(),
            local.clone(),
            self.reconnect.clone(),
            self.subscribers.clone(),
            self.available.clone(),
            shutdown_rx,
        ));

        *self.session.lock() = Some(Session {
            room: room.clone(),
            local: local.clone(),
            shutdown: shutdown_tx,
            task,
        });
        self.connecting.lock().take();

        tracing::info!(existing = roster.len(), "Signaling connected");
        Ok(roster)
    }

    /// Best-effort send to the room
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::Disconnected`] while the relay is down, or
    /// the validation/transport failure
    #[tracing::instrument(skip(self, message), fields(message_type = message_type(&message)))]
    pub async fn publish(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        let available = *self.available.borrow();
        if !available {
            return Err(SignalingError::Disconnected);
        }
        message.validate()?;
        tracing::trace!("Publishing signaling message");
        self.transport
            .send_message(message)
            .await
            .map_err(|e| SignalingError::TransportError(e.to_string()))
    }

    /// Announce departure and close the relay connection
    ///
    /// Idempotent. The `leave` announcement is best-effort.
    pub async fn disconnect(&self) {
        let Some(session) = self.session.lock().take() else {
            // A dropped `connect` may have left the relay counting us present
            let abandoned = self.connecting.lock().take();
            if let Some(participant_id) = abandoned {
                let leave = SignalingMessage::Leave { participant_id };
                if let Err(e) = self.transport.send_message(leave).await {
                    tracing::debug!(error = %e, "Leave after interrupted connect not sent");
                }
                self.transport.disconnect().await;
                tracing::debug!("Interrupted connection attempt closed");
            }
            return;
        };

        let _ = session.shutdown.send(true);
        let available = *self.available.borrow();
        if available {
            let leave = SignalingMessage::Leave {
                participant_id: session.local.id.clone(),
            };
            if let Err(e) = self.transport.send_message(leave).await {
                tracing::warn!(error = %e, "Failed to announce leave");
            }
        }
        let _ = self.available.send(false);
        self.transport.disconnect().await;

        if let Err(e) = session.task.await {
            if !e.is_cancelled() {
                tracing::warn!(error = %e, "Signaling dispatch task failed");
            }
        }
        tracing::info!(room = %session.room, "Signaling disconnected");
    }

    /// Whether the relay connection is currently up
    pub fn is_connected(&self) -> bool {
        *self.available.borrow()
    }

    /// Get access to the underlying transport
    #[must_use]
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }
}

#[async_trait]
impl<T: SignalingTransport> SignalPublisher for SignalingChannel<T> {
    async fn publish(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        SignalingChannel::publish(self, message).await
    }

    fn availability(&self) -> watch::Receiver<bool> {
        self.available.subscribe()
    }
}

impl<T: SignalingTransport> Drop for SignalingChannel<T> {
    fn drop(&mut self) {
        if let Some(session) = self.session.lock().take() {
            let _ = session.shutdown.send(true);
            session.task.abort();
        }
    }
}

fn dispatch(subscribers: &Subscribers, event: SignalingEvent) {
    subscribers
        .lock()
        .retain(|tx| tx.send(event.clone()).is_ok());
}

fn accept(local: &ParticipantId, message: &SignalingMessage) -> bool {
    if let Err(e) = message.validate() {
        tracing::warn!(error = %e, message_type = message_type(message), "Dropping invalid signaling message");
        return false;
    }
    if message.sender() == local {
        return false;
    }
    match message.recipient() {
        Some(to) => to == local,
        None => true,
    }
}

async fn dispatch_loop<T: SignalingTransport>(
    transport: Arc<T>,
    room: RoomId,
    local: ParticipantInfo,
    reconnect: RetryPolicy,
    subscribers: Subscribers,
    available: Arc<watch::Sender<bool>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let received = tokio::select! {
            _ = shutdown.changed() => break,
            received = transport.receive_message() => received,
        };

        match received {
            Ok(message) => {
                if accept(&local.id, &message) {
                    tracing::debug!(
                        from = %message.sender(),
                        message_type = message_type(&message),
                        "Received signaling message"
                    );
                    dispatch(&subscribers, SignalingEvent::Message(message));
                }
            }
            Err(e) => {
                if *shutdown.borrow() {
                    break;
                }
                tracing::warn!(error = %e, "Signaling relay connection lost");
                let _ = available.send(false);
                dispatch(&subscribers, SignalingEvent::Disconnected);

                match reconnect_with_backoff(&*transport, &room, &local, &reconnect, &mut shutdown)
                    .await
                {
                    Reconnect::Restored(roster) => {
                        let _ = available.send(true);
                        dispatch(&subscribers, SignalingEvent::Reconnected { roster });
                    }
                    Reconnect::Shutdown => break,
                    Reconnect::Exhausted => {
                        tracing::error!(
                            attempts = reconnect.max_attempts,
                            "Signaling relay could not be restored"
                        );
                        dispatch(&subscribers, SignalingEvent::Lost);
                        break;
                    }
                }
            }
        }
    }
    tracing::debug!("Signaling dispatch loop stopped");
}

enum Reconnect {
    Restored(Vec<ParticipantInfo>),
    Shutdown,
    Exhausted,
}

async fn reconnect_with_backoff<T: SignalingTransport>(
    transport: &T,
    room: &RoomId,
    local: &ParticipantInfo,
    policy: &RetryPolicy,
    shutdown: &mut watch::Receiver<bool>,
) -> Reconnect {
    let mut attempt = 1;
    while policy.allows(attempt) {
        let delay = policy.delay_for(attempt);
        tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting signaling");
        tokio::select! {
            _ = shutdown.changed() => return Reconnect::Shutdown,
            _ = tokio::time::sleep(delay) => {}
        }

        match transport.connect(room, local).await {
            Ok(roster) => match transport.send_message(SignalingMessage::join(local)).await {
                Ok(()) => {
                    tracing::info!(attempt, "Signaling reconnected");
                    return Reconnect::Restored(
                        roster.into_iter().filter(|p| p.id != local.id).collect(),
                    );
                }
                Err(e) => tracing::warn!(attempt, error = %e, "Re-announce failed"),
            },
            Err(e) => tracing::warn!(attempt, error = %e, "Reconnect attempt failed"),
        }
        attempt += 1;
    }
    Reconnect::Exhausted
}
