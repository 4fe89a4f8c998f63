//! Conference types and data structures

use crate::identity::{ParticipantId, ParticipantInfo};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one joined session of a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Create a new random session ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Media constraints for local capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Capture microphone
    pub audio: bool,
    /// Capture camera
    pub video: bool,
}

impl MediaConstraints {
    /// Microphone only
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    /// Camera and microphone
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }

    /// Check if audio is requested
    pub fn has_audio(&self) -> bool {
        self.audio
    }

    /// Check if video is requested
    pub fn has_video(&self) -> bool {
        self.video
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::video_call()
    }
}

/// Kind of a local media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Microphone track
    Audio,
    /// Camera track
    Video,
}

/// State of the connection to one remote participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Created, negotiation not started yet
    New,
    /// Offer/answer and ICE exchange in progress
    Negotiating,
    /// Media flowing
    Connected,
    /// Connectivity lost, waiting to renegotiate
    Disconnected,
    /// Terminal
    Closed,
}

impl ConnectionState {
    /// Whether no further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Check whether a connection state transition is allowed
///
/// `new → negotiating → connected → {disconnected → negotiating | closed}`.
/// A failed negotiation drops to `disconnected`, and any live state may be
/// closed directly when the participant leaves or the room is left.
pub fn is_valid_transition(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;
    matches!(
        (from, to),
        (New, Negotiating)
            | (Negotiating, Connected)
            | (Negotiating, Disconnected)
            | (Connected, Disconnected)
            | (Disconnected, Negotiating)
            | (New | Negotiating | Connected | Disconnected, Closed)
    )
}

/// A participant as seen by the local client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    /// Announced identity
    #[serde(flatten)]
    pub info: ParticipantInfo,
    /// Connection state towards this participant
    pub connection_state: ConnectionState,
    /// Whether this entry is the local participant
    pub is_local: bool,
}

impl Participant {
    /// Participant identifier
    pub fn id(&self) -> &ParticipantId {
        &self.info.id
    }
}

/// ICE candidate exchanged over signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// ICE candidate string
    pub candidate: String,
    /// SDP media ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Candidate without media line information
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Raw cumulative counters read from a peer transport
///
/// Counters are totals since the transport was created; the quality monitor
/// works on deltas between two readings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total packets received
    pub packets_received: u64,
    /// Total packets reported lost
    pub packets_lost: u64,
    /// Current round-trip time, if measured
    pub round_trip_time_ms: Option<f64>,
    /// Interarrival jitter, if the transport reports it
    pub jitter_ms: Option<f64>,
}

/// Discrete, user-facing connection quality
///
/// Known levels are ordered `Poor < Fair < Good < Excellent`; `Unknown` sorts
/// below every known level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    /// No samples yet, or not connected
    Unknown,
    /// Severely degraded
    Poor,
    /// Noticeably degraded
    Fair,
    /// Minor impairment
    Good,
    /// Low latency, near-zero loss, low jitter
    Excellent,
}

impl QualityLevel {
    /// Whether a classification is available
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

impl std::fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Poor => "poor",
            Self::Fair => "fair",
            Self::Good => "good",
            Self::Excellent => "excellent",
        };
        f.write_str(s)
    }
}

/// Connection quality of one peer connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionQualityMetrics {
    /// Round-trip latency in milliseconds
    pub latency_ms: f64,
    /// Packet loss over the last interval, in percent
    pub packet_loss_pct: f64,
    /// Jitter in milliseconds
    pub jitter_ms: f64,
    /// Received plus sent throughput over the last interval, in kilobytes per second
    #[serde(rename = "bandwidthKBps")]
    pub bandwidth_kbytes_per_sec: f64,
    /// Smoothed classification
    pub quality_level: QualityLevel,
    /// When the sample was taken
    pub sampled_at: DateTime<Utc>,
}

impl ConnectionQualityMetrics {
    /// Metrics for a connection without usable samples
    pub fn unknown() -> Self {
        Self {
            latency_ms: 0.0,
            packet_loss_pct: 0.0,
            jitter_ms: 0.0,
            bandwidth_kbytes_per_sec: 0.0,
            quality_level: QualityLevel::Unknown,
            sampled_at: Utc::now(),
        }
    }
}

/// Conference event for notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConferenceEvent {
    /// Full participant snapshot after any membership or state change
    ParticipantsChanged {
        /// Participants in join order, local first
        participants: Vec<Participant>,
    },
    /// New quality sample for a peer
    QualityChanged {
        /// Remote participant
        peer_id: ParticipantId,
        /// Latest metrics
        metrics: ConnectionQualityMetrics,
    },
    /// Peer connection changed state
    PeerStateChanged {
        /// Remote participant
        peer_id: ParticipantId,
        /// Previous state
        old_state: ConnectionState,
        /// New state
        new_state: ConnectionState,
    },
    /// Negotiation retries exhausted; participant removed
    PeerUnreachable {
        /// Remote participant
        peer_id: ParticipantId,
        /// Attempts made
        attempts: u32,
    },
    /// Signaling relay dropped; reconnecting
    SignalingDisconnected,
    /// Signaling relay connection restored
    SignalingReconnected,
    /// Signaling relay could not be restored
    SignalingLost,
}
