//! Classroom Conference - live classroom video conferencing core
//!
//! This library connects every participant of a virtual classroom to every
//! other participant (a full mesh) and keeps the UI informed about who is in
//! the room and how good each connection is. It features:
//!
//! - **Media capture**: one local audio/video stream per session, with mute and
//!   camera-off toggles that persist across sessions
//! - **Room signaling**: presence and offer/answer/candidate exchange through a
//!   relay, with reconnect and backoff
//! - **Peer connections**: one per-peer task driving each connection's state
//!   machine, with glare-free negotiation and bounded retries
//! - **Connection quality**: periodic latency/loss/jitter/throughput sampling
//!   classified into excellent/good/fair/poor with hysteresis
//!
//! Platform primitives sit behind the [`MediaSource`], [`SignalingTransport`]
//! and [`PeerTransportFactory`] traits. The [`sim`] and [`relay`] modules
//! provide in-process implementations used by the tests and the CLI.
//!
//! # Examples
//!
//! ```rust,no_run
//! use classroom_conference_core::prelude::*;
//! use classroom_conference_core::relay::InMemoryRelay;
//! use classroom_conference_core::sim::{LoopbackNetwork, SyntheticMediaSource};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let relay = InMemoryRelay::new();
//! let network = LoopbackNetwork::new();
//!
//! let controller = ConferenceController::new(
//!     ConferenceConfig::from_env()?,
//!     Arc::new(SyntheticMediaSource::new()),
//!     Arc::new(relay.endpoint()),
//!     network.factory_for(&ParticipantId::new("alice")),
//! )?;
//!
//! controller.on_participants_changed(|participants| {
//!     println!("{} in the room", participants.len());
//! });
//!
//! controller
//!     .join(
//!         RoomId::new("physics-101"),
//!         ParticipantInfo::new("alice", "Alice", Role::Teacher),
//!     )
//!     .await?;
//!
//! let muted = controller.toggle_microphone();
//! println!("muted: {muted}");
//!
//! controller.leave().await;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// Participant and room identity
pub mod identity;

/// Core types and data structures
pub mod types;

/// Configuration and environment loading
pub mod config;

/// Local media capture
pub mod media;

/// Room signaling protocol and channel
pub mod signaling;

/// Peer transport abstraction
pub mod transport;

/// Peer connection pool and per-peer state machine
pub mod peer;

/// Participant registry
pub mod registry;

/// Connection quality sampling and classification
pub mod quality;

/// Conference façade
pub mod conference;

/// In-process signaling relay
pub mod relay;

/// Simulated media source and loopback network
pub mod sim;

/// WebSocket signaling relay client (requires websocket-relay feature)
#[cfg(feature = "websocket-relay")]
pub mod ws_relay;

/// webrtc-rs peer transport (requires webrtc-transport feature)
#[cfg(feature = "webrtc-transport")]
pub mod webrtc_transport;

// Re-export main types at crate root
pub use conference::{ConferenceController, JoinError, SubscriptionId};
pub use config::{ConferenceConfig, ConfigError, IceServerConfig, RetryPolicy};
pub use identity::{ParticipantId, ParticipantInfo, Role, RoomId};
pub use media::{LocalMedia, MediaCaptureManager, MediaError, MediaSource, StreamHandle};
pub use peer::{CloseReason, PeerConnectionPool, PeerEvent};
pub use quality::{classify, ConnectionQualityMonitor, QualityThresholds};
pub use registry::ParticipantRegistry;
pub use signaling::{
    SignalingChannel, SignalingError, SignalingEvent, SignalingMessage, SignalingTransport,
};
pub use transport::{PeerTransport, PeerTransportFactory, TransportError, TransportEvent};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::conference::{ConferenceController, JoinError, SubscriptionId};
    pub use crate::config::ConferenceConfig;
    pub use crate::identity::{ParticipantId, ParticipantInfo, Role, RoomId};
    pub use crate::media::MediaSource;
    pub use crate::signaling::SignalingTransport;
    pub use crate::transport::PeerTransportFactory;
    pub use crate::types::{
        ConferenceEvent, ConnectionQualityMetrics, ConnectionState, MediaConstraints, Participant,
        QualityLevel,
    };
}
