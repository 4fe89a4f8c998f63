//! Peer transport abstraction
//!
//! A [`PeerTransport`] is one negotiated media connection to one remote
//! participant: SDP offer/answer, ICE candidates, raw statistics. The pool
//! drives it; it never talks to signaling itself. Locally gathered candidates
//! and link-state changes are reported back on the event channel handed to
//! [`PeerTransportFactory::create`].

use crate::identity::ParticipantId;
use crate::media::LocalMedia;
use crate::types::{IceCandidate, TransportStats};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Offer/answer exchange could not complete
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Remote description or candidate rejected
    #[error("Invalid remote description: {0}")]
    InvalidDescription(String),

    /// Transport could not be created
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Transport already closed
    #[error("Transport closed")]
    Closed,
}

/// Connectivity reported by the underlying transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// ICE/DTLS in progress
    Connecting,
    /// Media path established
    Connected,
    /// Connectivity lost, may recover
    Disconnected,
    /// Connectivity lost for good
    Failed,
    /// Closed by either side
    Closed,
}

impl LinkState {
    /// Whether the link is gone and the connection must be renegotiated
    pub fn is_lost(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

/// Event raised by a transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Locally gathered ICE candidate to forward to the remote side
    LocalCandidate(IceCandidate),
    /// Connectivity changed
    LinkStateChanged(LinkState),
}

/// One media connection to a remote participant
///
/// Implementations must be Send + Sync; the pool calls them from the
/// per-peer task and the quality monitor reads stats concurrently.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create a local offer and apply it as local description
    ///
    /// # Errors
    ///
    /// Returns error if the offer cannot be created
    async fn create_offer(&self) -> Result<String, TransportError>;

    /// Apply a remote offer and create the local answer
    ///
    /// # Errors
    ///
    /// Returns error if the offer is rejected or no answer can be created
    async fn create_answer(&self, offer_sdp: &str) -> Result<String, TransportError>;

    /// Apply the remote answer to a previously created offer
    ///
    /// # Errors
    ///
    /// Returns error if the answer is rejected
    async fn accept_answer(&self, answer_sdp: &str) -> Result<(), TransportError>;

    /// Apply a remote ICE candidate
    ///
    /// Only called after the remote description is set.
    ///
    /// # Errors
    ///
    /// Returns error if the candidate is rejected
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Read cumulative counters, `None` if unavailable
    async fn get_stats(&self) -> Option<TransportStats>;

    /// Tear the connection down; idempotent
    async fn close(&self);

    /// Transport type name for logging
    fn transport_type(&self) -> &'static str {
        "unknown"
    }
}

/// Creates transports for a local participant
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    /// Create a transport towards `remote` sending `media`
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionError`] if the transport cannot be
    /// set up
    async fn create(
        &self,
        remote: &ParticipantId,
        media: Arc<LocalMedia>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}
