//! Headless media and network backends
//!
//! [`SyntheticMediaSource`] stands in for camera and microphone, and
//! [`LoopbackNetwork`] connects peer transports of participants living in the
//! same process. Link conditions (latency, loss, jitter, throughput) are
//! scripted per pair and turned into cumulative transport counters, so the
//! quality pipeline sees realistic, deterministic statistics. Used by the CLI
//! simulation and the test suites.

use crate::identity::ParticipantId;
use crate::media::{LocalMedia, MediaError, MediaSource, StreamHandle};
use crate::transport::{
    LinkState, PeerTransport, PeerTransportFactory, TransportError, TransportEvent,
};
use crate::types::{IceCandidate, MediaConstraints, TrackKind, TransportStats};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

const OFFER_PREFIX: &str = "loopback-offer:";
const ANSWER_PREFIX: &str = "loopback-answer:";

/// Packet rate assumed for synthetic media
const PACKETS_PER_SECOND: f64 = 50.0;

// ============================================================================
// Synthetic media
// ============================================================================

/// Camera/microphone stand-in with injectable failures
#[derive(Default)]
pub struct SyntheticMediaSource {
    failure: Mutex<Option<MediaError>>,
    acquire_delay: Mutex<Option<Duration>>,
    active: Mutex<HashSet<String>>,
    track_state: Mutex<HashMap<(String, TrackKind), bool>>,
    acquisitions: AtomicUsize,
}

impl SyntheticMediaSource {
    /// Source that always grants access
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following acquisition fail with `error`
    pub fn fail_with(&self, error: MediaError) {
        *self.failure.lock() = Some(error);
    }

    /// Clear an injected failure
    pub fn clear_failure(&self) {
        *self.failure.lock() = None;
    }

    /// Simulate a slow permission prompt
    pub fn set_acquire_delay(&self, delay: Duration) {
        *self.acquire_delay.lock() = Some(delay);
    }

    /// Number of streams currently holding hardware
    pub fn active_streams(&self) -> usize {
        self.active.lock().len()
    }

    /// Total successful acquisitions
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Last enabled state set for a track of `stream_id`
    pub fn track_enabled(&self, stream_id: &str, kind: TrackKind) -> Option<bool> {
        self.track_state
            .lock()
            .get(&(stream_id.to_string(), kind))
            .copied()
    }
}

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<StreamHandle, MediaError> {
        let delay = *self.acquire_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.failure.lock().clone();
        if let Some(error) = failure {
            return Err(error);
        }

        let n = self.acquisitions.fetch_add(1, Ordering::SeqCst);
        let handle = StreamHandle {
            id: format!("synthetic-{n}"),
            audio: constraints.audio,
            video: constraints.video,
        };
        self.active.lock().insert(handle.id.clone());
        Ok(handle)
    }

    fn set_track_enabled(&self, stream: &StreamHandle, kind: TrackKind, enabled: bool) {
        self.track_state
            .lock()
            .insert((stream.id.clone(), kind), enabled);
    }

    fn release(&self, stream: &StreamHandle) {
        self.active.lock().remove(&stream.id);
    }

    fn source_type(&self) -> &'static str {
        "synthetic"
    }
}

// ============================================================================
// Loopback network
// ============================================================================

/// Scripted conditions of the path between two participants
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkConditions {
    /// Round-trip time in milliseconds
    pub rtt_ms: f64,
    /// Packet loss in percent
    pub loss_pct: f64,
    /// Jitter in milliseconds
    pub jitter_ms: f64,
    /// Throughput in each direction, kilobytes per second
    pub throughput_kbytes_per_sec: f64,
}

impl Default for LinkConditions {
    fn default() -> Self {
        Self {
            rtt_ms: 40.0,
            loss_pct: 0.0,
            jitter_ms: 5.0,
            throughput_kbytes_per_sec: 150.0,
        }
    }
}

type PairKey = (ParticipantId, ParticipantId);

fn pair(a: &ParticipantId, b: &ParticipantId) -> PairKey {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

#[derive(Default)]
struct Network {
    conditions: HashMap<PairKey, LinkConditions>,
    blocked: HashSet<PairKey>,
    endpoints: HashMap<(ParticipantId, ParticipantId), Weak<Endpoint>>,
    offers: HashMap<(ParticipantId, ParticipantId), usize>,
}

/// In-process network connecting loopback transports
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<Network>>,
    default_conditions: Arc<Mutex<LinkConditions>>,
    next_transport: Arc<AtomicU64>,
}

impl LoopbackNetwork {
    /// Create a network with default conditions on every link
    pub fn new() -> Self {
        Self::default()
    }

    /// Conditions applied to links without explicit conditions
    pub fn set_default_conditions(&self, conditions: LinkConditions) {
        *self.default_conditions.lock() = conditions;
    }

    /// Script the conditions between `a` and `b`
    pub fn set_conditions(&self, a: &ParticipantId, b: &ParticipantId, conditions: LinkConditions) {
        self.inner.lock().conditions.insert(pair(a, b), conditions);
    }

    /// Make connectivity checks between `a` and `b` fail
    ///
    /// Negotiations between the pair never reach `connected` until
    /// [`LoopbackNetwork::unblock`] is called.
    pub fn block(&self, a: &ParticipantId, b: &ParticipantId) {
        self.inner.lock().blocked.insert(pair(a, b));
    }

    /// Restore connectivity between `a` and `b`
    pub fn unblock(&self, a: &ParticipantId, b: &ParticipantId) {
        self.inner.lock().blocked.remove(&pair(a, b));
    }

    /// Report loss of connectivity on both ends of the `a`–`b` link
    pub fn sever(&self, a: &ParticipantId, b: &ParticipantId) {
        let ends: Vec<Arc<Endpoint>> = {
            let net = self.inner.lock();
            [(a.clone(), b.clone()), (b.clone(), a.clone())]
                .iter()
                .filter_map(|k| net.endpoints.get(k).and_then(Weak::upgrade))
                .collect()
        };
        for end in ends {
            end.link_lost(LinkState::Disconnected);
        }
    }

    /// Offers created by `from` towards `to`
    pub fn offers_created(&self, from: &ParticipantId, to: &ParticipantId) -> usize {
        self.inner
            .lock()
            .offers
            .get(&(from.clone(), to.clone()))
            .copied()
            .unwrap_or(0)
    }

    /// Transport factory for the participant `local`
    pub fn factory_for(&self, local: &ParticipantId) -> Arc<LoopbackFactory> {
        Arc::new(LoopbackFactory {
            network: self.clone(),
            local: local.clone(),
        })
    }

    fn conditions(&self, a: &ParticipantId, b: &ParticipantId) -> LinkConditions {
        let net = self.inner.lock();
        net.conditions
            .get(&pair(a, b))
            .copied()
            .unwrap_or_else(|| *self.default_conditions.lock())
    }

    fn is_blocked(&self, a: &ParticipantId, b: &ParticipantId) -> bool {
        self.inner.lock().blocked.contains(&pair(a, b))
    }

    fn counterpart(&self, local: &ParticipantId, remote: &ParticipantId) -> Option<Arc<Endpoint>> {
        self.inner
            .lock()
            .endpoints
            .get(&(remote.clone(), local.clone()))
            .and_then(Weak::upgrade)
    }
}

/// Creates loopback transports for one participant
pub struct LoopbackFactory {
    network: LoopbackNetwork,
    local: ParticipantId,
}

#[async_trait]
impl PeerTransportFactory for LoopbackFactory {
    async fn create(
        &self,
        remote: &ParticipantId,
        media: Arc<LocalMedia>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let id = self.network.next_transport.fetch_add(1, Ordering::Relaxed);
        let endpoint = Arc::new(Endpoint {
            id,
            local: self.local.clone(),
            remote: remote.clone(),
            media,
            events,
            state: Mutex::new(EndpointState::default()),
        });
        self.network
            .inner
            .lock()
            .endpoints
            .insert((self.local.clone(), remote.clone()), Arc::downgrade(&endpoint));

        Ok(Arc::new(LoopbackTransport {
            network: self.network.clone(),
            endpoint,
        }))
    }
}

#[derive(Default)]
struct EndpointState {
    local_description: Option<String>,
    remote_description: Option<String>,
    remote_candidates: usize,
    connected: bool,
    closed: bool,
    counters: TransportStats,
    last_read: Option<Instant>,
}

struct Endpoint {
    id: u64,
    local: ParticipantId,
    remote: ParticipantId,
    media: Arc<LocalMedia>,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<EndpointState>,
}

impl Endpoint {
    fn link_lost(&self, state: LinkState) {
        let was_connected = {
            let mut s = self.state.lock();
            let was = s.connected;
            s.connected = false;
            was && !s.closed
        };
        if was_connected {
            let _ = self.events.send(TransportEvent::LinkStateChanged(state));
        }
    }

    fn emit_candidate(&self) {
        let candidate = IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                self.id,
                40000 + self.id % 20000
            ),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        let _ = self.events.send(TransportEvent::LocalCandidate(candidate));
    }
}

/// Transport between two participants of a [`LoopbackNetwork`]
pub struct LoopbackTransport {
    network: LoopbackNetwork,
    endpoint: Arc<Endpoint>,
}

impl LoopbackTransport {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.endpoint.state.lock().closed {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn check_connected(&self) {
        let ready = {
            let s = self.endpoint.state.lock();
            !s.closed
                && !s.connected
                && s.local_description.is_some()
                && s.remote_description.is_some()
                && s.remote_candidates > 0
        };
        if !ready || self.network.is_blocked(&self.endpoint.local, &self.endpoint.remote) {
            return;
        }
        {
            let mut s = self.endpoint.state.lock();
            s.connected = true;
            s.last_read = Some(Instant::now());
        }
        tracing::trace!(
            local = %self.endpoint.local,
            remote = %self.endpoint.remote,
            transport = self.endpoint.id,
            "Loopback link connected"
        );
        let _ = self
            .endpoint
            .events
            .send(TransportEvent::LinkStateChanged(LinkState::Connected));
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn create_offer(&self) -> Result<String, TransportError> {
        self.ensure_open()?;
        let sdp = format!(
            "{OFFER_PREFIX}{}->{}#{}",
            self.endpoint.local, self.endpoint.remote, self.endpoint.id
        );
        self.endpoint.state.lock().local_description = Some(sdp.clone());
        *self
            .network
            .inner
            .lock()
            .offers
            .entry((self.endpoint.local.clone(), self.endpoint.remote.clone()))
            .or_insert(0) += 1;
        self.endpoint.emit_candidate();
        Ok(sdp)
    }

    async fn create_answer(&self, offer_sdp: &str) -> Result<String, TransportError> {
        self.ensure_open()?;
        if !offer_sdp.starts_with(OFFER_PREFIX) {
            return Err(TransportError::InvalidDescription(
                "not a loopback offer".to_string(),
            ));
        }
        let offer_id = offer_sdp.rsplit('#').next().unwrap_or_default();
        let sdp = format!(
            "{ANSWER_PREFIX}{}->{}#{}@{offer_id}",
            self.endpoint.local, self.endpoint.remote, self.endpoint.id
        );
        {
            let mut s = self.endpoint.state.lock();
            s.remote_description = Some(offer_sdp.to_string());
            s.local_description = Some(sdp.clone());
        }
        self.endpoint.emit_candidate();
        self.check_connected();
        Ok(sdp)
    }

    async fn accept_answer(&self, answer_sdp: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        if !answer_sdp.starts_with(ANSWER_PREFIX) {
            return Err(TransportError::InvalidDescription(
                "not a loopback answer".to_string(),
            ));
        }
        // The answer names the offer it was made for
        if let Some((_, offer_id)) = answer_sdp.rsplit_once('@') {
            if offer_id != self.endpoint.id.to_string() {
                return Err(TransportError::InvalidDescription(format!(
                    "answer for offer {offer_id}, not {}",
                    self.endpoint.id
                )));
            }
        }
        {
            let mut s = self.endpoint.state.lock();
            if s.local_description.is_none() {
                return Err(TransportError::NegotiationFailed(
                    "answer without local offer".to_string(),
                ));
            }
            s.remote_description = Some(answer_sdp.to_string());
        }
        self.check_connected();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.ensure_open()?;
        if candidate.candidate.is_empty() {
            return Err(TransportError::InvalidDescription("empty candidate".to_string()));
        }
        self.endpoint.state.lock().remote_candidates += 1;
        self.check_connected();
        Ok(())
    }

    async fn get_stats(&self) -> Option<TransportStats> {
        let conditions = self
            .network
            .conditions(&self.endpoint.local, &self.endpoint.remote);
        let sending = self.endpoint.media.is_audio_enabled() || self.endpoint.media.is_video_enabled();

        let mut s = self.endpoint.state.lock();
        if !s.connected || s.closed {
            return None;
        }
        let now = Instant::now();
        let elapsed = s
            .last_read
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default()
            .as_secs_f64();
        s.last_read = Some(now);

        let bytes = conditions.throughput_kbytes_per_sec * 1000.0 * elapsed;
        let packets = PACKETS_PER_SECOND * elapsed;
        let lost = packets * conditions.loss_pct.clamp(0.0, 100.0) / 100.0;

        s.counters.bytes_received += bytes as u64;
        if sending {
            s.counters.bytes_sent += bytes as u64;
        }
        s.counters.packets_received += (packets - lost).round() as u64;
        s.counters.packets_lost += lost.round() as u64;
        s.counters.round_trip_time_ms = Some(conditions.rtt_ms);
        s.counters.jitter_ms = Some(conditions.jitter_ms);
        Some(s.counters)
    }

    async fn close(&self) {
        {
            let mut s = self.endpoint.state.lock();
            if s.closed {
                return;
            }
            s.closed = true;
            s.connected = false;
        }
        {
            let mut net = self.network.inner.lock();
            let key = (self.endpoint.local.clone(), self.endpoint.remote.clone());
            if net
                .endpoints
                .get(&key)
                .and_then(Weak::upgrade)
                .is_some_and(|e| e.id == self.endpoint.id)
            {
                net.endpoints.remove(&key);
            }
        }
        if let Some(peer) = self
            .network
            .counterpart(&self.endpoint.local, &self.endpoint.remote)
        {
            peer.link_lost(LinkState::Disconnected);
        }
    }

    fn transport_type(&self) -> &'static str {
        "loopback"
    }
}
