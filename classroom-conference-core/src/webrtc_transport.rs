//! webrtc-rs backed peer transport
//!
//! Real ICE/DTLS/SRTP connections through the `webrtc` crate. One
//! `RTCPeerConnection` per remote participant, with local audio/video tracks
//! matching the captured stream. Candidates are trickled through
//! [`TransportEvent::LocalCandidate`]; connection state changes are mapped
//! onto [`LinkState`].

use crate::config::IceServerConfig;
use crate::identity::ParticipantId;
use crate::media::LocalMedia;
use crate::transport::{
    LinkState, PeerTransport, PeerTransportFactory, TransportError, TransportEvent,
};
use crate::types::{IceCandidate, TransportStats};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Creates [`WebRtcTransport`]s with a fixed ICE server list
pub struct WebRtcTransportFactory {
    ice_servers: Vec<IceServerConfig>,
    loopback_candidates: bool,
}

impl WebRtcTransportFactory {
    /// Create a factory using `ice_servers` for every connection
    pub fn new(ice_servers: Vec<IceServerConfig>) -> Self {
        Self {
            ice_servers,
            loopback_candidates: false,
        }
    }

    /// Also gather loopback candidates, for peers on the same host
    #[must_use]
    pub fn with_loopback_candidates(mut self, enabled: bool) -> Self {
        self.loopback_candidates = enabled;
        self
    }

    async fn peer_connection(&self) -> Result<Arc<RTCPeerConnection>, webrtc::Error> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let mut settings = SettingEngine::default();
        settings.set_include_loopback_candidate(self.loopback_candidates);

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(settings)
            .build();

        let ice_servers = self
            .ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone().unwrap_or_default(),
                credential: s.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        Ok(Arc::new(api.new_peer_connection(config).await?))
    }
}

fn map_state(state: RTCPeerConnectionState) -> Option<LinkState> {
    match state {
        RTCPeerConnectionState::Connecting => Some(LinkState::Connecting),
        RTCPeerConnectionState::Connected => Some(LinkState::Connected),
        RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
        RTCPeerConnectionState::Failed => Some(LinkState::Failed),
        RTCPeerConnectionState::Closed => Some(LinkState::Closed),
        _ => None,
    }
}

/// Counters gathered from one stats report
#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct Readings {
    pair_rtt_secs: Option<f64>,
    remote_rtt_secs: Option<f64>,
    bytes_sent: u64,
    bytes_received: u64,
    packets_sent: u64,
    packets_lost: i64,
}

impl Readings {
    fn record(&mut self, stat: &StatsReportType) {
        match stat {
            StatsReportType::CandidatePair(cp) if cp.nominated => {
                if cp.current_round_trip_time > 0.0 {
                    self.pair_rtt_secs = Some(cp.current_round_trip_time);
                }
                self.bytes_sent += cp.bytes_sent as u64;
                self.bytes_received += cp.bytes_received as u64;
            }
            StatsReportType::OutboundRTP(outbound) => {
                self.packets_sent += outbound.packets_sent;
            }
            StatsReportType::RemoteInboundRTP(remote) => {
                self.packets_lost += remote.packets_lost;
                if self.remote_rtt_secs.is_none() {
                    self.remote_rtt_secs = remote.round_trip_time;
                }
            }
            _ => {}
        }
    }

    /// Loss is measured on what the remote side received from us
    fn into_stats(self) -> TransportStats {
        let lost = self.packets_lost.max(0) as u64;
        TransportStats {
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            packets_received: self.packets_sent.saturating_sub(lost),
            packets_lost: lost,
            round_trip_time_ms: self
                .pair_rtt_secs
                .or(self.remote_rtt_secs)
                .map(|s| s * 1000.0),
            jitter_ms: None,
        }
    }
}

fn connection_error(e: webrtc::Error) -> TransportError {
    TransportError::ConnectionError(e.to_string())
}

#[async_trait]
impl PeerTransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        remote: &ParticipantId,
        media: Arc<LocalMedia>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let pc = self.peer_connection().await.map_err(connection_error)?;

        let mut tracks: Vec<(&str, &str)> = Vec::new();
        if media.has_audio() {
            tracks.push((MIME_TYPE_OPUS, "audio"));
        }
        if media.has_video() {
            tracks.push((MIME_TYPE_VP8, "video"));
        }
        for (mime_type, kind) in tracks {
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime_type.to_owned(),
                    ..Default::default()
                },
                kind.to_owned(),
                media.id().to_owned(),
            ));
            pc.add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(connection_error)?;
        }

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to serialize local candidate"),
                }
            })
        }));

        let remote_id = remote.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let events = events.clone();
            let remote_id = remote_id.clone();
            Box::pin(async move {
                tracing::debug!(peer_id = %remote_id, state = %state, "Peer connection state");
                if let Some(link) = map_state(state) {
                    let _ = events.send(TransportEvent::LinkStateChanged(link));
                }
            })
        }));

        Ok(Arc::new(WebRtcTransport {
            pc,
            closed: AtomicBool::new(false),
        }))
    }
}

/// [`PeerTransport`] over an `RTCPeerConnection`
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    closed: AtomicBool,
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<String, TransportError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| TransportError::NegotiationFailed(e.to_string()))?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| TransportError::NegotiationFailed(e.to_string()))?;
        Ok(sdp)
    }

    async fn create_answer(&self, offer_sdp: &str) -> Result<String, TransportError> {
        let offer = RTCSessionDescription::offer(offer_sdp.to_owned())
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::NegotiationFailed(e.to_string()))?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| TransportError::NegotiationFailed(e.to_string()))?;
        Ok(sdp)
    }

    async fn accept_answer(&self, answer_sdp: &str) -> Result<(), TransportError> {
        let answer = RTCSessionDescription::answer(answer_sdp.to_owned())
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))
    }

    async fn get_stats(&self) -> Option<TransportStats> {
        if self.closed.load(Ordering::SeqCst)
            || self.pc.connection_state() != RTCPeerConnectionState::Connected
        {
            return None;
        }

        let report = self.pc.get_stats().await;
        let mut readings = Readings::default();
        for stat in report.reports.values() {
            readings.record(stat);
        }
        Some(readings.into_stats())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.pc.close().await {
            tracing::warn!(error = %e, "Failed to close peer connection");
        }
    }

    fn transport_type(&self) -> &'static str {
        "webrtc"
    }
}
