//! Peer connection pool behaviour over real signaling channels

mod common;

use async_trait::async_trait;
use classroom_conference_core::config::{PeerConfig, RetryPolicy};
use classroom_conference_core::relay::{InMemoryRelay, RelayEndpoint};
use classroom_conference_core::signaling::{SignalPublisher, SignalingEvent};
use classroom_conference_core::sim::{LoopbackNetwork, SyntheticMediaSource};
use classroom_conference_core::{
    ConnectionState, IceCandidate, MediaCaptureManager, MediaConstraints, ParticipantId,
    ParticipantInfo, PeerConnectionPool, PeerEvent, PeerTransport, PeerTransportFactory, Role, RoomId,
    SignalingChannel, SignalingError, SignalingMessage, TransportEvent,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

fn peer_config() -> PeerConfig {
    PeerConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(200),
            multiplier: 2.0,
        },
        negotiation_timeout: Duration::from_millis(500),
    }
}

struct Side {
    _media: MediaCaptureManager,
    channel: Arc<SignalingChannel<RelayEndpoint>>,
    pool: Arc<PeerConnectionPool>,
    events: mpsc::UnboundedReceiver<PeerEvent>,
    pump: JoinHandle<()>,
}

impl Side {
    async fn connected(&mut self, what: &str) -> Arc<dyn PeerTransport> {
        let wait = async {
            loop {
                match self.events.recv().await {
                    Some(PeerEvent::Connected { transport, .. }) => return transport,
                    Some(_) => continue,
                    None => panic!("pool events closed waiting for {what}"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(30), wait)
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
    }

    async fn shutdown(self) {
        self.pump.abort();
        self.pool.close_all().await;
        self.channel.disconnect().await;
    }
}

/// A pool wired to its own signaling channel, with directed messages pumped in
async fn side(relay: &InMemoryRelay, network: &LoopbackNetwork, room: &RoomId, id: &str) -> Side {
    let media = MediaCaptureManager::new(Arc::new(SyntheticMediaSource::new()));
    let stream = media.acquire(&MediaConstraints::video_call()).await.unwrap();
    let channel = Arc::new(SignalingChannel::new(
        Arc::new(relay.endpoint()),
        RetryPolicy::default(),
    ));
    let mut signals = channel.subscribe();
    channel
        .connect(room, &ParticipantInfo::new(id, id, Role::Student))
        .await
        .unwrap();

    let (pool, events) = PeerConnectionPool::new(
        ParticipantId::new(id),
        network.factory_for(&ParticipantId::new(id)),
        channel.clone(),
        stream,
        peer_config(),
    );
    let pool = Arc::new(pool);
    let pump_pool = pool.clone();
    let pump = tokio::spawn(async move {
        while let Some(event) = signals.recv().await {
            if let SignalingEvent::Message(message) = event {
                if message.recipient().is_some() {
                    pump_pool.deliver(message);
                }
            }
        }
    });

    Side {
        _media: media,
        channel,
        pool,
        events,
        pump,
    }
}

#[tokio::test(start_paused = true)]
async fn test_glare_produces_single_offer() {
    common::init_tracing();
    let relay = InMemoryRelay::new();
    let network = LoopbackNetwork::new();
    let room = RoomId::new("glare");
    let mut alice = side(&relay, &network, &room, "alice").await;
    let mut bob = side(&relay, &network, &room, "bob").await;

    // Both sides discover each other at the same instant
    assert!(alice.pool.connect(&"bob".into()));
    assert!(bob.pool.connect(&"alice".into()));

    alice.connected("alice connected").await;
    bob.connected("bob connected").await;

    assert_eq!(network.offers_created(&"alice".into(), &"bob".into()), 1);
    assert_eq!(network.offers_created(&"bob".into(), &"alice".into()), 0);
    assert_eq!(relay.offers_between(&"alice".into(), &"bob".into()), 1);
    assert_eq!(relay.offers_between(&"bob".into(), &"alice".into()), 0);

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_renegotiates_after_link_loss() {
    common::init_tracing();
    let relay = InMemoryRelay::new();
    let network = LoopbackNetwork::new();
    let room = RoomId::new("flaky");
    let mut alice = side(&relay, &network, &room, "alice").await;
    let mut bob = side(&relay, &network, &room, "bob").await;

    alice.pool.connect(&"bob".into());
    bob.pool.connect(&"alice".into());
    alice.connected("first connection").await;
    bob.connected("first connection").await;

    network.sever(&"alice".into(), &"bob".into());

    alice.connected("renegotiated").await;
    bob.connected("renegotiated").await;
    assert_eq!(
        alice.pool.state_of(&"bob".into()),
        Some(ConnectionState::Connected)
    );
    assert_eq!(network.offers_created(&"alice".into(), &"bob".into()), 2);
    assert_eq!(network.offers_created(&"bob".into(), &"alice".into()), 0);

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_close_all_reaches_closed() {
    common::init_tracing();
    let relay = InMemoryRelay::new();
    let network = LoopbackNetwork::new();
    let room = RoomId::new("closing");
    let mut alice = side(&relay, &network, &room, "alice").await;
    let mut bob = side(&relay, &network, &room, "bob").await;

    alice.pool.connect(&"bob".into());
    bob.pool.connect(&"alice".into());
    alice.connected("alice connected").await;
    bob.connected("bob connected").await;

    alice.pool.close_all().await;
    assert_eq!(alice.pool.active_count(), 0);
    assert!(alice.pool.peer_ids().is_empty());

    let mut closed = false;
    while let Ok(event) = alice.events.try_recv() {
        if let PeerEvent::StateChanged { new_state, .. } = event {
            closed |= new_state == ConnectionState::Closed;
        }
    }
    assert!(closed);

    // Bob sees the link go away
    let bob_lost = async {
        loop {
            match bob.events.recv().await {
                Some(PeerEvent::StateChanged {
                    new_state: ConnectionState::Disconnected,
                    ..
                }) => return,
                Some(_) => continue,
                None => panic!("bob's events closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), bob_lost)
        .await
        .unwrap();

    alice.shutdown().await;
    bob.shutdown().await;
}

// ----------------------------------------------------------------------------
// Candidate ordering, driven by hand
// ----------------------------------------------------------------------------

struct Outbox {
    sent: mpsc::UnboundedSender<SignalingMessage>,
    available: watch::Sender<bool>,
}

#[async_trait]
impl SignalPublisher for Outbox {
    async fn publish(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        self.sent
            .send(message)
            .map_err(|_| SignalingError::Disconnected)
    }

    fn availability(&self) -> watch::Receiver<bool> {
        self.available.subscribe()
    }
}

#[tokio::test(start_paused = true)]
async fn test_candidate_before_answer_is_buffered() {
    common::init_tracing();
    let network = LoopbackNetwork::new();
    let media = MediaCaptureManager::new(Arc::new(SyntheticMediaSource::new()));
    let stream = media.acquire(&MediaConstraints::audio_only()).await.unwrap();

    let (sent_tx, mut sent_rx) = mpsc::unbounded_channel();
    let (available, _) = watch::channel(true);
    let (pool, mut events) = PeerConnectionPool::new(
        "alice".into(),
        network.factory_for(&"alice".into()),
        Arc::new(Outbox {
            sent: sent_tx,
            available,
        }),
        stream.clone(),
        peer_config(),
    );

    pool.connect(&"bob".into());
    let offer = loop {
        match sent_rx.recv().await.unwrap() {
            SignalingMessage::Offer { sdp, .. } => break sdp,
            _ => continue,
        }
    };

    // Play bob by hand
    let (bob_tx, mut bob_events) = mpsc::unbounded_channel();
    let bob = network
        .factory_for(&"bob".into())
        .create(&"alice".into(), stream, bob_tx)
        .await
        .unwrap();
    let answer = bob.create_answer(&offer).await.unwrap();
    let candidate: IceCandidate = match bob_events.recv().await.unwrap() {
        TransportEvent::LocalCandidate(c) => c,
        other => panic!("expected candidate, got {other:?}"),
    };

    assert!(pool.deliver(SignalingMessage::IceCandidate {
        from_id: "bob".into(),
        to_id: "alice".into(),
        candidate,
    }));
    assert!(pool.deliver(SignalingMessage::Answer {
        from_id: "bob".into(),
        to_id: "alice".into(),
        sdp: answer,
        negotiation_id: None,
    }));

    let connected = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(PeerEvent::Connected { .. }) = events.recv().await {
                return;
            }
        }
    })
    .await;
    assert!(connected.is_ok(), "buffered candidate was not applied");

    pool.close_all().await;
    bob.close().await;
}

async fn next_offer(
    sent: &mut mpsc::UnboundedReceiver<SignalingMessage>,
) -> (String, Option<u64>) {
    loop {
        if let SignalingMessage::Offer {
            sdp,
            negotiation_id,
            ..
        } = sent.recv().await.unwrap()
        {
            return (sdp, negotiation_id);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_late_answer_to_superseded_offer_is_ignored() {
    common::init_tracing();
    let network = LoopbackNetwork::new();
    let media = MediaCaptureManager::new(Arc::new(SyntheticMediaSource::new()));
    let stream = media.acquire(&MediaConstraints::audio_only()).await.unwrap();

    let (sent_tx, mut sent_rx) = mpsc::unbounded_channel();
    let (available, _) = watch::channel(true);
    let (pool, mut events) = PeerConnectionPool::new(
        "alice".into(),
        network.factory_for(&"alice".into()),
        Arc::new(Outbox {
            sent: sent_tx,
            available,
        }),
        stream.clone(),
        peer_config(),
    );

    pool.connect(&"bob".into());
    let (first_sdp, first_id) = next_offer(&mut sent_rx).await;
    // Nobody answers: the attempt times out and a fresh offer follows
    let (second_sdp, second_id) = next_offer(&mut sent_rx).await;
    assert!(first_id.is_some());
    assert_ne!(first_id, second_id);
    assert_eq!(network.offers_created(&"alice".into(), &"bob".into()), 2);

    let answer_with = |offer: String| {
        let network = network.clone();
        let stream = stream.clone();
        async move {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let bob = network
                .factory_for(&"bob".into())
                .create(&"alice".into(), stream, tx)
                .await
                .unwrap();
            let answer = bob.create_answer(&offer).await.unwrap();
            let candidate = loop {
                if let TransportEvent::LocalCandidate(c) = rx.recv().await.unwrap() {
                    break c;
                }
            };
            (bob, answer, candidate)
        }
    };

    let (late_bob, late_answer, _) = answer_with(first_sdp).await;
    assert!(pool.deliver(SignalingMessage::Answer {
        from_id: "bob".into(),
        to_id: "alice".into(),
        sdp: late_answer,
        negotiation_id: first_id,
    }));

    let (bob, answer, candidate) = answer_with(second_sdp).await;
    assert!(pool.deliver(SignalingMessage::Answer {
        from_id: "bob".into(),
        to_id: "alice".into(),
        sdp: answer,
        negotiation_id: second_id,
    }));
    assert!(pool.deliver(SignalingMessage::IceCandidate {
        from_id: "bob".into(),
        to_id: "alice".into(),
        candidate,
    }));

    let connected = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(PeerEvent::Connected { .. }) = events.recv().await {
                return;
            }
        }
    })
    .await;
    assert!(connected.is_ok(), "current answer was not applied");
    // The stale answer neither failed the attempt nor forced another offer
    assert_eq!(network.offers_created(&"alice".into(), &"bob".into()), 2);

    pool.close_all().await;
    late_bob.close().await;
    bob.close().await;
}
