//! Shared harness: an in-process classroom with a relay and a loopback network

#![allow(dead_code)]

use classroom_conference_core::relay::{InMemoryRelay, RelayEndpoint};
use classroom_conference_core::sim::{LoopbackNetwork, SyntheticMediaSource};
use classroom_conference_core::{
    ConferenceConfig, ConferenceController, ConferenceEvent, JoinError, ParticipantId,
    ParticipantInfo, RetryPolicy, Role, RoomId,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Short timers so scenarios finish quickly under paused time
pub fn test_config() -> ConferenceConfig {
    let mut config = ConferenceConfig::default();
    config.quality.sampling_interval = Duration::from_millis(100);
    config.peer.negotiation_timeout = Duration::from_millis(500);
    config.peer.retry = RetryPolicy {
        max_attempts: 2,
        initial_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_millis(200),
        multiplier: 2.0,
    };
    config.signaling.reconnect = RetryPolicy {
        max_attempts: 20,
        initial_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_millis(200),
        multiplier: 2.0,
    };
    config
}

pub struct Classroom {
    pub relay: InMemoryRelay,
    pub network: LoopbackNetwork,
    pub room: RoomId,
}

pub struct Member {
    pub info: ParticipantInfo,
    pub source: Arc<SyntheticMediaSource>,
    pub controller: ConferenceController<RelayEndpoint>,
    pub events: broadcast::Receiver<ConferenceEvent>,
}

impl Classroom {
    pub fn new() -> Self {
        init_tracing();
        Self {
            relay: InMemoryRelay::new(),
            network: LoopbackNetwork::new(),
            room: RoomId::new("physics-101"),
        }
    }

    pub fn member(&self, id: &str) -> Member {
        self.member_with(id, test_config())
    }

    pub fn member_with(&self, id: &str, config: ConferenceConfig) -> Member {
        let role = if id == "alice" {
            Role::Teacher
        } else {
            Role::Student
        };
        let source = Arc::new(SyntheticMediaSource::new());
        let controller = ConferenceController::new(
            config,
            source.clone(),
            Arc::new(self.relay.endpoint()),
            self.network.factory_for(&ParticipantId::new(id)),
        )
        .expect("test config is valid");
        let events = controller.subscribe_events();
        Member {
            info: ParticipantInfo::new(id, capitalize(id), role),
            source,
            controller,
            events,
        }
    }
}

impl Member {
    pub fn id(&self) -> ParticipantId {
        self.info.id.clone()
    }

    pub async fn join(&self, classroom: &Classroom) -> Result<(), JoinError> {
        self.controller
            .join(classroom.room.clone(), self.info.clone())
            .await
    }

    pub fn participant_ids(&self) -> Vec<String> {
        self.controller
            .participants()
            .iter()
            .map(|p| p.id().to_string())
            .collect()
    }

    /// Wait for the first event satisfying `pred`, skipping others
    pub async fn next_event<F>(&mut self, what: &str, pred: F) -> ConferenceEvent
    where
        F: Fn(&ConferenceEvent) -> bool,
    {
        let wait = async {
            loop {
                match self.events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        panic!("event stream closed waiting for {what}")
                    }
                }
            }
        };
        match tokio::time::timeout(Duration::from_secs(30), wait).await {
            Ok(event) => event,
            Err(_) => panic!("timed out waiting for {what}"),
        }
    }
}

fn capitalize(id: &str) -> String {
    let mut chars = id.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Poll `cond` until it holds
pub async fn eventually<F>(what: &str, cond: F)
where
    F: Fn() -> bool,
{
    for _ in 0..1500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}
