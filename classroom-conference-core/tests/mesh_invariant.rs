//! Registry and pool stay in step under arbitrary presence traffic
//!
//! Remote members are bare relay endpoints: they announce themselves, leave,
//! vanish without a word and never answer offers. After every step the local
//! side must hold exactly one connection per remote participant it lists.

mod common;

use classroom_conference_core::relay::{InMemoryRelay, RelayEndpoint};
use classroom_conference_core::signaling::SignalingTransport;
use classroom_conference_core::{ConferenceEvent, ParticipantInfo, Role, SignalingMessage};
use common::{test_config, Classroom};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::time::Duration;

const REMOTES: usize = 4;

#[derive(Debug, Clone)]
enum Step {
    /// Connect and announce; a repeat while connected is a duplicate join
    Join(usize),
    /// Announce departure; while disconnected it is a duplicate leave
    Leave(usize),
    /// Drop the relay connection without a leave
    Vanish(usize),
    /// Sever the local connection so the roster is reconciled on reconnect
    Reconnect,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => (0..REMOTES).prop_map(Step::Join),
        2 => (0..REMOTES).prop_map(Step::Leave),
        1 => (0..REMOTES).prop_map(Step::Vanish),
        1 => Just(Step::Reconnect),
    ]
}

struct Remote {
    info: ParticipantInfo,
    endpoint: RelayEndpoint,
    connected: bool,
}

impl Remote {
    fn new(relay: &InMemoryRelay, index: usize) -> Self {
        let id = format!("r{index}");
        Self {
            info: ParticipantInfo::new(id.as_str(), id.to_uppercase(), Role::Student),
            endpoint: relay.endpoint(),
            connected: false,
        }
    }
}

/// Let every task that can make progress run
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn run(steps: Vec<Step>) -> Result<(), TestCaseError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .map_err(|e| TestCaseError::fail(e.to_string()))?;

    runtime.block_on(async move {
        let room = Classroom::new();
        let mut config = test_config();
        // Remotes never answer; keep negotiations pending for the whole run
        config.peer.negotiation_timeout = Duration::from_secs(3600);
        let mut alice = room.member_with("alice", config);
        alice.join(&room).await.map_err(|e| TestCaseError::fail(e.to_string()))?;

        // Silent member used to relay leaves for participants no longer connected
        let observer = room.relay.endpoint();
        let observer_info = ParticipantInfo::new("observer", "Observer", Role::Student);
        observer
            .connect(&room.room, &observer_info)
            .await
            .map_err(|e| TestCaseError::fail(e.to_string()))?;

        let mut remotes: Vec<Remote> = (0..REMOTES).map(|i| Remote::new(&room.relay, i)).collect();
        let mut expected: BTreeSet<String> = BTreeSet::new();

        for step in steps {
            match step {
                Step::Join(i) => {
                    let remote = &mut remotes[i];
                    if !remote.connected {
                        remote
                            .endpoint
                            .connect(&room.room, &remote.info)
                            .await
                            .map_err(|e| TestCaseError::fail(e.to_string()))?;
                        remote.connected = true;
                    }
                    remote
                        .endpoint
                        .send_message(SignalingMessage::join(&remote.info))
                        .await
                        .map_err(|e| TestCaseError::fail(e.to_string()))?;
                    expected.insert(remote.info.id.to_string());
                }
                Step::Leave(i) => {
                    let remote = &mut remotes[i];
                    let leave = SignalingMessage::Leave {
                        participant_id: remote.info.id.clone(),
                    };
                    let sent = if remote.connected {
                        let sent = remote.endpoint.send_message(leave).await;
                        remote.endpoint.disconnect().await;
                        remote.connected = false;
                        sent
                    } else {
                        observer.send_message(leave).await
                    };
                    sent.map_err(|e| TestCaseError::fail(e.to_string()))?;
                    expected.remove(remote.info.id.as_str());
                }
                Step::Vanish(i) => {
                    let remote = &mut remotes[i];
                    if remote.connected {
                        remote.endpoint.disconnect().await;
                        remote.connected = false;
                    }
                }
                Step::Reconnect => {
                    prop_assert!(room.relay.sever(&room.room, &alice.id()));
                    alice
                        .next_event("signaling reconnected", |e| {
                            matches!(e, ConferenceEvent::SignalingReconnected)
                        })
                        .await;
                    expected = remotes
                        .iter()
                        .filter(|r| r.connected)
                        .map(|r| r.info.id.to_string())
                        .collect();
                    expected.insert("observer".to_string());
                }
            }
            settle().await;

            let participants = alice.controller.participants();
            prop_assert_eq!(
                alice.controller.active_connections(),
                participants.len() - 1,
                "connections out of step with {:?}",
                alice.participant_ids()
            );
            let listed: BTreeSet<String> = participants
                .iter()
                .filter(|p| !p.is_local)
                .map(|p| p.id().to_string())
                .collect();
            prop_assert_eq!(&listed, &expected);
        }

        alice.controller.leave().await;
        prop_assert_eq!(alice.controller.active_connections(), 0);
        prop_assert!(alice.controller.participants().is_empty());
        Ok(())
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_connections_track_participants(steps in proptest::collection::vec(step(), 1..40)) {
        run(steps)?;
    }
}
