//! In-process signaling relay
//!
//! [`InMemoryRelay`] is a room hub living in the same process as its clients.
//! Each participant gets its own [`RelayEndpoint`], which implements
//! [`SignalingTransport`]. Broadcast messages go to every other member of the
//! room, directed messages only to their addressee. The hub can sever a
//! member's connection and refuse reconnects to exercise the channel's
//! reconnect path.

use crate::identity::{ParticipantId, ParticipantInfo, RoomId};
use crate::signaling::{SignalingMessage, SignalingTransport};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Relay errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Endpoint has no open connection
    #[error("Not connected to relay")]
    NotConnected,

    /// Relay refuses connections
    #[error("Relay unavailable")]
    Unavailable,

    /// Connection closed by the relay
    #[error("Relay connection dropped")]
    ConnectionDropped,
}

struct Member {
    info: ParticipantInfo,
    connection: u64,
    tx: mpsc::UnboundedSender<SignalingMessage>,
}

#[derive(Default)]
struct Hub {
    rooms: HashMap<RoomId, HashMap<ParticipantId, Member>>,
    log: Vec<(RoomId, SignalingMessage)>,
}

/// In-process room relay
#[derive(Clone, Default)]
pub struct InMemoryRelay {
    hub: Arc<Mutex<Hub>>,
    refuse_connections: Arc<AtomicBool>,
    next_connection: Arc<AtomicU64>,
    connect_delay: Arc<Mutex<Option<Duration>>>,
}

impl InMemoryRelay {
    /// Create an empty relay
    pub fn new() -> Self {
        Self::default()
    }

    /// Client endpoint for one participant
    pub fn endpoint(&self) -> RelayEndpoint {
        RelayEndpoint {
            relay: self.clone(),
            connection: Mutex::new(None),
            inbound: tokio::sync::Mutex::new(None),
        }
    }

    /// Members currently connected to `room`
    pub fn members(&self, room: &RoomId) -> Vec<ParticipantId> {
        let hub = self.hub.lock();
        let mut ids: Vec<ParticipantId> = hub
            .rooms
            .get(room)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Close a member's connection without a `leave`
    ///
    /// Returns whether the member was connected.
    pub fn sever(&self, room: &RoomId, participant: &ParticipantId) -> bool {
        let mut hub = self.hub.lock();
        let removed = hub
            .rooms
            .get_mut(room)
            .and_then(|members| members.remove(participant))
            .is_some();
        if removed {
            tracing::debug!(room = %room, participant = %participant, "Relay severed member");
        }
        removed
    }

    /// Refuse or accept new connections
    pub fn set_available(&self, available: bool) {
        self.refuse_connections.store(!available, Ordering::SeqCst);
    }

    /// Hold every following `connect` for `delay` after the member is registered
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *self.connect_delay.lock() = delay;
    }

    /// Number of offers relayed from `from` to `to`
    pub fn offers_between(&self, from: &ParticipantId, to: &ParticipantId) -> usize {
        self.hub
            .lock()
            .log
            .iter()
            .filter(|(_, m)| {
                matches!(m, SignalingMessage::Offer { from_id, to_id, .. } if from_id == from && to_id == to)
            })
            .count()
    }

    /// Every message relayed so far, in relay order
    pub fn message_log(&self) -> Vec<SignalingMessage> {
        self.hub.lock().log.iter().map(|(_, m)| m.clone()).collect()
    }

    fn register(
        &self,
        room: &RoomId,
        info: &ParticipantInfo,
    ) -> Result<(u64, mpsc::UnboundedReceiver<SignalingMessage>, Vec<ParticipantInfo>), RelayError>
    {
        if self.refuse_connections.load(Ordering::SeqCst) {
            return Err(RelayError::Unavailable);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);

        let mut hub = self.hub.lock();
        let members = hub.rooms.entry(room.clone()).or_default();
        let roster = members
            .values()
            .filter(|m| m.info.id != info.id)
            .map(|m| m.info.clone())
            .collect();
        members.insert(
            info.id.clone(),
            Member {
                info: info.clone(),
                connection,
                tx,
            },
        );
        Ok((connection, rx, roster))
    }

    fn unregister(&self, room: &RoomId, id: &ParticipantId, connection: u64) {
        let mut hub = self.hub.lock();
        if let Some(members) = hub.rooms.get_mut(room) {
            if members.get(id).is_some_and(|m| m.connection == connection) {
                members.remove(id);
            }
            if members.is_empty() {
                hub.rooms.remove(room);
            }
        }
    }

    fn route(
        &self,
        room: &RoomId,
        sender: &ParticipantId,
        connection: u64,
        message: SignalingMessage,
    ) -> Result<(), RelayError> {
        let mut hub = self.hub.lock();
        let Some(members) = hub.rooms.get_mut(room) else {
            return Err(RelayError::NotConnected);
        };
        if !members.get(sender).is_some_and(|m| m.connection == connection) {
            return Err(RelayError::NotConnected);
        }

        if let Some(info) = message.participant_info() {
            if let Some(member) = members.get_mut(sender) {
                member.info = info;
            }
        }

        match message.recipient() {
            Some(to) => {
                if let Some(member) = members.get(to) {
                    let _ = member.tx.send(message.clone());
                } else {
                    tracing::trace!(to = %to, "Relay dropping message for absent member");
                }
            }
            None => {
                for (id, member) in members.iter() {
                    if id != sender {
                        let _ = member.tx.send(message.clone());
                    }
                }
            }
        }
        hub.log.push((room.clone(), message));
        Ok(())
    }
}

struct Connection {
    room: RoomId,
    id: ParticipantId,
    connection: u64,
}

/// One participant's connection to an [`InMemoryRelay`]
pub struct RelayEndpoint {
    relay: InMemoryRelay,
    connection: Mutex<Option<Connection>>,
    inbound: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<SignalingMessage>>>,
}

#[async_trait]
impl SignalingTransport for RelayEndpoint {
    type Error = RelayError;

    async fn connect(
        &self,
        room: &RoomId,
        local: &ParticipantInfo,
    ) -> Result<Vec<ParticipantInfo>, RelayError> {
        let (connection, rx, roster) = self.relay.register(room, local)?;
        *self.inbound.lock().await = Some(rx);
        *self.connection.lock() = Some(Connection {
            room: room.clone(),
            id: local.id.clone(),
            connection,
        });
        let delay = *self.relay.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(roster)
    }

    async fn send_message(&self, message: SignalingMessage) -> Result<(), RelayError> {
        let (room, id, connection) = {
            let guard = self.connection.lock();
            let conn = guard.as_ref().ok_or(RelayError::NotConnected)?;
            (conn.room.clone(), conn.id.clone(), conn.connection)
        };
        self.relay.route(&room, &id, connection, message)
    }

    async fn receive_message(&self) -> Result<SignalingMessage, RelayError> {
        let mut inbound = self.inbound.lock().await;
        let rx = inbound.as_mut().ok_or(RelayError::NotConnected)?;
        match rx.recv().await {
            Some(message) => Ok(message),
            None => {
                *inbound = None;
                Err(RelayError::ConnectionDropped)
            }
        }
    }

    async fn disconnect(&self) {
        let conn = self.connection.lock().take();
        if let Some(conn) = conn {
            self.relay.unregister(&conn.room, &conn.id, conn.connection);
        }
        *self.inbound.lock().await = None;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::Role;

    fn info(id: &str) -> ParticipantInfo {
        ParticipantInfo::new(id, id.to_uppercase(), Role::Student)
    }

    #[tokio::test]
    async fn test_roster_excludes_self() {
        let relay = InMemoryRelay::new();
        let room = RoomId::new("r");
        let a = relay.endpoint();
        let b = relay.endpoint();

        assert!(a.connect(&room, &info("a")).await.unwrap().is_empty());
        let roster = b.connect(&room, &info("b")).await.unwrap();
        assert_eq!(roster, vec![info("a")]);
        assert_eq!(relay.members(&room).len(), 2);
    }

    #[tokio::test]
    async fn test_broadcast_and_directed_routing() {
        let relay = InMemoryRelay::new();
        let room = RoomId::new("r");
        let a = relay.endpoint();
        let b = relay.endpoint();
        let c = relay.endpoint();
        a.connect(&room, &info("a")).await.unwrap();
        b.connect(&room, &info("b")).await.unwrap();
        c.connect(&room, &info("c")).await.unwrap();

        a.send_message(SignalingMessage::join(&info("a"))).await.unwrap();
        let offer = SignalingMessage::Offer {
            from_id: "a".into(),
            to_id: "c".into(),
            sdp: "v=0".to_string(),
            negotiation_id: None,
        };
        a.send_message(offer.clone()).await.unwrap();

        assert!(matches!(b.receive_message().await.unwrap(), SignalingMessage::Join { .. }));
        assert!(matches!(c.receive_message().await.unwrap(), SignalingMessage::Join { .. }));
        assert_eq!(c.receive_message().await.unwrap(), offer);
        assert_eq!(relay.offers_between(&"a".into(), &"c".into()), 1);
    }

    #[tokio::test]
    async fn test_sever_drops_connection() {
        let relay = InMemoryRelay::new();
        let room = RoomId::new("r");
        let a = relay.endpoint();
        a.connect(&room, &info("a")).await.unwrap();

        assert!(relay.sever(&room, &"a".into()));
        assert_eq!(a.receive_message().await, Err(RelayError::ConnectionDropped));
        assert!(matches!(
            a.send_message(SignalingMessage::join(&info("a"))).await,
            Err(RelayError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_unavailable_relay_refuses() {
        let relay = InMemoryRelay::new();
        relay.set_available(false);
        let a = relay.endpoint();
        assert_eq!(
            a.connect(&RoomId::new("r"), &info("a")).await,
            Err(RelayError::Unavailable)
        );
    }

    #[tokio::test]
    async fn test_stale_disconnect_keeps_new_connection() {
        let relay = InMemoryRelay::new();
        let room = RoomId::new("r");
        let old = relay.endpoint();
        let new = relay.endpoint();
        old.connect(&room, &info("a")).await.unwrap();
        new.connect(&room, &info("a")).await.unwrap();

        old.disconnect().await;
        assert_eq!(relay.members(&room), vec![ParticipantId::new("a")]);
    }
}
