//! WebSocket signaling relay client
//!
//! Connects to an external relay server over WebSocket. The first frame sent
//! is a `hello` naming the room and participant; the relay answers with a
//! `roster` of the members already present. After that every text frame is a
//! JSON [`SignalingMessage`] in either direction.

use crate::config::SignalingConfig;
use crate::identity::{ParticipantInfo, RoomId};
use crate::signaling::{SignalingMessage, SignalingTransport};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// WebSocket relay errors
#[derive(Error, Debug)]
pub enum WsRelayError {
    /// WebSocket failure
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Relay did not complete the hello/roster exchange
    #[error("Relay handshake failed: {0}")]
    Handshake(String),

    /// Frame could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No open connection
    #[error("Not connected to relay")]
    NotConnected,

    /// Relay closed the connection
    #[error("Relay connection dropped")]
    ConnectionDropped,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum RelayFrame {
    Hello {
        room: RoomId,
        participant: ParticipantInfo,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    Roster {
        participants: Vec<ParticipantInfo>,
    },
}

struct Link {
    outgoing: mpsc::UnboundedSender<Message>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

/// [`SignalingTransport`] over a WebSocket relay
pub struct WebSocketRelay {
    endpoint: String,
    token: Option<String>,
    link: Mutex<Option<Link>>,
    incoming: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<SignalingMessage>>>,
}

impl WebSocketRelay {
    /// Create a client for the relay described by `config`
    pub fn new(config: &SignalingConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            token: config.token.clone(),
            link: Mutex::new(None),
            incoming: tokio::sync::Mutex::new(None),
        }
    }

    fn close_link(&self) {
        if let Some(link) = self.link.lock().take() {
            let _ = link.outgoing.send(Message::Close(None));
            link.reader.abort();
            // Writer exits after flushing the close frame
            drop(link.writer);
        }
    }
}

#[async_trait]
impl SignalingTransport for WebSocketRelay {
    type Error = WsRelayError;

    #[tracing::instrument(skip(self, local), fields(endpoint = %self.endpoint, room = %room))]
    async fn connect(
        &self,
        room: &RoomId,
        local: &ParticipantInfo,
    ) -> Result<Vec<ParticipantInfo>, WsRelayError> {
        self.close_link();

        let (ws_stream, _) = connect_async(self.endpoint.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        let hello = RelayFrame::Hello {
            room: room.clone(),
            participant: local.clone(),
            token: self.token.clone(),
        };
        write.send(Message::Text(serde_json::to_string(&hello)?)).await?;

        let roster = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            while let Some(frame) = read.next().await {
                match frame? {
                    Message::Text(text) => {
                        return match serde_json::from_str::<RelayFrame>(&text) {
                            Ok(RelayFrame::Roster { participants }) => Ok(participants),
                            Ok(other) => Err(WsRelayError::Handshake(format!(
                                "unexpected frame {other:?}"
                            ))),
                            Err(e) => Err(WsRelayError::Handshake(e.to_string())),
                        };
                    }
                    Message::Close(_) => return Err(WsRelayError::ConnectionDropped),
                    _ => {}
                }
            }
            Err(WsRelayError::ConnectionDropped)
        })
        .await
        .map_err(|_| WsRelayError::Handshake("timed out waiting for roster".to_string()))??;

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = write.send(message).await {
                    tracing::debug!(error = %e, "Relay write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match SignalingMessage::from_json(&text) {
                        Ok(message) => {
                            if incoming_tx.send(message).is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "Ignoring malformed relay frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(error = %e, "Relay read failed");
                        break;
                    }
                }
            }
        });

        *self.incoming.lock().await = Some(incoming_rx);
        *self.link.lock() = Some(Link {
            outgoing: outgoing_tx,
            writer,
            reader,
        });

        tracing::debug!(members = roster.len(), "Relay handshake complete");
        Ok(roster)
    }

    async fn send_message(&self, message: SignalingMessage) -> Result<(), WsRelayError> {
        let text = serde_json::to_string(&message)?;
        let link = self.link.lock();
        let link = link.as_ref().ok_or(WsRelayError::NotConnected)?;
        link.outgoing
            .send(Message::Text(text))
            .map_err(|_| WsRelayError::ConnectionDropped)
    }

    async fn receive_message(&self) -> Result<SignalingMessage, WsRelayError> {
        let mut incoming = self.incoming.lock().await;
        let rx = incoming.as_mut().ok_or(WsRelayError::NotConnected)?;
        match rx.recv().await {
            Some(message) => Ok(message),
            None => {
                *incoming = None;
                Err(WsRelayError::ConnectionDropped)
            }
        }
    }

    async fn disconnect(&self) {
        self.close_link();
        *self.incoming.lock().await = None;
    }
}

impl Drop for WebSocketRelay {
    fn drop(&mut self) {
        if let Some(link) = self.link.lock().take() {
            link.reader.abort();
            link.writer.abort();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::Role;

    #[test]
    fn test_hello_frame_shape() {
        let hello = RelayFrame::Hello {
            room: RoomId::new("math"),
            participant: ParticipantInfo::new("alice", "Alice", Role::Teacher),
            token: None,
        };
        let json: serde_json::Value = serde_json::to_value(&hello).unwrap();
        assert_eq!(json["type"], "hello");
        assert_eq!(json["room"], "math");
        assert_eq!(json["participant"]["displayName"], "Alice");
        assert!(json.get("token").is_none());
    }

    #[test]
    fn test_roster_frame_parses() {
        let text = r#"{"type":"roster","participants":[{"id":"bob","displayName":"Bob","role":"student"}]}"#;
        match serde_json::from_str::<RelayFrame>(text).unwrap() {
            RelayFrame::Roster { participants } => {
                assert_eq!(participants.len(), 1);
                assert_eq!(participants[0].id.as_str(), "bob");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_without_connection() {
        let relay = WebSocketRelay::new(&SignalingConfig::default());
        let result = relay
            .send_message(SignalingMessage::Leave {
                participant_id: "alice".into(),
            })
            .await;
        assert!(matches!(result, Err(WsRelayError::NotConnected)));
    }
}
