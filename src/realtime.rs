use std::collections::HashSet;

use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::connection::{Connector, DisconnectReason};
use crate::error::ClientError;
use crate::models::{ChatId, Message, Session, UserId};

/// Events pushed by the server.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    NewMessage(Message),
    #[serde(rename_all = "camelCase")]
    UserTyping { user_id: UserId, chat_id: ChatId },
    #[serde(rename_all = "camelCase")]
    UserStopTyping { user_id: UserId, chat_id: ChatId },
}

/// Events emitted by the client.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinChats(Vec<ChatId>),
    #[serde(rename_all = "camelCase")]
    SendMessage { chat_id: ChatId, content: String },
    #[serde(rename_all = "camelCase")]
    Typing { chat_id: ChatId },
    #[serde(rename_all = "camelCase")]
    StopTyping { chat_id: ChatId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Event(ServerEvent),
    Closed(DisconnectReason),
}

/// Handle to one open realtime channel.
pub struct RealtimeConnection {
    outgoing: mpsc::UnboundedSender<ClientEvent>,
    incoming: mpsc::UnboundedReceiver<Incoming>,
}

impl RealtimeConnection {
    pub fn new(
        outgoing: mpsc::UnboundedSender<ClientEvent>,
        incoming: mpsc::UnboundedReceiver<Incoming>,
    ) -> Self {
        RealtimeConnection { outgoing, incoming }
    }

    pub fn emit(&self, event: ClientEvent) -> Result<(), ClientError> {
        self.outgoing.send(event).map_err(|_| ClientError::NotConnected)
    }

    /// Next server event; a dropped reader counts as a transport failure.
    pub async fn next(&mut self) -> Incoming {
        match self.incoming.recv().await {
            Some(incoming) => incoming,
            None => {
                let detail = "connection task ended".to_string();
                Incoming::Closed(DisconnectReason::TransportFailure(detail))
            }
        }
    }
}

/// Chat rooms the connection has joined. Joining never removes anything.
#[derive(Debug, Default, Clone)]
pub struct RoomSubscriptions {
    joined: HashSet<ChatId>,
    order: Vec<ChatId>,
}

impl RoomSubscriptions {
    /// Records `ids` and returns the ones not joined before, in input order.
    pub fn join<I>(&mut self, ids: I) -> Vec<ChatId>
    where
        I: IntoIterator<Item = ChatId>,
    {
        let mut added = Vec::new();
        for id in ids {
            if self.joined.insert(id) {
                self.order.push(id);
                added.push(id);
            }
        }
        added
    }

    pub fn contains(&self, id: &ChatId) -> bool {
        self.joined.contains(id)
    }

    pub fn all(&self) -> Vec<ChatId> {
        self.order.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Opens WebSocket connections carrying JSON event frames.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        WsConnector { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WsConnector {
    type Connection = RealtimeConnection;

    async fn connect(&mut self, session: &Session) -> Result<RealtimeConnection, ClientError> {
        let mut request = self.url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", session.auth_token))
            .map_err(|_| {
                ClientError::Unauthorized("credential is not a valid header value".to_string())
            })?;
        request.headers_mut().insert("Authorization", bearer);

        let (stream, _) = connect_async(request).await?;
        debug!("WebSocket handshake with {} complete", self.url);
        let (mut sink, mut source) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Incoming>();

        tokio::spawn(async move {
            let written = async {
                while let Some(event) = out_rx.recv().await {
                    let json = serde_json::to_string(&event)?;
                    sink.send(WsMessage::Text(json)).await?;
                }
                Ok::<(), anyhow::Error>(())
            };
            if let Err(e) = written.await {
                warn!("Realtime writer stopped: {}", e);
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            loop {
                let closed = match source.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<ServerEvent>(&text) {
                            Ok(event) => {
                                if in_tx.send(Incoming::Event(event)).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("Skipping unrecognized frame: {}", e),
                        }
                        continue;
                    }
                    Some(Ok(WsMessage::Close(_))) => DisconnectReason::PeerInitiated,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => DisconnectReason::TransportFailure(e.to_string()),
                    None => DisconnectReason::TransportFailure("stream ended".to_string()),
                };
                let _ = in_tx.send(Incoming::Closed(closed));
                break;
            }
        });

        Ok(RealtimeConnection::new(out_tx, in_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn test_server_event_wire_format() {
        let user = Uuid::new_v4();
        let chat = Uuid::new_v4();
        let json = format!(
            r#"{{"event":"user-typing","data":{{"userId":"{user}","chatId":"{chat}"}}}}"#
        );
        let event: ServerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, ServerEvent::UserTyping { user_id: user, chat_id: chat });

        let message = Message {
            id: Uuid::new_v4(),
            chat_id: chat,
            sender_id: user,
            sender_name: None,
            content: "hello".into(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(ServerEvent::NewMessage(message.clone())).unwrap();
        assert_eq!(json["event"], "new-message");
        assert_eq!(json["data"]["content"], "hello");
    }

    #[test]
    fn test_client_event_wire_format() {
        let chat = Uuid::new_v4();
        let join = serde_json::to_value(ClientEvent::JoinChats(vec![chat])).unwrap();
        assert_eq!(join["event"], "join-chats");
        assert_eq!(join["data"][0], chat.to_string());

        let send = serde_json::to_value(ClientEvent::SendMessage {
            chat_id: chat,
            content: "hi".into(),
        })
        .unwrap();
        assert_eq!(send["event"], "send-message");
        assert_eq!(send["data"]["chatId"], chat.to_string());

        let stop = serde_json::to_value(ClientEvent::StopTyping { chat_id: chat }).unwrap();
        assert_eq!(stop["event"], "stop-typing");
    }

    #[test]
    fn test_joining_is_additive() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut rooms = RoomSubscriptions::default();
        assert_eq!(rooms.join([a, b]), vec![a, b]);
        assert_eq!(rooms.join([b, c]), vec![c]);
        assert!(rooms.join([a]).is_empty());
        assert_eq!(rooms.all(), vec![a, b, c]);
        assert!(rooms.contains(&b));
    }

    #[tokio::test]
    async fn test_dropped_reader_reads_as_transport_failure() {
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let mut connection = RealtimeConnection::new(out_tx, in_rx);
        drop(in_tx);
        assert!(matches!(
            connection.next().await,
            Incoming::Closed(DisconnectReason::TransportFailure(_))
        ));
    }
}
