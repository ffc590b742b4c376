//! One live chat participant.
//!
//! A connection runs two pumps over its transport. The read pump turns inbound
//! frames into stamped [`WireMessage`]s and hands them to the hub; the write
//! pump drains the bounded outbound queue to the socket. Whichever pump ends
//! first cancels the other, and the read side performs the single
//! unregistration. When the peer closes, the write pump gets a short grace
//! period to answer with its own Close frame.

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, close_code};
use futures::{Sink, SinkExt, Stream, StreamExt};
use log::{debug, info, warn};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;

use super::config::ChatConfig;
use super::hub::{ChatHub, ConnectionHandle, ConnectionId, HubError, Outbound, encode};
use super::types::{Identity, InboundFrame, WireMessage};
use crate::history::{HistoryStore, NewMessage};

/// How long a peer-initiated close waits for the reply Close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Result of a direct send.
#[derive(Debug, Clone)]
pub struct DirectDelivery {
    /// Whether the recipient had a live connection that accepted the message.
    pub delivered: bool,
    pub message: WireMessage,
}

/// Persist a direct message, then deliver it to the recipient and echo it to
/// the sender. History failures are logged and do not block delivery.
pub async fn send_direct(
    hub: &ChatHub,
    history: &dyn HistoryStore,
    sender: &Identity,
    recipient_id: &str,
    text: String,
) -> Result<DirectDelivery, HubError> {
    let message = WireMessage::from_sender(sender, text);
    let record = NewMessage {
        sender_id: sender.user_id.clone(),
        receiver_id: recipient_id.to_string(),
        message: message.message.clone(),
        timestamp: message.timestamp.clone(),
    };
    if let Err(e) = history.append(record).await {
        warn!(
            "Failed to persist message {} from {} to {}: {:#}",
            message.id, sender.user_id, recipient_id, e
        );
    }

    let payload = match encode(&message) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Failed to serialize message {}: {}", message.id, e);
            return Ok(DirectDelivery {
                delivered: false,
                message,
            });
        }
    };

    let delivered = hub.send_to(recipient_id, payload.clone()).await?;
    if recipient_id != sender.user_id {
        hub.send_to(&sender.user_id, payload).await?;
    }
    debug!(
        "Direct message {} from {} to {} (delivered: {})",
        message.id, sender.user_id, recipient_id, delivered
    );

    Ok(DirectDelivery { delivered, message })
}

/// A connection that has not started pumping yet.
pub struct Connection {
    id: ConnectionId,
    identity: Identity,
    outbound: mpsc::Receiver<Outbound>,
    hub: ChatHub,
    history: Arc<dyn HistoryStore>,
    ping_interval: Option<Duration>,
}

impl Connection {
    /// Create a connection and the handle to register with the hub.
    pub fn new(
        identity: Identity,
        hub: ChatHub,
        history: Arc<dyn HistoryStore>,
        config: &ChatConfig,
    ) -> (Self, ConnectionHandle) {
        let (handle, outbound) = ConnectionHandle::channel(identity.clone(), config.outbound_buffer);
        let conn = Self {
            id: handle.id(),
            identity,
            outbound,
            hub,
            history,
            ping_interval: config.ping_interval(),
        };
        (conn, handle)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Run both pumps over an upgraded websocket until the connection ends.
    pub async fn run(self, socket: WebSocket) {
        let (sink, stream) = socket.split();
        self.run_with(sink, stream).await;
    }

    /// Run both pumps over any message sink and stream.
    pub async fn run_with<S, R, E>(self, sink: S, stream: R)
    where
        S: Sink<Message> + Unpin + Send + 'static,
        S::Error: Display,
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let Connection {
            id,
            identity,
            outbound,
            hub,
            history,
            ping_interval,
        } = self;

        info!("Chat connection {} open for user {}", id, identity.user_id);
        let cancel = CancellationToken::new();

        let mut writer = tokio::spawn(write_pump(
            sink,
            outbound,
            ping_interval,
            cancel.clone(),
            identity.user_id.clone(),
        ));

        let reader = ReadPump {
            identity: &identity,
            hub: &hub,
            history: history.as_ref(),
        };
        let end = reader.run(stream, &cancel).await;

        if let Err(e) = hub.unregister(&identity.user_id, id).await {
            warn!("Failed to unregister connection {}: {}", id, e);
        }
        // Unregistering drops the queue, so the write pump flushes what is
        // left and replies with a Close frame.
        let joined = match end {
            ReadEnd::PeerClosed => tokio::time::timeout(CLOSE_GRACE, &mut writer).await.ok(),
            ReadEnd::Stopped => None,
        };
        let joined = match joined {
            Some(joined) => joined,
            None => {
                cancel.cancel();
                writer.await
            }
        };
        if let Err(e) = joined {
            warn!("Write pump for connection {} panicked: {}", id, e);
        }
        info!("Chat connection {} closed for user {}", id, identity.user_id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadEnd {
    PeerClosed,
    Stopped,
}

struct ReadPump<'a> {
    identity: &'a Identity,
    hub: &'a ChatHub,
    history: &'a dyn HistoryStore,
}

impl ReadPump<'_> {
    async fn run<R, E>(&self, mut stream: R, cancel: &CancellationToken) -> ReadEnd
    where
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let user_id = &self.identity.user_id;
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Read pump for user {} cancelled", user_id);
                    return ReadEnd::Stopped;
                }
                frame = stream.next() => frame,
            };

            match frame {
                Some(Ok(Message::Text(text))) => {
                    let frame = match InboundFrame::parse(text.as_str()) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!("{} from user {}, closing", e, user_id);
                            return ReadEnd::Stopped;
                        }
                    };
                    if let Err(e) = self.forward(frame).await {
                        warn!("Dropping message from user {}: {}", user_id, e);
                        return ReadEnd::Stopped;
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    warn!("Malformed binary frame from user {}, closing", user_id);
                    return ReadEnd::Stopped;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) => {
                    debug!("User {} closed the connection", user_id);
                    return ReadEnd::PeerClosed;
                }
                Some(Err(e)) => {
                    warn!("Transport error for user {}: {}", user_id, e);
                    return ReadEnd::Stopped;
                }
                None => return ReadEnd::Stopped,
            }
        }
    }

    /// Direct messages are recorded in history; broadcasts have no receiver
    /// and are not.

    async fn forward(&self, frame: InboundFrame) -> Result<(), HubError> {
        match frame.to {
            Some(to) => {
                send_direct(self.hub, self.history, self.identity, &to, frame.message).await?;
                Ok(())
            }
            None => {
                let message = WireMessage::from_sender(self.identity, frame.message);
                match encode(&message) {
                    Ok(payload) => self.hub.broadcast(payload).await,
                    Err(e) => {
                        warn!("Failed to serialize message {}: {}", message.id, e);
                        Ok(())
                    }
                }
            }
        }
    }
}

async fn write_pump<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<Outbound>,
    ping_interval: Option<Duration>,
    cancel: CancellationToken,
    user_id: String,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let period = ping_interval.unwrap_or(Duration::from_secs(3600));
    let mut ticker = interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = outbound.recv() => match next {
                Some(payload) => {
                    if let Err(e) = sink.send(Message::Text(payload.to_string().into())).await {
                        warn!("Write to user {} failed: {}", user_id, e);
                        break;
                    }
                }
                None => {
                    debug!("Outbound queue for user {} closed", user_id);
                    let frame = CloseFrame {
                        code: close_code::NORMAL,
                        reason: Utf8Bytes::from_static("connection closed"),
                    };
                    // Best effort; the peer may already be gone.
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
            },
            _ = ticker.tick(), if ping_interval.is_some() => {
                if let Err(e) = sink.send(Message::Ping(Bytes::new())).await {
                    warn!("Ping to user {} failed: {}", user_id, e);
                    break;
                }
            }
        }
    }

    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::chat::hub::DEFAULT_HUB_BUFFER;
    use crate::db::Database;
    use crate::history::{SqliteHistoryStore, StoredMessage};
    use async_trait::async_trait;
    use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};
    use std::io;

    type Inbound = UnboundedSender<Result<Message, io::Error>>;

    struct FailingHistory;

    #[async_trait]
    impl HistoryStore for FailingHistory {
        async fn append(&self, _message: NewMessage) -> anyhow::Result<StoredMessage> {
            anyhow::bail!("disk full")
        }

        async fn find_between(&self, _a: &str, _b: &str) -> anyhow::Result<Vec<StoredMessage>> {
            Ok(vec![])
        }
    }

    fn config() -> ChatConfig {
        ChatConfig {
            ping_interval_secs: 0,
            ..ChatConfig::default()
        }
    }

    fn patient() -> Identity {
        Identity::new("patient-1", "Pat", Role::Patient)
    }

    fn nurse() -> Identity {
        Identity::new("nurse-1", "Nina", Role::Nurse)
    }

    async fn sqlite_history() -> Arc<SqliteHistoryStore> {
        let db = Database::in_memory().await.unwrap();
        Arc::new(SqliteHistoryStore::new(db.pool().clone()))
    }

    /// Register a connection for `identity` and start it on in-memory channels.
    async fn start(
        hub: &ChatHub,
        history: Arc<dyn HistoryStore>,
        identity: Identity,
    ) -> (
        Inbound,
        UnboundedReceiver<Message>,
        tokio::task::JoinHandle<()>,
    ) {
        let (conn, handle) = Connection::new(identity, hub.clone(), history, &config());
        hub.register(handle).await.unwrap();
        let (in_tx, in_rx) = unbounded();
        let (out_tx, out_rx) = unbounded();
        let task = tokio::spawn(conn.run_with(out_tx, in_rx));
        (in_tx, out_rx, task)
    }

    fn text(s: &str) -> Result<Message, io::Error> {
        Ok(Message::Text(s.to_string().into()))
    }

    fn wire(payload: &Outbound) -> WireMessage {
        serde_json::from_str(payload).unwrap()
    }

    async fn next_text(out: &mut UnboundedReceiver<Message>) -> WireMessage {
        loop {
            match out.next().await {
                Some(Message::Text(t)) => return serde_json::from_str(t.as_str()).unwrap(),
                Some(_) => continue,
                None => panic!("outbound stream ended"),
            }
        }
    }

    #[tokio::test]
    async fn test_messages_are_stamped_with_connection_identity() {
        let hub = ChatHub::spawn(DEFAULT_HUB_BUFFER);
        let (observer, mut observer_rx) = ConnectionHandle::channel(nurse(), 16);
        hub.register(observer).await.unwrap();

        let (inbound, _out, task) = start(&hub, sqlite_history().await, patient()).await;
        inbound
            .unbounded_send(text(r#"{"message":"hello","sender_id":"someone-else"}"#))
            .unwrap();

        let msg = wire(&observer_rx.recv().await.unwrap());
        assert_eq!(msg.message, "hello");
        assert_eq!(msg.sender_id, "patient-1");
        assert_eq!(msg.sender_name, "Pat");
        assert_eq!(msg.sender_role, "PATIENT");

        drop(inbound);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_per_connection_fifo() {
        let hub = ChatHub::spawn(DEFAULT_HUB_BUFFER);
        let (observer, mut observer_rx) = ConnectionHandle::channel(nurse(), 64);
        hub.register(observer).await.unwrap();

        let (inbound, _out, task) = start(&hub, sqlite_history().await, patient()).await;
        for i in 0..20 {
            inbound.unbounded_send(text(&format!("m{i}"))).unwrap();
        }
        drop(inbound);
        task.await.unwrap();

        for i in 0..20 {
            let msg = wire(&observer_rx.recv().await.unwrap());
            assert_eq!(msg.message, format!("m{i}"));
        }
        assert!(!hub.is_online("patient-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_binary_frame_terminates_and_unregisters() {
        let hub = ChatHub::spawn(DEFAULT_HUB_BUFFER);
        let (observer, mut observer_rx) = ConnectionHandle::channel(nurse(), 16);
        hub.register(observer).await.unwrap();

        let (inbound, _out, task) = start(&hub, sqlite_history().await, patient()).await;
        inbound
            .unbounded_send(Ok(Message::Binary(Bytes::from_static(b"\x00\x01"))))
            .unwrap();
        inbound.unbounded_send(text("after")).unwrap();
        task.await.unwrap();

        let online: Vec<_> = hub
            .online()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.user_id)
            .collect();
        assert_eq!(online, vec!["nurse-1"]);
        assert!(observer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_json_frame_terminates_without_delivery() {
        let hub = ChatHub::spawn(DEFAULT_HUB_BUFFER);
        let history = sqlite_history().await;
        let (observer, mut observer_rx) = ConnectionHandle::channel(nurse(), 16);
        hub.register(observer).await.unwrap();

        let (inbound, _out, task) = start(&hub, history.clone(), patient()).await;
        inbound
            .unbounded_send(text(r#"{"message":"my HIV result","to":42}"#))
            .unwrap();
        inbound.unbounded_send(text("after")).unwrap();
        task.await.unwrap();

        assert!(!hub.is_online("patient-1").await.unwrap());
        assert!(observer_rx.try_recv().is_err());
        assert!(
            history
                .find_between("patient-1", "nurse-1")
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_blank_recipient_terminates() {
        let hub = ChatHub::spawn(DEFAULT_HUB_BUFFER);
        let history = sqlite_history().await;
        let (observer, mut observer_rx) = ConnectionHandle::channel(nurse(), 16);
        hub.register(observer).await.unwrap();

        let (inbound, _out, task) = start(&hub, history.clone(), patient()).await;
        inbound
            .unbounded_send(text(r#"{"message":"x","to":""}"#))
            .unwrap();
        task.await.unwrap();

        assert!(!hub.is_online("patient-1").await.unwrap());
        assert!(observer_rx.try_recv().is_err());
        assert!(history.find_between("patient-1", "").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_peer_close_gets_close_reply() {
        let hub = ChatHub::spawn(DEFAULT_HUB_BUFFER);
        let (inbound, mut out, task) = start(&hub, sqlite_history().await, patient()).await;
        inbound.unbounded_send(Ok(Message::Close(None))).unwrap();
        task.await.unwrap();

        let mut last = None;
        while let Some(msg) = out.next().await {
            last = Some(msg);
        }
        match last {
            Some(Message::Close(Some(frame))) => assert_eq!(frame.code, close_code::NORMAL),
            other => panic!("expected close frame, got {other:?}"),
        }
        assert!(hub.online().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transport_error_terminates() {
        let hub = ChatHub::spawn(DEFAULT_HUB_BUFFER);
        let (inbound, _out, task) = start(&hub, sqlite_history().await, patient()).await;
        inbound
            .unbounded_send(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
            .unwrap();
        task.await.unwrap();
        assert!(hub.online().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_superseded_connection_gets_close_frame() {
        let hub = ChatHub::spawn(DEFAULT_HUB_BUFFER);
        let history = sqlite_history().await;
        let (_inbound, mut out, task) = start(&hub, history.clone(), patient()).await;

        // Same identity connects again; the first connection's queue closes.
        let (replacement, _replacement_rx) = ConnectionHandle::channel(patient(), 16);
        hub.register(replacement).await.unwrap();

        task.await.unwrap();
        let mut last = None;
        while let Some(msg) = out.next().await {
            last = Some(msg);
        }
        match last {
            Some(Message::Close(Some(frame))) => assert_eq!(frame.code, close_code::NORMAL),
            other => panic!("expected close frame, got {other:?}"),
        }

        // The late unregister from the old connection left the new one alone.
        assert!(hub.is_online("patient-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_direct_message_persisted_delivered_and_echoed() {
        let hub = ChatHub::spawn(DEFAULT_HUB_BUFFER);
        let history = sqlite_history().await;
        let (nurse_handle, mut nurse_rx) = ConnectionHandle::channel(nurse(), 16);
        hub.register(nurse_handle).await.unwrap();

        let (inbound, mut out, task) = start(&hub, history.clone(), patient()).await;
        inbound
            .unbounded_send(text(r#"{"message":"my leg hurts","to":"nurse-1"}"#))
            .unwrap();

        let delivered = wire(&nurse_rx.recv().await.unwrap());
        assert_eq!(delivered.message, "my leg hurts");
        assert_eq!(delivered.sender_id, "patient-1");

        let echoed = next_text(&mut out).await;
        assert_eq!(echoed, delivered);

        let stored = history.find_between("patient-1", "nurse-1").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].message, "my leg hurts");
        assert_eq!(stored[0].timestamp, delivered.timestamp);

        drop(inbound);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_history_failure_does_not_block_delivery() {
        let hub = ChatHub::spawn(DEFAULT_HUB_BUFFER);
        let (nurse_handle, mut nurse_rx) = ConnectionHandle::channel(nurse(), 16);
        hub.register(nurse_handle).await.unwrap();

        let result = send_direct(
            &hub,
            &FailingHistory,
            &patient(),
            "nurse-1",
            "still here".to_string(),
        )
        .await
        .unwrap();

        assert!(result.delivered);
        assert_eq!(wire(&nurse_rx.recv().await.unwrap()).message, "still here");
    }

    #[tokio::test]
    async fn test_direct_to_offline_user() {
        let hub = ChatHub::spawn(DEFAULT_HUB_BUFFER);
        let history = sqlite_history().await;
        let result = send_direct(
            &hub,
            history.as_ref(),
            &patient(),
            "nurse-9",
            "anyone?".to_string(),
        )
        .await
        .unwrap();

        assert!(!result.delivered);
        // Still recorded for later retrieval.
        assert_eq!(
            history.find_between("nurse-9", "patient-1").await.unwrap().len(),
            1
        );
    }
}
