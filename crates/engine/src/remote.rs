//! Client side of the relay protocol: an [`EventChannel`] and
//! [`SessionLifecycle`] backed by one WebSocket to `tandem-server`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tandem_protocol::{
    AckResult, CallSession, ClientFrame, ErrorCode, MirrorEvent, MirrorKind, MirrorSession,
    NewCall, Role, ServerFrame, SignalKind, SignalMessage, StreamRecord, Topic,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{EventChannel, Subscription};
use crate::error::{ChannelError, SessionError};
use crate::lifecycle::SessionLifecycle;

type Reply = Result<AckResult, ChannelError>;

enum Fanout {
    Mirror {
        tx: broadcast::Sender<MirrorEvent>,
        last_snapshot: Option<MirrorEvent>,
    },
    Signal(broadcast::Sender<SignalMessage>),
}

enum Join<T> {
    Fresh(broadcast::Receiver<T>),
    Shared(broadcast::Receiver<T>, Option<T>),
    Mismatch,
}

struct TopicEntry {
    fanout: Fanout,
    refs: usize,
}

struct Shared {
    outgoing: mpsc::UnboundedSender<String>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    topics: Mutex<HashMap<Topic, TopicEntry>>,
    next_request: AtomicU64,
    capacity: usize,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Reply>>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<Topic, TopicEntry>> {
        self.topics.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn next_request_id(&self) -> u64 {
        self.next_request.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn send(&self, frame: &ClientFrame) -> Result<(), ChannelError> {
        let text = serde_json::to_string(frame)
            .map_err(|e| ChannelError::Transport(format!("failed to encode frame: {e}")))?;
        self.outgoing.send(text).map_err(|_| ChannelError::Closed)
    }

    fn dispatch(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::Ack { request_id, result } => self.resolve(request_id, Ok(result)),
            ServerFrame::Error {
                request_id: Some(request_id),
                code,
                message,
            } => self.resolve(request_id, Err(ChannelError::Rejected { code, message })),
            ServerFrame::Error {
                request_id: None,
                code,
                message,
            } => warn!(?code, "Relay error: {message}"),
            ServerFrame::Record { record } => self.deliver(record),
            ServerFrame::Closed { topic } => {
                // Dropping the fanout ends every local subscription on the topic
                if self.topics().remove(&topic).is_some() {
                    info!(?topic, "Session stream closed by relay");
                }
            }
        }
    }

    fn resolve(&self, request_id: u64, reply: Reply) {
        match self.pending().remove(&request_id) {
            Some(waiter) => {
                let _ = waiter.send(reply);
            }
            None => debug!(request_id, "Reply for a request nobody is waiting on"),
        }
    }

    fn deliver(&self, record: StreamRecord) {
        let topic = record.topic();
        let mut topics = self.topics();
        let Some(entry) = topics.get_mut(&topic) else {
            debug!(?topic, "Record for a topic without subscribers");
            return;
        };
        // Send errors only mean no local receiver is currently attached
        match (&mut entry.fanout, record) {
            (Fanout::Mirror { tx, last_snapshot }, StreamRecord::Mirror(event)) => {
                if event.kind == MirrorKind::Snapshot {
                    *last_snapshot = Some(event.clone());
                }
                let _ = tx.send(event);
            }
            (Fanout::Signal(tx), StreamRecord::Signal(message)) => {
                let _ = tx.send(message);
            }
            _ => warn!(?topic, "Record stream does not match its topic"),
        }
    }

    fn release(self: &Arc<Self>, topic: Topic) {
        let last = {
            let mut topics = self.topics();
            match topics.get_mut(&topic) {
                Some(entry) if entry.refs > 1 => {
                    entry.refs -= 1;
                    false
                }
                Some(_) => {
                    topics.remove(&topic);
                    true
                }
                None => false,
            }
        };
        if last {
            let frame = ClientFrame::Unsubscribe {
                request_id: self.next_request_id(),
                topic,
            };
            if self.send(&frame).is_ok() {
                debug!(?topic, "Unsubscribed");
            }
        }
    }

    fn shutdown(&self) {
        // Dropping the waiters and senders wakes everyone with `Closed`
        self.pending().clear();
        self.topics().clear();
    }
}

/// Connection to a relay. Clones share the socket.
#[derive(Clone)]
pub struct RemoteChannel {
    shared: Arc<Shared>,
}

impl RemoteChannel {
    /// Connect to `{server_url}/ws?token=…`. `server_url` is a `ws://` or
    /// `wss://` base URL.
    pub async fn connect(
        server_url: &str,
        token: &str,
        max_message_bytes: usize,
        capacity: usize,
    ) -> Result<Self, ChannelError> {
        let url = format!(
            "{}/ws?token={}",
            server_url.trim_end_matches('/'),
            urlencoding::encode(token)
        );
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(max_message_bytes);
        let (ws_stream, _) =
            tokio_tungstenite::connect_async_with_config(&url, Some(ws_config), false)
                .await
                .map_err(|e| ChannelError::Transport(format!("WebSocket connection failed: {e}")))?;
        info!(url = server_url, "Connected to relay");

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
        let shared = Arc::new(Shared {
            outgoing,
            pending: Mutex::new(HashMap::new()),
            topics: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(0),
            capacity: capacity.max(1),
        });

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let writer = Arc::downgrade(&shared);
        tokio::spawn(async move {
            while let Some(text) = outgoing_rx.recv().await {
                if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                    warn!("Relay send failed: {e}");
                    if let Some(shared) = writer.upgrade() {
                        shared.shutdown();
                    }
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        let reader = Arc::downgrade(&shared);
        tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                let Some(shared) = reader.upgrade() else {
                    break;
                };
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(frame) => shared.dispatch(frame),
                        Err(e) => warn!("Invalid frame from relay: {e}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Relay connection error: {e}");
                        break;
                    }
                }
            }
            if let Some(shared) = reader.upgrade() {
                shared.shutdown();
            }
            info!("Relay connection closed");
        });

        Ok(Self { shared })
    }

    async fn request(&self, build: impl FnOnce(u64) -> ClientFrame) -> Reply {
        let request_id = self.shared.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.shared.pending().insert(request_id, tx);
        if let Err(e) = self.shared.send(&build(request_id)) {
            self.shared.pending().remove(&request_id);
            return Err(e);
        }
        rx.await.map_err(|_| ChannelError::Closed)?
    }

    async fn session_request(
        &self,
        build: impl FnOnce(u64) -> ClientFrame,
    ) -> Result<AckResult, SessionError> {
        self.request(build).await.map_err(|e| match e {
            ChannelError::Rejected { code, message } => SessionError::Remote { code, message },
            other => SessionError::Remote {
                code: ErrorCode::Internal,
                message: other.to_string(),
            },
        })
    }

    /// Join `topic` on the relay, or share an existing local subscription.
    async fn join<T: Clone>(
        &self,
        topic: Topic,
        attach: impl FnOnce(&mut Fanout) -> Option<(broadcast::Receiver<T>, Option<T>)>,
        create: impl FnOnce(usize) -> (Fanout, broadcast::Receiver<T>),
    ) -> Result<Subscription<T>, ChannelError> {
        let joined = {
            let mut topics = self.shared.topics();
            match topics.get_mut(&topic) {
                Some(entry) => match attach(&mut entry.fanout) {
                    Some((rx, replay)) => {
                        entry.refs += 1;
                        Join::Shared(rx, replay)
                    }
                    None => Join::Mismatch,
                },
                None => {
                    let (fanout, rx) = create(self.shared.capacity);
                    topics.insert(topic, TopicEntry { fanout, refs: 1 });
                    Join::Fresh(rx)
                }
            }
        };
        match joined {
            Join::Fresh(rx) => self.subscribe_remote(topic, rx).await,
            Join::Shared(rx, replay) => {
                let shared = Arc::clone(&self.shared);
                Ok(Subscription::new(topic, rx)
                    .with_replay(replay)
                    .on_release(move || shared.release(topic)))
            }
            Join::Mismatch => Err(ChannelError::Transport(format!(
                "topic {topic:?} is bound to another stream"
            ))),
        }
    }

    async fn subscribe_remote<T: Clone>(
        &self,
        topic: Topic,
        rx: broadcast::Receiver<T>,
    ) -> Result<Subscription<T>, ChannelError> {
        let result = self
            .request(|request_id| ClientFrame::Subscribe { request_id, topic })
            .await;
        let shared = Arc::clone(&self.shared);
        match result {
            Ok(AckResult::Subscribed) => {
                debug!(?topic, "Subscribed");
                Ok(Subscription::new(topic, rx).on_release(move || shared.release(topic)))
            }
            Ok(other) => {
                shared.release(topic);
                Err(ChannelError::Transport(format!("unexpected ack {other:?}")))
            }
            Err(e) => {
                shared.release(topic);
                Err(rejection(topic, e))
            }
        }
    }
}

fn topic_id(topic: Topic) -> Uuid {
    match topic {
        Topic::Mirror(id) | Topic::Call(id) => id,
    }
}

fn rejection(topic: Topic, e: ChannelError) -> ChannelError {
    match e {
        ChannelError::Rejected {
            code: ErrorCode::NotFound,
            ..
        } => ChannelError::SessionNotFound(topic_id(topic)),
        ChannelError::Rejected {
            code: ErrorCode::Forbidden,
            message,
        } => ChannelError::AccessDenied(message),
        other => other,
    }
}

fn unexpected<T>(result: AckResult) -> Result<T, SessionError> {
    Err(SessionError::Remote {
        code: ErrorCode::Internal,
        message: format!("unexpected ack {result:?}"),
    })
}

#[async_trait]
impl EventChannel for RemoteChannel {
    async fn append_mirror(
        &self,
        session_id: Uuid,
        kind: MirrorKind,
        payload: Value,
    ) -> Result<u64, ChannelError> {
        let result = self
            .request(|request_id| ClientFrame::AppendMirror {
                request_id,
                session_id,
                kind,
                payload,
            })
            .await
            .map_err(|e| rejection(Topic::Mirror(session_id), e))?;
        match result {
            AckResult::Appended { created_at } => Ok(created_at),
            other => Err(ChannelError::Transport(format!("unexpected ack {other:?}"))),
        }
    }

    async fn append_signal(
        &self,
        call_session_id: Uuid,
        sender_role: Role,
        signal_kind: SignalKind,
        signal_payload: Value,
    ) -> Result<u64, ChannelError> {
        let result = self
            .request(|request_id| ClientFrame::AppendSignal {
                request_id,
                call_session_id,
                sender_role,
                signal_kind,
                signal_payload,
            })
            .await
            .map_err(|e| rejection(Topic::Call(call_session_id), e))?;
        match result {
            AckResult::Appended { created_at } => Ok(created_at),
            other => Err(ChannelError::Transport(format!("unexpected ack {other:?}"))),
        }
    }

    async fn subscribe_mirror(
        &self,
        session_id: Uuid,
    ) -> Result<Subscription<MirrorEvent>, ChannelError> {
        self.join(
            Topic::Mirror(session_id),
            |fanout| match fanout {
                Fanout::Mirror { tx, last_snapshot } => Some((tx.subscribe(), last_snapshot.clone())),
                Fanout::Signal(_) => None,
            },
            |capacity| {
                let (tx, rx) = broadcast::channel(capacity);
                (
                    Fanout::Mirror {
                        tx,
                        last_snapshot: None,
                    },
                    rx,
                )
            },
        )
        .await
    }

    async fn subscribe_signals(
        &self,
        call_session_id: Uuid,
    ) -> Result<Subscription<SignalMessage>, ChannelError> {
        self.join(
            Topic::Call(call_session_id),
            |fanout| match fanout {
                Fanout::Signal(tx) => Some((tx.subscribe(), None)),
                Fanout::Mirror { .. } => None,
            },
            |capacity| {
                let (tx, rx) = broadcast::channel(capacity);
                (Fanout::Signal(tx), rx)
            },
        )
        .await
    }
}

#[async_trait]
impl SessionLifecycle for RemoteChannel {
    /// The relay takes the owner from the authenticated token.
    async fn open_mirror(&self, _owner_id: &str) -> Result<MirrorSession, SessionError> {
        match self
            .session_request(|request_id| ClientFrame::OpenMirror { request_id })
            .await?
        {
            AckResult::Mirror(session) => Ok(session),
            other => unexpected(other),
        }
    }

    async fn mirror_session(&self, id: Uuid) -> Result<MirrorSession, SessionError> {
        match self
            .session_request(|request_id| ClientFrame::GetMirror {
                request_id,
                session_id: id,
            })
            .await?
        {
            AckResult::Mirror(session) => Ok(session),
            other => unexpected(other),
        }
    }

    async fn end_mirror(&self, id: Uuid) -> Result<MirrorSession, SessionError> {
        match self
            .session_request(|request_id| ClientFrame::EndMirror {
                request_id,
                session_id: id,
            })
            .await?
        {
            AckResult::Mirror(session) => Ok(session),
            other => unexpected(other),
        }
    }

    async fn create_call(&self, call: NewCall) -> Result<CallSession, SessionError> {
        match self
            .session_request(|request_id| ClientFrame::CreateCall { request_id, call })
            .await?
        {
            AckResult::Call(session) => Ok(session),
            other => unexpected(other),
        }
    }

    async fn call_session(&self, id: Uuid) -> Result<CallSession, SessionError> {
        match self
            .session_request(|request_id| ClientFrame::GetCall {
                request_id,
                call_session_id: id,
            })
            .await?
        {
            AckResult::Call(session) => Ok(session),
            other => unexpected(other),
        }
    }

    async fn activate_call(&self, id: Uuid) -> Result<CallSession, SessionError> {
        match self
            .session_request(|request_id| ClientFrame::ActivateCall {
                request_id,
                call_session_id: id,
            })
            .await?
        {
            AckResult::Call(session) => Ok(session),
            other => unexpected(other),
        }
    }

    async fn end_call(
        &self,
        id: Uuid,
        duration_seconds: Option<u64>,
    ) -> Result<CallSession, SessionError> {
        match self
            .session_request(|request_id| ClientFrame::EndCall {
                request_id,
                call_session_id: id,
                duration_seconds,
            })
            .await?
        {
            AckResult::Call(session) => Ok(session),
            other => unexpected(other),
        }
    }
}
