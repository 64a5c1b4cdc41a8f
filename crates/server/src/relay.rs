use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use serde_json::Value;
use tandem_engine::{
    ChannelError, EventChannel, MemoryChannel, SessionError, SessionLifecycle, SessionManager,
    Subscription,
};
use tandem_protocol::{
    AckResult, CallSession, ClientFrame, ErrorCode, MirrorKind, MirrorSession, NewCall, Role,
    ServerFrame, SessionConfig, SignalKind, StreamRecord, Topic,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::auth::Claims;

/// A request the relay refused, with the code reported to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub code: ErrorCode,
    pub message: String,
}

impl Rejection {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    fn not_found(id: Uuid) -> Self {
        Self::new(ErrorCode::NotFound, format!("session {id} not found"))
    }
}

impl From<SessionError> for Rejection {
    fn from(e: SessionError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

impl From<ChannelError> for Rejection {
    fn from(e: ChannelError) -> Self {
        let code = match &e {
            ChannelError::SessionNotFound(_) => ErrorCode::NotFound,
            ChannelError::AccessDenied(_) => ErrorCode::Forbidden,
            ChannelError::Protocol(_) => ErrorCode::BadRequest,
            ChannelError::Rejected { code, .. } => *code,
            ChannelError::Closed | ChannelError::Transport(_) => ErrorCode::Internal,
        };
        Self::new(code, e.to_string())
    }
}

/// Session-scoped ordered logs plus the session records they belong to.
/// Every operation is checked against the caller's claims.
pub struct Relay {
    channel: MemoryChannel,
    sessions: SessionManager,
}

impl Relay {
    pub fn new(channel_capacity: usize, limits: SessionConfig) -> Self {
        Self {
            channel: MemoryChannel::new(channel_capacity),
            sessions: SessionManager::in_memory(limits),
        }
    }

    pub async fn open_mirror(&self, claims: &Claims) -> Result<MirrorSession, Rejection> {
        if !claims.is_agent() {
            return Err(Rejection::forbidden("only agents may open mirror sessions"));
        }
        Ok(self.sessions.open_mirror(&claims.sub).await?)
    }

    pub async fn mirror_session(
        &self,
        _claims: &Claims,
        id: Uuid,
    ) -> Result<MirrorSession, Rejection> {
        Ok(self.sessions.mirror_session(id).await?)
    }

    /// End a mirror session and close its log.
    pub async fn end_mirror(&self, claims: &Claims, id: Uuid) -> Result<MirrorSession, Rejection> {
        let session = self.sessions.end_mirror(id).await?;
        self.channel.close(Topic::Mirror(id)).await;
        tracing::info!(session_id = %id, by = %claims.sub, "Mirror session closed");
        Ok(session)
    }

    pub async fn create_call(&self, claims: &Claims, call: NewCall) -> Result<CallSession, Rejection> {
        if !claims.is_agent() {
            return Err(Rejection::forbidden("only agents may create calls"));
        }
        if call.initiator_id != claims.sub && call.responder_id != claims.sub {
            return Err(Rejection::forbidden("caller is not a participant of the call"));
        }
        Ok(self.sessions.create_call(call).await?)
    }

    pub async fn call_session(&self, claims: &Claims, id: Uuid) -> Result<CallSession, Rejection> {
        let call = self.sessions.call_session(id).await?;
        require_participant(&call, claims)?;
        Ok(call)
    }

    pub async fn activate_call(&self, claims: &Claims, id: Uuid) -> Result<CallSession, Rejection> {
        self.call_session(claims, id).await?;
        Ok(self.sessions.activate_call(id).await?)
    }

    /// End a call and close its signal log.
    pub async fn end_call(
        &self,
        claims: &Claims,
        id: Uuid,
        duration_seconds: Option<u64>,
    ) -> Result<CallSession, Rejection> {
        self.call_session(claims, id).await?;
        let call = self.sessions.end_call(id, duration_seconds).await?;
        self.channel.close(Topic::Call(id)).await;
        Ok(call)
    }

    pub async fn append_mirror(
        &self,
        _claims: &Claims,
        session_id: Uuid,
        kind: MirrorKind,
        payload: Value,
    ) -> Result<u64, Rejection> {
        self.active_mirror(session_id).await?;
        Ok(self.channel.append_mirror(session_id, kind, payload).await?)
    }

    pub async fn append_signal(
        &self,
        claims: &Claims,
        call_session_id: Uuid,
        sender_role: Role,
        signal_kind: SignalKind,
        signal_payload: Value,
    ) -> Result<u64, Rejection> {
        let call = self.open_call(claims, call_session_id).await?;
        let claimed = match sender_role {
            Role::Initiator => &call.initiator_id,
            Role::Responder => &call.responder_id,
        };
        if *claimed != claims.sub {
            return Err(Rejection::forbidden(format!(
                "{} may not send as {sender_role:?}",
                claims.sub
            )));
        }
        Ok(self
            .channel
            .append_signal(call_session_id, sender_role, signal_kind, signal_payload)
            .await?)
    }

    /// Subscribe to a topic's log after checking access. Subscribing to a
    /// missing or ended session is `not_found`.
    async fn subscribe(&self, claims: &Claims, topic: Topic) -> Result<Feed, Rejection> {
        match topic {
            Topic::Mirror(id) => {
                self.active_mirror(id).await?;
                let subscription = self.channel.subscribe_mirror(id).await?;
                Ok(Feed::Mirror(subscription))
            }
            Topic::Call(id) => {
                self.open_call(claims, id).await?;
                let subscription = self.channel.subscribe_signals(id).await?;
                Ok(Feed::Signal(subscription))
            }
        }
    }

    async fn active_mirror(&self, id: Uuid) -> Result<MirrorSession, Rejection> {
        match self.sessions.mirror_session(id).await {
            Ok(session) if session.is_active() => Ok(session),
            Ok(_) | Err(SessionError::NotFound(_)) => Err(Rejection::not_found(id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn open_call(&self, claims: &Claims, id: Uuid) -> Result<CallSession, Rejection> {
        let call = match self.sessions.call_session(id).await {
            Ok(call) if call.status != tandem_protocol::CallStatus::Ended => call,
            Ok(_) | Err(SessionError::NotFound(_)) => return Err(Rejection::not_found(id)),
            Err(e) => return Err(e.into()),
        };
        require_participant(&call, claims)?;
        Ok(call)
    }
}

fn require_participant(call: &CallSession, claims: &Claims) -> Result<(), Rejection> {
    if call.initiator_id == claims.sub || call.responder_id == claims.sub {
        Ok(())
    } else {
        Err(Rejection::forbidden(format!(
            "{} is not a participant of call {}",
            claims.sub, call.id
        )))
    }
}

enum Feed {
    Mirror(Subscription<tandem_protocol::MirrorEvent>),
    Signal(Subscription<tandem_protocol::SignalMessage>),
}

/// Pump a subscription into the connection's outgoing queue. Records that
/// are already available (the replayed snapshot) are queued before this
/// returns, so they precede the subscribe ack.
fn forward<T: Clone + Send + 'static>(
    mut subscription: Subscription<T>,
    out: mpsc::UnboundedSender<ServerFrame>,
    wrap: fn(T) -> StreamRecord,
) -> JoinHandle<()> {
    while let Some(record) = subscription.try_recv() {
        let _ = out.send(ServerFrame::Record {
            record: wrap(record),
        });
    }
    tokio::spawn(async move {
        let topic = subscription.topic();
        while let Some(record) = subscription.recv().await {
            if out
                .send(ServerFrame::Record {
                    record: wrap(record),
                })
                .is_err()
            {
                return;
            }
        }
        tracing::debug!(?topic, "Session log closed, notifying subscriber");
        let _ = out.send(ServerFrame::Closed { topic });
    })
}

/// One participant's relay connection: its claims and live subscriptions.
pub struct Connection {
    claims: Claims,
    relay: Arc<Relay>,
    out: mpsc::UnboundedSender<ServerFrame>,
    feeds: HashMap<Topic, JoinHandle<()>>,
}

impl Connection {
    pub fn new(claims: Claims, relay: Arc<Relay>, out: mpsc::UnboundedSender<ServerFrame>) -> Self {
        Self {
            claims,
            relay,
            out,
            feeds: HashMap::new(),
        }
    }

    /// Execute one client frame and build its reply.
    pub async fn handle(&mut self, frame: ClientFrame) -> ServerFrame {
        let request_id = frame.request_id();
        match self.execute(frame).await {
            Ok(result) => ServerFrame::Ack { request_id, result },
            Err(rejection) => {
                tracing::debug!(
                    user = %self.claims.sub,
                    request_id,
                    code = ?rejection.code,
                    "Request rejected: {}",
                    rejection.message
                );
                ServerFrame::Error {
                    request_id: Some(request_id),
                    code: rejection.code,
                    message: rejection.message,
                }
            }
        }
    }

    async fn execute(&mut self, frame: ClientFrame) -> Result<AckResult, Rejection> {
        let relay = Arc::clone(&self.relay);
        let claims = &self.claims;
        match frame {
            ClientFrame::AppendMirror {
                session_id,
                kind,
                payload,
                ..
            } => {
                let created_at = relay.append_mirror(claims, session_id, kind, payload).await?;
                Ok(AckResult::Appended { created_at })
            }
            ClientFrame::AppendSignal {
                call_session_id,
                sender_role,
                signal_kind,
                signal_payload,
                ..
            } => {
                let created_at = relay
                    .append_signal(
                        claims,
                        call_session_id,
                        sender_role,
                        signal_kind,
                        signal_payload,
                    )
                    .await?;
                Ok(AckResult::Appended { created_at })
            }
            ClientFrame::Subscribe { topic, .. } => {
                if self.feeds.get(&topic).is_some_and(|feed| !feed.is_finished()) {
                    return Ok(AckResult::Subscribed);
                }
                let feed = match relay.subscribe(claims, topic).await? {
                    Feed::Mirror(subscription) => {
                        forward(subscription, self.out.clone(), StreamRecord::Mirror)
                    }
                    Feed::Signal(subscription) => {
                        forward(subscription, self.out.clone(), StreamRecord::Signal)
                    }
                };
                self.feeds.insert(topic, feed);
                tracing::debug!(user = %self.claims.sub, ?topic, "Subscribed");
                Ok(AckResult::Subscribed)
            }
            ClientFrame::Unsubscribe { topic, .. } => {
                if let Some(feed) = self.feeds.remove(&topic) {
                    feed.abort();
                    tracing::debug!(user = %self.claims.sub, ?topic, "Unsubscribed");
                }
                Ok(AckResult::Unsubscribed)
            }
            ClientFrame::OpenMirror { .. } => Ok(AckResult::Mirror(relay.open_mirror(claims).await?)),
            ClientFrame::GetMirror { session_id, .. } => Ok(AckResult::Mirror(
                relay.mirror_session(claims, session_id).await?,
            )),
            ClientFrame::EndMirror { session_id, .. } => {
                Ok(AckResult::Mirror(relay.end_mirror(claims, session_id).await?))
            }
            ClientFrame::CreateCall { call, .. } => {
                Ok(AckResult::Call(relay.create_call(claims, call).await?))
            }
            ClientFrame::GetCall {
                call_session_id, ..
            } => Ok(AckResult::Call(
                relay.call_session(claims, call_session_id).await?,
            )),
            ClientFrame::ActivateCall {
                call_session_id, ..
            } => Ok(AckResult::Call(
                relay.activate_call(claims, call_session_id).await?,
            )),
            ClientFrame::EndCall {
                call_session_id,
                duration_seconds,
                ..
            } => Ok(AckResult::Call(
                relay
                    .end_call(claims, call_session_id, duration_seconds)
                    .await?,
            )),
        }
    }

    /// Queue a frame for the socket. Replies share the queue with records so
    /// a subscribe ack follows any replayed records.
    pub fn send(&self, frame: ServerFrame) {
        let _ = self.out.send(frame);
    }

    fn close(&mut self) {
        for (_, feed) in self.feeds.drain() {
            feed.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Serve one participant WebSocket until either side closes it.
pub async fn handle_socket(mut socket: WebSocket, claims: Claims, relay: Arc<Relay>) {
    let (out, mut outgoing) = mpsc::unbounded_channel();
    let user = claims.sub.clone();
    let mut connection = Connection::new(claims, relay, out);

    tracing::info!(%user, "Participant WebSocket connected");

    loop {
        tokio::select! {
            Some(frame) = outgoing.recv() => {
                let json = match serde_json::to_string(&frame) {
                    Ok(j) => j,
                    Err(e) => {
                        tracing::error!("Failed to serialize relay frame: {e}");
                        continue;
                    }
                };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    tracing::debug!(%user, "Participant WebSocket send failed");
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientFrame>(&text) {
                        Ok(frame) => {
                            let reply = connection.handle(frame).await;
                            connection.send(reply);
                        }
                        Err(e) => {
                            tracing::warn!(%user, "Invalid participant frame: {e}");
                            connection.send(ServerFrame::Error {
                                request_id: None,
                                code: ErrorCode::BadRequest,
                                message: format!("Invalid message format: {e}"),
                            });
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!(%user, "Participant WebSocket closed");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::debug!(%user, "Participant WebSocket error: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    tracing::info!(%user, "Participant WebSocket disconnected");
}
