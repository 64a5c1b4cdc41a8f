//! The ordered, per-session event channel both participants publish into.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tandem_protocol::{MirrorEvent, MirrorKind, Role, SignalKind, SignalMessage, Topic, now_millis};
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ChannelError;

/// Append-only, per-session publish/subscribe log.
///
/// Subscribers receive records appended after they subscribed, in append
/// order. Mirror subscriptions additionally start with the session's most
/// recent snapshot, if any.
#[async_trait]
pub trait EventChannel: Send + Sync {
    async fn append_mirror(
        &self,
        session_id: Uuid,
        kind: MirrorKind,
        payload: Value,
    ) -> Result<u64, ChannelError>;

    async fn append_signal(
        &self,
        call_session_id: Uuid,
        sender_role: Role,
        signal_kind: SignalKind,
        signal_payload: Value,
    ) -> Result<u64, ChannelError>;

    async fn subscribe_mirror(
        &self,
        session_id: Uuid,
    ) -> Result<Subscription<MirrorEvent>, ChannelError>;

    async fn subscribe_signals(
        &self,
        call_session_id: Uuid,
    ) -> Result<Subscription<SignalMessage>, ChannelError>;
}

/// A subscription cursor. Dropping it releases the subscription.
pub struct Subscription<T> {
    topic: Topic,
    replay: VecDeque<T>,
    rx: broadcast::Receiver<T>,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl<T: Clone> Subscription<T> {
    pub fn new(topic: Topic, rx: broadcast::Receiver<T>) -> Self {
        Self {
            topic,
            replay: VecDeque::new(),
            rx,
            release: None,
        }
    }

    /// Records delivered before anything received from the log.
    pub fn with_replay(mut self, records: impl IntoIterator<Item = T>) -> Self {
        self.replay.extend(records);
        self
    }

    /// Run `release` when the subscription is dropped.
    pub fn on_release(mut self, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.release = Some(Box::new(release));
        self
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Next record, or `None` once the log is closed.
    pub async fn recv(&mut self) -> Option<T> {
        if let Some(record) = self.replay.pop_front() {
            return Some(record);
        }
        loop {
            match self.rx.recv().await {
                Ok(record) => return Some(record),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, skipped = n, "Subscriber lagged, records dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next record if one is ready.
    pub fn try_recv(&mut self) -> Option<T> {
        if let Some(record) = self.replay.pop_front() {
            return Some(record);
        }
        loop {
            match self.rx.try_recv() {
                Ok(record) => return Some(record),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, skipped = n, "Subscriber lagged, records dropped");
                }
                Err(_) => return None,
            }
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("replay", &self.replay.len())
            .finish()
    }
}

struct LogState<T> {
    last_created_at: u64,
    /// Replayed to new subscribers (the latest snapshot for mirror logs).
    replay: Option<T>,
}

struct SessionLog<T> {
    tx: broadcast::Sender<T>,
    state: Mutex<LogState<T>>,
}

impl<T: Clone> SessionLog<T> {
    fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            state: Mutex::new(LogState {
                last_created_at: 0,
                replay: None,
            }),
        }
    }
}

type LogRegistry<T> = RwLock<HashMap<Uuid, Arc<SessionLog<T>>>>;

async fn get_or_create_log<T: Clone>(
    registry: &LogRegistry<T>,
    id: Uuid,
    capacity: usize,
) -> Arc<SessionLog<T>> {
    {
        let logs = registry.read().await;
        if let Some(log) = logs.get(&id) {
            return Arc::clone(log);
        }
    }

    let mut logs = registry.write().await;
    logs.entry(id)
        .or_insert_with(|| Arc::new(SessionLog::new(capacity)))
        .clone()
}

/// In-process channel backed by one broadcast log per session.
pub struct MemoryChannel {
    capacity: usize,
    mirrors: LogRegistry<MirrorEvent>,
    calls: LogRegistry<SignalMessage>,
}

impl MemoryChannel {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            mirrors: RwLock::new(HashMap::new()),
            calls: RwLock::new(HashMap::new()),
        }
    }

    /// Drop a session's log. Open subscriptions observe the end of the stream.
    pub async fn close(&self, topic: Topic) {
        let removed = match topic {
            Topic::Mirror(id) => self.mirrors.write().await.remove(&id).is_some(),
            Topic::Call(id) => self.calls.write().await.remove(&id).is_some(),
        };
        if removed {
            debug!(?topic, "Session log closed");
        }
    }

    /// Number of live subscriptions on a session log.
    pub async fn receiver_count(&self, topic: Topic) -> usize {
        match topic {
            Topic::Mirror(id) => self
                .mirrors
                .read()
                .await
                .get(&id)
                .map_or(0, |log| log.tx.receiver_count()),
            Topic::Call(id) => self
                .calls
                .read()
                .await
                .get(&id)
                .map_or(0, |log| log.tx.receiver_count()),
        }
    }
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventChannel for MemoryChannel {
    async fn append_mirror(
        &self,
        session_id: Uuid,
        kind: MirrorKind,
        payload: Value,
    ) -> Result<u64, ChannelError> {
        let log = get_or_create_log(&self.mirrors, session_id, self.capacity).await;
        let mut state = log.state.lock().await;
        let created_at = now_millis().max(state.last_created_at);
        state.last_created_at = created_at;

        let event = MirrorEvent {
            session_id,
            kind,
            payload,
            created_at,
        };
        if kind == MirrorKind::Snapshot {
            state.replay = Some(event.clone());
        }
        let receivers = log.tx.send(event).unwrap_or(0);
        debug!(%session_id, kind = kind.as_str(), receivers, "Mirror event appended");
        Ok(created_at)
    }

    async fn append_signal(
        &self,
        call_session_id: Uuid,
        sender_role: Role,
        signal_kind: SignalKind,
        signal_payload: Value,
    ) -> Result<u64, ChannelError> {
        let log = get_or_create_log(&self.calls, call_session_id, self.capacity).await;
        let mut state = log.state.lock().await;
        let created_at = now_millis().max(state.last_created_at);
        state.last_created_at = created_at;

        let message = SignalMessage {
            call_session_id,
            sender_role,
            signal_kind,
            signal_payload,
            created_at,
        };
        let receivers = log.tx.send(message).unwrap_or(0);
        debug!(
            %call_session_id,
            ?sender_role,
            kind = signal_kind.as_str(),
            receivers,
            "Signal appended"
        );
        Ok(created_at)
    }

    async fn subscribe_mirror(
        &self,
        session_id: Uuid,
    ) -> Result<Subscription<MirrorEvent>, ChannelError> {
        let log = get_or_create_log(&self.mirrors, session_id, self.capacity).await;
        // Hold the append lock so the replayed snapshot and the live stream
        // neither overlap nor leave a gap.
        let state = log.state.lock().await;
        let rx = log.tx.subscribe();
        Ok(Subscription::new(Topic::Mirror(session_id), rx).with_replay(state.replay.clone()))
    }

    async fn subscribe_signals(
        &self,
        call_session_id: Uuid,
    ) -> Result<Subscription<SignalMessage>, ChannelError> {
        let log = get_or_create_log(&self.calls, call_session_id, self.capacity).await;
        let _state = log.state.lock().await;
        let rx = log.tx.subscribe();
        Ok(Subscription::new(Topic::Call(call_session_id), rx))
    }
}
