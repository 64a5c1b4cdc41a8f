//! Session Lifecycle Manager: creation, status transitions and teardown of
//! mirror and call sessions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tandem_protocol::{
    CallSession, CallStatus, MirrorSession, MirrorStatus, NewCall, SessionConfig, now_millis,
};
use tokio::sync::{Mutex, RwLock};
use tracing::info;
use uuid::Uuid;

use crate::error::SessionError;

/// Lifecycle operations shared by both participants.
#[async_trait]
pub trait SessionLifecycle: Send + Sync {
    /// Open a mirror session owned by `owner_id`. Remote implementations take
    /// the owner from the authenticated connection instead.
    async fn open_mirror(&self, owner_id: &str) -> Result<MirrorSession, SessionError>;

    async fn mirror_session(&self, id: Uuid) -> Result<MirrorSession, SessionError>;

    /// Mark a mirror session ended. Ending twice returns the ended record.
    async fn end_mirror(&self, id: Uuid) -> Result<MirrorSession, SessionError>;

    async fn create_call(&self, call: NewCall) -> Result<CallSession, SessionError>;

    async fn call_session(&self, id: Uuid) -> Result<CallSession, SessionError>;

    /// `pending → active`, stamping `started_at`. Activating an active call
    /// returns it unchanged.
    async fn activate_call(&self, id: Uuid) -> Result<CallSession, SessionError>;

    /// `pending|active → ended`. Without an explicit duration it is computed
    /// from `started_at`. Ending twice returns the ended record.
    async fn end_call(
        &self,
        id: Uuid,
        duration_seconds: Option<u64>,
    ) -> Result<CallSession, SessionError>;
}

/// Storage for session records.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load_mirror(&self, id: Uuid) -> Result<Option<MirrorSession>, SessionError>;
    async fn save_mirror(&self, session: &MirrorSession) -> Result<(), SessionError>;
    async fn active_mirrors(&self) -> Result<usize, SessionError>;

    async fn load_call(&self, id: Uuid) -> Result<Option<CallSession>, SessionError>;
    async fn save_call(&self, call: &CallSession) -> Result<(), SessionError>;
    /// Calls that are pending or active.
    async fn open_calls(&self) -> Result<usize, SessionError>;
}

#[derive(Default)]
pub struct MemorySessionStore {
    mirrors: RwLock<HashMap<Uuid, MirrorSession>>,
    calls: RwLock<HashMap<Uuid, CallSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load_mirror(&self, id: Uuid) -> Result<Option<MirrorSession>, SessionError> {
        Ok(self.mirrors.read().await.get(&id).cloned())
    }

    async fn save_mirror(&self, session: &MirrorSession) -> Result<(), SessionError> {
        self.mirrors
            .write()
            .await
            .insert(session.id, session.clone());
        Ok(())
    }

    async fn active_mirrors(&self) -> Result<usize, SessionError> {
        Ok(self
            .mirrors
            .read()
            .await
            .values()
            .filter(|s| s.is_active())
            .count())
    }

    async fn load_call(&self, id: Uuid) -> Result<Option<CallSession>, SessionError> {
        Ok(self.calls.read().await.get(&id).cloned())
    }

    async fn save_call(&self, call: &CallSession) -> Result<(), SessionError> {
        self.calls.write().await.insert(call.id, call.clone());
        Ok(())
    }

    async fn open_calls(&self) -> Result<usize, SessionError> {
        Ok(self
            .calls
            .read()
            .await
            .values()
            .filter(|c| c.status != CallStatus::Ended)
            .count())
    }
}

/// Enforces session transitions and limits over a [`SessionStore`].
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    limits: SessionConfig,
    /// Serializes read-modify-write sequences against the store.
    write_lock: Mutex<()>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, limits: SessionConfig) -> Self {
        Self {
            store,
            limits,
            write_lock: Mutex::new(()),
        }
    }

    pub fn in_memory(limits: SessionConfig) -> Self {
        Self::new(Arc::new(MemorySessionStore::new()), limits)
    }

    async fn require_call(&self, id: Uuid) -> Result<CallSession, SessionError> {
        self.store
            .load_call(id)
            .await?
            .ok_or(SessionError::NotFound(id))
    }
}

#[async_trait]
impl SessionLifecycle for SessionManager {
    async fn open_mirror(&self, owner_id: &str) -> Result<MirrorSession, SessionError> {
        let _guard = self.write_lock.lock().await;
        if self.store.active_mirrors().await? >= self.limits.max_active_mirrors {
            return Err(SessionError::LimitReached(self.limits.max_active_mirrors));
        }
        let session = MirrorSession {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            status: MirrorStatus::Active,
            created_at: now_millis(),
            ended_at: None,
        };
        self.store.save_mirror(&session).await?;
        info!(session_id = %session.id, owner_id, "Mirror session opened");
        Ok(session)
    }

    async fn mirror_session(&self, id: Uuid) -> Result<MirrorSession, SessionError> {
        self.store
            .load_mirror(id)
            .await?
            .ok_or(SessionError::NotFound(id))
    }

    async fn end_mirror(&self, id: Uuid) -> Result<MirrorSession, SessionError> {
        let _guard = self.write_lock.lock().await;
        let mut session = self
            .store
            .load_mirror(id)
            .await?
            .ok_or(SessionError::NotFound(id))?;
        if session.status == MirrorStatus::Ended {
            return Ok(session);
        }
        session.status = MirrorStatus::Ended;
        session.ended_at = Some(now_millis());
        self.store.save_mirror(&session).await?;
        info!(session_id = %id, "Mirror session ended");
        Ok(session)
    }

    async fn create_call(&self, call: NewCall) -> Result<CallSession, SessionError> {
        let _guard = self.write_lock.lock().await;
        let id = call.id.unwrap_or_else(Uuid::new_v4);
        if self.store.load_call(id).await?.is_some() {
            return Err(SessionError::Duplicate(id));
        }
        if self.store.open_calls().await? >= self.limits.max_active_calls {
            return Err(SessionError::LimitReached(self.limits.max_active_calls));
        }
        let session = CallSession {
            id,
            conversation_id: call.conversation_id,
            initiator_id: call.initiator_id,
            responder_id: call.responder_id,
            call_type: call.call_type,
            status: CallStatus::Pending,
            started_at: None,
            ended_at: None,
            duration_seconds: None,
        };
        self.store.save_call(&session).await?;
        info!(call_session_id = %id, call_type = ?session.call_type, "Call session created");
        Ok(session)
    }

    async fn call_session(&self, id: Uuid) -> Result<CallSession, SessionError> {
        self.require_call(id).await
    }

    async fn activate_call(&self, id: Uuid) -> Result<CallSession, SessionError> {
        let _guard = self.write_lock.lock().await;
        let mut call = self.require_call(id).await?;
        if call.status == CallStatus::Active {
            return Ok(call);
        }
        if !call.status.can_transition_to(CallStatus::Active) {
            return Err(SessionError::InvalidTransition {
                id,
                from: call.status,
                to: CallStatus::Active,
            });
        }
        call.status = CallStatus::Active;
        call.started_at = Some(now_millis());
        self.store.save_call(&call).await?;
        info!(call_session_id = %id, "Call session active");
        Ok(call)
    }

    async fn end_call(
        &self,
        id: Uuid,
        duration_seconds: Option<u64>,
    ) -> Result<CallSession, SessionError> {
        let _guard = self.write_lock.lock().await;
        let mut call = self.require_call(id).await?;
        if call.status == CallStatus::Ended {
            return Ok(call);
        }
        let ended_at = now_millis();
        let duration = duration_seconds.unwrap_or_else(|| {
            call.started_at
                .map(|started| ended_at.saturating_sub(started) / 1000)
                .unwrap_or(0)
        });
        call.status = CallStatus::Ended;
        call.ended_at = Some(ended_at);
        call.duration_seconds = Some(duration);
        self.store.save_call(&call).await?;
        info!(call_session_id = %id, duration_seconds = duration, "Call session ended");
        Ok(call)
    }
}
