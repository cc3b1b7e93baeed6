use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{NativeSession, NativeSessionFactory, ShardId};
use crate::error::{ShardError, ShardResult};

pub type ShardRef = Arc<Shard>;

/// Hook run when a shard's native session is opened.
#[async_trait]
pub trait OpenSessionEvent: Send + Sync {
    async fn on_open_session(
        &self,
        shard: ShardId,
        session: &Arc<dyn NativeSession>,
    ) -> ShardResult<()>;
}

#[derive(Default)]
struct SessionSlot {
    session: Option<Arc<dyn NativeSession>>,
    events: Vec<Arc<dyn OpenSessionEvent>>,
}

/// Handle to one physical shard inside a logical session.
///
/// The native session is opened lazily by [`Shard::establish_session`] and
/// owned exclusively by this handle.
pub struct Shard {
    physical_id: ShardId,
    shard_ids: BTreeSet<ShardId>,
    session_factory: Arc<dyn NativeSessionFactory>,
    slot: Mutex<SessionSlot>,
    open_lock: tokio::sync::Mutex<()>,
}

impl Shard {
    pub fn new<I>(
        physical_id: ShardId,
        shard_ids: I,
        session_factory: Arc<dyn NativeSessionFactory>,
    ) -> ShardResult<Self>
    where
        I: IntoIterator<Item = ShardId>,
    {
        let shard_ids: BTreeSet<ShardId> = shard_ids.into_iter().collect();
        if shard_ids.is_empty() {
            return Err(ShardError::invalid_argument(format!(
                "shard {} must serve at least one shard id",
                physical_id
            )));
        }
        Ok(Self {
            physical_id,
            shard_ids,
            session_factory,
            slot: Mutex::new(SessionSlot::default()),
            open_lock: tokio::sync::Mutex::new(()),
        })
    }

    #[inline]
    pub fn physical_id(&self) -> ShardId {
        self.physical_id
    }

    /// Virtual shard ids served by this shard, in ascending order.
    #[inline]
    pub fn shard_ids(&self) -> &BTreeSet<ShardId> {
        &self.shard_ids
    }

    #[inline]
    pub fn serves(&self, shard_id: ShardId) -> bool {
        self.shard_ids.contains(&shard_id)
    }

    pub fn session(&self) -> Option<Arc<dyn NativeSession>> {
        self.slot().session.clone()
    }

    pub fn has_session(&self) -> bool {
        self.slot().session.is_some()
    }

    /// Queue `event` for the moment the session opens.
    ///
    /// Returns the session instead when it is already open; the event is not
    /// queued in that case and the caller must act on the session itself.
    pub fn register_open_session_event(
        &self,
        event: Arc<dyn OpenSessionEvent>,
    ) -> Option<Arc<dyn NativeSession>> {
        let mut slot = self.slot();
        match &slot.session {
            Some(session) => Some(session.clone()),
            None => {
                slot.events.push(event);
                None
            }
        }
    }

    /// Open the native session if needed and run the queued open events.
    ///
    /// The session becomes visible only after every event succeeded. When an
    /// event fails the fresh session is closed, the events stay queued for
    /// the next attempt and the error is returned.
    pub async fn establish_session(
        &self,
    ) -> ShardResult<Arc<dyn NativeSession>> {
        if let Some(session) = self.session() {
            return Ok(session);
        }
        let _guard = self.open_lock.lock().await;
        if let Some(session) = self.session() {
            return Ok(session);
        }

        let session =
            self.session_factory.open_session().await.map_err(|source| {
                ShardError::Session {
                    shard: self.physical_id,
                    source,
                }
            })?;
        info!("open session on shard {}", self);

        let mut fired: Vec<Arc<dyn OpenSessionEvent>> = Vec::new();
        loop {
            // events registered while earlier ones ran are picked up here
            let events = {
                let mut slot = self.slot();
                if slot.events.is_empty() {
                    slot.session = Some(session.clone());
                    break;
                }
                std::mem::take(&mut slot.events)
            };
            let mut failure = None;
            for event in &events {
                if let Err(e) =
                    event.on_open_session(self.physical_id, &session).await
                {
                    failure = Some(e);
                    break;
                }
            }
            if let Some(e) = failure {
                warn!("open session event failed on shard {}: {}", self, e);
                self.requeue(fired.into_iter().chain(events));
                if let Err(close) = session.close().await {
                    warn!(
                        "closing rejected session on shard {} failed: {}",
                        self, close
                    );
                }
                return Err(e);
            }
            fired.extend(events);
        }
        Ok(session)
    }

    fn requeue<I>(&self, events: I)
    where
        I: IntoIterator<Item = Arc<dyn OpenSessionEvent>>,
    {
        let mut slot = self.slot();
        let later = std::mem::take(&mut slot.events);
        slot.events = events.into_iter().chain(later).collect();
    }

    /// Close the native session, if one is open.
    pub async fn close(&self) -> ShardResult<()> {
        let _guard = self.open_lock.lock().await;
        let session = self.slot().session.take();
        if let Some(session) = session {
            debug!("close session on shard {}", self);
            session.close().await.map_err(|source| ShardError::Session {
                shard: self.physical_id,
                source,
            })?;
        }
        Ok(())
    }

    fn slot(&self) -> MutexGuard<'_, SessionSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shard")
            .field("physical_id", &self.physical_id)
            .field("shard_ids", &self.shard_ids)
            .field("has_session", &self.has_session())
            .finish()
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.physical_id, self.shard_ids)
    }
}
