use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{conversations::Directory, error::ChatResult};

use super::{
    envelope::ServerEnvelope,
    presence::{PresenceStatus, PresenceTracker},
};

pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// The registry's handle on one live socket: the sending half of its bounded
/// outbound queue plus a token that closes it.
#[derive(Clone, Debug)]
pub struct Connection {
    id: ConnectionId,
    tx: mpsc::Sender<ServerEnvelope>,
    closed: CancellationToken,
}

/// The socket writer's half of a [`Connection`].
pub struct Outbox {
    pub rx: mpsc::Receiver<ServerEnvelope>,
    pub closed: CancellationToken,
}

impl Connection {
    pub fn open(capacity: usize) -> (Connection, Outbox) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let closed = CancellationToken::new();
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);

        (
            Connection { id, tx, closed: closed.clone() },
            Outbox { rx, closed },
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    /// Queues an event without waiting. A full queue means the client is not
    /// keeping up, and the connection is closed instead of buffering more.
    pub fn offer(&self, event: ServerEnvelope) -> bool {
        if self.is_closed() {
            return false;
        }

        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(connection = self.id, "outbound queue full, closing slow connection");
                self.close();
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.close();
                false
            }
        }
    }
}

struct HubInner {
    connections: Mutex<HashMap<String, Vec<Connection>>>,
    presence: PresenceTracker,
    directory: Directory,
    announcements: tokio::sync::Mutex<()>,
}

/// Maps users to their live connections and fans events out to them.
///
/// The registry lock is only held to mutate or snapshot the map, never while
/// anything is written to a socket.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    pub fn new(directory: Directory, presence: PresenceTracker) -> Self {
        Self {
            inner: Arc::new(HubInner {
                connections: Mutex::default(),
                presence,
                directory,
                announcements: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub async fn register(&self, user_id: &str, connection: Connection) {
        let id = connection.id();
        let (count, changed) = {
            let mut connections = self.inner.connections.lock();
            let set = connections.entry(user_id.to_owned()).or_default();
            set.push(connection);
            (set.len(), self.inner.presence.online(user_id, Instant::now()))
        };

        info!(user = %user_id, connection = id, connections = count, "connection registered");

        if changed {
            self.announce(user_id).await;
        }
    }

    pub async fn unregister(&self, user_id: &str, connection_id: ConnectionId) {
        if self.detach(user_id, connection_id) {
            self.announce(user_id).await;
        }
    }

    /// Drops one connection from the registry. Returns `true` if that took the
    /// user offline.
    fn detach(&self, user_id: &str, connection_id: ConnectionId) -> bool {
        let mut connections = self.inner.connections.lock();
        let Some(set) = connections.get_mut(user_id) else {
            return false;
        };

        let before = set.len();
        set.retain(|c| c.id() != connection_id);
        if set.len() == before {
            return false;
        }

        debug!(user = %user_id, connection = connection_id, remaining = set.len(), "connection unregistered");

        if set.is_empty() {
            connections.remove(user_id);
            return self.inner.presence.offline(user_id);
        }
        false
    }

    fn evict(&self, user_id: &str, connection: &Connection) {
        connection.close();
        if self.detach(user_id, connection.id()) {
            let hub = self.clone();
            let user_id = user_id.to_owned();
            tokio::spawn(async move { hub.announce(&user_id).await });
        }
    }

    pub fn connection_count(&self, user_id: &str) -> usize {
        self.inner
            .connections
            .lock()
            .get(user_id)
            .map_or(0, Vec::len)
    }

    /// Queues `event` on every connection of `user_id` and returns how many
    /// accepted it. Zero is normal: the user is simply not connected.
    pub fn send_to_user(&self, user_id: &str, event: &ServerEnvelope) -> usize {
        let targets = self
            .inner
            .connections
            .lock()
            .get(user_id)
            .cloned()
            .unwrap_or_default();

        let mut delivered = 0;
        for connection in targets {
            if connection.offer(event.clone()) {
                delivered += 1;
            } else {
                self.evict(user_id, &connection);
            }
        }
        delivered
    }

    pub async fn send_to_conversation(
        &self,
        conversation_id: Uuid,
        event: &ServerEnvelope,
        exclude: Option<&str>,
    ) -> ChatResult<usize> {
        let participants = self.inner.directory.participants(conversation_id).await?;

        Ok(participants
            .iter()
            .filter(|user_id| Some(user_id.as_str()) != exclude)
            .map(|user_id| self.send_to_user(user_id, event))
            .sum())
    }

    pub fn status(&self, user_id: &str) -> PresenceStatus {
        self.inner.presence.status(user_id, Instant::now())
    }

    /// Client traffic from one of `user_id`'s connections.
    pub async fn touch(&self, user_id: &str) {
        let changed = {
            let connections = self.inner.connections.lock();
            connections.contains_key(user_id) && self.inner.presence.touch(user_id, Instant::now())
        };

        if changed {
            self.announce(user_id).await;
        } else {
            self.refresh(user_id).await;
        }
    }

    /// Keepalive traffic (pongs). Keeps the user fresh but does not undo a
    /// declared `offline`.
    pub async fn heartbeat(&self, user_id: &str) {
        {
            let connections = self.inner.connections.lock();
            if !connections.contains_key(user_id) {
                return;
            }
            self.inner.presence.heartbeat(user_id, Instant::now());
        }

        self.refresh(user_id).await;
    }

    /// Writes the current last-activity through, at most once per throttle
    /// window. Runs behind the announcement gate so it cannot overwrite a
    /// newer status with an older one.
    async fn refresh(&self, user_id: &str) {
        if !self.inner.presence.claim_refresh(user_id, Instant::now()) {
            return;
        }

        let _guard = self.inner.announcements.lock().await;
        let Some((status, last_activity_ms)) = self.inner.presence.snapshot(user_id) else {
            return;
        };
        if let Err(err) = self.inner.presence.persist(user_id, status, last_activity_ms).await {
            warn!(user = %user_id, error = %err, "failed to persist presence");
        }
    }

    /// A client-declared status. Declaring `online` is a heartbeat; declaring
    /// `offline` demotes the user until their next traffic.
    pub async fn set_status(&self, user_id: &str, status: PresenceStatus) {
        match status {
            PresenceStatus::Online => self.touch(user_id).await,
            PresenceStatus::Offline => {
                let changed = {
                    let _connections = self.inner.connections.lock();
                    self.inner.presence.offline(user_id)
                };
                if changed {
                    self.announce(user_id).await;
                }
            }
        }
    }

    /// Demotes users whose connections went silent without closing.
    pub async fn sweep(&self) -> usize {
        let demoted = self.inner.presence.sweep(Instant::now());
        for user_id in &demoted {
            info!(user = %user_id, "presence went stale");
            self.announce(user_id).await;
        }
        demoted.len()
    }

    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + every, every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                hub.sweep().await;
            }
        })
    }

    /// Tells `user_id`'s conversation partners about a status they have not
    /// seen yet. Announcements are serialized so partners observe a user's
    /// transitions in order.
    async fn announce(&self, user_id: &str) {
        let _guard = self.inner.announcements.lock().await;

        let Some((status, last_activity_ms)) = self.inner.presence.pending(user_id) else {
            return;
        };

        if let Err(err) = self.inner.presence.persist(user_id, status, last_activity_ms).await {
            warn!(user = %user_id, error = %err, "failed to persist presence");
        }

        let partners = match self.inner.directory.partners(user_id).await {
            Ok(partners) => partners,
            Err(err) => {
                warn!(user = %user_id, error = %err, "failed to resolve presence audience");
                return;
            }
        };

        let event = match status {
            PresenceStatus::Online => ServerEnvelope::UserOnline { user_id: user_id.to_owned() },
            PresenceStatus::Offline => ServerEnvelope::UserOffline { user_id: user_id.to_owned() },
        };

        let reached: usize = partners
            .iter()
            .map(|partner| self.send_to_user(partner, &event))
            .sum();

        self.inner.presence.mark_announced(user_id, status);
        debug!(user = %user_id, status = status.as_str(), reached, "presence announced");
    }
}
