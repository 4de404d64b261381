use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc, watch};
use tracing::{debug, info};
use uuid::Uuid;

/// Serialized event text, shared by every subscriber a broadcast reaches.
pub type Payload = Arc<str>;

/// Identifies one live connection for the lifetime of its socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The hub-facing half of a connection: an id plus the sending end of the
/// connection's outbound queue.
#[derive(Debug, Clone)]
pub struct Subscriber {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Payload>,
}

impl Subscriber {
    /// Creates a subscriber and the receiver its connection loop drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Payload>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: ConnectionId::new(),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues a payload for this connection only. Returns false if the
    /// connection has already gone away.
    pub fn deliver(&self, payload: Payload) -> bool {
        self.tx.send(payload).is_ok()
    }
}

/// Result of [`ConnectionHub::join`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Added,
    AlreadyJoined,
    /// The subscriber's connection loop has already dropped its queue.
    Disconnected,
    HubClosed,
}

impl JoinOutcome {
    /// True when the subscriber is registered under the channel afterwards.
    pub fn is_registered(self) -> bool {
        matches!(self, Self::Added | Self::AlreadyJoined)
    }
}

/// In-memory registry of live connections per channel.
///
/// Join/leave take the write lock; broadcasts share the read lock, so any
/// number of broadcasts proceed concurrently but never interleave with a
/// topology change.
#[derive(Clone)]
pub struct ConnectionHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    topology: RwLock<Topology>,

    /// Flips to true once on shutdown; connection loops watch it.
    shutdown: watch::Sender<bool>,
}

#[derive(Default)]
struct Topology {
    /// channel_id -> (connection -> outbound queue)
    channels: HashMap<Uuid, HashMap<ConnectionId, mpsc::UnboundedSender<Payload>>>,

    /// connection -> channels it is registered under
    memberships: HashMap<ConnectionId, HashSet<Uuid>>,

    closed: bool,
}

impl ConnectionHub {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(HubInner {
                topology: RwLock::new(Topology::default()),
                shutdown,
            }),
        }
    }

    /// Registers `subscriber` under `channel_id`.
    ///
    /// A subscriber whose receiver is gone is refused, so a join that races
    /// with connection teardown cannot leave a stale registration behind.
    pub async fn join(&self, channel_id: Uuid, subscriber: &Subscriber) -> JoinOutcome {
        let mut topology = self.inner.topology.write().await;
        if topology.closed {
            return JoinOutcome::HubClosed;
        }
        if subscriber.tx.is_closed() {
            return JoinOutcome::Disconnected;
        }

        let members = topology.channels.entry(channel_id).or_default();
        if members.contains_key(&subscriber.id) {
            return JoinOutcome::AlreadyJoined;
        }
        members.insert(subscriber.id, subscriber.tx.clone());
        topology
            .memberships
            .entry(subscriber.id)
            .or_default()
            .insert(channel_id);

        debug!("Connection {} joined channel {}", subscriber.id, channel_id);
        JoinOutcome::Added
    }

    /// Removes one registration. No-op (returns false) if absent.
    pub async fn leave(&self, channel_id: Uuid, conn: ConnectionId) -> bool {
        let mut topology = self.inner.topology.write().await;
        let removed = topology.remove(channel_id, conn);
        if removed {
            debug!("Connection {} left channel {}", conn, channel_id);
        }
        removed
    }

    /// Removes `conn` from every channel it joined. Returns how many
    /// registrations were dropped.
    pub async fn leave_all(&self, conn: ConnectionId) -> usize {
        let mut topology = self.inner.topology.write().await;
        let channels = topology.memberships.remove(&conn).unwrap_or_default();
        for channel_id in &channels {
            if let Some(members) = topology.channels.get_mut(channel_id) {
                members.remove(&conn);
                if members.is_empty() {
                    topology.channels.remove(channel_id);
                }
            }
        }
        channels.len()
    }

    /// Delivers `payload` to every connection currently joined to
    /// `channel_id`. Failed deliveries are skipped; returns the number of
    /// queues that accepted the payload.
    pub async fn broadcast(&self, channel_id: Uuid, payload: Payload) -> usize {
        let topology = self.inner.topology.read().await;
        let Some(members) = topology.channels.get(&channel_id) else {
            return 0;
        };

        let mut delivered = 0;
        for (conn, tx) in members {
            if tx.send(payload.clone()).is_ok() {
                delivered += 1;
            } else {
                debug!("Dropped payload for closed connection {} on channel {}", conn, channel_id);
            }
        }
        delivered
    }

    pub async fn subscriber_count(&self, channel_id: Uuid) -> usize {
        self.inner
            .topology
            .read()
            .await
            .channels
            .get(&channel_id)
            .map_or(0, HashMap::len)
    }

    pub async fn channels_of(&self, conn: ConnectionId) -> Vec<Uuid> {
        self.inner
            .topology
            .read()
            .await
            .memberships
            .get(&conn)
            .map(|channels| channels.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drops every registration and refuses further joins. Connection loops
    /// waiting on [`ConnectionHub::closed`] wake up and close their sockets.
    pub async fn shutdown(&self) {
        let mut topology = self.inner.topology.write().await;
        let connections = topology.memberships.len();
        topology.channels.clear();
        topology.memberships.clear();
        topology.closed = true;
        drop(topology);

        self.inner.shutdown.send_replace(true);
        info!("Connection hub shut down ({} live connections released)", connections);
    }

    /// Resolves once [`ConnectionHub::shutdown`] has been called.
    pub async fn closed(&self) {
        let mut rx = self.inner.shutdown.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Default for ConnectionHub {
    fn default() -> Self {
        Self::new()
    }
}

impl Topology {
    fn remove(&mut self, channel_id: Uuid, conn: ConnectionId) -> bool {
        let Some(members) = self.channels.get_mut(&channel_id) else {
            return false;
        };
        if members.remove(&conn).is_none() {
            return false;
        }
        if members.is_empty() {
            self.channels.remove(&channel_id);
        }
        if let Some(channels) = self.memberships.get_mut(&conn) {
            channels.remove(&channel_id);
            if channels.is_empty() {
                self.memberships.remove(&conn);
            }
        }
        true
    }
}
