use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error};
use uuid::Uuid;

use parlor_db::{MembershipStore, MessageStore};
use parlor_gateway::{ConnectionHub, JoinOutcome, Subscriber, SubscriptionGate};
use parlor_types::error::{Error, Result};
use parlor_types::events::GatewayEvent;
use parlor_types::models::{Message, MessageFilter, NewMessage};

use crate::access;
use crate::threads;

/// Runs blocking store work off the async runtime.
pub(crate) async fn blocking<S, T, F>(store: &Arc<S>, f: F) -> Result<T>
where
    S: Send + Sync + ?Sized + 'static,
    T: Send + 'static,
    F: FnOnce(&S) -> Result<T> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            Error::Internal(anyhow::anyhow!("blocking task failed: {}", e))
        })?
}

/// Ties access control, thread placement, persistence and live fan-out
/// together for message create/list and channel subscriptions.
pub struct MessageService<S> {
    store: Arc<S>,
    hub: ConnectionHub,

    /// Per-channel turn lock held from commit through broadcast, so
    /// subscribers see a channel's messages in commit order.
    sequencers: Sequencers,
}

type Sequencers = Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>;

/// One create's turn on a channel. Dropping it releases the turn and forgets
/// the channel's lock once no other create holds or awaits it.
struct Turn<'a> {
    sequencers: &'a Sequencers,
    channel_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut sequencers = self.sequencers.lock().unwrap_or_else(PoisonError::into_inner);
        if sequencers
            .get(&self.channel_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            sequencers.remove(&self.channel_id);
        }
    }
}

impl<S> MessageService<S>
where
    S: MembershipStore + MessageStore + 'static,
{
    pub fn new(store: Arc<S>, hub: ConnectionHub) -> Self {
        Self {
            store,
            hub,
            sequencers: Mutex::new(HashMap::new()),
        }
    }

    pub fn hub(&self) -> &ConnectionHub {
        &self.hub
    }

    pub async fn create(
        &self,
        user_id: Uuid,
        channel_id: Uuid,
        text: String,
        parent_id: Option<Uuid>,
    ) -> Result<Message> {
        if text.trim().is_empty() {
            return Err(Error::invalid("text must not be empty"));
        }

        let _turn = self.take_turn(channel_id).await;

        let message = blocking(&self.store, move |store| {
            let (channel, _, access) = access::resolve(store, user_id, channel_id)?;
            access.require_write()?;

            let placement = threads::resolve(channel_id, parent_id, |id| store.get_message(id))?;

            let message = store.insert_message(&NewMessage {
                workspace_id: channel.workspace_id,
                channel_id,
                user_id,
                text,
                parent_id: placement.parent_id,
                thread_root_id: placement.thread_root_id,
            })?;
            Ok(message)
        })
        .await?;

        self.publish(&message).await;
        Ok(message)
    }

    pub async fn list(&self, user_id: Uuid, channel_id: Uuid, filter: MessageFilter) -> Result<Vec<Message>> {
        blocking(&self.store, move |store| {
            let (_, _, access) = access::resolve(store, user_id, channel_id)?;
            access.require_read()?;
            Ok(store.query_messages(channel_id, &filter)?)
        })
        .await
    }

    /// Read check without side effects, used ahead of a WebSocket upgrade.
    pub async fn check_read(&self, user_id: Uuid, channel_id: Uuid) -> Result<()> {
        blocking(&self.store, move |store| {
            let (_, _, access) = access::resolve(store, user_id, channel_id)?;
            access.require_read()
        })
        .await
    }

    /// Joins `subscriber` to the channel's live feed once read access holds.
    pub async fn subscribe(&self, user_id: Uuid, channel_id: Uuid, subscriber: &Subscriber) -> Result<()> {
        self.check_read(user_id, channel_id).await?;
        match self.hub.join(channel_id, subscriber).await {
            JoinOutcome::Added | JoinOutcome::AlreadyJoined => Ok(()),
            JoinOutcome::HubClosed => Err(Error::Internal(anyhow::anyhow!("connection hub is shut down"))),
            JoinOutcome::Disconnected => Err(Error::Internal(anyhow::anyhow!(
                "connection {} closed before joining {}",
                subscriber.id(),
                channel_id
            ))),
        }
    }

    /// Best-effort fan-out of a committed message. Never fails the caller.
    async fn publish(&self, message: &Message) {
        let event = GatewayEvent::MessageCreated {
            message: message.clone(),
        };
        let payload = match event.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize message {}: {}", message.id, e);
                return;
            }
        };

        let delivered = self.hub.broadcast(message.channel_id, payload).await;
        debug!(
            "Message {} delivered to {} subscribers of {}",
            message.id, delivered, message.channel_id
        );
    }

    async fn take_turn(&self, channel_id: Uuid) -> Turn<'_> {
        let lock = self
            .sequencers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(channel_id)
            .or_default()
            .clone();
        Turn {
            sequencers: &self.sequencers,
            channel_id,
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn sequenced_channels(&self) -> usize {
        self.sequencers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl<S> SubscriptionGate for MessageService<S>
where
    S: MembershipStore + MessageStore + 'static,
{
    async fn subscribe(&self, user_id: Uuid, channel_id: Uuid, subscriber: &Subscriber) -> Result<()> {
        MessageService::subscribe(self, user_id, channel_id, subscriber).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parlor_db::Database;
    use parlor_types::models::{Channel, Role};

    struct Fixture {
        db: Arc<Database>,
        service: MessageService<Database>,
        alice: Uuid,
        bob: Uuid,
        workspace: Uuid,
    }

    /// Alice owns workspace W; Bob is a plain member of W.
    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let alice = db.ensure_user("auth|alice", None, Some("Alice")).unwrap();
        let bob = db.ensure_user("auth|bob", None, Some("Bob")).unwrap();
        let workspace = db.create_workspace(alice, "W").unwrap().id;
        db.add_workspace_member(bob, workspace, Role::Member).unwrap();

        let service = MessageService::new(db.clone(), ConnectionHub::new());
        Fixture {
            db,
            service,
            alice,
            bob,
            workspace,
        }
    }

    fn channel(fx: &Fixture, name: &str, is_private: bool) -> Channel {
        fx.db
            .create_channel(fx.workspace, name, is_private, fx.alice)
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn private_channel_thread_scenario() {
        let fx = fixture();
        let c = channel(&fx, "secret", true);

        let err = fx.service.list(fx.bob, c.id, MessageFilter::default()).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));

        let m1 = fx.service.create(fx.alice, c.id, "M1".into(), None).await.unwrap();
        assert_eq!(m1.thread_root_id, None);

        let m2 = fx.service.create(fx.alice, c.id, "M2".into(), Some(m1.id)).await.unwrap();
        assert_eq!(m2.parent_id, Some(m1.id));
        assert_eq!(m2.thread_root_id, Some(m1.id));

        let m3 = fx.service.create(fx.alice, c.id, "M3".into(), Some(m2.id)).await.unwrap();
        assert_eq!(m3.parent_id, Some(m2.id));
        assert_eq!(m3.thread_root_id, Some(m1.id));

        let thread = fx
            .service
            .list(fx.alice, c.id, MessageFilter::new(Some(m1.id), false, None, None))
            .await
            .unwrap();
        assert_eq!(thread, vec![m2, m3]);
    }

    #[tokio::test]
    async fn public_channel_read_only_for_workspace_members() {
        let fx = fixture();
        let c = channel(&fx, "general", false);
        fx.service.create(fx.alice, c.id, "hello".into(), None).await.unwrap();

        let seen = fx.service.list(fx.bob, c.id, MessageFilter::default()).await.unwrap();
        assert_eq!(seen.len(), 1);

        let err = fx.service.create(fx.bob, c.id, "me too".into(), None).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
        assert_eq!(fx.service.list(fx.alice, c.id, MessageFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejected_create_leaves_no_message() {
        let fx = fixture();
        let c = channel(&fx, "general", false);
        let other = channel(&fx, "random", false);
        let foreign = fx.service.create(fx.alice, other.id, "elsewhere".into(), None).await.unwrap();

        let err = fx.service.create(fx.alice, c.id, "x".into(), Some(foreign.id)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let err = fx.service.create(fx.alice, c.id, "x".into(), Some(Uuid::new_v4())).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let err = fx.service.create(fx.alice, c.id, "   ".into(), None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        assert!(fx.service.list(fx.alice, c.id, MessageFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_channel_is_not_found() {
        let fx = fixture();
        let err = fx.service.create(fx.alice, Uuid::new_v4(), "x".into(), None).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        let err = fx.service.list(fx.alice, Uuid::new_v4(), MessageFilter::default()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn created_message_reaches_subscribers() {
        let fx = fixture();
        let c = channel(&fx, "general", false);
        let d = channel(&fx, "random", false);

        let (x, mut x_rx) = Subscriber::new();
        let (y, mut y_rx) = Subscriber::new();
        fx.service.subscribe(fx.bob, c.id, &x).await.unwrap();
        fx.service.subscribe(fx.bob, d.id, &y).await.unwrap();

        let m = fx.service.create(fx.alice, c.id, "live".into(), None).await.unwrap();

        let payload = x_rx.recv().await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(json["type"], "message_created");
        assert_eq!(json["message"]["id"], m.id.to_string());
        assert!(y_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscribe_to_private_channel_requires_membership() {
        let fx = fixture();
        let c = channel(&fx, "secret", true);
        let (sub, _rx) = Subscriber::new();

        let err = fx.service.subscribe(fx.bob, c.id, &sub).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
        assert_eq!(fx.service.hub().subscriber_count(c.id).await, 0);

        fx.db.add_channel_member(fx.bob, c.id, Role::Member).unwrap();
        fx.service.subscribe(fx.bob, c.id, &sub).await.unwrap();
        assert_eq!(fx.service.hub().subscriber_count(c.id).await, 1);
    }

    #[tokio::test]
    async fn broadcasts_follow_commit_order() {
        let fx = fixture();
        let c = channel(&fx, "general", false);
        let (sub, mut rx) = Subscriber::new();
        fx.service.subscribe(fx.alice, c.id, &sub).await.unwrap();

        let service = Arc::new(fx.service);
        let mut tasks = Vec::new();
        for i in 0..8 {
            let service = service.clone();
            let (alice, channel_id) = (fx.alice, c.id);
            tasks.push(tokio::spawn(async move {
                service.create(alice, channel_id, format!("m{}", i), None).await.unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let stored: Vec<String> = service
            .list(fx.alice, c.id, MessageFilter::default())
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id.to_string())
            .collect();

        let mut delivered = Vec::new();
        while let Ok(payload) = rx.try_recv() {
            let json: serde_json::Value = serde_json::from_str(&payload).unwrap();
            delivered.push(json["message"]["id"].as_str().unwrap().to_string());
        }
        assert_eq!(delivered, stored);
    }

    #[tokio::test]
    async fn subscribe_fails_once_hub_is_shut_down() {
        let fx = fixture();
        let c = channel(&fx, "general", false);
        let (sub, _rx) = Subscriber::new();

        fx.service.hub().shutdown().await;
        let err = fx.service.subscribe(fx.alice, c.id, &sub).await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert_eq!(fx.service.hub().subscriber_count(c.id).await, 0);
    }

    #[tokio::test]
    async fn subscribe_fails_for_a_closed_connection() {
        let fx = fixture();
        let c = channel(&fx, "general", false);
        let (sub, rx) = Subscriber::new();
        drop(rx);

        assert!(fx.service.subscribe(fx.alice, c.id, &sub).await.is_err());
        assert_eq!(fx.service.hub().subscriber_count(c.id).await, 0);
    }

    #[tokio::test]
    async fn channel_turns_are_forgotten_when_idle() {
        let fx = fixture();
        let c = channel(&fx, "general", false);
        let d = channel(&fx, "random", false);

        fx.service.create(fx.alice, c.id, "one".into(), None).await.unwrap();
        fx.service.create(fx.bob, d.id, "denied".into(), None).await.unwrap_err();
        assert_eq!(fx.service.sequenced_channels(), 0);

        let service = Arc::new(fx.service);
        let tasks: Vec<_> = (0..6)
            .map(|i| {
                let service = service.clone();
                let (alice, channel_id) = (fx.alice, if i % 2 == 0 { c.id } else { d.id });
                tokio::spawn(async move { service.create(alice, channel_id, format!("m{}", i), None).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(service.sequenced_channels(), 0);
    }
}
