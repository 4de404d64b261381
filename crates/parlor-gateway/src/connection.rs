use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tracing::{error, info, warn};
use uuid::Uuid;

use parlor_types::error::{Error, Result};
use parlor_types::events::{GatewayCommand, GatewayEvent};

use crate::hub::{ConnectionHub, Subscriber};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Read-gated entry into the hub. Implementors check that `user_id` may read
/// `channel_id` and, if so, join `subscriber` to it.
pub trait SubscriptionGate: Send + Sync + 'static {
    fn subscribe(
        &self,
        user_id: Uuid,
        channel_id: Uuid,
        subscriber: &Subscriber,
    ) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Upgraded, not joined to any channel
    Connecting = 0,
    /// Joined to at least one channel
    Joined = 1,
    /// Tearing down registrations
    Leaving = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Connecting,
            1 => Self::Joined,
            2 => Self::Leaving,
            _ => Self::Closed,
        }
    }

    fn can_advance_to(self, next: Self) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Joined)
                | (Joined, Joined)
                | (Joined, Connecting)
                | (Connecting, Leaving)
                | (Joined, Leaving)
                | (Leaving, Closed)
        )
    }
}

/// Lifecycle of one connection, shared between its send and receive tasks.
#[derive(Debug)]
pub struct ConnectionLifecycle {
    state: AtomicU8,
}

impl ConnectionLifecycle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Connecting as u8),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves to `next` if the transition is legal from the current state.
    pub fn advance(&self, next: ConnectionState) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                ConnectionState::from_u8(raw)
                    .can_advance_to(next)
                    .then_some(next as u8)
            })
            .is_ok()
    }
}

impl Default for ConnectionLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle a pre-authenticated WebSocket connection.
/// The token (and, when given, read access to `initial_channel`) was checked
/// at the HTTP upgrade layer, so the loop starts straight away.
pub async fn handle_connection<G: SubscriptionGate>(
    socket: WebSocket,
    hub: ConnectionHub,
    gate: Arc<G>,
    user_id: Uuid,
    initial_channel: Option<Uuid>,
) {
    let (sender, receiver) = socket.split();
    run_connection(sender, receiver, hub, gate, user_id, initial_channel).await;
}

/// Connection loop over any message sink/stream pair. Returns only after
/// both halves have stopped and every hub registration is released.
pub async fn run_connection<G, Tx, Rx, E>(
    mut sender: Tx,
    mut receiver: Rx,
    hub: ConnectionHub,
    gate: Arc<G>,
    user_id: Uuid,
    initial_channel: Option<Uuid>,
) where
    G: SubscriptionGate,
    Tx: Sink<Message> + Unpin + Send + 'static,
    Rx: Stream<Item = std::result::Result<Message, E>> + Unpin + Send + 'static,
    E: Send + 'static,
{
    let (subscriber, mut outbound_rx) = Subscriber::new();
    let conn_id = subscriber.id();
    let lifecycle = Arc::new(ConnectionLifecycle::new());

    info!("User {} connected to gateway as {}", user_id, conn_id);

    if let Some(channel_id) = initial_channel {
        let reply = handle_command(
            gate.as_ref(),
            &hub,
            &subscriber,
            &lifecycle,
            user_id,
            GatewayCommand::Subscribe { channel_id },
        )
        .await;
        deliver_event(&subscriber, &reply);
    }

    // Shared flag for heartbeat
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward hub payloads and acknowledgements -> client, with heartbeat
    let send_hub = hub.clone();
    let mut send_task = tokio::spawn(async move {
        let closed = send_hub.closed();
        tokio::pin!(closed);

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                payload = outbound_rx.recv() => {
                    let Some(payload) = payload else { break };
                    if sender.send(Message::Text(payload.to_string().into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
                _ = &mut closed => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    // Read commands from client
    let recv_hub = hub.clone();
    let recv_lifecycle = lifecycle.clone();
    let recv_subscriber = subscriber.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        let reply = handle_command(
                            gate.as_ref(),
                            &recv_hub,
                            &recv_subscriber,
                            &recv_lifecycle,
                            user_id,
                            cmd,
                        )
                        .await;
                        deliver_event(&recv_subscriber, &reply);
                    }
                    Err(e) => {
                        warn!(
                            "User {} ({}) bad command: {} -- raw: {}",
                            user_id,
                            conn_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                        deliver_event(
                            &recv_subscriber,
                            &GatewayEvent::Error {
                                detail: "malformed command".into(),
                            },
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish, then for the other to actually stop.
    // An aborted recv task may still be inside a subscribe.
    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
            let _ = recv_task.await;
        }
        _ = &mut recv_task => {
            send_task.abort();
            let _ = send_task.await;
        }
    }

    lifecycle.advance(ConnectionState::Leaving);
    let released = hub.leave_all(conn_id).await;
    lifecycle.advance(ConnectionState::Closed);

    info!(
        "User {} disconnected from gateway ({} subscriptions released)",
        user_id, released
    );
}

/// Applies one client command and returns the event to send back.
pub async fn handle_command<G: SubscriptionGate>(
    gate: &G,
    hub: &ConnectionHub,
    subscriber: &Subscriber,
    lifecycle: &ConnectionLifecycle,
    user_id: Uuid,
    cmd: GatewayCommand,
) -> GatewayEvent {
    match cmd {
        GatewayCommand::Subscribe { channel_id } => {
            match gate.subscribe(user_id, channel_id, subscriber).await {
                Ok(()) => {
                    lifecycle.advance(ConnectionState::Joined);
                    info!("User {} subscribed to channel {}", user_id, channel_id);
                    GatewayEvent::Subscribed { channel_id }
                }
                Err(e) => rejection(user_id, channel_id, e),
            }
        }

        GatewayCommand::Unsubscribe { channel_id } => {
            hub.leave(channel_id, subscriber.id()).await;
            if hub.channels_of(subscriber.id()).await.is_empty() {
                lifecycle.advance(ConnectionState::Connecting);
            }
            GatewayEvent::Unsubscribed { channel_id }
        }
    }
}

fn rejection(user_id: Uuid, channel_id: Uuid, err: Error) -> GatewayEvent {
    let detail = if err.is_rejection() {
        warn!("User {} denied subscription to {}: {}", user_id, channel_id, err);
        err.to_string()
    } else {
        error!(error = %err, "Subscription to {} failed", channel_id);
        "internal server error".to_string()
    };
    GatewayEvent::Error { detail }
}

fn deliver_event(subscriber: &Subscriber, event: &GatewayEvent) {
    match event.to_payload() {
        Ok(payload) => {
            subscriber.deliver(payload);
        }
        Err(e) => error!("Failed to serialize gateway event: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use crate::hub::Payload;
    use std::convert::Infallible;
    use tokio::sync::mpsc;

    struct AllowList {
        hub: ConnectionHub,
        readable: HashSet<Uuid>,
    }

    impl SubscriptionGate for AllowList {
        async fn subscribe(&self, _user_id: Uuid, channel_id: Uuid, subscriber: &Subscriber) -> Result<()> {
            if !self.readable.contains(&channel_id) {
                return Err(Error::forbidden("channel is not readable"));
            }
            if self.hub.join(channel_id, subscriber).await.is_registered() {
                Ok(())
            } else {
                Err(Error::forbidden("connection hub refused the join"))
            }
        }
    }

    /// In-memory stand-in for a socket: the test keeps the client ends.
    struct ClientEnd {
        outgoing: Option<mpsc::UnboundedSender<Message>>,
        incoming: mpsc::UnboundedReceiver<Message>,
    }

    impl ClientEnd {
        fn send(&self, json: serde_json::Value) {
            if let Some(tx) = &self.outgoing {
                tx.send(Message::Text(json.to_string().into())).unwrap();
            }
        }

        async fn next_text(&mut self) -> serde_json::Value {
            loop {
                let msg = tokio::time::timeout(Duration::from_secs(2), self.incoming.recv())
                    .await
                    .expect("server should reply")
                    .expect("server side still open");
                if let Message::Text(text) = msg {
                    return serde_json::from_str(text.as_str()).unwrap();
                }
            }
        }
    }

    fn spawn_loop(
        hub: &ConnectionHub,
        readable: &[Uuid],
        initial_channel: Option<Uuid>,
    ) -> (ClientEnd, tokio::task::JoinHandle<()>) {
        let (client_tx, server_rx) = mpsc::unbounded_channel::<Message>();
        let (server_tx, client_rx) = mpsc::unbounded_channel::<Message>();

        let sink = Box::pin(futures_util::sink::unfold(server_tx, |tx, msg: Message| async move {
            tx.send(msg).map(|()| tx).map_err(|_| ())
        }));
        let stream = Box::pin(futures_util::stream::unfold(server_rx, |mut rx| async move {
            rx.recv().await.map(|msg| (Ok::<_, Infallible>(msg), rx))
        }));
        let gate = Arc::new(AllowList {
            hub: hub.clone(),
            readable: readable.iter().copied().collect(),
        });

        let handle = tokio::spawn(run_connection(
            sink,
            stream,
            hub.clone(),
            gate,
            Uuid::new_v4(),
            initial_channel,
        ));
        let client = ClientEnd {
            outgoing: Some(client_tx),
            incoming: client_rx,
        };
        (client, handle)
    }

    async fn finished(handle: tokio::task::JoinHandle<()>) {
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("connection loop should exit")
            .unwrap();
    }

    fn text(payload: Option<Payload>) -> String {
        payload.map(|p| p.to_string()).unwrap_or_default()
    }

    #[test]
    fn lifecycle_transitions() {
        let lifecycle = ConnectionLifecycle::new();
        assert_eq!(lifecycle.state(), ConnectionState::Connecting);
        assert!(!lifecycle.advance(ConnectionState::Closed));
        assert!(lifecycle.advance(ConnectionState::Joined));
        assert!(lifecycle.advance(ConnectionState::Joined));
        assert!(lifecycle.advance(ConnectionState::Leaving));
        assert!(!lifecycle.advance(ConnectionState::Joined));
        assert!(lifecycle.advance(ConnectionState::Closed));
        assert!(!lifecycle.advance(ConnectionState::Leaving));
        assert_eq!(lifecycle.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn subscribe_goes_through_gate() {
        let hub = ConnectionHub::new();
        let (open, closed) = (Uuid::new_v4(), Uuid::new_v4());
        let gate = AllowList {
            hub: hub.clone(),
            readable: HashSet::from([open]),
        };
        let (sub, mut rx) = Subscriber::new();
        let lifecycle = ConnectionLifecycle::new();
        let user = Uuid::new_v4();

        let denied = handle_command(&gate, &hub, &sub, &lifecycle, user, GatewayCommand::Subscribe { channel_id: closed }).await;
        assert!(matches!(denied, GatewayEvent::Error { .. }));
        assert_eq!(lifecycle.state(), ConnectionState::Connecting);
        assert_eq!(hub.subscriber_count(closed).await, 0);

        let granted = handle_command(&gate, &hub, &sub, &lifecycle, user, GatewayCommand::Subscribe { channel_id: open }).await;
        assert!(matches!(granted, GatewayEvent::Subscribed { channel_id } if channel_id == open));
        assert_eq!(lifecycle.state(), ConnectionState::Joined);

        hub.broadcast(open, Arc::from("ping")).await;
        assert_eq!(text(rx.recv().await), "ping");
    }

    #[tokio::test]
    async fn unsubscribe_returns_to_connecting() {
        let hub = ConnectionHub::new();
        let channel = Uuid::new_v4();
        let gate = AllowList {
            hub: hub.clone(),
            readable: HashSet::from([channel]),
        };
        let (sub, mut rx) = Subscriber::new();
        let lifecycle = ConnectionLifecycle::new();
        let user = Uuid::new_v4();

        handle_command(&gate, &hub, &sub, &lifecycle, user, GatewayCommand::Subscribe { channel_id: channel }).await;
        let reply = handle_command(&gate, &hub, &sub, &lifecycle, user, GatewayCommand::Unsubscribe { channel_id: channel }).await;
        assert!(matches!(reply, GatewayEvent::Unsubscribed { .. }));
        assert_eq!(lifecycle.state(), ConnectionState::Connecting);

        assert_eq!(hub.broadcast(channel, Arc::from("after")).await, 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn acknowledgements_reach_only_this_connection() {
        let (sub, mut rx) = Subscriber::new();
        let channel_id = Uuid::new_v4();
        deliver_event(&sub, &GatewayEvent::Subscribed { channel_id });

        let json: serde_json::Value = serde_json::from_str(&text(rx.try_recv().ok())).unwrap();
        assert_eq!(json["type"], "subscribed");
        assert_eq!(json["channel_id"], channel_id.to_string());
    }

    #[tokio::test]
    async fn client_going_away_releases_registrations() {
        let hub = ConnectionHub::new();
        let (general, random) = (Uuid::new_v4(), Uuid::new_v4());
        let (mut client, handle) = spawn_loop(&hub, &[general, random], Some(general));

        assert_eq!(client.next_text().await["type"], "subscribed");
        client.send(serde_json::json!({ "type": "subscribe", "channel_id": random }));
        assert_eq!(client.next_text().await["channel_id"], random.to_string());
        assert_eq!(hub.subscriber_count(general).await, 1);
        assert_eq!(hub.subscriber_count(random).await, 1);

        client.outgoing = None;
        finished(handle).await;

        assert_eq!(hub.subscriber_count(general).await, 0);
        assert_eq!(hub.subscriber_count(random).await, 0);
    }

    #[tokio::test]
    async fn hub_shutdown_closes_the_socket() {
        let hub = ConnectionHub::new();
        let channel = Uuid::new_v4();
        let (mut client, handle) = spawn_loop(&hub, &[channel], Some(channel));
        assert_eq!(client.next_text().await["type"], "subscribed");

        hub.shutdown().await;
        finished(handle).await;

        assert_eq!(hub.subscriber_count(channel).await, 0);
        let mut saw_close = false;
        while let Ok(msg) = client.incoming.try_recv() {
            saw_close |= matches!(msg, Message::Close(_));
        }
        assert!(saw_close);
    }

    #[tokio::test]
    async fn malformed_and_denied_commands_keep_the_loop_alive() {
        let hub = ConnectionHub::new();
        let (open, hidden) = (Uuid::new_v4(), Uuid::new_v4());
        let (mut client, handle) = spawn_loop(&hub, &[open], None);

        client.send(serde_json::json!({ "type": "shout" }));
        assert_eq!(client.next_text().await["detail"], "malformed command");

        client.send(serde_json::json!({ "type": "subscribe", "channel_id": hidden }));
        assert_eq!(client.next_text().await["type"], "error");
        assert_eq!(hub.subscriber_count(hidden).await, 0);

        client.send(serde_json::json!({ "type": "subscribe", "channel_id": open }));
        assert_eq!(client.next_text().await["type"], "subscribed");
        client.send(serde_json::json!({ "type": "unsubscribe", "channel_id": open }));
        assert_eq!(client.next_text().await["type"], "unsubscribed");
        assert_eq!(hub.subscriber_count(open).await, 0);

        client.outgoing = None;
        finished(handle).await;
    }
}
