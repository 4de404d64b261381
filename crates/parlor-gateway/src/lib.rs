pub mod connection;
pub mod hub;

pub use connection::{ConnectionLifecycle, ConnectionState, SubscriptionGate, handle_connection, run_connection};
pub use hub::{ConnectionHub, ConnectionId, JoinOutcome, Payload, Subscriber};
