//! WebSocket broadcast relay.
//!
//! Every message any client sends is relayed to every connected client.
//! Each module focuses on a concrete responsibility:
//!
//! - [`registry`] is the single authoritative record of open connections,
//!   with admission limits and per-connection bounded queues.
//! - [`dispatcher`] fans an inbound message out to a snapshot of the
//!   registry, handling vanished and slow recipients one by one.
//! - [`connection`] holds connection ids, the `Open -> Closing -> Closed`
//!   state machine and the transport-facing [`connection::Outbox`].
//! - [`message`] defines inbound messages, outbound frames and the
//!   formatter that decorates relayed payloads.
//! - [`server`] is the WebSocket front end built on `tokio-tungstenite`.
//! - [`client`] and [`load`] are the terminal client and load generator.
//! - [`cli`], [`config`], [`error`] and [`stats`] are the supporting plumbing.
//!
//! The integration tests drive the registry and dispatcher directly and
//! exercise the server over real sockets.

pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod load;
pub mod message;
pub mod registry;
pub mod server;
pub mod stats;

pub use config::{RelayConfig, SlowConsumerPolicy};
pub use connection::{ConnectionId, ConnectionState, Outbox};
pub use dispatcher::{BroadcastPolicy, DeliveryFailure, DispatchReport, Dispatcher};
pub use error::RelayError;
pub use message::{Formatter, Frame, FrameKind, Message};
pub use registry::Registry;
pub use server::Relay;
pub use stats::{RelayStats, StatsSnapshot};
