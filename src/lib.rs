//! # MQTT Bridge Core
//!
//! `mqtt-bridge-core` is a `no_std` (with `alloc`) MQTT 3.1.1 client core meant to sit between
//! a host application and a broker. The host issues commands and receives an ordered stream
//! of events; the core owns everything in between: framing, session state, subscriptions,
//! QoS 1/2 handshakes, keep-alive and reconnects.
//!
//! ## Core Features
//!
//! - **Single writer:** all protocol state lives in one [`Engine`](engine::Engine) that is only
//!   mutated from the runtime task, so no locks are needed around it.
//! - **Sans-I/O engine:** the engine consumes bytes, commands and timestamps and produces
//!   frames and events; the async [`runtime`] and the [`MqttTransport`] trait connect it to
//!   a real network. Tests drive the engine directly with a scripted broker.
//! - **Built on Embassy:** `embassy-sync` channels between host and runtime, `embassy-time`
//!   for timers and `embassy-net` for the bundled TCP transport.
//! - **Bounded in-flight window:** QoS 1/2 messages beyond `max_inflight` wait in an ordered
//!   queue and are replayed in order after a reconnect.
//! - **Automatic reconnect:** exponential backoff with jitter, subscription replay and
//!   optional attempt limits.
//!
//! ## Architecture
//!
//! ```text
//!   host tasks ──MqttClient──▶ CommandChannel ──▶ MqttRuntime ──▶ MqttTransport ──▶ broker
//!   host tasks ◀─EventStream── EventChannel  ◀──┘    │
//!                                                   Engine
//!                       (connection · subscriptions · delivery · dispatcher)
//! ```
//!
//! ```ignore
//! use mqtt_bridge_core::{ConnectOptions, Event, QoS};
//!
//! client.connect(endpoint, ConnectOptions::new("sensor-01")).await?;
//! client.subscribe("sensors/+/cmd", QoS::AtLeastOnce).await?;
//! let id = client.publish("sensors/01/state", b"on", QoS::AtLeastOnce, false).await?;
//!
//! loop {
//!     match events.next().await {
//!         Event::Message(msg) => handle(msg),
//!         Event::DeliveryComplete(done) if done == id => {}
//!         _ => {}
//!     }
//! }
//! ```
//!
//! ## Logging
//!
//! Enable exactly one of the `log`, `defmt` or `esp32-log` features to route the crate's
//! diagnostics to that backend. Without any of them logging compiles away.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
mod fmt;

pub mod connection;
pub mod delivery;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod options;
pub mod outbox;
pub mod packet;
pub mod packet_id;
pub mod runtime;
pub mod subscriptions;
pub mod topic;
pub mod transport;
pub mod util;

// Re-export key types for easier access at the crate root.
pub use connection::ConnectionState;
pub use delivery::{DeliveryStatus, LocalId};
pub use dispatcher::{Event, Message};
pub use engine::{ClientStatus, Engine};
pub use error::{ConnectReturnCode, DisconnectReason, MqttError, ProtocolError};
pub use options::{ConnectOptions, DeliveryMode, EngineConfig, Will};
pub use outbox::Output;
pub use packet::QoS;
pub use runtime::{CommandChannel, EventChannel, EventStream, MqttClient, MqttRuntime};
pub use subscriptions::{SubscribeOutcome, Subscription, SubscriptionStatus};
pub use transport::{MqttTransport, TcpTransport};
