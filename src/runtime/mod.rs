//! MQTT Runtime Module
//!
//! Async plumbing around the sans-I/O [`Engine`](crate::engine::Engine).
//!
//! # Overview
//!
//! - [`MqttRuntime`] owns the transport and the engine and runs the event loop in one task.
//! - [`MqttClient`] is a copyable handle that sends commands to the runtime.
//! - [`EventStream`] receives the events the runtime forwards.
//!
//! The channels live outside all three, typically in `static` cells, so the handles can be
//! passed to other tasks:
//!
//! ```ignore
//! static COMMANDS: CommandChannel<IpEndpoint, 4> = CommandChannel::new();
//! static EVENTS: EventChannel<16> = EventChannel::new();
//!
//! let mut runtime: MqttRuntime<_, 4, 16, 1024> =
//!     MqttRuntime::new(TcpTransport::new(socket), &COMMANDS, &EVENTS, EngineConfig::default());
//! let client = MqttClient::new(&COMMANDS);
//! let events = EventStream::new(&EVENTS);
//! ```

pub(crate) mod client;
pub(crate) mod event_loop;

pub use client::{Command, CommandChannel, EventChannel, EventStream, MqttClient, Reply};
pub use event_loop::MqttRuntime;
