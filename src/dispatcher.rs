//! # Event Dispatcher
//!
//! Every asynchronous outcome the core produces is funnelled through one ordered FIFO. The
//! engine appends in the order it processes protocol input; the runtime drains from the
//! front into the host channel. Nothing is ever removed except by [`EventDispatcher::pop`].

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;

use embassy_time::Duration;

use crate::delivery::LocalId;
use crate::error::{DisconnectReason, MqttError};
use crate::packet::QoS;

/// An application message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Events delivered to the host, in processing order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// CONNACK accepted. `reconnect` is set when this follows an unplanned drop.
    Connected { session_present: bool, reconnect: bool },
    Disconnected(DisconnectReason),
    /// A reconnect attempt has been scheduled after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    /// The initial connect failed or the reconnect budget ran out.
    ConnectionFailed(MqttError),
    Message(Message),
    Subscribed { filter: String, granted: QoS },
    SubscriptionError { filter: String, reason: MqttError },
    Unsubscribed { filter: String },
    DeliveryComplete(LocalId),
    DeliveryFailed(LocalId, MqttError),
    /// The client was shut down permanently.
    Closed,
}

/// Ordered, unbounded event FIFO.
#[derive(Debug, Default)]
pub struct EventDispatcher {
    queue: VecDeque<Event>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, event: Event) {
        self.queue.push_back(event);
    }

    pub fn peek(&self) -> Option<&Event> {
        self.queue.front()
    }

    pub fn pop(&mut self) -> Option<Event> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
