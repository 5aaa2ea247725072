//! Host-facing handles: the command side ([`MqttClient`]) and the event side
//! ([`EventStream`]).
//!
//! Both wrap `embassy-sync` channels shared with the [`MqttRuntime`](super::MqttRuntime), so
//! they can be copied into as many tasks as needed. Commands carry a oneshot reply; if the
//! runtime drops a command without answering, the call resolves to [`MqttError::Cancelled`].
//! Once the runtime has shut down, the command channel is marked closed and every later call
//! resolves to `Cancelled` without waiting.

use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, Receiver};
use futures::channel::oneshot;

use crate::delivery::LocalId;
use crate::dispatcher::Event;
use crate::engine::ClientStatus;
use crate::error::MqttError;
use crate::options::ConnectOptions;
use crate::packet::QoS;

/// Answer slot for a [`Command`].
pub type Reply<T> = oneshot::Sender<T>;

/// A request from the host to the runtime.
pub enum Command<E> {
    Connect {
        endpoint: E,
        options: ConnectOptions,
        reply: Reply<Result<(), MqttError>>,
    },
    Reconnect {
        reply: Reply<Result<(), MqttError>>,
    },
    Disconnect {
        reply: Reply<()>,
    },
    Shutdown {
        reply: Reply<()>,
    },
    Subscribe {
        filter: String,
        qos: QoS,
        reply: Reply<Result<(), MqttError>>,
    },
    Unsubscribe {
        filter: String,
        reply: Reply<Result<(), MqttError>>,
    },
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
        reply: Reply<Result<LocalId, MqttError>>,
    },
    Status {
        reply: Reply<ClientStatus>,
    },
}

/// Carries commands from [`MqttClient`] handles to the runtime.
pub struct CommandChannel<E, const DEPTH: usize> {
    channel: Channel<CriticalSectionRawMutex, Command<E>, DEPTH>,
    closed: AtomicBool,
}

impl<E, const DEPTH: usize> CommandChannel<E, DEPTH> {
    pub const fn new() -> Self {
        Self {
            channel: Channel::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn receiver(&self) -> Receiver<'_, CriticalSectionRawMutex, Command<E>, DEPTH> {
        self.channel.receiver()
    }

    /// Refuses further commands and drops the queued ones, cancelling their callers.
    /// Returns how many were dropped.
    pub(crate) fn close(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        self.discard()
    }

    fn discard(&self) -> usize {
        let mut dropped = 0;
        while self.channel.try_receive().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

impl<E, const DEPTH: usize> Default for CommandChannel<E, DEPTH> {
    fn default() -> Self {
        Self::new()
    }
}

pub type EventChannel<const DEPTH: usize> = Channel<CriticalSectionRawMutex, Event, DEPTH>;

/// A handle that lets any task drive the client without owning it.
///
/// This handle wraps a channel sender and can be copied and passed to multiple
/// tasks. The runtime receives the commands and applies them in arrival order.
pub struct MqttClient<'a, E, const DEPTH: usize> {
    commands: &'a CommandChannel<E, DEPTH>,
}

impl<E, const DEPTH: usize> Clone for MqttClient<'_, E, DEPTH> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E, const DEPTH: usize> Copy for MqttClient<'_, E, DEPTH> {}

impl<'a, E, const DEPTH: usize> MqttClient<'a, E, DEPTH> {
    pub fn new(channel: &'a CommandChannel<E, DEPTH>) -> Self {
        Self { commands: channel }
    }

    async fn request<R>(&self, command: impl FnOnce(Reply<R>) -> Command<E>) -> Result<R, MqttError> {
        if self.commands.is_closed() {
            return Err(MqttError::Cancelled);
        }
        let (reply, response) = oneshot::channel();
        self.commands.channel.send(command(reply)).await;
        // The runtime may have closed between the check and the send; nobody will receive.
        if self.commands.is_closed() {
            self.commands.discard();
        }
        response.await.map_err(|_| MqttError::Cancelled)
    }

    /// Connects to `endpoint`, resolving once the broker accepted or refused the session.
    pub async fn connect(&self, endpoint: E, options: ConnectOptions) -> Result<(), MqttError> {
        self.request(|reply| Command::Connect {
            endpoint,
            options,
            reply,
        })
        .await?
    }

    /// Reconnects with the previous endpoint and options.
    pub async fn reconnect(&self) -> Result<(), MqttError> {
        self.request(|reply| Command::Reconnect { reply }).await?
    }

    pub async fn disconnect(&self) -> Result<(), MqttError> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Disconnects and stops the runtime. Later commands fail with `Cancelled`.
    pub async fn shutdown(&self) -> Result<(), MqttError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    /// Registers a topic filter. The broker's answer arrives as a `Subscribed` or
    /// `SubscriptionError` event.
    pub async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), MqttError> {
        let filter = String::from(filter);
        self.request(|reply| Command::Subscribe { filter, qos, reply })
            .await?
    }

    pub async fn unsubscribe(&self, filter: &str) -> Result<(), MqttError> {
        let filter = String::from(filter);
        self.request(|reply| Command::Unsubscribe { filter, reply })
            .await?
    }

    /// Accepts a message for delivery. Completion is reported by a `DeliveryComplete` or
    /// `DeliveryFailed` event carrying the returned id.
    pub async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<LocalId, MqttError> {
        let topic = String::from(topic);
        let payload = payload.to_vec();
        self.request(|reply| Command::Publish {
            topic,
            payload,
            qos,
            retain,
            reply,
        })
        .await?
    }

    pub async fn status(&self) -> Result<ClientStatus, MqttError> {
        self.request(|reply| Command::Status { reply }).await
    }
}

/// The receiving end of the event channel.
pub struct EventStream<'a, const DEPTH: usize> {
    rx: Receiver<'a, CriticalSectionRawMutex, Event, DEPTH>,
}

impl<'a, const DEPTH: usize> EventStream<'a, DEPTH> {
    pub fn new(channel: &'a EventChannel<DEPTH>) -> Self {
        Self {
            rx: channel.receiver(),
        }
    }

    /// Waits for the next event.
    pub async fn next(&self) -> Event {
        self.rx.receive().await
    }

    pub fn try_next(&self) -> Option<Event> {
        self.rx.try_receive().ok()
    }
}
