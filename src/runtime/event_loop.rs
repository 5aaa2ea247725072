//! The async driver around [`Engine`].
//!
//! One task owns the runtime and calls [`MqttRuntime::run`]. Each loop iteration executes the
//! engine's pending transport instructions, forwards events to the host, then waits for
//! whichever comes first: a host command, inbound bytes, the engine's next timer, or (in
//! buffered mode) room in the event channel.

use core::future::{pending, poll_fn};

use embassy_futures::select::{Either4, select4};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Sender;
use embassy_time::{Instant, Timer, with_timeout};

use super::client::{Command, CommandChannel, EventChannel, Reply};
use crate::connection::ConnectionState;
use crate::dispatcher::Event;
use crate::engine::Engine;
use crate::error::MqttError;
use crate::options::{DeliveryMode, EngineConfig};
use crate::outbox::Output;
use crate::packet::FrameBuffer;
use crate::transport::MqttTransport;

/// Owns the transport and the protocol engine.
///
/// # Type Parameters
///
/// - `CMD`: depth of the command channel
/// - `EVT`: depth of the event channel
/// - `BUF`: receive buffer size, which is also the largest inbound frame accepted
pub struct MqttRuntime<'a, T, const CMD: usize, const EVT: usize, const BUF: usize>
where
    T: MqttTransport,
{
    transport: T,
    engine: Engine,
    commands: &'a CommandChannel<T::Endpoint, CMD>,
    events: Sender<'a, CriticalSectionRawMutex, Event, EVT>,
    endpoint: Option<T::Endpoint>,
    rx: FrameBuffer<BUF>,
    open: bool,
    pending_connect: Option<Reply<Result<(), MqttError>>>,
    pending_shutdown: Option<Reply<()>>,
}

enum Wake<E> {
    Command(Command<E>),
    Received(usize),
    TransportFailed,
    Timer,
    EventRoom,
}

impl<'a, T, const CMD: usize, const EVT: usize, const BUF: usize> MqttRuntime<'a, T, CMD, EVT, BUF>
where
    T: MqttTransport,
{
    pub fn new(
        transport: T,
        commands: &'a CommandChannel<T::Endpoint, CMD>,
        events: &'a EventChannel<EVT>,
        config: EngineConfig,
    ) -> Self {
        Self {
            transport,
            engine: Engine::new(config),
            commands,
            events: events.sender(),
            endpoint: None,
            rx: FrameBuffer::new(),
            open: false,
            pending_connect: None,
            pending_shutdown: None,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Runs until the client is shut down.
    pub async fn run(&mut self) {
        loop {
            self.flush_outputs().await;
            if let Some(outcome) = self.engine.take_connect_outcome()
                && let Some(reply) = self.pending_connect.take()
            {
                let _ = reply.send(outcome);
            }
            if self.engine.state() == ConnectionState::Closed
                && let Some(reply) = self.pending_shutdown.take()
            {
                self.finish_shutdown(reply).await;
                return;
            }
            self.forward_events().await;

            match self.wait().await {
                Wake::Command(command) => self.handle_command(command),
                Wake::Received(n) => self.handle_received(n),
                Wake::TransportFailed => {
                    self.close_transport().await;
                    self.engine.transport_failed(Instant::now());
                }
                Wake::Timer => self.engine.handle_tick(Instant::now()),
                Wake::EventRoom => {}
            }
        }
    }

    async fn wait(&mut self) -> Wake<T::Endpoint> {
        let deadline = self.engine.next_deadline();
        let backlog = self.engine.pending_events() > 0;
        let open = self.open;

        let transport = &mut self.transport;
        let rx = &mut self.rx;
        let channel = self.commands;
        let commands = channel.receiver();
        let events = &self.events;

        let command = commands.receive();
        let received = async {
            if open {
                transport.recv(rx.spare_mut()).await
            } else {
                pending().await
            }
        };
        let timer = async {
            match deadline {
                Some(at) => Timer::at(at).await,
                None => pending().await,
            }
        };
        let room = async {
            if backlog {
                poll_fn(|cx| events.poll_ready_to_send(cx)).await
            } else {
                pending().await
            }
        };

        match select4(command, received, timer, room).await {
            Either4::First(command) => Wake::Command(command),
            Either4::Second(Ok(0)) | Either4::Second(Err(_)) => Wake::TransportFailed,
            Either4::Second(Ok(n)) => Wake::Received(n),
            Either4::Third(()) => Wake::Timer,
            Either4::Fourth(()) => Wake::EventRoom,
        }
    }

    /// Executes the engine's transport instructions in order.
    async fn flush_outputs(&mut self) {
        while let Some(output) = self.engine.poll_output() {
            match output {
                Output::Open => self.open_transport().await,
                Output::Write(frame) => {
                    if !self.open {
                        trace!("transport closed, dropping {} byte frame", frame.len());
                        continue;
                    }
                    if self.transport.send(&frame).await.is_err() {
                        warn!("transport write failed");
                        self.close_transport().await;
                        self.engine.transport_failed(Instant::now());
                    }
                }
                Output::Close => self.close_transport().await,
            }
        }
    }

    async fn open_transport(&mut self) {
        if self.open {
            self.close_transport().await;
        }
        let Some(endpoint) = self.endpoint.as_ref() else {
            self.engine.transport_failed(Instant::now());
            return;
        };
        let timeout = self
            .engine
            .options()
            .map(|options| options.connect_timeout)
            .unwrap_or(embassy_time::Duration::from_secs(30));

        self.rx.clear();
        match with_timeout(timeout, self.transport.open(endpoint)).await {
            Ok(Ok(())) => {
                self.open = true;
                self.engine.transport_opened(Instant::now());
            }
            Ok(Err(_)) => {
                warn!("transport open failed");
                self.engine.transport_failed(Instant::now());
            }
            Err(_) => {
                warn!("transport open timed out");
                self.transport.close().await;
                self.engine.transport_failed(Instant::now());
            }
        }
    }

    async fn close_transport(&mut self) {
        if self.open {
            self.open = false;
            self.transport.close().await;
        }
        self.rx.clear();
    }

    async fn forward_events(&mut self) {
        match self.engine.config().delivery_mode {
            DeliveryMode::Block => {
                while let Some(event) = self.engine.poll_event() {
                    self.events.send(event).await;
                }
            }
            DeliveryMode::Buffer => {
                while let Some(event) = self.engine.peek_event() {
                    if self.events.try_send(event.clone()).is_err() {
                        break;
                    }
                    self.engine.poll_event();
                }
            }
        }
    }

    fn handle_received(&mut self, n: usize) {
        self.rx.advance(n);
        let now = Instant::now();
        loop {
            match self.rx.complete_frame() {
                Ok(Some(len)) => {
                    self.engine.handle_frame(self.rx.frame(len), now);
                    self.rx.consume(len);
                }
                Ok(None) => break,
                Err(e) => {
                    self.rx.clear();
                    self.engine.handle_stream_error(e, now);
                    break;
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command<T::Endpoint>) {
        let now = Instant::now();
        match command {
            Command::Connect {
                endpoint,
                options,
                reply,
            } => match self.engine.connect(options, now) {
                Ok(()) => {
                    self.endpoint = Some(endpoint);
                    self.pending_connect = Some(reply);
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Reconnect { reply } => match self.engine.reconnect(now) {
                Ok(()) => self.pending_connect = Some(reply),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Disconnect { reply } => {
                self.engine.disconnect(now);
                let _ = reply.send(());
            }
            Command::Shutdown { reply } => {
                self.engine.shutdown(now);
                self.pending_shutdown = Some(reply);
            }
            Command::Subscribe { filter, qos, reply } => {
                let _ = reply.send(self.engine.subscribe(&filter, qos, now).map(|_| ()));
            }
            Command::Unsubscribe { filter, reply } => {
                let _ = reply.send(self.engine.unsubscribe(&filter, now).map(|_| ()));
            }
            Command::Publish {
                topic,
                payload,
                qos,
                retain,
                reply,
            } => {
                let _ = reply.send(self.engine.publish(&topic, &payload, qos, retain, now));
            }
            Command::Status { reply } => {
                let _ = reply.send(self.engine.status());
            }
        }
    }

    /// Closes the command channel, which cancels queued and later commands, answers the
    /// shutdown, then hands every remaining event to the host whatever the delivery mode.
    async fn finish_shutdown(&mut self, reply: Reply<()>) {
        let dropped = self.commands.close();
        if dropped > 0 {
            debug!("cancelled {} commands queued behind shutdown", dropped);
        }
        if let Some(connect) = self.pending_connect.take() {
            let _ = connect.send(Err(MqttError::Cancelled));
        }
        let _ = reply.send(());

        if self.engine.pending_events() > 0 {
            debug!(
                "waiting for the host to collect {} events",
                self.engine.pending_events()
            );
        }
        while let Some(event) = self.engine.poll_event() {
            self.events.send(event).await;
        }
        info!("runtime stopped");
    }
}
