//! # Engine
//!
//! The sans-I/O protocol core. It owns the connection state machine, the subscription
//! registry, the delivery manager and the event FIFO, and is the only place any of them is
//! mutated.
//!
//! Inputs are host operations (`connect`, `publish`, ...), transport notifications
//! (`transport_opened`, `transport_failed`, `handle_frame`) and the passage of time
//! (`handle_tick`). Every input takes the current [`Instant`]; the engine never reads a
//! clock itself. Outputs are drained with [`Engine::poll_output`] (transport instructions) and
//! [`Engine::poll_event`] (host events), both strictly in the order they were produced.
//!
//! ```ignore
//! let mut engine = Engine::new(EngineConfig::default());
//! engine.connect(ConnectOptions::new("sensor-01"), now)?;
//! while let Some(output) = engine.poll_output() {
//!     match output {
//!         Output::Open => { /* open transport */ engine.transport_opened(now) }
//!         Output::Write(frame) => { /* send frame */ }
//!         Output::Close => { /* close transport */ }
//!     }
//! }
//! ```

use alloc::string::String;

use embassy_time::Instant;

use crate::connection::{Backoff, ConnectionState, KeepAlive, KeepAliveAction};
use crate::delivery::{DeliveryManager, DeliveryStatus, LocalId, OutboundMessage};
use crate::dispatcher::Event;
use crate::error::{ConnectReturnCode, DisconnectReason, MqttError, ProtocolError};
use crate::options::{ConnectOptions, DEFAULT_MAX_INFLIGHT, EngineConfig};
use crate::outbox::{Outbox, Output};
use crate::packet::{self, ConnAck, Packet, Publish, QoS};
use crate::packet_id::PacketIds;
use crate::subscriptions::{SubscribeOutcome, Subscription, SubscriptionRegistry};
use crate::topic::validate_topic_name;

/// Snapshot returned by the status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ClientStatus {
    pub state: ConnectionState,
    /// Messages sent and awaiting acknowledgement.
    pub in_flight: usize,
    /// Messages waiting for connectivity or a window slot.
    pub queued: usize,
    /// Registered filters, not counting ones the broker refused.
    pub subscriptions: usize,
    /// Automatic reconnect attempts since the last successful CONNACK.
    pub reconnect_attempt: u32,
}

impl ClientStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    options: Option<ConnectOptions>,
    state: ConnectionState,
    transport_open: bool,
    /// The current attempt was started by the reconnect loop.
    reconnecting: bool,
    /// A host `connect`/`reconnect` is waiting for its outcome.
    connect_pending: bool,
    connect_outcome: Option<Result<(), MqttError>>,
    connect_deadline: Option<Instant>,
    reconnect_at: Option<Instant>,
    backoff: Option<Backoff>,
    keep_alive: KeepAlive,
    ids: PacketIds,
    registry: SubscriptionRegistry,
    delivery: DeliveryManager,
    out: Outbox,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            options: None,
            state: ConnectionState::Disconnected,
            transport_open: false,
            reconnecting: false,
            connect_pending: false,
            connect_outcome: None,
            connect_deadline: None,
            reconnect_at: None,
            backoff: None,
            keep_alive: KeepAlive::disabled(),
            ids: PacketIds::new(),
            registry: SubscriptionRegistry::new(),
            delivery: DeliveryManager::new(DEFAULT_MAX_INFLIGHT),
            out: Outbox::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Options of the most recent `connect`.
    pub fn options(&self) -> Option<&ConnectOptions> {
        self.options.as_ref()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn status(&self) -> ClientStatus {
        ClientStatus {
            state: self.state,
            in_flight: self.delivery.in_flight(),
            queued: self.delivery.queued(),
            subscriptions: self.registry.live(),
            reconnect_attempt: self.backoff.as_ref().map_or(0, Backoff::attempt),
        }
    }

    pub fn subscription(&self, filter: &str) -> Option<&Subscription> {
        self.registry.get(filter)
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &Subscription> {
        self.registry.iter()
    }

    pub fn delivery_status(&self, local_id: LocalId) -> Option<DeliveryStatus> {
        self.delivery.status(local_id)
    }

    /// Packet ids held by unacknowledged outbound messages, oldest first.
    pub fn in_flight_packet_ids(&self) -> alloc::vec::Vec<u16> {
        self.delivery.in_flight_ids()
    }

    /// Next transport instruction, in production order.
    pub fn poll_output(&mut self) -> Option<Output> {
        self.out.outputs.pop_front()
    }

    /// Next host event, in production order.
    pub fn poll_event(&mut self) -> Option<Event> {
        self.out.events.pop()
    }

    pub fn peek_event(&self) -> Option<&Event> {
        self.out.events.peek()
    }

    pub fn pending_events(&self) -> usize {
        self.out.events.len()
    }

    /// Result of the last host `connect`/`reconnect`, once known.
    pub fn take_connect_outcome(&mut self) -> Option<Result<(), MqttError>> {
        self.connect_outcome.take()
    }

    // --- Host operations ---

    /// Starts a session. Emits [`Output::Open`]; the result arrives via
    /// [`Engine::take_connect_outcome`] and a `Connected` or `ConnectionFailed` event.
    ///
    /// With `clean_session`, state from any previous broker session is discarded first:
    /// in-flight messages fail with `Cancelled` and acknowledged subscriptions are forgotten.
    pub fn connect(&mut self, options: ConnectOptions, now: Instant) -> Result<(), MqttError> {
        match self.state {
            ConnectionState::Connecting
            | ConnectionState::Reconnecting
            | ConnectionState::Disconnecting => return Err(MqttError::AlreadyConnecting),
            ConnectionState::Connected => return Err(MqttError::AlreadyConnected),
            ConnectionState::Disconnected | ConnectionState::Closed => {}
        }
        options.validate()?;

        if options.clean_session {
            self.registry.reset_session(&mut self.ids);
            self.delivery
                .cancel_in_flight(MqttError::Cancelled, &mut self.ids, &mut self.out);
            self.delivery.clear_inbound();
        }
        self.delivery.configure(&options);
        self.backoff = Some(Backoff::from_options(&options));
        info!("connecting as {}", options.client_id.as_str());
        self.options = Some(options);

        self.reconnecting = false;
        self.connect_pending = true;
        self.connect_outcome = None;
        self.begin_attempt(now);
        Ok(())
    }

    /// Re-establishes the session with the options of the last `connect`.
    ///
    /// Succeeds at once when already connected. While a backoff delay is running this starts
    /// the next attempt immediately.
    pub fn reconnect(&mut self, now: Instant) -> Result<(), MqttError> {
        match self.state {
            ConnectionState::Connected => {
                self.connect_outcome = Some(Ok(()));
                Ok(())
            }
            ConnectionState::Connecting | ConnectionState::Disconnecting => {
                Err(MqttError::AlreadyConnecting)
            }
            ConnectionState::Reconnecting => {
                info!("reconnect requested, skipping backoff");
                self.connect_pending = true;
                self.connect_outcome = None;
                self.begin_attempt(now);
                Ok(())
            }
            ConnectionState::Disconnected | ConnectionState::Closed => {
                let options = self.options.clone().ok_or(MqttError::InvalidOptions)?;
                self.connect(options, now)
            }
        }
    }

    /// Ends the session. Idempotent.
    ///
    /// Sends DISCONNECT if connected, stops any reconnect loop and fails every in-flight and
    /// queued message with `Cancelled`. Subscriptions are kept for the next connect.
    pub fn disconnect(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Closed => {
                debug!("disconnect while {}, nothing to do", self.state);
                return;
            }
            ConnectionState::Connected => {
                self.state = ConnectionState::Disconnecting;
                self.out.send(&Packet::Disconnect, now);
            }
            _ => {}
        }
        info!("disconnecting");
        self.close_transport();
        self.connect_deadline = None;
        self.reconnect_at = None;
        self.reconnecting = false;
        self.keep_alive = KeepAlive::disabled();
        if let Some(backoff) = self.backoff.as_mut() {
            backoff.reset();
        }
        if self.connect_pending {
            self.connect_pending = false;
            self.connect_outcome = Some(Err(MqttError::Cancelled));
        }

        self.state = ConnectionState::Disconnected;
        self.registry.on_connection_lost(&mut self.ids);
        self.out
            .emit(Event::Disconnected(DisconnectReason::Requested));
        self.delivery
            .cancel_in_flight(MqttError::Cancelled, &mut self.ids, &mut self.out);
        self.delivery.cancel_queued(MqttError::Cancelled, &mut self.out);
    }

    /// Disconnects and enters the terminal `Closed` state.
    pub fn shutdown(&mut self, now: Instant) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.disconnect(now);
        self.state = ConnectionState::Closed;
        info!("client closed");
        self.out.emit(Event::Closed);
    }

    /// Registers `filter`. While disconnected the request is recorded and sent after the
    /// next CONNACK.
    pub fn subscribe(
        &mut self,
        filter: &str,
        qos: QoS,
        now: Instant,
    ) -> Result<SubscribeOutcome, MqttError> {
        if self.state == ConnectionState::Closed {
            return Err(MqttError::NotConnected);
        }
        let connected = self.state == ConnectionState::Connected;
        self.registry
            .subscribe(filter, qos, connected, &mut self.ids, &mut self.out, now)
    }

    /// Returns `Ok(false)` if `filter` is not registered.
    pub fn unsubscribe(&mut self, filter: &str, now: Instant) -> Result<bool, MqttError> {
        if self.state == ConnectionState::Closed {
            return Err(MqttError::NotConnected);
        }
        let connected = self.state == ConnectionState::Connected;
        self.registry
            .unsubscribe(filter, connected, &mut self.ids, &mut self.out, now)
    }

    /// Accepts a message for delivery.
    ///
    /// QoS 0 is written immediately and requires a connection. QoS 1/2 messages are queued
    /// and sent as window slots free up, across reconnects if need be.
    pub fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
        now: Instant,
    ) -> Result<LocalId, MqttError> {
        validate_topic_name(topic)?;
        let frame = Publish {
            dup: false,
            qos,
            retain,
            topic,
            packet_id: (qos != QoS::AtMostOnce).then_some(1),
            payload,
        };
        if frame.encoded_len() > self.config.max_packet_size {
            return Err(ProtocolError::PayloadTooLarge.into());
        }

        let connected = self.state == ConnectionState::Connected;
        if qos == QoS::AtMostOnce {
            if !connected {
                return Err(MqttError::NotConnected);
            }
            let local_id = self.delivery.next_local_id();
            self.out.send(&frame, now);
            self.out.emit(Event::DeliveryComplete(local_id));
            return Ok(local_id);
        }

        if self.state == ConnectionState::Closed {
            return Err(MqttError::NotConnected);
        }
        let local_id = self.delivery.enqueue(
            OutboundMessage {
                topic: String::from(topic),
                payload: payload.to_vec(),
                qos,
                retain,
            },
            now,
        );
        if connected {
            self.delivery.pump(&mut self.ids, &mut self.out, now);
        }
        Ok(local_id)
    }

    // --- Transport notifications ---

    /// The transport requested by [`Output::Open`] is up: sends CONNECT.
    pub fn transport_opened(&mut self, now: Instant) {
        if self.state != ConnectionState::Connecting || self.transport_open {
            warn!("unexpected transport open while {}", self.state);
            self.out.close();
            return;
        }
        let Some(options) = &self.options else {
            return;
        };
        self.transport_open = true;
        self.out.send(&options.connect_packet(), now);
        debug!("CONNECT sent");
    }

    /// The transport failed to open, failed mid-session or reached end of stream.
    pub fn transport_failed(&mut self, now: Instant) {
        self.transport_open = false;
        match self.state {
            ConnectionState::Connecting => self.connect_failed(DisconnectReason::Transport, now),
            ConnectionState::Connected => self.connection_lost(DisconnectReason::Transport, now),
            _ => trace!("transport closed while {}", self.state),
        }
    }

    /// Processes one complete inbound frame.
    pub fn handle_frame(&mut self, frame: &[u8], now: Instant) {
        if frame.len() > self.config.max_packet_size {
            return self.protocol_error(ProtocolError::PayloadTooLarge, now);
        }
        let packet = match packet::decode(frame) {
            Ok(packet) => packet,
            Err(e) => return self.protocol_error(e, now),
        };
        trace!("received packet type {}", packet.packet_type());

        match self.state {
            ConnectionState::Connecting if self.transport_open => match packet {
                Packet::ConnAck(ack) => self.on_connack(ack, now),
                other => {
                    self.protocol_error(ProtocolError::UnexpectedPacket(other.packet_type()), now)
                }
            },
            ConnectionState::Connected => {
                if let Err(e) = self.on_packet(packet, now) {
                    self.protocol_error(e, now);
                }
            }
            state => debug!("dropping packet type {} while {}", packet.packet_type(), state),
        }
    }

    /// The inbound byte stream could not be split into frames.
    pub fn handle_stream_error(&mut self, error: ProtocolError, now: Instant) {
        self.protocol_error(error, now);
    }

    // --- Time ---

    /// Fires every timer due at `now`.
    pub fn handle_tick(&mut self, now: Instant) {
        let connected = self.state == ConnectionState::Connected;
        self.delivery
            .on_tick(connected, &mut self.ids, &mut self.out, now);

        match self.state {
            ConnectionState::Connecting => {
                if self.connect_deadline.is_some_and(|deadline| now >= deadline) {
                    self.connect_failed(DisconnectReason::ConnectTimeout, now);
                }
            }
            ConnectionState::Reconnecting => {
                if self.reconnect_at.is_some_and(|at| now >= at) {
                    debug!("backoff elapsed, reconnecting");
                    self.begin_attempt(now);
                }
            }
            ConnectionState::Connected => {
                let last_write = self.out.last_write.unwrap_or(now);
                match self.keep_alive.poll(last_write, now) {
                    KeepAliveAction::SendPing => {
                        trace!("sending PINGREQ");
                        self.out.send(&Packet::PingReq, now);
                        self.keep_alive.ping_sent(now);
                    }
                    KeepAliveAction::TimedOut => {
                        self.connection_lost(DisconnectReason::PingTimeout, now)
                    }
                    KeepAliveAction::Idle => {}
                }
            }
            _ => {}
        }
    }

    /// Earliest instant at which [`Engine::handle_tick`] has something to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let state = match self.state {
            ConnectionState::Connecting => self.connect_deadline,
            ConnectionState::Reconnecting => self.reconnect_at,
            ConnectionState::Connected => self
                .out
                .last_write
                .and_then(|last_write| self.keep_alive.deadline(last_write)),
            _ => None,
        };
        let delivery = self
            .delivery
            .next_deadline(self.state == ConnectionState::Connected);
        match (state, delivery) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // --- Internals ---

    /// The connect timeout covers the whole attempt, transport open included.
    fn begin_attempt(&mut self, now: Instant) {
        self.state = ConnectionState::Connecting;
        self.reconnect_at = None;
        self.connect_deadline = self
            .options
            .as_ref()
            .map(|options| now + options.connect_timeout);
        self.out.open();
    }

    fn close_transport(&mut self) {
        if self.transport_open {
            self.transport_open = false;
            self.out.close();
        }
    }

    fn on_connack(&mut self, ack: ConnAck, now: Instant) {
        self.connect_deadline = None;
        if ack.return_code != ConnectReturnCode::Accepted {
            return self.connect_failed(DisconnectReason::ConnectRejected(ack.return_code), now);
        }

        let reconnect = core::mem::replace(&mut self.reconnecting, false);
        self.state = ConnectionState::Connected;
        if let Some(backoff) = self.backoff.as_mut() {
            backoff.reset();
        }
        if let Some(options) = &self.options {
            self.keep_alive = KeepAlive::new(options.keep_alive, options.ping_grace());
        }
        info!(
            "connected (session present: {}, reconnect: {})",
            ack.session_present, reconnect
        );
        self.out.emit(Event::Connected {
            session_present: ack.session_present,
            reconnect,
        });
        if self.connect_pending {
            self.connect_pending = false;
            self.connect_outcome = Some(Ok(()));
        }

        if !ack.session_present {
            self.delivery.clear_inbound();
        }
        self.registry
            .replay(ack.session_present, &mut self.ids, &mut self.out, now);
        self.delivery
            .resend_all(&mut self.ids, &mut self.out, now);
        self.delivery.pump(&mut self.ids, &mut self.out, now);
    }

    fn on_packet(&mut self, packet: Packet<'_>, now: Instant) -> Result<(), ProtocolError> {
        match packet {
            Packet::Publish(publish) => {
                let matched = self.registry.matches(publish.topic);
                if !matched {
                    warn!("no subscription matches {}, dropping", publish.topic);
                }
                self.delivery
                    .on_publish(&publish, matched, &mut self.out, now);
            }
            Packet::PubAck(ack) => {
                self.delivery
                    .on_puback(ack.packet_id, &mut self.ids, &mut self.out)?;
                self.delivery.pump(&mut self.ids, &mut self.out, now);
            }
            Packet::PubRec(ack) => self.delivery.on_pubrec(ack.packet_id, &mut self.out, now)?,
            Packet::PubComp(ack) => {
                self.delivery
                    .on_pubcomp(ack.packet_id, &mut self.ids, &mut self.out)?;
                self.delivery.pump(&mut self.ids, &mut self.out, now);
            }
            Packet::PubRel(rel) => self.delivery.on_pubrel(rel.packet_id, &mut self.out, now),
            Packet::SubAck(ack) => self.registry.on_suback(
                ack.packet_id,
                &ack.return_codes,
                &mut self.ids,
                &mut self.out,
            )?,
            Packet::UnsubAck(ack) => {
                self.registry
                    .on_unsuback(ack.packet_id, &mut self.ids, &mut self.out)
            }
            Packet::PingResp => {
                trace!("PINGRESP");
                self.keep_alive.pong_received();
            }
            other => return Err(ProtocolError::UnexpectedPacket(other.packet_type())),
        }
        Ok(())
    }

    fn protocol_error(&mut self, error: ProtocolError, now: Instant) {
        error!("protocol error: {}", error);
        match self.state {
            ConnectionState::Connecting => {
                self.connect_failed(DisconnectReason::Protocol(error), now)
            }
            ConnectionState::Connected => {
                self.connection_lost(DisconnectReason::Protocol(error), now)
            }
            _ => {}
        }
    }

    fn connect_failed(&mut self, reason: DisconnectReason, now: Instant) {
        warn!("connect attempt failed: {}", reason);
        self.connect_deadline = None;
        self.close_transport();

        let error = MqttError::from(reason);
        if self.connect_pending {
            self.connect_pending = false;
            self.connect_outcome = Some(Err(error));
        }

        if !self.reconnecting {
            self.state = ConnectionState::Disconnected;
            self.out.emit(Event::ConnectionFailed(error));
            return;
        }
        if let DisconnectReason::ConnectRejected(code) = reason
            && !code.is_transient()
        {
            return self.give_up(error);
        }
        self.schedule_reconnect(now);
    }

    fn connection_lost(&mut self, reason: DisconnectReason, now: Instant) {
        warn!("connection lost: {}", reason);
        self.close_transport();
        self.keep_alive = KeepAlive::disabled();
        self.registry.on_connection_lost(&mut self.ids);
        self.out.emit(Event::Disconnected(reason));

        if self.options.as_ref().is_some_and(|o| o.auto_reconnect) {
            self.reconnecting = true;
            self.schedule_reconnect(now);
        } else {
            self.state = ConnectionState::Disconnected;
        }
    }

    fn schedule_reconnect(&mut self, now: Instant) {
        let Some(backoff) = self.backoff.as_mut() else {
            return self.give_up(MqttError::ReconnectExhausted);
        };
        let Some(delay) = backoff.next_delay() else {
            return self.give_up(MqttError::ReconnectExhausted);
        };
        let attempt = backoff.attempt();
        info!("reconnect attempt {} in {} ms", attempt, delay.as_millis());
        self.state = ConnectionState::Reconnecting;
        self.reconnect_at = Some(now + delay);
        self.out.emit(Event::Reconnecting { attempt, delay });
    }

    fn give_up(&mut self, error: MqttError) {
        error!("giving up on connection: {}", error);
        self.state = ConnectionState::Disconnected;
        self.reconnecting = false;
        self.reconnect_at = None;
        self.out.emit(Event::ConnectionFailed(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::EncodePacket;
    use embassy_time::Duration;

    fn connack(session_present: bool, code: u8) -> alloc::vec::Vec<u8> {
        ConnAck {
            session_present,
            return_code: ConnectReturnCode::from(code),
        }
        .to_vec()
        .unwrap()
    }

    #[test]
    fn connect_emits_open_then_connect_frame() {
        let mut engine = Engine::new(EngineConfig::default());
        let t = Instant::from_secs(1);
        engine.connect(ConnectOptions::new("c"), t).unwrap();
        assert_eq!(engine.state(), ConnectionState::Connecting);
        assert_eq!(engine.poll_output(), Some(Output::Open));
        assert_eq!(engine.connect(ConnectOptions::new("c"), t), Err(MqttError::AlreadyConnecting));

        engine.transport_opened(t);
        let Some(Output::Write(frame)) = engine.poll_output() else {
            panic!("expected CONNECT frame");
        };
        assert!(matches!(packet::decode(&frame), Ok(Packet::Connect(_))));
        assert_eq!(engine.next_deadline(), Some(t + Duration::from_secs(30)));

        engine.handle_frame(&connack(false, 0), t);
        assert_eq!(engine.state(), ConnectionState::Connected);
        assert_eq!(engine.take_connect_outcome(), Some(Ok(())));
        assert_eq!(
            engine.poll_event(),
            Some(Event::Connected {
                session_present: false,
                reconnect: false
            })
        );
    }

    #[test]
    fn invalid_options_are_rejected_without_side_effects() {
        let mut engine = Engine::new(EngineConfig::default());
        let options = ConnectOptions::new("").with_clean_session(false);
        assert_eq!(
            engine.connect(options, Instant::from_secs(0)),
            Err(MqttError::InvalidOptions)
        );
        assert_eq!(engine.state(), ConnectionState::Disconnected);
        assert_eq!(engine.poll_output(), None);
    }

    #[test]
    fn oversized_publish_is_refused() {
        let config = EngineConfig {
            max_packet_size: 16,
            ..EngineConfig::default()
        };
        let mut engine = Engine::new(config);
        assert_eq!(
            engine.publish("t", &[0u8; 32], QoS::AtLeastOnce, false, Instant::from_secs(0)),
            Err(MqttError::Protocol(ProtocolError::PayloadTooLarge))
        );
    }

    #[test]
    fn reconnect_without_prior_connect_is_invalid() {
        let mut engine = Engine::new(EngineConfig::default());
        assert_eq!(
            engine.reconnect(Instant::from_secs(0)),
            Err(MqttError::InvalidOptions)
        );
    }
}
