//! Scripted broker used by the integration tests.
//!
//! [`Harness`] owns an [`Engine`] and a fake clock. It plays the network side by hand: test
//! code decides when the transport opens, drops or delivers a frame. Everything the engine
//! writes is decoded back into [`Sent`] values with the crate's own codec.
//! [`AutoBroker`] adds a minimal broker that answers every client packet the way a
//! well-behaved MQTT 3.1.1 broker would.

#![allow(dead_code)]

use std::collections::VecDeque;

use embassy_time::{Duration, Instant};
use mqtt_bridge_core::packet::{
    self, ConnAck, EncodePacket, Packet, PubAck, PubComp, PubRec, PubRel, Publish, SubAck,
    SubAckReturnCode, UnsubAck,
};
use mqtt_bridge_core::{
    ConnectOptions, ConnectReturnCode, Engine, EngineConfig, Event, Output, QoS,
};

/// A transport instruction or a decoded client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Open,
    Close,
    Connect {
        client_id: String,
        clean_session: bool,
        keep_alive: u16,
    },
    Publish {
        dup: bool,
        qos: QoS,
        retain: bool,
        topic: String,
        packet_id: Option<u16>,
        payload: Vec<u8>,
    },
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    Subscribe {
        packet_id: u16,
        filters: Vec<(String, QoS)>,
    },
    Unsubscribe {
        packet_id: u16,
        filters: Vec<String>,
    },
    PingReq,
    Disconnect,
}

impl Sent {
    pub fn is_publish(&self) -> bool {
        matches!(self, Sent::Publish { .. })
    }

    pub fn is_subscribe(&self) -> bool {
        matches!(self, Sent::Subscribe { .. })
    }
}

/// Decodes a frame written by the client.
pub fn describe(frame: &[u8]) -> Sent {
    match packet::decode(frame).expect("client wrote an undecodable frame") {
        Packet::Connect(connect) => Sent::Connect {
            client_id: connect.client_id.to_string(),
            clean_session: connect.clean_session,
            keep_alive: connect.keep_alive,
        },
        Packet::Publish(publish) => Sent::Publish {
            dup: publish.dup,
            qos: publish.qos,
            retain: publish.retain,
            topic: publish.topic.to_string(),
            packet_id: publish.packet_id,
            payload: publish.payload.to_vec(),
        },
        Packet::PubAck(ack) => Sent::PubAck(ack.packet_id),
        Packet::PubRec(ack) => Sent::PubRec(ack.packet_id),
        Packet::PubRel(ack) => Sent::PubRel(ack.packet_id),
        Packet::PubComp(ack) => Sent::PubComp(ack.packet_id),
        Packet::Subscribe(subscribe) => Sent::Subscribe {
            packet_id: subscribe.packet_id,
            filters: subscribe
                .filters
                .iter()
                .map(|(filter, qos)| (filter.to_string(), *qos))
                .collect(),
        },
        Packet::Unsubscribe(unsubscribe) => Sent::Unsubscribe {
            packet_id: unsubscribe.packet_id,
            filters: unsubscribe.filters.iter().map(|f| f.to_string()).collect(),
        },
        Packet::PingReq => Sent::PingReq,
        Packet::Disconnect => Sent::Disconnect,
        other => panic!("client wrote broker-only packet type {}", other.packet_type()),
    }
}

pub fn frame<P: EncodePacket>(packet: &P) -> Vec<u8> {
    packet.to_vec().expect("test packet must encode")
}

pub fn connack(session_present: bool, return_code: ConnectReturnCode) -> Vec<u8> {
    frame(&ConnAck {
        session_present,
        return_code,
    })
}

pub fn publish(topic: &str, payload: &[u8], qos: QoS, packet_id: Option<u16>, dup: bool) -> Vec<u8> {
    frame(&Publish {
        dup,
        qos,
        retain: false,
        topic,
        packet_id,
        payload,
    })
}

pub fn suback(packet_id: u16, codes: &[SubAckReturnCode]) -> Vec<u8> {
    frame(&SubAck {
        packet_id,
        return_codes: codes.to_vec(),
    })
}

pub fn puback(packet_id: u16) -> Vec<u8> {
    frame(&PubAck { packet_id })
}

pub fn pubrec(packet_id: u16) -> Vec<u8> {
    frame(&PubRec { packet_id })
}

pub fn pubrel(packet_id: u16) -> Vec<u8> {
    frame(&PubRel { packet_id })
}

pub fn pubcomp(packet_id: u16) -> Vec<u8> {
    frame(&PubComp { packet_id })
}

pub fn unsuback(packet_id: u16) -> Vec<u8> {
    frame(&UnsubAck { packet_id })
}

pub fn pingresp() -> Vec<u8> {
    frame(&Packet::PingResp)
}

/// Options with keep-alive off, so only the test moves the connection along.
pub fn quiet_options(client_id: &str) -> ConnectOptions {
    ConnectOptions::new(client_id)
        .with_keep_alive(Duration::from_secs(0))
        .with_jitter_seed(1)
}

pub struct Harness {
    pub engine: Engine,
    pub now: Instant,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            engine: Engine::new(config),
            now: Instant::from_secs(1),
        }
    }

    /// A harness that has completed the handshake, with the resulting events drained.
    pub fn connected(options: ConnectOptions) -> Self {
        let mut harness = Self::new();
        harness.connect(options);
        harness.establish(false);
        harness.events();
        harness
    }

    pub fn connect(&mut self, options: ConnectOptions) {
        self.engine
            .connect(options, self.now)
            .expect("connect must be accepted");
    }

    /// Opens the transport the engine asked for, checks the CONNECT and answers with an
    /// accepting CONNACK. Returns every frame written after the CONNACK.
    ///
    /// Instructions still pending beforehand (the `Open` itself) are discarded.
    pub fn establish(&mut self, session_present: bool) -> Vec<Sent> {
        self.sent();
        self.engine.transport_opened(self.now);
        let sent = self.sent();
        assert!(
            matches!(sent.as_slice(), [Sent::Connect { .. }]),
            "expected a lone CONNECT, got {sent:?}"
        );
        self.deliver(&connack(session_present, ConnectReturnCode::Accepted));
        self.sent()
    }

    /// Opens the requested transport and returns the CONNECT, leaving CONNACK to the test.
    pub fn open_transport(&mut self) -> Vec<Sent> {
        self.sent();
        self.engine.transport_opened(self.now);
        self.sent()
    }

    pub fn deliver(&mut self, frame: &[u8]) {
        self.engine.handle_frame(frame, self.now);
    }

    pub fn drop_transport(&mut self) {
        self.engine.transport_failed(self.now);
    }

    /// Drains and decodes every pending transport instruction.
    pub fn sent(&mut self) -> Vec<Sent> {
        let mut sent = Vec::new();
        while let Some(output) = self.engine.poll_output() {
            sent.push(match output {
                Output::Open => Sent::Open,
                Output::Close => Sent::Close,
                Output::Write(frame) => describe(&frame),
            });
        }
        sent
    }

    pub fn events(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = self.engine.poll_event() {
            events.push(event);
        }
        events
    }

    /// Moves the clock forward by `by`, firing each engine timer at its own deadline.
    pub fn advance(&mut self, by: Duration) {
        let target = self.now + by;
        for _ in 0..10_000 {
            match self.engine.next_deadline() {
                Some(at) if at <= target => {
                    if at > self.now {
                        self.now = at;
                    }
                    let before = self.engine.next_deadline();
                    self.engine.handle_tick(self.now);
                    if self.engine.next_deadline() == before {
                        break;
                    }
                }
                _ => break,
            }
        }
        self.now = target;
        self.engine.handle_tick(self.now);
    }

    /// Fires timers until the engine asks for a transport, returning what it produced.
    pub fn wait_for_open(&mut self) -> Vec<Sent> {
        let mut sent = Vec::new();
        for _ in 0..1_000 {
            let Some(at) = self.engine.next_deadline() else {
                break;
            };
            if at > self.now {
                self.now = at;
            }
            self.engine.handle_tick(self.now);
            sent.extend(self.sent());
            if sent.contains(&Sent::Open) {
                return sent;
            }
        }
        panic!("engine never asked for a transport: {sent:?}");
    }
}

/// How [`AutoBroker`] answers a SUBSCRIBE entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    /// Grant what was asked.
    Requested,
    /// Grant a fixed level regardless of the request, possibly more than was asked.
    Fixed(QoS),
    Failure,
}

/// A broker that answers client packets in order. Answers queue up until the test releases
/// them, so they can be lost to a transport drop like on a real network.
pub struct AutoBroker {
    pub grant: Grant,
    pending: VecDeque<Vec<u8>>,
}

impl AutoBroker {
    pub fn new(grant: Grant) -> Self {
        Self {
            grant,
            pending: VecDeque::new(),
        }
    }

    /// Queues the broker's answers to `sent`.
    pub fn absorb(&mut self, sent: &[Sent]) {
        for packet in sent {
            match packet {
                Sent::Publish {
                    qos: QoS::AtLeastOnce,
                    packet_id: Some(id),
                    ..
                } => self.pending.push_back(puback(*id)),
                Sent::Publish {
                    qos: QoS::ExactlyOnce,
                    packet_id: Some(id),
                    ..
                } => self.pending.push_back(pubrec(*id)),
                Sent::PubRel(id) => self.pending.push_back(pubcomp(*id)),
                Sent::Subscribe { packet_id, filters } => {
                    let codes: Vec<_> = filters
                        .iter()
                        .map(|(_, qos)| match self.grant {
                            Grant::Requested => SubAckReturnCode::Granted(*qos),
                            Grant::Fixed(granted) => SubAckReturnCode::Granted(granted),
                            Grant::Failure => SubAckReturnCode::Failure,
                        })
                        .collect();
                    self.pending.push_back(suback(*packet_id, &codes));
                }
                Sent::Unsubscribe { packet_id, .. } => self.pending.push_back(unsuback(*packet_id)),
                Sent::PingReq => self.pending.push_back(pingresp()),
                _ => {}
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// The connection dropped: unsent answers are lost.
    pub fn reset(&mut self) {
        self.pending.clear();
    }

    /// Releases up to `n` answers, feeding the client's reactions back into the queue.
    pub fn release(&mut self, harness: &mut Harness, n: usize) -> Vec<Sent> {
        let mut written = Vec::new();
        for _ in 0..n {
            let Some(frame) = self.pending.pop_front() else {
                break;
            };
            harness.deliver(&frame);
            let sent = harness.sent();
            self.absorb(&sent);
            written.extend(sent);
        }
        written
    }

    /// Answers until the client has nothing left to say.
    pub fn settle(&mut self, harness: &mut Harness) -> Vec<Sent> {
        let mut written = Vec::new();
        for _ in 0..10_000 {
            if self.pending.is_empty() {
                break;
            }
            written.extend(self.release(harness, 1));
        }
        written
    }
}
