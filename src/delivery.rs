//! # Delivery Manager
//!
//! Tracks outbound QoS 1/2 messages from acceptance to completion and inbound QoS 2
//! messages until their PUBREL.
//!
//! Outbound messages wait in an unbounded FIFO until a slot in the in-flight window is free.
//! The window is a fixed arena of `max_inflight` slots and a message in flight lives in slot
//! `(packet_id - 1) % max_inflight`, so packet identifiers are chosen to land on a free
//! slot. Lookups on acknowledgement are O(1). Nothing is admitted while `max_inflight`
//! messages are in flight; when a reconnect lowers the limit, the arena shrinks once the
//! older messages have drained.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use embassy_time::{Duration, Instant};

use crate::dispatcher::{Event, Message};
use crate::error::{MqttError, ProtocolError};
use crate::options::ConnectOptions;
use crate::outbox::Outbox;
use crate::packet::{self, PubAck, PubComp, PubRec, PubRel, Publish, QoS};
use crate::packet_id::{IdSet, PacketIds};

/// Opaque handle for a message accepted by `publish`.
///
/// Reported back in `DeliveryComplete` / `DeliveryFailed` events. Unlike the MQTT packet
/// identifier it is never reused while the client runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LocalId(pub(crate) u32);

impl LocalId {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where an outbound message is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeliveryStatus {
    /// Accepted, waiting for connectivity or a window slot.
    Queued,
    /// Written to the transport with no acknowledgement expected.
    Sent,
    /// QoS 1 PUBLISH sent, waiting for PUBACK.
    AwaitingAck,
    /// QoS 2 PUBLISH sent, waiting for PUBREC.
    AwaitingRec,
    /// PUBREL sent, waiting for PUBCOMP.
    AwaitingComp,
    Complete,
    Failed,
}

/// A message the host asked to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl OutboundMessage {
    fn publish(&self, packet_id: u16, dup: bool) -> Publish<'_> {
        Publish {
            dup,
            qos: self.qos,
            retain: self.retain,
            topic: &self.topic,
            packet_id: Some(packet_id),
            payload: &self.payload,
        }
    }
}

#[derive(Debug)]
struct Queued {
    local_id: LocalId,
    message: OutboundMessage,
    accepted_at: Instant,
}

#[derive(Debug)]
struct InFlight {
    local_id: LocalId,
    packet_id: u16,
    message: OutboundMessage,
    status: DeliveryStatus,
    /// Frames written for this message so far, first transmission included.
    transmissions: u32,
    last_sent: Instant,
    accepted_at: Instant,
    /// Send order, used to replay in the original order.
    seq: u64,
}

#[derive(Debug)]
pub(crate) struct DeliveryManager {
    window: Vec<Option<InFlight>>,
    /// Configured limit. The slot arena follows it whenever nothing is in flight.
    max_inflight: usize,
    in_flight: usize,
    queue: VecDeque<Queued>,
    /// Inbound QoS 2 packet ids that got a PUBREC but no PUBREL yet.
    inbound: IdSet,
    next_local: u32,
    next_seq: u64,
    max_retries: u32,
    retry_interval: Option<Duration>,
    retention: Option<Duration>,
}

impl DeliveryManager {
    pub fn new(window: u16) -> Self {
        let max_inflight = window.max(1) as usize;
        let mut slots = Vec::new();
        slots.resize_with(max_inflight, || None);
        Self {
            window: slots,
            max_inflight,
            in_flight: 0,
            queue: VecDeque::new(),
            inbound: IdSet::new(),
            next_local: 1,
            next_seq: 0,
            max_retries: 3,
            retry_interval: None,
            retention: None,
        }
    }

    /// Applies per-connection settings.
    ///
    /// A new `max_inflight` limits admission at once. Messages already in flight keep their
    /// slots, and the slot arena is resized once they have all completed.
    pub fn configure(&mut self, options: &ConnectOptions) {
        self.max_retries = options.max_retries;
        self.retry_interval = options.retry_interval;
        self.retention = options.message_retention;

        self.max_inflight = options.max_inflight.max(1) as usize;
        if self.in_flight > self.max_inflight {
            warn!(
                "{} messages in flight above the new window of {}, admitting none until they drain",
                self.in_flight, self.max_inflight
            );
        }
        self.resize_window();
    }

    fn resize_window(&mut self) {
        if self.in_flight == 0 && self.window.len() != self.max_inflight {
            debug!("in-flight window resized to {}", self.max_inflight);
            self.window.clear();
            self.window.resize_with(self.max_inflight, || None);
        }
    }

    pub fn next_local_id(&mut self) -> LocalId {
        let id = LocalId(self.next_local);
        self.next_local = self.next_local.wrapping_add(1).max(1);
        id
    }

    /// Accepts a QoS 1/2 message into the FIFO.
    pub fn enqueue(&mut self, message: OutboundMessage, now: Instant) -> LocalId {
        let local_id = self.next_local_id();
        self.queue.push_back(Queued {
            local_id,
            message,
            accepted_at: now,
        });
        local_id
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn window(&self) -> usize {
        self.max_inflight
    }

    /// Packet ids currently held by in-flight messages, in send order.
    pub fn in_flight_ids(&self) -> Vec<u16> {
        self.ordered_slots()
            .into_iter()
            .filter_map(|slot| self.window[slot].as_ref().map(|entry| entry.packet_id))
            .collect()
    }

    pub fn status(&self, local_id: LocalId) -> Option<DeliveryStatus> {
        self.window
            .iter()
            .flatten()
            .find(|entry| entry.local_id == local_id)
            .map(|entry| entry.status)
            .or_else(|| {
                self.queue
                    .iter()
                    .any(|queued| queued.local_id == local_id)
                    .then_some(DeliveryStatus::Queued)
            })
    }

    fn slot(&self, packet_id: u16) -> usize {
        (packet_id as usize).saturating_sub(1) % self.window.len()
    }

    /// The in-flight entry holding `packet_id`, if any.
    fn find(&self, packet_id: u16) -> Option<usize> {
        let slot = self.slot(packet_id);
        match &self.window[slot] {
            Some(entry) if entry.packet_id == packet_id => Some(slot),
            _ => None,
        }
    }

    /// Claims a packet id whose slot is free.
    fn reserve(&mut self, ids: &mut PacketIds) -> Option<u16> {
        if self.in_flight >= self.max_inflight {
            return None;
        }
        for _ in 0..u16::MAX {
            let id = ids.next_candidate();
            if self.window[self.slot(id)].is_none() && ids.claim(id) {
                return Some(id);
            }
        }
        None
    }

    fn free(&mut self, slot: usize, ids: &mut PacketIds) -> Option<InFlight> {
        let entry = self.window[slot].take()?;
        self.in_flight -= 1;
        ids.release(entry.packet_id);
        Some(entry)
    }

    fn ordered_slots(&self) -> Vec<usize> {
        let mut slots: Vec<(u64, usize)> = self
            .window
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| entry.as_ref().map(|entry| (entry.seq, slot)))
            .collect();
        slots.sort_unstable();
        slots.into_iter().map(|(_, slot)| slot).collect()
    }

    /// Moves queued messages into free window slots and sends them. Only call while
    /// connected.
    pub fn pump(&mut self, ids: &mut PacketIds, out: &mut Outbox, now: Instant) {
        self.resize_window();
        while !self.queue.is_empty() {
            let Some(packet_id) = self.reserve(ids) else {
                break;
            };
            let Some(queued) = self.queue.pop_front() else {
                ids.release(packet_id);
                break;
            };

            let status = match queued.message.qos {
                QoS::ExactlyOnce => DeliveryStatus::AwaitingRec,
                _ => DeliveryStatus::AwaitingAck,
            };
            out.send(&queued.message.publish(packet_id, false), now);
            debug!("sent {} as packet {}", queued.local_id, packet_id);

            let slot = self.slot(packet_id);
            self.window[slot] = Some(InFlight {
                local_id: queued.local_id,
                packet_id,
                message: queued.message,
                status,
                transmissions: 1,
                last_sent: now,
                accepted_at: queued.accepted_at,
                seq: self.next_seq,
            });
            self.next_seq += 1;
            self.in_flight += 1;
        }
    }

    /// Sends the next frame for an in-flight message again, or abandons it once its retry
    /// budget is spent.
    fn retransmit(&mut self, slot: usize, ids: &mut PacketIds, out: &mut Outbox, now: Instant) {
        let max_retries = self.max_retries;
        let Some(entry) = self.window[slot].as_mut() else {
            return;
        };
        if entry.transmissions > max_retries {
            if let Some(entry) = self.free(slot, ids) {
                warn!(
                    "abandoning {} after {} transmissions",
                    entry.local_id, entry.transmissions
                );
                out.emit(Event::DeliveryFailed(
                    entry.local_id,
                    MqttError::DeliveryAbandoned,
                ));
            }
            return;
        }

        entry.transmissions += 1;
        entry.last_sent = now;
        match entry.status {
            DeliveryStatus::AwaitingComp => out.send(
                &PubRel {
                    packet_id: entry.packet_id,
                },
                now,
            ),
            _ => out.send(&entry.message.publish(entry.packet_id, true), now),
        }
    }

    /// Replays every in-flight message in original send order after a reconnect.
    pub fn resend_all(&mut self, ids: &mut PacketIds, out: &mut Outbox, now: Instant) {
        for slot in self.ordered_slots() {
            self.retransmit(slot, ids, out, now);
        }
    }

    pub fn on_puback(
        &mut self,
        packet_id: u16,
        ids: &mut PacketIds,
        out: &mut Outbox,
    ) -> Result<(), ProtocolError> {
        self.complete(packet_id, DeliveryStatus::AwaitingAck, packet::PUBACK, ids, out)
    }

    pub fn on_pubcomp(
        &mut self,
        packet_id: u16,
        ids: &mut PacketIds,
        out: &mut Outbox,
    ) -> Result<(), ProtocolError> {
        self.complete(packet_id, DeliveryStatus::AwaitingComp, packet::PUBCOMP, ids, out)
    }

    fn complete(
        &mut self,
        packet_id: u16,
        expected: DeliveryStatus,
        packet_type: u8,
        ids: &mut PacketIds,
        out: &mut Outbox,
    ) -> Result<(), ProtocolError> {
        let Some(slot) = self.find(packet_id) else {
            warn!("ignoring ack type {} for unknown packet {}", packet_type, packet_id);
            return Ok(());
        };
        if self.window[slot].as_ref().map(|entry| entry.status) != Some(expected) {
            return Err(ProtocolError::UnexpectedPacket(packet_type));
        }
        if let Some(entry) = self.free(slot, ids) {
            debug!("{} complete", entry.local_id);
            out.emit(Event::DeliveryComplete(entry.local_id));
        }
        Ok(())
    }

    pub fn on_pubrec(
        &mut self,
        packet_id: u16,
        out: &mut Outbox,
        now: Instant,
    ) -> Result<(), ProtocolError> {
        let Some(slot) = self.find(packet_id) else {
            warn!("ignoring PUBREC for unknown packet {}", packet_id);
            return Ok(());
        };
        let Some(entry) = self.window[slot].as_mut() else {
            return Ok(());
        };
        match entry.status {
            // A repeated PUBREC means our PUBREL was lost.
            DeliveryStatus::AwaitingRec | DeliveryStatus::AwaitingComp => {
                entry.status = DeliveryStatus::AwaitingComp;
                entry.last_sent = now;
                out.send(&PubRel { packet_id }, now);
                Ok(())
            }
            _ => Err(ProtocolError::UnexpectedPacket(packet::PUBREC)),
        }
    }

    /// Handles an inbound PUBLISH: acknowledges it and reports whether the host should see
    /// it. `matched` says whether any subscription covers the topic.
    pub fn on_publish(
        &mut self,
        publish: &Publish<'_>,
        matched: bool,
        out: &mut Outbox,
        now: Instant,
    ) {
        let fresh = match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) => true,
            (QoS::AtLeastOnce, Some(packet_id)) => {
                out.send(&PubAck { packet_id }, now);
                true
            }
            (QoS::ExactlyOnce, Some(packet_id)) => {
                let fresh = self.inbound.insert(packet_id);
                if !fresh {
                    debug!("duplicate QoS 2 publish {}, not redelivered", packet_id);
                }
                out.send(&PubRec { packet_id }, now);
                fresh
            }
            (_, None) => false,
        };

        if fresh && matched {
            out.emit(Event::Message(Message {
                topic: String::from(publish.topic),
                payload: publish.payload.to_vec(),
                qos: publish.qos,
                retain: publish.retain,
            }));
        }
    }

    /// Releases an inbound QoS 2 id. PUBCOMP is sent even for ids we no longer know.
    pub fn on_pubrel(&mut self, packet_id: u16, out: &mut Outbox, now: Instant) {
        if !self.inbound.remove(packet_id) {
            debug!("PUBREL for unknown inbound packet {}", packet_id);
        }
        out.send(&PubComp { packet_id }, now);
    }

    pub fn pending_inbound(&self) -> usize {
        self.inbound.len()
    }

    pub fn clear_inbound(&mut self) {
        self.inbound.clear();
    }

    /// Retransmits overdue messages and expires old ones.
    pub fn on_tick(&mut self, connected: bool, ids: &mut PacketIds, out: &mut Outbox, now: Instant) {
        if let Some(retention) = self.retention {
            self.expire(retention, ids, out, now);
        }
        let Some(interval) = self.retry_interval else {
            return;
        };
        if !connected {
            return;
        }
        for slot in self.ordered_slots() {
            let due = self.window[slot]
                .as_ref()
                .is_some_and(|entry| now >= entry.last_sent + interval);
            if due {
                self.retransmit(slot, ids, out, now);
            }
        }
    }

    fn expire(&mut self, retention: Duration, ids: &mut PacketIds, out: &mut Outbox, now: Instant) {
        for slot in self.ordered_slots() {
            let expired = self.window[slot]
                .as_ref()
                .is_some_and(|entry| now >= entry.accepted_at + retention);
            if expired && let Some(entry) = self.free(slot, ids) {
                warn!("{} expired in flight", entry.local_id);
                out.emit(Event::DeliveryFailed(entry.local_id, MqttError::Expired));
            }
        }
        while self
            .queue
            .front()
            .is_some_and(|queued| now >= queued.accepted_at + retention)
        {
            if let Some(queued) = self.queue.pop_front() {
                warn!("{} expired in queue", queued.local_id);
                out.emit(Event::DeliveryFailed(queued.local_id, MqttError::Expired));
            }
        }
    }

    /// Earliest instant at which [`DeliveryManager::on_tick`] has work to do.
    pub fn next_deadline(&self, connected: bool) -> Option<Instant> {
        let in_flight = self.window.iter().flatten();
        let expiry = self.retention.and_then(|retention| {
            in_flight
                .clone()
                .map(|entry| entry.accepted_at)
                .chain(self.queue.front().map(|queued| queued.accepted_at))
                .min()
                .map(|oldest| oldest + retention)
        });
        let retry = match (self.retry_interval, connected) {
            (Some(interval), true) => in_flight.map(|entry| entry.last_sent + interval).min(),
            _ => None,
        };
        match (expiry, retry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fails every in-flight message with `reason`, oldest first.
    pub fn cancel_in_flight(&mut self, reason: MqttError, ids: &mut PacketIds, out: &mut Outbox) {
        for slot in self.ordered_slots() {
            if let Some(entry) = self.free(slot, ids) {
                out.emit(Event::DeliveryFailed(entry.local_id, reason));
            }
        }
    }

    /// Fails every queued message with `reason`, oldest first.
    pub fn cancel_queued(&mut self, reason: MqttError, out: &mut Outbox) {
        for queued in self.queue.drain(..) {
            out.emit(Event::DeliveryFailed(queued.local_id, reason));
        }
    }
}
