//! # Subscription Registry
//!
//! Records which topic filters the host asked for and what the broker granted, so that
//! inbound messages can be filtered and subscriptions replayed after a reconnect.
//!
//! A filter is `Pending` until its SUBACK, `Active` once granted, and `PendingRemoval` while an
//! UNSUBSCRIBE is outstanding or after the broker refused it. Only `Pending` and `Active`
//! filters let inbound messages through. A refused filter stays listed until the host either
//! subscribes to it again or unsubscribes, which drops it without a round trip.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use embassy_time::Instant;

use crate::dispatcher::Event;
use crate::error::{MqttError, ProtocolError};
use crate::outbox::Outbox;
use crate::packet::{QoS, SubAckReturnCode, Subscribe, Unsubscribe};
use crate::packet_id::PacketIds;
use crate::topic::{topic_matches, validate_topic_filter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SubscriptionStatus {
    Pending,
    Active,
    PendingRemoval,
}

/// One registered topic filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub filter: String,
    pub requested: QoS,
    /// Set once the broker grants the filter; never above `requested`.
    pub granted: Option<QoS>,
    pub status: SubscriptionStatus,
    /// The host asked for removal, as opposed to the broker refusing the filter.
    unsubscribe_requested: bool,
}

impl Subscription {
    /// The broker refused this filter and the host has not acted on it yet.
    pub fn is_refused(&self) -> bool {
        self.status == SubscriptionStatus::PendingRemoval && !self.unsubscribe_requested
    }
}

#[derive(Debug)]
enum AckKind {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
}

#[derive(Debug)]
struct PendingAck {
    packet_id: u16,
    kind: AckKind,
}

/// What a `subscribe` call did on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// A SUBSCRIBE was written.
    Sent,
    /// Recorded only; sent on the next successful connect.
    Deferred,
    /// A SUBSCRIBE for this filter is already awaiting its SUBACK.
    Coalesced,
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: BTreeMap<String, Subscription>,
    pending: Vec<PendingAck>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, filter: &str) -> Option<&Subscription> {
        self.entries.get(filter)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Filters the broker holds or is about to, leaving out refused ones.
    pub fn live(&self) -> usize {
        self.entries.values().filter(|sub| !sub.is_refused()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of SUBSCRIBE/UNSUBSCRIBE packets awaiting acknowledgement.
    pub fn pending_acks(&self) -> usize {
        self.pending.len()
    }

    fn awaiting_suback(&self, filter: &str) -> bool {
        self.pending.iter().any(|ack| match &ack.kind {
            AckKind::Subscribe(filters) => filters.iter().any(|f| f == filter),
            AckKind::Unsubscribe(_) => false,
        })
    }

    /// Whether an inbound message on `topic` should reach the host.
    pub fn matches(&self, topic: &str) -> bool {
        self.entries.values().any(|sub| {
            matches!(
                sub.status,
                SubscriptionStatus::Pending | SubscriptionStatus::Active
            ) && topic_matches(&sub.filter, topic)
        })
    }

    pub(crate) fn subscribe(
        &mut self,
        filter: &str,
        qos: QoS,
        connected: bool,
        ids: &mut PacketIds,
        out: &mut Outbox,
        now: Instant,
    ) -> Result<SubscribeOutcome, MqttError> {
        validate_topic_filter(filter)?;

        let awaiting = connected && self.awaiting_suback(filter);
        if let Some(sub) = self.entries.get_mut(filter) {
            match sub.status {
                SubscriptionStatus::Pending if awaiting => {
                    debug!("subscribe to {} already awaiting SUBACK", filter);
                    return Ok(SubscribeOutcome::Coalesced);
                }
                SubscriptionStatus::Pending => sub.requested = qos,
                SubscriptionStatus::Active => sub.requested = qos,
                SubscriptionStatus::PendingRemoval => {
                    sub.status = SubscriptionStatus::Pending;
                    sub.requested = qos;
                    sub.granted = None;
                    sub.unsubscribe_requested = false;
                }
            }
        } else {
            self.entries.insert(
                String::from(filter),
                Subscription {
                    filter: String::from(filter),
                    requested: qos,
                    granted: None,
                    status: SubscriptionStatus::Pending,
                    unsubscribe_requested: false,
                },
            );
        }

        if !connected {
            return Ok(SubscribeOutcome::Deferred);
        }
        if self.send_subscribe(alloc::vec![(String::from(filter), qos)], ids, out, now) {
            Ok(SubscribeOutcome::Sent)
        } else {
            Ok(SubscribeOutcome::Deferred)
        }
    }

    /// Returns `false` if `filter` was never subscribed.
    pub(crate) fn unsubscribe(
        &mut self,
        filter: &str,
        connected: bool,
        ids: &mut PacketIds,
        out: &mut Outbox,
        now: Instant,
    ) -> Result<bool, MqttError> {
        validate_topic_filter(filter)?;
        let Some(sub) = self.entries.get_mut(filter) else {
            debug!("unsubscribe from unknown filter {}", filter);
            return Ok(false);
        };
        if sub.is_refused() {
            // The broker never held it, so there is nothing to send.
            self.entries.remove(filter);
            info!("dropped refused filter {}", filter);
            out.emit(Event::Unsubscribed {
                filter: String::from(filter),
            });
            return Ok(true);
        }
        sub.status = SubscriptionStatus::PendingRemoval;
        sub.unsubscribe_requested = true;

        if connected {
            self.send_unsubscribe(alloc::vec![String::from(filter)], ids, out, now);
        }
        Ok(true)
    }

    fn send_subscribe(
        &mut self,
        filters: Vec<(String, QoS)>,
        ids: &mut PacketIds,
        out: &mut Outbox,
        now: Instant,
    ) -> bool {
        let Some(packet_id) = ids.alloc() else {
            warn!("no packet id free for SUBSCRIBE, deferring to next connect");
            return false;
        };
        out.send(
            &Subscribe {
                packet_id,
                filters: filters.iter().map(|(f, q)| (f.as_str(), *q)).collect(),
            },
            now,
        );
        self.pending.push(PendingAck {
            packet_id,
            kind: AckKind::Subscribe(filters.into_iter().map(|(f, _)| f).collect()),
        });
        true
    }

    fn send_unsubscribe(
        &mut self,
        filters: Vec<String>,
        ids: &mut PacketIds,
        out: &mut Outbox,
        now: Instant,
    ) {
        let Some(packet_id) = ids.alloc() else {
            warn!("no packet id free for UNSUBSCRIBE, deferring to next connect");
            return;
        };
        out.send(
            &Unsubscribe {
                packet_id,
                filters: filters.iter().map(String::as_str).collect(),
            },
            now,
        );
        self.pending.push(PendingAck {
            packet_id,
            kind: AckKind::Unsubscribe(filters),
        });
    }

    fn take_pending(&mut self, packet_id: u16, subscribe: bool) -> Option<AckKind> {
        let index = self.pending.iter().position(|ack| {
            ack.packet_id == packet_id
                && matches!(ack.kind, AckKind::Subscribe(_)) == subscribe
        })?;
        Some(self.pending.swap_remove(index).kind)
    }

    pub(crate) fn on_suback(
        &mut self,
        packet_id: u16,
        return_codes: &[SubAckReturnCode],
        ids: &mut PacketIds,
        out: &mut Outbox,
    ) -> Result<(), ProtocolError> {
        let Some(AckKind::Subscribe(filters)) = self.take_pending(packet_id, true) else {
            warn!("ignoring SUBACK for unknown packet {}", packet_id);
            return Ok(());
        };
        ids.release(packet_id);
        if filters.len() != return_codes.len() {
            return Err(ProtocolError::MalformedPacket);
        }

        for (filter, code) in filters.into_iter().zip(return_codes) {
            let Some(sub) = self.entries.get_mut(&filter) else {
                continue;
            };
            if sub.status == SubscriptionStatus::PendingRemoval {
                // Unsubscribed while the SUBACK was in flight.
                continue;
            }
            match code {
                SubAckReturnCode::Failure => {
                    warn!("broker refused subscription to {}", filter.as_str());
                    sub.status = SubscriptionStatus::PendingRemoval;
                    sub.granted = None;
                    out.emit(Event::SubscriptionError {
                        filter,
                        reason: MqttError::SubscribeRejected,
                    });
                }
                SubAckReturnCode::Granted(qos) => {
                    let granted = (*qos).min(sub.requested);
                    info!("subscribed to {} at {}", filter.as_str(), granted);
                    sub.status = SubscriptionStatus::Active;
                    sub.granted = Some(granted);
                    out.emit(Event::Subscribed { filter, granted });
                }
            }
        }
        Ok(())
    }

    pub(crate) fn on_unsuback(&mut self, packet_id: u16, ids: &mut PacketIds, out: &mut Outbox) {
        let Some(AckKind::Unsubscribe(filters)) = self.take_pending(packet_id, false) else {
            warn!("ignoring UNSUBACK for unknown packet {}", packet_id);
            return;
        };
        ids.release(packet_id);
        for filter in filters {
            self.remove_if_requested(filter, out);
        }
    }

    fn remove_if_requested(&mut self, filter: String, out: &mut Outbox) {
        let removable = self.entries.get(&filter).is_some_and(|sub| {
            sub.status == SubscriptionStatus::PendingRemoval && sub.unsubscribe_requested
        });
        if removable {
            self.entries.remove(&filter);
            info!("unsubscribed from {}", filter.as_str());
            out.emit(Event::Unsubscribed { filter });
        }
    }

    /// Forgets acks that can no longer arrive once the connection is gone.
    pub(crate) fn on_connection_lost(&mut self, ids: &mut PacketIds) {
        for ack in self.pending.drain(..) {
            ids.release(ack.packet_id);
        }
    }

    /// Re-sends the registry after CONNACK.
    ///
    /// All `Pending` and `Active` filters go out in one SUBSCRIBE. Removals the host asked for
    /// go out in one UNSUBSCRIBE when the broker kept the session; otherwise the broker has
    /// nothing to remove and they complete immediately.
    pub(crate) fn replay(
        &mut self,
        session_present: bool,
        ids: &mut PacketIds,
        out: &mut Outbox,
        now: Instant,
    ) {
        self.on_connection_lost(ids);

        let subscribe: Vec<(String, QoS)> = self
            .entries
            .values()
            .filter(|sub| sub.status != SubscriptionStatus::PendingRemoval)
            .map(|sub| (sub.filter.clone(), sub.requested))
            .collect();
        let removals: Vec<String> = self
            .entries
            .values()
            .filter(|sub| {
                sub.status == SubscriptionStatus::PendingRemoval && sub.unsubscribe_requested
            })
            .map(|sub| sub.filter.clone())
            .collect();

        if !subscribe.is_empty() {
            debug!("replaying {} subscriptions", subscribe.len());
            self.send_subscribe(subscribe, ids, out, now);
        }
        if removals.is_empty() {
            return;
        }
        if session_present {
            self.send_unsubscribe(removals, ids, out, now);
        } else {
            for filter in removals {
                self.remove_if_requested(filter, out);
            }
        }
    }

    /// Drops everything tied to a previous broker session. Filters that were only requested
    /// and never acknowledged are kept.
    pub(crate) fn reset_session(&mut self, ids: &mut PacketIds) {
        self.on_connection_lost(ids);
        self.entries
            .retain(|_, sub| sub.status == SubscriptionStatus::Pending);
    }
}
