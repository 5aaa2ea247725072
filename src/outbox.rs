//! Side effects produced by the protocol core.
//!
//! The core never performs I/O. Each operation appends transport instructions and host
//! events here, and the runtime (or a test) drains them in order.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use embassy_time::Instant;

use crate::dispatcher::{Event, EventDispatcher};
use crate::packet::EncodePacket;

/// A transport instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// Open a new transport session to the configured endpoint.
    Open,
    /// Send one complete MQTT frame.
    Write(Vec<u8>),
    /// Tear the transport session down.
    Close,
}

#[derive(Debug, Default)]
pub(crate) struct Outbox {
    pub outputs: VecDeque<Output>,
    pub events: EventDispatcher,
    /// Time of the most recent frame handed to the transport.
    pub last_write: Option<Instant>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes `packet` and queues it for the transport.
    ///
    /// Packets built by the core are validated on admission, so an encoding failure is
    /// logged and the frame dropped rather than unwinding the caller.
    pub fn send<P: EncodePacket>(&mut self, packet: &P, now: Instant) {
        match packet.to_vec() {
            Ok(frame) => {
                self.outputs.push_back(Output::Write(frame));
                self.last_write = Some(now);
            }
            Err(e) => error!("dropping unencodable packet: {}", e),
        }
    }

    pub fn open(&mut self) {
        self.outputs.push_back(Output::Open);
    }

    pub fn close(&mut self) {
        self.outputs.push_back(Output::Close);
    }

    pub fn emit(&mut self, event: Event) {
        self.events.emit(event);
    }
}
