//! # MQTT Packet Structures and Serialization
//!
//! This module defines the MQTT 3.1.1 control packets and the traits for encoding them to
//! and decoding them from byte frames. Every function here is pure: no state survives a call
//! except inside [`FrameBuffer`], which only reassembles frames from a byte stream.

use alloc::vec::Vec;

use crate::error::{ConnectReturnCode, ProtocolError};
use crate::util::{
    self, read_binary, read_u8, read_u16, read_utf8_string, write_binary, write_utf8_string,
};

/// Protocol level byte for MQTT 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 4;
const PROTOCOL_NAME: &str = "MQTT";

pub const CONNECT: u8 = 1;
pub const CONNACK: u8 = 2;
pub const PUBLISH: u8 = 3;
pub const PUBACK: u8 = 4;
pub const PUBREC: u8 = 5;
pub const PUBREL: u8 = 6;
pub const PUBCOMP: u8 = 7;
pub const SUBSCRIBE: u8 = 8;
pub const SUBACK: u8 = 9;
pub const UNSUBSCRIBE: u8 = 10;
pub const UNSUBACK: u8 = 11;
pub const PINGREQ: u8 = 12;
pub const PINGRESP: u8 = 13;
pub const DISCONNECT: u8 = 14;

/// Represents the Quality of Service (QoS) levels for MQTT messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(val: u8) -> Result<Self, Self::Error> {
        match val {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(ProtocolError::InvalidQoS(other)),
        }
    }
}

impl core::fmt::Display for QoS {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

/// A trait for packets that can be encoded into a byte frame.
pub trait EncodePacket {
    /// Appends the complete frame (fixed header included) to `out`.
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), ProtocolError>;

    fn to_vec(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::new();
        self.encode(&mut out)?;
        Ok(out)
    }
}

/// A trait for packets that can be decoded from the body of a frame.
pub trait DecodePacket<'a>: Sized {
    /// `flags` is the low nibble of the fixed header, `body` the variable header and payload.
    fn decode(flags: u8, body: &'a [u8]) -> Result<Self, ProtocolError>;
}

/// Writes the fixed header and `body` to `out`.
fn write_frame(out: &mut Vec<u8>, first_byte: u8, body: &[u8]) -> Result<(), ProtocolError> {
    out.push(first_byte);
    util::write_variable_byte_integer(out, body.len())?;
    out.extend_from_slice(body);
    Ok(())
}

fn expect_flags(flags: u8, expected: u8) -> Result<(), ProtocolError> {
    if flags != expected {
        return Err(ProtocolError::InvalidFlags(flags));
    }
    Ok(())
}

fn expect_consumed(cursor: usize, body: &[u8]) -> Result<(), ProtocolError> {
    if cursor != body.len() {
        return Err(ProtocolError::MalformedPacket);
    }
    Ok(())
}

fn read_packet_id(cursor: &mut usize, body: &[u8]) -> Result<u16, ProtocolError> {
    match read_u16(cursor, body)? {
        0 => Err(ProtocolError::ZeroPacketId),
        id => Ok(id),
    }
}

/// An enumeration of all MQTT 3.1.1 control packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet<'a> {
    Connect(Connect<'a>),
    ConnAck(ConnAck),
    Publish(Publish<'a>),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    Subscribe(Subscribe<'a>),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe<'a>),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet<'_> {
    /// The 4-bit control packet type.
    pub fn packet_type(&self) -> u8 {
        match self {
            Packet::Connect(_) => CONNECT,
            Packet::ConnAck(_) => CONNACK,
            Packet::Publish(_) => PUBLISH,
            Packet::PubAck(_) => PUBACK,
            Packet::PubRec(_) => PUBREC,
            Packet::PubRel(_) => PUBREL,
            Packet::PubComp(_) => PUBCOMP,
            Packet::Subscribe(_) => SUBSCRIBE,
            Packet::SubAck(_) => SUBACK,
            Packet::Unsubscribe(_) => UNSUBSCRIBE,
            Packet::UnsubAck(_) => UNSUBACK,
            Packet::PingReq => PINGREQ,
            Packet::PingResp => PINGRESP,
            Packet::Disconnect => DISCONNECT,
        }
    }
}

impl EncodePacket for Packet<'_> {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        match self {
            Packet::Connect(p) => p.encode(out),
            Packet::ConnAck(p) => p.encode(out),
            Packet::Publish(p) => p.encode(out),
            Packet::PubAck(p) => p.encode(out),
            Packet::PubRec(p) => p.encode(out),
            Packet::PubRel(p) => p.encode(out),
            Packet::PubComp(p) => p.encode(out),
            Packet::Subscribe(p) => p.encode(out),
            Packet::SubAck(p) => p.encode(out),
            Packet::Unsubscribe(p) => p.encode(out),
            Packet::UnsubAck(p) => p.encode(out),
            Packet::PingReq => write_frame(out, PINGREQ << 4, &[]),
            Packet::PingResp => write_frame(out, PINGRESP << 4, &[]),
            Packet::Disconnect => write_frame(out, DISCONNECT << 4, &[]),
        }
    }
}

/// Parses the fixed header at the start of `buf`.
///
/// Returns `Ok(None)` until the whole frame is available, otherwise the total frame length
/// (fixed header included).
pub fn frame_length(buf: &[u8]) -> Result<Option<usize>, ProtocolError> {
    let mut remaining = 0usize;
    let mut multiplier = 1usize;
    for i in 0..4 {
        let Some(&byte) = buf.get(1 + i) else {
            return Ok(None);
        };
        remaining += (byte & 127) as usize * multiplier;
        if byte & 128 == 0 {
            let total = 1 + i + 1 + remaining;
            return Ok((buf.len() >= total).then_some(total));
        }
        multiplier *= 128;
    }
    Err(ProtocolError::MalformedPacket)
}

/// Decodes one complete frame into a specific [`Packet`].
///
/// `frame` must hold exactly one frame, as delimited by [`frame_length`].
pub fn decode(frame: &[u8]) -> Result<Packet<'_>, ProtocolError> {
    let first = *frame.first().ok_or(ProtocolError::MalformedPacket)?;
    let mut cursor = 1;
    let remaining = util::read_variable_byte_integer(&mut cursor, frame)?;
    let body = frame
        .get(cursor..cursor + remaining)
        .ok_or(ProtocolError::MalformedPacket)?;
    if cursor + remaining != frame.len() {
        return Err(ProtocolError::MalformedPacket);
    }

    let packet_type = first >> 4;
    let flags = first & 0x0F;
    let packet = match packet_type {
        CONNECT => Packet::Connect(Connect::decode(flags, body)?),
        CONNACK => Packet::ConnAck(ConnAck::decode(flags, body)?),
        PUBLISH => Packet::Publish(Publish::decode(flags, body)?),
        PUBACK => Packet::PubAck(PubAck::decode(flags, body)?),
        PUBREC => Packet::PubRec(PubRec::decode(flags, body)?),
        PUBREL => Packet::PubRel(PubRel::decode(flags, body)?),
        PUBCOMP => Packet::PubComp(PubComp::decode(flags, body)?),
        SUBSCRIBE => Packet::Subscribe(Subscribe::decode(flags, body)?),
        SUBACK => Packet::SubAck(SubAck::decode(flags, body)?),
        UNSUBSCRIBE => Packet::Unsubscribe(Unsubscribe::decode(flags, body)?),
        UNSUBACK => Packet::UnsubAck(UnsubAck::decode(flags, body)?),
        PINGREQ | PINGRESP | DISCONNECT => {
            expect_flags(flags, 0)?;
            expect_consumed(0, body)?;
            match packet_type {
                PINGREQ => Packet::PingReq,
                PINGRESP => Packet::PingResp,
                _ => Packet::Disconnect,
            }
        }
        _ => return Err(ProtocolError::InvalidPacketType(packet_type)),
    };
    Ok(packet)
}

// --- CONNECT Packet ---

/// The will message registered with the broker at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill<'a> {
    pub topic: &'a str,
    pub payload: &'a [u8],
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect<'a> {
    pub client_id: &'a str,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<&'a str>,
    pub password: Option<&'a [u8]>,
    pub will: Option<LastWill<'a>>,
}

impl<'a> Connect<'a> {
    pub fn new(client_id: &'a str, keep_alive: u16, clean_session: bool) -> Self {
        Self {
            client_id,
            keep_alive,
            clean_session,
            username: None,
            password: None,
            will: None,
        }
    }
}

impl EncodePacket for Connect<'_> {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        // MQTT-3.1.2-22: a password requires a user name.
        if self.password.is_some() && self.username.is_none() {
            return Err(ProtocolError::MalformedPacket);
        }

        let mut body = Vec::new();
        write_utf8_string(&mut body, PROTOCOL_NAME)?;
        body.push(PROTOCOL_LEVEL);

        let mut flags = 0u8;
        if self.clean_session {
            flags |= 0x02;
        }
        if let Some(will) = &self.will {
            flags |= 0x04 | ((will.qos as u8) << 3);
            if will.retain {
                flags |= 0x20;
            }
        }
        if self.password.is_some() {
            flags |= 0x40;
        }
        if self.username.is_some() {
            flags |= 0x80;
        }
        body.push(flags);
        body.extend_from_slice(&self.keep_alive.to_be_bytes());

        write_utf8_string(&mut body, self.client_id)?;
        if let Some(will) = &self.will {
            write_utf8_string(&mut body, will.topic)?;
            write_binary(&mut body, will.payload)?;
        }
        if let Some(username) = self.username {
            write_utf8_string(&mut body, username)?;
        }
        if let Some(password) = self.password {
            write_binary(&mut body, password)?;
        }
        write_frame(out, CONNECT << 4, &body)
    }
}

impl<'a> DecodePacket<'a> for Connect<'a> {
    fn decode(flags: u8, body: &'a [u8]) -> Result<Self, ProtocolError> {
        expect_flags(flags, 0)?;
        let mut cursor = 0;
        if read_utf8_string(&mut cursor, body)? != PROTOCOL_NAME
            || read_u8(&mut cursor, body)? != PROTOCOL_LEVEL
        {
            return Err(ProtocolError::MalformedPacket);
        }
        let connect_flags = read_u8(&mut cursor, body)?;
        if connect_flags & 0x01 != 0 {
            return Err(ProtocolError::MalformedPacket);
        }
        let keep_alive = read_u16(&mut cursor, body)?;
        let client_id = read_utf8_string(&mut cursor, body)?;

        let will_flag = connect_flags & 0x04 != 0;
        let will_qos = QoS::try_from((connect_flags >> 3) & 0x03)?;
        let will_retain = connect_flags & 0x20 != 0;
        let will = if will_flag {
            let topic = read_utf8_string(&mut cursor, body)?;
            let payload = read_binary(&mut cursor, body)?;
            Some(LastWill {
                topic,
                payload,
                qos: will_qos,
                retain: will_retain,
            })
        } else {
            if will_qos != QoS::AtMostOnce || will_retain {
                return Err(ProtocolError::MalformedPacket);
            }
            None
        };

        let has_username = connect_flags & 0x80 != 0;
        let has_password = connect_flags & 0x40 != 0;
        if has_password && !has_username {
            return Err(ProtocolError::MalformedPacket);
        }
        let username = if has_username {
            Some(read_utf8_string(&mut cursor, body)?)
        } else {
            None
        };
        let password = if has_password {
            Some(read_binary(&mut cursor, body)?)
        } else {
            None
        };
        expect_consumed(cursor, body)?;

        Ok(Self {
            client_id,
            keep_alive,
            clean_session: connect_flags & 0x02 != 0,
            username,
            password,
            will,
        })
    }
}

// --- CONNACK Packet ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}

impl EncodePacket for ConnAck {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let body = [self.session_present as u8, self.return_code.into()];
        write_frame(out, CONNACK << 4, &body)
    }
}

impl<'a> DecodePacket<'a> for ConnAck {
    fn decode(flags: u8, body: &'a [u8]) -> Result<Self, ProtocolError> {
        expect_flags(flags, 0)?;
        let [ack_flags, code] = body else {
            return Err(ProtocolError::MalformedPacket);
        };
        if ack_flags & 0xFE != 0 {
            return Err(ProtocolError::MalformedPacket);
        }
        Ok(Self {
            session_present: ack_flags & 0x01 != 0,
            return_code: ConnectReturnCode::from(*code),
        })
    }
}

// --- PUBLISH Packet ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish<'a> {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: &'a str,
    pub packet_id: Option<u16>,
    pub payload: &'a [u8],
}

impl Publish<'_> {
    /// Size of the encoded frame, fixed header included.
    pub fn encoded_len(&self) -> usize {
        let remaining = 2
            + self.topic.len()
            + if self.qos == QoS::AtMostOnce { 0 } else { 2 }
            + self.payload.len();
        let len_bytes = match remaining {
            0..=127 => 1,
            128..=16_383 => 2,
            16_384..=2_097_151 => 3,
            _ => 4,
        };
        1 + len_bytes + remaining
    }
}

impl EncodePacket for Publish<'_> {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        // MQTT-3.3.1-2: DUP must be 0 for QoS 0.
        let dup = self.dup && self.qos != QoS::AtMostOnce;
        let first = (PUBLISH << 4) | ((dup as u8) << 3) | ((self.qos as u8) << 1) | self.retain as u8;

        let mut body = Vec::with_capacity(self.topic.len() + self.payload.len() + 4);
        write_utf8_string(&mut body, self.topic)?;
        match (self.qos, self.packet_id) {
            (QoS::AtMostOnce, _) => {}
            (_, Some(0)) => return Err(ProtocolError::ZeroPacketId),
            (_, Some(id)) => body.extend_from_slice(&id.to_be_bytes()),
            (_, None) => return Err(ProtocolError::ZeroPacketId),
        }
        body.extend_from_slice(self.payload);
        write_frame(out, first, &body)
    }
}

impl<'a> DecodePacket<'a> for Publish<'a> {
    fn decode(flags: u8, body: &'a [u8]) -> Result<Self, ProtocolError> {
        let qos = QoS::try_from((flags >> 1) & 0x03)?;
        let dup = flags & 0x08 != 0;
        let retain = flags & 0x01 != 0;

        let mut cursor = 0;
        let topic = read_utf8_string(&mut cursor, body)?;
        if topic.is_empty() || topic.contains(['+', '#']) {
            return Err(ProtocolError::MalformedPacket);
        }
        let packet_id = if qos == QoS::AtMostOnce {
            None
        } else {
            Some(read_packet_id(&mut cursor, body)?)
        };

        Ok(Publish {
            dup,
            qos,
            retain,
            topic,
            packet_id,
            payload: &body[cursor..],
        })
    }
}

// --- PUBACK / PUBREC / PUBREL / PUBCOMP / UNSUBACK ---

macro_rules! ack_packet {
    ($(#[$meta:meta])* $name:ident, $packet_type:expr, $flags:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            pub packet_id: u16,
        }

        impl EncodePacket for $name {
            fn encode(&self, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
                if self.packet_id == 0 {
                    return Err(ProtocolError::ZeroPacketId);
                }
                write_frame(out, ($packet_type << 4) | $flags, &self.packet_id.to_be_bytes())
            }
        }

        impl<'a> DecodePacket<'a> for $name {
            fn decode(flags: u8, body: &'a [u8]) -> Result<Self, ProtocolError> {
                expect_flags(flags, $flags)?;
                let mut cursor = 0;
                let packet_id = read_packet_id(&mut cursor, body)?;
                expect_consumed(cursor, body)?;
                Ok(Self { packet_id })
            }
        }
    };
}

ack_packet!(
    /// Acknowledges a QoS 1 PUBLISH.
    PubAck, PUBACK, 0x00
);
ack_packet!(
    /// First acknowledgement of a QoS 2 PUBLISH.
    PubRec, PUBREC, 0x00
);
ack_packet!(
    /// Releases a QoS 2 PUBLISH after PUBREC.
    PubRel, PUBREL, 0x02
);
ack_packet!(
    /// Completes a QoS 2 exchange.
    PubComp, PUBCOMP, 0x00
);
ack_packet!(UnsubAck, UNSUBACK, 0x00);

// --- SUBSCRIBE Packet ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe<'a> {
    pub packet_id: u16,
    pub filters: Vec<(&'a str, QoS)>,
}

impl<'a> Subscribe<'a> {
    /// Creates a new Subscribe packet with a single topic filter.
    pub fn new(packet_id: u16, filter: &'a str, qos: QoS) -> Self {
        Self {
            packet_id,
            filters: alloc::vec![(filter, qos)],
        }
    }
}

impl EncodePacket for Subscribe<'_> {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        if self.packet_id == 0 {
            return Err(ProtocolError::ZeroPacketId);
        }
        // MQTT-3.8.3-3: at least one filter.
        if self.filters.is_empty() {
            return Err(ProtocolError::MalformedPacket);
        }
        let mut body = Vec::new();
        body.extend_from_slice(&self.packet_id.to_be_bytes());
        for (filter, qos) in &self.filters {
            write_utf8_string(&mut body, filter)?;
            body.push(*qos as u8);
        }
        write_frame(out, (SUBSCRIBE << 4) | 0x02, &body)
    }
}

impl<'a> DecodePacket<'a> for Subscribe<'a> {
    fn decode(flags: u8, body: &'a [u8]) -> Result<Self, ProtocolError> {
        expect_flags(flags, 0x02)?;
        let mut cursor = 0;
        let packet_id = read_packet_id(&mut cursor, body)?;
        let mut filters = Vec::new();
        while cursor < body.len() {
            let filter = read_utf8_string(&mut cursor, body)?;
            let options = read_u8(&mut cursor, body)?;
            if options & 0xFC != 0 {
                return Err(ProtocolError::MalformedPacket);
            }
            filters.push((filter, QoS::try_from(options)?));
        }
        if filters.is_empty() {
            return Err(ProtocolError::MalformedPacket);
        }
        Ok(Self { packet_id, filters })
    }
}

// --- SUBACK Packet ---

/// Per-filter result carried in a SUBACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SubAckReturnCode {
    Granted(QoS),
    Failure,
}

impl From<SubAckReturnCode> for u8 {
    fn from(code: SubAckReturnCode) -> Self {
        match code {
            SubAckReturnCode::Granted(qos) => qos as u8,
            SubAckReturnCode::Failure => 0x80,
        }
    }
}

impl TryFrom<u8> for SubAckReturnCode {
    type Error = ProtocolError;

    fn try_from(val: u8) -> Result<Self, Self::Error> {
        match val {
            0x80 => Ok(SubAckReturnCode::Failure),
            other => QoS::try_from(other)
                .map(SubAckReturnCode::Granted)
                .map_err(|_| ProtocolError::MalformedPacket),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    pub return_codes: Vec<SubAckReturnCode>,
}

impl EncodePacket for SubAck {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let mut body = Vec::with_capacity(2 + self.return_codes.len());
        body.extend_from_slice(&self.packet_id.to_be_bytes());
        body.extend(self.return_codes.iter().map(|code| u8::from(*code)));
        write_frame(out, SUBACK << 4, &body)
    }
}

impl<'a> DecodePacket<'a> for SubAck {
    fn decode(flags: u8, body: &'a [u8]) -> Result<Self, ProtocolError> {
        expect_flags(flags, 0)?;
        let mut cursor = 0;
        let packet_id = read_packet_id(&mut cursor, body)?;
        let return_codes = body[cursor..]
            .iter()
            .map(|code| SubAckReturnCode::try_from(*code))
            .collect::<Result<Vec<_>, _>>()?;
        if return_codes.is_empty() {
            return Err(ProtocolError::MalformedPacket);
        }
        Ok(SubAck {
            packet_id,
            return_codes,
        })
    }
}

// --- UNSUBSCRIBE Packet ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe<'a> {
    pub packet_id: u16,
    pub filters: Vec<&'a str>,
}

impl EncodePacket for Unsubscribe<'_> {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        if self.packet_id == 0 {
            return Err(ProtocolError::ZeroPacketId);
        }
        if self.filters.is_empty() {
            return Err(ProtocolError::MalformedPacket);
        }
        let mut body = Vec::new();
        body.extend_from_slice(&self.packet_id.to_be_bytes());
        for filter in &self.filters {
            write_utf8_string(&mut body, filter)?;
        }
        write_frame(out, (UNSUBSCRIBE << 4) | 0x02, &body)
    }
}

impl<'a> DecodePacket<'a> for Unsubscribe<'a> {
    fn decode(flags: u8, body: &'a [u8]) -> Result<Self, ProtocolError> {
        expect_flags(flags, 0x02)?;
        let mut cursor = 0;
        let packet_id = read_packet_id(&mut cursor, body)?;
        let mut filters = Vec::new();
        while cursor < body.len() {
            filters.push(read_utf8_string(&mut cursor, body)?);
        }
        if filters.is_empty() {
            return Err(ProtocolError::MalformedPacket);
        }
        Ok(Self { packet_id, filters })
    }
}

/// Reassembles frames from a byte stream in a fixed buffer of `N` bytes.
///
/// `N` is also the largest frame the client accepts.
pub struct FrameBuffer<const N: usize> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> FrameBuffer<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
        }
    }

    /// Free space the transport may read into; follow with [`FrameBuffer::advance`].
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.len..]
    }

    pub fn advance(&mut self, n: usize) {
        self.len = (self.len + n).min(N);
    }

    /// Length of the complete frame at the front of the buffer, if there is one.
    pub fn complete_frame(&self) -> Result<Option<usize>, ProtocolError> {
        let buffered = &self.buf[..self.len];
        match frame_length(buffered)? {
            Some(len) => Ok(Some(len)),
            None => {
                // Once the header is readable, a frame that can never fit is fatal.
                if let Some(total) = declared_length(buffered)
                    && total > N
                {
                    return Err(ProtocolError::PayloadTooLarge);
                }
                Ok(None)
            }
        }
    }

    pub fn frame(&self, len: usize) -> &[u8] {
        &self.buf[..len.min(self.len)]
    }

    /// Drops the first `len` bytes, shifting any remainder to the front.
    pub fn consume(&mut self, len: usize) {
        let len = len.min(self.len);
        self.buf.copy_within(len..self.len, 0);
        self.len -= len;
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<const N: usize> Default for FrameBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Total frame length announced by a readable fixed header, complete or not.
fn declared_length(buf: &[u8]) -> Option<usize> {
    let mut cursor = 1;
    let remaining = util::read_variable_byte_integer(&mut cursor, buf).ok()?;
    Some(cursor + remaining)
}
