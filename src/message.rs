use std::fmt::{Debug, Display, Formatter};

use anyhow::{anyhow, bail};
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::message_counter::MessageCounter;

/// Identifies the kind of a message, both for dispatching it to a handler on the receiving side and
///  as the scope of all reliability state: acks, duplicate detection, sequencing and ordering are
///  tracked per (connection, message type).
///
/// Types `0..=40` are reserved for the transport itself.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct MessageType(pub i16);

impl Display for MessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl MessageType {
    pub const ACK: MessageType = MessageType(0);
    pub const RPC_SEND_TO_END_POINT: MessageType = MessageType(1);
    pub const RPC_RESEND: MessageType = MessageType(2);

    pub const MAX_RESERVED: i16 = 40;

    pub fn is_reserved(&self) -> bool {
        (0..=Self::MAX_RESERVED).contains(&self.0)
    }
}

/// Identity of a connection, generated randomly when the connection is created. It is sent with
///  every ack message so that acks can be attributed to the connection that triggered them.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Token(pub u32);

impl Debug for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Token({:08x})", self.0)
    }
}

impl Token {
    pub fn generate() -> Token {
        Token(rand::random())
    }
}

bitflags! {
    /// Delivery flags as they are transmitted on the wire
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MessageFlags: u8 {
        const RELIABLE  = 0b0000_0001;
        const SEQUENCED = 0b0000_0010;
        const ORDERED   = 0b0000_0100;
        /// the message header carries the sender's connection [Token]
        const TOKEN     = 0b0000_1000;
    }
}

/// The delivery guarantee requested for a message. Ordering and sequencing are mutually exclusive,
///  and this enum makes combining them unrepresentable.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Mode {
    /// fire and forget, no guarantees
    Unreliable,
    /// retransmitted until acknowledged, delivered at most once but in no particular order
    Reliable,
    /// only messages newer than the newest delivered message of the same type are delivered
    Sequenced,
    ReliableSequenced,
    /// delivered strictly in send order, holding back messages that arrive early. NB: without
    ///  `Reliable`, a single lost message stalls the type's delivery for good
    Ordered,
    ReliableOrdered,
}

impl Mode {
    pub fn flags(self) -> MessageFlags {
        match self {
            Mode::Unreliable => MessageFlags::empty(),
            Mode::Reliable => MessageFlags::RELIABLE,
            Mode::Sequenced => MessageFlags::SEQUENCED,
            Mode::ReliableSequenced => MessageFlags::RELIABLE | MessageFlags::SEQUENCED,
            Mode::Ordered => MessageFlags::ORDERED,
            Mode::ReliableOrdered => MessageFlags::RELIABLE | MessageFlags::ORDERED,
        }
    }

    pub fn from_flags(flags: MessageFlags) -> anyhow::Result<Mode> {
        let reliable = flags.contains(MessageFlags::RELIABLE);
        match (flags.contains(MessageFlags::SEQUENCED), flags.contains(MessageFlags::ORDERED)) {
            (false, false) => Ok(if reliable { Mode::Reliable } else { Mode::Unreliable }),
            (true, false) => Ok(if reliable { Mode::ReliableSequenced } else { Mode::Sequenced }),
            (false, true) => Ok(if reliable { Mode::ReliableOrdered } else { Mode::Ordered }),
            (true, true) => bail!("message flags {:?} combine sequenced and ordered delivery", flags),
        }
    }
}

/// Each delivery class has its own counter namespace per message type
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum DeliveryClass {
    Unordered,
    Reliable,
    Sequenced,
    Ordered,
}

/// A message is the unit of delivery. It is immutable once created - the counter is assigned
///  when the message is handed to a connection for sending, creating a copy that shares the body.
///
/// Wire format, all numbers in network byte order (BE):
/// ```ascii
///  0: message type (i16)
///  2: flags (u8) - see [MessageFlags]
///  3: counter (u64)
/// 11: connection token (u32) - present only if the TOKEN flag is set
///  *: body, extending to the end of the enclosing frame
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    msg_type: MessageType,
    mode: Mode,
    counter: MessageCounter,
    token: Option<Token>,
    body: Bytes,
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Message{{type:{},counter:{},mode:{:?},body_len:{}}}", self.msg_type, self.counter, self.mode, self.body.len())
    }
}

impl Message {
    pub const HEADER_LEN: usize = size_of::<i16>() + size_of::<u8>() + size_of::<u64>();
    pub const TOKEN_LEN: usize = size_of::<u32>();
    pub const ACK_BODY_LEN: usize = size_of::<i32>() + size_of::<i16>();

    pub fn new(msg_type: MessageType, mode: Mode, body: impl Into<Bytes>) -> Message {
        Message {
            msg_type,
            mode,
            counter: MessageCounter::ZERO,
            token: None,
            body: body.into(),
        }
    }

    /// An ack for messages of `acked_type`: bit `i` of `bitfield` confirms counter `base + i`.
    pub fn ack(acked_type: MessageType, base: MessageCounter, token: Token, bitfield: u32) -> Message {
        let mut body = BytesMut::with_capacity(Self::ACK_BODY_LEN);
        body.put_u32(bitfield);
        body.put_i16(acked_type.0);

        Message {
            msg_type: MessageType::ACK,
            mode: Mode::Unreliable,
            counter: base,
            token: Some(token),
            body: body.freeze(),
        }
    }

    pub fn with_counter(&self, counter: MessageCounter) -> Message {
        Message {
            counter,
            ..self.clone()
        }
    }

    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    pub fn counter(&self) -> MessageCounter {
        self.counter
    }

    pub fn token(&self) -> Option<Token> {
        self.token
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn is_reliable(&self) -> bool {
        self.mode.flags().contains(MessageFlags::RELIABLE)
    }

    pub fn is_sequenced(&self) -> bool {
        self.mode.flags().contains(MessageFlags::SEQUENCED)
    }

    pub fn is_ordered(&self) -> bool {
        self.mode.flags().contains(MessageFlags::ORDERED)
    }

    pub fn is_ack(&self) -> bool {
        self.msg_type == MessageType::ACK
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn delivery_class(&self) -> DeliveryClass {
        if self.is_ordered() {
            DeliveryClass::Ordered
        }
        else if self.is_sequenced() {
            DeliveryClass::Sequenced
        }
        else if self.is_reliable() {
            DeliveryClass::Reliable
        }
        else {
            DeliveryClass::Unordered
        }
    }

    pub fn serialized_len(&self) -> usize {
        let token_len = if self.token.is_some() { Self::TOKEN_LEN } else { 0 };
        Self::HEADER_LEN + token_len + self.body.len()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let mut flags = self.mode.flags();
        flags.set(MessageFlags::TOKEN, self.token.is_some());

        buf.put_i16(self.msg_type.0);
        buf.put_u8(flags.bits());
        buf.put_u64(self.counter.to_raw());
        if let Some(token) = self.token {
            buf.put_u32(token.0);
        }
        buf.put_slice(&self.body);
    }

    /// parses a message, treating everything after the header as the message's body
    pub fn deser(mut buf: Bytes) -> anyhow::Result<Message> {
        let msg_type = MessageType(buf.try_get_i16()?);
        let raw_flags = buf.try_get_u8()?;
        let flags = MessageFlags::from_bits(raw_flags)
            .ok_or_else(|| anyhow!("unsupported message flags {:#010b}", raw_flags))?;
        let mode = Mode::from_flags(flags)?;
        let counter = MessageCounter::from_raw(buf.try_get_u64()?);

        let token = if flags.contains(MessageFlags::TOKEN) {
            Some(Token(buf.try_get_u32()?))
        }
        else {
            None
        };

        Ok(Message {
            msg_type,
            mode,
            counter,
            token,
            body: buf,
        })
    }

    /// returns the ack bitfield and the acknowledged message type
    pub fn parse_ack_body(&self) -> anyhow::Result<(u32, MessageType)> {
        if !self.is_ack() {
            bail!("message of type {} is not an ack", self.msg_type);
        }

        let mut buf: &[u8] = &self.body;
        let bitfield = buf.try_get_u32()?;
        let acked_type = MessageType(buf.try_get_i16()?);
        Ok((bitfield, acked_type))
    }
}
