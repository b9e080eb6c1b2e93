use std::mem;

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::message::Message;
use crate::safe_converter::PrecheckedCast;

/// An entry in a connection's send buffer.
///
/// Packets that must be acknowledged (reliable but not sequenced messages) are 'persistent': they
///  stay in the buffer and are sent on every tick until the peer acknowledges them. All other
///  packets are sent once and then dropped.
///
/// When a send tick cannot fit a packet into its budget, the packet's priority is increased so
///  that it eventually overtakes newer packets.
#[derive(Debug, Clone)]
pub struct Packet {
    message: Message,
    priority: u32,
}

impl Packet {
    pub const FRAME_HEADER_LEN: usize = size_of::<i32>();

    pub fn new(message: Message) -> Packet {
        Packet {
            message,
            priority: 0,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn resend(&self) -> bool {
        self.message.is_reliable() && !self.message.is_sequenced()
    }

    pub(crate) fn age(&mut self) {
        self.priority = self.priority.saturating_add(1);
    }

    /// number of bytes this packet occupies in a datagram
    pub fn frame_len(&self) -> usize {
        Self::FRAME_HEADER_LEN + self.message.serialized_len()
    }

    /// Writes the packet as a frame:
    /// ```ascii
    /// 0: frame length (i32 BE), starting *after* the encoded length
    /// 4: serialized message
    /// ```
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_i32(self.message.serialized_len().prechecked_cast());
        self.message.ser(buf);
    }
}

/// Packs frames into datagrams, starting a new datagram whenever the next frame would exceed the
///  byte limit of the current one
pub struct DatagramBuilder {
    byte_limit: usize,
    current: BytesMut,
    sealed: Vec<Bytes>,
}

impl DatagramBuilder {
    pub fn new(byte_limit: usize) -> DatagramBuilder {
        DatagramBuilder {
            byte_limit,
            current: BytesMut::new(),
            sealed: Vec::new(),
        }
    }

    pub fn fits(&self, packet: &Packet) -> bool {
        packet.frame_len() <= self.byte_limit
    }

    /// returns `false` without adding anything if the packet exceeds the byte limit on its own
    pub fn try_add(&mut self, packet: &Packet) -> bool {
        if !self.fits(packet) {
            return false;
        }

        if self.current.len() + packet.frame_len() > self.byte_limit {
            self.seal();
        }
        packet.ser(&mut self.current);
        true
    }

    fn seal(&mut self) {
        if !self.current.is_empty() {
            self.sealed.push(mem::take(&mut self.current).freeze());
        }
    }

    pub fn finish(mut self) -> Vec<Bytes> {
        self.seal();
        self.sealed
    }
}

/// Splits a received datagram into its messages. A malformed frame invalidates the rest of the
///  datagram since there is no way to find the next frame boundary.
pub fn parse_datagram(mut buf: Bytes) -> anyhow::Result<Vec<Message>> {
    let mut result = Vec::new();
    while buf.has_remaining() {
        let frame_len = buf.try_get_i32()?;
        if frame_len < 0 {
            bail!("negative frame length {}", frame_len);
        }
        let frame_len = frame_len as usize;
        if frame_len > buf.remaining() {
            bail!("frame length {} exceeds the remaining {} bytes of the datagram", frame_len, buf.remaining());
        }

        result.push(Message::deser(buf.split_to(frame_len))?);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageType, Mode};
    use crate::message_counter::MessageCounter;
    use rstest::rstest;

    fn packet(mode: Mode, body_len: usize) -> Packet {
        Packet::new(Message::new(MessageType(50), mode, vec![9u8; body_len]))
    }

    #[rstest]
    #[case::unreliable(Mode::Unreliable, false)]
    #[case::reliable(Mode::Reliable, true)]
    #[case::sequenced(Mode::Sequenced, false)]
    #[case::reliable_sequenced(Mode::ReliableSequenced, false)]
    #[case::ordered(Mode::Ordered, false)]
    #[case::reliable_ordered(Mode::ReliableOrdered, true)]
    fn test_resend(#[case] mode: Mode, #[case] expected: bool) {
        assert_eq!(packet(mode, 0).resend(), expected);
    }

    #[test]
    fn test_ser() {
        let p = Packet::new(Message::new(MessageType(50), Mode::Reliable, vec![1u8, 2])
            .with_counter(MessageCounter::from_raw(3)));

        let mut buf = BytesMut::new();
        p.ser(&mut buf);
        assert_eq!(buf.as_ref(), &[0,0,0,13, 0,50, 1, 0,0,0,0,0,0,0,3, 1,2]);
        assert_eq!(p.frame_len(), buf.len());
    }

    #[test]
    fn test_age() {
        let mut p = packet(Mode::Reliable, 0);
        p.age();
        p.age();
        assert_eq!(p.priority(), 2);
    }

    #[rstest]
    #[case::empty(100, vec![], vec![])]
    #[case::single(100, vec![10], vec![25])]
    #[case::two_in_one(100, vec![10, 10], vec![50])]
    #[case::exact_fit(50, vec![10, 10], vec![50])]
    #[case::split(49, vec![10, 10], vec![25, 25])]
    #[case::three_into_two(60, vec![10, 10, 10], vec![50, 25])]
    fn test_datagram_builder(#[case] byte_limit: usize, #[case] body_lens: Vec<usize>, #[case] expected_datagram_lens: Vec<usize>) {
        let mut builder = DatagramBuilder::new(byte_limit);
        for body_len in body_lens {
            assert!(builder.try_add(&packet(Mode::Unreliable, body_len)));
        }

        let datagrams = builder.finish();
        assert_eq!(datagrams.iter().map(|d| d.len()).collect::<Vec<_>>(), expected_datagram_lens);
    }

    #[test]
    fn test_datagram_builder_rejects_oversized() {
        let mut builder = DatagramBuilder::new(20);
        assert!(!builder.try_add(&packet(Mode::Unreliable, 10)));
        assert!(builder.try_add(&packet(Mode::Unreliable, 5)));
        assert_eq!(builder.finish().len(), 1);
    }

    #[test]
    fn test_parse_datagram() {
        let messages = vec![
            Message::new(MessageType(50), Mode::Reliable, vec![1u8, 2]).with_counter(MessageCounter::from_raw(4)),
            Message::new(MessageType(51), Mode::Sequenced, Vec::<u8>::new()).with_counter(MessageCounter::from_raw(5)),
            Message::new(MessageType(52), Mode::ReliableOrdered, vec![3u8; 300]),
        ];

        let mut builder = DatagramBuilder::new(4096);
        for msg in &messages {
            assert!(builder.try_add(&Packet::new(msg.clone())));
        }
        let datagrams = builder.finish();
        assert_eq!(datagrams.len(), 1);

        let parsed = parse_datagram(datagrams[0].clone()).unwrap();
        assert_eq!(parsed, messages);
    }

    #[rstest]
    #[case::truncated_length(vec![0,0,1])]
    #[case::negative_length(vec![0xff,0xff,0xff,0xff])]
    #[case::length_exceeds_datagram(vec![0,0,0,20, 0,50, 0, 0,0,0,0,0,0,0,0])]
    #[case::malformed_message(vec![0,0,0,3, 0,50, 0])]
    fn test_parse_datagram_malformed(#[case] buf: Vec<u8>) {
        assert!(parse_datagram(Bytes::from(buf)).is_err());
    }
}
