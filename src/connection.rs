use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::ack::Ack;
use crate::arrival_tracker::ArrivalTracker;
use crate::config::TransportConfig;
use crate::message::{DeliveryClass, Message, MessageType, Token};
use crate::message_counter::MessageCounter;
use crate::message_handler::MessageHandler;
use crate::order_queue::OrderQueue;
use crate::packet::{DatagramBuilder, Packet};

/// Snapshot of a connection's send buffer
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct BufferStatistics {
    pub total: usize,
    /// packets that stay in the buffer until they are acknowledged
    pub with_resend: usize,
    pub without_resend: usize,
}

/// The per-peer reliability engine. A connection is fed from two sides concurrently:
///
/// * the application and the receive loop, which enqueue outgoing messages
///    ([Connection::mark_to_send]) and hand over received messages ([Connection::handle_message])
/// * the periodic send tick, which collects framed datagrams ([Connection::packets_to_send])
///
/// All guarantees are per message type: counters, acks, duplicate detection, sequencing and
///  ordering are tracked independently for each type. Each table has its own lock, and no lock
///  is held while acquiring another one or while a handler runs.
pub struct Connection {
    peer_addr: SocketAddr,
    token: Token,
    max_datagram_size: usize,
    max_packets_per_tick: usize,

    last_activity: Mutex<Instant>,
    peer_token: Mutex<Option<Token>>,

    /// counters for outgoing messages. Each delivery class has its own namespace, so e.g. a
    ///  sequenced message does not leave a gap in the counters of reliable messages.
    send_counters: Mutex<FxHashMap<(MessageType, DeliveryClass), MessageCounter>>,
    acks: Mutex<FxHashMap<MessageType, Ack>>,
    arrivals: Mutex<FxHashMap<MessageType, ArrivalTracker>>,
    last_sequenced: Mutex<FxHashMap<MessageType, MessageCounter>>,
    order_queues: Mutex<FxHashMap<MessageType, OrderQueue>>,
    send_buffer: Mutex<Vec<Packet>>,

    handlers: RwLock<FxHashMap<MessageType, Arc<dyn MessageHandler>>>,
}

impl Connection {
    pub fn new(peer_addr: SocketAddr, config: &TransportConfig) -> Connection {
        Self::with_token(peer_addr, Token::generate(), config)
    }

    pub fn with_token(peer_addr: SocketAddr, token: Token, config: &TransportConfig) -> Connection {
        debug!("initializing connection to {:?} with token {:?}", peer_addr, token);

        Connection {
            peer_addr,
            token,
            max_datagram_size: config.max_datagram_size,
            max_packets_per_tick: config.max_packets_per_tick,
            last_activity: Mutex::new(Instant::now()),
            peer_token: Default::default(),
            send_counters: Default::default(),
            acks: Default::default(),
            arrivals: Default::default(),
            last_sequenced: Default::default(),
            order_queues: Default::default(),
            send_buffer: Default::default(),
            handlers: Default::default(),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// the token the peer sent with its most recent ack, if any
    pub async fn peer_token(&self) -> Option<Token> {
        *self.peer_token.lock().await
    }

    pub async fn update_activity(&self) {
        *self.last_activity.lock().await = Instant::now();
    }

    pub async fn idle_for(&self) -> Duration {
        self.last_activity.lock().await.elapsed()
    }

    /// Returns the counter for an outgoing message, incrementing the counter for the message's
    ///  type and delivery class
    pub async fn next_counter(&self, msg: &Message) -> MessageCounter {
        let mut send_counters = self.send_counters.lock().await;
        let counter = send_counters
            .entry((msg.msg_type(), msg.delivery_class()))
            .or_default();

        let result = *counter;
        *counter = counter.next();
        result
    }

    /// Assigns the next counter to a message and adds it to the send buffer, returning the
    ///  assigned counter. Messages that do not fit into a datagram on their own are rejected.
    pub async fn mark_to_send(&self, msg: Message) -> anyhow::Result<MessageCounter> {
        if msg.is_ack() {
            bail!("ack messages are generated by the connection and can not be sent explicitly");
        }

        let frame_len = Packet::FRAME_HEADER_LEN + msg.serialized_len();
        if frame_len > self.max_datagram_size {
            debug!("message of type {} for {:?} does not fit a datagram: {} bytes framed, limit is {}", msg.msg_type(), self.peer_addr, frame_len, self.max_datagram_size);
            bail!("message of type {} does not fit a datagram: {} bytes framed, limit is {}", msg.msg_type(), frame_len, self.max_datagram_size);
        }

        let counter = self.next_counter(&msg).await;
        let packet = Packet::new(msg.with_counter(counter));
        if packet.resend() {
            self.store_reliable(msg.msg_type()).await;
        }

        trace!("enqueueing message {} of type {} for {:?}", counter, msg.msg_type(), self.peer_addr);
        self.send_buffer.lock().await.push(packet);
        Ok(counter)
    }

    /// Ensures there is ack state for a type we send reliably: acks for types without ack state
    ///  are ignored
    async fn store_reliable(&self, msg_type: MessageType) {
        self.acks.lock().await
            .entry(msg_type)
            .or_default();
    }

    /// Records a received reliable message so the next send tick acknowledges it
    pub async fn receive_reliable(&self, msg: &Message) {
        self.acks.lock().await
            .entry(msg.msg_type())
            .or_default()
            .receive_reliable(msg.counter());
    }

    pub async fn has_already_arrived(&self, msg: &Message) -> bool {
        self.arrivals.lock().await
            .entry(msg.msg_type())
            .or_default()
            .has_already_arrived(msg.counter())
    }

    /// Latest-wins check for sequenced messages: a message is accepted only if its counter is
    ///  higher than that of every previously accepted message of the same type
    pub async fn is_message_in_its_order(&self, msg_type: MessageType, counter: MessageCounter) -> bool {
        match self.last_sequenced.lock().await.entry(msg_type) {
            Entry::Vacant(e) => {
                e.insert(counter);
                true
            }
            Entry::Occupied(mut e) => {
                if counter > *e.get() {
                    e.insert(counter);
                    true
                }
                else {
                    false
                }
            }
        }
    }

    pub async fn messages_to_invoke(&self, msg: Message) -> Vec<Message> {
        self.order_queues.lock().await
            .entry(msg.msg_type())
            .or_default()
            .messages_to_invoke(msg)
    }

    /// Processes an ack received from the peer, removing the confirmed packets from the send
    ///  buffer
    pub async fn process_ack(&self, msg: &Message) -> anyhow::Result<()> {
        let (bitfield, acked_type) = msg.parse_ack_body()?;

        if let Some(token) = msg.token() {
            self.update_peer_token(token).await;
        }

        if !self.acks.lock().await.contains_key(&acked_type) {
            debug!("ack from {:?} for message type {} that was never sent reliably - ignoring", self.peer_addr, acked_type);
            return Ok(());
        }

        // NB: acks do not carry a delivery class, so an ack prunes persistent packets of every
        //      class with a matching counter. Repeated acks find nothing left to prune.
        let confirmed = Ack::process_received_ack_bitfield(bitfield, msg.counter());
        trace!("{:?} confirmed messages {:?} of type {}", self.peer_addr, confirmed, acked_type);

        self.send_buffer.lock().await
            .retain(|p| !(p.resend()
                && p.message().msg_type() == acked_type
                && confirmed.binary_search(&p.message().counter()).is_ok()
            ));
        Ok(())
    }

    async fn update_peer_token(&self, token: Token) {
        let mut peer_token = self.peer_token.lock().await;
        match *peer_token {
            Some(prev) if prev == token => {}
            Some(prev) => {
                debug!("peer {:?} changed its token from {:?} to {:?}", self.peer_addr, prev, token);
                *peer_token = Some(token);
            }
            None => *peer_token = Some(token),
        }
    }

    /// Drains pending acks into ack packets, at most `max_packets` of them. Counters that do not
    ///  fit remain pending for the next tick.
    async fn ack_packets(&self, max_packets: usize) -> Vec<Packet> {
        let mut result = Vec::new();

        let mut acks = self.acks.lock().await;
        for (&msg_type, ack) in acks.iter_mut() {
            if !ack.has_pending() {
                continue;
            }
            let remaining = max_packets.saturating_sub(result.len());
            if remaining == 0 {
                break;
            }
            for (base, bitfield) in ack.get_acks(remaining) {
                result.push(Packet::new(Message::ack(msg_type, base, self.token, bitfield)));
            }
        }
        result
    }

    /// Selects the packets for a single send tick and packs them into datagrams of at most
    ///  `byte_limit` bytes each.
    ///
    /// Pending acks go first, followed by buffered packets by descending priority. At most
    ///  `max_packets_per_tick` packets (acks included) are selected. Selected packets are dropped
    ///  from the buffer unless they wait for an ack, and all buffered packets that are not
    ///  selected gain priority.
    pub async fn packets_to_send(&self, byte_limit: usize) -> Vec<Bytes> {
        let mut builder = DatagramBuilder::new(byte_limit);
        let mut num_selected = 0;

        for ack in self.ack_packets(self.max_packets_per_tick).await {
            if builder.try_add(&ack) {
                num_selected += 1;
            }
            else {
                warn!("byte limit {} is too small for an ack - dropping ack for {:?}", byte_limit, self.peer_addr);
            }
        }

        let mut send_buffer = self.send_buffer.lock().await;

        // highest priority first, oldest first within a priority
        send_buffer.sort_by(|a, b| b.priority().cmp(&a.priority())
            .then_with(|| a.message().counter().cmp(&b.message().counter())));

        if send_buffer.len() + num_selected > self.max_packets_per_tick {
            let with_resend = send_buffer.iter().filter(|p| p.resend()).count();
            info!("send buffer for {:?} exceeds the per-tick limit of {} packets: {} buffered ({} with resend, {} without)",
                self.peer_addr, self.max_packets_per_tick, send_buffer.len(), with_resend, send_buffer.len() - with_resend);
        }

        let mut retained = Vec::with_capacity(send_buffer.len());
        for mut packet in send_buffer.drain(..) {
            if num_selected < self.max_packets_per_tick && builder.try_add(&packet) {
                num_selected += 1;
                if packet.resend() {
                    retained.push(packet);
                }
            }
            else {
                if !builder.fits(&packet) {
                    debug!("message {} of type {} exceeds the byte limit {} - skipping", packet.message().counter(), packet.message().msg_type(), byte_limit);
                }
                packet.age();
                retained.push(packet);
            }
        }
        *send_buffer = retained;
        drop(send_buffer);

        let datagrams = builder.finish();
        trace!("selected {} packets in {} datagrams for {:?}", num_selected, datagrams.len(), self.peer_addr);
        datagrams
    }

    pub async fn buffer_statistics(&self) -> BufferStatistics {
        let send_buffer = self.send_buffer.lock().await;
        let with_resend = send_buffer.iter().filter(|p| p.resend()).count();
        BufferStatistics {
            total: send_buffer.len(),
            with_resend,
            without_resend: send_buffer.len() - with_resend,
        }
    }

    /// Classifies a received message, returning the messages that are due for delivery as a
    ///  consequence, in delivery order. Acks are consumed, duplicates and outdated messages are
    ///  dropped, and ordered messages may release previously buffered successors.
    pub async fn on_message(&self, msg: Message) -> anyhow::Result<Vec<Message>> {
        if msg.is_ack() {
            self.process_ack(&msg).await?;
            return Ok(Vec::new());
        }

        // a duplicate is acked again: the peer resends because it did not get our ack.
        // Sequenced messages are never resent, so they are not acked.
        if msg.is_reliable() && !msg.is_sequenced() {
            self.receive_reliable(&msg).await;
        }

        let result = match msg.delivery_class() {
            DeliveryClass::Unordered => vec![msg],
            DeliveryClass::Reliable => {
                if self.has_already_arrived(&msg).await {
                    trace!("dropping duplicate message {} of type {} from {:?}", msg.counter(), msg.msg_type(), self.peer_addr);
                    Vec::new()
                }
                else {
                    vec![msg]
                }
            }
            DeliveryClass::Sequenced => {
                if self.is_message_in_its_order(msg.msg_type(), msg.counter()).await {
                    vec![msg]
                }
                else {
                    trace!("dropping outdated sequenced message {} of type {} from {:?}", msg.counter(), msg.msg_type(), self.peer_addr);
                    Vec::new()
                }
            }
            DeliveryClass::Ordered => self.messages_to_invoke(msg).await,
        };
        Ok(result)
    }

    /// Classifies a received message and invokes the bound handler for every message that is due
    pub async fn handle_message(&self, msg: Message) -> anyhow::Result<()> {
        for deliverable in self.on_message(msg).await? {
            self.invoke_if_bound(&deliverable).await;
        }
        Ok(())
    }

    pub async fn invoke_if_bound(&self, msg: &Message) {
        let handler = self.handlers.read().await
            .get(&msg.msg_type())
            .cloned();

        match handler {
            Some(handler) => handler.on_message(self.peer_addr, msg).await,
            None => trace!("no handler for message type {} - ignoring message from {:?}", msg.msg_type(), self.peer_addr),
        }
    }

    /// Registers a handler for a message type, returning `false` if there is a handler for the
    ///  type already. The first registration wins.
    pub async fn add_handler(&self, msg_type: MessageType, handler: Arc<dyn MessageHandler>) -> bool {
        match self.handlers.write().await.entry(msg_type) {
            Entry::Occupied(_) => false,
            Entry::Vacant(e) => {
                e.insert(handler);
                true
            }
        }
    }

    pub async fn remove_handler(&self, msg_type: MessageType) -> bool {
        self.handlers.write().await
            .remove(&msg_type)
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Mode;
    use crate::message_handler::MockMessageHandler;
    use crate::packet::parse_datagram;
    use rstest::rstest;
    use tokio::runtime::Builder;

    const TYPE: MessageType = MessageType(50);

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9000))
    }

    fn config(max_datagram_size: usize, max_packets_per_tick: usize) -> TransportConfig {
        let mut config = TransportConfig::default_ipv4(SocketAddr::from(([127, 0, 0, 1], 0)));
        config.max_datagram_size = max_datagram_size;
        config.max_packets_per_tick = max_packets_per_tick;
        config
    }

    fn connection() -> Connection {
        Connection::with_token(peer(), Token(0xabcd), &config(4096, 512))
    }

    fn msg(msg_type: MessageType, mode: Mode, counter: u64) -> Message {
        Message::new(msg_type, mode, vec![counter as u8])
            .with_counter(MessageCounter::from_raw(counter))
    }

    fn ack(acked_type: MessageType, base: u64, bitfield: u32) -> Message {
        Message::ack(acked_type, MessageCounter::from_raw(base), Token(0x1234), bitfield)
    }

    async fn sent_messages(conn: &Connection, byte_limit: usize) -> Vec<Message> {
        conn.packets_to_send(byte_limit).await
            .into_iter()
            .flat_map(|d| parse_datagram(d).unwrap())
            .collect()
    }

    fn raw_counters(messages: &[Message]) -> Vec<u64> {
        messages.iter().map(|m| m.counter().to_raw()).collect()
    }

    async fn next(conn: &Connection, msg_type: i16, mode: Mode) -> u64 {
        conn.next_counter(&Message::new(MessageType(msg_type), mode, Vec::<u8>::new())).await.to_raw()
    }

    #[test]
    fn test_next_counter_per_type_and_class() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let conn = connection();

            assert_eq!(next(&conn, 50, Mode::Reliable).await, 0);
            assert_eq!(next(&conn, 50, Mode::Reliable).await, 1);
            assert_eq!(next(&conn, 50, Mode::Unreliable).await, 0);
            assert_eq!(next(&conn, 51, Mode::Reliable).await, 0);
            assert_eq!(next(&conn, 50, Mode::Sequenced).await, 0);
            assert_eq!(next(&conn, 50, Mode::ReliableSequenced).await, 1);
            assert_eq!(next(&conn, 50, Mode::ReliableOrdered).await, 0);
            assert_eq!(next(&conn, 50, Mode::Reliable).await, 2);
        });
    }

    #[test]
    fn test_mark_to_send_rejects_oversized() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let conn = Connection::with_token(peer(), Token(1), &config(100, 512));

            // 4 bytes frame header + 11 bytes message header
            assert!(conn.mark_to_send(Message::new(TYPE, Mode::Reliable, vec![0u8; 86])).await.is_err());
            assert_eq!(conn.mark_to_send(Message::new(TYPE, Mode::Reliable, vec![0u8; 85])).await.unwrap(), MessageCounter::ZERO);
            assert_eq!(conn.buffer_statistics().await.total, 1);
        });
    }

    #[test]
    fn test_mark_to_send_rejects_ack() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let conn = connection();
            assert!(conn.mark_to_send(ack(TYPE, 0, 1)).await.is_err());
        });
    }

    #[test]
    fn test_reliable_until_acked() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let conn = connection();
            let msg_type = MessageType(5);
            for _ in 0..3 {
                conn.mark_to_send(Message::new(msg_type, Mode::Reliable, vec![1u8, 2, 3])).await.unwrap();
            }

            assert_eq!(raw_counters(&sent_messages(&conn, 4096).await), vec![0, 1, 2]);
            assert_eq!(raw_counters(&sent_messages(&conn, 4096).await), vec![0, 1, 2]);

            conn.on_message(ack(msg_type, 0, 0b11)).await.unwrap();
            assert_eq!(conn.buffer_statistics().await, BufferStatistics { total: 1, with_resend: 1, without_resend: 0 });
            assert_eq!(raw_counters(&sent_messages(&conn, 4096).await), vec![2]);

            // duplicate ack
            conn.on_message(ack(msg_type, 0, 0b11)).await.unwrap();
            assert_eq!(conn.buffer_statistics().await.total, 1);

            conn.on_message(ack(msg_type, 2, 0b1)).await.unwrap();
            assert_eq!(conn.buffer_statistics().await.total, 0);
            assert!(conn.packets_to_send(4096).await.is_empty());

            assert_eq!(conn.peer_token().await, Some(Token(0x1234)));
        });
    }

    #[test]
    fn test_ack_for_other_type_or_unknown_counter() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let conn = connection();
            conn.mark_to_send(Message::new(TYPE, Mode::Reliable, vec![1u8])).await.unwrap();

            conn.on_message(ack(MessageType(51), 0, 0b1)).await.unwrap();
            conn.on_message(ack(TYPE, 10, 0b1)).await.unwrap();
            assert_eq!(conn.buffer_statistics().await.total, 1);
        });
    }

    #[test]
    fn test_ack_prunes_across_delivery_classes() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let conn = connection();

            assert_eq!(conn.mark_to_send(Message::new(TYPE, Mode::Reliable, vec![1u8])).await.unwrap(), MessageCounter::ZERO);
            conn.on_message(ack(TYPE, 0, 0b1)).await.unwrap();
            assert_eq!(conn.buffer_statistics().await.total, 0);

            // counter 0 again, in the ordered namespace
            assert_eq!(conn.mark_to_send(Message::new(TYPE, Mode::ReliableOrdered, vec![2u8])).await.unwrap(), MessageCounter::ZERO);
            assert_eq!(raw_counters(&sent_messages(&conn, 4096).await), vec![0]);

            conn.on_message(ack(TYPE, 0, 0b1)).await.unwrap();
            assert_eq!(conn.buffer_statistics().await.total, 0);
            assert!(conn.packets_to_send(4096).await.is_empty());

            conn.on_message(ack(TYPE, 0, 0b1)).await.unwrap();
            assert_eq!(conn.buffer_statistics().await.total, 0);
        });
    }

    #[rstest]
    #[case::sequenced(Mode::Sequenced)]
    #[case::reliable_sequenced(Mode::ReliableSequenced)]
    fn test_sequenced_is_not_acked(#[case] mode: Mode) {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let conn = connection();
            assert_eq!(conn.on_message(msg(TYPE, mode, 0)).await.unwrap().len(), 1);
            assert!(conn.packets_to_send(4096).await.is_empty());
        });
    }

    #[test]
    fn test_malformed_ack() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let conn = connection();
            let truncated = Message::new(MessageType::ACK, Mode::Unreliable, vec![0u8, 0, 1]);
            assert!(conn.on_message(truncated).await.is_err());
        });
    }

    #[rstest]
    #[case::unreliable(Mode::Unreliable, 0)]
    #[case::reliable(Mode::Reliable, 3)]
    #[case::sequenced(Mode::Sequenced, 0)]
    #[case::reliable_sequenced(Mode::ReliableSequenced, 0)]
    #[case::ordered(Mode::Ordered, 0)]
    #[case::reliable_ordered(Mode::ReliableOrdered, 3)]
    fn test_buffer_after_tick(#[case] mode: Mode, #[case] expected_retained: usize) {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let conn = connection();
            for _ in 0..3 {
                conn.mark_to_send(Message::new(TYPE, mode, vec![1u8])).await.unwrap();
            }
            assert_eq!(sent_messages(&conn, 4096).await.len(), 3);
            assert_eq!(conn.buffer_statistics().await.total, expected_retained);
        });
    }

    #[rstest]
    #[case::single_datagram(1000, 512, 10, 10, 1)]
    #[case::byte_limit(100, 512, 10, 10, 3)]
    #[case::count_limit(4096, 4, 10, 4, 1)]
    #[case::both(100, 7, 10, 7, 2)]
    fn test_batching_bounds(
        #[case] byte_limit: usize,
        #[case] max_packets_per_tick: usize,
        #[case] num_messages: usize,
        #[case] expected_num_sent: usize,
        #[case] expected_num_datagrams: usize,
    ) {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let conn = Connection::with_token(peer(), Token(1), &config(4096, max_packets_per_tick));
            for _ in 0..num_messages {
                // 25 bytes per frame
                conn.mark_to_send(Message::new(TYPE, Mode::Unreliable, vec![0u8; 10])).await.unwrap();
            }

            let datagrams = conn.packets_to_send(byte_limit).await;
            assert_eq!(datagrams.len(), expected_num_datagrams);
            assert!(datagrams.iter().all(|d| d.len() <= byte_limit));

            let num_sent = datagrams.into_iter()
                .map(|d| parse_datagram(d).unwrap().len())
                .sum::<usize>();
            assert_eq!(num_sent, expected_num_sent);
            assert_eq!(conn.buffer_statistics().await.total, num_messages - expected_num_sent);
        });
    }

    #[test]
    fn test_unselected_packets_gain_priority() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let conn = Connection::with_token(peer(), Token(1), &config(4096, 2));
            for _ in 0..3 {
                conn.mark_to_send(Message::new(TYPE, Mode::Unreliable, vec![1u8])).await.unwrap();
            }
            assert_eq!(raw_counters(&sent_messages(&conn, 4096).await), vec![0, 1]);

            conn.mark_to_send(Message::new(TYPE, Mode::Unreliable, vec![1u8])).await.unwrap();
            conn.mark_to_send(Message::new(TYPE, Mode::Unreliable, vec![1u8])).await.unwrap();
            // counter 2 was skipped once, so it overtakes the newer messages
            assert_eq!(raw_counters(&sent_messages(&conn, 4096).await), vec![2, 3]);
            assert_eq!(raw_counters(&sent_messages(&conn, 4096).await), vec![4]);
        });
    }

    #[test]
    fn test_oversized_for_ad_hoc_limit_is_skipped() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let conn = connection();
            conn.mark_to_send(Message::new(TYPE, Mode::Unreliable, vec![0u8; 100])).await.unwrap();
            conn.mark_to_send(Message::new(TYPE, Mode::Unreliable, vec![0u8; 10])).await.unwrap();

            assert_eq!(raw_counters(&sent_messages(&conn, 50).await), vec![1]);
            assert_eq!(conn.buffer_statistics().await.total, 1);
            assert_eq!(raw_counters(&sent_messages(&conn, 4096).await), vec![0]);
        });
    }

    #[test]
    fn test_acks_count_toward_tick_limit() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let conn = Connection::with_token(peer(), Token(7), &config(4096, 2));
            // three separate ack windows
            for counter in [0, 100, 200] {
                conn.on_message(msg(TYPE, Mode::Reliable, counter)).await.unwrap();
            }
            conn.mark_to_send(Message::new(MessageType(51), Mode::Unreliable, vec![1u8])).await.unwrap();

            let first = sent_messages(&conn, 4096).await;
            assert_eq!(first.len(), 2);
            assert!(first.iter().all(|m| m.is_ack() && m.token() == Some(Token(7))));
            assert_eq!(raw_counters(&first), vec![0, 100]);

            let second = sent_messages(&conn, 4096).await;
            assert_eq!(second.len(), 2);
            assert!(second[0].is_ack());
            assert_eq!(second[0].counter().to_raw(), 200);
            assert_eq!(second[1].msg_type(), MessageType(51));
        });
    }

    #[test]
    fn test_ack_is_generated_for_received_reliable() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let conn = connection();
            for counter in [0, 1, 3] {
                assert_eq!(conn.on_message(msg(TYPE, Mode::Reliable, counter)).await.unwrap().len(), 1);
            }
            // duplicate: dropped, but acked again
            assert!(conn.on_message(msg(TYPE, Mode::Reliable, 1)).await.unwrap().is_empty());

            let sent = sent_messages(&conn, 4096).await;
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].counter(), MessageCounter::ZERO);
            assert_eq!(sent[0].token(), Some(Token(0xabcd)));
            assert_eq!(sent[0].parse_ack_body().unwrap(), (0b1011, TYPE));

            assert!(conn.packets_to_send(4096).await.is_empty());
        });
    }

    #[rstest]
    #[case::unreliable(Mode::Unreliable, vec![0,1,1,0], vec![0,1,1,0])]
    #[case::reliable(Mode::Reliable, vec![0,2,1,2,0], vec![0,2,1])]
    #[case::sequenced(Mode::Sequenced, vec![0,2,1,3], vec![0,2,3])]
    #[case::reliable_sequenced(Mode::ReliableSequenced, vec![3,3,5,4], vec![3,5])]
    #[case::ordered(Mode::Ordered, vec![2,0,1], vec![0,1,2])]
    #[case::reliable_ordered(Mode::ReliableOrdered, vec![1,0,0,3,2], vec![0,1,2,3])]
    fn test_on_message_delivery(#[case] mode: Mode, #[case] arrivals: Vec<u64>, #[case] expected: Vec<u64>) {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let conn = connection();
            let mut delivered = Vec::new();
            for counter in arrivals {
                delivered.extend(conn.on_message(msg(TYPE, mode, counter)).await.unwrap());
            }
            assert_eq!(raw_counters(&delivered), expected);
        });
    }

    #[test]
    fn test_ordered_scenario() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let conn = connection();
            let msg_type = MessageType(7);

            let mut released = Vec::new();
            for counter in [2, 0, 1] {
                released.push(raw_counters(&conn.on_message(msg(msg_type, Mode::ReliableOrdered, counter)).await.unwrap()));
            }
            assert_eq!(released, vec![vec![], vec![0], vec![1, 2]]);
        });
    }

    #[test]
    fn test_types_are_independent() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let conn = connection();
            assert_eq!(conn.on_message(msg(MessageType(50), Mode::Sequenced, 5)).await.unwrap().len(), 1);
            assert_eq!(conn.on_message(msg(MessageType(51), Mode::Sequenced, 1)).await.unwrap().len(), 1);
            assert_eq!(conn.on_message(msg(MessageType(50), Mode::Sequenced, 4)).await.unwrap().len(), 0);
        });
    }

    #[test]
    fn test_handle_message_invokes_handler() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let conn = connection();

            let mut handler = MockMessageHandler::new();
            handler.expect_on_message()
                .withf(|addr, msg| *addr == peer() && msg.counter().to_raw() < 3)
                .times(3)
                .returning(|_, _| ());
            assert!(conn.add_handler(TYPE, Arc::new(handler)).await);

            for counter in [1, 0, 2, 2] {
                conn.handle_message(msg(TYPE, Mode::ReliableOrdered, counter)).await.unwrap();
            }
            // no handler: ignored
            conn.handle_message(msg(MessageType(51), Mode::Unreliable, 0)).await.unwrap();
        });
    }

    #[test]
    fn test_first_handler_wins() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let conn = connection();

            let mut first = MockMessageHandler::new();
            first.expect_on_message()
                .times(1)
                .returning(|_, _| ());
            let mut second = MockMessageHandler::new();
            second.expect_on_message()
                .never();

            assert!(conn.add_handler(TYPE, Arc::new(first)).await);
            assert!(!conn.add_handler(TYPE, Arc::new(second)).await);
            conn.handle_message(msg(TYPE, Mode::Unreliable, 0)).await.unwrap();

            assert!(conn.remove_handler(TYPE).await);
            assert!(!conn.remove_handler(TYPE).await);
            conn.handle_message(msg(TYPE, Mode::Unreliable, 1)).await.unwrap();
        });
    }

    #[test]
    fn test_round_trip_between_connections() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let a = Connection::with_token(SocketAddr::from(([127, 0, 0, 1], 1)), Token(1), &config(4096, 512));
            let b = Connection::with_token(SocketAddr::from(([127, 0, 0, 1], 2)), Token(2), &config(4096, 512));

            for i in 0..5u8 {
                a.mark_to_send(Message::new(TYPE, Mode::ReliableOrdered, vec![i])).await.unwrap();
            }

            // first transmission is lost
            assert_eq!(a.packets_to_send(4096).await.len(), 1);

            let mut delivered = Vec::new();
            for datagram in a.packets_to_send(4096).await {
                for m in parse_datagram(datagram).unwrap() {
                    delivered.extend(b.on_message(m).await.unwrap());
                }
            }
            assert_eq!(delivered.iter().map(|m| m.body()[0]).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);

            for datagram in b.packets_to_send(4096).await {
                for m in parse_datagram(datagram).unwrap() {
                    assert!(a.on_message(m).await.unwrap().is_empty());
                }
            }
            assert_eq!(a.buffer_statistics().await.total, 0);
            assert_eq!(a.peer_token().await, Some(Token(2)));
        });
    }

    fn acked_counters(messages: &[Message]) -> Vec<u64> {
        let mut result = Vec::new();
        for m in messages.iter().filter(|m| m.is_ack()) {
            let (bitfield, _) = m.parse_ack_body().unwrap();
            for offset in 0..32u64 {
                if bitfield & (1u32 << offset) != 0 {
                    result.push(m.counter().to_raw() + offset);
                }
            }
        }
        result
    }

    #[test]
    fn test_concurrent_receive_and_send() {
        let rt = Builder::new_multi_thread().worker_threads(4).enable_all().build().unwrap();
        rt.block_on(async {
            let conn = Arc::new(connection());

            let mut tasks = Vec::new();
            for task_no in 0..4u64 {
                let conn = conn.clone();
                tasks.push(tokio::spawn(async move {
                    let mut delivered = Vec::new();
                    for i in 0..50u64 {
                        let counter = i * 4 + task_no;
                        delivered.extend(conn.on_message(msg(TYPE, Mode::Reliable, counter)).await.unwrap());
                        conn.mark_to_send(Message::new(MessageType(51), Mode::Reliable, vec![1u8])).await.unwrap();
                    }
                    delivered.len()
                }));
            }

            let mut acked = Vec::new();
            for _ in 0..20 {
                acked.extend(acked_counters(&sent_messages(&conn, 4096).await));
                tokio::task::yield_now().await;
            }

            let mut num_delivered = 0;
            for task in tasks {
                num_delivered += task.await.unwrap();
            }
            assert_eq!(num_delivered, 200);

            acked.extend(acked_counters(&sent_messages(&conn, 4096).await));
            acked.sort();
            assert_eq!(acked, (0..200).collect::<Vec<_>>());
            assert_eq!(conn.buffer_statistics().await.with_resend, 200);
        });
    }

    #[test]
    fn test_idle_tracking() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let conn = connection();
            tokio::time::sleep(Duration::from_secs(5)).await;
            assert!(conn.idle_for().await >= Duration::from_secs(5));

            conn.update_activity().await;
            assert!(conn.idle_for().await < Duration::from_secs(1));
        });
    }
}
