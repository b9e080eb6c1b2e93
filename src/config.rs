use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;

use crate::message::Message;
use crate::packet::Packet;

pub struct TransportConfig {
    pub self_addr: SocketAddr,

    /// This is the maximum number of bytes of framed messages in a single datagram. A message
    ///  whose frame does not fit into a datagram on its own is rejected when it is sent.
    ///
    /// NB: The default of 4096 exceeds a typical Ethernet MTU, relying on IP fragmentation for
    ///      bigger datagrams. Choosing a value below the path MTU (e.g. 1472 for IPV4 without
    ///      optional headers) avoids that at the price of a smaller maximum message size.
    pub max_datagram_size: usize,

    /// This is the maximum number of packets (including acks) that a connection selects for
    ///  sending in a single send tick, regardless of how many datagrams they fill. Packets that
    ///  are not selected wait for the next tick with increased priority.
    pub max_packets_per_tick: usize,

    /// interval between send ticks - this is the latency for batching outgoing messages, and
    ///  it is also the retransmission interval for unacknowledged reliable messages
    pub send_interval: Duration,

    /// connections without any received traffic for this duration are dropped, `None` keeps
    ///  connections until they are disconnected explicitly
    pub idle_timeout: Option<Duration>,

    pub receive_buffer_size: usize,
}

impl TransportConfig {
    pub fn default_ipv4(self_addr: SocketAddr) -> TransportConfig {
        TransportConfig {
            self_addr,
            max_datagram_size: 4096,
            max_packets_per_tick: 512,
            send_interval: Duration::from_millis(100),
            idle_timeout: Some(Duration::from_secs(30)),
            receive_buffer_size: 65536,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let min_datagram_size = Packet::FRAME_HEADER_LEN + Message::HEADER_LEN + Message::TOKEN_LEN + Message::ACK_BODY_LEN;
        if self.max_datagram_size < min_datagram_size {
            bail!("max datagram size {} does not fit an ack message ({} bytes)", self.max_datagram_size, min_datagram_size);
        }
        if self.max_datagram_size > i32::MAX as usize {
            bail!("max datagram size {} exceeds the frame length range", self.max_datagram_size);
        }
        if self.max_packets_per_tick == 0 {
            bail!("max packets per tick must be positive");
        }
        if self.send_interval.is_zero() {
            bail!("send interval must be positive");
        }
        if self.receive_buffer_size < self.max_datagram_size {
            bail!("receive buffer size {} is smaller than the max datagram size {}", self.receive_buffer_size, self.max_datagram_size);
        }
        Ok(())
    }
}
