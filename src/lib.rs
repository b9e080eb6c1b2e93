//! A peer-to-peer messaging transport on top of UDP with delivery guarantees that are selected
//!  per message rather than per connection.
//!
//! ## Design goals
//!
//! * The protocol is peer-to-peer without a dedicated server vs. client: each node has a single
//!    UDP socket that handles all 'connections'
//!   * there is no handshake, a connection is created on the first datagram to or from a peer
//!   * connections without traffic are dropped after a configurable timeout
//! * The abstraction is sending / receiving *messages* of a given *type*. Applications register a
//!    handler per message type.
//! * Each message is sent with one of the following modes:
//!   * unreliable: fire and forget, possibly duplicated or out of order
//!   * reliable: re-sent on every send tick until the peer acknowledges it, delivered exactly once
//!      but not necessarily in order
//!   * sequenced (optionally reliable): latest wins, i.e. messages older than the newest delivered
//!      message of the same type are dropped
//!   * ordered (optionally reliable): delivered exactly in the order they were sent, buffering
//!      messages that arrive ahead of a predecessor
//! * All guarantees are per (connection, message type). There are no guarantees across types.
//! * Messages are combined into datagrams on a periodic send tick. The number of packets per tick
//!    and the size of datagrams are bounded, and packets that miss a tick get priority on the
//!    next one.
//! * Remote procedure calls are built on top of the transport, using reserved message types
//!
//! There is no congestion control, encryption or NAT traversal.
//!
//! ## Datagram
//!
//! A datagram is a sequence of frames, each containing a single message. All numbers are in
//!  network byte order (BE):
//! ```ascii
//! 0: frame length (i32), *excluding* the length itself
//! 4: message
//! ```
//!
//! ## Message
//!
//! ```ascii
//!  0: message type (i16) - types 0 to 40 are reserved for the transport
//!  2: flags (u8):
//!     * bit 0: reliable
//!     * bit 1: sequenced
//!     * bit 2: ordered
//!     * bit 3: token present
//!     * other bits must be 0, and sequenced and ordered are mutually exclusive
//!  3: counter (u64) - strictly increasing per message type and delivery class
//! 11: connection token (u32) - only if the 'token present' flag is set
//!  *: body (to the end of the frame)
//! ```
//!
//! ## Ack
//!
//! Reliable messages are acknowledged with messages of type 0, sent unreliably with the sender's
//!  connection token. The ack's counter is the 'base' counter of the acknowledged window, and
//!  its body is:
//! ```ascii
//! 0: bitfield (u32) - bit i is set if message 'base + i' arrived
//! 4: acknowledged message type (i16)
//! ```
//!
//! Acks are not acknowledged themselves. If an ack is lost, the message is re-sent, and the
//!  receiver acknowledges the duplicate again.

pub mod ack;
pub mod arrival_tracker;
pub mod config;
pub mod connection;
pub mod end_point;
pub mod message;
pub mod message_counter;
pub mod message_handler;
pub mod order_queue;
pub mod packet;
pub mod rpc;
mod safe_converter;
