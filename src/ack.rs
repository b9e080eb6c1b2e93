use std::collections::BTreeSet;

use crate::message_counter::MessageCounter;

/// Acknowledgement state for a single message type on a single connection. It plays two roles:
///
/// * receiver side: it collects counters of reliable messages that arrived, to be acknowledged to
///    the peer in compact bitfields on the next send tick
/// * sender side: it decodes the peer's ack bitfields into the counters they confirm, so the
///    corresponding packets can be removed from the send buffer. Confirming a counter again is
///    harmless, so there is no record of previous confirmations: a packet's absence from the
///    send buffer is that record.
///
/// An ack covers a window of [Ack::BITFIELD_WIDTH] counters starting at a base counter, with bit
///  `i` set if counter `base + i` arrived.
#[derive(Debug, Default)]
pub struct Ack {
    pending: BTreeSet<MessageCounter>,
}

impl Ack {
    pub const BITFIELD_WIDTH: u64 = u32::BITS as u64;

    pub fn new() -> Ack {
        Default::default()
    }

    pub fn receive_reliable(&mut self, counter: MessageCounter) {
        self.pending.insert(counter);
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Drains pending counters into at most `max_windows` `(base, bitfield)` pairs, each base
    ///  being the lowest counter not covered by a previous bitfield. Counters beyond the last
    ///  window remain pending.
    pub fn get_acks(&mut self, max_windows: usize) -> Vec<(MessageCounter, u32)> {
        let mut result: Vec<(MessageCounter, u32)> = Vec::new();
        let mut first_uncovered = None;

        for &counter in &self.pending {
            if let Some((base, bitfield)) = result.last_mut() {
                if let Some(offset) = counter.offset_from(*base).filter(|&o| o < Self::BITFIELD_WIDTH) {
                    *bitfield |= 1u32 << offset;
                    continue;
                }
            }
            if result.len() == max_windows {
                first_uncovered = Some(counter);
                break;
            }
            result.push((counter, 1));
        }

        self.pending = match first_uncovered {
            Some(counter) => self.pending.split_off(&counter),
            None => BTreeSet::new(),
        };
        result
    }

    /// Returns the counters that this bitfield confirms, in ascending order
    pub fn process_received_ack_bitfield(bitfield: u32, base: MessageCounter) -> Vec<MessageCounter> {
        let mut confirmed = Vec::new();
        for offset in 0..Self::BITFIELD_WIDTH {
            if bitfield & (1u32 << offset) == 0 {
                continue;
            }
            let Some(counter) = base.checked_plus(offset) else {
                break;
            };
            confirmed.push(counter);
        }
        confirmed
    }
}
