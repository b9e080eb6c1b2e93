use std::fmt::{Display, Formatter};

/// Counter of a message, scoped per (connection, message type, delivery class). Counters are
///  assigned by the sending [crate::connection::Connection] without gaps, starting at 0.
///
/// NB: Counters are 64 bits wide, so there is no wrap-around handling - a connection would have
///      to send a message per nanosecond for several centuries to exhaust a single type's range
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct MessageCounter(u64);

impl Display for MessageCounter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl MessageCounter {
    pub const ZERO: MessageCounter = MessageCounter(0);

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> MessageCounter {
        MessageCounter(self.0.saturating_add(1))
    }

    pub fn prev(&self) -> Option<MessageCounter> {
        self.0.checked_sub(1).map(MessageCounter)
    }

    pub fn checked_plus(&self, offset: u64) -> Option<MessageCounter> {
        self.0.checked_add(offset).map(MessageCounter)
    }

    /// distance from `base` to `self`, or `None` if `self` is before `base`
    pub fn offset_from(&self, base: MessageCounter) -> Option<u64> {
        self.0.checked_sub(base.0)
    }
}
