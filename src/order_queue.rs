use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use tracing::trace;

use crate::message::Message;
use crate::message_counter::MessageCounter;

/// Reorder buffer for ordered messages of a single type: messages are released strictly in
///  counter order, and messages that arrive ahead of a predecessor are held back until the
///  predecessor arrives.
#[derive(Debug, Default)]
pub struct OrderQueue {
    next_expected: MessageCounter,
    pending: BTreeMap<MessageCounter, Message>,
}

impl OrderQueue {
    pub fn new() -> OrderQueue {
        Default::default()
    }

    /// Adds a received message, returning the (possibly empty) run of messages that can now be
    ///  delivered, in counter order
    pub fn messages_to_invoke(&mut self, msg: Message) -> Vec<Message> {
        if msg.counter() < self.next_expected {
            trace!("discarding ordered message {} of type {}: already delivered", msg.counter(), msg.msg_type());
            return Vec::new();
        }

        match self.pending.entry(msg.counter()) {
            Entry::Occupied(_) => {
                trace!("discarding ordered message {} of type {}: already buffered", msg.counter(), msg.msg_type());
                return Vec::new();
            }
            Entry::Vacant(e) => {
                e.insert(msg);
            }
        }

        let mut result = Vec::new();
        while let Some(next) = self.pending.remove(&self.next_expected) {
            result.push(next);
            self.next_expected = self.next_expected.next();
        }
        result
    }

    #[cfg(test)]
    fn next_expected(&self) -> MessageCounter {
        self.next_expected
    }

    #[cfg(test)]
    fn num_pending(&self) -> usize {
        self.pending.len()
    }
}
