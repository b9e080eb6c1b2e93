use tracing::trace;

use crate::message_counter::MessageCounter;

/// Detects duplicates among reliably delivered messages of a single type, tolerating arbitrary
///  reordering.
///
/// Rather than storing every counter it has seen, the tracker keeps the highest counter seen so
///  far plus a sorted list of 'gaps', i.e. ranges of lower counters that were skipped and have not
///  arrived yet. Memory usage is proportional to the number of holes in the received sequence,
///  not to the number of messages.
#[derive(Debug, Default)]
pub struct ArrivalTracker {
    /// highest counter that arrived so far, `None` before the first message
    watermark: Option<MessageCounter>,
    /// inclusive ranges `(first, last)` of missing counters, sorted and non-overlapping, all below
    ///  the watermark
    gaps: Vec<(MessageCounter, MessageCounter)>,
}

impl ArrivalTracker {
    pub fn new() -> ArrivalTracker {
        Default::default()
    }

    /// Registers `counter` as arrived, returning `true` if it had arrived before
    pub fn has_already_arrived(&mut self, counter: MessageCounter) -> bool {
        let expected_next = match self.watermark {
            None => MessageCounter::ZERO,
            Some(watermark) if counter == watermark => return true,
            Some(watermark) if counter < watermark => return !self.fill_gap(counter),
            Some(watermark) => watermark.next(),
        };

        if counter > expected_next {
            // counter > expected_next >= 0, so there is a predecessor
            if let Some(last_missing) = counter.prev() {
                trace!("counter {} skips ahead, recording gap {}..={}", counter, expected_next, last_missing);
                self.gaps.push((expected_next, last_missing));
            }
        }
        self.watermark = Some(counter);
        false
    }

    /// removes `counter` from the gap that contains it, returning `false` if there is no such gap
    fn fill_gap(&mut self, counter: MessageCounter) -> bool {
        let idx = self.gaps.partition_point(|&(_, last)| last < counter);
        let Some(&(first, last)) = self.gaps.get(idx) else {
            return false;
        };
        if counter < first {
            return false;
        }

        match (counter == first, counter == last) {
            (true, true) => {
                self.gaps.remove(idx);
            }
            (true, false) => self.gaps[idx].0 = counter.next(),
            (false, true) => {
                if let Some(new_last) = counter.prev() {
                    self.gaps[idx].1 = new_last;
                }
            }
            (false, false) => {
                // counter is strictly inside the gap, which has a lower bound, so it has a predecessor
                if let Some(new_last) = counter.prev() {
                    self.gaps[idx].1 = new_last;
                    self.gaps.insert(idx + 1, (counter.next(), last));
                }
            }
        }
        true
    }

    #[cfg(test)]
    fn num_gaps(&self) -> usize {
        self.gaps.len()
    }
}
