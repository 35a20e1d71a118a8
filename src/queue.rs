//! One FIFO per priority level, drained by [`PrioritySendQueue::next`] from
//! highest priority (0) downward, with a cached cursor so repeated scans
//! across saturated low-priority traffic are amortized constant.

use crate::error::Error;
use crate::message::OutgoingMessage;
use std::collections::VecDeque;
use std::sync::Arc;

pub struct PrioritySendQueue {
    queues: Vec<VecDeque<Arc<OutgoingMessage>>>,
    cursor: usize,
}

impl PrioritySendQueue {
    pub fn new(priority_levels: u8) -> Self {
        let levels = priority_levels.max(1) as usize;
        PrioritySendQueue {
            queues: (0..levels).map(|_| VecDeque::new()).collect(),
            cursor: 0,
        }
    }

    pub fn enqueue(&mut self, message: Arc<OutgoingMessage>) {
        let priority = message.priority as usize;
        self.queues[priority].push_back(message);
        self.cursor = self.cursor.min(priority);
    }

    /// Scans from the cursor upward (toward lower priority numbers meaning
    /// higher precedence, so "upward" is increasing index) for the
    /// highest-priority message with payload ready to send, within
    /// `max_bytes`. Returns `(message, bytes_to_send)`, dequeuing the
    /// message only when this send finishes it.
    pub fn next(&mut self, max_bytes: usize) -> Option<(Arc<OutgoingMessage>, usize)> {
        let levels = self.queues.len();
        let mut p = self.cursor;
        while p < levels {
            if self.queues[p].is_empty() {
                if p == self.cursor {
                    self.cursor += 1;
                }
                p += 1;
                continue;
            }

            let head = self.queues[p].front().expect("checked non-empty above").clone();
            let bytes_ready = head.bytes_ready();
            if bytes_ready == 0 {
                p += 1;
                continue;
            }

            let to_send = bytes_ready.min(max_bytes);
            let is_final_send = to_send == head.bytes_remaining();
            if is_final_send {
                self.queues[p].pop_front();
                if p == self.cursor && self.queues[p].is_empty() {
                    self.cursor += 1;
                }
            }
            return Some((head, to_send));
        }
        None
    }

    /// Removes the message with `message_number` from priority level
    /// `priority`, preserving the order of the remaining elements. Fails
    /// if the message is not present there.
    pub fn cancel(&mut self, priority: u8, message_number: u8) -> Result<(), Error> {
        let level = self
            .queues
            .get_mut(priority as usize)
            .ok_or(Error::NotInQueue)?;
        let position = level
            .iter()
            .position(|m| m.message_number == message_number)
            .ok_or(Error::NotInQueue)?;
        level.remove(position);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn ready_message(priority: u8, number: u8, len: usize) -> Arc<OutgoingMessage> {
        let underlying = Message::new_outgoing(vec![0u8; len], None);
        Arc::new(OutgoingMessage::new(underlying, number, priority, None))
    }

    #[test]
    fn drains_in_priority_then_enqueue_order() {
        let mut queue = PrioritySendQueue::new(4);
        queue.enqueue(ready_message(2, 0, 10));
        queue.enqueue(ready_message(0, 1, 10));
        queue.enqueue(ready_message(0, 2, 10));
        queue.enqueue(ready_message(1, 3, 10));

        let mut order = Vec::new();
        while let Some((msg, n)) = queue.next(10) {
            order.push(msg.message_number);
            assert_eq!(n, 10);
        }
        assert_eq!(order, vec![1, 2, 3, 0]);
    }

    #[test]
    fn a_message_with_no_bytes_ready_is_skipped_not_dequeued() {
        let mut queue = PrioritySendQueue::new(2);
        let underlying = Message::new_incoming(10, None);
        let stalled = Arc::new(OutgoingMessage::new(underlying.clone(), 0, 0, None));
        queue.enqueue(stalled.clone());
        queue.enqueue(ready_message(1, 1, 5));

        let (msg, n) = queue.next(10).unwrap();
        assert_eq!(msg.message_number, 1);
        assert_eq!(n, 5);

        underlying.receive_at(0, &[1, 2, 3, 4, 5]);
        let (msg, n) = queue.next(10).unwrap();
        assert_eq!(msg.message_number, 0);
        assert_eq!(n, 5);
    }

    #[test]
    fn partial_send_keeps_the_message_at_the_head() {
        let mut queue = PrioritySendQueue::new(1);
        queue.enqueue(ready_message(0, 7, 100));

        let (msg, n) = queue.next(40).unwrap();
        assert_eq!(n, 40);
        msg.advance(40);

        let (msg2, n2) = queue.next(1000).unwrap();
        assert_eq!(msg2.message_number, 7);
        assert_eq!(n2, 60);
    }

    #[test]
    fn cancel_removes_without_disturbing_order() {
        let mut queue = PrioritySendQueue::new(1);
        queue.enqueue(ready_message(0, 1, 10));
        queue.enqueue(ready_message(0, 2, 10));
        queue.enqueue(ready_message(0, 3, 10));

        queue.cancel(0, 2).unwrap();

        let mut order = Vec::new();
        while let Some((msg, _)) = queue.next(10) {
            order.push(msg.message_number);
        }
        assert_eq!(order, vec![1, 3]);
    }

    #[test]
    fn cancel_of_absent_message_is_an_error() {
        let mut queue = PrioritySendQueue::new(1);
        queue.enqueue(ready_message(0, 1, 10));
        assert!(matches!(queue.cancel(0, 99), Err(Error::NotInQueue)));
    }
}
