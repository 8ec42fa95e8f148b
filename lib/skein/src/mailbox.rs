use crate::message::Message;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Default queue length at which overload reporting starts. Doubles after
/// every report so a flooded service does not spam the monitor.
pub const DEFAULT_OVERLOAD_THRESHOLD: usize = 1024;

/// Outcome of a push, telling the sender whether it must place the owning
/// service on the global run queue.
#[derive(Debug, Eq, PartialEq)]
pub enum Push {
    /// Mailbox was idle; the caller must enqueue the service.
    Wake,
    /// Service is already queued or being drained.
    Queued,
}

struct Inner {
    queue: VecDeque<Message>,
    /// True whenever the service is on the global run queue *or* a worker
    /// is draining it. Together with the queue lock this enforces the
    /// exactly-once enqueue contract.
    in_global: bool,
    closed: bool,
    overload: usize,
    overload_threshold: usize,
}

/// Per-service FIFO of pending messages. Push is many-producer; pop is only
/// ever called by the worker holding the service's dispatch token.
pub struct Mailbox {
    inner: Mutex<Inner>,
}

impl Mailbox {
    /// A new mailbox starts blocked (`in_global` held high) so that nothing
    /// is scheduled before the owning service finishes init. `unblock`
    /// releases it.
    pub fn new() -> Mailbox {
        Mailbox {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                in_global: true,
                closed: false,
                overload: 0,
                overload_threshold: DEFAULT_OVERLOAD_THRESHOLD,
            }),
        }
    }

    /// Append a message. Returns `Err` with the message when the mailbox has
    /// been closed by service destruction, so the sender can run its
    /// addressing-error path.
    pub fn push(&self, message: Message) -> Result<Push, Message> {
        let mut inner = self.inner.lock();

        if inner.closed {
            return Err(message);
        }

        inner.queue.push_back(message);

        let length = inner.queue.len();
        if length > inner.overload_threshold {
            inner.overload = length;
            inner.overload_threshold = inner.overload_threshold.saturating_mul(2);
        }

        if inner.in_global {
            Ok(Push::Queued)
        } else {
            inner.in_global = true;
            Ok(Push::Wake)
        }
    }

    /// Take the next message. Caller must hold the service dispatch token.
    #[inline]
    pub fn pop(&self) -> Option<Message> {
        self.inner.lock().queue.pop_front()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Consume a pending overload report, if one crossed since last asked.
    pub fn take_overload(&self) -> Option<usize> {
        let mut inner = self.inner.lock();
        match inner.overload {
            0 => None,
            n => {
                inner.overload = 0;
                Some(n)
            }
        }
    }

    /// Reset the overload threshold to the configured base once the flood
    /// has drained.
    pub fn set_overload_threshold(&self, threshold: usize) {
        self.inner.lock().overload_threshold = threshold.max(1);
    }

    /// Called by a worker after its drain turn, and by launch after init.
    /// Returns true when the caller must re-enqueue the service; otherwise
    /// the mailbox leaves the scheduled state.
    pub fn finish_drain(&self) -> bool {
        let mut inner = self.inner.lock();
        debug_assert!(inner.in_global, "finish_drain on unscheduled mailbox");
        if inner.queue.is_empty() {
            inner.in_global = false;
            false
        } else {
            true
        }
    }

    /// Close the mailbox and drain everything left in it. Subsequent pushes
    /// bounce back to the sender.
    pub fn close(&self) -> Vec<Message> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.queue.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::ServiceHandle;
    use crate::message::{Payload, ProtocolType};

    fn text(n: u32) -> Message {
        Message {
            source: ServiceHandle::from_raw(n),
            session: 0,
            protocol: ProtocolType::TEXT,
            payload: Payload::Empty,
        }
    }

    fn unblocked() -> Mailbox {
        let mailbox = Mailbox::new();
        assert!(!mailbox.finish_drain());
        mailbox
    }

    #[test]
    fn test_first_push_wakes() {
        let mailbox = unblocked();
        assert_eq!(mailbox.push(text(1)).unwrap(), Push::Wake);
        assert_eq!(mailbox.push(text(2)).unwrap(), Push::Queued);
        assert_eq!(mailbox.len(), 2);
    }

    #[test]
    fn test_fifo_order() {
        let mailbox = unblocked();
        mailbox.push(text(1)).unwrap();
        mailbox.push(text(2)).unwrap();
        assert_eq!(mailbox.pop().unwrap().source.raw(), 1);
        assert_eq!(mailbox.pop().unwrap().source.raw(), 2);
        assert!(mailbox.pop().is_none());
    }

    #[test]
    fn test_finish_drain_requeues_when_nonempty() {
        let mailbox = unblocked();
        mailbox.push(text(1)).unwrap();
        mailbox.pop().unwrap();
        // Drained dry: descheduled, next push wakes again.
        assert!(!mailbox.finish_drain());
        assert_eq!(mailbox.push(text(2)).unwrap(), Push::Wake);
        // Not drained dry: caller must requeue, flag stays up.
        assert!(mailbox.finish_drain());
        assert_eq!(mailbox.push(text(3)).unwrap(), Push::Queued);
    }

    #[test]
    fn test_new_mailbox_blocked_until_unblocked() {
        let mailbox = Mailbox::new();
        // Pre-init pushes never ask for scheduling.
        assert_eq!(mailbox.push(text(1)).unwrap(), Push::Queued);
        assert_eq!(mailbox.push(text(2)).unwrap(), Push::Queued);
        // Init done: pending backlog forces a requeue.
        assert!(mailbox.finish_drain());
    }

    #[test]
    fn test_overload_reported_once_and_doubles() {
        let mailbox = unblocked();
        mailbox.set_overload_threshold(4);
        for n in 0..5 {
            mailbox.push(text(n)).unwrap();
        }
        assert_eq!(mailbox.take_overload(), Some(5));
        assert_eq!(mailbox.take_overload(), None);
        // Threshold doubled to 8: crossing it reports again.
        for n in 0..4 {
            mailbox.push(text(n)).unwrap();
        }
        assert_eq!(mailbox.take_overload(), Some(9));
    }

    #[test]
    fn test_closed_mailbox_bounces() {
        let mailbox = unblocked();
        mailbox.push(text(1)).unwrap();
        let drained = mailbox.close();
        assert_eq!(drained.len(), 1);
        assert!(mailbox.push(text(2)).is_err());
    }
}
