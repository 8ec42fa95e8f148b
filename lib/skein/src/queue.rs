use crate::handle::ServiceHandle;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// Global run queue: an MPMC queue of runnable service handles. Handles,
/// never records — the record may be destroyed between enqueue and dequeue
/// and workers re-resolve on the way out.
pub struct GlobalQueue {
    tx: Sender<ServiceHandle>,
    rx: Receiver<ServiceHandle>,
}

impl GlobalQueue {
    pub fn new() -> GlobalQueue {
        let (tx, rx) = unbounded();
        GlobalQueue { tx, rx }
    }

    #[inline]
    pub fn push(&self, handle: ServiceHandle) {
        // The receiver lives as long as the queue; send cannot fail.
        self.tx.send(handle).expect("global queue disconnected");
    }

    /// Blocking dequeue with a bounded wait so idle workers can observe
    /// shutdown.
    #[inline]
    pub fn pop(&self, timeout: Duration) -> Option<ServiceHandle> {
        match self.rx.recv_timeout(timeout) {
            Ok(handle) => Some(handle),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo() {
        let queue = GlobalQueue::new();
        queue.push(ServiceHandle::from_raw(1));
        queue.push(ServiceHandle::from_raw(2));
        assert_eq!(queue.pop(Duration::from_millis(10)).unwrap().raw(), 1);
        assert_eq!(queue.pop(Duration::from_millis(10)).unwrap().raw(), 2);
        assert!(queue.pop(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_cross_thread_handoff() {
        let queue = Arc::new(GlobalQueue::new());
        let producer = queue.clone();

        let handle = thread::spawn(move || {
            for n in 1..=100u32 {
                producer.push(ServiceHandle::from_raw(n));
            }
        });

        let mut seen = 0;
        while seen < 100 {
            if queue.pop(Duration::from_millis(100)).is_some() {
                seen += 1;
            }
        }
        handle.join().unwrap();
        assert_eq!(queue.len(), 0);
    }
}
