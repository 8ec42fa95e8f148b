use crate::handle::ServiceHandle;
use std::sync::atomic::{AtomicU32, Ordering};

/// Interval between stuck-service sweeps.
pub const CHECK_INTERVAL_SECS: u64 = 5;

/// Per-worker progress beacon. The worker publishes the message it is about
/// to deliver; the monitor thread compares versions across its sweep
/// interval. A version that has not moved while a destination is published
/// means the handler has been running for the whole window.
pub struct WorkerWatch {
    source: AtomicU32,
    destination: AtomicU32,
    version: AtomicU32,
    check_version: AtomicU32,
}

impl WorkerWatch {
    pub fn new() -> WorkerWatch {
        WorkerWatch {
            source: AtomicU32::new(0),
            destination: AtomicU32::new(0),
            version: AtomicU32::new(0),
            check_version: AtomicU32::new(0),
        }
    }

    /// Mark the start of a delivery.
    #[inline]
    pub fn trigger(&self, source: ServiceHandle, destination: ServiceHandle) {
        self.source.store(source.raw(), Ordering::Relaxed);
        self.destination.store(destination.raw(), Ordering::Relaxed);
        self.version.fetch_add(1, Ordering::Release);
    }

    /// Mark the delivery finished.
    #[inline]
    pub fn reset(&self) {
        self.source.store(0, Ordering::Relaxed);
        self.destination.store(0, Ordering::Relaxed);
        self.version.fetch_add(1, Ordering::Release);
    }

    /// One sweep step. Returns the (source, destination) of a delivery that
    /// has made no progress since the previous sweep.
    pub fn check(&self) -> Option<(ServiceHandle, ServiceHandle)> {
        let version = self.version.load(Ordering::Acquire);
        if version == self.check_version.load(Ordering::Relaxed) {
            let destination = self.destination.load(Ordering::Relaxed);
            if destination != 0 {
                return Some((
                    ServiceHandle::from_raw(self.source.load(Ordering::Relaxed)),
                    ServiceHandle::from_raw(destination),
                ));
            }
        } else {
            self.check_version.store(version, Ordering::Relaxed);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_worker_never_flags() {
        let watch = WorkerWatch::new();
        assert!(watch.check().is_none());
        assert!(watch.check().is_none());
    }

    #[test]
    fn test_progressing_worker_never_flags() {
        let watch = WorkerWatch::new();
        watch.trigger(ServiceHandle::from_raw(1), ServiceHandle::from_raw(2));
        assert!(watch.check().is_none());
        watch.reset();
        watch.trigger(ServiceHandle::from_raw(1), ServiceHandle::from_raw(2));
        assert!(watch.check().is_none());
    }

    #[test]
    fn test_stuck_delivery_flags_on_second_sweep() {
        let watch = WorkerWatch::new();
        watch.trigger(ServiceHandle::from_raw(7), ServiceHandle::from_raw(9));
        // First sweep records the version...
        assert!(watch.check().is_none());
        // ...second sweep sees no progress.
        let (source, destination) = watch.check().unwrap();
        assert_eq!(source.raw(), 7);
        assert_eq!(destination.raw(), 9);
    }

    #[test]
    fn test_reset_clears_flagging() {
        let watch = WorkerWatch::new();
        watch.trigger(ServiceHandle::from_raw(7), ServiceHandle::from_raw(9));
        assert!(watch.check().is_none());
        watch.reset();
        assert!(watch.check().is_none());
        assert!(watch.check().is_none());
    }
}
