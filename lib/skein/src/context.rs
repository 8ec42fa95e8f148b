use crate::handle::ServiceHandle;
use crate::mailbox::Mailbox;
use crate::service::Service;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use strand::logging::Logger;

/// Out-of-band flags a service can be poked with while its handler is
/// running. Signal 0 raises `trap` (the sandbox hook turns it into a script
/// error); the memory gauge backs signal 1 and STAT.
pub struct SignalFlags {
    pub trap: AtomicBool,
    pub mem: AtomicUsize,
}

/// Registry-owned record of a live service. The `slot` mutex doubles as the
/// dispatch token: whichever worker holds it is the only executor of this
/// service, which is the per-service mutual exclusion invariant.
pub struct ServiceContext {
    handle: ServiceHandle,
    module: String,
    pub mailbox: Mailbox,
    pub(crate) slot: Mutex<Option<Box<dyn Service>>>,
    name: Mutex<Option<String>>,

    session: AtomicI32,
    init_done: AtomicBool,
    exiting: AtomicBool,
    endless: AtomicBool,
    endless_warned: AtomicBool,
    trace: AtomicBool,

    message_count: AtomicU64,
    profile_ns: AtomicU64,

    pub signals: SignalFlags,
    pub log: Logger,
}

impl ServiceContext {
    pub fn new(handle: ServiceHandle, module: &str, log: Logger) -> ServiceContext {
        ServiceContext {
            handle,
            module: module.to_owned(),
            mailbox: Mailbox::new(),
            slot: Mutex::new(None),
            name: Mutex::new(None),
            session: AtomicI32::new(0),
            init_done: AtomicBool::new(false),
            exiting: AtomicBool::new(false),
            endless: AtomicBool::new(false),
            endless_warned: AtomicBool::new(false),
            trace: AtomicBool::new(false),
            message_count: AtomicU64::new(0),
            profile_ns: AtomicU64::new(0),
            signals: SignalFlags {
                trap: AtomicBool::new(false),
                mem: AtomicUsize::new(0),
            },
            log,
        }
    }

    #[inline]
    pub fn handle(&self) -> ServiceHandle {
        self.handle
    }

    #[inline]
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Allocate a fresh session id. Wraps from 2^31−1 back to 1, skipping
    /// the fire-and-forget zero.
    pub fn alloc_session(&self) -> i32 {
        loop {
            let session = self.session.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if session > 0 {
                return session;
            }
            self.session.store(0, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn mark_init_done(&self) {
        self.init_done.store(true, Ordering::Release);
    }

    #[inline]
    pub fn init_done(&self) -> bool {
        self.init_done.load(Ordering::Acquire)
    }

    /// Request destruction; honoured by the owning worker after the current
    /// message completes.
    #[inline]
    pub fn request_exit(&self) {
        self.exiting.store(true, Ordering::Release);
    }

    #[inline]
    pub fn exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }

    #[inline]
    pub fn mark_endless(&self) {
        self.endless.store(true, Ordering::Relaxed);
    }

    /// Read-and-clear, matching the STAT endless contract.
    #[inline]
    pub fn take_endless(&self) -> bool {
        self.endless.swap(false, Ordering::Relaxed)
    }

    /// One warning per stuck episode; cleared when the service progresses.
    pub fn should_warn_endless(&self) -> bool {
        !self.endless_warned.swap(true, Ordering::Relaxed)
    }

    #[inline]
    pub fn clear_endless_warned(&self) {
        self.endless_warned.store(false, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_trace(&self, enabled: bool) {
        self.trace.store(enabled, Ordering::Relaxed);
    }

    #[inline]
    pub fn trace(&self) -> bool {
        self.trace.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn count_message(&self) {
        self.message_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn add_profile_ns(&self, ns: u64) {
        self.profile_ns.fetch_add(ns, Ordering::Relaxed);
    }

    #[inline]
    pub fn profile_ns(&self) -> u64 {
        self.profile_ns.load(Ordering::Relaxed)
    }

    pub fn set_name(&self, name: &str) {
        *self.name.lock() = Some(name.to_owned());
    }

    pub fn registered_name(&self) -> Option<String> {
        self.name.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand::logging;

    fn context() -> ServiceContext {
        ServiceContext::new(ServiceHandle::from_raw(0x10), "test", logging::discard())
    }

    #[test]
    fn test_session_allocation_skips_zero() {
        let ctx = context();
        assert_eq!(ctx.alloc_session(), 1);
        assert_eq!(ctx.alloc_session(), 2);
    }

    #[test]
    fn test_session_wraps_to_one() {
        let ctx = context();
        ctx.session.store(i32::max_value() - 1, Ordering::Relaxed);
        assert_eq!(ctx.alloc_session(), i32::max_value());
        assert_eq!(ctx.alloc_session(), 1);
    }

    #[test]
    fn test_exit_flag() {
        let ctx = context();
        assert!(!ctx.exiting());
        ctx.request_exit();
        assert!(ctx.exiting());
    }

    #[test]
    fn test_endless_warn_once_per_episode() {
        let ctx = context();
        assert!(ctx.should_warn_endless());
        assert!(!ctx.should_warn_endless());
        ctx.clear_endless_warned();
        assert!(ctx.should_warn_endless());
    }
}
