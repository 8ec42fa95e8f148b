use crate::error::SocketError;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};

pub const MAX_SOCKET_P: usize = 16;
/// Compile-time cap on live sockets.
pub const MAX_SOCKET: usize = 1 << MAX_SOCKET_P;

/// Connection state, mirrored into the shared slot table so caller threads
/// can fail fast without talking to the poller.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum SocketState {
    Invalid = 0,
    Reserved = 1,
    /// Bound listener waiting for `start`.
    PendingListen = 2,
    Listen = 3,
    Connecting = 4,
    Connected = 5,
    /// Accepted stream waiting for `start`.
    PendingAccept = 6,
    Paused = 7,
    /// Graceful close in progress: reads discarded, writes draining.
    Closing = 8,
}

impl SocketState {
    fn from_u8(raw: u8) -> SocketState {
        match raw {
            1 => SocketState::Reserved,
            2 => SocketState::PendingListen,
            3 => SocketState::Listen,
            4 => SocketState::Connecting,
            5 => SocketState::Connected,
            6 => SocketState::PendingAccept,
            7 => SocketState::Paused,
            8 => SocketState::Closing,
            _ => SocketState::Invalid,
        }
    }

    /// States in which a send may still be buffered.
    pub fn writable(self) -> bool {
        match self {
            SocketState::Connecting
            | SocketState::Connected
            | SocketState::PendingAccept
            | SocketState::Paused => true,
            _ => false,
        }
    }
}

struct Slot {
    state: AtomicU8,
    id: AtomicI32,
}

/// Fixed table of socket slots shared between caller threads and the
/// poller. Ids are allocated from a rolling 31-bit counter; the slot index
/// is `id % MAX_SOCKET`, so a reused slot always carries a fresh id and a
/// stale id can never pass the match check.
pub struct SlotStates {
    slots: Vec<Slot>,
    alloc: AtomicI32,
}

impl SlotStates {
    pub fn new() -> SlotStates {
        SlotStates {
            slots: (0..MAX_SOCKET)
                .map(|_| Slot {
                    state: AtomicU8::new(SocketState::Invalid as u8),
                    id: AtomicI32::new(0),
                })
                .collect(),
            alloc: AtomicI32::new(0),
        }
    }

    #[inline]
    pub fn slot_of(id: i32) -> usize {
        id as usize % MAX_SOCKET
    }

    /// Claim a free slot and return its fresh id. Ids stay in
    /// `1..=0x7fffffff` and never repeat within a slot generation.
    pub fn reserve(&self) -> Result<i32, SocketError> {
        for _ in 0..MAX_SOCKET {
            let id = self.alloc.fetch_add(1, Ordering::Relaxed).wrapping_add(1) & 0x7fff_ffff;
            if id == 0 {
                continue;
            }
            let slot = &self.slots[Self::slot_of(id)];
            if slot
                .state
                .compare_exchange(
                    SocketState::Invalid as u8,
                    SocketState::Reserved as u8,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                slot.id.store(id, Ordering::Release);
                return Ok(id);
            }
        }
        Err(SocketError::SlotsExhausted)
    }

    /// Poller-side state transition.
    pub fn set(&self, id: i32, state: SocketState) {
        let slot = &self.slots[Self::slot_of(id)];
        if slot.id.load(Ordering::Acquire) == id {
            slot.state.store(state as u8, Ordering::Release);
        }
    }

    /// Free the slot for reuse. The id stays behind so late lookups miss.
    pub fn release(&self, id: i32) {
        let slot = &self.slots[Self::slot_of(id)];
        if slot.id.load(Ordering::Acquire) == id {
            slot.state.store(SocketState::Invalid as u8, Ordering::Release);
        }
    }

    /// State of `id`, or `Invalid` when the slot has moved on to another
    /// generation.
    pub fn get(&self, id: i32) -> SocketState {
        let slot = &self.slots[Self::slot_of(id)];
        if slot.id.load(Ordering::Acquire) != id {
            return SocketState::Invalid;
        }
        SocketState::from_u8(slot.state.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_yields_distinct_ids() {
        let states = SlotStates::new();
        let a = states.reserve().unwrap();
        let b = states.reserve().unwrap();
        assert_ne!(a, b);
        assert!(a > 0 && b > 0);
        assert_eq!(states.get(a), SocketState::Reserved);
    }

    #[test]
    fn test_release_invalidates_id() {
        let states = SlotStates::new();
        let id = states.reserve().unwrap();
        states.set(id, SocketState::Connected);
        assert_eq!(states.get(id), SocketState::Connected);
        states.release(id);
        assert_eq!(states.get(id), SocketState::Invalid);
    }

    #[test]
    fn test_slot_reuse_rejects_stale_id() {
        let states = SlotStates::new();
        let first = states.reserve().unwrap();
        states.release(first);

        // Walk the allocator all the way around to land on the same slot.
        let mut reused = None;
        for _ in 0..MAX_SOCKET {
            let id = states.reserve().unwrap();
            if SlotStates::slot_of(id) == SlotStates::slot_of(first) {
                reused = Some(id);
                break;
            }
            states.release(id);
        }

        let reused = reused.expect("allocator must wrap around to the slot");
        assert_ne!(reused, first, "reused slot must mint a different id");
        states.set(reused, SocketState::Connected);
        assert_eq!(states.get(first), SocketState::Invalid);
        assert_eq!(states.get(reused), SocketState::Connected);
    }

    #[test]
    fn test_writable_states() {
        assert!(SocketState::Connected.writable());
        assert!(SocketState::Paused.writable());
        assert!(!SocketState::Listen.writable());
        assert!(!SocketState::Invalid.writable());
        assert!(!SocketState::Closing.writable());
    }
}
