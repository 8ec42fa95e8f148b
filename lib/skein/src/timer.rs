use crate::handle::ServiceHandle;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

const NEAR_SHIFT: u32 = 8;
const NEAR: usize = 1 << NEAR_SHIFT;
const NEAR_MASK: u32 = NEAR as u32 - 1;
const LEVEL_SHIFT: u32 = 6;
const LEVEL: usize = 1 << LEVEL_SHIFT;
const LEVEL_MASK: u32 = LEVEL as u32 - 1;
const LEVELS: usize = 4;

/// A scheduled timeout. No cancellation: obsolete expiries are discarded by
/// the receiver checking its pending-session map.
#[derive(Debug, Copy, Clone)]
pub struct TimerNode {
    expire: u32,
    pub owner: ServiceHandle,
    pub session: i32,
}

struct Wheel {
    /// Wheel position. Wraps at 2^32 ticks; the far wheels cover the whole
    /// range so wrap is just another cascade.
    time: u32,
    near: Vec<Vec<TimerNode>>,
    far: Vec<Vec<Vec<TimerNode>>>,
}

impl Wheel {
    fn new() -> Wheel {
        Wheel {
            time: 0,
            near: (0..NEAR).map(|_| Vec::new()).collect(),
            far: (0..LEVELS)
                .map(|_| (0..LEVEL).map(|_| Vec::new()).collect())
                .collect(),
        }
    }

    fn add(&mut self, node: TimerNode) {
        let time = node.expire;
        let current = self.time;

        if (time | NEAR_MASK) == (current | NEAR_MASK) {
            self.near[(time & NEAR_MASK) as usize].push(node);
            return;
        }

        let mut mask = (NEAR as u32) << LEVEL_SHIFT;
        let mut level = 0;
        while level < LEVELS - 1 {
            if (time | (mask - 1)) == (current | (mask - 1)) {
                break;
            }
            mask <<= LEVEL_SHIFT;
            level += 1;
        }

        let slot = (time >> (NEAR_SHIFT + level as u32 * LEVEL_SHIFT)) & LEVEL_MASK;
        self.far[level][slot as usize].push(node);
    }

    /// Move one far-wheel slot back through `add`, re-sorting its nodes
    /// into finer wheels.
    fn cascade(&mut self, level: usize, slot: usize) {
        let nodes = std::mem::replace(&mut self.far[level][slot], Vec::new());
        for node in nodes {
            self.add(node);
        }
    }

    fn shift(&mut self) {
        self.time = self.time.wrapping_add(1);
        let ct = self.time;

        if ct == 0 {
            self.cascade(LEVELS - 1, 0);
            return;
        }

        let mut mask = NEAR as u32;
        let mut time = ct >> NEAR_SHIFT;
        let mut level = 0;

        while (ct & (mask - 1)) == 0 {
            let slot = (time & LEVEL_MASK) as usize;
            if slot != 0 {
                self.cascade(level, slot);
                break;
            }
            mask <<= LEVEL_SHIFT;
            time >>= LEVEL_SHIFT;
            level += 1;
        }
    }

    fn expire_current(&mut self, out: &mut Vec<TimerNode>) {
        let slot = (self.time & NEAR_MASK) as usize;
        if !self.near[slot].is_empty() {
            out.append(&mut self.near[slot]);
        }
    }
}

/// Hierarchical timer wheel: one 256-slot near wheel plus four 64-slot far
/// wheels covering the full 32-bit tick horizon. Insertions are O(1) under
/// a wheel-wide lock; a dedicated thread drives `update`.
pub struct Timer {
    wheel: Mutex<Wheel>,
    ticks: AtomicU64,
}

impl Timer {
    pub fn new() -> Timer {
        Timer {
            wheel: Mutex::new(Wheel::new()),
            ticks: AtomicU64::new(0),
        }
    }

    /// Total ticks executed. 64-bit and monotonic regardless of wheel wrap.
    #[inline]
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Schedule a timeout `ticks` from now. Zero-tick timeouts are the
    /// caller's business (delivered inline, never enqueued here).
    pub fn schedule(&self, ticks: u32, owner: ServiceHandle, session: i32) {
        debug_assert!(ticks > 0);
        let mut wheel = self.wheel.lock();
        let expire = wheel.time.wrapping_add(ticks);
        wheel.add(TimerNode {
            expire,
            owner,
            session,
        });
    }

    /// Advance the wheel up to `now` ticks total, collecting every expired
    /// node. Expiries are emitted outside the wheel lock by the caller.
    pub fn update(&self, now: u64, expired: &mut Vec<TimerNode>) {
        while self.ticks.load(Ordering::Relaxed) < now {
            {
                let mut wheel = self.wheel.lock();
                wheel.expire_current(expired);
                wheel.shift();
                wheel.expire_current(expired);
            }
            self.ticks.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(n: u32) -> ServiceHandle {
        ServiceHandle::from_raw(n)
    }

    /// Drive the wheel forward one tick at a time, recording the tick at
    /// which each session fired.
    fn run(timer: &Timer, ticks: u64) -> Vec<(u64, i32)> {
        let mut fired = Vec::new();
        for _ in 0..ticks {
            let mut expired = Vec::new();
            timer.update(timer.ticks() + 1, &mut expired);
            let now = timer.ticks();
            for node in expired {
                fired.push((now, node.session));
            }
        }
        fired
    }

    #[test]
    fn test_near_expiry() {
        let timer = Timer::new();
        timer.schedule(1, owner(1), 100);
        timer.schedule(5, owner(1), 101);
        let fired = run(&timer, 10);
        assert_eq!(fired, vec![(1, 100), (5, 101)]);
    }

    #[test]
    fn test_same_tick_preserves_insert_order() {
        let timer = Timer::new();
        timer.schedule(3, owner(1), 1);
        timer.schedule(3, owner(1), 2);
        timer.schedule(3, owner(1), 3);
        let fired = run(&timer, 4);
        assert_eq!(fired, vec![(3, 1), (3, 2), (3, 3)]);
    }

    #[test]
    fn test_cascade_across_near_boundary() {
        let timer = Timer::new();
        timer.schedule(255, owner(1), 1);
        timer.schedule(256, owner(1), 2);
        timer.schedule(257, owner(1), 3);
        let fired = run(&timer, 300);
        assert_eq!(fired, vec![(255, 1), (256, 2), (257, 3)]);
    }

    #[test]
    fn test_cascade_across_far_levels() {
        let timer = Timer::new();
        // 2^14 = 16384 lands on the second far wheel.
        timer.schedule(16384, owner(1), 7);
        timer.schedule(16385, owner(1), 8);
        let fired = run(&timer, 16400);
        assert_eq!(fired, vec![(16384, 7), (16385, 8)]);
    }

    #[test]
    fn test_no_early_fire() {
        let timer = Timer::new();
        timer.schedule(100, owner(1), 1);
        let fired = run(&timer, 99);
        assert!(fired.is_empty());
        let fired = run(&timer, 1);
        assert_eq!(fired, vec![(100, 1)]);
    }

    #[test]
    fn test_schedule_while_running() {
        let timer = Timer::new();
        timer.schedule(10, owner(1), 1);
        let mut fired = run(&timer, 10);
        timer.schedule(10, owner(1), 2);
        fired.extend(run(&timer, 10));
        assert_eq!(fired, vec![(10, 1), (20, 2)]);
    }

    #[test]
    fn test_update_is_batched() {
        let timer = Timer::new();
        timer.schedule(2, owner(1), 1);
        timer.schedule(4, owner(1), 2);
        let mut expired = Vec::new();
        timer.update(5, &mut expired);
        let sessions: Vec<_> = expired.iter().map(|n| n.session).collect();
        assert_eq!(sessions, vec![1, 2]);
        assert_eq!(timer.ticks(), 5);
    }
}
