use crate::monitor::WorkerWatch;
use crate::runtime::Runtime;
use std::sync::Arc;
use std::time::Duration;

const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Messages a worker may deliver to one service before putting it back.
/// Mirrors the original weight table: the first few workers take a single
/// message per turn (lowest latency), later ones drain progressively larger
/// shares of the backlog (highest throughput).
pub fn weight_for(worker_id: usize) -> i32 {
    match worker_id {
        0..=3 => -1,
        4..=7 => 0,
        8..=15 => 1,
        16..=23 => 2,
        _ => 3,
    }
}

fn quota(weight: i32, backlog: usize) -> usize {
    let n = match weight {
        w if w < 0 => 1,
        0 => backlog,
        w => backlog >> w as usize,
    };
    n.max(1)
}

/// One scheduling turn: pull a runnable service, drain up to the weighted
/// quota, put it back if it still has work. Returns false when the queue
/// stayed empty for the whole wait.
pub(crate) fn run_turn(rt: &Runtime, watch: &WorkerWatch, weight: i32, wait: Duration) -> bool {
    let handle = match rt.queue().pop(wait) {
        Some(handle) => handle,
        None => return false,
    };

    // Re-resolve: the record may have been destroyed while queued.
    let ctx = match rt.registry().resolve(handle) {
        Some(ctx) => ctx,
        None => return true,
    };

    // The slot mutex is the dispatch token. Contention here means another
    // worker raced us to the same service; hand the turn back.
    let mut guard = match ctx.slot.try_lock() {
        Some(guard) => guard,
        None => {
            rt.queue().push(handle);
            return true;
        }
    };

    if guard.is_none() {
        // Destroyed between resolve and lock.
        return true;
    }

    let mut destroyed = false;
    for _ in 0..quota(weight, ctx.mailbox.len()) {
        let message = match ctx.mailbox.pop() {
            Some(message) => message,
            None => break,
        };

        watch.trigger(message.source, handle);
        let exit = rt.deliver(&ctx, guard.as_mut().expect("token held"), message);
        watch.reset();
        ctx.clear_endless_warned();

        if exit || ctx.exiting() {
            rt.destroy(&ctx, &mut guard);
            destroyed = true;
            break;
        }
    }

    if !destroyed {
        if let Some(length) = ctx.mailbox.take_overload() {
            rt.report_overload(&ctx, length);
        }
        drop(guard);
        if ctx.mailbox.finish_drain() {
            rt.queue().push(handle);
        }
    }

    true
}

pub(crate) fn worker_loop(rt: Runtime, worker_id: usize, watch: Arc<WorkerWatch>) {
    let weight = weight_for(worker_id);
    while !rt.is_shutdown() {
        run_turn(&rt, &watch, weight, IDLE_WAIT);
    }
}
