//! Sleep queue: wakes threads that called `thread::sleep_*` once their
//! deadline tick has passed.
//!
//! Deliberately dumb — a linear scan of pending alarms on every timer tick,
//! same as the original pintos `timer_sleep`. The list stays tiny (at most
//! one entry per blocked thread) so there is no reason to index it.

use alloc::vec::Vec;
use spin::Mutex;

struct PendingAlarm {
    tid: u64,
    wake_tick: u64,
}

static PENDING: Mutex<Vec<PendingAlarm>> = Mutex::new(Vec::new());

pub fn init() {
    PENDING.lock().clear();
}

/// Register `tid` to be woken at `wake_tick` (in `logger::get_ticks()`
/// units). Does not block by itself — the caller still has to put the
/// thread to sleep.
pub fn register(tid: u64, wake_tick: u64) {
    let mut pending = PENDING.lock();
    // A thread can only have one outstanding alarm; sleeping again before
    // the first fires replaces it rather than stacking wakeups.
    pending.retain(|a| a.tid != tid);
    pending.push(PendingAlarm { tid, wake_tick });
}

/// Cancel `tid`'s pending alarm, if any. Used when a thread is woken early
/// by something other than the clock (e.g. a semaphore).
pub fn dismiss(tid: u64) {
    PENDING.lock().retain(|a| a.tid != tid);
}

/// Called from the timer interrupt. Wakes every thread whose deadline has
/// passed. Runs in interrupt context: must not block or allocate. `retain`
/// compacts the `Vec` in place, so waking a thread as its entry is dropped
/// from the scan needs no separate buffer to collect into first.
pub fn tick(now_tick: u64) {
    let mut pending = PENDING.lock();
    pending.retain(|a| {
        if a.wake_tick <= now_tick {
            crate::thread::wake(a.tid);
            false
        } else {
            true
        }
    });
}

/// Put the current thread to sleep for `ticks` timer ticks. A non-positive
/// duration returns immediately without yielding, matching pintos'
/// `timer_sleep(0)`. Enqueuing the alarm and blocking happen with
/// interrupts disabled, so a timer tick can't land between `register` and
/// the block and fire the wakeup before the thread is actually asleep.
pub fn sleep(ticks: u64) {
    if ticks == 0 {
        return;
    }
    let tid = crate::thread::current_tid();
    let wake_tick = crate::logger::get_ticks().saturating_add(ticks);
    crate::interrupts::without_interrupts(|| {
        register(tid, wake_tick);
        crate::thread::block_current_and_schedule();
    });
}
