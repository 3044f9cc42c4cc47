//! The event-loop driver: wraps a libuv loop and exposes the `poll` /
//! `process_events` / `process_events_until` primitives described in spec
//! §4.3, plus the `got_int` flag Ctrl-C handling hangs off of (§4.3, §9).
//!
//! Ported from `nvim/event/defs.h`'s `LOOP_PROCESS_EVENTS`/
//! `LOOP_PROCESS_EVENTS_UNTIL` macros and from `Icemic-libuv-rs`'s
//! `Loop` (`loop.rs`) for the raw `uv_loop_t` lifecycle.

use crate::error::{uvret, Result};
use crate::queue::MultiQueue;
use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use uv::{
    uv_default_loop, uv_loop_alive, uv_loop_close, uv_loop_configure, uv_loop_delete, uv_loop_init,
    uv_loop_new, uv_loop_option_UV_LOOP_BLOCK_SIGNAL, uv_loop_t, uv_run, uv_run_mode_UV_RUN_NOWAIT,
    uv_run_mode_UV_RUN_ONCE, uv_stop, uv_timer_init, uv_timer_start, uv_timer_stop, uv_timer_t,
};

/// Configuration for a new [`EventLoop`]. The crate has no other
/// configuration surface and no persisted state (spec §6).
#[derive(Debug, Clone, Default)]
pub struct EventLoopConfig {
    /// Forwarded to `uv_loop_configure(UV_LOOP_BLOCK_SIGNAL, signum)` —
    /// see `Loop::block_signal` in the teacher crate. Used, for example, to
    /// suppress SIGPROF wakeups under a sampling profiler.
    pub block_signal: Option<i32>,
}

/// Outcome of a bounded wait. Timeouts and user interrupts are not errors
/// (spec §7) — they're distinguishable return values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// `cond` became true before the timeout elapsed.
    ConditionMet,
    /// The timeout elapsed first; `cond` never became true.
    TimedOut,
}

/// Owns the libuv reactor. Exposes `poll`, `process_events`, and
/// `process_events_until`, the only functions in this crate allowed to
/// block (spec §5).
pub struct EventLoop {
    handle: *mut uv_loop_t,
    should_drop: bool,
    interrupt_flag: Rc<Cell<bool>>,
}

impl EventLoop {
    pub fn new(config: EventLoopConfig) -> Result<EventLoop> {
        let handle = unsafe { uv_loop_new() };
        if handle.is_null() {
            return Err(crate::error::Error::ResourceExhausted("uv_loop_new"));
        }
        let ret = unsafe { uv_loop_init(handle) };
        uvret(ret)?;

        let mut out = EventLoop {
            handle,
            should_drop: true,
            interrupt_flag: Rc::new(Cell::new(false)),
        };
        if let Some(signum) = config.block_signal {
            out.block_signal(signum)?;
        }
        Ok(out)
    }

    /// Wraps the process-wide default loop instead of allocating a new one
    /// (matches `Loop::default()` in the teacher crate). Not closed on
    /// `Drop`.
    pub fn default_loop() -> Result<EventLoop> {
        let handle = unsafe { uv_default_loop() };
        if handle.is_null() {
            return Err(crate::error::Error::ResourceExhausted("uv_default_loop"));
        }
        Ok(EventLoop {
            handle,
            should_drop: false,
            interrupt_flag: Rc::new(Cell::new(false)),
        })
    }

    fn block_signal(&mut self, signum: i32) -> Result<()> {
        uvret(unsafe { uv_loop_configure(self.handle, uv_loop_option_UV_LOOP_BLOCK_SIGNAL, signum) })
    }

    pub(crate) fn raw(&self) -> *mut uv_loop_t {
        self.handle
    }

    /// A cell read by `cond` closures and written only by a
    /// [`crate::watcher::signal::SignalWatcher`] watching SIGINT — the
    /// Ctrl-C flag from spec §9 ("move to an atomic boolean on the loop
    /// object, read-only in handlers and `cond`, written only by the signal
    /// watcher").
    pub fn interrupt_flag(&self) -> Rc<Cell<bool>> {
        self.interrupt_flag.clone()
    }

    pub fn is_alive(&self) -> bool {
        unsafe { uv_loop_alive(self.handle) != 0 }
    }

    /// Stop the loop as soon as possible — not sooner than the current
    /// iteration.
    pub fn stop(&mut self) {
        unsafe { uv_stop(self.handle) };
    }

    /// Single poll of the reactor. `timeout_ms < 0` blocks indefinitely
    /// until any source fires; `== 0` is a non-blocking probe; `> 0` blocks
    /// up to that many milliseconds.
    pub fn poll(&mut self, timeout_ms: i64) -> Result<()> {
        if timeout_ms == 0 {
            uvret(unsafe { uv_run(self.handle, uv_run_mode_UV_RUN_NOWAIT) })
        } else if timeout_ms < 0 {
            uvret(unsafe { uv_run(self.handle, uv_run_mode_UV_RUN_ONCE) })
        } else {
            // libuv has no direct bounded-block primitive; arm a scratch
            // one-shot timer to bound UV_RUN_ONCE's blocking, same trick
            // `stream_set_blocking` in the original uses a private loop for.
            let layout = std::alloc::Layout::new::<uv_timer_t>();
            let timer = unsafe { std::alloc::alloc(layout) as *mut uv_timer_t };
            if timer.is_null() {
                return Err(crate::error::Error::ResourceExhausted("uv_timer_t scratch alloc"));
            }
            unsafe { uv_timer_init(self.handle, timer) };
            extern "C" fn noop_cb(_handle: *mut uv_timer_t) {}
            unsafe { uv_timer_start(timer, Some(noop_cb), timeout_ms as u64, 0) };

            let result = uvret(unsafe { uv_run(self.handle, uv_run_mode_UV_RUN_ONCE) });

            unsafe {
                uv_timer_stop(timer);
                std::alloc::dealloc(timer as _, layout);
            }
            result
        }
    }

    /// If `q` is non-empty, drain it synchronously and return without
    /// polling. Otherwise poll once. This ordering is what prevents a
    /// handler-pushed backlog from starving behind I/O (spec §4.3).
    pub fn process_events(&mut self, q: &MultiQueue, timeout_ms: i64) {
        if !q.empty() {
            q.process_events();
        } else if let Err(err) = self.poll(timeout_ms) {
            tracing::warn!(target: "uv_multiqueue::reactor", %err, "poll failed");
        }
    }

    /// The hot loop: pumps `q` until `cond` is true or `timeout` elapses.
    /// The timeout is total across all iterations, not per-iteration.
    pub fn process_events_until(
        &mut self,
        q: &MultiQueue,
        timeout: Option<Duration>,
        mut cond: impl FnMut() -> bool,
    ) -> PollOutcome {
        let start = Instant::now();
        let mut remaining_ms: i64 = timeout.map(|d| d.as_millis() as i64).unwrap_or(-1);

        loop {
            if cond() {
                return PollOutcome::ConditionMet;
            }
            self.process_events(q, remaining_ms);
            if remaining_ms == 0 {
                return if cond() { PollOutcome::ConditionMet } else { PollOutcome::TimedOut };
            }
            if remaining_ms > 0 {
                let elapsed_ms = start.elapsed().as_millis() as i64;
                let total_ms = timeout.map(|d| d.as_millis() as i64).unwrap_or(i64::MAX);
                remaining_ms = total_ms - elapsed_ms;
                if remaining_ms <= 0 {
                    return if cond() { PollOutcome::ConditionMet } else { PollOutcome::TimedOut };
                }
            }
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if !self.handle.is_null() && self.should_drop {
            let _ = unsafe { uv_loop_close(self.handle) };
            unsafe { uv_loop_delete(self.handle) };
        }
        self.handle = std::ptr::null_mut();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MultiQueue;
    use std::time::Duration;

    #[test]
    fn timeout_expires_without_invoking_handlers() {
        let mut loop_ = EventLoop::new(EventLoopConfig::default()).expect("loop init");
        let q = MultiQueue::new_parent(None::<fn(&MultiQueue)>);
        let start = Instant::now();

        let outcome = loop_.process_events_until(&q, Some(Duration::from_millis(50)), || false);

        assert_eq!(outcome, PollOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn condition_met_stops_before_timeout() {
        let mut loop_ = EventLoop::new(EventLoopConfig::default()).expect("loop init");
        let q = MultiQueue::new_parent(None::<fn(&MultiQueue)>);
        q.put_event(crate::event::Event::new(|_| {}, vec![]));

        let outcome = loop_.process_events_until(&q, Some(Duration::from_secs(5)), || q.empty());
        assert_eq!(outcome, PollOutcome::ConditionMet);
    }
}
